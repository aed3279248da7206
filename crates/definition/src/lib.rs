pub mod store;
pub mod types;
pub mod validator;

pub use store::DefinitionStore;
pub use types::{
    BranchArm, BranchConfig, DefinitionStatus, Edge, ExternalActionConfig, FormConfig,
    JourneyDefinition, JourneyGraph, JourneyNode, MessageChannel, MessageConfig, NodeKind,
    Predicate, TriggerSpec, WaitSpec,
};
pub use validator::{validate, ValidationIssue};
