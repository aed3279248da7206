pub mod evaluator;
pub mod sweep;

pub use evaluator::{EventReport, TriggerEvaluator};
pub use sweep::DateOffsetSweeper;
