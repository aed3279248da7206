pub mod priority;
pub mod queue;

pub use priority::urgency_band;
pub use queue::{LeaseInfo, QueueItem, WorkQueue};
