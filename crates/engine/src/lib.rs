pub mod pool;
pub mod retry;
pub mod store;
pub mod types;
pub mod worker;

pub use pool::WorkerPool;
pub use retry::{RetryDecision, RetryManager};
pub use store::{ExecutionStore, StepAttemptStore};
pub use types::{AttemptStatus, ExecutionRecord, ExecutionStats, ExecutionStatus, StepAttempt};
pub use worker::{StepOutcome, StepWorker};
