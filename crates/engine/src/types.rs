use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime status of one execution of a journey for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Active,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are immutable; no further step attempts are created.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// A live record blocks a second enrollment of the same subject into the
    /// same journey.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// The authoritative record of one (journey, subject) execution.
///
/// `version` is an optimistic write counter: every update must carry the
/// version it read, and a mismatch is a `ConcurrencyConflict`. Only workers
/// mutate these, apart from external cancels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub journey_version: u32,
    pub subject_id: String,
    /// Subject-specific reference date for relative offsets (e.g. the
    /// event date a "7 days before" step counts down to).
    pub anchor_date: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub current_node_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

/// Audit record of one node's execution within an execution, retained after
/// terminal state. Retries bump `attempt_number` on the same record, so the
/// idempotency key stays stable per (execution, node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    /// Set when `scheduled_for` was derived from the anchor date; used to
    /// recompute the schedule when the anchor moves.
    pub anchor_offset_days: Option<i64>,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub last_error: Option<String>,
    pub idempotency_key: String,
}

impl StepAttempt {
    /// The idempotency key is stable per (execution, node) so re-delivery
    /// never double-sends.
    pub fn make_idempotency_key(execution_id: Uuid, node_id: Uuid) -> String {
        format!("{}:{}", execution_id, node_id)
    }
}

/// Aggregate statistics for one journey's executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub journey_id: Option<Uuid>,
    pub total: u64,
    pub pending: u64,
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_completion_time_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::Pending.is_live());
        assert!(ExecutionStatus::Waiting.is_live());
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let execution = Uuid::new_v4();
        let node = Uuid::new_v4();
        assert_eq!(
            StepAttempt::make_idempotency_key(execution, node),
            StepAttempt::make_idempotency_key(execution, node)
        );
    }
}
