//! Execution and step-attempt stores.
//!
//! `ExecutionStore` is the single-writer contract for execution rows:
//! updates carry the version they read, and a mismatch fails with
//! `ConcurrencyConflict`, which detects lost updates from a recovered
//! double lease. Terminal records reject every further write.

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use waypoint_core::{EngineError, EngineResult};

use crate::types::{
    AttemptStatus, ExecutionRecord, ExecutionStats, ExecutionStatus, StepAttempt,
};

/// In-memory execution record store with optimistic versioning.
#[derive(Default)]
pub struct ExecutionStore {
    records: DashMap<Uuid, ExecutionRecord>,
    /// (journey_id, subject_id) -> execution id, for the live-uniqueness check.
    live_index: DashMap<(Uuid, String), Uuid>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new pending execution. Fails if a live execution already
    /// exists for this (journey, subject); re-entry needs explicit new
    /// enrollment after the old record reaches a terminal state.
    pub fn create(
        &self,
        journey_id: Uuid,
        journey_version: u32,
        subject_id: impl Into<String>,
        anchor_date: Option<chrono::DateTime<Utc>>,
    ) -> EngineResult<ExecutionRecord> {
        let subject_id = subject_id.into();
        let key = (journey_id, subject_id.clone());

        if let Some(existing) = self.live_index.get(&key) {
            return Err(EngineError::InvalidTransition(format!(
                "live execution {} already exists for journey {} subject {}",
                *existing, journey_id, subject_id
            )));
        }

        let now = Utc::now();
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            journey_id,
            journey_version,
            subject_id: subject_id.clone(),
            anchor_date,
            status: ExecutionStatus::Pending,
            current_node_id: None,
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        info!(
            execution_id = %record.id,
            journey_id = %journey_id,
            subject_id = %subject_id,
            "Created execution record"
        );
        self.live_index.insert(key, record.id);
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn get(&self, id: Uuid) -> Option<ExecutionRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// The live execution for this (journey, subject), if any.
    pub fn get_live(&self, journey_id: Uuid, subject_id: &str) -> Option<ExecutionRecord> {
        self.live_index
            .get(&(journey_id, subject_id.to_string()))
            .and_then(|id| self.get(*id))
    }

    pub fn list_by_subject(&self, subject_id: &str) -> Vec<ExecutionRecord> {
        self.records
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .map(|r| r.clone())
            .collect()
    }

    pub fn list_by_journey(&self, journey_id: Uuid) -> Vec<ExecutionRecord> {
        self.records
            .iter()
            .filter(|r| r.journey_id == journey_id)
            .map(|r| r.clone())
            .collect()
    }

    /// Executions that carry an anchor date and are not terminal, for the
    /// date-offset sweep.
    pub fn list_anchored_live(&self) -> Vec<ExecutionRecord> {
        self.records
            .iter()
            .filter(|r| r.anchor_date.is_some() && r.status.is_live())
            .map(|r| r.clone())
            .collect()
    }

    /// Optimistic update: `record.version` must match the stored version.
    /// On success the stored version is bumped and the updated record
    /// returned. Terminal records are immutable.
    pub fn update(&self, record: ExecutionRecord) -> EngineResult<ExecutionRecord> {
        let mut entry = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", record.id)))?;

        if entry.status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "execution {} is terminal ({:?})",
                record.id, entry.status
            )));
        }
        if entry.version != record.version {
            return Err(EngineError::ConcurrencyConflict(format!(
                "execution {} version {} (stored {})",
                record.id, record.version, entry.version
            )));
        }

        let mut updated = record;
        updated.version += 1;
        updated.updated_at = Utc::now();
        *entry = updated.clone();
        drop(entry);

        if updated.status.is_terminal() {
            self.live_index
                .remove(&(updated.journey_id, updated.subject_id.clone()));
        }
        Ok(updated)
    }

    /// Re-read / re-apply loop around `update`, capped at 3 attempts, for
    /// writers racing a recovered lease.
    pub fn update_with_retry<F>(&self, id: Uuid, mut apply: F) -> EngineResult<ExecutionRecord>
    where
        F: FnMut(&mut ExecutionRecord),
    {
        let mut last_err = None;
        for _ in 0..3 {
            let mut record = self
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))?;
            apply(&mut record);
            match self.update(record) {
                Ok(updated) => return Ok(updated),
                Err(err @ EngineError::ConcurrencyConflict(_)) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            EngineError::ConcurrencyConflict(format!("execution {}", id))
        }))
    }

    /// External cancel. Cancelled executions keep their queued items in the
    /// scheduler; workers discard them at dequeue time.
    pub fn cancel(&self, id: Uuid) -> EngineResult<ExecutionRecord> {
        self.update_with_retry(id, |record| {
            record.status = ExecutionStatus::Cancelled;
        })
    }

    /// Aggregate statistics for one journey.
    pub fn stats(&self, journey_id: Uuid) -> ExecutionStats {
        let mut stats = ExecutionStats {
            journey_id: Some(journey_id),
            ..ExecutionStats::default()
        };
        let mut completion_secs = 0.0f64;

        for entry in self.records.iter() {
            let record = entry.value();
            if record.journey_id != journey_id {
                continue;
            }
            stats.total += 1;
            match record.status {
                ExecutionStatus::Pending => stats.pending += 1,
                ExecutionStatus::Active => stats.active += 1,
                ExecutionStatus::Waiting => stats.waiting += 1,
                ExecutionStatus::Completed => {
                    stats.completed += 1;
                    completion_secs += record
                        .updated_at
                        .signed_duration_since(record.created_at)
                        .num_seconds() as f64;
                }
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
            }
        }

        if stats.completed > 0 {
            stats.avg_completion_time_secs = completion_secs / stats.completed as f64;
        }
        stats
    }
}

/// In-memory step attempt store. One attempt record per (execution, node);
/// retries bump `attempt_number` in place.
#[derive(Default)]
pub struct StepAttemptStore {
    by_id: DashMap<Uuid, StepAttempt>,
    by_node: DashMap<(Uuid, Uuid), Uuid>,
}

impl StepAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the attempt for a node becoming due, or return the existing
    /// one (re-delivery must not mint a fresh idempotency key).
    pub fn create_or_get(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        scheduled_for: chrono::DateTime<Utc>,
        anchor_offset_days: Option<i64>,
    ) -> StepAttempt {
        if let Some(id) = self.by_node.get(&(execution_id, node_id)) {
            if let Some(existing) = self.by_id.get(&id) {
                return existing.clone();
            }
        }

        let attempt = StepAttempt {
            id: Uuid::new_v4(),
            execution_id,
            node_id,
            scheduled_for,
            anchor_offset_days,
            attempt_number: 1,
            status: AttemptStatus::Queued,
            last_error: None,
            idempotency_key: StepAttempt::make_idempotency_key(execution_id, node_id),
        };
        self.by_node.insert((execution_id, node_id), attempt.id);
        self.by_id.insert(attempt.id, attempt.clone());
        attempt
    }

    pub fn get(&self, id: Uuid) -> Option<StepAttempt> {
        self.by_id.get(&id).map(|a| a.clone())
    }

    pub fn get_for_node(&self, execution_id: Uuid, node_id: Uuid) -> Option<StepAttempt> {
        self.by_node
            .get(&(execution_id, node_id))
            .and_then(|id| self.get(*id))
    }

    pub fn list_for_execution(&self, execution_id: Uuid) -> Vec<StepAttempt> {
        self.by_id
            .iter()
            .filter(|a| a.execution_id == execution_id)
            .map(|a| a.clone())
            .collect()
    }

    /// Queued attempts whose schedule was derived from the anchor date.
    /// These are what a re-anchor has to move.
    pub fn queued_anchor_relative(&self, execution_id: Uuid) -> Vec<StepAttempt> {
        self.list_for_execution(execution_id)
            .into_iter()
            .filter(|a| a.status == AttemptStatus::Queued && a.anchor_offset_days.is_some())
            .collect()
    }

    pub fn set_status(&self, id: Uuid, status: AttemptStatus) {
        if let Some(mut attempt) = self.by_id.get_mut(&id) {
            attempt.status = status;
        }
    }

    pub fn record_failure(&self, id: Uuid, error: &str) {
        if let Some(mut attempt) = self.by_id.get_mut(&id) {
            attempt.status = AttemptStatus::Failed;
            attempt.last_error = Some(error.to_string());
        }
    }

    /// Re-queue a failed attempt for another try.
    pub fn requeue_for_retry(&self, id: Uuid, scheduled_for: chrono::DateTime<Utc>) {
        if let Some(mut attempt) = self.by_id.get_mut(&id) {
            attempt.attempt_number += 1;
            attempt.scheduled_for = scheduled_for;
            attempt.status = AttemptStatus::Queued;
        }
    }

    pub fn mark_dead_lettered(&self, id: Uuid, error: &str) {
        if let Some(mut attempt) = self.by_id.get_mut(&id) {
            attempt.status = AttemptStatus::DeadLettered;
            attempt.last_error = Some(error.to_string());
        }
    }

    /// Update `scheduled_for` after an anchor move.
    pub fn reschedule(&self, id: Uuid, scheduled_for: chrono::DateTime<Utc>) {
        if let Some(mut attempt) = self.by_id.get_mut(&id) {
            attempt.scheduled_for = scheduled_for;
        }
    }
}
