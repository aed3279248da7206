//! Retry & dead-letter management.
//!
//! Wraps worker failures: transient errors back off exponentially (with
//! jitter) and requeue; permanent errors, and transient ones past the
//! attempt cap, dead-letter the attempt, fail the execution, and emit an
//! alert event. Nothing is ever silently dropped.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{error, warn};

use waypoint_core::config::RetryConfig;
use waypoint_core::event_bus::{make_event, EngineEventSink, EngineEventType};
use waypoint_core::EngineError;
use waypoint_scheduler::{QueueItem, WorkQueue};

use crate::store::{ExecutionStore, StepAttemptStore};
use crate::types::ExecutionStatus;

/// What the manager decided to do with a failed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

pub struct RetryManager {
    config: RetryConfig,
    queue: Arc<WorkQueue>,
    executions: Arc<ExecutionStore>,
    attempts: Arc<StepAttemptStore>,
    event_sink: Arc<dyn EngineEventSink>,
}

impl RetryManager {
    pub fn new(
        config: RetryConfig,
        queue: Arc<WorkQueue>,
        executions: Arc<ExecutionStore>,
        attempts: Arc<StepAttemptStore>,
        event_sink: Arc<dyn EngineEventSink>,
    ) -> Self {
        Self {
            config,
            queue,
            executions,
            attempts,
            event_sink,
        }
    }

    /// Handle a failed step: release the lease, then either requeue with
    /// backoff or quarantine.
    pub fn on_failure(&self, item: &QueueItem, error: &EngineError) -> RetryDecision {
        self.queue.nack(item, error.kind());

        let attempt_number = self
            .attempts
            .get(item.attempt_id)
            .map(|a| a.attempt_number)
            .unwrap_or(1);

        let decision = self.decide(error, attempt_number);
        match &decision {
            RetryDecision::Retry { delay } => {
                let not_before = Utc::now() + *delay;
                warn!(
                    execution_id = %item.execution_id,
                    node_id = %item.node_id,
                    attempt = attempt_number,
                    delay_ms = delay.num_milliseconds(),
                    error = %error,
                    "Step failed, retrying with backoff"
                );
                self.attempts.record_failure(item.attempt_id, &error.to_string());
                self.attempts.requeue_for_retry(item.attempt_id, not_before);
                self.queue.enqueue(QueueItem {
                    not_before,
                    enqueued_at: Utc::now(),
                    ..item.clone()
                });
                metrics::counter!("retry.scheduled", "error" => error.kind()).increment(1);
            }
            RetryDecision::DeadLetter => {
                self.dead_letter(item, error, attempt_number);
            }
        }
        decision
    }

    /// Pure decision: retryable errors get backoff until the cap.
    pub fn decide(&self, error: &EngineError, attempt_number: u32) -> RetryDecision {
        if !error.is_retryable() || attempt_number >= self.config.max_attempts {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry {
            delay: self.backoff_delay(attempt_number),
        }
    }

    /// Exponential backoff with full jitter, capped at `max_delay_ms`.
    fn backoff_delay(&self, attempt_number: u32) -> Duration {
        let exp = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt_number.saturating_sub(1) as i32);
        let capped = exp.min(self.config.max_delay_ms as f64);
        let jittered = rand::thread_rng().gen_range(0.5..=1.0) * capped;
        Duration::milliseconds(jittered as i64)
    }

    fn dead_letter(&self, item: &QueueItem, error: &EngineError, attempt_number: u32) {
        error!(
            execution_id = %item.execution_id,
            node_id = %item.node_id,
            attempts = attempt_number,
            error = %error,
            "Step dead-lettered"
        );
        self.attempts
            .mark_dead_lettered(item.attempt_id, &error.to_string());
        metrics::counter!("retry.dead_lettered", "error" => error.kind()).increment(1);

        let reason = error.to_string();
        let failed = self.executions.update_with_retry(item.execution_id, |record| {
            record.status = ExecutionStatus::Failed;
            record.last_error = Some(reason.clone());
        });

        let (journey_id, subject_id) = match &failed {
            Ok(record) => (Some(record.journey_id), Some(record.subject_id.clone())),
            // Already terminal (e.g. cancelled mid-flight): keep the alert anyway.
            Err(_) => (None, None),
        };

        self.event_sink.emit(make_event(
            EngineEventType::StepDeadLettered,
            Some(item.execution_id),
            journey_id,
            subject_id.clone(),
            Some(reason.clone()),
        ));
        if failed.is_ok() {
            self.event_sink.emit(make_event(
                EngineEventType::ExecutionFailed,
                Some(item.execution_id),
                journey_id,
                subject_id,
                Some(reason),
            ));
        }
    }
}
