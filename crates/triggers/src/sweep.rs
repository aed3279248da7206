//! Date-offset sweep — starts anchored executions when their trigger
//! offset comes due.
//!
//! Date-offset triggers act on already-enrolled executions: a pending
//! record with an anchor date whose journey carries an `anchor_offset`
//! trigger starts once `anchor + offset` has passed. The sweep runs
//! periodically and is idempotent; the pending status and the queue's
//! (execution, node) keying make a second pass over the same record a
//! no-op.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use waypoint_core::event_bus::{make_event, EngineEventSink, EngineEventType};
use waypoint_definition::{DefinitionStatus, DefinitionStore};
use waypoint_engine::{ExecutionStatus, ExecutionStore, StepAttemptStore};
use waypoint_scheduler::{urgency_band, QueueItem, WorkQueue};

pub struct DateOffsetSweeper {
    definitions: Arc<DefinitionStore>,
    executions: Arc<ExecutionStore>,
    attempts: Arc<StepAttemptStore>,
    queue: Arc<WorkQueue>,
    event_sink: Arc<dyn EngineEventSink>,
}

impl DateOffsetSweeper {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        executions: Arc<ExecutionStore>,
        attempts: Arc<StepAttemptStore>,
        queue: Arc<WorkQueue>,
        event_sink: Arc<dyn EngineEventSink>,
    ) -> Self {
        Self {
            definitions,
            executions,
            attempts,
            queue,
            event_sink,
        }
    }

    /// One sweep pass. Returns how many executions it started.
    pub fn run_sweep(&self, now: DateTime<Utc>) -> usize {
        let mut started = 0;

        for record in self.executions.list_anchored_live() {
            if record.status != ExecutionStatus::Pending {
                continue;
            }
            let Some(anchor) = record.anchor_date else {
                continue;
            };
            let Some(definition) = self
                .definitions
                .get_version(record.journey_id, record.journey_version)
            else {
                warn!(
                    execution_id = %record.id,
                    journey_id = %record.journey_id,
                    "Anchored execution references a missing definition"
                );
                continue;
            };
            // Paused or archived journeys stop starting new work.
            if definition.status != DefinitionStatus::Active {
                continue;
            }
            let Some(offset) = definition.anchor_trigger_offset() else {
                continue;
            };

            let due = anchor + Duration::days(offset);
            if due > now {
                continue;
            }
            let Some(entry) = definition.graph.entry_node() else {
                warn!(journey_id = %definition.id, "Active journey has no entry node");
                continue;
            };
            if self.queue.is_queued(record.id, entry.id) {
                continue;
            }

            let attempt = self
                .attempts
                .create_or_get(record.id, entry.id, due, Some(offset));
            self.queue.enqueue(QueueItem {
                execution_id: record.id,
                node_id: entry.id,
                attempt_id: attempt.id,
                urgency_band: urgency_band(Some(anchor), now),
                not_before: due,
                enqueued_at: now,
            });

            info!(
                execution_id = %record.id,
                journey_id = %definition.id,
                due = %due,
                "Date-offset trigger fired"
            );
            self.event_sink.emit(make_event(
                EngineEventType::TriggerMatched,
                Some(record.id),
                Some(definition.id),
                Some(record.subject_id.clone()),
                Some(format!("anchor_offset:{offset}")),
            ));
            started += 1;
        }

        if started > 0 {
            metrics::counter!("triggers.sweep_started").increment(started as u64);
        }
        started
    }
}
