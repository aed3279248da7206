//! Trigger evaluation — turns inbound domain events into executions.
//!
//! Ingestion is at-least-once, so every event passes a dedup window first.
//! A surviving event does two things, in order: it resumes executions
//! parked on a matching collect_form node, then it enrolls the subject
//! into every active journey with a matching event trigger. Enrollment is
//! guarded by the live-uniqueness index; a subject already in flight is
//! skipped, not restarted.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use std::sync::Arc;

use waypoint_core::event_bus::{make_event, EngineEventSink, EngineEventType};
use waypoint_core::types::DomainEvent;
use waypoint_core::EngineResult;
use waypoint_definition::{DefinitionStore, NodeKind};
use waypoint_engine::{ExecutionRecord, ExecutionStatus, ExecutionStore, StepAttemptStore};
use waypoint_scheduler::{urgency_band, QueueItem, WorkQueue};

/// What one event did: which executions it started and which it resumed.
#[derive(Debug, Default)]
pub struct EventReport {
    pub started: Vec<Uuid>,
    pub resumed: Vec<Uuid>,
    pub duplicate: bool,
}

pub struct TriggerEvaluator {
    definitions: Arc<DefinitionStore>,
    executions: Arc<ExecutionStore>,
    attempts: Arc<StepAttemptStore>,
    queue: Arc<WorkQueue>,
    event_sink: Arc<dyn EngineEventSink>,
    /// dedup key -> first-seen time, pruned on a retention window.
    seen: DashMap<String, DateTime<Utc>>,
    retention: Duration,
}

impl TriggerEvaluator {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        executions: Arc<ExecutionStore>,
        attempts: Arc<StepAttemptStore>,
        queue: Arc<WorkQueue>,
        event_sink: Arc<dyn EngineEventSink>,
        retention: Duration,
    ) -> Self {
        Self {
            definitions,
            executions,
            attempts,
            queue,
            event_sink,
            seen: DashMap::new(),
            retention,
        }
    }

    /// Process one inbound event end to end.
    pub fn handle_event(&self, event: &DomainEvent) -> EventReport {
        let mut report = EventReport::default();

        let key = event.dedup_key();
        if self.note_seen(key.clone(), Utc::now()) {
            debug!(dedup_key = %key, "Duplicate event, skipping");
            metrics::counter!("triggers.duplicates").increment(1);
            report.duplicate = true;
            return report;
        }

        report.resumed = self.resume_waiting(event);
        report.started = self.enroll(event);

        metrics::counter!("triggers.events").increment(1);
        report
    }

    /// Advance executions parked on a collect_form node whose resume event
    /// matches this event type.
    fn resume_waiting(&self, event: &DomainEvent) -> Vec<Uuid> {
        let mut resumed = Vec::new();

        for record in self.executions.list_by_subject(&event.subject_id) {
            if record.status != ExecutionStatus::Waiting {
                continue;
            }
            let Some(node_id) = record.current_node_id else {
                continue;
            };
            let Some(definition) = self
                .definitions
                .get_version(record.journey_id, record.journey_version)
            else {
                continue;
            };
            let Some(node) = definition.graph.node(node_id) else {
                continue;
            };
            let NodeKind::CollectForm(form) = &node.kind else {
                continue;
            };
            if form.resume_event != event.event_type {
                continue;
            }

            info!(
                execution_id = %record.id,
                form_id = %form.form_id,
                event_type = %event.event_type,
                "Resuming execution on form submission"
            );
            match self.advance_past(&record, node.next) {
                Ok(()) => resumed.push(record.id),
                Err(e) => {
                    warn!(execution_id = %record.id, error = %e, "Resume failed");
                }
            }
        }

        if !resumed.is_empty() {
            metrics::counter!("triggers.resumed").increment(resumed.len() as u64);
        }
        resumed
    }

    fn advance_past(&self, record: &ExecutionRecord, next: Option<Uuid>) -> EngineResult<()> {
        let now = Utc::now();
        match next {
            Some(next) => {
                let attempt = self.attempts.create_or_get(record.id, next, now, None);
                self.queue.enqueue(QueueItem {
                    execution_id: record.id,
                    node_id: next,
                    attempt_id: attempt.id,
                    urgency_band: urgency_band(record.anchor_date, now),
                    not_before: now,
                    enqueued_at: now,
                });
                self.executions.update_with_retry(record.id, |r| {
                    r.status = ExecutionStatus::Active;
                    r.current_node_id = Some(next);
                })?;
            }
            None => {
                self.executions.update_with_retry(record.id, |r| {
                    r.status = ExecutionStatus::Completed;
                })?;
                self.event_sink.emit(make_event(
                    EngineEventType::ExecutionCompleted,
                    Some(record.id),
                    Some(record.journey_id),
                    Some(record.subject_id.clone()),
                    None,
                ));
            }
        }
        Ok(())
    }

    /// Enroll the subject into every active journey with a matching event
    /// trigger. A live execution for the same (journey, subject) blocks
    /// re-entry until it reaches a terminal state.
    fn enroll(&self, event: &DomainEvent) -> Vec<Uuid> {
        let mut started = Vec::new();

        for definition in self.definitions.match_event(&event.event_type) {
            if self
                .executions
                .get_live(definition.id, &event.subject_id)
                .is_some()
            {
                debug!(
                    journey_id = %definition.id,
                    subject_id = %event.subject_id,
                    "Subject already in flight, not re-enrolling"
                );
                continue;
            }

            let Some(entry) = definition.graph.entry_node() else {
                warn!(journey_id = %definition.id, "Active journey has no entry node");
                continue;
            };
            let anchor = extract_anchor(&event.payload);

            let record = match self.executions.create(
                definition.id,
                definition.version,
                event.subject_id.clone(),
                anchor,
            ) {
                Ok(record) => record,
                Err(e) => {
                    // Lost a race with a concurrent event for the same subject.
                    debug!(journey_id = %definition.id, error = %e, "Enrollment skipped");
                    continue;
                }
            };

            let now = Utc::now();
            let attempt = self.attempts.create_or_get(record.id, entry.id, now, None);
            self.queue.enqueue(QueueItem {
                execution_id: record.id,
                node_id: entry.id,
                attempt_id: attempt.id,
                urgency_band: urgency_band(anchor, now),
                not_before: now,
                enqueued_at: now,
            });

            info!(
                execution_id = %record.id,
                journey_id = %definition.id,
                subject_id = %event.subject_id,
                event_type = %event.event_type,
                "Enrolled subject via event trigger"
            );
            self.event_sink.emit(make_event(
                EngineEventType::TriggerMatched,
                Some(record.id),
                Some(definition.id),
                Some(event.subject_id.clone()),
                Some(event.event_type.clone()),
            ));
            metrics::counter!("triggers.enrolled").increment(1);
            started.push(record.id);
        }
        started
    }

    /// Move an execution's anchor date and pull every queued anchor-derived
    /// step along with it. Already-executed steps are never re-run.
    pub fn reanchor(
        &self,
        execution_id: Uuid,
        new_anchor: DateTime<Utc>,
    ) -> EngineResult<ExecutionRecord> {
        let record = self.executions.update_with_retry(execution_id, |r| {
            r.anchor_date = Some(new_anchor);
        })?;

        let mut moved = 0;
        for attempt in self.attempts.queued_anchor_relative(execution_id) {
            let Some(offset) = attempt.anchor_offset_days else {
                continue;
            };
            let due = new_anchor + Duration::days(offset);
            // Band from anchor proximity at the new release time, not at
            // reschedule time.
            let band = urgency_band(Some(new_anchor), due);
            self.attempts.reschedule(attempt.id, due);
            if self.queue.reschedule(execution_id, attempt.node_id, due, band) {
                moved += 1;
            }
        }

        info!(
            execution_id = %execution_id,
            new_anchor = %new_anchor,
            moved,
            "Re-anchored execution"
        );
        metrics::counter!("triggers.reanchored").increment(1);
        Ok(record)
    }

    /// Records the dedup key, keeping the first-seen time on replays so a
    /// continuously re-delivered event still ages out of the window.
    fn note_seen(&self, key: String, now: DateTime<Utc>) -> bool {
        match self.seen.entry(key) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    /// Drop dedup entries older than the retention window.
    pub fn prune_dedup(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| *seen_at > cutoff);
        before - self.seen.len()
    }

    pub fn dedup_len(&self) -> usize {
        self.seen.len()
    }
}

/// Anchor date carried on an enrollment event, if any.
fn extract_anchor(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
    payload
        .get("anchor_date")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
