//! Execution worker — advances one execution by exactly one step.
//!
//! `run_step` loads the execution record and the node definition, performs
//! the node's action, schedules the successor, and writes the record back
//! under optimistic versioning. Collaborator calls are timeout-bounded; a
//! timeout is a transient failure for the retry manager. Errors never
//! escape raw: the pool routes every `Err` into the retry manager.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use waypoint_core::collaborators::{ActionDispatcher, SubjectLookup};
use waypoint_core::event_bus::{make_event, EngineEventSink, EngineEventType};
use waypoint_core::types::{DispatchAction, DispatchKind};
use waypoint_core::{EngineError, EngineResult};
use waypoint_definition::{
    BranchConfig, DefinitionStore, JourneyNode, NodeKind, WaitSpec,
};
use waypoint_scheduler::{urgency_band, QueueItem, WorkQueue};

use crate::store::{ExecutionStore, StepAttemptStore};
use crate::types::{AttemptStatus, ExecutionRecord, ExecutionStatus, StepAttempt};

/// What a `run_step` call did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step done, successor enqueued.
    Advanced,
    /// Execution parked (wait or collect_form).
    Waiting,
    /// No outgoing edge; execution completed.
    Completed,
    /// Execution was cancelled or terminal; item dropped without effect.
    Discarded,
}

pub struct StepWorker {
    definitions: Arc<DefinitionStore>,
    executions: Arc<ExecutionStore>,
    attempts: Arc<StepAttemptStore>,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<dyn ActionDispatcher>,
    subjects: Arc<dyn SubjectLookup>,
    event_sink: Arc<dyn EngineEventSink>,
    collaborator_timeout: StdDuration,
}

impl StepWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definitions: Arc<DefinitionStore>,
        executions: Arc<ExecutionStore>,
        attempts: Arc<StepAttemptStore>,
        queue: Arc<WorkQueue>,
        dispatcher: Arc<dyn ActionDispatcher>,
        subjects: Arc<dyn SubjectLookup>,
        event_sink: Arc<dyn EngineEventSink>,
        collaborator_timeout: StdDuration,
    ) -> Self {
        Self {
            definitions,
            executions,
            attempts,
            queue,
            dispatcher,
            subjects,
            event_sink,
            collaborator_timeout,
        }
    }

    /// Execute exactly one step of one execution.
    pub async fn run_step(&self, item: &QueueItem) -> EngineResult<StepOutcome> {
        let record = self
            .executions
            .get(item.execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", item.execution_id)))?;

        // Cancelled (or otherwise terminal) executions drain as no-ops.
        if record.status.is_terminal() {
            debug!(
                execution_id = %record.id,
                status = ?record.status,
                "Discarding item for terminal execution"
            );
            return Ok(StepOutcome::Discarded);
        }

        let definition = self
            .definitions
            .get_version(record.journey_id, record.journey_version)
            .ok_or_else(|| {
                EngineError::PermanentDispatch(format!(
                    "journey {} v{} not found",
                    record.journey_id, record.journey_version
                ))
            })?;
        let node = definition.graph.node(item.node_id).ok_or_else(|| {
            EngineError::PermanentDispatch(format!(
                "node {} not in journey {} v{}",
                item.node_id, record.journey_id, record.journey_version
            ))
        })?;
        let attempt = self
            .attempts
            .get(item.attempt_id)
            .ok_or_else(|| EngineError::NotFound(format!("attempt {}", item.attempt_id)))?;

        info!(
            execution_id = %record.id,
            node_id = %node.id,
            node_kind = node.kind.label(),
            attempt = attempt.attempt_number,
            "Running step"
        );
        metrics::counter!("worker.steps", "kind" => node.kind.label()).increment(1);

        let started_pending = record.status == ExecutionStatus::Pending;
        let outcome = match &node.kind {
            NodeKind::SendMessage(config) => {
                let payload = serde_json::json!({
                    "template_id": config.template_id,
                    "channel": config.channel,
                });
                self.dispatch_once(&record, &attempt, DispatchKind::Message, payload)
                    .await?;
                self.advance(&record, node).await?
            }
            NodeKind::ExternalAction(config) => {
                let payload = serde_json::json!({
                    "action": config.action,
                    "config": config.config,
                });
                self.dispatch_once(&record, &attempt, DispatchKind::ExternalAction, payload)
                    .await?;
                self.advance(&record, node).await?
            }
            NodeKind::Wait(spec) => self.park_until(&record, node, &attempt, spec).await?,
            NodeKind::Branch(branch) => {
                let target = self.pick_branch(&record, node.id, branch).await?;
                self.attempts.set_status(attempt.id, AttemptStatus::Succeeded);
                self.advance_to(&record, Some(target)).await?
            }
            NodeKind::CollectForm(config) => {
                // Event-driven resume: no not_before, the trigger evaluator
                // re-activates on the form's resume event.
                self.attempts.set_status(attempt.id, AttemptStatus::Succeeded);
                debug!(
                    execution_id = %record.id,
                    form_id = %config.form_id,
                    resume_event = %config.resume_event,
                    "Parking execution until form submission"
                );
                self.executions.update_with_retry(record.id, |r| {
                    r.status = ExecutionStatus::Waiting;
                    r.current_node_id = Some(node.id);
                })?;
                self.emit(EngineEventType::ExecutionWaiting, &record, None);
                StepOutcome::Waiting
            }
        };

        if started_pending {
            self.emit(EngineEventType::ExecutionStarted, &record, None);
        }
        self.emit(EngineEventType::StepCompleted, &record, Some(node.id.to_string()));
        Ok(outcome)
    }

    /// Dispatch the node's side effect at most once per idempotency key.
    /// A re-delivered attempt that already succeeded skips the call.
    async fn dispatch_once(
        &self,
        record: &ExecutionRecord,
        attempt: &StepAttempt,
        kind: DispatchKind,
        config: serde_json::Value,
    ) -> EngineResult<()> {
        if attempt.status == AttemptStatus::Succeeded {
            debug!(
                execution_id = %record.id,
                node_id = %attempt.node_id,
                "Side effect already recorded, skipping dispatch"
            );
            return Ok(());
        }

        self.attempts.set_status(attempt.id, AttemptStatus::Running);
        let action = DispatchAction {
            kind,
            idempotency_key: attempt.idempotency_key.clone(),
            subject_id: record.subject_id.clone(),
            config,
        };

        let outcome = tokio::time::timeout(
            self.collaborator_timeout,
            self.dispatcher.dispatch(action),
        )
        .await
        .map_err(|_| EngineError::TransientDispatch("collaborator dispatch timed out".into()))??;

        debug!(
            execution_id = %record.id,
            node_id = %attempt.node_id,
            external_ref = outcome.external_ref.as_deref().unwrap_or("-"),
            "Dispatch succeeded"
        );
        metrics::counter!("worker.dispatches").increment(1);
        self.attempts.set_status(attempt.id, AttemptStatus::Succeeded);
        Ok(())
    }

    /// Resolve a wait node: compute the successor's due time and park.
    async fn park_until(
        &self,
        record: &ExecutionRecord,
        node: &JourneyNode,
        attempt: &StepAttempt,
        spec: &WaitSpec,
    ) -> EngineResult<StepOutcome> {
        let now = Utc::now();
        let (due, offset_days) = match spec {
            WaitSpec::Duration { secs } => (now + Duration::seconds(*secs as i64), None),
            WaitSpec::AnchorOffset { days } => {
                let anchor = record.anchor_date.ok_or_else(|| {
                    EngineError::PermanentDispatch(format!(
                        "wait node {} needs an anchor date but execution {} has none",
                        node.id, record.id
                    ))
                })?;
                (anchor + Duration::days(*days), Some(*days))
            }
        };

        self.attempts.set_status(attempt.id, AttemptStatus::Succeeded);

        match node.next {
            Some(next) => {
                let next_attempt =
                    self.attempts
                        .create_or_get(record.id, next, due, offset_days);
                // Band from anchor proximity at release time: a step gated
                // months out must not keep a stale enqueue-time band.
                self.queue.enqueue(QueueItem {
                    execution_id: record.id,
                    node_id: next,
                    attempt_id: next_attempt.id,
                    urgency_band: urgency_band(record.anchor_date, due),
                    not_before: due,
                    enqueued_at: now,
                });
                self.executions.update_with_retry(record.id, |r| {
                    r.status = ExecutionStatus::Waiting;
                    r.current_node_id = Some(next);
                })?;
                self.emit(EngineEventType::ExecutionWaiting, record, None);
                Ok(StepOutcome::Waiting)
            }
            // A trailing wait with nothing after it just completes.
            None => self.advance_to(record, None).await,
        }
    }

    /// Evaluate branch arms in order against subject attributes.
    async fn pick_branch(
        &self,
        record: &ExecutionRecord,
        node_id: Uuid,
        branch: &BranchConfig,
    ) -> EngineResult<Uuid> {
        let attributes = tokio::time::timeout(
            self.collaborator_timeout,
            self.subjects.attributes(&record.subject_id),
        )
        .await
        .map_err(|_| EngineError::TransientDispatch("subject lookup timed out".into()))??;

        for arm in &branch.arms {
            if arm.predicate.evaluate(&attributes) {
                debug!(
                    execution_id = %record.id,
                    node_id = %node_id,
                    target = %arm.target,
                    "Branch arm matched"
                );
                return Ok(arm.target);
            }
        }
        if let Some(default) = branch.default_target {
            return Ok(default);
        }

        warn!(execution_id = %record.id, node_id = %node_id, "No branch arm matched");
        Err(EngineError::BranchExhausted(format!(
            "branch node {} matched no arm and has no default",
            node_id
        )))
    }

    /// Schedule the linear successor of an action node.
    async fn advance(&self, record: &ExecutionRecord, node: &JourneyNode) -> EngineResult<StepOutcome> {
        self.advance_to(record, node.next).await
    }

    async fn advance_to(
        &self,
        record: &ExecutionRecord,
        next: Option<Uuid>,
    ) -> EngineResult<StepOutcome> {
        match next {
            Some(next) => {
                let now = Utc::now();
                let next_attempt = self.attempts.create_or_get(record.id, next, now, None);
                self.queue.enqueue(QueueItem {
                    execution_id: record.id,
                    node_id: next,
                    attempt_id: next_attempt.id,
                    urgency_band: urgency_band(record.anchor_date, now),
                    not_before: now,
                    enqueued_at: now,
                });
                self.executions.update_with_retry(record.id, |r| {
                    r.status = ExecutionStatus::Active;
                    r.current_node_id = Some(next);
                })?;
                Ok(StepOutcome::Advanced)
            }
            None => {
                let updated = self.executions.update_with_retry(record.id, |r| {
                    r.status = ExecutionStatus::Completed;
                })?;
                info!(execution_id = %record.id, "Execution completed");
                metrics::counter!("worker.executions_completed").increment(1);
                self.emit(EngineEventType::ExecutionCompleted, &updated, None);
                Ok(StepOutcome::Completed)
            }
        }
    }

    fn emit(&self, event_type: EngineEventType, record: &ExecutionRecord, detail: Option<String>) {
        self.event_sink.emit(make_event(
            event_type,
            Some(record.id),
            Some(record.journey_id),
            Some(record.subject_id.clone()),
            detail,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::collaborators::{RecordingDispatcher, StaticCatalog, StaticSubjects};
    use waypoint_core::event_bus::capture_sink;
    use waypoint_definition::{
        BranchArm, DefinitionStatus, FormConfig, JourneyGraph, MessageChannel, MessageConfig,
        Predicate, TriggerSpec,
    };

    struct Harness {
        definitions: Arc<DefinitionStore>,
        executions: Arc<ExecutionStore>,
        attempts: Arc<StepAttemptStore>,
        queue: Arc<WorkQueue>,
        dispatcher: Arc<RecordingDispatcher>,
        subjects: Arc<StaticSubjects>,
        sink: Arc<waypoint_core::event_bus::CaptureSink>,
        worker: StepWorker,
    }

    fn harness() -> Harness {
        let definitions = Arc::new(DefinitionStore::new());
        let executions = Arc::new(ExecutionStore::new());
        let attempts = Arc::new(StepAttemptStore::new());
        let queue = Arc::new(WorkQueue::new(Duration::seconds(30)));
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let subjects = Arc::new(StaticSubjects::new());
        let sink = capture_sink();
        let worker = StepWorker::new(
            definitions.clone(),
            executions.clone(),
            attempts.clone(),
            queue.clone(),
            dispatcher.clone(),
            subjects.clone(),
            sink.clone(),
            StdDuration::from_secs(2),
        );
        Harness {
            definitions,
            executions,
            attempts,
            queue,
            dispatcher,
            subjects,
            sink,
            worker,
        }
    }

    fn send_node(id: Uuid, template: &str, next: Option<Uuid>) -> JourneyNode {
        JourneyNode {
            id,
            kind: NodeKind::SendMessage(MessageConfig {
                template_id: template.into(),
                channel: MessageChannel::Email,
            }),
            next,
        }
    }

    fn event_trigger() -> Vec<TriggerSpec> {
        vec![TriggerSpec::Event {
            event_type: "subject_created".into(),
        }]
    }

    /// Create a definition, activate it, enroll a subject, and hand back
    /// the leased queue item for the entry node.
    fn enroll(h: &Harness, graph: JourneyGraph, anchor: Option<chrono::DateTime<Utc>>) -> QueueItem {
        let catalog = StaticCatalog::permissive();
        let def = h
            .definitions
            .create("Test", "", event_trigger(), graph, &catalog)
            .expect("create definition");
        h.definitions
            .set_status(def.id, DefinitionStatus::Active)
            .expect("activate");

        let record = h
            .executions
            .create(def.id, def.version, "subject-1", anchor)
            .expect("create execution");
        let entry = def.graph.entry_node().expect("entry").id;
        let attempt = h.attempts.create_or_get(record.id, entry, Utc::now(), None);
        h.queue.enqueue(QueueItem {
            execution_id: record.id,
            node_id: entry,
            attempt_id: attempt.id,
            urgency_band: urgency_band(anchor, Utc::now()),
            not_before: Utc::now() - Duration::seconds(1),
            enqueued_at: Utc::now(),
        });
        h.queue.dequeue(1, "w1", Utc::now()).pop().expect("leased")
    }

    fn drain_one(h: &Harness) -> QueueItem {
        h.queue
            .dequeue(1, "w1", Utc::now() + Duration::days(30))
            .pop()
            .expect("next item ready")
    }

    #[tokio::test]
    async fn test_linear_journey_completes() {
        let h = harness();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![send_node(a, "welcome", Some(b)), send_node(b, "followup", None)],
            },
            None,
        );

        assert_eq!(h.worker.run_step(&item).await.expect("step"), StepOutcome::Advanced);
        h.queue.ack(&item);

        let item = drain_one(&h);
        assert_eq!(h.worker.run_step(&item).await.expect("step"), StepOutcome::Completed);
        h.queue.ack(&item);

        assert_eq!(h.dispatcher.effect_count(), 2);
        let record = h.executions.get(item.execution_id).expect("record");
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(h.sink.count_type(EngineEventType::ExecutionCompleted), 1);
        assert_eq!(h.sink.count_type(EngineEventType::ExecutionStarted), 1);
    }

    #[tokio::test]
    async fn test_redelivered_step_does_not_double_send() {
        let h = harness();
        let a = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![send_node(a, "welcome", None)],
            },
            None,
        );

        h.worker.run_step(&item).await.expect("first run");
        assert_eq!(h.dispatcher.call_count(), 1);

        // Simulate a lease expiry re-delivery of the same item: the record
        // is already terminal, so the re-run discards.
        assert_eq!(
            h.worker.run_step(&item).await.expect("re-run"),
            StepOutcome::Discarded
        );
        assert_eq!(h.dispatcher.call_count(), 1);
        assert_eq!(h.dispatcher.effect_count(), 1);
    }

    #[tokio::test]
    async fn test_succeeded_attempt_skips_dispatch_on_replay() {
        let h = harness();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![send_node(a, "welcome", Some(b)), send_node(b, "followup", None)],
            },
            None,
        );

        h.worker.run_step(&item).await.expect("step");
        // Crash before ack: the same (non-terminal) execution re-delivers
        // the entry node. The attempt is already Succeeded, so no second
        // effect, just a re-advance.
        h.worker.run_step(&item).await.expect("replay");

        assert_eq!(h.dispatcher.call_count(), 1, "dispatch skipped on replay");
        assert_eq!(h.dispatcher.effect_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_with_fixed_duration_parks() {
        let h = harness();
        let a = Uuid::new_v4();
        let wait = Uuid::new_v4();
        let c = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![
                    send_node(a, "welcome", Some(wait)),
                    JourneyNode {
                        id: wait,
                        kind: NodeKind::Wait(WaitSpec::Duration { secs: 604_800 }),
                        next: Some(c),
                    },
                    send_node(c, "reminder", None),
                ],
            },
            None,
        );

        h.worker.run_step(&item).await.expect("send step");
        h.queue.ack(&item);
        let item = drain_one(&h);
        assert_eq!(h.worker.run_step(&item).await.expect("wait step"), StepOutcome::Waiting);
        h.queue.ack(&item);

        let record = h.executions.get(item.execution_id).expect("record");
        assert_eq!(record.status, ExecutionStatus::Waiting);
        assert_eq!(record.current_node_id, Some(c));

        // The successor is queued but gated on its due time.
        assert!(h.queue.dequeue(1, "w1", Utc::now()).is_empty());
        assert_eq!(h.queue.dequeue(1, "w1", Utc::now() + Duration::days(8)).len(), 1);
    }

    #[tokio::test]
    async fn test_gated_wait_successor_outranks_less_urgent_ready_work() {
        let h = harness();
        let wait = Uuid::new_v4();
        let send = Uuid::new_v4();
        let anchor = Utc::now() + Duration::days(180);
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![
                    JourneyNode {
                        id: wait,
                        kind: NodeKind::Wait(WaitSpec::AnchorOffset { days: -7 }),
                        next: Some(send),
                    },
                    send_node(send, "reminder", None),
                ],
            },
            Some(anchor),
        );

        assert_eq!(h.worker.run_step(&item).await.expect("wait step"), StepOutcome::Waiting);
        h.queue.ack(&item);

        // A rival in the monthly band, releasable well before our successor.
        let due = anchor - Duration::days(7);
        h.queue.enqueue(QueueItem {
            execution_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            attempt_id: Uuid::new_v4(),
            urgency_band: 2,
            not_before: due - Duration::days(60),
            enqueued_at: Utc::now(),
        });

        // When the gate opens one week before the anchor, the successor is
        // weekly-band work and must beat the monthly-band rival, even though
        // it was enqueued with the anchor half a year away.
        let got = h
            .queue
            .dequeue(1, "w1", due + Duration::hours(1))
            .pop()
            .expect("released");
        assert_eq!(got.execution_id, item.execution_id);
        assert_eq!(got.urgency_band, 1);
    }

    #[tokio::test]
    async fn test_wait_anchor_offset_requires_anchor() {
        let h = harness();
        let wait = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![JourneyNode {
                    id: wait,
                    kind: NodeKind::Wait(WaitSpec::AnchorOffset { days: -7 }),
                    next: None,
                }],
            },
            None,
        );

        let err = h.worker.run_step(&item).await.unwrap_err();
        assert!(matches!(err, EngineError::PermanentDispatch(_)));
    }

    #[tokio::test]
    async fn test_branch_routes_by_attribute() {
        let h = harness();
        let branch = Uuid::new_v4();
        let yes = Uuid::new_v4();
        let no = Uuid::new_v4();
        h.subjects
            .insert("subject-1", serde_json::json!({"form_submitted": true}));

        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![
                    JourneyNode {
                        id: branch,
                        kind: NodeKind::Branch(BranchConfig {
                            arms: vec![BranchArm {
                                predicate: Predicate::AttributeExists {
                                    key: "form_submitted".into(),
                                },
                                target: yes,
                            }],
                            default_target: Some(no),
                        }),
                        next: None,
                    },
                    send_node(yes, "thanks", None),
                    send_node(no, "nudge", None),
                ],
            },
            None,
        );

        assert_eq!(h.worker.run_step(&item).await.expect("branch"), StepOutcome::Advanced);
        let record = h.executions.get(item.execution_id).expect("record");
        assert_eq!(record.current_node_id, Some(yes));
    }

    #[tokio::test]
    async fn test_branch_default_when_no_match() {
        let h = harness();
        let branch = Uuid::new_v4();
        let yes = Uuid::new_v4();
        let no = Uuid::new_v4();
        h.subjects.insert("subject-1", serde_json::json!({}));

        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![
                    JourneyNode {
                        id: branch,
                        kind: NodeKind::Branch(BranchConfig {
                            arms: vec![BranchArm {
                                predicate: Predicate::AttributeExists {
                                    key: "form_submitted".into(),
                                },
                                target: yes,
                            }],
                            default_target: Some(no),
                        }),
                        next: None,
                    },
                    send_node(yes, "thanks", None),
                    send_node(no, "nudge", None),
                ],
            },
            None,
        );

        h.worker.run_step(&item).await.expect("branch");
        let record = h.executions.get(item.execution_id).expect("record");
        assert_eq!(record.current_node_id, Some(no));
    }

    #[tokio::test]
    async fn test_collect_form_parks_without_due_time() {
        let h = harness();
        let form = Uuid::new_v4();
        let after = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![
                    JourneyNode {
                        id: form,
                        kind: NodeKind::CollectForm(FormConfig {
                            form_id: "rsvp".into(),
                            resume_event: "form_submitted".into(),
                        }),
                        next: Some(after),
                    },
                    send_node(after, "thanks", None),
                ],
            },
            None,
        );

        assert_eq!(h.worker.run_step(&item).await.expect("form"), StepOutcome::Waiting);
        h.queue.ack(&item);

        let record = h.executions.get(item.execution_id).expect("record");
        assert_eq!(record.status, ExecutionStatus::Waiting);
        assert_eq!(record.current_node_id, Some(form));
        // Nothing queued: resume is event-driven.
        assert_eq!(h.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_execution_discards() {
        let h = harness();
        let a = Uuid::new_v4();
        let item = enroll(
            &h,
            JourneyGraph {
                nodes: vec![send_node(a, "welcome", None)],
            },
            None,
        );

        h.executions.cancel(item.execution_id).expect("cancel");
        assert_eq!(
            h.worker.run_step(&item).await.expect("discard"),
            StepOutcome::Discarded
        );
        assert_eq!(h.dispatcher.call_count(), 0);
    }
}
