//! End-to-end journey flows driven deterministically: steps run through
//! the real worker, the queue is drained with explicit clocks, and the
//! collaborators are the in-memory implementations.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use waypoint_core::collaborators::{RecordingDispatcher, StaticCatalog, StaticSubjects};
use waypoint_core::config::RetryConfig;
use waypoint_core::event_bus::{capture_sink, CaptureSink, EngineEventType};
use waypoint_core::types::DomainEvent;
use waypoint_definition::{
    BranchArm, BranchConfig, DefinitionStatus, DefinitionStore, FormConfig, JourneyDefinition,
    JourneyGraph, JourneyNode, MessageChannel, MessageConfig, NodeKind, Predicate, TriggerSpec,
    WaitSpec,
};
use waypoint_engine::{
    AttemptStatus, ExecutionStatus, ExecutionStore, RetryDecision, RetryManager,
    StepAttemptStore, StepOutcome, StepWorker,
};
use waypoint_scheduler::WorkQueue;
use waypoint_triggers::TriggerEvaluator;

struct World {
    definitions: Arc<DefinitionStore>,
    executions: Arc<ExecutionStore>,
    attempts: Arc<StepAttemptStore>,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<RecordingDispatcher>,
    subjects: Arc<StaticSubjects>,
    sink: Arc<CaptureSink>,
    worker: StepWorker,
    retry: RetryManager,
    evaluator: TriggerEvaluator,
}

fn world() -> World {
    world_with_retry(RetryConfig {
        initial_delay_ms: 1,
        max_delay_ms: 2,
        ..RetryConfig::default()
    })
}

fn world_with_retry(retry_config: RetryConfig) -> World {
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
        std::time::Duration::from_secs(2),
    );
    let retry = RetryManager::new(
        retry_config,
        queue.clone(),
        executions.clone(),
        attempts.clone(),
        sink.clone(),
    );
    let evaluator = TriggerEvaluator::new(
        definitions.clone(),
        executions.clone(),
        attempts.clone(),
        queue.clone(),
        sink.clone(),
        Duration::hours(24),
    );

    World {
        definitions,
        executions,
        attempts,
        queue,
        dispatcher,
        subjects,
        sink,
        worker,
        retry,
        evaluator,
    }
}

fn activate(world: &World, name: &str, graph: JourneyGraph) -> JourneyDefinition {
    let def = world
        .definitions
        .create(
            name,
            "",
            vec![TriggerSpec::Event {
                event_type: "signup".into(),
            }],
            graph,
            &StaticCatalog::permissive(),
        )
        .expect("create definition");
    world
        .definitions
        .set_status(def.id, DefinitionStatus::Active)
        .expect("activate");
    world.definitions.get(def.id).expect("definition")
}

fn signup(subject: &str) -> DomainEvent {
    DomainEvent {
        event_type: "signup".into(),
        subject_id: subject.into(),
        occurred_at: Utc::now(),
        payload: serde_json::json!({}),
    }
}

fn send(id: Uuid, template: &str, next: Option<Uuid>) -> JourneyNode {
    JourneyNode {
        id,
        kind: NodeKind::SendMessage(MessageConfig {
            template_id: template.into(),
            channel: MessageChannel::Email,
        }),
        next,
    }
}

/// Lease the next ready item at the given clock, run it, settle the lease.
async fn run_next(world: &World, now: DateTime<Utc>) -> Option<StepOutcome> {
    let item = world.queue.dequeue(1, "it-worker", now).pop()?;
    match world.worker.run_step(&item).await {
        Ok(StepOutcome::Discarded) => {
            world.queue.discard(&item);
            Some(StepOutcome::Discarded)
        }
        Ok(outcome) => {
            world.queue.ack(&item);
            Some(outcome)
        }
        Err(e) => {
            world.retry.on_failure(&item, &e);
            None
        }
    }
}

fn sent_templates(world: &World) -> Vec<String> {
    world
        .dispatcher
        .calls()
        .iter()
        .filter_map(|c| c.config.get("template_id"))
        .filter_map(|t| t.as_str().map(String::from))
        .collect()
}

/// The canonical onboarding flow: send a welcome message, wait a week,
/// then branch on whether the subject submitted the form. A subject who
/// never submits gets exactly the welcome and the nudge, never the thanks.
#[tokio::test]
async fn test_wait_then_branch_routes_non_submitter_to_nudge() {
    let world = world();
    let welcome = Uuid::new_v4();
    let wait = Uuid::new_v4();
    let branch = Uuid::new_v4();
    let thanks = Uuid::new_v4();
    let nudge = Uuid::new_v4();

    let def = activate(
        &world,
        "Onboarding",
        JourneyGraph {
            nodes: vec![
                send(welcome, "welcome_email", Some(wait)),
                JourneyNode {
                    id: wait,
                    kind: NodeKind::Wait(WaitSpec::Duration { secs: 7 * 86_400 }),
                    next: Some(branch),
                },
                JourneyNode {
                    id: branch,
                    kind: NodeKind::Branch(BranchConfig {
                        arms: vec![BranchArm {
                            predicate: Predicate::AttributeExists {
                                key: "form_submitted".into(),
                            },
                            target: thanks,
                        }],
                        default_target: Some(nudge),
                    }),
                    next: None,
                },
                send(thanks, "thanks_email", None),
                send(nudge, "nudge_email", None),
            ],
        },
    );

    world.subjects.insert("subject-1", serde_json::json!({}));
    let report = world.evaluator.handle_event(&signup("subject-1"));
    let execution_id = report.started[0];

    let now = Utc::now();
    assert_eq!(run_next(&world, now).await, Some(StepOutcome::Advanced));
    assert_eq!(run_next(&world, now).await, Some(StepOutcome::Waiting));

    // The branch is gated behind the seven-day wait.
    assert!(run_next(&world, now + Duration::days(6)).await.is_none());
    let later = now + Duration::days(8);
    assert_eq!(run_next(&world, later).await, Some(StepOutcome::Advanced));
    assert_eq!(run_next(&world, later).await, Some(StepOutcome::Completed));

    let record = world.executions.get(execution_id).expect("record");
    assert_eq!(record.status, ExecutionStatus::Completed);

    let templates = sent_templates(&world);
    assert_eq!(templates, vec!["welcome_email", "nudge_email"]);
    assert_eq!(world.dispatcher.effect_count(), 2);
    assert_eq!(world.sink.count_type(EngineEventType::ExecutionCompleted), 1);

    // Audit trail: one attempt per executed node.
    let attempts = world.attempts.list_for_execution(execution_id);
    assert_eq!(attempts.len(), 4);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Succeeded));
    assert_eq!(record.journey_id, def.id);
}

/// A submitter takes the other arm.
#[tokio::test]
async fn test_branch_routes_submitter_to_thanks() {
    let world = world();
    let welcome = Uuid::new_v4();
    let branch = Uuid::new_v4();
    let thanks = Uuid::new_v4();
    let nudge = Uuid::new_v4();

    activate(
        &world,
        "Onboarding",
        JourneyGraph {
            nodes: vec![
                send(welcome, "welcome_email", Some(branch)),
                JourneyNode {
                    id: branch,
                    kind: NodeKind::Branch(BranchConfig {
                        arms: vec![BranchArm {
                            predicate: Predicate::AttributeExists {
                                key: "form_submitted".into(),
                            },
                            target: thanks,
                        }],
                        default_target: Some(nudge),
                    }),
                    next: None,
                },
                send(thanks, "thanks_email", None),
                send(nudge, "nudge_email", None),
            ],
        },
    );

    world
        .subjects
        .insert("subject-2", serde_json::json!({"form_submitted": true}));
    world.evaluator.handle_event(&signup("subject-2"));

    let now = Utc::now();
    while run_next(&world, now).await.is_some() {}

    assert_eq!(sent_templates(&world), vec!["welcome_email", "thanks_email"]);
}

/// Persistent transient failures exhaust the attempt cap and dead-letter;
/// the execution fails and the alert events fire.
#[tokio::test]
async fn test_transient_failures_exhaust_to_dead_letter() {
    let world = world();
    let node = Uuid::new_v4();
    activate(
        &world,
        "Flaky",
        JourneyGraph {
            nodes: vec![send(node, "welcome_email", None)],
        },
    );

    world.dispatcher.set_fail_transient(true);
    let report = world.evaluator.handle_event(&signup("subject-3"));
    let execution_id = report.started[0];

    let mut dead_lettered = false;
    for round in 0..10 {
        // Backoff delays are a couple of milliseconds; jump the clock past
        // them instead of sleeping.
        let now = Utc::now() + Duration::seconds(round + 1);
        let Some(item) = world.queue.dequeue(1, "it-worker", now).pop() else {
            continue;
        };
        let err = world.worker.run_step(&item).await.expect_err("must fail");
        if world.retry.on_failure(&item, &err) == RetryDecision::DeadLetter {
            dead_lettered = true;
            break;
        }
    }
    assert!(dead_lettered, "retries should exhaust within the cap");

    let record = world.executions.get(execution_id).expect("record");
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.last_error.is_some());

    let attempt = world
        .attempts
        .get_for_node(execution_id, node)
        .expect("attempt");
    assert_eq!(attempt.status, AttemptStatus::DeadLettered);
    assert_eq!(attempt.attempt_number, 5);

    assert_eq!(world.dispatcher.effect_count(), 0);
    assert_eq!(world.sink.count_type(EngineEventType::StepDeadLettered), 1);
    assert_eq!(world.sink.count_type(EngineEventType::ExecutionFailed), 1);

    // Terminal records accept no further writes.
    assert!(world.executions.cancel(execution_id).is_err());
}

/// collect_form parks the execution with no timer; the form submission
/// event resumes it and the flow runs to completion.
#[tokio::test]
async fn test_form_submission_resumes_parked_execution() {
    let world = world();
    let welcome = Uuid::new_v4();
    let form = Uuid::new_v4();
    let thanks = Uuid::new_v4();

    activate(
        &world,
        "RSVP",
        JourneyGraph {
            nodes: vec![
                send(welcome, "invite_email", Some(form)),
                JourneyNode {
                    id: form,
                    kind: NodeKind::CollectForm(FormConfig {
                        form_id: "rsvp".into(),
                        resume_event: "form_submitted".into(),
                    }),
                    next: Some(thanks),
                },
                send(thanks, "thanks_email", None),
            ],
        },
    );

    let report = world.evaluator.handle_event(&signup("subject-4"));
    let execution_id = report.started[0];

    let now = Utc::now();
    assert_eq!(run_next(&world, now).await, Some(StepOutcome::Advanced));
    assert_eq!(run_next(&world, now).await, Some(StepOutcome::Waiting));
    // Parked: nothing queued, nothing to run.
    assert!(run_next(&world, now + Duration::days(365)).await.is_none());

    let report = world.evaluator.handle_event(&DomainEvent {
        event_type: "form_submitted".into(),
        subject_id: "subject-4".into(),
        occurred_at: Utc::now(),
        payload: serde_json::json!({"form_id": "rsvp"}),
    });
    assert_eq!(report.resumed, vec![execution_id]);

    assert_eq!(run_next(&world, Utc::now()).await, Some(StepOutcome::Completed));
    assert_eq!(sent_templates(&world), vec!["invite_email", "thanks_email"]);
    assert_eq!(
        world.executions.get(execution_id).expect("record").status,
        ExecutionStatus::Completed
    );
}

/// Anchor-relative waits reschedule when the anchor moves; already-executed
/// steps stay executed.
#[tokio::test]
async fn test_reanchor_shifts_pending_anchor_wait() {
    let world = world();
    let wait = Uuid::new_v4();
    let reminder = Uuid::new_v4();

    activate(
        &world,
        "Countdown",
        JourneyGraph {
            nodes: vec![
                JourneyNode {
                    id: wait,
                    kind: NodeKind::Wait(WaitSpec::AnchorOffset { days: -7 }),
                    next: Some(reminder),
                },
                send(reminder, "reminder_email", None),
            ],
        },
    );

    let anchor = Utc::now() + Duration::days(30);
    let mut event = signup("subject-5");
    event.payload = serde_json::json!({"anchor_date": anchor.to_rfc3339()});
    let report = world.evaluator.handle_event(&event);
    let execution_id = report.started[0];

    let now = Utc::now();
    assert_eq!(run_next(&world, now).await, Some(StepOutcome::Waiting));

    // The reminder sits at anchor - 7d. Move the anchor out by a month.
    let new_anchor = anchor + Duration::days(30);
    world
        .evaluator
        .reanchor(execution_id, new_anchor)
        .expect("reanchor");

    // Old due time releases nothing; the shifted one does.
    assert!(run_next(&world, anchor - Duration::days(6)).await.is_none());
    assert_eq!(
        run_next(&world, new_anchor - Duration::days(6)).await,
        Some(StepOutcome::Completed)
    );
    assert_eq!(sent_templates(&world), vec!["reminder_email"]);
}

/// Cancellation wins over queued work: the leased item drains as a no-op.
#[tokio::test]
async fn test_cancel_discards_queued_work() {
    let world = world();
    let node = Uuid::new_v4();
    activate(
        &world,
        "Cancelled",
        JourneyGraph {
            nodes: vec![send(node, "welcome_email", None)],
        },
    );

    let report = world.evaluator.handle_event(&signup("subject-6"));
    let execution_id = report.started[0];
    world.executions.cancel(execution_id).expect("cancel");

    assert_eq!(
        run_next(&world, Utc::now()).await,
        Some(StepOutcome::Discarded)
    );
    assert_eq!(world.dispatcher.call_count(), 0);
    assert_eq!(world.queue.pending_len(), 0);
    assert_eq!(world.queue.leased_len(), 0);
}
