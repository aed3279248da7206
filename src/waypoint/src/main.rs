//! Waypoint — declarative journey execution engine.
//!
//! Main entry point that wires the stores, the worker pool, the trigger
//! loops, and the API server together.

use chrono::{Duration, Utc};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use waypoint_api::{ApiServer, AppState};
use waypoint_core::collaborators::{RecordingDispatcher, StaticCatalog, StaticSubjects};
use waypoint_core::config::AppConfig;
use waypoint_core::event_bus::{EngineEvent, EngineEventSink};
use waypoint_definition::{
    BranchArm, BranchConfig, DefinitionStatus, DefinitionStore, FormConfig, JourneyGraph,
    JourneyNode, MessageChannel, MessageConfig, NodeKind, Predicate, TriggerSpec, WaitSpec,
};
use waypoint_engine::{ExecutionStore, RetryManager, StepAttemptStore, StepWorker, WorkerPool};
use waypoint_scheduler::WorkQueue;
use waypoint_triggers::{DateOffsetSweeper, TriggerEvaluator};

#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(about = "Declarative journey execution engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "WAYPOINT__NODE_ID")]
    node_id: Option<String>,

    /// Number of step workers (overrides config)
    #[arg(long, env = "WAYPOINT__ENGINE__WORKER_COUNT")]
    workers: Option<usize>,

    /// HTTP port (overrides config)
    #[arg(long, env = "WAYPOINT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Seed a demo journey and a couple of enrollments on startup
    #[arg(long, default_value_t = false)]
    demo: bool,
}

/// Routes engine lifecycle events into the structured log stream.
struct TracingSink;

impl EngineEventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        info!(
            event_type = ?event.event_type,
            execution_id = event.execution_id.map(|id| id.to_string()).unwrap_or_default(),
            journey_id = event.journey_id.map(|id| id.to_string()).unwrap_or_default(),
            subject_id = event.subject_id.as_deref().unwrap_or(""),
            detail = event.detail.as_deref().unwrap_or(""),
            "Engine event"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waypoint=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Waypoint starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.engine.worker_count = workers;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        workers = config.engine.worker_count,
        http_port = config.api.http_port,
        "Configuration loaded"
    );

    let config = Arc::new(config);

    // Stores and the work queue.
    let definitions = Arc::new(DefinitionStore::new());
    let executions = Arc::new(ExecutionStore::new());
    let attempts = Arc::new(StepAttemptStore::new());
    let queue = Arc::new(WorkQueue::new(Duration::seconds(
        config.engine.lease_ttl_secs as i64,
    )));
    let event_sink: Arc<dyn EngineEventSink> = Arc::new(TracingSink);
    let idempotency = Arc::new(waypoint_api::IdempotencyCache::new());

    // In-memory collaborators. Real deployments swap these for adapters to
    // the messaging, profile, and catalog services.
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let subjects = Arc::new(StaticSubjects::new());
    let catalog = Arc::new(StaticCatalog::permissive());

    let evaluator = Arc::new(TriggerEvaluator::new(
        definitions.clone(),
        executions.clone(),
        attempts.clone(),
        queue.clone(),
        event_sink.clone(),
        Duration::seconds(config.triggers.dedup_retention_secs as i64),
    ));
    let sweeper = Arc::new(DateOffsetSweeper::new(
        definitions.clone(),
        executions.clone(),
        attempts.clone(),
        queue.clone(),
        event_sink.clone(),
    ));

    let worker = Arc::new(StepWorker::new(
        definitions.clone(),
        executions.clone(),
        attempts.clone(),
        queue.clone(),
        dispatcher.clone(),
        subjects.clone(),
        event_sink.clone(),
        std::time::Duration::from_millis(config.engine.dispatch_timeout_ms),
    ));
    let retry = Arc::new(RetryManager::new(
        config.retry.clone(),
        queue.clone(),
        executions.clone(),
        attempts.clone(),
        event_sink.clone(),
    ));

    let mut pool = WorkerPool::new(
        config.engine.clone(),
        config.node_id.clone(),
        queue.clone(),
        worker,
        retry,
    );
    pool.start();

    // Date-offset sweep.
    let sweep_interval = std::time::Duration::from_secs(config.triggers.sweep_interval_secs);
    let sweeper_for_loop = sweeper.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let started = sweeper_for_loop.run_sweep(Utc::now());
            if started > 0 {
                info!(started, "Date-offset sweep started executions");
            }
        }
    });

    // Retention maintenance for the event dedup map and the recorded
    // mutation responses.
    let retention = Duration::seconds(config.triggers.dedup_retention_secs as i64);
    let evaluator_for_prune = evaluator.clone();
    let idempotency_for_prune = idempotency.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let now = Utc::now();
            let pruned = evaluator_for_prune.prune_dedup(now);
            let replies = idempotency_for_prune.prune(now, retention);
            if pruned > 0 || replies > 0 {
                info!(pruned, replies, "Pruned retention windows");
            }
        }
    });

    if cli.demo {
        seed_demo(&definitions, &subjects, &evaluator)?;
    }

    let state = AppState {
        definitions,
        executions,
        attempts,
        queue,
        evaluator,
        catalog,
        event_sink,
        idempotency,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };
    let api_server = ApiServer::new(config, state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Waypoint is ready to serve traffic");

    // Blocks until shutdown.
    api_server.start_http().await?;

    Ok(())
}

/// Create and activate a sample onboarding journey, then enroll two
/// subjects through the event path.
fn seed_demo(
    definitions: &DefinitionStore,
    subjects: &StaticSubjects,
    evaluator: &TriggerEvaluator,
) -> anyhow::Result<()> {
    let welcome = uuid::Uuid::new_v4();
    let wait = uuid::Uuid::new_v4();
    let branch = uuid::Uuid::new_v4();
    let thanks = uuid::Uuid::new_v4();
    let nudge = uuid::Uuid::new_v4();

    let graph = JourneyGraph {
        nodes: vec![
            JourneyNode {
                id: welcome,
                kind: NodeKind::SendMessage(MessageConfig {
                    template_id: "welcome_email".into(),
                    channel: MessageChannel::Email,
                }),
                next: Some(wait),
            },
            JourneyNode {
                id: wait,
                kind: NodeKind::Wait(WaitSpec::Duration { secs: 30 }),
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
            JourneyNode {
                id: thanks,
                kind: NodeKind::SendMessage(MessageConfig {
                    template_id: "thanks_email".into(),
                    channel: MessageChannel::Email,
                }),
                next: None,
            },
            JourneyNode {
                id: nudge,
                kind: NodeKind::CollectForm(FormConfig {
                    form_id: "onboarding_form".into(),
                    resume_event: "form_submitted".into(),
                }),
                next: Some(thanks),
            },
        ],
    };

    let catalog = StaticCatalog::permissive();
    let definition = definitions.create(
        "Demo onboarding",
        "Seeded by --demo",
        vec![TriggerSpec::Event {
            event_type: "subject_created".into(),
        }],
        graph,
        &catalog,
    )?;
    definitions.set_status(definition.id, DefinitionStatus::Active)?;

    subjects.insert("demo-ada", serde_json::json!({"form_submitted": true}));
    subjects.insert("demo-brin", serde_json::json!({}));

    for subject in ["demo-ada", "demo-brin"] {
        evaluator.handle_event(&waypoint_core::types::DomainEvent {
            event_type: "subject_created".into(),
            subject_id: subject.into(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        });
    }

    info!(journey_id = %definition.id, "Demo journey seeded");
    Ok(())
}
