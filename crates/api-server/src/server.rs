//! API server — HTTP router and the Prometheus metrics exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use waypoint_core::config::AppConfig;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Journey administration
        .route("/v1/journeys", post(rest::create_journey).get(rest::list_journeys))
        .route(
            "/v1/journeys/:id",
            get(rest::get_journey).put(rest::update_journey),
        )
        .route("/v1/journeys/:id/status", post(rest::set_journey_status))
        .route("/v1/journeys/:id/stats", get(rest::journey_stats))
        // Event ingestion
        .route("/v1/events", post(rest::ingest_event))
        // Executions
        .route("/v1/executions", post(rest::enroll))
        .route("/v1/executions/:id", get(rest::get_execution))
        .route("/v1/executions/:id/cancel", post(rest::cancel_execution))
        .route("/v1/executions/:id/reanchor", post(rest::reanchor_execution))
        .route("/v1/subjects/:id/executions", get(rest::subject_executions))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP API server for one engine node.
pub struct ApiServer {
    config: Arc<AppConfig>,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: Arc<AppConfig>, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the HTTP server. Runs until the process exits.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
