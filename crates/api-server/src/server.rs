//! API server: HTTP routes plus the Prometheus exporter.

use crate::rest::{self, AppState};
use audience_core::config::AppConfig;
use audience_scheduler::JobScheduler;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    scheduler: Arc<JobScheduler>,
}

/// All routes with their middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Materialization
        .route("/v1/rules/:id/trigger", post(rest::trigger_rule))
        .route("/v1/rules/:id/jobs", get(rest::rule_jobs))
        .route("/v1/jobs/:id", get(rest::get_job).delete(rest::cancel_job))
        .route("/v1/plan", get(rest::get_plan))
        .route("/v1/conditions/normalize", post(rest::normalize_condition))
        // Segment reads
        .route("/v1/segments", get(rest::list_segments))
        .route("/v1/segments/:rule_id", get(rest::get_segment))
        .route("/v1/segments/:rule_id/sample", get(rest::sample_segment))
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

impl ApiServer {
    pub fn new(config: AppConfig, scheduler: Arc<JobScheduler>) -> Self {
        Self { config, scheduler }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(AppState {
            scheduler: self.scheduler.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        });

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the metrics exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
