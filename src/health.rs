//! Health check HTTP endpoint for load balancer integration

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::coordinator::{CoordinatorMetrics, CoordinatorMetricsSnapshot};
use crate::directory::EndpointDirectory;
use crate::relay::{RelayMetrics, RelayMetricsSnapshot};

/// Health check state
pub struct HealthState {
    pub coordinator_metrics: Arc<CoordinatorMetrics>,
    pub relay_metrics: Arc<RelayMetrics>,
    pub directory: Arc<EndpointDirectory>,
    pub start_time: Instant,
    pub server_id: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub server_id: String,
    pub uptime_secs: u64,
    pub registered_clients: usize,
    pub coordinator: CoordinatorMetricsSnapshot,
    pub relay: RelayMetricsSnapshot,
}

/// Liveness probe - just checks if server is running
async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe - checks if server can accept connections
async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ready",
        server_id: state.server_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        registered_clients: state.directory.len(),
        coordinator: state.coordinator_metrics.snapshot(),
        relay: state.relay_metrics.snapshot(),
    };

    (StatusCode::OK, Json(response))
}

/// Detailed health check with metrics
async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy",
        server_id: state.server_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        registered_clients: state.directory.len(),
        coordinator: state.coordinator_metrics.snapshot(),
        relay: state.relay_metrics.snapshot(),
    };

    (StatusCode::OK, Json(response))
}

/// Prometheus-compatible metrics endpoint
async fn prometheus_metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let coordinator = state.coordinator_metrics.snapshot();
    let relay = state.relay_metrics.snapshot();
    let registered_clients = state.directory.len();

    let output = format!(
        r#"# HELP natpunch_active_connections Current number of coordinator connections
# TYPE natpunch_active_connections gauge
natpunch_active_connections{{server_id="{server_id}"}} {active_connections}

# HELP natpunch_total_connections Total coordinator connections since start
# TYPE natpunch_total_connections counter
natpunch_total_connections{{server_id="{server_id}"}} {total_connections}

# HELP natpunch_registrations Total TCP registrations accepted
# TYPE natpunch_registrations counter
natpunch_registrations{{server_id="{server_id}"}} {registrations}

# HELP natpunch_datagrams_received Total datagrams read from the relay socket
# TYPE natpunch_datagrams_received counter
natpunch_datagrams_received{{server_id="{server_id}"}} {datagrams_received}

# HELP natpunch_relayed Total relay payloads forwarded
# TYPE natpunch_relayed counter
natpunch_relayed{{server_id="{server_id}"}} {relayed}

# HELP natpunch_unknown_target Relay payloads dropped for unknown targets
# TYPE natpunch_unknown_target counter
natpunch_unknown_target{{server_id="{server_id}"}} {unknown_target}

# HELP natpunch_mapping_updates Total NAT mapping upserts
# TYPE natpunch_mapping_updates counter
natpunch_mapping_updates{{server_id="{server_id}"}} {mapping_updates}

# HELP natpunch_punch_requests Total punch-through nudges sent
# TYPE natpunch_punch_requests counter
natpunch_punch_requests{{server_id="{server_id}"}} {punch_requests}

# HELP natpunch_registered_clients Current number of NAT mappings
# TYPE natpunch_registered_clients gauge
natpunch_registered_clients{{server_id="{server_id}"}} {registered_clients}

# HELP natpunch_uptime_seconds Server uptime in seconds
# TYPE natpunch_uptime_seconds gauge
natpunch_uptime_seconds{{server_id="{server_id}"}} {uptime}
"#,
        server_id = state.server_id,
        active_connections = coordinator.active_connections,
        total_connections = coordinator.total_connections,
        registrations = coordinator.registrations,
        datagrams_received = relay.datagrams_received,
        relayed = relay.relayed,
        unknown_target = relay.unknown_target,
        mapping_updates = relay.mapping_updates,
        punch_requests = relay.punch_requests,
        registered_clients = registered_clients,
        uptime = state.start_time.elapsed().as_secs(),
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        output,
    )
}

/// Create the health check router
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/livez", get(liveness))
        .route("/readyz", get(readiness))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Run the health check HTTP server
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> anyhow::Result<()> {
    let app = health_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "Health check server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
