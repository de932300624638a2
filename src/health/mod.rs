// Health module - HTTP surface for liveness, metrics and the last backup time

use crate::error::{KeeperError, Result};
use crate::metrics::Metrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long the liveness probe waits for the managed server to accept
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    metrics: Arc<Metrics>,
    server_addr: Arc<str>,
    probe_timeout: Duration,
}

impl HealthState {
    pub fn new(metrics: Arc<Metrics>, server_addr: impl Into<Arc<str>>) -> Self {
        Self {
            metrics,
            server_addr: server_addr.into(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics_snapshot))
        .route("/lastbackup", get(last_backup))
        .with_state(state)
}

/// GET /status - Healthy when the managed server accepts TCP connections
async fn status(State(state): State<HealthState>) -> Response {
    match probe(&state.server_addr, state.probe_timeout).await {
        Ok(()) => (StatusCode::OK, "healthy").into_response(),
        Err(reason) => {
            debug!("Liveness probe failed: {}", reason);
            (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
        }
    }
}

/// GET /metrics - Prometheus text exposition of all counters
async fn metrics_snapshot(State(state): State<HealthState>) -> Response {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response()
}

/// GET /lastbackup - Time of the last successful backup
async fn last_backup(State(state): State<HealthState>) -> Response {
    match state.metrics.last_backup().await {
        Some(at) => at.to_rfc3339().into_response(),
        None => "never".into_response(),
    }
}

/// Try to open a TCP connection to `addr`
pub async fn probe(addr: &str, timeout: Duration) -> std::result::Result<(), String> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("dial tcp {}: {}", addr, e)),
        Err(_) => Err(format!("dial tcp {}: timed out after {:?}", addr, timeout)),
    }
}

/// Bound HTTP listener, ready to serve
pub struct HealthServer {
    listener: TcpListener,
    state: HealthState,
}

impl HealthServer {
    /// Bind on all interfaces at `port`
    pub async fn bind(port: u16, state: HealthState) -> Result<Self> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], port)), state).await
    }

    pub async fn bind_addr(addr: SocketAddr, state: HealthState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| KeeperError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `token` is cancelled
    pub async fn serve(self, token: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Health and metrics listening on http://{}", addr);

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .map_err(|e| KeeperError::Http(e.to_string()))?;

        info!("Health and metrics listener stopped");
        Ok(())
    }
}
