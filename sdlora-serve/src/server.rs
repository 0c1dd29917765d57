//! SageMaker-compatible HTTP surface
//!
//! - `GET /ping`: liveness
//! - `POST /invocations`: generation, `{"result": [uri, ...]}`
//! - `GET /health`: request statistics

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, routing::post, Router};
use parking_lot::{Mutex, RwLock};
use sdlora::RawRequest;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ServeError;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Mutex<Orchestrator>>,
    tracker: Arc<RequestTracker>,
    strict_errors: bool,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let strict_errors = orchestrator.config().strict_errors;
        Self {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            tracker: Arc::new(RequestTracker::new()),
            strict_errors,
        }
    }

    pub fn with_strict_errors(mut self, strict: bool) -> Self {
        self.strict_errors = strict;
        self
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub result: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub request_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_requests: usize,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub average_generation_time_ms: f64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/invocations", post(invocations_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .with_state(state)
}

/// Bind `addr` and serve until SIGINT or SIGTERM
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("sdlora listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn ping_handler() -> StatusCode {
    StatusCode::OK
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.tracker.stats();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
        uptime_seconds: state.tracker.uptime().as_secs(),
        active_requests: stats.active_requests,
        requests_total: stats.total_requests,
        requests_success: stats.successful_requests,
        requests_error: stats.failed_requests,
        average_generation_time_ms: stats.average_response_time_ms(),
    })
}

async fn invocations_handler(
    State(state): State<AppState>,
    Json(raw): Json<RawRequest>,
) -> Result<Json<InvocationResponse>, (StatusCode, Json<ErrorResponse>)> {
    let request_id = Uuid::new_v4().to_string();
    let started = state.tracker.start_request();

    let orchestrator = state.orchestrator.clone();
    let outcome = tokio::task::spawn_blocking(move || orchestrator.lock().try_handle(raw))
        .await
        .map_err(|join| (join.to_string(), "INTERNAL_ERROR"))
        .and_then(|result| {
            result.map_err(|err: ServeError| {
                let code = err.code();
                (format!("{:#}", anyhow::Error::new(err)), code)
            })
        });

    match outcome {
        Ok(uris) => {
            state.tracker.complete_request(started, true);
            Ok(Json(InvocationResponse { result: uris }))
        }
        Err((message, code)) => {
            state.tracker.complete_request(started, false);
            error!(request_id = %request_id, code, "Generation failed: {}", message);
            if state.strict_errors {
                Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: message,
                        code: code.to_string(),
                        request_id,
                    }),
                ))
            } else {
                Ok(Json(InvocationResponse { result: Vec::new() }))
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

/// Request counters for `/health`
#[derive(Debug)]
pub struct RequestTracker {
    start_time: Instant,
    stats: RwLock<RequestStats>,
}

#[derive(Debug, Default, Clone)]
pub struct RequestStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_requests: usize,
    pub total_response_time: Duration,
}

impl RequestStats {
    pub fn average_response_time_ms(&self) -> f64 {
        let finished = self.successful_requests + self.failed_requests;
        if finished == 0 {
            return 0.0;
        }
        self.total_response_time.as_secs_f64() * 1000.0 / finished as f64
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            stats: RwLock::new(RequestStats::default()),
        }
    }

    pub fn start_request(&self) -> Instant {
        let mut stats = self.stats.write();
        stats.total_requests += 1;
        stats.active_requests += 1;
        Instant::now()
    }

    pub fn complete_request(&self, started: Instant, success: bool) {
        let mut stats = self.stats.write();
        stats.active_requests = stats.active_requests.saturating_sub(1);
        stats.total_response_time += started.elapsed();
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn stats(&self) -> RequestStats {
        self.stats.read().clone()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
