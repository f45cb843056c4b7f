//! HTTP handlers and routers
//!
//! Application listener:
//! - `/` - Greeting for any method; unmatched paths get it too (counted)
//! - `/env` - All `APP_*` configuration captured at startup (counted)
//! - `/env/{name}` - One configuration option as a JSON string or `null` (counted)
//! - `/sleep?duration=N` - Holds the request for N seconds (counted)
//! - `/postgresql/status` - On-demand database check, `SUCCESS` or `FAILURE`
//! - `/postgresql/migratestatus` - Same check, used after migrations
//! - `/healthz` - Liveness probe
//! - `/readyz` - Readiness probe, 200 only while serving
//! - metrics path - Only when metrics share this listener (counted)
//!
//! Metrics listener (separate port):
//! - metrics path - Prometheus text format (not counted)

use crate::config::Config;
use crate::database::{DatabaseProbe, PROBE_TABLE};
use crate::server::lifecycle::Lifecycle;
use crate::server::metrics::SharedMetrics;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response header carrying the row count of a successful database check
pub const ROW_COUNT_HEADER: &str = "x-row-count";

/// Paths served by the application router
///
/// A shared metrics path must not collide with any of these, or fall under
/// `/env/`.
pub const APP_ROUTES: &[&str] = &[
    "/",
    "/env",
    "/sleep",
    "/postgresql/status",
    "/postgresql/migratestatus",
    "/healthz",
    "/readyz",
];

/// Whether a shared metrics path would overlap an application route
pub fn conflicts_with_app_routes(path: &str) -> bool {
    APP_ROUTES.contains(&path) || path.starts_with("/env/")
}

/// State shared by all application handlers
///
/// Clone is cheap; every field is reference-counted.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    metrics: SharedMetrics,
    lifecycle: Lifecycle,
    probe: Arc<dyn DatabaseProbe>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        metrics: SharedMetrics,
        lifecycle: Lifecycle,
        probe: Arc<dyn DatabaseProbe>,
    ) -> Self {
        Self {
            config,
            metrics,
            lifecycle,
            probe,
        }
    }

    fn count(&self) {
        let count = self.metrics.record_request();
        debug!(count, "Request counted");
    }
}

/// Greeting handler, also the fallback for unmatched paths
async fn hello(State(state): State<AppState>) -> String {
    state.count();
    state.config.greeting.clone()
}

/// Configuration reflection for a single option
///
/// Always 200; an unset option is JSON `null`.
async fn env_value(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<Option<String>> {
    state.count();
    Json(state.config.app_value(&name).map(str::to_string))
}

/// Every `APP_*` variable captured at startup
async fn env_all(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    state.count();
    Json(state.config.app_config().clone())
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    duration: u64,
}

/// Hold the request open for `duration` seconds
///
/// A missing or non-numeric duration is rejected with 400 by the extractor.
async fn sleep(State(state): State<AppState>, Query(params): Query<SleepParams>) -> StatusCode {
    state.count();
    tokio::time::sleep(Duration::from_secs(params.duration)).await;
    StatusCode::OK
}

/// Database status handler
///
/// Never fails the request: any probe error is logged and reported as
/// `FAILURE` with 200, so one broken dependency cannot affect other traffic.
async fn postgresql_status(State(state): State<AppState>) -> Response {
    match state.probe.check().await {
        Ok(report) => {
            info!(version = %report.server_version, "PostgreSQL version");
            info!(table = PROBE_TABLE, rows = report.row_count, "PostgreSQL row count");
            let mut response = "SUCCESS".into_response();
            if let Ok(value) = HeaderValue::from_str(&report.row_count.to_string()) {
                response.headers_mut().insert(ROW_COUNT_HEADER, value);
            }
            response
        }
        Err(e) => {
            warn!(error = %e, "PostgreSQL status check failed");
            "FAILURE".into_response()
        }
    }
}

/// Liveness probe handler
///
/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe handler
///
/// Returns 200 OK while serving, 503 Service Unavailable otherwise.
async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn render_metrics(metrics: &SharedMetrics) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Metrics served from the application listener; the scrape is a request too
async fn shared_metrics(State(state): State<AppState>) -> Response {
    state.count();
    render_metrics(&state.metrics)
}

/// Metrics served from the dedicated listener
async fn dedicated_metrics(State(metrics): State<SharedMetrics>) -> Response {
    render_metrics(&metrics)
}

/// Middleware keeping `http_requests_in_flight` current
async fn track_in_flight(
    State(metrics): State<SharedMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = metrics.track_in_flight();
    next.run(request).await
}

/// Build the router for the application listener
pub fn app_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let shared_metrics_path = state
        .config
        .metrics_shared()
        .then(|| state.config.metrics_path.clone());

    let mut router = Router::new()
        .route("/", any(hello))
        .route("/env", get(env_all))
        .route("/env/{name}", get(env_value))
        .route("/sleep", get(sleep))
        .route("/postgresql/status", get(postgresql_status))
        .route("/postgresql/migratestatus", get(postgresql_status))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));

    if let Some(path) = shared_metrics_path {
        router = router.route(&path, get(shared_metrics));
    }

    router
        .fallback(hello)
        .layer(middleware::from_fn_with_state(metrics, track_in_flight))
        .with_state(state)
}

/// Build the router for the dedicated metrics listener
pub fn metrics_router(metrics: SharedMetrics, path: &str) -> Router {
    Router::new()
        .route(path, get(dedicated_metrics))
        .layer(middleware::from_fn_with_state(
            metrics.clone(),
            track_in_flight,
        ))
        .with_state(metrics)
}
