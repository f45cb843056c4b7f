//! HTTP server for application and metrics endpoints
//!
//! Provides:
//! - The application handlers (greeting, configuration reflection, database status)
//! - Kubernetes-style health probes (`/healthz`, `/readyz`)
//! - Prometheus metrics, on the application port or a dedicated one
//!
//! Also provides graceful shutdown with a bounded drain.

mod handlers;
pub mod lifecycle;
mod metrics;
mod service;
pub mod shutdown;

pub use handlers::{
    app_router, conflicts_with_app_routes, metrics_router, AppState, APP_ROUTES, ROW_COUNT_HEADER,
};
pub use lifecycle::{Lifecycle, ServiceState};
pub use metrics::{create_metrics, InFlightGuard, ServiceMetrics, SharedMetrics};
pub use service::{Service, ServiceError, ShutdownOutcome};
pub use shutdown::{shutdown_channel, ShutdownController, ShutdownSignal, TerminationSignals};

#[cfg(test)]
#[path = "handlers_test.rs"]
mod handlers_tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
