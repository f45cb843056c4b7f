//! Listener setup and the serve/drain loop
//!
//! `Service::bind` is the `Starting` phase: every listener is bound before
//! any request is accepted, and a bind failure is returned to the caller.
//! `Service::run` covers `Serving`, `Draining`, and `Stopped`.

use crate::config::{validate_metrics_path, Config, ConfigError};
use crate::database::{DatabaseProbe, PostgresProbe};
use crate::server::handlers::{app_router, conflicts_with_app_routes, metrics_router, AppState};
use crate::server::lifecycle::Lifecycle;
use crate::server::metrics::{create_metrics, SharedMetrics};
use crate::server::shutdown::{shutdown_channel, ShutdownSignal};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics path {0} collides with an application route")]
    MetricsPathConflict(String),

    #[error("failed to set up metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("{role} server stopped unexpectedly: {reason}")]
    ServerExited { role: &'static str, reason: String },
}

/// How the drain phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request finished within the drain timeout
    Drained,
    /// The drain timeout elapsed and remaining requests were abandoned
    TimedOut,
}

/// A bound, not yet serving, HTTP service
pub struct Service {
    config: Arc<Config>,
    metrics: SharedMetrics,
    lifecycle: Lifecycle,
    probe: Arc<dyn DatabaseProbe>,
    app_listener: TcpListener,
    app_addr: SocketAddr,
    metrics_listener: Option<(TcpListener, SocketAddr)>,
}

impl Service {
    /// Bind the listeners using a PostgreSQL probe built from `config`
    pub async fn bind(config: Config) -> Result<Self, ServiceError> {
        let probe = Arc::new(PostgresProbe::from_config(&config));
        Self::bind_with_probe(config, probe).await
    }

    /// Bind the listeners with a caller-supplied database probe
    pub async fn bind_with_probe(
        config: Config,
        probe: Arc<dyn DatabaseProbe>,
    ) -> Result<Self, ServiceError> {
        // Fields are public, so a hand-built config is checked again here
        validate_metrics_path(&config.metrics_path)?;
        let shared = config.metrics_shared();
        if shared && conflicts_with_app_routes(&config.metrics_path) {
            return Err(ServiceError::MetricsPathConflict(config.metrics_path));
        }

        let lifecycle = Lifecycle::new();
        let metrics = create_metrics()?;

        let (app_listener, app_addr) =
            bind_listener("application", config.bind_address, config.port).await?;

        let metrics_listener = if shared {
            info!(path = %config.metrics_path, "Metrics served on the application listener");
            None
        } else {
            let (listener, addr) =
                bind_listener("metrics", config.bind_address, config.metrics_port).await?;
            info!(path = %config.metrics_path, "Metrics served on a dedicated listener");
            Some((listener, addr))
        };

        Ok(Self {
            config: Arc::new(config),
            metrics,
            lifecycle,
            probe,
            app_listener,
            app_addr,
            metrics_listener,
        })
    }

    /// Address the application listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.app_addr
    }

    /// Address metrics are scraped from (same as `local_addr` when shared)
    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_listener
            .as_ref()
            .map(|(_, addr)| *addr)
            .unwrap_or(self.app_addr)
    }

    /// Handle to this instance's metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Handle to this instance's lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Serve until `shutdown` completes, then drain
    ///
    /// After `shutdown` resolves no new connections are accepted. In-flight
    /// requests get `drain_timeout` to finish; after that every open
    /// connection is dropped and `ShutdownOutcome::TimedOut` is returned.
    pub async fn run<F>(self, shutdown: F) -> Result<ShutdownOutcome, ServiceError>
    where
        F: Future<Output = ()> + Send,
    {
        let Service {
            config,
            metrics,
            lifecycle,
            probe,
            app_listener,
            app_addr,
            metrics_listener,
        } = self;

        let (drain_controller, drain_signal) = shutdown_channel();
        let mut servers = JoinSet::new();

        let state = AppState::new(config.clone(), metrics.clone(), lifecycle.clone(), probe);
        servers.spawn(serve_listener(
            "application",
            app_listener,
            app_router(state),
            drain_signal,
        ));
        info!(addr = %app_addr, "Application server listening");

        if let Some((listener, addr)) = metrics_listener {
            servers.spawn(serve_listener(
                "metrics",
                listener,
                metrics_router(metrics.clone(), &config.metrics_path),
                drain_controller.signal(),
            ));
            info!(addr = %addr, "Metrics server listening");
        }

        lifecycle.mark_serving();

        tokio::select! {
            _ = shutdown => {}
            Some(joined) = servers.join_next() => {
                // A server only returns on its own if something broke
                let (role, reason) = match joined {
                    Ok(role) => (role, "accept loop returned".to_string()),
                    Err(e) => ("unknown", e.to_string()),
                };
                error!(role, reason = %reason, "Server exited before shutdown");
                servers.abort_all();
                lifecycle.mark_stopped();
                return Err(ServiceError::ServerExited { role, reason });
            }
        }

        if lifecycle.begin_draining() {
            info!(
                in_flight = metrics.in_flight(),
                timeout = ?config.drain_timeout,
                "Draining in-flight requests"
            );
        }
        drain_controller.shutdown();

        let drained = tokio::time::timeout(config.drain_timeout, async {
            while let Some(joined) = servers.join_next().await {
                match joined {
                    Ok(role) => info!(role, "All connections closed"),
                    Err(e) => warn!(error = %e, "Server task failed during drain"),
                }
            }
        })
        .await;

        let outcome = match drained {
            Ok(()) => ShutdownOutcome::Drained,
            Err(_) => {
                warn!(
                    in_flight = metrics.in_flight(),
                    timeout = ?config.drain_timeout,
                    "Drain timeout elapsed, abandoning remaining requests"
                );
                // Each server task owns its connection tasks, so aborting it
                // drops them too and closes their sockets
                servers.abort_all();
                while servers.join_next().await.is_some() {}
                ShutdownOutcome::TimedOut
            }
        };

        lifecycle.mark_stopped();
        Ok(outcome)
    }
}

async fn bind_listener(
    role: &'static str,
    ip: std::net::IpAddr,
    port: u16,
) -> Result<(TcpListener, SocketAddr), ServiceError> {
    let addr = SocketAddr::new(ip, port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServiceError::Bind { role, addr, source })?;
    let local = listener
        .local_addr()
        .map_err(|source| ServiceError::Bind { role, addr, source })?;
    Ok((listener, local))
}

/// Accept connections until `drain` fires, then wait for the open ones
///
/// Connection tasks live in a `JoinSet` owned by this future. Dropping the
/// future (for example by aborting its task) aborts every connection.
async fn serve_listener(
    role: &'static str,
    listener: TcpListener,
    router: Router,
    mut drain: ShutdownSignal,
) -> &'static str {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = drain.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(role, peer = %peer, "Accepted connection");
                    connections.spawn(serve_connection(stream, router.clone(), drain.clone()));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!(role, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(role, open = connections.len(), "Listener closed, waiting for connections");
    while connections.join_next().await.is_some() {}
    role
}

/// Serve one HTTP/1.1 connection, finishing the current request on drain
async fn serve_connection(stream: TcpStream, router: Router, mut drain: ShutdownSignal) {
    let service = TowerToHyperService::new(router);
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = drain.wait() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        if !(e.is_closed() || e.is_incomplete_message()) {
            debug!(error = %e, "Connection closed with error");
        }
    }
}

#[cfg(test)]
#[path = "service_test.rs"]
mod tests;
