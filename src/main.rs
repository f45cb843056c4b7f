use anyhow::Context;
use paas_app::server::{shutdown_channel, TerminationSignals};
use paas_app::{Config, Service, ShutdownOutcome};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting paas-app");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e).context("invalid configuration");
        }
    };
    info!(
        port = config.port,
        metrics_port = config.metrics_port,
        metrics_path = %config.metrics_path,
        postgresql = config.postgresql_url.is_some(),
        "Configuration loaded"
    );

    // Registered before binding so a failure aborts startup
    let mut signals = TerminationSignals::register().context("cannot register signal handlers")?;

    // No degraded mode without a listener: a bind failure ends the process
    let service = match Service::bind(config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to start service");
            return Err(e.into());
        }
    };

    // Create shutdown channel for coordinated shutdown
    let (shutdown_controller, mut shutdown_signal) = shutdown_channel();
    tokio::spawn(async move {
        let signal = signals.recv().await;
        info!(signal = signal, "Initiating graceful shutdown");
        shutdown_controller.shutdown();
    });

    match service.run(async move { shutdown_signal.wait().await }).await {
        Ok(ShutdownOutcome::Drained) => info!("Graceful shutdown complete"),
        Ok(ShutdownOutcome::TimedOut) => warn!("Shutdown complete, some requests were abandoned"),
        Err(e) => {
            error!(error = %e, "Service failed");
            return Err(e.into());
        }
    }

    Ok(())
}
