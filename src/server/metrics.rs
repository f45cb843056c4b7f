//! Prometheus metrics for the service
//!
//! Each `Service` owns its own registry, so tests can run several isolated
//! instances in one process:
//! - `request_count` - requests handled by the application handlers
//! - `http_requests_in_flight` - requests currently executing
//! - `process_*` - CPU, memory, and file descriptor usage (Linux only)

use prometheus::{self, Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Service metrics registry
///
/// Thread-safe container for all Prometheus metrics.
pub struct ServiceMetrics {
    registry: Registry,
    /// Requests handled (atomic, never decreases)
    request_count: IntCounter,
    /// Requests currently being handled on any listener
    in_flight: IntGauge,
}

impl ServiceMetrics {
    /// Create a new registry with the request counter at zero
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_count =
            IntCounter::with_opts(Opts::new("request_count", "No of request handled"))?;
        registry.register(Box::new(request_count.clone()))?;

        let in_flight = IntGauge::with_opts(Opts::new(
            "http_requests_in_flight",
            "Number of HTTP requests currently being handled",
        ))?;
        registry.register(Box::new(in_flight.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            request_count,
            in_flight,
        })
    }

    /// Count one handled request
    pub fn record_request(&self) -> u64 {
        self.request_count.inc();
        self.request_count.get()
    }

    /// Current value of the request counter
    pub fn request_count(&self) -> u64 {
        self.request_count.get()
    }

    /// Mark a request as in flight until the returned guard is dropped
    pub fn track_in_flight(&self) -> InFlightGuard {
        self.in_flight.inc();
        InFlightGuard {
            gauge: self.in_flight.clone(),
        }
    }

    /// Requests currently executing
    pub fn in_flight(&self) -> i64 {
        self.in_flight.get()
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Decrements the in-flight gauge on drop, including when a request is aborted
pub struct InFlightGuard {
    gauge: IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Shared metrics handle for use across handlers
pub type SharedMetrics = Arc<ServiceMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ServiceMetrics::new()?))
}
