//! Service lifecycle state machine
//!
//! `Starting -> Serving -> Draining -> Stopped`. Transitions only move
//! forward; a repeated request for the same transition is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;

/// Lifecycle phase of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Listeners are being bound
    Starting = 0,
    /// Accepting and handling requests
    Serving = 1,
    /// No new connections; in-flight requests are finishing
    Draining = 2,
    /// Terminal
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::Starting,
            1 => ServiceState::Serving,
            2 => ServiceState::Draining,
            _ => ServiceState::Stopped,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Starting => "Starting",
            ServiceState::Serving => "Serving",
            ServiceState::Draining => "Draining",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Shared lifecycle state
///
/// Clone is cheap (Arc internally); all clones observe the same state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<AtomicU8>,
}

impl Lifecycle {
    /// Create a new lifecycle in `Starting`
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ServiceState::Starting as u8)),
        }
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the service is accepting traffic
    pub fn is_serving(&self) -> bool {
        self.state() == ServiceState::Serving
    }

    /// `Starting -> Serving`
    pub fn mark_serving(&self) -> bool {
        self.transition(ServiceState::Starting, ServiceState::Serving)
    }

    /// `Serving -> Draining`
    ///
    /// Returns true only for the call that performed the transition.
    pub fn begin_draining(&self) -> bool {
        self.transition(ServiceState::Serving, ServiceState::Draining)
    }

    /// Any state -> `Stopped`
    pub fn mark_stopped(&self) {
        let previous = self
            .state
            .swap(ServiceState::Stopped as u8, Ordering::SeqCst);
        if previous != ServiceState::Stopped as u8 {
            info!(
                from = %ServiceState::from_u8(previous),
                to = %ServiceState::Stopped,
                "Service state changed"
            );
        }
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        let changed = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            info!(from = %from, to = %to, "Service state changed");
        }
        changed
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
