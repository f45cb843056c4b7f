pub mod config;
pub mod database;
pub mod server;

// Re-export for main.rs and integration tests
pub use crate::config::{Config, ConfigError};
pub use crate::server::{Service, ServiceError, ShutdownOutcome};
