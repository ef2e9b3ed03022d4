//! Infrastructure shared by the server crates: the configuration
//! layer and diagnostic logging bootstrap.

pub mod config;
pub mod diagnostic_logging;

pub use config::{Config, ConfigError, TimeOfDay};
pub use diagnostic_logging::{
    recent_logs, set_diagnostic_log_filter, DiagnosticFormat, LoggingConfig, RecentLogBuffer,
};
