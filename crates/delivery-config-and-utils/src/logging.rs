//! Logging initialization for the delivery tracker binary.
//!
//! Thin wrapper over the observability crate: compact stderr output by
//! default, plus structured JSONL to a log file when one is given.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

pub use observability::LogConfig;

/// Service name written into every JSONL log line.
pub const SERVICE_NAME: &str = "delivery-tracker";

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `log_file` set, logs go
/// to that file as JSONL and a compact copy still goes to stderr.
///
/// ```ignore
/// init_logging("info", Some(paths.log_file()))?;
/// tracing::info!("Tracker started");
/// ```
pub fn init_logging(level: &str, log_file: Option<PathBuf>) -> CoreResult<()> {
    observability::init_with_config(LogConfig {
        service_name: SERVICE_NAME.into(),
        default_level: level.into(),
        also_stderr: true,
        log_path: log_file,
    })
    .map_err(|e| CoreError::Config(format!("failed to initialize logging: {}", e)))
}
