//! Configuration management for the delivery tracker.

use crate::{CoreError, CoreResult, Paths};
use delivery_tracker::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variables that override the config file.
const ENV_LOG_LEVEL: &str = "DELIVERY_LOG_LEVEL";
const ENV_DEFAULT_TIMEOUT_MS: &str = "DELIVERY_DEFAULT_TIMEOUT_MS";
const ENV_MAX_TRACKED_EVENTS: &str = "DELIVERY_MAX_TRACKED_EVENTS";
const ENV_CLEANUP_INTERVAL_MS: &str = "DELIVERY_CLEANUP_INTERVAL_MS";
const ENV_MAX_RETRIES: &str = "DELIVERY_MAX_RETRIES";

/// Top-level configuration file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Tracker tuning.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            debug!(path = %config_path.display(), "Loading config file");
            Self::load_from_file(&config_path)?
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default()
        };

        let overrides = config.apply_env_overrides(|name| std::env::var(name).ok())?;
        if !overrides.is_empty() {
            info!(overrides = ?overrides, "Applied environment overrides");
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.tracker
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Override values from `lookup(name)`, normally the process environment.
    ///
    /// Empty values are ignored; unparseable numbers are an error. Returns
    /// the names of the variables that were applied.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> CoreResult<Vec<&'static str>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let mut applied = Vec::new();
        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = log_level;
            applied.push(ENV_LOG_LEVEL);
        }
        if let Some(raw) = lookup(ENV_DEFAULT_TIMEOUT_MS) {
            self.tracker.default_timeout_ms = parse_env(ENV_DEFAULT_TIMEOUT_MS, &raw)?;
            applied.push(ENV_DEFAULT_TIMEOUT_MS);
        }
        if let Some(raw) = lookup(ENV_MAX_TRACKED_EVENTS) {
            self.tracker.max_tracked_events = parse_env(ENV_MAX_TRACKED_EVENTS, &raw)?;
            applied.push(ENV_MAX_TRACKED_EVENTS);
        }
        if let Some(raw) = lookup(ENV_CLEANUP_INTERVAL_MS) {
            self.tracker.cleanup_interval_ms = parse_env(ENV_CLEANUP_INTERVAL_MS, &raw)?;
            applied.push(ENV_CLEANUP_INTERVAL_MS);
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.tracker.default_max_retries = parse_env(ENV_MAX_RETRIES, &raw)?;
            applied.push(ENV_MAX_RETRIES);
        }
        Ok(applied)
    }
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> CoreResult<T> {
    raw.parse()
        .map_err(|_| CoreError::Config(format!("{} has invalid value {:?}", name, raw)))
}
