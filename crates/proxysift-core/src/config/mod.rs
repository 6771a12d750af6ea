//! Run configuration.
//!
//! Every knob the engine exposes lives in one immutable [`ValidatorConfig`]
//! value constructed before the run and passed into the scheduler. There are
//! no ambient globals; components receive the configuration (or the slice of
//! it they need) explicitly.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ports::PortRange;

/// Immutable configuration for one validation run.
///
/// Loadable from a TOML file; every field has a default so an empty document
/// is a valid configuration. Durations accept humantime strings ("4s",
/// "400ms").
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Number of endpoints validated against one spawned core process.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of batches validated concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Local port range the allocator partitions between batches.
    #[serde(default)]
    pub ports: PortRange,

    /// How long a batched core may take to open its first listener.
    #[serde(default = "default_batch_startup_timeout")]
    #[serde(with = "humantime_serde")]
    pub batch_startup_timeout: Duration,

    /// Listener deadline for a singleton fallback core.
    ///
    /// Shorter than the batch deadline: a singleton opens one listener and
    /// there are up to `batch_size` of them to get through.
    #[serde(default = "default_singleton_startup_timeout")]
    #[serde(with = "humantime_serde")]
    pub singleton_startup_timeout: Duration,

    /// Pause between observed readiness and the first probe.
    ///
    /// The core accepts TCP before all outbound circuits are wired up.
    #[serde(default = "default_settle_delay")]
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Overall deadline for one liveness probe.
    #[serde(default = "default_probe_timeout")]
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Connect deadline for one liveness probe.
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Grace period between graceful termination and forced kill.
    #[serde(default = "default_kill_grace")]
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Canonical probe target; the same URL is used for every endpoint.
    #[serde(default = "default_probe_target")]
    pub probe_target: String,

    /// The exact status code that classifies a probe as live.
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

const fn default_batch_size() -> usize {
    50
}

const fn default_workers() -> usize {
    200
}

const fn default_batch_startup_timeout() -> Duration {
    Duration::from_secs(4)
}

const fn default_singleton_startup_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_settle_delay() -> Duration {
    Duration::from_millis(400)
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(11)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_kill_grace() -> Duration {
    Duration::from_millis(200)
}

fn default_probe_target() -> String {
    "https://www.google.com/generate_204".to_string()
}

const fn default_expect_status() -> u16 {
    204
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            ports: PortRange::default(),
            batch_startup_timeout: default_batch_startup_timeout(),
            singleton_startup_timeout: default_singleton_startup_timeout(),
            settle_delay: default_settle_delay(),
            probe_timeout: default_probe_timeout(),
            connect_timeout: default_connect_timeout(),
            kill_grace: default_kill_grace(),
            probe_target: default_probe_target(),
            expect_status: default_expect_status(),
        }
    }
}

impl ValidatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the parsed value fails
    /// [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` when a field is outside its
    /// permitted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Validation(
                "workers must be at least 1".to_string(),
            ));
        }
        self.ports
            .validate()
            .map_err(ConfigError::Validation)?;
        let stride = self.batch_size + crate::ports::PORT_GAP as usize;
        if stride > self.ports.span as usize {
            return Err(ConfigError::Validation(format!(
                "port span {} cannot hold one batch of {} plus the {}-port gap",
                self.ports.span,
                self.batch_size,
                crate::ports::PORT_GAP
            )));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_the_default_config() {
        let config = ValidatorConfig::from_toml("").unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.workers, 200);
        assert_eq!(config.ports.base, 10_000);
        assert_eq!(config.batch_startup_timeout, Duration::from_secs(4));
        assert_eq!(config.expect_status, 204);
    }

    #[test]
    fn parses_humantime_durations() {
        let toml = r#"
            batch_size = 10
            batch_startup_timeout = "2s"
            settle_delay = "100ms"
        "#;
        let config = ValidatorConfig::from_toml(toml).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_startup_timeout, Duration::from_secs(2));
        assert_eq!(config.settle_delay, Duration::from_millis(100));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let result = ValidatorConfig::from_toml("batch_size = 0");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_zero_workers() {
        let result = ValidatorConfig::from_toml("workers = 0");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_batch_larger_than_port_span() {
        let toml = r#"
            batch_size = 100

            [ports]
            base = 10000
            span = 64
        "#;
        let result = ValidatorConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = ValidatorConfig::from_toml("threads = 4");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
