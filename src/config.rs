/// Client configuration
///
/// Values are layered: built-in defaults, then an optional TOML/JSON file,
/// then `DOCSTORE_*` environment variables (`DOCSTORE_MAX_OPERATION_ATTEMPTS=3`).
use crate::connection::ReconnectConfig;
use crate::error::ExponentialBackoff;
use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DOCSTORE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interval between health probes
    pub health_check_interval_ms: u64,

    /// Upper bound on a single pending-writes probe
    pub probe_timeout_ms: u64,

    /// Failed reconnection episodes allowed before the state becomes terminal
    pub max_reconnection_attempts: u32,

    /// Pause after listener teardown, before the network cycle starts
    pub settle_delay_ms: u64,

    /// Pause after disabling and after re-enabling the network
    pub network_cycle_delay_ms: u64,

    /// Attempts per read/write operation, the first one included
    pub max_operation_attempts: u32,

    pub backoff_base_ms: u64,

    pub backoff_cap_ms: u64,

    /// Fraction (0.0 - 1.0) of each backoff delay that may be randomly shaved off
    pub backoff_jitter: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            probe_timeout_ms: 10_000,
            max_reconnection_attempts: 5,
            settle_delay_ms: 1_000,
            network_cycle_delay_ms: 1_000,
            max_operation_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 10_000,
            backoff_jitter: 0.0,
        }
    }
}

impl ClientConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to assemble client configuration")?;

        let config: ClientConfig = settings
            .try_deserialize()
            .context("Invalid client configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Per-user configuration file (e.g. `~/.config/resilient-docstore/client.toml`)
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "resilient-docstore")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_operation_attempts > 0,
            "max_operation_attempts must be at least 1"
        );
        ensure!(
            self.max_reconnection_attempts > 0,
            "max_reconnection_attempts must be at least 1"
        );
        ensure!(
            self.health_check_interval_ms > 0,
            "health_check_interval_ms must be positive"
        );
        ensure!(
            self.backoff_cap_ms >= self.backoff_base_ms,
            "backoff_cap_ms ({}) must not be below backoff_base_ms ({})",
            self.backoff_cap_ms,
            self.backoff_base_ms
        );
        ensure!(
            (0.0..=1.0).contains(&self.backoff_jitter),
            "backoff_jitter must be within 0.0..=1.0, got {}",
            self.backoff_jitter
        );
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn network_cycle_delay(&self) -> Duration {
        Duration::from_millis(self.network_cycle_delay_ms)
    }

    /// Backoff policy for store operations
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
        .with_jitter(self.backoff_jitter)
    }

    /// Timing and budget for reconnection episodes
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: self.max_reconnection_attempts,
            settle_delay: self.settle_delay(),
            cycle_delay: self.network_cycle_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.max_reconnection_attempts, 5);
        assert_eq!(config.max_operation_attempts, 5);
        assert!(config.validate().is_ok());

        let backoff = config.backoff();
        assert_eq!(backoff.next_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(4), Duration::from_secs(10));

        let reconnect = config.reconnect();
        assert_eq!(reconnect.max_attempts, 5);
        assert_eq!(reconnect.settle_delay, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_operation_attempts = 3").unwrap();
        writeln!(file, "settle_delay_ms = 250").unwrap();

        let config = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.max_operation_attempts, 3);
        assert_eq!(config.settle_delay(), Duration::from_millis(250));
        assert_eq!(config.backoff_cap_ms, 10_000);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("DOCSTORE_MAX_RECONNECTION_ATTEMPTS", "2");
        let config = ClientConfig::load(None);
        std::env::remove_var("DOCSTORE_MAX_RECONNECTION_ATTEMPTS");

        assert_eq!(config.unwrap().max_reconnection_attempts, 2);
    }

    #[test]
    #[serial]
    fn test_missing_file_is_an_error() {
        let result = ClientConfig::load(Some(Path::new("/nonexistent/docstore/client.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ClientConfig {
            max_operation_attempts: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            backoff_base_ms: 20_000,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            backoff_jitter: 1.5,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
