// rust/split-core/src/config.rs

//! Configuration management for the split service.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SplitError};

// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub client: ClientConfig,
}

/// Dispatcher configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Workers silent for longer than this are evicted and their leases released.
    pub worker_timeout_ms: u64,
    /// Heartbeat interval recommended to workers at registration.
    pub heartbeat_interval_ms: u64,
    /// How often the cluster sweeper checks for timed out workers.
    pub sweep_interval_ms: u64,
    /// Number of consecutive source indices per split.
    pub split_size: u64,
}

/// Worker configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    // Capacity of each task's element channel.
    pub buffer_size: usize,
    // How long a blocked send waits before re-checking the stop flag.
    pub send_timeout_ms: u64,
    // Initial backoff after a repetition that produced no elements.
    pub empty_pass_backoff_ms: u64,
    // Upper bound for the empty-pass backoff.
    pub max_empty_pass_backoff_ms: u64,
    // Hostname reported at registration.
    pub hostname: String,
}

// Client configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    // Silence after which a stream with no live workers is declared failed.
    pub stall_deadline_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            sweep_interval_ms: 1_000,
            split_size: 1,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            send_timeout_ms: 50,
            empty_pass_backoff_ms: 1,
            max_empty_pass_backoff_ms: 50,
            hostname: "localhost".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stall_deadline_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl WorkerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl ClientConfig {
    pub fn stall_deadline(&self) -> Duration {
        Duration::from_millis(self.stall_deadline_ms)
    }
}

impl FromStr for ServiceConfig {
    type Err = SplitError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SplitError::config_with_source("failed to parse TOML config", e))
    }
}

impl ServiceConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SplitError::io_with_source(path, "failed to read config file", e))?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `DSS_` and use underscores
    // to separate nested fields. For example:
    // - `DSS_DISPATCHER_WORKER_TIMEOUT_MS` overrides `dispatcher.worker_timeout_ms`
    // - `DSS_DISPATCHER_SPLIT_SIZE` overrides `dispatcher.split_size`
    // - `DSS_WORKER_BUFFER_SIZE` overrides `worker.buffer_size`
    // - `DSS_CLIENT_STALL_DEADLINE_MS` overrides `client.stall_deadline_ms`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Dispatcher overrides
        if let Ok(val) = std::env::var("DSS_DISPATCHER_WORKER_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.dispatcher.worker_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_DISPATCHER_HEARTBEAT_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.dispatcher.heartbeat_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_DISPATCHER_SWEEP_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.dispatcher.sweep_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_DISPATCHER_SPLIT_SIZE") {
            if let Ok(v) = val.parse() {
                self.dispatcher.split_size = v;
            }
        }

        // Worker overrides
        if let Ok(val) = std::env::var("DSS_WORKER_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.worker.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_WORKER_SEND_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.worker.send_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_WORKER_EMPTY_PASS_BACKOFF_MS") {
            if let Ok(v) = val.parse() {
                self.worker.empty_pass_backoff_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_WORKER_MAX_EMPTY_PASS_BACKOFF_MS") {
            if let Ok(v) = val.parse() {
                self.worker.max_empty_pass_backoff_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DSS_WORKER_HOSTNAME") {
            self.worker.hostname = val;
        }

        // Client overrides
        if let Ok(val) = std::env::var("DSS_CLIENT_STALL_DEADLINE_MS") {
            if let Ok(v) = val.parse() {
                self.client.stall_deadline_ms = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.split_size == 0 {
            return Err(SplitError::config(
                "dispatcher.split_size must be greater than 0",
            ));
        }
        if self.dispatcher.heartbeat_interval_ms == 0 {
            return Err(SplitError::config(
                "dispatcher.heartbeat_interval_ms must be greater than 0",
            ));
        }
        if self.dispatcher.worker_timeout_ms <= self.dispatcher.heartbeat_interval_ms {
            return Err(SplitError::config(
                "dispatcher.worker_timeout_ms must exceed dispatcher.heartbeat_interval_ms",
            ));
        }
        if self.dispatcher.sweep_interval_ms == 0 {
            return Err(SplitError::config(
                "dispatcher.sweep_interval_ms must be greater than 0",
            ));
        }

        if self.worker.buffer_size == 0 {
            return Err(SplitError::config(
                "worker.buffer_size must be greater than 0",
            ));
        }
        if self.worker.send_timeout_ms == 0 {
            return Err(SplitError::config(
                "worker.send_timeout_ms must be greater than 0",
            ));
        }
        if self.worker.max_empty_pass_backoff_ms < self.worker.empty_pass_backoff_ms {
            return Err(SplitError::config(
                "worker.max_empty_pass_backoff_ms must be at least worker.empty_pass_backoff_ms",
            ));
        }

        if self.client.stall_deadline_ms == 0 {
            return Err(SplitError::config(
                "client.stall_deadline_ms must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();

        assert_eq!(config.dispatcher.worker_timeout_ms, 30_000);
        assert_eq!(config.dispatcher.heartbeat_interval_ms, 5_000);
        assert_eq!(config.dispatcher.sweep_interval_ms, 1_000);
        assert_eq!(config.dispatcher.split_size, 1);

        assert_eq!(config.worker.buffer_size, 64);
        assert_eq!(config.worker.send_timeout_ms, 50);
        assert_eq!(config.worker.hostname, "localhost");

        assert_eq!(config.client.stall_deadline_ms, 30_000);
    }

    #[test]
    fn test_default_validates() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: ServiceConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [dispatcher]
            split_size = 8
        "#;
        let config: ServiceConfig = toml.parse().unwrap();

        assert_eq!(config.dispatcher.split_size, 8);
        // Other fields keep their defaults
        assert_eq!(config.dispatcher.worker_timeout_ms, 30_000);
        assert_eq!(config.worker.buffer_size, 64);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [dispatcher]
            worker_timeout_ms = 2000
            heartbeat_interval_ms = 500
            sweep_interval_ms = 250
            split_size = 4

            [worker]
            buffer_size = 16
            send_timeout_ms = 10
            empty_pass_backoff_ms = 2
            max_empty_pass_backoff_ms = 20
            hostname = "node-7"

            [client]
            stall_deadline_ms = 5000
        "#;

        let config: ServiceConfig = toml.parse().unwrap();

        assert_eq!(config.dispatcher.worker_timeout(), Duration::from_secs(2));
        assert_eq!(config.dispatcher.heartbeat_interval_ms, 500);
        assert_eq!(config.dispatcher.sweep_interval(), Duration::from_millis(250));
        assert_eq!(config.dispatcher.split_size, 4);
        assert_eq!(config.worker.buffer_size, 16);
        assert_eq!(config.worker.send_timeout(), Duration::from_millis(10));
        assert_eq!(config.worker.empty_pass_backoff_ms, 2);
        assert_eq!(config.worker.max_empty_pass_backoff_ms, 20);
        assert_eq!(config.worker.hostname, "node-7");
        assert_eq!(config.client.stall_deadline(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<ServiceConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [dispatcher]
            split_size = 3
            "#
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dispatcher.split_size, 3);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = ServiceConfig::from_file("/nonexistent/service.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\nsplit_size = 0").unwrap();

        let result = ServiceConfig::from_file(file.path());
        assert!(result.unwrap_err().to_string().contains("split_size"));
    }

    #[test]
    fn test_validate_timeout_must_exceed_heartbeat() {
        let mut config = ServiceConfig::default();
        config.dispatcher.worker_timeout_ms = config.dispatcher.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_buffer_size() {
        let mut config = ServiceConfig::default();
        config.worker.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let mut config = ServiceConfig::default();
        config.worker.empty_pass_backoff_ms = 100;
        config.worker.max_empty_pass_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_stall_deadline() {
        let mut config = ServiceConfig::default();
        config.client.stall_deadline_ms = 0;
        assert!(config.validate().is_err());
    }

    // Helper to clear all DSS_ environment variables for test isolation
    fn clear_dss_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("DSS_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_dss_env_vars();

        std::env::set_var("DSS_DISPATCHER_SPLIT_SIZE", "16");
        std::env::set_var("DSS_DISPATCHER_WORKER_TIMEOUT_MS", "9000");
        std::env::set_var("DSS_WORKER_BUFFER_SIZE", "8");
        std::env::set_var("DSS_WORKER_HOSTNAME", "edge-1");
        std::env::set_var("DSS_CLIENT_STALL_DEADLINE_MS", "1234");
        std::env::set_var("DSS_WORKER_MAX_EMPTY_PASS_BACKOFF_MS", "250");

        let config = ServiceConfig::default().with_env_overrides();

        assert_eq!(config.dispatcher.split_size, 16);
        assert_eq!(config.dispatcher.worker_timeout_ms, 9000);
        assert_eq!(config.worker.buffer_size, 8);
        assert_eq!(config.worker.hostname, "edge-1");
        assert_eq!(config.client.stall_deadline_ms, 1234);
        assert_eq!(config.worker.max_empty_pass_backoff_ms, 250);

        clear_dss_env_vars();

        // Invalid values are ignored
        std::env::set_var("DSS_WORKER_BUFFER_SIZE", "not_a_number");
        let config = ServiceConfig::default().with_env_overrides();
        assert_eq!(config.worker.buffer_size, 64);

        clear_dss_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = ServiceConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: ServiceConfig = toml_str.parse().unwrap();

        assert_eq!(original.dispatcher.split_size, parsed.dispatcher.split_size);
        assert_eq!(original.worker.hostname, parsed.worker.hostname);
        assert_eq!(original.client.stall_deadline_ms, parsed.client.stall_deadline_ms);
    }
}
