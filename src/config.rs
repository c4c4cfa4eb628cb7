//! Controller configuration
//!
//! All tunables of the driver live in a single [`ControllerConfig`] supplied
//! once at construction and immutable thereafter. Configuration can be built
//! directly, or loaded from a YAML/TOML/JSON file merged with
//! `LOCKER_RELAY_`-prefixed environment variables.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Environment variable prefix for configuration overrides
const ENV_PREFIX: &str = "LOCKER_RELAY_";

/// Relay controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0"); a stable /dev/serial/by-id
    /// link is preferred over this path when one can be resolved
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-command response timeout in milliseconds
    pub timeout_ms: u64,
    /// How long a solenoid stays energized during a pulse, in milliseconds
    pub pulse_duration_ms: u64,
    /// Total window of repeated pulsing in burst mode, in seconds
    pub burst_duration_seconds: u64,
    /// Spacing between burst pulses, in milliseconds
    pub burst_interval_ms: u64,
    /// Minimum quiescence between bus transactions, in milliseconds
    pub command_interval_ms: u64,
    /// Maximum retry attempts per command
    pub max_retries: u32,
    /// Initial retry backoff delay, in milliseconds
    pub retry_delay_base_ms: u64,
    /// Retry backoff cap, in milliseconds
    pub retry_delay_max_ms: u64,
    /// Consecutive health-probe failures before the bus is marked degraded
    pub connection_retry_attempts: u32,
    /// Health probe period, in milliseconds
    pub health_check_interval_ms: u64,
    /// Read the coil back after each write and require it to match
    pub verify_writes: bool,
    /// Batch same-board actuations into one write-multiple-coils transaction
    pub use_multiple_coils: bool,
    /// Use the vendor timed-pulse command and let board firmware de-energize
    /// the relay. Unverified contract; the software-timed OFF path is the
    /// always-safe default.
    pub firmware_pulse: bool,
    /// Replace the serial port with an in-memory transport (simulation)
    pub test_mode: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout_ms: 1000,
            pulse_duration_ms: 500,
            burst_duration_seconds: 3,
            burst_interval_ms: 200,
            command_interval_ms: 50,
            max_retries: 3,
            retry_delay_base_ms: 100,
            retry_delay_max_ms: 2000,
            connection_retry_attempts: 3,
            health_check_interval_ms: 5000,
            verify_writes: true,
            use_multiple_coils: false,
            firmware_pulse: false,
            test_mode: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a file, merged with `LOCKER_RELAY_*`
    /// environment variables (environment wins).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RelayError::Config("Invalid file extension".to_string()))?;

        let figment = match extension {
            "json" => Figment::new().merge(Json::file(path)),
            "toml" => Figment::new().merge(Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            _ => {
                return Err(RelayError::Config(format!(
                    "Unsupported config format: {extension}"
                )))
            },
        };

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `LOCKER_RELAY_*` environment variables alone.
    pub fn from_env() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(RelayError::Config("Port path cannot be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(RelayError::Config(
                "Baud rate must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(RelayError::Config(
                "Timeout must be greater than zero".to_string(),
            ));
        }
        if self.pulse_duration_ms == 0 {
            return Err(RelayError::Config(
                "Pulse duration must be greater than zero".to_string(),
            ));
        }
        if self.retry_delay_base_ms > self.retry_delay_max_ms {
            return Err(RelayError::Config(
                "Retry delay base must not exceed the cap".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-command response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pulse window
    pub fn pulse_duration(&self) -> Duration {
        Duration::from_millis(self.pulse_duration_ms)
    }

    /// Inter-command quiescence
    pub fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms)
    }

    /// Health probe period
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Pulse duration expressed in the vendor firmware's 100 ms ticks,
    /// rounded up so a short pulse never truncates to zero.
    pub fn pulse_duration_ticks(&self) -> u16 {
        self.pulse_duration_ms.div_ceil(100).max(1) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.pulse_duration_ms, 500);
        assert_eq!(config.command_interval_ms, 50);
        assert_eq!(config.max_retries, 3);
        assert!(config.verify_writes);
        assert!(!config.use_multiple_coils);
        assert!(!config.firmware_pulse);
        assert!(!config.test_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = ControllerConfig::default();
        config.port = String::new();
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.pulse_duration_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.retry_delay_base_ms = 5000;
        config.retry_delay_max_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pulse_duration_ticks() {
        let mut config = ControllerConfig::default();
        assert_eq!(config.pulse_duration_ticks(), 5); // 500ms

        config.pulse_duration_ms = 50;
        assert_eq!(config.pulse_duration_ticks(), 1); // rounds up, never 0

        config.pulse_duration_ms = 1000;
        assert_eq!(config.pulse_duration_ticks(), 10);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("create temp config");
        writeln!(file, "port: /dev/ttyS3").expect("write temp config");
        writeln!(file, "baud_rate: 19200").expect("write temp config");
        writeln!(file, "pulse_duration_ms: 300").expect("write temp config");

        let config = ControllerConfig::from_file(file.path()).expect("load config");
        assert_eq!(config.port, "/dev/ttyS3");
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.pulse_duration_ms, 300);
        // Untouched fields keep their defaults
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = tempfile::Builder::new()
            .suffix(".ini")
            .tempfile()
            .expect("create temp config");
        let result = ControllerConfig::from_file(file.path());
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
