//! Monitor configuration.
//!
//! Every window the monitor keeps is bounded; [`MonitorConfig`] holds those
//! bounds. Defaults match the detector the monitor was built for (832
//! pixels, 100 s of rate history, 1000 ADC samples).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on the inbound receive wait so the per-second tick is never
/// starved by an idle transport.
pub const MAX_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacities and timing for the monitor.
///
/// # Example
///
/// ```rust
/// use pixmon::config::MonitorConfig;
///
/// let config: MonitorConfig = serde_json::from_str(r#"{ "pixel_count": 1024 }"#).unwrap();
/// assert_eq!(config.pixel_count, 1024);
/// assert_eq!(config.rate_history_capacity, 100);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Size of the per-pixel rate tables.
    pub pixel_count: usize,
    /// Raw records kept for inspection and the average rate.
    pub raw_capacity: usize,
    /// Per-second totals kept in the rate history.
    pub rate_history_capacity: usize,
    /// ADC samples kept for the live histogram.
    pub adc_capacity: usize,
    /// Records included in each snapshot, newest first.
    pub recent_records: usize,
    /// Messages included in each snapshot, newest first.
    pub recent_messages: usize,
    /// Messages kept in the message log.
    pub message_capacity: usize,
    /// Bounded wait for one inbound message, in milliseconds.
    pub receive_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pixel_count: 832,
            raw_capacity: 100_000,
            rate_history_capacity: 100,
            adc_capacity: 1000,
            recent_records: 100,
            recent_messages: 100,
            message_capacity: 10_000,
            receive_timeout_ms: 500,
        }
    }
}

impl MonitorConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] / [`ConfigError::Parse`] if the file
    /// cannot be read or parsed, or any validation error.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every window can hold data and the receive wait is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroCapacity`] for an empty window or
    /// [`ConfigError::ReceiveTimeout`] for a wait of zero or above one second.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("pixel_count", self.pixel_count),
            ("raw_capacity", self.raw_capacity),
            ("rate_history_capacity", self.rate_history_capacity),
            ("adc_capacity", self.adc_capacity),
            ("message_capacity", self.message_capacity),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { field });
            }
        }

        let timeout = self.receive_timeout();
        if timeout.is_zero() || timeout > MAX_RECEIVE_TIMEOUT {
            return Err(ConfigError::ReceiveTimeout {
                timeout_ms: timeout.as_millis(),
            });
        }

        Ok(())
    }

    /// The bounded receive wait.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Sets the pixel table size.
    #[must_use]
    pub fn with_pixel_count(mut self, pixel_count: usize) -> Self {
        self.pixel_count = pixel_count;
        self
    }

    /// Sets the raw record capacity.
    #[must_use]
    pub fn with_raw_capacity(mut self, raw_capacity: usize) -> Self {
        self.raw_capacity = raw_capacity;
        self
    }

    /// Sets the rate history capacity.
    #[must_use]
    pub fn with_rate_history_capacity(mut self, capacity: usize) -> Self {
        self.rate_history_capacity = capacity;
        self
    }

    /// Sets the message log capacity.
    #[must_use]
    pub fn with_message_capacity(mut self, capacity: usize) -> Self {
        self.message_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pixel_count, 832);
        assert_eq!(config.raw_capacity, 100_000);
        assert!(config.receive_timeout() <= MAX_RECEIVE_TIMEOUT);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = MonitorConfig::default().with_rate_history_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroCapacity {
                field: "rate_history_capacity"
            })
        ));
    }

    #[test]
    fn test_receive_timeout_bounds() {
        let mut config = MonitorConfig {
            receive_timeout_ms: 1500,
            ..MonitorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReceiveTimeout { timeout_ms: 1500 })
        ));

        config.receive_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.receive_timeout_ms = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_path_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        std::fs::write(&path, r#"{ "adc_capacity": 64 }"#).unwrap();

        let config = MonitorConfig::from_path(&path).unwrap();
        assert_eq!(config.adc_capacity, 64);
        assert_eq!(config.pixel_count, 832);
    }

    #[test]
    fn test_from_path_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            MonitorConfig::from_path(&missing),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        assert!(matches!(
            MonitorConfig::from_path(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
