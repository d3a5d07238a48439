//! Configuration types for the relay transport
//!
//! The crate does not load configuration from anywhere itself; callers
//! deserialize [`RelayConfig`] from whatever source they own and hand the
//! resolved [`RelayOptions`] to relay establishment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Declarative relay transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Interface to pin outbound relay sockets to (`SO_BINDTODEVICE`);
    /// empty or absent means the routing tables decide
    #[serde(default)]
    pub bind_interface: Option<String>,

    /// Bound on the time from connect to first-writable, in seconds.
    /// 0 disables the deadline. Not a steady-state idle timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Ceiling on queued-but-unsent outbound bytes per endpoint;
    /// absent means unbounded
    #[serde(default = "default_write_high_watermark")]
    pub write_high_watermark: Option<usize>,

    /// Seconds of idle before the first keepalive probe
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,

    /// Seconds between keepalive probes
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_write_high_watermark() -> Option<usize> {
    Some(256 * 1024)
}

const fn default_keepalive_idle_secs() -> u64 {
    60
}

const fn default_keepalive_interval_secs() -> u64 {
    15
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_interface: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            write_high_watermark: default_write_high_watermark(),
            keepalive_idle_secs: default_keepalive_idle_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl RelayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` if a field cannot be applied.
    pub fn validate(&self) -> Result<(), RelayError> {
        if let Some(ref interface) = self.bind_interface {
            // must fit IFNAMSIZ with the trailing null
            if interface.len() > 15 {
                return Err(RelayError::InvalidConfig(format!(
                    "bind_interface '{interface}' is too long (max 15 chars)"
                )));
            }
        }
        if self.write_high_watermark == Some(0) {
            return Err(RelayError::InvalidConfig(
                "write_high_watermark must be positive; omit it for unbounded".into(),
            ));
        }
        if self.keepalive_idle_secs == 0 || self.keepalive_interval_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "keepalive timings must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve into the options relay establishment consumes
    #[must_use]
    pub fn options(&self) -> RelayOptions {
        RelayOptions {
            bind_interface: self
                .bind_interface
                .clone()
                .filter(|name| !name.is_empty()),
            connect_timeout: (self.connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.connect_timeout_secs)),
            write_high_watermark: self.write_high_watermark,
            keepalive_idle: Duration::from_secs(self.keepalive_idle_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
        }
    }
}

/// Resolved settings consumed by [`crate::relay::prepare_relay`] and
/// [`crate::relay::connect_relay`]
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub bind_interface: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub write_high_watermark: Option<usize>,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayConfig::default().options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        let options = config.options();
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(options.write_high_watermark, Some(256 * 1024));
        assert!(options.bind_interface.is_none());
    }

    #[test]
    fn test_validate_rejects_long_interface_name() {
        let config = RelayConfig {
            bind_interface: Some("this_is_a_very_long_interface_name".into()),
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_watermark() {
        let config = RelayConfig {
            write_high_watermark: Some(0),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.write_high_watermark, Some(256 * 1024));

        let config: RelayConfig = serde_json::from_str(
            r#"{"bind_interface": "wan0", "connect_timeout_secs": 0, "write_high_watermark": null}"#,
        )
        .unwrap();
        let options = config.options();
        assert_eq!(options.bind_interface.as_deref(), Some("wan0"));
        assert_eq!(options.connect_timeout, None);
        assert_eq!(options.write_high_watermark, None);
    }

    #[test]
    fn test_empty_interface_resolves_to_none() {
        let config = RelayConfig {
            bind_interface: Some(String::new()),
            ..RelayConfig::default()
        };
        assert!(config.options().bind_interface.is_none());
    }
}
