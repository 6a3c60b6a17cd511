//! Host configuration: timeouts, L2CAP channel parameters and connection cap.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest MTU an L2CAP channel may advertise.
pub const L2CAP_MIN_MTU: u16 = 48;

/// Runtime configuration for the HID host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How long a device may stay in Connecting before it is forced back.
    pub connect_timeout_ms: u64,
    /// How long a device may stay in Disconnecting.
    pub disconnect_timeout_ms: u64,
    /// Bound on every blocking GATT read/write.
    pub gatt_timeout_ms: u64,
    /// MTU proposed in L2CAP configuration requests.
    pub l2cap_mtu: u16,
    /// Flush timeout proposed in L2CAP configuration requests.
    pub l2cap_flush_timeout: u16,
    /// Maximum number of devices connecting or connected at once.
    pub max_connections: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            disconnect_timeout_ms: 60_000,
            gatt_timeout_ms: 5_000,
            l2cap_mtu: 1024,
            l2cap_flush_timeout: 0xFFFF,
            max_connections: 6,
        }
    }
}

impl HostConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: HostConfig =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Reject values the state machine cannot work with.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("gatt_timeout_ms", self.gatt_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{field} must be non-zero")));
            }
        }
        if self.l2cap_mtu < L2CAP_MIN_MTU {
            return Err(Error::Config(format!(
                "l2cap_mtu {} is below the minimum {L2CAP_MIN_MTU}",
                self.l2cap_mtu
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn gatt_timeout(&self) -> Duration {
        Duration::from_millis(self.gatt_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timeouts() {
        let config = HostConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(60));
        assert_eq!(config.disconnect_timeout(), Duration::from_secs(60));
        assert_eq!(config.gatt_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = HostConfig::from_json(r#"{ "gatt_timeout_ms": 250 }"#).unwrap();
        assert_eq!(config.gatt_timeout_ms, 250);
        assert_eq!(config.max_connections, 6);
        assert_eq!(config.l2cap_mtu, 1024);
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = HostConfig::from_json(r#"{ "connect_timeout_ms": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("connect_timeout_ms"));
    }

    #[test]
    fn small_mtu_rejected() {
        assert!(HostConfig::from_json(r#"{ "l2cap_mtu": 47 }"#).is_err());
    }

    #[test]
    fn garbage_rejected() {
        assert!(HostConfig::from_json("not json").is_err());
    }

    #[test]
    fn load_missing_file_fails() {
        let err = HostConfig::load(Path::new("/nonexistent/hid-host.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
