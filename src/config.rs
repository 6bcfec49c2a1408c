//! Daemon configuration for linktrackd

use crate::error::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main linktrackd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackdConfig {
    /// Wired transport settings
    #[serde(default)]
    pub wired: WiredSection,
    /// PPPoE transport settings; tracking is off when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pppoe: Option<PppoeSection>,
    /// DHCP helper settings
    #[serde(default)]
    pub dhcp: DhcpSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WiredSection {
    /// Claim pattern for wired interfaces
    #[serde(default = "default_wired_pattern")]
    pub pattern: String,
    /// Static IP configuration store, read per connection attempt
    #[serde(default = "default_static_config")]
    pub static_config: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PppoeSection {
    /// Claim pattern for session interfaces
    #[serde(default = "default_pppoe_pattern")]
    pub pattern: String,
    /// Physical interface the session runs over
    pub underlying: String,
    /// resolv.conf written by the PPP daemon
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
    /// Program + arguments that stop the session
    #[serde(default)]
    pub stop_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpSection {
    /// Path to the DHCP helper binary
    #[serde(default = "default_dhcp_bin")]
    pub client_bin: PathBuf,
    /// Negotiation timeout in seconds
    #[serde(default = "default_dhcp_timeout")]
    pub timeout_secs: u64,
}

fn default_wired_pattern() -> String {
    r"^(eth|en)\d".to_string()
}

fn default_static_config() -> PathBuf {
    PathBuf::from("/etc/linktrack/static-ip.toml")
}

fn default_pppoe_pattern() -> String {
    r"^ppp\d".to_string()
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/ppp/resolv.conf")
}

fn default_dhcp_bin() -> PathBuf {
    PathBuf::from("/usr/local/bin/lt-dhcpc")
}

fn default_dhcp_timeout() -> u64 {
    30
}

impl Default for WiredSection {
    fn default() -> Self {
        Self {
            pattern: default_wired_pattern(),
            static_config: default_static_config(),
        }
    }
}

impl Default for DhcpSection {
    fn default() -> Self {
        Self {
            client_bin: default_dhcp_bin(),
            timeout_secs: default_dhcp_timeout(),
        }
    }
}

impl Default for TrackdConfig {
    fn default() -> Self {
        Self {
            wired: WiredSection::default(),
            pppoe: None,
            dhcp: DhcpSection::default(),
        }
    }
}

impl TrackdConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> TrackerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TrackerError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| TrackerError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TrackerResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TrackerError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| TrackerError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackdConfig::default();
        assert_eq!(config.wired.pattern, r"^(eth|en)\d");
        assert!(config.pppoe.is_none());
        assert_eq!(config.dhcp.timeout_secs, 30);
    }

    #[test]
    fn test_parse_with_pppoe() {
        let toml_str = r#"
            [wired]
            pattern = "^eth0$"

            [pppoe]
            underlying = "eth0"
            stop_command = ["poff", "provider"]
        "#;
        let config: TrackdConfig = toml::from_str(toml_str).unwrap();
        let pppoe = config.pppoe.unwrap();
        assert_eq!(pppoe.underlying, "eth0");
        assert_eq!(pppoe.pattern, r"^ppp\d");
        assert_eq!(pppoe.stop_command, vec!["poff", "provider"]);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: TrackdConfig = toml::from_str("").unwrap();
        assert_eq!(config.wired.static_config, PathBuf::from("/etc/linktrack/static-ip.toml"));
    }
}
