//! Static IP configuration store
//!
//! The store is a TOML file edited by the host platform. It is read at the
//! moment a connection attempt begins, never cached, so late user edits
//! take effect on the next attempt.

use crate::configurator::ConfigMode;
use crate::error::{TrackerError, TrackerResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// DNS placeholder used when only the secondary entry is missing
const DNS_SENTINEL: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// On-disk form of the static IP settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticIpSection {
    /// When false or absent, DHCP is used
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns2: Option<String>,
}

/// Validated static configuration, ready to apply
#[derive(Debug, Clone, PartialEq)]
pub struct StaticIpConfig {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Kept in dotted form; prefix conversion happens at apply time so a
    /// malformed mask degrades to the default prefix instead of failing
    pub netmask: String,
    pub dns: Vec<Ipv4Addr>,
}

impl StaticIpConfig {
    /// Prefix length derived from the netmask, with fallback on malformed input
    pub fn prefix_len(&self) -> u8 {
        validation::netmask_to_prefix_len(&self.netmask)
    }
}

/// Reads static IP settings from a TOML file
pub struct StaticStore {
    path: PathBuf,
}

impl StaticStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Which configuration mode the user selected.
    ///
    /// A missing file or absent `enabled` key means DHCP.
    pub async fn mode(&self) -> ConfigMode {
        match self.read_section().await {
            Ok(section) if section.enabled => ConfigMode::Static,
            Ok(_) => ConfigMode::Dhcp,
            Err(e) => {
                debug!("No usable static config at {}: {}", self.path.display(), e);
                ConfigMode::Dhcp
            }
        }
    }

    /// Load and validate the stored static configuration.
    ///
    /// Usable only if address, gateway and netmask are all present and
    /// well-formed. A missing secondary DNS defaults to `0.0.0.0`; with no
    /// DNS at all the list is empty.
    pub async fn load(&self) -> TrackerResult<StaticIpConfig> {
        let section = self.read_section().await?;

        if !section.enabled {
            return Err(TrackerError::NoStaticConfig(
                "static configuration not enabled".to_string()
            ));
        }

        let address = Self::required_v4("address", section.address.as_deref())?;
        let gateway = Self::required_v4("gateway", section.gateway.as_deref())?;
        let netmask = section.netmask.clone().filter(|s| !s.is_empty())
            .ok_or_else(|| TrackerError::NoStaticConfig("no valid netmask".to_string()))?;

        let mut dns = Vec::new();
        match section.dns1.as_deref().filter(|s| !s.is_empty()) {
            Some(d1) => {
                dns.push(Self::required_v4("dns1", Some(d1))?);
                let d2 = section.dns2.as_deref().filter(|s| !s.is_empty());
                match d2 {
                    Some(d2) => dns.push(Self::required_v4("dns2", Some(d2))?),
                    None => {
                        debug!("No secondary DNS configured, using {}", DNS_SENTINEL);
                        dns.push(DNS_SENTINEL);
                    }
                }
            }
            None => {
                debug!("Static config has no DNS entries");
            }
        }

        Ok(StaticIpConfig {
            address,
            gateway,
            netmask,
            dns,
        })
    }

    async fn read_section(&self) -> TrackerResult<StaticIpSection> {
        let contents = fs::read_to_string(&self.path).await.map_err(|e| {
            TrackerError::NoStaticConfig(format!("{}: {}", self.path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            warn!("Malformed static config {}: {}", self.path.display(), e);
            TrackerError::NoStaticConfig(format!("invalid TOML: {}", e))
        })
    }

    fn required_v4(field: &str, value: Option<&str>) -> TrackerResult<Ipv4Addr> {
        let value = value.filter(|s| !s.is_empty()).ok_or_else(|| {
            TrackerError::NoStaticConfig(format!("no valid {}", field))
        })?;
        value.parse().map_err(|_| {
            TrackerError::NoStaticConfig(format!("malformed {}: {}", field, value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn store_with(contents: &str) -> (NamedTempFile, StaticStore) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let store = StaticStore::new(file.path());
        (file, store)
    }

    #[tokio::test]
    async fn test_missing_file_means_dhcp() {
        let store = StaticStore::new("/nonexistent/static.toml");
        assert_eq!(store.mode().await, ConfigMode::Dhcp);
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_means_dhcp() {
        let (_f, store) = store_with("enabled = false\naddress = \"192.168.1.5\"\n");
        assert_eq!(store.mode().await, ConfigMode::Dhcp);
    }

    #[tokio::test]
    async fn test_complete_static_config() {
        let (_f, store) = store_with(
            "enabled = true\n\
             address = \"192.168.1.5\"\n\
             gateway = \"192.168.1.1\"\n\
             netmask = \"255.255.255.0\"\n\
             dns1 = \"8.8.8.8\"\n\
             dns2 = \"8.8.4.4\"\n",
        );
        assert_eq!(store.mode().await, ConfigMode::Static);

        let config = store.load().await.unwrap();
        assert_eq!(config.address, "192.168.1.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.gateway, "192.168.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.prefix_len(), 24);
        assert_eq!(config.dns.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_secondary_dns_gets_sentinel() {
        let (_f, store) = store_with(
            "enabled = true\n\
             address = \"10.0.0.2\"\n\
             gateway = \"10.0.0.1\"\n\
             netmask = \"255.255.0.0\"\n\
             dns1 = \"1.1.1.1\"\n",
        );
        let config = store.load().await.unwrap();
        assert_eq!(config.dns[1], "0.0.0.0".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_config_is_no_static_config() {
        let (_f, store) = store_with(
            "enabled = true\n\
             address = \"10.0.0.2\"\n\
             netmask = \"255.255.0.0\"\n",
        );
        match store.load().await {
            Err(TrackerError::NoStaticConfig(msg)) => assert!(msg.contains("gateway")),
            other => panic!("expected NoStaticConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_malformed_netmask_does_not_fail_load() {
        let (_f, store) = store_with(
            "enabled = true\n\
             address = \"10.0.0.2\"\n\
             gateway = \"10.0.0.1\"\n\
             netmask = \"garbage\"\n",
        );
        let config = store.load().await.unwrap();
        assert_eq!(config.prefix_len(), validation::DEFAULT_PREFIX_LEN);
    }

    #[tokio::test]
    async fn test_no_dns_at_all_is_usable() {
        let (_f, store) = store_with(
            "enabled = true\n\
             address = \"10.0.0.2\"\n\
             gateway = \"10.0.0.1\"\n\
             netmask = \"255.255.255.0\"\n",
        );
        let config = store.load().await.unwrap();
        assert!(config.dns.is_empty());
    }
}
