//! Address configuration
//!
//! Given an interface and a configuration mode, performs the actual
//! address/route/DNS assignment and reports the resulting address set.
//! Connectivity state is never touched here; that is the state machine's
//! job.

use crate::dhcp::{DhcpClient, DhcpLease};
use crate::error::{TrackerError, TrackerResult};
use crate::static_config::StaticStore;
use crate::validation;
use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How an interface gets its addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfigMode {
    /// No mode decided yet
    Unset,
    /// Addresses negotiated via DHCP
    Dhcp,
    /// Fixed configuration from the static store
    Static,
}

/// Outcome of a successful configuration attempt.
///
/// `Default` is the cleared/empty value published while disconnected;
/// callers never see a null reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedLink {
    /// Bound interface name
    pub interface: Option<String>,
    /// Assigned address
    pub address: Option<IpAddr>,
    /// Prefix length computed from the netmask
    pub prefix_len: u8,
    /// Default route
    pub gateway: Option<IpAddr>,
    /// DNS servers, possibly empty
    pub dns: Vec<IpAddr>,
}

impl ResolvedLink {
    pub fn is_empty(&self) -> bool {
        self.interface.is_none() && self.address.is_none()
    }

    pub fn clear(&mut self) {
        *self = ResolvedLink::default();
    }
}

/// Applies address configuration to an interface.
///
/// Implementations may block for a non-trivial duration (DHCP); callers
/// dispatch `configure` off their serialized worker.
#[async_trait]
pub trait AddressConfigurator: Send + Sync {
    /// Which mode the next attempt should use, consulted at the moment the
    /// attempt begins so late configuration edits are honored.
    async fn select_mode(&self) -> ConfigMode {
        ConfigMode::Dhcp
    }

    /// Configure the interface in the given mode and return the resulting
    /// address set.
    async fn configure(&self, interface: &str, mode: ConfigMode) -> TrackerResult<ResolvedLink>;

    /// Release any held address, route or session on the interface.
    /// Best effort; used on disconnect and teardown.
    async fn release(&self, interface: &str) -> TrackerResult<()>;
}

/// Wired configurator: DHCP via the external client, or a fixed
/// configuration applied directly with `ip` commands.
pub struct SystemConfigurator {
    store: StaticStore,
    dhcp: DhcpClient,
}

impl SystemConfigurator {
    pub fn new(store: StaticStore, dhcp: DhcpClient) -> Self {
        Self { store, dhcp }
    }

    async fn configure_static(&self, interface: &str) -> TrackerResult<ResolvedLink> {
        // Read the store at attempt time so late user edits are honored
        let config = self.store.load().await?;

        let prefix_len = config.prefix_len();
        if prefix_len == validation::DEFAULT_PREFIX_LEN
            && config.netmask != "255.255.255.0"
        {
            warn!(
                "Netmask '{}' on {} unusable, falling back to /{}",
                config.netmask, interface, prefix_len
            );
        }

        info!(
            "Applying static configuration {}/{} on {}",
            config.address, prefix_len, interface
        );

        let addr = format!("{}/{}", config.address, prefix_len);
        run_ip(&["addr", "flush", "dev", interface])
            .await
            .map_err(apply_failed)?;
        run_ip(&["addr", "add", &addr, "dev", interface])
            .await
            .map_err(apply_failed)?;

        let gateway = config.gateway.to_string();
        run_ip(&["route", "replace", "default", "via", &gateway, "dev", interface])
            .await
            .map_err(apply_failed)?;

        Ok(ResolvedLink {
            interface: Some(interface.to_string()),
            address: Some(IpAddr::V4(config.address)),
            prefix_len,
            gateway: Some(IpAddr::V4(config.gateway)),
            dns: config.dns.into_iter().map(IpAddr::V4).collect(),
        })
    }

    async fn configure_dhcp(&self, interface: &str) -> TrackerResult<ResolvedLink> {
        let lease = self.dhcp.acquire(interface).await?;
        Ok(link_from_lease(interface, &lease))
    }
}

#[async_trait]
impl AddressConfigurator for SystemConfigurator {
    async fn select_mode(&self) -> ConfigMode {
        self.store.mode().await
    }

    async fn configure(&self, interface: &str, mode: ConfigMode) -> TrackerResult<ResolvedLink> {
        validation::validate_interface_name(interface)?;

        match mode {
            ConfigMode::Static => self.configure_static(interface).await,
            ConfigMode::Dhcp | ConfigMode::Unset => self.configure_dhcp(interface).await,
        }
    }

    async fn release(&self, interface: &str) -> TrackerResult<()> {
        validation::validate_interface_name(interface)?;

        if let Err(e) = self.dhcp.release(interface).await {
            warn!("DHCP release on {} failed: {}", interface, e);
        }
        if let Err(e) = self.dhcp.stop(interface).await {
            warn!("DHCP stop on {} failed: {}", interface, e);
        }
        if let Err(e) = run_ip(&["addr", "flush", "dev", interface]).await {
            warn!("Address flush on {} failed: {}", interface, e);
        }

        Ok(())
    }
}

/// PPPoE configurator: the session daemon negotiates addresses on the ppp
/// interface; this reads them back off the interface and collects DNS from
/// the daemon-written resolver file. Release runs the configured
/// stop-session command.
pub struct PppoeConfigurator {
    /// resolv.conf written by the PPP daemon, one `nameserver` per line
    resolv_path: PathBuf,
    /// Program + arguments that stop the session
    stop_command: Vec<String>,
}

impl PppoeConfigurator {
    pub fn new<P: AsRef<Path>>(resolv_path: P, stop_command: Vec<String>) -> Self {
        Self {
            resolv_path: resolv_path.as_ref().to_path_buf(),
            stop_command,
        }
    }

    async fn session_dns(&self) -> Vec<IpAddr> {
        let contents = match tokio::fs::read_to_string(&self.resolv_path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot read {}: {}", self.resolv_path.display(), e);
                return Vec::new();
            }
        };

        contents
            .lines()
            .filter_map(|line| line.strip_prefix("nameserver "))
            .filter_map(|addr| addr.trim().parse().ok())
            .collect()
    }
}

#[async_trait]
impl AddressConfigurator for PppoeConfigurator {
    async fn configure(&self, interface: &str, _mode: ConfigMode) -> TrackerResult<ResolvedLink> {
        validation::validate_interface_name(interface)?;

        let addresses = interface_addresses(interface).await?;
        let (address, prefix_len) = addresses.into_iter().next().ok_or_else(|| {
            TrackerError::ApplyFailed(format!("no negotiated address on {}", interface))
        })?;

        let dns = self.session_dns().await;
        if dns.is_empty() {
            debug!("No DNS servers found for session on {}", interface);
        }

        Ok(ResolvedLink {
            interface: Some(interface.to_string()),
            address: Some(address),
            prefix_len,
            gateway: None, // point-to-point peer route is installed by the daemon
            dns,
        })
    }

    async fn release(&self, interface: &str) -> TrackerResult<()> {
        let Some((program, args)) = self.stop_command.split_first() else {
            debug!("No stop-session command configured for {}", interface);
            return Ok(());
        };

        info!("Stopping session on {}", interface);

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| TrackerError::CommandFailed {
                cmd: self.stop_command.join(" "),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Stop-session command failed on {}: {}", interface, stderr);
        }

        Ok(())
    }
}

/// Build a `ResolvedLink` from a DHCP lease; a missing or malformed
/// netmask degrades to the default prefix length.
fn link_from_lease(interface: &str, lease: &DhcpLease) -> ResolvedLink {
    let prefix_len = lease
        .subnet_mask
        .as_deref()
        .map(validation::netmask_to_prefix_len)
        .unwrap_or(validation::DEFAULT_PREFIX_LEN);

    ResolvedLink {
        interface: Some(interface.to_string()),
        address: lease.ip_address.as_deref().and_then(|a| a.parse().ok()),
        prefix_len,
        gateway: lease.gateway.as_deref().and_then(|g| g.parse().ok()),
        dns: lease
            .dns_servers
            .iter()
            .filter_map(|d| d.parse().ok())
            .collect(),
    }
}

fn apply_failed(e: TrackerError) -> TrackerError {
    TrackerError::ApplyFailed(e.to_string())
}

// === ip command helpers ===

async fn run_ip(args: &[&str]) -> TrackerResult<()> {
    let cmd_str = format!("ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| TrackerError::CommandFailed {
            cmd: cmd_str.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(TrackerError::CommandFailed {
            cmd: cmd_str,
            code: output.status.code(),
            stderr,
        });
    }

    Ok(())
}

/// Read the IPv4 addresses currently assigned to an interface via
/// `ip -json addr show`.
async fn interface_addresses(interface: &str) -> TrackerResult<Vec<(IpAddr, u8)>> {
    let output = Command::new("ip")
        .args(["-json", "addr", "show", interface])
        .output()
        .await
        .map_err(|e| TrackerError::CommandFailed {
            cmd: format!("ip -json addr show {}", interface),
            code: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(TrackerError::InterfaceNotFound(interface.to_string()));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    let json: serde_json::Value = serde_json::from_str(&json_str)?;

    let mut addresses = Vec::new();
    if let Some(iface) = json.as_array().and_then(|arr| arr.first()) {
        if let Some(addr_info) = iface.get("addr_info").and_then(|v| v.as_array()) {
            for addr in addr_info {
                let local = addr.get("local").and_then(|v| v.as_str());
                let family = addr.get("family").and_then(|v| v.as_str());
                let prefixlen = addr.get("prefixlen").and_then(|v| v.as_u64());
                if let (Some(local), Some("inet"), Some(prefixlen)) = (local, family, prefixlen) {
                    if let Ok(ip) = local.parse() {
                        addresses.push((ip, prefixlen as u8));
                    }
                }
            }
        }
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_link_default_is_empty() {
        let link = ResolvedLink::default();
        assert!(link.is_empty());
        assert_eq!(link.prefix_len, 0);
        assert!(link.dns.is_empty());
    }

    #[test]
    fn test_resolved_link_clear() {
        let mut link = ResolvedLink {
            interface: Some("eth0".to_string()),
            address: Some("192.168.1.50".parse().unwrap()),
            prefix_len: 24,
            gateway: Some("192.168.1.1".parse().unwrap()),
            dns: vec!["8.8.8.8".parse().unwrap()],
        };
        assert!(!link.is_empty());
        link.clear();
        assert!(link.is_empty());
        assert_eq!(link, ResolvedLink::default());
    }

    #[test]
    fn test_link_from_lease() {
        let lease = DhcpLease {
            interface: "eth0".to_string(),
            ip_address: Some("192.168.1.50".to_string()),
            subnet_mask: Some("255.255.255.0".to_string()),
            gateway: Some("192.168.1.1".to_string()),
            dns_servers: vec!["8.8.8.8".to_string()],
            lease_time: Some(3600),
            server_address: None,
        };
        let link = link_from_lease("eth0", &lease);
        assert_eq!(link.prefix_len, 24);
        assert_eq!(link.address, Some("192.168.1.50".parse().unwrap()));
        assert_eq!(link.gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(link.dns, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_link_from_lease_bad_netmask_falls_back() {
        let lease = DhcpLease {
            interface: "eth0".to_string(),
            ip_address: Some("192.168.1.50".to_string()),
            subnet_mask: Some("bogus".to_string()),
            gateway: None,
            dns_servers: vec![],
            lease_time: None,
            server_address: None,
        };
        let link = link_from_lease("eth0", &lease);
        assert_eq!(link.prefix_len, validation::DEFAULT_PREFIX_LEN);
    }
}
