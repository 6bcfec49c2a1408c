//! External DHCP client invocation
//!
//! Address negotiation is delegated to a helper binary that performs the
//! DHCP exchange and applies the lease to the interface. The helper prints
//! the resulting lease as JSON on stdout, which is parsed here. This is the
//! one operation in the crate expected to block for seconds; callers
//! dispatch it off the state-machine worker.

use crate::error::{TrackerError, TrackerResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default path to the DHCP helper binary
const DHCP_CLIENT_BIN: &str = "/usr/local/bin/lt-dhcpc";

/// Default negotiation timeout
const DHCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lease information reported by the DHCP helper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpLease {
    /// Interface name
    pub interface: String,
    /// Assigned IP address
    pub ip_address: Option<String>,
    /// Subnet mask in dotted form
    pub subnet_mask: Option<String>,
    /// Gateway/router
    pub gateway: Option<String>,
    /// DNS servers
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// Lease time in seconds
    pub lease_time: Option<u32>,
    /// DHCP server address
    pub server_address: Option<String>,
}

/// DHCP client controller
pub struct DhcpClient {
    /// Path to the helper binary
    client_bin: PathBuf,
    /// Negotiation timeout
    timeout: Duration,
}

impl DhcpClient {
    pub fn new() -> Self {
        Self {
            client_bin: PathBuf::from(DHCP_CLIENT_BIN),
            timeout: DHCP_TIMEOUT,
        }
    }

    pub fn with_binary<P: AsRef<Path>>(client_bin: P, timeout: Duration) -> Self {
        Self {
            client_bin: client_bin.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Check if the helper is installed
    pub async fn is_installed(&self) -> bool {
        tokio::fs::metadata(&self.client_bin).await.is_ok()
    }

    /// Run a DHCP exchange on an interface and return the lease.
    ///
    /// Blocks for up to the configured timeout while the helper negotiates.
    pub async fn acquire(&self, interface: &str) -> TrackerResult<DhcpLease> {
        validation::validate_interface_name(interface)?;

        if !self.is_installed().await {
            return Err(TrackerError::DhcpFailed(format!(
                "DHCP client not found at {}",
                self.client_bin.display()
            )));
        }

        info!("Starting DHCP negotiation on {}", interface);

        let run = Command::new(&self.client_bin)
            .arg("acquire")
            .arg(interface)
            .arg("--json")
            .output();

        let output = match timeout(self.timeout, run).await {
            Ok(result) => result.map_err(|e| TrackerError::DhcpFailed(e.to_string()))?,
            Err(_) => {
                return Err(TrackerError::DhcpFailed(format!(
                    "negotiation timed out after {:?} on {}",
                    self.timeout, interface
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TrackerError::DhcpFailed(format!(
                "client exited with {:?} on {}: {}",
                output.status.code(),
                interface,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lease: DhcpLease = serde_json::from_str(stdout.trim()).map_err(|e| {
            TrackerError::DhcpFailed(format!("unparsable lease output: {}", e))
        })?;

        debug!("Lease on {}: {:?}", interface, lease);
        Ok(lease)
    }

    /// Release the current lease on an interface. Best effort.
    pub async fn release(&self, interface: &str) -> TrackerResult<()> {
        validation::validate_interface_name(interface)?;

        if !self.is_installed().await {
            return Ok(());
        }

        info!("Releasing DHCP lease on {}", interface);

        let output = Command::new(&self.client_bin)
            .arg("release")
            .arg(interface)
            .output()
            .await
            .map_err(|e| TrackerError::CommandFailed {
                cmd: format!("lt-dhcpc release {}", interface),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Failed to release DHCP lease on {}: {}", interface, stderr);
        }

        Ok(())
    }

    /// Stop any DHCP client running on an interface. Best effort.
    pub async fn stop(&self, interface: &str) -> TrackerResult<()> {
        validation::validate_interface_name(interface)?;

        if !self.is_installed().await {
            debug!("DHCP client not installed, skipping stop");
            return Ok(());
        }

        info!("Stopping DHCP client on {}", interface);

        let output = Command::new(&self.client_bin)
            .arg("stop")
            .arg(interface)
            .output()
            .await
            .map_err(|e| TrackerError::CommandFailed {
                cmd: format!("lt-dhcpc stop {}", interface),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Failed to stop DHCP client on {}: {}", interface, stderr);
        }

        Ok(())
    }
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}
