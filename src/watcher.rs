//! Interface event watching
//!
//! Monitors interface hotplug and link state using rtnetlink event streams
//! and normalizes them into [`LinkEvent`]s for the per-transport state
//! machines. Events are emitted for every interface on the system; claim
//! filtering is the consumer's responsibility.
//!
//! Also exposes the synchronous query/command surface ([`LinkPort`]) the
//! state machines use: administrative up/down, physical carrier presence,
//! hardware address, and bring-up/bring-down.

use crate::error::{TrackerError, TrackerResult};
use crate::validation;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Normalized interface lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Interface appeared
    InterfaceAdded { name: String },
    /// Interface disappeared
    InterfaceRemoved { name: String },
    /// Link went up (carrier detected)
    LinkUp { name: String },
    /// Link went down
    LinkDown { name: String },
}

impl LinkEvent {
    pub fn interface(&self) -> &str {
        match self {
            LinkEvent::InterfaceAdded { name }
            | LinkEvent::InterfaceRemoved { name }
            | LinkEvent::LinkUp { name }
            | LinkEvent::LinkDown { name } => name,
        }
    }
}

/// Synchronous interface queries and commands used by the state machines.
///
/// An interface can be administratively up with no cable plugged in;
/// `is_admin_up` and `has_carrier` are therefore distinct queries.
#[async_trait]
pub trait LinkPort: Send + Sync {
    /// List current interface names
    async fn list(&self) -> TrackerResult<Vec<String>>;

    /// Administrative up/down flag (IFF_UP)
    async fn is_admin_up(&self, interface: &str) -> TrackerResult<bool>;

    /// Physical carrier presence; false while administratively down
    async fn has_carrier(&self, interface: &str) -> TrackerResult<bool>;

    /// Hardware address, if the interface has one
    async fn hardware_address(&self, interface: &str) -> Option<String>;

    /// Set the interface administratively up
    async fn bring_up(&self, interface: &str) -> TrackerResult<()>;

    /// Set the interface administratively down
    async fn bring_down(&self, interface: &str) -> TrackerResult<()>;
}

/// Watches interface events and answers interface queries
pub struct InterfaceWatcher {
    /// Event broadcaster
    event_tx: broadcast::Sender<LinkEvent>,
    /// Running flag
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl InterfaceWatcher {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            event_tx,
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    /// Subscribe to interface events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Start watching interface events
    pub async fn start(&self) -> TrackerResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(TrackerError::InvalidState(
                "interface watcher already running".to_string(),
            ));
        }
        *running = true;
        drop(running);

        info!("Starting interface event watcher");

        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::watch_loop(event_tx, running).await {
                error!("Interface watcher error: {}", e);
            }
        });

        Ok(())
    }

    /// Stop watching interface events
    pub async fn stop(&self) -> TrackerResult<()> {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopped interface event watcher");
        Ok(())
    }

    async fn watch_loop(
        event_tx: broadcast::Sender<LinkEvent>,
        running: Arc<tokio::sync::RwLock<bool>>,
    ) -> TrackerResult<()> {
        #[cfg(target_os = "linux")]
        {
            if let Err(e) = Self::watch_with_netlink(event_tx.clone(), running.clone()).await {
                warn!("netlink event watching failed: {}, falling back to polling", e);
                Self::watch_with_polling(event_tx, running).await?;
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::watch_with_polling(event_tx, running).await?;
        }

        Ok(())
    }

    /// Watch using rtnetlink events (Linux-specific)
    #[cfg(target_os = "linux")]
    async fn watch_with_netlink(
        event_tx: broadcast::Sender<LinkEvent>,
        running: Arc<tokio::sync::RwLock<bool>>,
    ) -> TrackerResult<()> {
        use futures::stream::TryStreamExt;
        use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

        let register = |what: &str, e: String| {
            TrackerError::ObserverRegistrationFailed(format!("{}: {}", what, e))
        };

        // Join the link multicast group for hotplug and carrier events
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| register("create netlink socket", e.to_string()))?;

        let kernel_addr = SocketAddr::new(0, 0);
        socket
            .bind(&kernel_addr)
            .map_err(|e| register("bind netlink socket", e.to_string()))?;

        // RTNLGRP_LINK = 1
        const RTNLGRP_LINK: u32 = 1;
        socket
            .add_membership(RTNLGRP_LINK)
            .map_err(|e| register("join RTNLGRP_LINK", e.to_string()))?;

        socket
            .set_non_blocking(true)
            .map_err(|e| register("set non-blocking", e.to_string()))?;

        info!("Using rtnetlink events for interface watching (joined RTNLGRP_LINK)");

        // rtnetlink handle for the initial interface enumeration
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| register("create rtnetlink connection", e.to_string()))?;

        tokio::spawn(connection);

        // index -> (name, link up)
        let mut known: std::collections::HashMap<u32, (String, bool)> =
            std::collections::HashMap::new();

        let mut links = handle.link().get().execute();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| register("enumerate links", e.to_string()))?
        {
            if let Some(name) = extract_interface_name(&link) {
                let is_up = extract_operstate(&link);
                known.insert(link.header.index, (name.clone(), is_up));
                debug!(
                    "Found interface {} (index {}) link {}",
                    name,
                    link.header.index,
                    if is_up { "up" } else { "down" }
                );
            }
        }

        let mut buf = vec![0u8; 16384];

        let async_fd = tokio::io::unix::AsyncFd::new(socket)
            .map_err(|e| register("create async fd", e.to_string()))?;

        info!("Interface watcher ready, listening for events...");

        while *running.read().await {
            let mut guard = match tokio::time::timeout(
                tokio::time::Duration::from_secs(1),
                async_fd.readable(),
            )
            .await
            {
                Ok(Ok(guard)) => guard,
                Ok(Err(e)) => {
                    error!("AsyncFd error: {}", e);
                    continue;
                }
                Err(_) => {
                    // Timeout, re-check the running flag
                    continue;
                }
            };

            match guard.get_inner().recv(&mut buf, 0) {
                Ok(len) if len > 0 => {
                    if let Err(e) = process_netlink_messages(&buf[..len], &mut known, &event_tx) {
                        warn!("Error processing netlink message: {}", e);
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Expected for a non-blocking socket
                }
                Err(e) => {
                    warn!("Error receiving netlink message: {}", e);
                }
            }

            guard.clear_ready();
        }

        Ok(())
    }

    /// Watch using periodic polling of /sys/class/net (fallback)
    async fn watch_with_polling(
        event_tx: broadcast::Sender<LinkEvent>,
        running: Arc<tokio::sync::RwLock<bool>>,
    ) -> TrackerResult<()> {
        info!("Using polling for interface watching (fallback)");

        let mut known: std::collections::HashMap<String, bool> = std::collections::HashMap::new();

        while *running.read().await {
            if let Ok(mut entries) = tokio::fs::read_dir("/sys/class/net").await {
                let mut current = std::collections::HashSet::new();

                while let Ok(Some(entry)) = entries.next_entry().await {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    current.insert(name.clone());

                    if !known.contains_key(&name) {
                        info!("New interface detected: {}", name);
                        known.insert(name.clone(), false);
                        let _ = event_tx.send(LinkEvent::InterfaceAdded { name: name.clone() });
                    }

                    let operstate_path = format!("/sys/class/net/{}/operstate", name);
                    if let Ok(state) = tokio::fs::read_to_string(&operstate_path).await {
                        let is_up = state.trim() == "up";
                        if let Some(old) = known.get(&name) {
                            if *old != is_up {
                                debug!(
                                    "Interface {} link {}",
                                    name,
                                    if is_up { "up" } else { "down" }
                                );
                                known.insert(name.clone(), is_up);
                                let event = if is_up {
                                    LinkEvent::LinkUp { name: name.clone() }
                                } else {
                                    LinkEvent::LinkDown { name: name.clone() }
                                };
                                let _ = event_tx.send(event);
                            }
                        }
                    }
                }

                let removed: Vec<String> = known
                    .keys()
                    .filter(|k| !current.contains(*k))
                    .cloned()
                    .collect();

                for name in removed {
                    info!("Interface removed: {}", name);
                    known.remove(&name);
                    let _ = event_tx.send(LinkEvent::InterfaceRemoved { name });
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        }

        Ok(())
    }

    // === sysfs helpers ===

    async fn read_sysfs_string(&self, interface: &str, file: &str) -> Option<String> {
        let path = format!("/sys/class/net/{}/{}", interface, file);
        tokio::fs::read_to_string(path)
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    async fn run_ip(&self, args: &[&str]) -> TrackerResult<()> {
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
}

#[async_trait]
impl LinkPort for InterfaceWatcher {
    async fn list(&self) -> TrackerResult<Vec<String>> {
        let net_path = Path::new("/sys/class/net");
        if !net_path.exists() {
            return Err(TrackerError::ConfigError(
                "/sys/class/net not available".to_string(),
            ));
        }

        let mut entries = tokio::fs::read_dir(net_path).await?;
        let mut interfaces = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                interfaces.push(name.to_string());
            }
        }

        interfaces.sort();
        Ok(interfaces)
    }

    async fn is_admin_up(&self, interface: &str) -> TrackerResult<bool> {
        validation::validate_interface_name(interface)?;

        // The flags file holds the interface flag word; bit 0 is IFF_UP
        let flags = self
            .read_sysfs_string(interface, "flags")
            .await
            .ok_or_else(|| TrackerError::InterfaceNotFound(interface.to_string()))?;

        let word = flags.trim_start_matches("0x");
        let value = u32::from_str_radix(word, 16)
            .map_err(|e| TrackerError::ParseError(format!("flags '{}': {}", flags, e)))?;

        Ok(value & 0x1 != 0)
    }

    async fn has_carrier(&self, interface: &str) -> TrackerResult<bool> {
        // Carrier reads as absent while the interface is administratively down
        if !self.is_admin_up(interface).await? {
            return Ok(false);
        }

        match self.read_sysfs_string(interface, "carrier").await {
            Some(carrier) => Ok(carrier == "1"),
            None => Ok(false),
        }
    }

    async fn hardware_address(&self, interface: &str) -> Option<String> {
        self.read_sysfs_string(interface, "address")
            .await
            .filter(|a| !a.is_empty() && a != "00:00:00:00:00:00")
    }

    async fn bring_up(&self, interface: &str) -> TrackerResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "up"]).await
    }

    async fn bring_down(&self, interface: &str) -> TrackerResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "down"]).await
    }
}

impl Default for InterfaceWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract interface name from a LinkMessage
#[cfg(target_os = "linux")]
fn extract_interface_name(link: &netlink_packet_route::link::LinkMessage) -> Option<String> {
    use netlink_packet_route::link::LinkAttribute;
    link.attributes.iter().find_map(|attr| {
        if let LinkAttribute::IfName(name) = attr {
            Some(name.clone())
        } else {
            None
        }
    })
}

/// Extract link state from a LinkMessage; true means carrier up
#[cfg(target_os = "linux")]
fn extract_operstate(link: &netlink_packet_route::link::LinkMessage) -> bool {
    use netlink_packet_route::link::{LinkAttribute, LinkFlags, State};

    for attr in &link.attributes {
        if let LinkAttribute::OperState(state) = attr {
            return *state == State::Up;
        }
    }

    // Fallback: IFF_UP and IFF_RUNNING flags
    let flags = link.header.flags;
    flags.contains(LinkFlags::Up) && flags.contains(LinkFlags::Running)
}

/// Process raw netlink messages from the socket, updating the known set
/// and emitting normalized events
#[cfg(target_os = "linux")]
fn process_netlink_messages(
    data: &[u8],
    known: &mut std::collections::HashMap<u32, (String, bool)>,
    event_tx: &broadcast::Sender<LinkEvent>,
) -> TrackerResult<()> {
    use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
    use netlink_packet_route::RouteNetlinkMessage;

    let mut offset = 0;
    while offset < data.len() {
        let msg: NetlinkMessage<RouteNetlinkMessage> =
            match NetlinkMessage::deserialize(&data[offset..]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Failed to parse netlink message: {}", e);
                    break;
                }
            };

        let msg_len = msg.header.length as usize;
        if msg_len == 0 {
            break;
        }

        match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                if let Some(name) = extract_interface_name(&link) {
                    let index = link.header.index;
                    let is_up = extract_operstate(&link);

                    if let Some((_, old_is_up)) = known.get(&index) {
                        if *old_is_up != is_up {
                            info!(
                                "Interface {} link {}",
                                name,
                                if is_up { "up" } else { "down" }
                            );
                            let event = if is_up {
                                LinkEvent::LinkUp { name: name.clone() }
                            } else {
                                LinkEvent::LinkDown { name: name.clone() }
                            };
                            let _ = event_tx.send(event);
                        }
                    } else {
                        info!("New interface detected: {} (index {})", name, index);
                        let _ = event_tx.send(LinkEvent::InterfaceAdded { name: name.clone() });
                        // A hotplugged interface can arrive with the link
                        // already up; surface that as a distinct event
                        if is_up {
                            let _ = event_tx.send(LinkEvent::LinkUp { name: name.clone() });
                        }
                    }

                    known.insert(index, (name, is_up));
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                let index = link.header.index;
                if let Some((name, _)) = known.remove(&index) {
                    info!("Interface removed: {} (index {})", name, index);
                    let _ = event_tx.send(LinkEvent::InterfaceRemoved { name });
                }
            }
            _ => {
                // Address and route messages are not tracked here
            }
        }

        offset += msg_len;
    }

    Ok(())
}
