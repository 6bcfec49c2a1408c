//! Per-transport link state machine
//!
//! One [`LinkStateMachine`] tracks one claimed interface for one transport
//! kind. Each machine runs on its own worker task, so all events and
//! commands for a transport are processed strictly in arrival order. The
//! address-configuration call is the only blocking operation and is
//! dispatched off the worker; its result is posted back as a message,
//! tagged with an attempt counter so stale completions are discarded.

use crate::configurator::{AddressConfigurator, ConfigMode, ResolvedLink};
use crate::error::TrackerResult;
use crate::registry::TrackerNotification;
use crate::watcher::{LinkEvent, LinkPort};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

/// Category of wired connectivity being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportKind {
    /// Ethernet-like physical link
    Wired,
    /// PPPoE session over a physical link
    Pppoe,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Wired => write!(f, "wired"),
            TransportKind::Pppoe => write!(f, "pppoe"),
        }
    }
}

/// Published connectivity state, one per transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Transport-specific behavior of a state machine
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub kind: TransportKind,
    /// Interfaces whose name matches may be claimed
    pub claim_pattern: Regex,
    /// Physical interface this transport's session runs over; when the
    /// transport owning that interface disconnects, the session is stopped
    pub underlying_interface: Option<String>,
}

impl TransportPolicy {
    pub fn wired(pattern: &str) -> TrackerResult<Self> {
        Ok(Self {
            kind: TransportKind::Wired,
            claim_pattern: compile_pattern(pattern)?,
            underlying_interface: None,
        })
    }

    pub fn pppoe(pattern: &str, underlying_interface: &str) -> TrackerResult<Self> {
        Ok(Self {
            kind: TransportKind::Pppoe,
            claim_pattern: compile_pattern(pattern)?,
            underlying_interface: Some(underlying_interface.to_string()),
        })
    }

    /// Whether an interface name may be claimed by this transport
    pub fn matches(&self, name: &str) -> bool {
        self.claim_pattern.is_match(name)
    }
}

fn compile_pattern(pattern: &str) -> TrackerResult<Regex> {
    Regex::new(pattern).map_err(|e| {
        crate::error::TrackerError::ConfigError(format!("claim pattern '{}': {}", pattern, e))
    })
}

/// Point-in-time copy of a tracker's externally visible state
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerSnapshot {
    pub state: ConnectivityState,
    /// Claimed interface, if any
    pub interface: Option<String>,
    /// Last-known link flag for the claimed interface
    pub link_up: bool,
    pub hardware_address: Option<String>,
    pub properties: ResolvedLink,
}

/// External commands accepted by a state machine
#[derive(Debug, Clone)]
pub enum TrackerCommand {
    /// Request teardown; aborts an in-flight configuration cooperatively
    Teardown,
    /// Clear the teardown flag and retry connection if the link is up
    Reconnect,
    /// Bring the claimed interface up and retry connection
    Enable,
    /// Disconnect and set the claimed interface administratively down
    Disable,
    /// Another transport's link disconnected; stop the session if it was
    /// our underlying physical interface
    SiblingDisconnected { interface: String },
    /// Stop the worker task
    Shutdown,
}

/// Messages processed by the worker, in strict arrival order
#[derive(Debug)]
pub enum TrackerMessage {
    Event(LinkEvent),
    Command(TrackerCommand),
    /// Completion of a dispatched configuration attempt
    Configured {
        attempt: u64,
        result: TrackerResult<ResolvedLink>,
    },
}

/// State machine for one transport. Owns its connectivity state and the
/// claimed interface exclusively; external reads go through the snapshot.
pub struct LinkStateMachine {
    policy: TransportPolicy,
    port: Arc<dyn LinkPort>,
    configurator: Arc<dyn AddressConfigurator>,
    msg_rx: mpsc::UnboundedReceiver<TrackerMessage>,
    /// Used by dispatched configuration tasks to post completions back
    msg_tx: mpsc::UnboundedSender<TrackerMessage>,
    snapshot: Arc<RwLock<TrackerSnapshot>>,
    notify_tx: broadcast::Sender<TrackerNotification>,

    state: ConnectivityState,
    interface: Option<String>,
    link_up: bool,
    hardware_address: Option<String>,
    mode: ConfigMode,
    properties: ResolvedLink,
    teardown_requested: bool,
    enabled: bool,
    /// Bumped whenever an in-flight configuration becomes stale
    attempt: u64,
}

impl LinkStateMachine {
    pub(crate) fn new(
        policy: TransportPolicy,
        port: Arc<dyn LinkPort>,
        configurator: Arc<dyn AddressConfigurator>,
        snapshot: Arc<RwLock<TrackerSnapshot>>,
        notify_tx: broadcast::Sender<TrackerNotification>,
    ) -> (Self, mpsc::UnboundedSender<TrackerMessage>) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let machine = Self {
            policy,
            port,
            configurator,
            msg_rx,
            msg_tx: msg_tx.clone(),
            snapshot,
            notify_tx,
            state: ConnectivityState::Disconnected,
            interface: None,
            link_up: false,
            hardware_address: None,
            mode: ConfigMode::Unset,
            properties: ResolvedLink::default(),
            teardown_requested: false,
            enabled: true,
            attempt: 0,
        };
        (machine, msg_tx)
    }

    /// Worker loop. Consumes the machine; runs until `Shutdown`.
    pub(crate) async fn run(mut self) {
        self.claim_existing().await;

        while let Some(msg) = self.msg_rx.recv().await {
            match msg {
                TrackerMessage::Event(event) => self.handle_event(event).await,
                TrackerMessage::Command(TrackerCommand::Shutdown) => {
                    debug!("{}: worker shutting down", self.policy.kind);
                    break;
                }
                TrackerMessage::Command(cmd) => self.handle_command(cmd).await,
                TrackerMessage::Configured { attempt, result } => {
                    self.handle_configured(attempt, result).await;
                }
            }
        }
    }

    /// Claim an interface that already exists at startup and try to
    /// connect to it.
    async fn claim_existing(&mut self) {
        let names = match self.port.list().await {
            Ok(names) => names,
            Err(e) => {
                warn!("{}: could not list interfaces: {}", self.policy.kind, e);
                return;
            }
        };

        for name in names {
            if self.policy.matches(&name) {
                self.claim(name).await;
                // Stop any stale address state from a previous run before
                // the first attempt; sessions are left alone
                if self.policy.kind == TransportKind::Wired {
                    if let Some(iface) = self.interface.clone() {
                        if let Err(e) = self.configurator.release(&iface).await {
                            debug!("{}: startup release on {}: {}", self.policy.kind, iface, e);
                        }
                    }
                }
                self.try_connect().await;
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::InterfaceAdded { name } => {
                if !self.policy.matches(&name) {
                    return;
                }
                // Binding is exclusive; a second match is ignored
                if self.interface.is_some() {
                    debug!(
                        "{}: already claimed {:?}, ignoring added interface {}",
                        self.policy.kind, self.interface, name
                    );
                    return;
                }
                self.claim(name).await;
                if self.link_up {
                    self.try_connect().await;
                }
            }
            LinkEvent::InterfaceRemoved { name } => {
                if self.interface.as_deref() != Some(name.as_str()) {
                    return;
                }
                info!("{}: removing {}", self.policy.kind, name);
                self.disconnect(true).await;
                self.interface = None;
                self.hardware_address = None;
                self.link_up = false;
                self.update_snapshot().await;
            }
            LinkEvent::LinkUp { name } => {
                if self.interface.as_deref() != Some(name.as_str()) {
                    return;
                }
                // Duplicates are compared against the last-known link flag
                if self.link_up {
                    debug!("{}: duplicate link-up on {}, ignoring", self.policy.kind, name);
                    return;
                }
                info!("{}: link up on {}", self.policy.kind, name);
                self.link_up = true;
                self.update_snapshot().await;
                self.try_connect().await;
            }
            LinkEvent::LinkDown { name } => {
                if self.interface.as_deref() != Some(name.as_str()) {
                    return;
                }
                if !self.link_up {
                    debug!("{}: duplicate link-down on {}, ignoring", self.policy.kind, name);
                    return;
                }
                info!("{}: link down on {}", self.policy.kind, name);
                self.link_up = false;
                self.disconnect(true).await;
            }
        }
    }

    async fn handle_command(&mut self, cmd: TrackerCommand) {
        match cmd {
            TrackerCommand::Teardown => {
                info!("{}: teardown requested", self.policy.kind);
                self.teardown_requested = true;
                self.disconnect(true).await;
            }
            TrackerCommand::Reconnect => {
                debug!("{}: reconnect requested", self.policy.kind);
                self.teardown_requested = false;
                self.try_connect().await;
            }
            TrackerCommand::Enable => {
                info!("{}: enable requested", self.policy.kind);
                self.enabled = true;
                if let Some(iface) = self.interface.clone() {
                    if let Err(e) = self.port.bring_up(&iface).await {
                        warn!("{}: error upping interface {}: {}", self.policy.kind, iface, e);
                    }
                }
                self.try_connect().await;
            }
            TrackerCommand::Disable => {
                info!("{}: disable requested", self.policy.kind);
                self.enabled = false;
                self.disconnect(true).await;
                if let Some(iface) = self.interface.clone() {
                    if let Err(e) = self.port.bring_down(&iface).await {
                        warn!("{}: error downing interface {}: {}", self.policy.kind, iface, e);
                    }
                }
            }
            TrackerCommand::SiblingDisconnected { interface } => {
                let watches = self.policy.underlying_interface.as_deref() == Some(interface.as_str());
                if watches && self.state == ConnectivityState::Connected {
                    info!(
                        "{}: underlying physical interface {} disconnected, stopping session",
                        self.policy.kind, interface
                    );
                    self.disconnect(true).await;
                }
            }
            TrackerCommand::Shutdown => unreachable!("handled by the worker loop"),
        }
    }

    async fn handle_configured(&mut self, attempt: u64, result: TrackerResult<ResolvedLink>) {
        if attempt != self.attempt {
            debug!("{}: stale configuration result discarded", self.policy.kind);
            // A stale success may have applied addresses; undo it
            if result.is_ok() {
                if let Some(iface) = self.interface.clone() {
                    let _ = self.configurator.release(&iface).await;
                }
            }
            return;
        }

        if self.teardown_requested || self.state != ConnectivityState::Connecting {
            info!(
                "{}: configuration completed after teardown, discarding",
                self.policy.kind
            );
            if result.is_ok() {
                if let Some(iface) = self.interface.clone() {
                    let _ = self.configurator.release(&iface).await;
                }
            }
            if self.state != ConnectivityState::Disconnected {
                self.state = ConnectivityState::Disconnected;
                self.publish_state();
            }
            self.update_snapshot().await;
            return;
        }

        match result {
            Ok(properties) => {
                info!(
                    "{}: connected on {:?} ({:?})",
                    self.policy.kind, properties.interface, properties.address
                );
                self.state = ConnectivityState::Connected;
                self.properties = properties;
                self.publish_config();
                self.publish_state();
            }
            Err(e) => {
                warn!("{}: configuration failed: {}", self.policy.kind, e);
                self.state = ConnectivityState::Disconnected;
                self.publish_state();
            }
        }
        self.update_snapshot().await;
    }

    /// Claim an interface: record it, bring it administratively up and
    /// capture its hardware address and link flag.
    async fn claim(&mut self, name: String) {
        info!("{}: adding {}", self.policy.kind, name);

        // Link state indications only arrive once the interface is up
        if let Err(e) = self.port.bring_up(&name).await {
            warn!("{}: error upping interface {}: {}", self.policy.kind, name, e);
        }

        self.hardware_address = self.port.hardware_address(&name).await;
        self.link_up = self.port.has_carrier(&name).await.unwrap_or(false);
        self.interface = Some(name);
        self.update_snapshot().await;
    }

    /// Start a connection attempt if the preconditions hold. No-op while
    /// already connecting/connected, while teardown is pending, or while
    /// the transport is disabled.
    async fn try_connect(&mut self) {
        if self.teardown_requested {
            debug!("{}: teardown pending, not connecting", self.policy.kind);
            return;
        }
        if !self.enabled {
            debug!("{}: disabled, not connecting", self.policy.kind);
            return;
        }
        if self.state != ConnectivityState::Disconnected {
            return;
        }
        let Some(iface) = self.interface.clone() else {
            return;
        };
        if !self.link_up {
            debug!("{}: link down on {}, not connecting", self.policy.kind, iface);
            return;
        }

        match self.port.has_carrier(&iface).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{}: no carrier on {}, not connecting", self.policy.kind, iface);
                return;
            }
            Err(e) => {
                warn!("{}: carrier query failed on {}: {}", self.policy.kind, iface, e);
                return;
            }
        }

        if let Err(e) = self.port.bring_up(&iface).await {
            warn!("{}: error upping interface {}: {}", self.policy.kind, iface, e);
        }

        // The store is consulted per attempt so late edits take effect
        self.mode = self.configurator.select_mode().await;

        info!(
            "{}: connecting on {} (mode {:?})",
            self.policy.kind, iface, self.mode
        );
        self.state = ConnectivityState::Connecting;
        self.publish_state();
        self.update_snapshot().await;

        self.attempt += 1;
        let attempt = self.attempt;
        let configurator = self.configurator.clone();
        let msg_tx = self.msg_tx.clone();
        let mode = self.mode;

        // Configuration may block for seconds; run it off the worker so
        // link and teardown events stay observable
        tokio::spawn(async move {
            let result = configurator.configure(&iface, mode).await;
            let _ = msg_tx.send(TrackerMessage::Configured { attempt, result });
        });
    }

    /// Return to Disconnected: invalidate any in-flight configuration,
    /// release held addresses and clear the published properties.
    async fn disconnect(&mut self, release: bool) {
        self.attempt += 1;

        if release {
            if let Some(iface) = self.interface.clone() {
                if let Err(e) = self.configurator.release(&iface).await {
                    warn!("{}: release on {} failed: {}", self.policy.kind, iface, e);
                }
            }
        }

        let had_properties = !self.properties.is_empty();
        self.properties.clear();
        if had_properties {
            self.publish_config();
        }

        if self.state != ConnectivityState::Disconnected {
            self.state = ConnectivityState::Disconnected;
            self.publish_state();
        }
        self.update_snapshot().await;
    }

    fn publish_state(&self) {
        let _ = self.notify_tx.send(TrackerNotification::StateChanged {
            transport: self.policy.kind,
            state: self.state,
            interface: self.interface.clone(),
        });
    }

    fn publish_config(&self) {
        let _ = self.notify_tx.send(TrackerNotification::ConfigChanged {
            transport: self.policy.kind,
            properties: self.properties.clone(),
        });
    }

    async fn update_snapshot(&self) {
        let mut snap = self.snapshot.write().await;
        *snap = TrackerSnapshot {
            state: self.state,
            interface: self.interface.clone(),
            link_up: self.link_up,
            hardware_address: self.hardware_address.clone(),
            properties: self.properties.clone(),
        };
    }
}
