//! Tracker registry
//!
//! Owns one link state machine per transport kind and exposes the uniform
//! query/command surface external callers use. The registry is constructed
//! once by the host process and handed around by reference; there is no
//! ambient global instance.
//!
//! Cross-transport coordination happens only through the published
//! notification channel: a PPPoE tracker learns about its underlying
//! physical link going away from the sibling's state-changed notification,
//! never by touching the sibling's state.

use crate::configurator::{AddressConfigurator, ResolvedLink};
use crate::error::{TrackerError, TrackerResult};
use crate::tracker::{
    ConnectivityState, LinkStateMachine, TrackerCommand, TrackerMessage, TrackerSnapshot,
    TransportKind, TransportPolicy,
};
use crate::watcher::{LinkEvent, LinkPort};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// Notifications published to external subscribers.
///
/// Delivery is at-least-once; subscribers that need exactly-once must
/// deduplicate against their last-seen state.
#[derive(Debug, Clone)]
pub enum TrackerNotification {
    /// A transport's connectivity state changed
    StateChanged {
        transport: TransportKind,
        state: ConnectivityState,
        /// Claimed interface at the time of the transition
        interface: Option<String>,
    },
    /// A transport's resolved link properties were replaced (or cleared)
    ConfigChanged {
        transport: TransportKind,
        properties: ResolvedLink,
    },
}

struct TrackerHandle {
    msg_tx: mpsc::UnboundedSender<TrackerMessage>,
    snapshot: Arc<RwLock<TrackerSnapshot>>,
}

/// Holds one state machine per transport kind
pub struct TrackerRegistry {
    notify_tx: broadcast::Sender<TrackerNotification>,
    trackers: HashMap<TransportKind, TrackerHandle>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(100);
        Self {
            notify_tx,
            trackers: HashMap::new(),
        }
    }

    /// Subscribe to state-changed and config-changed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        self.notify_tx.subscribe()
    }

    /// Register and start a state machine for a transport.
    ///
    /// `events` is a subscription to the interface watcher; the registry
    /// forwards it onto the machine's serialized worker so transitions stay
    /// ordered against link events.
    pub fn add_tracker(
        &mut self,
        policy: TransportPolicy,
        port: Arc<dyn LinkPort>,
        configurator: Arc<dyn AddressConfigurator>,
        events: broadcast::Receiver<LinkEvent>,
    ) -> TrackerResult<()> {
        let kind = policy.kind;
        if self.trackers.contains_key(&kind) {
            return Err(TrackerError::InvalidState(format!(
                "transport {} already tracked",
                kind
            )));
        }

        let snapshot = Arc::new(RwLock::new(TrackerSnapshot::default()));
        let watches_sibling = policy.underlying_interface.is_some();

        let (machine, msg_tx) = LinkStateMachine::new(
            policy,
            port,
            configurator,
            snapshot.clone(),
            self.notify_tx.clone(),
        );

        tokio::spawn(machine.run());

        Self::spawn_event_forwarder(kind, events, msg_tx.clone());
        if watches_sibling {
            self.spawn_sibling_watcher(kind, msg_tx.clone());
        }

        self.trackers.insert(kind, TrackerHandle { msg_tx, snapshot });
        Ok(())
    }

    /// Forward watcher events onto the transport's worker
    fn spawn_event_forwarder(
        kind: TransportKind,
        mut events: broadcast::Receiver<LinkEvent>,
        msg_tx: mpsc::UnboundedSender<TrackerMessage>,
    ) {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if msg_tx.send(TrackerMessage::Event(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("{} tracker lagged behind by {} link events", kind, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("{}: event source closed", kind);
                        break;
                    }
                }
            }
        });
    }

    /// Forward sibling disconnects to a session transport via the
    /// published notifications only
    fn spawn_sibling_watcher(&self, kind: TransportKind, msg_tx: mpsc::UnboundedSender<TrackerMessage>) {
        let mut notifications = self.notify_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(TrackerNotification::StateChanged {
                        transport,
                        state: ConnectivityState::Disconnected,
                        interface: Some(interface),
                    }) if transport != kind => {
                        let cmd = TrackerCommand::SiblingDisconnected { interface };
                        if msg_tx.send(TrackerMessage::Command(cmd)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("{} sibling watcher lagged behind by {} notifications", kind, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Current connectivity state; Disconnected for untracked transports
    pub async fn get_state(&self, transport: TransportKind) -> ConnectivityState {
        match self.trackers.get(&transport) {
            Some(handle) => handle.snapshot.read().await.state,
            None => ConnectivityState::Disconnected,
        }
    }

    /// Resolved link properties. Returns the cleared/empty value while
    /// disconnected or untracked, never a null reference.
    pub async fn get_link_properties(&self, transport: TransportKind) -> ResolvedLink {
        match self.trackers.get(&transport) {
            Some(handle) => handle.snapshot.read().await.properties.clone(),
            None => ResolvedLink::default(),
        }
    }

    /// Full snapshot copy of a transport's externally visible state
    pub async fn get_snapshot(&self, transport: TransportKind) -> TrackerSnapshot {
        match self.trackers.get(&transport) {
            Some(handle) => handle.snapshot.read().await.clone(),
            None => TrackerSnapshot::default(),
        }
    }

    /// Request teardown. Cooperative: an in-flight configuration is
    /// discarded when it completes.
    pub fn teardown(&self, transport: TransportKind) {
        self.send(transport, TrackerCommand::Teardown);
    }

    /// Clear the teardown flag and retry. Returns the current link-up flag
    /// immediately; reconfiguration itself is asynchronous.
    pub async fn reconnect(&self, transport: TransportKind) -> bool {
        let link_up = match self.trackers.get(&transport) {
            Some(handle) => handle.snapshot.read().await.link_up,
            None => false,
        };
        self.send(transport, TrackerCommand::Reconnect);
        link_up
    }

    /// Bring the transport's interface up and retry connection
    pub fn enable(&self, transport: TransportKind) {
        self.send(transport, TrackerCommand::Enable);
    }

    /// Disconnect and set the transport's interface administratively down
    pub fn disable(&self, transport: TransportKind) {
        self.send(transport, TrackerCommand::Disable);
    }

    /// Stop all worker tasks
    pub fn shutdown(&self) {
        for kind in self.trackers.keys() {
            self.send(*kind, TrackerCommand::Shutdown);
        }
    }

    fn send(&self, transport: TransportKind, cmd: TrackerCommand) {
        match self.trackers.get(&transport) {
            Some(handle) => {
                if handle.msg_tx.send(TrackerMessage::Command(cmd)).is_err() {
                    warn!("{}: worker gone, command dropped", transport);
                }
            }
            None => {
                debug!("{}: not tracked, command ignored", transport);
            }
        }
    }
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
