//! Link state machine and registry integration tests
//!
//! Drives the trackers with scripted interface events and a fake address
//! configurator, asserting the published state transitions.

use async_trait::async_trait;
use liblinktrack::configurator::{AddressConfigurator, ConfigMode, ResolvedLink};
use liblinktrack::error::{TrackerError, TrackerResult};
use liblinktrack::registry::{TrackerNotification, TrackerRegistry};
use liblinktrack::tracker::{ConnectivityState, TransportKind, TransportPolicy};
use liblinktrack::watcher::{LinkEvent, LinkPort};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep, timeout, Duration};

/// Scriptable interface port: carrier and interface list are controlled
/// by the test.
struct FakePort {
    interfaces: Mutex<Vec<String>>,
    carrier: Mutex<HashMap<String, bool>>,
}

impl FakePort {
    fn new(interfaces: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            interfaces: Mutex::new(interfaces.iter().map(|s| s.to_string()).collect()),
            carrier: Mutex::new(HashMap::new()),
        })
    }

    fn set_carrier(&self, interface: &str, present: bool) {
        self.carrier
            .lock()
            .unwrap()
            .insert(interface.to_string(), present);
    }
}

#[async_trait]
impl LinkPort for FakePort {
    async fn list(&self) -> TrackerResult<Vec<String>> {
        Ok(self.interfaces.lock().unwrap().clone())
    }

    async fn is_admin_up(&self, _interface: &str) -> TrackerResult<bool> {
        Ok(true)
    }

    async fn has_carrier(&self, interface: &str) -> TrackerResult<bool> {
        Ok(*self.carrier.lock().unwrap().get(interface).unwrap_or(&false))
    }

    async fn hardware_address(&self, _interface: &str) -> Option<String> {
        Some("02:00:00:aa:bb:cc".to_string())
    }

    async fn bring_up(&self, _interface: &str) -> TrackerResult<()> {
        Ok(())
    }

    async fn bring_down(&self, _interface: &str) -> TrackerResult<()> {
        Ok(())
    }
}

/// Canned configurator recording its invocations. An optional gate makes
/// `configure` block until the test releases it.
struct FakeConfigurator {
    link: ResolvedLink,
    fail: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    configure_calls: AtomicUsize,
    release_calls: AtomicUsize,
    last_mode: Mutex<Option<ConfigMode>>,
}

impl FakeConfigurator {
    fn new(link: ResolvedLink) -> Arc<Self> {
        Arc::new(Self {
            link,
            fail: AtomicBool::new(false),
            gate: Mutex::new(None),
            configure_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            last_mode: Mutex::new(None),
        })
    }

    fn gated(link: ResolvedLink, gate: Arc<Notify>) -> Arc<Self> {
        let this = Self::new(link);
        *this.gate.lock().unwrap() = Some(gate);
        this
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn configure_calls(&self) -> usize {
        self.configure_calls.load(Ordering::SeqCst)
    }

    fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressConfigurator for FakeConfigurator {
    async fn configure(&self, interface: &str, mode: ConfigMode) -> TrackerResult<ResolvedLink> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_mode.lock().unwrap() = Some(mode);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(TrackerError::DhcpFailed("simulated failure".to_string()));
        }

        let mut link = self.link.clone();
        link.interface = Some(interface.to_string());
        Ok(link)
    }

    async fn release(&self, _interface: &str) -> TrackerResult<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sample_link() -> ResolvedLink {
    ResolvedLink {
        interface: None,
        address: Some("192.168.1.50".parse().unwrap()),
        prefix_len: 24,
        gateway: Some("192.168.1.1".parse().unwrap()),
        dns: vec!["8.8.8.8".parse().unwrap()],
    }
}

async fn wait_for_state(
    registry: &TrackerRegistry,
    transport: TransportKind,
    expected: ConnectivityState,
) {
    let deadline = timeout(Duration::from_secs(2), async {
        loop {
            if registry.get_state(transport).await == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        deadline.is_ok(),
        "timed out waiting for {:?} on {}, currently {:?}",
        expected,
        transport,
        registry.get_state(transport).await
    );
}

/// Registry with one wired tracker claiming `^eth\d$`, fed from the
/// returned event sender. The port starts with no interfaces so claiming
/// is event driven.
fn wired_registry(
    port: Arc<FakePort>,
    configurator: Arc<FakeConfigurator>,
) -> (TrackerRegistry, broadcast::Sender<LinkEvent>) {
    let (event_tx, event_rx) = broadcast::channel(64);
    let mut registry = TrackerRegistry::new();
    registry
        .add_tracker(
            TransportPolicy::wired(r"^eth\d$").unwrap(),
            port,
            configurator,
            event_rx,
        )
        .unwrap();
    (registry, event_tx)
}

fn added(name: &str) -> LinkEvent {
    LinkEvent::InterfaceAdded { name: name.to_string() }
}

fn removed(name: &str) -> LinkEvent {
    LinkEvent::InterfaceRemoved { name: name.to_string() }
}

fn link_up(name: &str) -> LinkEvent {
    LinkEvent::LinkUp { name: name.to_string() }
}

fn link_down(name: &str) -> LinkEvent {
    LinkEvent::LinkDown { name: name.to_string() }
}

#[tokio::test]
async fn connect_scenario_publishes_exact_lease() {
    let port = FakePort::new(&[]);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());
    let mut notifications = registry.subscribe();

    // Interface appears with no carrier: must stay disconnected
    event_tx.send(added("eth0")).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        registry.get_state(TransportKind::Wired).await,
        ConnectivityState::Disconnected
    );
    assert_eq!(configurator.configure_calls(), 0);

    // Carrier appears
    port.set_carrier("eth0", true);
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;

    // DHCP was the selected mode
    assert_eq!(
        *configurator.last_mode.lock().unwrap(),
        Some(ConfigMode::Dhcp)
    );

    // config-changed carries the exact lease values
    let mut published = None;
    while let Ok(n) = notifications.try_recv() {
        if let TrackerNotification::ConfigChanged { properties, .. } = n {
            published = Some(properties);
        }
    }
    let properties = published.expect("no config-changed notification");
    assert_eq!(properties.interface.as_deref(), Some("eth0"));
    assert_eq!(properties.address, Some("192.168.1.50".parse::<IpAddr>().unwrap()));
    assert_eq!(properties.prefix_len, 24);
    assert_eq!(properties.gateway, Some("192.168.1.1".parse::<IpAddr>().unwrap()));
    assert_eq!(properties.dns, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);

    let snapshot = registry.get_snapshot(TransportKind::Wired).await;
    assert_eq!(snapshot.interface.as_deref(), Some("eth0"));
    assert!(snapshot.link_up);
}

#[tokio::test]
async fn duplicate_link_up_is_idempotent() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;

    // Duplicates while connected must not reconfigure
    event_tx.send(link_up("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(configurator.configure_calls(), 1);
    assert_eq!(
        registry.get_state(TransportKind::Wired).await,
        ConnectivityState::Connected
    );
}

#[tokio::test]
async fn teardown_during_connecting_wins() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let gate = Arc::new(Notify::new());
    let configurator = FakeConfigurator::gated(sample_link(), gate.clone());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connecting).await;

    registry.teardown(TransportKind::Wired);
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Disconnected).await;

    // Let the in-flight attempt complete successfully; teardown still wins
    gate.notify_one();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        registry.get_state(TransportKind::Wired).await,
        ConnectivityState::Disconnected
    );
    assert!(registry.get_link_properties(TransportKind::Wired).await.is_empty());
    // The discarded result was released
    assert!(configurator.release_calls() >= 1);
}

#[tokio::test]
async fn configure_failure_returns_to_disconnected() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let configurator = FakeConfigurator::new(sample_link());
    configurator.set_fail(true);
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        registry.get_state(TransportKind::Wired).await,
        ConnectivityState::Disconnected
    );
    assert!(registry.get_link_properties(TransportKind::Wired).await.is_empty());
    assert_eq!(configurator.configure_calls(), 1);

    // Recoverable: the next link-up retries
    configurator.set_fail(false);
    event_tx.send(link_down("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;
}

#[tokio::test]
async fn removal_while_connected_clears_properties() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;
    assert!(!registry.get_link_properties(TransportKind::Wired).await.is_empty());

    event_tx.send(removed("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Disconnected).await;

    assert!(registry.get_link_properties(TransportKind::Wired).await.is_empty());
    assert!(configurator.release_calls() >= 1);
    assert!(registry.get_snapshot(TransportKind::Wired).await.interface.is_none());
}

#[tokio::test]
async fn second_matching_interface_is_ignored() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    port.set_carrier("eth1", true);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(added("eth1")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    // Events for the unclaimed sibling must not disturb the machine
    event_tx.send(link_up("eth1")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;

    let snapshot = registry.get_snapshot(TransportKind::Wired).await;
    assert_eq!(snapshot.interface.as_deref(), Some("eth0"));
    assert_eq!(configurator.configure_calls(), 1);
}

#[tokio::test]
async fn reconnect_after_teardown() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;

    registry.teardown(TransportKind::Wired);
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Disconnected).await;

    // While teardown is pending, link events do not reconnect
    event_tx.send(link_down("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        registry.get_state(TransportKind::Wired).await,
        ConnectivityState::Disconnected
    );

    // reconnect clears the flag and reports the link flag immediately
    assert!(registry.reconnect(TransportKind::Wired).await);
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;
}

#[tokio::test]
async fn transitions_follow_the_state_table() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());
    let mut notifications = registry.subscribe();

    event_tx.send(added("eth0")).unwrap();
    for _ in 0..3 {
        event_tx.send(link_up("eth0")).unwrap();
        event_tx.send(link_up("eth0")).unwrap();
        sleep(Duration::from_millis(50)).await;
        event_tx.send(link_down("eth0")).unwrap();
        event_tx.send(link_down("eth0")).unwrap();
        sleep(Duration::from_millis(50)).await;
    }

    let mut states = vec![ConnectivityState::Disconnected];
    while let Ok(n) = notifications.try_recv() {
        if let TrackerNotification::StateChanged { state, .. } = n {
            states.push(state);
        }
    }

    for pair in states.windows(2) {
        let legal = matches!(
            (pair[0], pair[1]),
            (ConnectivityState::Disconnected, ConnectivityState::Connecting)
                | (ConnectivityState::Connecting, ConnectivityState::Connected)
                | (ConnectivityState::Connecting, ConnectivityState::Disconnected)
                | (ConnectivityState::Connected, ConnectivityState::Disconnected)
        );
        assert!(legal, "illegal transition {:?} -> {:?}", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn pppoe_stops_when_underlying_link_disconnects() {
    // One port for both transports; both interfaces exist at startup
    let port = FakePort::new(&["eth0", "ppp0"]);
    port.set_carrier("eth0", true);
    port.set_carrier("ppp0", true);

    let wired_configurator = FakeConfigurator::new(sample_link());
    let pppoe_link = ResolvedLink {
        interface: None,
        address: Some("10.64.0.1".parse().unwrap()),
        prefix_len: 32,
        gateway: None,
        dns: vec!["1.1.1.1".parse().unwrap()],
    };
    let pppoe_configurator = FakeConfigurator::new(pppoe_link);

    let (event_tx, wired_rx) = broadcast::channel(64);
    let pppoe_rx = event_tx.subscribe();

    let mut registry = TrackerRegistry::new();
    registry
        .add_tracker(
            TransportPolicy::wired(r"^eth\d$").unwrap(),
            port.clone(),
            wired_configurator.clone(),
            wired_rx,
        )
        .unwrap();
    registry
        .add_tracker(
            TransportPolicy::pppoe(r"^ppp\d$", "eth0").unwrap(),
            port.clone(),
            pppoe_configurator.clone(),
            pppoe_rx,
        )
        .unwrap();

    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;
    wait_for_state(&registry, TransportKind::Pppoe, ConnectivityState::Connected).await;

    let releases_before = pppoe_configurator.release_calls();

    // The physical link under the session drops
    event_tx.send(link_down("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Disconnected).await;
    wait_for_state(&registry, TransportKind::Pppoe, ConnectivityState::Disconnected).await;

    // The session was stopped, not just marked down
    assert!(pppoe_configurator.release_calls() > releases_before);
    assert!(registry.get_link_properties(TransportKind::Pppoe).await.is_empty());
}

#[tokio::test]
async fn disable_blocks_connection_until_enable() {
    let port = FakePort::new(&[]);
    port.set_carrier("eth0", true);
    let configurator = FakeConfigurator::new(sample_link());
    let (registry, event_tx) = wired_registry(port.clone(), configurator.clone());

    event_tx.send(added("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;

    registry.disable(TransportKind::Wired);
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Disconnected).await;

    // Link events while disabled are ignored
    event_tx.send(link_down("eth0")).unwrap();
    event_tx.send(link_up("eth0")).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        registry.get_state(TransportKind::Wired).await,
        ConnectivityState::Disconnected
    );

    registry.enable(TransportKind::Wired);
    wait_for_state(&registry, TransportKind::Wired, ConnectivityState::Connected).await;
}
