//! linktrack - Wired-link network state tracker
//!
//! Async library tracking the connectivity lifecycle of wired transports:
//! - Interface hotplug and link-state watching (netlink)
//! - Address arbitration (DHCP vs. static configuration)
//! - Per-transport connectivity state machines
//! - Connectivity/config change publishing to subscribers
//!
//! One state machine tracks one claimed interface per transport kind
//! (Ethernet-like or PPPoE-like); the registry routes commands and
//! cross-transport coordination.

pub mod error;
pub mod validation;
pub mod watcher;
pub mod static_config;
pub mod dhcp;
pub mod configurator;
pub mod tracker;
pub mod registry;
pub mod config;

// Re-export commonly used types
pub use error::{TrackerError, TrackerResult};
pub use watcher::{InterfaceWatcher, LinkEvent, LinkPort};
pub use static_config::{StaticIpConfig, StaticIpSection, StaticStore};
pub use dhcp::{DhcpClient, DhcpLease};
pub use configurator::{
    AddressConfigurator, ConfigMode, PppoeConfigurator, ResolvedLink, SystemConfigurator,
};
pub use tracker::{
    ConnectivityState, TrackerCommand, TrackerSnapshot, TransportKind, TransportPolicy,
};
pub use registry::{TrackerNotification, TrackerRegistry};
pub use config::TrackdConfig;
