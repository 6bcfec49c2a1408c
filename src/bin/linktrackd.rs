//! Wired-link tracking daemon (linktrackd)
//!
//! Watches interface hotplug/link events, arbitrates DHCP vs. static
//! address configuration and publishes connectivity state for the wired
//! and (optionally) PPPoE transports.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root for address configuration)
//! sudo linktrackd
//!
//! # With a config file and verbose logging
//! sudo linktrackd --config /etc/linktrack/linktrackd.toml --log-level debug
//! ```

use clap::Parser;
use liblinktrack::configurator::{PppoeConfigurator, SystemConfigurator};
use liblinktrack::dhcp::DhcpClient;
use liblinktrack::error::TrackerResult;
use liblinktrack::registry::{TrackerNotification, TrackerRegistry};
use liblinktrack::static_config::StaticStore;
use liblinktrack::tracker::TransportPolicy;
use liblinktrack::watcher::InterfaceWatcher;
use liblinktrack::TrackdConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Wired-link tracking daemon
#[derive(Parser, Debug)]
#[command(name = "linktrackd")]
#[command(author = "linktrack contributors")]
#[command(version)]
#[command(about = "Tracks wired-link connectivity and address configuration", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> TrackerResult<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting wired-link tracking daemon (linktrackd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - address configuration may fail");
        }
    }

    let config = match &args.config {
        Some(path) => TrackdConfig::load(path)?,
        None => TrackdConfig::default(),
    };

    // Interface watcher feeds every tracker
    let watcher = Arc::new(InterfaceWatcher::new());
    if let Err(e) = watcher.start().await {
        // The tracker stays inert for this run; the host restarts us
        error!("Failed to start interface watcher: {}", e);
        return Err(e);
    }

    let mut registry = TrackerRegistry::new();

    // Wired transport
    let store = StaticStore::new(&config.wired.static_config);
    let dhcp = DhcpClient::with_binary(
        &config.dhcp.client_bin,
        Duration::from_secs(config.dhcp.timeout_secs),
    );
    registry.add_tracker(
        TransportPolicy::wired(&config.wired.pattern)?,
        watcher.clone(),
        Arc::new(SystemConfigurator::new(store, dhcp)),
        watcher.subscribe(),
    )?;
    info!("Tracking wired interfaces matching '{}'", config.wired.pattern);

    // PPPoE transport, when configured
    if let Some(pppoe) = &config.pppoe {
        registry.add_tracker(
            TransportPolicy::pppoe(&pppoe.pattern, &pppoe.underlying)?,
            watcher.clone(),
            Arc::new(PppoeConfigurator::new(
                &pppoe.resolv_conf,
                pppoe.stop_command.clone(),
            )),
            watcher.subscribe(),
        )?;
        info!(
            "Tracking PPPoE sessions matching '{}' over {}",
            pppoe.pattern, pppoe.underlying
        );
    }

    // Log published transitions until shutdown
    let mut notifications = registry.subscribe();
    let log_task = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(TrackerNotification::StateChanged { transport, state, interface }) => {
                    info!("{}: state {:?} (interface {:?})", transport, state, interface);
                }
                Ok(TrackerNotification::ConfigChanged { transport, properties }) => {
                    info!("{}: link properties {:?}", transport, properties);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Notification log lagged by {}", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("linktrackd running, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Signal handling error: {}", e);
    }

    info!("Shutting down");
    registry.shutdown();
    watcher.stop().await?;
    log_task.abort();

    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
