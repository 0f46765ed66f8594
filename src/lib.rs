//! sshtunnel - Local port forwarding over SSH
//!
//! Resolves host aliases from an SSH config file, opens one SSH session per
//! tunnel and relays loopback connections over `direct-tcpip` channels.
//! The set of active tunnels is persisted and restored on the next start.

pub mod config;
pub mod ssh;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{HostConfig, JsonSnapshotStore, Settings, SshConfigFile};
pub use ssh::{RusshSessionProvider, SessionProvider, TunnelSession};
pub use tunnel::{TunnelError, TunnelKey, TunnelManager, TunnelSpec};

/// Initialize logging
///
/// `RUST_LOG` wins over `default_level` when set.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
