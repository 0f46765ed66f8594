//! SSH Local Forwarding
//!
//! `TunnelManager` keeps a registry of tunnels, each one an SSH session
//! plus a loopback listener whose connections are relayed over
//! `direct-tcpip` channels.

mod error;
mod manager;
mod probe;
mod relay;
mod types;

pub use error::TunnelError;
pub use manager::TunnelManager;
pub use probe::{bind_local, is_port_free, LISTEN_ADDR};
pub use types::{
    CreatedTunnel, HostTestReport, ManagerStatus, RelayStats, RestoreReport, StopAllReport,
    StopFailure, TunnelInfo, TunnelKey, TunnelSpec, TunnelUptime, DEFAULT_REMOTE_HOST,
};
