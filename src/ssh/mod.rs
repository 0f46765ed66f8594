//! SSH module - sessions and forwarded channels
//!
//! Built on russh. Each tunnel owns one session; the russh handle lives in
//! a dedicated owner task (see `handle_owner`) and the rest of the crate
//! reaches it through the `TunnelSession` trait.

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
mod provider;

pub use agent::SshAgentClient;
pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::{ConnectFailure, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, OwnedHandle};
pub use provider::{
    AsyncStream, RelayStream, RusshSession, RusshSessionProvider, SessionProvider, TunnelSession,
};
