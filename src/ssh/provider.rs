//! Session provider seam
//!
//! The tunnel manager only needs two things from SSH: a session per tunnel
//! and a byte stream per forwarded connection. `SessionProvider` and
//! `TunnelSession` capture exactly that, so the manager can run against
//! russh in production and a loopback provider in tests.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::debug;

use super::client::SshClient;
use super::config::SshConfig;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::config::HostConfig;

/// Anything that can sit on the remote side of a relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send + ?Sized> AsyncStream for T {}

/// Type-erased forwarded channel
pub type RelayStream = Pin<Box<dyn AsyncStream>>;

/// One authenticated SSH session owned by exactly one tunnel
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Open a forwarded data channel to `host:port` as seen from the server
    async fn open_channel(&self, host: &str, port: u16) -> Result<RelayStream, SshError>;

    /// Receiver that fires once the underlying transport is gone
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    /// Close the session. Fails with `Disconnected` if it was already closed.
    async fn close(&self) -> Result<(), SshError>;
}

/// Opens sessions for resolved host aliases
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn TunnelSession>, SshError>;
}

/// russh-backed session
pub struct RusshSession {
    controller: HandleController,
}

#[async_trait]
impl TunnelSession for RusshSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<RelayStream, SshError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::pin(channel.into_stream()))
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    async fn close(&self) -> Result<(), SshError> {
        self.controller.disconnect().await
    }
}

/// Production provider: one russh connection per call
#[derive(Debug, Clone)]
pub struct RusshSessionProvider {
    timeout_secs: u64,
}

impl RusshSessionProvider {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

impl Default for RusshSessionProvider {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl SessionProvider for RusshSessionProvider {
    async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn TunnelSession>, SshError> {
        let config = SshConfig::from_host(host, self.timeout_secs);
        let label = format!("{}@{}:{}", config.username, config.host, config.port);
        let handle = SshClient::new(config).connect().await?;

        debug!("Session established for alias {}", host.alias);
        let controller = spawn_handle_owner_task(handle, label);
        Ok(Arc::new(RusshSession { controller }))
    }
}
