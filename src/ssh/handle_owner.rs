//! Handle Owner Task
//!
//! Only one task owns the session handle. Relays talk to it through a
//! cloneable `HandleController` that sends commands over an mpsc channel,
//! so the handle is never shared behind a lock.
//!
//! Channel opens run as child tasks of the owner: a target that never
//! answers holds up only its own client, and a disconnect aborts every
//! open still in flight.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "db1:5432:5432".into());
//! let channel = controller.open_direct_tcpip("localhost", 5432, "127.0.0.1", 0).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the transport died underneath it
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// The session operations the owner task performs
#[async_trait]
pub trait OwnedHandle: Send + Sync + 'static {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
impl OwnedHandle for Handle<ClientHandler> {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    fn is_closed(&self) -> bool {
        Handle::is_closed(self)
    }

    async fn disconnect(&self) {
        let _ = Handle::disconnect(self, russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (one per forwarded client connection)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect { reply_tx: oneshot::Sender<()> },
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies the sender). Whoever holds a controller can
/// open channels and disconnect the session.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits, for any reason
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to SSH disconnect notifications.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the server
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection and wait for the owner task to finish.
    ///
    /// Returns `Disconnected` when the session was already gone.
    pub async fn disconnect(&self) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::Disconnect { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the handle and returns a controller for sending commands.
/// `label` is only used for logging.
pub fn spawn_handle_owner_task<H: OwnedHandle>(handle: H, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = Arc::new(handle);
        let mut opens = JoinSet::new();
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        let mut disconnect_reply: Option<oneshot::Sender<()>> = None;

        debug!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let handle = handle.clone();
                        opens.spawn(async move {
                            let result = handle
                                .open_direct_tcpip(&host, port, &originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                // Dropping the channel makes the server close it
                                debug!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(HandleCommand::Disconnect { reply_tx }) => {
                        info!("Disconnect requested for {}", label);
                        disconnect_reply = Some(reply_tx);
                        break;
                    }
                    None => {
                        debug!("All controllers dropped for {}", label);
                        break;
                    }
                },
                Some(_) = opens.join_next() => {}
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection lost for {}", label);
                        break;
                    }
                }
            }
        }

        // Pending opens reply `Disconnected` through their dropped senders
        opens.abort_all();
        while opens.join_next().await.is_some() {}

        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);

        handle.disconnect().await;

        if let Some(reply_tx) = disconnect_reply {
            let _ = reply_tx.send(());
        }
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect { reply_tx } => {
                let _ = reply_tx.send(());
            }
        }
    }
}
