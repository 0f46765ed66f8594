//! Relay engine
//!
//! One accept loop per tunnel. Every accepted socket gets its own task that
//! opens a forwarded channel and copies bytes both ways:
//!
//! `Accepted -> ChannelOpening -> Relaying -> Closed`
//!
//! A clean EOF on one side half-closes the other; an I/O error or a
//! cancelled tunnel closes both ends at once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{RelayStats, TunnelSpec};
use crate::ssh::{SshError, TunnelSession};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for sending EOF to the remote side on cancellation
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Where forwarded connections go, as seen from the SSH server
#[derive(Debug, Clone)]
pub(crate) struct RelayTarget {
    pub host: String,
    pub port: u16,
}

impl From<&TunnelSpec> for RelayTarget {
    fn from(spec: &TunnelSpec) -> Self {
        Self {
            host: spec.remote_host.clone(),
            port: spec.remote_port,
        }
    }
}

/// Spawn the accept loop for one tunnel.
///
/// The task owns the listener; it returns only after `cancel` fires, the
/// listener is closed and every relay it spawned has finished.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    session: Arc<dyn TunnelSession>,
    target: RelayTarget,
    cancel: CancellationToken,
    stats: Arc<RwLock<RelayStats>>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut relays = JoinSet::new();
        let mut disconnect_rx = session.subscribe_disconnect();
        let mut session_alive = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Accept loop for {} cancelled", label);
                    break;
                }

                _ = disconnect_rx.recv(), if session_alive => {
                    session_alive = false;
                    warn!(
                        "SSH session for {} is gone; connections will fail until the tunnel is stopped",
                        label
                    );
                }

                Some(joined) = relays.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Relay task for {} panicked: {}", label, e);
                        }
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Accepted connection from {} on {}", peer_addr, label);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let session = session.clone();
                        let target = target.clone();
                        let stats = stats.clone();
                        let cancel = cancel.child_token();

                        relays.spawn(async move {
                            let result =
                                relay_connection(session.as_ref(), stream, &target, &cancel, &stats)
                                    .await;

                            {
                                let mut s = stats.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }

                            if let Err(e) = result {
                                warn!("Forward to {}:{} failed: {}", target.host, target.port, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", label, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        drop(listener);

        // Relays hold child tokens of `cancel`, so they are already closing
        while let Some(joined) = relays.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Relay task for {} panicked: {}", label, e);
                }
            }
        }

        info!("Local listener for {} closed", label);
    })
}

/// Relay one accepted socket through a fresh channel
async fn relay_connection(
    session: &dyn TunnelSession,
    local: TcpStream,
    target: &RelayTarget,
    cancel: &CancellationToken,
    stats: &RwLock<RelayStats>,
) -> Result<(), SshError> {
    // ChannelOpening; on failure `local` is dropped, which closes it
    let channel = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        opened = session.open_channel(&target.host, target.port) => opened?,
    };

    debug!("Opened channel to {}:{}", target.host, target.port);

    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(channel);

    let upstream = async {
        let sent = tokio::io::copy(&mut local_read, &mut remote_write).await?;
        let _ = remote_write.shutdown().await;
        Ok::<u64, std::io::Error>(sent)
    };

    let downstream = async {
        let received = tokio::io::copy(&mut remote_read, &mut local_write).await?;
        let _ = local_write.shutdown().await;
        Ok::<u64, std::io::Error>(received)
    };

    // try_join drops the surviving direction as soon as one side errors
    let finished = tokio::select! {
        _ = cancel.cancelled() => None,
        joined = async { tokio::try_join!(upstream, downstream) } => Some(joined),
    };

    match finished {
        None => {
            let _ = tokio::time::timeout(CLOSE_GRACE, remote_write.shutdown()).await;
            debug!("Relay to {}:{} closed by tunnel stop", target.host, target.port);
            Ok(())
        }
        Some(Ok((sent, received))) => {
            {
                let mut s = stats.write();
                s.bytes_sent += sent;
                s.bytes_received += received;
            }
            debug!(
                "Relay to {}:{} finished ({} bytes sent, {} received)",
                target.host, target.port, sent, received
            );
            Ok(())
        }
        Some(Err(e)) => Err(SshError::IoError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::sync::broadcast;

    use crate::ssh::RelayStream;

    /// Session whose channels are plain TCP connections to the target
    struct DirectSession {
        disconnect_tx: broadcast::Sender<()>,
    }

    #[async_trait]
    impl TunnelSession for DirectSession {
        async fn open_channel(&self, host: &str, port: u16) -> Result<RelayStream, SshError> {
            let stream = TcpStream::connect((host, port)).await?;
            Ok(Box::pin(stream))
        }

        fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
            self.disconnect_tx.subscribe()
        }

        async fn close(&self) -> Result<(), SshError> {
            Ok(())
        }
    }

    fn direct_session() -> Arc<dyn TunnelSession> {
        let (disconnect_tx, _) = broadcast::channel(1);
        Arc::new(DirectSession { disconnect_tx })
    }

    #[tokio::test]
    async fn test_cancel_closes_listener_and_relays() {
        // Remote end that never sends anything and never closes
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote.local_addr().unwrap().port();
        let holder = tokio::spawn(async move {
            let (socket, _) = remote.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let stats = Arc::new(RwLock::new(RelayStats::default()));
        let task = spawn_accept_loop(
            listener,
            direct_session(),
            RelayTarget {
                host: "127.0.0.1".into(),
                port: remote_port,
            },
            cancel.clone(),
            stats.clone(),
            "test".into(),
        );

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.read().active_connections, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("accept loop did not stop")
            .unwrap();

        // Client side sees the connection end
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("client was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(stats.read().active_connections, 0);
        assert_eq!(stats.read().connection_count, 1);
        assert!(TcpListener::bind(local_addr).await.is_ok());
        holder.abort();
    }
}
