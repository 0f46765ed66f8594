//! Tunnel Connection Manager
//!
//! Owns every active tunnel: its SSH session, its local listener and the
//! relays running on it. All lifecycle operations go through here, and
//! every registry mutation is followed by a snapshot write.
//!
//! Lock discipline: the registry lock is only held to insert, remove or
//! read records. SSH handshakes and teardown run outside of it, so
//! `list_active` never waits on a slow server.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::probe::{bind_local, is_port_free};
use super::relay::{spawn_accept_loop, RelayTarget};
use super::types::{
    CreatedTunnel, HostTestReport, ManagerStatus, RelayStats, RestoreReport, StopAllReport,
    StopFailure, TunnelInfo, TunnelKey, TunnelSpec, TunnelUptime,
};
use crate::config::{HostConfig, HostResolver, SnapshotStore};
use crate::ssh::{SessionProvider, SshError, TunnelSession};

/// Internal tracking for one active tunnel
struct TunnelRecord {
    spec: TunnelSpec,
    session: Arc<dyn TunnelSession>,
    accept_task: JoinHandle<()>,
    cancel: CancellationToken,
    start_time: DateTime<Utc>,
    bound_addr: SocketAddr,
    stats: Arc<parking_lot::RwLock<RelayStats>>,
}

impl TunnelRecord {
    fn info(&self, key: &TunnelKey) -> TunnelInfo {
        TunnelInfo {
            key: key.clone(),
            spec: self.spec.clone(),
            start_time: self.start_time,
            bound_addr: self.bound_addr,
            stats: self.stats.read().clone(),
        }
    }
}

/// Key held by an in-flight create or teardown; released on drop
struct Reservation<'a> {
    pending: &'a SyncMutex<HashSet<TunnelKey>>,
    key: TunnelKey,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// SSH tunnel manager
///
/// One instance per process. Thread-safe; share it behind an `Arc`.
pub struct TunnelManager {
    resolver: Arc<dyn HostResolver>,
    provider: Arc<dyn SessionProvider>,
    store: Arc<dyn SnapshotStore>,
    /// Active tunnels
    tunnels: RwLock<HashMap<TunnelKey, TunnelRecord>>,
    /// Keys being created or torn down
    pending: SyncMutex<HashSet<TunnelKey>>,
    /// Serialises snapshot writes
    persist_lock: Mutex<()>,
    /// Parent of every tunnel's token
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl TunnelManager {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            resolver,
            provider,
            store,
            tunnels: RwLock::new(HashMap::new()),
            pending: SyncMutex::new(HashSet::new()),
            persist_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Create a local forward `127.0.0.1:local_port -> remote_host:remote_port`
    /// through a fresh SSH session to `host_alias`.
    ///
    /// On error nothing is left behind: no record, no listener, no session.
    pub async fn create_tunnel(&self, spec: TunnelSpec) -> Result<CreatedTunnel, TunnelError> {
        spec.validate()?;

        let host = self
            .resolver
            .resolve(&spec.host_alias)
            .await?
            .ok_or_else(|| TunnelError::ConfigNotFound(spec.host_alias.clone()))?;

        let key = spec.key();
        let reservation = self.reserve(&key).await?;

        if !is_port_free(spec.local_port).await {
            return Err(TunnelError::PortInUse(spec.local_port));
        }

        info!(
            "Creating tunnel {}: localhost:{} -> {}@{}:{} -> {}:{}",
            key, spec.local_port, host.user, host.hostname, host.port, spec.remote_host, spec.remote_port
        );

        let session = self
            .provider
            .connect(&host)
            .await
            .map_err(|e| TunnelError::ssh_connect(&spec.host_alias, e))?;

        let listener = match bind_local(spec.local_port).await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!("Closing session after bind failure: {}", close_err);
                }
                return Err(e);
            }
        };

        let bound_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!("Closing session after bind failure: {}", close_err);
                }
                return Err(TunnelError::Bind {
                    port: spec.local_port,
                    reason: e.to_string(),
                });
            }
        };

        // No await between spawning the accept loop and registering it: a
        // caller that drops this future before the lock is granted drops the
        // listener and session with it
        {
            let mut tunnels = self.tunnels.write().await;

            let cancel = self.shutdown.child_token();
            let stats = Arc::new(parking_lot::RwLock::new(RelayStats::default()));
            let accept_task = spawn_accept_loop(
                listener,
                session.clone(),
                RelayTarget::from(&spec),
                cancel.clone(),
                stats.clone(),
                key.to_string(),
            );

            tunnels.insert(
                key.clone(),
                TunnelRecord {
                    spec: spec.clone(),
                    session,
                    accept_task,
                    cancel,
                    start_time: Utc::now(),
                    bound_addr,
                    stats,
                },
            );
        }
        drop(reservation);

        self.persist().await;

        info!("Tunnel {} active on {}", key, bound_addr);
        Ok(CreatedTunnel {
            message: format!(
                "Port forwarding active: localhost:{} -> {}:{}",
                spec.local_port, spec.host_alias, spec.remote_port
            ),
            key,
        })
    }

    /// Claim `key` for a creation. The pending set is checked before the
    /// registry, and a finished creation inserts its record before
    /// releasing the claim, so two racing calls can never both pass.
    async fn reserve(&self, key: &TunnelKey) -> Result<Reservation<'_>, TunnelError> {
        if !self.pending.lock().insert(key.clone()) {
            return Err(TunnelError::AlreadyActive(key.to_string()));
        }
        let reservation = Reservation {
            pending: &self.pending,
            key: key.clone(),
        };

        if self.tunnels.read().await.contains_key(key) {
            return Err(TunnelError::AlreadyActive(key.to_string()));
        }

        Ok(reservation)
    }

    /// Hold `key` in the pending set while a removed record is torn down,
    /// so a create for the same key is refused until the port is released.
    /// Must be called under the registry write lock.
    fn hold(&self, key: &TunnelKey) -> Option<Reservation<'_>> {
        self.pending.lock().insert(key.clone()).then(|| Reservation {
            pending: &self.pending,
            key: key.clone(),
        })
    }

    /// Stop one tunnel. On return its local port is free again.
    ///
    /// Teardown order: listener, relays, session. The record leaves the
    /// registry first; its key stays reserved until teardown finishes.
    pub async fn stop_tunnel(&self, key: &TunnelKey) -> Result<(), TunnelError> {
        let (record, held) = {
            let mut tunnels = self.tunnels.write().await;
            let record = tunnels
                .remove(key)
                .ok_or_else(|| TunnelError::NotFound(key.to_string()))?;
            (record, self.hold(key))
        };

        if let Err(e) = teardown(key, record).await {
            warn!("{}", e);
        }
        drop(held);

        self.persist().await;

        info!("Stopped tunnel {}", key);
        Ok(())
    }

    /// Stop every tunnel. Individual teardown failures are reported, not
    /// propagated, and the (now empty) snapshot is written regardless.
    pub async fn stop_all(&self) -> StopAllReport {
        let report = self.teardown_all().await;
        self.persist().await;

        info!(
            "Stopped {} tunnel(s), {} error(s)",
            report.stopped.len(),
            report.errors.len()
        );
        report
    }

    /// Process-exit teardown: like `stop_all` but the snapshot is left as
    /// is, so the same tunnels come back on the next start.
    pub async fn shutdown(&self) -> StopAllReport {
        let report = self.teardown_all().await;
        info!("Shut down {} tunnel(s)", report.stopped.len());
        report
    }

    async fn teardown_all(&self) -> StopAllReport {
        let (mut drained, _held): (Vec<(TunnelKey, TunnelRecord)>, Vec<_>) = {
            let mut tunnels = self.tunnels.write().await;
            let drained: Vec<_> = tunnels.drain().collect();
            let held = drained.iter().filter_map(|(key, _)| self.hold(key)).collect();
            (drained, held)
        };
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = StopAllReport::default();
        for (key, record) in drained {
            match teardown(&key, record).await {
                Ok(()) => report.stopped.push(key),
                Err(e) => {
                    warn!("{}", e);
                    report.errors.push(StopFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Active tunnels, sorted by key
    pub async fn list_active(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        let mut infos: Vec<TunnelInfo> = tunnels.iter().map(|(key, r)| r.info(key)).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Recreate every tunnel from the snapshot, one at a time
    pub async fn restore_all(&self) -> RestoreReport {
        let entries = match self.store.load().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to load saved forwards: {}", e);
                return RestoreReport::default();
            }
        };

        if entries.is_empty() {
            info!("No saved forwards to restore");
            return RestoreReport::default();
        }

        info!("Restoring {} saved forward(s)...", entries.len());

        let mut report = RestoreReport::default();
        for entry in &entries {
            let spec = TunnelSpec::from(entry);
            let key = spec.key();
            match self.create_tunnel(spec).await {
                Ok(_) => {
                    report.restored += 1;
                    info!("Restored forwarding: {}", key);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to restore {}: {}", key, e);
                }
            }
        }

        info!(
            "Restoration complete: {} successful, {} failed",
            report.restored, report.failed
        );
        report
    }

    /// Whether `127.0.0.1:port` can currently be bound
    pub async fn probe_port(&self, port: u16) -> Result<bool, TunnelError> {
        if port == 0 {
            return Err(TunnelError::InvalidPort(port));
        }
        Ok(is_port_free(port).await)
    }

    /// Every host alias the resolver knows
    pub async fn list_hosts(&self) -> Result<Vec<HostConfig>, TunnelError> {
        Ok(self.resolver.hosts().await?)
    }

    /// Open a session to `alias`, close it again and report how long the
    /// handshake took
    pub async fn test_host(&self, alias: &str) -> Result<HostTestReport, TunnelError> {
        let host = self
            .resolver
            .resolve(alias)
            .await?
            .ok_or_else(|| TunnelError::ConfigNotFound(alias.to_string()))?;

        let started = Instant::now();
        let session = self
            .provider
            .connect(&host)
            .await
            .map_err(|e| TunnelError::ssh_connect(alias, e))?;
        let connect_time_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = session.close().await {
            debug!("Closing test session for {}: {}", alias, e);
        }

        info!("SSH test for {} succeeded in {} ms", alias, connect_time_ms);
        Ok(HostTestReport {
            host: host.alias,
            hostname: host.hostname,
            port: host.port,
            user: host.user,
            connect_time_ms,
        })
    }

    /// Uptime and per-tunnel durations
    pub async fn status(&self) -> ManagerStatus {
        let now = Utc::now();
        let tunnels: Vec<TunnelUptime> = self
            .list_active()
            .await
            .into_iter()
            .map(|info| TunnelUptime {
                duration_ms: (now - info.start_time).num_milliseconds(),
                start_time: info.start_time,
                key: info.key,
            })
            .collect();

        ManagerStatus {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            active_tunnels: tunnels.len(),
            tunnels,
        }
    }

    /// Write the registry to the snapshot store. The registry is read under
    /// the persist lock so the last write always reflects the last mutation.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;

        let mut entries: Vec<_> = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .iter()
                .map(|(key, record)| record.info(key).to_snapshot_entry())
                .collect()
        };
        entries.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.connection_key.cmp(&b.connection_key))
        });

        if let Err(e) = self.store.save(&entries).await {
            error!("Failed to save forwards: {}", e);
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Cancel the accept loop, wait for it (listener closed, relays finished)
/// and close the session.
async fn teardown(key: &TunnelKey, record: TunnelRecord) -> Result<(), TunnelError> {
    record.cancel.cancel();

    let mut problems = Vec::new();

    if let Err(e) = record.accept_task.await {
        problems.push(format!("accept loop failed: {}", e));
    }

    match record.session.close().await {
        Ok(()) | Err(SshError::Disconnected) => {}
        Err(e) => problems.push(format!("session close failed: {}", e)),
    }

    if problems.is_empty() {
        debug!("Tunnel {} torn down", key);
        Ok(())
    } else {
        Err(TunnelError::Teardown {
            key: key.to_string(),
            reason: problems.join("; "),
        })
    }
}
