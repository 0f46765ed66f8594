//! Tunnel data model

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::TunnelError;
use crate::config::SnapshotEntry;

/// Remote host used when a `TunnelSpec` does not name one
pub const DEFAULT_REMOTE_HOST: &str = "localhost";

/// Identity of a tunnel: `(alias, local port, remote port)`.
///
/// The remote host is deliberately not part of the key, matching the
/// persisted `"alias:localPort:remotePort"` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    pub host_alias: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl TunnelKey {
    pub fn new(host_alias: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            host_alias: host_alias.into(),
            local_port,
            remote_port,
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host_alias, self.local_port, self.remote_port)
    }
}

impl FromStr for TunnelKey {
    type Err = TunnelError;

    /// Ports are taken from the right, so aliases may contain `:`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TunnelError::InvalidKey(s.to_string());
        let mut parts = s.rsplitn(3, ':');
        let remote_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let local_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let host_alias = parts.next().filter(|a| !a.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(host_alias, local_port, remote_port))
    }
}

impl Serialize for TunnelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TunnelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Creation request for a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    pub host_alias: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Host as seen from the SSH server's network
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
}

fn default_remote_host() -> String {
    DEFAULT_REMOTE_HOST.to_string()
}

impl TunnelSpec {
    pub fn new(host_alias: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            host_alias: host_alias.into(),
            local_port,
            remote_port,
            remote_host: default_remote_host(),
        }
    }

    pub fn with_remote_host(mut self, remote_host: impl Into<String>) -> Self {
        self.remote_host = remote_host.into();
        self
    }

    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.host_alias.clone(), self.local_port, self.remote_port)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.host_alias.trim().is_empty() {
            return Err(TunnelError::InvalidSpec("host alias is empty".into()));
        }
        if self.local_port == 0 {
            return Err(TunnelError::InvalidPort(self.local_port));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::InvalidPort(self.remote_port));
        }
        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::InvalidSpec("remote host is empty".into()));
        }
        Ok(())
    }
}

impl FromStr for TunnelSpec {
    type Err = TunnelError;

    /// `alias:localPort:remotePort[:remoteHost]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TunnelError::InvalidSpec(format!("'{}' is not alias:local:remote[:host]", s));
        let parts: Vec<&str> = s.split(':').collect();
        let (alias, local, remote, host) = match parts.as_slice() {
            [alias, local, remote] => (*alias, *local, *remote, None),
            [alias, local, remote, host] => (*alias, *local, *remote, Some(*host)),
            _ => return Err(invalid()),
        };
        let local_port = local.parse().map_err(|_| invalid())?;
        let remote_port = remote.parse().map_err(|_| invalid())?;

        let mut spec = TunnelSpec::new(alias, local_port, remote_port);
        if let Some(host) = host {
            spec = spec.with_remote_host(host);
        }
        spec.validate()?;
        Ok(spec)
    }
}

impl From<&SnapshotEntry> for TunnelSpec {
    fn from(entry: &SnapshotEntry) -> Self {
        TunnelSpec::new(entry.host.clone(), entry.local_port, entry.remote_port)
            .with_remote_host(entry.remote_host.clone())
    }
}

/// Per-tunnel relay counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Connections currently relaying or opening a channel
    pub active_connections: u64,
    /// Bytes sent local -> remote (counted when a relay finishes)
    pub bytes_sent: u64,
    /// Bytes received remote -> local (counted when a relay finishes)
    pub bytes_received: u64,
}

/// One row of `list_active`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub key: TunnelKey,
    pub spec: TunnelSpec,
    pub start_time: DateTime<Utc>,
    pub bound_addr: SocketAddr,
    pub stats: RelayStats,
}

impl TunnelInfo {
    pub(crate) fn to_snapshot_entry(&self) -> SnapshotEntry {
        SnapshotEntry {
            connection_key: self.key.to_string(),
            host: self.spec.host_alias.clone(),
            local_port: self.spec.local_port,
            remote_port: self.spec.remote_port,
            remote_host: self.spec.remote_host.clone(),
            start_time: self.start_time,
        }
    }
}

/// Result of a successful create
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTunnel {
    pub key: TunnelKey,
    pub message: String,
}

/// Teardown failure collected by `stop_all`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopFailure {
    pub key: TunnelKey,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllReport {
    pub stopped: Vec<TunnelKey>,
    pub errors: Vec<StopFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
}

/// Outcome of `test_host`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTestReport {
    pub host: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub connect_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUptime {
    pub key: TunnelKey,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Manager-wide health summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub active_tunnels: usize,
    pub tunnels: Vec<TunnelUptime>,
}
