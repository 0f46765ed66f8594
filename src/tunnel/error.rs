//! Tunnel manager errors

use thiserror::Error;

use crate::config::SshConfigError;
use crate::ssh::{ConnectFailure, SshError};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("SSH config not found for host '{0}'")]
    ConfigNotFound(String),

    #[error("Port forwarding already active: {0}")]
    AlreadyActive(String),

    #[error("Local port {0} is already in use")]
    PortInUse(u16),

    #[error("Failed to bind 127.0.0.1:{port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("{reason} ({alias}): {detail}")]
    SshConnect {
        alias: String,
        reason: ConnectFailure,
        detail: String,
    },

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Invalid port {0}: must be between 1-65535")]
    InvalidPort(u16),

    #[error("Invalid tunnel spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid connection key '{0}': expected alias:localPort:remotePort")]
    InvalidKey(String),

    #[error("Host config error: {0}")]
    HostConfig(#[from] SshConfigError),

    #[error("Failed to tear down {key}: {reason}")]
    Teardown { key: String, reason: String },
}

impl TunnelError {
    pub(crate) fn ssh_connect(alias: &str, err: SshError) -> Self {
        TunnelError::SshConnect {
            alias: alias.to_string(),
            reason: err.connect_failure(),
            detail: err.to_string(),
        }
    }
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
