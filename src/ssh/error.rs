//! SSH Error types

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Key file not found: {0}")]
    KeyFileNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

/// Coarse reason a session could not be established.
///
/// Callers surface this to users instead of the raw provider message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    /// TCP connect to the SSH server was refused or unreachable
    ConnectionRefused,
    /// Server rejected every credential offered
    AuthenticationFailed,
    /// The configured identity file does not exist
    KeyFileNotFound,
    /// Handshake did not finish within the provider timeout
    Timeout,
    Other,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectFailure::ConnectionRefused => "Cannot connect to SSH server",
            ConnectFailure::AuthenticationFailed => "SSH authentication failed. Check your SSH key.",
            ConnectFailure::KeyFileNotFound => "SSH private key file not found",
            ConnectFailure::Timeout => "SSH connection timed out",
            ConnectFailure::Other => "SSH connection failed",
        };
        f.write_str(text)
    }
}

impl SshError {
    /// Interpret this error as a connect-time failure reason
    pub fn connect_failure(&self) -> ConnectFailure {
        match self {
            SshError::AuthenticationFailed(_)
            | SshError::AgentNotAvailable(_)
            | SshError::AgentError(_) => ConnectFailure::AuthenticationFailed,
            SshError::KeyFileNotFound(_) => ConnectFailure::KeyFileNotFound,
            SshError::Timeout(_) => ConnectFailure::Timeout,
            SshError::IoError(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ConnectFailure::KeyFileNotFound
            }
            SshError::IoError(e) if is_refused(e.kind()) => ConnectFailure::ConnectionRefused,
            SshError::ConnectionFailed(msg) | SshError::ProtocolError(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("refused") || lower.contains("unreachable") {
                    ConnectFailure::ConnectionRefused
                } else {
                    ConnectFailure::Other
                }
            }
            _ => ConnectFailure::Other,
        }
    }
}

fn is_refused(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}
