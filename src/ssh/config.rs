//! SSH Configuration

use serde::{Deserialize, Serialize};

use crate::config::HostConfig;

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,
}

impl AuthMethod {
    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

impl SshConfig {
    /// Build connection parameters for a resolved host alias.
    ///
    /// Hosts with an `IdentityFile` authenticate with that key, all others
    /// fall back to the running SSH agent.
    pub fn from_host(host: &HostConfig, timeout_secs: u64) -> Self {
        let auth = match &host.identity_file {
            Some(path) => AuthMethod::key(path.clone(), None),
            None => AuthMethod::Agent,
        };
        Self {
            host: host.hostname.clone(),
            port: host.port,
            username: host.user.clone(),
            auth,
            timeout_secs,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Agent,
            timeout_secs: 30,
        }
    }
}
