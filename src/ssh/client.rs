//! SSH Client implementation using russh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info};

use super::agent::SshAgentClient;
use super::config::{AuthMethod, SshConfig};
use super::error::SshError;

/// SSH Client handler for russh
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate, returning the raw russh handle
    pub async fn connect(self) -> Result<client::Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let timeout = Duration::from_secs(self.config.timeout_secs);

        info!("Connecting to SSH server at {}", addr);

        // Fail fast on a missing key before spending a handshake on it
        if let AuthMethod::Key { key_path, .. } = &self.config.auth {
            if tokio::fs::metadata(Path::new(key_path)).await.is_err() {
                return Err(SshError::KeyFileNotFound(key_path.clone()));
            }
        }

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.config.host.clone(), self.config.port);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed for {}", addr);

        match &self.config.auth {
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                let result = handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

                if !result.success() {
                    return Err(SshError::AuthenticationFailed(
                        "Authentication rejected by server".to_string(),
                    ));
                }
            }
            AuthMethod::Agent => {
                let mut agent = SshAgentClient::connect().await?;
                agent.authenticate(&mut handle, &self.config.username).await?;
            }
        }

        info!(
            "SSH authentication successful for {}@{}",
            self.config.username, addr
        );

        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Server keys are accepted and their fingerprint logged; tunnels rely on
/// the operator's host alias file, not on known_hosts pinning.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} is {}",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}
