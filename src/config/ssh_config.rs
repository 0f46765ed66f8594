//! Host alias resolution
//!
//! Parses an OpenSSH-style config file into `HostConfig` entries.
//! Supported directives: Host, HostName, User, Port, IdentityFile.
//! The file is re-read on every lookup so edits apply without a restart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Default login user when the alias has no `User` directive
pub const DEFAULT_USER: &str = "root";

/// Default SSH port when the alias has no `Port` directive
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection parameters for one alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Host alias (the pattern after "Host")
    #[serde(rename = "host")]
    pub alias: String,
    /// Actual hostname, the alias itself when `HostName` is absent
    pub hostname: String,
    pub port: u16,
    pub user: String,
    /// Identity file path with `~/` expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

impl HostConfig {
    /// Entry for `alias` with every directive at its default
    pub fn with_defaults(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            hostname: alias.clone(),
            alias,
            port: DEFAULT_SSH_PORT,
            user: DEFAULT_USER.to_string(),
            identity_file: None,
        }
    }
}

/// SSH config parser errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps host aliases to connection parameters
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Look up one alias; `Ok(None)` when it is not configured
    async fn resolve(&self, alias: &str) -> Result<Option<HostConfig>, SshConfigError>;

    /// Every configured alias, in file order
    async fn hosts(&self) -> Result<Vec<HostConfig>, SshConfigError>;
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Resolver backed by a config file on disk
#[derive(Debug, Clone)]
pub struct SshConfigFile {
    path: PathBuf,
}

impl SshConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HostResolver for SshConfigFile {
    async fn resolve(&self, alias: &str) -> Result<Option<HostConfig>, SshConfigError> {
        Ok(self.hosts().await?.into_iter().find(|h| h.alias == alias))
    }

    async fn hosts(&self) -> Result<Vec<HostConfig>, SshConfigError> {
        parse_ssh_config(&self.path).await
    }
}

/// Parse SSH config file. A missing file yields no hosts.
pub async fn parse_ssh_config(path: &Path) -> Result<Vec<HostConfig>, SshConfigError> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new());
        }
        Err(e) => return Err(SshConfigError::Io(e)),
    };

    Ok(parse_ssh_config_content(&content))
}

/// Parse SSH config content string
pub fn parse_ssh_config_content(content: &str) -> Vec<HostConfig> {
    let mut hosts = Vec::new();
    let mut current: Option<PartialHost> = None;

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // "Key Value" or "Key=Value"
        let (key, value) = if let Some(eq_pos) = line.find('=') {
            (line[..eq_pos].trim(), line[eq_pos + 1..].trim())
        } else {
            let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
            if parts.len() < 2 {
                continue;
            }
            (parts[0], parts[1].trim())
        };

        let key_lower = key.to_lowercase();

        if key_lower == "host" {
            if let Some(host) = current.take() {
                hosts.push(host.finish());
            }

            // "Host foo bar": take the first concrete alias, skip patterns
            current = value
                .split_whitespace()
                .find(|alias| !alias.contains('*') && !alias.contains('?'))
                .map(PartialHost::new);
        } else if let Some(ref mut host) = current {
            match key_lower.as_str() {
                "hostname" => host.hostname = Some(value.to_string()),
                "user" => host.user = Some(value.to_string()),
                "port" => host.port = value.parse().ok(),
                "identityfile" => host.identity_file = Some(expand_home(value)),
                _ => {}
            }
        }
    }

    if let Some(host) = current {
        hosts.push(host.finish());
    }

    hosts
}

/// Host block collected while parsing, before defaults are applied
struct PartialHost {
    alias: String,
    hostname: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<String>,
}

impl PartialHost {
    fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            hostname: None,
            user: None,
            port: None,
            identity_file: None,
        }
    }

    fn finish(self) -> HostConfig {
        HostConfig {
            hostname: self.hostname.unwrap_or_else(|| self.alias.clone()),
            port: self.port.unwrap_or(DEFAULT_SSH_PORT),
            user: self.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            identity_file: self.identity_file,
            alias: self.alias,
        }
    }
}

fn expand_home(value: &str) -> String {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(stripped), Some(home)) => home.join(stripped).to_string_lossy().into_owned(),
        _ => value.to_string(),
    }
}
