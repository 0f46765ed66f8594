//! Runtime settings
//!
//! Every option can come from a flag or its environment variable; the
//! binary turns the parsed `Cli` into `Settings` before wiring the manager.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use super::storage::DEFAULT_SNAPSHOT_FILE;

/// Alias file looked up in the working directory before `~/.ssh/config`
pub const DEFAULT_HOSTS_FILE: &str = "ssh-config";

#[derive(Parser, Debug)]
#[command(name = "sshtunnel", about = "Local port forwarding over SSH", version)]
pub struct Cli {
    /// SSH config file with host aliases
    #[arg(long, global = true, env = "SSHTUNNEL_HOSTS_FILE")]
    pub hosts_file: Option<PathBuf>,

    /// File the active tunnel list is persisted to
    #[arg(long, global = true, env = "SSHTUNNEL_SNAPSHOT_FILE", default_value = DEFAULT_SNAPSHOT_FILE)]
    pub snapshot_file: PathBuf,

    /// Seconds to wait for an SSH handshake
    #[arg(long, global = true, env = "SSHTUNNEL_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, env = "SSHTUNNEL_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Restore saved tunnels and keep them running until Ctrl-C (default)
    Run {
        /// Extra tunnel to open, as alias:localPort:remotePort[:remoteHost]
        #[arg(short = 'L', long = "forward")]
        forwards: Vec<String>,

        /// Skip restoring the saved tunnel list
        #[arg(long)]
        no_restore: bool,
    },
    /// List configured host aliases
    Hosts,
    /// Open and close a session to check an alias
    Test {
        alias: String,
    },
    /// Check whether a local port is free
    CheckPort {
        port: u16,
    },
}

/// Resolved settings shared by every command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub hosts_file: PathBuf,
    pub snapshot_file: PathBuf,
    pub connect_timeout_secs: u64,
    pub log_level: String,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            hosts_file: cli.hosts_file.clone().unwrap_or_else(default_hosts_file),
            snapshot_file: cli.snapshot_file.clone(),
            connect_timeout_secs: cli.connect_timeout,
            log_level: cli.log_level.clone(),
        }
    }
}

/// `./ssh-config` when present, otherwise the user's `~/.ssh/config`
pub fn default_hosts_file() -> PathBuf {
    let local = PathBuf::from(DEFAULT_HOSTS_FILE);
    if local.exists() {
        return local;
    }
    super::ssh_config::default_ssh_config_path().unwrap_or(local)
}
