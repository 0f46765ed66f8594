//! Configuration Module
//!
//! Host alias resolution, the persisted tunnel snapshot, and runtime
//! settings.

pub mod settings;
pub mod ssh_config;
pub mod storage;

pub use settings::{Cli, Command, Settings};
pub use ssh_config::{
    default_ssh_config_path, parse_ssh_config, HostConfig, HostResolver, SshConfigError,
    SshConfigFile,
};
pub use storage::{JsonSnapshotStore, SnapshotEntry, SnapshotStore, StorageError};
