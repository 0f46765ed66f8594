use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use sshtunnel::config::{Cli, Command, JsonSnapshotStore, Settings, SshConfigFile};
use sshtunnel::ssh::RusshSessionProvider;
use sshtunnel::tunnel::{TunnelManager, TunnelSpec};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli);
    sshtunnel::init_logging(&settings.log_level);

    let manager = TunnelManager::new(
        Arc::new(SshConfigFile::new(&settings.hosts_file)),
        Arc::new(RusshSessionProvider::new(settings.connect_timeout_secs)),
        Arc::new(JsonSnapshotStore::new(&settings.snapshot_file)),
    );

    match cli.command {
        None => cmd_run(&manager, &settings, Vec::new(), false).await,
        Some(Command::Run {
            forwards,
            no_restore,
        }) => cmd_run(&manager, &settings, forwards, no_restore).await,
        Some(Command::Hosts) => cmd_hosts(&manager).await,
        Some(Command::Test { alias }) => cmd_test(&manager, &alias).await,
        Some(Command::CheckPort { port }) => cmd_check_port(&manager, port).await,
    }
}

/// Restore, open the requested forwards, then hold them until Ctrl-C
async fn cmd_run(
    manager: &TunnelManager,
    settings: &Settings,
    forwards: Vec<String>,
    no_restore: bool,
) -> Result<()> {
    info!("SSH config: {}", settings.hosts_file.display());
    info!("Saved forwards: {}", settings.snapshot_file.display());

    if !no_restore {
        manager.restore_all().await;
    }

    for forward in &forwards {
        let spec: TunnelSpec = forward
            .parse()
            .with_context(|| format!("invalid --forward '{}'", forward))?;
        match manager.create_tunnel(spec).await {
            Ok(created) => info!("{}", created.message),
            Err(e) => error!("Failed to create {}: {}", forward, e),
        }
    }

    let active = manager.list_active().await;
    if active.is_empty() {
        warn!("No active tunnels; waiting for Ctrl-C");
    }
    for tunnel in &active {
        info!(
            "{} -> {}:{} via {}",
            tunnel.bound_addr, tunnel.spec.remote_host, tunnel.spec.remote_port, tunnel.key.host_alias
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down gracefully...");
    let report = manager.shutdown().await;
    for failure in &report.errors {
        warn!("{}: {}", failure.key, failure.error);
    }
    Ok(())
}

async fn cmd_hosts(manager: &TunnelManager) -> Result<()> {
    let hosts = manager.list_hosts().await?;
    if hosts.is_empty() {
        println!("No host aliases configured");
    }
    for host in hosts {
        println!("{:<20} {}@{}:{}", host.alias, host.user, host.hostname, host.port);
    }
    Ok(())
}

async fn cmd_test(manager: &TunnelManager, alias: &str) -> Result<()> {
    let report = manager.test_host(alias).await?;
    println!(
        "SSH connection to {} successful ({}@{}:{}, {} ms)",
        report.host, report.user, report.hostname, report.port, report.connect_time_ms
    );
    Ok(())
}

async fn cmd_check_port(manager: &TunnelManager, port: u16) -> Result<()> {
    let available = manager.probe_port(port).await?;
    println!(
        "Port {} is {}",
        port,
        if available { "available" } else { "in use" }
    );
    Ok(())
}
