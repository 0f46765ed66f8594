//! Tunnel manager behaviour against a loopback session provider.
//!
//! Channels opened by the loopback session are plain TCP connections to the
//! target, so relaying can be checked end to end without an SSH server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use sshtunnel::config::{HostConfig, JsonSnapshotStore, SnapshotEntry, SnapshotStore, SshConfigFile};
use sshtunnel::ssh::{ConnectFailure, RelayStream, SessionProvider, SshError, TunnelSession};
use sshtunnel::tunnel::{is_port_free, TunnelError, TunnelKey, TunnelManager, TunnelSpec};

const HOSTS: &str = "\
Host db1
    HostName 127.0.0.1
    User tester

Host web
    HostName 127.0.0.1
    Port 2222

Host down
    HostName unreachable
";

const WAIT: Duration = Duration::from_secs(5);

struct LoopbackSession {
    disconnect_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

#[async_trait]
impl TunnelSession for LoopbackSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<RelayStream, SshError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        Ok(Box::pin(stream))
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn close(&self) -> Result<(), SshError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        let _ = self.disconnect_tx.send(());
        Ok(())
    }
}

struct LoopbackProvider;

#[async_trait]
impl SessionProvider for LoopbackProvider {
    async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn TunnelSession>, SshError> {
        // Leave a window for concurrent creates to overlap
        tokio::time::sleep(Duration::from_millis(50)).await;
        if host.hostname == "unreachable" {
            return Err(SshError::ConnectionFailed("connect ECONNREFUSED: Connection refused".into()));
        }
        let (disconnect_tx, _) = broadcast::channel(1);
        Ok(Arc::new(LoopbackSession {
            disconnect_tx,
            closed: AtomicBool::new(false),
        }))
    }
}

struct Fixture {
    dir: TempDir,
    manager: Arc<TunnelManager>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let manager = Arc::new(build_manager(dir.path()));
        Self { dir, manager }
    }

    fn snapshot_path(&self) -> std::path::PathBuf {
        self.dir.path().join("saved-forwards.json")
    }

    fn snapshot(&self) -> Vec<SnapshotEntry> {
        let raw = std::fs::read_to_string(self.snapshot_path()).unwrap();
        serde_json::from_str(&raw).unwrap()
    }
}

fn build_manager(dir: &Path) -> TunnelManager {
    let hosts = dir.join("ssh-config");
    if !hosts.exists() {
        std::fs::write(&hosts, HOSTS).unwrap();
    }
    TunnelManager::new(
        Arc::new(SshConfigFile::new(hosts)),
        Arc::new(LoopbackProvider),
        Arc::new(JsonSnapshotStore::new(dir.join("saved-forwards.json"))),
    )
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Echo server on an ephemeral port; echoes until the client half-closes
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

fn echo_spec(alias: &str, local_port: u16, echo: SocketAddr) -> TunnelSpec {
    TunnelSpec::new(alias, local_port, echo.port()).with_remote_host("127.0.0.1")
}

#[tokio::test]
async fn create_then_list_has_one_entry() {
    let fx = Fixture::new();
    let port = free_port();

    let created = fx
        .manager
        .create_tunnel(TunnelSpec::new("db1", port, 5432))
        .await
        .unwrap();

    let active = fx.manager.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].key, created.key);
    assert_eq!(active[0].bound_addr.port(), port);
    assert!(!is_port_free(port).await);

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let fx = Fixture::new();
    let port = free_port();
    let spec = TunnelSpec::new("db1", port, 5432);

    fx.manager.create_tunnel(spec.clone()).await.unwrap();
    let err = fx.manager.create_tunnel(spec.clone()).await.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyActive(ref key) if *key == spec.key().to_string()));

    // Same key with another remote host is still the same tunnel
    let err = fx
        .manager
        .create_tunnel(spec.clone().with_remote_host("10.0.0.5"))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyActive(_)));

    assert_eq!(fx.manager.list_active().await.len(), 1);
    fx.manager.stop_all().await;
}

#[tokio::test]
async fn concurrent_duplicate_creates_yield_one_tunnel() {
    let fx = Fixture::new();
    let spec = TunnelSpec::new("db1", free_port(), 5432);

    let (a, b) = tokio::join!(
        fx.manager.create_tunnel(spec.clone()),
        fx.manager.create_tunnel(spec.clone())
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    let failure = a.err().or(b.err()).unwrap();
    assert!(matches!(failure, TunnelError::AlreadyActive(_)));
    assert_eq!(fx.manager.list_active().await.len(), 1);

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn stop_unknown_key_is_not_found() {
    let fx = Fixture::new();
    fx.manager
        .create_tunnel(TunnelSpec::new("db1", free_port(), 5432))
        .await
        .unwrap();

    let err = fx
        .manager
        .stop_tunnel(&TunnelKey::new("db1", 1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::NotFound(_)));
    assert_eq!(fx.manager.list_active().await.len(), 1);

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn stop_frees_port_and_is_not_repeatable() {
    let fx = Fixture::new();
    let port = free_port();
    let created = fx
        .manager
        .create_tunnel(TunnelSpec::new("db1", port, 5432))
        .await
        .unwrap();

    fx.manager.stop_tunnel(&created.key).await.unwrap();

    assert!(fx.manager.list_active().await.is_empty());
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    assert!(matches!(
        fx.manager.stop_tunnel(&created.key).await,
        Err(TunnelError::NotFound(_))
    ));
}

#[tokio::test]
async fn relayed_bytes_are_identical() {
    let fx = Fixture::new();
    let echo = echo_server().await;
    let port = free_port();
    fx.manager.create_tunnel(echo_spec("db1", port, echo)).await.unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut reader, mut writer) = client.split();

    let write = async {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let read = async {
        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.unwrap();
        echoed
    };
    let (_, echoed) = tokio::time::timeout(WAIT, async { tokio::join!(write, read) })
        .await
        .expect("relay stalled");

    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload);

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn client_close_reaches_remote() {
    let fx = Fixture::new();
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = remote.accept().await.unwrap();
        let mut received = Vec::new();
        let _ = socket.read_to_end(&mut received).await;
        let _ = done_tx.send(received);
    });

    let port = free_port();
    fx.manager.create_tunnel(echo_spec("db1", port, remote_addr)).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"bye").await.unwrap();
    drop(client);

    let received = tokio::time::timeout(WAIT, done_rx)
        .await
        .expect("remote never saw EOF")
        .unwrap();
    assert_eq!(received, b"bye");

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn remote_close_reaches_client() {
    let fx = Fixture::new();
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = remote.accept().await.unwrap();
        socket.write_all(b"hello").await.unwrap();
        // Dropping the socket closes the remote end
    });

    let port = free_port();
    fx.manager.create_tunnel(echo_spec("db1", port, remote_addr)).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut received))
        .await
        .expect("client never saw EOF")
        .unwrap();
    assert_eq!(received, b"hello");

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn failed_channel_open_keeps_tunnel() {
    let fx = Fixture::new();
    // Nothing listens on the target port
    let dead_target = free_port();
    let port = free_port();
    fx.manager
        .create_tunnel(TunnelSpec::new("db1", port, dead_target).with_remote_host("127.0.0.1"))
        .await
        .unwrap();

    for _ in 0..2 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("client was not closed after channel failure");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    let active = fx.manager.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].stats.connection_count, 2);

    fx.manager.stop_all().await;
}

#[tokio::test]
async fn stop_closes_open_relays() {
    let fx = Fixture::new();
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let (socket, _) = remote.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
    });

    let port = free_port();
    let created = fx
        .manager
        .create_tunnel(echo_spec("db1", port, remote_addr))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(WAIT, fx.manager.stop_tunnel(&created.key))
        .await
        .expect("stop hung on an open relay")
        .unwrap();

    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    holder.abort();
}

#[tokio::test]
async fn ssh_failure_leaves_nothing_behind() {
    let fx = Fixture::new();
    let port = free_port();

    let err = fx
        .manager
        .create_tunnel(TunnelSpec::new("down", port, 22))
        .await
        .unwrap_err();
    match err {
        TunnelError::SshConnect { alias, reason, .. } => {
            assert_eq!(alias, "down");
            assert_eq!(reason, ConnectFailure::ConnectionRefused);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert!(fx.manager.list_active().await.is_empty());
    assert!(is_port_free(port).await);
    assert!(!fx.snapshot_path().exists());
}

#[tokio::test]
async fn unknown_alias_and_busy_port() {
    let fx = Fixture::new();

    let err = fx
        .manager
        .create_tunnel(TunnelSpec::new("nowhere", free_port(), 22))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::ConfigNotFound(ref alias) if alias == "nowhere"));

    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = held.local_addr().unwrap().port();
    let err = fx
        .manager
        .create_tunnel(TunnelSpec::new("db1", busy, 22))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::PortInUse(p) if p == busy));
    assert!(fx.manager.list_active().await.is_empty());
}

#[tokio::test]
async fn snapshot_follows_create_and_stop() {
    let fx = Fixture::new();
    let (a, b) = (free_port(), free_port());

    let first = fx
        .manager
        .create_tunnel(TunnelSpec::new("db1", a, 5432))
        .await
        .unwrap();
    fx.manager
        .create_tunnel(TunnelSpec::new("web", b, 80).with_remote_host("10.0.0.2"))
        .await
        .unwrap();

    let saved = fx.snapshot();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].connection_key, format!("db1:{}:5432", a));
    assert_eq!(saved[1].host, "web");
    assert_eq!(saved[1].remote_host, "10.0.0.2");

    fx.manager.stop_tunnel(&first.key).await.unwrap();
    let saved = fx.snapshot();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].connection_key, format!("web:{}:80", b));

    let report = fx.manager.stop_all().await;
    assert_eq!(report.stopped.len(), 1);
    assert!(report.errors.is_empty());
    assert!(fx.snapshot().is_empty());
}

#[tokio::test]
async fn restore_counts_failures() {
    let dir = tempdir().unwrap();
    let (good, bad) = (free_port(), free_port());
    let store = JsonSnapshotStore::new(dir.path().join("saved-forwards.json"));
    store
        .save(&[
            SnapshotEntry {
                connection_key: format!("db1:{}:5432", good),
                host: "db1".into(),
                local_port: good,
                remote_port: 5432,
                remote_host: "localhost".into(),
                start_time: chrono::Utc::now(),
            },
            SnapshotEntry {
                connection_key: format!("ghost:{}:22", bad),
                host: "ghost".into(),
                local_port: bad,
                remote_port: 22,
                remote_host: "localhost".into(),
                start_time: chrono::Utc::now(),
            },
        ])
        .await
        .unwrap();

    let manager = build_manager(dir.path());
    let report = manager.restore_all().await;
    assert_eq!(report.restored, 1);
    assert_eq!(report.failed, 1);

    let active = manager.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].key, TunnelKey::new("db1", good, 5432));

    manager.stop_all().await;
}

#[tokio::test]
async fn restore_same_port_scenario() {
    let dir = tempdir().unwrap();
    let port = free_port();
    std::fs::write(
        dir.path().join("saved-forwards.json"),
        format!(
            r#"[{{"connectionKey":"db1:{p}:{p}","host":"db1","localPort":{p},"remotePort":{p},"startTime":"2024-05-01T10:00:00.000Z"}}]"#,
            p = port
        ),
    )
    .unwrap();

    let manager = build_manager(dir.path());
    let report = manager.restore_all().await;
    assert_eq!(report.restored, 1);
    assert_eq!(report.failed, 0);

    let active = manager.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].key.to_string(), format!("db1:{}:{}", port, port));
    assert_eq!(active[0].spec.remote_host, "localhost");

    manager.stop_all().await;
}

#[tokio::test]
async fn shutdown_keeps_snapshot_for_next_start() {
    let fx = Fixture::new();
    let port = free_port();
    fx.manager
        .create_tunnel(TunnelSpec::new("db1", port, 5432))
        .await
        .unwrap();

    let report = fx.manager.shutdown().await;
    assert_eq!(report.stopped, vec![TunnelKey::new("db1", port, 5432)]);
    assert!(fx.manager.list_active().await.is_empty());
    assert!(is_port_free(port).await);
    assert_eq!(fx.snapshot().len(), 1);

    // A fresh manager brings it back
    let next = build_manager(fx.dir.path());
    assert_eq!(next.restore_all().await.restored, 1);
    next.stop_all().await;
}

#[tokio::test]
async fn probe_port_reports_state() {
    let fx = Fixture::new();
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = held.local_addr().unwrap().port();

    assert!(!fx.manager.probe_port(busy).await.unwrap());
    assert!(fx.manager.probe_port(free_port()).await.unwrap());
    assert!(matches!(
        fx.manager.probe_port(0).await,
        Err(TunnelError::InvalidPort(0))
    ));
}

#[tokio::test]
async fn hosts_and_connection_test() {
    let fx = Fixture::new();

    let hosts = fx.manager.list_hosts().await.unwrap();
    let aliases: Vec<&str> = hosts.iter().map(|h| h.alias.as_str()).collect();
    assert_eq!(aliases, vec!["db1", "web", "down"]);

    let report = fx.manager.test_host("web").await.unwrap();
    assert_eq!(report.hostname, "127.0.0.1");
    assert_eq!(report.port, 2222);
    assert_eq!(report.user, "root");

    assert!(matches!(
        fx.manager.test_host("down").await,
        Err(TunnelError::SshConnect { .. })
    ));
    assert!(matches!(
        fx.manager.test_host("nowhere").await,
        Err(TunnelError::ConfigNotFound(_))
    ));
}

#[tokio::test]
async fn status_lists_uptimes() {
    let fx = Fixture::new();
    let port = free_port();
    fx.manager
        .create_tunnel(TunnelSpec::new("db1", port, 5432))
        .await
        .unwrap();

    let status = fx.manager.status().await;
    assert_eq!(status.active_tunnels, 1);
    assert_eq!(status.tunnels[0].key.to_string(), format!("db1:{}:5432", port));
    assert!(status.uptime_secs >= 0);

    fx.manager.stop_all().await;
}
