//! Local port probing and binding
//!
//! `is_port_free` is advisory: another process can take the port between
//! the probe and the real bind, so `bind_local` stays the authority.

use std::io::ErrorKind;
use std::net::Ipv4Addr;

use tokio::net::TcpListener;

use super::error::TunnelError;

/// Tunnels only ever listen on loopback
pub const LISTEN_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Bind `127.0.0.1:port` and release it immediately
pub async fn is_port_free(port: u16) -> bool {
    TcpListener::bind((LISTEN_ADDR, port)).await.is_ok()
}

/// Bind the tunnel listener on `127.0.0.1:port`
pub async fn bind_local(port: u16) -> Result<TcpListener, TunnelError> {
    TcpListener::bind((LISTEN_ADDR, port))
        .await
        .map_err(|e| TunnelError::Bind {
            port,
            reason: match e.kind() {
                ErrorKind::AddrInUse => "port already in use".to_string(),
                ErrorKind::PermissionDenied => {
                    "permission denied; ports below 1024 require elevated privileges".to_string()
                }
                ErrorKind::AddrNotAvailable => "address not available".to_string(),
                _ => e.to_string(),
            },
        })
}
