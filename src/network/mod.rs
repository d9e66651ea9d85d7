//! Network module - Handles framed TCP communication between peers
//!
//! Provides:
//! - Connection with independent read and write pumps
//! - Handshake protocol run on top of a connection
//! - Connection pool owning the shared reactor and worker threads

mod connection;
mod handshake;
mod pool;

pub use connection::*;
pub use handshake::*;
pub use pool::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{DEFAULT_ACCEPT_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PORT};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Accept timeout in milliseconds
    pub accept_timeout_ms: u64,
    /// Per-step handshake receive timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Maximum accepted payload size
    pub max_payload_size: usize,
    /// Outbound frames queued before `send` starts failing
    pub max_pending_frames: usize,
    /// Grace period for queued writes when a pool stops
    pub drain_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_SECS * 1000,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_SECS * 1000,
            handshake_timeout_ms: 5000,
            max_payload_size: 10 * 1024 * 1024, // 10 MB
            max_pending_frames: 1024,
            drain_timeout_ms: 1000,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = NetworkConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.accept_timeout(), Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("127.0.0.1", 4242).await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }
}
