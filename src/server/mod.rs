//! Pooled-buffer socket servers
//!
//! TCP and UDP request/response servers built on [`ResourcePool`]:
//! every connection or datagram borrows a pre-allocated buffer object
//! instead of allocating, and shutdown drains the pool before the
//! socket goes away. The request -> response mapping is delegated to a
//! pluggable [`LogicServer`].

pub mod frame;
pub mod lifecycle;
pub mod tcp;
pub mod udp;

pub use frame::FrameBuffer;
pub use tcp::TcpServer;
pub use udp::UdpServer;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;

use crate::pool::{PoolError, PoolOptions, ResourcePool};

/// Errors reported by the socket servers
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Maps a request string to a response string.
///
/// `None` means "do not reply": the TCP connection is closed without a
/// response, the UDP datagram is dropped.
pub trait LogicServer: Send + Sync {
    fn get_response(&self, request: &str) -> Option<String>;
}

/// Handler installed while a server is stopped: answers nothing, so
/// pipeline work still in flight during shutdown observes a safe,
/// inert handler.
#[derive(Debug, Default)]
pub struct NullLogicServer;

impl LogicServer for NullLogicServer {
    fn get_response(&self, _request: &str) -> Option<String> {
        None
    }
}

/// Echoes every request back. Used by the demo binary and tests.
#[derive(Debug, Default)]
pub struct EchoLogicServer;

impl LogicServer for EchoLogicServer {
    fn get_response(&self, request: &str) -> Option<String> {
        Some(request.to_owned())
    }
}

/// Common control surface of the TCP and UDP servers.
#[allow(async_fn_in_trait)]
pub trait SocketServer {
    /// Whether the server is currently accepting work.
    fn started(&self) -> bool;

    /// The currently active request handler (for diagnostics).
    fn logic(&self) -> Arc<dyn LogicServer>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    async fn restart(&self) -> Result<()>;
}

/// Server construction parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: IpAddr,
    pub port: u16,
    /// Capacity of each pooled message buffer
    pub buffer_size: usize,
    /// Maximum concurrently checked-out buffers
    pub pool_capacity: usize,
    /// Listen backlog (TCP only)
    pub backlog: u32,
}

impl ServerConfig {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            buffer_size: 1024,
            pool_capacity: 10,
            backlog: 100,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size < 1 {
            return Err(ServerError::InvalidConfig(
                "the buffer size must be greater than 0".into(),
            ));
        }
        if self.pool_capacity < 1 {
            return Err(ServerError::InvalidConfig(
                "the pool capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Per-exchange state checked out of a server's buffer pool: one fixed
/// message frame plus the remote endpoint it belongs to.
#[derive(Debug)]
pub struct ClientArgs {
    pub buffer: FrameBuffer,
    pub peer: Option<SocketAddr>,
}

impl ClientArgs {
    fn new(buffer_size: usize) -> Self {
        Self {
            buffer: FrameBuffer::new(buffer_size),
            peer: None,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.peer = None;
    }
}

/// Build the buffer pool for a server: manual release discipline (the
/// pipelines release explicitly on every path), a quarter of the
/// capacity pre-allocated.
fn client_args_pool(config: &ServerConfig) -> Result<ResourcePool<ClientArgs>> {
    config.validate()?;
    let buffer_size = config.buffer_size;
    let options = PoolOptions::new(config.pool_capacity).initial_count(config.pool_capacity / 4);
    Ok(ResourcePool::with_cleanup(
        options,
        move || ClientArgs::new(buffer_size),
        ClientArgs::reset,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    pub(crate) fn loopback_config() -> ServerConfig {
        // Port 0: the OS picks a free port, the tests read it back.
        ServerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn config_validation() {
        let mut config = loopback_config();
        config.buffer_size = 0;
        assert!(matches!(
            client_args_pool(&config),
            Err(ServerError::InvalidConfig(_))
        ));

        let mut config = loopback_config();
        config.pool_capacity = 0;
        assert!(matches!(
            client_args_pool(&config),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn pool_cleanup_detaches_peer() {
        let config = loopback_config();
        let pool = client_args_pool(&config).unwrap();

        let mut args = pool.take();
        args.buffer.set_message("junk");
        args.peer = Some(config.socket_addr());
        pool.release(args).unwrap();

        // Whatever comes back out of the pool must be clean.
        let args = pool.take();
        assert_eq!(args.peer, None);
        assert!(args.buffer.as_slice().iter().all(|&b| b == 0));
        pool.release(args).unwrap();
    }

    #[test]
    fn null_logic_answers_nothing() {
        assert_eq!(NullLogicServer.get_response("ping"), None);
        assert_eq!(EchoLogicServer.get_response("ping"), Some("ping".into()));
    }
}
