//! Reusable-object pool engine and pooled-buffer socket servers
//!
//! Core library: a lock-free, capacity-bounded pool of reusable objects
//! and TCP/UDP request/response servers that consume it to avoid
//! per-connection and per-datagram buffer allocation.

pub mod config;
pub mod logging;
pub mod pool;
pub mod server;

// Re-export commonly used types
pub use config::AppConfig;
pub use pool::{CapacitySemaphore, PoolError, PoolOptions, Pooled, ReleaseDiscipline, ResourcePool};
pub use server::{
    EchoLogicServer, FrameBuffer, LogicServer, NullLogicServer, ServerConfig, ServerError,
    SocketServer, TcpServer, UdpServer,
};

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
