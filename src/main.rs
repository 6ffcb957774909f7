//! Demo server application
//!
//! Starts an echo TCP server and an echo UDP server from the TOML
//! configuration and runs them until ctrl-c.

use std::sync::Arc;

use sockpool::{
    logging, AppConfig, EchoLogicServer, LogicServer, Result, SocketServer, TcpServer, UdpServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = logging::init_logging();

    // Load config or use defaults
    let config = AppConfig::load().unwrap_or_default();

    let logic: Arc<dyn LogicServer> = Arc::new(EchoLogicServer);
    let tcp = TcpServer::new(config.tcp.server_config(), Arc::clone(&logic))?;
    let udp = UdpServer::new(config.udp.server_config(), logic)?;

    tcp.start().await?;
    tracing::info!(addr = ?tcp.local_addr(), "TCP echo server listening");
    udp.start().await?;
    tracing::info!(addr = ?udp.local_addr(), "UDP echo server listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    tcp.stop().await;
    udp.stop().await;

    Ok(())
}
