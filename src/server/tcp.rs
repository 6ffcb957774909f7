//! TCP socket server with a pooled-buffer pipeline
//!
//! Per accepted connection: check a buffer out of the pool, receive one
//! request, hand it to the logic server, send the response, close.
//! Stop cancels the accept loop and drains the pool before returning,
//! so no in-flight connection is still touching a buffer.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::lifecycle::{HandlerSlot, Lifecycle};
use super::{client_args_pool, ClientArgs, LogicServer, Result, ServerConfig, ServerError, SocketServer};
use crate::pool::{Pooled, ResourcePool};

struct AcceptTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// TCP request/response server backed by a bounded buffer pool.
pub struct TcpServer {
    lifecycle: Lifecycle,
    config: ServerConfig,
    pool: ResourcePool<ClientArgs>,
    accept: tokio::sync::Mutex<Option<AcceptTask>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    /// Create a stopped server. Fails on invalid configuration
    /// (zero buffer size or pool capacity).
    pub fn new(config: ServerConfig, logic: Arc<dyn LogicServer>) -> Result<Self> {
        let pool = client_args_pool(&config)?;
        Ok(Self {
            lifecycle: Lifecycle::new(logic),
            config,
            pool,
            accept: tokio::sync::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        })
    }

    /// The address actually bound, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The buffer pool, exposed for diagnostics.
    pub fn pool(&self) -> &ResourcePool<ClientArgs> {
        &self.pool
    }

    async fn start_core(&self) -> Result<()> {
        let addr = self.config.socket_addr();
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(ServerError::Bind)?;
        socket.bind(addr).map_err(ServerError::Bind)?;
        let listener = socket.listen(self.config.backlog).map_err(ServerError::Bind)?;

        *self.local_addr.lock() = listener.local_addr().ok();

        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(
            listener,
            self.pool.clone(),
            self.lifecycle.handler_slot(),
            cancel_rx,
        ));
        *self.accept.lock().await = Some(AcceptTask { cancel, handle });
        Ok(())
    }

    async fn stop_core(&self) {
        if let Some(task) = self.accept.lock().await.take() {
            let _ = task.cancel.send(true);
            let _ = task.handle.await;
        }

        tracing::debug!("waiting for in-flight connections");
        self.pool.wait_all_async().await;
        *self.local_addr.lock() = None;
    }
}

impl SocketServer for TcpServer {
    fn started(&self) -> bool {
        self.lifecycle.started()
    }

    fn logic(&self) -> Arc<dyn LogicServer> {
        self.lifecycle.active()
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.start_with(|| self.start_core()).await
    }

    async fn stop(&self) {
        self.lifecycle.stop_with(|| self.stop_core()).await
    }

    async fn restart(&self) -> Result<()> {
        self.lifecycle
            .restart_with(|| self.stop_core(), || self.start_core())
            .await
    }
}

async fn accept_loop(
    listener: TcpListener,
    pool: ResourcePool<ClientArgs>,
    handler: HandlerSlot,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "client connected");
                    let mut args = pool.take_async().await;
                    args.peer = Some(peer);
                    tokio::spawn(handle_connection(
                        stream,
                        args,
                        pool.clone(),
                        handler.clone(),
                    ));
                }
                Err(error) => {
                    tracing::error!(%error, "connection not accepted");
                }
            }
        }
    }
    // Dropping the listener here closes the listening socket.
}

async fn handle_connection(
    mut stream: TcpStream,
    mut args: Pooled<ClientArgs>,
    pool: ResourcePool<ClientArgs>,
    handler: HandlerSlot,
) {
    let peer = args.peer;

    match stream.read(args.buffer.as_mut_slice()).await {
        // Zero bytes: the peer finished sending and shut down.
        Ok(0) => {}
        Ok(received) => {
            let request = args.buffer.message_prefix(received);
            tracing::debug!(peer = ?peer, %request, "request received");

            match handler.get().get_response(&request) {
                Some(response) => {
                    args.buffer.set_message(&response);
                    match stream.write_all(args.buffer.as_slice()).await {
                        Ok(()) => tracing::debug!(peer = ?peer, %response, "response sent"),
                        Err(error) => log_transport_error(peer, &error, "response not sent"),
                    }
                }
                None => {}
            }
        }
        Err(error) => log_transport_error(peer, &error, "request not received"),
    }

    close_connection(stream, args, &pool).await;
}

async fn close_connection(
    mut stream: TcpStream,
    args: Pooled<ClientArgs>,
    pool: &ResourcePool<ClientArgs>,
) {
    // Best effort: the peer may already be gone.
    if let Err(error) = stream.shutdown().await {
        tracing::debug!(%error, "shutdown failed");
    }
    drop(stream);

    if let Err(error) = pool.release(args) {
        tracing::error!(%error, "buffer not released");
    }
}

/// Per-connection transport failures are recovered locally; an aborted
/// operation during shutdown is expected and stays silent.
fn log_transport_error(peer: Option<SocketAddr>, error: &std::io::Error, context: &str) {
    if matches!(
        error.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::Interrupted
    ) {
        return;
    }
    tracing::error!(peer = ?peer, %error, "{context}");
}
