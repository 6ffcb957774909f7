//! UDP socket server with a pooled-buffer pipeline
//!
//! A single receive loop owns the socket: it receives each datagram
//! into a pooled buffer, hands processing (handler invocation + send)
//! off to a task, then checks out the next buffer before receiving
//! again. Datagrams are independent; the remote endpoint travels
//! with the buffer so the response reaches the right peer.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::lifecycle::{HandlerSlot, Lifecycle};
use super::{client_args_pool, ClientArgs, LogicServer, Result, ServerConfig, ServerError, SocketServer};
use crate::pool::{Pooled, ResourcePool};

struct RecvTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// UDP request/response server backed by a bounded buffer pool.
pub struct UdpServer {
    lifecycle: Lifecycle,
    config: ServerConfig,
    pool: ResourcePool<ClientArgs>,
    recv: tokio::sync::Mutex<Option<RecvTask>>,
    socket: parking_lot::Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpServer {
    /// Create a stopped server. Fails on invalid configuration
    /// (zero buffer size or pool capacity).
    pub fn new(config: ServerConfig, logic: Arc<dyn LogicServer>) -> Result<Self> {
        let pool = client_args_pool(&config)?;
        Ok(Self {
            lifecycle: Lifecycle::new(logic),
            config,
            pool,
            recv: tokio::sync::Mutex::new(None),
            socket: parking_lot::Mutex::new(None),
        })
    }

    /// The address actually bound, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.lock();
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// The buffer pool, exposed for diagnostics.
    pub fn pool(&self) -> &ResourcePool<ClientArgs> {
        &self.pool
    }

    async fn start_core(&self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.socket_addr())
            .await
            .map_err(ServerError::Bind)?;
        let socket = Arc::new(socket);
        *self.socket.lock() = Some(Arc::clone(&socket));

        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(recv_loop(
            socket,
            self.pool.clone(),
            self.lifecycle.handler_slot(),
            cancel_rx,
        ));
        *self.recv.lock().await = Some(RecvTask { cancel, handle });
        Ok(())
    }

    async fn stop_core(&self) {
        if let Some(task) = self.recv.lock().await.take() {
            let _ = task.cancel.send(true);
            let _ = task.handle.await;
        }

        tracing::debug!("waiting for current tasks completion");
        self.pool.wait_all_async().await;

        // Only now is nothing touching a buffer; drop the socket.
        *self.socket.lock() = None;
    }
}

impl SocketServer for UdpServer {
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

async fn recv_loop(
    socket: Arc<UdpSocket>,
    pool: ResourcePool<ClientArgs>,
    handler: HandlerSlot,
    mut cancel: watch::Receiver<bool>,
) {
    let mut held = Some(pool.take_async().await);

    loop {
        if held.is_none() {
            // The buffer was handed off; take the next one, staying
            // responsive to cancellation while the pool is drained.
            tokio::select! {
                _ = cancel.changed() => break,
                fresh = pool.take_async() => held = Some(fresh),
            }
        }
        let Some(args) = held.as_mut() else { continue };

        tokio::select! {
            _ = cancel.changed() => break,
            received = socket.recv_from(args.buffer.as_mut_slice()) => match received {
                Ok((received, peer)) if received > 0 => {
                    // Dispatch first, take next on the following pass.
                    // The reverse order deadlocks a full pool: holding
                    // the last buffer while waiting for another means
                    // the in-hand datagram never releases it.
                    if let Some(mut datagram) = held.take() {
                        datagram.peer = Some(peer);
                        tokio::spawn(process_datagram(
                            Arc::clone(&socket),
                            datagram,
                            received,
                            pool.clone(),
                            handler.clone(),
                        ));
                    }
                }
                Ok((_, peer)) => {
                    tracing::warn!(%peer, "data not received");
                }
                // Receive timeouts are non-fatal; simply retry.
                Err(error) if matches!(
                    error.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
                Err(error) => {
                    tracing::error!(%error, "data not received");
                }
            }
        }
    }

    if let Some(args) = held {
        if let Err(error) = pool.release(args) {
            tracing::error!(%error, "buffer not released");
        }
    }
}

async fn process_datagram(
    socket: Arc<UdpSocket>,
    mut args: Pooled<ClientArgs>,
    received: usize,
    pool: ResourcePool<ClientArgs>,
    handler: HandlerSlot,
) {
    let request = args.buffer.message_prefix(received);
    let response = handler.get().get_response(&request);

    if let (Some(response), Some(peer)) = (&response, args.peer) {
        args.buffer.set_message(response);
        if let Err(error) = socket.send_to(args.buffer.as_slice(), peer).await {
            tracing::error!(%peer, %error, "response not sent");
        }
    }

    tracing::debug!(peer = ?args.peer, %request, response = ?response, "datagram exchange");

    if let Err(error) = pool.release(args) {
        tracing::error!(%error, "buffer not released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::loopback_config;
    use crate::server::{EchoLogicServer, FrameBuffer, NullLogicServer};
    use std::time::Duration;

    async fn client_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn exchange(
        client: &UdpSocket,
        server: SocketAddr,
        request: &str,
        buffer_size: usize,
    ) -> Option<String> {
        client.send_to(request.as_bytes(), server).await.unwrap();

        let mut frame = FrameBuffer::new(buffer_size);
        let received = tokio::time::timeout(
            Duration::from_millis(500),
            client.recv_from(frame.as_mut_slice()),
        )
        .await;
        match received {
            Ok(Ok((received, _))) => Some(frame.message_prefix(received)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn start_stop_idempotent() {
        let server = UdpServer::new(loopback_config(), Arc::new(EchoLogicServer)).unwrap();
        assert!(!server.started());

        server.start().await.unwrap();
        assert!(server.started());
        server.start().await.unwrap();
        assert!(server.started());

        server.stop().await;
        assert!(!server.started());
        server.stop().await;
        assert!(!server.started());
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let config = loopback_config();
        let buffer_size = config.buffer_size;
        let server = UdpServer::new(config, Arc::new(EchoLogicServer)).unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = client_socket().await;
        for i in 0..10 {
            let message = format!("request {i}");
            let response = exchange(&client, addr, &message, buffer_size).await;
            assert_eq!(response.as_deref(), Some(message.as_str()));
        }

        server.stop().await;
        // Stop returns only once every buffer is back in the pool.
        assert_eq!(server.pool().current_count(), server.pool().total_count());
    }

    #[tokio::test]
    async fn capacity_one_pool_still_answers() {
        let mut config = loopback_config();
        config.pool_capacity = 1;
        let buffer_size = config.buffer_size;
        let server = UdpServer::new(config, Arc::new(EchoLogicServer)).unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        // The receive loop must hand each datagram off before waiting
        // for the next buffer, or the single-buffer pool stalls.
        let client = client_socket().await;
        for i in 0..3 {
            let message = format!("request {i}");
            let response = exchange(&client, addr, &message, buffer_size).await;
            assert_eq!(response.as_deref(), Some(message.as_str()));
        }

        server.stop().await;
        assert_eq!(server.pool().current_count(), server.pool().total_count());
    }

    #[tokio::test]
    async fn empty_datagram_gets_no_reply() {
        let config = loopback_config();
        let buffer_size = config.buffer_size;
        let server = UdpServer::new(config, Arc::new(EchoLogicServer)).unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = client_socket().await;
        client.send_to(&[], addr).await.unwrap();

        let mut frame = FrameBuffer::new(buffer_size);
        let received = tokio::time::timeout(
            Duration::from_millis(500),
            client.recv_from(frame.as_mut_slice()),
        )
        .await;
        assert!(received.is_err());

        // The still-working server answers a real request afterwards.
        let response = exchange(&client, addr, "hello", buffer_size).await;
        assert_eq!(response.as_deref(), Some("hello"));

        server.stop().await;
        assert_eq!(server.pool().current_count(), server.pool().total_count());
    }

    #[tokio::test]
    async fn null_handler_drops_datagram() {
        let config = loopback_config();
        let buffer_size = config.buffer_size;
        let server = UdpServer::new(config, Arc::new(NullLogicServer)).unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = client_socket().await;
        let response = exchange(&client, addr, "anybody home?", buffer_size).await;
        assert_eq!(response, None);

        server.stop().await;
        assert_eq!(server.pool().current_count(), server.pool().total_count());
    }

    #[tokio::test]
    async fn concurrent_clients() {
        let mut config = loopback_config();
        config.pool_capacity = 4;
        let buffer_size = config.buffer_size;
        let capacity = config.pool_capacity;
        let server = Arc::new(UdpServer::new(config, Arc::new(EchoLogicServer)).unwrap());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let clients: Vec<_> = (0..8)
            .map(|c| {
                tokio::spawn(async move {
                    let client = client_socket().await;
                    for r in 0..10 {
                        let message = format!("request {c} {r}");
                        // UDP is lossy in principle; only respond-once
                        // ordering is asserted, not delivery.
                        if let Some(response) =
                            exchange(&client, addr, &message, buffer_size).await
                        {
                            assert_eq!(response, message);
                        }
                    }
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }

        assert!(server.pool().total_count() <= capacity);
        server.stop().await;
        assert_eq!(server.pool().current_count(), server.pool().total_count());
    }

    #[tokio::test]
    async fn restart_keeps_serving() {
        let config = loopback_config();
        let buffer_size = config.buffer_size;
        let server = UdpServer::new(config, Arc::new(EchoLogicServer)).unwrap();
        server.start().await.unwrap();

        server.restart().await.unwrap();
        assert!(server.started());

        let addr = server.local_addr().unwrap();
        let client = client_socket().await;
        let response = exchange(&client, addr, "still there?", buffer_size).await;
        assert_eq!(response.as_deref(), Some("still there?"));

        server.stop().await;
    }
}
