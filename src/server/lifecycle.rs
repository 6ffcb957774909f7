//! Start/stop/restart state machine shared by both servers
//!
//! One blocking gate serializes the rare lifecycle transitions; the
//! active handler reference is swapped under a `parking_lot` lock that
//! is only ever held for the swap itself, never across I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::{LogicServer, NullLogicServer};

/// Shared, cloneable reference to the currently active request handler.
///
/// The pipelines read it per request, so work that is still in flight
/// during shutdown observes the null handler instead of a half
/// torn-down one.
#[derive(Clone)]
pub(crate) struct HandlerSlot(Arc<RwLock<Arc<dyn LogicServer>>>);

impl HandlerSlot {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(Arc::new(NullLogicServer))))
    }

    pub(crate) fn get(&self) -> Arc<dyn LogicServer> {
        Arc::clone(&self.0.read())
    }

    fn set(&self, handler: Arc<dyn LogicServer>) {
        *self.0.write() = handler;
    }
}

/// Lifecycle state for a socket server: `stopped` <-> `started`, with
/// the transitions strictly serialized by a single gate.
pub(crate) struct Lifecycle {
    /// Serializes start/stop/restart; the one blocking lock in the
    /// system, held only across lifecycle bookkeeping and the shutdown
    /// drain.
    gate: Mutex<()>,
    started: AtomicBool,
    /// The configured real handler, installed on start
    logic: Arc<dyn LogicServer>,
    active: HandlerSlot,
}

impl Lifecycle {
    pub(crate) fn new(logic: Arc<dyn LogicServer>) -> Self {
        Self {
            gate: Mutex::new(()),
            started: AtomicBool::new(false),
            logic,
            active: HandlerSlot::new(),
        }
    }

    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The currently active handler (the null handler while stopped).
    pub(crate) fn active(&self) -> Arc<dyn LogicServer> {
        self.active.get()
    }

    /// Cloneable handle for the pipelines to read the handler through.
    pub(crate) fn handler_slot(&self) -> HandlerSlot {
        self.active.clone()
    }

    /// Run `start_body` under the gate. No-op if already started. The
    /// real handler is installed before the body runs; a failed start
    /// reverts to the null handler.
    pub(crate) async fn start_with<F, Fut>(&self, start_body: F) -> super::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = super::Result<()>>,
    {
        let _gate = self.gate.lock().await;
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        self.active.set(Arc::clone(&self.logic));
        if let Err(error) = start_body().await {
            self.active.set(Arc::new(NullLogicServer));
            return Err(error);
        }
        self.started.store(true, Ordering::Release);
        tracing::info!("the server is started");
        Ok(())
    }

    /// Run `stop_body` under the gate. No-op if already stopped. The
    /// null handler is installed once the body has drained all work.
    pub(crate) async fn stop_with<F, Fut>(&self, stop_body: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let _gate = self.gate.lock().await;
        if !self.started.load(Ordering::Acquire) {
            return;
        }

        self.started.store(false, Ordering::Release);
        stop_body().await;
        self.active.set(Arc::new(NullLogicServer));
        tracing::info!("the server is stopped");
    }

    /// Stop (if started) and start again under one gate acquisition.
    /// `started` stays `true` throughout, so a concurrent reader never
    /// observes an intermediate stopped state.
    pub(crate) async fn restart_with<SF, SFut, TF, TFut>(
        &self,
        stop_body: SF,
        start_body: TF,
    ) -> super::Result<()>
    where
        SF: FnOnce() -> SFut,
        SFut: std::future::Future<Output = ()>,
        TF: FnOnce() -> TFut,
        TFut: std::future::Future<Output = super::Result<()>>,
    {
        let _gate = self.gate.lock().await;
        if self.started.load(Ordering::Acquire) {
            stop_body().await;
        }

        self.active.set(Arc::clone(&self.logic));
        start_body().await?;
        self.started.store(true, Ordering::Release);
        tracing::info!("the server is restarted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::EchoLogicServer;
    use std::sync::atomic::AtomicUsize;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(Arc::new(EchoLogicServer))
    }

    #[tokio::test]
    async fn start_installs_real_handler() {
        let lifecycle = lifecycle();
        assert!(!lifecycle.started());
        assert_eq!(lifecycle.active().get_response("ping"), None);

        lifecycle.start_with(|| async { Ok(()) }).await.unwrap();
        assert!(lifecycle.started());
        assert_eq!(
            lifecycle.active().get_response("ping"),
            Some("ping".into())
        );

        lifecycle.stop_with(|| async {}).await;
        assert!(!lifecycle.started());
        assert_eq!(lifecycle.active().get_response("ping"), None);
    }

    #[tokio::test]
    async fn start_stop_idempotent() {
        let lifecycle = lifecycle();
        let starts = AtomicUsize::new(0);
        let stops = AtomicUsize::new(0);

        for _ in 0..3 {
            lifecycle
                .start_with(|| async {
                    starts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            lifecycle
                .stop_with(|| async {
                    stops.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_reverts_handler() {
        let lifecycle = lifecycle();
        let result = lifecycle
            .start_with(|| async {
                Err(crate::server::ServerError::InvalidConfig("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(!lifecycle.started());
        assert_eq!(lifecycle.active().get_response("ping"), None);
    }

    #[tokio::test]
    async fn restart_never_exposes_stopped() {
        let lifecycle = Arc::new(lifecycle());
        lifecycle.start_with(|| async { Ok(()) }).await.unwrap();

        let observer = {
            let lifecycle = Arc::clone(&lifecycle);
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let handle = tokio::spawn(async move {
                while !stop_flag.load(Ordering::Acquire) {
                    assert!(lifecycle.started());
                    tokio::task::yield_now().await;
                }
            });
            (handle, stop)
        };

        for _ in 0..10 {
            lifecycle
                .restart_with(
                    || async {
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    },
                    || async { Ok(()) },
                )
                .await
                .unwrap();
        }

        observer.1.store(true, Ordering::Release);
        observer.0.await.unwrap();
        assert!(lifecycle.started());
    }
}
