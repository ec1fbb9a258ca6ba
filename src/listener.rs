//! Listener Manager: one accept loop per deployment, each dispatching
//! accepted connections to the Container Supervisor on an independent task
//! so a slow or stuck request never blocks further accepts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::registry::Deployment;
use crate::supervisor::Supervisor;

const ACCEPT_BACKLOG: u32 = 1024;

pub struct ListenerManager {
    supervisor: Arc<Supervisor>,
    listeners: Mutex<HashMap<String, ListenerHandle>>,
    inflight: Arc<InFlight>,
}

struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Tracks in-flight Supervisor invocations across every listener so
/// shutdown can wait for them to drain without tracking each task handle.
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_drained(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            while self.count.load(Ordering::SeqCst) != 0 {
                self.idle.notified().await;
            }
        })
        .await;
    }
}

impl ListenerManager {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            listeners: Mutex::new(HashMap::new()),
            inflight: Arc::new(InFlight::new()),
        }
    }

    /// Binds a stream socket on `deployment`'s address and conventional
    /// port with address-reuse set, then begins accepting. Returns only
    /// once the listener is actually accepting, per the control API's
    /// "persist then bind" ordering requirement.
    pub async fn add_listener(&self, deployment: Deployment) -> Result<()> {
        let addr = SocketAddr::from((deployment.address, deployment.port));

        let socket = TcpSocket::new_v4().map_err(|e| Error::Bind(format!("creating socket: {e}")))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| Error::Bind(format!("setting SO_REUSEADDR: {e}")))?;
        socket
            .bind(addr)
            .map_err(|e| Error::Bind(format!("binding {addr}: {e}")))?;
        let listener = socket
            .listen(ACCEPT_BACKLOG)
            .map_err(|e| Error::Bind(format!("listening on {addr}: {e}")))?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let supervisor = self.supervisor.clone();
        let inflight = self.inflight.clone();
        let name = deployment.name.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        tracing::info!(deployment = %name, "listener stopped accepting");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(deployment = %name, peer = %peer, "accepted connection");
                                let supervisor = supervisor.clone();
                                let deployment = deployment.clone();
                                let inflight = inflight.clone();
                                inflight.enter();
                                tokio::spawn(async move {
                                    supervisor.handle(stream, &deployment).await;
                                    inflight.exit();
                                });
                            }
                            Err(e) => {
                                tracing::warn!(deployment = %name, error = %e, "accept error; retrying");
                            }
                        }
                    }
                }
            }
        });

        self.listeners.lock().insert(
            deployment.name.clone(),
            ListenerHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    /// Stops accepting on `name`'s listener and waits for its accept loop
    /// to observe the shutdown signal. Already-dispatched requests keep
    /// running; use `wait_drained` to wait for those too.
    pub async fn remove_listener(&self, name: &str) {
        let handle = self.listeners.lock().remove(name);
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
    }

    /// Stops every listener's accept loop. Does not wait for in-flight
    /// requests; call `wait_drained` afterward for that.
    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = self.listeners.lock().drain().collect();
        for (_, handle) in &handles {
            let _ = handle.shutdown.send(true);
        }
        for (name, handle) in handles {
            if handle.task.await.is_err() {
                tracing::warn!(deployment = %name, "listener task panicked during shutdown");
            }
        }
    }

    /// Waits, bounded by `deadline`, for all dispatched Supervisor
    /// invocations across every listener to finish.
    pub async fn wait_drained(&self, deadline: Duration) {
        self.inflight.wait_drained(deadline).await;
    }

    pub fn active_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runc::Runc;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn test_deployment(name: &str, port: u16) -> Deployment {
        Deployment {
            name: name.to_owned(),
            address: Ipv4Addr::new(127, 0, 0, 1),
            port,
            rootfs: PathBuf::from("/nonexistent"),
            command: vec!["/app/handler".to_owned()],
        }
    }

    fn test_manager() -> ListenerManager {
        let runc = Arc::new(Runc::new(PathBuf::from("/nonexistent/runc")));
        let supervisor = Arc::new(Supervisor::new(
            runc,
            PathBuf::from("/tmp/faasd-test-bundles"),
            PathBuf::from("/tmp/faasd-test-rendezvous"),
            Duration::from_millis(50),
            Duration::from_millis(50),
            64,
            100_000,
            100_000,
        ));
        ListenerManager::new(supervisor)
    }

    #[tokio::test]
    async fn add_and_remove_listener_round_trips() {
        let manager = test_manager();
        manager.add_listener(test_deployment("f", 0)).await.unwrap();
        assert_eq!(manager.active_count(), 1);
        manager.remove_listener("f").await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_drained_returns_once_no_requests_inflight() {
        let manager = test_manager();
        manager.wait_drained(Duration::from_millis(100)).await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_all_stops_every_listener() {
        let manager = test_manager();
        manager.add_listener(test_deployment("a", 38171)).await.unwrap();
        manager.add_listener(test_deployment("b", 38172)).await.unwrap();
        assert_eq!(manager.active_count(), 2);
        manager.shutdown_all().await;
        assert_eq!(manager.active_count(), 0);
    }
}
