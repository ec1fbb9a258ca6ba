//! Container Supervisor: runs the full per-request lifecycle described in
//! SPEC_FULL.md §4.5 —
//! `Created → BundleReady → Launched → Connected → Transferred → Exited|Killed → Cleaned`.
//!
//! Every exit path (success, any failure, or an early return via `?`)
//! reaches Cleaned: the bundle directory and rendezvous socket are removed
//! by RAII guards, and `runc delete` is called unconditionally.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::bundle;
use crate::handoff::Rendezvous;
use crate::registry::Deployment;
use crate::runc::Runc;

pub struct Supervisor {
    runc: Arc<Runc>,
    bundles_root: PathBuf,
    rendezvous_root: PathBuf,
    rendezvous_timeout: Duration,
    exit_timeout: Duration,
    memory_mib: u64,
    cpu_quota_us: i64,
    cpu_period_us: u64,
}

/// Guarantees the bundle directory is gone once the supervisor's scope
/// ends, regardless of which path it exits through.
struct BundleGuard {
    path: PathBuf,
}

impl Drop for BundleGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove bundle directory");
            }
        }
    }
}

impl Supervisor {
    pub fn new(
        runc: Arc<Runc>,
        bundles_root: PathBuf,
        rendezvous_root: PathBuf,
        rendezvous_timeout: Duration,
        exit_timeout: Duration,
        memory_mib: u64,
        cpu_quota_us: i64,
        cpu_period_us: u64,
    ) -> Self {
        Self {
            runc,
            bundles_root,
            rendezvous_root,
            rendezvous_timeout,
            exit_timeout,
            memory_mib,
            cpu_quota_us,
            cpu_period_us,
        }
    }

    /// Runs one request end to end. Never returns an error: every failure
    /// is logged and the client connection is simply dropped, since a
    /// single request's failure must never affect the listener or other
    /// in-flight requests (spec §7 propagation rule).
    pub async fn handle(&self, client: TcpStream, deployment: &Deployment) {
        let container_id = uuid::Uuid::new_v4().to_string();
        let bundle_dir = self.bundles_root.join(&container_id);
        let _bundle_guard = BundleGuard {
            path: bundle_dir.clone(),
        };

        tracing::debug!(container_id = %container_id, deployment = %deployment.name, "handling request");

        let rendezvous = match Rendezvous::prepare(&self.rendezvous_root, &container_id) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(container_id = %container_id, error = %e, "failed to prepare rendezvous socket");
                return;
            }
        };

        if let Err(e) = bundle::build(
            &bundle_dir,
            &deployment.rootfs,
            &deployment.command,
            rendezvous.path(),
            self.memory_mib,
            self.cpu_quota_us,
            self.cpu_period_us,
        ) {
            tracing::error!(container_id = %container_id, error = %e, "failed to build bundle");
            return;
        }

        let mut launched = match self.runc.run(&bundle_dir, &container_id).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(container_id = %container_id, error = %e, "failed to launch runc");
                return;
            }
        };

        let client_fd = match client.into_std() {
            Ok(std_stream) => OwnedFd::from(std_stream),
            Err(e) => {
                tracing::error!(container_id = %container_id, error = %e, "failed to convert client socket to raw fd");
                self.force_teardown(&container_id, &mut launched).await;
                return;
            }
        };

        if let Err(e) = rendezvous.transfer(client_fd, self.rendezvous_timeout).await {
            tracing::warn!(container_id = %container_id, error = %e, "rendezvous handoff failed; killing container");
            self.force_teardown(&container_id, &mut launched).await;
            return;
        }

        match tokio::time::timeout(self.exit_timeout, launched.child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!(container_id = %container_id, "container exited");
            }
            Ok(Ok(status)) => {
                let stderr = launched.stderr.await.unwrap_or_default();
                tracing::warn!(
                    container_id = %container_id,
                    status = %status,
                    stderr = %String::from_utf8_lossy(&stderr),
                    "container exited with failure status"
                );
            }
            Ok(Err(e)) => {
                tracing::error!(container_id = %container_id, error = %e, "error waiting for container");
            }
            Err(_) => {
                tracing::warn!(container_id = %container_id, "container exit deadline exceeded; forcing termination");
                self.force_teardown(&container_id, &mut launched).await;
                return;
            }
        }

        self.runc.delete(&container_id).await;
    }

    /// Forcefully signals and reaps a container that must be abandoned
    /// mid-request (handoff failure, exit deadline exceeded), then deletes
    /// its runtime record unconditionally — every call site returns right
    /// after this, so without the `delete` here the final unconditional
    /// delete at the end of `handle` would never be reached for these paths.
    async fn force_teardown(&self, container_id: &str, launched: &mut crate::runc::Launched) {
        self.runc.kill(container_id).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), launched.child.wait()).await;
        self.runc.delete(container_id).await;
    }
}
