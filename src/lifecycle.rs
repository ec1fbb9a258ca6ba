//! Lifecycle / Address Binder (C8): privilege check at startup, plumbing
//! deployment addresses onto a host interface, startup recovery, and
//! graceful shutdown.
//!
//! Addresses are labeled (`<iface>:<label>`, the iproute2 alias
//! convention) so cleanup can tell this daemon's addresses apart from
//! anything an operator added by hand, matching the "label discipline"
//! called out in SPEC_FULL.md §5.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::listener::ListenerManager;
use crate::registry::Deployment;

/// Fails unless the effective user is root: configuring host addresses,
/// spawning `runc`, and sending file descriptors all require it.
pub fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(Error::Internal(
            "faasd must run as root (required to bind addresses and invoke runc)".to_owned(),
        ));
    }
    Ok(())
}

/// Blocks until SIGTERM or SIGINT is received.
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}

#[async_trait]
pub trait IpCommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<std::process::Output>;
}

struct SystemIp {
    binary: PathBuf,
}

#[async_trait]
impl IpCommandRunner for SystemIp {
    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Bind(format!("spawning {}: {e}", self.binary.display())))
    }
}

/// Adds and removes addresses on a host interface, tagging each with a
/// project-specific label so shutdown only ever touches its own work.
pub struct AddressBinder {
    iface: String,
    label: String,
    runner: Box<dyn IpCommandRunner>,
}

impl AddressBinder {
    pub fn new(iface: String, label: String) -> Self {
        Self {
            iface,
            label,
            runner: Box::new(SystemIp { binary: PathBuf::from("ip") }),
        }
    }

    #[cfg(test)]
    pub fn with_runner(iface: String, label: String, runner: Box<dyn IpCommandRunner>) -> Self {
        Self { iface, label, runner }
    }

    fn full_label(&self) -> String {
        format!("{}:{}", self.iface, self.label)
    }

    /// `ip addr add <addr>/32 dev <iface> label <iface>:<label>`. Tolerates
    /// the address already being present (idempotent, for startup
    /// recovery re-binding a deployment that survived a crash).
    pub async fn add(&self, addr: Ipv4Addr) -> Result<()> {
        let args = vec![
            "addr".to_owned(),
            "add".to_owned(),
            format!("{addr}/32"),
            "dev".to_owned(),
            self.iface.clone(),
            "label".to_owned(),
            self.full_label(),
        ];
        let output = self.runner.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            tracing::debug!(%addr, iface = %self.iface, "address already bound");
            return Ok(());
        }
        Err(Error::Bind(format!(
            "ip addr add {addr} dev {}: {}",
            self.iface,
            stderr.trim()
        )))
    }

    /// `ip addr del`. Best-effort: failures are logged, never propagated,
    /// since callers use this during cleanup paths that must not abort.
    pub async fn remove(&self, addr: Ipv4Addr) {
        let args = vec![
            "addr".to_owned(),
            "del".to_owned(),
            format!("{addr}/32"),
            "dev".to_owned(),
            self.iface.clone(),
        ];
        match self.runner.run(&args).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(%addr, iface = %self.iface, stderr = %stderr.trim(), "ip addr del failed");
            }
            Err(e) => tracing::warn!(%addr, iface = %self.iface, error = %e, "failed to spawn ip addr del"),
        }
    }

    /// Lists every address currently bound on `iface` under this daemon's
    /// label, by parsing `ip -4 -o addr show dev <iface>`.
    pub async fn list_labeled(&self) -> Result<Vec<Ipv4Addr>> {
        let args = vec![
            "-4".to_owned(),
            "-o".to_owned(),
            "addr".to_owned(),
            "show".to_owned(),
            "dev".to_owned(),
            self.iface.clone(),
        ];
        let output = self.runner.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Bind(format!(
                "listing addresses on {}: {}",
                self.iface,
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_labeled_addrs(&stdout, &self.full_label()))
    }
}

fn parse_labeled_addrs(output: &str, full_label: &str) -> Vec<Ipv4Addr> {
    let mut found = Vec::new();
    for line in output.lines() {
        if !line.split_whitespace().any(|tok| tok == full_label) {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = tokens.iter().position(|t| *t == "inet") else {
            continue;
        };
        let Some(cidr) = tokens.get(pos + 1) else {
            continue;
        };
        let Some((addr_str, _prefix)) = cidr.split_once('/') else {
            continue;
        };
        if let Ok(addr) = addr_str.parse() {
            found.push(addr);
        }
    }
    found
}

/// Startup recovery: clears stale bundle/rendezvous-socket directories
/// left behind by a crash, removes any labeled addresses that no longer
/// correspond to a live deployment, then (re)binds the address and
/// listener for every deployment the registry restored.
pub async fn recover(
    deployments: &[Deployment],
    binder: &AddressBinder,
    listeners: &ListenerManager,
    bundles_root: &Path,
    rendezvous_root: &Path,
) -> Result<()> {
    clear_directory(bundles_root);
    clear_directory(rendezvous_root);

    let current: HashSet<Ipv4Addr> = deployments.iter().map(|d| d.address).collect();
    match binder.list_labeled().await {
        Ok(stale) => {
            for addr in stale.into_iter().filter(|a| !current.contains(a)) {
                tracing::info!(%addr, "removing stale address left over from a previous crash");
                binder.remove(addr).await;
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list labeled addresses during recovery"),
    }

    for deployment in deployments {
        binder.add(deployment.address).await?;
        listeners.add_listener(deployment.clone()).await?;
        tracing::info!(deployment = %deployment.name, address = %deployment.address, "re-bound listener");
    }
    Ok(())
}

/// Graceful shutdown: stop accepting, wait (bounded) for in-flight
/// supervisors, remove only the addresses this daemon labeled, and sweep
/// any bundle directories left behind (normally none, since every
/// Supervisor invocation cleans its own up).
pub async fn shutdown(
    listeners: &ListenerManager,
    binder: &AddressBinder,
    drain_deadline: Duration,
    bundles_root: &Path,
) {
    listeners.shutdown_all().await;
    listeners.wait_drained(drain_deadline).await;

    match binder.list_labeled().await {
        Ok(addrs) => {
            for addr in addrs {
                binder.remove(addr).await;
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list labeled addresses during shutdown"),
    }

    clear_directory(bundles_root);
}

fn clear_directory(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if let Err(e) = std::fs::remove_dir_all(entry.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove stale entry");
            }
        }
    }
}

/// Always-succeeds stand-in used by other modules' tests (e.g. the control
/// API router tests) that need an `AddressBinder` but shouldn't shell out
/// to the real `ip` binary.
#[cfg(test)]
pub struct NoopIpCommandRunner;

#[cfg(test)]
#[async_trait]
impl IpCommandRunner for NoopIpCommandRunner {
    async fn run(&self, _args: &[String]) -> Result<std::process::Output> {
        use std::os::unix::process::ExitStatusExt;
        Ok(std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Arc;

    fn ok_output(stdout: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    fn failed_output(stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    struct StubRunner {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        responses: Arc<Mutex<Vec<Output>>>,
    }

    #[async_trait]
    impl IpCommandRunner for StubRunner {
        async fn run(&self, args: &[String]) -> Result<Output> {
            self.calls.lock().push(args.to_vec());
            Ok(self.responses.lock().remove(0))
        }
    }

    fn binder_with(responses: Vec<Output>) -> (AddressBinder, Arc<Mutex<Vec<Vec<String>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = StubRunner {
            calls: calls.clone(),
            responses: Arc::new(Mutex::new(responses)),
        };
        (
            AddressBinder::with_runner("eth0".to_owned(), "faasd".to_owned(), Box::new(runner)),
            calls,
        )
    }

    #[test]
    fn parses_only_addresses_with_the_matching_label() {
        let output = "2: eth0    inet 169.254.92.2/32 scope global eth0:faasd\\       valid_lft forever preferred_lft forever\n\
                       2: eth0    inet 10.0.0.5/24 scope global eth0\\       valid_lft forever preferred_lft forever\n";
        let addrs = parse_labeled_addrs(output, "eth0:faasd");
        assert_eq!(addrs, vec![Ipv4Addr::new(169, 254, 92, 2)]);
    }

    #[tokio::test]
    async fn add_tolerates_already_bound_address() {
        let (binder, calls) = binder_with(vec![failed_output("RTNETLINK answers: File exists")]);
        binder.add(Ipv4Addr::new(169, 254, 92, 2)).await.unwrap();
        assert_eq!(calls.lock()[0][1], "add");
    }

    #[tokio::test]
    async fn add_propagates_other_failures() {
        let (binder, _calls) = binder_with(vec![failed_output("RTNETLINK answers: Operation not permitted")]);
        let err = binder.add(Ipv4Addr::new(169, 254, 92, 2)).await.unwrap_err();
        assert!(matches!(err, Error::Bind(_)));
    }

    #[tokio::test]
    async fn list_labeled_parses_runner_output() {
        let (binder, _calls) = binder_with(vec![ok_output(
            "3: eth0    inet 169.254.92.3/32 scope global eth0:faasd\\       valid_lft forever preferred_lft forever\n",
        )]);
        let addrs = binder.list_labeled().await.unwrap();
        assert_eq!(addrs, vec![Ipv4Addr::new(169, 254, 92, 3)]);
    }
}
