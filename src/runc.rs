//! Typed wrapper over the `runc` CLI. Models the OCI runtime interactions
//! the design notes call out: launch (non-blocking), wait (deadline-bounded,
//! owned by the caller via `Launched::child`), signal (force), delete
//! (idempotent — tolerated to fail, always called during cleanup).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, binary: &Path, args: &[String]) -> std::io::Result<Child>;
}

pub struct TokioSpawner;

#[async_trait]
impl Spawner for TokioSpawner {
    async fn spawn(&self, binary: &Path, args: &[String]) -> std::io::Result<Child> {
        Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

pub struct Runc {
    binary: PathBuf,
    spawner: Box<dyn Spawner>,
}

/// A spawned `runc run`. The caller owns `child` and decides how long to
/// wait for it; `stdout`/`stderr` drain concurrently so the child is never
/// blocked on a full pipe buffer, and are joined only if diagnostics are
/// needed on failure.
pub struct Launched {
    pub child: Child,
    pub stdout: tokio::task::JoinHandle<Vec<u8>>,
    pub stderr: tokio::task::JoinHandle<Vec<u8>>,
}

impl Runc {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            spawner: Box::new(TokioSpawner),
        }
    }

    #[cfg(test)]
    pub fn with_spawner(binary: PathBuf, spawner: Box<dyn Spawner>) -> Self {
        Self { binary, spawner }
    }

    /// `runc run --bundle <bundle> <container_id>`, spawned without waiting
    /// for it to finish.
    pub async fn run(&self, bundle: &Path, container_id: &str) -> Result<Launched> {
        let args = vec![
            "run".to_owned(),
            "--bundle".to_owned(),
            bundle.display().to_string(),
            container_id.to_owned(),
        ];
        let mut child = self
            .spawner
            .spawn(&self.binary, &args)
            .await
            .map_err(|e| Error::RuntimeLaunch(format!("spawning runc run: {e}")))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout = tokio::spawn(drain(stdout_pipe));
        let stderr = tokio::spawn(drain(stderr_pipe));

        Ok(Launched {
            child,
            stdout,
            stderr,
        })
    }

    /// Best-effort forceful signal; failures are logged, never propagated —
    /// the caller always follows up with `delete`.
    pub async fn kill(&self, container_id: &str) {
        let args = vec![
            "kill".to_owned(),
            "--all".to_owned(),
            container_id.to_owned(),
            "KILL".to_owned(),
        ];
        match self.spawner.spawn(&self.binary, &args).await {
            Ok(mut child) => {
                let _ = child.wait().await;
            }
            Err(e) => tracing::warn!(container_id, error = %e, "runc kill failed to spawn"),
        }
    }

    /// Idempotent: tolerates "container does not exist" so this can always
    /// be called unconditionally during cleanup.
    pub async fn delete(&self, container_id: &str) {
        let args = vec![
            "delete".to_owned(),
            "--force".to_owned(),
            container_id.to_owned(),
        ];
        match self.spawner.spawn(&self.binary, &args).await {
            Ok(mut child) => {
                let _ = child.wait().await;
            }
            Err(e) => tracing::warn!(container_id, error = %e, "runc delete failed to spawn"),
        }
    }
}

async fn drain(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}
