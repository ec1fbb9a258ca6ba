//! FD Handoff Channel: binds a per-request Unix-domain rendezvous socket,
//! accepts exactly one connection from the freshly-launched container, and
//! transfers one already-open file descriptor to it as SCM_RIGHTS ancillary
//! data.
//!
//! The transferred descriptor is modeled as an owned value with move
//! semantics (spec design note: "model it as a typed value 'owned file
//! descriptor'"): the caller hands over an `OwnedFd` and, once `transfer`
//! returns, the descriptor's kernel object lives on inside the container —
//! the supervisor's reference is dropped here.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tokio::net::UnixListener;

use crate::error::{Error, Result};

pub struct Rendezvous {
    path: PathBuf,
    listener: UnixListener,
}

impl Rendezvous {
    /// Binds a fresh Unix-domain listening socket at
    /// `socket_dir/<container_id>.sock`.
    pub fn prepare(socket_dir: &Path, container_id: &str) -> Result<Self> {
        std::fs::create_dir_all(socket_dir)
            .map_err(|e| Error::Handoff(format!("creating rendezvous socket dir: {e}")))?;
        let path = socket_dir.join(format!("{container_id}.sock"));
        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Handoff(format!("binding rendezvous socket: {e}")))?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits (bounded by `deadline`) for the container to connect, then
    /// sends a single byte with `client_fd` as a single SCM_RIGHTS ancillary
    /// record, and drops the supervisor's own reference to the descriptor.
    pub async fn transfer(&self, client_fd: OwnedFd, deadline: Duration) -> Result<()> {
        let (stream, _addr) = tokio::time::timeout(deadline, self.listener.accept())
            .await
            .map_err(|_| Error::Timeout("waiting for container to connect".to_owned()))?
            .map_err(|e| Error::Handoff(format!("accepting container connection: {e}")))?;

        loop {
            stream
                .writable()
                .await
                .map_err(|e| Error::Handoff(format!("waiting for rendezvous socket: {e}")))?;
            let raw = stream.as_raw_fd();
            let iov = [std::io::IoSlice::new(&[0u8])];
            let fds = [client_fd.as_raw_fd()];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            match sendmsg::<UnixAddr>(raw, &iov, &cmsg, MsgFlags::empty(), None) {
                Ok(_) => break,
                Err(nix::errno::Errno::EWOULDBLOCK) => continue,
                Err(e) => return Err(Error::Handoff(format!("sendmsg: {e}"))),
            }
        }

        // client_fd is dropped here: our reference goes away only after the
        // container has acknowledged receipt via the successful sendmsg.
        drop(client_fd);
        Ok(())
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove rendezvous socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transfer_times_out_if_container_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = Rendezvous::prepare(dir.path(), "abc").unwrap();
        let socket_path = rendezvous.path().to_path_buf();
        assert!(socket_path.exists());

        let (a, _b) = std::net::UnixStream::pair().unwrap();
        let fd: OwnedFd = a.into();

        let err = rendezvous
            .transfer(fd, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn transfer_completes_once_container_connects() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = Rendezvous::prepare(dir.path(), "abc").unwrap();
        let socket_path = rendezvous.path().to_path_buf();

        let (sender, receiver) = std::net::UnixStream::pair().unwrap();
        let client_fd: OwnedFd = sender.into();

        let connector = tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut conn = std::os::unix::net::UnixStream::connect(&socket_path).unwrap();
            let mut byte = [0u8; 1];
            conn.read_exact(&mut byte).unwrap();
            byte[0]
        });

        let transfer = rendezvous.transfer(client_fd, Duration::from_secs(2));
        let (transfer_result, received_byte) = tokio::join!(transfer, connector);
        transfer_result.unwrap();
        assert_eq!(received_byte.unwrap(), 0u8);
        drop(receiver);
    }
}
