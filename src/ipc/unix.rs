//! Unix datagram transport.
//!
//! The daemon binds one server socket; each client binds a reply socket
//! named after its pid in the same directory, mirroring the per-client
//! queue naming of classic message-queue IPC.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixDatagram;

use super::RequestTransport;

/// Upper bound on one request envelope.
const MAX_MSG_SIZE: usize = 4096;

/// File-name prefix of client reply sockets.
const CLIENT_SOCKET_PREFIX: &str = "portsyncd-client";

/// Datagram server socket plus the naming scheme for reply sockets.
pub struct UnixDatagramTransport {
    socket: UnixDatagram,
    path: PathBuf,
}

impl UnixDatagramTransport {
    /// Bind the server socket at `path`, replacing any stale socket file
    /// left behind by a previous run.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale server socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let socket = UnixDatagram::bind(&path)?;
        tracing::info!(path = %path.display(), "listening for update requests");
        Ok(Self { socket, path })
    }

    fn reply_path(&self, pid: i32) -> PathBuf {
        self.path
            .with_file_name(format!("{CLIENT_SOCKET_PREFIX}-{pid}.sock"))
    }

    /// Path of the bound server socket.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RequestTransport for UnixDatagramTransport {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn send(&self, pid: i32, reply: &str) -> io::Result<()> {
        let path = self.reply_path(pid);
        self.socket.send_to(reply.as_bytes(), &path).await?;
        tracing::debug!(pid, reply, "reply sent");
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove server socket");
        }
    }
}
