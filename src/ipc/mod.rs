//! Inter-process request/response protocol.
//!
//! Clients send a JSON envelope `{ "pid": <int>, "data": { "enable", "rules" } }`
//! and get back exactly one short reply string addressed to their pid.
//! Malformed envelopes are logged and dropped; the protocol has no
//! malformed-request error code.

use std::io;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DesiredConfig;

pub mod unix;

pub use unix::UnixDatagramTransport;

/// Reply for a successfully applied request.
pub const REPLY_OK: &str = "OK";
/// Reply for any reconciliation failure.
pub const REPLY_ERROR: &str = "Error";
/// Placeholder reply while gateway discovery is still running.
pub const REPLY_DISCOVERING: &str = "Discovering";

/// Decoded update request.
#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    /// Requester's pid, used to address the reply.
    pub pid: i32,
    /// The desired configuration to reconcile toward.
    pub data: DesiredConfig,
}

/// Decode and validate one inbound message. Returns `None` (after a logged
/// warning) for anything malformed; the sender gets no reply in that case.
pub fn decode_request(raw: &[u8]) -> Option<UpdateRequest> {
    let request: UpdateRequest = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "dropping malformed request");
            return None;
        }
    };
    if let Err(err) = request.data.validate() {
        tracing::warn!(pid = request.pid, %err, "dropping request with invalid rules");
        return None;
    }
    Some(request)
}

/// The raw message channel the daemon serves. Production uses Unix
/// datagram sockets; tests use in-memory channels.
#[async_trait]
pub trait RequestTransport: Send {
    /// Block until the next inbound message arrives.
    async fn recv(&mut self) -> io::Result<Vec<u8>>;

    /// Send `reply` to the client identified by `pid`.
    async fn send(&self, pid: i32, reply: &str) -> io::Result<()>;

    /// Release transport resources on the graceful-exit path.
    fn shutdown(&self) {}
}
