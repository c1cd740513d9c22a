//! Transport abstraction and the two concrete backend transports.
//!
//! A `Transport` delivers one complete JSON-RPC frame at a time, in either
//! direction, to exactly one backend tool-server. The router never assumes
//! anything about framing beyond "one `read()` == one frame"; each impl hides
//! its own wire format (newline-delimited JSON for processes, SSE `data:`
//! fields for HTTP).

mod http_sse;
mod process;

pub use http_sse::{HttpSseTransport, HttpSseTransportConfig};
pub use process::ProcessTransport;

use async_trait::async_trait;

use crate::error::TransportError;

/// One backend connection's byte-stream capability set.
///
/// `read()` delivers one complete frame per call and must be driven from a
/// single task — implementations are not required to be safe for concurrent
/// readers. `write()` may be called concurrently with `read()` and with
/// itself (implementations serialize concurrent writers internally).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying connection (spawn the process / open the SSE
    /// stream and complete its handshake). Must be called before `read`/
    /// `write`.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Write one frame. A trailing newline is added by implementations that
    /// need one; callers pass the bare JSON-RPC bytes.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until one complete frame is available, or the transport closes.
    async fn read(&self) -> Result<Vec<u8>, TransportError>;

    /// Best-effort diagnostic line drained from the backend's stderr
    /// (process transport) or `None` (transports with no such channel).
    async fn recv_stderr_line(&self) -> Option<String> {
        None
    }

    /// Close the transport. Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;
}
