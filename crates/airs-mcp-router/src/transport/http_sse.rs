//! HTTP + SSE backend transport: downlink is a long-lived `text/event-stream`
//! GET, uplink is a `POST` per outgoing frame.
//!
//! The handshake is the SSE-with-`endpoint`-event variant: the first event a
//! freshly-opened stream must deliver is an `endpoint` event whose `data` is
//! the URL to `POST` requests to. Everything after that is `message` events,
//! one JSON-RPC frame per event. This is the variant most MCP-over-SSE
//! backends speak; the router does not support the older inline-streaming
//! shape where responses ride back on the POST body itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::Transport;
use crate::error::TransportError;

/// Tuning knobs for [`HttpSseTransport`]. Defaults match the common case of a
/// same-host backend with no unusual latency.
#[derive(Debug, Clone)]
pub struct HttpSseTransportConfig {
    /// How long to wait for the initial `endpoint` handshake event.
    pub handshake_timeout: Duration,
    /// How long to wait for a POST uplink to complete.
    pub uplink_timeout: Duration,
    /// Backlog of parsed frames buffered between the SSE reader task and
    /// `read()` callers before the reader blocks.
    pub channel_capacity: usize,
}

impl Default for HttpSseTransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            uplink_timeout: Duration::from_secs(30),
            channel_capacity: 10,
        }
    }
}

/// One backend connection over HTTP with an SSE downlink.
pub struct HttpSseTransport {
    sse_url: Url,
    config: HttpSseTransportConfig,
    client: Client,
    endpoint: Mutex<Option<Url>>,
    frames: Mutex<Option<mpsc::Receiver<Bytes>>>,
    dropped: Arc<AtomicU64>,
}

impl HttpSseTransport {
    pub fn new(sse_url: Url, config: HttpSseTransportConfig) -> Self {
        Self {
            sse_url,
            config,
            client: Client::new(),
            endpoint: Mutex::new(None),
            frames: Mutex::new(None),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count of downlink `message` events dropped because the inbound
    /// channel was full (§5 Back-pressure, §9 design note). A production
    /// deployment would surface this as a metric; the core just counts it.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolve a (possibly relative) `endpoint` event payload against the
    /// SSE stream's own URL, and reject anything pointing at a different
    /// origin — the handshake must not be used to redirect the uplink
    /// off-host.
    fn resolve_endpoint(&self, raw: &str) -> Result<Url, TransportError> {
        let resolved = self
            .sse_url
            .join(raw)
            .map_err(|e| TransportError::Handshake(format!("invalid endpoint url: {e}")))?;

        if resolved.origin() != self.sse_url.origin() {
            return Err(TransportError::Handshake(format!(
                "endpoint origin {} does not match stream origin {}",
                resolved.origin().ascii_serialization(),
                self.sse_url.origin().ascii_serialization()
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Transport for HttpSseTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        let response = self
            .client
            .get(self.sse_url.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Handshake(format!(
                "sse stream returned status {}",
                response.status()
            )));
        }

        let mut byte_stream = response.bytes_stream();
        let (tx, rx) = mpsc::channel::<Bytes>(self.config.channel_capacity);
        let (endpoint_tx, endpoint_rx) = tokio::sync::oneshot::channel::<String>();
        let dropped = Arc::clone(&self.dropped);

        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut endpoint_tx = Some(endpoint_tx);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("sse downlink read error: {e}");
                        break;
                    }
                };
                // Normalize line endings up front so boundary detection only
                // has to look for a bare "\n\n".
                buf.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

                while let Some(pos) = find_event_boundary(&buf) {
                    let raw_event = buf.drain(..pos).collect::<Vec<u8>>();
                    // Consume the blank-line separator itself.
                    consume_separator(&mut buf);

                    if let Some((event, data)) = parse_sse_event(&raw_event) {
                        match event.as_deref() {
                            Some("endpoint") => {
                                if let Some(sender) = endpoint_tx.take() {
                                    let _ = sender.send(data);
                                }
                            }
                            _ => {
                                if !dispatch_message(&tx, &dropped, data) {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            debug!("sse downlink closed");
        });

        let endpoint_raw = tokio::time::timeout(self.config.handshake_timeout, endpoint_rx)
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.config.handshake_timeout))?
            .map_err(|_| TransportError::Handshake("stream closed before endpoint event".into()))?;

        let endpoint = self.resolve_endpoint(&endpoint_raw)?;
        *self.endpoint.lock().await = Some(endpoint);
        *self.frames.lock().await = Some(rx);

        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let endpoint = {
            let guard = self.endpoint.lock().await;
            guard.clone().ok_or(TransportError::Closed)?
        };

        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .timeout(self.config.uplink_timeout)
            .body(bytes.to_vec())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            other => Err(TransportError::UplinkStatus(other)),
        }
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.frames.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::Closed)?;
        rx.recv().await.map(|b| b.to_vec()).ok_or(TransportError::Closed)
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.frames.lock().await.take();
        self.endpoint.lock().await.take();
        Ok(())
    }
}

/// Hand one decoded `message` event's data to the inbound channel,
/// non-blocking. A full channel means a slow `read()` caller; §5 calls for
/// dropping the overflow (counted in `dropped`, logged) rather than stalling
/// the SSE downlink reader on it. Returns `false` only when the receiver is
/// gone, telling the caller to stop reading the stream.
fn dispatch_message(tx: &mpsc::Sender<Bytes>, dropped: &AtomicU64, data: String) -> bool {
    match tx.try_send(Bytes::from(data.into_bytes())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total_dropped = total, "sse inbound channel full, dropping message");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Find the end of the first complete SSE event in `buf` (the index right
/// after its terminating blank line's first newline), or `None` if no
/// complete event is buffered yet.
fn find_event_boundary(buf: &[u8]) -> Option<usize> {
    let needle = b"\n\n";
    buf.windows(2).position(|w| w == needle).map(|p| p + 1)
}

fn consume_separator(buf: &mut Vec<u8>) {
    while buf.first() == Some(&b'\n') {
        buf.remove(0);
    }
}

/// Parse one SSE event's `event:`/`data:` lines. Multiple `data:` lines are
/// joined with `\n`, per the SSE spec.
fn parse_sse_event(raw: &[u8]) -> Option<(Option<String>, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in text.split(['\n']) {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some((event, data_lines.join("\n")))
}
