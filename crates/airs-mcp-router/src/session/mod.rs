//! Session state: per-request observability metadata (`ProxyInfo`), the
//! legacy-SSE client connection (`Session`), and the process-wide store that
//! keys both of them plus shared backend clients (`ProxyContext`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::backend::BackendClient;
use crate::registry::ServerConfig;

/// Mutable per-session, per-request metadata. Doubles as the observability
/// row handed to a [`crate::observability::LogSink`] once a request
/// terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub session_id: String,
    pub request_id: Option<i64>,
    pub server_uuid: String,
    pub server_key: String,

    pub client_name: String,
    pub client_version: String,
    pub client_url: String,
    pub protocol_version: String,

    pub server_name: String,
    pub server_version: String,
    pub jsonrpc_version: String,

    pub connection_time: Option<DateTime<Utc>>,
    pub request_time: Option<DateTime<Utc>>,
    pub response_time: Option<DateTime<Utc>>,
    pub cost_time_ms: Option<i64>,

    pub request_method: String,
    pub request_params: Option<Value>,
    pub response_result: Option<Value>,

    /// `X-Request-From` header, carried for observability only.
    pub request_from: Option<String>,
    /// Raw `Authorization` header value, carried for observability only; the
    /// core never validates it.
    pub authorization: Option<String>,
}

impl ProxyInfo {
    pub fn new(server_uuid: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            server_uuid: server_uuid.into(),
            server_key: server_key.into(),
            connection_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Stamp `request_time` and the request's method/params/id ahead of a
    /// forward; mirrors the handler-side bookkeeping done before every
    /// `BackendClient::forward` call.
    pub fn record_request(&mut self, method: &str, params: Option<Value>, request_id: Option<i64>) {
        self.request_time = Some(Utc::now());
        self.request_method = method.to_string();
        self.request_params = params;
        self.request_id = request_id;
    }

    /// Stamp `response_time`/`cost_time_ms`/`response_result` after a forward
    /// completes (successfully or not).
    pub fn record_response(&mut self, result: Option<Value>) {
        let now = Utc::now();
        self.response_time = Some(now);
        if let Some(request_time) = self.request_time {
            self.cost_time_ms = Some((now - request_time).num_milliseconds());
        }
        self.response_result = result;
    }

    /// Capture the client descriptor fields off an `initialize` call's params.
    pub fn capture_client_info(&mut self, params: &crate::protocol::initialize::InitializeParams) {
        self.client_name = params.client_info.name.clone();
        self.client_version = params.client_info.version.clone();
        self.protocol_version = params.protocol_version.clone();
    }

    /// Capture the server descriptor fields off an `initialize` call's result.
    pub fn capture_server_info(&mut self, result: &crate::protocol::initialize::InitializeResult) {
        self.server_name = result.server_info.name.clone();
        self.server_version = result.server_info.version.clone();
        if self.protocol_version.is_empty() {
            self.protocol_version = result.protocol_version.clone();
        }
    }
}

/// Deterministic session id: SHA-256 hex of `{server_key, connection_time,
/// request_id}`. Upgraded from the original system's MD5 (§9 Open Question).
pub fn generate_session_id(server_key: &str, connection_time: DateTime<Utc>, request_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_key.as_bytes());
    hasher.update(connection_time.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(request_id.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fallback session id for `DELETE /mcp/:key` when no `Mcp-Session-Id` header
/// is present: a deterministic hash of the key alone, with no connection-time
/// or request-id salt (§4.G `DELETE` fallback).
pub fn fallback_session_id(server_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Legacy-SSE-mode client connection: an outbound frame stream plus a done
/// signal, tied to one `ServerConfig` and a mutable `ProxyInfo`.
///
/// Destroyed when the owning HTTP request context ends or the backend fails.
/// Does not itself own a `BackendClient` — callers look that up through
/// [`ProxyContext`] and decide whether to close it based on `share_process`.
pub struct Session {
    pub server_config: Arc<ServerConfig>,
    pub proxy_info: StdMutex<ProxyInfo>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    outbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    done_tx: broadcast::Sender<()>,
    closed: AtomicBool,
    /// The backend client this session owns exclusively when its
    /// `ServerConfig` has `share_process = false`. Lazily created on first
    /// use (§4.G `POST /messages`), never populated for `share_process =
    /// true` servers — those route through `ProxyContext::clients` instead.
    client: AsyncMutex<Option<Arc<BackendClient>>>,
}

impl Session {
    pub fn new(server_config: Arc<ServerConfig>, proxy_info: ProxyInfo) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (done_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            server_config,
            proxy_info: StdMutex::new(proxy_info),
            outbound_tx,
            outbound_rx: StdMutex::new(Some(outbound_rx)),
            done_tx,
            closed: AtomicBool::new(false),
            client: AsyncMutex::new(None),
        })
    }

    /// The session's exclusive backend client, if one has been created yet.
    pub async fn exclusive_client(&self) -> Option<Arc<BackendClient>> {
        self.client.lock().await.clone()
    }

    /// Populate the session's exclusive backend client. Only meaningful for
    /// `share_process = false` configs.
    pub async fn set_exclusive_client(&self, client: Arc<BackendClient>) {
        *self.client.lock().await = Some(client);
    }

    /// Drop and close the session's exclusive backend client, if any, so the
    /// next request lazily recreates it (§7.3 recovery-by-recreation).
    pub async fn clear_exclusive_client(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Take the outbound stream. Only the SSE handler that owns this
    /// session's HTTP response body should call this; a second call returns
    /// `None`.
    pub fn messages(&self) -> Option<UnboundedReceiverStream<Bytes>> {
        self.outbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// Enqueue an outbound frame. Returns `false` if the session has no live
    /// receiver (already closed or `messages()` was dropped) — callers treat
    /// that as a send failure and close the session.
    pub fn send(&self, frame: Bytes) -> bool {
        self.outbound_tx.send(frame).is_ok()
    }

    /// Subscribe to the session's done signal.
    pub fn done(&self) -> broadcast::Receiver<()> {
        self.done_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. Broadcasts `done` and, if this session owns a non-shared
    /// `BackendClient`, closes it on a detached task (§5 Cancellation).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done_tx.send(());
        if let Ok(mut guard) = self.client.try_lock() {
            if let Some(client) = guard.take() {
                tokio::spawn(async move {
                    client.close().await;
                });
            }
        }
    }

    pub fn session_id(&self) -> String {
        self.proxy_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_id
            .clone()
    }
}

/// Process-wide live state: shared backend clients keyed by `server_key`,
/// non-shared streamable-mode clients keyed by `session_id`, legacy-SSE
/// sessions, and streamable-mode `ProxyInfo` records keyed by `session_id`.
/// Every map is a [`DashMap`] — no single coarse lock guards the whole store.
#[derive(Default)]
pub struct ProxyContext {
    clients: DashMap<String, Arc<BackendClient>>,
    session_clients: DashMap<String, Arc<BackendClient>>,
    sessions: DashMap<String, Arc<Session>>,
    proxy_info: DashMap<String, ProxyInfo>,
}

impl ProxyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_client(&self, server_key: &str) -> Option<Arc<BackendClient>> {
        self.clients.get(server_key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn store_client(&self, server_key: impl Into<String>, client: Arc<BackendClient>) {
        self.clients.insert(server_key.into(), client);
    }

    /// Remove and close the client registered under `server_key`, if any.
    pub async fn delete_client(&self, server_key: &str) {
        if let Some((_, client)) = self.clients.remove(server_key) {
            client.close().await;
        }
    }

    /// The exclusive `BackendClient` streamable-mode keeps for one
    /// `share_process = false` session, reused across every request that
    /// carries that session's `Mcp-Session-Id` (§3 Invariant 4).
    pub fn get_session_client(&self, session_id: &str) -> Option<Arc<BackendClient>> {
        self.session_clients.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn store_session_client(&self, session_id: impl Into<String>, client: Arc<BackendClient>) {
        self.session_clients.insert(session_id.into(), client);
    }

    /// Remove and close the session's exclusive client, if any. A no-op for
    /// sessions backed by a `share_process = true` server, which never get an
    /// entry here.
    pub async fn delete_session_client(&self, session_id: &str) {
        if let Some((_, client)) = self.session_clients.remove(session_id) {
            client.close().await;
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn store_session(&self, session_id: impl Into<String>, session: Arc<Session>) {
        self.sessions.insert(session_id.into(), session);
    }

    pub fn delete_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, session)| {
            session.close();
            session
        })
    }

    pub fn get_proxy_info(&self, session_id: &str) -> Option<ProxyInfo> {
        self.proxy_info.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn store_proxy_info(&self, session_id: impl Into<String>, info: ProxyInfo) {
        self.proxy_info.insert(session_id.into(), info);
    }

    pub fn delete_proxy_info(&self, session_id: &str) -> Option<ProxyInfo> {
        self.proxy_info.remove(session_id).map(|(_, info)| info)
    }
}
