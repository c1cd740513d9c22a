//! Client-facing HTTP delivery: the legacy SSE-with-sidechannel pair
//! (`GET /sse/:key`, `POST /messages`) and the streamable-HTTP quartet
//! (`POST|GET|DELETE|OPTIONS /mcp/:key`), per SPEC_FULL §4.G.
//!
//! Protocol-level outcomes (malformed JSON-RPC, backend failures) go back as
//! HTTP 200 with a JSON-RPC error body; validation failures (missing key,
//! wrong Accept, unknown session) go back as plain HTTP 4xx — never the
//! internal error variants themselves.

mod mcp;
mod sse;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::sse::Event;
use axum::routing::{get, post};
use axum::Router;
use futures::Stream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::backend::BackendClient;
use crate::error::{BackendError, RegistryError, ValidationError};
use crate::observability::LogSink;
use crate::registry::ServerConfig;
use crate::session::ProxyContext;

/// Shared state handed to every handler.
pub struct AppState {
    pub registry: crate::registry::ServerRegistry,
    pub context: ProxyContext,
    pub log_sink: Arc<dyn LogSink>,
    pub save_log: bool,
}

impl AppState {
    pub fn new(
        registry: crate::registry::ServerRegistry,
        log_sink: Arc<dyn LogSink>,
        save_log: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            context: ProxyContext::new(),
            log_sink,
            save_log,
        })
    }
}

/// Assemble the axum router for all five client-facing routes, plus the
/// ambient `TraceLayer`/`CorsLayer` (§4.G bootstrap).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sse/{key}", get(sse::sse_handler))
        .route("/messages", post(sse::messages_handler))
        .route(
            "/mcp/{key}",
            post(mcp::mcp_post_handler)
                .get(mcp::mcp_get_handler)
                .delete(mcp::mcp_delete_handler)
                .options(mcp::mcp_options_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("mcp-session-id"),
        ])
        .max_age(std::time::Duration::from_secs(86400))
}

/// HTTP 400 with a plain-text body, per §4.G / §7.1.
fn validation_response(err: ValidationError) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn registry_response(err: RegistryError) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

/// Resolve `key` against the registry and check the resulting
/// [`ServerConfig`] for structural consistency, both as HTTP 400 (§6/§7.1:
/// unknown key and invalid `ServerConfig` are the same validation-failure
/// class).
fn require_valid_config(
    state: &AppState,
    key: &str,
) -> Result<ServerConfig, (StatusCode, String)> {
    let config = state.registry.require(key).map_err(registry_response)?.clone();
    config.validate().map_err(validation_response)?;
    Ok(config)
}

/// Translate a terminal `BackendError` into the JSON-RPC `ProxyError` body
/// carried back at HTTP 200, per §4.A/§7.3.
fn proxy_error_response(err: &BackendError, id: Option<crate::protocol::RequestId>) -> crate::protocol::JsonRpcResponse {
    crate::protocol::JsonRpcResponse::error(
        crate::protocol::JsonRpcError::new(crate::error::codes::PROXY_ERROR, err.to_string()),
        id,
    )
}

fn require_event_stream_accept(headers: &HeaderMap) -> Result<(), ValidationError> {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept.contains("text/event-stream") {
        Ok(())
    } else {
        Err(ValidationError::AcceptNotEventStream)
    }
}

/// True if the `Accept` header lists `text/event-stream` ahead of
/// `application/json` (§4.G streamable-mode negotiation, §8 Accept
/// negotiation property).
fn prefers_event_stream(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let sse_pos = accept.find("text/event-stream");
    let json_pos = accept.find("application/json");
    match (sse_pos, json_pos) {
        (Some(sse), Some(json)) => sse < json,
        (Some(_), None) => true,
        _ => false,
    }
}

fn request_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Request-From")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `HTTP-Referer`, the header this protocol's clients use to identify the
/// calling application's URL. Stamped into `ProxyInfo::client_url` at
/// connection time rather than parsed out of `initialize` params, which
/// carry no URL field.
fn client_url(headers: &HeaderMap) -> Option<String> {
    headers
        .get("HTTP-Referer")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn session_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Resolve (or lazily create) the `BackendClient` for `config`, persisting it
/// per the sharing policy in §3 Invariant 4: `share_process` servers are
/// multiplexed through `ProxyContext::clients`, keyed by `server_key`;
/// otherwise the client is exclusive to `session_id` and reused across every
/// request that session makes, via `ProxyContext::session_clients` — mirroring
/// `sse::resolve_session_client`'s legacy-mode lifecycle instead of spawning a
/// fresh backend per call.
async fn resolve_client(
    context: &ProxyContext,
    config: &ServerConfig,
    session_id: &str,
) -> Result<Arc<BackendClient>, BackendError> {
    if !config.share_process {
        if let Some(client) = context.get_session_client(session_id) {
            return Ok(client);
        }
        let client = crate::backend::connect(config).await?;
        context.store_session_client(session_id, Arc::clone(&client));
        return Ok(client);
    }

    if let Some(client) = context.get_client(&config.server_key) {
        return Ok(client);
    }

    let client = crate::backend::connect(config).await?;
    context.store_client(&config.server_key, Arc::clone(&client));
    Ok(client)
}

/// Record a terminal backend failure that occurred mid-`forward` for a
/// legacy-mode `Session`: stamp a (resultless) response into its `ProxyInfo`,
/// push the row through the observability sink, and drop the now-terminal
/// backend client so the next request recreates it (§4.H / §7.3).
pub(crate) async fn record_backend_failure(state: &AppState, session_id: &str, err: &BackendError) {
    warn!(session_id = %session_id, error = %err, "backend request failed");
    let Some(session) = state.context.get_session(session_id) else {
        return;
    };

    let info = {
        let mut guard = session.proxy_info.lock().unwrap_or_else(|e| e.into_inner());
        guard.record_response(None);
        guard.clone()
    };
    crate::observability::maybe_record(state.log_sink.as_ref(), state.save_log, &info).await;

    if session.server_config.share_process {
        state.context.delete_client(&session.server_config.server_key).await;
    } else {
        session.clear_exclusive_client().await;
    }
}

/// Wraps a stream with a value whose `Drop` performs cleanup once the SSE
/// body is torn down, whether by the stream ending naturally or by axum
/// dropping the response future on client disconnect.
struct GuardedStream<S, G> {
    inner: S,
    _guard: G,
}

impl<S, G> GuardedStream<S, G> {
    fn new(inner: S, guard: G) -> Self {
        Self { inner, _guard: guard }
    }
}

impl<S: Stream + Unpin, G: Unpin> Stream for GuardedStream<S, G> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

/// Cleans up a session registered in `ProxyContext` when dropped. Idempotent
/// with an explicit `DELETE /mcp/:key` removal racing it.
struct SessionCleanup {
    context: Arc<AppState>,
    session_id: String,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        self.context.context.delete_session(&self.session_id);
    }
}

type EventStream<S> = GuardedStream<S, SessionCleanup>;

fn event_ok(event: Event) -> Result<Event, std::convert::Infallible> {
    Ok(event)
}
