//! Streamable-HTTP delivery: `POST|GET|DELETE|OPTIONS /mcp/:key`. A single
//! endpoint quartet that, unlike the legacy SSE pair, keeps no standing
//! `Session` — correlation state lives in `ProxyContext::proxy_info`, keyed by
//! the `Mcp-Session-Id` the client echoes back on every call after
//! `initialize` (§4.G).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::warn;

use super::{
    authorization, client_url, event_ok, proxy_error_response, request_from,
    require_event_stream_accept, resolve_client, session_id_header, validation_response,
    AppState, GuardedStream,
};
use crate::error::{codes, BackendError, ValidationError};
use crate::protocol::{
    classify_value, initialize, methods, ClassifiedMessage, JsonRpcError, JsonRpcResponse,
};
use crate::registry::ServerConfig;
use crate::session::{fallback_session_id, generate_session_id, ProxyInfo};

pub async fn mcp_post_handler(
    Path(key): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let config = super::require_valid_config(&state, &key)?;

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return Ok(json_rpc_body(JsonRpcResponse::error(
                JsonRpcError::new(codes::PARSE_ERROR, e.to_string()),
                None,
            )))
        }
    };

    let message = match classify_value(value) {
        Ok(m) => m,
        Err(e) => {
            return Ok(json_rpc_body(JsonRpcResponse::error(
                JsonRpcError::new(e.error_code(), e.to_string()),
                None,
            )))
        }
    };

    let request = match message {
        // Peer-originated reply frames have nothing for us to correlate —
        // the router never itself sent the request they answer.
        ClassifiedMessage::Response(_) => return Ok(empty_ack()),
        ClassifiedMessage::Notification(notification) => {
            return Ok(handle_notification(&state, &config, &headers, notification).await);
        }
        ClassifiedMessage::Request(r) => r,
    };

    let is_initialize = request.method == methods::INITIALIZE;

    let session_id = if is_initialize {
        let connection_time = Utc::now();
        let session_id = generate_session_id(&config.server_key, connection_time, request.id.0);
        let mut info = ProxyInfo::new(config.server_uuid.clone(), config.server_key.clone());
        info.session_id = session_id.clone();
        info.connection_time = Some(connection_time);
        info.request_from = request_from(&headers);
        info.authorization = authorization(&headers);
        info.client_url = client_url(&headers).unwrap_or_default();
        state.context.store_proxy_info(session_id.clone(), info);
        session_id
    } else {
        let header_id =
            session_id_header(&headers).ok_or_else(|| validation_response(ValidationError::InvalidSessionId))?;
        if state.context.get_proxy_info(&header_id).is_none() {
            return Err(validation_response(ValidationError::InvalidSessionId));
        }
        header_id
    };

    {
        let mut info = state
            .context
            .get_proxy_info(&session_id)
            .ok_or_else(|| validation_response(ValidationError::InvalidSessionId))?;
        info.record_request(&request.method, request.params.clone(), Some(request.id.0));
        if is_initialize {
            if let Some(params) = request
                .params
                .clone()
                .and_then(|v| serde_json::from_value::<initialize::InitializeParams>(v).ok())
            {
                info.capture_client_info(&params);
            }
        }
        state.context.store_proxy_info(session_id.clone(), info);
    }

    let client = resolve_client(&state.context, &config, &session_id)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    let request_id = request.id;
    let forward_result = client.forward(request).await;

    match forward_result {
        Ok(response) => {
            if let Some(mut info) = state.context.get_proxy_info(&session_id) {
                if is_initialize {
                    if let Some(result) = response
                        .result
                        .clone()
                        .and_then(|v| serde_json::from_value::<initialize::InitializeResult>(v).ok())
                    {
                        info.capture_server_info(&result);
                    }
                }
                info.record_response(response.result.clone());
                state.context.store_proxy_info(session_id.clone(), info.clone());
                crate::observability::maybe_record(state.log_sink.as_ref(), state.save_log, &info).await;
            }

            Ok(success_response(&headers, is_initialize, &session_id, response))
        }
        Err(err) => {
            record_mcp_backend_failure(&state, &config, &session_id, &err).await;
            Ok(json_rpc_body(proxy_error_response(&err, Some(request_id))))
        }
    }
}

/// `notifications/*` frames carry no `id` and expect no response; the
/// session they ride on must already exist (a client cannot `initialize` via
/// a notification). Forwarded through `notify`, never `forward`.
async fn handle_notification(
    state: &AppState,
    config: &ServerConfig,
    headers: &HeaderMap,
    notification: crate::protocol::JsonRpcNotification,
) -> Response {
    let Some(session_id) = session_id_header(headers) else {
        return empty_ack();
    };
    if state.context.get_proxy_info(&session_id).is_none() {
        return empty_ack();
    }

    match resolve_client(&state.context, config, &session_id).await {
        Ok(client) => {
            if let Err(e) = client.notify(notification).await {
                warn!(session_id = %session_id, error = %e, "failed to forward notification");
            }
        }
        Err(e) => warn!(session_id = %session_id, error = %e, "failed to resolve backend for notification"),
    }
    empty_ack()
}

async fn record_mcp_backend_failure(
    state: &AppState,
    config: &ServerConfig,
    session_id: &str,
    err: &BackendError,
) {
    warn!(session_id = %session_id, error = %err, "backend request failed");
    if let Some(mut info) = state.context.get_proxy_info(session_id) {
        info.record_response(None);
        state.context.store_proxy_info(session_id.to_string(), info.clone());
        crate::observability::maybe_record(state.log_sink.as_ref(), state.save_log, &info).await;
    }
    if config.share_process {
        state.context.delete_client(&config.server_key).await;
    } else {
        state.context.delete_session_client(session_id).await;
    }
}

/// Build the successful response, honoring the `Accept` negotiation (§4.G,
/// §8 Accept-negotiation property) and attaching `Mcp-Session-Id` on the
/// `initialize` call that minted it.
fn success_response(
    headers: &HeaderMap,
    is_initialize: bool,
    session_id: &str,
    response: JsonRpcResponse,
) -> Response {
    let mut http_response = if super::prefers_event_stream(headers) {
        sse_single_event(&response).unwrap_or_else(|| Json(response).into_response())
    } else {
        Json(response).into_response()
    };

    if is_initialize {
        if let Ok(value) = HeaderValue::from_str(session_id) {
            http_response
                .headers_mut()
                .insert(HeaderName::from_static("mcp-session-id"), value);
        }
    }
    http_response
}

/// One JSON-RPC response carried as a single SSE `message` event. `None` if
/// the response can't be serialized, so the caller falls back to plain JSON.
fn sse_single_event(response: &JsonRpcResponse) -> Option<Response> {
    let data = serde_json::to_string(response).ok()?;
    let event = Event::default().event("message").data(data);
    let stream = futures::stream::once(async move { event }).map(event_ok);
    Some(Sse::new(stream).into_response())
}

fn empty_ack() -> Response {
    (
        StatusCode::ACCEPTED,
        Json(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(json!({})),
            error: None,
            id: None,
        }),
    )
        .into_response()
}

fn json_rpc_body(response: JsonRpcResponse) -> Response {
    (StatusCode::OK, Json(response)).into_response()
}

/// `GET /mcp/:key`: a push-only SSE stream that stays open for
/// server-initiated pushes the core itself never originates. Emits
/// `connection: ready` immediately; `connection: closed` is logged (not
/// wire-sent — nothing can reach a client that has already disconnected) once
/// the response body is torn down.
pub async fn mcp_get_handler(
    Path(key): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<GuardedStream<impl Stream<Item = Result<Event, Infallible>>, PushGuard>>, (StatusCode, String)>
{
    require_event_stream_accept(&headers).map_err(validation_response)?;
    super::require_valid_config(&state, &key)?;

    let ready = futures::stream::once(async { Event::default().event("connection").data("ready") });
    let idle = futures::stream::pending::<Event>();
    let combined = ready.chain(idle).map(event_ok);

    Ok(Sse::new(GuardedStream::new(combined, PushGuard { key })))
}

/// Logs `connection: closed` for the push stream's key once its body is
/// dropped — nothing can actually be written to the wire at that point, the
/// client is already gone.
struct PushGuard {
    key: String,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        tracing::debug!(server_key = %self.key, "mcp push stream closed");
    }
}

/// `DELETE /mcp/:key`: tears down whatever live state the session
/// accumulated — its `BackendClient` (if shared), any legacy `Session`, and
/// its `ProxyInfo` row.
pub async fn mcp_delete_handler(
    Path(key): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let config = super::require_valid_config(&state, &key)?;

    let session_id = session_id_header(&headers).unwrap_or_else(|| fallback_session_id(&config.server_key));

    state.context.delete_session(&session_id);
    state.context.delete_proxy_info(&session_id);
    state.context.delete_session_client(&session_id).await;
    if config.share_process {
        state.context.delete_client(&config.server_key).await;
    }

    Ok(Json(json!({ "status": "deleted", "session_id": session_id })))
}

/// `OPTIONS /mcp/:key`: CORS preflight, returned regardless of whether `key`
/// resolves (§8 CORS-invariance property).
pub async fn mcp_options_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (HeaderName::from_static("access-control-allow-origin"), "*"),
            (
                HeaderName::from_static("access-control-allow-methods"),
                "GET, POST, DELETE, OPTIONS",
            ),
            (
                HeaderName::from_static("access-control-allow-headers"),
                "Content-Type, Accept, Authorization, Mcp-Session-Id",
            ),
            (HeaderName::from_static("access-control-max-age"), "86400"),
        ],
    )
}
