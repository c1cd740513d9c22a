//! Legacy SSE-with-sidechannel delivery: `GET /sse/:key` opens the
//! downlink, `POST /messages?sessionid=` carries requests in and acks them;
//! the real reply goes out as an SSE `message` event (§4.G).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::Json;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::{
    authorization, client_url, event_ok, request_from, require_event_stream_accept,
    validation_response, AppState, EventStream, GuardedStream, SessionCleanup,
};
use crate::backend::BackendClient;
use crate::error::{BackendError, ValidationError};
use crate::protocol::{classify_value, initialize, methods, ClassifiedMessage, JsonRpcResponse};
use crate::session::{generate_session_id, ProxyInfo, Session};

pub async fn sse_handler(
    Path(key): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<EventStream<impl Stream<Item = Result<Event, Infallible>>>>, (StatusCode, String)> {
    require_event_stream_accept(&headers).map_err(validation_response)?;
    let config = super::require_valid_config(&state, &key)?;

    let mut info = ProxyInfo::new(config.server_uuid.clone(), config.server_key.clone());
    info.request_from = request_from(&headers);
    info.authorization = authorization(&headers);
    info.client_url = client_url(&headers).unwrap_or_default();
    let connection_time = info.connection_time.unwrap_or_else(chrono::Utc::now);
    let session_id = generate_session_id(&config.server_key, connection_time, 0);
    info.session_id = session_id.clone();

    let session = Session::new(Arc::new(config), info);
    state.context.store_session(session_id.clone(), Arc::clone(&session));

    let messages = session.messages().ok_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        "session channel already taken".to_string(),
    ))?;

    let endpoint_data = format!("/messages?sessionid={session_id}");
    let endpoint_event =
        futures::stream::once(async move { Event::default().event("endpoint").data(endpoint_data) });
    let message_events = messages
        .map(|bytes| Event::default().event("message").data(String::from_utf8_lossy(&bytes).into_owned()));

    let stream = endpoint_event.chain(message_events).map(event_ok);
    let guard = SessionCleanup {
        context: Arc::clone(&state),
        session_id,
    };

    Ok(Sse::new(GuardedStream::new(stream, guard)))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "sessionid")]
    session_id: Option<String>,
}

pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<JsonRpcResponse>), (StatusCode, String)> {
    let session_id = query
        .session_id
        .ok_or_else(|| validation_response(ValidationError::InvalidSessionId))?;
    let session = state
        .context
        .get_session(&session_id)
        .ok_or_else(|| validation_response(ValidationError::InvalidSessionId))?;

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return Ok((
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    crate::protocol::JsonRpcError::new(crate::error::codes::PARSE_ERROR, e.to_string()),
                    None,
                )),
            ))
        }
    };

    let request = match classify_value(value) {
        Ok(ClassifiedMessage::Request(request)) => request,
        Ok(_) => {
            return Ok((
                StatusCode::ACCEPTED,
                Json(JsonRpcResponse::error(
                    crate::protocol::JsonRpcError::new(
                        crate::error::codes::INVALID_REQUEST,
                        "expected a request frame",
                    ),
                    None,
                )),
            ))
        }
        Err(e) => {
            return Ok((
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    crate::protocol::JsonRpcError::new(e.error_code(), e.to_string()),
                    None,
                )),
            ))
        }
    };

    {
        let mut info = session.proxy_info.lock().unwrap_or_else(|e| e.into_inner());
        info.record_request(&request.method, request.params.clone(), Some(request.id.0));
        if request.method == methods::INITIALIZE {
            if let Some(params) = request
                .params
                .clone()
                .and_then(|v| serde_json::from_value::<initialize::InitializeParams>(v).ok())
            {
                info.capture_client_info(&params);
            }
        }
    }

    let (client, first_use) = resolve_session_client(&state, &session)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    if first_use {
        register_notification_forwarder(&state, &client, session_id.clone());
    }

    let request_id = request.id;
    match client.forward(request).await {
        Ok(response) => {
            if response.id == Some(request_id) {
                let info = {
                    let mut guard = session.proxy_info.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.request_method == methods::INITIALIZE {
                        if let Some(result) = response
                            .result
                            .clone()
                            .and_then(|v| serde_json::from_value::<initialize::InitializeResult>(v).ok())
                        {
                            guard.capture_server_info(&result);
                        }
                    }
                    guard.record_response(response.result.clone());
                    guard.clone()
                };
                crate::observability::maybe_record(state.log_sink.as_ref(), state.save_log, &info).await;
            }

            if let Ok(bytes) = serde_json::to_vec(&response) {
                session.send(Bytes::from(bytes));
            }
            Ok((
                StatusCode::ACCEPTED,
                Json(JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    result: Some(json!({})),
                    error: None,
                    id: None,
                }),
            ))
        }
        Err(err) => {
            super::record_backend_failure(&state, &session_id, &err).await;
            Ok((
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    crate::protocol::JsonRpcError::new(crate::error::codes::PROXY_ERROR, err.to_string()),
                    Some(request_id),
                )),
            ))
        }
    }
}

/// Resolve the session's backend client: the shared, registry-keyed client
/// for `share_process = true` servers, or the session's own lazily-created
/// exclusive client otherwise. The returned bool is `true` iff this call
/// created it (so the caller knows to register the notification forwarder).
async fn resolve_session_client(
    state: &AppState,
    session: &Arc<Session>,
) -> Result<(Arc<BackendClient>, bool), BackendError> {
    let config = &session.server_config;

    if config.share_process {
        if let Some(client) = state.context.get_client(&config.server_key) {
            return Ok((client, false));
        }
        let client = crate::backend::connect(config).await?;
        state.context.store_client(&config.server_key, Arc::clone(&client));
        return Ok((client, true));
    }

    if let Some(client) = session.exclusive_client().await {
        return Ok((client, false));
    }
    let client = crate::backend::connect(config).await?;
    session.set_exclusive_client(Arc::clone(&client)).await;
    Ok((client, true))
}

/// Register the session's notification forwarder on first client creation.
/// Closes over `session_id`, never a strong `Arc<Session>`, per §9's
/// cycle-breaking note.
fn register_notification_forwarder(state: &Arc<AppState>, client: &Arc<BackendClient>, session_id: String) {
    let state = Arc::clone(state);
    client.on_notification(move |notification| {
        if let Some(session) = state.context.get_session(&session_id) {
            if let Ok(bytes) = serde_json::to_vec(&notification) {
                session.send(Bytes::from(bytes));
            }
        }
    });
}
