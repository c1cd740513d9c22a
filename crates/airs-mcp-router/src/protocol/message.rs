//! JSON-RPC 2.0 message types with shared serialization behavior.
//!
//! Mirrors the upstream JSON-RPC message trio (Request / Response /
//! Notification) but narrows `id` to a plain integer, per the invariant that
//! request IDs in this protocol are client-chosen integers (never rewritten
//! by the router).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// A JSON-RPC request identifier. Always an integer in this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl RequestId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// JSON-RPC 2.0 request: `method` + optional `params`, non-null `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 notification: `method` + optional `params`, no `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 error object, embedded in [`JsonRpcResponse::error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC 2.0 response: exactly one of `result`/`error`, carries the
/// request's `id` (or `None` for a parse error with no recoverable id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcResponse {
    pub fn success(result: Value, id: RequestId) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(error: JsonRpcError, id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

/// The outcome of classifying one raw JSON-RPC frame.
#[derive(Debug, Clone)]
pub enum ClassifiedMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

/// Classify a raw JSON-RPC frame as Request, Notification, or Response.
///
/// Requests and notifications are distinguished solely by the presence of a
/// non-null `id`; a frame carrying `result` or `error` is always a Response
/// regardless of whether it also carries a `method` (peers never send both).
pub fn classify(bytes: &[u8]) -> Result<ClassifiedMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)?;
    classify_value(value)
}

/// As [`classify`], but starting from an already-parsed [`Value`].
pub fn classify_value(value: Value) -> Result<ClassifiedMessage, ProtocolError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::InvalidRequest("envelope is not a JSON object".into()))?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(ProtocolError::InvalidRequest(
            "missing or invalid jsonrpc version".into(),
        ));
    }

    let has_result_or_error = obj.contains_key("result") || obj.contains_key("error");
    if has_result_or_error {
        let response: JsonRpcResponse = serde_json::from_value(value)?;
        return Ok(ClassifiedMessage::Response(response));
    }

    if !obj.contains_key("method") {
        return Err(ProtocolError::InvalidRequest(
            "message has neither method nor result/error".into(),
        ));
    }

    let has_id = obj.get("id").map(|v| !v.is_null()).unwrap_or(false);
    if has_id {
        let request: JsonRpcRequest = serde_json::from_value(value)?;
        Ok(ClassifiedMessage::Request(request))
    } else {
        let notification: JsonRpcNotification = serde_json::from_value(value)?;
        Ok(ClassifiedMessage::Notification(notification))
    }
}
