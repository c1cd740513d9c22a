//! Layered error types for the proxy engine.
//!
//! Each component boundary in the router gets its own `thiserror` enum,
//! mirroring the error-per-concern shape the JSON-RPC protocol layer uses
//! upstream. HTTP handlers translate these into either a JSON-RPC error body
//! (protocol-level outcomes) or a plain HTTP status (validation failures) —
//! internal variants never leak onto the wire verbatim.

use thiserror::Error;

/// JSON-RPC 2.0 reserved error codes, plus the router's own `ProxyError`.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Router-specific application error for backend/transport failures.
    pub const PROXY_ERROR: i32 = -32000;
}

/// Errors raised while decoding or classifying a JSON-RPC message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),
}

impl ProtocolError {
    pub fn error_code(&self) -> i32 {
        match self {
            ProtocolError::Parse(_) => codes::PARSE_ERROR,
            ProtocolError::InvalidRequest(_) => codes::INVALID_REQUEST,
            ProtocolError::InvalidParams(_) => codes::INVALID_PARAMS,
            ProtocolError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
        }
    }
}

/// Errors raised by a `Transport` implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("uplink returned unacceptable status {0}")]
    UplinkStatus(reqwest::StatusCode),
}

/// Errors raised by `BackendClient::forward` and friends.
#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("client closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response frame: {0}")]
    MalformedResponse(String),

    #[error("waiter dropped without a response")]
    WaiterDropped,
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        BackendError::Transport(err.to_string())
    }
}

/// Errors raised while resolving a `server_key` against the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown server key: {0}")]
    UnknownKey(String),
}

/// Validation failures surfaced as plain HTTP 4xx responses (SPEC_FULL §7.1).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("key is required")]
    MissingKey,

    #[error("invalid server config")]
    InvalidServerConfig,

    #[error("invalid session id")]
    InvalidSessionId,

    #[error("GET requests require a text/event-stream Accept header")]
    AcceptNotEventStream,

    #[error("method not allowed")]
    MethodNotAllowed,
}
