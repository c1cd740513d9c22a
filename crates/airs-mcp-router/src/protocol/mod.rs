//! JSON-RPC 2.0 message codec.
//!
//! Recognizes the three message shapes the router cares about — Request,
//! Notification, Response — over the shared JSON-RPC envelope, and nothing
//! beyond that: the router does not interpret method semantics except for the
//! handful named in [`methods`].

mod message;

pub use message::{
    classify, classify_value, ClassifiedMessage, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId,
};

/// Method names the router treats specially; everything else is opaque
/// passthrough.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const NOTIFICATIONS_INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Client/server descriptors captured from `initialize` params/result.
/// Kept intentionally small: the router never validates capability
/// negotiation, it only captures the fields ProxyInfo records.
pub mod initialize {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ClientInfo {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub version: String,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ServerInfo {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub version: String,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct InitializeParams {
        #[serde(rename = "protocolVersion", default)]
        pub protocol_version: String,
        #[serde(rename = "clientInfo", default)]
        pub client_info: ClientInfo,
        #[serde(default)]
        pub capabilities: Value,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct InitializeResult {
        #[serde(rename = "protocolVersion", default)]
        pub protocol_version: String,
        #[serde(rename = "serverInfo", default)]
        pub server_info: ServerInfo,
        #[serde(default)]
        pub capabilities: Value,
    }
}
