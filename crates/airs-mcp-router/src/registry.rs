//! Server registry: resolves an opaque `server_key` to a [`ServerConfig`].
//!
//! Read-only to the core. Populated once at startup from [`crate::config`]
//! and never mutated afterward — the core must not assume a key added after
//! boot will ever resolve.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RegistryError, ValidationError};

/// Which transport a [`ServerConfig`] speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Process,
    Http,
}

/// Immutable description of one backend tool-server, keyed by `server_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_uuid: String,
    pub server_name: String,
    pub server_key: String,
    pub transport_kind: TransportKind,
    /// Shell command to spawn. Required iff `transport_kind == Process`.
    #[serde(default)]
    pub command: Option<String>,
    /// Hash of `command`, carried through to `ProxyInfo` for observability.
    /// Computed at load time rather than stored in config.
    #[serde(skip_deserializing, default)]
    pub command_hash: Option<String>,
    /// Backend SSE URL. Required iff `transport_kind == Http`.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Whether sessions resolving to this key share one `BackendClient`.
    #[serde(default)]
    pub share_process: bool,
    #[serde(default)]
    pub server_type: String,
}

impl ServerConfig {
    /// Populate `command_hash` from `command`. Called once at load time.
    pub fn with_computed_hash(mut self) -> Self {
        self.command_hash = self.command.as_deref().map(|c| {
            let mut hasher = Sha256::new();
            hasher.update(c.as_bytes());
            format!("{:x}", hasher.finalize())
        });
        self
    }

    /// Structural consistency check: a `process` config needs a non-empty
    /// `command`, an `http` config needs a parseable `server_url` (§6: HTTP
    /// 400 "invalid `ServerConfig`"). Checked per-request rather than only
    /// at load time, since the registry is a pure pass-through over whatever
    /// configuration it was handed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.transport_kind {
            TransportKind::Process => match &self.command {
                Some(command) if !command.trim().is_empty() => Ok(()),
                _ => Err(ValidationError::InvalidServerConfig),
            },
            TransportKind::Http => match &self.server_url {
                Some(url) if reqwest::Url::parse(url).is_ok() => Ok(()),
                _ => Err(ValidationError::InvalidServerConfig),
            },
        }
    }
}

/// A pure read-only view over the configured servers, keyed by `server_key`.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: HashMap<String, ServerConfig>,
}

impl ServerRegistry {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        let servers = servers
            .into_iter()
            .map(|s| (s.server_key.clone(), s.with_computed_hash()))
            .collect();
        Self { servers }
    }

    pub fn get(&self, server_key: &str) -> Option<&ServerConfig> {
        self.servers.get(server_key)
    }

    pub fn require(&self, server_key: &str) -> Result<&ServerConfig, RegistryError> {
        self.get(server_key)
            .ok_or_else(|| RegistryError::UnknownKey(server_key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: &str) -> ServerConfig {
        ServerConfig {
            server_uuid: "uuid-1".into(),
            server_name: "sample".into(),
            server_key: key.into(),
            transport_kind: TransportKind::Process,
            command: Some("./mock-echo".into()),
            command_hash: None,
            server_url: None,
            share_process: false,
            server_type: "stdio".into(),
        }
    }

    #[test]
    fn resolves_known_key() {
        let registry = ServerRegistry::new(vec![sample("sqlite")]);
        assert!(registry.get("sqlite").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_key_is_none() {
        let registry = ServerRegistry::new(vec![sample("sqlite")]);
        assert!(registry.get("postgres").is_none());
        assert!(matches!(
            registry.require("postgres"),
            Err(RegistryError::UnknownKey(_))
        ));
    }

    #[test]
    fn computes_command_hash_at_load_time() {
        let registry = ServerRegistry::new(vec![sample("sqlite")]);
        let config = registry.get("sqlite").unwrap();
        assert!(config.command_hash.is_some());
        assert_eq!(config.command_hash.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn process_config_without_command_is_invalid() {
        let mut config = sample("sqlite");
        config.command = None;
        assert!(matches!(config.validate(), Err(ValidationError::InvalidServerConfig)));
    }

    #[test]
    fn http_config_without_server_url_is_invalid() {
        let config = ServerConfig {
            transport_kind: TransportKind::Http,
            command: None,
            server_url: None,
            ..sample("search")
        };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidServerConfig)));
    }

    #[test]
    fn http_config_with_malformed_url_is_invalid() {
        let config = ServerConfig {
            transport_kind: TransportKind::Http,
            command: None,
            server_url: Some("not a url".into()),
            ..sample("search")
        };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidServerConfig)));
    }

    #[test]
    fn valid_configs_pass() {
        assert!(sample("sqlite").validate().is_ok());
        let http_config = ServerConfig {
            transport_kind: TransportKind::Http,
            command: None,
            server_url: Some("http://localhost:9000/sse".into()),
            ..sample("search")
        };
        assert!(http_config.validate().is_ok());
    }
}
