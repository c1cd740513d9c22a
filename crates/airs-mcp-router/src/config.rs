//! Configuration loading: the server registry table and the `app.save_log`
//! flag, read from a TOML file at startup (§1 ambient stack, §6 External
//! Interfaces). Nothing here is re-read at runtime — the registry built from
//! it is immutable for the process lifetime.

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::registry::ServerConfig;

/// `[app]` table: process-wide flags outside the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    /// Gate for the observability sink (§4.H, §8 Log gating).
    #[serde(default)]
    pub save_log: bool,
}

/// Top-level configuration file shape: `[app]` plus a `[[servers]]` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl RouterConfig {
    /// Load a TOML configuration file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let built = Config::builder()
            .add_source(File::new(
                path.to_str()
                    .with_context(|| format!("config path {} is not valid UTF-8", path.display()))?,
                FileFormat::Toml,
            ))
            .build()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;

        built
            .try_deserialize()
            .with_context(|| format!("failed to parse configuration file {}", path.display()))
    }
}
