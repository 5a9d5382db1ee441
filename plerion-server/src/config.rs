//! TOML configuration for the room server.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:9090"
//! tick_ms = 50
//! max_peers_per_room = 100
//! outbound_capacity = 256
//! compression_threshold = 16384
//! ```
//!
//! Every key is optional; missing keys keep [`ServerConfig::default`].

use std::path::Path;

use anyhow::Context;
use plerion_sync::ServerConfig;
use serde::Deserialize;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "plerion.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfRoot {
    #[serde(default)]
    pub server: ConfServer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfServer {
    pub bind: Option<String>,
    pub tick_ms: Option<u64>,
    pub max_peers_per_room: Option<usize>,
    pub outbound_capacity: Option<usize>,
    pub compression_threshold: Option<usize>,
}

impl ConfRoot {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("server config is not valid TOML")
    }

    /// Read `path`, or [`DEFAULT_CONFIG_PATH`] when `None`. Only the
    /// default path may be absent.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                log::info!("Loaded config from {}", path.display());
                Self::parse(&text)
            }
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No {} found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to read config file {}", path.display()))
            }
        }
    }

    pub fn into_server_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        let conf = self.server;
        ServerConfig {
            bind_addr: conf.bind.unwrap_or(defaults.bind_addr),
            tick_interval_ms: conf.tick_ms.unwrap_or(defaults.tick_interval_ms),
            max_peers_per_room: conf.max_peers_per_room.unwrap_or(defaults.max_peers_per_room),
            outbound_capacity: conf.outbound_capacity.unwrap_or(defaults.outbound_capacity),
            snapshot_compression_threshold: conf
                .compression_threshold
                .unwrap_or(defaults.snapshot_compression_threshold),
        }
    }
}

/// Reject settings the server cannot run with.
pub fn validate(config: &ServerConfig) -> anyhow::Result<()> {
    anyhow::ensure!(config.tick_interval_ms > 0, "tick_ms must be positive");
    anyhow::ensure!(config.max_peers_per_room > 0, "max_peers_per_room must be positive");
    anyhow::ensure!(config.outbound_capacity > 0, "outbound_capacity must be positive");
    Ok(())
}
