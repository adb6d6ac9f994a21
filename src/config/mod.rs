use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7379".into(),
            max_connections: 1024,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueuesConfig {
    /// POP count when the client does not ask for one.
    pub default_pop_count: u64,
    pub max_payload_bytes: usize,
    /// RECOVER idle threshold when the client does not ask for one.
    pub default_recover_min_idle_ms: i64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            default_pop_count: 1,
            max_payload_bytes: 1024 * 1024,
            default_recover_min_idle_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshot file; persistence is off when unset.
    pub path: Option<String>,
    pub load_on_start: bool,
    pub save_on_shutdown: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: None,
            load_on_start: true,
            save_on_shutdown: true,
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queues: QueuesConfig,
    pub snapshot: SnapshotConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

/// Config used by the CLI and anywhere no explicit config is threaded:
/// `RELIQ_CONFIG` path, else `reliq.toml`, else built-in defaults.
pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    let path = std::env::var("RELIQ_CONFIG").unwrap_or_else(|_| "reliq.toml".into());
    load_config(&path).unwrap_or_default()
});
