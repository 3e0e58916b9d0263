use serde::{Deserialize, Serialize};

use crate::types::Mode;

/// Root configuration for a peer.
///
/// Loaded from `config.json` in the working directory if present, falling
/// back to defaults (persisted back to disk so the next run sees the same
/// values unless the operator edits the file). Individual fields can be
/// overridden from the environment for container-style bring-up; see
/// [`MeshvaultConfig::apply_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshvaultConfig {
    pub self_id: String,
    #[serde(default)]
    pub known_peers: Vec<String>,
    pub data_dir: String,
    pub mode: Mode,
    pub heartbeat_interval_secs: u64,
    pub failure_timeout_secs: u64,
    pub ring_refresh_interval_secs: u64,
    pub replicas: usize,
    pub replication_factor: usize,
    pub chunk_size: u64,
    pub n_index_shards: u32,
}

impl Default for MeshvaultConfig {
    fn default() -> Self {
        Self {
            self_id: "127.0.0.1:7000".to_string(),
            known_peers: Vec::new(),
            data_dir: "./data".to_string(),
            mode: Mode::Naive,
            heartbeat_interval_secs: 5,
            failure_timeout_secs: 15,
            ring_refresh_interval_secs: 10,
            replicas: 100,
            replication_factor: 3,
            chunk_size: 1024 * 1024,
            n_index_shards: 3,
        }
    }
}

impl MeshvaultConfig {
    const CONFIG_PATH: &'static str = "config.json";

    /// Load from `config.json`, falling back to (and persisting) defaults
    /// if the file is absent, then applying any environment overrides.
    pub async fn load() -> anyhow::Result<Self> {
        let mut config = match tokio::fs::read_to_string(Self::CONFIG_PATH).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", Self::CONFIG_PATH))?,
            Err(_) => {
                let default_config = Self::default();
                default_config.save().await?;
                default_config
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(Self::CONFIG_PATH, content).await?;
        Ok(())
    }

    /// Overrides recognized for container/process-per-peer test harnesses:
    /// `SELF_ID`, `KNOWN_PEERS` (comma-separated), `DATA_DIR`, `PORT`, `PEER_MODE`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SELF_ID") {
            self.self_id = v;
        }
        if let Ok(v) = std::env::var("KNOWN_PEERS") {
            self.known_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.data_dir = v;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Some((host, _)) = self.self_id.rsplit_once(':') {
                self.self_id = format!("{host}:{port}");
            }
        }
        if let Ok(v) = std::env::var("PEER_MODE") {
            if let Ok(mode) = v.parse::<Mode>() {
                self.mode = mode;
            } else {
                tracing::warn!(mode = %v, "ignoring unrecognized PEER_MODE");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let c = MeshvaultConfig::default();
        assert_eq!(c.replication_factor, 3);
        assert_eq!(c.chunk_size, 1024 * 1024);
    }

    #[test]
    fn env_overrides_known_peers_and_port() {
        std::env::set_var("KNOWN_PEERS", "a:1, b:2 ,c:3");
        std::env::set_var("PORT", "9999");
        let mut c = MeshvaultConfig::default();
        c.apply_env_overrides();
        assert_eq!(c.known_peers, vec!["a:1", "b:2", "c:3"]);
        assert!(c.self_id.ends_with(":9999"));
        std::env::remove_var("KNOWN_PEERS");
        std::env::remove_var("PORT");
    }
}
