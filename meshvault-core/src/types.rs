use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A peer's address, unique cluster-wide. `host:port`, e.g. `"10.0.0.4:7000"`.
pub type PeerId = String;

/// Selects which placement/search strategy a peer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Naive,
    Metadata,
    Semantic,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NAIVE" => Ok(Mode::Naive),
            "METADATA" => Ok(Mode::Metadata),
            "SEMANTIC" => Ok(Mode::Semantic),
            other => Err(anyhow::anyhow!("unknown peer mode: {other}")),
        }
    }
}

/// One chunk's placement record inside a manifest: where it lives besides
/// wherever it was first written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u64,
    pub hash: String,
    pub peers: Vec<PeerId>,
}

/// Per-file record. Identity for lookup is `sha1(filename)`, never a field
/// on the struct itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkDescriptor>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub updated_at: i64,
    /// Present only for manifests placed by the Semantic strategy; anti-entropy
    /// must prefer this over `filename` when computing primary ownership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_key: Option<String>,
}

/// `{filename, metadata, host}` written into an index shard by the Metadata
/// strategy. Uniqueness inside a shard is by `filename`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexShardEntry {
    pub filename: String,
    pub metadata: HashMap<String, String>,
    pub host: PeerId,
}

/// A single search hit, as aggregated by a strategy's `search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub filename: String,
    pub metadata: HashMap<String, String>,
    pub host: PeerId,
    pub updated_at: i64,
    pub manifest: Manifest,
}

/// Result shape every strategy's `search` returns.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchResult {
    pub results: Vec<SearchHit>,
    pub partial: bool,
}

/// A search query: attribute/value pairs, matched case-insensitively.
/// The special key `"filename"` matches against the manifest's filename
/// rather than its metadata map.
pub type SearchQuery = HashMap<String, String>;

/// Aggregate counters returned by `stats`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageStats {
    pub chunks_count: u64,
    pub chunks_bytes: u64,
    pub manifests_count: u64,
    pub indexes_count: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub peer_id: PeerId,
    pub mode: Mode,
    pub storage: StorageStats,
}

/// `{missing_manifests, missing_chunks}` — the reply to `check_existence`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MissingSet {
    pub missing_manifests: Vec<String>,
    pub missing_chunks: Vec<String>,
}

/// Request body for `check_existence`: storage hashes to probe for.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExistenceQuery {
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub chunks: Vec<String>,
}

/// Current wall-clock seconds, used for `updated_at`. A thin wrapper so every
/// call site reads the same monotonic-non-decreasing intent instead of
/// reaching for `chrono`/`SystemTime` directly.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
