//! Placement & search strategies (C5): three interchangeable policies for
//! where data lives and how queries find it, unified behind one trait so
//! the request surface never needs to know which mode a peer is running in.
//!
//! Every strategy composes the same four building blocks — the ring
//! (C1), the object store (C2), the peer client (transport), and the
//! replication engine (C4) — bundled into [`StrategyContext`] so adding a
//! fourth strategy never means widening a function signature across the
//! workspace.

mod metadata;
mod naive;
mod semantic;

pub use metadata::MetadataStrategy;
pub use naive::NaiveStrategy;
pub use semantic::SemanticStrategy;

use async_trait::async_trait;
use meshvault_core::{IndexShardEntry, Manifest, Mode, PeerId, SearchHit, SearchQuery, SearchResult};
use meshvault_membership::Membership;
use meshvault_replication::ReplicationEngine;
use meshvault_store::ObjectStore;
use meshvault_transport::PeerClient;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of index shards per GSI key (§4.5.2). Also used by Semantic as the
/// bound on how many nodes a broadcast search fans out to at once.
pub const N_SHARDS: usize = 3;

/// Bounded fanout width for parallel peer queries (§5).
pub const FANOUT_WIDTH: usize = 10;

/// Everything a strategy needs to place and find data, bundled so the
/// trait's methods stay readable.
#[derive(Clone)]
pub struct StrategyContext {
    pub self_id: PeerId,
    pub membership: Arc<Membership>,
    pub store: Arc<ObjectStore>,
    pub replication: Arc<ReplicationEngine>,
    pub client: PeerClient,
}

/// A chunk ready for placement: its index within the file, its SHA-1, and
/// its bytes.
pub type PreparedChunk = (u64, String, Vec<u8>);

#[async_trait]
pub trait PlacementStrategy: Send + Sync {
    async fn upload(
        &self,
        ctx: &StrategyContext,
        filename: String,
        chunks: Vec<PreparedChunk>,
        total_size: u64,
        chunk_size: u64,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<Manifest>;

    async fn search(&self, ctx: &StrategyContext, query: &SearchQuery) -> SearchResult;
}

/// Selects and runs one of the three strategies for a peer's configured
/// [`Mode`]. A thin enum dispatch rather than `Arc<dyn PlacementStrategy>`,
/// since the set of modes is closed and known at startup.
pub enum Strategy {
    Naive(NaiveStrategy),
    Metadata(MetadataStrategy),
    Semantic(SemanticStrategy),
}

impl Strategy {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Naive => Strategy::Naive(NaiveStrategy),
            Mode::Metadata => Strategy::Metadata(MetadataStrategy),
            Mode::Semantic => Strategy::Semantic(SemanticStrategy),
        }
    }
}

#[async_trait]
impl PlacementStrategy for Strategy {
    async fn upload(
        &self,
        ctx: &StrategyContext,
        filename: String,
        chunks: Vec<PreparedChunk>,
        total_size: u64,
        chunk_size: u64,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<Manifest> {
        match self {
            Strategy::Naive(s) => s.upload(ctx, filename, chunks, total_size, chunk_size, metadata).await,
            Strategy::Metadata(s) => s.upload(ctx, filename, chunks, total_size, chunk_size, metadata).await,
            Strategy::Semantic(s) => s.upload(ctx, filename, chunks, total_size, chunk_size, metadata).await,
        }
    }

    async fn search(&self, ctx: &StrategyContext, query: &SearchQuery) -> SearchResult {
        match self {
            Strategy::Naive(s) => s.search(ctx, query).await,
            Strategy::Metadata(s) => s.search(ctx, query).await,
            Strategy::Semantic(s) => s.search(ctx, query).await,
        }
    }
}

/// Trims and lowercases a value the same way for placement keys, GSI keys,
/// and query attributes, so writers and readers always agree on a key's
/// canonical form.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// The placement key used by C4's anti-entropy and by graceful leave:
/// `manifest.placement_key` when the owning strategy set one (Semantic),
/// otherwise the filename (Naive, Metadata).
pub fn placement_key_of(manifest: &Manifest) -> String {
    manifest.placement_key.clone().unwrap_or_else(|| manifest.filename.clone())
}

/// String-equality, case-insensitive AND over query attribute/value pairs
/// against a manifest's metadata. `filename` is a special key matched
/// against the manifest's own filename rather than its metadata map.
/// Shared by every strategy's local match and by the `/search_local`
/// endpoint regardless of which strategy the receiving peer runs, since a
/// node's own disk is searched the same way no matter how it places data.
pub fn local_match(manifests: &[Manifest], query: &SearchQuery, host: &str) -> Vec<SearchHit> {
    manifests
        .iter()
        .filter(|m| matches_query(m, query))
        .map(|m| SearchHit {
            filename: m.filename.clone(),
            metadata: m.metadata.clone(),
            host: host.to_string(),
            updated_at: m.updated_at,
            manifest: m.clone(),
        })
        .collect()
}

fn matches_query(manifest: &Manifest, query: &SearchQuery) -> bool {
    for (key, value) in query {
        if key == "filename" {
            if !manifest.filename.eq_ignore_ascii_case(value) {
                return false;
            }
            continue;
        }
        let found = manifest
            .metadata
            .get(key)
            .map(|v| v.eq_ignore_ascii_case(value))
            .unwrap_or(false);
        if !found {
            return false;
        }
    }
    true
}

/// Runs `local_match` against a remote peer's index-less local store when
/// the peer is `self`, or calls its `/search_local` endpoint otherwise.
/// Shared by every strategy's broadcast-search path.
pub async fn query_peer_local(ctx: &StrategyContext, peer: &str, query: &SearchQuery) -> Option<Vec<SearchHit>> {
    if peer == ctx.self_id {
        let manifests = ctx.store.list_local_manifests().await.ok()?;
        Some(local_match(&manifests, query, &ctx.self_id))
    } else {
        ctx.client.search_local(peer, query).await.map(|r| r.results)
    }
}

/// Fetches the index entries held under `sharded_key`, locally or remotely.
/// `None` signals the shard could not be reached (feeds `partial`).
pub async fn fetch_index_shard(ctx: &StrategyContext, node: &str, sharded_key: &str) -> Option<Vec<IndexShardEntry>> {
    if node == ctx.self_id {
        ctx.store.get_index_entries(sharded_key).await.ok()
    } else {
        ctx.client.index_get(node, sharded_key).await
    }
}
