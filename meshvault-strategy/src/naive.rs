//! Naive (flooding) strategy (§4.5.1): per-chunk DHT placement, manifest
//! replicated to `k` successors of the filename, and a one-hop broadcast
//! search with no distributed index.

use crate::{local_match, query_peer_local, PlacementStrategy, PreparedChunk, StrategyContext, FANOUT_WIDTH};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use meshvault_core::{now_secs, ChunkDescriptor, Manifest, SearchQuery, SearchResult};
use std::collections::HashMap;
use tracing::warn;

pub struct NaiveStrategy;

#[async_trait]
impl PlacementStrategy for NaiveStrategy {
    async fn upload(
        &self,
        ctx: &StrategyContext,
        filename: String,
        chunks: Vec<PreparedChunk>,
        total_size: u64,
        chunk_size: u64,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<Manifest> {
        let ring = ctx.membership.ring_snapshot().await;

        let mut descriptors = Vec::with_capacity(chunks.len());
        for (index, hash, bytes) in chunks {
            let node = ring.get(&hash).unwrap_or_else(|| ctx.self_id.clone());
            if node == ctx.self_id {
                ctx.store.save_chunk(&hash, &bytes).await?;
            } else if ctx.client.store_chunk(&node, bytes).await.is_none() {
                warn!(hash, node, "chunk placement did not acknowledge");
            }
            descriptors.push(ChunkDescriptor {
                index,
                hash,
                peers: vec![node],
            });
        }

        let manifest = Manifest {
            filename: filename.clone(),
            total_size,
            chunk_size,
            chunks: descriptors,
            metadata,
            updated_at: now_secs(),
            placement_key: None,
        };

        ctx.replication
            .replicate_manifest(&ring, &ctx.store, &manifest, &filename)
            .await;

        Ok(manifest)
    }

    async fn search(&self, ctx: &StrategyContext, query: &SearchQuery) -> SearchResult {
        broadcast_search(ctx, query).await
    }
}

/// One-hop fanout to every known peer's `/search_local`, plus this peer's
/// own local match, bounded to [`FANOUT_WIDTH`] concurrent requests.
/// Shared with [`crate::semantic::SemanticStrategy`]'s no-partition-key path.
pub(crate) async fn broadcast_search(ctx: &StrategyContext, query: &SearchQuery) -> SearchResult {
    let manifests = ctx.store.list_local_manifests().await.unwrap_or_default();
    let mut hits = local_match(&manifests, query, &ctx.self_id);

    let peers = ctx.membership.known_peers().await;
    let mut partial = false;

    let mut responses = stream::iter(peers.into_iter().map(|peer| {
        let ctx = ctx.clone();
        let query = query.clone();
        async move { query_peer_local(&ctx, &peer, &query).await }
    }))
    .buffer_unordered(FANOUT_WIDTH);

    while let Some(result) = responses.next().await {
        match result {
            Some(remote_hits) => hits.extend(remote_hits),
            None => partial = true,
        }
    }

    let (winners, stale) = meshvault_replication::reconcile_lww(hits);
    if !stale.is_empty() {
        let replication = ctx.replication.clone();
        tokio::spawn(async move { replication.read_repair(stale).await });
    }

    SearchResult {
        results: winners,
        partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_membership::Membership;
    use meshvault_replication::ReplicationEngine;
    use meshvault_transport::PeerClient;
    use std::sync::Arc;

    async fn single_node_ctx() -> (StrategyContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(meshvault_store::ObjectStore::new(dir.path()));
        store.ensure_dir().await.unwrap();
        let membership = Arc::new(Membership::new("self:1".into(), vec![], 50, PeerClient::new()));
        let replication = Arc::new(ReplicationEngine::new("self:1".into(), 3, PeerClient::new()));
        (
            StrategyContext {
                self_id: "self:1".into(),
                membership,
                store,
                replication,
                client: PeerClient::new(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn upload_places_single_node_chunks_and_manifest_locally() {
        let (ctx, _dir) = single_node_ctx().await;
        let chunks = vec![(0u64, "deadbeef".to_string(), b"hello".to_vec())];
        let manifest = NaiveStrategy
            .upload(&ctx, "f.bin".into(), chunks, 5, 5, HashMap::new())
            .await
            .unwrap();

        assert_eq!(manifest.chunks[0].peers, vec!["self:1".to_string()]);
        assert!(ctx.store.load_chunk("deadbeef").await.unwrap().is_some());
        assert!(ctx.store.load_manifest("f.bin").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_finds_locally_uploaded_file_by_filename() {
        let (ctx, _dir) = single_node_ctx().await;
        NaiveStrategy
            .upload(&ctx, "f.bin".into(), vec![], 0, 1, HashMap::new())
            .await
            .unwrap();

        let mut query: SearchQuery = HashMap::new();
        query.insert("filename".into(), "f.bin".into());
        let result = NaiveStrategy.search(&ctx, &query).await;
        assert_eq!(result.results.len(), 1);
        assert!(!result.partial);
    }
}
