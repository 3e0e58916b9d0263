//! Semantic (document partitioning) strategy (§4.5.3): every chunk, the
//! manifest, and search for a file all live on one partition node, chosen
//! from the file's genre (or title, or "unknown"). Trades storage balance
//! for O(1) routing when the query carries the partition attribute.

use crate::{naive::broadcast_search, normalize, query_peer_local, PlacementStrategy, PreparedChunk, StrategyContext};
use async_trait::async_trait;
use meshvault_core::{now_secs, ChunkDescriptor, Manifest, SearchQuery, SearchResult};
use std::collections::HashMap;
use tracing::warn;

pub struct SemanticStrategy;

const PARTITION_ATTRIBUTE: &str = "genre";
const TITLE_FALLBACK_ATTRIBUTE: &str = "title";

fn partition_key(metadata: &HashMap<String, String>) -> String {
    if let Some(genre) = metadata.get(PARTITION_ATTRIBUTE) {
        let n = normalize(genre);
        if !n.is_empty() {
            return n;
        }
    }
    if let Some(title) = metadata.get(TITLE_FALLBACK_ATTRIBUTE) {
        let n = normalize(title);
        if !n.is_empty() {
            return n;
        }
    }
    "unknown".to_string()
}

#[async_trait]
impl PlacementStrategy for SemanticStrategy {
    async fn upload(
        &self,
        ctx: &StrategyContext,
        filename: String,
        chunks: Vec<PreparedChunk>,
        total_size: u64,
        chunk_size: u64,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<Manifest> {
        let key = partition_key(&metadata);
        let ring = ctx.membership.ring_snapshot().await;
        let primary = ring
            .get(&meshvault_replication::routing_hash(&key))
            .unwrap_or_else(|| ctx.self_id.clone());

        let mut descriptors = Vec::with_capacity(chunks.len());
        for (index, hash, bytes) in chunks {
            if primary == ctx.self_id {
                ctx.store.save_chunk(&hash, &bytes).await?;
            } else if ctx.client.store_chunk(&primary, bytes).await.is_none() {
                warn!(hash, primary, "semantic chunk placement did not acknowledge");
            }
            descriptors.push(ChunkDescriptor {
                index,
                hash,
                peers: vec![primary.clone()],
            });
        }

        let manifest = Manifest {
            filename,
            total_size,
            chunk_size,
            chunks: descriptors,
            metadata,
            updated_at: now_secs(),
            placement_key: Some(key),
        };

        if primary == ctx.self_id {
            ctx.store.save_manifest(&manifest).await?;
        } else if ctx.client.store_manifest(&primary, &manifest).await.is_none() {
            warn!(filename = %manifest.filename, primary, "semantic manifest placement did not acknowledge");
        }

        Ok(manifest)
    }

    async fn search(&self, ctx: &StrategyContext, query: &SearchQuery) -> SearchResult {
        let Some(genre) = query.get(PARTITION_ATTRIBUTE) else {
            return broadcast_search(ctx, query).await;
        };

        let key = normalize(genre);
        let ring = ctx.membership.ring_snapshot().await;
        let node = ring
            .get(&meshvault_replication::routing_hash(&key))
            .unwrap_or_else(|| ctx.self_id.clone());

        match query_peer_local(ctx, &node, query).await {
            Some(results) => SearchResult {
                results,
                partial: false,
            },
            None => SearchResult {
                results: vec![],
                partial: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn partition_key_prefers_genre_over_title() {
        let m = meta(&[("genre", " Action "), ("title", "Die Hard")]);
        assert_eq!(partition_key(&m), "action");
    }

    #[test]
    fn partition_key_falls_back_to_title_then_unknown() {
        let m = meta(&[("title", " Die Hard ")]);
        assert_eq!(partition_key(&m), "die hard");
        assert_eq!(partition_key(&HashMap::new()), "unknown");
    }

    #[test]
    fn partition_key_skips_blank_genre() {
        let m = meta(&[("genre", "   "), ("title", "Fallback")]);
        assert_eq!(partition_key(&m), "fallback");
    }
}
