//! Metadata (GSI with salting) strategy (§4.5.2): Naive placement for chunk
//! data, plus a salted global secondary index for scatter-gather search.

use crate::{fetch_index_shard, naive::NaiveStrategy, normalize, PlacementStrategy, PreparedChunk, StrategyContext, N_SHARDS};
use async_trait::async_trait;
use meshvault_core::{IndexShardEntry, Manifest, SearchHit, SearchQuery, SearchResult};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tracing::warn;

pub struct MetadataStrategy;

#[async_trait]
impl PlacementStrategy for MetadataStrategy {
    async fn upload(
        &self,
        ctx: &StrategyContext,
        filename: String,
        chunks: Vec<PreparedChunk>,
        total_size: u64,
        chunk_size: u64,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<Manifest> {
        let manifest = NaiveStrategy
            .upload(ctx, filename, chunks, total_size, chunk_size, metadata)
            .await?;

        write_gsi(ctx, &manifest).await;

        Ok(manifest)
    }

    async fn search(&self, ctx: &StrategyContext, query: &SearchQuery) -> SearchResult {
        if query.is_empty() {
            return SearchResult::default();
        }

        let ring = ctx.membership.ring_snapshot().await;
        let mut partial = false;
        let mut candidate_sets: Vec<HashMap<String, IndexShardEntry>> = Vec::with_capacity(query.len());

        for (key, value) in query {
            let base_key = format!("{}:{}", key, normalize(value));
            let mut attribute_matches: HashMap<String, IndexShardEntry> = HashMap::new();

            for shard in 0..N_SHARDS {
                let sharded_key = format!("{base_key}:{shard}");
                let node = ring
                    .get(&meshvault_replication::routing_hash(&sharded_key))
                    .unwrap_or_else(|| ctx.self_id.clone());
                match fetch_index_shard(ctx, &node, &sharded_key).await {
                    Some(entries) => {
                        for entry in entries {
                            attribute_matches.insert(entry.filename.clone(), entry);
                        }
                    }
                    None => partial = true,
                }
            }
            candidate_sets.push(attribute_matches);
        }

        let Some((first, rest)) = candidate_sets.split_first() else {
            return SearchResult { results: vec![], partial };
        };
        let mut surviving: HashSet<String> = first.keys().cloned().collect();
        for set in rest {
            let keys: HashSet<String> = set.keys().cloned().collect();
            surviving = surviving.intersection(&keys).cloned().collect();
        }

        let mut results = Vec::with_capacity(surviving.len());
        for filename in surviving {
            let Some(entry) = first.get(&filename).or_else(|| rest.iter().find_map(|s| s.get(&filename))) else {
                continue;
            };
            match hydrate(ctx, entry).await {
                Some(hit) => results.push(hit),
                None => partial = true,
            }
        }

        SearchResult { results, partial }
    }
}

/// Writes one salted GSI entry per `(key, value)` metadata pair. Matches the
/// source's write-side load balancing: pick one of `N_SHARDS` shards at
/// random rather than writing to all of them.
async fn write_gsi(ctx: &StrategyContext, manifest: &Manifest) {
    let ring = ctx.membership.ring_snapshot().await;
    let summary = IndexShardEntry {
        filename: manifest.filename.clone(),
        metadata: manifest.metadata.clone(),
        host: ctx.self_id.clone(),
    };

    for (key, value) in &manifest.metadata {
        for v in value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
            let base_key = format!("{}:{}", key, normalize(v));
            let shard = rand::thread_rng().gen_range(0..N_SHARDS);
            let sharded_key = format!("{base_key}:{shard}");
            let node = ring
                .get(&meshvault_replication::routing_hash(&sharded_key))
                .unwrap_or_else(|| ctx.self_id.clone());

            if node == ctx.self_id {
                if let Err(e) = ctx.store.save_index_entry(&sharded_key, summary.clone()).await {
                    warn!(sharded_key, error = %e, "failed to write local GSI entry");
                }
            } else {
                ctx.client.index_add(&node, &sharded_key, summary.clone()).await;
            }
        }
    }
}

/// A GSI entry only carries `{filename, metadata, host}`; fetch the
/// manifest from its host so results carry `updated_at` for LWW and can
/// be read-repaired like every other strategy's search results.
async fn hydrate(ctx: &StrategyContext, entry: &IndexShardEntry) -> Option<SearchHit> {
    let manifest = if entry.host == ctx.self_id {
        ctx.store.load_manifest(&entry.filename).await.ok().flatten()
    } else {
        ctx.client.get_manifest(&entry.host, &entry.filename).await
    }?;

    Some(SearchHit {
        filename: entry.filename.clone(),
        metadata: entry.metadata.clone(),
        host: entry.host.clone(),
        updated_at: manifest.updated_at,
        manifest,
    })
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
    async fn upload_then_search_finds_file_by_single_attribute() {
        let (ctx, _dir) = single_node_ctx().await;
        let mut meta = HashMap::new();
        meta.insert("genre".to_string(), "Action".to_string());

        MetadataStrategy
            .upload(&ctx, "f.bin".into(), vec![], 0, 1, meta)
            .await
            .unwrap();

        let mut query: SearchQuery = HashMap::new();
        query.insert("genre".into(), "action".into());
        let result = MetadataStrategy.search(&ctx, &query).await;
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].filename, "f.bin");
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn search_intersects_across_attributes() {
        let (ctx, _dir) = single_node_ctx().await;
        let mut meta_a = HashMap::new();
        meta_a.insert("genre".to_string(), "action".to_string());
        meta_a.insert("actor".to_string(), "brad pitt".to_string());
        MetadataStrategy.upload(&ctx, "a.bin".into(), vec![], 0, 1, meta_a).await.unwrap();

        let mut meta_b = HashMap::new();
        meta_b.insert("genre".to_string(), "action".to_string());
        MetadataStrategy.upload(&ctx, "b.bin".into(), vec![], 0, 1, meta_b).await.unwrap();

        let mut query: SearchQuery = HashMap::new();
        query.insert("genre".into(), "action".into());
        query.insert("actor".into(), "brad pitt".into());
        let result = MetadataStrategy.search(&ctx, &query).await;
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].filename, "a.bin");
    }

    #[test]
    fn empty_query_returns_empty_result() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ctx, _dir) = single_node_ctx().await;
            let result = MetadataStrategy.search(&ctx, &HashMap::new()).await;
            assert!(result.results.is_empty());
            assert!(!result.partial);
        });
    }
}
