//! Replication & anti-entropy (C4): write-path fan-out to `k` targets,
//! a periodic repair loop, and last-writer-wins reconciliation with
//! read-repair.
//!
//! The key correctness rule this crate exists to enforce: the **storage
//! hash** used to check whether a replica holds a copy is always
//! `sha1(filename)`; the **routing hash** used to decide who the primary
//! *is* comes from the strategy's placement key (`filename` for
//! Naive/Metadata, `manifest.placement_key` for Semantic). Conflating the
//! two means anti-entropy never recognizes itself as primary for
//! semantically placed data.

use meshvault_core::{now_secs, ExistenceQuery, Manifest, PeerId, SearchHit};
use meshvault_membership::Membership;
use meshvault_ring::ConsistentHashRing;
use meshvault_store::ObjectStore;
use meshvault_transport::PeerClient;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// `sha1(filename)` — the storage hash used for manifest lookup and
/// existence checks, independent of whichever placement key routed it.
pub fn storage_hash(filename: &str) -> String {
    routing_hash(filename)
}

/// Every ring lookup for a logical placement key (filename, GSI sharded key,
/// semantic partition key) goes through `sha1(key)` first; the ring then
/// applies its own MD5 on top of that hex string. Content-addressed chunk
/// placement is the one exception — a chunk hash is already the single hash
/// layer and is handed to the ring directly.
pub fn routing_hash(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// A jittered anti-entropy interval in `[20, 40)` seconds, per §4.4.
pub fn anti_entropy_jitter() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(20..40))
}

pub struct ReplicationEngine {
    self_id: PeerId,
    k: usize,
    client: PeerClient,
}

impl ReplicationEngine {
    pub fn new(self_id: PeerId, replication_factor: usize, client: PeerClient) -> Self {
        Self {
            self_id,
            k: replication_factor,
            client,
        }
    }

    /// The `k` targets for `placement_key` under `ring`: its primary plus
    /// up to `k-1` successors. `placement_key` is the logical key (a
    /// filename, typically) and is SHA-1-hashed before the ring sees it.
    pub fn targets(&self, ring: &ConsistentHashRing, placement_key: &str) -> Vec<PeerId> {
        ring.successors(&routing_hash(placement_key), self.k)
    }

    /// Write-path replication: ship `manifest` to all `k` targets of
    /// `placement_key`. Local delivery (when a target is `self`) goes
    /// straight to `store`; everything else is a best-effort outbound call —
    /// failures are logged, not retried here, since anti-entropy heals them.
    pub async fn replicate_manifest(
        &self,
        ring: &ConsistentHashRing,
        store: &ObjectStore,
        manifest: &Manifest,
        placement_key: &str,
    ) -> Vec<PeerId> {
        let targets = self.targets(ring, placement_key);
        for target in &targets {
            if target == &self.self_id {
                if let Err(e) = store.save_manifest(manifest).await {
                    warn!(filename = %manifest.filename, error = %e, "failed to save local replica");
                }
            } else if self.client.store_manifest(target, manifest).await.is_none() {
                warn!(filename = %manifest.filename, target, "manifest replication did not acknowledge");
            }
        }
        targets
    }

    /// One anti-entropy pass: for every manifest this peer stores, check
    /// whether it is primary under the current ring (using the strategy's
    /// placement key). If so, verify each replica holds a copy and re-send
    /// any that don't.
    pub async fn anti_entropy_tick<F>(&self, membership: &Membership, store: &ObjectStore, placement_key: F)
    where
        F: Fn(&Manifest) -> String,
    {
        let ring = membership.ring_snapshot().await;
        let manifests = match store.list_local_manifests().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "anti-entropy failed to list local manifests");
                return;
            }
        };

        for manifest in manifests {
            let routing_key = routing_hash(&placement_key(&manifest));
            let Some(primary) = ring.get(&routing_key) else {
                continue;
            };
            if primary != self.self_id {
                continue;
            }

            let replicas: Vec<PeerId> = ring
                .successors(&routing_key, self.k)
                .into_iter()
                .filter(|p| p != &self.self_id)
                .collect();
            if replicas.is_empty() {
                continue;
            }

            let storage_key = storage_hash(&manifest.filename);
            for replica in replicas {
                let query = ExistenceQuery {
                    manifests: vec![storage_key.clone()],
                    chunks: vec![],
                };
                let Some(missing) = self.client.check_existence(&replica, &query).await else {
                    continue;
                };
                if missing.missing_manifests.contains(&storage_key) {
                    debug!(filename = %manifest.filename, replica, "repairing missing replica");
                    if self.client.store_manifest(&replica, &manifest).await.is_none() {
                        warn!(filename = %manifest.filename, replica, "anti-entropy repair failed, will retry next cycle");
                    }
                }
            }
        }
    }

    /// Pushes the winning manifest from `reconcile_lww` to every replica
    /// observed holding a stale copy.
    pub async fn read_repair(&self, stale: Vec<(PeerId, Manifest)>) {
        for (peer, manifest) in stale {
            if peer == self.self_id {
                continue;
            }
            if self.client.store_manifest(&peer, &manifest).await.is_none() {
                warn!(peer, filename = %manifest.filename, "read-repair push failed");
            }
        }
    }
}

/// Groups search hits by `filename`, keeping the highest `updated_at` as the
/// winner per group. Returns the deduplicated winners plus the set of
/// `(peer, winning_manifest)` pairs that should be read-repaired because
/// they were observed holding a stale copy.
pub fn reconcile_lww(hits: Vec<SearchHit>) -> (Vec<SearchHit>, Vec<(PeerId, Manifest)>) {
    let mut groups: HashMap<String, Vec<SearchHit>> = HashMap::new();
    for hit in hits {
        groups.entry(hit.filename.clone()).or_default().push(hit);
    }

    let mut winners = Vec::new();
    let mut stale = Vec::new();

    for (_, mut group) in groups {
        group.sort_by_key(|h| h.updated_at);
        let winner = group.pop().expect("group is non-empty");
        for loser in group {
            if loser.updated_at < winner.updated_at {
                stale.push((loser.host.clone(), winner.manifest.clone()));
            }
        }
        winners.push(winner);
    }

    (winners, stale)
}

/// Stamps `manifest.updated_at` to the current wall-clock second, never
/// moving it backwards, so I3 (monotonic per filename) holds as long as the
/// system clock does.
pub fn touch(manifest: &mut Manifest) {
    let now = now_secs();
    manifest.updated_at = manifest.updated_at.max(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn hit(filename: &str, host: &str, updated_at: i64) -> SearchHit {
        SearchHit {
            filename: filename.to_string(),
            metadata: Map::new(),
            host: host.to_string(),
            updated_at,
            manifest: Manifest {
                filename: filename.to_string(),
                total_size: 0,
                chunk_size: 0,
                chunks: vec![],
                metadata: Map::new(),
                updated_at,
                placement_key: None,
            },
        }
    }

    #[test]
    fn storage_hash_is_sha1_of_filename() {
        let h = storage_hash("movie.avi");
        assert_eq!(h.len(), 40);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn reconcile_picks_highest_updated_at_and_flags_stale() {
        let hits = vec![hit("f.txt", "p1:1", 10), hit("f.txt", "p2:2", 20)];
        let (winners, stale) = reconcile_lww(hits);
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].host, "p2:2");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "p1:1");
        assert_eq!(stale[0].1.updated_at, 20);
    }

    #[test]
    fn reconcile_is_noop_for_disjoint_filenames() {
        let hits = vec![hit("a.txt", "p1:1", 10), hit("b.txt", "p2:2", 5)];
        let (winners, stale) = reconcile_lww(hits);
        assert_eq!(winners.len(), 2);
        assert!(stale.is_empty());
    }

    #[test]
    fn anti_entropy_jitter_is_within_bounds() {
        for _ in 0..50 {
            let d = anti_entropy_jitter();
            assert!(d.as_secs() >= 20 && d.as_secs() < 40);
        }
    }

    #[tokio::test]
    async fn replicate_manifest_stores_locally_when_self_is_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.ensure_dir().await.unwrap();

        let engine = ReplicationEngine::new("self:1".into(), 1, PeerClient::new());
        let ring = ConsistentHashRing::with_nodes(50, ["self:1".to_string()]);
        let manifest = Manifest {
            filename: "f.bin".into(),
            total_size: 0,
            chunk_size: 0,
            chunks: vec![],
            metadata: Map::new(),
            updated_at: 1,
            placement_key: None,
        };

        let targets = engine.replicate_manifest(&ring, &store, &manifest, "f.bin").await;
        assert_eq!(targets, vec!["self:1".to_string()]);
        assert!(store.load_manifest("f.bin").await.unwrap().is_some());
    }
}
