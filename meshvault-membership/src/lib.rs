//! Membership layer (C3): who's alive, the ring that tracks them, and the
//! four protocols that keep both in sync — join, gossip, failure detection,
//! and graceful leave.
//!
//! `known_peers`, `last_seen`, and the ring are mutated only inside
//! [`Membership`]'s single mutex (I5: the ring's physical-node set must
//! always equal the membership view), and never while an outbound network
//! call is in flight — callers take a snapshot, do I/O, then re-acquire the
//! lock to apply results.

use meshvault_core::{Manifest, PeerId};
use meshvault_ring::ConsistentHashRing;
use meshvault_store::ObjectStore;
use meshvault_transport::PeerClient;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// `sha1(key)` — every ring lookup for a logical placement key goes through
/// this before the ring applies its own MD5, matching the routing hash used
/// on the write path.
fn routing_hash(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

struct MembershipState {
    known_peers: HashSet<PeerId>,
    last_seen: HashMap<PeerId, Instant>,
    ring: ConsistentHashRing,
}

/// Tracks cluster membership for one peer.
pub struct Membership {
    self_id: PeerId,
    bootstrap_peers: Vec<PeerId>,
    replicas: usize,
    state: Mutex<MembershipState>,
    client: PeerClient,
}

/// Outcome of a `leave` call: how many manifests were re-homed.
#[derive(Debug, Clone, Copy)]
pub struct LeaveOutcome {
    pub manifests_moved: u64,
    pub isolated: bool,
}

impl Membership {
    pub fn new(self_id: PeerId, known_peers: Vec<PeerId>, replicas: usize, client: PeerClient) -> Self {
        let mut ring = ConsistentHashRing::new(replicas);
        ring.add(&self_id);
        let mut last_seen = HashMap::new();
        for peer in &known_peers {
            ring.add(peer);
            last_seen.insert(peer.clone(), Instant::now());
        }
        let known_peers_set: HashSet<PeerId> = known_peers.iter().cloned().collect();
        Self {
            bootstrap_peers: known_peers,
            self_id,
            replicas,
            state: Mutex::new(MembershipState {
                known_peers: known_peers_set,
                last_seen,
                ring,
            }),
            client,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.state.lock().await.known_peers.iter().cloned().collect()
    }

    /// A cheap clone of the current ring for placement decisions. The ring
    /// itself is small (positions are `u128 + String`), so copy-on-read is
    /// the simplest way to honor "network I/O never happens under the lock".
    pub async fn ring_snapshot(&self) -> ConsistentHashRing {
        self.state.lock().await.ring.clone()
    }

    /// Merges newly learned peers into `known_peers` and the ring. Returns
    /// whether anything changed.
    pub async fn merge_peers(&self, peers: &[PeerId]) -> bool {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for peer in peers {
            if peer == &self.self_id {
                continue;
            }
            if state.known_peers.insert(peer.clone()) {
                state.ring.add(peer);
                state.last_seen.insert(peer.clone(), Instant::now());
                changed = true;
            }
        }
        if changed {
            info!(self_id = %self.self_id, count = state.known_peers.len(), "peer list updated");
        }
        changed
    }

    /// Handles an inbound `announce_leave`: drops the peer immediately
    /// rather than waiting for the failure detector to notice it's gone.
    pub async fn handle_announce_leave(&self, peer: &str) {
        self.remove_peer(peer).await;
    }

    async fn remove_peer(&self, peer: &str) {
        let mut state = self.state.lock().await;
        if state.known_peers.remove(peer) {
            state.ring.remove(peer);
            state.last_seen.remove(peer);
            warn!(self_id = %self.self_id, peer, "peer declared dead");
        }
    }

    async fn mark_seen(&self, peer: &str) {
        let mut state = self.state.lock().await;
        state.last_seen.insert(peer.to_string(), Instant::now());
    }

    /// On startup, try each bootstrap peer in turn, `retries` times with a
    /// linear `wait` between full passes. Stops at the first success.
    pub async fn attempt_rejoin(&self, retries: u32, wait: Duration) {
        info!(self_id = %self.self_id, "attempting to join the network");
        for attempt in 1..=retries {
            for bootstrap in &self.bootstrap_peers {
                if bootstrap == &self.self_id {
                    continue;
                }
                if let Some(resp) = self.client.join(bootstrap, &self.self_id).await {
                    self.merge_peers(&resp.known_peers).await;
                    info!(self_id = %self.self_id, via = %bootstrap, "join succeeded");
                    return;
                }
            }
            debug!(attempt, "join attempt failed, retrying");
            tokio::time::sleep(wait).await;
        }
        warn!(self_id = %self.self_id, "could not reach any bootstrap peer; operating in isolation or as first node");
    }

    /// Handles an inbound `join`: merges the joiner in, returns the current
    /// view, and best-effort announces the newcomer to existing neighbors.
    pub async fn handle_join(&self, joining_peer: PeerId) -> Vec<PeerId> {
        self.merge_peers(&[joining_peer.clone()]).await;
        let view = self.known_peers().await;
        for peer in &view {
            if peer != &joining_peer {
                self.client.announce(peer, &joining_peer).await;
            }
        }
        view
    }

    /// One gossip round: ship the full `known_peers` list to every known
    /// peer, best-effort.
    pub async fn gossip_tick(&self) {
        let peers = self.known_peers().await;
        if peers.is_empty() {
            return;
        }
        let mut with_self = peers.clone();
        with_self.push(self.self_id.clone());
        for peer in &peers {
            self.client.update_peers(peer, with_self.clone()).await;
        }
    }

    /// One failure-detector round: ping every known peer, update
    /// `last_seen` on success, and drop peers stale past `failure_timeout`.
    pub async fn failure_detector_tick(&self, failure_timeout: Duration) {
        let peers = self.known_peers().await;
        for peer in peers {
            if self.client.ping(&peer).await {
                self.mark_seen(&peer).await;
                continue;
            }
            let stale = {
                let state = self.state.lock().await;
                state
                    .last_seen
                    .get(&peer)
                    .map(|t| t.elapsed() > failure_timeout)
                    .unwrap_or(true)
            };
            if stale {
                self.remove_peer(&peer).await;
            }
        }
    }

    /// Builds a ring excluding `self_id`, moves every locally owned
    /// manifest to its new primary under that reduced ring (using
    /// `placement_key` to determine each manifest's routing key — the
    /// Semantic strategy's override included), then announces `leave` to
    /// every remaining neighbor.
    pub async fn graceful_leave<F>(&self, store: &ObjectStore, placement_key: F) -> LeaveOutcome
    where
        F: Fn(&Manifest) -> String,
    {
        info!(self_id = %self.self_id, "starting graceful leave");
        let remaining = self.known_peers().await;
        if remaining.is_empty() {
            return LeaveOutcome {
                manifests_moved: 0,
                isolated: true,
            };
        }

        let reduced_ring = ConsistentHashRing::with_nodes(self.replicas, remaining.iter().cloned());

        let manifests = store.list_local_manifests().await.unwrap_or_default();
        let mut moved = 0u64;
        for manifest in manifests {
            let key = routing_hash(&placement_key(&manifest));
            let Some(target) = reduced_ring.get(&key) else {
                continue;
            };
            if self.client.store_manifest(&target, &manifest).await.is_some() {
                let _ = store.remove_local_manifest(&manifest.filename).await;
                moved += 1;
            } else {
                warn!(filename = %manifest.filename, target, "failed to move manifest during leave");
            }
        }

        for peer in &remaining {
            self.client.announce_leave(peer, &self.self_id).await;
        }

        LeaveOutcome {
            manifests_moved: moved,
            isolated: false,
        }
    }
}
