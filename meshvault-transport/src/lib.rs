//! Wire DTOs and the outbound HTTP client used for every peer-to-peer call
//! in §6. Shared between the request surface (which deserializes these same
//! shapes from inbound requests) and every component that needs to reach
//! another peer (membership, replication, strategies).
//!
//! Every call has its own short timeout: gossip/control calls are 2-5s,
//! chunk transfers up to 30s, matching §5's cancellation policy. A failed
//! call never panics or propagates as a hard error to the fanout callers —
//! it comes back as `Ok(None)`/`false` so the caller can fold it into a
//! `partial=true` result instead of aborting the whole operation.

use meshvault_core::{ExistenceQuery, IndexShardEntry, Manifest, MissingSet, PeerId, SearchQuery, SearchResult, StatsResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const SHORT_TIMEOUT: Duration = Duration::from_secs(2);
const MEDIUM_TIMEOUT: Duration = Duration::from_secs(5);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: String,
    pub known_peers: Vec<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePeersRequest {
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreChunkResponse {
    pub status: String,
    pub chunk_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreManifestResponse {
    pub status: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateManifestRequest {
    pub filename: String,
    pub chunk_hash: String,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateManifestResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexAddRequest {
    pub key: String,
    pub entry: IndexShardEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexGetResponse {
    pub results: Vec<IndexShardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
}

/// Outbound HTTP client for reaching a remote peer. Stateless; one instance
/// is shared (cheaply cloned) across every component that makes outbound
/// calls.
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: reqwest::Client,
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(peer: &str, path: &str) -> String {
        format!("http://{peer}{path}")
    }

    pub async fn ping(&self, peer: &str) -> bool {
        match self
            .client
            .get(Self::url(peer, "/ping"))
            .timeout(SHORT_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(peer, error = %e, "ping failed");
                false
            }
        }
    }

    pub async fn join(&self, peer: &str, self_id: &str) -> Option<JoinResponse> {
        let body = JoinRequest {
            peer_id: self_id.to_string(),
        };
        self.post_json(peer, "/join", &body, SHORT_TIMEOUT).await
    }

    pub async fn announce(&self, peer: &str, self_id: &str) {
        let body = AnnounceRequest {
            peer_id: self_id.to_string(),
        };
        let _: Option<Ack> = self.post_json(peer, "/announce", &body, SHORT_TIMEOUT).await;
    }

    pub async fn announce_leave(&self, peer: &str, self_id: &str) {
        let body = AnnounceRequest {
            peer_id: self_id.to_string(),
        };
        let _: Option<Ack> = self
            .post_json(peer, "/announce_leave", &body, SHORT_TIMEOUT)
            .await;
    }

    pub async fn update_peers(&self, peer: &str, peers: Vec<PeerId>) {
        let body = UpdatePeersRequest { peers };
        let _: Option<Ack> = self
            .post_json(peer, "/update_peers", &body, SHORT_TIMEOUT)
            .await;
    }

    pub async fn known_peers(&self, peer: &str) -> Option<Vec<PeerId>> {
        self.get_json(peer, "/known_peers", SHORT_TIMEOUT).await
    }

    pub async fn store_chunk(&self, peer: &str, bytes: Vec<u8>) -> Option<StoreChunkResponse> {
        match self
            .client
            .post(Self::url(peer, "/store_chunk"))
            .timeout(CHUNK_TIMEOUT)
            .body(bytes)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                warn!(peer, status = %resp.status(), "store_chunk rejected");
                None
            }
            Err(e) => {
                warn!(peer, error = %e, "store_chunk failed");
                None
            }
        }
    }

    pub async fn get_chunk(&self, peer: &str, hash: &str) -> Option<Vec<u8>> {
        match self
            .client
            .get(Self::url(peer, &format!("/get_chunk/{hash}")))
            .timeout(CHUNK_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.ok().map(|b| b.to_vec()),
            Ok(_) => None,
            Err(e) => {
                warn!(peer, hash, error = %e, "get_chunk failed");
                None
            }
        }
    }

    pub async fn store_manifest(&self, peer: &str, manifest: &Manifest) -> Option<StoreManifestResponse> {
        self.post_json(peer, "/store_manifest", manifest, MEDIUM_TIMEOUT)
            .await
    }

    pub async fn get_manifest(&self, peer: &str, filename: &str) -> Option<Manifest> {
        self.get_json(peer, &format!("/get_manifest/{filename}"), MEDIUM_TIMEOUT)
            .await
    }

    pub async fn update_manifest(
        &self,
        peer: &str,
        filename: &str,
        chunk_hash: &str,
        self_id: &str,
    ) -> Option<UpdateManifestResponse> {
        let body = UpdateManifestRequest {
            filename: filename.to_string(),
            chunk_hash: chunk_hash.to_string(),
            peer_id: self_id.to_string(),
        };
        self.post_json(peer, "/update_manifest", &body, MEDIUM_TIMEOUT)
            .await
    }

    pub async fn search_local(&self, peer: &str, query: &SearchQuery) -> Option<SearchResult> {
        match self
            .client
            .get(Self::url(peer, "/search_local"))
            .timeout(MEDIUM_TIMEOUT)
            .query(query)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(_) => None,
            Err(e) => {
                warn!(peer, error = %e, "search_local failed");
                None
            }
        }
    }

    pub async fn index_add(&self, peer: &str, key: &str, entry: IndexShardEntry) {
        let body = IndexAddRequest {
            key: key.to_string(),
            entry,
        };
        let _: Option<Ack> = self.post_json(peer, "/index/add", &body, MEDIUM_TIMEOUT).await;
    }

    pub async fn index_get(&self, peer: &str, key: &str) -> Option<Vec<IndexShardEntry>> {
        let resp: Option<IndexGetResponse> = self
            .get_json(peer, &format!("/index/get?key={key}"), MEDIUM_TIMEOUT)
            .await;
        resp.map(|r| r.results)
    }

    pub async fn check_existence(&self, peer: &str, query: &ExistenceQuery) -> Option<MissingSet> {
        self.post_json(peer, "/check_existence", query, MEDIUM_TIMEOUT)
            .await
    }

    pub async fn stats(&self, peer: &str) -> Option<StatsResponse> {
        self.get_json(peer, "/stats", MEDIUM_TIMEOUT).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        peer: &str,
        path: &str,
        timeout: Duration,
    ) -> Option<T> {
        match self.client.get(Self::url(peer, path)).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                warn!(peer, path, status = %resp.status(), "non-success response");
                None
            }
            Err(e) => {
                warn!(peer, path, error = %e, "request failed");
                None
            }
        }
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        peer: &str,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Option<T> {
        match self
            .client
            .post(Self::url(peer, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                warn!(peer, path, status = %resp.status(), "non-success response");
                None
            }
            Err(e) => {
                warn!(peer, path, error = %e, "request failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_against_unreachable_peer_returns_false() {
        let client = PeerClient::new();
        // Port 1 is reserved/unassigned, so the connection fails fast rather
        // than timing out — this keeps the test itself fast.
        assert!(!client.ping("127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn get_chunk_against_unreachable_peer_returns_none() {
        let client = PeerClient::new();
        assert!(client.get_chunk("127.0.0.1:1", "deadbeef").await.is_none());
    }
}
