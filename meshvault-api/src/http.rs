//! Request surface (C6): one axum route per logical operation in §6, a
//! stateless dispatcher over the components built in `main`. Binary chunk
//! bodies are raw `application/octet-stream`, never multipart or base64.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use meshvault_core::{
    ChunkDescriptor, ExistenceQuery, Manifest, MeshvaultError, Mode, PeerId, SearchQuery, StatsResponse,
};
use meshvault_membership::Membership;
use meshvault_replication::ReplicationEngine;
use meshvault_store::ObjectStore;
use meshvault_strategy::{PlacementStrategy, Strategy, StrategyContext};
use meshvault_transport::{
    Ack, AnnounceRequest, IndexAddRequest, IndexGetResponse, JoinRequest, JoinResponse, PeerClient,
    StoreChunkResponse, StoreManifestResponse, UpdateManifestRequest, UpdateManifestResponse, UpdatePeersRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Everything a handler needs, shared across every inbound request.
#[derive(Clone)]
pub struct AppState {
    pub self_id: PeerId,
    pub mode: Mode,
    pub chunk_size: u64,
    pub store: Arc<ObjectStore>,
    pub membership: Arc<Membership>,
    pub replication: Arc<ReplicationEngine>,
    pub strategy: Arc<Strategy>,
    pub client: PeerClient,
}

impl AppState {
    fn strategy_ctx(&self) -> StrategyContext {
        StrategyContext {
            self_id: self.self_id.clone(),
            membership: Arc::clone(&self.membership),
            store: Arc::clone(&self.store),
            replication: Arc::clone(&self.replication),
            client: self.client.clone(),
        }
    }
}

/// Wraps [`MeshvaultError`] so this crate can implement `IntoResponse` for it
/// without running into the orphan rule (neither the error type nor the
/// trait live here).
pub struct ApiError(pub MeshvaultError);

impl From<MeshvaultError> for ApiError {
    fn from(e: MeshvaultError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(MeshvaultError::Other(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshvaultError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshvaultError::CorruptData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MeshvaultError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            MeshvaultError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MeshvaultError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MeshvaultError::TransferFailed(_) => StatusCode::BAD_GATEWAY,
            MeshvaultError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.0.to_body())).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Client-facing
        .route("/upload", post(upload))
        .route("/fetch/{filename}", get(fetch))
        .route("/search", post(search))
        .route("/leave", post(leave))
        // Peer-to-peer
        .route("/ping", get(ping))
        .route("/store_chunk", post(store_chunk))
        .route("/store_manifest", post(store_manifest))
        .route("/get_chunk/{hash}", get(get_chunk))
        .route("/get_manifest/{filename}", get(get_manifest))
        .route("/update_manifest", post(update_manifest))
        .route("/search_local", get(search_local))
        .route("/join", post(join))
        .route("/announce", post(announce))
        .route("/announce_leave", post(announce_leave))
        .route("/update_peers", post(update_peers))
        .route("/known_peers", get(known_peers))
        .route("/index/add", post(index_add))
        .route("/index/get", get(index_get))
        .route("/check_existence", post(check_existence))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---- Client-facing ----

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub simulate_content: bool,
    #[serde(default)]
    pub size_mb: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub manifest: Manifest,
    pub replicas: Vec<PeerId>,
}

async fn upload(State(state): State<AppState>, Json(req): Json<UploadRequest>) -> Result<Json<UploadResponse>, ApiError> {
    let basename = std::path::Path::new(&req.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&req.filename)
        .to_string();

    let (chunks, total_size) = if req.simulate_content {
        let chunks = ObjectStore::generate_dummy_chunks(req.size_mb.unwrap_or(1), state.chunk_size);
        let total_size = chunks.iter().map(|(_, _, bytes)| bytes.len() as u64).sum();
        (chunks, total_size)
    } else {
        let path = std::path::Path::new(&req.filename);
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| MeshvaultError::BadRequest(format!("file not found: {}", req.filename)))?;
        let chunks = state.store.split(path, state.chunk_size).await?;
        (chunks, meta.len())
    };

    let ctx = state.strategy_ctx();
    let manifest = state
        .strategy
        .upload(&ctx, basename, chunks, total_size, state.chunk_size, req.metadata)
        .await?;

    let ring = state.membership.ring_snapshot().await;
    let key = meshvault_strategy::placement_key_of(&manifest);
    let replicas = state.replication.targets(&ring, &key);

    Ok(Json(UploadResponse {
        status: "stored",
        manifest,
        replicas,
    }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchResponse {
    Fetched { path: String },
    Partial { missing: Vec<String> },
    Failed { reason: String },
}

async fn fetch(State(state): State<AppState>, Path(filename): Path<String>) -> Json<FetchResponse> {
    let manifest = match resolve_manifest(&state, &filename).await {
        Some(m) => m,
        None => {
            return Json(FetchResponse::Failed {
                reason: "manifest not found".to_string(),
            })
        }
    };

    let mut missing = Vec::new();
    for chunk in &manifest.chunks {
        if state.store.load_chunk(&chunk.hash).await.unwrap_or(None).is_some() {
            continue;
        }
        if !fetch_chunk_from_peers(&state, &manifest.filename, chunk).await {
            missing.push(chunk.hash.clone());
        }
    }

    if !missing.is_empty() {
        return Json(FetchResponse::Partial { missing });
    }

    let out_path = std::path::PathBuf::from(&manifest.filename);
    match state.store.rebuild(&manifest, &out_path).await {
        Ok(path) => Json(FetchResponse::Fetched {
            path: path.display().to_string(),
        }),
        Err(e) => Json(FetchResponse::Failed { reason: e.to_string() }),
    }
}

/// Resolves `filename`'s manifest, locally or from its primary under the
/// ring, mirroring `_fetch_manifest` in the source.
async fn resolve_manifest(state: &AppState, filename: &str) -> Option<Manifest> {
    if let Ok(Some(m)) = state.store.load_manifest(filename).await {
        return Some(m);
    }
    let ring = state.membership.ring_snapshot().await;
    let node = ring.get(&meshvault_replication::routing_hash(filename))?;
    if node == state.self_id {
        return None;
    }
    state.client.get_manifest(&node, filename).await
}

/// Tries each peer listed for `chunk` in order; saves locally on first
/// success and best-effort notifies the manifest's primary so this replica
/// becomes discoverable, per the resolved Open Question in §9.
async fn fetch_chunk_from_peers(state: &AppState, filename: &str, chunk: &ChunkDescriptor) -> bool {
    for peer in &chunk.peers {
        let bytes = if peer == &state.self_id {
            state.store.load_chunk(&chunk.hash).await.ok().flatten()
        } else {
            state.client.get_chunk(peer, &chunk.hash).await
        };
        let Some(bytes) = bytes else { continue };
        if content_hash(&bytes) != chunk.hash {
            warn!(peer = %peer, hash = %chunk.hash, "fetched chunk failed integrity check, trying next peer");
            continue;
        }
        if state.store.save_chunk(&chunk.hash, &bytes).await.is_err() {
            continue;
        }
        if peer != &state.self_id {
            let ring = state.membership.ring_snapshot().await;
            if let Some(primary) = ring.get(&meshvault_replication::routing_hash(filename)) {
                if primary != state.self_id {
                    state
                        .client
                        .update_manifest(&primary, filename, &chunk.hash, &state.self_id)
                        .await;
                }
            }
        }
        return true;
    }
    false
}

async fn search(State(state): State<AppState>, Json(query): Json<SearchQuery>) -> Json<meshvault_core::SearchResult> {
    let ctx = state.strategy_ctx();
    Json(state.strategy.search(&ctx, &query).await)
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    pub peer_id: PeerId,
}

#[derive(Debug, Serialize)]
pub struct LeaveResponse {
    pub status: &'static str,
    pub manifests_moved: u64,
}

async fn leave(State(state): State<AppState>, Json(req): Json<LeaveRequest>) -> Result<Json<LeaveResponse>, ApiError> {
    if req.peer_id != state.self_id {
        return Err(MeshvaultError::Unauthorized("leave may only be requested for self".to_string()).into());
    }
    let outcome = state
        .membership
        .graceful_leave(&state.store, meshvault_strategy::placement_key_of)
        .await;
    Ok(Json(LeaveResponse {
        status: "completed",
        manifests_moved: outcome.manifests_moved,
    }))
}

// ---- Peer-to-peer ----

async fn ping() -> &'static str {
    "pong"
}

async fn store_chunk(State(state): State<AppState>, body: Bytes) -> Result<Json<StoreChunkResponse>, ApiError> {
    let bytes = body.to_vec();
    let hash = content_hash(&bytes);
    state.store.save_chunk(&hash, &bytes).await?;
    Ok(Json(StoreChunkResponse {
        status: "chunk_saved".to_string(),
        chunk_hash: hash,
    }))
}

fn content_hash(bytes: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn store_manifest(
    State(state): State<AppState>,
    Json(manifest): Json<Manifest>,
) -> Result<Json<StoreManifestResponse>, ApiError> {
    state.store.save_manifest(&manifest).await?;
    Ok(Json(StoreManifestResponse {
        status: "manifest_saved".to_string(),
        filename: manifest.filename,
    }))
}

async fn get_chunk(State(state): State<AppState>, Path(hash): Path<String>) -> Result<Bytes, ApiError> {
    match state.store.load_chunk_verified(&hash).await? {
        Some(bytes) => Ok(Bytes::from(bytes)),
        None => Err(MeshvaultError::NotFound(hash).into()),
    }
}

async fn get_manifest(State(state): State<AppState>, Path(filename): Path<String>) -> Result<Json<Manifest>, ApiError> {
    match state.store.load_manifest(&filename).await? {
        Some(m) => Ok(Json(m)),
        None => Err(MeshvaultError::NotFound(filename).into()),
    }
}

async fn update_manifest(
    State(state): State<AppState>,
    Json(req): Json<UpdateManifestRequest>,
) -> Result<Json<UpdateManifestResponse>, ApiError> {
    let changed = state
        .store
        .update_manifest_with_peer(&req.filename, &req.chunk_hash, &req.peer_id)
        .await?;
    Ok(Json(UpdateManifestResponse {
        status: if changed { "updated" } else { "no_change" }.to_string(),
    }))
}

async fn search_local(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<meshvault_core::SearchResult> {
    let manifests = state.store.list_local_manifests().await.unwrap_or_default();
    let results = meshvault_strategy::local_match(&manifests, &query, &state.self_id);
    Json(meshvault_core::SearchResult { results, partial: false })
}

async fn join(State(state): State<AppState>, Json(req): Json<JoinRequest>) -> Json<JoinResponse> {
    let known_peers = state.membership.handle_join(req.peer_id).await;
    Json(JoinResponse {
        status: "joined".to_string(),
        known_peers,
    })
}

async fn announce(State(state): State<AppState>, Json(req): Json<AnnounceRequest>) -> Json<Ack> {
    state.membership.merge_peers(&[req.peer_id]).await;
    Json(Ack { status: "ok".to_string() })
}

async fn announce_leave(State(state): State<AppState>, Json(req): Json<AnnounceRequest>) -> Json<Ack> {
    state.membership.handle_announce_leave(&req.peer_id).await;
    Json(Ack { status: "ok".to_string() })
}

async fn update_peers(State(state): State<AppState>, Json(req): Json<UpdatePeersRequest>) -> Json<Ack> {
    state.membership.merge_peers(&req.peers).await;
    Json(Ack { status: "ok".to_string() })
}

async fn known_peers(State(state): State<AppState>) -> Json<Vec<PeerId>> {
    Json(state.membership.known_peers().await)
}

async fn index_add(State(state): State<AppState>, Json(req): Json<IndexAddRequest>) -> Result<Json<Ack>, ApiError> {
    state.store.save_index_entry(&req.key, req.entry).await?;
    Ok(Json(Ack { status: "ok".to_string() }))
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

async fn index_get(
    State(state): State<AppState>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<IndexGetResponse>, ApiError> {
    let results = state.store.get_index_entries(&q.key).await?;
    Ok(Json(IndexGetResponse { results }))
}

async fn check_existence(
    State(state): State<AppState>,
    Json(query): Json<ExistenceQuery>,
) -> Result<Json<meshvault_core::MissingSet>, ApiError> {
    let (missing_manifests, missing_chunks) = state.store.check_existence(&query.manifests, &query.chunks).await?;
    Ok(Json(meshvault_core::MissingSet {
        missing_manifests,
        missing_chunks,
    }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let storage = state.store.stats().await?;
    Ok(Json(StatsResponse {
        peer_id: state.self_id.clone(),
        mode: state.mode,
        storage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_core::Mode;
    use meshvault_strategy::Strategy;

    /// Boots a single-node peer on an ephemeral port and hands back the
    /// base URL, mirroring the real-network style the teacher's own
    /// integration tests spin up rather than driving the router in-process.
    async fn spawn_peer(mode: Mode) -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::new(dir.path()));
        store.ensure_dir().await.unwrap();

        let client = PeerClient::new();
        let self_id = "127.0.0.1:0".to_string();
        let membership = Arc::new(Membership::new(self_id.clone(), vec![], 3, client.clone()));
        let replication = Arc::new(ReplicationEngine::new(self_id.clone(), 3, client.clone()));
        let strategy = Arc::new(Strategy::for_mode(mode));

        let state = AppState {
            self_id,
            mode,
            chunk_size: 1024 * 1024,
            store,
            membership,
            replication,
            strategy,
            client,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), dir)
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let (base, _dir) = spawn_peer(Mode::Naive).await;
        let body = reqwest::get(format!("{base}/ping")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn store_chunk_then_get_chunk_round_trips() {
        let (base, _dir) = spawn_peer(Mode::Naive).await;
        let payload = b"hello meshvault".to_vec();
        let resp: StoreChunkResponse = reqwest::Client::new()
            .post(format!("{base}/store_chunk"))
            .body(payload.clone())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp.chunk_hash, content_hash(&payload));

        let fetched = reqwest::get(format!("{base}/get_chunk/{}", resp.chunk_hash))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(fetched.to_vec(), payload);
    }

    #[tokio::test]
    async fn get_chunk_missing_hash_is_404() {
        let (base, _dir) = spawn_peer(Mode::Naive).await;
        let resp = reqwest::get(format!("{base}/get_chunk/{}", "0".repeat(40))).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_simulated_content_then_fetch_rebuilds_file() {
        let (base, dir) = spawn_peer(Mode::Naive).await;
        let client = reqwest::Client::new();

        let upload: serde_json::Value = client
            .post(format!("{base}/upload"))
            .json(&serde_json::json!({
                "filename": "demo.bin",
                "simulate_content": true,
                "size_mb": 1,
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(upload["status"], "stored");

        let fetch: serde_json::Value = client
            .get(format!("{base}/fetch/demo.bin"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetch["status"], "fetched");
        let _ = tokio::fs::remove_file(fetch["path"].as_str().unwrap()).await;
        let _ = &dir;
    }

    #[tokio::test]
    async fn stats_reports_zero_on_fresh_peer() {
        let (base, _dir) = spawn_peer(Mode::Metadata).await;
        let stats: StatsResponse = reqwest::get(format!("{base}/stats")).await.unwrap().json().await.unwrap();
        assert_eq!(stats.storage.chunks_count, 0);
        assert_eq!(stats.mode, Mode::Metadata);
    }
}
