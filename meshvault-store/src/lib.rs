//! Peer-local object store (C2): content-addressed chunks, per-file
//! manifests, and GSI index shards, all as plain files under `data_dir`.
//!
//! Three on-disk artifact families, distinguished purely by filename shape:
//! - chunks: 40-hex-char SHA-1 of their own bytes,
//! - manifests: `<sha1(filename)>.manifest.json`,
//! - index shards: `idx_<md5(sharded_key)>.json`.
//!
//! Manifests and index shards are replaced via write-temp-then-rename so a
//! reader never observes a half-written file; chunks are immutable and
//! named by their own hash, so a torn write just fails its own hash check
//! on the next read instead of corrupting anything already valid.

use md5::{Digest as _, Md5};
use meshvault_core::{IndexShardEntry, Manifest, MeshvaultError, StorageStats};
use sha1::Sha1;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// A plain directory on disk, scoped to one peer.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    data_dir: PathBuf,
}

impl ObjectStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub async fn ensure_dir(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    fn chunk_path(&self, hash: &str) -> PathBuf {
        self.data_dir.join(hash)
    }

    fn manifest_path_for_filename(&self, filename: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.manifest.json", sha1_hex(filename.as_bytes())))
    }

    fn index_shard_path(&self, sharded_key: &str) -> PathBuf {
        self.data_dir.join(format!("idx_{}.json", md5_hex(sharded_key)))
    }

    /// Writes `path` to `target` via a same-directory temp file plus rename,
    /// so the target never appears partially written.
    async fn atomic_write(&self, target: &Path, contents: &[u8]) -> anyhow::Result<()> {
        let tmp_name = format!(
            ".{}.tmp-{}",
            target.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
            std::process::id()
        );
        let tmp_path = target.with_file_name(tmp_name);
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, target).await?;
        Ok(())
    }

    /// Reads `path` in `chunk_size`-byte blocks, returning `(index, sha1_hex, bytes)`
    /// for each block in order.
    pub async fn split(
        &self,
        path: &Path,
        chunk_size: u64,
    ) -> anyhow::Result<Vec<(u64, String, Vec<u8>)>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut chunks = Vec::new();
        let mut index = 0u64;
        loop {
            let mut buf = vec![0u8; chunk_size as usize];
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);
            let hash = sha1_hex(&buf);
            chunks.push((index, hash, buf));
            index += 1;
            if filled < chunk_size as usize {
                break;
            }
        }
        Ok(chunks)
    }

    /// Deterministically synthesizes `size_mb` dummy chunks for load testing
    /// without touching the filesystem for source content (`simulate_content`).
    pub fn generate_dummy_chunks(size_mb: u64, chunk_size: u64) -> Vec<(u64, String, Vec<u8>)> {
        let num_chunks = size_mb.max(1);
        (0..num_chunks)
            .map(|i| {
                let mut bytes = format!("chunk_{i}").into_bytes();
                bytes.resize(chunk_size as usize, b'x');
                let hash = sha1_hex(&bytes);
                (i, hash, bytes)
            })
            .collect()
    }

    pub async fn save_chunk(&self, hash: &str, bytes: &[u8]) -> anyhow::Result<()> {
        tokio::fs::write(self.chunk_path(hash), bytes).await?;
        Ok(())
    }

    /// Loads a chunk without re-verifying its hash (cheap path: callers that
    /// already trust the filename, e.g. serving a GET, use this).
    pub async fn load_chunk(&self, hash: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.chunk_path(hash)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads a chunk and verifies its SHA-1 matches `hash`, as required
    /// during `rebuild`.
    pub async fn load_chunk_verified(&self, hash: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(bytes) = self.load_chunk(hash).await? else {
            return Ok(None);
        };
        if sha1_hex(&bytes) != hash {
            warn!(hash, "chunk failed integrity check on read");
            return Err(MeshvaultError::CorruptData(hash.to_string()).into());
        }
        Ok(Some(bytes))
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> anyhow::Result<()> {
        let path = self.manifest_path_for_filename(&manifest.filename);
        let json = serde_json::to_vec_pretty(manifest)?;
        self.atomic_write(&path, &json).await?;
        Ok(())
    }

    pub async fn load_manifest(&self, filename: &str) -> anyhow::Result<Option<Manifest>> {
        let path = self.manifest_path_for_filename(filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_local_manifest(&self, filename: &str) -> anyhow::Result<()> {
        let path = self.manifest_path_for_filename(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Inserts `peer` into the peer list of the chunk descriptor matching
    /// `chunk_hash`, if it is not already present. Returns whether a change
    /// was made.
    pub async fn update_manifest_with_peer(
        &self,
        filename: &str,
        chunk_hash: &str,
        peer: &str,
    ) -> anyhow::Result<bool> {
        let Some(mut manifest) = self.load_manifest(filename).await? else {
            return Ok(false);
        };
        let mut changed = false;
        for chunk in manifest.chunks.iter_mut() {
            if chunk.hash == chunk_hash && !chunk.peers.iter().any(|p| p == peer) {
                chunk.peers.push(peer.to_string());
                changed = true;
            }
        }
        if changed {
            self.save_manifest(&manifest).await?;
        }
        Ok(changed)
    }

    /// Idempotent upsert: dedupes by `filename` inside the shard (I4).
    pub async fn save_index_entry(
        &self,
        sharded_key: &str,
        entry: IndexShardEntry,
    ) -> anyhow::Result<()> {
        let path = self.index_shard_path(sharded_key);
        let mut entries = self.get_index_entries(sharded_key).await?;
        if entries.iter().any(|e| e.filename == entry.filename) {
            debug!(sharded_key, filename = %entry.filename, "index entry already present");
            return Ok(());
        }
        entries.push(entry);
        let json = serde_json::to_vec_pretty(&entries)?;
        self.atomic_write(&path, &json).await?;
        Ok(())
    }

    pub async fn get_index_entries(&self, sharded_key: &str) -> anyhow::Result<Vec<IndexShardEntry>> {
        let path = self.index_shard_path(sharded_key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes chunks in `index` order into `out_path` after verifying each
    /// chunk's SHA-1. Fails if any chunk is missing or corrupt.
    pub async fn rebuild(&self, manifest: &Manifest, out_path: &Path) -> anyhow::Result<PathBuf> {
        let mut ordered = manifest.chunks.clone();
        ordered.sort_by_key(|c| c.index);

        let mut out = tokio::fs::File::create(out_path).await?;
        for chunk in &ordered {
            let bytes = self
                .load_chunk_verified(&chunk.hash)
                .await?
                .ok_or_else(|| MeshvaultError::NotFound(chunk.hash.clone()))?;
            tokio::io::AsyncWriteExt::write_all(&mut out, &bytes).await?;
        }
        Ok(out_path.to_path_buf())
    }

    pub async fn list_local_manifests(&self) -> anyhow::Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".manifest.json") {
                if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                    if let Ok(m) = serde_json::from_slice::<Manifest>(&bytes) {
                        manifests.push(m);
                    }
                }
            }
        }
        Ok(manifests)
    }

    pub async fn stats(&self) -> anyhow::Result<StorageStats> {
        let mut stats = StorageStats::default();
        let mut dir = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(meta) = entry.metadata().await else { continue };
            if name.ends_with(".manifest.json") {
                stats.manifests_count += 1;
            } else if let Some(stripped) = name.strip_prefix("idx_") {
                if stripped.ends_with(".json") {
                    stats.indexes_count += 1;
                }
            } else if name.len() == 40 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
                stats.chunks_count += 1;
                stats.chunks_bytes += meta.len();
            }
        }
        stats.total_files = stats.chunks_count + stats.manifests_count + stats.indexes_count;
        Ok(stats)
    }

    /// Given storage hashes, reports which manifests and chunks this peer
    /// does not hold.
    pub async fn check_existence(
        &self,
        manifest_hashes: &[String],
        chunk_hashes: &[String],
    ) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        let mut missing_manifests = Vec::new();
        for hash in manifest_hashes {
            let path = self.data_dir.join(format!("{hash}.manifest.json"));
            if tokio::fs::metadata(&path).await.is_err() {
                missing_manifests.push(hash.clone());
            }
        }
        let mut missing_chunks = Vec::new();
        for hash in chunk_hashes {
            if tokio::fs::metadata(self.chunk_path(hash)).await.is_err() {
                missing_chunks.push(hash.clone());
            }
        }
        Ok((missing_manifests, missing_chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_core::ChunkDescriptor;
    use std::collections::HashMap;

    fn store() -> (ObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ObjectStore::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn chunk_round_trip() {
        let (store, _dir) = store();
        let bytes = b"hello world".to_vec();
        let hash = sha1_hex(&bytes);
        store.save_chunk(&hash, &bytes).await.unwrap();
        let loaded = store.load_chunk(&hash).await.unwrap().unwrap();
        assert_eq!(loaded, bytes);
    }

    #[tokio::test]
    async fn load_chunk_verified_rejects_corruption() {
        let (store, _dir) = store();
        let bytes = b"original".to_vec();
        let hash = sha1_hex(&bytes);
        store.save_chunk(&hash, b"tampered").await.unwrap();
        let result = store.load_chunk_verified(&hash).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn manifest_round_trip() {
        let (store, _dir) = store();
        let manifest = Manifest {
            filename: "movie.avi".into(),
            total_size: 100,
            chunk_size: 50,
            chunks: vec![],
            metadata: HashMap::new(),
            updated_at: 1,
            placement_key: None,
        };
        store.save_manifest(&manifest).await.unwrap();
        let loaded = store.load_manifest("movie.avi").await.unwrap().unwrap();
        assert_eq!(loaded.filename, "movie.avi");
        assert!(store.load_manifest("nope.avi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_manifest_with_peer_is_idempotent() {
        let (store, _dir) = store();
        let manifest = Manifest {
            filename: "f.bin".into(),
            total_size: 1,
            chunk_size: 1,
            chunks: vec![ChunkDescriptor {
                index: 0,
                hash: "deadbeef".into(),
                peers: vec!["p1:1".into()],
            }],
            metadata: HashMap::new(),
            updated_at: 1,
            placement_key: None,
        };
        store.save_manifest(&manifest).await.unwrap();

        let changed = store
            .update_manifest_with_peer("f.bin", "deadbeef", "p2:2")
            .await
            .unwrap();
        assert!(changed);

        let again = store
            .update_manifest_with_peer("f.bin", "deadbeef", "p2:2")
            .await
            .unwrap();
        assert!(!again);

        let loaded = store.load_manifest("f.bin").await.unwrap().unwrap();
        assert_eq!(loaded.chunks[0].peers, vec!["p1:1", "p2:2"]);
    }

    #[tokio::test]
    async fn save_index_entry_dedupes_by_filename() {
        let (store, _dir) = store();
        let entry = IndexShardEntry {
            filename: "a.txt".into(),
            metadata: HashMap::new(),
            host: "p1:1".into(),
        };
        store.save_index_entry("actor:brad pitt:0", entry.clone()).await.unwrap();
        store.save_index_entry("actor:brad pitt:0", entry).await.unwrap();
        let entries = store.get_index_entries("actor:brad pitt:0").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn split_and_rebuild_round_trip() {
        let (store, dir) = store();
        let src = dir.path().join("src.bin");
        let content: Vec<u8> = (0..250u32).flat_map(|i| i.to_le_bytes()).collect();
        tokio::fs::write(&src, &content).await.unwrap();

        let chunks = store.split(&src, 400).await.unwrap();
        assert!(chunks.len() >= 2);
        for (_, hash, bytes) in &chunks {
            store.save_chunk(hash, bytes).await.unwrap();
        }

        let manifest = Manifest {
            filename: "src.bin".into(),
            total_size: content.len() as u64,
            chunk_size: 400,
            chunks: chunks
                .iter()
                .map(|(i, h, _)| ChunkDescriptor {
                    index: *i,
                    hash: h.clone(),
                    peers: vec!["self:0".into()],
                })
                .collect(),
            metadata: HashMap::new(),
            updated_at: 1,
            placement_key: None,
        };

        let out_path = dir.path().join("rebuilt.bin");
        store.rebuild(&manifest, &out_path).await.unwrap();
        let rebuilt = tokio::fs::read(&out_path).await.unwrap();
        assert_eq!(rebuilt, content);
    }

    #[tokio::test]
    async fn stats_counts_artifact_families() {
        let (store, _dir) = store();
        let bytes = b"payload".to_vec();
        let hash = sha1_hex(&bytes);
        store.save_chunk(&hash, &bytes).await.unwrap();

        let manifest = Manifest {
            filename: "x.dat".into(),
            total_size: 7,
            chunk_size: 7,
            chunks: vec![],
            metadata: HashMap::new(),
            updated_at: 1,
            placement_key: None,
        };
        store.save_manifest(&manifest).await.unwrap();

        store
            .save_index_entry(
                "genre:action:0",
                IndexShardEntry {
                    filename: "x.dat".into(),
                    metadata: HashMap::new(),
                    host: "p1:1".into(),
                },
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunks_count, 1);
        assert_eq!(stats.manifests_count, 1);
        assert_eq!(stats.indexes_count, 1);
        assert_eq!(stats.total_files, 3);
    }

    #[tokio::test]
    async fn check_existence_reports_missing() {
        let (store, _dir) = store();
        let bytes = b"present".to_vec();
        let hash = sha1_hex(&bytes);
        store.save_chunk(&hash, &bytes).await.unwrap();

        let (missing_manifests, missing_chunks) = store
            .check_existence(&["abc123".to_string()], &[hash.clone(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(missing_manifests, vec!["abc123".to_string()]);
        assert_eq!(missing_chunks, vec!["ghost".to_string()]);
    }
}
