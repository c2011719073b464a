//! Blob store / drive (spec §4.5): a content-addressed file tree. File
//! paths map to blob identifiers; blob bodies are chunked and content-hashed
//! with blake3 (reusing the same hash already used for block-store
//! integrity) and stored in a dedicated [`BlockStore`] so chunk replication
//! reuses the block-pull protocol. A small path index (`path -> entry`)
//! lives alongside it.
//!
//! Directories are synthesised from path prefixes plus `.keep` sentinel
//! entries, matching spec §4.5's "Directories are emulated with sentinel
//! entries": there is no directory object, only entries whose path starts
//! with the requested prefix.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::block_store::BlockStore;
use crate::error::DriveError;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveEntry {
    pub path: String,
    pub blob_id: String,
    pub size: u64,
    pub created_at: u64,
    /// Index of each chunk within the drive's block store, in order.
    pub chunks: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// When true (the default caller behaviour per spec §4.5), a uniqueness
    /// suffix is appended to the base name to avoid collisions when the
    /// same file is shared multiple times.
    pub uniquify: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub recursive: bool,
    pub limit: Option<usize>,
}

pub enum ChangeEvent {
    Put(DriveEntry),
    Deleted(String),
}

/// Normalises a path: must begin with `/`, must not contain `..`
/// components (spec §4.5 "Path policy"). The root path `/` is only valid
/// as a directory to list, never as a file to read/write/delete, so file
/// operations go through [`normalise_path`] while directory operations go
/// through [`normalise_dir_path`].
fn normalise_path_impl(path: &str, allow_root: bool) -> Result<String, DriveError> {
    if path.contains("..") {
        return Err(DriveError::InvalidPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    let normalised = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    if normalised.is_empty() || (normalised == "/" && !allow_root) {
        return Err(DriveError::InvalidPath(path.to_string()));
    }
    Ok(normalised)
}

/// Normalises a path for a file operation (put/get/del/entry/exists):
/// rejects the bare root `/`, since there is no file at the root.
pub fn normalise_path(path: &str) -> Result<String, DriveError> {
    normalise_path_impl(path, false)
}

/// Normalises a path for a directory operation (list/create_directory):
/// the bare root `/` is a valid directory to address.
pub fn normalise_dir_path(path: &str) -> Result<String, DriveError> {
    normalise_path_impl(path, true)
}

fn unique_suffix(base_name: &str, timestamp: u64) -> String {
    let random_bits: u32 = rand::random();
    format!("{base_name}{timestamp}_{random_bits:08x}")
}

pub struct Drive {
    chunks: BlockStore,
    index: Arc<RwLock<BTreeMap<String, DriveEntry>>>,
    changes: broadcast::Sender<ChangeEventKind>,
}

/// `ChangeEvent` isn't `Clone` (it owns a `DriveEntry`), but
/// `broadcast::Sender` requires `Clone` for the payload; this thin wrapper
/// just derives it.
#[derive(Clone)]
pub enum ChangeEventKind {
    Put(DriveEntry),
    Deleted(String),
}

impl Drive {
    pub fn new(chunks: BlockStore) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            chunks,
            index: Arc::new(RwLock::new(BTreeMap::new())),
            changes: tx,
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.chunks.public_key()
    }

    /// Drops the change-broadcast's subscribers and closes the underlying
    /// chunk store, as the drive step of the room's ordered close (spec §5).
    pub async fn close(&self) -> Result<(), DriveError> {
        self.chunks.close().await?;
        Ok(())
    }

    /// Splits `bytes` into content-hashed chunks, appends them to the
    /// drive's block store, and records a path entry. Returns the entry
    /// under the (possibly suffixed) path actually stored: callers must
    /// read `entry.path` rather than assume their input path persisted
    /// (spec §9 open question, resolved: suffix policy kept).
    pub async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        opts: UploadOptions,
        now_ms: u64,
    ) -> Result<DriveEntry, DriveError> {
        let mut normalised = normalise_path(path)?;
        if opts.uniquify {
            if let Some((dir, base)) = normalised.rsplit_once('/') {
                let suffixed = unique_suffix(base, now_ms);
                normalised = format!("{dir}/{suffixed}");
            }
        }

        let mut chunk_indices = Vec::new();
        for chunk in bytes.chunks(CHUNK_SIZE) {
            let idx = self.chunks.append(chunk.to_vec()).await?;
            chunk_indices.push(idx);
        }
        let blob_id = blake3::hash(bytes).to_hex().to_string();

        let entry = DriveEntry {
            path: normalised.clone(),
            blob_id,
            size: bytes.len() as u64,
            created_at: now_ms,
            chunks: chunk_indices,
        };

        self.ensure_parent_keep(&normalised, now_ms).await?;
        self.index.write().await.insert(normalised, entry.clone());
        let _ = self.changes.send(ChangeEventKind::Put(entry.clone()));
        Ok(entry)
    }

    /// Writes a `.keep` sentinel for `dir` so it shows up in `list` even
    /// with no real files in it yet (spec §4.5).
    pub async fn create_directory(&self, dir: &str, now_ms: u64) -> Result<(), DriveError> {
        let normalised = normalise_dir_path(dir)?;
        self.ensure_keep(&normalised, now_ms).await
    }

    async fn ensure_parent_keep(&self, path: &str, now_ms: u64) -> Result<(), DriveError> {
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                self.ensure_keep(dir, now_ms).await?;
            }
        }
        Ok(())
    }

    async fn ensure_keep(&self, dir: &str, now_ms: u64) -> Result<(), DriveError> {
        let keep_path = if dir == "/" { "/.keep".to_string() } else { format!("{dir}/.keep") };
        let mut index = self.index.write().await;
        if index.contains_key(&keep_path) {
            return Ok(());
        }
        index.insert(
            keep_path.clone(),
            DriveEntry {
                path: keep_path,
                blob_id: String::new(),
                size: 0,
                created_at: now_ms,
                chunks: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> bool {
        let Ok(normalised) = normalise_path(path) else { return false };
        self.index.read().await.contains_key(&normalised)
    }

    pub async fn entry(&self, path: &str) -> Option<DriveEntry> {
        let normalised = normalise_path(path).ok()?;
        self.index.read().await.get(&normalised).cloned()
    }

    /// Reads a full file, or the byte range `[start, end)` when given
    /// (spec §4.5's ranged reads / `createReadStream`).
    pub async fn get(&self, path: &str, range: ReadRange) -> Result<Vec<u8>, DriveError> {
        let normalised = normalise_path(path)?;
        let entry = self
            .index
            .read()
            .await
            .get(&normalised)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(normalised.clone()))?;

        let mut full = Vec::with_capacity(entry.size as usize);
        for &chunk_idx in &entry.chunks {
            let chunk = self.chunks.get(chunk_idx).await?;
            full.extend_from_slice(&chunk);
        }

        let start = range.start.unwrap_or(0);
        let end = range.end.unwrap_or(entry.size).min(entry.size);
        if start > end || start > entry.size {
            return Err(DriveError::RangeOutOfBounds { size: entry.size });
        }
        Ok(full[start as usize..end as usize].to_vec())
    }

    pub async fn del(&self, path: &str) -> Result<(), DriveError> {
        let normalised = normalise_path(path)?;
        let removed = self.index.write().await.remove(&normalised);
        if removed.is_none() {
            return Err(DriveError::NotFound(normalised));
        }
        let _ = self.changes.send(ChangeEventKind::Deleted(normalised));
        Ok(())
    }

    /// Lists entries under `dir`. Non-recursive by default: only direct
    /// children are returned (other subdirectories show up as a single
    /// `.keep`-bearing entry, not their full contents).
    pub async fn list(&self, dir: &str, opts: ListOptions) -> Result<Vec<DriveEntry>, DriveError> {
        let normalised = normalise_dir_path(dir)?;
        let prefix = if normalised == "/" { normalised.clone() } else { format!("{normalised}/") };
        let index = self.index.read().await;
        let mut out: Vec<DriveEntry> = index
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| {
                if opts.recursive {
                    true
                } else {
                    !path[prefix.len()..].contains('/')
                }
            })
            .map(|(_, entry)| entry.clone())
            .collect();
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEventKind> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    async fn drive() -> (Drive, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let store = BlockStore::create_local(dir.path().join("chunks"), key).await.unwrap();
        (Drive::new(store), dir)
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (drive, _dir) = drive().await;
        let bytes: Vec<u8> = (0u8..=255).collect();
        let entry = drive
            .put("/docs/a.bin", &bytes, UploadOptions { uniquify: false }, 1000)
            .await
            .unwrap();
        assert_eq!(entry.path, "/docs/a.bin");
        assert_eq!(entry.size, 256);

        let downloaded = drive.get(&entry.path, ReadRange::default()).await.unwrap();
        assert_eq!(downloaded, bytes);

        let listing = drive.list("/docs", ListOptions::default()).await.unwrap();
        assert!(listing.iter().any(|e| e.path == "/docs/a.bin"));
    }

    #[tokio::test]
    async fn uniquify_suffixes_the_basename_not_the_directory() {
        let (drive, _dir) = drive().await;
        let entry = drive
            .put("/shared/report.pdf", b"data", UploadOptions { uniquify: true }, 42)
            .await
            .unwrap();
        assert!(entry.path.starts_with("/shared/report.pdf42_"));
    }

    #[tokio::test]
    async fn rejects_dot_dot_components() {
        let (drive, _dir) = drive().await;
        let err = drive
            .put("/../escape", b"data", UploadOptions::default(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn empty_directory_survives_via_keep_sentinel() {
        let (drive, _dir) = drive().await;
        drive.create_directory("/empty", 0).await.unwrap();
        let listing = drive.list("/", ListOptions { recursive: true, limit: None }).await.unwrap();
        assert!(listing.iter().any(|e| e.path == "/empty/.keep"));
    }

    #[tokio::test]
    async fn root_is_a_valid_directory_but_not_a_valid_file() {
        let (drive, _dir) = drive().await;
        drive.put("/top.bin", b"data", UploadOptions::default(), 0).await.unwrap();

        let listing = drive.list("/", ListOptions::default()).await.unwrap();
        assert!(listing.iter().any(|e| e.path == "/top.bin"));

        let err = drive.get("/", ReadRange::default()).await.unwrap_err();
        assert!(matches!(err, DriveError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn ranged_read_returns_subslice() {
        let (drive, _dir) = drive().await;
        let bytes: Vec<u8> = (0u8..=255).collect();
        let entry = drive
            .put("/f.bin", &bytes, UploadOptions::default(), 0)
            .await
            .unwrap();
        let slice = drive
            .get(&entry.path, ReadRange { start: Some(10), end: Some(20) })
            .await
            .unwrap();
        assert_eq!(slice, bytes[10..20]);
    }
}
