//! Remote target abstraction.
//!
//! The engine consumes a small capability surface from the transport
//! layer: `list`, `get`, `put`, `delete`, and `wait_for_empty`, plus an
//! overlapped multi-download built on top of `get`. Object-store and
//! network-share transports live outside the crate; [`local::LocalBackend`]
//! is the in-crate directory-backed implementation.

pub mod filename;
pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};

use crate::error::{EngineError, Result};
use crate::progress::ProgressToken;

/// What a remote volume holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VolumeKind {
    /// A file-list: one snapshot's paths and hashes.
    Files,
    /// Concatenated data blocks.
    Blocks,
    /// Redundant block/blocklist declarations for block volumes.
    Index,
}

impl VolumeKind {
    pub fn letter(&self) -> char {
        match self {
            VolumeKind::Files => 'f',
            VolumeKind::Blocks => 'b',
            VolumeKind::Index => 'i',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'f' => Some(VolumeKind::Files),
            'b' => Some(VolumeKind::Blocks),
            'i' => Some(VolumeKind::Index),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Files => "Files",
            VolumeKind::Blocks => "Blocks",
            VolumeKind::Index => "Index",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Files" => Some(VolumeKind::Files),
            "Blocks" => Some(VolumeKind::Blocks),
            "Index" => Some(VolumeKind::Index),
            _ => None,
        }
    }
}

/// Lifecycle state of a remote volume. States form a DAG:
/// `Temporary → Uploading → Uploaded → Verified → Deleting → Deleted`.
/// Only `Uploaded` and `Verified` volumes may serve reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Temporary => "Temporary",
            VolumeState::Uploading => "Uploading",
            VolumeState::Uploaded => "Uploaded",
            VolumeState::Verified => "Verified",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Temporary" => Some(VolumeState::Temporary),
            "Uploading" => Some(VolumeState::Uploading),
            "Uploaded" => Some(VolumeState::Uploaded),
            "Verified" => Some(VolumeState::Verified),
            "Deleting" => Some(VolumeState::Deleting),
            "Deleted" => Some(VolumeState::Deleted),
            _ => None,
        }
    }

    pub fn can_serve_reads(&self) -> bool {
        matches!(self, VolumeState::Uploaded | VolumeState::Verified)
    }
}

/// A file as reported by `Backend::list`.
#[derive(Clone, Debug)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: i64,
}

/// Request passed to [`get_files_overlapped`]. Hash and size are verified
/// when known; both are `None` for files of unknown provenance.
#[derive(Clone, Debug)]
pub struct RemoteFileRequest {
    pub name: String,
    pub hash: Option<String>,
    pub size: Option<i64>,
}

/// A completed overlapped download. The temp file is removed when the
/// value is dropped.
pub struct DownloadedFile {
    pub path: tempfile::TempPath,
    pub hash: String,
    pub size: i64,
    pub name: String,
}

/// Transport capability consumed by the engine. Implementations retry
/// transient failures internally with backoff; errors reaching the engine
/// are post-exhaustion.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list(&self) -> Result<Vec<RemoteFileInfo>>;

    /// Download `name` into `dest`. When `hash`/`size` are given the
    /// downloaded bytes are verified against them. Returns the observed
    /// `(hash, size)`.
    async fn get(
        &self,
        name: &str,
        hash: Option<&str>,
        size: Option<i64>,
        dest: &Path,
    ) -> Result<(String, i64)>;

    /// Upload `source` as `name`; returns the uploaded `(hash, size)`.
    async fn put(&self, name: &str, source: &Path) -> Result<(String, i64)>;

    /// Remove `name`. With `preserve` the backend moves the file aside
    /// instead of destroying it (used when an operator wants a manual
    /// recovery window).
    async fn delete(&self, name: &str, size: i64, preserve: bool) -> Result<()>;

    /// Block until all queued uploads/deletes have drained.
    async fn wait_for_empty(&self) -> Result<()>;
}

/// Base64 SHA-256 of a file plus its length, the hash form used across
/// the index database and volume manifests.
pub fn hash_file(path: &Path) -> Result<(String, i64)> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok((BASE64.encode(hasher.finalize()), data.len() as i64))
}

/// Download many files with bounded parallelism, yielding results in
/// request order. Each downloaded file lands in its own temp file that is
/// cleaned up when the receiver drops it.
pub fn get_files_overlapped(
    backend: Arc<dyn Backend>,
    requests: Vec<RemoteFileRequest>,
    parallelism: usize,
    token: ProgressToken,
) -> mpsc::Receiver<Result<DownloadedFile>> {
    let parallelism = parallelism.max(1);
    let (tx, rx) = mpsc::channel(parallelism);
    let semaphore = Arc::new(Semaphore::new(parallelism));

    tokio::spawn(async move {
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let backend = backend.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("download semaphore closed");
                token.rendezvous().await?;
                let tmp = tempfile::NamedTempFile::new()?;
                let (hash, size) = backend
                    .get(
                        &request.name,
                        request.hash.as_deref(),
                        request.size,
                        tmp.path(),
                    )
                    .await?;
                Ok(DownloadedFile {
                    path: tmp.into_temp_path(),
                    hash,
                    size,
                    name: request.name,
                })
            }));
        }

        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::remote("download task", e.to_string())),
            };
            if tx.send(result).await.is_err() {
                // Receiver gone; remaining downloads are abandoned but
                // their temp files clean themselves up.
                break;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [VolumeKind::Files, VolumeKind::Blocks, VolumeKind::Index] {
            assert_eq!(VolumeKind::from_letter(kind.letter()), Some(kind));
            assert_eq!(VolumeKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(VolumeKind::from_letter('x'), None);
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            VolumeState::Temporary,
            VolumeState::Uploading,
            VolumeState::Uploaded,
            VolumeState::Verified,
            VolumeState::Deleting,
            VolumeState::Deleted,
        ] {
            assert_eq!(VolumeState::from_str(state.as_str()), Some(state));
        }
        assert!(VolumeState::Uploaded.can_serve_reads());
        assert!(VolumeState::Verified.can_serve_reads());
        assert!(!VolumeState::Temporary.can_serve_reads());
        assert!(!VolumeState::Deleting.can_serve_reads());
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();
        let (hash, size) = hash_file(&path).unwrap();
        assert_eq!(size, 11);
        // SHA-256 of "hello world", base64.
        assert_eq!(hash, "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=");
    }
}
