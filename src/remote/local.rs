//! Directory-backed remote target.
//!
//! Stores every volume as a flat file under a base directory. Useful for
//! local disk or mounted-share targets and as the reference `Backend`
//! implementation in tests. Operations are serialised through a binary
//! semaphore the way a single-connection share transport would be.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Semaphore;

use super::{hash_file, Backend, RemoteFileInfo};
use crate::error::{ids, EngineError, Result};

pub struct LocalBackend {
    base_path: PathBuf,
    /// Serialises per-share operations; concurrent engine calls queue here
    /// rather than in the engine itself.
    gate: Semaphore,
}

impl LocalBackend {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            gate: Semaphore::new(1),
        }
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list(&self) -> Result<Vec<RemoteFileInfo>> {
        let _permit = self.gate.acquire().await.expect("backend gate closed");
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push(RemoteFileInfo {
                    name: name.to_string(),
                    size: meta.len() as i64,
                });
            }
        }
        Ok(entries)
    }

    async fn get(
        &self,
        name: &str,
        hash: Option<&str>,
        size: Option<i64>,
        dest: &Path,
    ) -> Result<(String, i64)> {
        let _permit = self.gate.acquire().await.expect("backend gate closed");
        let path = self.file_path(name);
        if !path.is_file() {
            return Err(EngineError::user(
                ids::FILE_MISSING,
                format!("remote file not found: {}", name),
            ));
        }
        fs::copy(&path, dest)
            .await
            .map_err(|e| EngineError::remote(name, e.to_string()))?;

        let (observed_hash, observed_size) = hash_file(dest)?;
        if let Some(expected) = size {
            if expected >= 0 && expected != observed_size {
                return Err(EngineError::corrupt(
                    name,
                    format!("size mismatch: expected {}, got {}", expected, observed_size),
                ));
            }
        }
        if let Some(expected) = hash {
            if !expected.is_empty() && expected != observed_hash {
                return Err(EngineError::corrupt(
                    name,
                    format!("hash mismatch: expected {}, got {}", expected, observed_hash),
                ));
            }
        }
        Ok((observed_hash, observed_size))
    }

    async fn put(&self, name: &str, source: &Path) -> Result<(String, i64)> {
        let _permit = self.gate.acquire().await.expect("backend gate closed");
        fs::create_dir_all(&self.base_path).await?;
        let path = self.file_path(name);
        fs::copy(source, &path)
            .await
            .map_err(|e| EngineError::remote(name, e.to_string()))?;
        hash_file(&path)
    }

    async fn delete(&self, name: &str, _size: i64, preserve: bool) -> Result<()> {
        let _permit = self.gate.acquire().await.expect("backend gate closed");
        let path = self.file_path(name);
        let result = if preserve {
            let aside = self.base_path.join(format!("{}.deleted", name));
            fs::rename(&path, &aside).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            // Deleting an already-absent file is not an error; retried
            // deletes after a crash hit this path.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::remote(name, e.to_string())),
        }
    }

    async fn wait_for_empty(&self) -> Result<()> {
        // All operations are synchronous with respect to their callers;
        // acquiring the gate proves nothing is in flight.
        let _permit = self.gate.acquire().await.expect("backend gate closed");
        Ok(())
    }
}
