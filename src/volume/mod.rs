//! Remote volume containers.
//!
//! Every volume is a zip archive with a JSON `manifest` entry describing
//! the parameters it was written with. Block volumes store one deflated
//! entry per block; index volumes declare block volumes and carry
//! redundant blocklists; file-list volumes hold one snapshot document.
//!
//! Hashes are SHA-256. In manifests, documents, and the index database
//! they appear as standard base64; zip entry names use the URL-safe
//! alphabet without padding so they stay filesystem-clean.

pub mod block_volume;
pub mod filelist;
pub mod index_volume;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::options::Options;

pub(crate) const MANIFEST_ENTRY: &str = "manifest";
const MANIFEST_VERSION: u32 = 2;

/// Written as the first entry of every volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub version: u32,
    pub blocksize: i64,
    pub block_hash_algo: String,
    pub file_hash_algo: String,
    pub created: i64,
}

impl VolumeManifest {
    pub fn new(options: &Options) -> Self {
        Self {
            version: MANIFEST_VERSION,
            blocksize: options.blocksize,
            block_hash_algo: "SHA256".to_string(),
            file_hash_algo: "SHA256".to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.version > MANIFEST_VERSION {
            return Err(EngineError::VolumeFormat(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        if self.block_hash_algo != "SHA256" || self.file_hash_algo != "SHA256" {
            return Err(EngineError::VolumeFormat(format!(
                "unsupported hash algorithm {}/{}",
                self.block_hash_algo, self.file_hash_algo
            )));
        }
        Ok(())
    }
}

/// Standard-base64 SHA-256 digest of a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    BASE64.encode(hasher.finalize())
}

/// Convert a standard-base64 hash to the URL-safe form used in zip entry
/// names.
pub(crate) fn hash_to_entry_name(hash: &str) -> Result<String> {
    let bytes = BASE64
        .decode(hash)
        .map_err(|e| EngineError::VolumeFormat(format!("bad hash {}: {}", hash, e)))?;
    Ok(BASE64_URL.encode(bytes))
}

/// Inverse of [`hash_to_entry_name`].
pub(crate) fn entry_name_to_hash(name: &str) -> Result<String> {
    let bytes = BASE64_URL
        .decode(name)
        .map_err(|e| EngineError::VolumeFormat(format!("bad entry name {}: {}", name, e)))?;
    Ok(BASE64.encode(bytes))
}

/// Decode a list of standard-base64 hashes into one concatenated byte run,
/// the on-disk shape of a blocklist.
pub(crate) fn concat_hashes(hashes: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(hashes.len() * 32);
    for hash in hashes {
        let bytes = BASE64
            .decode(hash)
            .map_err(|e| EngineError::VolumeFormat(format!("bad hash {}: {}", hash, e)))?;
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Split a concatenated blocklist back into standard-base64 hashes.
pub(crate) fn split_hashes(data: &[u8], hash_size: usize) -> Result<Vec<String>> {
    if hash_size == 0 || data.len() % hash_size != 0 {
        return Err(EngineError::VolumeFormat(format!(
            "blocklist length {} is not a multiple of the hash size {}",
            data.len(),
            hash_size
        )));
    }
    Ok(data.chunks(hash_size).map(|c| BASE64.encode(c)).collect())
}
