//! Block volume container: the manifest plus one deflated entry per block,
//! keyed by the block's hash.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{
    entry_name_to_hash, hash_bytes, hash_to_entry_name, split_hashes, VolumeManifest,
    MANIFEST_ENTRY,
};
use crate::error::{EngineError, Result};
use crate::options::Options;

pub struct BlockVolumeWriter {
    zip: ZipWriter<File>,
    block_count: usize,
    unpacked_size: i64,
}

impl BlockVolumeWriter {
    pub fn create(path: &Path, options: &Options) -> Result<Self> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let manifest = serde_json::to_vec(&VolumeManifest::new(options))?;
        zip.start_file(MANIFEST_ENTRY, SimpleFileOptions::default())?;
        zip.write_all(&manifest)?;
        Ok(Self {
            zip,
            block_count: 0,
            unpacked_size: 0,
        })
    }

    /// Append a block. The hash must be the standard-base64 SHA-256 of
    /// `data`; the writer trusts the caller (the hasher sits upstream).
    pub fn add_block(&mut self, hash: &str, data: &[u8]) -> Result<()> {
        let entry = hash_to_entry_name(hash)?;
        self.zip.start_file(entry, SimpleFileOptions::default())?;
        self.zip.write_all(data)?;
        self.block_count += 1;
        self.unpacked_size += data.len() as i64;
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn unpacked_size(&self) -> i64 {
        self.unpacked_size
    }

    pub fn finish(mut self) -> Result<()> {
        self.zip.finish()?;
        Ok(())
    }
}

pub struct BlockVolumeReader {
    archive: ZipArchive<File>,
    blocks: Vec<(String, i64)>,
}

impl BlockVolumeReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let manifest: VolumeManifest = {
            let mut entry = archive
                .by_name(MANIFEST_ENTRY)
                .map_err(|_| EngineError::VolumeFormat("missing manifest entry".to_string()))?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            serde_json::from_slice(&buf)?
        };
        manifest.verify()?;

        let names: Vec<String> = archive.file_names().map(String::from).collect();
        let mut blocks = Vec::with_capacity(names.len().saturating_sub(1));
        for name in names {
            if name == MANIFEST_ENTRY {
                continue;
            }
            let hash = entry_name_to_hash(&name)?;
            let size = archive.by_name(&name)?.size() as i64;
            blocks.push((hash, size));
        }

        Ok(Self { archive, blocks })
    }

    /// The `(hash, size)` manifest of every block in the volume.
    pub fn blocks(&self) -> &[(String, i64)] {
        &self.blocks
    }

    /// Read and verify one block's payload.
    pub fn read_block(&mut self, hash: &str) -> Result<Bytes> {
        let entry_name = hash_to_entry_name(hash)?;
        let mut entry = self
            .archive
            .by_name(&entry_name)
            .map_err(|_| EngineError::VolumeFormat(format!("block {} not in volume", hash)))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        drop(entry);

        if hash_bytes(&data) != hash {
            return Err(EngineError::VolumeFormat(format!(
                "block {} failed hash verification",
                hash
            )));
        }
        Ok(Bytes::from(data))
    }

    /// Read a block holding a blocklist and split it into block hashes.
    pub fn read_blocklist(&mut self, hash: &str, hash_size: usize) -> Result<Vec<String>> {
        let data = self.read_block(hash)?;
        split_hashes(&data, hash_size)
    }
}
