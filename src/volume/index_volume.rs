//! Index volume container.
//!
//! An index volume declares which block volumes exist and what they hold,
//! and carries redundant copies of blocklists so that recreate rarely has
//! to download block content. Entries:
//!
//! - `vol/<block volume filename>` — JSON document with the block
//!   volume's hash, size, and `(hash, size)` block manifest.
//! - `list/<entry-name hash>` — raw concatenated block hashes for one
//!   blocklist, named by the blocklist's own hash.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{
    concat_hashes, entry_name_to_hash, hash_bytes, hash_to_entry_name, VolumeManifest,
    MANIFEST_ENTRY,
};
use crate::error::{EngineError, Result};
use crate::options::Options;

const VOLUME_PREFIX: &str = "vol/";
const BLOCKLIST_PREFIX: &str = "list/";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct VolumeDocument {
    volume_hash: String,
    volume_size: i64,
    blocks: Vec<BlockRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockRecord {
    hash: String,
    size: i64,
}

/// One block volume as declared by an index volume.
#[derive(Clone, Debug)]
pub struct DeclaredVolume {
    pub filename: String,
    pub hash: String,
    pub length: i64,
    pub blocks: Vec<(String, i64)>,
}

/// One blocklist carried by an index volume. `valid` is false when the
/// stored bytes do not hash to the declared name; callers count these and
/// keep going.
#[derive(Clone, Debug)]
pub struct DeclaredBlocklist {
    pub hash: String,
    pub block_hashes: Vec<String>,
    pub valid: bool,
}

pub struct IndexVolumeWriter {
    zip: ZipWriter<File>,
    volume_count: usize,
}

impl IndexVolumeWriter {
    pub fn create(path: &Path, options: &Options) -> Result<Self> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let manifest = serde_json::to_vec(&VolumeManifest::new(options))?;
        zip.start_file(MANIFEST_ENTRY, SimpleFileOptions::default())?;
        zip.write_all(&manifest)?;
        Ok(Self {
            zip,
            volume_count: 0,
        })
    }

    pub fn add_volume(
        &mut self,
        filename: &str,
        volume_hash: &str,
        volume_size: i64,
        blocks: &[(String, i64)],
    ) -> Result<()> {
        let doc = VolumeDocument {
            volume_hash: volume_hash.to_string(),
            volume_size,
            blocks: blocks
                .iter()
                .map(|(hash, size)| BlockRecord {
                    hash: hash.clone(),
                    size: *size,
                })
                .collect(),
        };
        self.zip.start_file(
            format!("{}{}", VOLUME_PREFIX, filename),
            SimpleFileOptions::default(),
        )?;
        self.zip.write_all(&serde_json::to_vec(&doc)?)?;
        self.volume_count += 1;
        Ok(())
    }

    /// Store one blocklist, named by its hash over the concatenated block
    /// hash bytes.
    pub fn add_blocklist(&mut self, blocklist_hash: &str, block_hashes: &[String]) -> Result<()> {
        let data = concat_hashes(block_hashes)?;
        let entry = format!("{}{}", BLOCKLIST_PREFIX, hash_to_entry_name(blocklist_hash)?);
        self.zip.start_file(entry, SimpleFileOptions::default())?;
        self.zip.write_all(&data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.zip.finish()?;
        Ok(())
    }
}

pub struct IndexVolumeReader {
    archive: ZipArchive<File>,
    volume_entries: Vec<String>,
    blocklist_entries: Vec<String>,
}

impl IndexVolumeReader {
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

        let mut volume_entries = Vec::new();
        let mut blocklist_entries = Vec::new();
        for name in archive.file_names() {
            if let Some(rest) = name.strip_prefix(VOLUME_PREFIX) {
                volume_entries.push(rest.to_string());
            } else if name.strip_prefix(BLOCKLIST_PREFIX).is_some() {
                blocklist_entries.push(name.to_string());
            }
        }

        Ok(Self {
            archive,
            volume_entries,
            blocklist_entries,
        })
    }

    pub fn volumes(&mut self) -> Result<Vec<DeclaredVolume>> {
        let names = self.volume_entries.clone();
        let mut out = Vec::with_capacity(names.len());
        for filename in names {
            let mut entry = self
                .archive
                .by_name(&format!("{}{}", VOLUME_PREFIX, filename))?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            drop(entry);
            let doc: VolumeDocument = serde_json::from_slice(&buf)?;
            out.push(DeclaredVolume {
                filename,
                hash: doc.volume_hash,
                length: doc.volume_size,
                blocks: doc.blocks.into_iter().map(|b| (b.hash, b.size)).collect(),
            });
        }
        Ok(out)
    }

    pub fn blocklists(&mut self, hash_size: usize) -> Result<Vec<DeclaredBlocklist>> {
        let entries = self.blocklist_entries.clone();
        let mut out = Vec::with_capacity(entries.len());
        for entry_name in entries {
            let declared_hash =
                entry_name_to_hash(entry_name.trim_start_matches(BLOCKLIST_PREFIX))?;
            let mut entry = self.archive.by_name(&entry_name)?;
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            drop(entry);

            let valid =
                hash_bytes(&data) == declared_hash && hash_size > 0 && data.len() % hash_size == 0;
            let block_hashes = if valid {
                super::split_hashes(&data, hash_size)?
            } else {
                Vec::new()
            };
            out.push(DeclaredBlocklist {
                hash: declared_hash,
                block_hashes,
                valid,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_index_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.zip");
        let options = Options::default();

        let blocks = vec![(hash_bytes(b"b1"), 2i64), (hash_bytes(b"b2"), 4i64)];
        let list_hashes = vec![hash_bytes(b"b1"), hash_bytes(b"b2")];
        let list_bytes = concat_hashes(&list_hashes).unwrap();
        let list_hash = hash_bytes(&list_bytes);

        let mut writer = IndexVolumeWriter::create(&path, &options).unwrap();
        writer
            .add_volume("coffer-bvol.zip", "volhash", 1234, &blocks)
            .unwrap();
        writer.add_blocklist(&list_hash, &list_hashes).unwrap();
        writer.finish().unwrap();

        let mut reader = IndexVolumeReader::open(&path).unwrap();
        let volumes = reader.volumes().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].filename, "coffer-bvol.zip");
        assert_eq!(volumes[0].hash, "volhash");
        assert_eq!(volumes[0].length, 1234);
        assert_eq!(volumes[0].blocks, blocks);

        let lists = reader.blocklists(32).unwrap();
        assert_eq!(lists.len(), 1);
        assert!(lists[0].valid);
        assert_eq!(lists[0].hash, list_hash);
        assert_eq!(lists[0].block_hashes, list_hashes);
    }

    #[test]
    fn test_corrupt_blocklist_is_flagged_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.zip");
        let options = Options::default();

        // Entry name declares a hash that does not match the stored bytes.
        let bogus_hash = hash_bytes(b"something else entirely");
        let mut writer = IndexVolumeWriter::create(&path, &options).unwrap();
        writer
            .add_blocklist(&bogus_hash, &[hash_bytes(b"real")])
            .unwrap();
        writer.finish().unwrap();

        let mut reader = IndexVolumeReader::open(&path).unwrap();
        let lists = reader.blocklists(32).unwrap();
        assert_eq!(lists.len(), 1);
        assert!(!lists[0].valid);
        assert!(lists[0].block_hashes.is_empty());
    }
}
