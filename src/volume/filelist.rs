//! File-list volume container: one snapshot's paths and hashes, stored as
//! a single JSON document next to the manifest.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{VolumeManifest, MANIFEST_ENTRY};
use crate::error::{EngineError, Result};
use crate::options::Options;

const FILELIST_ENTRY: &str = "filelist.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEntryKind {
    File,
    Folder,
    Symlink,
}

/// One path in a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileListEntry {
    #[serde(rename = "type")]
    pub kind: FileEntryKind,
    pub path: String,
    pub time: i64,
    #[serde(default)]
    pub size: i64,
    /// Full-content hash; absent for folders and symlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Blocklist hashes for multi-block content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocklist_hashes: Vec<String>,
    /// Single-block shortcut: the one block's hash when the content fits
    /// in a single block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metahash: Option<String>,
    #[serde(default)]
    pub metasize: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta_blocklist_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_blockhash: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FileListDocument {
    is_full_backup: bool,
    files: Vec<FileListEntry>,
}

pub struct FilelistVolumeWriter {
    path: std::path::PathBuf,
    options_manifest: VolumeManifest,
    document: FileListDocument,
}

impl FilelistVolumeWriter {
    pub fn create(path: &Path, options: &Options, is_full_backup: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            options_manifest: VolumeManifest::new(options),
            document: FileListDocument {
                is_full_backup,
                files: Vec::new(),
            },
        }
    }

    pub fn add_entry(&mut self, entry: FileListEntry) {
        self.document.files.push(entry);
    }

    pub fn finish(self) -> Result<()> {
        let file = File::create(&self.path)?;
        let mut zip = ZipWriter::new(file);
        zip.start_file(MANIFEST_ENTRY, SimpleFileOptions::default())?;
        zip.write_all(&serde_json::to_vec(&self.options_manifest)?)?;
        zip.start_file(FILELIST_ENTRY, SimpleFileOptions::default())?;
        zip.write_all(&serde_json::to_vec(&self.document)?)?;
        zip.finish()?;
        Ok(())
    }
}

pub struct FilelistVolumeReader {
    is_full_backup: bool,
    files: Vec<FileListEntry>,
}

impl FilelistVolumeReader {
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

        let document: FileListDocument = {
            let mut entry = archive
                .by_name(FILELIST_ENTRY)
                .map_err(|_| EngineError::VolumeFormat("missing filelist entry".to_string()))?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            serde_json::from_slice(&buf)?
        };

        Ok(Self {
            is_full_backup: document.is_full_backup,
            files: document.files,
        })
    }

    pub fn is_full_backup(&self) -> bool {
        self.is_full_backup
    }

    pub fn files(&self) -> &[FileListEntry] {
        &self.files
    }
}
