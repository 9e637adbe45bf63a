//! Metadata pre-processing stage.
//!
//! Maps source-tree entries to per-file metadata records. Folders and
//! symlinks are dispatched downstream directly; regular files are
//! forwarded for change detection, enriched with the previous version's
//! identity from a single database lookup. A one-entry cache in front of
//! the path-prefix interning avoids a query per entry while a directory
//! is being walked.

use std::collections::BTreeMap;

use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;

use crate::db::{get_or_create_path_prefix, query_rows, split_path};
use crate::error::Result;
use crate::options::{ChangeDetectionMode, Options, SymlinkPolicy};
use crate::progress::ProgressToken;
use crate::volume::hash_bytes;

/// Metadata key carrying a symlink's target path.
pub const CORE_SYMLINK_TARGET: &str = "CoreSymlinkTarget";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Folder,
    Symlink { target: String },
}

/// One entry produced by the source scanner.
#[derive(Clone, Debug)]
pub struct SourceEntry {
    pub path: String,
    pub kind: SourceKind,
    pub last_modified: i64,
    pub size: i64,
    pub metadata: BTreeMap<String, String>,
}

/// A serialised metadata record, ready for the block splitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataBlob {
    pub serialized: Vec<u8>,
    pub hash: String,
    pub size: i64,
}

impl MetadataBlob {
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        // BTreeMap gives a stable key order, so identical metadata
        // serialises to identical bytes and dedups as one blockset.
        let serialized = serde_json::to_vec(map)?;
        let hash = hash_bytes(&serialized);
        let size = serialized.len() as i64;
        Ok(Self {
            serialized,
            hash,
            size,
        })
    }

    pub fn empty() -> Self {
        Self::from_map(&BTreeMap::new()).expect("empty map serialises")
    }
}

/// A regular file forwarded for change detection.
#[derive(Clone, Debug)]
pub struct FileCandidate {
    pub entry: SourceEntry,
    pub prefix_id: i64,
    pub old_id: Option<i64>,
    pub old_modified: Option<i64>,
    pub last_file_size: Option<i64>,
    pub old_metadata_hash: Option<String>,
    pub old_metadata_size: Option<i64>,
}

#[derive(Clone, Debug)]
pub enum ProcessedEntry {
    Folder {
        path: String,
        prefix_id: i64,
        metadata: MetadataBlob,
    },
    Symlink {
        path: String,
        prefix_id: i64,
        metadata: MetadataBlob,
    },
    File(Box<FileCandidate>),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PreProcessStats {
    pub folders: usize,
    pub symlinks: usize,
    pub files: usize,
    pub ignored_symlinks: usize,
}

/// Run the stage until the input channel closes.
pub async fn run(
    db: &DatabaseConnection,
    options: &Options,
    mut input: mpsc::Receiver<SourceEntry>,
    output: mpsc::Sender<ProcessedEntry>,
    token: &ProgressToken,
) -> Result<PreProcessStats> {
    let mut stats = PreProcessStats::default();
    let mut prefix_cache: Option<(String, i64)> = None;

    while let Some(entry) = input.recv().await {
        token.rendezvous().await?;

        if let SourceKind::Symlink { target } = &entry.kind {
            match options.symlink_policy {
                SymlinkPolicy::Ignore => {
                    stats.ignored_symlinks += 1;
                    continue;
                }
                SymlinkPolicy::Store => {
                    let mut metadata = entry.metadata.clone();
                    metadata
                        .entry(CORE_SYMLINK_TARGET.to_string())
                        .or_insert_with(|| target.clone());
                    let blob = MetadataBlob::from_map(&metadata)?;
                    let prefix_id =
                        cached_prefix_id(db, &mut prefix_cache, &entry.path).await?;
                    stats.symlinks += 1;
                    if output
                        .send(ProcessedEntry::Symlink {
                            path: entry.path.clone(),
                            prefix_id,
                            metadata: blob,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                // Follow: the scanner already resolved the target, so the
                // entry continues through the regular file path below.
                SymlinkPolicy::Follow => {}
            }
        }

        if entry.kind == SourceKind::Folder {
            let blob = if options.skip_metadata {
                MetadataBlob::empty()
            } else {
                MetadataBlob::from_map(&entry.metadata)?
            };
            let prefix_id = cached_prefix_id(db, &mut prefix_cache, &entry.path).await?;
            stats.folders += 1;
            if output
                .send(ProcessedEntry::Folder {
                    path: entry.path.clone(),
                    prefix_id,
                    metadata: blob,
                })
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        // Regular file: enrich with the previous version in one lookup.
        let prefix_id = cached_prefix_id(db, &mut prefix_cache, &entry.path).await?;
        let name = split_path(&entry.path).1.to_string();
        let candidate = match options.change_detection {
            ChangeDetectionMode::Full => {
                get_file_entry(db, prefix_id, &name, entry).await?
            }
            ChangeDetectionMode::CheckFiletimeOnly | ChangeDetectionMode::DisableFiletimeCheck => {
                get_file_last_modified(db, prefix_id, &name, entry).await?
            }
        };
        stats.files += 1;
        if output
            .send(ProcessedEntry::File(Box::new(candidate)))
            .await
            .is_err()
        {
            break;
        }
    }
    Ok(stats)
}

/// Intern the entry's directory prefix, reusing the previous result while
/// consecutive entries share a directory.
async fn cached_prefix_id(
    db: &DatabaseConnection,
    cache: &mut Option<(String, i64)>,
    path: &str,
) -> Result<i64> {
    let (prefix, _) = split_path(path);
    if let Some((cached_prefix, id)) = cache {
        if cached_prefix == prefix {
            return Ok(*id);
        }
    }
    let id = get_or_create_path_prefix(db, prefix).await?;
    *cache = Some((prefix.to_string(), id));
    Ok(id)
}

async fn get_file_entry(
    db: &DatabaseConnection,
    prefix_id: i64,
    name: &str,
    entry: SourceEntry,
) -> Result<FileCandidate> {
    let rows = query_rows(
        db,
        r#"
        SELECT fl."id", fe."last_modified", bs."length", mbs."full_hash", mbs."length"
        FROM "file_lookup" fl
        LEFT JOIN "fileset_entry" fe ON fe."file_id" = fl."id"
        LEFT JOIN "fileset" f ON f."id" = fe."fileset_id"
        LEFT JOIN "blockset" bs ON bs."id" = fl."blockset_id"
        LEFT JOIN "metadataset" m ON m."id" = fl."metadata_id"
        LEFT JOIN "blockset" mbs ON mbs."id" = m."blockset_id"
        WHERE fl."path_prefix_id" = ? AND fl."name" = ?
        ORDER BY f."timestamp" DESC
        LIMIT 1
        "#,
        vec![prefix_id.into(), name.to_string().into()],
    )
    .await?;

    let mut candidate = FileCandidate {
        entry,
        prefix_id,
        old_id: None,
        old_modified: None,
        last_file_size: None,
        old_metadata_hash: None,
        old_metadata_size: None,
    };
    if let Some(row) = rows.first() {
        candidate.old_id = Some(row.try_get_by_index(0)?);
        candidate.old_modified = row.try_get_by_index(1)?;
        candidate.last_file_size = row.try_get_by_index(2)?;
        candidate.old_metadata_hash = row.try_get_by_index(3)?;
        candidate.old_metadata_size = row.try_get_by_index(4)?;
    }
    Ok(candidate)
}

/// Lighter lookup for the timestamp-only change detection modes.
async fn get_file_last_modified(
    db: &DatabaseConnection,
    prefix_id: i64,
    name: &str,
    entry: SourceEntry,
) -> Result<FileCandidate> {
    let rows = query_rows(
        db,
        r#"
        SELECT fl."id", fe."last_modified"
        FROM "file_lookup" fl
        LEFT JOIN "fileset_entry" fe ON fe."file_id" = fl."id"
        LEFT JOIN "fileset" f ON f."id" = fe."fileset_id"
        WHERE fl."path_prefix_id" = ? AND fl."name" = ?
        ORDER BY f."timestamp" DESC
        LIMIT 1
        "#,
        vec![prefix_id.into(), name.to_string().into()],
    )
    .await?;

    let mut candidate = FileCandidate {
        entry,
        prefix_id,
        old_id: None,
        old_modified: None,
        last_file_size: None,
        old_metadata_hash: None,
        old_metadata_size: None,
    };
    if let Some(row) = rows.first() {
        candidate.old_id = Some(row.try_get_by_index(0)?);
        candidate.old_modified = row.try_get_by_index(1)?;
    }
    Ok(candidate)
}
