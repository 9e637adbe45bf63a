//! Rebuilding the local index from remote volumes alone.
//!
//! Phases:
//! 1. list and classify the remote files;
//! 2. ingest file-list volumes, newest first, creating filesets, files,
//!    and (incomplete) blocksets;
//! 3. ingest index volumes to map blocks to their volumes and buffer the
//!    redundant blocklists;
//! 4. three-pass block-volume download to recover whatever blocklists the
//!    indexes did not supply;
//! 5. cleanup and full consistency verification.
//!
//! Each successful volume ingest commits, so a crash resumes with partial
//! progress instead of starting over.

pub mod probe;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sea_orm::{ConnectionTrait, DatabaseConnection, Value};

use crate::codec::CodecRegistry;
use crate::db::tx::Tx;
use crate::db::{
    self, consistency, exec, find_volume_by_name, get_or_create_path_prefix, query_rows,
    query_scalar_i64, register_remote_volume, split_path,
};
use crate::error::{ids, EngineError, Result};
use crate::options::{Options, BLOCK_HASH_BYTES};
use crate::progress::ProgressToken;
use crate::prune::dropper::move_unreferenced_blocks_to_deleted;
use crate::remote::filename::{self, ParsedVolumeName};
use crate::remote::{
    get_files_overlapped, Backend, RemoteFileInfo, RemoteFileRequest, VolumeKind, VolumeState,
};
use crate::volume::filelist::{FileEntryKind, FilelistVolumeReader};
use crate::volume::{block_volume::BlockVolumeReader, index_volume::IndexVolumeReader};

#[derive(Debug, Default)]
pub struct RecreateStats {
    pub filelists: usize,
    pub index_volumes: usize,
    /// Block volumes downloaded during the three-pass recovery.
    pub block_volumes: usize,
    pub malformed_blocklists: usize,
    pub probed_renames: usize,
    pub placeholder_volumes: usize,
}

/// Rebuild the index database at `db_path` from the remote alone.
/// `filter`, when given, restricts ingestion to file-lists with those
/// timestamps.
pub async fn run_recreate(
    db_path: &Path,
    backend: Arc<dyn Backend>,
    options: &Options,
    registry: &CodecRegistry,
    token: &ProgressToken,
    filter: Option<&[i64]>,
) -> Result<RecreateStats> {
    let result = run_recreate_inner(db_path, backend.clone(), options, registry, token, filter).await;
    if matches!(result, Err(EngineError::Cancelled)) {
        // Pending transfers are flushed before surfacing cancellation.
        backend.wait_for_empty().await.ok();
    }
    result
}

async fn run_recreate_inner(
    db_path: &Path,
    backend: Arc<dyn Backend>,
    options: &Options,
    registry: &CodecRegistry,
    token: &ProgressToken,
    filter: Option<&[i64]>,
) -> Result<RecreateStats> {
    if db_path.exists() {
        return Err(EngineError::user(
            ids::RECREATE_TARGET_EXISTS,
            format!("target database already exists: {}", db_path.display()),
        ));
    }
    let db = db::init_database(db_path).await?;
    let mut stats = RecreateStats::default();

    // Phase 1: remote listing.
    token.rendezvous().await?;
    let listing = backend.list().await?;
    let mut parseable = 0usize;
    let mut volumes: Vec<(ParsedVolumeName, RemoteFileInfo)> = Vec::new();
    for file in listing {
        if let Some(parsed) = filename::parse(&file.name) {
            parseable += 1;
            if parsed.prefix == options.prefix {
                volumes.push((parsed, file));
            }
        }
    }
    if volumes.is_empty() {
        return Err(if parseable > 0 {
            EngineError::user(
                ids::EMPTY_REMOTE_LOCATION,
                format!(
                    "found {} volumes with a different prefix; expected prefix '{}'",
                    parseable, options.prefix
                ),
            )
        } else {
            EngineError::user(ids::EMPTY_REMOTE_LOCATION, "remote location is empty")
        });
    }
    if volumes.iter().any(|(p, _)| p.encryption.is_some()) && options.passphrase.is_none() {
        return Err(EngineError::user(
            ids::MISSING_PASSPHRASE,
            "remote volumes are encrypted and no passphrase is configured",
        ));
    }

    // Register everything up front so probing and the block passes see
    // the full remote picture.
    for (parsed, file) in &volumes {
        register_remote_volume(
            &db,
            &file.name,
            parsed.kind,
            VolumeState::Uploaded,
            file.size,
            None,
        )
        .await?;
    }

    // Phase 2: file-lists, newest first.
    let mut filelists: Vec<&(ParsedVolumeName, RemoteFileInfo)> = volumes
        .iter()
        .filter(|(p, _)| p.kind == VolumeKind::Files)
        .filter(|(p, _)| match filter {
            Some(times) => times.contains(&p.time.timestamp()),
            None => true,
        })
        .collect();
    filelists.sort_by(|a, b| b.0.time.cmp(&a.0.time));

    let requests: Vec<RemoteFileRequest> = filelists
        .iter()
        .map(|(_, f)| RemoteFileRequest {
            name: f.name.clone(),
            hash: None,
            size: Some(f.size),
        })
        .collect();
    let mut rx = get_files_overlapped(
        backend.clone(),
        requests,
        options.download_parallelism,
        token.clone(),
    );
    let mut first = true;
    while let Some(result) = rx.recv().await {
        token.rendezvous().await?;
        let ingest = async {
            let file = result?;
            let parsed = filename::parse(&file.name).expect("registered names parse");
            let volume = find_volume_by_name(&db, &file.name)
                .await?
                .expect("volume registered during listing");
            let (path, _guard) = decrypt_if_needed(&file.path, &parsed, registry, options)?;
            let reader = FilelistVolumeReader::open(&path)
                .map_err(|e| EngineError::corrupt(&file.name, e.to_string()))?;

            let tx = Tx::begin(&db, false).await?;
            ingest_filelist(&*tx, options, volume.id, parsed.time.timestamp(), &reader).await?;
            tx.commit(&format!("recreate file-list {}", file.name)).await?;
            Ok::<(), EngineError>(())
        }
        .await;

        match ingest {
            Ok(()) => stats.filelists += 1,
            // A broken first file-list aborts: with nothing ingested yet
            // the remote is unusable. Later failures lose one snapshot.
            Err(e) if first => return Err(e),
            Err(e) => tracing::warn!("Skipping unreadable file-list: {}", e),
        }
        first = false;
    }
    if stats.filelists == 0 {
        return Err(EngineError::user(
            ids::EMPTY_REMOTE_LOCATION,
            "no usable file-list volumes on the remote",
        ));
    }

    // Phase 3: index volumes.
    let index_files: Vec<&(ParsedVolumeName, RemoteFileInfo)> = volumes
        .iter()
        .filter(|(p, _)| p.kind == VolumeKind::Index)
        .collect();
    let requests: Vec<RemoteFileRequest> = index_files
        .iter()
        .map(|(_, f)| RemoteFileRequest {
            name: f.name.clone(),
            hash: None,
            size: Some(f.size),
        })
        .collect();
    let mut rx = get_files_overlapped(
        backend.clone(),
        requests,
        options.download_parallelism,
        token.clone(),
    );
    while let Some(result) = rx.recv().await {
        token.rendezvous().await?;
        let outcome = async {
            let file = result?;
            let parsed = filename::parse(&file.name).expect("registered names parse");
            let volume = find_volume_by_name(&db, &file.name)
                .await?
                .expect("volume registered during listing");
            let (path, _guard) = decrypt_if_needed(&file.path, &parsed, registry, options)?;
            let mut reader = IndexVolumeReader::open(&path)
                .map_err(|e| EngineError::corrupt(&file.name, e.to_string()))?;

            let tx = Tx::begin(&db, false).await?;
            ingest_index_volume(&*tx, registry, volume.id, &mut reader, &mut stats).await?;
            reconcile(&*tx, options).await?;
            tx.commit(&format!("recreate index {}", file.name)).await?;
            Ok::<(), EngineError>(())
        }
        .await;
        match outcome {
            Ok(()) => stats.index_volumes += 1,
            Err(e @ EngineError::Cancelled) => return Err(e),
            Err(e) => tracing::warn!("Skipping unreadable index volume: {}", e),
        }
    }

    // Phase 4: three-pass block-volume recovery.
    let mut processed: HashSet<i64> = HashSet::new();
    for pass in 0..3u8 {
        let work = get_missing_blocklist_volumes(&db, pass, &processed).await?;
        if work.is_empty() {
            continue;
        }
        tracing::info!("Block recovery pass {}: {} volumes", pass, work.len());
        for (volume_id, name, size) in work {
            token.rendezvous().await?;
            let changed = ingest_block_volume(
                &db, backend.clone(), options, registry, volume_id, &name, size, &mut stats,
            )
            .await?;
            processed.insert(volume_id);
            if changed > 0 && pass == 2 {
                tracing::warn!(
                    "Pass 2 recovered {} blockset entries from {}; the index volumes are incomplete or corrupted",
                    changed,
                    name
                );
            }
        }
    }

    // Phase 5: cleanup and verification.
    let tx = Tx::begin(&db, false).await?;
    let orphaned = move_unreferenced_blocks_to_deleted(&*tx).await?;
    if orphaned > 0 {
        tracing::info!("Recreate moved {} unreferenced blocks to the deleted pool", orphaned);
    }
    cleanup_missing_volumes(&*tx).await?;
    tx.commit("recreate cleanup").await?;

    consistency::verify_consistency(&db, options.blocksize, BLOCK_HASH_BYTES, true).await?;
    tracing::info!(
        "Recreate complete: {} file-lists, {} index volumes, {} block volumes downloaded",
        stats.filelists,
        stats.index_volumes,
        stats.block_volumes
    );
    Ok(stats)
}

/// Decrypt a downloaded volume when its filename carries an encryption
/// module. Returns the readable path plus an optional temp-file guard.
fn decrypt_if_needed(
    path: &Path,
    parsed: &ParsedVolumeName,
    registry: &CodecRegistry,
    options: &Options,
) -> Result<(PathBuf, Option<tempfile::TempPath>)> {
    let Some(module) = parsed.encryption.as_deref() else {
        return Ok((path.to_path_buf(), None));
    };
    let codec = registry.encryption(module).ok_or_else(|| {
        EngineError::user(
            ids::MISSING_PASSPHRASE,
            format!("no encryption module '{}' is loaded", module),
        )
    })?;
    let passphrase = options.passphrase.as_deref().ok_or_else(|| {
        EngineError::user(ids::MISSING_PASSPHRASE, "encrypted volume without passphrase")
    })?;
    let plain = tempfile::NamedTempFile::new()?;
    codec.decrypt(path, plain.path(), passphrase)?;
    let guard = plain.into_temp_path();
    Ok((guard.to_path_buf(), Some(guard)))
}

async fn ingest_filelist<C: ConnectionTrait>(
    conn: &C,
    options: &Options,
    volume_id: i64,
    timestamp: i64,
    reader: &FilelistVolumeReader,
) -> Result<()> {
    let fileset_id = exec_insert(
        conn,
        r#"INSERT INTO "fileset" ("timestamp", "volume_id", "is_full_backup") VALUES (?, ?, ?)"#,
        vec![
            timestamp.into(),
            volume_id.into(),
            (reader.is_full_backup() as i64).into(),
        ],
    )
    .await?;

    for entry in reader.files() {
        let (prefix, name) = split_path(&entry.path);
        let prefix_id = get_or_create_path_prefix(conn, prefix).await?;

        let blockset_id = match entry.kind {
            FileEntryKind::Folder => crate::db::entities::FOLDER_BLOCKSET_ID,
            FileEntryKind::Symlink => crate::db::entities::SYMLINK_BLOCKSET_ID,
            FileEntryKind::File => {
                let hash = entry.hash.as_deref().unwrap_or_default();
                get_or_create_blockset(
                    conn,
                    options,
                    hash,
                    entry.size,
                    &entry.blocklist_hashes,
                    entry.blockhash.as_deref(),
                )
                .await?
            }
        };

        let metadata_id = match entry.metahash.as_deref() {
            Some(metahash) => {
                let meta_blockset = get_or_create_blockset(
                    conn,
                    options,
                    metahash,
                    entry.metasize,
                    &entry.meta_blocklist_hashes,
                    entry.meta_blockhash.as_deref(),
                )
                .await?;
                Some(get_or_create_metadataset(conn, meta_blockset).await?)
            }
            None => None,
        };

        let file_id =
            get_or_create_file_lookup(conn, prefix_id, name, blockset_id, metadata_id).await?;
        exec(
            conn,
            r#"INSERT OR IGNORE INTO "fileset_entry" ("fileset_id", "file_id", "last_modified") VALUES (?, ?, ?)"#,
            vec![fileset_id.into(), file_id.into(), entry.time.into()],
        )
        .await?;
    }
    Ok(())
}

async fn exec_insert<C: ConnectionTrait>(
    conn: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<i64> {
    let result = conn
        .execute(sea_orm::Statement::from_sql_and_values(
            conn.get_database_backend(),
            sql,
            values,
        ))
        .await?;
    Ok(result.last_insert_id() as i64)
}

/// Find or create a blockset for `(full_hash, length)`, wiring up its
/// blocklist hashes or, for single-block content, the direct link that
/// lets reconciliation complete it without a block-volume probe.
async fn get_or_create_blockset<C: ConnectionTrait>(
    conn: &C,
    options: &Options,
    full_hash: &str,
    length: i64,
    blocklist_hashes: &[String],
    blockhash: Option<&str>,
) -> Result<i64> {
    if let Some(existing) = query_scalar_i64(
        conn,
        r#"SELECT "id" FROM "blockset" WHERE "full_hash" = ? AND "length" = ?"#,
        vec![full_hash.to_string().into(), length.into()],
    )
    .await?
    {
        return Ok(existing);
    }

    let blockset_id = exec_insert(
        conn,
        r#"INSERT INTO "blockset" ("full_hash", "length") VALUES (?, ?)"#,
        vec![full_hash.to_string().into(), length.into()],
    )
    .await?;

    for (index, hash) in blocklist_hashes.iter().enumerate() {
        exec(
            conn,
            r#"INSERT INTO "blocklist_hash" ("blockset_id", "hash_index", "hash") VALUES (?, ?, ?)"#,
            vec![blockset_id.into(), (index as i64).into(), hash.clone().into()],
        )
        .await?;
    }

    if length > 0 && length <= options.blocksize {
        let block_hash = blockhash.unwrap_or(full_hash);
        exec(
            conn,
            r#"INSERT OR IGNORE INTO "small_blockset_link" ("blockset_id", "block_hash") VALUES (?, ?)"#,
            vec![blockset_id.into(), block_hash.to_string().into()],
        )
        .await?;
    }
    Ok(blockset_id)
}

async fn get_or_create_metadataset<C: ConnectionTrait>(conn: &C, blockset_id: i64) -> Result<i64> {
    if let Some(existing) = query_scalar_i64(
        conn,
        r#"SELECT "id" FROM "metadataset" WHERE "blockset_id" = ?"#,
        vec![blockset_id.into()],
    )
    .await?
    {
        return Ok(existing);
    }
    exec_insert(
        conn,
        r#"INSERT INTO "metadataset" ("blockset_id") VALUES (?)"#,
        vec![blockset_id.into()],
    )
    .await
}

async fn get_or_create_file_lookup<C: ConnectionTrait>(
    conn: &C,
    prefix_id: i64,
    name: &str,
    blockset_id: i64,
    metadata_id: Option<i64>,
) -> Result<i64> {
    if let Some(existing) = query_scalar_i64(
        conn,
        r#"
        SELECT "id" FROM "file_lookup"
        WHERE "path_prefix_id" = ? AND "name" = ? AND "blockset_id" = ? AND "metadata_id" IS ?
        "#,
        vec![
            prefix_id.into(),
            name.to_string().into(),
            blockset_id.into(),
            Value::BigInt(metadata_id),
        ],
    )
    .await?
    {
        return Ok(existing);
    }
    exec_insert(
        conn,
        r#"INSERT INTO "file_lookup" ("path_prefix_id", "name", "blockset_id", "metadata_id") VALUES (?, ?, ?, ?)"#,
        vec![
            prefix_id.into(),
            name.to_string().into(),
            blockset_id.into(),
            Value::BigInt(metadata_id),
        ],
    )
    .await
}

/// Upsert a block sighting. A fresh `(hash, size)` inserts; a known block
/// with an unresolved location adopts the given volume. Returns whether
/// the row was new.
async fn update_block<C: ConnectionTrait>(
    conn: &C,
    hash: &str,
    size: i64,
    volume_id: i64,
) -> Result<bool> {
    let rows = query_rows(
        conn,
        r#"SELECT "id", "volume_id" FROM "block" WHERE "hash" = ? AND "size" = ?"#,
        vec![hash.to_string().into(), size.into()],
    )
    .await?;
    match rows.first() {
        None => {
            exec(
                conn,
                r#"INSERT INTO "block" ("hash", "size", "volume_id") VALUES (?, ?, ?)"#,
                vec![hash.to_string().into(), size.into(), volume_id.into()],
            )
            .await?;
            Ok(true)
        }
        Some(row) => {
            let id: i64 = row.try_get_by_index(0)?;
            let current: i64 = row.try_get_by_index(1)?;
            if current < 0 && volume_id >= 0 {
                exec(
                    conn,
                    r#"UPDATE "block" SET "volume_id" = ? WHERE "id" = ?"#,
                    vec![volume_id.into(), id.into()],
                )
                .await?;
            }
            Ok(false)
        }
    }
}

async fn ingest_index_volume<C: ConnectionTrait>(
    conn: &C,
    registry: &CodecRegistry,
    index_volume_id: i64,
    reader: &mut IndexVolumeReader,
    stats: &mut RecreateStats,
) -> Result<()> {
    for declared in reader.volumes()? {
        let block_volume_id = match find_volume_by_name(conn, &declared.filename).await? {
            Some(volume) => volume.id,
            None => {
                let (probed_id, probed_name) =
                    probe::probe_for_renamed(conn, registry, &declared.filename).await?;
                if probed_id >= 0 {
                    stats.probed_renames += 1;
                    tracing::info!(
                        "Index references {} which now lives as {}",
                        declared.filename,
                        probed_name
                    );
                    probed_id
                } else {
                    // Not on the remote under any codec combination:
                    // placeholder so damage assessment can name it.
                    stats.placeholder_volumes += 1;
                    tracing::warn!(
                        "Index references missing block volume {}",
                        declared.filename
                    );
                    register_remote_volume(
                        conn,
                        &declared.filename,
                        VolumeKind::Blocks,
                        VolumeState::Temporary,
                        declared.length,
                        Some(declared.hash.clone()),
                    )
                    .await?
                }
            }
        };

        for (hash, size) in &declared.blocks {
            update_block(conn, hash, *size, block_volume_id).await?;
        }
        exec(
            conn,
            r#"INSERT OR IGNORE INTO "index_block_link" ("index_volume_id", "block_volume_id") VALUES (?, ?)"#,
            vec![index_volume_id.into(), block_volume_id.into()],
        )
        .await?;
    }

    for blocklist in reader.blocklists(BLOCK_HASH_BYTES)? {
        if !blocklist.valid {
            stats.malformed_blocklists += 1;
            tracing::warn!("Malformed blocklist {} in index volume", blocklist.hash);
            continue;
        }
        buffer_blocklist(conn, &blocklist.hash, &blocklist.block_hashes).await?;
    }
    Ok(())
}

/// Buffer one blocklist expansion unless it is already known.
async fn buffer_blocklist<C: ConnectionTrait>(
    conn: &C,
    blocklist_hash: &str,
    block_hashes: &[String],
) -> Result<bool> {
    let known = query_scalar_i64(
        conn,
        r#"SELECT COUNT(*) FROM "temp_blocklist_hash" WHERE "blocklist_hash" = ?"#,
        vec![blocklist_hash.to_string().into()],
    )
    .await?
    .unwrap_or(0);
    if known > 0 {
        return Ok(false);
    }
    for (index, hash) in block_hashes.iter().enumerate() {
        exec(
            conn,
            r#"INSERT INTO "temp_blocklist_hash" ("blocklist_hash", "block_hash", "hash_index") VALUES (?, ?, ?)"#,
            vec![
                blocklist_hash.to_string().into(),
                hash.clone().into(),
                (index as i64).into(),
            ],
        )
        .await?;
    }
    Ok(true)
}

/// Reconcile buffered blocklists and small-blockset links into actual
/// blockset entries. Returns the number of entries created.
pub async fn reconcile<C: ConnectionTrait>(conn: &C, options: &Options) -> Result<u64> {
    if options.experimental_recreate {
        add_block_and_blockset_entry_from_temp(conn, options).await
    } else {
        find_missing_blocklist_hashes(conn, options).await
    }
}

/// Default reconciliation: complete blocksets from blocks that already
/// have rows, via the small-blockset links and the buffered blocklists.
pub async fn find_missing_blocklist_hashes<C: ConnectionTrait>(
    conn: &C,
    options: &Options,
) -> Result<u64> {
    let hashes_per_block = options.hashes_per_block();

    let small = exec(
        conn,
        r#"
        INSERT OR IGNORE INTO "blockset_entry" ("blockset_id", "entry_index", "block_id")
        SELECT sbl."blockset_id", 0, b."id"
        FROM "small_blockset_link" sbl
        JOIN "blockset" bs ON bs."id" = sbl."blockset_id"
        JOIN "block" b ON b."hash" = sbl."block_hash" AND b."size" = bs."length"
        WHERE NOT EXISTS (
            SELECT 1 FROM "blockset_entry" be WHERE be."blockset_id" = sbl."blockset_id"
        )
        "#,
        vec![],
    )
    .await?;

    let listed = exec(
        conn,
        r#"
        INSERT OR IGNORE INTO "blockset_entry" ("blockset_id", "entry_index", "block_id")
        SELECT blh."blockset_id",
               blh."hash_index" * ? + tbh."hash_index",
               b."id"
        FROM "blocklist_hash" blh
        JOIN "temp_blocklist_hash" tbh ON tbh."blocklist_hash" = blh."hash"
        JOIN "block" b ON b."hash" = tbh."block_hash"
        WHERE NOT EXISTS (
            SELECT 1 FROM "blockset_entry" be
            WHERE be."blockset_id" = blh."blockset_id"
              AND be."entry_index" = blh."hash_index" * ? + tbh."hash_index"
        )
        "#,
        vec![hashes_per_block.into(), hashes_per_block.into()],
    )
    .await?;

    Ok(small + listed)
}

/// Experimental reconciliation: additionally synthesise block rows whose
/// existence and size are implied by the blocklists (location unresolved,
/// `volume_id = -1`), then fill entries the same way.
pub async fn add_block_and_blockset_entry_from_temp<C: ConnectionTrait>(
    conn: &C,
    options: &Options,
) -> Result<u64> {
    let hashes_per_block = options.hashes_per_block();
    let blocksize = options.blocksize;

    exec(
        conn,
        r#"
        INSERT INTO "block" ("hash", "size", "volume_id")
        SELECT DISTINCT tbh."block_hash",
               MIN(?, bs."length" - (blh."hash_index" * ? + tbh."hash_index") * ?),
               -1
        FROM "blocklist_hash" blh
        JOIN "blockset" bs ON bs."id" = blh."blockset_id"
        JOIN "temp_blocklist_hash" tbh ON tbh."blocklist_hash" = blh."hash"
        WHERE NOT EXISTS (
            SELECT 1 FROM "block" b
            WHERE b."hash" = tbh."block_hash"
              AND b."size" = MIN(?, bs."length" - (blh."hash_index" * ? + tbh."hash_index") * ?)
        )
        "#,
        vec![
            blocksize.into(),
            hashes_per_block.into(),
            blocksize.into(),
            blocksize.into(),
            hashes_per_block.into(),
            blocksize.into(),
        ],
    )
    .await?;

    exec(
        conn,
        r#"
        INSERT INTO "block" ("hash", "size", "volume_id")
        SELECT DISTINCT sbl."block_hash", bs."length", -1
        FROM "small_blockset_link" sbl
        JOIN "blockset" bs ON bs."id" = sbl."blockset_id"
        WHERE bs."length" > 0
          AND NOT EXISTS (
            SELECT 1 FROM "block" b
            WHERE b."hash" = sbl."block_hash" AND b."size" = bs."length"
        )
        "#,
        vec![],
    )
    .await?;

    find_missing_blocklist_hashes(conn, options).await
}

/// The block volumes each recovery pass should download:
/// 0. volumes known to hold a required, still-missing blocklist;
/// 1. candidate volumes while blocksets remain incomplete;
/// 2. everything readable that was not downloaded yet.
async fn get_missing_blocklist_volumes(
    db: &DatabaseConnection,
    pass: u8,
    processed: &HashSet<i64>,
) -> Result<Vec<(i64, String, i64)>> {
    let missing_blocklists = query_scalar_i64(
        db,
        r#"
        SELECT COUNT(DISTINCT blh."hash") FROM "blocklist_hash" blh
        WHERE blh."hash" NOT IN (SELECT DISTINCT "blocklist_hash" FROM "temp_blocklist_hash")
        "#,
        vec![],
    )
    .await?
    .unwrap_or(0);
    let incomplete_blocksets = query_scalar_i64(
        db,
        r#"
        SELECT COUNT(*) FROM "blockset" bs
        WHERE bs."length" > 0 AND (
            SELECT COALESCE(SUM(b."size"), 0)
            FROM "blockset_entry" be
            JOIN "block" b ON b."id" = be."block_id"
            WHERE be."blockset_id" = bs."id"
        ) != bs."length"
        "#,
        vec![],
    )
    .await?
    .unwrap_or(0);

    let sql = match pass {
        0 => {
            if missing_blocklists == 0 {
                return Ok(Vec::new());
            }
            r#"
            SELECT DISTINCT rv."id", rv."name", rv."size"
            FROM "remote_volume" rv
            JOIN "block" b ON b."volume_id" = rv."id"
            WHERE rv."kind" = 'Blocks' AND rv."state" IN ('Uploaded', 'Verified')
              AND b."hash" IN (
                SELECT blh."hash" FROM "blocklist_hash" blh
                WHERE blh."hash" NOT IN (SELECT DISTINCT "blocklist_hash" FROM "temp_blocklist_hash")
              )
            ORDER BY rv."id"
            "#
        }
        1 => {
            if incomplete_blocksets == 0 {
                return Ok(Vec::new());
            }
            r#"
            SELECT DISTINCT rv."id", rv."name", rv."size"
            FROM "remote_volume" rv
            WHERE rv."kind" = 'Blocks' AND rv."state" IN ('Uploaded', 'Verified')
              AND rv."id" IN (
                SELECT "volume_id" FROM "block"
                WHERE "id" NOT IN (SELECT "block_id" FROM "blockset_entry")
              )
            ORDER BY rv."id"
            "#
        }
        _ => {
            if missing_blocklists == 0 && incomplete_blocksets == 0 {
                return Ok(Vec::new());
            }
            r#"
            SELECT rv."id", rv."name", rv."size"
            FROM "remote_volume" rv
            WHERE rv."kind" = 'Blocks' AND rv."state" IN ('Uploaded', 'Verified')
            ORDER BY rv."id"
            "#
        }
    };

    let rows = query_rows(db, sql, vec![]).await?;
    let mut volumes = Vec::new();
    for row in rows {
        let id: i64 = row.try_get_by_index(0)?;
        if processed.contains(&id) {
            continue;
        }
        volumes.push((id, row.try_get_by_index(1)?, row.try_get_by_index(2)?));
    }
    Ok(volumes)
}

#[allow(clippy::too_many_arguments)]
async fn ingest_block_volume(
    db: &DatabaseConnection,
    backend: Arc<dyn Backend>,
    options: &Options,
    registry: &CodecRegistry,
    volume_id: i64,
    name: &str,
    size: i64,
    stats: &mut RecreateStats,
) -> Result<u64> {
    let tmp = tempfile::NamedTempFile::new()?;
    backend
        .get(name, None, Some(size), tmp.path())
        .await
        .map_err(|e| EngineError::remote(name, e.to_string()))?;

    let parsed = filename::parse(name)
        .ok_or_else(|| EngineError::corrupt(name, "unparseable volume name"))?;
    let (path, _guard) = decrypt_if_needed(tmp.path(), &parsed, registry, options)?;
    let mut reader =
        BlockVolumeReader::open(&path).map_err(|e| EngineError::corrupt(name, e.to_string()))?;
    stats.block_volumes += 1;

    let tx = Tx::begin(db, false).await?;
    let contents: Vec<(String, i64)> = reader.blocks().to_vec();
    for (hash, block_size) in &contents {
        update_block(&*tx, hash, *block_size, volume_id).await?;
    }

    // Recover whatever required blocklists this volume physically holds.
    let missing = query_rows(
        &*tx,
        r#"
        SELECT DISTINCT blh."hash" FROM "blocklist_hash" blh
        WHERE blh."hash" NOT IN (SELECT DISTINCT "blocklist_hash" FROM "temp_blocklist_hash")
        "#,
        vec![],
    )
    .await?;
    let present: HashSet<&str> = contents.iter().map(|(h, _)| h.as_str()).collect();
    for row in missing {
        let hash: String = row.try_get_by_index(0)?;
        if !present.contains(hash.as_str()) {
            continue;
        }
        match reader.read_blocklist(&hash, BLOCK_HASH_BYTES) {
            Ok(block_hashes) => {
                buffer_blocklist(&*tx, &hash, &block_hashes).await?;
            }
            Err(e) => {
                stats.malformed_blocklists += 1;
                tracing::warn!("Malformed blocklist {} in {}: {}", hash, name, e);
            }
        }
    }

    let changed = reconcile(&*tx, options).await?;
    tx.commit(&format!("recreate block volume {}", name)).await?;
    Ok(changed)
}

/// Mark block volumes that no block references as `Deleting`.
async fn cleanup_missing_volumes<C: ConnectionTrait>(conn: &C) -> Result<u64> {
    exec(
        conn,
        r#"
        UPDATE "remote_volume" SET "state" = 'Deleting'
        WHERE "kind" = 'Blocks'
          AND "state" != 'Deleted'
          AND "id" NOT IN (SELECT DISTINCT "volume_id" FROM "block")
          AND "id" NOT IN (SELECT DISTINCT "volume_id" FROM "duplicate_block")
        "#,
        vec![],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::local::LocalBackend;
    use crate::volume::block_volume::BlockVolumeWriter;
    use crate::volume::filelist::{FileListEntry, FilelistVolumeWriter};
    use crate::volume::index_volume::IndexVolumeWriter;
    use crate::volume::{concat_hashes, hash_bytes};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const BS: i64 = 64;

    fn test_options() -> Options {
        Options::new("coffer").with_blocksize(BS)
    }

    fn ts(hour: u32) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 0).unwrap()
    }

    struct Fixture {
        backend: Arc<LocalBackend>,
        block_name: String,
    }

    /// A remote with one block volume, two snapshots sharing its data,
    /// and (optionally) an index volume (optionally carrying blocklists).
    ///
    /// Content: a 150-byte file (3 blocks, 2 blocklist hashes), an
    /// 11-byte file, a folder, and one shared metadata record.
    async fn build_remote(
        remote_dir: &TempDir,
        with_index: bool,
        with_blocklists: bool,
        extra_missing_volume: bool,
    ) -> Fixture {
        let options = test_options();
        let staging = remote_dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let backend = Arc::new(LocalBackend::new(remote_dir.path().join("store")));

        let big: Vec<u8> = (0..150u32).map(|i| (i * 7 % 251) as u8).collect();
        let (b1, b2, b3) = (&big[0..64], &big[64..128], &big[128..150]);
        let (h1, h2, h3) = (hash_bytes(b1), hash_bytes(b2), hash_bytes(b3));
        let big_hash = hash_bytes(&big);
        let l1 = concat_hashes(&[h1.clone(), h2.clone()]).unwrap();
        let l2 = concat_hashes(&[h3.clone()]).unwrap();
        let (lh1, lh2) = (hash_bytes(&l1), hash_bytes(&l2));
        let small = b"hello world";
        let sh = hash_bytes(small);
        let meta = br#"{"mode":"0644"}"#;
        let mh = hash_bytes(meta);

        let block_name = filename::generate(
            "coffer", VolumeKind::Blocks, &filename::new_guid(), ts(1), "zip", None,
        );
        let index_name = filename::generate(
            "coffer", VolumeKind::Index, &filename::new_guid(), ts(3), "zip", None,
        );

        let block_path = staging.join("block.zip");
        let mut writer = BlockVolumeWriter::create(&block_path, &options).unwrap();
        writer.add_block(&h1, b1).unwrap();
        writer.add_block(&h2, b2).unwrap();
        writer.add_block(&h3, b3).unwrap();
        writer.add_block(&lh1, &l1).unwrap();
        writer.add_block(&lh2, &l2).unwrap();
        writer.add_block(&sh, small).unwrap();
        writer.add_block(&mh, meta).unwrap();
        writer.finish().unwrap();
        let (volume_hash, volume_size) = backend.put(&block_name, &block_path).await.unwrap();

        for (n, hour) in [(1u32, 2u32), (2, 4)] {
            let files_name = filename::generate(
                "coffer", VolumeKind::Files, &filename::new_guid(), ts(hour), "zip", None,
            );
            let path = staging.join(format!("files-{}.zip", n));
            let mut writer = FilelistVolumeWriter::create(&path, &options, true);
            writer.add_entry(FileListEntry {
                kind: FileEntryKind::Folder,
                path: "data/".to_string(),
                time: ts(hour).timestamp(),
                size: 0,
                hash: None,
                blocklist_hashes: Vec::new(),
                blockhash: None,
                metahash: Some(mh.clone()),
                metasize: meta.len() as i64,
                meta_blocklist_hashes: Vec::new(),
                meta_blockhash: Some(mh.clone()),
            });
            writer.add_entry(FileListEntry {
                kind: FileEntryKind::File,
                path: "data/big.bin".to_string(),
                time: ts(hour).timestamp(),
                size: big.len() as i64,
                hash: Some(big_hash.clone()),
                blocklist_hashes: vec![lh1.clone(), lh2.clone()],
                blockhash: None,
                metahash: Some(mh.clone()),
                metasize: meta.len() as i64,
                meta_blocklist_hashes: Vec::new(),
                meta_blockhash: Some(mh.clone()),
            });
            writer.add_entry(FileListEntry {
                kind: FileEntryKind::File,
                path: "data/small.txt".to_string(),
                time: ts(hour).timestamp(),
                size: small.len() as i64,
                hash: Some(sh.clone()),
                blocklist_hashes: Vec::new(),
                blockhash: Some(sh.clone()),
                metahash: Some(mh.clone()),
                metasize: meta.len() as i64,
                meta_blocklist_hashes: Vec::new(),
                meta_blockhash: Some(mh.clone()),
            });
            writer.finish().unwrap();
            backend.put(&files_name, &path).await.unwrap();
        }

        if with_index {
            let path = staging.join("index.zip");
            let mut writer = IndexVolumeWriter::create(&path, &options).unwrap();
            let blocks: Vec<(String, i64)> = vec![
                (h1.clone(), 64),
                (h2.clone(), 64),
                (h3.clone(), 22),
                (lh1.clone(), 64),
                (lh2.clone(), 32),
                (sh.clone(), 11),
                (mh.clone(), 15),
            ];
            writer
                .add_volume(&block_name, &volume_hash, volume_size, &blocks)
                .unwrap();
            if with_blocklists {
                writer.add_blocklist(&lh1, &[h1.clone(), h2.clone()]).unwrap();
                writer.add_blocklist(&lh2, &[h3.clone()]).unwrap();
            }
            if extra_missing_volume {
                let ghost = filename::generate(
                    "coffer", VolumeKind::Blocks, &filename::new_guid(), ts(5), "zip", None,
                );
                writer
                    .add_volume(&ghost, "ghosthash", 42, &[(hash_bytes(b"ghost"), 5)])
                    .unwrap();
            }
            writer.finish().unwrap();
            backend.put(&index_name, &path).await.unwrap();
        }

        Fixture {
            backend,
            block_name,
        }
    }

    async fn count(db: &DatabaseConnection, sql: &str) -> i64 {
        query_scalar_i64(db, sql, vec![]).await.unwrap().unwrap()
    }

    async fn assert_rebuilt(db_path: &Path, fixture: &Fixture) {
        let db = db::open_database(db_path, None).await.unwrap();
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "fileset""#).await, 2);
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "file_lookup""#).await, 3);
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "blockset""#).await, 3);
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "blockset_entry""#).await, 5);
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "metadataset""#).await, 1);
        assert_eq!(
            count(&db, r#"SELECT COUNT(*) FROM "fileset_entry""#).await,
            6
        );

        // Every block resolved to the real block volume.
        let volume = find_volume_by_name(&db, &fixture.block_name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            count(&db, r#"SELECT COUNT(*) FROM "block" WHERE "volume_id" < 0"#).await,
            0
        );
        assert_eq!(
            query_scalar_i64(
                &db,
                r#"SELECT COUNT(*) FROM "block" WHERE "volume_id" = ?"#,
                vec![volume.id.into()],
            )
            .await
            .unwrap()
            .unwrap(),
            7
        );

        // And the structural verifier agrees.
        consistency::verify_consistency(&db, BS, BLOCK_HASH_BYTES, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recreate_from_complete_indexes() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, true, true, false).await;
        let db_path = db_dir.path().join("rebuilt.sqlite");

        let stats = run_recreate(
            &db_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(stats.filelists, 2);
        assert_eq!(stats.index_volumes, 1);
        // With complete indexes no block volume needs downloading.
        assert_eq!(stats.block_volumes, 0);
        assert_eq!(stats.malformed_blocklists, 0);
        assert_rebuilt(&db_path, &fixture).await;
    }

    #[tokio::test]
    async fn test_recreate_index_without_blocklists_downloads_blocks() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, true, false, false).await;
        let db_path = db_dir.path().join("rebuilt.sqlite");

        let stats = run_recreate(
            &db_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap();

        // Pass 0 finds the volume holding the missing blocklists.
        assert_eq!(stats.block_volumes, 1);
        assert_rebuilt(&db_path, &fixture).await;
    }

    #[tokio::test]
    async fn test_recreate_without_index_volumes() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, false, false, false).await;
        let db_path = db_dir.path().join("rebuilt.sqlite");

        let stats = run_recreate(
            &db_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(stats.index_volumes, 0);
        // Only the final catch-all pass can find the volume.
        assert_eq!(stats.block_volumes, 1);
        assert_rebuilt(&db_path, &fixture).await;
    }

    #[tokio::test]
    async fn test_experimental_reconciliation_matches_default() {
        let remote_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, true, true, false).await;

        let default_dir = TempDir::new().unwrap();
        let default_path = default_dir.path().join("a.sqlite");
        run_recreate(
            &default_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap();

        let experimental_dir = TempDir::new().unwrap();
        let experimental_path = experimental_dir.path().join("b.sqlite");
        let mut options = test_options();
        options.experimental_recreate = true;
        run_recreate(
            &experimental_path,
            fixture.backend.clone(),
            &options,
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap();

        // Both reconciliation paths produce the same relational shape.
        let a = db::open_database(&default_path, None).await.unwrap();
        let b = db::open_database(&experimental_path, None).await.unwrap();
        for sql in [
            r#"SELECT COUNT(*) FROM "fileset""#,
            r#"SELECT COUNT(*) FROM "file_lookup""#,
            r#"SELECT COUNT(*) FROM "blockset""#,
            r#"SELECT COUNT(*) FROM "blockset_entry""#,
            r#"SELECT COUNT(*) FROM "block""#,
        ] {
            assert_eq!(count(&a, sql).await, count(&b, sql).await, "{}", sql);
        }
        assert_rebuilt(&experimental_path, &fixture).await;
    }

    #[tokio::test]
    async fn test_recreate_registers_placeholder_for_lost_volume() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, true, true, true).await;
        let db_path = db_dir.path().join("rebuilt.sqlite");

        let stats = run_recreate(
            &db_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(stats.placeholder_volumes, 1);

        // The ghost volume's block is unreferenced, so cleanup pushed it
        // to the deleted pool and queued the placeholder for removal.
        let db = db::open_database(&db_path, None).await.unwrap();
        assert_eq!(
            count(&db, r#"SELECT COUNT(*) FROM "remote_volume" WHERE "state" = 'Deleting'"#).await,
            1
        );
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "deleted_block""#).await, 1);
    }

    #[tokio::test]
    async fn test_recreate_refuses_existing_target() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, true, true, false).await;
        let db_path = db_dir.path().join("existing.sqlite");
        std::fs::write(&db_path, b"already here").unwrap();

        let err = run_recreate(
            &db_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::User { id, .. } if id == ids::RECREATE_TARGET_EXISTS));
    }

    #[tokio::test]
    async fn test_recreate_empty_and_wrong_prefix() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(remote_dir.path().join("store")));

        let err = run_recreate(
            &db_dir.path().join("a.sqlite"),
            backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap_err();
        match err {
            EngineError::User { id, message } => {
                assert_eq!(id, ids::EMPTY_REMOTE_LOCATION);
                assert!(message.contains("empty"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Same remote with volumes under another prefix: same identifier,
        // but the message points at the prefix mismatch.
        let staging = remote_dir.path().join("file");
        std::fs::write(&staging, b"x").unwrap();
        let other = filename::generate(
            "otherprefix", VolumeKind::Files, &filename::new_guid(), ts(1), "zip", None,
        );
        backend.put(&other, &staging).await.unwrap();

        let err = run_recreate(
            &db_dir.path().join("b.sqlite"),
            backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap_err();
        match err {
            EngineError::User { id, message } => {
                assert_eq!(id, ids::EMPTY_REMOTE_LOCATION);
                assert!(message.contains("prefix"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recreate_requires_passphrase_for_encrypted_remote() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(remote_dir.path().join("store")));

        let staging = remote_dir.path().join("file");
        std::fs::write(&staging, b"x").unwrap();
        let encrypted = filename::generate(
            "coffer", VolumeKind::Files, &filename::new_guid(), ts(1), "zip", Some("aes"),
        );
        backend.put(&encrypted, &staging).await.unwrap();

        let err = run_recreate(
            &db_dir.path().join("a.sqlite"),
            backend,
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::User { id, .. } if id == ids::MISSING_PASSPHRASE));
    }

    #[tokio::test]
    async fn test_recreate_with_filelist_filter() {
        let remote_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let fixture = build_remote(&remote_dir, true, true, false).await;
        let db_path = db_dir.path().join("partial.sqlite");

        let stats = run_recreate(
            &db_path,
            fixture.backend.clone(),
            &test_options(),
            &CodecRegistry::new(),
            &ProgressToken::noop(),
            Some(&[ts(4).timestamp()]),
        )
        .await
        .unwrap();
        assert_eq!(stats.filelists, 1);

        let db = db::open_database(&db_path, None).await.unwrap();
        assert_eq!(count(&db, r#"SELECT COUNT(*) FROM "fileset""#).await, 1);
    }
}
