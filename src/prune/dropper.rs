//! Fileset removal with full orphan cascade.
//!
//! The cascade order is mandatory: entries before files, files before
//! metadata, metadata before blocksets, blocksets before their entries
//! and blocklist hashes, and only then blocks. Reversing any pair would
//! leave dangling references mid-transaction and corrupt the wasted-space
//! accounting the compact engine builds on.

use sea_orm::ConnectionTrait;

use crate::db::tx::TempTable;
use crate::db::{exec, query_rows};
use crate::error::{EngineError, Result};

/// Remove the filesets with the given timestamps and everything only they
/// referenced. Returns `(name, size)` for every file-list volume now in
/// state `Deleting`, ready for remote removal.
///
/// Must be called inside a transaction; a count mismatch aborts with
/// `InconsistentDatabase` and the caller rolls back.
pub async fn drop_filesets<C: ConnectionTrait>(
    conn: &C,
    timestamps: &[i64],
) -> Result<Vec<(String, i64)>> {
    let wanted = TempTable::from_i64_list(conn, "del-fileset-times", timestamps).await?;
    let result = drop_filesets_inner(conn, timestamps, &wanted).await;
    wanted.drop_now(conn).await.ok();
    result
}

async fn drop_filesets_inner<C: ConnectionTrait>(
    conn: &C,
    timestamps: &[i64],
    wanted: &TempTable,
) -> Result<Vec<(String, i64)>> {
    let deleted = exec(
        conn,
        &format!(
            r#"DELETE FROM "fileset" WHERE "timestamp" IN ({})"#,
            wanted.in_subquery()
        ),
        vec![],
    )
    .await?;
    if deleted != timestamps.len() as u64 {
        return Err(EngineError::InconsistentDatabase(format!(
            "requested deletion of {} filesets but {} matched",
            timestamps.len(),
            deleted
        )));
    }

    // Orphan cascade, in dependency order.
    exec(
        conn,
        r#"DELETE FROM "fileset_entry" WHERE "fileset_id" NOT IN (SELECT "id" FROM "fileset")"#,
        vec![],
    )
    .await?;
    exec(
        conn,
        r#"DELETE FROM "change_journal_data" WHERE "fileset_id" NOT IN (SELECT "id" FROM "fileset")"#,
        vec![],
    )
    .await?;
    exec(
        conn,
        r#"DELETE FROM "file_lookup" WHERE "id" NOT IN (SELECT "file_id" FROM "fileset_entry")"#,
        vec![],
    )
    .await?;
    exec(
        conn,
        r#"DELETE FROM "metadataset" WHERE "id" NOT IN (SELECT "metadata_id" FROM "file_lookup" WHERE "metadata_id" IS NOT NULL)"#,
        vec![],
    )
    .await?;
    exec(
        conn,
        r#"
        DELETE FROM "blockset" WHERE "id" NOT IN (
            SELECT "blockset_id" FROM "file_lookup"
            UNION
            SELECT "blockset_id" FROM "metadataset"
        )
        "#,
        vec![],
    )
    .await?;
    exec(
        conn,
        r#"DELETE FROM "blockset_entry" WHERE "blockset_id" NOT IN (SELECT "id" FROM "blockset")"#,
        vec![],
    )
    .await?;
    exec(
        conn,
        r#"DELETE FROM "blocklist_hash" WHERE "blockset_id" NOT IN (SELECT "id" FROM "blockset")"#,
        vec![],
    )
    .await?;

    move_unreferenced_blocks_to_deleted(conn).await?;

    let transitioned = exec(
        conn,
        r#"
        UPDATE "remote_volume" SET "state" = 'Deleting'
        WHERE "kind" = 'Files'
          AND "state" IN ('Uploaded', 'Verified', 'Temporary', 'Deleting')
          AND "id" NOT IN (SELECT "volume_id" FROM "fileset")
        "#,
        vec![],
    )
    .await?;
    if transitioned != timestamps.len() as u64 {
        return Err(EngineError::InconsistentDatabase(format!(
            "dropped {} filesets but {} file-list volumes transitioned to Deleting",
            timestamps.len(),
            transitioned
        )));
    }

    let rows = query_rows(
        conn,
        r#"SELECT "name", "size" FROM "remote_volume" WHERE "kind" = 'Files' AND "state" = 'Deleting'"#,
        vec![],
    )
    .await?;
    let mut volumes = Vec::with_capacity(rows.len());
    for row in rows {
        volumes.push((row.try_get_by_index(0)?, row.try_get_by_index(1)?));
    }
    tracing::info!(
        "Dropped {} filesets, {} file-list volumes pending deletion",
        timestamps.len(),
        volumes.len()
    );
    Ok(volumes)
}

/// Move blocks that nothing references anymore into `deleted_block`,
/// preserving hash, size, and volume. A block is unreferenced iff no
/// blockset entry points at it and no blocklist hash shares its hash.
///
/// Shared with the recreate engine's cleanup phase.
pub(crate) async fn move_unreferenced_blocks_to_deleted<C: ConnectionTrait>(
    conn: &C,
) -> Result<u64> {
    exec(
        conn,
        r#"
        INSERT INTO "deleted_block" ("hash", "size", "volume_id")
        SELECT "hash", "size", "volume_id" FROM "block"
        WHERE "id" NOT IN (SELECT "block_id" FROM "blockset_entry")
          AND "hash" NOT IN (SELECT "hash" FROM "blocklist_hash")
        "#,
        vec![],
    )
    .await?;
    let removed = exec(
        conn,
        r#"
        DELETE FROM "block"
        WHERE "id" NOT IN (SELECT "block_id" FROM "blockset_entry")
          AND "hash" NOT IN (SELECT "hash" FROM "blocklist_hash")
        "#,
        vec![],
    )
    .await?;
    Ok(removed)
}
