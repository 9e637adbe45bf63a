//! Structural verification of the index database.
//!
//! Run after recreate and by scheduled maintenance. Any violation is an
//! `InconsistentDatabase` error: the database cannot be trusted and the
//! caller should repair or rebuild it.

use sea_orm::ConnectionTrait;

use crate::error::{EngineError, Result};

use super::{query_rows, query_scalar_i64};

fn expected_block_count(length: i64, blocksize: i64) -> i64 {
    if length <= 0 {
        0
    } else {
        (length + blocksize - 1) / blocksize
    }
}

fn expected_blocklist_count(length: i64, blocksize: i64, hashes_per_block: i64) -> i64 {
    let blocks = expected_block_count(length, blocksize);
    if blocks <= 1 {
        0
    } else {
        (blocks + hashes_per_block - 1) / hashes_per_block
    }
}

/// Verify every blockset's length, block count, and blocklist-hash count,
/// that no blockset entry dangles, and (optionally) that every fileset
/// still has its file-list volume.
pub async fn verify_consistency<C: ConnectionTrait>(
    conn: &C,
    blocksize: i64,
    hash_bytes: usize,
    verify_filelists: bool,
) -> Result<()> {
    let hashes_per_block = blocksize / hash_bytes as i64;

    let dangling = query_scalar_i64(
        conn,
        r#"
        SELECT COUNT(*)
        FROM "blockset_entry" be
        LEFT JOIN "block" b ON b."id" = be."block_id"
        WHERE b."id" IS NULL
        "#,
        vec![],
    )
    .await?
    .unwrap_or(0);
    if dangling != 0 {
        return Err(EngineError::InconsistentDatabase(format!(
            "{} blockset entries reference missing blocks",
            dangling
        )));
    }

    let rows = query_rows(
        conn,
        r#"
        SELECT bs."id", bs."length",
               COALESCE(SUM(b."size"), 0) AS total_size,
               COUNT(be."block_id") AS block_count
        FROM "blockset" bs
        LEFT JOIN "blockset_entry" be ON be."blockset_id" = bs."id"
        LEFT JOIN "block" b ON b."id" = be."block_id"
        GROUP BY bs."id", bs."length"
        "#,
        vec![],
    )
    .await?;
    for row in rows {
        let id: i64 = row.try_get_by_index(0)?;
        let length: i64 = row.try_get_by_index(1)?;
        let total_size: i64 = row.try_get_by_index(2)?;
        let block_count: i64 = row.try_get_by_index(3)?;

        if total_size != length {
            return Err(EngineError::InconsistentDatabase(format!(
                "blockset {} declares length {} but its blocks sum to {}",
                id, length, total_size
            )));
        }
        let expected = expected_block_count(length, blocksize);
        if block_count != expected {
            return Err(EngineError::InconsistentDatabase(format!(
                "blockset {} has {} blocks, expected {}",
                id, block_count, expected
            )));
        }
    }

    let rows = query_rows(
        conn,
        r#"
        SELECT bs."id", bs."length", COUNT(blh."hash") AS list_count
        FROM "blockset" bs
        LEFT JOIN "blocklist_hash" blh ON blh."blockset_id" = bs."id"
        GROUP BY bs."id", bs."length"
        "#,
        vec![],
    )
    .await?;
    for row in rows {
        let id: i64 = row.try_get_by_index(0)?;
        let length: i64 = row.try_get_by_index(1)?;
        let list_count: i64 = row.try_get_by_index(2)?;

        let ok = if length <= blocksize {
            // Single-block blocksets may carry one redundant blocklist
            // hash or none at all.
            list_count == 0 || list_count == 1
        } else {
            list_count == expected_blocklist_count(length, blocksize, hashes_per_block)
        };
        if !ok {
            return Err(EngineError::InconsistentDatabase(format!(
                "blockset {} (length {}) has {} blocklist hashes",
                id, length, list_count
            )));
        }
    }

    if verify_filelists {
        let orphan_filesets = query_scalar_i64(
            conn,
            r#"
            SELECT COUNT(*)
            FROM "fileset" f
            LEFT JOIN "remote_volume" rv ON rv."id" = f."volume_id" AND rv."kind" = 'Files'
            WHERE rv."id" IS NULL
            "#,
            vec![],
        )
        .await?
        .unwrap_or(0);
        if orphan_filesets != 0 {
            return Err(EngineError::InconsistentDatabase(format!(
                "{} filesets lack a file-list volume",
                orphan_filesets
            )));
        }
    }

    Ok(())
}
