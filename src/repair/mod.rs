//! Damage assessment after remote loss.
//!
//! When block volumes disappear from the remote (or blocks never got a
//! resolved location during recreate), the filesets referencing them can
//! no longer be restored in full. `list_broken_files` names them, and
//! `mark_missing_volumes` queues the lost volumes for deletion so a purge
//! can drop the affected file versions.

use std::collections::HashSet;
use std::sync::Arc;

use sea_orm::ConnectionTrait;

use crate::db::query_rows;
use crate::error::Result;
use crate::prune::list_fileset_versions;
use crate::remote::Backend;

/// One fileset with restore damage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokenFileset {
    pub fileset_id: i64,
    pub timestamp: i64,
    /// User-visible backup version.
    pub version: usize,
    pub paths: Vec<String>,
}

/// Volumes recorded as readable in the index but absent from the remote
/// listing.
pub async fn detect_missing_volumes<C: ConnectionTrait>(
    conn: &C,
    backend: Arc<dyn Backend>,
) -> Result<Vec<i64>> {
    let present: HashSet<String> = backend
        .list()
        .await?
        .into_iter()
        .map(|f| f.name)
        .collect();
    let rows = query_rows(
        conn,
        r#"SELECT "id", "name" FROM "remote_volume" WHERE "state" IN ('Uploaded', 'Verified')"#,
        vec![],
    )
    .await?;
    let mut missing = Vec::new();
    for row in rows {
        let id: i64 = row.try_get_by_index(0)?;
        let name: String = row.try_get_by_index(1)?;
        if !present.contains(&name) {
            tracing::warn!("Remote volume {} is missing from the backend", name);
            missing.push(id);
        }
    }
    Ok(missing)
}

/// Mark the given volumes `Deleting` so the next purge removes their
/// index rows and any remote leftovers.
pub async fn mark_missing_volumes<C: ConnectionTrait>(
    conn: &C,
    volume_ids: &[i64],
) -> Result<u64> {
    if volume_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; volume_ids.len()].join(", ");
    crate::db::exec(
        conn,
        &format!(
            r#"UPDATE "remote_volume" SET "state" = 'Deleting' WHERE "id" IN ({})"#,
            placeholders
        ),
        volume_ids.iter().map(|id| (*id).into()).collect(),
    )
    .await
}

/// Filesets containing files whose data or metadata depends on a block in
/// one of `missing_volume_ids`, or on a block with no resolved volume at
/// all. Ordered by timestamp descending (newest first).
pub async fn list_broken_files<C: ConnectionTrait>(
    conn: &C,
    missing_volume_ids: &[i64],
) -> Result<Vec<BrokenFileset>> {
    let versions = list_fileset_versions(conn).await?;

    let id_list = if missing_volume_ids.is_empty() {
        "-1".to_string()
    } else {
        vec!["?"; missing_volume_ids.len()].join(", ")
    };
    let sql = format!(
        r#"
        SELECT DISTINCT f."id", f."timestamp", pp."prefix" || fl."name" AS path
        FROM "fileset" f
        JOIN "fileset_entry" fe ON fe."fileset_id" = f."id"
        JOIN "file_lookup" fl ON fl."id" = fe."file_id"
        JOIN "path_prefix" pp ON pp."id" = fl."path_prefix_id"
        WHERE EXISTS (
            SELECT 1 FROM "blockset_entry" be
            JOIN "block" b ON b."id" = be."block_id"
            WHERE be."blockset_id" = fl."blockset_id"
              AND (b."volume_id" < 0 OR b."volume_id" IN ({ids}))
        ) OR EXISTS (
            SELECT 1 FROM "metadataset" m
            JOIN "blockset_entry" be ON be."blockset_id" = m."blockset_id"
            JOIN "block" b ON b."id" = be."block_id"
            WHERE m."id" = fl."metadata_id"
              AND (b."volume_id" < 0 OR b."volume_id" IN ({ids}))
        )
        ORDER BY f."timestamp" DESC, path ASC
        "#,
        ids = id_list
    );
    let mut values: Vec<sea_orm::Value> = Vec::new();
    if !missing_volume_ids.is_empty() {
        // The id list appears twice in the statement.
        for _ in 0..2 {
            values.extend(missing_volume_ids.iter().map(|id| sea_orm::Value::from(*id)));
        }
    }

    let rows = query_rows(conn, &sql, values).await?;
    let mut broken: Vec<BrokenFileset> = Vec::new();
    for row in rows {
        let fileset_id: i64 = row.try_get_by_index(0)?;
        let timestamp: i64 = row.try_get_by_index(1)?;
        let path: String = row.try_get_by_index(2)?;
        if let Some(last) = broken.last_mut() {
            if last.fileset_id == fileset_id {
                last.paths.push(path);
                continue;
            }
        }
        let version = versions
            .iter()
            .find(|v| v.fileset_id == fileset_id)
            .map(|v| v.version)
            .unwrap_or(0);
        broken.push(BrokenFileset {
            fileset_id,
            timestamp,
            version,
            paths: vec![path],
        });
    }
    Ok(broken)
}
