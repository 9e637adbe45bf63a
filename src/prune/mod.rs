//! Space reclamation: retention evaluation, fileset dropping, and the
//! delete/compact machinery over partially-dead block volumes.

pub mod compact;
pub mod delete;
pub mod dropper;
pub mod reassign;
pub mod reorder;
pub mod report;
pub mod retention;
pub mod wasted;

use sea_orm::ConnectionTrait;

use crate::db::query_rows;
use crate::error::Result;

/// A fileset with its user-visible version: the zero-based index when
/// ordered by timestamp descending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesetVersion {
    pub version: usize,
    pub fileset_id: i64,
    pub timestamp: i64,
    pub is_full_backup: bool,
}

/// All filesets with their backup versions, newest first.
pub async fn list_fileset_versions<C: ConnectionTrait>(conn: &C) -> Result<Vec<FilesetVersion>> {
    let rows = query_rows(
        conn,
        r#"SELECT "id", "timestamp", "is_full_backup" FROM "fileset" ORDER BY "timestamp" DESC, "id" DESC"#,
        vec![],
    )
    .await?;
    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(version, row)| {
            Ok(FilesetVersion {
                version,
                fileset_id: row.try_get_by_index(0)?,
                timestamp: row.try_get_by_index(1)?,
                is_full_backup: row.try_get_by_index::<i64>(2)? != 0,
            })
        })
        .collect::<Result<Vec<_>>>()?)
}
