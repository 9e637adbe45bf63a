//! Compact orchestration.
//!
//! Builds the wasted-space report, decides what to do, redirects block
//! primaries away from doomed volumes, pairs index volumes with their
//! block volumes, and performs the remote deletions in an order that never
//! leaves an index file pointing at a deleted block file. The database
//! changes are committed before any remote file is touched, so a crash
//! between the two leaves only harmless `Deleting` markers behind.

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::db::tx::Tx;
use crate::db::{exec, query_rows};
use crate::error::{EngineError, Result};
use crate::options::Options;
use crate::progress::ProgressToken;
use crate::remote::Backend;

use super::reassign::prepare_for_delete;
use super::reorder::{load_index_links, reorder_deletable, DeletableVolume};
use super::report::{CompactReport, CompactThresholds};
use super::wasted::collect_volume_usage;

#[derive(Debug, Default)]
pub struct CompactResult {
    pub reclaimed_volumes: Vec<String>,
    /// Volumes worth rewriting; handed to the volume rewriter upstream.
    pub compact_candidates: Vec<String>,
    pub deleted_remote_files: Vec<String>,
}

fn thresholds(options: &Options) -> CompactThresholds {
    CompactThresholds {
        volsize: options.volsize,
        waste_threshold: options.waste_threshold,
        small_file_size: options.small_file_size,
        max_small_file_count: options.max_small_file_count,
    }
}

/// Run one compact cycle.
pub async fn run_compact(
    db: &DatabaseConnection,
    backend: Arc<dyn Backend>,
    options: &Options,
    token: &ProgressToken,
) -> Result<CompactResult> {
    token.rendezvous().await?;

    let tx = Tx::begin(db, options.dry_run).await?;
    let usage = collect_volume_usage(&*tx).await?;
    let report = CompactReport::new(usage, thresholds(options));
    tracing::info!("Compact report: {}", report.describe());

    let mut result = CompactResult {
        compact_candidates: report
            .compactable_volumes()
            .iter()
            .map(|v| v.name.clone())
            .collect(),
        ..Default::default()
    };

    if !report.should_reclaim() {
        if !report.should_compact() {
            tracing::info!("Compacting not required");
        }
        tx.rollback().await?;
        return Ok(result);
    }

    // Fully-dead volumes can go without rewriting anything; their blocks
    // only need their primaries redirected to surviving duplicates.
    let victims: Vec<DeletableVolume> = report
        .cleanable_volumes()
        .iter()
        .map(|v| DeletableVolume {
            volume_id: v.volume_id,
            name: v.name.clone(),
            size: v.compressed_size,
        })
        .collect();
    let victim_ids: Vec<i64> = victims.iter().map(|v| v.volume_id).collect();

    for victim in &victims {
        token.rendezvous().await?;
        prepare_for_delete(&*tx, victim.volume_id, &victim_ids).await?;
    }

    let links = load_index_links(&*tx).await?;
    let index_volumes = load_index_volumes_for(&*tx, &victim_ids).await?;
    let ordered = reorder_deletable(victims, &links, &index_volumes);

    for volume in &ordered {
        exec(
            &*tx,
            r#"UPDATE "remote_volume" SET "state" = 'Deleting' WHERE "id" = ?"#,
            vec![volume.volume_id.into()],
        )
        .await?;
    }
    result.reclaimed_volumes = ordered.iter().map(|v| v.name.clone()).collect();

    // Reassignments must be durable before the first remote delete.
    tx.commit("compact block reassignment").await?;

    result.deleted_remote_files =
        delete_remote_volumes(db, backend, &ordered, options, token).await?;
    Ok(result)
}

/// Remote-delete every volume already in state `Deleting` whose grace
/// period has passed (file-list volumes dropped with their filesets, and
/// leftovers from an interrupted earlier run).
pub async fn purge_deleting_volumes(
    db: &DatabaseConnection,
    backend: Arc<dyn Backend>,
    options: &Options,
    token: &ProgressToken,
) -> Result<Vec<String>> {
    let now = chrono::Utc::now().timestamp();
    let rows = query_rows(
        db,
        r#"
        SELECT "id", "name", "size" FROM "remote_volume"
        WHERE "state" = 'Deleting' AND "delete_grace_period" <= ?
        ORDER BY "id"
        "#,
        vec![now.into()],
    )
    .await?;
    let mut volumes = Vec::with_capacity(rows.len());
    for row in rows {
        volumes.push(DeletableVolume {
            volume_id: row.try_get_by_index(0)?,
            name: row.try_get_by_index(1)?,
            size: row.try_get_by_index(2)?,
        });
    }
    delete_remote_volumes(db, backend, &volumes, options, token).await
}

async fn load_index_volumes_for(
    conn: &sea_orm::DatabaseTransaction,
    victim_ids: &[i64],
) -> Result<HashMap<i64, DeletableVolume>> {
    if victim_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; victim_ids.len()].join(", ");
    let rows = query_rows(
        conn,
        &format!(
            r#"
            SELECT DISTINCT rv."id", rv."name", rv."size"
            FROM "remote_volume" rv
            JOIN "index_block_link" ibl ON ibl."index_volume_id" = rv."id"
            WHERE ibl."block_volume_id" IN ({})
              AND rv."kind" = 'Index'
              AND rv."state" IN ('Uploaded', 'Verified')
            "#,
            placeholders
        ),
        victim_ids.iter().map(|id| (*id).into()).collect(),
    )
    .await?;
    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        let volume = DeletableVolume {
            volume_id: row.try_get_by_index(0)?,
            name: row.try_get_by_index(1)?,
            size: row.try_get_by_index(2)?,
        };
        map.insert(volume.volume_id, volume);
    }
    Ok(map)
}

/// Delete the given volumes from the remote, in order, marking each one
/// `Deleted` as it goes. Grace periods defer the physical delete; dry-run
/// only narrates. Cancellation flushes the backend before surfacing.
async fn delete_remote_volumes(
    db: &DatabaseConnection,
    backend: Arc<dyn Backend>,
    volumes: &[DeletableVolume],
    options: &Options,
    token: &ProgressToken,
) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for volume in volumes {
        if let Err(e) = token.rendezvous().await {
            if matches!(e, EngineError::Cancelled) {
                backend.wait_for_empty().await?;
            }
            return Err(e);
        }

        if options.delete_grace_seconds > 0 {
            let release = chrono::Utc::now().timestamp() + options.delete_grace_seconds;
            let tx = Tx::begin(db, options.dry_run).await?;
            exec(
                &*tx,
                r#"UPDATE "remote_volume" SET "delete_grace_period" = ? WHERE "id" = ? AND "delete_grace_period" = 0"#,
                vec![release.into(), volume.volume_id.into()],
            )
            .await?;
            tx.commit("defer volume delete for grace period").await?;
            tracing::info!(
                "Volume {} held back for {}s grace",
                volume.name,
                options.delete_grace_seconds
            );
            continue;
        }

        if options.dry_run {
            tracing::info!("would-delete: {} ({} bytes)", volume.name, volume.size);
            continue;
        }

        backend.delete(&volume.name, volume.size, false).await?;
        let tx = Tx::begin(db, false).await?;
        exec(
            &*tx,
            r#"UPDATE "remote_volume" SET "state" = 'Deleted' WHERE "id" = ?"#,
            vec![volume.volume_id.into()],
        )
        .await?;
        tx.commit("mark volume deleted").await?;
        tracing::info!("Deleted remote volume {}", volume.name);
        deleted.push(volume.name.clone());
    }
    Ok(deleted)
}
