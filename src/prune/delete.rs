//! Delete handler: evaluates retention, drops the condemned filesets,
//! and removes their file-list volumes from the remote.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::db::tx::Tx;
use crate::error::Result;
use crate::options::Options;
use crate::progress::ProgressToken;
use crate::remote::Backend;

use super::compact::purge_deleting_volumes;
use super::dropper::drop_filesets;
use super::retention::{evaluate, RetentionPlan};
use super::{list_fileset_versions, FilesetVersion};

#[derive(Debug, Default)]
pub struct DeleteResult {
    /// Filesets removed from the index, as `(version, timestamp)`.
    pub dropped: Vec<(usize, i64)>,
    pub remote_deleted: Vec<String>,
}

pub async fn run_delete(
    db: &DatabaseConnection,
    backend: Arc<dyn Backend>,
    options: &Options,
    plan: &RetentionPlan,
    token: &ProgressToken,
) -> Result<DeleteResult> {
    token.rendezvous().await?;

    let tx = Tx::begin(db, options.dry_run).await?;
    let filesets = list_fileset_versions(&*tx).await?;
    let deletable: Vec<FilesetVersion> =
        evaluate(&filesets, plan, chrono::Utc::now().timestamp());
    if deletable.is_empty() {
        tracing::info!("Retention kept all {} filesets", filesets.len());
        tx.rollback().await?;
        return Ok(DeleteResult::default());
    }

    tracing::info!(
        "Retention condemned {} of {} filesets",
        deletable.len(),
        filesets.len()
    );
    let timestamps: Vec<i64> = deletable.iter().map(|f| f.timestamp).collect();
    let pending = drop_filesets(&*tx, &timestamps).await?;
    tx.commit("drop filesets per retention").await?;

    for (name, size) in &pending {
        tracing::debug!("File-list volume {} ({} bytes) pending deletion", name, size);
    }
    let remote_deleted = purge_deleting_volumes(db, backend, options, token).await?;

    Ok(DeleteResult {
        dropped: deletable.into_iter().map(|f| (f.version, f.timestamp)).collect(),
        remote_deleted,
    })
}
