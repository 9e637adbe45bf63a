//! Block reassignment ahead of volume deletion.
//!
//! Before a block volume can be removed, every block whose primary copy
//! lives there must be redirected to a surviving duplicate. The counts of
//! affected blocks, reassignments, and consumed duplicates must agree
//! exactly; any mismatch means a block would lose its last copy, which is
//! unrecoverable and aborts the transaction.

use sea_orm::ConnectionTrait;

use crate::db::tx::TempTable;
use crate::db::exec;
use crate::error::{EngineError, Result};

/// Redirect every block whose primary copy is in `victim_volume` to a
/// duplicate copy outside `other_victims`, then clear the victim's
/// duplicate records. Only meaningful for `Blocks` volumes.
pub async fn prepare_for_delete<C: ConnectionTrait>(
    conn: &C,
    victim_volume: i64,
    other_victims: &[i64],
) -> Result<()> {
    let affected = TempTable::create_from_select(
        conn,
        "reassign-affected",
        r#"SELECT "id" AS "block_id" FROM "block" WHERE "volume_id" = ?"#,
        vec![victim_volume.into()],
    )
    .await?;
    let excluded = TempTable::from_i64_list(conn, "reassign-excluded", other_victims).await?;
    let replacements = TempTable::create_from_select(
        conn,
        "reassign-replacement",
        &format!(
            r#"
            SELECT "block_id", MAX("volume_id") AS "volume_id"
            FROM "duplicate_block"
            WHERE "block_id" IN (SELECT "block_id" FROM "{affected}")
              AND "volume_id" NOT IN ({excluded})
            GROUP BY "block_id"
            "#,
            affected = affected.name(),
            excluded = excluded.in_subquery(),
        ),
        vec![],
    )
    .await?;

    let result = reassign_inner(conn, victim_volume, &affected, &replacements).await;

    replacements.drop_now(conn).await.ok();
    excluded.drop_now(conn).await.ok();
    affected.drop_now(conn).await.ok();
    result
}

async fn reassign_inner<C: ConnectionTrait>(
    conn: &C,
    victim_volume: i64,
    affected: &TempTable,
    replacements: &TempTable,
) -> Result<()> {
    let affected_count = affected.count(conn).await?;
    if affected_count == 0 {
        return Ok(());
    }
    let replacement_count = replacements.count(conn).await?;

    let updated = exec(
        conn,
        &format!(
            r#"
            UPDATE "block" SET "volume_id" = (
                SELECT r."volume_id" FROM "{repl}" r WHERE r."block_id" = "block"."id"
            )
            WHERE "volume_id" = ?
              AND "id" IN (SELECT "block_id" FROM "{repl}")
            "#,
            repl = replacements.name()
        ),
        vec![victim_volume.into()],
    )
    .await? as i64;

    let consumed = exec(
        conn,
        &format!(
            r#"
            DELETE FROM "duplicate_block"
            WHERE EXISTS (
                SELECT 1 FROM "{repl}" r
                WHERE r."block_id" = "duplicate_block"."block_id"
                  AND r."volume_id" = "duplicate_block"."volume_id"
            )
            "#,
            repl = replacements.name()
        ),
        vec![],
    )
    .await? as i64;

    if affected_count != updated || replacement_count != consumed || updated != consumed {
        return Err(EngineError::InconsistentDatabase(format!(
            "volume {} reassignment mismatch: {} blocks affected, {} replacements, {} updated, {} duplicates consumed",
            victim_volume, affected_count, replacement_count, updated, consumed
        )));
    }

    // Remaining duplicate records for the victim are copies we are about
    // to destroy with the volume; they carry no recovery value.
    exec(
        conn,
        r#"DELETE FROM "duplicate_block" WHERE "volume_id" = ?"#,
        vec![victim_volume.into()],
    )
    .await?;

    tracing::debug!(
        "Reassigned {} blocks away from volume {}",
        updated,
        victim_volume
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{exec, init_database, query_rows, query_scalar_i64};
    use sea_orm::DatabaseConnection;
    use tempfile::TempDir;

    async fn seed(db: &DatabaseConnection) {
        // Victim volume 1 holds b1, b2. Duplicates: b1 in volumes 2 and 3,
        // b2 in volume 2.
        exec(db, r#"
            INSERT INTO "remote_volume" ("id", "name", "kind", "state", "size") VALUES
            (1, 'v1', 'Blocks', 'Uploaded', 10),
            (2, 'v2', 'Blocks', 'Uploaded', 10),
            (3, 'v3', 'Blocks', 'Uploaded', 10)
        "#, vec![]).await.unwrap();
        exec(db, r#"
            INSERT INTO "block" ("id", "hash", "size", "volume_id") VALUES
            (1, 'b1', 100, 1),
            (2, 'b2', 100, 1)
        "#, vec![]).await.unwrap();
        exec(db, r#"
            INSERT INTO "duplicate_block" ("block_id", "volume_id") VALUES
            (1, 2), (1, 3), (2, 2)
        "#, vec![]).await.unwrap();
    }

    async fn block_volume(db: &DatabaseConnection, block_id: i64) -> i64 {
        query_scalar_i64(
            db,
            r#"SELECT "volume_id" FROM "block" WHERE "id" = ?"#,
            vec![block_id.into()],
        )
        .await
        .unwrap()
        .unwrap()
    }

    #[tokio::test]
    async fn test_reassignment_picks_highest_surviving_volume() {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("db.sqlite")).await.unwrap();
        seed(&db).await;

        prepare_for_delete(&db, 1, &[]).await.unwrap();

        // b1 goes to max(2, 3) = 3; b2 to its only duplicate, 2.
        assert_eq!(block_volume(&db, 1).await, 3);
        assert_eq!(block_volume(&db, 2).await, 2);

        // No duplicate row references the victim volume.
        let remaining = query_scalar_i64(
            &db,
            r#"SELECT COUNT(*) FROM "duplicate_block" WHERE "volume_id" = 1"#,
            vec![],
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(remaining, 0);

        // b1's unused duplicate in volume 2 survives as a valid extra copy.
        let rows = query_rows(
            &db,
            r#"SELECT "block_id", "volume_id" FROM "duplicate_block" ORDER BY "block_id""#,
            vec![],
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_get_by_index::<i64>(0).unwrap(), 1);
        assert_eq!(rows[0].try_get_by_index::<i64>(1).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_every_block_keeps_exactly_one_live_copy() {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("db.sqlite")).await.unwrap();
        seed(&db).await;

        prepare_for_delete(&db, 1, &[]).await.unwrap();

        // After the operation every block previously in the victim has a
        // single primary copy in a non-victim volume.
        let rows = query_rows(
            &db,
            r#"SELECT "id", "volume_id" FROM "block" ORDER BY "id""#,
            vec![],
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        for row in rows {
            let volume: i64 = row.try_get_by_index(1).unwrap();
            assert_ne!(volume, 1);
        }
    }

    #[tokio::test]
    async fn test_other_victims_excluded_as_sources() {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("db.sqlite")).await.unwrap();
        seed(&db).await;

        // Volume 3 is also being deleted; b1 must fall back to volume 2.
        prepare_for_delete(&db, 1, &[3]).await.unwrap();
        assert_eq!(block_volume(&db, 1).await, 2);
        assert_eq!(block_volume(&db, 2).await, 2);
    }

    #[tokio::test]
    async fn test_missing_replacement_is_fatal() {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("db.sqlite")).await.unwrap();
        seed(&db).await;
        // b2's only duplicate sits in volume 2, which is also a victim.
        let err = prepare_for_delete(&db, 1, &[2]).await.unwrap_err();
        assert!(matches!(err, EngineError::InconsistentDatabase(_)));
    }

    #[tokio::test]
    async fn test_empty_victim_is_noop() {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("db.sqlite")).await.unwrap();
        seed(&db).await;

        // Volume 2 holds no primary copies.
        prepare_for_delete(&db, 2, &[]).await.unwrap();
        assert_eq!(block_volume(&db, 1).await, 1);
        let dupes = query_scalar_i64(&db, r#"SELECT COUNT(*) FROM "duplicate_block""#, vec![])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dupes, 3);
    }
}
