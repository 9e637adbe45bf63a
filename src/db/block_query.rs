//! Cached "is this block live, and where" lookup.
//!
//! Constructed once per compact cycle and reused for every block the
//! cycle touches; the statement text is prepared once and bound per call.
//! Not shared across tasks — each operation owns its own instance.

use sea_orm::ConnectionTrait;

use crate::error::Result;

const USE_BLOCK_SQL: &str =
    r#"SELECT "volume_id" FROM "block" WHERE "hash" = ? AND "size" = ?"#;

pub struct BlockQuery {
    sql: &'static str,
}

impl BlockQuery {
    pub fn new() -> Self {
        Self { sql: USE_BLOCK_SQL }
    }

    /// - no `(hash, size)` row: `false` — the block is absent;
    /// - `expected_volume_id == -1`: `true` — caller only asks liveness;
    /// - otherwise: whether the stored volume matches the expected one.
    pub async fn use_block<C: ConnectionTrait>(
        &self,
        conn: &C,
        hash: &str,
        size: i64,
        expected_volume_id: i64,
    ) -> Result<bool> {
        let row = conn
            .query_one(sea_orm::Statement::from_sql_and_values(
                conn.get_database_backend(),
                self.sql,
                vec![hash.to_string().into(), size.into()],
            ))
            .await?;
        match row {
            None => Ok(false),
            Some(_) if expected_volume_id == -1 => Ok(true),
            Some(row) => {
                let volume_id: i64 = row.try_get_by_index(0)?;
                Ok(volume_id == expected_volume_id)
            }
        }
    }
}

impl Default for BlockQuery {
    fn default() -> Self {
        Self::new()
    }
}
