//! Deferred-write transactions and temporary scratch tables.
//!
//! Every mutating engine operation runs inside a [`Tx`]. Temporary tables
//! are named `<purpose>-<128-bit random hex>` so two operations on the
//! same connection can never collide, and each consumer drops its tables
//! on every exit path. `IN (@list)` parameters are materialised into a
//! single-column temp table and consumed as a subquery, sidestepping the
//! per-dialect bind-parameter limit.

use std::ops::Deref;

use sea_orm::{ConnectionTrait, DatabaseConnection, DatabaseTransaction, TransactionTrait, Value};

use crate::error::Result;

use super::exec;

/// A deferred transaction with dry-run support. Dropping an uncommitted
/// `Tx` rolls it back.
pub struct Tx {
    inner: DatabaseTransaction,
    dry_run: bool,
}

impl Tx {
    pub async fn begin(db: &DatabaseConnection, dry_run: bool) -> Result<Self> {
        Ok(Self {
            inner: db.begin().await?,
            dry_run,
        })
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Commit, logging `label`. In dry-run mode the transaction is rolled
    /// back instead and the commit is only narrated.
    pub async fn commit(self, label: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!("would-commit: {}", label);
            self.inner.rollback().await?;
        } else {
            tracing::debug!("commit: {}", label);
            self.inner.commit().await?;
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}

impl Deref for Tx {
    type Target = DatabaseTransaction;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A temporary table with a collision-proof random name.
pub struct TempTable {
    name: String,
}

impl TempTable {
    /// `CREATE TEMPORARY TABLE "<purpose>-<random>" (<columns>)`.
    pub async fn create<C: ConnectionTrait>(
        conn: &C,
        purpose: &str,
        columns: &str,
    ) -> Result<Self> {
        let name = format!("{}-{:032x}", purpose, rand::random::<u128>());
        exec(
            conn,
            &format!("CREATE TEMPORARY TABLE \"{}\" ({})", name, columns),
            vec![],
        )
        .await?;
        Ok(Self { name })
    }

    /// Create and populate from a SELECT in one statement.
    pub async fn create_from_select<C: ConnectionTrait>(
        conn: &C,
        purpose: &str,
        select_sql: &str,
        values: Vec<Value>,
    ) -> Result<Self> {
        let name = format!("{}-{:032x}", purpose, rand::random::<u128>());
        exec(
            conn,
            &format!("CREATE TEMPORARY TABLE \"{}\" AS {}", name, select_sql),
            values,
        )
        .await?;
        Ok(Self { name })
    }

    /// Materialise an integer list for `IN` expansion.
    pub async fn from_i64_list<C: ConnectionTrait>(
        conn: &C,
        purpose: &str,
        values: &[i64],
    ) -> Result<Self> {
        let table = Self::create(conn, purpose, "\"value\" INTEGER NOT NULL").await?;
        table
            .insert_values(conn, values.iter().map(|v| Value::from(*v)))
            .await?;
        Ok(table)
    }

    /// Materialise a string list for `IN` expansion.
    pub async fn from_string_list<C: ConnectionTrait>(
        conn: &C,
        purpose: &str,
        values: &[String],
    ) -> Result<Self> {
        let table = Self::create(conn, purpose, "\"value\" TEXT NOT NULL").await?;
        table
            .insert_values(conn, values.iter().map(|v| Value::from(v.clone())))
            .await?;
        Ok(table)
    }

    async fn insert_values<C: ConnectionTrait>(
        &self,
        conn: &C,
        values: impl Iterator<Item = Value>,
    ) -> Result<()> {
        // Chunked inserts keep us well under the bind-parameter limit.
        let values: Vec<Value> = values.collect();
        for chunk in values.chunks(500) {
            let placeholders = vec!["(?)"; chunk.len()].join(", ");
            exec(
                conn,
                &format!(
                    "INSERT INTO \"{}\" (\"value\") VALUES {}",
                    self.name, placeholders
                ),
                chunk.to_vec(),
            )
            .await?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subquery string for `IN (...)` use, selecting the single `value`
    /// column.
    pub fn in_subquery(&self) -> String {
        format!("SELECT \"value\" FROM \"{}\"", self.name)
    }

    pub async fn count<C: ConnectionTrait>(&self, conn: &C) -> Result<i64> {
        Ok(
            super::query_scalar_i64(conn, &format!("SELECT COUNT(*) FROM \"{}\"", self.name), vec![])
                .await?
                .unwrap_or(0),
        )
    }

    /// Drop the table. Consumers call this on all exit paths; the random
    /// name makes a leaked table harmless until the connection closes.
    pub async fn drop_now<C: ConnectionTrait>(self, conn: &C) -> Result<()> {
        exec(conn, &format!("DROP TABLE IF EXISTS \"{}\"", self.name), vec![]).await?;
        Ok(())
    }
}
