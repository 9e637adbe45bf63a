//! Local index database over SQLite.
//!
//! Schema creation and the set-oriented engine queries use raw SQL through
//! the SeaORM connection; entities cover point lookups and inserts. The
//! storage engine is not asked to enforce foreign keys — every cascade is
//! explicit and count-checked in the engines.

pub mod block_query;
pub mod consistency;
pub mod entities;
pub mod legacy;
pub mod tx;

use std::path::Path;

use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, EntityTrait, QueryFilter, Statement, Value,
};

use crate::error::{ids, EngineError, Result};
use crate::remote::{VolumeKind, VolumeState};
use entities::remote_volume;

/// Bumped whenever the schema changes; newer databases refuse to open.
pub const DB_SCHEMA_VERSION: i64 = 7;

/// Execute a parameterised statement, returning the affected row count.
pub async fn exec<C: ConnectionTrait>(conn: &C, sql: &str, values: Vec<Value>) -> Result<u64> {
    let result = conn
        .execute(Statement::from_sql_and_values(
            conn.get_database_backend(),
            sql,
            values,
        ))
        .await?;
    Ok(result.rows_affected())
}

/// Run a parameterised query and collect all rows.
pub async fn query_rows<C: ConnectionTrait>(
    conn: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<sea_orm::QueryResult>> {
    Ok(conn
        .query_all(Statement::from_sql_and_values(
            conn.get_database_backend(),
            sql,
            values,
        ))
        .await?)
}

/// Run a query expected to yield a single integer (COUNT, SUM, ...).
pub async fn query_scalar_i64<C: ConnectionTrait>(
    conn: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Option<i64>> {
    let row = conn
        .query_one(Statement::from_sql_and_values(
            conn.get_database_backend(),
            sql,
            values,
        ))
        .await?;
    match row {
        Some(row) => Ok(Some(row.try_get_by_index::<i64>(0)?)),
        None => Ok(None),
    }
}

async fn connect(db_path: &Path) -> Result<DatabaseConnection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to index database: {}", db_url);

    // A single connection: deferred transactions and temporary tables both
    // assume they stay on the connection that created them.
    let mut options = ConnectOptions::new(db_url);
    options.max_connections(1).sqlx_logging(false);
    Ok(Database::connect(options).await?)
}

/// Create (or open) the index database at `db_path` and ensure the schema
/// exists.
pub async fn init_database(db_path: &Path) -> Result<DatabaseConnection> {
    let db = connect(db_path).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// Open an existing index database: legacy-encryption sniff, smoke test,
/// and schema version gate.
pub async fn open_database(
    db_path: &Path,
    passphrase: Option<&str>,
) -> Result<DatabaseConnection> {
    if !db_path.is_file() {
        return Err(EngineError::user(
            ids::FILE_MISSING,
            format!("database not found: {}", db_path.display()),
        ));
    }
    legacy::ensure_plaintext(db_path, passphrase)?;

    let db = connect(db_path).await?;
    smoke_test(&db).await?;

    let version = query_scalar_i64(
        &db,
        r#"SELECT COALESCE(MAX("version"), 0) FROM "version""#,
        vec![],
    )
    .await?
    .unwrap_or(0);
    if version > DB_SCHEMA_VERSION {
        return Err(EngineError::user(
            ids::DOWNGRADE_BLOCKED,
            format!(
                "database schema version {} is newer than supported version {}",
                version, DB_SCHEMA_VERSION
            ),
        ));
    }
    Ok(db)
}

/// Cheap structural probe used after opening a database of uncertain
/// provenance.
pub async fn smoke_test(db: &DatabaseConnection) -> Result<()> {
    query_scalar_i64(db, "SELECT COUNT(*) FROM sqlite_master", vec![]).await?;
    Ok(())
}

/// Pre-downgrade safeguard: newer builds store `enc-v1:` secrets that an
/// older build would silently mangle. Returns a description per blocker.
pub async fn downgrade_blockers(db: &DatabaseConnection) -> Result<Vec<String>> {
    let mut blockers = Vec::new();
    let tables = query_rows(
        db,
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('option', 'backup')",
        vec![],
    )
    .await?;
    for row in tables {
        let table: String = row.try_get_by_index(0)?;
        let (sql, what) = match table.as_str() {
            "option" => (
                r#"SELECT COUNT(*) FROM "option" WHERE "value" LIKE 'enc-v1:%'"#,
                "option values",
            ),
            _ => (
                r#"SELECT COUNT(*) FROM "backup" WHERE "target_url" LIKE 'enc-v1:%'"#,
                "backup target URLs",
            ),
        };
        let count = query_scalar_i64(db, sql, vec![]).await?.unwrap_or(0);
        if count > 0 {
            blockers.push(format!("{} encrypted {}", count, what));
        }
    }
    Ok(blockers)
}

/// Create all tables if they don't exist.
async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS "remote_volume" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "name" TEXT NOT NULL UNIQUE,
            "kind" TEXT NOT NULL,
            "state" TEXT NOT NULL,
            "size" INTEGER NOT NULL DEFAULT -1,
            "hash" TEXT,
            "delete_grace_period" INTEGER NOT NULL DEFAULT 0
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_remote_volume_state" ON "remote_volume" ("kind", "state")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "block" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "hash" TEXT NOT NULL,
            "size" INTEGER NOT NULL,
            "volume_id" INTEGER NOT NULL
        )
        "#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS "idx_block_hash_size" ON "block" ("hash", "size")"#,
        r#"CREATE INDEX IF NOT EXISTS "idx_block_volume" ON "block" ("volume_id")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "deleted_block" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "hash" TEXT NOT NULL,
            "size" INTEGER NOT NULL,
            "volume_id" INTEGER NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_deleted_block_volume" ON "deleted_block" ("volume_id")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "duplicate_block" (
            "block_id" INTEGER NOT NULL,
            "volume_id" INTEGER NOT NULL,
            PRIMARY KEY ("block_id", "volume_id")
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS "blockset" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "full_hash" TEXT NOT NULL,
            "length" INTEGER NOT NULL
        )
        "#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS "idx_blockset_hash_length" ON "blockset" ("full_hash", "length")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "blockset_entry" (
            "blockset_id" INTEGER NOT NULL,
            "entry_index" INTEGER NOT NULL,
            "block_id" INTEGER NOT NULL,
            PRIMARY KEY ("blockset_id", "entry_index")
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_blockset_entry_block" ON "blockset_entry" ("block_id")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "blocklist_hash" (
            "blockset_id" INTEGER NOT NULL,
            "hash_index" INTEGER NOT NULL,
            "hash" TEXT NOT NULL,
            PRIMARY KEY ("blockset_id", "hash_index")
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_blocklist_hash_hash" ON "blocklist_hash" ("hash")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "metadataset" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "blockset_id" INTEGER NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_metadataset_blockset" ON "metadataset" ("blockset_id")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "path_prefix" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "prefix" TEXT NOT NULL UNIQUE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS "file_lookup" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "path_prefix_id" INTEGER NOT NULL,
            "name" TEXT NOT NULL,
            "blockset_id" INTEGER NOT NULL,
            "metadata_id" INTEGER
        )
        "#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS "idx_file_lookup_identity" ON "file_lookup" ("path_prefix_id", "name", "blockset_id", "metadata_id")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "fileset" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "timestamp" INTEGER NOT NULL,
            "volume_id" INTEGER NOT NULL,
            "is_full_backup" INTEGER NOT NULL DEFAULT 1
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_fileset_timestamp" ON "fileset" ("timestamp")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "fileset_entry" (
            "fileset_id" INTEGER NOT NULL,
            "file_id" INTEGER NOT NULL,
            "last_modified" INTEGER NOT NULL,
            PRIMARY KEY ("fileset_id", "file_id")
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_fileset_entry_file" ON "fileset_entry" ("file_id")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "change_journal_data" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "fileset_id" INTEGER NOT NULL,
            "volume_name" TEXT NOT NULL,
            "journal_id" INTEGER NOT NULL,
            "next_usn" INTEGER NOT NULL,
            "config_hash" TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS "index_block_link" (
            "index_volume_id" INTEGER NOT NULL,
            "block_volume_id" INTEGER NOT NULL,
            PRIMARY KEY ("index_volume_id", "block_volume_id")
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS "small_blockset_link" (
            "blockset_id" INTEGER NOT NULL,
            "block_hash" TEXT NOT NULL,
            PRIMARY KEY ("blockset_id", "block_hash")
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS "temp_blocklist_hash" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "blocklist_hash" TEXT NOT NULL,
            "block_hash" TEXT NOT NULL,
            "hash_index" INTEGER NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS "idx_temp_blocklist_hash" ON "temp_blocklist_hash" ("blocklist_hash")"#,
        r#"
        CREATE TABLE IF NOT EXISTS "version" (
            "id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "version" INTEGER NOT NULL
        )
        "#,
    ];

    for sql in statements {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            sql.to_string(),
        ))
        .await?;
    }

    exec(
        db,
        r#"INSERT INTO "version" ("id", "version") SELECT 1, ? WHERE NOT EXISTS (SELECT 1 FROM "version")"#,
        vec![DB_SCHEMA_VERSION.into()],
    )
    .await?;

    tracing::debug!("Index database schema initialized");
    Ok(())
}

/// Insert a remote volume row, returning its id.
pub async fn register_remote_volume<C: ConnectionTrait>(
    conn: &C,
    name: &str,
    kind: VolumeKind,
    state: VolumeState,
    size: i64,
    hash: Option<String>,
) -> Result<i64> {
    let model = remote_volume::ActiveModel {
        name: Set(name.to_string()),
        kind: Set(kind.as_str().to_string()),
        state: Set(state.as_str().to_string()),
        size: Set(size),
        hash: Set(hash),
        delete_grace_period: Set(0),
        ..Default::default()
    };
    let inserted = model.insert(conn).await?;
    Ok(inserted.id)
}

/// Intern a directory prefix, returning its id.
pub async fn get_or_create_path_prefix<C: ConnectionTrait>(conn: &C, prefix: &str) -> Result<i64> {
    use entities::path_prefix;
    if let Some(found) = path_prefix::Entity::find()
        .filter(path_prefix::Column::Prefix.eq(prefix))
        .one(conn)
        .await?
    {
        return Ok(found.id);
    }
    let inserted = path_prefix::ActiveModel {
        prefix: Set(prefix.to_string()),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    Ok(inserted.id)
}

/// Split a path into its interned prefix (up to and including the last
/// separator) and the trailing name. Folder paths end in a separator and
/// get an empty name.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => path.split_at(pos + 1),
        None => ("", path),
    }
}

pub async fn find_volume_by_name<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> Result<Option<remote_volume::Model>> {
    Ok(remote_volume::Entity::find()
        .filter(remote_volume::Column::Name.eq(name))
        .one(conn)
        .await?)
}

pub async fn set_volume_state<C: ConnectionTrait>(
    conn: &C,
    volume_id: i64,
    state: VolumeState,
) -> Result<()> {
    exec(
        conn,
        r#"UPDATE "remote_volume" SET "state" = ? WHERE "id" = ?"#,
        vec![state.as_str().into(), volume_id.into()],
    )
    .await?;
    Ok(())
}
