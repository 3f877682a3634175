use std::fs;
use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::{IndexError, QueryContext};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE annotation_index (
    annotation_id   TEXT NOT NULL,
    server_id       TEXT NULL,
    document_id     TEXT NOT NULL,
    page_number     INTEGER NOT NULL,
    PRIMARY KEY (annotation_id, document_id)
);

CREATE INDEX annotation_index_document_idx
    ON annotation_index (document_id, page_number);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// The on-disk SQLite database backing the annotation index.
#[derive(Debug)]
pub struct MetaDb {
    conn: Connection,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| IndexError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|source| IndexError::Open { path: path.to_path_buf(), source })?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .query_context("configuring sqlite pragmas")?;

        Self::from_connection(conn)
    }

    /// A private, non-durable database. Used by tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory()
            .map_err(|source| IndexError::Open { path: ":memory:".into(), source })?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, IndexError> {
        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64, IndexError> {
        current_schema_version(&self.conn)
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<(), IndexError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .query_context("ensuring the schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64, IndexError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .query_context("reading the current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<(), IndexError> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let migration_error = |source| IndexError::Migration { version: *version, source };
        let tx = conn.transaction().map_err(migration_error)?;
        tx.execute_batch(sql).map_err(migration_error)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .map_err(migration_error)?;
        tx.commit().map_err(migration_error)?;
        current_version = *version;
    }

    Ok(())
}
