use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use crate::error::MigratorError;

const SCHEMA_VERSION: &str = "1";
const POOL_SIZE: u32 = 8;

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS app_versions (
    app_id INTEGER NOT NULL,
    version TEXT NOT NULL,
    schema INTEGER NOT NULL,
    location TEXT NOT NULL,
    created INTEGER NOT NULL,
    PRIMARY KEY (app_id, version)
);

CREATE TABLE IF NOT EXISTS appspaces (
    appspace_id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    app_id INTEGER NOT NULL,
    app_version TEXT NOT NULL,
    schema INTEGER NOT NULL DEFAULT 0,
    data_location TEXT NOT NULL,
    created INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_jobs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    appspace_id INTEGER NOT NULL,
    to_version TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL,
    started INTEGER,
    finished INTEGER,
    error TEXT
);

-- At most one unstarted job per appspace
CREATE UNIQUE INDEX IF NOT EXISTS idx_migration_jobs_pending
    ON migration_jobs (appspace_id) WHERE started IS NULL;

CREATE INDEX IF NOT EXISTS idx_migration_jobs_appspace
    ON migration_jobs (appspace_id, created);

INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', '1');
"#;

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Pooled handle to the migrator's SQLite database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, MigratorError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;",
            )?;
            conn.busy_timeout(Duration::from_secs(5))
        });

        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
        let db = Self { pool };

        db.ensure_schema()?;
        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, MigratorError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back if it fails
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, MigratorError>
    where
        F: FnOnce(&Connection) -> Result<T, MigratorError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    error!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn ensure_schema(&self) -> Result<(), MigratorError> {
        let conn = self.get_connection()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(MigratorError::Error(format!(
                "Database schema version mismatch: found {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(MigratorError::Error("Database schema version missing".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("nested").join("migrator.db")).unwrap();
        let conn = db.get_connection().unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('meta', 'app_versions', 'appspaces', 'migration_jobs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("migrator.db");
        drop(Database::open(&path).unwrap());
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn test_schema_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("migrator.db");
        {
            let db = Database::open(&path).unwrap();
            let conn = db.get_connection().unwrap();
            conn.execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
                .unwrap();
        }
        assert!(Database::open(&path).is_err());
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("migrator.db")).unwrap();
        let conn = db.get_connection().unwrap();

        let result: Result<(), MigratorError> = Database::immediate_transaction(&conn, |c| {
            c.execute("INSERT INTO meta (key, value) VALUES ('marker', 'x')", [])?;
            Err(MigratorError::Error("boom".into()))
        });
        assert!(result.is_err());

        let marker: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'marker'", [], |row| row.get(0))
            .optional()
            .unwrap();
        assert_eq!(marker, None);
    }
}
