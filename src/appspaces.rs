use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::app_versions::AppVersion;
use crate::database::Database;
use crate::error::MigratorError;

/// A tenant's running instance of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appspace {
    pub appspace_id: i64,
    pub owner_id: i64,
    pub app_id: i64,
    pub app_version: String,
    pub data_location: String,
    pub created: i64,
}

/// An appspace whose stored schema disagrees with the schema its recorded
/// app version expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMismatch {
    pub appspace_id: i64,
    pub app_version: String,
    pub appspace_schema: i64,
    pub version_schema: i64,
}

impl Appspace {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            appspace_id: row.get(0)?,
            owner_id: row.get(1)?,
            app_id: row.get(2)?,
            app_version: row.get(3)?,
            data_location: row.get(4)?,
            created: row.get(5)?,
        })
    }

    /// New appspaces start with empty data at schema 0. Bringing the data up
    /// to the version's schema is the job of the first migration.
    pub fn create(
        conn: &Connection,
        owner_id: i64,
        app_id: i64,
        app_version: &str,
        data_location: &str,
    ) -> Result<Appspace, MigratorError> {
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO appspaces (owner_id, app_id, app_version, schema, data_location, created)
             VALUES (?, ?, ?, 0, ?, ?)",
            rusqlite::params![owner_id, app_id, app_version, data_location, now],
        )?;

        Ok(Appspace {
            appspace_id: conn.last_insert_rowid(),
            owner_id,
            app_id,
            app_version: app_version.to_owned(),
            data_location: data_location.to_owned(),
            created: now,
        })
    }

    /// Create an appspace on a version that must already be installed, along
    /// with its empty data directory. The caller queues the migration that
    /// brings its data to that version's schema.
    pub fn create_for_version(
        conn: &Connection,
        owner_id: i64,
        app_id: i64,
        app_version: &str,
        data_location: &str,
    ) -> Result<Appspace, MigratorError> {
        if AppVersion::get(conn, app_id, app_version)?.is_none() {
            return Err(MigratorError::NotFound(format!(
                "app version {} of app {}",
                app_version, app_id
            )));
        }

        fs::create_dir_all(data_location)?;
        Self::create(conn, owner_id, app_id, app_version, data_location)
    }

    pub fn get_by_id(conn: &Connection, appspace_id: i64) -> Result<Option<Appspace>, MigratorError> {
        let appspace = conn
            .query_row(
                "SELECT appspace_id, owner_id, app_id, app_version, data_location, created
                 FROM appspaces WHERE appspace_id = ?",
                [appspace_id],
                Self::from_row,
            )
            .optional()?;
        Ok(appspace)
    }

    pub fn set_app_version(
        conn: &Connection,
        appspace_id: i64,
        app_version: &str,
    ) -> Result<(), MigratorError> {
        let updated = conn.execute(
            "UPDATE appspaces SET app_version = ? WHERE appspace_id = ?",
            rusqlite::params![app_version, appspace_id],
        )?;
        Self::expect_one(updated, appspace_id)
    }

    pub fn get_schema(conn: &Connection, appspace_id: i64) -> Result<i64, MigratorError> {
        conn.query_row(
            "SELECT schema FROM appspaces WHERE appspace_id = ?",
            [appspace_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| MigratorError::NotFound(format!("appspace {}", appspace_id)))
    }

    pub fn set_schema(conn: &Connection, appspace_id: i64, schema: i64) -> Result<(), MigratorError> {
        let updated = conn.execute(
            "UPDATE appspaces SET schema = ? WHERE appspace_id = ?",
            rusqlite::params![schema, appspace_id],
        )?;
        Self::expect_one(updated, appspace_id)
    }

    /// Record a completed migration: new schema and new app version land
    /// together or not at all
    pub fn commit_migration(
        conn: &Connection,
        appspace_id: i64,
        schema: i64,
        app_version: &str,
    ) -> Result<(), MigratorError> {
        Database::immediate_transaction(conn, |c| {
            Self::set_schema(c, appspace_id, schema)?;
            Self::set_app_version(c, appspace_id, app_version)
        })
    }

    pub fn delete(conn: &Connection, appspace_id: i64) -> Result<(), MigratorError> {
        let deleted = conn.execute("DELETE FROM appspaces WHERE appspace_id = ?", [appspace_id])?;
        Self::expect_one(deleted, appspace_id)
    }

    /// Appspaces that no running or pending job accounts for and whose
    /// schema does not match their recorded version
    pub fn find_schema_mismatches(conn: &Connection) -> Result<Vec<SchemaMismatch>, MigratorError> {
        let mut stmt = conn.prepare(
            "SELECT a.appspace_id, a.app_version, a.schema, v.schema
             FROM appspaces a
             JOIN app_versions v ON v.app_id = a.app_id AND v.version = a.app_version
             WHERE a.schema <> v.schema
               AND NOT EXISTS (
                   SELECT 1 FROM migration_jobs j
                   WHERE j.appspace_id = a.appspace_id AND j.finished IS NULL
               )
             ORDER BY a.appspace_id",
        )?;
        let mismatches = stmt
            .query_map([], |row| {
                Ok(SchemaMismatch {
                    appspace_id: row.get(0)?,
                    app_version: row.get(1)?,
                    appspace_schema: row.get(2)?,
                    version_schema: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mismatches)
    }

    fn expect_one(rows: usize, appspace_id: i64) -> Result<(), MigratorError> {
        if rows == 1 {
            Ok(())
        } else {
            Err(MigratorError::NotFound(format!("appspace {}", appspace_id)))
        }
    }
}
