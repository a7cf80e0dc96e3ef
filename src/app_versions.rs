use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::MigratorError;

/// One installed version of an application and the data schema it expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    pub app_id: i64,
    pub version: String,
    pub schema: i64,
    pub location: String, // Where the version's code lives on disk
    pub created: i64,
}

impl AppVersion {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            app_id: row.get(0)?,
            version: row.get(1)?,
            schema: row.get(2)?,
            location: row.get(3)?,
            created: row.get(4)?,
        })
    }

    pub fn create(
        conn: &Connection,
        app_id: i64,
        version: &str,
        schema: i64,
        location: &str,
    ) -> Result<AppVersion, MigratorError> {
        if schema < 0 {
            return Err(MigratorError::Error(format!(
                "Schema must not be negative (got {})",
                schema
            )));
        }

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO app_versions (app_id, version, schema, location, created)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![app_id, version, schema, location, now],
        )?;

        Ok(AppVersion {
            app_id,
            version: version.to_owned(),
            schema,
            location: location.to_owned(),
            created: now,
        })
    }

    pub fn get(
        conn: &Connection,
        app_id: i64,
        version: &str,
    ) -> Result<Option<AppVersion>, MigratorError> {
        let app_version = conn
            .query_row(
                "SELECT app_id, version, schema, location, created
                 FROM app_versions WHERE app_id = ? AND version = ?",
                rusqlite::params![app_id, version],
                Self::from_row,
            )
            .optional()?;
        Ok(app_version)
    }
}
