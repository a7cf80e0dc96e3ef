use log::debug;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::MigratorError;

pub const INTERRUPTED_JOB_ERROR: &str = "job interrupted before completion";

const JOB_COLUMNS: &str =
    "job_id, owner_id, appspace_id, to_version, priority, created, started, finished, error";

/// A durable request to migrate an appspace to a given app version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub job_id: i64,
    pub owner_id: i64,
    pub appspace_id: i64,
    pub to_version: String,
    pub priority: bool,
    pub created: i64,          // Unix timestamp (UTC)
    pub started: Option<i64>,  // Set once, when the scheduler claims the job
    pub finished: Option<i64>, // Set once; the row is immutable afterwards
    pub error: Option<String>,
}

impl MigrationJob {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            owner_id: row.get(1)?,
            appspace_id: row.get(2)?,
            to_version: row.get(3)?,
            priority: row.get(4)?,
            created: row.get(5)?,
            started: row.get(6)?,
            finished: row.get(7)?,
            error: row.get(8)?,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.started.is_none()
    }

    // ========================================
    // Database operations
    // ========================================

    /// Create a new job, replacing any pending job for the same appspace
    pub fn create(
        conn: &Connection,
        owner_id: i64,
        appspace_id: i64,
        to_version: &str,
        priority: bool,
    ) -> Result<MigrationJob, MigratorError> {
        let now = chrono::Utc::now().timestamp();

        let job_id = Database::immediate_transaction(conn, |c| {
            let replaced = c.execute(
                "DELETE FROM migration_jobs WHERE appspace_id = ? AND started IS NULL",
                [appspace_id],
            )?;
            if replaced > 0 {
                debug!(
                    "Replaced pending migration job for appspace {}",
                    appspace_id
                );
            }

            c.execute(
                "INSERT INTO migration_jobs (owner_id, appspace_id, to_version, priority, created)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![owner_id, appspace_id, to_version, priority, now],
            )?;

            Ok(c.last_insert_rowid())
        })?;

        Self::get_by_id(conn, job_id)?
            .ok_or_else(|| MigratorError::NotFound(format!("migration job {}", job_id)))
    }

    pub fn get_by_id(conn: &Connection, job_id: i64) -> Result<Option<MigrationJob>, MigratorError> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM migration_jobs WHERE job_id = ?", JOB_COLUMNS),
                [job_id],
                Self::from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs for an appspace, newest first
    pub fn get_for_appspace(
        conn: &Connection,
        appspace_id: i64,
    ) -> Result<Vec<MigrationJob>, MigratorError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM migration_jobs WHERE appspace_id = ?
             ORDER BY created DESC, job_id DESC",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([appspace_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Unstarted jobs in claim order: priority first, then newest
    pub fn get_pending(conn: &Connection) -> Result<Vec<MigrationJob>, MigratorError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM migration_jobs WHERE started IS NULL
             ORDER BY priority DESC, created DESC, job_id DESC",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Atomically claim a pending job. Returns false if it was already
    /// started or no longer exists.
    pub fn set_started(conn: &Connection, job_id: i64, started: i64) -> Result<bool, MigratorError> {
        let updated = conn.execute(
            "UPDATE migration_jobs SET started = ? WHERE job_id = ? AND started IS NULL",
            rusqlite::params![started, job_id],
        )?;
        Ok(updated == 1)
    }

    /// Record the outcome with the same `finished` time observers were sent
    pub fn set_finished(
        conn: &Connection,
        job_id: i64,
        finished: i64,
        error: Option<&str>,
    ) -> Result<(), MigratorError> {
        let updated = conn.execute(
            "UPDATE migration_jobs SET finished = ?, error = ?
             WHERE job_id = ? AND finished IS NULL",
            rusqlite::params![finished, error, job_id],
        )?;

        if updated != 1 {
            return Err(MigratorError::Error(format!(
                "Migration job {} could not be marked finished (missing or already finished)",
                job_id
            )));
        }
        Ok(())
    }

    /// Close out jobs that were started but never finished, which only
    /// happens when the process stopped mid-migration. Returns the count.
    pub fn finish_interrupted(conn: &Connection) -> Result<usize, MigratorError> {
        let now = chrono::Utc::now().timestamp();
        let count = conn.execute(
            "UPDATE migration_jobs SET finished = ?, error = ?
             WHERE started IS NOT NULL AND finished IS NULL",
            rusqlite::params![now, INTERRUPTED_JOB_ERROR],
        )?;
        Ok(count)
    }

    /// Appspace deletion cascade
    pub fn delete_for_appspace(conn: &Connection, appspace_id: i64) -> Result<(), MigratorError> {
        conn.execute("DELETE FROM migration_jobs WHERE appspace_id = ?", [appspace_id])?;
        Ok(())
    }
}
