use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigratorError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level sandbox failure: crash, missing reply, timeout
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Failure reported by the sandboxed migration code itself, kept verbatim
    #[error("{0}")]
    Migration(String),
}
