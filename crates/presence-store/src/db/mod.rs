//! SQLite bootstrap and schema migrations.
//!
//! Schema version is tracked in `PRAGMA user_version`. No application data
//! is read or written before migrations have been applied.

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion { db_version: u32, latest_supported: u32 },
}
