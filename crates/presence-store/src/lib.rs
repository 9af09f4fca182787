//! presence-store: SQLite persistence for enrollments and attendance.
//!
//! One [`Database`] owns a connection; the repositories it hands out share
//! that connection. Separate processes (or separate `Database` values on
//! the same file) coordinate through the schema's unique indexes.

pub mod attendance_repo;
pub mod db;
pub mod identity_repo;

pub use attendance_repo::SqliteAttendanceStore;
pub use db::{DbError, DbResult};
pub use identity_repo::SqliteEmbeddingRepository;

use presence_core::storage::StoreError;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::backend("database connection lock poisoned"))
}

#[derive(Clone)]
pub struct Database {
    conn: SharedConnection,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(db::open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(db::open_db_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let conn = lock(&self.conn)?;
        db::migrations::current_version(&conn).map_err(StoreError::backend)
    }

    pub fn embeddings(&self) -> SqliteEmbeddingRepository {
        SqliteEmbeddingRepository::new(Arc::clone(&self.conn))
    }

    pub fn attendance(&self) -> SqliteAttendanceStore {
        SqliteAttendanceStore::new(Arc::clone(&self.conn))
    }
}
