use super::migrations::apply_migrations;
use super::DbResult;
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a database file, switch it to WAL and apply pending migrations.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    let path = path.as_ref();
    let started = Instant::now();

    let mut conn = Connection::open(path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "failed to open database");
        e
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let journal: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    bootstrap(&mut conn)?;

    tracing::info!(
        path = %path.display(),
        journal = %journal,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "database opened"
    );
    Ok(conn)
}

/// Open a private in-memory database with the schema applied.
pub fn open_db_in_memory() -> DbResult<Connection> {
    let mut conn = Connection::open_in_memory()?;
    bootstrap(&mut conn)?;
    tracing::debug!("in-memory database opened");
    Ok(conn)
}

fn bootstrap(conn: &mut Connection) -> DbResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    apply_migrations(conn)?;
    Ok(())
}
