//! Attendance sessions in SQLite.
//!
//! The primary key on `(identity_id, day, session_index)` and the partial
//! unique index on open sessions turn lost races into constraint
//! violations, which are reported as [`StoreError::Conflict`]. Closing uses
//! `UPDATE .. WHERE check_out IS NULL`; zero affected rows is also a
//! conflict.

use crate::{lock, SharedConnection};
use chrono::{NaiveDate, NaiveTime};
use presence_core::ledger::AttendanceSession;
use presence_core::storage::{AttendanceStore, StoreError};
use rusqlite::{params, ErrorCode, OptionalExtension, Row};

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

pub struct SqliteAttendanceStore {
    conn: SharedConnection,
}

impl SqliteAttendanceStore {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

fn day_text(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

fn time_text(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn conversion_error(index: usize, err: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceSession> {
    let day: String = row.get(2)?;
    let check_in: String = row.get(4)?;
    let check_out: Option<String> = row.get(5)?;

    Ok(AttendanceSession {
        identity_id: row.get(0)?,
        display_name: row.get(1)?,
        day: NaiveDate::parse_from_str(&day, DAY_FORMAT).map_err(|e| conversion_error(2, e))?,
        session_index: row.get(3)?,
        check_in: NaiveTime::parse_from_str(&check_in, TIME_FORMAT)
            .map_err(|e| conversion_error(4, e))?,
        check_out: check_out
            .map(|t| NaiveTime::parse_from_str(&t, TIME_FORMAT))
            .transpose()
            .map_err(|e| conversion_error(5, e))?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

const SESSION_COLUMNS: &str =
    "identity_id, display_name, day, session_index, check_in, check_out";

impl AttendanceStore for SqliteAttendanceStore {
    fn find_open(
        &self,
        identity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM attendance
                 WHERE identity_id = ?1 AND day = ?2 AND check_out IS NULL
                 ORDER BY session_index LIMIT 1"
            ),
            params![identity_id, day_text(day)],
            session_from_row,
        )
        .optional()
        .map_err(StoreError::backend)
    }

    fn latest_index(&self, identity_id: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT COALESCE(MAX(session_index), 0) FROM attendance
             WHERE identity_id = ?1 AND day = ?2",
            params![identity_id, day_text(day)],
            |row| row.get(0),
        )
        .map_err(StoreError::backend)
    }

    fn insert(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        let result = conn.execute(
            &format!("INSERT INTO attendance ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                session.identity_id,
                session.display_name,
                day_text(session.day),
                session.session_index,
                time_text(session.check_in),
                session.check_out.map(time_text),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => {
                tracing::debug!(
                    identity = %session.identity_id,
                    day = %session.day,
                    session = session.session_index,
                    error = %err,
                    "attendance insert rejected by constraint"
                );
                Err(StoreError::Conflict {
                    identity_id: session.identity_id.clone(),
                    day: session.day,
                    session_index: session.session_index,
                })
            }
            Err(err) => Err(StoreError::backend(err)),
        }
    }

    fn close(
        &self,
        identity_id: &str,
        day: NaiveDate,
        session_index: u32,
        check_out: NaiveTime,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        let updated = conn
            .execute(
                "UPDATE attendance SET check_out = ?4
                 WHERE identity_id = ?1 AND day = ?2 AND session_index = ?3
                   AND check_out IS NULL",
                params![identity_id, day_text(day), session_index, time_text(check_out)],
            )
            .map_err(StoreError::backend)?;

        if updated == 0 {
            return Err(StoreError::Conflict {
                identity_id: identity_id.to_string(),
                day,
                session_index,
            });
        }
        Ok(())
    }

    fn sessions_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM attendance
                 WHERE day >= ?1 AND day <= ?2
                 ORDER BY day, session_index, identity_id"
            ))
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![day_text(from), day_text(to)], session_from_row)
            .map_err(StoreError::backend)?;
        let sessions: Vec<AttendanceSession> = rows
            .collect::<Result<_, _>>()
            .map_err(StoreError::backend)?;
        Ok(sessions)
    }
}
