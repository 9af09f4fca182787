//! Persistence contracts consumed by the core.
//!
//! The core only needs append + full scan for enrollments, and a
//! unique-constrained insert + conditional close for attendance sessions.

use crate::ledger::AttendanceSession;
use crate::types::EnrolledIdentity;
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A write lost a race: duplicate key or second open session on insert,
    /// or the session was already closed on update.
    #[error("write conflict on {identity_id} {day} session {session_index}")]
    Conflict {
        identity_id: String,
        day: NaiveDate,
        session_index: u32,
    },
    /// Any other storage failure, passed through unmodified.
    #[error(transparent)]
    Backend(BoxError),
}

impl StoreError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        StoreError::Backend(err.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Append-only store of enrollment records.
pub trait EmbeddingRepository: Send + Sync {
    fn append(&self, identity: &EnrolledIdentity) -> Result<(), StoreError>;

    /// Consistent copy of every record, in enrollment order.
    fn snapshot(&self) -> Result<Vec<EnrolledIdentity>, StoreError>;
}

/// Durable attendance sessions keyed by `(identity_id, day, session_index)`.
pub trait AttendanceStore: Send + Sync {
    /// Lowest-indexed session without a check-out, if any.
    fn find_open(
        &self,
        identity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError>;

    /// Highest session index recorded for the day, 0 if none.
    fn latest_index(&self, identity_id: &str, day: NaiveDate) -> Result<u32, StoreError>;

    /// Insert a new open session. Must return [`StoreError::Conflict`] if the
    /// `(identity_id, day, session_index)` key already exists or if another
    /// session for `(identity_id, day)` is still open.
    fn insert(&self, session: &AttendanceSession) -> Result<(), StoreError>;

    /// Set `check_out` on a session that is still open. Must return
    /// [`StoreError::Conflict`] if the session is missing or already closed.
    fn close(
        &self,
        identity_id: &str,
        day: NaiveDate,
        session_index: u32,
        check_out: NaiveTime,
    ) -> Result<(), StoreError>;

    /// Sessions with `from <= day <= to`, ordered by day, session index, identity.
    fn sessions_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceSession>, StoreError>;
}
