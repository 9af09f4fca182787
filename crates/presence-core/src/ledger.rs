//! Per-identity, per-day check-in/check-out state machine.
//!
//! For each `(identity_id, day)` the ledger alternates between "no open
//! session" and "one open session". A toggle closes the open session if
//! there is one, otherwise it opens session `latest + 1`.
//!
//! The read-then-write sequence is not atomic against the store, so the
//! store enforces uniqueness of `(identity_id, day, session_index)`,
//! refuses a second open session for the same `(identity_id, day)`, and
//! only closes sessions that are still open. Each failure surfaces as
//! [`StoreError::Conflict`], and the ledger re-reads and tries again up to
//! [`LedgerConfig::max_attempts`] times.

use crate::storage::{AttendanceStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TOGGLE_ATTEMPTS: u32 = 8;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance toggle for {identity_id} on {day} still conflicting after {attempts} attempts")]
    RetriesExhausted {
        identity_id: String,
        day: NaiveDate,
        attempts: u32,
    },
    #[error("invalid report range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One check-in/check-out pair for an identity on a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub identity_id: String,
    pub display_name: String,
    pub day: NaiveDate,
    /// 1-based, contiguous per `(identity_id, day)`.
    pub session_index: u32,
    pub check_in: NaiveTime,
    pub check_out: Option<NaiveTime>,
}

impl AttendanceSession {
    pub fn is_open(&self) -> bool {
        self.check_out.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    In,
    Out,
}

/// Result of a toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub identity_id: String,
    pub day: NaiveDate,
    pub session_index: u32,
    pub check_in: NaiveTime,
    pub check_out: Option<NaiveTime>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Total toggle attempts before a persistent conflict is reported.
    pub max_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_TOGGLE_ATTEMPTS,
        }
    }
}

/// Sole writer of attendance sessions.
pub struct AttendanceLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S: AttendanceStore> AttendanceLedger<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Flip the attendance state of `identity_id` for the day of `now`.
    ///
    /// The first toggle of a day is always [`EventKind::In`]. Times are
    /// recorded at second precision.
    pub fn toggle(
        &self,
        identity_id: &str,
        display_name: &str,
        now: NaiveDateTime,
    ) -> Result<SessionEvent, LedgerError> {
        let day = now.date();
        let time = now.time().with_nanosecond(0).unwrap_or_else(|| now.time());
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_toggle(identity_id, display_name, day, time) {
                Ok(event) => return Ok(event),
                Err(StoreError::Conflict { session_index, .. }) => {
                    tracing::warn!(
                        identity = identity_id,
                        %day,
                        session = session_index,
                        attempt,
                        "attendance write raced, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::error!(identity = identity_id, %day, attempts, "attendance toggle gave up");
        Err(LedgerError::RetriesExhausted {
            identity_id: identity_id.to_string(),
            day,
            attempts,
        })
    }

    fn try_toggle(
        &self,
        identity_id: &str,
        display_name: &str,
        day: NaiveDate,
        time: NaiveTime,
    ) -> Result<SessionEvent, StoreError> {
        if let Some(open) = self.store.find_open(identity_id, day)? {
            self.store.close(identity_id, day, open.session_index, time)?;
            tracing::info!(
                identity = identity_id,
                %day,
                session = open.session_index,
                check_in = %open.check_in,
                check_out = %time,
                "attendance check-out"
            );
            return Ok(SessionEvent {
                kind: EventKind::Out,
                identity_id: identity_id.to_string(),
                day,
                session_index: open.session_index,
                check_in: open.check_in,
                check_out: Some(time),
            });
        }

        let session_index = self.store.latest_index(identity_id, day)? + 1;
        let session = AttendanceSession {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            day,
            session_index,
            check_in: time,
            check_out: None,
        };
        self.store.insert(&session)?;
        tracing::info!(
            identity = identity_id,
            %day,
            session = session_index,
            check_in = %time,
            "attendance check-in"
        );

        Ok(SessionEvent {
            kind: EventKind::In,
            identity_id: session.identity_id,
            day,
            session_index,
            check_in: time,
            check_out: None,
        })
    }

    /// All sessions between `from` and `to` inclusive.
    pub fn report(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceSession>, LedgerError> {
        if from > to {
            return Err(LedgerError::InvalidRange { from, to });
        }
        Ok(self.store.sessions_between(from, to)?)
    }
}
