//! In-process implementations of the storage contracts.
//!
//! Used by tests and by callers that do not need durability.

use crate::ledger::AttendanceSession;
use crate::storage::{AttendanceStore, EmbeddingRepository, StoreError};
use crate::types::EnrolledIdentity;
use chrono::{NaiveDate, NaiveTime};
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

/// Append-only enrollment list behind a read/write lock.
#[derive(Default)]
pub struct MemoryEmbeddingRepository {
    records: RwLock<Vec<EnrolledIdentity>>,
}

impl MemoryEmbeddingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddingRepository for MemoryEmbeddingRepository {
    fn append(&self, identity: &EnrolledIdentity) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::backend("embedding repository lock poisoned"))?
            .push(identity.clone());
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::backend("embedding repository lock poisoned"))?;
        Ok(records.clone())
    }
}

type SessionKey = (String, NaiveDate, u32);

/// Attendance sessions keyed by `(identity_id, day, session_index)`.
///
/// Every operation runs under one mutex, so inserts and closes are atomic
/// checks against the current state. A toggle as a whole is not.
#[derive(Default)]
pub struct MemoryAttendanceStore {
    sessions: Mutex<BTreeMap<SessionKey, AttendanceSession>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<SessionKey, AttendanceSession>>, StoreError>
    {
        self.sessions
            .lock()
            .map_err(|_| StoreError::backend("attendance store lock poisoned"))
    }
}

fn day_range<'a>(
    sessions: &'a BTreeMap<SessionKey, AttendanceSession>,
    identity_id: &str,
    day: NaiveDate,
) -> impl Iterator<Item = &'a AttendanceSession> + 'a {
    let start = (identity_id.to_string(), day, 0);
    let end = (identity_id.to_string(), day, u32::MAX);
    sessions.range(start..=end).map(|(_, session)| session)
}

impl AttendanceStore for MemoryAttendanceStore {
    fn find_open(
        &self,
        identity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let sessions = self.lock()?;
        let open = day_range(&sessions, identity_id, day)
            .find(|s| s.is_open())
            .cloned();
        Ok(open)
    }

    fn latest_index(&self, identity_id: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let sessions = self.lock()?;
        let latest = day_range(&sessions, identity_id, day)
            .map(|s| s.session_index)
            .max()
            .unwrap_or(0);
        Ok(latest)
    }

    fn insert(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        let key = (
            session.identity_id.clone(),
            session.day,
            session.session_index,
        );
        let open_exists = day_range(&sessions, &session.identity_id, session.day)
            .any(|s| s.is_open());
        if open_exists || sessions.contains_key(&key) {
            return Err(StoreError::Conflict {
                identity_id: session.identity_id.clone(),
                day: session.day,
                session_index: session.session_index,
            });
        }
        sessions.insert(key, session.clone());
        Ok(())
    }

    fn close(
        &self,
        identity_id: &str,
        day: NaiveDate,
        session_index: u32,
        check_out: NaiveTime,
    ) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        let key = (identity_id.to_string(), day, session_index);
        match sessions.get_mut(&key) {
            Some(session) if session.is_open() => {
                session.check_out = Some(check_out);
                Ok(())
            }
            _ => Err(StoreError::Conflict {
                identity_id: identity_id.to_string(),
                day,
                session_index,
            }),
        }
    }

    fn sessions_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        let sessions = self.lock()?;
        let mut rows: Vec<AttendanceSession> = sessions
            .values()
            .filter(|s| s.day >= from && s.day <= to)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.day, a.session_index, &a.identity_id).cmp(&(b.day, b.session_index, &b.identity_id))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;
    use chrono::Utc;

    fn session(id: &str, index: u32, open: bool) -> AttendanceSession {
        AttendanceSession {
            identity_id: id.into(),
            display_name: id.into(),
            day: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            session_index: index,
            check_in: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            check_out: if open { None } else { NaiveTime::from_hms_opt(9, 0, 0) },
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_key() {
        let store = MemoryAttendanceStore::new();
        store.insert(&session("A", 1, false)).unwrap();
        let err = store.insert(&session("A", 1, false)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_insert_rejects_second_open_session() {
        let store = MemoryAttendanceStore::new();
        store.insert(&session("A", 1, true)).unwrap();
        assert!(store.insert(&session("A", 2, true)).unwrap_err().is_conflict());
        // A different identity is unaffected.
        store.insert(&session("B", 1, true)).unwrap();
    }

    #[test]
    fn test_close_only_once() {
        let store = MemoryAttendanceStore::new();
        let s = session("A", 1, true);
        store.insert(&s).unwrap();
        let out = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        store.close("A", s.day, 1, out).unwrap();
        assert!(store.close("A", s.day, 1, out).unwrap_err().is_conflict());
        assert!(store.close("A", s.day, 7, out).unwrap_err().is_conflict());
    }

    #[test]
    fn test_latest_index_and_find_open() {
        let store = MemoryAttendanceStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        assert_eq!(store.latest_index("A", day).unwrap(), 0);
        store.insert(&session("A", 1, false)).unwrap();
        store.insert(&session("A", 2, true)).unwrap();
        store.insert(&session("AB", 5, true)).unwrap();
        assert_eq!(store.latest_index("A", day).unwrap(), 2);
        assert_eq!(store.find_open("A", day).unwrap().unwrap().session_index, 2);
    }

    #[test]
    fn test_repository_snapshot_is_a_copy() {
        let repo = MemoryEmbeddingRepository::new();
        let record =
            EnrolledIdentity::new("A", "Alice", vec![Embedding::new(vec![1.0, 0.0])], Utc::now())
                .unwrap();
        repo.append(&record).unwrap();
        let snapshot = repo.snapshot().unwrap();
        repo.append(&record).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(repo.snapshot().unwrap().len(), 2);
    }
}
