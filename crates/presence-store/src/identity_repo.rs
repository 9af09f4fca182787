use crate::{lock, SharedConnection};
use chrono::{DateTime, Utc};
use presence_core::storage::{EmbeddingRepository, StoreError};
use presence_core::types::{Embedding, EnrolledIdentity};
use rusqlite::params;
use uuid::Uuid;

/// Enrollment records, one row per record, embeddings stored as JSON.
pub struct SqliteEmbeddingRepository {
    conn: SharedConnection,
}

struct RawRecord {
    record_id: String,
    identity_id: String,
    display_name: String,
    embeddings: String,
    enrolled_at: String,
}

impl SqliteEmbeddingRepository {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

impl EmbeddingRepository for SqliteEmbeddingRepository {
    fn append(&self, identity: &EnrolledIdentity) -> Result<(), StoreError> {
        let vectors: Vec<&[f32]> = identity
            .embeddings
            .iter()
            .map(|e| e.values.as_slice())
            .collect();
        let embeddings = serde_json::to_string(&vectors).map_err(StoreError::backend)?;

        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO identities (record_id, identity_id, display_name, embeddings, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.record_id.to_string(),
                identity.id,
                identity.display_name,
                embeddings,
                identity.enrolled_at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::backend)?;

        tracing::debug!(
            identity = %identity.id,
            record = %identity.record_id,
            "enrollment record stored"
        );
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let raw = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT record_id, identity_id, display_name, embeddings, enrolled_at
                     FROM identities ORDER BY seq",
                )
                .map_err(StoreError::backend)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RawRecord {
                        record_id: row.get(0)?,
                        identity_id: row.get(1)?,
                        display_name: row.get(2)?,
                        embeddings: row.get(3)?,
                        enrolled_at: row.get(4)?,
                    })
                })
                .map_err(StoreError::backend)?;
            let records: Vec<RawRecord> = rows
                .collect::<Result<_, _>>()
                .map_err(StoreError::backend)?;
            records
        };

        raw.into_iter().map(decode).collect()
    }
}

fn decode(raw: RawRecord) -> Result<EnrolledIdentity, StoreError> {
    let record_id = Uuid::parse_str(&raw.record_id).map_err(StoreError::backend)?;
    let vectors: Vec<Vec<f32>> =
        serde_json::from_str(&raw.embeddings).map_err(StoreError::backend)?;
    let enrolled_at = DateTime::parse_from_rfc3339(&raw.enrolled_at)
        .map_err(StoreError::backend)?
        .with_timezone(&Utc);

    // Stored as-is: the matcher re-normalizes and skips bad vectors.
    Ok(EnrolledIdentity {
        record_id,
        id: raw.identity_id,
        display_name: raw.display_name,
        embeddings: vectors.into_iter().map(Embedding::new).collect(),
        enrolled_at,
    })
}
