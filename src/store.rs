use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    db::Db,
    error::{Error, Result},
};

/// A persisted domain event as read back from the log.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub global_seq: u64,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

/// An event waiting to be appended.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: String,
    pub payload: Value,
}

/// Append-only event log keyed by aggregate, with a per-aggregate version
/// and a global sequence assigned at append time.
#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn migrate(&self) -> Result<()> {
        self.db.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                aggregate_id   TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                version        INTEGER NOT NULL,
                timestamp      TEXT NOT NULL,
                kind           TEXT NOT NULL,
                payload        TEXT NOT NULL,
                UNIQUE (aggregate_id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_events_aggregate
                ON events (aggregate_id, version);",
        )?;
        Ok(())
    }

    /// Appends a batch atomically, numbering events
    /// `expected_version + 1 ..= expected_version + n`. Fails with
    /// `ConcurrencyConflict` when the stored version moved underneath the
    /// caller.
    pub fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: u64,
        events: &[NewEvent],
    ) -> Result<u64> {
        if events.is_empty() {
            return Ok(expected_version);
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let current: u64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?1",
                params![aggregate_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if current != expected_version {
            return Err(Error::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
            });
        }

        let timestamp = Utc::now();
        for (offset, event) in events.iter().enumerate() {
            tx.execute(
                "INSERT INTO events (aggregate_id, aggregate_type, version, timestamp, kind, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    aggregate_id.to_string(),
                    aggregate_type,
                    expected_version + offset as u64 + 1,
                    timestamp.to_rfc3339(),
                    event.kind,
                    event.payload.to_string(),
                ],
            )?;
        }
        tx.commit()?;

        Ok(expected_version + events.len() as u64)
    }

    /// Returns the full stream of an aggregate, ordered by version ascending.
    pub fn load(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, aggregate_id, aggregate_type, version, timestamp, kind, payload
             FROM events WHERE aggregate_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![aggregate_id.to_string()], row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Returns up to `limit` events with `global_seq >= from_seq`, ordered
    /// ascending. The result is fully buffered before returning.
    pub fn all(&self, from_seq: u64, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, aggregate_id, aggregate_type, version, timestamp, kind, payload
             FROM events WHERE seq >= ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![from_seq, limit as u64], row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let id: String = row.get(1)?;
    let timestamp: String = row.get(4)?;
    let payload: String = row.get(6)?;

    Ok(StoredEvent {
        global_seq: row.get(0)?,
        aggregate_id: Uuid::parse_str(&id).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
        })?,
        aggregate_type: row.get(2)?,
        version: row.get(3)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?
            .with_timezone(&Utc),
        kind: row.get(5)?,
        payload: serde_json::from_str(&payload).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(err))
        })?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> EventStore {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        store.migrate().unwrap();
        store
    }

    fn event(kind: &str) -> NewEvent {
        NewEvent {
            kind: kind.into(),
            payload: json!({ "kind": kind }),
        }
    }

    #[test]
    fn append_numbers_versions_contiguously() {
        let store = store();
        let id = Uuid::new_v4();

        let version = store
            .append(id, "Pair", 0, &[event("PairCreated"), event("PairStatusChanged")])
            .unwrap();
        assert_eq!(version, 2);

        let version = store.append(id, "Pair", 2, &[event("PairMatched")]).unwrap();
        assert_eq!(version, 3);

        let events = store.load(id).unwrap();
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn append_rejects_stale_version() {
        let store = store();
        let id = Uuid::new_v4();

        store.append(id, "Pair", 0, &[event("PairCreated")]).unwrap();
        let err = store
            .append(id, "Pair", 0, &[event("PairMatched")])
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));

        // The failed batch must leave no trace.
        assert_eq!(store.load(id).unwrap().len(), 1);
    }

    #[test]
    fn global_sequence_spans_aggregates() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, "Plan", 0, &[event("PlanCreated")]).unwrap();
        store.append(b, "Pair", 0, &[event("PairCreated")]).unwrap();
        store.append(a, "Plan", 1, &[event("Ignored")]).unwrap();

        let all = store.all(1, 100).unwrap();
        let seqs: Vec<u64> = all.iter().map(|e| e.global_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let page = store.all(2, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].global_seq, 2);
        assert_eq!(page[0].aggregate_id, b);
    }

    #[test]
    fn empty_append_is_a_noop() {
        let store = store();
        let id = Uuid::new_v4();
        assert_eq!(store.append(id, "Pair", 7, &[]).unwrap(), 7);
        assert!(store.load(id).unwrap().is_empty());
    }
}
