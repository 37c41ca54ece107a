use std::{sync::Arc, time::Duration};

use rusqlite::{Connection, params};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::warn;

use crate::{
    db::Db,
    error::{Error, Result},
    store::{EventStore, StoredEvent},
};

/// Events fetched per tick.
pub const FETCH_LIMIT: usize = 100;

/// Pause between ticks of each projection loop.
pub const DEFAULT_PACE: Duration = Duration::from_secs(2);

/// A read-model builder fed the event stream in global-sequence order.
///
/// `apply` runs inside the same transaction that advances the projection's
/// cursor, so an event is either fully applied and counted, or neither.
pub trait Projection: Send + Sync + 'static {
    /// Unique projection name; also the derived table's name.
    fn name(&self) -> &'static str;

    /// Creates the derived table if missing.
    fn init(&self, conn: &Connection) -> Result<()>;

    /// Drops the derived table ahead of a full rebuild.
    fn drop_derived(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", self.name()))?;
        Ok(())
    }

    /// Fetches the next batch of events, fully buffered.
    fn fetch(&self, store: &EventStore, from_seq: u64, limit: usize) -> Result<Vec<StoredEvent>> {
        store.all(from_seq, limit)
    }

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<()>;
}

/// Wrapper that keeps a projection ticking through failures: fetch errors
/// yield an empty batch, apply errors are logged and the event is counted
/// as handled. Lossy; only for read models where a dropped event is
/// acceptable.
pub struct FailSafe<P: Projection> {
    inner: P,
}

impl<P: Projection> FailSafe<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Projection> Projection for FailSafe<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn init(&self, conn: &Connection) -> Result<()> {
        self.inner.init(conn)
    }

    fn drop_derived(&self, conn: &Connection) -> Result<()> {
        self.inner.drop_derived(conn)
    }

    fn fetch(&self, store: &EventStore, from_seq: u64, limit: usize) -> Result<Vec<StoredEvent>> {
        match self.inner.fetch(store, from_seq, limit) {
            Ok(events) => Ok(events),
            Err(err) => {
                warn!(projection = self.name(), error = %err, "failed to fetch events");
                Ok(Vec::new())
            }
        }
    }

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<()> {
        if let Err(err) = self.inner.apply(conn, event) {
            warn!(
                projection = self.name(),
                kind = %event.kind,
                global_seq = event.global_seq,
                error = %err,
                "failed to handle event, skipping"
            );
        }
        Ok(())
    }
}

/// Drives one projection against the event log, persisting its cursor in
/// the `projections` control table.
pub struct Runner {
    db: Db,
    store: EventStore,
    projection: Arc<dyn Projection>,
}

impl Runner {
    pub fn new(db: Db, store: EventStore, projection: Arc<dyn Projection>) -> Result<Self> {
        let runner = Self {
            db,
            store,
            projection,
        };
        runner.register()?;
        Ok(runner)
    }

    /// Registers the cursor row and rebuilds the derived table when the
    /// cursor is still at zero (first run, or after `reset_all`).
    fn register(&self) -> Result<()> {
        let conn = self.db.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projections (
                id                     TEXT PRIMARY KEY,
                last_handled_event_seq INTEGER NOT NULL
            );",
        )?;
        conn.execute(
            "INSERT INTO projections (id, last_handled_event_seq) VALUES (?1, 0)
             ON CONFLICT DO NOTHING",
            params![self.projection.name()],
        )?;

        let cursor: u64 = conn.query_row(
            "SELECT last_handled_event_seq FROM projections WHERE id = ?1",
            params![self.projection.name()],
            |row| row.get(0),
        )?;
        if cursor == 0 {
            self.projection.drop_derived(&conn)?;
        }
        self.projection.init(&conn)?;

        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.projection.name()
    }

    pub fn cursor(&self) -> Result<u64> {
        let conn = self.db.lock();
        let cursor = conn.query_row(
            "SELECT last_handled_event_seq FROM projections WHERE id = ?1",
            params![self.projection.name()],
            |row| row.get(0),
        )?;
        Ok(cursor)
    }

    /// One tick: fetch a buffered batch, then apply each event in its own
    /// transaction together with a cursor increment of exactly one.
    pub fn run_once(&self) -> Result<usize> {
        let cursor = self.cursor()?;
        let events = self
            .projection
            .fetch(&self.store, cursor + 1, FETCH_LIMIT)?;
        let handled = events.len();

        for event in &events {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;
            self.projection.apply(&tx, event)?;
            tx.execute(
                "UPDATE projections SET last_handled_event_seq = last_handled_event_seq + 1
                 WHERE id = ?1",
                params![self.projection.name()],
            )?;
            tx.commit()?;
        }

        Ok(handled)
    }

    /// Drains every pending event. Used at startup and by tests.
    pub fn catch_up(&self) -> Result<()> {
        while self.run_once()? > 0 {}
        Ok(())
    }
}

pub struct ProjectionError {
    pub name: &'static str,
    pub error: Error,
}

/// A set of projections ticking independently on a shared pace, with a
/// common error channel and cooperative stop.
pub struct Group {
    runners: Vec<Arc<Runner>>,
    pace: Duration,
}

impl Group {
    pub fn new(runners: Vec<Arc<Runner>>) -> Self {
        Self {
            runners,
            pace: DEFAULT_PACE,
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn catch_up(&self) -> Result<()> {
        for runner in &self.runners {
            runner.catch_up()?;
        }
        Ok(())
    }

    pub fn start(self) -> GroupHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(self.runners.len());
        for runner in self.runners {
            let mut stop = stop_rx.clone();
            let errors = err_tx.clone();
            let pace = self.pace;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                        _ = sleep(pace) => {
                            if let Err(error) = runner.run_once() {
                                let _ = errors.send(ProjectionError {
                                    name: runner.name(),
                                    error,
                                });
                            }
                        }
                    }
                }
            }));
        }

        GroupHandle {
            stop_tx,
            errors: Some(err_rx),
            tasks,
        }
    }
}

pub struct GroupHandle {
    stop_tx: watch::Sender<bool>,
    errors: Option<mpsc::UnboundedReceiver<ProjectionError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl GroupHandle {
    /// Takes the shared error channel; callable once.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ProjectionError>> {
        self.errors.take()
    }

    /// Signals every projection loop to stop after its current tick.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Drops the control table so every projection rebuilds from scratch on the
/// next run.
pub fn reset_all(db: &Db) -> Result<()> {
    db.lock().execute_batch("DROP TABLE IF EXISTS projections;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::store::NewEvent;

    struct KindLog;

    impl Projection for KindLog {
        fn name(&self) -> &'static str {
            "kind_log"
        }

        fn init(&self, conn: &Connection) -> Result<()> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kind_log (seq INTEGER PRIMARY KEY, kind TEXT);",
            )?;
            Ok(())
        }

        fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<()> {
            conn.execute(
                "INSERT INTO kind_log (seq, kind) VALUES (?1, ?2)",
                params![event.global_seq, event.kind],
            )?;
            Ok(())
        }
    }

    struct Faulty;

    impl Projection for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn init(&self, _conn: &Connection) -> Result<()> {
            Ok(())
        }

        fn apply(&self, _conn: &Connection, _event: &StoredEvent) -> Result<()> {
            Err(Error::Storage("boom".into()))
        }
    }

    fn seed(store: &EventStore, n: usize) {
        let id = Uuid::new_v4();
        for i in 0..n {
            store
                .append(
                    id,
                    "Pair",
                    i as u64,
                    &[NewEvent {
                        kind: format!("E{i}"),
                        payload: json!({}),
                    }],
                )
                .unwrap();
        }
    }

    #[test]
    fn cursor_advances_one_per_event() {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db.clone());
        store.migrate().unwrap();
        seed(&store, 3);

        let runner = Runner::new(db.clone(), store, Arc::new(KindLog)).unwrap();
        assert_eq!(runner.cursor().unwrap(), 0);
        assert_eq!(runner.run_once().unwrap(), 3);
        assert_eq!(runner.cursor().unwrap(), 3);
        assert_eq!(runner.run_once().unwrap(), 0);

        let count: u64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM kind_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn failed_apply_rolls_back_cursor() {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db.clone());
        store.migrate().unwrap();
        seed(&store, 1);

        let runner = Runner::new(db, store, Arc::new(Faulty)).unwrap();
        assert!(runner.run_once().is_err());
        assert_eq!(runner.cursor().unwrap(), 0);
    }

    #[test]
    fn fail_safe_skips_and_advances() {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db.clone());
        store.migrate().unwrap();
        seed(&store, 2);

        let runner = Runner::new(db, store, Arc::new(FailSafe::new(Faulty))).unwrap();
        assert_eq!(runner.run_once().unwrap(), 2);
        assert_eq!(runner.cursor().unwrap(), 2);
    }

    #[test]
    fn reset_triggers_rebuild() {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db.clone());
        store.migrate().unwrap();
        seed(&store, 2);

        let runner = Runner::new(db.clone(), store.clone(), Arc::new(KindLog)).unwrap();
        runner.catch_up().unwrap();
        drop(runner);

        reset_all(&db).unwrap();

        // Re-registering with a zeroed cursor drops the stale table and the
        // replay fills it back to identical contents.
        let runner = Runner::new(db.clone(), store, Arc::new(KindLog)).unwrap();
        runner.catch_up().unwrap();
        let kinds: Vec<String> = {
            let conn = db.lock();
            let mut stmt = conn
                .prepare("SELECT kind FROM kind_log ORDER BY seq ASC")
                .unwrap();
            let rows = stmt.query_map([], |row| row.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert_eq!(kinds, vec!["E0".to_string(), "E1".to_string()]);
    }
}
