use std::ops::Deref;

use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    store::{EventStore, NewEvent},
};

/// The set of events an aggregate understands.
///
/// Events are self-describing tagged values; `kind` is also denormalized
/// into its own column so the log can be inspected without decoding.
pub trait DomainEvent: Sized + Send + Sync {
    /// Kind tag of this event.
    fn kind(&self) -> &'static str;

    /// All kinds registered for the owning aggregate.
    fn kinds() -> &'static [&'static str];

    fn encode(&self) -> Result<Value>;

    fn decode(kind: &str, payload: Value) -> Result<Self>;
}

/// State machine rebuilt by replaying an event stream.
pub trait Aggregate: Default + Send + Sync {
    /// Aggregate type name used as the stream discriminator.
    const KIND: &'static str;

    type Event: DomainEvent;

    fn apply(&mut self, event: &Self::Event);
}

/// An aggregate loaded at a specific version, tracking uncommitted events.
///
/// `track` applies the event to the in-memory state immediately, so a
/// handler emitting several dependent events observes each one's effect
/// before tracking the next.
#[derive(Debug)]
pub struct Root<A: Aggregate> {
    id: Uuid,
    version: u64,
    state: A,
    pending: Vec<A::Event>,
}

impl<A: Aggregate> Root<A> {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn track(&mut self, event: A::Event) -> Result<()> {
        if !A::Event::kinds().contains(&event.kind()) {
            return Err(Error::UnknownEventKind(event.kind().to_string()));
        }

        self.state.apply(&event);
        self.pending.push(event);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl<A: Aggregate> Deref for Root<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.state
    }
}

/// Loads aggregates by replay and saves tracked events with an optimistic
/// version check.
#[derive(Clone)]
pub struct Repository {
    store: EventStore,
}

impl Repository {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn get<A: Aggregate>(&self, id: Uuid) -> Result<Root<A>> {
        let events = self.store.load(id)?;
        if events.is_empty() {
            return Err(Error::AggregateNotFound);
        }

        let mut root: Root<A> = Root::new(id);
        for stored in events {
            let event = A::Event::decode(&stored.kind, stored.payload)?;
            root.state.apply(&event);
            root.version = stored.version;
        }

        Ok(root)
    }

    pub fn save<A: Aggregate>(&self, root: &mut Root<A>) -> Result<()> {
        if root.pending.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(root.pending.len());
        for event in &root.pending {
            batch.push(NewEvent {
                kind: event.kind().to_string(),
                payload: event.encode()?,
            });
        }

        let version = self.store.append(root.id, A::KIND, root.version, &batch)?;
        root.version = version;
        root.pending.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::db::Db;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    enum CounterEvent {
        Incremented { by: i64 },
        Reset,
    }

    impl DomainEvent for CounterEvent {
        fn kind(&self) -> &'static str {
            match self {
                Self::Incremented { .. } => "Incremented",
                Self::Reset => "Reset",
            }
        }

        fn kinds() -> &'static [&'static str] {
            &["Incremented", "Reset"]
        }

        fn encode(&self) -> Result<Value> {
            Ok(serde_json::to_value(self)?)
        }

        fn decode(kind: &str, payload: Value) -> Result<Self> {
            if !Self::kinds().contains(&kind) {
                return Err(Error::UnknownEventKind(kind.to_string()));
            }
            Ok(serde_json::from_value(payload)?)
        }
    }

    #[derive(Debug, Default, PartialEq)]
    struct Counter {
        total: i64,
    }

    impl Aggregate for Counter {
        const KIND: &'static str = "Counter";
        type Event = CounterEvent;

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Incremented { by } => self.total += by,
                CounterEvent::Reset => self.total = 0,
            }
        }
    }

    fn repository() -> Repository {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        store.migrate().unwrap();
        Repository::new(store)
    }

    #[test]
    fn tracked_state_matches_replayed_state() {
        let repo = repository();
        let id = Uuid::new_v4();

        let mut root = Root::<Counter>::new(id);
        root.track(CounterEvent::Incremented { by: 3 }).unwrap();
        root.track(CounterEvent::Incremented { by: 4 }).unwrap();
        assert_eq!(root.total, 7);
        repo.save(&mut root).unwrap();
        assert_eq!(root.version(), 2);
        assert!(!root.has_pending());

        let replayed = repo.get::<Counter>(id).unwrap();
        assert_eq!(replayed.total, root.total);
        assert_eq!(replayed.version(), root.version());
    }

    #[test]
    fn track_applies_immediately() {
        let mut root = Root::<Counter>::new(Uuid::new_v4());
        root.track(CounterEvent::Incremented { by: 10 }).unwrap();
        // A follow-up event can depend on state the first one just wrote.
        let next = if root.total == 10 {
            CounterEvent::Reset
        } else {
            CounterEvent::Incremented { by: 1 }
        };
        root.track(next.clone()).unwrap();
        assert_eq!(next, CounterEvent::Reset);
        assert_eq!(root.total, 0);
    }

    #[test]
    fn missing_aggregate_is_not_found() {
        let repo = repository();
        let err = repo.get::<Counter>(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::AggregateNotFound));
    }

    #[test]
    fn conflicting_saves_lose() {
        let repo = repository();
        let id = Uuid::new_v4();

        let mut first = Root::<Counter>::new(id);
        first.track(CounterEvent::Incremented { by: 1 }).unwrap();
        repo.save(&mut first).unwrap();

        let mut a = repo.get::<Counter>(id).unwrap();
        let mut b = repo.get::<Counter>(id).unwrap();
        a.track(CounterEvent::Incremented { by: 1 }).unwrap();
        b.track(CounterEvent::Reset).unwrap();

        repo.save(&mut a).unwrap();
        let err = repo.save(&mut b).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));
    }

    #[test]
    fn foreign_kind_fails_decode() {
        let err = CounterEvent::decode("Exploded", Value::Null).unwrap_err();
        assert!(matches!(err, Error::UnknownEventKind(_)));
    }
}
