use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    aggregate::DomainEvent,
    db::Db,
    domain::{Asset, PlanEvent, ProfitStrategy, WalletSecurity},
    error::{Error, Result},
    projection::Projection,
    store::StoredEvent,
};

/// Flat read-model row for a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRow {
    pub id: Uuid,
    pub assets: Vec<Asset>,
    pub security: WalletSecurity,
    pub strategy: ProfitStrategy,
    pub quantum: u32,
    pub loss_protection: f64,
    pub investing_period: u32,
}

/// `plans_query` projection: one row per plan, built from `PlanCreated`.
#[derive(Clone)]
pub struct PlansQuery {
    db: Db,
}

impl PlansQuery {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn all(&self) -> Result<Vec<PlanRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, assets, security, strategy, quantum, loss_protection, investing_period
             FROM plans_query",
        )?;
        let rows = stmt.query_map([], row_to_plan)?;

        let mut plans = Vec::new();
        for row in rows {
            plans.push(row?);
        }
        Ok(plans)
    }

    pub fn get(&self, id: Uuid) -> Result<PlanRow> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, assets, security, strategy, quantum, loss_protection, investing_period
             FROM plans_query WHERE id = ?1",
            params![id.to_string()],
            row_to_plan,
        )
        .optional()?
        .ok_or(Error::PlanNotFound)
    }
}

impl Projection for PlansQuery {
    fn name(&self) -> &'static str {
        "plans_query"
    }

    fn init(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plans_query (
                id               TEXT PRIMARY KEY,
                assets           TEXT NOT NULL,
                security         TEXT NOT NULL,
                strategy         TEXT NOT NULL,
                quantum          INTEGER NOT NULL,
                loss_protection  REAL NOT NULL,
                investing_period INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<()> {
        if event.aggregate_type != "Plan" {
            return Ok(());
        }

        let PlanEvent::Created {
            assets,
            security,
            strategy,
            quantum,
            loss_protection,
            investing_period,
        } = PlanEvent::decode(&event.kind, event.payload.clone())?;

        conn.execute(
            "INSERT OR IGNORE INTO plans_query
                 (id, assets, security, strategy, quantum, loss_protection, investing_period)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.aggregate_id.to_string(),
                assets.join(","),
                security.as_str(),
                strategy.as_str(),
                quantum,
                loss_protection,
                investing_period,
            ],
        )?;
        Ok(())
    }
}

fn row_to_plan(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
    let id: String = row.get(0)?;
    let assets: String = row.get(1)?;
    let security: String = row.get(2)?;
    let strategy: String = row.get(3)?;

    Ok(PlanRow {
        id: Uuid::parse_str(&id).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })?,
        assets: assets.split(',').map(str::to_string).collect(),
        security: WalletSecurity::parse(&security).unwrap_or_default(),
        strategy: ProfitStrategy::parse(&strategy).unwrap_or_default(),
        quantum: row.get(4)?,
        loss_protection: row.get(5)?,
        investing_period: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        aggregate::{Repository, Root},
        domain::Plan,
        projection::Runner,
        store::EventStore,
    };

    fn setup() -> (Db, EventStore, PlansQuery, Runner) {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db.clone());
        store.migrate().unwrap();
        let query = PlansQuery::new(db.clone());
        let runner = Runner::new(db.clone(), store.clone(), Arc::new(query.clone())).unwrap();
        (db, store, query, runner)
    }

    fn create_plan(store: &EventStore) -> Uuid {
        let repo = Repository::new(store.clone());
        let mut root = Root::<Plan>::new(Uuid::new_v4());
        root.track(PlanEvent::Created {
            assets: vec!["THOR.RUNE".into(), "BTC.BTC".into()],
            security: WalletSecurity::TwoOfTwo,
            strategy: ProfitStrategy::EqualShare,
            quantum: 100,
            loss_protection: 0.1,
            investing_period: 4,
        })
        .unwrap();
        repo.save(&mut root).unwrap();
        root.id()
    }

    #[test]
    fn materializes_created_plans() {
        let (_db, store, query, runner) = setup();
        let id = create_plan(&store);
        runner.catch_up().unwrap();

        let plan = query.get(id).unwrap();
        assert_eq!(plan.assets, vec!["THOR.RUNE", "BTC.BTC"]);
        assert_eq!(plan.quantum, 100);
        assert_eq!(query.all().unwrap().len(), 1);
    }

    #[test]
    fn missing_plan_is_not_found() {
        let (_db, _store, query, runner) = setup();
        runner.catch_up().unwrap();
        assert!(matches!(
            query.get(Uuid::new_v4()).unwrap_err(),
            Error::PlanNotFound
        ));
    }
}
