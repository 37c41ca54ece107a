use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, ToSql, params, params_from_iter};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    aggregate::DomainEvent,
    db::Db,
    domain::{
        Address, Asset, MultisigWallet, PairEvent, PairStatus, ProfitStrategy, SignedTx, TxHash,
        WalletSecurity,
    },
    error::{Error, Result},
    projection::Projection,
    store::StoredEvent,
};

/// Read-model row for a pair. Composite fields live in JSON columns that
/// the projection patches in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairRow {
    pub id: Uuid,
    pub status: Option<PairStatus>,
    pub assets: Vec<Asset>,
    pub participant_addresses: BTreeMap<Asset, Address>,
    pub share_value: u32,
    pub investing_period: u32,
    pub wallet_security: WalletSecurity,
    pub strategy: ProfitStrategy,
    pub loss_protection: f64,
    pub wallet: Option<MultisigWallet>,
    pub assurances: BTreeMap<Asset, Vec<SignedTx>>,
    pub deposits: BTreeMap<Asset, TxHash>,
    pub withdraw_tx: Option<SignedTx>,
    pub lp: BTreeMap<Asset, TxHash>,
    pub deadline: Option<DateTime<Utc>>,
    pub withdrawn_tx: Option<TxHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PairRow {
    pub fn has_address(&self, address: &str) -> bool {
        self.participant_addresses.values().any(|a| a == address)
    }
}

/// Optional conditions for `PairsQuery::find`. With `assets_ordered` the
/// assets list must match the pair's ordered asset list exactly; otherwise
/// any pair containing all supplied assets matches.
#[derive(Debug, Clone, Default)]
pub struct PairsFilter {
    pub status: Option<PairStatus>,
    pub assets: Option<Vec<Asset>>,
    pub assets_ordered: bool,
    pub addresses: Vec<Address>,
    pub share_value: Option<u32>,
    pub investing_period: Option<u32>,
    pub wallet_security: Option<WalletSecurity>,
    pub strategy: Option<ProfitStrategy>,
    pub loss_protection: Option<f64>,
}

const SELECT_COLUMNS: &str = "id, status, assets, participant_addresses, share_value, \
     investing_period, wallet_security, strategy, loss_protection, wallet, assurances, \
     deposits, withdraw_tx, lp, deadline, withdrawn_tx, created_at, updated_at";

/// `pairs_query` projection: one row per pair, built from every pair event.
#[derive(Clone)]
pub struct PairsQuery {
    db: Db,
}

impl PairsQuery {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self, id: Uuid) -> Result<PairRow> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM pairs_query WHERE id = ?1"),
            params![id.to_string()],
            row_to_pair,
        )
        .optional()?
        .ok_or(Error::PairNotFound)
    }

    pub fn find(&self, filter: &PairsFilter) -> Result<Vec<PairRow>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(assets) = &filter.assets {
            if filter.assets_ordered {
                args.push(Box::new(assets.join(",")));
                clauses.push(format!("assets = ?{}", args.len()));
            } else {
                for asset in assets {
                    args.push(Box::new(format!("%{asset}%")));
                    clauses.push(format!("assets LIKE ?{}", args.len()));
                }
            }
        }
        if !filter.addresses.is_empty() {
            let mut alternatives = Vec::new();
            for address in &filter.addresses {
                args.push(Box::new(format!("%{address}%")));
                alternatives.push(format!("participant_addresses LIKE ?{}", args.len()));
            }
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        if let Some(share_value) = filter.share_value {
            args.push(Box::new(share_value));
            clauses.push(format!("share_value = ?{}", args.len()));
        }
        if let Some(investing_period) = filter.investing_period {
            args.push(Box::new(investing_period));
            clauses.push(format!("investing_period = ?{}", args.len()));
        }
        if let Some(security) = filter.wallet_security {
            args.push(Box::new(security.as_str()));
            clauses.push(format!("wallet_security = ?{}", args.len()));
        }
        if let Some(strategy) = filter.strategy {
            args.push(Box::new(strategy.as_str()));
            clauses.push(format!("strategy = ?{}", args.len()));
        }
        if let Some(loss_protection) = filter.loss_protection {
            args.push(Box::new(loss_protection));
            clauses.push(format!("loss_protection = ?{}", args.len()));
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM pairs_query");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid ASC");

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), row_to_pair)?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }
}

impl Projection for PairsQuery {
    fn name(&self) -> &'static str {
        "pairs_query"
    }

    fn init(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pairs_query (
                id                    TEXT PRIMARY KEY,
                status                TEXT,
                assets                TEXT NOT NULL,
                participant_addresses TEXT NOT NULL,
                share_value           INTEGER NOT NULL,
                investing_period      INTEGER NOT NULL,
                wallet_security       TEXT NOT NULL,
                strategy              TEXT NOT NULL,
                loss_protection       REAL NOT NULL,
                wallet                TEXT,
                assurances            TEXT NOT NULL,
                deposits              TEXT NOT NULL,
                withdraw_tx           TEXT,
                lp                    TEXT NOT NULL,
                deadline              TEXT,
                withdrawn_tx          TEXT,
                created_at            TEXT NOT NULL,
                updated_at            TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<()> {
        if event.aggregate_type != "Pair" {
            return Ok(());
        }

        let id = event.aggregate_id.to_string();
        let ts = event.timestamp.to_rfc3339();

        match PairEvent::decode(&event.kind, event.payload.clone())? {
            PairEvent::Created {
                participant_asset,
                participant_address,
                secondary_asset,
                share_value,
                investing_period,
                wallet_security,
                strategy,
                loss_protection,
            } => {
                let mut addresses = serde_json::Map::new();
                addresses.insert(participant_asset.clone(), json!(participant_address));
                let addresses = serde_json::Value::Object(addresses);
                conn.execute(
                    "INSERT OR IGNORE INTO pairs_query
                         (id, assets, participant_addresses, share_value, investing_period,
                          wallet_security, strategy, loss_protection, assurances, deposits, lp,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '{}', '{}', '{}', ?9, ?9)",
                    params![
                        id,
                        format!("{participant_asset},{secondary_asset}"),
                        addresses.to_string(),
                        share_value,
                        investing_period,
                        wallet_security.as_str(),
                        strategy.as_str(),
                        loss_protection,
                        ts,
                    ],
                )?;
            }
            PairEvent::StatusChanged { status } => {
                conn.execute(
                    "UPDATE pairs_query SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), ts],
                )?;
            }
            PairEvent::Matched {
                participant_address,
                wallet_encryption_key,
                wallet_hex_chain_code,
            } => {
                // The second address is keyed by the pair's secondary asset.
                let assets: String = conn.query_row(
                    "SELECT assets FROM pairs_query WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                let secondary = assets.split(',').nth(1).unwrap_or_default().to_string();
                let wallet = json!({
                    "public_keys": {},
                    "addresses": {},
                    "encryption_key": wallet_encryption_key,
                    "hex_chain_code": wallet_hex_chain_code,
                });
                conn.execute(
                    "UPDATE pairs_query SET
                         participant_addresses = json_set(participant_addresses, ?2, ?3),
                         wallet = json(?4),
                         updated_at = ?5
                     WHERE id = ?1",
                    params![
                        id,
                        json_path(&secondary),
                        participant_address,
                        wallet.to_string(),
                        ts,
                    ],
                )?;
            }
            PairEvent::WalletAddressConfirmed {
                participant_asset,
                public_key,
                wallet_addresses,
            } => {
                conn.execute(
                    "UPDATE pairs_query SET
                         wallet = json_set(wallet, '$.addresses', json(?2), ?3, ?4),
                         updated_at = ?5
                     WHERE id = ?1",
                    params![
                        id,
                        serde_json::to_string(&wallet_addresses)?,
                        format!("$.public_keys.\"{participant_asset}\""),
                        public_key,
                        ts,
                    ],
                )?;
            }
            PairEvent::AssetAssuranceSigned { asset, tx } => {
                let path = json_path(&asset);
                conn.execute(
                    "UPDATE pairs_query SET
                         assurances = json_insert(
                             json_set(assurances, ?2,
                                      json(coalesce(json_extract(assurances, ?2), '[]'))),
                             ?2 || '[#]', json(?3)),
                         updated_at = ?4
                     WHERE id = ?1",
                    params![id, path, serde_json::to_string(&tx)?, ts],
                )?;
            }
            PairEvent::AssetDeposited { asset, tx_hash } => {
                conn.execute(
                    "UPDATE pairs_query SET
                         deposits = json_set(deposits, ?2, ?3),
                         updated_at = ?4
                     WHERE id = ?1",
                    params![id, json_path(&asset), tx_hash, ts],
                )?;
            }
            PairEvent::WithdrawTxSigned { tx } => {
                conn.execute(
                    "UPDATE pairs_query SET withdraw_tx = json(?2), updated_at = ?3 WHERE id = ?1",
                    params![id, serde_json::to_string(&tx)?, ts],
                )?;
            }
            PairEvent::LpDone {
                asset,
                tx_hash,
                deadline,
            } => {
                conn.execute(
                    "UPDATE pairs_query SET
                         lp = json_set(lp, ?2, ?3),
                         deadline = ?4,
                         updated_at = ?5
                     WHERE id = ?1",
                    params![id, json_path(&asset), tx_hash, deadline.to_rfc3339(), ts],
                )?;
            }
            PairEvent::Withdrawn { tx_hash } => {
                conn.execute(
                    "UPDATE pairs_query SET withdrawn_tx = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, tx_hash, ts],
                )?;
            }
        }

        Ok(())
    }
}

/// JSON path addressing a top-level key that may contain dots, e.g.
/// `$."THOR.RUNE"`.
fn json_path(key: &str) -> String {
    format!("$.\"{key}\"")
}

fn row_to_pair(row: &rusqlite::Row<'_>) -> rusqlite::Result<PairRow> {
    fn bad<E: std::error::Error + Send + Sync + 'static>(
        idx: usize,
    ) -> impl FnOnce(E) -> rusqlite::Error {
        move |err| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        }
    }

    let id: String = row.get(0)?;
    let status: Option<String> = row.get(1)?;
    let assets: String = row.get(2)?;
    let addresses: String = row.get(3)?;
    let security: String = row.get(6)?;
    let strategy: String = row.get(7)?;
    let wallet: Option<String> = row.get(9)?;
    let assurances: String = row.get(10)?;
    let deposits: String = row.get(11)?;
    let withdraw_tx: Option<String> = row.get(12)?;
    let lp: String = row.get(13)?;
    let deadline: Option<String> = row.get(14)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(PairRow {
        id: Uuid::parse_str(&id).map_err(bad(0))?,
        status: status.as_deref().and_then(PairStatus::parse),
        assets: assets.split(',').map(str::to_string).collect(),
        participant_addresses: serde_json::from_str(&addresses).map_err(bad(3))?,
        share_value: row.get(4)?,
        investing_period: row.get(5)?,
        wallet_security: WalletSecurity::parse(&security).unwrap_or_default(),
        strategy: ProfitStrategy::parse(&strategy).unwrap_or_default(),
        loss_protection: row.get(8)?,
        wallet: wallet
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(bad(9))?,
        assurances: serde_json::from_str(&assurances).map_err(bad(10))?,
        deposits: serde_json::from_str(&deposits).map_err(bad(11))?,
        withdraw_tx: withdraw_tx
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(bad(12))?,
        lp: serde_json::from_str(&lp).map_err(bad(13))?,
        deadline: deadline
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(bad(14))?
            .map(|dt| dt.with_timezone(&Utc)),
        withdrawn_tx: row.get(15)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(bad(16))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(bad(17))?
            .with_timezone(&Utc),
    })
}
