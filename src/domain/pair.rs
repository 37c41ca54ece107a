use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Address, Asset, ProfitStrategy, SignedTx, TxHash, WalletSecurity};
use crate::{
    aggregate::{Aggregate, DomainEvent},
    error::{Error, Result},
};

/// Lifecycle of a pair, in transition order. `Invalid` is declared terminal;
/// no command currently drives a pair into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Waiting,
    WalletConformation,
    Assurance,
    Deposit,
    PreSignWithdrawal,
    Lp,
    Withdrawn,
    Invalid,
}

impl PairStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "wallet_conformation" => Some(Self::WalletConformation),
            "assurance" => Some(Self::Assurance),
            "deposit" => Some(Self::Deposit),
            "pre_sign_withdrawal" => Some(Self::PreSignWithdrawal),
            "lp" => Some(Self::Lp),
            "withdrawn" => Some(Self::Withdrawn),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::WalletConformation => "wallet_conformation",
            Self::Assurance => "assurance",
            Self::Deposit => "deposit",
            Self::PreSignWithdrawal => "pre_sign_withdrawal",
            Self::Lp => "lp",
            Self::Withdrawn => "withdrawn",
            Self::Invalid => "invalid",
        }
    }
}

/// Shared threshold-signed wallet being assembled by the two participants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultisigWallet {
    pub public_keys: BTreeMap<Asset, String>,
    pub addresses: BTreeMap<Asset, Address>,
    pub encryption_key: String,
    pub hex_chain_code: String,
}

/// The matchmaking-and-custody unit for two participants across two assets.
///
/// `assets[0]` is the asset of the participant who opened the pair;
/// `assets[1]` is the counterpart asset the pair is waiting to be matched
/// on. Plan parameters are copied in at creation so later plan edits can
/// never retroactively change a running pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Pair {
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
}

impl Pair {
    pub fn has_asset(&self, asset: &str) -> bool {
        self.assets.iter().any(|a| a == asset)
    }

    /// Asset held by the participant with the given address, if they are
    /// part of this pair.
    pub fn asset_for_address(&self, address: &str) -> Option<&Asset> {
        self.participant_addresses
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(asset, _)| asset)
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.asset_for_address(address).is_some()
    }

    pub fn has_assurances_for(&self, asset: &str) -> bool {
        self.assurances.get(asset).is_some_and(|txs| !txs.is_empty())
    }

    pub fn has_deposit_for(&self, asset: &str) -> bool {
        self.deposits.contains_key(asset)
    }

    pub fn has_lp_for(&self, asset: &str) -> bool {
        self.lp.contains_key(asset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PairEvent {
    #[serde(rename = "PairCreated")]
    Created {
        participant_asset: Asset,
        participant_address: Address,
        secondary_asset: Asset,
        share_value: u32,
        investing_period: u32,
        wallet_security: WalletSecurity,
        strategy: ProfitStrategy,
        loss_protection: f64,
    },
    #[serde(rename = "PairStatusChanged")]
    StatusChanged { status: PairStatus },
    #[serde(rename = "PairMatched")]
    Matched {
        participant_address: Address,
        wallet_encryption_key: String,
        wallet_hex_chain_code: String,
    },
    #[serde(rename = "WalletAddressConfirmed")]
    WalletAddressConfirmed {
        participant_asset: Asset,
        public_key: String,
        wallet_addresses: BTreeMap<Asset, Address>,
    },
    #[serde(rename = "AssetAssuranceSigned")]
    AssetAssuranceSigned { asset: Asset, tx: SignedTx },
    #[serde(rename = "AssetDeposited")]
    AssetDeposited { asset: Asset, tx_hash: TxHash },
    #[serde(rename = "WithdrawTxSigned")]
    WithdrawTxSigned { tx: SignedTx },
    #[serde(rename = "LPDone")]
    LpDone {
        asset: Asset,
        tx_hash: TxHash,
        deadline: DateTime<Utc>,
    },
    #[serde(rename = "Withdrawn")]
    Withdrawn { tx_hash: TxHash },
}

const PAIR_EVENT_KINDS: &[&str] = &[
    "PairCreated",
    "PairStatusChanged",
    "PairMatched",
    "WalletAddressConfirmed",
    "AssetAssuranceSigned",
    "AssetDeposited",
    "WithdrawTxSigned",
    "LPDone",
    "Withdrawn",
];

impl DomainEvent for PairEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "PairCreated",
            Self::StatusChanged { .. } => "PairStatusChanged",
            Self::Matched { .. } => "PairMatched",
            Self::WalletAddressConfirmed { .. } => "WalletAddressConfirmed",
            Self::AssetAssuranceSigned { .. } => "AssetAssuranceSigned",
            Self::AssetDeposited { .. } => "AssetDeposited",
            Self::WithdrawTxSigned { .. } => "WithdrawTxSigned",
            Self::LpDone { .. } => "LPDone",
            Self::Withdrawn { .. } => "Withdrawn",
        }
    }

    fn kinds() -> &'static [&'static str] {
        PAIR_EVENT_KINDS
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

impl Aggregate for Pair {
    const KIND: &'static str = "Pair";
    type Event = PairEvent;

    fn apply(&mut self, event: &PairEvent) {
        match event {
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
                self.assets = vec![participant_asset.clone(), secondary_asset.clone()];
                self.participant_addresses
                    .insert(participant_asset.clone(), participant_address.clone());
                self.share_value = *share_value;
                self.investing_period = *investing_period;
                self.wallet_security = *wallet_security;
                self.strategy = *strategy;
                self.loss_protection = *loss_protection;
            }
            PairEvent::StatusChanged { status } => {
                self.status = Some(*status);
            }
            PairEvent::Matched {
                participant_address,
                wallet_encryption_key,
                wallet_hex_chain_code,
            } => {
                // The matching participant holds the counterpart asset.
                if let Some(secondary) = self.assets.get(1).cloned() {
                    self.participant_addresses
                        .insert(secondary, participant_address.clone());
                }
                self.wallet = Some(MultisigWallet {
                    encryption_key: wallet_encryption_key.clone(),
                    hex_chain_code: wallet_hex_chain_code.clone(),
                    ..MultisigWallet::default()
                });
            }
            PairEvent::WalletAddressConfirmed {
                participant_asset,
                public_key,
                wallet_addresses,
            } => {
                if let Some(wallet) = self.wallet.as_mut() {
                    wallet.addresses = wallet_addresses.clone();
                    wallet
                        .public_keys
                        .insert(participant_asset.clone(), public_key.clone());
                }
            }
            PairEvent::AssetAssuranceSigned { asset, tx } => {
                self.assurances.entry(asset.clone()).or_default().push(tx.clone());
            }
            PairEvent::AssetDeposited { asset, tx_hash } => {
                self.deposits.insert(asset.clone(), tx_hash.clone());
            }
            PairEvent::WithdrawTxSigned { tx } => {
                self.withdraw_tx = Some(tx.clone());
            }
            PairEvent::LpDone {
                asset,
                tx_hash,
                deadline,
            } => {
                self.lp.insert(asset.clone(), tx_hash.clone());
                self.deadline = Some(*deadline);
            }
            PairEvent::Withdrawn { tx_hash } => {
                self.withdrawn_tx = Some(tx_hash.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> PairEvent {
        PairEvent::Created {
            participant_asset: "THOR.RUNE".into(),
            participant_address: "thor1alice".into(),
            secondary_asset: "BTC.BTC".into(),
            share_value: 100,
            investing_period: 4,
            wallet_security: WalletSecurity::TwoOfTwo,
            strategy: ProfitStrategy::EqualShare,
            loss_protection: 0.1,
        }
    }

    fn signed_tx(nonce: u32) -> SignedTx {
        SignedTx {
            nonce,
            tx: format!("dHgtbm9uY2Ut{nonce}"),
            signature: "c2ln".into(),
        }
    }

    #[test]
    fn created_seeds_primary_participant() {
        let mut pair = Pair::default();
        pair.apply(&created());
        pair.apply(&PairEvent::StatusChanged {
            status: PairStatus::Waiting,
        });

        assert_eq!(pair.status, Some(PairStatus::Waiting));
        assert_eq!(pair.assets, vec!["THOR.RUNE", "BTC.BTC"]);
        assert_eq!(pair.participant_addresses.len(), 1);
        assert_eq!(
            pair.participant_addresses.get("THOR.RUNE").map(String::as_str),
            Some("thor1alice")
        );
    }

    #[test]
    fn matched_adds_counterpart_under_secondary_asset() {
        let mut pair = Pair::default();
        pair.apply(&created());
        pair.apply(&PairEvent::Matched {
            participant_address: "bc1bob".into(),
            wallet_encryption_key: "656e63".into(),
            wallet_hex_chain_code: "636f6465".into(),
        });

        assert_eq!(pair.participant_addresses.len(), 2);
        assert_eq!(
            pair.participant_addresses.get("BTC.BTC").map(String::as_str),
            Some("bc1bob")
        );
        let wallet = pair.wallet.as_ref().unwrap();
        assert_eq!(wallet.encryption_key, "656e63");
        assert!(wallet.public_keys.is_empty());
        assert_eq!(pair.asset_for_address("bc1bob").unwrap(), "BTC.BTC");
    }

    #[test]
    fn wallet_confirmation_collects_public_keys() {
        let mut pair = Pair::default();
        pair.apply(&created());
        pair.apply(&PairEvent::Matched {
            participant_address: "bc1bob".into(),
            wallet_encryption_key: "656e63".into(),
            wallet_hex_chain_code: "636f6465".into(),
        });

        let addresses: BTreeMap<Asset, Address> = [
            ("THOR.RUNE".to_string(), "thor1shared".to_string()),
            ("BTC.BTC".to_string(), "bc1shared".to_string()),
        ]
        .into();

        pair.apply(&PairEvent::WalletAddressConfirmed {
            participant_asset: "THOR.RUNE".into(),
            public_key: "pk-alice".into(),
            wallet_addresses: addresses.clone(),
        });
        pair.apply(&PairEvent::WalletAddressConfirmed {
            participant_asset: "BTC.BTC".into(),
            public_key: "pk-bob".into(),
            wallet_addresses: addresses.clone(),
        });

        let wallet = pair.wallet.as_ref().unwrap();
        assert_eq!(wallet.public_keys.len(), 2);
        assert_eq!(wallet.addresses, addresses);
    }

    #[test]
    fn assurances_append_per_asset() {
        let mut pair = Pair::default();
        pair.apply(&created());
        pair.apply(&PairEvent::AssetAssuranceSigned {
            asset: "THOR.RUNE".into(),
            tx: signed_tx(0),
        });
        pair.apply(&PairEvent::AssetAssuranceSigned {
            asset: "THOR.RUNE".into(),
            tx: signed_tx(2),
        });

        assert!(pair.has_assurances_for("THOR.RUNE"));
        assert!(!pair.has_assurances_for("BTC.BTC"));
        assert_eq!(pair.assurances["THOR.RUNE"].len(), 2);
    }

    #[test]
    fn lp_records_leg_and_deadline() {
        let deadline = Utc::now();
        let mut pair = Pair::default();
        pair.apply(&created());
        pair.apply(&PairEvent::LpDone {
            asset: "THOR.RUNE".into(),
            tx_hash: "aabb".into(),
            deadline,
        });

        assert!(pair.has_lp_for("THOR.RUNE"));
        assert_eq!(pair.deadline, Some(deadline));
    }

    #[test]
    fn status_order_is_monotonic() {
        assert!(PairStatus::Waiting < PairStatus::WalletConformation);
        assert!(PairStatus::WalletConformation < PairStatus::Assurance);
        assert!(PairStatus::Assurance < PairStatus::Deposit);
        assert!(PairStatus::Deposit < PairStatus::PreSignWithdrawal);
        assert!(PairStatus::PreSignWithdrawal < PairStatus::Lp);
        assert!(PairStatus::Lp < PairStatus::Withdrawn);
    }

    #[test]
    fn events_survive_encode_decode() {
        let event = PairEvent::LpDone {
            asset: "BTC.BTC".into(),
            tx_hash: "ff00".into(),
            deadline: Utc::now(),
        };
        let payload = event.encode().unwrap();
        assert_eq!(payload["kind"], "LPDone");

        let decoded = PairEvent::decode("LPDone", payload).unwrap();
        match decoded {
            PairEvent::LpDone { asset, .. } => assert_eq!(asset, "BTC.BTC"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
