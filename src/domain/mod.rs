mod pair;
mod plan;

pub use pair::{MultisigWallet, Pair, PairEvent, PairStatus};
pub use plan::{Plan, PlanEvent};

use serde::{Deserialize, Serialize};

/// Chain-qualified asset identifier, e.g. `THOR.RUNE` or `ETH.ETH`.
pub type Asset = String;

/// Blockchain account address in its chain-native string form.
pub type Address = String;

/// Transaction hash as submitted by a participant.
pub type TxHash = String;

/// A transaction signed by both participants ahead of time, authorizing a
/// contingency transfer at a fixed account nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub nonce: u32,
    pub tx: String,
    pub signature: String,
}

/// Threshold-signature scheme of the shared wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletSecurity {
    #[default]
    #[serde(rename = "2-2")]
    TwoOfTwo,
}

impl WalletSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TwoOfTwo => "2-2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "2-2" => Some(Self::TwoOfTwo),
            _ => None,
        }
    }
}

/// How the withdrawn position is split between the participants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitStrategy {
    #[default]
    EqualShare,
}

impl ProfitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EqualShare => "equal_share",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "equal_share" => Some(Self::EqualShare),
            _ => None,
        }
    }
}
