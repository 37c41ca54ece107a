use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use rand::RngCore;
use uuid::Uuid;

use crate::{
    aggregate::{Repository, Root},
    domain::{Address, Asset, Pair, PairEvent, PairStatus, SignedTx, TxHash},
    error::{Error, Result},
    queries::{PairsFilter, PairsQuery, PlansQuery},
};

/// Save attempts per match before giving up with `match_contested`.
const MATCH_RETRIES: usize = 3;

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}

fn load_pair(repo: &Repository, id: Uuid) -> Result<Root<Pair>> {
    repo.get::<Pair>(id).map_err(|err| match err {
        Error::AggregateNotFound => Error::PairNotFound,
        other => other,
    })
}

fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Command to enter the matchmaking pool for a plan: joins a waiting
/// counterpart pair when one exists, otherwise opens a new waiting pair.
#[derive(Debug, Clone)]
pub struct CreateOrMatchPair {
    pub plan_id: Uuid,
    pub participant_asset: Asset,
    pub participant_address: Address,
}

impl CreateOrMatchPair {
    fn validate(&self) -> Result<()> {
        require(&self.participant_asset, "participant_asset")?;
        if self.participant_address.trim().is_empty() {
            return Err(Error::InvalidAddress);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CreateOrMatchPairHandler {
    repo: Repository,
    plans: PlansQuery,
    pairs: PairsQuery,
}

impl CreateOrMatchPairHandler {
    pub fn new(repo: Repository, plans: PlansQuery, pairs: PairsQuery) -> Self {
        Self { repo, plans, pairs }
    }

    pub async fn handle(&self, cmd: CreateOrMatchPair) -> Result<Uuid> {
        cmd.validate()?;

        let plan = self.plans.get(cmd.plan_id)?;
        if !plan.assets.iter().any(|a| a == &cmd.participant_asset) {
            return Err(Error::InvalidAssetForPlan);
        }
        let secondary_asset = plan
            .assets
            .iter()
            .find(|a| *a != &cmd.participant_asset)
            .cloned()
            .ok_or(Error::InvalidAssetForPlan)?;

        for _ in 0..MATCH_RETRIES {
            // A waiting counterpart holds the secondary asset as its
            // primary and waits for ours.
            let candidates = self.pairs.find(&PairsFilter {
                status: Some(PairStatus::Waiting),
                assets: Some(vec![secondary_asset.clone(), cmd.participant_asset.clone()]),
                assets_ordered: true,
                share_value: Some(plan.quantum),
                investing_period: Some(plan.investing_period),
                wallet_security: Some(plan.security),
                strategy: Some(plan.strategy),
                loss_protection: Some(plan.loss_protection),
                ..PairsFilter::default()
            })?;

            // The read model trails the log, so a candidate may already be
            // matched; only a replayed status of waiting counts.
            let mut matched = None;
            for candidate in &candidates {
                let root = load_pair(&self.repo, candidate.id)?;
                if root.status == Some(PairStatus::Waiting) {
                    matched = Some(root);
                    break;
                }
            }

            let Some(mut pair) = matched else {
                let mut pair = Root::<Pair>::new(Uuid::new_v4());
                pair.track(PairEvent::Created {
                    participant_asset: cmd.participant_asset.clone(),
                    participant_address: cmd.participant_address.clone(),
                    secondary_asset: secondary_asset.clone(),
                    share_value: plan.quantum,
                    investing_period: plan.investing_period,
                    wallet_security: plan.security,
                    strategy: plan.strategy,
                    loss_protection: plan.loss_protection,
                })?;
                pair.track(PairEvent::StatusChanged {
                    status: PairStatus::Waiting,
                })?;
                self.repo.save(&mut pair)?;
                return Ok(pair.id());
            };

            pair.track(PairEvent::Matched {
                participant_address: cmd.participant_address.clone(),
                wallet_encryption_key: random_hex(32),
                wallet_hex_chain_code: random_hex(32),
            })?;
            pair.track(PairEvent::StatusChanged {
                status: PairStatus::WalletConformation,
            })?;

            match self.repo.save(&mut pair) {
                Ok(()) => return Ok(pair.id()),
                Err(Error::ConcurrencyConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::MatchContested)
    }
}

/// Command to confirm the shared wallet addresses and register the
/// participant's wallet public key.
#[derive(Debug, Clone)]
pub struct ConfirmPairWallet {
    pub pair_id: Uuid,
    pub participant_address: Address,
    pub participant_public_key: String,
    pub wallet_addresses: BTreeMap<Asset, Address>,
}

impl ConfirmPairWallet {
    fn validate(&self) -> Result<()> {
        require(&self.participant_public_key, "participant_public_key")?;
        if self.wallet_addresses.len() != 2 {
            return Err(Error::InvalidRequest(
                "wallet_addresses must contain both assets".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ConfirmPairWalletHandler {
    repo: Repository,
}

impl ConfirmPairWalletHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: ConfirmPairWallet) -> Result<Uuid> {
        cmd.validate()?;

        let mut pair = load_pair(&self.repo, cmd.pair_id)?;
        if pair.status != Some(PairStatus::WalletConformation) {
            return Err(Error::InvalidPairStatus);
        }

        let participant_asset = pair
            .asset_for_address(&cmd.participant_address)
            .cloned()
            .ok_or(Error::Forbidden)?;
        if cmd.wallet_addresses.keys().any(|asset| !pair.has_asset(asset)) {
            return Err(Error::InvalidAssetForPlan);
        }

        // The second participant must confirm the exact addresses the
        // first one recorded.
        if let Some(wallet) = &pair.wallet {
            if !wallet.addresses.is_empty() && wallet.addresses != cmd.wallet_addresses {
                return Err(Error::InvalidWalletAddresses);
            }
        }

        pair.track(PairEvent::WalletAddressConfirmed {
            participant_asset,
            public_key: cmd.participant_public_key,
            wallet_addresses: cmd.wallet_addresses,
        })?;
        if pair
            .wallet
            .as_ref()
            .is_some_and(|wallet| wallet.public_keys.len() == 2)
        {
            pair.track(PairEvent::StatusChanged {
                status: PairStatus::Assurance,
            })?;
        }
        self.repo.save(&mut pair)?;

        Ok(pair.id())
    }
}

/// Command to register a participant's pre-signed contingency transfers.
#[derive(Debug, Clone)]
pub struct SetPairAssurances {
    pub pair_id: Uuid,
    pub participant_address: Address,
    pub asset: Asset,
    pub assurances: Vec<SignedTx>,
}

impl SetPairAssurances {
    fn validate(&self) -> Result<()> {
        require(&self.asset, "asset")?;
        if self.assurances.is_empty() {
            return Err(Error::InvalidRequest("assurances are required".into()));
        }
        validate_assurances(&self.asset, &self.assurances)
    }
}

fn validate_assurances(asset: &str, assurances: &[SignedTx]) -> Result<()> {
    let has_nonce = |nonce: u32| assurances.iter().any(|tx| tx.nonce == nonce);

    for nonce in [0, 2] {
        if !has_nonce(nonce) {
            return Err(Error::InvalidAssurances {
                missing: format!("missing assurance with nonce {nonce}"),
            });
        }
    }
    // THOR.RUNE needs one more slot for the withdraw transaction.
    if asset == "THOR.RUNE" && !has_nonce(4) {
        return Err(Error::InvalidAssurances {
            missing: "missing assurance with nonce 4".into(),
        });
    }

    Ok(())
}

#[derive(Clone)]
pub struct SetPairAssurancesHandler {
    repo: Repository,
}

impl SetPairAssurancesHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: SetPairAssurances) -> Result<Uuid> {
        cmd.validate()?;

        let mut pair = load_pair(&self.repo, cmd.pair_id)?;
        if pair.status != Some(PairStatus::Assurance) {
            return Err(Error::InvalidPairStatus);
        }
        if !pair.has_asset(&cmd.asset) {
            return Err(Error::InvalidAssetForPlan);
        }
        if !pair.has_address(&cmd.participant_address) {
            return Err(Error::Forbidden);
        }
        if pair.has_assurances_for(&cmd.asset) {
            return Err(Error::AlreadySetAssurances);
        }

        for tx in cmd.assurances {
            pair.track(PairEvent::AssetAssuranceSigned {
                asset: cmd.asset.clone(),
                tx,
            })?;
        }
        if pair.assurances.len() == 2 {
            pair.track(PairEvent::StatusChanged {
                status: PairStatus::Deposit,
            })?;
        }
        self.repo.save(&mut pair)?;

        Ok(pair.id())
    }
}

/// Command to record a participant's deposit into the shared wallet.
#[derive(Debug, Clone)]
pub struct AddDeposit {
    pub pair_id: Uuid,
    pub participant_address: Address,
    pub asset: Asset,
    pub tx_hash: TxHash,
}

impl AddDeposit {
    fn validate(&self) -> Result<()> {
        require(&self.asset, "asset")?;
        require(&self.tx_hash, "tx_hash")
    }
}

#[derive(Clone)]
pub struct AddDepositHandler {
    repo: Repository,
}

impl AddDepositHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: AddDeposit) -> Result<Uuid> {
        cmd.validate()?;

        let mut pair = load_pair(&self.repo, cmd.pair_id)?;
        if pair.status != Some(PairStatus::Deposit) {
            return Err(Error::InvalidPairStatus);
        }
        if !pair.has_asset(&cmd.asset) {
            return Err(Error::InvalidAssetForPlan);
        }
        if !pair.has_address(&cmd.participant_address) {
            return Err(Error::Forbidden);
        }

        // TODO: verify the deposit transaction hash against the chain
        if pair.has_deposit_for(&cmd.asset) {
            return Err(Error::AlreadyHasDeposit);
        }

        pair.track(PairEvent::AssetDeposited {
            asset: cmd.asset,
            tx_hash: cmd.tx_hash,
        })?;
        if pair.deposits.len() == 2 {
            pair.track(PairEvent::StatusChanged {
                status: PairStatus::PreSignWithdrawal,
            })?;
        }
        self.repo.save(&mut pair)?;

        Ok(pair.id())
    }
}

/// Command to store the co-signed withdrawal transaction.
#[derive(Debug, Clone)]
pub struct SignWithdrawal {
    pub pair_id: Uuid,
    pub participant_address: Address,
    pub tx: SignedTx,
}

#[derive(Clone)]
pub struct SignWithdrawalHandler {
    repo: Repository,
}

impl SignWithdrawalHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: SignWithdrawal) -> Result<Uuid> {
        let mut pair = load_pair(&self.repo, cmd.pair_id)?;
        if pair.status != Some(PairStatus::PreSignWithdrawal) {
            return Err(Error::InvalidPairStatus);
        }
        if !pair.has_address(&cmd.participant_address) {
            return Err(Error::Forbidden);
        }

        pair.track(PairEvent::WithdrawTxSigned { tx: cmd.tx })?;
        pair.track(PairEvent::StatusChanged {
            status: PairStatus::Lp,
        })?;
        self.repo.save(&mut pair)?;

        Ok(pair.id())
    }
}

/// Command to record one leg of the liquidity-pool provision. The position
/// deadline starts counting from the first recorded leg.
#[derive(Debug, Clone)]
pub struct LpPair {
    pub pair_id: Uuid,
    pub participant_address: Address,
    pub asset: Asset,
    pub tx_hash: TxHash,
}

impl LpPair {
    fn validate(&self) -> Result<()> {
        require(&self.asset, "asset")?;
        require(&self.tx_hash, "tx_hash")
    }
}

#[derive(Clone)]
pub struct LpPairHandler {
    repo: Repository,
}

impl LpPairHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: LpPair) -> Result<Uuid> {
        cmd.validate()?;

        let mut pair = load_pair(&self.repo, cmd.pair_id)?;
        if pair.status != Some(PairStatus::Lp) {
            return Err(Error::InvalidPairStatus);
        }
        if !pair.has_asset(&cmd.asset) {
            return Err(Error::InvalidAssetForPlan);
        }
        if !pair.has_address(&cmd.participant_address) {
            return Err(Error::Forbidden);
        }
        if pair.has_lp_for(&cmd.asset) {
            return Err(Error::AlreadyHasLp);
        }

        let deadline = Utc::now() + Duration::weeks(pair.investing_period as i64);
        pair.track(PairEvent::LpDone {
            asset: cmd.asset,
            tx_hash: cmd.tx_hash,
            deadline,
        })?;
        self.repo.save(&mut pair)?;

        Ok(pair.id())
    }
}

/// Command to record the dissolution of the position once the co-signed
/// withdrawal has been broadcast.
#[derive(Debug, Clone)]
pub struct SubmitWithdrawal {
    pub pair_id: Uuid,
    pub participant_address: Address,
    pub tx_hash: TxHash,
}

impl SubmitWithdrawal {
    fn validate(&self) -> Result<()> {
        require(&self.tx_hash, "tx_hash")
    }
}

#[derive(Clone)]
pub struct SubmitWithdrawalHandler {
    repo: Repository,
}

impl SubmitWithdrawalHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: SubmitWithdrawal) -> Result<Uuid> {
        cmd.validate()?;

        let mut pair = load_pair(&self.repo, cmd.pair_id)?;
        if pair.status != Some(PairStatus::Lp) || pair.lp.len() != 2 {
            return Err(Error::InvalidPairStatus);
        }
        if !pair.has_address(&cmd.participant_address) {
            return Err(Error::Forbidden);
        }

        pair.track(PairEvent::Withdrawn {
            tx_hash: cmd.tx_hash,
        })?;
        pair.track(PairEvent::StatusChanged {
            status: PairStatus::Withdrawn,
        })?;
        self.repo.save(&mut pair)?;

        Ok(pair.id())
    }
}
