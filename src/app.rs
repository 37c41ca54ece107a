use std::sync::Arc;

use tracing::error;

use crate::{
    aggregate::Repository,
    commands::{
        AddDepositHandler, ConfirmPairWalletHandler, CreateNewPlanHandler,
        CreateOrMatchPairHandler, LpPairHandler, SetPairAssurancesHandler, SignWithdrawalHandler,
        SubmitWithdrawalHandler,
    },
    db::Db,
    error::Result,
    projection::{Group, GroupHandle, Runner},
    queries::{PairsQuery, PlansQuery},
    store::EventStore,
};

pub struct Commands {
    pub create_new_plan: CreateNewPlanHandler,
    pub create_or_match_pair: CreateOrMatchPairHandler,
    pub confirm_pair_wallet: ConfirmPairWalletHandler,
    pub set_pair_assurances: SetPairAssurancesHandler,
    pub add_deposit: AddDepositHandler,
    pub sign_withdrawal: SignWithdrawalHandler,
    pub lp_pair: LpPairHandler,
    pub submit_withdrawal: SubmitWithdrawalHandler,
}

pub struct Queries {
    pub plans: PlansQuery,
    pub pairs: PairsQuery,
}

/// Wires the event store, command handlers, read models and the projection
/// group over one database.
pub struct Application {
    pub commands: Commands,
    pub queries: Queries,
    runners: Vec<Arc<Runner>>,
    group: Option<GroupHandle>,
}

impl Application {
    pub fn new(db: Db) -> Result<Self> {
        let store = EventStore::new(db.clone());
        store.migrate()?;
        let repo = Repository::new(store.clone());

        let plans = PlansQuery::new(db.clone());
        let pairs = PairsQuery::new(db.clone());
        let runners = vec![
            Arc::new(Runner::new(
                db.clone(),
                store.clone(),
                Arc::new(plans.clone()),
            )?),
            Arc::new(Runner::new(
                db.clone(),
                store.clone(),
                Arc::new(pairs.clone()),
            )?),
        ];

        Ok(Self {
            commands: Commands {
                create_new_plan: CreateNewPlanHandler::new(repo.clone()),
                create_or_match_pair: CreateOrMatchPairHandler::new(
                    repo.clone(),
                    plans.clone(),
                    pairs.clone(),
                ),
                confirm_pair_wallet: ConfirmPairWalletHandler::new(repo.clone()),
                set_pair_assurances: SetPairAssurancesHandler::new(repo.clone()),
                add_deposit: AddDepositHandler::new(repo.clone()),
                sign_withdrawal: SignWithdrawalHandler::new(repo.clone()),
                lp_pair: LpPairHandler::new(repo.clone()),
                submit_withdrawal: SubmitWithdrawalHandler::new(repo),
            },
            queries: Queries { plans, pairs },
            runners,
            group: None,
        })
    }

    /// Drains every pending event into the read models synchronously.
    pub fn catch_up_projections(&self) -> Result<()> {
        for runner in &self.runners {
            runner.catch_up()?;
        }
        Ok(())
    }

    /// Starts the projection loops and a task logging their errors.
    pub fn start_projections(&mut self) {
        if self.group.is_some() {
            return;
        }

        let mut handle = Group::new(self.runners.clone()).start();
        if let Some(mut errors) = handle.take_errors() {
            tokio::spawn(async move {
                while let Some(failure) = errors.recv().await {
                    error!(projection = failure.name, error = %failure.error, "projection error");
                }
            });
        }
        self.group = Some(handle);
    }

    pub fn stop_projections(&self) {
        if let Some(group) = &self.group {
            group.stop();
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.stop_projections();
    }
}
