use uuid::Uuid;

use crate::{
    aggregate::{Repository, Root},
    domain::{Asset, Plan, PlanEvent, ProfitStrategy, WalletSecurity},
    error::{Error, Result},
};

/// Command to register a new immutable plan.
#[derive(Debug, Clone)]
pub struct CreateNewPlan {
    pub assets: Vec<Asset>,
    pub security: WalletSecurity,
    pub strategy: ProfitStrategy,
    pub quantum: u32,
    pub loss_protection: f64,
    pub investing_period: u32,
}

impl CreateNewPlan {
    fn validate(&self) -> Result<()> {
        if self.assets.len() != 2 {
            return Err(Error::InvalidRequest("exactly two assets are required".into()));
        }
        if self.assets[0] == self.assets[1] {
            return Err(Error::InvalidRequest("assets must be distinct".into()));
        }
        if self.assets.iter().any(|a| a.trim().is_empty()) {
            return Err(Error::InvalidRequest("assets must not be empty".into()));
        }
        if self.quantum < 1 {
            return Err(Error::InvalidRequest("quantum must be at least 1".into()));
        }
        if !(0.1..=0.5).contains(&self.loss_protection) {
            return Err(Error::InvalidRequest(
                "loss_protection must be between 0.1 and 0.5".into(),
            ));
        }
        if self.investing_period < 1 {
            return Err(Error::InvalidRequest(
                "investing_period must be at least 1 week".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CreateNewPlanHandler {
    repo: Repository,
}

impl CreateNewPlanHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn handle(&self, cmd: CreateNewPlan) -> Result<Uuid> {
        cmd.validate()?;

        let mut plan = Root::<Plan>::new(Uuid::new_v4());
        plan.track(PlanEvent::Created {
            assets: cmd.assets,
            security: cmd.security,
            strategy: cmd.strategy,
            quantum: cmd.quantum,
            loss_protection: cmd.loss_protection,
            investing_period: cmd.investing_period,
        })?;
        self.repo.save(&mut plan)?;

        Ok(plan.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::Db, store::EventStore};

    fn handler() -> (CreateNewPlanHandler, Repository) {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        store.migrate().unwrap();
        let repo = Repository::new(store);
        (CreateNewPlanHandler::new(repo.clone()), repo)
    }

    fn command() -> CreateNewPlan {
        CreateNewPlan {
            assets: vec!["THOR.RUNE".into(), "BTC.BTC".into()],
            security: WalletSecurity::TwoOfTwo,
            strategy: ProfitStrategy::EqualShare,
            quantum: 100,
            loss_protection: 0.1,
            investing_period: 4,
        }
    }

    #[tokio::test]
    async fn creates_a_plan() {
        let (handler, repo) = handler();
        let id = handler.handle(command()).await.unwrap();

        let plan = repo.get::<Plan>(id).unwrap();
        assert_eq!(plan.assets, vec!["THOR.RUNE", "BTC.BTC"]);
        assert_eq!(plan.quantum, 100);
        assert_eq!(plan.version(), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_assets() {
        let (handler, _) = handler();
        let err = handler
            .handle(CreateNewPlan {
                assets: vec!["BTC.BTC".into(), "BTC.BTC".into()],
                ..command()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn rejects_out_of_range_loss_protection() {
        let (handler, _) = handler();
        let err = handler
            .handle(CreateNewPlan {
                loss_protection: 0.75,
                ..command()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
