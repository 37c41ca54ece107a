use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Asset, ProfitStrategy, WalletSecurity};
use crate::{
    aggregate::{Aggregate, DomainEvent},
    error::{Error, Result},
};

/// Immutable template for an investment round: the asset pair, the shared
/// wallet security scheme, the profit strategy, the per-participant share
/// value in USD and the investing period in weeks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub assets: Vec<Asset>,
    pub security: WalletSecurity,
    pub strategy: ProfitStrategy,
    pub quantum: u32,
    pub loss_protection: f64,
    pub investing_period: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PlanEvent {
    #[serde(rename = "PlanCreated")]
    Created {
        assets: Vec<Asset>,
        security: WalletSecurity,
        strategy: ProfitStrategy,
        quantum: u32,
        loss_protection: f64,
        investing_period: u32,
    },
}

impl DomainEvent for PlanEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "PlanCreated",
        }
    }

    fn kinds() -> &'static [&'static str] {
        &["PlanCreated"]
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

impl Aggregate for Plan {
    const KIND: &'static str = "Plan";
    type Event = PlanEvent;

    fn apply(&mut self, event: &PlanEvent) {
        match event {
            PlanEvent::Created {
                assets,
                security,
                strategy,
                quantum,
                loss_protection,
                investing_period,
            } => {
                self.assets = assets.clone();
                self.security = *security;
                self.strategy = *strategy;
                self.quantum = *quantum;
                self.loss_protection = *loss_protection;
                self.investing_period = *investing_period;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_sets_all_fields() {
        let mut plan = Plan::default();
        plan.apply(&PlanEvent::Created {
            assets: vec!["THOR.RUNE".into(), "BTC.BTC".into()],
            security: WalletSecurity::TwoOfTwo,
            strategy: ProfitStrategy::EqualShare,
            quantum: 100,
            loss_protection: 0.1,
            investing_period: 4,
        });

        assert_eq!(plan.assets, vec!["THOR.RUNE", "BTC.BTC"]);
        assert_eq!(plan.quantum, 100);
        assert_eq!(plan.investing_period, 4);
        assert!((plan.loss_protection - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn event_round_trips_through_payload() {
        let event = PlanEvent::Created {
            assets: vec!["THOR.RUNE".into(), "ETH.ETH".into()],
            security: WalletSecurity::TwoOfTwo,
            strategy: ProfitStrategy::EqualShare,
            quantum: 250,
            loss_protection: 0.25,
            investing_period: 2,
        };

        let payload = event.encode().unwrap();
        assert_eq!(payload["kind"], "PlanCreated");
        assert_eq!(payload["security"], "2-2");
        assert_eq!(payload["strategy"], "equal_share");

        let decoded = PlanEvent::decode("PlanCreated", payload).unwrap();
        let PlanEvent::Created { quantum, .. } = decoded;
        assert_eq!(quantum, 250);
    }
}
