mod pairs;
mod plans;

pub use pairs::{PairRow, PairsFilter, PairsQuery};
pub use plans::{PlanRow, PlansQuery};
