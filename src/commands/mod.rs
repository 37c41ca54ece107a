mod pair;
mod plan;

pub use pair::{
    AddDeposit, AddDepositHandler, ConfirmPairWallet, ConfirmPairWalletHandler, CreateOrMatchPair,
    CreateOrMatchPairHandler, LpPair, LpPairHandler, SetPairAssurances, SetPairAssurancesHandler,
    SignWithdrawal, SignWithdrawalHandler, SubmitWithdrawal, SubmitWithdrawalHandler,
};
pub use plan::{CreateNewPlan, CreateNewPlanHandler};
