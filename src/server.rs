use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    app::Application,
    auth::{AuthenticationDb, Chain, Token},
    commands::{
        AddDeposit, ConfirmPairWallet, CreateNewPlan, CreateOrMatchPair, LpPair,
        SetPairAssurances, SignWithdrawal, SubmitWithdrawal,
    },
    domain::{Address, Asset, ProfitStrategy, SignedTx, TxHash, WalletSecurity},
    error::{Error, Result},
    queries::{PairRow, PairsFilter, PlanRow},
};

#[derive(Clone)]
pub struct AppState {
    pub app: Arc<Application>,
    pub auth: Arc<AuthenticationDb>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/init", post(init_auth))
        .route("/auth/verify", post(verify_auth))
        .route("/plans", get(get_plans).post(create_plan))
        .route("/plan/:id", get(get_plan))
        .route("/pairs", post(create_or_match_pair).get(get_pairs))
        .route("/pairs/:id", get(get_pair))
        .route("/pairs/:id/confirm-wallet", post(confirm_pair_wallet))
        .route("/pairs/:id/assurances", post(set_pair_assurances))
        .route("/pairs/:id/deposits", post(add_deposit))
        .route("/pairs/:id/sign-withdraw", post(sign_withdrawal))
        .route("/pairs/:id/submit-lp", post(submit_lp))
        .route("/pairs/:id/submit-withdrawal", post(submit_withdrawal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(app: Arc<Application>, auth: Arc<AuthenticationDb>, port: u16) -> Result<()> {
    let router = build_router(AppState { app, auth });
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}

fn bearer_token(state: &AppState, headers: &HeaderMap) -> Result<Token> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::AuthFailed)?;
    let id = value.strip_prefix("Bearer ").ok_or(Error::AuthFailed)?;
    state.auth.extract(id.trim())
}

fn parse_pair_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| Error::InvalidRequest("pair id is not a valid uuid".into()))
}

#[derive(Deserialize)]
struct InitAuthRequest {
    chain: Chain,
    pub_key: String,
}

async fn init_auth(
    State(state): State<AppState>,
    Json(req): Json<InitAuthRequest>,
) -> Result<Json<Token>> {
    let pub_key =
        hex::decode(&req.pub_key).map_err(|err| Error::InvalidPublicKey(err.to_string()))?;
    let token = state.auth.init(req.chain, &pub_key)?;
    Ok(Json(token))
}

#[derive(Deserialize)]
struct VerifyAuthRequest {
    id: Uuid,
    signature: String,
}

async fn verify_auth(
    State(state): State<AppState>,
    Json(req): Json<VerifyAuthRequest>,
) -> Result<StatusCode> {
    let signature =
        hex::decode(&req.signature).map_err(|err| Error::AuthVerificationFailed(err.to_string()))?;
    state.auth.verify(req.id, &signature)?;
    Ok(StatusCode::OK)
}

async fn get_plans(State(state): State<AppState>) -> Result<Json<Vec<PlanRow>>> {
    Ok(Json(state.app.queries.plans.all()?))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PlanRow>> {
    let id = Uuid::parse_str(&id).map_err(|_| Error::InvalidPlanId)?;
    Ok(Json(state.app.queries.plans.get(id)?))
}

#[derive(Deserialize)]
struct CreatePlanRequest {
    assets: Vec<Asset>,
    security: WalletSecurity,
    strategy: ProfitStrategy,
    quantum: u32,
    loss_protection: f64,
    investing_period: u32,
}

#[derive(Serialize)]
struct IdResponse {
    id: Uuid,
}

async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<Json<IdResponse>> {
    let id = state
        .app
        .commands
        .create_new_plan
        .handle(CreateNewPlan {
            assets: req.assets,
            security: req.security,
            strategy: req.strategy,
            quantum: req.quantum,
            loss_protection: req.loss_protection,
            investing_period: req.investing_period,
        })
        .await?;
    Ok(Json(IdResponse { id }))
}

#[derive(Deserialize)]
struct CreateOrMatchPairRequest {
    plan_id: String,
    participant_asset: Asset,
}

async fn create_or_match_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrMatchPairRequest>,
) -> Result<Json<IdResponse>> {
    let token = bearer_token(&state, &headers)?;
    if !req.participant_asset.starts_with(token.chain.prefix()) {
        return Err(Error::Forbidden);
    }

    let plan_id = Uuid::parse_str(&req.plan_id).map_err(|_| Error::InvalidPlanId)?;
    let id = state
        .app
        .commands
        .create_or_match_pair
        .handle(CreateOrMatchPair {
            plan_id,
            participant_asset: req.participant_asset,
            participant_address: token.address,
        })
        .await?;
    Ok(Json(IdResponse { id }))
}

async fn get_pair(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PairRow>> {
    let token = bearer_token(&state, &headers)?;
    let pair = state.app.queries.pairs.get(parse_pair_id(&id)?)?;
    if !pair.has_address(&token.address) {
        return Err(Error::Forbidden);
    }
    Ok(Json(pair))
}

#[derive(Deserialize)]
struct GetPairsParams {
    plan_id: Option<String>,
}

async fn get_pairs(
    State(state): State<AppState>,
    Query(params): Query<GetPairsParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<PairRow>>> {
    let plan_id = params
        .plan_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or(Error::InvalidPlanId)?;
    let token = bearer_token(&state, &headers)?;

    let plan = state.app.queries.plans.get(plan_id)?;
    let pairs = state.app.queries.pairs.find(&PairsFilter {
        assets: Some(plan.assets),
        assets_ordered: false,
        addresses: vec![token.address],
        share_value: Some(plan.quantum),
        investing_period: Some(plan.investing_period),
        wallet_security: Some(plan.security),
        strategy: Some(plan.strategy),
        loss_protection: Some(plan.loss_protection),
        ..PairsFilter::default()
    })?;
    Ok(Json(pairs))
}

#[derive(Deserialize)]
struct ConfirmPairWalletRequest {
    participant_public_key: String,
    wallet_addresses: BTreeMap<Asset, Address>,
}

async fn confirm_pair_wallet(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ConfirmPairWalletRequest>,
) -> Result<StatusCode> {
    let token = bearer_token(&state, &headers)?;
    state
        .app
        .commands
        .confirm_pair_wallet
        .handle(ConfirmPairWallet {
            pair_id: parse_pair_id(&id)?,
            participant_address: token.address,
            participant_public_key: req.participant_public_key,
            wallet_addresses: req.wallet_addresses,
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SetPairAssurancesRequest {
    asset: Asset,
    assurances: Vec<SignedTx>,
}

async fn set_pair_assurances(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetPairAssurancesRequest>,
) -> Result<StatusCode> {
    let token = bearer_token(&state, &headers)?;
    state
        .app
        .commands
        .set_pair_assurances
        .handle(SetPairAssurances {
            pair_id: parse_pair_id(&id)?,
            participant_address: token.address,
            asset: req.asset,
            assurances: req.assurances,
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct AddDepositRequest {
    asset: Asset,
    tx_hash: TxHash,
}

async fn add_deposit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AddDepositRequest>,
) -> Result<StatusCode> {
    let token = bearer_token(&state, &headers)?;
    state
        .app
        .commands
        .add_deposit
        .handle(AddDeposit {
            pair_id: parse_pair_id(&id)?,
            participant_address: token.address,
            asset: req.asset,
            tx_hash: req.tx_hash,
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SignWithdrawalRequest {
    tx: SignedTx,
}

async fn sign_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SignWithdrawalRequest>,
) -> Result<StatusCode> {
    let token = bearer_token(&state, &headers)?;
    state
        .app
        .commands
        .sign_withdrawal
        .handle(SignWithdrawal {
            pair_id: parse_pair_id(&id)?,
            participant_address: token.address,
            tx: req.tx,
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SubmitLpRequest {
    asset: Asset,
    tx_hash: TxHash,
}

async fn submit_lp(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SubmitLpRequest>,
) -> Result<StatusCode> {
    let token = bearer_token(&state, &headers)?;
    state
        .app
        .commands
        .lp_pair
        .handle(LpPair {
            pair_id: parse_pair_id(&id)?,
            participant_address: token.address,
            asset: req.asset,
            tx_hash: req.tx_hash,
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SubmitWithdrawalRequest {
    tx_hash: TxHash,
}

async fn submit_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SubmitWithdrawalRequest>,
) -> Result<StatusCode> {
    let token = bearer_token(&state, &headers)?;
    state
        .app
        .commands
        .submit_withdrawal
        .handle(SubmitWithdrawal {
            pair_id: parse_pair_id(&id)?,
            participant_address: token.address,
            tx_hash: req.tx_hash,
        })
        .await?;
    Ok(StatusCode::OK)
}
