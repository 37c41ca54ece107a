use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("plan id is not a valid uuid")]
    InvalidPlanId,
    #[error("address is required")]
    InvalidAddress,
    #[error("participant asset is not valid for the plan")]
    InvalidAssetForPlan,
    #[error("pair status is not valid for this operation")]
    InvalidPairStatus,
    #[error("wallet addresses are not the same for both participants")]
    InvalidWalletAddresses,
    #[error("assurances are not valid")]
    InvalidAssurances { missing: String },
    #[error("failed to derive an address for this pair of chain and public key")]
    InvalidPublicKey(String),
    #[error("pair not found")]
    PairNotFound,
    #[error("plan not found")]
    PlanNotFound,
    #[error("assurances are already set for this asset")]
    AlreadySetAssurances,
    #[error("pair already has a deposit for this asset")]
    AlreadyHasDeposit,
    #[error("pair already has an LP transaction for this asset")]
    AlreadyHasLp,
    #[error("authentication failed")]
    AuthFailed,
    #[error("authentication expired or not found")]
    AuthExpired,
    #[error("authentication not verified")]
    AuthNotVerified,
    #[error("authentication verification failed")]
    AuthVerificationFailed(String),
    #[error("forbidden content access")]
    Forbidden,
    #[error("pair was matched by another participant")]
    MatchContested,

    #[error("version conflict for aggregate {aggregate_id}: expected {expected}")]
    ConcurrencyConflict { aggregate_id: Uuid, expected: u64 },
    #[error("aggregate not found")]
    AggregateNotFound,
    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Wire code surfaced in the error payload and used for status mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidPlanId => "invalid_plan_id",
            Self::InvalidAddress => "invalid_address",
            Self::InvalidAssetForPlan => "invalid_asset_for_plan",
            Self::InvalidPairStatus => "invalid_pair_status",
            Self::InvalidWalletAddresses => "invalid_wallet_addresses",
            Self::InvalidAssurances { .. } => "invalid_assurances",
            Self::InvalidPublicKey(_) => "invalid_public_key",
            Self::PairNotFound => "pair_not_found",
            Self::PlanNotFound => "plan_not_found",
            Self::AlreadySetAssurances => "already_set_assurances",
            Self::AlreadyHasDeposit => "already_has_deposit",
            Self::AlreadyHasLp => "already_has_lp",
            Self::AuthFailed => "auth_failed",
            Self::AuthExpired => "auth_expired",
            Self::AuthNotVerified => "auth_not_verified",
            Self::AuthVerificationFailed(_) => "auth_verification_failed",
            Self::Forbidden => "forbidden",
            Self::MatchContested => "match_contested",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::AggregateNotFound => "aggregate_not_found",
            Self::UnknownEventKind(_) => "unknown_event_kind",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    pub fn meta(&self) -> Option<Value> {
        match self {
            Self::InvalidAssurances { missing } => Some(json!({ "missing_assurance": missing })),
            Self::InvalidPublicKey(detail) | Self::AuthVerificationFailed(detail) => {
                Some(json!({ "error": detail }))
            }
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn status_for_code(code: &str) -> StatusCode {
    if code.contains("not_found") {
        StatusCode::NOT_FOUND
    } else if code.contains("invalid") || code.contains("already") {
        StatusCode::BAD_REQUEST
    } else if code.contains("auth") {
        StatusCode::UNAUTHORIZED
    } else if code.contains("forbidden") {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = status_for_code(code);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code, error = %self, "internal server error");
        }

        let mut body = json!({
            "code": code,
            "message": self.to_string(),
        });
        if let Some(meta) = self.meta() {
            body["meta"] = meta;
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_codes_to_statuses() {
        assert_eq!(status_for_code("pair_not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_code("invalid_pair_status"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_code("already_has_deposit"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_code("auth_expired"), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for_code("forbidden"), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for_code("concurrency_conflict"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn assurance_meta_carries_missing_nonce() {
        let err = Error::InvalidAssurances {
            missing: "missing assurance with nonce 4".into(),
        };
        let meta = err.meta().unwrap();
        assert_eq!(meta["missing_assurance"], "missing assurance with nonce 4");
    }
}
