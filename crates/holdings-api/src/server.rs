//! HTTP surface for the transaction engine. Mutating endpoints accept POST
//! with `{user_id, asset_id}` and map the engine's error taxonomy onto
//! status codes; read endpoints expose the state the map client renders.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    ApiError, AssetListing, ClaimYieldResponse, ErrorCode, OperationRequest, OwnershipRecord,
    PurchaseResponse, SellResponse, TransactionRecord, UpgradeResponse, UserAccount,
};
use holdings_core::{Clock, EngineError, GameStore, TransactionEngine};
use thiserror::Error;
use tokio::net::TcpListener;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    engine: Arc<TransactionEngine>,
    store: Arc<dyn GameStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn GameStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine: Arc::new(TransactionEngine::new(store.clone(), clock)),
            store,
        }
    }
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn bad_request(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::BadRequest, message, details),
        }
    }

    fn not_found(code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(code, message, details),
        }
    }

    fn internal(details: Option<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ApiError::new(ErrorCode::InternalError, "storage operation failed", details),
        }
    }

    fn from_engine(err: EngineError) -> Self {
        match err {
            EngineError::BadRequest(field) => Self::bad_request(
                "missing or blank parameter",
                Some(format!("field={field}")),
            ),
            EngineError::AccountNotFound(user_id) => Self::not_found(
                ErrorCode::AccountNotFound,
                "user account not found",
                Some(format!("user_id={user_id}")),
            ),
            EngineError::AssetNotFound(asset_id) => Self::not_found(
                ErrorCode::AssetNotFound,
                "asset not found",
                Some(format!("asset_id={asset_id}")),
            ),
            EngineError::NotOwned => Self::not_found(
                ErrorCode::NotOwned,
                "asset is not owned by this user",
                None,
            ),
            EngineError::AlreadyOwned => Self {
                status: StatusCode::CONFLICT,
                error: ApiError::new(ErrorCode::AlreadyOwned, "asset is already owned", None),
            },
            EngineError::InsufficientFunds {
                required,
                available,
            } => Self {
                status: StatusCode::PAYMENT_REQUIRED,
                error: ApiError::new(
                    ErrorCode::InsufficientFunds,
                    "insufficient funds",
                    Some(format!("required={required} available={available}")),
                ),
            },
            EngineError::ClaimTooSoon { retry_after_secs } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                error: ApiError::new(
                    ErrorCode::ClaimTooSoon,
                    "claim attempted within cooldown",
                    Some(format!("retry_after_secs={retry_after_secs}")),
                ),
            },
            EngineError::CommitConflict => Self {
                status: StatusCode::CONFLICT,
                error: ApiError::new(
                    ErrorCode::CommitConflict,
                    "operation lost a concurrent update race, refresh and retry",
                    None,
                ),
            },
            EngineError::Storage(err) => Self::internal(Some(err.to_string())),
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ServerError> {
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "holdings api listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/purchase", post(purchase))
        .route("/api/v1/claim_yield", post(claim_yield))
        .route("/api/v1/upgrade", post(upgrade))
        .route("/api/v1/sell", post(sell))
        .route("/api/v1/assets", get(list_assets))
        .route("/api/v1/users/{user_id}", get(get_user))
        .route("/api/v1/users/{user_id}/holdings", get(get_holdings))
        .route(
            "/api/v1/users/{user_id}/transactions",
            get(get_transactions),
        )
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
}

/// Pulls both identifiers out of the request body; missing or blank fields
/// are a caller error, reported before the engine is involved.
fn require_params(request: &OperationRequest) -> Result<(String, String), HttpApiError> {
    let user_id = request
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let asset_id = request
        .asset_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (user_id, asset_id) {
        (Some(user_id), Some(asset_id)) => Ok((user_id.to_string(), asset_id.to_string())),
        _ => Err(HttpApiError::bad_request(
            "missing user_id or asset_id",
            None,
        )),
    }
}

async fn purchase(
    State(state): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<PurchaseResponse>, HttpApiError> {
    let (user_id, asset_id) = require_params(&request)?;
    state
        .engine
        .purchase(&user_id, &asset_id)
        .map_err(HttpApiError::from_engine)?;
    Ok(Json(PurchaseResponse { success: true }))
}

async fn claim_yield(
    State(state): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<ClaimYieldResponse>, HttpApiError> {
    let (user_id, asset_id) = require_params(&request)?;
    let earned = state
        .engine
        .claim_yield(&user_id, &asset_id)
        .map_err(HttpApiError::from_engine)?;
    Ok(Json(ClaimYieldResponse { earned }))
}

async fn upgrade(
    State(state): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<UpgradeResponse>, HttpApiError> {
    let (user_id, asset_id) = require_params(&request)?;
    let new_level = state
        .engine
        .upgrade(&user_id, &asset_id)
        .map_err(HttpApiError::from_engine)?;
    Ok(Json(UpgradeResponse {
        success: true,
        new_level,
    }))
}

async fn sell(
    State(state): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<SellResponse>, HttpApiError> {
    let (user_id, asset_id) = require_params(&request)?;
    let amount = state
        .engine
        .sell(&user_id, &asset_id)
        .map_err(HttpApiError::from_engine)?;
    Ok(Json(SellResponse {
        success: true,
        amount,
    }))
}

async fn list_assets(
    State(state): State<AppState>,
) -> Result<Json<Vec<AssetListing>>, HttpApiError> {
    let assets = state
        .store
        .assets()
        .map_err(|err| HttpApiError::internal(Some(err.to_string())))?;

    let mut listings = Vec::with_capacity(assets.len());
    for asset in assets {
        let owner_user_id = state
            .store
            .owner_of(&asset.id)
            .map_err(|err| HttpApiError::internal(Some(err.to_string())))?
            .map(|record| record.user_id);
        listings.push(AssetListing {
            asset,
            owner_user_id,
        });
    }
    Ok(Json(listings))
}

async fn get_user(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<UserAccount>, HttpApiError> {
    let account = state
        .store
        .user(&user_id)
        .map_err(|err| HttpApiError::internal(Some(err.to_string())))?
        .ok_or_else(|| {
            HttpApiError::not_found(
                ErrorCode::AccountNotFound,
                "user account not found",
                Some(format!("user_id={user_id}")),
            )
        })?;
    Ok(Json(account))
}

async fn get_holdings(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<OwnershipRecord>>, HttpApiError> {
    require_user(&state, &user_id)?;
    let holdings = state
        .store
        .holdings_of(&user_id)
        .map_err(|err| HttpApiError::internal(Some(err.to_string())))?;
    Ok(Json(holdings))
}

async fn get_transactions(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<TransactionRecord>>, HttpApiError> {
    require_user(&state, &user_id)?;
    let transactions = state
        .store
        .transactions_of(&user_id)
        .map_err(|err| HttpApiError::internal(Some(err.to_string())))?;
    Ok(Json(transactions))
}

fn require_user(state: &AppState, user_id: &str) -> Result<(), HttpApiError> {
    state
        .store
        .user(user_id)
        .map_err(|err| HttpApiError::internal(Some(err.to_string())))?
        .ok_or_else(|| {
            HttpApiError::not_found(
                ErrorCode::AccountNotFound,
                "user account not found",
                Some(format!("user_id={user_id}")),
            )
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use holdings_core::StoreError;

    use super::*;

    #[test]
    fn require_params_rejects_missing_and_blank_fields() {
        let missing = OperationRequest::default();
        assert!(require_params(&missing).is_err());

        let blank = OperationRequest {
            user_id: Some("  ".to_string()),
            asset_id: Some("a1".to_string()),
        };
        assert!(require_params(&blank).is_err());

        let ok = OperationRequest {
            user_id: Some("u1".to_string()),
            asset_id: Some(" a1 ".to_string()),
        };
        let (user_id, asset_id) = require_params(&ok).expect("both present");
        assert_eq!(user_id, "u1");
        assert_eq!(asset_id, "a1");
    }

    #[test]
    fn engine_errors_map_to_contract_statuses() {
        let cases = [
            (
                HttpApiError::from_engine(EngineError::AssetNotFound("a1".to_string())),
                StatusCode::NOT_FOUND,
            ),
            (
                HttpApiError::from_engine(EngineError::NotOwned),
                StatusCode::NOT_FOUND,
            ),
            (
                HttpApiError::from_engine(EngineError::AlreadyOwned),
                StatusCode::CONFLICT,
            ),
            (
                HttpApiError::from_engine(EngineError::InsufficientFunds {
                    required: 907,
                    available: 93,
                }),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                HttpApiError::from_engine(EngineError::ClaimTooSoon {
                    retry_after_secs: 30,
                }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                HttpApiError::from_engine(EngineError::CommitConflict),
                StatusCode::CONFLICT,
            ),
            (
                HttpApiError::from_engine(EngineError::Storage(StoreError::Storage(
                    "disk on fire".to_string(),
                ))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (mapped, expected) in cases {
            assert_eq!(mapped.status, expected, "for {:?}", mapped.error.error_code);
        }
    }
}
