//! Cross-boundary contracts shared by the engine core, the HTTP API, and
//! persistence: durable records, operation payloads, and the wire error shape.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Balance granted to a freshly created account.
pub const STARTING_BALANCE: i64 = 1000;
/// Minimum elapsed seconds between two yield claims on one ownership.
pub const CLAIM_COOLDOWN_SECS: i64 = 60;
pub const SECS_PER_HOUR: i64 = 3600;
/// Upgrade pricing: `UPGRADE_BASE_COST + level * UPGRADE_COST_PER_LEVEL`.
pub const UPGRADE_BASE_COST: i64 = 50;
pub const UPGRADE_COST_PER_LEVEL: i64 = 25;
/// Sale proceeds: `base_price * SALE_DEPRECIATION_NUM / SALE_DEPRECIATION_DEN`.
pub const SALE_DEPRECIATION_NUM: i64 = 9;
pub const SALE_DEPRECIATION_DEN: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub id: String,
    pub display_name: String,
    pub balance: i64,
}

/// A purchasable map-anchored asset. The geometry is opaque to the engine;
/// it is stored and served back verbatim for the map client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetInfo {
    pub id: String,
    pub name: String,
    pub base_price: i64,
    pub hourly_yield: i64,
    pub geometry: Value,
}

/// Binding of exactly one user to one asset. `id` is assigned by the store;
/// exclusivity is keyed on `asset_id` alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub id: i64,
    pub user_id: String,
    pub asset_id: String,
    pub level: i64,
    pub purchased_at: DateTime<Utc>,
    pub last_yield_claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Yield,
    Upgrade,
    Sale,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Yield => "yield",
            Self::Upgrade => "upgrade",
            Self::Sale => "sale",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "purchase" => Some(Self::Purchase),
            "yield" => Some(Self::Yield),
            "upgrade" => Some(Self::Upgrade),
            "sale" => Some(Self::Sale),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry. Amounts are signed: positive for income,
/// negative for expense. The sum per user reconstructs that user's balance
/// relative to [`STARTING_BALANCE`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub kind: TransactionKind,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Body accepted by every mutating endpoint. Fields are optional so that
/// missing parameters surface as a 400 rather than a deserialization reject.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRequest {
    pub user_id: Option<String>,
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimYieldResponse {
    pub earned: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub success: bool,
    pub new_level: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SellResponse {
    pub success: bool,
    pub amount: i64,
}

/// Catalog entry as served to the map client: the asset plus its current
/// owner, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetListing {
    pub asset: AssetInfo,
    pub owner_user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    AccountNotFound,
    AssetNotFound,
    NotOwned,
    AlreadyOwned,
    InsufficientFunds,
    ClaimTooSoon,
    CommitConflict,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_kind_round_trips_through_str() {
        for kind in [
            TransactionKind::Purchase,
            TransactionKind::Yield,
            TransactionKind::Upgrade,
            TransactionKind::Sale,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("refund"), None);
    }

    #[test]
    fn operation_request_tolerates_missing_fields() {
        let request: OperationRequest = serde_json::from_str("{}").expect("empty body parses");
        assert!(request.user_id.is_none());
        assert!(request.asset_id.is_none());
    }
}
