//! Store contracts. Reads are plain lookups; every write goes through
//! [`GameStore::commit`], which applies an operation's whole mutation set
//! atomically or not at all.

use chrono::{DateTime, Utc};
use contracts::{AssetInfo, OwnershipRecord, TransactionKind, TransactionRecord, UserAccount};
use serde_json::Value;
use thiserror::Error;

/// A guarded mutation that lost a race: the state the engine validated
/// against changed before the commit landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("asset is already owned")]
    AssetAlreadyOwned,
    #[error("balance would become negative")]
    InsufficientBalance,
    #[error("ownership level changed since it was read")]
    StaleLevel,
    #[error("claim timestamp changed since it was read")]
    StaleClaim,
    #[error("ownership record no longer exists")]
    OwnershipGone,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("account already exists: {0}")]
    AccountExists(String),
    #[error("asset already exists: {0}")]
    AssetExists(String),
    #[error("commit conflict: {0}")]
    Conflict(ConflictKind),
    #[error("storage fault: {0}")]
    Storage(String),
}

/// Balances and the append-only transaction log. The only component allowed
/// to mutate monetary state, and it does so exclusively through
/// [`GameStore::commit`].
pub trait LedgerStore: Send + Sync {
    fn user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError>;

    /// Creates an account with [`contracts::STARTING_BALANCE`]. Used by
    /// seeding and demos; the game proper creates accounts at first login.
    fn create_user(&self, user_id: &str, display_name: &str) -> Result<UserAccount, StoreError>;

    /// Audit trail for one user, oldest first.
    fn transactions_of(&self, user_id: &str) -> Result<Vec<TransactionRecord>, StoreError>;
}

/// Durable, mostly-static asset catalog. Read-only from the engine's
/// perspective; `insert_asset` exists for seeding only.
pub trait AssetCatalog: Send + Sync {
    fn asset(&self, asset_id: &str) -> Result<Option<AssetInfo>, StoreError>;

    fn assets(&self) -> Result<Vec<AssetInfo>, StoreError>;

    fn insert_asset(&self, asset: &AssetInfo) -> Result<(), StoreError>;
}

pub trait OwnershipStore: Send + Sync {
    fn ownership_of(
        &self,
        user_id: &str,
        asset_id: &str,
    ) -> Result<Option<OwnershipRecord>, StoreError>;

    /// Whoever owns the asset, regardless of user. Backs the exclusivity
    /// precondition check and the catalog listing.
    fn owner_of(&self, asset_id: &str) -> Result<Option<OwnershipRecord>, StoreError>;

    fn holdings_of(&self, user_id: &str) -> Result<Vec<OwnershipRecord>, StoreError>;
}

/// One entry of a commit batch. Guarded variants carry the value the engine
/// read during validation; the store must refuse the whole batch if the
/// stored value no longer matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Atomic balance delta. Applied as a single read-modify-write inside
    /// the store; fails the batch if the result would be negative.
    AdjustBalance { user_id: String, delta: i64 },
    /// Create-if-absent keyed on `asset_id` alone.
    CreateOwnership {
        user_id: String,
        asset_id: String,
        level: i64,
        purchased_at: DateTime<Utc>,
        last_yield_claimed_at: DateTime<Utc>,
    },
    SetLevel {
        ownership_id: i64,
        expected_level: i64,
        new_level: i64,
    },
    AdvanceLastClaimed {
        ownership_id: i64,
        expected: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    DeleteOwnership { ownership_id: i64 },
    AppendTransaction {
        user_id: String,
        amount: i64,
        kind: TransactionKind,
        metadata: Value,
        created_at: DateTime<Utc>,
    },
}

impl Mutation {
    /// Short label used when logging which sub-update of a commit failed.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AdjustBalance { .. } => "adjust_balance",
            Self::CreateOwnership { .. } => "create_ownership",
            Self::SetLevel { .. } => "set_level",
            Self::AdvanceLastClaimed { .. } => "advance_last_claimed",
            Self::DeleteOwnership { .. } => "delete_ownership",
            Self::AppendTransaction { .. } => "append_transaction",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSet {
    pub mutations: Vec<Mutation>,
}

impl CommitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Balance after the batch, for the user whose balance it adjusted.
    pub new_balance: Option<i64>,
}

/// The three stores plus the atomic commit boundary. Implementations must
/// apply the batch all-or-nothing under arbitrary interleaving of concurrent
/// commits.
pub trait GameStore: LedgerStore + AssetCatalog + OwnershipStore {
    fn commit(&self, set: CommitSet) -> Result<CommitReceipt, StoreError>;
}
