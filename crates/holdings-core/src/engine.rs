//! The four state-changing operations: purchase, claim-yield, upgrade, sell.
//! Each validates against current store state, builds a [`CommitSet`], and
//! submits it through the store's atomic commit boundary. No partial state is
//! ever observable: validation failures return before any write, and a commit
//! either lands whole or not at all.

use std::sync::Arc;

use contracts::{
    AssetInfo, OwnershipRecord, TransactionKind, CLAIM_COOLDOWN_SECS, SALE_DEPRECIATION_DEN,
    SALE_DEPRECIATION_NUM, SECS_PER_HOUR, UPGRADE_BASE_COST, UPGRADE_COST_PER_LEVEL,
};
use serde_json::json;
use thiserror::Error;

use crate::clock::Clock;
use crate::store::{CommitSet, ConflictKind, GameStore, Mutation, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("missing or blank identifier: {0}")]
    BadRequest(&'static str),
    #[error("user account not found: {0}")]
    AccountNotFound(String),
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("asset not owned by this user")]
    NotOwned,
    #[error("asset is already owned")]
    AlreadyOwned,
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },
    #[error("claim attempted within cooldown, retry in {retry_after_secs}s")]
    ClaimTooSoon { retry_after_secs: i64 },
    #[error("operation lost a concurrent update race")]
    CommitConflict,
    #[error("storage failure: {0}")]
    Storage(StoreError),
}

pub struct TransactionEngine {
    store: Arc<dyn GameStore>,
    clock: Arc<dyn Clock>,
}

impl TransactionEngine {
    pub fn new(store: Arc<dyn GameStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Buys an unowned asset at its base price. Debits the buyer, creates the
    /// ownership record at level 1, and appends the purchase transaction.
    pub fn purchase(&self, user_id: &str, asset_id: &str) -> Result<(), EngineError> {
        validate_ids(user_id, asset_id)?;
        let asset = self.require_asset(asset_id)?;

        if self.store.owner_of(asset_id).map_err(EngineError::Storage)?.is_some() {
            return Err(EngineError::AlreadyOwned);
        }

        let account = self
            .store
            .user(user_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::AccountNotFound(user_id.to_string()))?;
        if account.balance < asset.base_price {
            return Err(EngineError::InsufficientFunds {
                required: asset.base_price,
                available: account.balance,
            });
        }

        let now = self.clock.now();
        let mut set = CommitSet::new();
        set.push(Mutation::AdjustBalance {
            user_id: user_id.to_string(),
            delta: -asset.base_price,
        });
        set.push(Mutation::CreateOwnership {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
            level: 1,
            purchased_at: now,
            last_yield_claimed_at: now,
        });
        set.push(Mutation::AppendTransaction {
            user_id: user_id.to_string(),
            amount: -asset.base_price,
            kind: TransactionKind::Purchase,
            metadata: json!({ "asset_id": asset_id }),
            created_at: now,
        });

        self.submit("purchase", user_id, asset_id, set)?;
        Ok(())
    }

    /// Credits yield accrued since the last claim. Returns the earned amount;
    /// an accrual that floors to zero is a successful no-op that mutates
    /// nothing and records no transaction.
    pub fn claim_yield(&self, user_id: &str, asset_id: &str) -> Result<i64, EngineError> {
        validate_ids(user_id, asset_id)?;
        let ownership = self.require_ownership(user_id, asset_id)?;
        let asset = self.require_asset(asset_id)?;

        let now = self.clock.now();
        let elapsed = (now - ownership.last_yield_claimed_at).num_seconds();
        if elapsed < CLAIM_COOLDOWN_SECS {
            return Err(EngineError::ClaimTooSoon {
                retry_after_secs: CLAIM_COOLDOWN_SECS - elapsed,
            });
        }

        // floor((elapsed / 3600) * hourly_yield * level), in integer form.
        let earned = elapsed * asset.hourly_yield * ownership.level / SECS_PER_HOUR;
        if earned <= 0 {
            return Ok(0);
        }

        let mut set = CommitSet::new();
        set.push(Mutation::AdjustBalance {
            user_id: user_id.to_string(),
            delta: earned,
        });
        set.push(Mutation::AdvanceLastClaimed {
            ownership_id: ownership.id,
            expected: ownership.last_yield_claimed_at,
            to: now,
        });
        set.push(Mutation::AppendTransaction {
            user_id: user_id.to_string(),
            amount: earned,
            kind: TransactionKind::Yield,
            metadata: json!({ "asset_id": asset_id, "elapsed_seconds": elapsed }),
            created_at: now,
        });

        self.submit("claim_yield", user_id, asset_id, set)?;
        Ok(earned)
    }

    /// Raises the ownership level by one for `50 + level * 25`. Returns the
    /// new level.
    pub fn upgrade(&self, user_id: &str, asset_id: &str) -> Result<i64, EngineError> {
        validate_ids(user_id, asset_id)?;
        let ownership = self.require_ownership(user_id, asset_id)?;

        let cost = UPGRADE_BASE_COST + ownership.level * UPGRADE_COST_PER_LEVEL;
        let account = self
            .store
            .user(user_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::AccountNotFound(user_id.to_string()))?;
        if account.balance < cost {
            return Err(EngineError::InsufficientFunds {
                required: cost,
                available: account.balance,
            });
        }

        let now = self.clock.now();
        let new_level = ownership.level + 1;
        let mut set = CommitSet::new();
        set.push(Mutation::AdjustBalance {
            user_id: user_id.to_string(),
            delta: -cost,
        });
        set.push(Mutation::SetLevel {
            ownership_id: ownership.id,
            expected_level: ownership.level,
            new_level,
        });
        set.push(Mutation::AppendTransaction {
            user_id: user_id.to_string(),
            amount: -cost,
            kind: TransactionKind::Upgrade,
            metadata: json!({
                "asset_id": asset_id,
                "old_level": ownership.level,
                "new_level": new_level,
            }),
            created_at: now,
        });

        self.submit("upgrade", user_id, asset_id, set)?;
        Ok(new_level)
    }

    /// Sells an owned asset back for 90% of its base price (floored). Deletes
    /// the ownership record and returns the proceeds.
    pub fn sell(&self, user_id: &str, asset_id: &str) -> Result<i64, EngineError> {
        validate_ids(user_id, asset_id)?;
        let ownership = self.require_ownership(user_id, asset_id)?;
        let asset = self.require_asset(asset_id)?;

        let proceeds = asset.base_price * SALE_DEPRECIATION_NUM / SALE_DEPRECIATION_DEN;

        let now = self.clock.now();
        let mut set = CommitSet::new();
        set.push(Mutation::DeleteOwnership {
            ownership_id: ownership.id,
        });
        set.push(Mutation::AdjustBalance {
            user_id: user_id.to_string(),
            delta: proceeds,
        });
        set.push(Mutation::AppendTransaction {
            user_id: user_id.to_string(),
            amount: proceeds,
            kind: TransactionKind::Sale,
            metadata: json!({ "asset_id": asset_id, "original_price": asset.base_price }),
            created_at: now,
        });

        self.submit("sell", user_id, asset_id, set)?;
        Ok(proceeds)
    }

    fn require_asset(&self, asset_id: &str) -> Result<AssetInfo, EngineError> {
        self.store
            .asset(asset_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::AssetNotFound(asset_id.to_string()))
    }

    fn require_ownership(
        &self,
        user_id: &str,
        asset_id: &str,
    ) -> Result<OwnershipRecord, EngineError> {
        self.store
            .ownership_of(user_id, asset_id)
            .map_err(EngineError::Storage)?
            .ok_or(EngineError::NotOwned)
    }

    fn submit(
        &self,
        operation: &'static str,
        user_id: &str,
        asset_id: &str,
        set: CommitSet,
    ) -> Result<(), EngineError> {
        match self.store.commit(set) {
            Ok(receipt) => {
                tracing::debug!(
                    operation,
                    user_id,
                    asset_id,
                    new_balance = ?receipt.new_balance,
                    "commit applied"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(operation, user_id, asset_id, error = %err, "commit refused");
                Err(commit_failed(err))
            }
        }
    }
}

/// Maps a commit-time refusal back onto the operation's error taxonomy. A
/// guard miss means the precondition held at validation but another request
/// won the race, so the caller should refresh and reconsider.
fn commit_failed(err: StoreError) -> EngineError {
    match err {
        StoreError::Conflict(ConflictKind::AssetAlreadyOwned) => EngineError::AlreadyOwned,
        StoreError::Conflict(_) => EngineError::CommitConflict,
        StoreError::AccountNotFound(user_id) => EngineError::AccountNotFound(user_id),
        StoreError::AssetNotFound(asset_id) => EngineError::AssetNotFound(asset_id),
        other => EngineError::Storage(other),
    }
}

fn validate_ids(user_id: &str, asset_id: &str) -> Result<(), EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::BadRequest("user_id"));
    }
    if asset_id.trim().is_empty() {
        return Err(EngineError::BadRequest("asset_id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use contracts::{AssetInfo, STARTING_BALANCE};
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::store::{AssetCatalog, LedgerStore, OwnershipStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: TransactionEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store.create_user("u1", "Ada").expect("user created");
        store
            .insert_asset(&AssetInfo {
                id: "a1".to_string(),
                name: "Parcel 001".to_string(),
                base_price: 907,
                hourly_yield: 20,
                geometry: json!({"type": "Polygon", "coordinates": []}),
            })
            .expect("asset inserted");
        let engine = TransactionEngine::new(store.clone(), clock.clone());
        Fixture {
            store,
            clock,
            engine,
        }
    }

    fn balance(fixture: &Fixture, user_id: &str) -> i64 {
        fixture
            .store
            .user(user_id)
            .expect("read")
            .expect("exists")
            .balance
    }

    fn reconciles(fixture: &Fixture, user_id: &str) {
        let transactions = fixture.store.transactions_of(user_id).expect("read");
        let net: i64 = transactions.iter().map(|record| record.amount).sum();
        assert_eq!(
            balance(fixture, user_id),
            STARTING_BALANCE + net,
            "balance must equal starting balance plus signed transaction sum"
        );
    }

    #[test]
    fn purchase_debits_and_creates_level_one_ownership() {
        let fx = fixture();
        fx.engine.purchase("u1", "a1").expect("purchase succeeds");

        assert_eq!(balance(&fx, "u1"), 93);
        let ownership = fx
            .store
            .ownership_of("u1", "a1")
            .expect("read")
            .expect("owned");
        assert_eq!(ownership.level, 1);
        assert_eq!(ownership.purchased_at, ownership.last_yield_claimed_at);

        let transactions = fx.store.transactions_of("u1").expect("read");
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, -907);
        assert_eq!(transactions[0].kind, TransactionKind::Purchase);
        reconciles(&fx, "u1");
    }

    #[test]
    fn purchase_unknown_asset_is_not_found() {
        let fx = fixture();
        let err = fx.engine.purchase("u1", "missing").expect_err("must fail");
        assert!(matches!(err, EngineError::AssetNotFound(_)));
    }

    #[test]
    fn purchase_owned_asset_conflicts_even_for_other_user() {
        let fx = fixture();
        fx.store.create_user("u2", "Bea").expect("user created");
        fx.engine.purchase("u1", "a1").expect("first purchase");

        let err = fx.engine.purchase("u2", "a1").expect_err("must conflict");
        assert!(matches!(err, EngineError::AlreadyOwned));
        assert_eq!(balance(&fx, "u2"), STARTING_BALANCE);
    }

    #[test]
    fn purchase_without_funds_is_rejected_before_any_write() {
        let fx = fixture();
        fx.store
            .insert_asset(&AssetInfo {
                id: "a2".to_string(),
                name: "Parcel 002".to_string(),
                base_price: 1001,
                hourly_yield: 5,
                geometry: json!(null),
            })
            .expect("asset inserted");

        let err = fx.engine.purchase("u1", "a2").expect_err("must fail");
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                required: 1001,
                available: 1000,
            }
        ));
        assert!(fx.store.transactions_of("u1").expect("read").is_empty());
    }

    #[test]
    fn claim_after_one_hour_credits_hourly_yield() {
        let fx = fixture();
        fx.engine.purchase("u1", "a1").expect("purchase");
        let before = fx
            .store
            .ownership_of("u1", "a1")
            .expect("read")
            .expect("owned");

        fx.clock.advance_secs(3600);
        let earned = fx.engine.claim_yield("u1", "a1").expect("claim succeeds");

        assert_eq!(earned, 20);
        assert_eq!(balance(&fx, "u1"), 113);
        let after = fx
            .store
            .ownership_of("u1", "a1")
            .expect("read")
            .expect("owned");
        assert_eq!(
            (after.last_yield_claimed_at - before.last_yield_claimed_at).num_seconds(),
            3600
        );
        reconciles(&fx, "u1");
    }

    #[test]
    fn claim_within_cooldown_is_rate_limited() {
        let fx = fixture();
        fx.engine.purchase("u1", "a1").expect("purchase");
        fx.clock.advance_secs(3600);
        fx.engine.claim_yield("u1", "a1").expect("first claim");

        fx.clock.advance_secs(30);
        let err = fx.engine.claim_yield("u1", "a1").expect_err("too soon");
        assert!(matches!(
            err,
            EngineError::ClaimTooSoon {
                retry_after_secs: 30,
            }
        ));
    }

    #[test]
    fn zero_yield_claim_is_a_no_op_success() {
        let fx = fixture();
        fx.store
            .insert_asset(&AssetInfo {
                id: "idle".to_string(),
                name: "Idle lot".to_string(),
                base_price: 10,
                hourly_yield: 0,
                geometry: json!(null),
            })
            .expect("asset inserted");
        fx.engine.purchase("u1", "idle").expect("purchase");
        let before = fx
            .store
            .ownership_of("u1", "idle")
            .expect("read")
            .expect("owned");

        fx.clock.advance_secs(600);
        let earned = fx.engine.claim_yield("u1", "idle").expect("no-op claim");

        assert_eq!(earned, 0);
        let after = fx
            .store
            .ownership_of("u1", "idle")
            .expect("read")
            .expect("owned");
        assert_eq!(after.last_yield_claimed_at, before.last_yield_claimed_at);
        // Only the purchase transaction exists.
        assert_eq!(fx.store.transactions_of("u1").expect("read").len(), 1);
        reconciles(&fx, "u1");
    }

    #[test]
    fn claim_without_ownership_is_not_owned() {
        let fx = fixture();
        let err = fx.engine.claim_yield("u1", "a1").expect_err("must fail");
        assert!(matches!(err, EngineError::NotOwned));
    }

    #[test]
    fn upgrade_charges_level_scaled_cost() {
        let fx = fixture();
        fx.engine.purchase("u1", "a1").expect("purchase");

        let new_level = fx.engine.upgrade("u1", "a1").expect("upgrade succeeds");
        assert_eq!(new_level, 2);
        // 1000 - 907 - (50 + 1 * 25)
        assert_eq!(balance(&fx, "u1"), 18);

        let transactions = fx.store.transactions_of("u1").expect("read");
        let upgrade = transactions.last().expect("upgrade recorded");
        assert_eq!(upgrade.amount, -75);
        assert_eq!(upgrade.metadata["old_level"], 1);
        assert_eq!(upgrade.metadata["new_level"], 2);
        reconciles(&fx, "u1");
    }

    #[test]
    fn upgrade_without_funds_changes_nothing() {
        let fx = fixture();
        fx.store
            .insert_asset(&AssetInfo {
                id: "a3".to_string(),
                name: "Parcel 003".to_string(),
                base_price: 940,
                hourly_yield: 8,
                geometry: json!(null),
            })
            .expect("asset inserted");
        fx.engine.purchase("u1", "a3").expect("purchase");
        assert_eq!(balance(&fx, "u1"), 60);

        let err = fx.engine.upgrade("u1", "a3").expect_err("must fail");
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                required: 75,
                available: 60,
            }
        ));
        let ownership = fx
            .store
            .ownership_of("u1", "a3")
            .expect("read")
            .expect("owned");
        assert_eq!(ownership.level, 1);
        assert_eq!(balance(&fx, "u1"), 60);
    }

    #[test]
    fn sell_returns_depreciated_proceeds_and_frees_the_asset() {
        let fx = fixture();
        fx.engine.purchase("u1", "a1").expect("purchase");

        let proceeds = fx.engine.sell("u1", "a1").expect("sell succeeds");
        assert_eq!(proceeds, 816); // floor(907 * 0.9)
        assert_eq!(balance(&fx, "u1"), 93 + 816);
        assert!(fx.store.owner_of("a1").expect("read").is_none());

        let transactions = fx.store.transactions_of("u1").expect("read");
        let sale = transactions.last().expect("sale recorded");
        assert_eq!(sale.kind, TransactionKind::Sale);
        assert_eq!(sale.metadata["original_price"], 907);
        reconciles(&fx, "u1");

        // The asset is purchasable again.
        fx.store.create_user("u2", "Bea").expect("user created");
        fx.engine.purchase("u2", "a1").expect("repurchase");
    }

    #[test]
    fn sell_unowned_asset_is_not_owned() {
        let fx = fixture();
        let err = fx.engine.sell("u1", "a1").expect_err("must fail");
        assert!(matches!(err, EngineError::NotOwned));
    }

    #[test]
    fn blank_identifiers_are_bad_requests() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.purchase("  ", "a1"),
            Err(EngineError::BadRequest("user_id"))
        ));
        assert!(matches!(
            fx.engine.claim_yield("u1", ""),
            Err(EngineError::BadRequest("asset_id"))
        ));
    }

    #[test]
    fn level_scales_claimed_yield() {
        let fx = fixture();
        fx.engine.purchase("u1", "a1").expect("purchase");
        fx.engine.upgrade("u1", "a1").expect("upgrade to 2");

        fx.clock.advance_secs(1800);
        // floor(1800 * 20 * 2 / 3600) = 20
        let earned = fx.engine.claim_yield("u1", "a1").expect("claim");
        assert_eq!(earned, 20);
        reconciles(&fx, "u1");
    }
}
