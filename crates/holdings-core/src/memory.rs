//! In-memory [`GameStore`]. One mutex guards all relations, so a commit is
//! trivially atomic: it is applied to a scratch copy of the state and the
//! copy is swapped in only once every mutation has landed.

use std::collections::BTreeMap;

use contracts::{
    AssetInfo, OwnershipRecord, TransactionRecord, UserAccount, STARTING_BALANCE,
};
use parking_lot::Mutex;

use crate::store::{
    AssetCatalog, CommitReceipt, CommitSet, ConflictKind, GameStore, LedgerStore, Mutation,
    OwnershipStore, StoreError,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Clone, Default)]
struct MemoryInner {
    users: BTreeMap<String, UserAccount>,
    assets: BTreeMap<String, AssetInfo>,
    ownerships: BTreeMap<i64, OwnershipRecord>,
    /// asset_id -> ownership id; the exclusivity index.
    owned_assets: BTreeMap<String, i64>,
    transactions: Vec<TransactionRecord>,
    next_ownership_id: i64,
    next_transaction_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn apply(&mut self, mutation: &Mutation) -> Result<Option<i64>, StoreError> {
        match mutation {
            Mutation::AdjustBalance { user_id, delta } => {
                let account = self
                    .users
                    .get_mut(user_id)
                    .ok_or_else(|| StoreError::AccountNotFound(user_id.clone()))?;
                let next = account.balance + delta;
                if next < 0 {
                    return Err(StoreError::Conflict(ConflictKind::InsufficientBalance));
                }
                account.balance = next;
                Ok(Some(next))
            }
            Mutation::CreateOwnership {
                user_id,
                asset_id,
                level,
                purchased_at,
                last_yield_claimed_at,
            } => {
                if self.owned_assets.contains_key(asset_id) {
                    return Err(StoreError::Conflict(ConflictKind::AssetAlreadyOwned));
                }
                self.next_ownership_id += 1;
                let id = self.next_ownership_id;
                self.owned_assets.insert(asset_id.clone(), id);
                self.ownerships.insert(
                    id,
                    OwnershipRecord {
                        id,
                        user_id: user_id.clone(),
                        asset_id: asset_id.clone(),
                        level: *level,
                        purchased_at: *purchased_at,
                        last_yield_claimed_at: *last_yield_claimed_at,
                    },
                );
                Ok(None)
            }
            Mutation::SetLevel {
                ownership_id,
                expected_level,
                new_level,
            } => {
                let record = self
                    .ownerships
                    .get_mut(ownership_id)
                    .ok_or(StoreError::Conflict(ConflictKind::OwnershipGone))?;
                if record.level != *expected_level {
                    return Err(StoreError::Conflict(ConflictKind::StaleLevel));
                }
                record.level = *new_level;
                Ok(None)
            }
            Mutation::AdvanceLastClaimed {
                ownership_id,
                expected,
                to,
            } => {
                let record = self
                    .ownerships
                    .get_mut(ownership_id)
                    .ok_or(StoreError::Conflict(ConflictKind::OwnershipGone))?;
                if record.last_yield_claimed_at != *expected {
                    return Err(StoreError::Conflict(ConflictKind::StaleClaim));
                }
                record.last_yield_claimed_at = *to;
                Ok(None)
            }
            Mutation::DeleteOwnership { ownership_id } => {
                let record = self
                    .ownerships
                    .remove(ownership_id)
                    .ok_or(StoreError::Conflict(ConflictKind::OwnershipGone))?;
                self.owned_assets.remove(&record.asset_id);
                Ok(None)
            }
            Mutation::AppendTransaction {
                user_id,
                amount,
                kind,
                metadata,
                created_at,
            } => {
                self.next_transaction_id += 1;
                self.transactions.push(TransactionRecord {
                    id: self.next_transaction_id,
                    user_id: user_id.clone(),
                    amount: *amount,
                    kind: *kind,
                    metadata: metadata.clone(),
                    created_at: *created_at,
                });
                Ok(None)
            }
        }
    }
}

impl LedgerStore for MemoryStore {
    fn user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.inner.lock().users.get(user_id).cloned())
    }

    fn create_user(&self, user_id: &str, display_name: &str) -> Result<UserAccount, StoreError> {
        let mut inner = self.inner.lock();
        if inner.users.contains_key(user_id) {
            return Err(StoreError::AccountExists(user_id.to_string()));
        }
        let account = UserAccount {
            id: user_id.to_string(),
            display_name: display_name.to_string(),
            balance: STARTING_BALANCE,
        };
        inner.users.insert(user_id.to_string(), account.clone());
        Ok(account)
    }

    fn transactions_of(&self, user_id: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .transactions
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl AssetCatalog for MemoryStore {
    fn asset(&self, asset_id: &str) -> Result<Option<AssetInfo>, StoreError> {
        Ok(self.inner.lock().assets.get(asset_id).cloned())
    }

    fn assets(&self) -> Result<Vec<AssetInfo>, StoreError> {
        Ok(self.inner.lock().assets.values().cloned().collect())
    }

    fn insert_asset(&self, asset: &AssetInfo) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.assets.contains_key(&asset.id) {
            return Err(StoreError::AssetExists(asset.id.clone()));
        }
        inner.assets.insert(asset.id.clone(), asset.clone());
        Ok(())
    }
}

impl OwnershipStore for MemoryStore {
    fn ownership_of(
        &self,
        user_id: &str,
        asset_id: &str,
    ) -> Result<Option<OwnershipRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .owned_assets
            .get(asset_id)
            .and_then(|id| inner.ownerships.get(id))
            .filter(|record| record.user_id == user_id)
            .cloned())
    }

    fn owner_of(&self, asset_id: &str) -> Result<Option<OwnershipRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .owned_assets
            .get(asset_id)
            .and_then(|id| inner.ownerships.get(id))
            .cloned())
    }

    fn holdings_of(&self, user_id: &str) -> Result<Vec<OwnershipRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .ownerships
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl GameStore for MemoryStore {
    fn commit(&self, set: CommitSet) -> Result<CommitReceipt, StoreError> {
        let mut inner = self.inner.lock();
        let mut scratch = inner.clone();
        let mut receipt = CommitReceipt::default();

        for mutation in &set.mutations {
            let new_balance = scratch.apply(mutation)?;
            if new_balance.is_some() {
                receipt.new_balance = new_balance;
            }
        }

        *inner = scratch;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use contracts::TransactionKind;
    use serde_json::json;

    use super::*;

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_user("u1", "Ada").expect("user created");
        store
            .insert_asset(&AssetInfo {
                id: "a1".to_string(),
                name: "Parcel 001".to_string(),
                base_price: 907,
                hourly_yield: 20,
                geometry: json!({"type": "Point", "coordinates": [12.6371, 43.7267]}),
            })
            .expect("asset inserted");
        store
    }

    #[test]
    fn commit_is_all_or_nothing() {
        let store = seeded_store();
        let now = Utc::now();

        let mut set = CommitSet::new();
        set.push(Mutation::AdjustBalance {
            user_id: "u1".to_string(),
            delta: -200,
        });
        // Guard miss: no ownership record 99 exists.
        set.push(Mutation::DeleteOwnership { ownership_id: 99 });
        set.push(Mutation::AppendTransaction {
            user_id: "u1".to_string(),
            amount: -200,
            kind: TransactionKind::Purchase,
            metadata: json!({"asset_id": "a1"}),
            created_at: now,
        });

        let err = store.commit(set).expect_err("commit must fail");
        assert!(matches!(
            err,
            StoreError::Conflict(ConflictKind::OwnershipGone)
        ));

        let account = store.user("u1").expect("read").expect("exists");
        assert_eq!(account.balance, STARTING_BALANCE);
        assert!(store.transactions_of("u1").expect("read").is_empty());
    }

    #[test]
    fn create_ownership_is_exclusive_per_asset() {
        let store = seeded_store();
        store.create_user("u2", "Bea").expect("user created");
        let now = Utc::now();

        let create = |user: &str| {
            let mut set = CommitSet::new();
            set.push(Mutation::CreateOwnership {
                user_id: user.to_string(),
                asset_id: "a1".to_string(),
                level: 1,
                purchased_at: now,
                last_yield_claimed_at: now,
            });
            store.commit(set)
        };

        create("u1").expect("first owner wins");
        let err = create("u2").expect_err("second must conflict");
        assert!(matches!(
            err,
            StoreError::Conflict(ConflictKind::AssetAlreadyOwned)
        ));

        let owner = store.owner_of("a1").expect("read").expect("owned");
        assert_eq!(owner.user_id, "u1");
    }

    #[test]
    fn balance_cannot_go_negative() {
        let store = seeded_store();
        let mut set = CommitSet::new();
        set.push(Mutation::AdjustBalance {
            user_id: "u1".to_string(),
            delta: -(STARTING_BALANCE + 1),
        });
        let err = store.commit(set).expect_err("overdraft must fail");
        assert!(matches!(
            err,
            StoreError::Conflict(ConflictKind::InsufficientBalance)
        ));
    }
}
