//! SQLite [`GameStore`]. The schema mirrors the game's durable relations:
//! `users`, `assets`, `user_assets` (UNIQUE on asset_id enforces one owner
//! per asset), and the append-only `transactions` log. A commit batch runs
//! inside one SQLite transaction; guarded updates verify affected row counts
//! and roll the whole batch back on a miss.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use contracts::{
    AssetInfo, OwnershipRecord, TransactionKind, TransactionRecord, UserAccount, STARTING_BALANCE,
};
use holdings_core::{
    AssetCatalog, CommitReceipt, CommitSet, ConflictKind, GameStore, LedgerStore, Mutation,
    OwnershipStore, StoreError,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(storage)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                balance INTEGER NOT NULL CHECK (balance >= 0)
            );

            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_price INTEGER NOT NULL,
                hourly_yield INTEGER NOT NULL,
                geometry_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES users(id),
                asset_id TEXT NOT NULL UNIQUE REFERENCES assets(id),
                level INTEGER NOT NULL,
                purchased_at TEXT NOT NULL,
                last_yield_claimed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES users(id),
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_user_assets_user ON user_assets(user_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, id);
            ",
        )
        .map_err(storage)?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES(1, 'initial_v1', ?1)",
            params![timestamp(Utc::now())],
        )
        .map_err(storage)?;

        Ok(())
    }
}

/// All timestamp writes go through this formatter so that guard comparisons
/// on stored text are exact.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::Storage(format!("bad stored timestamp {raw:?}: {err}")))
}

fn storage(err: rusqlite::Error) -> StoreError {
    StoreError::Storage(err.to_string())
}

fn row_to_ownership(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, i64, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn ownership_from_parts(
    parts: (i64, String, String, i64, String, String),
) -> Result<OwnershipRecord, StoreError> {
    Ok(OwnershipRecord {
        id: parts.0,
        user_id: parts.1,
        asset_id: parts.2,
        level: parts.3,
        purchased_at: parse_timestamp(&parts.4)?,
        last_yield_claimed_at: parse_timestamp(&parts.5)?,
    })
}

const OWNERSHIP_COLUMNS: &str =
    "id, user_id, asset_id, level, purchased_at, last_yield_claimed_at";

impl LedgerStore for SqliteStore {
    fn user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, display_name, balance FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserAccount {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    balance: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(storage)
    }

    fn create_user(&self, user_id: &str, display_name: &str) -> Result<UserAccount, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO users (id, display_name, balance) VALUES (?1, ?2, ?3)",
                params![user_id, display_name, STARTING_BALANCE],
            )
            .map_err(storage)?;
        if inserted == 0 {
            return Err(StoreError::AccountExists(user_id.to_string()));
        }
        Ok(UserAccount {
            id: user_id.to_string(),
            display_name: display_name.to_string(),
            balance: STARTING_BALANCE,
        })
    }

    fn transactions_of(&self, user_id: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, amount, kind, metadata_json, created_at
                 FROM transactions WHERE user_id = ?1 ORDER BY id ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(storage)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, user_id, amount, kind, metadata_json, created_at) = row.map_err(storage)?;
            records.push(TransactionRecord {
                id,
                user_id,
                amount,
                kind: TransactionKind::parse(&kind).ok_or_else(|| {
                    StoreError::Storage(format!("unknown transaction kind {kind:?}"))
                })?,
                metadata: serde_json::from_str(&metadata_json)
                    .map_err(|err| StoreError::Storage(format!("bad metadata json: {err}")))?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(records)
    }
}

impl AssetCatalog for SqliteStore {
    fn asset(&self, asset_id: &str) -> Result<Option<AssetInfo>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, base_price, hourly_yield, geometry_json
                 FROM assets WHERE id = ?1",
                params![asset_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(asset_from_parts).transpose()
    }

    fn assets(&self) -> Result<Vec<AssetInfo>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, base_price, hourly_yield, geometry_json
                 FROM assets ORDER BY id ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(storage)?;

        let mut assets = Vec::new();
        for row in rows {
            assets.push(asset_from_parts(row.map_err(storage)?)?);
        }
        Ok(assets)
    }

    fn insert_asset(&self, asset: &AssetInfo) -> Result<(), StoreError> {
        let geometry_json = serde_json::to_string(&asset.geometry)
            .map_err(|err| StoreError::Storage(format!("bad geometry json: {err}")))?;
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO assets (id, name, base_price, hourly_yield, geometry_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    asset.id,
                    asset.name,
                    asset.base_price,
                    asset.hourly_yield,
                    geometry_json
                ],
            )
            .map_err(storage)?;
        if inserted == 0 {
            return Err(StoreError::AssetExists(asset.id.clone()));
        }
        Ok(())
    }
}

fn asset_from_parts(parts: (String, String, i64, i64, String)) -> Result<AssetInfo, StoreError> {
    Ok(AssetInfo {
        id: parts.0,
        name: parts.1,
        base_price: parts.2,
        hourly_yield: parts.3,
        geometry: serde_json::from_str(&parts.4)
            .map_err(|err| StoreError::Storage(format!("bad geometry json: {err}")))?,
    })
}

impl OwnershipStore for SqliteStore {
    fn ownership_of(
        &self,
        user_id: &str,
        asset_id: &str,
    ) -> Result<Option<OwnershipRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {OWNERSHIP_COLUMNS} FROM user_assets
                     WHERE user_id = ?1 AND asset_id = ?2"
                ),
                params![user_id, asset_id],
                row_to_ownership,
            )
            .optional()
            .map_err(storage)?;
        row.map(ownership_from_parts).transpose()
    }

    fn owner_of(&self, asset_id: &str) -> Result<Option<OwnershipRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {OWNERSHIP_COLUMNS} FROM user_assets WHERE asset_id = ?1"),
                params![asset_id],
                row_to_ownership,
            )
            .optional()
            .map_err(storage)?;
        row.map(ownership_from_parts).transpose()
    }

    fn holdings_of(&self, user_id: &str) -> Result<Vec<OwnershipRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OWNERSHIP_COLUMNS} FROM user_assets
                 WHERE user_id = ?1 ORDER BY id ASC"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![user_id], row_to_ownership)
            .map_err(storage)?;

        let mut holdings = Vec::new();
        for row in rows {
            holdings.push(ownership_from_parts(row.map_err(storage)?)?);
        }
        Ok(holdings)
    }
}

impl GameStore for SqliteStore {
    fn commit(&self, set: CommitSet) -> Result<CommitReceipt, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage)?;
        let mut receipt = CommitReceipt::default();

        for (index, mutation) in set.mutations.iter().enumerate() {
            match apply_mutation(&tx, mutation) {
                Ok(Some(new_balance)) => receipt.new_balance = Some(new_balance),
                Ok(None) => {}
                Err(err) => {
                    // Dropping the transaction rolls back every sub-update
                    // that already landed; log which one refused so the audit
                    // trail can be reconciled if this recurs.
                    tracing::error!(
                        index,
                        mutation = mutation.label(),
                        error = %err,
                        "commit mutation refused, rolling back batch"
                    );
                    return Err(err);
                }
            }
        }

        tx.commit().map_err(|err| {
            tracing::error!(error = %err, "sqlite commit failed, batch rolled back");
            storage(err)
        })?;
        Ok(receipt)
    }
}

fn apply_mutation(
    tx: &rusqlite::Transaction<'_>,
    mutation: &Mutation,
) -> Result<Option<i64>, StoreError> {
    match mutation {
        Mutation::AdjustBalance { user_id, delta } => {
            let updated = tx
                .execute(
                    "UPDATE users SET balance = balance + ?1
                     WHERE id = ?2 AND balance + ?1 >= 0",
                    params![delta, user_id],
                )
                .map_err(storage)?;
            if updated == 0 {
                let exists = tx
                    .query_row(
                        "SELECT 1 FROM users WHERE id = ?1",
                        params![user_id],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(storage)?
                    .is_some();
                return if exists {
                    Err(StoreError::Conflict(ConflictKind::InsufficientBalance))
                } else {
                    Err(StoreError::AccountNotFound(user_id.clone()))
                };
            }
            let new_balance = tx
                .query_row(
                    "SELECT balance FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(storage)?;
            Ok(Some(new_balance))
        }
        Mutation::CreateOwnership {
            user_id,
            asset_id,
            level,
            purchased_at,
            last_yield_claimed_at,
        } => {
            let result = tx.execute(
                "INSERT INTO user_assets
                 (user_id, asset_id, level, purchased_at, last_yield_claimed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    asset_id,
                    level,
                    timestamp(*purchased_at),
                    timestamp(*last_yield_claimed_at)
                ],
            );
            match result {
                Ok(_) => Ok(None),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Err(StoreError::Conflict(ConflictKind::AssetAlreadyOwned))
                }
                Err(err) => Err(storage(err)),
            }
        }
        Mutation::SetLevel {
            ownership_id,
            expected_level,
            new_level,
        } => {
            let updated = tx
                .execute(
                    "UPDATE user_assets SET level = ?1 WHERE id = ?2 AND level = ?3",
                    params![new_level, ownership_id, expected_level],
                )
                .map_err(storage)?;
            if updated == 0 {
                return Err(ownership_guard_miss(tx, *ownership_id, ConflictKind::StaleLevel)?);
            }
            Ok(None)
        }
        Mutation::AdvanceLastClaimed {
            ownership_id,
            expected,
            to,
        } => {
            let updated = tx
                .execute(
                    "UPDATE user_assets SET last_yield_claimed_at = ?1
                     WHERE id = ?2 AND last_yield_claimed_at = ?3",
                    params![timestamp(*to), ownership_id, timestamp(*expected)],
                )
                .map_err(storage)?;
            if updated == 0 {
                return Err(ownership_guard_miss(tx, *ownership_id, ConflictKind::StaleClaim)?);
            }
            Ok(None)
        }
        Mutation::DeleteOwnership { ownership_id } => {
            let deleted = tx
                .execute(
                    "DELETE FROM user_assets WHERE id = ?1",
                    params![ownership_id],
                )
                .map_err(storage)?;
            if deleted == 0 {
                return Err(StoreError::Conflict(ConflictKind::OwnershipGone));
            }
            Ok(None)
        }
        Mutation::AppendTransaction {
            user_id,
            amount,
            kind,
            metadata,
            created_at,
        } => {
            let metadata_json = serde_json::to_string(metadata)
                .map_err(|err| StoreError::Storage(format!("bad metadata json: {err}")))?;
            tx.execute(
                "INSERT INTO transactions (user_id, amount, kind, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    amount,
                    kind.as_str(),
                    metadata_json,
                    timestamp(*created_at)
                ],
            )
            .map_err(storage)?;
            Ok(None)
        }
    }
}

/// Distinguishes "the guarded value changed" from "the row is gone entirely".
fn ownership_guard_miss(
    tx: &rusqlite::Transaction<'_>,
    ownership_id: i64,
    stale: ConflictKind,
) -> Result<StoreError, StoreError> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM user_assets WHERE id = ?1",
            params![ownership_id],
            |_| Ok(()),
        )
        .optional()
        .map_err(storage)?
        .is_some();
    Ok(if exists {
        StoreError::Conflict(stale)
    } else {
        StoreError::Conflict(ConflictKind::OwnershipGone)
    })
}
