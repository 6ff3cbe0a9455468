//! Yield-accrual and ownership-transaction engine: store contracts, the
//! atomic commit batch, the four state-changing operations, and an in-memory
//! store for tests and demos.

pub mod clock;
pub mod engine;
pub mod memory;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineError, TransactionEngine};
pub use memory::MemoryStore;
pub use store::{
    AssetCatalog, CommitReceipt, CommitSet, ConflictKind, GameStore, LedgerStore, Mutation,
    OwnershipStore, StoreError,
};
