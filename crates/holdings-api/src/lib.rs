//! SQLite-backed [`holdings_core::GameStore`] and the HTTP server exposing
//! the transaction engine.

mod persistence;
mod server;

pub use persistence::SqliteStore;
pub use server::{serve, AppState, ServerError};
