//! Storage module for persistent job state
//!
//! Provides the [`JobStore`] contract and its SQLite implementation.

mod database;
mod store;

pub use database::SqliteJobStore;
pub use store::JobStore;
