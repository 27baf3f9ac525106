//! Persistence layer for the UTM server.
//!
//! SQLite-backed storage for flight declarations, their DSS authorizations,
//! and their state-change history. The in-memory KV store and spatial index
//! (`crate::store`) layer hot-path lookups on top of this relational source
//! of truth; neither replaces it.

pub mod db;
pub mod declarations;

pub use db::{init_database, Database};
