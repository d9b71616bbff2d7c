//! Database module: row mapping and SQL repositories.
//!
//! - `model`: decodes rows into the entities of `crate::model`.
//! - `repo`: SQL-only functions, each owning its transaction.
//!
//! Callers import from `vault_ingest::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;
