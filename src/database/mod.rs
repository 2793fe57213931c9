//! Document storage for harvested trades
//!
//! This module provides:
//! - Named connections with a default, routed per operation (`router`)
//! - PostgreSQL (JSONB) and in-memory backends
//! - Filter, update, projection and pipeline evaluation shared by all backends
//! - The trade repository used by the sync job

pub mod backends;
pub mod connection;
pub mod document;
pub mod options;
pub mod repositories;
pub mod router;

pub use connection::{open_backend, StorageError, WriteFailure};
pub use options::{Documents, FindOptions, InsertOutcome, RoutingOptions, SortKey, UpdateOutcome, WriteOptions};
pub use router::StorageRouter;
