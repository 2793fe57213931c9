//! Repositories over the storage router
//!
//! Each repository handles one kind of data and is consumed through its trait,
//! so jobs can be tested against the in-memory backend.

pub mod trade_repository;

pub use trade_repository::{database_name, TradeRepository, TradeRepositoryImpl, DEFAULT_DATABASE_BASE};
