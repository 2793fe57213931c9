//! Scheduled jobs
//!
//! Contains the background job that runs on a fixed interval:
//! - Trade history synchronization from the exchange into the document store

pub mod errors;
pub mod retry_set;
pub mod trade_sync_job;

pub use errors::{FailureKind, SymbolFailure, SyncError};
pub use retry_set::{FailureEntry, RetrySet};
pub use trade_sync_job::{AbandonedSymbol, CycleReport, TradeSyncJob};
