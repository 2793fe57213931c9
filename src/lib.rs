// Library Crate Root
// lib.rs

// main.rs imports through lib.rs like an external crate
pub mod config;
pub mod database;
pub mod jobs;
pub mod logging;
pub mod market;

// pub use = re-export at crate root
pub use config::AppConfig;
pub use database::{StorageError, StorageRouter};
pub use jobs::{CycleReport, SyncError, TradeSyncJob};
pub use market::{HuobiClient, MarketClient};
