/// Exchange access: REST client, payload models and record normalization

pub mod client;
pub mod models;
pub mod normalizer;

pub use client::{trade_history_path, HttpError, HuobiClient, MarketClient, SYMBOLS_PATH};
pub use models::SymbolInfo;
pub use normalizer::{normalize_trades, parse_symbols, ParseError, PayloadShape};
