use dashmap::DashMap;
use serde::Serialize;

use super::errors::{FailureKind, SymbolFailure};
use crate::market::SymbolInfo;

/// A symbol waiting to be retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub symbol: String,
    pub currency: String,

    /// Exact URL of the failed request; retries reuse it verbatim
    pub url: String,

    pub kind: FailureKind,

    /// Failed retry attempts so far
    pub retries: u32,

    pub last_error: String,
}

/// Symbols that failed during one sync cycle, keyed by symbol
///
/// Owned by a single cycle. Safe to update from the concurrent per-symbol tasks.
#[derive(Debug, Default)]
pub struct RetrySet {
    entries: DashMap<String, FailureEntry>,
}

impl RetrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a first failure for a symbol
    pub fn record(&self, info: &SymbolInfo, url: &str, failure: &SymbolFailure) {
        self.entries.insert(
            info.symbol.clone(),
            FailureEntry {
                symbol: info.symbol.clone(),
                currency: info.quote_currency.clone(),
                url: url.to_string(),
                kind: failure.kind(),
                retries: 0,
                last_error: failure.to_string(),
            },
        );
    }

    /// Count a failed retry; returns the number of failed retries so far
    pub fn record_retry_failure(&self, symbol: &str, failure: &SymbolFailure) -> Option<u32> {
        self.entries.get_mut(symbol).map(|mut entry| {
            entry.retries += 1;
            entry.kind = failure.kind();
            entry.last_error = failure.to_string();
            entry.retries
        })
    }

    pub fn remove(&self, symbol: &str) -> Option<FailureEntry> {
        self.entries.remove(symbol).map(|(_, entry)| entry)
    }

    /// Copy of the current entries, ordered by symbol
    pub fn snapshot(&self) -> Vec<FailureEntry> {
        let mut entries: Vec<FailureEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        entries
    }

    /// Remove and return every entry, ordered by symbol
    pub fn drain(&self) -> Vec<FailureEntry> {
        let entries = self.snapshot();
        for entry in &entries {
            self.entries.remove(&entry.symbol);
        }
        entries
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
