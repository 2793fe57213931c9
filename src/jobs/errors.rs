use serde::Serialize;
use thiserror::Error;

use crate::database::StorageError;
use crate::market::{HttpError, ParseError};

/// Why one symbol did not make it into storage
#[derive(Debug, Error)]
pub enum SymbolFailure {
    #[error("fetch failed: {0}")]
    Fetch(#[from] HttpError),

    #[error("malformed trade payload: {0}")]
    Parse(#[from] ParseError),

    #[error("write failed: {0}")]
    Persist(#[from] StorageError),
}

impl SymbolFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            SymbolFailure::Fetch(_) => FailureKind::Fetch,
            SymbolFailure::Parse(_) => FailureKind::Parse,
            SymbolFailure::Persist(_) => FailureKind::Persist,
        }
    }
}

/// Stage of the per-symbol pipeline that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Fetch,
    Parse,
    Persist,
}

/// Errors that end a sync cycle
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to enumerate symbols: {0}")]
    Enumeration(HttpError),

    #[error("Malformed symbol list: {0}")]
    SymbolParse(ParseError),

    #[error("A sync cycle is already in progress")]
    CycleInProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind() {
        let fetch = SymbolFailure::from(HttpError::new("https://api.huobipro.com/x", "502 & Bad Gateway"));
        assert_eq!(fetch.kind(), FailureKind::Fetch);
        assert_eq!(
            fetch.to_string(),
            "fetch failed: https://api.huobipro.com/x: 502 & Bad Gateway"
        );

        let persist = SymbolFailure::from(StorageError::NoDefaultConnection);
        assert_eq!(persist.kind(), FailureKind::Persist);
        assert_eq!(serde_json::to_value(persist.kind()).unwrap(), "persist");
    }
}
