use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::backends::{DocumentBackend, MemoryBackend, PostgresBackend};

/// One document that could not be written as part of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteFailure {
    /// Position of the document in the batch
    pub index: usize,
    pub duplicate: bool,
    pub message: String,
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No default connection is available")]
    NoDefaultConnection,

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Unsupported connection scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Database query error: {0}")]
    Query(String),

    #[error("Diesel error: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Bulk write failed: {inserted} inserted, {} failed", failures.len())]
    BulkWrite {
        inserted: usize,
        failures: Vec<WriteFailure>,
    },

    #[error("Blocking task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// Every failure of a batch was a duplicate key; the batch's data is already stored
    pub fn is_duplicate_only(&self) -> bool {
        match self {
            StorageError::DuplicateKey(_) => true,
            StorageError::BulkWrite { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.duplicate)
            }
            _ => false,
        }
    }

    /// Documents written before the error, if the error came from a batch
    pub fn inserted(&self) -> usize {
        match self {
            StorageError::BulkWrite { inserted, .. } => *inserted,
            _ => 0,
        }
    }

    pub(crate) fn duplicate(id: &Value) -> Self {
        StorageError::DuplicateKey(format!("_id {} already exists", id))
    }
}

impl WriteFailure {
    pub(crate) fn from_error(index: usize, error: &StorageError) -> Self {
        Self {
            index,
            duplicate: matches!(error, StorageError::DuplicateKey(_)),
            message: error.to_string(),
        }
    }
}

/// Open a backend for a connection string.
///
/// `postgres://` and `postgresql://` open a pooled PostgreSQL connection,
/// `memory://<db>` an in-process store.
pub async fn open_backend(url: &str, pool_size: u32) -> Result<Arc<dyn DocumentBackend>, StorageError> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| StorageError::UnsupportedScheme(url.to_string()))?;

    match scheme.as_str() {
        "postgres" | "postgresql" => {
            let url = url.to_string();
            let backend = tokio::task::spawn_blocking(move || PostgresBackend::connect(&url, pool_size))
                .await
                .map_err(|e| StorageError::Task(e.to_string()))??;
            Ok(Arc::new(backend))
        }
        "memory" => Ok(Arc::new(MemoryBackend::new(
            default_database_from_url(url).unwrap_or(MemoryBackend::DEFAULT_DATABASE),
        ))),
        other => Err(StorageError::UnsupportedScheme(other.to_string())),
    }
}

/// Database name embedded in a connection string path, if any
pub fn default_database_from_url(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);

    // memory://name has no host part
    let path = if url.starts_with("memory://") {
        rest
    } else {
        rest.split_once('/').map(|(_, path)| path)?
    };

    let name = path.trim_matches('/');
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_database_from_url() {
        assert_eq!(
            default_database_from_url("postgres://user:pw@localhost:5432/trades?sslmode=disable"),
            Some("trades")
        );
        assert_eq!(default_database_from_url("postgres://localhost:5432"), None);
        assert_eq!(default_database_from_url("postgres://localhost/"), None);
        assert_eq!(default_database_from_url("memory://scratch"), Some("scratch"));
        assert_eq!(default_database_from_url("memory://"), None);
    }

    #[test]
    fn test_duplicate_only_classification() {
        let dup = StorageError::duplicate(&serde_json::json!(1));
        assert!(dup.is_duplicate_only());

        let bulk = StorageError::BulkWrite {
            inserted: 3,
            failures: vec![WriteFailure::from_error(1, &dup)],
        };
        assert!(bulk.is_duplicate_only());
        assert_eq!(bulk.inserted(), 3);

        let mixed = StorageError::BulkWrite {
            inserted: 3,
            failures: vec![
                WriteFailure::from_error(1, &dup),
                WriteFailure::from_error(2, &StorageError::InvalidDocument("x".to_string())),
            ],
        };
        assert!(!mixed.is_duplicate_only());
        assert_eq!(mixed.to_string(), "Bulk write failed: 3 inserted, 2 failed");
    }

    #[tokio::test]
    async fn test_open_backend_schemes() {
        let backend = open_backend("memory://Tradedata", 1).await.unwrap();
        assert_eq!(backend.default_database(), "Tradedata");

        let backend = open_backend("memory://", 1).await.unwrap();
        assert_eq!(backend.default_database(), MemoryBackend::DEFAULT_DATABASE);

        assert!(matches!(
            open_backend("mongodb://localhost/x", 1).await,
            Err(StorageError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            open_backend("not-a-url", 1).await,
            Err(StorageError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_open_postgres_backend() {
        // Requires a running PostgreSQL; skipped when DATABASE_URL is not set
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let backend = open_backend(&url, 2).await;
        assert!(backend.is_ok(), "Failed to open PostgreSQL backend");
    }
}
