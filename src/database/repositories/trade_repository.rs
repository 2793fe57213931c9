use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::database::connection::StorageError;
use crate::database::options::{RoutingOptions, WriteOptions};
use crate::database::router::StorageRouter;

/// Database that receives USDT-quoted symbols; other quotes get a suffixed database
pub const DEFAULT_DATABASE_BASE: &str = "Tradedata";

const UNSUFFIXED_QUOTE_CURRENCY: &str = "USDT";

/// Logical database for a quote currency.
///
/// `USDT` (any case) maps to `base`, anything else to `base` followed by the
/// upper-cased currency, e.g. `btc` -> `TradedataBTC`.
pub fn database_name(base: &str, currency: &str) -> String {
    let currency = currency.to_uppercase();
    if currency == UNSUFFIXED_QUOTE_CURRENCY {
        base.to_string()
    } else {
        format!("{}{}", base, currency)
    }
}

/// Trade repository trait - persistence used by the sync job
#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Write a symbol's trades into its currency database, one collection per symbol.
    ///
    /// Returns the number of newly stored documents. Trades that are already stored
    /// are not an error.
    async fn insert_trades(&self, currency: &str, symbol: &str, trades: Vec<Value>) -> Result<usize, StorageError>;
}

/// Trade repository over the storage router
pub struct TradeRepositoryImpl {
    router: Arc<StorageRouter>,
    database_base: String,
    client: Option<String>,
}

impl TradeRepositoryImpl {
    pub fn new(router: Arc<StorageRouter>, database_base: impl Into<String>) -> Self {
        Self {
            router,
            database_base: database_base.into(),
            client: None,
        }
    }

    /// Write through a named connection instead of the default one
    pub fn with_client(mut self, name: impl Into<String>) -> Self {
        self.client = Some(name.into());
        self
    }

    fn routing(&self, currency: &str) -> RoutingOptions {
        let routing = RoutingOptions::db(database_name(&self.database_base, currency));
        match &self.client {
            Some(name) => routing.with_client(name.clone()),
            None => routing,
        }
    }
}

#[async_trait]
impl TradeRepository for TradeRepositoryImpl {
    async fn insert_trades(&self, currency: &str, symbol: &str, trades: Vec<Value>) -> Result<usize, StorageError> {
        if trades.is_empty() {
            return Ok(0);
        }

        let routing = self.routing(currency);
        let attempted = trades.len();

        match self
            .router
            .insert(symbol, trades, &WriteOptions::unordered(), &routing)
            .await
        {
            Ok(outcome) => Ok(outcome.inserted),
            Err(e) if e.is_duplicate_only() => {
                tracing::debug!(
                    "{}: {} of {} trades already stored",
                    symbol,
                    attempted - e.inserted(),
                    attempted
                );
                Ok(e.inserted())
            }
            Err(e) => Err(e),
        }
    }
}
