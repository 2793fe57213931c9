use serde::{Deserialize, Serialize};

/// A tradable pair as listed by `/v1/common/symbols`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Exchange identifier, e.g. "btcusdt"
    pub symbol: String,

    /// Quote currency, e.g. "usdt"
    #[serde(rename = "quote-currency")]
    pub quote_currency: String,
}

impl SymbolInfo {
    pub fn new(symbol: impl Into<String>, quote_currency: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quote_currency: quote_currency.into(),
        }
    }
}

/// Envelope of the symbol list response; other envelope fields are ignored
#[derive(Debug, Deserialize)]
pub(crate) struct SymbolsResponse {
    pub data: Vec<SymbolInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_deserializes_exchange_field_names() {
        let json = r#"{"base-currency":"btc","quote-currency":"usdt","symbol":"btcusdt","price-precision":2}"#;
        let symbol: SymbolInfo = serde_json::from_str(json).unwrap();
        assert_eq!(symbol, SymbolInfo::new("btcusdt", "usdt"));
    }
}
