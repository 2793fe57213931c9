//! Turns exchange payloads into storable documents.
//!
//! Exchange trade records carry an `id` field, while the document store reserves
//! `_id` as its primary key. Every object key named `id` is renamed to `_id` so the
//! exchange identifier becomes the document identifier. Renaming works on parsed
//! keys, never on raw text, so `"bid"` or a string value containing "id" is left
//! alone.

use serde_json::{Map, Value};
use thiserror::Error;

use super::models::{SymbolInfo, SymbolsResponse};

/// Field name used by the exchange for record identifiers
pub const EXCHANGE_ID_FIELD: &str = "id";

/// Primary-key field reserved by the document store
pub const PRIMARY_KEY_FIELD: &str = "_id";

/// Layout of a trade history response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `{ "data": [record, ...] }`, parsed on the first fetch of a cycle
    Latest,
    /// `{ "data": [ { "data": [record, ...] }, ... ] }`, parsed when a failed
    /// symbol is re-fetched
    Retry,
}

/// Payload could not be turned into records
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Expected an array at `{0}`")]
    NotArray(&'static str),
}

/// Normalize a trade history body into documents, in payload order.
///
/// An empty record list is valid and yields an empty vector.
pub fn normalize_trades(body: &str, shape: PayloadShape) -> Result<Vec<Value>, ParseError> {
    let root: Value = serde_json::from_str(body)?;
    let data = take_array(root, "data")?;

    let records = match shape {
        PayloadShape::Latest => data,
        PayloadShape::Retry => match data.into_iter().next() {
            Some(batch) => take_array(batch, "data[0].data")?,
            None => Vec::new(),
        },
    };

    Ok(records
        .into_iter()
        .map(|mut record| {
            rename_reserved_keys(&mut record);
            record
        })
        .collect())
}

/// Parse the `/v1/common/symbols` body
pub fn parse_symbols(body: &str) -> Result<Vec<SymbolInfo>, ParseError> {
    let root: Value = serde_json::from_str(body)?;
    match root.get("data") {
        None | Some(Value::Null) => Err(ParseError::MissingField("data")),
        Some(Value::Array(_)) => Ok(serde_json::from_value::<SymbolsResponse>(root)?.data),
        Some(_) => Err(ParseError::NotArray("data")),
    }
}

/// Rename `id` keys to `_id` at every depth.
///
/// An object that already has `_id` keeps both keys untouched.
pub fn rename_reserved_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.contains_key(EXCHANGE_ID_FIELD) && !map.contains_key(PRIMARY_KEY_FIELD) {
                *map = rename_key(std::mem::take(map));
            }
            map.values_mut().for_each(rename_reserved_keys);
        }
        Value::Array(items) => items.iter_mut().for_each(rename_reserved_keys),
        _ => {}
    }
}

fn rename_key(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            if key == EXCHANGE_ID_FIELD {
                (PRIMARY_KEY_FIELD.to_string(), value)
            } else {
                (key, value)
            }
        })
        .collect()
}

fn take_array(value: Value, field: &'static str) -> Result<Vec<Value>, ParseError> {
    let Value::Object(mut map) = value else {
        return Err(ParseError::MissingField(field));
    };
    match map.remove("data") {
        Some(Value::Array(items)) => Ok(items),
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(_) => Err(ParseError::NotArray(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_renamed_to_primary_key() {
        let records = normalize_trades(r#"{"data":[{"id":1,"price":10}]}"#, PayloadShape::Latest).unwrap();
        assert_eq!(records, vec![json!({"_id": 1, "price": 10})]);
    }

    #[test]
    fn test_embedded_id_tokens_untouched() {
        let body = r#"{"data":[{"id":7,"bid":5,"side":"paid","trade-id":9,"note":"id"}]}"#;
        let records = normalize_trades(body, PayloadShape::Latest).unwrap();
        assert_eq!(
            records,
            vec![json!({"_id": 7, "bid": 5, "side": "paid", "trade-id": 9, "note": "id"})]
        );
    }

    #[test]
    fn test_nested_records_renamed() {
        let body = r#"{"data":[{"id":100,"ts":1,"data":[{"id":1,"price":2.5}]}]}"#;
        let records = normalize_trades(body, PayloadShape::Latest).unwrap();
        assert_eq!(records[0]["_id"], json!(100));
        assert_eq!(records[0]["data"][0]["_id"], json!(1));
        assert!(records[0]["data"][0].get("id").is_none());
    }

    #[test]
    fn test_existing_primary_key_is_kept() {
        let mut value = json!({"_id": "a", "id": "b"});
        rename_reserved_keys(&mut value);
        assert_eq!(value, json!({"_id": "a", "id": "b"}));
    }

    #[test]
    fn test_retry_shape_unwraps_one_level() {
        let body = r#"{"status":"ok","data":[{"id":5,"data":[{"id":2,"price":0.05}]}]}"#;
        let records = normalize_trades(body, PayloadShape::Retry).unwrap();
        assert_eq!(records, vec![json!({"_id": 2, "price": 0.05})]);
    }

    #[test]
    fn test_retry_matches_latest_for_same_records() {
        let latest = normalize_trades(r#"{"data":[{"id":3,"amount":1.5}]}"#, PayloadShape::Latest).unwrap();
        let retried =
            normalize_trades(r#"{"data":[{"data":[{"id":3,"amount":1.5}]}]}"#, PayloadShape::Retry).unwrap();
        assert_eq!(latest, retried);
    }

    #[test]
    fn test_empty_payloads_are_valid() {
        assert!(normalize_trades(r#"{"data":[]}"#, PayloadShape::Latest).unwrap().is_empty());
        assert!(normalize_trades(r#"{"data":[]}"#, PayloadShape::Retry).unwrap().is_empty());
        assert!(normalize_trades(r#"{"data":[{"data":[]}]}"#, PayloadShape::Retry).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            normalize_trades("{not json", PayloadShape::Latest),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            normalize_trades(r#"{"status":"error","err-msg":"invalid symbol"}"#, PayloadShape::Latest),
            Err(ParseError::MissingField("data"))
        ));
        assert!(matches!(
            normalize_trades(r#"{"data":{"id":1}}"#, PayloadShape::Latest),
            Err(ParseError::NotArray("data"))
        ));
        assert!(matches!(
            normalize_trades(r#"{"data":[{"id":1}]}"#, PayloadShape::Retry),
            Err(ParseError::MissingField("data[0].data"))
        ));
    }

    #[test]
    fn test_parse_symbols() {
        let body = r#"{"status":"ok","data":[
            {"base-currency":"btc","quote-currency":"usdt","symbol":"btcusdt"},
            {"base-currency":"eth","quote-currency":"btc","symbol":"ethbtc"}
        ]}"#;
        let symbols = parse_symbols(body).unwrap();
        assert_eq!(symbols, vec![SymbolInfo::new("btcusdt", "usdt"), SymbolInfo::new("ethbtc", "btc")]);
    }

    #[test]
    fn test_parse_symbols_rejects_bad_shapes() {
        assert!(matches!(parse_symbols(r#"{"status":"error"}"#), Err(ParseError::MissingField("data"))));
        assert!(matches!(parse_symbols(r#"{"data":"nope"}"#), Err(ParseError::NotArray("data"))));
        assert!(matches!(parse_symbols(r#"{"data":[{"symbol":"x"}]}"#), Err(ParseError::Json(_))));
    }
}
