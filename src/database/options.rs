use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::connection::StorageError;

/// Per-operation routing: which connection, which logical database, and how
/// many documents an update/delete touches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Connection name; the default connection when None
    pub client: Option<String>,

    /// Logical database; the connection's default database when None
    pub db: Option<String>,

    /// Many (default) or one for update/delete
    pub multi: Option<bool>,

    /// Insert when an update matches nothing
    #[serde(default)]
    pub upsert: bool,

    /// Use identifiers verbatim instead of coercing them to the native type
    #[serde(default)]
    pub raw: bool,
}

impl RoutingOptions {
    /// Route to a logical database on the default connection
    pub fn db(name: impl Into<String>) -> Self {
        Self {
            db: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_client(mut self, name: impl Into<String>) -> Self {
        self.client = Some(name.into());
        self
    }

    /// Touch only the first matching document
    pub fn one(mut self) -> Self {
        self.multi = Some(false);
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn is_multi(&self) -> bool {
        self.multi.unwrap_or(true)
    }
}

/// Insert behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Stop at the first failing document (true) or keep writing the rest (false)
    pub ordered: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

impl WriteOptions {
    pub fn unordered() -> Self {
        Self { ordered: false }
    }
}

/// Documents handed to an insert: a single document takes the single-insert path
#[derive(Debug, Clone, PartialEq)]
pub enum Documents {
    One(Value),
    Many(Vec<Value>),
}

impl From<Value> for Documents {
    fn from(value: Value) -> Self {
        Documents::One(value)
    }
}

impl From<Vec<Value>> for Documents {
    fn from(values: Vec<Value>) -> Self {
        Documents::Many(values)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Query shaping for `find`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    /// `{ "field": 1 }` inclusion or `{ "field": 0 }` exclusion
    pub projection: Option<Value>,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn projection(projection: Value) -> Self {
        Self {
            projection: Some(projection),
            ..Default::default()
        }
    }
}

/// Result of an insert
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub inserted_ids: Vec<Value>,
}

/// Result of an update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

/// Coerce a logical identifier into the store's native identifier.
///
/// Native identifiers are UUIDs in canonical hyphenated form. With `raw` the value is
/// used as given.
pub fn coerce_id(id: &Value, raw: bool) -> Result<Value, StorageError> {
    if raw {
        return Ok(id.clone());
    }

    let text = id
        .as_str()
        .ok_or_else(|| StorageError::InvalidId(id.to_string()))?;
    let uuid = Uuid::parse_str(text).map_err(|_| StorageError::InvalidId(text.to_string()))?;

    Ok(Value::String(uuid.hyphenated().to_string()))
}

/// A fresh native identifier
pub fn new_native_id() -> Value {
    Value::String(Uuid::new_v4().hyphenated().to_string())
}
