use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::DocumentBackend;
use crate::database::connection::{StorageError, WriteFailure};
use crate::database::document::{apply_update, id_key, matches, prepare_insert, upsert_seed, window_documents};
use crate::database::options::{FindOptions, InsertOutcome, UpdateOutcome};

#[derive(Default)]
struct Collection {
    docs: Vec<Value>,
    ids: HashSet<String>,
}

impl Collection {
    fn insert(&mut self, doc: Value) -> Result<Value, StorageError> {
        let (id, doc) = prepare_insert(doc)?;
        if !self.ids.insert(id_key(&id)) {
            return Err(StorageError::duplicate(&id));
        }
        self.docs.push(doc);
        Ok(id)
    }

    fn remove_at(&mut self, index: usize) {
        let doc = self.docs.remove(index);
        if let Some(id) = doc.get("_id") {
            self.ids.remove(&id_key(id));
        }
    }
}

/// In-process document store
///
/// Used by tests and for dry runs (`memory://<db>` connection strings). Data lives
/// as long as the backend.
pub struct MemoryBackend {
    default_database: String,
    databases: RwLock<HashMap<String, HashMap<String, Collection>>>,
}

impl MemoryBackend {
    pub const DEFAULT_DATABASE: &'static str = "test";

    pub fn new(default_database: impl Into<String>) -> Self {
        Self {
            default_database: default_database.into(),
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// Names of the logical databases that hold at least one collection
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every document of a collection, in insertion order
    pub fn documents(&self, db: &str, collection: &str) -> Vec<Value> {
        self.databases
            .read()
            .get(db)
            .and_then(|collections| collections.get(collection))
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    fn with_collection<T>(&self, db: &str, collection: &str, f: impl FnOnce(&mut Collection) -> T) -> T {
        let mut databases = self.databases.write();
        let coll = databases
            .entry(db.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        f(coll)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DATABASE)
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn default_database(&self) -> &str {
        &self.default_database
    }

    async fn insert_one(&self, db: &str, collection: &str, doc: Value) -> Result<InsertOutcome, StorageError> {
        let id = self.with_collection(db, collection, |coll| coll.insert(doc))?;
        Ok(InsertOutcome {
            inserted: 1,
            inserted_ids: vec![id],
        })
    }

    async fn insert_many(
        &self,
        db: &str,
        collection: &str,
        docs: Vec<Value>,
        ordered: bool,
    ) -> Result<InsertOutcome, StorageError> {
        self.with_collection(db, collection, |coll| {
            let mut outcome = InsertOutcome::default();
            let mut failures = Vec::new();

            for (index, doc) in docs.into_iter().enumerate() {
                match coll.insert(doc) {
                    Ok(id) => {
                        outcome.inserted += 1;
                        outcome.inserted_ids.push(id);
                    }
                    Err(e) => {
                        failures.push(WriteFailure::from_error(index, &e));
                        if ordered {
                            break;
                        }
                    }
                }
            }

            if failures.is_empty() {
                Ok(outcome)
            } else {
                Err(StorageError::BulkWrite {
                    inserted: outcome.inserted,
                    failures,
                })
            }
        })
    }

    async fn find(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        let databases = self.databases.read();
        let Some(coll) = databases.get(db).and_then(|c| c.get(collection)) else {
            return Ok(Vec::new());
        };

        if options.sort.is_empty() {
            let limit = options.limit.unwrap_or(usize::MAX);
            return Ok(coll
                .docs
                .iter()
                .filter(|doc| matches(doc, filter))
                .skip(options.skip)
                .take(limit)
                .cloned()
                .collect());
        }

        let found = coll.docs.iter().filter(|doc| matches(doc, filter)).cloned().collect();
        Ok(window_documents(found, options))
    }

    async fn count(&self, db: &str, collection: &str, filter: &Value) -> Result<u64, StorageError> {
        let databases = self.databases.read();
        Ok(databases
            .get(db)
            .and_then(|c| c.get(collection))
            .map(|coll| coll.docs.iter().filter(|doc| matches(doc, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn update(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        update: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome, StorageError> {
        self.with_collection(db, collection, |coll| {
            let targets: Vec<usize> = coll
                .docs
                .iter()
                .enumerate()
                .filter(|(_, doc)| matches(doc, filter))
                .map(|(index, _)| index)
                .take(if multi { usize::MAX } else { 1 })
                .collect();

            // Compute every new version first so a bad update leaves the collection untouched
            let updated = targets
                .iter()
                .map(|&index| apply_update(&coll.docs[index], update))
                .collect::<Result<Vec<_>, _>>()?;

            let mut outcome = UpdateOutcome {
                matched: targets.len() as u64,
                ..Default::default()
            };
            for (index, new_doc) in targets.into_iter().zip(updated) {
                if coll.docs[index] != new_doc {
                    coll.docs[index] = new_doc;
                    outcome.modified += 1;
                }
            }

            if outcome.matched == 0 && upsert {
                let doc = apply_update(&upsert_seed(filter), update)?;
                outcome.upserted_id = Some(coll.insert(doc)?);
            }

            Ok(outcome)
        })
    }

    async fn delete(&self, db: &str, collection: &str, filter: &Value, multi: bool) -> Result<u64, StorageError> {
        self.with_collection(db, collection, |coll| {
            let mut deleted = 0;
            let mut index = 0;
            while index < coll.docs.len() {
                if matches(&coll.docs[index], filter) {
                    coll.remove_at(index);
                    deleted += 1;
                    if !multi {
                        break;
                    }
                } else {
                    index += 1;
                }
            }
            Ok(deleted)
        })
    }

    async fn close(&self) {
        tracing::debug!("Closing in-memory store ({})", self.default_database);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unordered_insert_skips_malformed_document() {
        let backend = MemoryBackend::default();
        let docs = vec![
            json!({"_id": 1, "price": 10}),
            json!({"_id": 2, "price": 11}),
            json!("not a document"),
            json!({"_id": 4, "price": 13}),
        ];

        let err = backend.insert_many("db", "btcusdt", docs, false).await.unwrap_err();
        match err {
            StorageError::BulkWrite { inserted, failures } => {
                assert_eq!(inserted, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 2);
                assert!(!failures[0].duplicate);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(backend.documents("db", "btcusdt").len(), 3);
    }

    #[tokio::test]
    async fn test_ordered_insert_stops_at_first_failure() {
        let backend = MemoryBackend::default();
        let docs = vec![json!({"_id": 1}), json!({"_id": 1}), json!({"_id": 3})];

        let err = backend.insert_many("db", "c", docs, true).await.unwrap_err();
        assert_eq!(err.inserted(), 1);
        assert!(err.is_duplicate_only());
        assert_eq!(backend.documents("db", "c"), vec![json!({"_id": 1})]);
    }

    #[tokio::test]
    async fn test_insert_one_duplicate() {
        let backend = MemoryBackend::default();
        backend.insert_one("db", "c", json!({"_id": "a"})).await.unwrap();
        let err = backend.insert_one("db", "c", json!({"_id": "a"})).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_integral_float_id_is_duplicate() {
        let backend = MemoryBackend::default();
        backend.insert_one("db", "c", json!({"_id": 1})).await.unwrap();

        let err = backend.insert_one("db", "c", json!({"_id": 1.0})).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));

        let err = backend
            .insert_many("db", "c", vec![json!({"_id": 2.0}), json!({"_id": 2})], false)
            .await
            .unwrap_err();
        assert_eq!(err.inserted(), 1);
        assert!(err.is_duplicate_only());

        // The key is released under either spelling
        assert_eq!(backend.delete("db", "c", &json!({"_id": 2}), false).await.unwrap(), 1);
        backend.insert_one("db", "c", json!({"_id": 2})).await.unwrap();
        assert_eq!(backend.count("db", "c", &json!({})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_find_sorts_before_window() {
        let backend = MemoryBackend::default();
        let docs = vec![json!({"_id": 1, "ts": 5}), json!({"_id": 2, "ts": 9}), json!({"_id": 3, "ts": 7})];
        backend.insert_many("db", "c", docs, true).await.unwrap();

        let options = FindOptions {
            sort: vec![crate::database::options::SortKey::desc("ts")],
            skip: 1,
            limit: Some(1),
            ..Default::default()
        };
        let found = backend.find("db", "c", &json!({}), &options).await.unwrap();
        assert_eq!(found, vec![json!({"_id": 3, "ts": 7})]);

        let options = FindOptions {
            skip: 1,
            ..Default::default()
        };
        let found = backend.find("db", "c", &json!({}), &options).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0]["_id"], json!(2));
    }

    #[tokio::test]
    async fn test_update_many_and_one() {
        let backend = MemoryBackend::default();
        let docs = vec![
            json!({"_id": 1, "side": "buy", "seen": 0}),
            json!({"_id": 2, "side": "buy", "seen": 0}),
            json!({"_id": 3, "side": "sell", "seen": 0}),
        ];
        backend.insert_many("db", "c", docs, true).await.unwrap();

        let outcome = backend
            .update("db", "c", &json!({"side": "buy"}), &json!({"$inc": {"seen": 1}}), true, false)
            .await
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified), (2, 2));

        let outcome = backend
            .update("db", "c", &json!({"side": "buy"}), &json!({"$inc": {"seen": 1}}), false, false)
            .await
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified), (1, 1));

        let seen: Vec<Value> = backend.documents("db", "c").iter().map(|d| d["seen"].clone()).collect();
        assert_eq!(seen, vec![json!(2), json!(1), json!(0)]);
    }

    #[tokio::test]
    async fn test_upsert_inserts_seed() {
        let backend = MemoryBackend::default();
        let outcome = backend
            .update("db", "c", &json!({"symbol": "btcusdt"}), &json!({"$set": {"synced": true}}), true, true)
            .await
            .unwrap();
        assert_eq!(outcome.matched, 0);
        assert!(outcome.upserted_id.is_some());

        let docs = backend.documents("db", "c");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["symbol"], json!("btcusdt"));
        assert_eq!(docs[0]["synced"], json!(true));
    }

    #[tokio::test]
    async fn test_delete_many_and_one() {
        let backend = MemoryBackend::default();
        let docs = (1..=4).map(|i| json!({"_id": i, "side": "buy"})).collect();
        backend.insert_many("db", "c", docs, true).await.unwrap();

        assert_eq!(backend.delete("db", "c", &json!({"side": "buy"}), false).await.unwrap(), 1);
        assert_eq!(backend.count("db", "c", &json!({})).await.unwrap(), 3);
        assert_eq!(backend.delete("db", "c", &json!({"side": "buy"}), true).await.unwrap(), 3);
        assert_eq!(backend.count("db", "c", &json!({})).await.unwrap(), 0);

        // Deleted ids can be reused
        backend.insert_one("db", "c", json!({"_id": 1})).await.unwrap();
    }

    #[tokio::test]
    async fn test_databases_are_isolated() {
        let backend = MemoryBackend::default();
        backend.insert_one("Tradedata", "btcusdt", json!({"_id": 1})).await.unwrap();
        backend.insert_one("TradedataBTC", "ethbtc", json!({"_id": 1})).await.unwrap();

        assert_eq!(backend.database_names(), vec!["Tradedata", "TradedataBTC"]);
        assert!(backend.documents("Tradedata", "ethbtc").is_empty());
    }
}
