use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::backends::DocumentBackend;
use super::connection::{open_backend, StorageError};
use super::document::{check_filter, project_documents, run_pipeline, split_pipeline};
use super::options::{coerce_id, Documents, FindOptions, InsertOutcome, RoutingOptions, UpdateOutcome, WriteOptions};
use crate::config::NamedConnection;
use crate::market::normalizer::PRIMARY_KEY_FIELD;

#[derive(Default)]
struct Registry {
    /// Open connections, in the order they were established
    clients: Vec<(String, Arc<dyn DocumentBackend>)>,
    default_client: Option<String>,
}

/// Collection-level access to one or more named document-store connections
///
/// Every operation is routed by `RoutingOptions`: the named connection (or the
/// default one, the first that opened) and the named logical database (or that
/// connection's default database).
pub struct StorageRouter {
    registry: RwLock<Registry>,
}

impl Default for StorageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRouter {
    /// Router without connections
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Open every connection concurrently.
    ///
    /// The first connection to open successfully becomes the default. Failed
    /// connections are logged and left out.
    pub async fn connect(connections: &[NamedConnection], pool_size: u32) -> Self {
        let router = Self::new();

        let mut pending: FuturesUnordered<_> = connections
            .iter()
            .map(|conn| async move { (conn.name.clone(), open_backend(&conn.url, pool_size).await) })
            .collect();

        while let Some((name, result)) = pending.next().await {
            match result {
                Ok(backend) => {
                    tracing::info!("Storage connection '{}' established", name);
                    router.register(name, backend);
                }
                Err(e) => {
                    tracing::error!("Failed to open storage connection '{}': {}", name, e);
                }
            }
        }

        if router.default_client().is_none() {
            tracing::warn!("No storage connection could be opened");
        }

        router
    }

    /// Attach an open backend; it becomes the default if there is none
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn DocumentBackend>) {
        let name = name.into();
        let mut registry = self.registry.write();

        registry.clients.retain(|(existing, _)| *existing != name);
        registry.clients.push((name.clone(), backend));

        if registry.default_client.is_none() {
            tracing::debug!("Default storage connection is now '{}'", name);
            registry.default_client = Some(name);
        }
    }

    /// Name of the default connection
    pub fn default_client(&self) -> Option<String> {
        self.registry.read().default_client.clone()
    }

    /// Names of all open connections
    pub fn client_names(&self) -> Vec<String> {
        self.registry
            .read()
            .clients
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Close one connection. Closing the default promotes the oldest remaining
    /// connection, or leaves the router without a default.
    pub async fn close(&self, name: &str) -> Result<(), StorageError> {
        let backend = {
            let mut registry = self.registry.write();
            let position = registry
                .clients
                .iter()
                .position(|(existing, _)| existing == name)
                .ok_or_else(|| StorageError::UnknownConnection(name.to_string()))?;
            let (_, backend) = registry.clients.remove(position);

            if registry.default_client.as_deref() == Some(name) {
                registry.default_client = registry.clients.first().map(|(next, _)| next.clone());
                match &registry.default_client {
                    Some(next) => tracing::info!("Default storage connection switched to '{}'", next),
                    None => tracing::warn!("Closed the last storage connection"),
                }
            }
            backend
        };

        backend.close().await;
        Ok(())
    }

    /// Close every connection and clear the default
    pub async fn close_all(&self) {
        let clients = {
            let mut registry = self.registry.write();
            registry.default_client = None;
            std::mem::take(&mut registry.clients)
        };

        for (name, backend) in clients {
            tracing::debug!("Closing storage connection '{}'", name);
            backend.close().await;
        }
    }

    /// Backend and logical database an operation is routed to
    pub fn resolve(&self, routing: &RoutingOptions) -> Result<(Arc<dyn DocumentBackend>, String), StorageError> {
        let registry = self.registry.read();

        let name = match &routing.client {
            Some(name) => name.as_str(),
            None => registry
                .default_client
                .as_deref()
                .ok_or(StorageError::NoDefaultConnection)?,
        };

        let backend = registry
            .clients
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, backend)| Arc::clone(backend))
            .ok_or_else(|| StorageError::UnknownConnection(name.to_string()))?;

        let db = routing
            .db
            .clone()
            .unwrap_or_else(|| backend.default_database().to_string());

        Ok((backend, db))
    }

    /// Insert one document or a batch
    pub async fn insert(
        &self,
        collection: &str,
        docs: impl Into<Documents>,
        write: &WriteOptions,
        routing: &RoutingOptions,
    ) -> Result<InsertOutcome, StorageError> {
        let (backend, db) = self.resolve(routing)?;
        match docs.into() {
            Documents::One(doc) => backend.insert_one(&db, collection, doc).await,
            Documents::Many(docs) => backend.insert_many(&db, collection, docs, write.ordered).await,
        }
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
        routing: &RoutingOptions,
    ) -> Result<Vec<Value>, StorageError> {
        check_filter(filter)?;
        let (backend, db) = self.resolve(routing)?;

        let docs = backend.find(&db, collection, filter, options).await?;
        project_documents(docs, options)
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
        routing: &RoutingOptions,
    ) -> Result<Option<Value>, StorageError> {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find(collection, filter, &options, routing).await?.into_iter().next())
    }

    /// Find by primary key; the id is coerced to a native identifier unless `routing.raw`
    pub async fn find_by_id(
        &self,
        collection: &str,
        id: &Value,
        projection: Option<Value>,
        routing: &RoutingOptions,
    ) -> Result<Option<Value>, StorageError> {
        let filter = id_filter(id, routing.raw)?;
        let options = FindOptions {
            projection,
            ..Default::default()
        };
        self.find_one(collection, &filter, &options, routing).await
    }

    pub async fn count(&self, collection: &str, filter: &Value, routing: &RoutingOptions) -> Result<u64, StorageError> {
        check_filter(filter)?;
        let (backend, db) = self.resolve(routing)?;
        backend.count(&db, collection, filter).await
    }

    /// Apply update operators to every match, or the first one with `routing.one()`
    pub async fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        routing: &RoutingOptions,
    ) -> Result<UpdateOutcome, StorageError> {
        check_filter(filter)?;
        let (backend, db) = self.resolve(routing)?;
        backend
            .update(&db, collection, filter, update, routing.is_multi(), routing.upsert)
            .await
    }

    /// `$set` the fields of `doc` on matching documents
    pub async fn upsert(
        &self,
        collection: &str,
        filter: &Value,
        doc: &Value,
        routing: &RoutingOptions,
    ) -> Result<UpdateOutcome, StorageError> {
        self.update(collection, filter, &json!({ "$set": doc }), routing).await
    }

    pub async fn upsert_by_id(
        &self,
        collection: &str,
        id: &Value,
        doc: &Value,
        routing: &RoutingOptions,
    ) -> Result<UpdateOutcome, StorageError> {
        let filter = id_filter(id, routing.raw)?;
        self.upsert(collection, &filter, doc, routing).await
    }

    /// Delete every match, or the first one with `routing.one()`
    pub async fn delete(&self, collection: &str, filter: &Value, routing: &RoutingOptions) -> Result<u64, StorageError> {
        check_filter(filter)?;
        let (backend, db) = self.resolve(routing)?;
        backend.delete(&db, collection, filter, routing.is_multi()).await
    }

    pub async fn delete_by_id(&self, collection: &str, id: &Value, routing: &RoutingOptions) -> Result<u64, StorageError> {
        let filter = id_filter(id, routing.raw)?;
        self.delete(collection, &filter, routing).await
    }

    /// Run an aggregation pipeline.
    ///
    /// A leading `$match` and the `$sort`/`$skip`/`$limit` stages right after it run
    /// as a backend query; the remaining stages run in process over its result.
    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        routing: &RoutingOptions,
    ) -> Result<Vec<Value>, StorageError> {
        let (backend, db) = self.resolve(routing)?;
        let (filter, options, rest) = split_pipeline(pipeline)?;
        let docs = backend.find(&db, collection, &filter, &options).await?;
        run_pipeline(docs, rest)
    }
}

fn id_filter(id: &Value, raw: bool) -> Result<Value, StorageError> {
    let mut filter = serde_json::Map::new();
    filter.insert(PRIMARY_KEY_FIELD.to_string(), coerce_id(id, raw)?);
    Ok(Value::Object(filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::backends::MemoryBackend;
    use crate::database::options::SortKey;

    fn memory_router() -> (StorageRouter, Arc<MemoryBackend>) {
        let router = StorageRouter::new();
        let backend = Arc::new(MemoryBackend::new("Tradedata"));
        router.register("main", backend.clone());
        (router, backend)
    }

    #[tokio::test]
    async fn test_connect_picks_first_successful_connection() {
        let connections = vec![
            NamedConnection {
                name: "broken".to_string(),
                url: "ftp://nowhere".to_string(),
            },
            NamedConnection {
                name: "main".to_string(),
                url: "memory://Tradedata".to_string(),
            },
        ];

        let router = StorageRouter::connect(&connections, 1).await;
        assert_eq!(router.default_client().as_deref(), Some("main"));
        assert_eq!(router.client_names(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_connect_with_nothing_usable() {
        let connections = vec![NamedConnection {
            name: "broken".to_string(),
            url: "ftp://nowhere".to_string(),
        }];

        let router = StorageRouter::connect(&connections, 1).await;
        assert!(router.default_client().is_none());
        let err = router.count("c", &json!({}), &RoutingOptions::default()).await.unwrap_err();
        assert!(matches!(err, StorageError::NoDefaultConnection));
    }

    #[tokio::test]
    async fn test_routing_uses_default_database_and_named_client() {
        let (router, main) = memory_router();
        let aux = Arc::new(MemoryBackend::new("aux_db"));
        router.register("aux", aux.clone());

        router
            .insert("btcusdt", json!({"_id": 1}), &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();
        router
            .insert(
                "btcusdt",
                json!({"_id": 2}),
                &WriteOptions::default(),
                &RoutingOptions::db("TradedataBTC").with_client("aux"),
            )
            .await
            .unwrap();

        assert_eq!(main.documents("Tradedata", "btcusdt"), vec![json!({"_id": 1})]);
        assert_eq!(aux.documents("TradedataBTC", "btcusdt"), vec![json!({"_id": 2})]);

        let err = router
            .count("btcusdt", &json!({}), &RoutingOptions::default().with_client("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn test_close_default_reselects() {
        let (router, _) = memory_router();
        router.register("second", Arc::new(MemoryBackend::default()));
        router.register("third", Arc::new(MemoryBackend::default()));

        router.close("main").await.unwrap();
        assert_eq!(router.default_client().as_deref(), Some("second"));

        router.close("third").await.unwrap();
        assert_eq!(router.default_client().as_deref(), Some("second"));

        router.close("second").await.unwrap();
        assert!(router.default_client().is_none());

        assert!(matches!(router.close("second").await, Err(StorageError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (router, _) = memory_router();
        router.register("second", Arc::new(MemoryBackend::default()));
        router.close_all().await;
        assert!(router.client_names().is_empty());
        assert!(router.default_client().is_none());
    }

    #[tokio::test]
    async fn test_unordered_batch_keeps_good_documents() {
        let (router, backend) = memory_router();
        let docs = vec![
            json!({"_id": 1, "price": 100}),
            json!(["malformed"]),
            json!({"_id": 3, "price": 102}),
            json!({"_id": 4, "price": 103}),
        ];

        let err = router
            .insert("btcusdt", docs, &WriteOptions::unordered(), &RoutingOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.inserted(), 3);
        assert_eq!(backend.documents("Tradedata", "btcusdt").len(), 3);
    }

    #[tokio::test]
    async fn test_find_with_options() {
        let (router, _) = memory_router();
        let docs: Vec<Value> = (1..=5).map(|i| json!({"_id": i, "ts": 10 - i, "side": "buy"})).collect();
        router
            .insert("btcusdt", docs, &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();

        let options = FindOptions {
            projection: Some(json!({"ts": 1, "_id": 0})),
            sort: vec![SortKey::asc("ts")],
            skip: 1,
            limit: Some(2),
        };
        let found = router
            .find("btcusdt", &json!({"side": "buy"}), &options, &RoutingOptions::default())
            .await
            .unwrap();
        assert_eq!(found, vec![json!({"ts": 6}), json!({"ts": 7})]);

        let first = router
            .find_one("btcusdt", &json!({}), &FindOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();
        assert_eq!(first.unwrap()["_id"], json!(1));

        let err = router
            .find("btcusdt", &json!([1]), &FindOptions::default(), &RoutingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_id_coercion_and_raw() {
        let (router, _) = memory_router();
        let outcome = router
            .insert("meta", json!({"name": "generated"}), &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();
        let generated = outcome.inserted_ids[0].clone();
        let upper = json!(generated.as_str().unwrap().to_uppercase());

        let found = router
            .find_by_id("meta", &upper, Some(json!({"name": 1})), &RoutingOptions::default())
            .await
            .unwrap();
        assert_eq!(found.unwrap()["name"], json!("generated"));

        router
            .insert("trades", json!({"_id": 42, "price": 1}), &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();
        let err = router
            .find_by_id("trades", &json!(42), None, &RoutingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidId(_)));

        let found = router
            .find_by_id("trades", &json!(42), None, &RoutingOptions::default().raw())
            .await
            .unwrap();
        assert_eq!(found, Some(json!({"_id": 42, "price": 1})));
    }

    #[tokio::test]
    async fn test_update_upsert_and_delete_modes() {
        let (router, _) = memory_router();
        let docs: Vec<Value> = (1..=3).map(|i| json!({"_id": i, "side": "buy"})).collect();
        router
            .insert("c", docs, &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();

        let outcome = router
            .upsert("c", &json!({"side": "buy"}), &json!({"checked": true}), &RoutingOptions::default().one())
            .await
            .unwrap();
        assert_eq!(outcome.modified, 1);
        assert_eq!(router.count("c", &json!({"checked": true}), &RoutingOptions::default()).await.unwrap(), 1);

        let outcome = router
            .upsert_by_id("c", &json!(9), &json!({"side": "sell"}), &RoutingOptions::default().raw().upsert())
            .await
            .unwrap();
        assert_eq!(outcome.upserted_id, Some(json!(9)));

        let deleted = router
            .delete_by_id("c", &json!(9), &RoutingOptions::default().raw())
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let deleted = router
            .delete("c", &json!({"side": "buy"}), &RoutingOptions::default().one())
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(router.count("c", &json!({}), &RoutingOptions::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_aggregate() {
        let (router, _) = memory_router();
        let docs: Vec<Value> = vec![
            json!({"_id": 1, "direction": "buy", "amount": 2}),
            json!({"_id": 2, "direction": "sell", "amount": 1}),
            json!({"_id": 3, "direction": "buy", "amount": 5}),
        ];
        router
            .insert("btcusdt", docs, &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();

        let result = router
            .aggregate(
                "btcusdt",
                &[json!({"$match": {"direction": "buy"}}), json!({"$sort": {"amount": -1}}), json!({"$limit": 1})],
                &RoutingOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, vec![json!({"_id": 3, "direction": "buy", "amount": 5})]);
    }

    /// Memory store that remembers the queries it was asked to run
    struct RecordingBackend {
        inner: MemoryBackend,
        queries: parking_lot::Mutex<Vec<(Value, FindOptions)>>,
    }

    #[async_trait::async_trait]
    impl DocumentBackend for RecordingBackend {
        fn default_database(&self) -> &str {
            self.inner.default_database()
        }

        async fn insert_one(&self, db: &str, collection: &str, doc: Value) -> Result<InsertOutcome, StorageError> {
            self.inner.insert_one(db, collection, doc).await
        }

        async fn insert_many(
            &self,
            db: &str,
            collection: &str,
            docs: Vec<Value>,
            ordered: bool,
        ) -> Result<InsertOutcome, StorageError> {
            self.inner.insert_many(db, collection, docs, ordered).await
        }

        async fn find(
            &self,
            db: &str,
            collection: &str,
            filter: &Value,
            options: &FindOptions,
        ) -> Result<Vec<Value>, StorageError> {
            self.queries.lock().push((filter.clone(), options.clone()));
            self.inner.find(db, collection, filter, options).await
        }

        async fn count(&self, db: &str, collection: &str, filter: &Value) -> Result<u64, StorageError> {
            self.inner.count(db, collection, filter).await
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
            self.inner.update(db, collection, filter, update, multi, upsert).await
        }

        async fn delete(&self, db: &str, collection: &str, filter: &Value, multi: bool) -> Result<u64, StorageError> {
            self.inner.delete(db, collection, filter, multi).await
        }
    }

    #[tokio::test]
    async fn test_queries_reach_the_backend_whole() {
        let router = StorageRouter::new();
        let backend = Arc::new(RecordingBackend {
            inner: MemoryBackend::new("Tradedata"),
            queries: parking_lot::Mutex::new(Vec::new()),
        });
        router.register("main", backend.clone());

        let docs: Vec<Value> = (1..=6)
            .map(|i| {
                let direction = if i % 2 == 0 { "buy" } else { "sell" };
                json!({"_id": i, "direction": direction, "ts": i * 10})
            })
            .collect();
        router
            .insert("btcusdt", docs, &WriteOptions::default(), &RoutingOptions::default())
            .await
            .unwrap();

        let options = FindOptions {
            sort: vec![SortKey::desc("ts")],
            skip: 1,
            limit: Some(1),
            projection: Some(json!({"ts": 1, "_id": 0})),
        };
        let found = router
            .find("btcusdt", &json!({"direction": "buy"}), &options, &RoutingOptions::default())
            .await
            .unwrap();
        assert_eq!(found, vec![json!({"ts": 40})]);

        let result = router
            .aggregate(
                "btcusdt",
                &[
                    json!({"$match": {"direction": "sell"}}),
                    json!({"$sort": {"ts": 1}}),
                    json!({"$limit": 2}),
                    json!({"$count": "n"}),
                ],
                &RoutingOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, vec![json!({"n": 2})]);

        let queries = backend.queries.lock();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].0, json!({"direction": "buy"}));
        assert_eq!(queries[0].1, options);
        assert_eq!(queries[1].0, json!({"direction": "sell"}));
        assert_eq!(queries[1].1.sort, vec![SortKey::asc("ts")]);
        assert_eq!(queries[1].1.limit, Some(2));
    }
}
