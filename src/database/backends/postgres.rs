use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Jsonb, Text};
use serde_json::Value;

use super::DocumentBackend;
use crate::database::connection::{default_database_from_url, StorageError, WriteFailure};
use crate::database::document::{apply_update, id_key, prepare_insert, upsert_seed};
use crate::database::options::{FindOptions, InsertOutcome, SortKey, UpdateOutcome};

/// Type alias for PostgreSQL connection pool
pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Type alias for pooled connection
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(QueryableByName)]
struct DocumentRow {
    #[diesel(sql_type = BigInt)]
    pk: i64,

    #[diesel(sql_type = Jsonb)]
    doc: Value,
}

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = Jsonb)]
    doc_id: Value,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Document store on PostgreSQL JSONB
///
/// A logical database maps to a schema and a collection to a table:
///
/// ```sql
/// CREATE TABLE "<db>"."<collection>" (
///     pk     BIGSERIAL PRIMARY KEY,
///     doc_id JSONB NOT NULL UNIQUE,
///     doc    JSONB NOT NULL
/// );
/// ```
///
/// Schemas and tables are created on first use, together with an index on `doc->'ts'`.
/// Concurrent creation is serialized per schema with a transaction-scoped advisory lock.
/// Diesel is synchronous, so every operation runs on the blocking pool.
pub struct PostgresBackend {
    pool: PgPool,
    default_database: String,
    ensured: Arc<DashSet<String>>,
}

impl PostgresBackend {
    /// Schema used when the connection string names no database
    pub const DEFAULT_SCHEMA: &'static str = "public";

    /// Build the pool and check one connection out of it (blocking)
    pub fn connect(url: &str, pool_size: u32) -> Result<Self, StorageError> {
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?;

        let _ = pool
            .get()
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let default_database = default_database_from_url(url)
            .unwrap_or(Self::DEFAULT_SCHEMA)
            .to_string();

        tracing::info!(
            "PostgreSQL document store connected (pool size {}, default database {})",
            pool_size.max(1),
            default_database
        );

        Ok(Self {
            pool,
            default_database,
            ensured: Arc::new(DashSet::new()),
        })
    }

    /// Run `f` with a connection whose target table exists
    async fn with_table<T, F>(&self, db: &str, collection: &str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgPooledConnection, &str) -> Result<T, StorageError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let ensured = Arc::clone(&self.ensured);
        let (db, collection) = (db.to_string(), collection.to_string());

        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StorageError::ConnectionPool(e.to_string()))?;
            let table = qualified_table(&db, &collection);

            if !ensured.contains(&table) {
                ensure_table(&mut conn, &db, &collection)?;
                ensured.insert(table.clone());
            }

            f(&mut conn, &table)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

/// Quote an identifier for interpolation into SQL
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified_table(db: &str, collection: &str) -> String {
    format!("{}.{}", quote_ident(db), quote_ident(collection))
}

/// Quote a string literal for interpolation into SQL
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Taken before any DDL; `IF NOT EXISTS` alone still races on the catalog
const DDL_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

fn ddl_statements(db: &str, collection: &str) -> [String; 3] {
    let table = qualified_table(db, collection);
    [
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(db)),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (pk BIGSERIAL PRIMARY KEY, doc_id JSONB NOT NULL UNIQUE, doc JSONB NOT NULL)",
            table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ((doc->'ts'))",
            quote_ident(&format!("{}_ts_idx", collection)),
            table
        ),
    ]
}

fn ensure_table(conn: &mut PgConnection, db: &str, collection: &str) -> Result<(), StorageError> {
    conn.transaction::<_, StorageError, _>(|conn| {
        diesel::sql_query(DDL_LOCK_SQL)
            .bind::<Text, _>(db.to_string())
            .execute(conn)?;
        for statement in ddl_statements(db, collection) {
            diesel::sql_query(statement).execute(conn)?;
        }
        Ok(())
    })?;

    tracing::debug!("Ensured collection {}", qualified_table(db, collection));
    Ok(())
}

fn insert_row(conn: &mut PgConnection, table: &str, doc: Value) -> Result<Value, StorageError> {
    let (id, doc) = prepare_insert(doc)?;

    diesel::sql_query(format!("INSERT INTO {} (doc_id, doc) VALUES ($1, $2)", table))
        .bind::<Jsonb, _>(id.clone())
        .bind::<Jsonb, _>(doc)
        .execute(conn)
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => StorageError::duplicate(&id),
            other => StorageError::from(other),
        })?;

    Ok(id)
}

/// Insert a batch in one statement, skipping conflicting ids.
///
/// Malformed documents never reach the database. Documents whose id is not
/// returned by the insert already existed, or repeat an earlier id of the batch.
fn insert_batch(conn: &mut PgConnection, table: &str, docs: Vec<Value>) -> Result<InsertOutcome, StorageError> {
    let mut failures = Vec::new();
    let mut candidates = Vec::with_capacity(docs.len());
    let mut rows = Vec::with_capacity(docs.len());

    for (index, doc) in docs.into_iter().enumerate() {
        match prepare_insert(doc) {
            Ok((id, doc)) => {
                candidates.push((index, id));
                rows.push(doc);
            }
            Err(e) => failures.push(WriteFailure::from_error(index, &e)),
        }
    }

    let returned: Vec<Value> = if rows.is_empty() {
        Vec::new()
    } else {
        diesel::sql_query(format!(
            "INSERT INTO {} (doc_id, doc) \
             SELECT batch.elem->'_id', batch.elem \
             FROM jsonb_array_elements($1) WITH ORDINALITY AS batch(elem, ord) \
             ORDER BY batch.ord \
             ON CONFLICT (doc_id) DO NOTHING \
             RETURNING doc_id",
            table
        ))
        .bind::<Jsonb, _>(Value::Array(rows))
        .load::<IdRow>(conn)?
        .into_iter()
        .map(|row| row.doc_id)
        .collect()
    };

    let (outcome, duplicates) = reconcile_batch(candidates, &returned);
    failures.extend(duplicates);
    failures.sort_by_key(|failure| failure.index);

    if failures.is_empty() {
        Ok(outcome)
    } else {
        Err(StorageError::BulkWrite {
            inserted: outcome.inserted,
            failures,
        })
    }
}

/// Match the ids an insert returned against the submitted `(index, id)` pairs.
///
/// The first submission of each returned id is the inserted one; every other
/// submission is a duplicate key failure.
fn reconcile_batch(candidates: Vec<(usize, Value)>, returned: &[Value]) -> (InsertOutcome, Vec<WriteFailure>) {
    let mut remaining: HashMap<String, usize> = HashMap::new();
    for id in returned {
        *remaining.entry(id_key(id)).or_default() += 1;
    }

    let mut outcome = InsertOutcome::default();
    let mut duplicates = Vec::new();
    for (index, id) in candidates {
        match remaining.get_mut(&id_key(&id)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                outcome.inserted += 1;
                outcome.inserted_ids.push(id);
            }
            _ => duplicates.push(WriteFailure::from_error(index, &StorageError::duplicate(&id))),
        }
    }

    (outcome, duplicates)
}

/// `SELECT` for a query: containment filter on `$1`, then sort keys, skip and limit.
///
/// Sort keys compare `jsonb` values; documents missing the field sort first
/// ascending and last descending. Ties keep insertion order.
fn select_sql(table: &str, options: &FindOptions, for_update: bool) -> String {
    let mut order: Vec<String> = options.sort.iter().map(sort_term).collect();
    order.push("pk".to_string());

    let mut sql = format!("SELECT pk, doc FROM {} WHERE doc @> $1 ORDER BY {}", table, order.join(", "));
    if options.skip > 0 {
        sql.push_str(&format!(" OFFSET {}", options.skip));
    }
    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    if for_update {
        sql.push_str(" FOR UPDATE");
    }
    sql
}

fn sort_term(key: &SortKey) -> String {
    let path: Vec<String> = key.field.split('.').map(quote_literal).collect();
    let direction = if key.descending { "DESC NULLS LAST" } else { "ASC NULLS FIRST" };
    format!("doc #> ARRAY[{}]::text[] {}", path.join(", "), direction)
}

fn select_rows(
    conn: &mut PgConnection,
    table: &str,
    filter: &Value,
    options: &FindOptions,
    for_update: bool,
) -> Result<Vec<DocumentRow>, StorageError> {
    Ok(diesel::sql_query(select_sql(table, options, for_update))
        .bind::<Jsonb, _>(filter.clone())
        .load::<DocumentRow>(conn)?)
}

#[async_trait]
impl DocumentBackend for PostgresBackend {
    fn default_database(&self) -> &str {
        &self.default_database
    }

    async fn insert_one(&self, db: &str, collection: &str, doc: Value) -> Result<InsertOutcome, StorageError> {
        self.with_table(db, collection, move |conn, table| {
            let id = insert_row(conn, table, doc)?;
            Ok(InsertOutcome {
                inserted: 1,
                inserted_ids: vec![id],
            })
        })
        .await
    }

    async fn insert_many(
        &self,
        db: &str,
        collection: &str,
        docs: Vec<Value>,
        ordered: bool,
    ) -> Result<InsertOutcome, StorageError> {
        self.with_table(db, collection, move |conn, table| {
            if !ordered {
                return insert_batch(conn, table, docs);
            }

            // Row by row up to the first failure; earlier rows stay written
            let mut outcome = InsertOutcome::default();
            let mut failures = Vec::new();

            for (index, doc) in docs.into_iter().enumerate() {
                match insert_row(conn, table, doc) {
                    Ok(id) => {
                        outcome.inserted += 1;
                        outcome.inserted_ids.push(id);
                    }
                    Err(e) => {
                        failures.push(WriteFailure::from_error(index, &e));
                        break;
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
        .await
    }

    async fn find(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        let (filter, options) = (filter.clone(), options.clone());
        self.with_table(db, collection, move |conn, table| {
            let rows = select_rows(conn, table, &filter, &options, false)?;
            Ok(rows.into_iter().map(|row| row.doc).collect())
        })
        .await
    }

    async fn count(&self, db: &str, collection: &str, filter: &Value) -> Result<u64, StorageError> {
        let filter = filter.clone();
        self.with_table(db, collection, move |conn, table| {
            let row = diesel::sql_query(format!("SELECT COUNT(*) AS count FROM {} WHERE doc @> $1", table))
                .bind::<Jsonb, _>(filter)
                .get_result::<CountRow>(conn)?;
            Ok(row.count.max(0) as u64)
        })
        .await
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
        let (filter, update) = (filter.clone(), update.clone());
        self.with_table(db, collection, move |conn, table| {
            conn.transaction::<_, StorageError, _>(|conn| {
                let window = FindOptions {
                    limit: if multi { None } else { Some(1) },
                    ..Default::default()
                };
                let rows = select_rows(conn, table, &filter, &window, true)?;

                let mut outcome = UpdateOutcome {
                    matched: rows.len() as u64,
                    ..Default::default()
                };

                for row in rows {
                    let new_doc = apply_update(&row.doc, &update)?;
                    if new_doc == row.doc {
                        continue;
                    }
                    diesel::sql_query(format!("UPDATE {} SET doc = $1 WHERE pk = $2", table))
                        .bind::<Jsonb, _>(new_doc)
                        .bind::<BigInt, _>(row.pk)
                        .execute(conn)?;
                    outcome.modified += 1;
                }

                if outcome.matched == 0 && upsert {
                    let doc = apply_update(&upsert_seed(&filter), &update)?;
                    outcome.upserted_id = Some(insert_row(conn, table, doc)?);
                }

                Ok(outcome)
            })
        })
        .await
    }

    async fn delete(&self, db: &str, collection: &str, filter: &Value, multi: bool) -> Result<u64, StorageError> {
        let filter = filter.clone();
        self.with_table(db, collection, move |conn, table| {
            let sql = if multi {
                format!("DELETE FROM {} WHERE doc @> $1", table)
            } else {
                format!(
                    "DELETE FROM {t} WHERE pk = (SELECT pk FROM {t} WHERE doc @> $1 ORDER BY pk LIMIT 1)",
                    t = table
                )
            };
            let deleted = diesel::sql_query(sql).bind::<Jsonb, _>(filter).execute(conn)?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn close(&self) {
        // r2d2 closes idle connections when the last pool handle drops
        tracing::info!(
            "Closing PostgreSQL document store ({} connections open)",
            self.pool.state().connections
        );
    }
}
