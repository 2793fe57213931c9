//! Document semantics shared by every backend: filter matching, update operators,
//! projection, sorting and aggregation pipelines.
//!
//! Filters use JSONB containment (`@>`): a document matches when every field of the
//! filter is contained in the document. Arrays match when every filter element is
//! contained in some document element. Numbers compare by value, so `1` matches `1.0`.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::connection::StorageError;
use super::options::{new_native_id, FindOptions, SortKey};
use crate::market::normalizer::PRIMARY_KEY_FIELD;

/// Validate a filter; filters must be JSON objects
pub fn check_filter(filter: &Value) -> Result<(), StorageError> {
    if filter.is_object() {
        Ok(())
    } else {
        Err(StorageError::InvalidQuery(format!(
            "filter must be an object, got {}",
            filter
        )))
    }
}

/// True when `doc` contains `filter`
pub fn matches(doc: &Value, filter: &Value) -> bool {
    contains(doc, filter)
}

fn contains(doc: &Value, pattern: &Value) -> bool {
    match (doc, pattern) {
        (Value::Object(doc), Value::Object(pattern)) => pattern
            .iter()
            .all(|(key, expected)| doc.get(key).is_some_and(|actual| contains(actual, expected))),
        (Value::Array(doc), Value::Array(pattern)) => pattern
            .iter()
            .all(|expected| doc.iter().any(|actual| contains(actual, expected))),
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (a, b) => a == b,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.as_u64(), b.as_u64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
    }
}

/// Check a document for insertion and make sure it carries a primary key.
///
/// Returns the primary key and the (possibly completed) document.
pub fn prepare_insert(doc: Value) -> Result<(Value, Value), StorageError> {
    let mut map = match doc {
        Value::Object(map) => map,
        other => {
            return Err(StorageError::InvalidDocument(format!(
                "document must be an object, got {}",
                other
            )))
        }
    };

    let id = match map.get(PRIMARY_KEY_FIELD) {
        Some(Value::Array(_)) => {
            return Err(StorageError::InvalidDocument(
                "_id cannot be an array".to_string(),
            ))
        }
        Some(id) => id.clone(),
        None => {
            let id = new_native_id();
            map.insert(PRIMARY_KEY_FIELD.to_string(), id.clone());
            id
        }
    };

    Ok((id, Value::Object(map)))
}

/// Text key identifying a primary key value.
///
/// Integral numbers share one key whatever their spelling, so `1` and `1.0` collide
/// the same way they do in a JSONB unique index.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT => (f as i64).to_string(),
                    _ => n.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}

const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Apply `$set`, `$unset` and `$inc` to a copy of `doc`.
///
/// Field names may be dotted paths (`"meta.source"`). The primary key is immutable.
pub fn apply_update(doc: &Value, update: &Value) -> Result<Value, StorageError> {
    let operators = update
        .as_object()
        .filter(|ops| !ops.is_empty())
        .ok_or_else(|| StorageError::InvalidUpdate("update must be a non-empty object".to_string()))?;

    let mut result = doc.clone();

    for (operator, fields) in operators {
        let fields = fields.as_object().ok_or_else(|| {
            StorageError::InvalidUpdate(format!("{} expects an object", operator))
        })?;

        for (path, value) in fields {
            if path == PRIMARY_KEY_FIELD || path.starts_with("_id.") {
                return Err(StorageError::InvalidUpdate(
                    "_id is immutable".to_string(),
                ));
            }

            match operator.as_str() {
                "$set" => set_path(&mut result, path, value.clone())?,
                "$unset" => {
                    remove_path(&mut result, path);
                }
                "$inc" => {
                    let current = get_path(&result, path).cloned().unwrap_or(Value::from(0));
                    let sum = add_numbers(&current, value).ok_or_else(|| {
                        StorageError::InvalidUpdate(format!("cannot $inc non-numeric field {}", path))
                    })?;
                    set_path(&mut result, path, sum)?;
                }
                other => {
                    return Err(StorageError::InvalidUpdate(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
        }
    }

    Ok(result)
}

/// Seed document for an upsert: the filter's plain equality fields
pub fn upsert_seed(filter: &Value) -> Value {
    let seed: Map<String, Value> = filter
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .filter(|(key, _)| !key.starts_with('$'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();
    Value::Object(seed)
}

fn add_numbers(current: &Value, delta: &Value) -> Option<Value> {
    let (Value::Number(a), Value::Number(b)) = (current, delta) else {
        return None;
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Value::from(sum));
        }
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?).map(Value::Number)
}

pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.as_object()?.get(key))
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), StorageError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);

    let mut current = doc;
    for segment in segments {
        let map = current.as_object_mut().ok_or_else(|| {
            StorageError::InvalidUpdate(format!("cannot traverse non-object at {}", path))
        })?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    current
        .as_object_mut()
        .ok_or_else(|| StorageError::InvalidUpdate(format!("cannot set field on non-object at {}", path)))?
        .insert(last.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        Some((parent, last)) => {
            let mut current = doc;
            for segment in parent.split('.') {
                current = current.as_object_mut()?.get_mut(segment)?;
            }
            current.as_object_mut()?.remove(last)
        }
        None => doc.as_object_mut()?.remove(path),
    }
}

/// Apply a projection to one document.
///
/// Inclusion projections keep `_id` unless it is explicitly excluded.
pub fn project(doc: &Value, projection: &Value) -> Result<Value, StorageError> {
    let fields = projection
        .as_object()
        .ok_or_else(|| StorageError::InvalidQuery("projection must be an object".to_string()))?;
    let Some(source) = doc.as_object() else {
        return Ok(doc.clone());
    };

    let flag = |value: &Value| match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64() != Some(0.0)),
        other => Err(StorageError::InvalidQuery(format!(
            "projection values must be 0/1 or booleans, got {}",
            other
        ))),
    };

    let mut include_id = true;
    let mut included = Vec::new();
    let mut excluded = Vec::new();
    for (field, value) in fields {
        let keep = flag(value)?;
        if field == PRIMARY_KEY_FIELD {
            include_id = keep;
        } else if keep {
            included.push(field.as_str());
        } else {
            excluded.push(field.as_str());
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(StorageError::InvalidQuery(
            "projection cannot mix inclusion and exclusion".to_string(),
        ));
    }

    let projected: Map<String, Value> = if included.is_empty() {
        source
            .iter()
            .filter(|(key, _)| !excluded.contains(&key.as_str()))
            .filter(|(key, _)| include_id || key.as_str() != PRIMARY_KEY_FIELD)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    } else {
        source
            .iter()
            .filter(|(key, _)| {
                included.contains(&key.as_str()) || (include_id && key.as_str() == PRIMARY_KEY_FIELD)
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    };

    Ok(Value::Object(projected))
}

/// Sort documents in place; missing fields sort as null
pub fn sort_documents(docs: &mut [Value], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in keys {
            let left = get_path(a, &key.field).unwrap_or(&Value::Null);
            let right = get_path(b, &key.field).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right);
            let ordering = if key.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Total order across JSON types, the same one PostgreSQL uses for `jsonb`:
/// null < strings < numbers < booleans < arrays < objects.
///
/// Arrays and objects compare by length first.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x.len().cmp(&y.len()).then_with(|| {
            x.iter()
                .zip(y.iter())
                .map(|(l, r)| compare_values(l, r))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Sort, skip and limit the matches of a query
pub fn window_documents(mut docs: Vec<Value>, options: &FindOptions) -> Vec<Value> {
    sort_documents(&mut docs, &options.sort);

    let limit = options.limit.unwrap_or(usize::MAX);
    docs.into_iter().skip(options.skip).take(limit).collect()
}

/// Apply the projection of `options`, if any
pub fn project_documents(docs: Vec<Value>, options: &FindOptions) -> Result<Vec<Value>, StorageError> {
    match &options.projection {
        Some(projection) => docs.iter().map(|doc| project(doc, projection)).collect(),
        None => Ok(docs),
    }
}

/// Split off the head of a pipeline that a backend can run as a query.
///
/// The head is an optional `$match` followed by optional `$sort`, `$skip` and
/// `$limit`, each at most once and in that order. Returns the filter, the query
/// options and the stages left to run in process.
pub fn split_pipeline(pipeline: &[Value]) -> Result<(Value, FindOptions, &[Value]), StorageError> {
    let mut filter = Value::Object(Map::new());
    let mut options = FindOptions::default();
    let mut phase = 0;
    let mut consumed = 0;

    for stage in pipeline {
        let (name, spec) = stage_operator(stage)?;
        let next = match name.as_str() {
            "$match" => 1,
            "$sort" => 2,
            "$skip" => 3,
            "$limit" => 4,
            _ => break,
        };
        if next <= phase {
            break;
        }

        match next {
            1 => {
                check_filter(spec)?;
                filter = spec.clone();
            }
            2 => options.sort = sort_keys(spec)?,
            3 => options.skip = stage_count(name, spec)?,
            _ => options.limit = Some(stage_count(name, spec)?),
        }
        phase = next;
        consumed += 1;
    }

    Ok((filter, options, &pipeline[consumed..]))
}

fn stage_operator(stage: &Value) -> Result<(&String, &Value), StorageError> {
    stage
        .as_object()
        .filter(|s| s.len() == 1)
        .and_then(|s| s.iter().next())
        .ok_or_else(|| {
            StorageError::InvalidPipeline(format!("stage must have exactly one operator: {}", stage))
        })
}

/// Run an aggregation pipeline over `docs`.
///
/// Supported stages: `$match`, `$sort`, `$skip`, `$limit`, `$project`, `$count`.
pub fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>, StorageError> {
    for stage in pipeline {
        let (name, spec) = stage_operator(stage)?;

        docs = match name.as_str() {
            "$match" => {
                check_filter(spec)?;
                docs.into_iter().filter(|doc| matches(doc, spec)).collect()
            }
            "$sort" => {
                let keys = sort_keys(spec)?;
                sort_documents(&mut docs, &keys);
                docs
            }
            "$skip" => docs.into_iter().skip(stage_count(name, spec)?).collect(),
            "$limit" => docs.into_iter().take(stage_count(name, spec)?).collect(),
            "$project" => docs
                .iter()
                .map(|doc| project(doc, spec))
                .collect::<Result<_, _>>()?,
            "$count" => {
                let field = spec
                    .as_str()
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| StorageError::InvalidPipeline("$count expects a field name".to_string()))?;
                let mut counted = Map::new();
                counted.insert(field.to_string(), Value::from(docs.len() as u64));
                vec![Value::Object(counted)]
            }
            other => {
                return Err(StorageError::InvalidPipeline(format!(
                    "unsupported stage {}",
                    other
                )))
            }
        };
    }

    Ok(docs)
}

fn sort_keys(spec: &Value) -> Result<Vec<SortKey>, StorageError> {
    let fields = spec
        .as_object()
        .ok_or_else(|| StorageError::InvalidPipeline("$sort expects an object".to_string()))?;
    fields
        .iter()
        .map(|(field, direction)| match direction.as_i64() {
            Some(1) => Ok(SortKey::asc(field.clone())),
            Some(-1) => Ok(SortKey::desc(field.clone())),
            _ => Err(StorageError::InvalidPipeline(format!(
                "sort direction for {} must be 1 or -1",
                field
            ))),
        })
        .collect()
}

fn stage_count(name: &str, spec: &Value) -> Result<usize, StorageError> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StorageError::InvalidPipeline(format!("{} expects a non-negative integer", name)))
}
