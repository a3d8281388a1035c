//! # Record Store
//!
//! Backend-independent storage abstraction for the pipeline's durable
//! collections (`record`, `dedup`, `state`, `uriCache`) and the transient
//! queue collections used by the Solr update pipeline.
//!
//! Documents are JSON objects keyed by `_id`. Iteration is a restartable
//! paged scan ordered by `_id`: each page requests `_id > last_id`, so an
//! interrupted scan resumes correctly and concurrent writers that do not
//! touch already-seen ids cannot break it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::error::RecordError;
use crate::model::{now_millis, to_unix_millis};

pub const RECORD_COLLECTION: &str = "record";
pub const DEDUP_COLLECTION: &str = "dedup";
pub const STATE_COLLECTION: &str = "state";
pub const URI_CACHE_COLLECTION: &str = "uriCache";

const QUEUE_PREFIX: &str = "mr_record_";
const QUEUE_TMP_PREFIX: &str = "tmp_mr_record_";
const QUEUE_MAX_AGE_MILLIS: i64 = 7 * 24 * 3600 * 1000;

/// Default page size for [`Store::iterate`].
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Structured filter evaluated store-side against documents.
///
/// Equality and `In` follow array-contains semantics on multi-valued
/// fields, which is what blocking-key candidate queries rely on.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Exists(String, bool),
    Lt(String, Value),
    Gte(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Filter::Ne(field.to_string(), value.into())
    }

    pub fn is_in(field: &str, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Filter::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn exists(field: &str, yes: bool) -> Self {
        Filter::Exists(field.to_string(), yes)
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(field.to_string(), value.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => eq_matches(doc.get(field), value),
            Filter::Ne(field, value) => !eq_matches(doc.get(field), value),
            Filter::In(field, values) => {
                values.iter().any(|v| eq_matches(doc.get(field), v))
            }
            Filter::Exists(field, yes) => {
                let present = matches!(doc.get(field), Some(v) if !v.is_null());
                present == *yes
            }
            Filter::Lt(field, value) => {
                compare(doc.get(field), value).is_some_and(|ord| ord.is_lt())
            }
            Filter::Gte(field, value) => {
                compare(doc.get(field), value).is_some_and(|ord| ord.is_ge())
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

fn eq_matches(field: Option<&Value>, wanted: &Value) -> bool {
    match field {
        None => wanted.is_null(),
        Some(Value::Array(items)) if !wanted.is_array() => {
            items.iter().any(|item| item == wanted)
        }
        Some(value) => value == wanted,
    }
}

fn compare(field: Option<&Value>, wanted: &Value) -> Option<std::cmp::Ordering> {
    match (field?, wanted) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options for [`Store::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted_by(field: &str, order: SortOrder) -> Self {
        Self {
            sort: Some((field.to_string(), order)),
            ..Self::default()
        }
    }

    pub fn limited(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// Options for [`Store::iterate`].
#[derive(Debug, Clone)]
pub struct IterateOptions {
    pub page_size: usize,
    /// Resume the scan after this id instead of from the beginning.
    pub start_after: Option<String>,
}

impl Default for IterateOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            start_after: None,
        }
    }
}

/// Callback verdict for [`Store::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterateControl {
    Continue,
    Stop,
}

/// Abstract operations over the durable collections, independent of the
/// backend. Connections are owned by the process that opened them.
pub trait Store: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, RecordError>;

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>, RecordError>;

    /// Restartable paged scan ordered by `_id`. Returns the number of
    /// documents the callback saw. The callback may stop the scan early.
    fn iterate(
        &self,
        collection: &str,
        filter: &Filter,
        options: &IterateOptions,
        callback: &mut dyn FnMut(Value) -> Result<IterateControl, RecordError>,
    ) -> Result<u64, RecordError>;

    /// Upsert by `_id`; assigns and returns a fresh id when the document
    /// has none.
    fn save(&self, collection: &str, doc: Value) -> Result<String, RecordError>;

    /// Insert; fails with [`RecordError::DuplicateKey`] when the id exists.
    fn insert(&self, collection: &str, doc: Value) -> Result<String, RecordError>;

    /// Apply `$set`/`$unset` to one document. Returns false when the id
    /// does not exist.
    fn update(
        &self,
        collection: &str,
        id: &str,
        set: Value,
        unset: &[&str],
    ) -> Result<bool, RecordError>;

    /// Apply `$set`/`$unset` to every document matching the filter.
    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        set: Value,
        unset: &[&str],
    ) -> Result<u64, RecordError>;

    fn delete(&self, collection: &str, id: &str) -> Result<(), RecordError>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, RecordError>;

    fn drop_collection(&self, name: &str) -> Result<(), RecordError>;

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), RecordError>;

    fn list_collections(&self) -> Result<Vec<String>, RecordError>;

    /// Store clock, truncated to the precision the backend persists.
    fn now(&self) -> DateTime<Utc> {
        now_millis()
    }
}

/// Apply `$set`/`$unset` semantics to a document in place.
pub(crate) fn apply_update(doc: &mut Value, set: &Value, unset: &[&str]) {
    if let (Value::Object(target), Value::Object(changes)) = (&mut *doc, set) {
        for (key, value) in changes {
            target.insert(key.clone(), value.clone());
        }
    }
    if let Value::Object(target) = doc {
        for key in unset {
            target.remove(*key);
        }
    }
}

fn doc_id(doc: &Value) -> Option<String> {
    doc.get("_id").and_then(Value::as_str).map(str::to_string)
}

/// In-memory store used by tests and small runs. One `BTreeMap` per
/// collection keeps `_id` ordering for free.
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, RecordError> {
        let collections = self.collections.lock().expect("store mutex poisoned");
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>, RecordError> {
        let collections = self.collections.lock().expect("store mutex poisoned");
        let mut matched: Vec<Value> = collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((field, order)) = &options.sort {
            matched.sort_by(|a, b| {
                let ord = order_values(a.get(field), b.get(field));
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        let iter = matched.into_iter().skip(options.skip);
        Ok(match options.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn iterate(
        &self,
        collection: &str,
        filter: &Filter,
        options: &IterateOptions,
        callback: &mut dyn FnMut(Value) -> Result<IterateControl, RecordError>,
    ) -> Result<u64, RecordError> {
        let mut seen = 0u64;
        let mut last_id = options.start_after.clone();

        loop {
            // Each page is a fresh query so the scan survives interleaved
            // writes and can resume after interruption.
            let page: Vec<Value> = {
                let collections = self.collections.lock().expect("store mutex poisoned");
                let Some(docs) = collections.get(collection) else {
                    return Ok(seen);
                };
                let lower = match &last_id {
                    Some(id) => Bound::Excluded(id.clone()),
                    None => Bound::Unbounded,
                };
                docs.range((lower, Bound::Unbounded))
                    .map(|(_, doc)| doc.clone())
                    .take(options.page_size)
                    .collect()
            };

            if page.is_empty() {
                return Ok(seen);
            }

            for doc in page {
                last_id = doc_id(&doc);
                if !filter.matches(&doc) {
                    continue;
                }
                seen += 1;
                if callback(doc)? == IterateControl::Stop {
                    return Ok(seen);
                }
            }
        }
    }

    fn save(&self, collection: &str, mut doc: Value) -> Result<String, RecordError> {
        let id = match doc_id(&doc) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                if let Value::Object(map) = &mut doc {
                    map.insert("_id".to_string(), Value::String(id.clone()));
                }
                id
            }
        };
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc);
        Ok(id)
    }

    fn insert(&self, collection: &str, doc: Value) -> Result<String, RecordError> {
        let id = doc_id(&doc).ok_or_else(|| {
            RecordError::Storage("insert requires an _id".to_string())
        })?;
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&id) {
            return Err(RecordError::DuplicateKey {
                collection: collection.to_string(),
                id,
            });
        }
        docs.insert(id.clone(), doc);
        Ok(id)
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        set: Value,
        unset: &[&str],
    ) -> Result<bool, RecordError> {
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        else {
            return Ok(false);
        };
        apply_update(doc, &set, unset);
        Ok(true)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        set: Value,
        unset: &[&str],
    ) -> Result<u64, RecordError> {
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut changed = 0;
        for doc in docs.values_mut() {
            if filter.matches(doc) {
                apply_update(doc, &set, unset);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), RecordError> {
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, RecordError> {
        let collections = self.collections.lock().expect("store mutex poisoned");
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }

    fn drop_collection(&self, name: &str) -> Result<(), RecordError> {
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        collections.remove(name);
        Ok(())
    }

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), RecordError> {
        let mut collections = self.collections.lock().expect("store mutex poisoned");
        let Some(docs) = collections.remove(from) else {
            return Err(RecordError::Storage(format!(
                "cannot rename missing collection {from}"
            )));
        };
        collections.insert(to.to_string(), docs);
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<String>, RecordError> {
        let collections = self.collections.lock().expect("store mutex poisoned");
        Ok(collections.keys().cloned().collect())
    }
}

fn order_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

/// Read an opaque state entry.
pub fn get_state(store: &dyn Store, key: &str) -> Result<Option<String>, RecordError> {
    Ok(store
        .get(STATE_COLLECTION, key)?
        .and_then(|doc| doc.get("value").and_then(Value::as_str).map(str::to_string)))
}

/// Write an opaque state entry.
pub fn set_state(store: &dyn Store, key: &str, value: &str) -> Result<(), RecordError> {
    store.save(
        STATE_COLLECTION,
        serde_json::json!({ "_id": key, "value": value }),
    )?;
    Ok(())
}

/// Remove a state entry.
pub fn clear_state(store: &dyn Store, key: &str) -> Result<(), RecordError> {
    store.delete(STATE_COLLECTION, key)
}

/// Read a state entry holding an ISO-8601 timestamp.
pub fn get_state_time(
    store: &dyn Store,
    key: &str,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    Ok(get_state(store, key)?.and_then(|value| {
        DateTime::parse_from_rfc3339(&value)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }))
}

/// Write a state entry as an ISO-8601 timestamp, readable by operators.
pub fn set_state_time(
    store: &dyn Store,
    key: &str,
    ts: DateTime<Utc>,
) -> Result<(), RecordError> {
    set_state(store, key, &ts.to_rfc3339())
}

/// Final name of a queue collection for a parameter hash and date window.
pub fn queue_name(hash: &str, from: DateTime<Utc>, last_record_time: DateTime<Utc>) -> String {
    format!(
        "{QUEUE_PREFIX}{hash}_{}_{}",
        to_unix_millis(from),
        to_unix_millis(last_record_time)
    )
}

/// Create a fresh transient queue for the given parameters, discarding any
/// half-built queue left behind by a crashed run.
pub fn new_queue(
    store: &dyn Store,
    hash: &str,
    from: DateTime<Utc>,
    last_record_time: DateTime<Utc>,
) -> Result<String, RecordError> {
    let tmp = format!("tmp_{}", queue_name(hash, from, last_record_time));
    store.drop_collection(&tmp)?;
    Ok(tmp)
}

/// Add an id to a queue. Duplicate ids are fine; queues are sets.
pub fn queue_push(store: &dyn Store, queue: &str, id: &str) -> Result<(), RecordError> {
    match store.insert(queue, serde_json::json!({ "_id": id })) {
        Ok(_) => Ok(()),
        Err(err) if err.is_duplicate_key() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Commit a built queue by renaming `tmp_*` to its final name.
pub fn finalize_queue(store: &dyn Store, tmp_name: &str) -> Result<String, RecordError> {
    let final_name = tmp_name
        .strip_prefix("tmp_")
        .ok_or_else(|| {
            RecordError::Storage(format!("not a transient queue: {tmp_name}"))
        })?
        .to_string();
    store.drop_collection(&final_name)?;
    store.rename_collection(tmp_name, &final_name)?;
    Ok(final_name)
}

/// Look for a finalized queue with exactly these parameters.
pub fn find_finalized_queue(
    store: &dyn Store,
    hash: &str,
    from: DateTime<Utc>,
    last_record_time: DateTime<Utc>,
) -> Result<Option<String>, RecordError> {
    let wanted = queue_name(hash, from, last_record_time);
    Ok(store
        .list_collections()?
        .into_iter()
        .find(|name| name == &wanted))
}

/// Drop queue collections whose embedded record timestamp differs from the
/// current one and is more than seven days old, plus any stale `tmp_*`
/// leftovers.
pub fn cleanup_old_queues(
    store: &dyn Store,
    last_record_time: DateTime<Utc>,
) -> Result<u64, RecordError> {
    let current = to_unix_millis(last_record_time);
    let cutoff = to_unix_millis(store.now()) - QUEUE_MAX_AGE_MILLIS;
    let mut dropped = 0;

    for name in store.list_collections()? {
        let is_tmp = name.starts_with(QUEUE_TMP_PREFIX);
        let is_final = name.starts_with(QUEUE_PREFIX);
        if !is_tmp && !is_final {
            continue;
        }
        let Some(embedded) = name
            .rsplit('_')
            .next()
            .and_then(|tail| tail.parse::<i64>().ok())
        else {
            continue;
        };
        if embedded != current && embedded < cutoff {
            store.drop_collection(&name)?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_unix_millis;
    use serde_json::json;

    fn store_with(docs: &[Value]) -> MemoryStore {
        let store = MemoryStore::new();
        for doc in docs {
            store.save("record", doc.clone()).unwrap();
        }
        store
    }

    #[test]
    fn test_filter_eq_on_array_field() {
        let doc = json!({"_id": "a", "title_keys": ["artofcomputer", "other"]});
        assert!(Filter::eq("title_keys", "artofcomputer").matches(&doc));
        assert!(!Filter::eq("title_keys", "missing").matches(&doc));
    }

    #[test]
    fn test_filter_in_and_exists() {
        let doc = json!({"_id": "a", "source_id": "s1", "dedup_id": "g1"});
        assert!(Filter::is_in("source_id", ["s1", "s2"]).matches(&doc));
        assert!(Filter::exists("dedup_id", true).matches(&doc));
        assert!(Filter::exists("missing", false).matches(&doc));
    }

    #[test]
    fn test_filter_numeric_range() {
        let doc = json!({"_id": "a", "updated": 1500});
        assert!(Filter::gte("updated", 1500).matches(&doc));
        assert!(Filter::lt("updated", 1501).matches(&doc));
        assert!(!Filter::lt("updated", 1500).matches(&doc));
    }

    #[test]
    fn test_save_get_update_delete() {
        let store = MemoryStore::new();
        store
            .save("record", json!({"_id": "x", "n": 1}))
            .unwrap();
        store
            .update("record", "x", json!({"n": 2, "m": true}), &["gone"])
            .unwrap();
        let doc = store.get("record", "x").unwrap().unwrap();
        assert_eq!(doc["n"], 2);
        assert_eq!(doc["m"], true);

        store.delete("record", "x").unwrap();
        assert!(store.get("record", "x").unwrap().is_none());
    }

    #[test]
    fn test_save_assigns_id_when_missing() {
        let store = MemoryStore::new();
        let id = store.save("record", json!({"n": 1})).unwrap();
        assert!(!id.is_empty());
        assert!(store.get("record", &id).unwrap().is_some());
    }

    #[test]
    fn test_insert_duplicate_key() {
        let store = MemoryStore::new();
        store.insert("uriCache", json!({"_id": "u"})).unwrap();
        let err = store.insert("uriCache", json!({"_id": "u"})).unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn test_find_sort_skip_limit() {
        let store = store_with(&[
            json!({"_id": "a", "n": 3}),
            json!({"_id": "b", "n": 1}),
            json!({"_id": "c", "n": 2}),
        ]);
        let options = FindOptions {
            sort: Some(("n".to_string(), SortOrder::Ascending)),
            skip: 1,
            limit: Some(1),
        };
        let found = store.find("record", &Filter::All, &options).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["n"], 2);
    }

    #[test]
    fn test_iterate_sees_every_record_once() {
        let docs: Vec<Value> = (0..25)
            .map(|i| json!({"_id": format!("id{:03}", i)}))
            .collect();
        let store = store_with(&docs);

        let mut seen = Vec::new();
        let options = IterateOptions {
            page_size: 4,
            start_after: None,
        };
        store
            .iterate("record", &Filter::All, &options, &mut |doc| {
                seen.push(doc["_id"].as_str().unwrap().to_string());
                Ok(IterateControl::Continue)
            })
            .unwrap();

        assert_eq!(seen.len(), 25);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 25);
    }

    #[test]
    fn test_iterate_resumes_after_id() {
        let docs: Vec<Value> = (0..10)
            .map(|i| json!({"_id": format!("id{:03}", i)}))
            .collect();
        let store = store_with(&docs);

        let options = IterateOptions {
            page_size: 3,
            start_after: Some("id004".to_string()),
        };
        let mut seen = 0;
        store
            .iterate("record", &Filter::All, &options, &mut |_| {
                seen += 1;
                Ok(IterateControl::Continue)
            })
            .unwrap();
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_iterate_stop_early() {
        let store = store_with(&[json!({"_id": "a"}), json!({"_id": "b"})]);
        let mut seen = 0;
        store
            .iterate("record", &Filter::All, &IterateOptions::default(), &mut |_| {
                seen += 1;
                Ok(IterateControl::Stop)
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_queue_lifecycle() {
        let store = MemoryStore::new();
        let from = from_unix_millis(1_000);
        let lrt = from_unix_millis(2_000);

        let tmp = new_queue(&store, "cafe", from, lrt).unwrap();
        assert!(tmp.starts_with("tmp_mr_record_cafe_"));
        queue_push(&store, &tmp, "s1.1").unwrap();
        queue_push(&store, &tmp, "s1.1").unwrap();
        queue_push(&store, &tmp, "s1.2").unwrap();
        assert_eq!(store.count(&tmp, &Filter::All).unwrap(), 2);

        let final_name = finalize_queue(&store, &tmp).unwrap();
        assert_eq!(final_name, queue_name("cafe", from, lrt));
        assert_eq!(
            find_finalized_queue(&store, "cafe", from, lrt).unwrap(),
            Some(final_name.clone())
        );
        assert_eq!(store.count(&final_name, &Filter::All).unwrap(), 2);
    }

    #[test]
    fn test_cleanup_old_queues() {
        let store = MemoryStore::new();
        let old = from_unix_millis(1_000);
        let current = now_millis();

        let tmp = new_queue(&store, "old", old, old).unwrap();
        queue_push(&store, &tmp, "x").unwrap();
        finalize_queue(&store, &tmp).unwrap();

        let tmp = new_queue(&store, "new", current, current).unwrap();
        queue_push(&store, &tmp, "y").unwrap();
        let keep = finalize_queue(&store, &tmp).unwrap();

        let dropped = cleanup_old_queues(&store, current).unwrap();
        assert_eq!(dropped, 1);
        let remaining = store.list_collections().unwrap();
        assert!(remaining.contains(&keep));
        assert!(!remaining.iter().any(|name| name.contains("old")));
    }
}
