//! # Persistent Store
//!
//! RocksDB-backed [`Store`] implementation. Documents live in a single
//! column family under composite `collection \0 _id` keys, which gives the
//! `_id`-ordered forward iteration the paged-scan contract needs. A second
//! column family holds the storage manifest and the collection registry.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use crate::error::RecordError;
use crate::store::{
    apply_update, Filter, FindOptions, IterateControl, IterateOptions, SortOrder, Store,
    DEFAULT_PAGE_SIZE,
};

const CF_DOCS: &str = "docs";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const COLLECTION_REGISTRY_PREFIX: &str = "collection\u{0}";

const STORAGE_FORMAT_VERSION: u32 = 1;
const DEFAULT_BLOCK_CACHE_MB: usize = 256;
const DEFAULT_WRITE_BUFFER_MB: usize = 64;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// Durable store backed by RocksDB. One instance per process; connections
/// are never shared across processes.
pub struct RocksStore {
    db: DB,
    // Guards multi-key operations (rename, drop) against each other.
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let db = open_db(path)?;
        let store = Self {
            db,
            write_lock: Mutex::new(()),
        };
        store.validate_or_init_manifest()?;
        Ok(store)
    }

    fn docs_cf(&self) -> Result<&rocksdb::ColumnFamily, RecordError> {
        self.db
            .cf_handle(CF_DOCS)
            .ok_or_else(|| RecordError::Storage("missing docs column family".to_string()))
    }

    fn metadata_cf(&self) -> Result<&rocksdb::ColumnFamily, RecordError> {
        self.db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| RecordError::Storage("missing metadata column family".to_string()))
    }

    fn validate_or_init_manifest(&self) -> Result<(), RecordError> {
        let metadata = self.metadata_cf()?;
        match self.db.get_cf(metadata, KEY_MANIFEST)? {
            Some(bytes) => {
                let manifest: StorageManifest = serde_json::from_slice(&bytes)?;
                if manifest.format_version != STORAGE_FORMAT_VERSION {
                    return Err(RecordError::Storage(format!(
                        "unsupported storage format {} (expected {})",
                        manifest.format_version, STORAGE_FORMAT_VERSION
                    )));
                }
            }
            None => {
                let manifest = StorageManifest {
                    format_version: STORAGE_FORMAT_VERSION,
                    app_version: env!("CARGO_PKG_VERSION").to_string(),
                };
                self.db
                    .put_cf(metadata, KEY_MANIFEST, serde_json::to_vec(&manifest)?)?;
            }
        }
        Ok(())
    }

    fn register_collection(&self, name: &str) -> Result<(), RecordError> {
        let metadata = self.metadata_cf()?;
        let key = format!("{COLLECTION_REGISTRY_PREFIX}{name}");
        self.db.put_cf(metadata, key.as_bytes(), [])?;
        Ok(())
    }

    fn unregister_collection(&self, name: &str) -> Result<(), RecordError> {
        let metadata = self.metadata_cf()?;
        let key = format!("{COLLECTION_REGISTRY_PREFIX}{name}");
        self.db.delete_cf(metadata, key.as_bytes())?;
        Ok(())
    }

    /// Fetch one page of documents with `_id > last_id`, in `_id` order.
    fn page(
        &self,
        collection: &str,
        last_id: Option<&str>,
        page_size: usize,
    ) -> Result<Vec<Value>, RecordError> {
        let docs = self.docs_cf()?;
        let prefix = collection_prefix(collection);
        let start = match last_id {
            Some(id) => doc_key(collection, id),
            None => prefix.clone(),
        };

        let mut page = Vec::with_capacity(page_size);
        for entry in self
            .db
            .iterator_cf(docs, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, bytes) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            // The iterator is positioned at `_id >= last_id`; the last-seen
            // id itself has already been delivered.
            if last_id.is_some() && key.as_ref() == start.as_slice() {
                continue;
            }
            page.push(serde_json::from_slice(&bytes)?);
            if page.len() >= page_size {
                break;
            }
        }
        Ok(page)
    }
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut prefix = collection.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn doc_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = collection_prefix(collection);
    key.extend_from_slice(id.as_bytes());
    key
}

fn doc_id(doc: &Value) -> Option<String> {
    doc.get("_id").and_then(Value::as_str).map(str::to_string)
}

impl Store for RocksStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, RecordError> {
        let docs = self.docs_cf()?;
        match self.db.get_cf(docs, doc_key(collection, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>, RecordError> {
        let mut matched = Vec::new();
        let mut last_id: Option<String> = None;
        loop {
            let page = self.page(collection, last_id.as_deref(), DEFAULT_PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            for doc in page {
                last_id = doc_id(&doc);
                if filter.matches(&doc) {
                    matched.push(doc);
                }
            }
        }

        if let Some((field, order)) = &options.sort {
            matched.sort_by(|a, b| {
                let ord = order_json(a.get(field), b.get(field));
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
            let page = self.page(collection, last_id.as_deref(), options.page_size)?;
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
        let docs = self.docs_cf()?;
        self.db
            .put_cf(docs, doc_key(collection, &id), serde_json::to_vec(&doc)?)?;
        self.register_collection(collection)?;
        Ok(id)
    }

    fn insert(&self, collection: &str, doc: Value) -> Result<String, RecordError> {
        let id = doc_id(&doc)
            .ok_or_else(|| RecordError::Storage("insert requires an _id".to_string()))?;
        let _guard = self.write_lock.lock().expect("store mutex poisoned");
        let docs = self.docs_cf()?;
        let key = doc_key(collection, &id);
        if self.db.get_cf(docs, &key)?.is_some() {
            return Err(RecordError::DuplicateKey {
                collection: collection.to_string(),
                id,
            });
        }
        self.db.put_cf(docs, key, serde_json::to_vec(&doc)?)?;
        self.register_collection(collection)?;
        Ok(id)
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        set: Value,
        unset: &[&str],
    ) -> Result<bool, RecordError> {
        let docs = self.docs_cf()?;
        let key = doc_key(collection, id);
        let Some(bytes) = self.db.get_cf(docs, &key)? else {
            return Ok(false);
        };
        let mut doc: Value = serde_json::from_slice(&bytes)?;
        apply_update(&mut doc, &set, unset);
        self.db.put_cf(docs, key, serde_json::to_vec(&doc)?)?;
        Ok(true)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        set: Value,
        unset: &[&str],
    ) -> Result<u64, RecordError> {
        let mut changed = 0u64;
        let mut last_id: Option<String> = None;
        loop {
            let page = self.page(collection, last_id.as_deref(), DEFAULT_PAGE_SIZE)?;
            if page.is_empty() {
                return Ok(changed);
            }
            for mut doc in page {
                last_id = doc_id(&doc);
                if !filter.matches(&doc) {
                    continue;
                }
                let Some(id) = doc_id(&doc) else { continue };
                apply_update(&mut doc, &set, unset);
                let docs = self.docs_cf()?;
                self.db
                    .put_cf(docs, doc_key(collection, &id), serde_json::to_vec(&doc)?)?;
                changed += 1;
            }
        }
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), RecordError> {
        let docs = self.docs_cf()?;
        self.db.delete_cf(docs, doc_key(collection, id))?;
        Ok(())
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, RecordError> {
        let mut total = 0u64;
        self.iterate(collection, filter, &IterateOptions::default(), &mut |_| {
            total += 1;
            Ok(IterateControl::Continue)
        })?;
        Ok(total)
    }

    fn drop_collection(&self, name: &str) -> Result<(), RecordError> {
        let _guard = self.write_lock.lock().expect("store mutex poisoned");
        let docs = self.docs_cf()?;
        let prefix = collection_prefix(name);
        let mut batch = WriteBatch::default();
        for entry in self
            .db
            .iterator_cf(docs, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(docs, key);
        }
        self.db.write(batch)?;
        self.unregister_collection(name)?;
        Ok(())
    }

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), RecordError> {
        let _guard = self.write_lock.lock().expect("store mutex poisoned");
        let docs = self.docs_cf()?;
        let from_prefix = collection_prefix(from);
        let mut batch = WriteBatch::default();
        let mut moved = false;
        for entry in self
            .db
            .iterator_cf(docs, IteratorMode::From(&from_prefix, Direction::Forward))
        {
            let (key, bytes) = entry?;
            if !key.starts_with(&from_prefix) {
                break;
            }
            let id = &key[from_prefix.len()..];
            let mut new_key = collection_prefix(to);
            new_key.extend_from_slice(id);
            batch.put_cf(docs, new_key, bytes);
            batch.delete_cf(docs, key);
            moved = true;
        }
        if !moved {
            return Err(RecordError::Storage(format!(
                "cannot rename missing collection {from}"
            )));
        }
        self.db.write(batch)?;
        self.unregister_collection(from)?;
        self.register_collection(to)?;
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<String>, RecordError> {
        let metadata = self.metadata_cf()?;
        let prefix = COLLECTION_REGISTRY_PREFIX.as_bytes();
        let mut names = Vec::new();
        for entry in self
            .db
            .iterator_cf(metadata, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            names.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(names)
    }
}

fn order_json(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
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

fn open_db(path: impl AsRef<Path>) -> Result<DB, RecordError> {
    let mut base = Options::default();
    base.create_if_missing(true);
    base.create_missing_column_families(true);
    base.set_write_buffer_size(DEFAULT_WRITE_BUFFER_MB * 1024 * 1024);

    let cache = Cache::new_lru_cache(DEFAULT_BLOCK_CACHE_MB * 1024 * 1024);
    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_cache(&cache);

    let mut cf_opts = base.clone();
    cf_opts.set_block_based_table_factory(&block_opts);

    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_DOCS, cf_opts.clone()),
        ColumnFamilyDescriptor::new(CF_METADATA, cf_opts),
    ];
    Ok(DB::open_cf_descriptors(&base, path, cfs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_and_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        {
            let store = RocksStore::open(dir.path())?;
            store.save("record", json!({"_id": "s1.1", "n": 1}))?;
            store.save("record", json!({"_id": "s1.2", "n": 2}))?;
        }
        let store = RocksStore::open(dir.path())?;
        let doc = store.get("record", "s1.2")?.unwrap();
        assert_eq!(doc["n"], 2);
        assert_eq!(store.count("record", &Filter::All)?, 2);
        Ok(())
    }

    #[test]
    fn test_iterate_is_id_ordered() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = RocksStore::open(dir.path())?;
        for i in [3, 1, 2] {
            store.save("record", json!({"_id": format!("id{i}")}))?;
        }
        let mut seen = Vec::new();
        store.iterate("record", &Filter::All, &IterateOptions::default(), &mut |doc| {
            seen.push(doc["_id"].as_str().unwrap().to_string());
            Ok(IterateControl::Continue)
        })?;
        assert_eq!(seen, vec!["id1", "id2", "id3"]);
        Ok(())
    }

    #[test]
    fn test_collections_are_isolated() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = RocksStore::open(dir.path())?;
        store.save("record", json!({"_id": "x"}))?;
        store.save("state", json!({"_id": "x", "value": "1"}))?;
        assert_eq!(store.count("record", &Filter::All)?, 1);
        assert_eq!(store.count("state", &Filter::All)?, 1);

        store.drop_collection("state")?;
        assert_eq!(store.count("state", &Filter::All)?, 0);
        assert_eq!(store.count("record", &Filter::All)?, 1);
        Ok(())
    }

    #[test]
    fn test_rename_collection() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = RocksStore::open(dir.path())?;
        store.save("tmp_q", json!({"_id": "a"}))?;
        store.rename_collection("tmp_q", "q")?;
        assert_eq!(store.count("q", &Filter::All)?, 1);
        assert_eq!(store.count("tmp_q", &Filter::All)?, 0);
        let names = store.list_collections()?;
        assert!(names.contains(&"q".to_string()));
        assert!(!names.contains(&"tmp_q".to_string()));
        Ok(())
    }

    #[test]
    fn test_insert_duplicate() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = RocksStore::open(dir.path())?;
        store.insert("uriCache", json!({"_id": "u"}))?;
        assert!(store
            .insert("uriCache", json!({"_id": "u"}))
            .unwrap_err()
            .is_duplicate_key());
        Ok(())
    }
}
