//! # Ingestion & Normalization
//!
//! Turns harvested payloads into stored records: splitting, payload
//! pre-transforms, driver normalization, id derivation, blocking keys and
//! the dedup dirty bit. Deletions detach records from their groups.

use serde_json::Value;
use tracing::debug;

use crate::config::DataSourceSettings;
use crate::dedup::detach_record;
use crate::drivers::create_driver;
use crate::error::RecordError;
use crate::keys::title_key;
use crate::model::{build_record_id, Record};
use crate::store::{Filter, FindOptions, Store, RECORD_COLLECTION};

/// Ingestion entry point for one data source.
pub struct Ingestor<'a> {
    store: &'a dyn Store,
    source_id: String,
    settings: &'a DataSourceSettings,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a dyn Store, source_id: &str, settings: &'a DataSourceSettings) -> Self {
        Self {
            store,
            source_id: source_id.to_string(),
            settings,
        }
    }

    /// Store one harvested item, which may split into several records.
    /// Returns the number of records touched.
    pub fn store_record(
        &self,
        oai_id: &str,
        deleted: bool,
        payload: &str,
    ) -> Result<u64, RecordError> {
        if deleted {
            if oai_id.is_empty() {
                return Ok(0);
            }
            return self.delete_by_oai_id(oai_id);
        }

        let payloads = self.split_payload(payload)?;
        // Captured before any write so vanished hierarchy members can be
        // told apart from the ones this batch refreshed.
        let start_time = self.store.now();
        let multi_part = payloads.len() > 1;

        let mut main_id = String::new();
        let mut stored = 0u64;
        for sub_payload in &payloads {
            let sub_payload = self.pre_transform(sub_payload)?;
            self.store_single(oai_id, &sub_payload, &mut main_id)?;
            stored += 1;
        }

        if multi_part && !self.settings.keep_missing_hierarchy_members && !main_id.is_empty() {
            let filter = Filter::and([
                Filter::eq("main_id", main_id.as_str()),
                Filter::eq("deleted", false),
                Filter::lt("updated", crate::model::to_unix_millis(start_time)),
            ]);
            let vanished = self
                .store
                .find(RECORD_COLLECTION, &filter, &FindOptions::default())?;
            for doc in vanished {
                let mut record = Record::from_doc(doc)?;
                debug!(record = %record.id, "hierarchy member vanished, tombstoning");
                soft_delete_record(self.store, &mut record)?;
                stored += 1;
            }
        }

        Ok(stored)
    }

    /// Soft-delete every record of this source matching the OAI id and
    /// detach each from its dedup group.
    fn delete_by_oai_id(&self, oai_id: &str) -> Result<u64, RecordError> {
        let filter = Filter::and([
            Filter::eq("source_id", self.source_id.as_str()),
            Filter::eq("oai_id", oai_id),
        ]);
        let docs = self
            .store
            .find(RECORD_COLLECTION, &filter, &FindOptions::default())?;
        let mut count = 0;
        for doc in docs {
            let mut record = Record::from_doc(doc)?;
            soft_delete_record(self.store, &mut record)?;
            count += 1;
        }
        Ok(count)
    }

    fn store_single(
        &self,
        oai_id: &str,
        payload: &str,
        main_id: &mut String,
    ) -> Result<String, RecordError> {
        let mut driver = create_driver(&self.settings.format, payload, oai_id, &self.source_id)?;
        let original_data = driver.serialize()?;
        driver.normalize();
        let normalized = driver.serialize()?;
        // Identical payloads are stored once; an empty normalized_data
        // means "same as original".
        let normalized_data = if normalized == original_data {
            String::new()
        } else {
            normalized
        };

        let local_id = {
            let id = driver.id();
            if id.is_empty() {
                oai_id.to_string()
            } else {
                id
            }
        };
        if local_id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        let id = build_record_id(self.settings.prefix(&self.source_id), &local_id);

        let existing = match self.store.get(RECORD_COLLECTION, &id)? {
            Some(doc) => Some(Record::from_doc(doc)?),
            None => None,
        };
        let now = self.store.now();
        let host_record_id = driver.get_host_record_id();
        let is_component = !host_record_id.is_empty();

        let data_changed = existing
            .as_ref()
            .map(|old| {
                old.original_data != original_data
                    || old.normalized_data != normalized_data
                    || old.deleted
            })
            .unwrap_or(true);

        let mut record = Record {
            id: id.clone(),
            source_id: self.source_id.clone(),
            oai_id: oai_id.to_string(),
            format: self.settings.format.clone(),
            original_data,
            normalized_data,
            linking_id: driver.get_linking_id(),
            host_record_id: host_record_id.clone(),
            main_id: if main_id.is_empty() {
                String::new()
            } else {
                main_id.clone()
            },
            deleted: false,
            update_needed: false,
            dedup_id: existing.as_ref().and_then(|old| old.dedup_id.clone()),
            title_keys: Vec::new(),
            isbn_keys: Vec::new(),
            id_keys: Vec::new(),
            created: existing.as_ref().map(|old| old.created).unwrap_or(now),
            updated: now,
            date: now,
            mark: existing.as_ref().map(|old| old.mark).unwrap_or(false),
        };
        if main_id.is_empty() {
            *main_id = id.clone();
        }

        if self.settings.dedup && !is_component {
            self.update_dedup_candidate_keys(&mut record, driver.as_ref());
            let keys_changed = existing
                .as_ref()
                .map(|old| {
                    old.title_keys != record.title_keys
                        || old.isbn_keys != record.isbn_keys
                        || old.id_keys != record.id_keys
                })
                .unwrap_or(true);
            let was_dirty = existing
                .as_ref()
                .map(|old| old.update_needed)
                .unwrap_or(false);
            record.update_needed = was_dirty || keys_changed || data_changed;
        } else if is_component {
            // A changed component part means its host's merged document
            // is stale; the host is always marked dirty.
            self.mark_host_dirty(&host_record_id)?;
        } else {
            if let Some(old) = existing {
                if old.dedup_id.is_some() {
                    let mut old = old;
                    detach_record(self.store, &mut old)?;
                }
            }
            record.clear_dedup();
        }

        self.store.save(RECORD_COLLECTION, record.to_doc())?;
        Ok(id)
    }

    fn update_dedup_candidate_keys(
        &self,
        record: &mut Record,
        driver: &dyn crate::drivers::RecordDriver,
    ) {
        let key = title_key(&driver.get_title(true));
        record.title_keys = if key.is_empty() { Vec::new() } else { vec![key] };
        record.isbn_keys = driver.get_isbns();
        record.id_keys = driver.get_unique_ids();
    }

    fn mark_host_dirty(&self, host_link: &str) -> Result<(), RecordError> {
        let filter = Filter::and([
            Filter::eq("source_id", self.source_id.as_str()),
            Filter::or([
                Filter::eq("linking_id", host_link),
                Filter::eq(
                    "_id",
                    build_record_id(self.settings.prefix(&self.source_id), host_link),
                ),
            ]),
            Filter::eq("deleted", false),
        ]);
        // A changed part changes the host's merged document too, so the
        // host counts as updated for the index scan.
        let changed = self.store.update_many(
            RECORD_COLLECTION,
            &filter,
            serde_json::json!({
                "update_needed": true,
                "updated": crate::model::to_unix_millis(self.store.now()),
            }),
            &[],
        )?;
        if changed == 0 {
            debug!(host = host_link, "component part arrived before its host");
        }
        Ok(())
    }

    fn split_payload(&self, payload: &str) -> Result<Vec<String>, RecordError> {
        match self.settings.record_splitter.as_deref() {
            None => Ok(vec![payload.to_string()]),
            Some("parts") => split_parts(payload),
            Some(other) => Err(RecordError::Config(format!(
                "unknown record splitter {other}"
            ))),
        }
    }

    fn pre_transform(&self, payload: &str) -> Result<String, RecordError> {
        match self.settings.pre_transformation.as_deref() {
            None | Some("identity") => Ok(payload.to_string()),
            Some("strip_private_fields") => strip_private_fields(payload),
            Some(other) => Err(RecordError::Config(format!(
                "unknown pre-transformation {other}"
            ))),
        }
    }
}

/// Tombstone one record, detaching it from its dedup group first.
pub fn soft_delete_record(store: &dyn Store, record: &mut Record) -> Result<(), RecordError> {
    detach_record(store, record)?;
    record.deleted = true;
    record.update_needed = false;
    record.updated = store.now();
    store.save(RECORD_COLLECTION, record.to_doc())?;
    Ok(())
}

/// Built-in splitter: a payload with a `parts` array becomes the main
/// record plus one record per part. Parts that do not name their host get
/// the main record's id as `host_record_id`.
fn split_parts(payload: &str) -> Result<Vec<String>, RecordError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|err| RecordError::Parse(format!("payload is not valid JSON: {err}")))?;
    let Value::Object(mut map) = value else {
        return Err(RecordError::Parse("payload is not a JSON object".to_string()));
    };

    let parts = match map.remove("parts") {
        Some(Value::Array(parts)) => parts,
        Some(other) => {
            return Err(RecordError::Parse(format!(
                "parts must be an array, got {other}"
            )))
        }
        None => Vec::new(),
    };

    let main_local_id = map
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut payloads = vec![serde_json::to_string(&Value::Object(map))?];
    for part in parts {
        let Value::Object(mut part_map) = part else {
            return Err(RecordError::Parse("part is not a JSON object".to_string()));
        };
        if !part_map.contains_key("host_record_id") && !main_local_id.is_empty() {
            part_map.insert(
                "host_record_id".to_string(),
                Value::String(main_local_id.clone()),
            );
        }
        payloads.push(serde_json::to_string(&Value::Object(part_map))?);
    }
    Ok(payloads)
}

/// Built-in pre-transform dropping underscore-prefixed working fields some
/// exports carry.
fn strip_private_fields(payload: &str) -> Result<String, RecordError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|err| RecordError::Parse(format!("payload is not valid JSON: {err}")))?;
    let Value::Object(map) = value else {
        return Err(RecordError::Parse("payload is not a JSON object".to_string()));
    };
    let filtered: serde_json::Map<String, Value> = map
        .into_iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .collect();
    Ok(serde_json::to_string(&Value::Object(filtered))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn dedup_source() -> DataSourceSettings {
        DataSourceSettings {
            format: "dc".to_string(),
            dedup: true,
            ..DataSourceSettings::default()
        }
    }

    fn get_record(store: &MemoryStore, id: &str) -> Record {
        Record::from_doc(store.get(RECORD_COLLECTION, id).unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_store_record_computes_keys_and_dirty_bit() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);

        let payload = r#"{"id": "1", "title": "The Art of Computer Programming",
                          "isbn": "0-201-03801-3", "date": "1997"}"#;
        let stored = ingestor.store_record("oai:1", false, payload).unwrap();
        assert_eq!(stored, 1);

        let record = get_record(&store, "s1.1");
        assert!(record.update_needed);
        assert_eq!(record.title_keys, vec!["artofcomputerprogramming"]);
        assert_eq!(record.isbn_keys, vec!["9780201038019"]);
        assert_eq!(record.oai_id, "oai:1");
    }

    #[test]
    fn test_restore_unchanged_record_keeps_clean_bit() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);
        let payload = r#"{"id": "1", "title": "Some Title"}"#;

        ingestor.store_record("oai:1", false, payload).unwrap();
        let mut record = get_record(&store, "s1.1");
        record.update_needed = false;
        store.save(RECORD_COLLECTION, record.to_doc()).unwrap();

        ingestor.store_record("oai:1", false, payload).unwrap();
        let record = get_record(&store, "s1.1");
        assert!(!record.update_needed);
    }

    #[test]
    fn test_normalized_equals_original_stored_empty() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);

        // Already normalized payload: no whitespace to collapse.
        ingestor
            .store_record("oai:1", false, r#"{"id": "1", "title": "Tidy"}"#)
            .unwrap();
        let record = get_record(&store, "s1.1");
        assert!(record.normalized_data.is_empty());
        assert!(!record.original_data.is_empty());

        ingestor
            .store_record("oai:2", false, r#"{"id": "2", "title": "  Messy   title "}"#)
            .unwrap();
        let record = get_record(&store, "s1.2");
        assert!(!record.normalized_data.is_empty());
    }

    #[test]
    fn test_missing_ids_fail() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);
        let err = ingestor
            .store_record("", false, r#"{"title": "No id anywhere"}"#)
            .unwrap_err();
        assert!(matches!(err, RecordError::EmptyId));
    }

    #[test]
    fn test_oai_id_fallback() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);
        ingestor
            .store_record("oai:77", false, r#"{"title": "Untitled"}"#)
            .unwrap();
        assert!(store.get(RECORD_COLLECTION, "s1.oai:77").unwrap().is_some());
    }

    #[test]
    fn test_delete_by_oai_id() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);
        ingestor
            .store_record("oai:1", false, r#"{"id": "1", "title": "T"}"#)
            .unwrap();

        let count = ingestor.store_record("oai:1", true, "").unwrap();
        assert_eq!(count, 1);
        let record = get_record(&store, "s1.1");
        assert!(record.deleted);
        assert!(!record.update_needed);
    }

    #[test]
    fn test_component_part_marks_host_dirty() {
        let store = MemoryStore::new();
        let settings = dedup_source();
        let ingestor = Ingestor::new(&store, "s1", &settings);

        ingestor
            .store_record("oai:h", false, r#"{"id": "h1", "title": "Journal"}"#)
            .unwrap();
        let mut host = get_record(&store, "s1.h1");
        host.update_needed = false;
        store.save(RECORD_COLLECTION, host.to_doc()).unwrap();

        ingestor
            .store_record(
                "oai:p",
                false,
                r#"{"id": "p1", "title": "Article", "host_record_id": "h1"}"#,
            )
            .unwrap();

        let host = get_record(&store, "s1.h1");
        assert!(host.update_needed);
        let part = get_record(&store, "s1.p1");
        assert!(part.is_component_part());
        assert!(!part.update_needed);
        assert!(part.title_keys.is_empty());
    }

    #[test]
    fn test_parts_splitter_creates_hierarchy() {
        let store = MemoryStore::new();
        let mut settings = dedup_source();
        settings.record_splitter = Some("parts".to_string());
        let ingestor = Ingestor::new(&store, "s1", &settings);

        let payload = r#"{"id": "h1", "title": "Collection",
            "parts": [{"id": "c1", "title": "First"}, {"id": "c2", "title": "Second"}]}"#;
        let stored = ingestor.store_record("oai:h", false, payload).unwrap();
        assert_eq!(stored, 3);

        let part = get_record(&store, "s1.c1");
        assert_eq!(part.host_record_id, "h1");
        assert_eq!(part.main_id, "s1.h1");
        let main = get_record(&store, "s1.h1");
        assert!(main.main_id.is_empty());
    }

    #[test]
    fn test_vanished_hierarchy_member_tombstoned() {
        let store = MemoryStore::new();
        let mut settings = dedup_source();
        settings.record_splitter = Some("parts".to_string());
        let ingestor = Ingestor::new(&store, "s1", &settings);

        let full = r#"{"id": "h1", "title": "Collection",
            "parts": [{"id": "c1", "title": "First"}, {"id": "c2", "title": "Second"}]}"#;
        ingestor.store_record("oai:h", false, full).unwrap();

        // Backdate the first batch so the sweep threshold can tell the
        // batches apart even within one clock millisecond.
        for id in ["s1.h1", "s1.c1", "s1.c2"] {
            let mut record = get_record(&store, id);
            record.updated -= chrono::Duration::milliseconds(10);
            store.save(RECORD_COLLECTION, record.to_doc()).unwrap();
        }

        let reduced = r#"{"id": "h1", "title": "Collection",
            "parts": [{"id": "c1", "title": "First"}]}"#;
        ingestor.store_record("oai:h", false, reduced).unwrap();

        assert!(get_record(&store, "s1.c2").deleted);
        assert!(!get_record(&store, "s1.c1").deleted);
    }

    #[test]
    fn test_strip_private_fields_transform() {
        let store = MemoryStore::new();
        let mut settings = dedup_source();
        settings.pre_transformation = Some("strip_private_fields".to_string());
        let ingestor = Ingestor::new(&store, "s1", &settings);

        ingestor
            .store_record(
                "oai:1",
                false,
                r#"{"id": "1", "title": "T", "_working": "x"}"#,
            )
            .unwrap();
        let record = get_record(&store, "s1.1");
        assert!(!record.original_data.contains("_working"));
    }
}
