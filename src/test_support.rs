//! Shared fixtures for unit and integration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::DataSourceSettings;
use crate::error::RecordError;
use crate::ingest::Ingestor;
use crate::store::Store;
use crate::update::DocSink;

/// A dedup-enabled Dublin Core source.
pub fn dc_source(dedup: bool) -> DataSourceSettings {
    DataSourceSettings {
        format: "dc".to_string(),
        institution: "Inst".to_string(),
        dedup,
        ..DataSourceSettings::default()
    }
}

/// Source map with the given ids, all sharing the same settings.
pub fn sources_map(
    source_ids: &[&str],
    settings: DataSourceSettings,
) -> BTreeMap<String, DataSourceSettings> {
    source_ids
        .iter()
        .map(|id| (id.to_string(), settings.clone()))
        .collect()
}

/// A fielded book payload.
pub fn book_payload(id: &str, title: &str, isbn: Option<&str>, year: Option<&str>) -> String {
    let mut map = serde_json::Map::new();
    map.insert("id".to_string(), Value::String(id.to_string()));
    map.insert("title".to_string(), Value::String(title.to_string()));
    map.insert("format".to_string(), Value::String("Book".to_string()));
    if let Some(isbn) = isbn {
        map.insert("isbn".to_string(), Value::String(isbn.to_string()));
    }
    if let Some(year) = year {
        map.insert("date".to_string(), Value::String(year.to_string()));
    }
    serde_json::to_string(&Value::Object(map)).expect("payload serializes")
}

/// Ingest one payload into the store for the given source.
pub fn ingest(
    store: &dyn Store,
    source_id: &str,
    settings: &DataSourceSettings,
    oai_id: &str,
    payload: &str,
) -> Result<u64, RecordError> {
    Ingestor::new(store, source_id, settings).store_record(oai_id, false, payload)
}

/// A [`DocSink`] that records everything it is given, for pipeline tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub adds: Vec<Value>,
    pub deletes: Vec<String>,
    pub delete_queries: Vec<String>,
    pub commits: u32,
    pub flushes: u32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of all added documents, in delivery order.
    pub fn added_ids(&self) -> Vec<String> {
        self.adds
            .iter()
            .filter_map(|doc| doc.get("id").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl DocSink for RecordingSink {
    async fn add(&mut self, doc: Value) -> Result<(), RecordError> {
        self.adds.push(doc);
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<(), RecordError> {
        self.deletes.push(id.to_string());
        Ok(())
    }

    async fn delete_query(&mut self, query: &str) -> Result<(), RecordError> {
        self.delete_queries.push(query.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), RecordError> {
        self.commits += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), RecordError> {
        self.flushes += 1;
        Ok(())
    }
}
