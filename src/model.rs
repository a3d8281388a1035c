//! # Data Model
//!
//! Core data structures for the record pipeline: stored records, dedup
//! groups, state entries and the URI cache. Everything round-trips through
//! JSON documents keyed by `_id`, with timestamps stored as Unix
//! milliseconds.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RecordError;

/// A single bibliographic record as stored in the `record` collection.
///
/// The `id` is `"{source_id}.{local_id}"` (the prefix may be overridden per
/// source). `original_data` and `normalized_data` are opaque driver
/// payloads; `normalized_data` is left empty when normalization did not
/// change anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: String,
    pub source_id: String,
    /// External identifier from the harvest; empty for file ingest.
    #[serde(default)]
    pub oai_id: String,
    /// Driver name, e.g. `marc`, `dc`, `lido`.
    pub format: String,
    #[serde(default)]
    pub original_data: String,
    #[serde(default)]
    pub normalized_data: String,
    /// Identifier other records use to reference this one.
    #[serde(default)]
    pub linking_id: String,
    /// Non-empty iff this record is a component part of the named host.
    #[serde(default)]
    pub host_record_id: String,
    /// For hierarchically split records, id of the topmost record produced
    /// in the same ingest batch.
    #[serde(default)]
    pub main_id: String,
    #[serde(default)]
    pub deleted: bool,
    /// Dedup dirty bit: set when the record changed in a way that may
    /// invalidate its current group membership.
    #[serde(default)]
    pub update_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    #[serde(default)]
    pub title_keys: Vec<String>,
    #[serde(default)]
    pub isbn_keys: Vec<String>,
    #[serde(default)]
    pub id_keys: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated: DateTime<Utc>,
    /// Timestamp reported by the source, when available.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    /// Transient flag used by the ListIdentifiers deletion sweep.
    #[serde(default)]
    pub mark: bool,
}

impl Record {
    /// The payload dedup and indexing should work from: normalized when
    /// normalization changed anything, the original otherwise.
    pub fn effective_data(&self) -> &str {
        if self.normalized_data.is_empty() {
            &self.original_data
        } else {
            &self.normalized_data
        }
    }

    /// Whether this record is a component part of a host record.
    pub fn is_component_part(&self) -> bool {
        !self.host_record_id.is_empty()
    }

    /// Clear all dedup bookkeeping on the record.
    pub fn clear_dedup(&mut self) {
        self.dedup_id = None;
        self.title_keys.clear();
        self.isbn_keys.clear();
        self.id_keys.clear();
        self.update_needed = false;
    }

    pub fn to_doc(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("record serializes")
    }

    pub fn from_doc(doc: serde_json::Value) -> Result<Self, RecordError> {
        serde_json::from_value(doc).map_err(RecordError::from)
    }
}

/// An equivalence class of records believed to describe the same resource
/// across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupGroup {
    #[serde(rename = "_id")]
    pub id: String,
    /// Record ids currently claiming membership.
    pub ids: BTreeSet<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub changed: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated: DateTime<Utc>,
}

impl DedupGroup {
    /// Create a new live group with a fresh opaque id.
    pub fn new(members: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            ids: members.into_iter().collect(),
            deleted: false,
            changed: true,
            updated: now_millis(),
        }
    }

    pub fn to_doc(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("dedup group serializes")
    }

    pub fn from_doc(doc: serde_json::Value) -> Result<Self, RecordError> {
        serde_json::from_value(doc).map_err(RecordError::from)
    }
}

/// Opaque key/value entry in the `state` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    #[serde(rename = "_id")]
    pub key: String,
    pub value: String,
}

/// Cached response body for an external URI lookup. TTL is enforced by
/// readers against `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UriCacheEntry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// State key tracking the last successful harvest window for a source.
pub fn last_harvest_date_key(source_id: &str) -> String {
    format!("Last Harvest Date {source_id}")
}

/// State key tracking the last clean Solr index checkpoint for a source.
pub fn last_index_update_key(source_id: &str) -> String {
    format!("Last Index Update {source_id}")
}

/// State key tracking when deletion reconciliation last ran for a source.
pub fn last_deletion_key(source_id: &str) -> String {
    format!("Last Deletion Processing Time {source_id}")
}

/// Current time truncated to millisecond precision, the resolution the
/// store persists.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Bridge a stored timestamp to Unix milliseconds.
pub fn to_unix_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Bridge Unix milliseconds back to a timestamp.
pub fn from_unix_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Build a record id from a source prefix and a local identifier.
pub fn build_record_id(prefix: &str, local_id: &str) -> String {
    format!("{prefix}.{local_id}")
}

/// The source prefix of a record id, i.e. everything before the first `.`.
pub fn id_prefix(record_id: &str) -> &str {
    match record_id.find('.') {
        Some(pos) => &record_id[..pos],
        None => record_id,
    }
}

/// The local part of a record id, i.e. everything after the first `.`.
pub fn local_id(record_id: &str) -> &str {
    match record_id.find('.') {
        Some(pos) => &record_id[pos + 1..],
        None => record_id,
    }
}

/// Trailing decimal digits of a record id, used to align component parts
/// of matched hosts in a stable order.
pub fn numeric_id_suffix(record_id: &str) -> u64 {
    let tail: Vec<char> = record_id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let digits: String = tail.into_iter().rev().collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        Record {
            id: "s1.123".to_string(),
            source_id: "s1".to_string(),
            oai_id: "oai:example:123".to_string(),
            format: "dc".to_string(),
            original_data: "{}".to_string(),
            normalized_data: String::new(),
            linking_id: String::new(),
            host_record_id: String::new(),
            main_id: String::new(),
            deleted: false,
            update_needed: false,
            dedup_id: None,
            title_keys: vec![],
            isbn_keys: vec![],
            id_keys: vec![],
            created: now_millis(),
            updated: now_millis(),
            date: now_millis(),
            mark: false,
        }
    }

    #[test]
    fn test_record_doc_round_trip() {
        let record = sample_record();
        let doc = record.to_doc();
        assert_eq!(doc["_id"], "s1.123");
        assert!(doc["created"].is_i64());

        let back = Record::from_doc(doc).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_effective_data_prefers_normalized() {
        let mut record = sample_record();
        assert_eq!(record.effective_data(), "{}");
        record.normalized_data = "{\"a\":1}".to_string();
        assert_eq!(record.effective_data(), "{\"a\":1}");
    }

    #[test]
    fn test_dedup_id_absent_when_none() {
        let record = sample_record();
        let doc = record.to_doc();
        assert!(doc.get("dedup_id").is_none());
    }

    #[test]
    fn test_group_round_trip() {
        let group = DedupGroup::new(["s1.1".to_string(), "s2.2".to_string()]);
        let back = DedupGroup::from_doc(group.to_doc()).unwrap();
        assert_eq!(back, group);
        assert_eq!(back.ids.len(), 2);
    }

    #[test]
    fn test_id_helpers() {
        assert_eq!(build_record_id("s1", "42"), "s1.42");
        assert_eq!(id_prefix("s1.42"), "s1");
        assert_eq!(id_prefix("plain"), "plain");
        assert_eq!(local_id("s1.42"), "42");
        assert_eq!(numeric_id_suffix("s1.record007"), 7);
        assert_eq!(numeric_id_suffix("s1.no-digits"), 0);
    }

    #[test]
    fn test_state_keys() {
        assert_eq!(last_harvest_date_key("s1"), "Last Harvest Date s1");
        assert_eq!(last_index_update_key("s1"), "Last Index Update s1");
        assert_eq!(last_deletion_key("s1"), "Last Deletion Processing Time s1");
    }

    #[test]
    fn test_unix_bridges() {
        let now = now_millis();
        assert_eq!(from_unix_millis(to_unix_millis(now)), now);
    }
}
