//! # Merge & Solr Update Pipeline
//!
//! Change-driven delivery of index documents: a restartable queue of
//! canonical ids (group id for deduped records, record id otherwise) is
//! built from everything that changed since the checkpoint, then drained
//! into a document sink. The `"Last Index Update"` checkpoint only
//! advances on clean completion, so failed runs reprocess the same
//! window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{debug, info, warn};

use crate::config::{ComponentPartsPolicy, DataSourceSettings, SiteSettings};
use crate::drivers::{create_driver, SolrDoc};
use crate::enrich::Enricher;
use crate::error::RecordError;
use crate::mapper::FieldMapper;
use crate::model::{
    last_index_update_key, to_unix_millis, DedupGroup, Record,
};
use crate::solr::SolrClient;
use crate::store::{
    cleanup_old_queues, find_finalized_queue, finalize_queue, get_state, get_state_time,
    new_queue, queue_push, set_state, set_state_time, Filter, FindOptions, IterateControl,
    IterateOptions, SortOrder, Store, DEDUP_COLLECTION, RECORD_COLLECTION,
};
use crate::Cancellation;

/// Fields that stay single-valued in the index; everything else is a
/// union when documents merge.
const SINGLE_VALUED_FIELDS: &[&str] = &[
    "id",
    "title",
    "title_short",
    "title_full",
    "title_sort",
    "author",
    "publisher",
    "publish_date",
    "unit_id",
    "recordtype",
    "first_indexed",
    "last_indexed",
];

/// Where built documents go. The Solr client posts them; compare and dump
/// modes write files instead.
#[async_trait]
pub trait DocSink: Send {
    async fn add(&mut self, doc: Value) -> Result<(), RecordError>;
    async fn delete(&mut self, id: &str) -> Result<(), RecordError>;
    async fn delete_query(&mut self, query: &str) -> Result<(), RecordError>;
    async fn commit(&mut self) -> Result<(), RecordError>;
    async fn flush(&mut self) -> Result<(), RecordError>;
}

#[async_trait]
impl DocSink for SolrClient {
    async fn add(&mut self, doc: Value) -> Result<(), RecordError> {
        SolrClient::add(self, doc).await
    }

    async fn delete(&mut self, id: &str) -> Result<(), RecordError> {
        SolrClient::delete_id(self, id).await
    }

    async fn delete_query(&mut self, query: &str) -> Result<(), RecordError> {
        SolrClient::delete_query(self, query).await
    }

    async fn commit(&mut self) -> Result<(), RecordError> {
        SolrClient::commit(self).await
    }

    async fn flush(&mut self) -> Result<(), RecordError> {
        SolrClient::flush(self).await
    }
}

/// Compare mode: fetch each candidate document from Solr and write only
/// the field differences to a file. Nothing is posted.
pub struct CompareSink {
    solr: SolrClient,
    file: std::fs::File,
}

impl CompareSink {
    pub fn new(solr: SolrClient, path: &std::path::Path) -> Result<Self, RecordError> {
        Ok(Self {
            solr,
            file: std::fs::File::create(path)?,
        })
    }
}

#[async_trait]
impl DocSink for CompareSink {
    async fn add(&mut self, doc: Value) -> Result<(), RecordError> {
        let id = doc.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        let existing = self.solr.get_document(&id).await?;
        let diffs = diff_documents(existing.as_ref(), &doc);
        if !diffs.is_empty() {
            writeln!(self.file, "--- {id}")?;
            for line in diffs {
                writeln!(self.file, "{line}")?;
            }
        }
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<(), RecordError> {
        writeln!(self.file, "--- {id}\ndeleted")?;
        Ok(())
    }

    async fn delete_query(&mut self, query: &str) -> Result<(), RecordError> {
        writeln!(self.file, "--- delete by query: {query}")?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), RecordError> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), RecordError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Dump mode: write add batches as files instead of posting them.
pub struct DumpSink {
    prefix: String,
    batch: Vec<Value>,
    batch_size: usize,
    sequence: usize,
}

impl DumpSink {
    pub fn new(prefix: &str, batch_size: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            batch: Vec::new(),
            batch_size: batch_size.max(1),
            sequence: 0,
        }
    }

    fn write_batch(&mut self) -> Result<(), RecordError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.sequence += 1;
        let path = format!("{}-{:05}.json", self.prefix, self.sequence);
        let batch = std::mem::take(&mut self.batch);
        std::fs::write(&path, serde_json::to_string_pretty(&Value::Array(batch))?)?;
        info!(path, "wrote dump batch");
        Ok(())
    }
}

#[async_trait]
impl DocSink for DumpSink {
    async fn add(&mut self, doc: Value) -> Result<(), RecordError> {
        self.batch.push(doc);
        if self.batch.len() >= self.batch_size {
            self.write_batch()?;
        }
        Ok(())
    }

    async fn delete(&mut self, _id: &str) -> Result<(), RecordError> {
        Ok(())
    }

    async fn delete_query(&mut self, _query: &str) -> Result<(), RecordError> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), RecordError> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), RecordError> {
        self.write_batch()
    }
}

fn diff_documents(existing: Option<&Value>, built: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    let empty = serde_json::Map::new();
    let existing = existing.and_then(Value::as_object).unwrap_or(&empty);
    let built = match built.as_object() {
        Some(map) => map,
        None => return lines,
    };

    for (field, value) in built {
        if matches!(field.as_str(), "first_indexed" | "last_indexed") {
            continue;
        }
        match existing.get(field) {
            Some(old) if old == value => {}
            Some(old) => lines.push(format!("~ {field}: {old} -> {value}")),
            None => lines.push(format!("+ {field}: {value}")),
        }
    }
    for field in existing.keys() {
        if field.starts_with('_') || field == "score" {
            continue;
        }
        if !built.contains_key(field) {
            lines.push(format!("- {field}"));
        }
    }
    lines
}

/// Options for one update run, typically from CLI flags.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub from: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub single_id: Option<String>,
    pub no_commit: bool,
    /// Compare/dump runs deliver nowhere real and must not advance the
    /// index checkpoint.
    pub dry_run: bool,
    /// Issue an explicit commit every this many delivered records.
    pub commit_interval: usize,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            from: None,
            source: None,
            single_id: None,
            no_commit: false,
            dry_run: false,
            commit_interval: 50_000,
        }
    }
}

/// Counters reported by an update run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub updated: u64,
    pub deleted: u64,
    pub commits: u64,
    pub queued: u64,
    pub queue_reused: bool,
}

fn index_state_key(source: Option<&str>) -> String {
    match source {
        Some(source_id) => last_index_update_key(source_id),
        None => "Last Index Update".to_string(),
    }
}

fn queue_position_key(queue: &str) -> String {
    format!("Queue Position {queue}")
}

/// Stable hash over the parameters that shape a queue's contents.
pub fn parameter_hash(
    from: DateTime<Utc>,
    source: Option<&str>,
    single_id: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_unix_millis(from).to_be_bytes());
    hasher.update(source.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(single_id.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Merge one document into the accumulating merged-record document:
/// union for multi-valued fields, first-non-empty for single-valued ones.
pub fn merge_into(target: &mut SolrDoc, source: SolrDoc) {
    for (field, values) in source {
        if SINGLE_VALUED_FIELDS.contains(&field.as_str()) {
            if !target.contains_key(&field) {
                target.insert(field, values);
            }
        } else {
            let entry = target.entry(field).or_default();
            for value in values {
                if !entry.contains(&value) {
                    entry.push(value);
                }
            }
        }
    }
}

/// Serialize a built document to the Solr JSON shape: single-valued
/// fields become strings, the rest stay arrays.
pub fn doc_to_json(doc: &SolrDoc, merged: bool) -> Value {
    let mut map = serde_json::Map::new();
    for (field, values) in doc {
        if values.is_empty() {
            continue;
        }
        if SINGLE_VALUED_FIELDS.contains(&field.as_str()) {
            map.insert(field.clone(), Value::String(values[0].clone()));
        } else {
            map.insert(
                field.clone(),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
    }
    if merged {
        map.insert("merged_boolean".to_string(), Value::Bool(true));
    }
    Value::Object(map)
}

fn already_hierarchy_encoded(value: &str) -> bool {
    let mut chars = value.chars();
    let mut digits = 0;
    for c in chars.by_ref() {
        if c.is_ascii_digit() {
            digits += 1;
        } else {
            return digits > 0 && c == '/';
        }
    }
    false
}

/// Explode `building` into the hierarchical facet encoding. Values the
/// driver already emitted in `n/...` form pass through untouched.
pub fn explode_building(doc: &mut SolrDoc, institution: &str) {
    if institution.is_empty() {
        return;
    }
    let Some(values) = doc.get("building").cloned() else {
        return;
    };
    let mut exploded = vec![format!("0/{institution}")];
    for value in &values {
        if already_hierarchy_encoded(value) {
            exploded.push(value.clone());
            continue;
        }
        let depth = value.split('/').count();
        exploded.push(format!("{depth}/{institution}/{value}"));
    }
    let mut seen = std::collections::HashSet::new();
    exploded.retain(|value| seen.insert(value.clone()));
    doc.insert("building".to_string(), exploded);
}

fn solr_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// The merge & update pipeline for one run.
pub struct SolrUpdater<'a> {
    store: &'a dyn Store,
    sources: &'a BTreeMap<String, DataSourceSettings>,
    mapper: &'a FieldMapper,
    enrichers: &'a [Box<dyn Enricher>],
    site: &'a SiteSettings,
    cancellation: Cancellation,
}

impl<'a> SolrUpdater<'a> {
    pub fn new(
        store: &'a dyn Store,
        sources: &'a BTreeMap<String, DataSourceSettings>,
        mapper: &'a FieldMapper,
        enrichers: &'a [Box<dyn Enricher>],
        site: &'a SiteSettings,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            store,
            sources,
            mapper,
            enrichers,
            site,
            cancellation,
        }
    }

    /// Run the pipeline: build or reuse the queue, drain it into the
    /// sink, checkpoint on clean completion.
    pub async fn update_solr(
        &self,
        sink: &mut dyn DocSink,
        options: &UpdateOptions,
    ) -> Result<UpdateStats, RecordError> {
        let scan_start = self.store.now();
        let state_key = index_state_key(options.source.as_deref());
        let from = match options.from {
            Some(from) => from,
            None => get_state_time(self.store, &state_key)?
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        };
        let last_record_time = self.last_record_time()?;
        let hash = parameter_hash(from, options.source.as_deref(), options.single_id.as_deref());

        let mut stats = UpdateStats::default();
        let queue = match find_finalized_queue(self.store, &hash, from, last_record_time)? {
            Some(queue) => {
                info!(queue, "reusing finalized queue");
                stats.queue_reused = true;
                queue
            }
            None => self.build_queue(&hash, from, last_record_time, options)?,
        };
        cleanup_old_queues(self.store, last_record_time)?;
        stats.queued = self.store.count(&queue, &Filter::All)?;

        // Resume delivery where a previous run on this queue stopped.
        // Dry runs always cover the whole queue and leave no tracks.
        let position_key = queue_position_key(&queue);
        let start_after = if options.dry_run {
            None
        } else {
            get_state(self.store, &position_key)?
        };

        let mut canonical_ids = Vec::new();
        self.store.iterate(
            &queue,
            &Filter::All,
            &IterateOptions {
                start_after,
                ..IterateOptions::default()
            },
            &mut |doc| {
                if let Some(id) = doc.get("_id").and_then(Value::as_str) {
                    canonical_ids.push(id.to_string());
                }
                Ok(IterateControl::Continue)
            },
        )?;

        let commit_interval = options.commit_interval.max(1);
        let mut since_commit = 0usize;

        for canonical_id in canonical_ids {
            if self.cancellation.is_cancelled() {
                sink.flush().await?;
                return Err(RecordError::Cancelled);
            }
            self.deliver(sink, &canonical_id, &mut stats).await?;
            if !options.dry_run {
                set_state(self.store, &position_key, &canonical_id)?;
            }

            since_commit += 1;
            if since_commit >= commit_interval {
                since_commit = 0;
                if !options.no_commit {
                    sink.commit().await?;
                    stats.commits += 1;
                }
            }
        }

        sink.flush().await?;
        if !options.no_commit {
            sink.commit().await?;
            stats.commits += 1;
        }

        if !options.dry_run {
            set_state_time(self.store, &state_key, scan_start)?;
        }
        info!(
            updated = stats.updated,
            deleted = stats.deleted,
            queued = stats.queued,
            "Solr update complete"
        );
        Ok(stats)
    }

    fn last_record_time(&self) -> Result<DateTime<Utc>, RecordError> {
        let latest = self.store.find(
            RECORD_COLLECTION,
            &Filter::All,
            &FindOptions {
                sort: Some(("updated".to_string(), SortOrder::Descending)),
                skip: 0,
                limit: Some(1),
            },
        )?;
        Ok(latest
            .first()
            .and_then(|doc| Record::from_doc(doc.clone()).ok())
            .map(|record| record.updated)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    /// Scan for changed records and touched groups, writing canonical ids
    /// into a fresh queue.
    fn build_queue(
        &self,
        hash: &str,
        from: DateTime<Utc>,
        last_record_time: DateTime<Utc>,
        options: &UpdateOptions,
    ) -> Result<String, RecordError> {
        let tmp = new_queue(self.store, hash, from, last_record_time)?;

        let mut record_filter = vec![
            Filter::gte("updated", to_unix_millis(from)),
            Filter::eq("update_needed", false),
        ];
        if let Some(source_id) = &options.source {
            record_filter.push(Filter::eq("source_id", source_id.as_str()));
        }
        if let Some(single_id) = &options.single_id {
            record_filter.push(Filter::eq("_id", single_id.as_str()));
        }

        let store = self.store;
        store.iterate(
            RECORD_COLLECTION,
            &Filter::and(record_filter),
            &IterateOptions::default(),
            &mut |doc| {
                let record = Record::from_doc(doc)?;
                let canonical = record.dedup_id.as_deref().unwrap_or(&record.id);
                queue_push(store, &tmp, canonical)?;
                Ok(IterateControl::Continue)
            },
        )?;

        // Groups touched by dedup since the checkpoint; catches merged
        // documents whose members did not themselves change.
        if options.single_id.is_none() {
            let source_prefix = options.source.as_deref().map(|source_id| {
                let prefix = self
                    .sources
                    .get(source_id)
                    .map(|settings| settings.prefix(source_id))
                    .unwrap_or(source_id);
                format!("{prefix}.")
            });

            store.iterate(
                DEDUP_COLLECTION,
                &Filter::gte("updated", to_unix_millis(from)),
                &IterateOptions::default(),
                &mut |doc| {
                    let group = DedupGroup::from_doc(doc)?;
                    if let Some(prefix) = &source_prefix {
                        if !group.ids.iter().any(|id| id.starts_with(prefix)) {
                            return Ok(IterateControl::Continue);
                        }
                    }
                    queue_push(store, &tmp, &group.id)?;
                    Ok(IterateControl::Continue)
                },
            )?;
        }

        let queue = finalize_queue(self.store, &tmp)?;
        crate::store::clear_state(self.store, &queue_position_key(&queue))?;
        debug!(queue, "queue finalized");
        Ok(queue)
    }

    /// Emit the document(s) for one canonical id.
    async fn deliver(
        &self,
        sink: &mut dyn DocSink,
        canonical_id: &str,
        stats: &mut UpdateStats,
    ) -> Result<(), RecordError> {
        if let Some(group_doc) = self.store.get(DEDUP_COLLECTION, canonical_id)? {
            let group = DedupGroup::from_doc(group_doc)?;
            return self.deliver_group(sink, group, stats).await;
        }

        match self.store.get(RECORD_COLLECTION, canonical_id)? {
            Some(record_doc) => {
                let record = Record::from_doc(record_doc)?;
                self.deliver_record(sink, record, stats).await
            }
            None => {
                sink.delete(canonical_id).await?;
                stats.deleted += 1;
                Ok(())
            }
        }
    }

    async fn deliver_group(
        &self,
        sink: &mut dyn DocSink,
        group: DedupGroup,
        stats: &mut UpdateStats,
    ) -> Result<(), RecordError> {
        let mut members = Vec::new();
        if !group.deleted {
            for member_id in &group.ids {
                if let Some(doc) = self.store.get(RECORD_COLLECTION, member_id)? {
                    let member = Record::from_doc(doc)?;
                    if !member.deleted {
                        members.push(member);
                    }
                }
            }
        }

        if members.is_empty() {
            sink.delete(&group.id).await?;
            stats.deleted += 1;
            return Ok(());
        }

        let mut merged = SolrDoc::new();
        for member in &members {
            let doc = self.build_record_doc(member).await?;
            merge_into(&mut merged, doc);
            // The merged document replaces any stand-alone one a member
            // had before it joined the group.
            sink.delete(&member.id).await?;
        }
        merged.insert("id".to_string(), vec![group.id.clone()]);
        sink.add(doc_to_json(&merged, true)).await?;
        stats.updated += 1;
        Ok(())
    }

    async fn deliver_record(
        &self,
        sink: &mut dyn DocSink,
        record: Record,
        stats: &mut UpdateStats,
    ) -> Result<(), RecordError> {
        if record.deleted {
            sink.delete(&record.id).await?;
            stats.deleted += 1;
            return Ok(());
        }

        let settings = self.sources.get(&record.source_id);
        if record.is_component_part() {
            let merged_into_host = settings
                .map(|s| s.component_parts == ComponentPartsPolicy::MergeAll)
                .unwrap_or(false);
            let indexed_anyway = settings.map(|s| s.index_merged_parts).unwrap_or(false);
            if merged_into_host && !indexed_anyway {
                // Lives only inside its host's document.
                sink.delete(&record.id).await?;
                stats.deleted += 1;
                return Ok(());
            }
        }

        let doc = self.build_record_doc(&record).await?;
        sink.add(doc_to_json(&doc, false)).await?;
        stats.updated += 1;
        Ok(())
    }

    /// Driver output → component folding → enrichment → mapping → empty
    /// drop → standard fields → building hierarchy. Also used by the
    /// preview command.
    pub async fn build_record_doc(&self, record: &Record) -> Result<SolrDoc, RecordError> {
        let driver = create_driver(
            &record.format,
            record.effective_data(),
            &record.oai_id,
            &record.source_id,
        )?;
        let mut doc = driver.to_solr_array();
        let settings = self.sources.get(&record.source_id);

        if !record.is_component_part() {
            let merge_parts = settings
                .map(|s| s.component_parts == ComponentPartsPolicy::MergeAll)
                .unwrap_or(false);
            if merge_parts {
                let components = self.component_docs(record, settings)?;
                if !components.is_empty() {
                    let merged = driver.merge_component_parts(&components, &mut doc);
                    debug!(host = %record.id, merged, "folded component parts");
                }
            }
        }

        for enricher in self.enrichers {
            enricher
                .enrich(self.store, &record.source_id, record, &mut doc)
                .await?;
        }

        self.mapper.map_values(&record.source_id, &mut doc);

        for values in doc.values_mut() {
            values.retain(|value| !value.is_empty());
        }
        doc.retain(|_, values| !values.is_empty());

        doc.insert("id".to_string(), vec![record.id.clone()]);
        doc.insert("recordtype".to_string(), vec![record.format.clone()]);
        let institution = settings
            .map(|s| s.institution.clone())
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.site.default_institution.clone());
        if !institution.is_empty() {
            doc.insert("institution".to_string(), vec![institution.clone()]);
        }
        doc.insert("collection".to_string(), vec![record.source_id.clone()]);
        doc.insert(
            "first_indexed".to_string(),
            vec![solr_time(record.created)],
        );
        doc.insert(
            "last_indexed".to_string(),
            vec![solr_time(self.store.now())],
        );

        if self.site.building_hierarchy {
            explode_building(&mut doc, &institution);
        }

        Ok(doc)
    }

    fn component_docs(
        &self,
        host: &Record,
        settings: Option<&DataSourceSettings>,
    ) -> Result<Vec<SolrDoc>, RecordError> {
        let link = if host.linking_id.is_empty() {
            crate::model::local_id(&host.id).to_string()
        } else {
            host.linking_id.clone()
        };
        let filter = Filter::and([
            Filter::eq("source_id", host.source_id.as_str()),
            Filter::eq("host_record_id", link),
            Filter::eq("deleted", false),
        ]);
        let docs = self
            .store
            .find(RECORD_COLLECTION, &filter, &FindOptions::default())?;

        let prepend_unit_id = settings
            .map(|s| s.prepend_parent_title_with_unitid)
            .unwrap_or(false);

        let mut components = Vec::new();
        for doc in docs {
            let part = Record::from_doc(doc)?;
            let part_driver = create_driver(
                &part.format,
                part.effective_data(),
                &part.oai_id,
                &part.source_id,
            )?;
            let mut part_doc = part_driver.to_solr_array();
            if prepend_unit_id {
                let unit_id = part_doc
                    .get("unit_id")
                    .and_then(|values| values.first())
                    .cloned();
                if let (Some(unit_id), Some(titles)) = (unit_id, part_doc.get_mut("title")) {
                    for title in titles.iter_mut() {
                        *title = format!("{unit_id} {title}");
                    }
                }
            }
            if let Some(fields) = settings.map(|s| &s.non_inherited_fields) {
                for field in fields {
                    part_doc.remove(field);
                }
            }
            components.push(part_doc);
        }
        Ok(components)
    }

    /// Remove a data source from the index: detach its records from their
    /// groups so the merged documents get rewritten, then delete by id
    /// prefix.
    pub async fn delete_datasource(
        &self,
        sink: &mut dyn DocSink,
        source_id: &str,
        no_commit: bool,
    ) -> Result<UpdateStats, RecordError> {
        let prefix = self
            .sources
            .get(source_id)
            .map(|settings| settings.prefix(source_id))
            .unwrap_or(source_id)
            .to_string();
        let mut stats = UpdateStats::default();

        // Pre-pass: pull this source's records out of their groups and
        // re-emit or delete the affected merged documents.
        let filter = Filter::and([
            Filter::eq("source_id", source_id),
            Filter::exists("dedup_id", true),
        ]);
        let store = self.store;
        let mut grouped = Vec::new();
        store.iterate(
            RECORD_COLLECTION,
            &filter,
            &IterateOptions::default(),
            &mut |doc| {
                grouped.push(Record::from_doc(doc)?);
                Ok(IterateControl::Continue)
            },
        )?;

        let mut touched_groups = Vec::new();
        for mut record in grouped {
            if self.cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            if let Some(group_id) = record.dedup_id.clone() {
                touched_groups.push(group_id);
            }
            crate::dedup::detach_record(store, &mut record)?;
        }

        for group_id in touched_groups {
            if let Some(doc) = store.get(DEDUP_COLLECTION, &group_id)? {
                let group = DedupGroup::from_doc(doc)?;
                self.deliver_group(sink, group, &mut stats).await?;
            }
        }

        sink.delete_query(&format!("id:{prefix}.*")).await?;
        stats.deleted += 1;
        sink.flush().await?;
        if !no_commit {
            sink.commit().await?;
            stats.commits += 1;
        }
        warn!(source = source_id, "data source removed from index");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_hash_is_stable_and_sensitive() {
        let from = crate::model::from_unix_millis(1000);
        let a = parameter_hash(from, Some("s1"), None);
        let b = parameter_hash(from, Some("s1"), None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);

        assert_ne!(a, parameter_hash(from, Some("s2"), None));
        assert_ne!(a, parameter_hash(from, Some("s1"), Some("s1.1")));
        assert_ne!(
            a,
            parameter_hash(crate::model::from_unix_millis(2000), Some("s1"), None)
        );
    }

    #[test]
    fn test_merge_into_union_and_first_wins() {
        let mut target = SolrDoc::new();
        let mut first = SolrDoc::new();
        first.insert("title".to_string(), vec!["The Art".to_string()]);
        first.insert("language".to_string(), vec!["eng".to_string()]);
        merge_into(&mut target, first);

        let mut second = SolrDoc::new();
        second.insert("title".to_string(), vec!["Art".to_string()]);
        second.insert(
            "language".to_string(),
            vec!["eng".to_string(), "fin".to_string()],
        );
        merge_into(&mut target, second);

        assert_eq!(target["title"], vec!["The Art"]);
        assert_eq!(target["language"], vec!["eng", "fin"]);
    }

    #[test]
    fn test_doc_to_json_shapes() {
        let mut doc = SolrDoc::new();
        doc.insert("title".to_string(), vec!["T".to_string()]);
        doc.insert(
            "language".to_string(),
            vec!["eng".to_string(), "fin".to_string()],
        );
        let json = doc_to_json(&doc, true);
        assert_eq!(json["title"], "T");
        assert_eq!(json["language"], serde_json::json!(["eng", "fin"]));
        assert_eq!(json["merged_boolean"], true);

        let json = doc_to_json(&doc, false);
        assert!(json.get("merged_boolean").is_none());
    }

    #[test]
    fn test_explode_building() {
        let mut doc = SolrDoc::new();
        doc.insert(
            "building".to_string(),
            vec!["A".to_string(), "A/2".to_string()],
        );
        explode_building(&mut doc, "Inst");
        assert_eq!(doc["building"], vec!["0/Inst", "1/Inst/A", "2/Inst/A/2"]);
    }

    #[test]
    fn test_explode_building_passes_encoded_values() {
        let mut doc = SolrDoc::new();
        doc.insert("building".to_string(), vec!["1/Other/X".to_string()]);
        explode_building(&mut doc, "Inst");
        assert_eq!(doc["building"], vec!["0/Inst", "1/Other/X"]);
    }

    #[test]
    fn test_diff_documents() {
        let existing = serde_json::json!({"id": "a", "title": "Old", "gone": "x"});
        let built = serde_json::json!({"id": "a", "title": "New", "fresh": "y"});
        let diffs = diff_documents(Some(&existing), &built);
        assert!(diffs.iter().any(|l| l.starts_with("~ title")));
        assert!(diffs.iter().any(|l| l.starts_with("+ fresh")));
        assert!(diffs.iter().any(|l| l.starts_with("- gone")));
    }
}
