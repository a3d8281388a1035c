//! # recman
//!
//! A bibliographic record pipeline: harvest metadata from heterogeneous
//! sources, normalize and enrich it, detect duplicates across sources,
//! and deliver merged canonical documents to a Solr index.
//!
//! The [`RecordManager`] facade ties the subsystems together for the CLI
//! binaries; each subsystem is usable on its own.

pub mod config;
pub mod dedup;
pub mod drivers;
pub mod enrich;
pub mod error;
pub mod harvest;
pub mod ingest;
pub mod keys;
pub mod mapper;
pub mod model;
pub mod persistence;
pub mod solr;
pub mod store;
pub mod update;

#[doc(hidden)]
pub mod test_support;

pub use config::{DataSourceSettings, Settings};
pub use dedup::{DedupStats, Deduplicator, RepairReport};
pub use error::RecordError;
pub use harvest::{HarvestOptions, HarvestStats, Harvester};
pub use ingest::Ingestor;
pub use mapper::FieldMapper;
pub use model::{DedupGroup, Record};
pub use persistence::RocksStore;
pub use store::{MemoryStore, Store};
pub use update::{SolrUpdater, UpdateOptions, UpdateStats};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::enrich::{AuthorityEnricher, Enricher};
use crate::ingest::soft_delete_record;
use crate::solr::SolrClient;
use crate::store::{
    Filter, FindOptions, IterateControl, IterateOptions, DEDUP_COLLECTION, RECORD_COLLECTION,
};

/// Cooperative cancellation handle. Long passes poll it between records;
/// the in-flight record always completes before the pass stops.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip this handle on Ctrl-C. Call once per binary.
    pub fn install_ctrl_c(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("termination requested, finishing current record");
                handle.cancel();
            }
        });
    }
}

/// What `export --add-dedup-id` should write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddDedupId {
    #[default]
    No,
    /// Only on records that belong to a group.
    Deduped,
    /// On every record, falling back to the record id.
    Always,
}

/// Options for the export command.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub file: String,
    pub deleted_file: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub skip: usize,
    pub source: Option<String>,
    pub single_id: Option<String>,
    /// JSON pointer the payload must resolve for the record to be
    /// exported.
    pub xpath: Option<String>,
    pub sort_dedup: bool,
    pub add_dedup_id: AddDedupId,
}

/// Main API tying store, configuration, mapper and enrichment together.
pub struct RecordManager {
    store: Arc<dyn Store>,
    settings: Settings,
    sources: BTreeMap<String, DataSourceSettings>,
    mapper: FieldMapper,
    client: reqwest::Client,
    cancellation: Cancellation,
}

impl RecordManager {
    /// Assemble a manager from already-loaded pieces.
    pub fn new(
        settings: Settings,
        sources: BTreeMap<String, DataSourceSettings>,
        mapper: FieldMapper,
        store: Arc<dyn Store>,
    ) -> Result<Self, RecordError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.http.connect_timeout_secs))
            .build()?;
        Ok(Self {
            store,
            settings,
            sources,
            mapper,
            client,
            cancellation: Cancellation::new(),
        })
    }

    /// Load configuration files and open the persistent store.
    pub fn open(
        config_path: Option<&str>,
        datasources_path: &str,
        mappings_dir: &Path,
    ) -> Result<Self, RecordError> {
        let settings = Settings::load(config_path)?;
        let sources = config::load_datasources(datasources_path)?;
        let mapper = FieldMapper::load(mappings_dir, &sources)?;
        let store = Arc::new(RocksStore::open(&settings.database.path)?);
        Self::new(settings, sources, mapper, store)
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sources(&self) -> &BTreeMap<String, DataSourceSettings> {
        &self.sources
    }

    fn source_settings(&self, source_id: &str) -> Result<&DataSourceSettings, RecordError> {
        self.sources
            .get(source_id)
            .ok_or_else(|| RecordError::Config(format!("unknown data source {source_id}")))
    }

    fn enrichers(&self) -> Vec<Box<dyn Enricher>> {
        if !self.settings.enrichment.enabled {
            return Vec::new();
        }
        vec![Box::new(AuthorityEnricher::new(
            self.client.clone(),
            self.settings.http.clone(),
            &self.settings.enrichment,
            self.cancellation.clone(),
        ))]
    }

    fn solr_client(&self) -> SolrClient {
        SolrClient::new(
            self.client.clone(),
            self.settings.solr.clone(),
            self.settings.http.clone(),
            self.cancellation.clone(),
        )
    }

    /// Harvest one source, feeding every yielded record through ingestion.
    pub async fn harvest_source(
        &self,
        source_id: &str,
        options: &HarvestOptions,
    ) -> Result<HarvestStats, RecordError> {
        let settings = self.source_settings(source_id)?;
        let harvester = Harvester::new(
            self.store.as_ref(),
            &self.client,
            source_id,
            settings,
            &self.settings.http,
            self.cancellation.clone(),
        );
        let ingestor = Ingestor::new(self.store.as_ref(), source_id, settings);
        let mut sink = |oai_id: &str, deleted: bool, payload: &str| {
            ingestor.store_record(oai_id, deleted, payload)
        };
        harvester.harvest(options, &mut sink).await
    }

    /// Import a bulk file: a JSON array of payloads, or one payload per
    /// line. With `delete`, every imported record is tombstoned instead.
    pub fn import_file(
        &self,
        source_id: &str,
        path: &Path,
        delete: bool,
    ) -> Result<u64, RecordError> {
        let settings = self.source_settings(source_id)?;
        let ingestor = Ingestor::new(self.store.as_ref(), source_id, settings);
        let content = std::fs::read_to_string(path)?;

        let payloads: Vec<String> = if content.trim_start().starts_with('[') {
            let values: Vec<Value> = serde_json::from_str(&content)
                .map_err(|err| RecordError::Parse(format!("bad import file: {err}")))?;
            values
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<_, _>>()?
        } else {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut count = 0;
        for payload in payloads {
            if self.cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            if delete {
                // Tombstone by the record's own id.
                let value: Value = serde_json::from_str(&payload)
                    .map_err(|err| RecordError::Parse(format!("bad import payload: {err}")))?;
                let local = value.get("id").and_then(Value::as_str).unwrap_or_default();
                if local.is_empty() {
                    continue;
                }
                let id = model::build_record_id(settings.prefix(source_id), local);
                if let Some(doc) = self.store.get(RECORD_COLLECTION, &id)? {
                    let mut record = Record::from_doc(doc)?;
                    soft_delete_record(self.store.as_ref(), &mut record)?;
                    count += 1;
                }
            } else {
                match ingestor.store_record("", false, &payload) {
                    Ok(stored) => count += stored,
                    Err(RecordError::Cancelled) => return Err(RecordError::Cancelled),
                    Err(err) => warn!(error = %err, "import record skipped"),
                }
            }
        }
        info!(source = source_id, count, "import complete");
        Ok(count)
    }

    /// Run one dedup pass over dirty records.
    pub fn deduplicate(&self, source: Option<&str>) -> Result<DedupStats, RecordError> {
        let mut deduplicator = Deduplicator::new(self.store.as_ref(), &self.sources);
        deduplicator.run(source, &self.cancellation)
    }

    /// Run the group/record consistency check and repair.
    pub fn check_dedup(&self) -> Result<RepairReport, RecordError> {
        dedup::check_dedup_consistency(self.store.as_ref(), &self.cancellation)
    }

    /// Re-run normalization and key extraction from the stored original
    /// payloads, marking everything dirty for the next dedup pass.
    pub fn renormalize(
        &self,
        source: Option<&str>,
        single_id: Option<&str>,
    ) -> Result<u64, RecordError> {
        let mut filter = vec![Filter::eq("deleted", false)];
        if let Some(source_id) = source {
            filter.push(Filter::eq("source_id", source_id));
        }
        if let Some(id) = single_id {
            filter.push(Filter::eq("_id", id));
        }

        let store = self.store.as_ref();
        let cancellation = &self.cancellation;
        let mut processed = 0;
        let mut updates = Vec::new();
        store.iterate(
            RECORD_COLLECTION,
            &Filter::and(filter),
            &IterateOptions::default(),
            &mut |doc| {
                if cancellation.is_cancelled() {
                    return Err(RecordError::Cancelled);
                }
                updates.push(Record::from_doc(doc)?);
                Ok(IterateControl::Continue)
            },
        )?;

        for mut record in updates {
            let settings = match self.sources.get(&record.source_id) {
                Some(settings) => settings,
                None => continue,
            };
            let mut driver = match drivers::create_driver(
                &record.format,
                &record.original_data,
                &record.oai_id,
                &record.source_id,
            ) {
                Ok(driver) => driver,
                Err(err) => {
                    warn!(record = %record.id, error = %err, "renormalize skipped");
                    continue;
                }
            };
            driver.normalize();
            let normalized = driver.serialize()?;
            record.normalized_data = if normalized == record.original_data {
                String::new()
            } else {
                normalized
            };
            if settings.dedup && !record.is_component_part() {
                let key = keys::title_key(&driver.get_title(true));
                record.title_keys = if key.is_empty() { Vec::new() } else { vec![key] };
                record.isbn_keys = driver.get_isbns();
                record.id_keys = driver.get_unique_ids();
                record.update_needed = true;
            }
            record.updated = store.now();
            store.save(RECORD_COLLECTION, record.to_doc())?;
            processed += 1;
        }
        info!(processed, "renormalization complete");
        Ok(processed)
    }

    fn updater<'a>(&'a self, enrichers: &'a [Box<dyn Enricher>]) -> SolrUpdater<'a> {
        SolrUpdater::new(
            self.store.as_ref(),
            &self.sources,
            &self.mapper,
            enrichers,
            &self.settings.site,
            self.cancellation.clone(),
        )
    }

    /// Run the Solr update pipeline. `compare` diffs against the live
    /// index into a file; `dump_prefix` writes batches as files; both
    /// suppress posting and checkpoint advancement is tied to the normal
    /// path only.
    pub async fn update_solr(
        &self,
        options: &UpdateOptions,
        compare: Option<&Path>,
        dump_prefix: Option<&str>,
    ) -> Result<UpdateStats, RecordError> {
        let enrichers = self.enrichers();
        let updater = self.updater(&enrichers);
        let mut options = options.clone();
        options.commit_interval = self.settings.solr.max_commit_interval;

        if let Some(path) = compare {
            let mut sink = update::CompareSink::new(self.solr_client(), path)?;
            options.no_commit = true;
            options.dry_run = true;
            return updater.update_solr(&mut sink, &options).await;
        }
        if let Some(prefix) = dump_prefix {
            let mut sink =
                update::DumpSink::new(prefix, self.settings.solr.max_update_records);
            options.no_commit = true;
            options.dry_run = true;
            return updater.update_solr(&mut sink, &options).await;
        }

        let mut sink = self.solr_client();
        updater.update_solr(&mut sink, &options).await
    }

    /// Remove one source's documents from the Solr index.
    pub async fn delete_datasource_from_solr(
        &self,
        source_id: &str,
        no_commit: bool,
    ) -> Result<UpdateStats, RecordError> {
        let enrichers = self.enrichers();
        let updater = self.updater(&enrichers);
        let mut sink = self.solr_client();
        updater
            .delete_datasource(&mut sink, source_id, no_commit)
            .await
    }

    pub async fn optimize_solr(&self) -> Result<(), RecordError> {
        self.solr_client().optimize().await
    }

    /// Soft-delete records, by source or single id.
    pub fn mark_deleted(
        &self,
        source: Option<&str>,
        single_id: Option<&str>,
    ) -> Result<u64, RecordError> {
        let mut filter = vec![Filter::eq("deleted", false)];
        if let Some(source_id) = source {
            filter.push(Filter::eq("source_id", source_id));
        }
        if let Some(id) = single_id {
            filter.push(Filter::eq("_id", id));
        }
        let docs = self
            .store
            .find(RECORD_COLLECTION, &Filter::and(filter), &FindOptions::default())?;
        let mut count = 0;
        for doc in docs {
            let mut record = Record::from_doc(doc)?;
            soft_delete_record(self.store.as_ref(), &mut record)?;
            count += 1;
        }
        Ok(count)
    }

    /// Hard-delete one source's records from the store, detaching each
    /// from its group first.
    pub fn delete_records(&self, source_id: &str) -> Result<u64, RecordError> {
        let store = self.store.as_ref();
        let mut records = Vec::new();
        store.iterate(
            RECORD_COLLECTION,
            &Filter::eq("source_id", source_id),
            &IterateOptions::default(),
            &mut |doc| {
                records.push(Record::from_doc(doc)?);
                Ok(IterateControl::Continue)
            },
        )?;
        let mut count = 0;
        for mut record in records {
            if self.cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            dedup::detach_record(store, &mut record)?;
            store.delete(RECORD_COLLECTION, &record.id)?;
            count += 1;
        }
        info!(source = source_id, count, "records deleted from store");
        Ok(count)
    }

    /// Count records, optionally per source, including or excluding
    /// tombstones.
    pub fn count_records(
        &self,
        source: Option<&str>,
        include_deleted: bool,
    ) -> Result<u64, RecordError> {
        let mut filter = Vec::new();
        if let Some(source_id) = source {
            filter.push(Filter::eq("source_id", source_id));
        }
        if !include_deleted {
            filter.push(Filter::eq("deleted", false));
        }
        self.store.count(RECORD_COLLECTION, &Filter::and(filter))
    }

    /// Raw and normalized payloads of one record, for operators.
    pub fn dump_record(&self, id: &str) -> Result<String, RecordError> {
        let doc = self
            .store
            .get(RECORD_COLLECTION, id)?
            .ok_or_else(|| RecordError::Storage(format!("no record {id}")))?;
        let record = Record::from_doc(doc)?;
        let mut out = format!("original: {}\n", record.original_data);
        if !record.normalized_data.is_empty() {
            out.push_str(&format!("normalized: {}\n", record.normalized_data));
        }
        Ok(out)
    }

    /// The Solr document one record would produce, without posting it.
    pub async fn preview_record(&self, id: &str) -> Result<Value, RecordError> {
        let doc = self
            .store
            .get(RECORD_COLLECTION, id)?
            .ok_or_else(|| RecordError::Storage(format!("no record {id}")))?;
        let record = Record::from_doc(doc)?;
        let enrichers = self.enrichers();
        let updater = self.updater(&enrichers);
        let built = updater.build_record_doc(&record).await?;
        Ok(update::doc_to_json(&built, false))
    }

    /// Export records as line-delimited JSON payloads.
    pub fn export(&self, options: &ExportOptions) -> Result<u64, RecordError> {
        use std::io::Write;

        let mut filter = Vec::new();
        if let Some(source_id) = &options.source {
            filter.push(Filter::eq("source_id", source_id.as_str()));
        }
        if let Some(id) = &options.single_id {
            filter.push(Filter::eq("_id", id.as_str()));
        }
        if let Some(from) = options.from {
            filter.push(Filter::gte("updated", model::to_unix_millis(from)));
        }

        let store = self.store.as_ref();
        let mut records = Vec::new();
        store.iterate(
            RECORD_COLLECTION,
            &Filter::and(filter),
            &IterateOptions::default(),
            &mut |doc| {
                records.push(Record::from_doc(doc)?);
                Ok(IterateControl::Continue)
            },
        )?;

        if options.sort_dedup {
            records.sort_by(|a, b| {
                a.dedup_id
                    .cmp(&b.dedup_id)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        let mut file = std::fs::File::create(&options.file)?;
        let mut deleted_file = options
            .deleted_file
            .as_ref()
            .map(std::fs::File::create)
            .transpose()?;

        let mut exported = 0;
        for record in records.into_iter().skip(options.skip) {
            if record.deleted {
                if let Some(deleted_file) = deleted_file.as_mut() {
                    writeln!(deleted_file, "{}", record.id)?;
                }
                continue;
            }

            let mut payload: Value = serde_json::from_str(record.effective_data())
                .map_err(|err| RecordError::Parse(format!("{}: {err}", record.id)))?;
            if let Some(pointer) = &options.xpath {
                if payload.pointer(pointer).is_none() {
                    continue;
                }
            }
            let dedup_id = match options.add_dedup_id {
                AddDedupId::No => None,
                AddDedupId::Deduped => record.dedup_id.clone(),
                AddDedupId::Always => {
                    Some(record.dedup_id.clone().unwrap_or_else(|| record.id.clone()))
                }
            };
            if let (Some(dedup_id), Some(map)) = (dedup_id, payload.as_object_mut()) {
                map.insert("dedup_id".to_string(), Value::String(dedup_id));
            }
            writeln!(file, "{payload}")?;
            exported += 1;
        }
        info!(exported, file = %options.file, "export complete");
        Ok(exported)
    }

    /// List configured data sources matching a pattern, for the
    /// datasources command.
    pub fn search_datasources(&self, pattern: &regex::Regex) -> Vec<(&str, &DataSourceSettings)> {
        self.sources
            .iter()
            .filter(|(source_id, settings)| {
                pattern.is_match(source_id)
                    || pattern.is_match(&settings.url)
                    || pattern.is_match(&settings.format)
            })
            .map(|(source_id, settings)| (source_id.as_str(), settings))
            .collect()
    }

    /// Expose the dedup collection for inspection commands.
    pub fn group(&self, id: &str) -> Result<Option<DedupGroup>, RecordError> {
        match self.store.get(DEDUP_COLLECTION, id)? {
            Some(doc) => Ok(Some(DedupGroup::from_doc(doc)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_flag() {
        let cancellation = Cancellation::new();
        assert!(!cancellation.is_cancelled());
        cancellation.cancel();
        assert!(cancellation.is_cancelled());
        // Clones share the flag.
        let clone = cancellation.clone();
        assert!(clone.is_cancelled());
    }
}
