//! # Harvester
//!
//! Incremental fetching per data source with resumption and deletion
//! reconciliation. OAI-PMH and Sierra report deletions themselves; the
//! remaining source types are reconciled by full-set diffing or sweeps.
//!
//! State transitions per run: `IDLE → FETCHING → PAUSED(token) → FETCHING
//! → DONE | FAILED`. Failed runs advance no state, so the next run
//! reprocesses the same window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use rustc_hash::FxHashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{DataSourceSettings, DeletionMode, HttpSettings, SourceType};
use crate::error::RecordError;
use crate::ingest::soft_delete_record;
use crate::model::{last_deletion_key, last_harvest_date_key, to_unix_millis, Record};
use crate::store::{
    get_state, get_state_time, set_state, set_state_time, clear_state, Filter, FindOptions,
    IterateControl, IterateOptions, Store, RECORD_COLLECTION,
};
use crate::Cancellation;

/// Retry delays double from the configured baseline up to this cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// State key persisting an OAI resumption token (or a Sierra offset)
/// across runs.
pub fn resumption_token_key(source_id: &str) -> String {
    format!("Resumption Token {source_id}")
}

/// One record as yielded by a harvest driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRecord {
    pub oai_id: String,
    pub deleted: bool,
    pub payload: String,
}

/// Counters reported by a harvest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub records: u64,
    pub deleted: u64,
    pub pages: u64,
    /// Records tombstoned by deletion reconciliation.
    pub removed: u64,
}

/// Options for one harvest run, typically from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub resumption: Option<String>,
    /// Full reharvest with a deletion sweep; the inner value overrides the
    /// sweep threshold.
    pub reharvest: Option<Option<DateTime<Utc>>>,
}

/// Exponential backoff for transient HTTP failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(http: &HttpSettings) -> Self {
        Self {
            initial_delay: Duration::from_secs(http.retry_wait_secs),
            max_delay: BACKOFF_CAP,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self
            .initial_delay
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(self.max_delay);
        scaled.min(self.max_delay)
    }
}

/// Fetch a URL with the retry budget, treating 404 as an absent resource.
/// Other HTTP and transport failures back off and retry until the budget
/// runs out.
pub async fn fetch_optional(
    client: &reqwest::Client,
    url: reqwest::Url,
    http: &HttpSettings,
    cancellation: &Cancellation,
) -> Result<Option<String>, RecordError> {
    let policy = BackoffPolicy::from_settings(http);
    let mut last_error = String::new();

    for attempt in 0..http.max_tries {
        if cancellation.is_cancelled() {
            return Err(RecordError::Cancelled);
        }
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        }
        match client.get(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if status.is_success() {
                    return Ok(Some(response.text().await?));
                }
                last_error = format!("{url}: HTTP {status}");
                debug!(attempt, error = %last_error, "retrying fetch");
            }
            Err(err) => {
                last_error = format!("{url}: {err}");
                debug!(attempt, error = %last_error, "retrying fetch");
            }
        }
    }

    Err(RecordError::TransientNetwork {
        attempts: http.max_tries,
        message: last_error,
    })
}

/// Fetch a URL that must exist; 404 is a non-retryable failure.
pub async fn fetch_with_retry(
    client: &reqwest::Client,
    url: reqwest::Url,
    http: &HttpSettings,
    cancellation: &Cancellation,
) -> Result<String, RecordError> {
    let message = format!("{url}: 404 Not Found");
    match fetch_optional(client, url, http, cancellation).await? {
        Some(body) => Ok(body),
        None => Err(RecordError::TransientNetwork {
            attempts: 1,
            message,
        }),
    }
}

/// A parsed OAI-PMH response page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OaiPage {
    pub records: Vec<HarvestRecord>,
    pub identifiers: Vec<String>,
    pub resumption_token: Option<String>,
    pub error: Option<(String, String)>,
}

/// Parse an OAI-PMH envelope (ListRecords or ListIdentifiers). The record
/// payload is the text content of `metadata`.
pub fn parse_oai_page(xml: &str) -> Result<OaiPage, RecordError> {
    #[derive(PartialEq)]
    enum Capture {
        None,
        Identifier,
        Metadata,
        Token,
        Error,
    }

    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut page = OaiPage::default();
    let mut capture = Capture::None;
    let mut in_record = false;
    let mut in_header = false;
    let mut identifier = String::new();
    let mut metadata = String::new();
    let mut deleted = false;
    let mut error_code = String::new();
    let mut error_text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match local_name(e.name().as_ref()) {
                    b"record" => {
                        in_record = true;
                        identifier.clear();
                        metadata.clear();
                        deleted = false;
                    }
                    b"header" => {
                        in_header = true;
                        if !in_record {
                            identifier.clear();
                            deleted = false;
                        }
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"status"
                                && attr.unescape_value().map(|v| v == "deleted").unwrap_or(false)
                            {
                                deleted = true;
                            }
                        }
                    }
                    b"identifier" if in_header => capture = Capture::Identifier,
                    b"metadata" if in_record => capture = Capture::Metadata,
                    b"resumptionToken" => capture = Capture::Token,
                    b"error" => {
                        capture = Capture::Error;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"code" {
                                if let Ok(value) = attr.unescape_value() {
                                    error_code = value.to_string();
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| RecordError::Parse(format!("bad envelope text: {err}")))?;
                match capture {
                    Capture::Identifier => identifier.push_str(&text),
                    Capture::Metadata => metadata.push_str(&text),
                    Capture::Token => {
                        let token = text.trim();
                        if !token.is_empty() {
                            page.resumption_token = Some(token.to_string());
                        }
                    }
                    Capture::Error => error_text.push_str(&text),
                    Capture::None => {}
                }
            }
            Ok(Event::CData(ref e)) => {
                if capture == Capture::Metadata {
                    metadata.push_str(&String::from_utf8_lossy(e));
                }
            }
            Ok(Event::End(ref e)) => match local_name(e.name().as_ref()) {
                b"record" => {
                    in_record = false;
                    page.records.push(HarvestRecord {
                        oai_id: identifier.trim().to_string(),
                        deleted,
                        payload: metadata.trim().to_string(),
                    });
                }
                b"header" => {
                    in_header = false;
                    if !in_record && !identifier.trim().is_empty() {
                        // Bare headers come from ListIdentifiers.
                        page.identifiers.push(identifier.trim().to_string());
                        identifier.clear();
                    }
                    capture = Capture::None;
                }
                b"identifier" | b"metadata" | b"resumptionToken" => capture = Capture::None,
                b"error" => {
                    page.error = Some((error_code.clone(), error_text.trim().to_string()));
                    capture = Capture::None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(RecordError::Parse(format!("malformed OAI envelope: {err}")))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(page)
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

fn format_oai_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Ingestion callback fed by the harvester: `(oai_id, deleted, payload)`.
pub type HarvestSink<'s> = dyn FnMut(&str, bool, &str) -> Result<u64, RecordError> + 's;

/// One harvester instance per source and run.
pub struct Harvester<'a> {
    store: &'a dyn Store,
    client: &'a reqwest::Client,
    source_id: String,
    settings: &'a DataSourceSettings,
    http: &'a HttpSettings,
    cancellation: Cancellation,
}

impl<'a> Harvester<'a> {
    pub fn new(
        store: &'a dyn Store,
        client: &'a reqwest::Client,
        source_id: &str,
        settings: &'a DataSourceSettings,
        http: &'a HttpSettings,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            store,
            client,
            source_id: source_id.to_string(),
            settings,
            http,
            cancellation,
        }
    }

    /// Run one harvest. State only advances on clean completion.
    pub async fn harvest(
        &self,
        options: &HarvestOptions,
        sink: &mut HarvestSink<'_>,
    ) -> Result<HarvestStats, RecordError> {
        match self.settings.source_type {
            SourceType::OaiPmh | SourceType::Sfx => self.harvest_oai(options, sink).await,
            SourceType::Sierra => self.harvest_sierra(options, sink).await,
            SourceType::Metalib | SourceType::MetalibExport => {
                self.harvest_full_set(sink).await
            }
        }
    }

    fn window(
        &self,
        options: &HarvestOptions,
    ) -> Result<(Option<DateTime<Utc>>, DateTime<Utc>), RecordError> {
        let margin = ChronoDuration::seconds(self.settings.harvest_safety_margin_secs as i64);
        let from = if options.reharvest.is_some() {
            None
        } else {
            match options.from {
                Some(from) => Some(from),
                None => get_state_time(self.store, &last_harvest_date_key(&self.source_id))?
                    .map(|ts| ts - margin),
            }
        };
        let until = options.until.unwrap_or_else(|| self.store.now() - margin);
        Ok((from, until))
    }

    async fn harvest_oai(
        &self,
        options: &HarvestOptions,
        sink: &mut HarvestSink<'_>,
    ) -> Result<HarvestStats, RecordError> {
        let (from, until) = self.window(options)?;
        // Captured before fetching: the reharvest sweep tombstones
        // everything not touched after this point.
        let sweep_threshold = options
            .reharvest
            .map(|explicit| explicit.unwrap_or_else(|| self.store.now()));

        let token_key = resumption_token_key(&self.source_id);
        let mut token = match &options.resumption {
            Some(token) => Some(token.clone()),
            None => get_state(self.store, &token_key)?,
        };

        let mut stats = HarvestStats::default();
        info!(
            source = %self.source_id,
            from = from.map(format_oai_time).unwrap_or_default(),
            until = %format_oai_time(until),
            resumed = token.is_some(),
            "harvest starting"
        );

        loop {
            let url = self.build_oai_url(&token, from, until, "ListRecords")?;
            let body = fetch_with_retry(self.client, url, self.http, &self.cancellation).await?;
            let page = parse_oai_page(&body)?;
            stats.pages += 1;

            if let Some((code, message)) = &page.error {
                if code == "noRecordsMatch" {
                    break;
                }
                if code == "badResumptionToken" {
                    // Expired tokens are reported, never retried; the
                    // operator restarts without one.
                    clear_state(self.store, &token_key)?;
                    return Err(RecordError::Parse(format!(
                        "resumption token rejected: {message}"
                    )));
                }
                return Err(RecordError::Parse(format!("OAI error {code}: {message}")));
            }

            for record in &page.records {
                if self.cancellation.is_cancelled() {
                    // The in-flight record is done; persist the token so
                    // the next run resumes here.
                    if let Some(token) = &token {
                        set_state(self.store, &token_key, token)?;
                    }
                    return Err(RecordError::Cancelled);
                }
                match sink(&record.oai_id, record.deleted, &record.payload) {
                    Ok(_) => {
                        stats.records += 1;
                        if record.deleted {
                            stats.deleted += 1;
                        }
                    }
                    Err(RecordError::Cancelled) => return Err(RecordError::Cancelled),
                    Err(err) => {
                        warn!(oai_id = %record.oai_id, error = %err, "record skipped");
                    }
                }
            }

            match page.resumption_token {
                Some(next) => {
                    set_state(self.store, &token_key, &next)?;
                    token = Some(next);
                }
                None => break,
            }
        }

        clear_state(self.store, &token_key)?;
        set_state_time(self.store, &last_harvest_date_key(&self.source_id), until)?;

        if let Some(threshold) = sweep_threshold {
            stats.removed = self.reharvest_sweep(threshold, stats.records)?;
        } else if self.settings.deletions == DeletionMode::ListIdentifiers {
            stats.removed = self.list_identifiers_sweep().await?;
        }

        info!(
            source = %self.source_id,
            records = stats.records,
            deleted = stats.deleted,
            removed = stats.removed,
            "harvest complete"
        );
        Ok(stats)
    }

    fn build_oai_url(
        &self,
        token: &Option<String>,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        verb: &str,
    ) -> Result<reqwest::Url, RecordError> {
        let mut params: Vec<(String, String)> = vec![("verb".to_string(), verb.to_string())];
        if let Some(token) = token {
            params.push(("resumptionToken".to_string(), token.clone()));
        } else {
            params.push((
                "metadataPrefix".to_string(),
                self.settings.metadata_prefix.clone(),
            ));
            if let Some(set) = &self.settings.set {
                params.push(("set".to_string(), set.clone()));
            }
            if let Some(from) = from {
                params.push(("from".to_string(), format_oai_time(from)));
            }
            params.push(("until".to_string(), format_oai_time(until)));
        }
        reqwest::Url::parse_with_params(&self.settings.url, params)
            .map_err(|err| RecordError::Config(format!("bad harvest url: {err}")))
    }

    /// Sierra REST paging: offset-windowed JSON entries carrying their own
    /// deleted flags. The offset doubles as the resumption token.
    async fn harvest_sierra(
        &self,
        options: &HarvestOptions,
        sink: &mut HarvestSink<'_>,
    ) -> Result<HarvestStats, RecordError> {
        let (from, until) = self.window(options)?;
        let token_key = resumption_token_key(&self.source_id);
        let mut offset: u64 = match &options.resumption {
            Some(token) => token.parse().unwrap_or(0),
            None => get_state(self.store, &token_key)?
                .and_then(|token| token.parse().ok())
                .unwrap_or(0),
        };
        let limit: u64 = 500;
        let mut stats = HarvestStats::default();

        loop {
            let mut params: Vec<(String, String)> = vec![
                ("offset".to_string(), offset.to_string()),
                ("limit".to_string(), limit.to_string()),
            ];
            let range = match from {
                Some(from) => format!(
                    "[{},{}]",
                    format_oai_time(from),
                    format_oai_time(until)
                ),
                None => format!("[,{}]", format_oai_time(until)),
            };
            params.push(("updatedDate".to_string(), range));

            let url = reqwest::Url::parse_with_params(&self.settings.url, params)
                .map_err(|err| RecordError::Config(format!("bad harvest url: {err}")))?;
            let body = fetch_with_retry(self.client, url, self.http, &self.cancellation).await?;
            let response: serde_json::Value = serde_json::from_str(&body)
                .map_err(|err| RecordError::Parse(format!("bad Sierra response: {err}")))?;
            let entries = response
                .get("entries")
                .and_then(serde_json::Value::as_array)
                .cloned()
                .unwrap_or_default();
            stats.pages += 1;

            if entries.is_empty() {
                break;
            }

            for entry in &entries {
                if self.cancellation.is_cancelled() {
                    set_state(self.store, &token_key, &offset.to_string())?;
                    return Err(RecordError::Cancelled);
                }
                let oai_id = entry
                    .get("id")
                    .map(|id| match id {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                let deleted = entry
                    .get("deleted")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                let payload = serde_json::to_string(entry)?;
                match sink(&oai_id, deleted, &payload) {
                    Ok(_) => {
                        stats.records += 1;
                        if deleted {
                            stats.deleted += 1;
                        }
                    }
                    Err(RecordError::Cancelled) => return Err(RecordError::Cancelled),
                    Err(err) => warn!(oai_id = %oai_id, error = %err, "record skipped"),
                }
                offset += 1;
            }
            set_state(self.store, &token_key, &offset.to_string())?;

            if (entries.len() as u64) < limit {
                break;
            }
        }

        clear_state(self.store, &token_key)?;
        set_state_time(self.store, &last_harvest_date_key(&self.source_id), until)?;
        info!(source = %self.source_id, records = stats.records, "harvest complete");
        Ok(stats)
    }

    /// Full-set sources: fetch everything, diff against the store. New and
    /// changed records go through ingestion; records missing from the set
    /// are tombstoned.
    async fn harvest_full_set(
        &self,
        sink: &mut HarvestSink<'_>,
    ) -> Result<HarvestStats, RecordError> {
        let body = match self.settings.source_type {
            SourceType::MetalibExport => std::fs::read_to_string(&self.settings.url)?,
            _ => {
                let url = reqwest::Url::parse(&self.settings.url)
                    .map_err(|err| RecordError::Config(format!("bad harvest url: {err}")))?;
                fetch_with_retry(self.client, url, self.http, &self.cancellation).await?
            }
        };

        let payloads: Vec<serde_json::Value> = serde_json::from_str(&body)
            .map_err(|err| RecordError::Parse(format!("bad full-set payload: {err}")))?;

        let mut stats = HarvestStats::default();
        stats.pages = 1;
        let mut harvested: FxHashSet<String> = FxHashSet::default();
        let prefix = self.settings.prefix(&self.source_id);

        for payload in &payloads {
            if self.cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            let local_id = payload
                .get("id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            if local_id.is_empty() {
                warn!(source = %self.source_id, "full-set entry without id skipped");
                continue;
            }
            harvested.insert(crate::model::build_record_id(prefix, &local_id));

            let payload_text = serde_json::to_string(payload)?;
            let unchanged = match self
                .store
                .get(RECORD_COLLECTION, &crate::model::build_record_id(prefix, &local_id))?
            {
                Some(doc) => {
                    let record = Record::from_doc(doc)?;
                    // Serialized-equality check against what ingestion
                    // would store.
                    !record.deleted
                        && crate::drivers::create_driver(
                            &self.settings.format,
                            &payload_text,
                            "",
                            &self.source_id,
                        )?
                        .serialize()?
                            == record.original_data
                }
                None => false,
            };
            if unchanged {
                continue;
            }
            match sink("", false, &payload_text) {
                Ok(_) => stats.records += 1,
                Err(RecordError::Cancelled) => return Err(RecordError::Cancelled),
                Err(err) => warn!(source = %self.source_id, error = %err, "record skipped"),
            }
        }

        // Anything the set no longer contains is gone upstream.
        let filter = Filter::and([
            Filter::eq("source_id", self.source_id.as_str()),
            Filter::eq("deleted", false),
        ]);
        let store = self.store;
        let mut to_remove = Vec::new();
        store.iterate(
            RECORD_COLLECTION,
            &filter,
            &IterateOptions::default(),
            &mut |doc| {
                let record = Record::from_doc(doc)?;
                if !harvested.contains(&record.id) {
                    to_remove.push(record);
                }
                Ok(IterateControl::Continue)
            },
        )?;
        for mut record in to_remove {
            soft_delete_record(store, &mut record)?;
            stats.removed += 1;
        }

        set_state_time(
            self.store,
            &last_harvest_date_key(&self.source_id),
            self.store.now(),
        )?;
        info!(
            source = %self.source_id,
            records = stats.records,
            removed = stats.removed,
            "full-set harvest complete"
        );
        Ok(stats)
    }

    /// Full-reharvest deletion sweep: everything of this source not
    /// touched since the threshold is gone upstream. A zero-record harvest
    /// is treated as a likely upstream error and the sweep is skipped.
    fn reharvest_sweep(
        &self,
        threshold: DateTime<Utc>,
        harvested_records: u64,
    ) -> Result<u64, RecordError> {
        if harvested_records == 0 {
            warn!(
                source = %self.source_id,
                "reharvest returned no records, skipping deletion sweep"
            );
            return Ok(0);
        }
        let filter = Filter::and([
            Filter::eq("source_id", self.source_id.as_str()),
            Filter::eq("deleted", false),
            Filter::lt("updated", to_unix_millis(threshold)),
        ]);
        let docs = self
            .store
            .find(RECORD_COLLECTION, &filter, &FindOptions::default())?;
        let mut removed = 0;
        for doc in docs {
            let mut record = Record::from_doc(doc)?;
            soft_delete_record(self.store, &mut record)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// ListIdentifiers mark-and-sweep, gated by the configured minimum
    /// interval.
    async fn list_identifiers_sweep(&self) -> Result<u64, RecordError> {
        let state_key = last_deletion_key(&self.source_id);
        let interval = ChronoDuration::days(self.settings.list_identifiers_interval_days as i64);
        if let Some(last) = get_state_time(self.store, &state_key)? {
            if self.store.now() - last < interval {
                debug!(source = %self.source_id, "deletion sweep not due yet");
                return Ok(0);
            }
        }

        clear_deletion_marks(self.store, &self.source_id)?;

        let mut token: Option<String> = None;
        loop {
            let url = self.build_oai_url(&token, None, self.store.now(), "ListIdentifiers")?;
            let body = fetch_with_retry(self.client, url, self.http, &self.cancellation).await?;
            let page = parse_oai_page(&body)?;
            if let Some((code, message)) = &page.error {
                if code == "noRecordsMatch" {
                    break;
                }
                return Err(RecordError::Parse(format!("OAI error {code}: {message}")));
            }
            mark_identifiers(self.store, &self.source_id, &page.identifiers)?;
            match page.resumption_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let removed = sweep_unmarked(self.store, &self.source_id)?;
        set_state_time(self.store, &state_key, self.store.now())?;
        Ok(removed)
    }
}

/// Pre-pass of the ListIdentifiers sweep: clear the mark on all live
/// records of the source.
pub fn clear_deletion_marks(store: &dyn Store, source_id: &str) -> Result<u64, RecordError> {
    store.update_many(
        RECORD_COLLECTION,
        &Filter::and([
            Filter::eq("source_id", source_id),
            Filter::eq("deleted", false),
        ]),
        serde_json::json!({ "mark": false }),
        &[],
    )
}

/// Mark every record matching one of the listed identifiers as still
/// present upstream.
pub fn mark_identifiers(
    store: &dyn Store,
    source_id: &str,
    identifiers: &[String],
) -> Result<u64, RecordError> {
    let mut marked = 0;
    for oai_id in identifiers {
        marked += store.update_many(
            RECORD_COLLECTION,
            &Filter::and([
                Filter::eq("source_id", source_id),
                Filter::eq("oai_id", oai_id.as_str()),
            ]),
            serde_json::json!({ "mark": true }),
            &[],
        )?;
    }
    Ok(marked)
}

/// Final pass of the ListIdentifiers sweep: live but unmarked records were
/// not listed upstream and are tombstoned.
pub fn sweep_unmarked(store: &dyn Store, source_id: &str) -> Result<u64, RecordError> {
    let filter = Filter::and([
        Filter::eq("source_id", source_id),
        Filter::eq("deleted", false),
        Filter::eq("mark", false),
    ]);
    let docs = store.find(RECORD_COLLECTION, &filter, &FindOptions::default())?;
    let mut removed = 0;
    for doc in docs {
        let mut record = Record::from_doc(doc)?;
        soft_delete_record(store, &mut record)?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_records_page() {
        let xml = r#"<?xml version="1.0"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListRecords>
    <record>
      <header><identifier>oai:example:1</identifier><datestamp>2024-01-01</datestamp></header>
      <metadata>{"id": "1", "title": "First"}</metadata>
    </record>
    <record>
      <header status="deleted"><identifier>oai:example:2</identifier></header>
    </record>
    <resumptionToken>token-123</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;
        let page = parse_oai_page(xml).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].oai_id, "oai:example:1");
        assert!(!page.records[0].deleted);
        assert!(page.records[0].payload.contains("First"));
        assert!(page.records[1].deleted);
        assert!(page.records[1].payload.is_empty());
        assert_eq!(page.resumption_token.as_deref(), Some("token-123"));
    }

    #[test]
    fn test_parse_list_identifiers_page() {
        let xml = r#"<OAI-PMH>
  <ListIdentifiers>
    <header><identifier>oai:x</identifier></header>
    <header><identifier>oai:y</identifier></header>
  </ListIdentifiers>
</OAI-PMH>"#;
        let page = parse_oai_page(xml).unwrap();
        assert_eq!(page.identifiers, vec!["oai:x", "oai:y"]);
        assert!(page.records.is_empty());
        assert!(page.resumption_token.is_none());
    }

    #[test]
    fn test_parse_error_page() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nothing here</error></OAI-PMH>"#;
        let page = parse_oai_page(xml).unwrap();
        let (code, message) = page.error.unwrap();
        assert_eq!(code, "noRecordsMatch");
        assert_eq!(message, "nothing here");
    }

    #[test]
    fn test_parse_cdata_payload() {
        let xml = r#"<OAI-PMH><ListRecords><record>
            <header><identifier>oai:1</identifier></header>
            <metadata><![CDATA[{"id": "1"}]]></metadata>
        </record></ListRecords></OAI-PMH>"#;
        let page = parse_oai_page(xml).unwrap();
        assert_eq!(page.records[0].payload, r#"{"id": "1"}"#);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_format_oai_time() {
        let ts = crate::model::from_unix_millis(0);
        assert_eq!(format_oai_time(ts), "1970-01-01T00:00:00Z");
    }
}
