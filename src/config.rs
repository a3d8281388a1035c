//! Configuration for the record pipeline.
//!
//! Settings load with precedence: Env vars > Config file > Defaults.
//! Data sources live in their own file, one table per source.
//!
//! # Example config file (recman.toml)
//! ```toml
//! [site]
//! default_institution = "NatLib"
//!
//! [database]
//! path = "/var/lib/recman"
//!
//! [solr]
//! update_url = "http://localhost:8983/solr/biblio/update"
//! ```
//!
//! # Example data source (datasources.toml)
//! ```toml
//! [s1]
//! url = "https://example.org/oai"
//! format = "marc"
//! institution = "NatLib"
//! type = "oai-pmh"
//! dedup = true
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::drivers::is_supported_format;
use crate::error::RecordError;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub site: SiteSettings,
    pub database: DatabaseSettings,
    pub solr: SolrSettings,
    pub http: HttpSettings,
    pub enrichment: EnrichmentSettings,
}

impl Settings {
    /// Load settings from an optional TOML file layered under `RECMAN_*`
    /// environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self, RecordError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("RECMAN_").split("__"));
        figment
            .extract()
            .map_err(|err| RecordError::Config(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    /// Institution recorded on documents whose source does not set one.
    pub default_institution: String,
    /// Explode `building` values into `n/level/...` hierarchy entries.
    pub building_hierarchy: bool,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            default_institution: String::new(),
            building_hierarchy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Data directory for the persistent store.
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolrSettings {
    /// Update endpoint, e.g. `http://host:8983/solr/biblio/update`.
    pub update_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Flush the add buffer after this many documents.
    pub max_update_records: usize,
    /// Flush the add buffer when its JSON exceeds this many bytes.
    pub max_update_size: usize,
    /// Issue an explicit commit every this many delivered records.
    pub max_commit_interval: usize,
    pub timeout_secs: u64,
}

impl Default for SolrSettings {
    fn default() -> Self {
        Self {
            update_url: String::new(),
            username: None,
            password: None,
            max_update_records: 5000,
            max_update_size: 1024 * 1024,
            max_commit_interval: 50_000,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Retry budget for transient failures.
    pub max_tries: u32,
    /// Baseline wait between retries; doubles per attempt, capped at 30s.
    pub retry_wait_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: 10,
            max_tries: 5,
            retry_wait_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub enabled: bool,
    /// URI cache entries older than this are refetched.
    pub cache_expiration_secs: u64,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_expiration_secs: 7 * 24 * 3600,
        }
    }
}

/// Harvester type of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SourceType {
    #[default]
    #[serde(rename = "oai-pmh")]
    OaiPmh,
    #[serde(rename = "sierra")]
    Sierra,
    #[serde(rename = "sfx")]
    Sfx,
    #[serde(rename = "metalib")]
    Metalib,
    #[serde(rename = "metalib_export")]
    MetalibExport,
}

impl SourceType {
    /// Whether the server reports deletions itself; other types need
    /// full-set reconciliation.
    pub fn reports_deletions(self) -> bool {
        matches!(self, SourceType::OaiPmh | SourceType::Sierra)
    }

    /// Full-set sources are diffed against the store on every harvest.
    pub fn is_full_set(self) -> bool {
        matches!(self, SourceType::Metalib | SourceType::MetalibExport)
    }
}

/// How component parts are folded into their host's index document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComponentPartsPolicy {
    /// Index component parts as stand-alone documents.
    #[default]
    AsIs,
    /// Fold all component parts into the host document.
    MergeAll,
}

/// Deletion reconciliation mode for sources whose server does not report
/// deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMode {
    #[default]
    Disabled,
    /// Mark-and-sweep over a ListIdentifiers pass.
    ListIdentifiers,
    /// Timestamp-threshold sweep after a full reharvest.
    Reharvest,
}

/// Kind of a mapping file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MappingKind {
    #[default]
    Normal,
    Regexp,
    RegexpMulti,
}

/// One `(file, kind)` entry in a field's mapping chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFileRef {
    pub file: String,
    #[serde(default)]
    pub kind: MappingKind,
}

/// Per-source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceSettings {
    pub url: String,
    pub format: String,
    pub institution: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Record id prefix; defaults to the source id.
    pub id_prefix: Option<String>,
    pub dedup: bool,
    pub component_parts: ComponentPartsPolicy,
    /// Also index merged component parts as stand-alone documents.
    pub index_merged_parts: bool,
    /// Host fields never inherited by folded component parts.
    pub non_inherited_fields: Vec<String>,
    pub prepend_parent_title_with_unitid: bool,
    /// Keep hierarchy members missing from a re-ingest instead of
    /// tombstoning them.
    pub keep_missing_hierarchy_members: bool,
    pub deletions: DeletionMode,
    /// Minimum days between ListIdentifiers deletion sweeps.
    pub list_identifiers_interval_days: u32,
    /// Safety margin subtracted from harvest windows.
    pub harvest_safety_margin_secs: u64,
    /// OAI-PMH metadata prefix.
    pub metadata_prefix: String,
    /// Optional OAI-PMH set restriction.
    pub set: Option<String>,
    /// Named record splitter plugin.
    pub record_splitter: Option<String>,
    /// Named payload pre-transformation.
    pub pre_transformation: Option<String>,
    pub driver_params: BTreeMap<String, String>,
    /// Field name to mapping chain.
    pub field_mappings: BTreeMap<String, Vec<MappingFileRef>>,
}

impl Default for DataSourceSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            format: String::new(),
            institution: String::new(),
            source_type: SourceType::OaiPmh,
            id_prefix: None,
            dedup: false,
            component_parts: ComponentPartsPolicy::AsIs,
            index_merged_parts: false,
            non_inherited_fields: Vec::new(),
            prepend_parent_title_with_unitid: false,
            keep_missing_hierarchy_members: false,
            deletions: DeletionMode::Disabled,
            list_identifiers_interval_days: 7,
            harvest_safety_margin_secs: 60,
            metadata_prefix: "oai_dc".to_string(),
            set: None,
            record_splitter: None,
            pre_transformation: None,
            driver_params: BTreeMap::new(),
            field_mappings: BTreeMap::new(),
        }
    }
}

impl DataSourceSettings {
    /// The record id prefix for this source.
    pub fn prefix<'a>(&'a self, source_id: &'a str) -> &'a str {
        self.id_prefix.as_deref().unwrap_or(source_id)
    }
}

/// Load all data sources from a TOML file: one table per source id.
pub fn load_datasources(
    path: &str,
) -> Result<BTreeMap<String, DataSourceSettings>, RecordError> {
    if !std::path::Path::new(path).exists() {
        return Err(RecordError::Config(format!("missing data sources file {path}")));
    }
    let sources: BTreeMap<String, DataSourceSettings> = Figment::new()
        .merge(Toml::file(path))
        .extract()
        .map_err(|err| RecordError::Config(format!("{path}: {err}")))?;

    for (source_id, source) in &sources {
        if source.format.is_empty() {
            return Err(RecordError::Config(format!(
                "data source {source_id} has no format"
            )));
        }
        if !is_supported_format(&source.format) {
            return Err(RecordError::Config(format!(
                "data source {source_id} uses unknown format {}",
                source.format
            )));
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.http.max_tries, 5);
        assert_eq!(settings.solr.max_update_records, 5000);
        assert!(!settings.enrichment.enabled);
    }

    #[test]
    fn test_source_type_serde() {
        let json = serde_json::to_string(&SourceType::OaiPmh).unwrap();
        assert_eq!(json, "\"oai-pmh\"");
        let parsed: SourceType = serde_json::from_str("\"metalib_export\"").unwrap();
        assert_eq!(parsed, SourceType::MetalibExport);
    }

    #[test]
    fn test_source_type_capabilities() {
        assert!(SourceType::OaiPmh.reports_deletions());
        assert!(SourceType::Sierra.reports_deletions());
        assert!(!SourceType::Sfx.reports_deletions());
        assert!(SourceType::Metalib.is_full_set());
    }

    #[test]
    fn test_load_datasources() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[s1]
url = "https://example.org/oai"
format = "marc"
type = "oai-pmh"
dedup = true

[s1.field_mappings]
building = [{{ file = "building.map", kind = "normal" }}]

[s2]
format = "dc"
"#
        )?;

        let sources = load_datasources(file.path().to_str().unwrap())?;
        assert_eq!(sources.len(), 2);
        let s1 = &sources["s1"];
        assert!(s1.dedup);
        assert_eq!(s1.source_type, SourceType::OaiPmh);
        assert_eq!(s1.field_mappings["building"][0].kind, MappingKind::Normal);
        assert_eq!(s1.prefix("s1"), "s1");
        Ok(())
    }

    #[test]
    fn test_unknown_format_is_config_error() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[bad]\nformat = \"pdf\"")?;
        let err = load_datasources(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, RecordError::Config(_)));
        Ok(())
    }
}
