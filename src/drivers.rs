//! # Record Drivers
//!
//! Format-specific extraction of identity, dedup features and index fields.
//! Drivers are a closed set chosen by the `format` string; the factory
//! fails loudly on anything else.
//!
//! Payloads are fielded JSON objects (`{"title": ["..."], "isbn": [...]}`)
//! produced by the upstream parsing layer; a value may be a single string
//! or an ordered array of strings.

use std::collections::BTreeMap;

use crate::error::RecordError;
use crate::keys::{normalize_isbn, normalize_text};

/// A Solr document under construction: field name to ordered values.
/// Single-valued fields carry exactly one entry.
pub type SolrDoc = BTreeMap<String, Vec<String>>;

/// Format-specific view over one metadata payload. All operations are pure
/// over the parsed payload; `normalize` is the only mutation.
pub trait RecordDriver: Send {
    /// Local identifier, possibly empty when only the harvester knows one.
    fn id(&self) -> String;

    /// Canonical payload for storage.
    fn serialize(&self) -> Result<String, RecordError>;

    /// In-place cleanup per format rules.
    fn normalize(&mut self);

    /// Empty unless this record is a component part of the returned host.
    fn get_host_record_id(&self) -> String;

    /// Identifier other records use to reference this one.
    fn get_linking_id(&self) -> String;

    fn get_title(&self, for_filing: bool) -> String;

    fn get_main_author(&self) -> String;

    fn get_isbns(&self) -> Vec<String>;

    fn get_issns(&self) -> Vec<String>;

    /// Additional standard identifiers usable as blocking keys. Most
    /// formats have none.
    fn get_unique_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_format(&self) -> String;

    fn get_publication_year(&self) -> Option<i32>;

    fn get_page_count(&self) -> Option<u32>;

    fn get_series_issn(&self) -> String;

    fn get_series_numbering(&self) -> String;

    /// Keyed document fields for indexing.
    fn to_solr_array(&self) -> SolrDoc;

    /// Fold component part documents into this host's document. Returns
    /// the number of parts merged.
    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize;
}

/// Construct the driver for a format. Unknown formats are a hard error for
/// the record in question.
pub fn create_driver(
    format: &str,
    data: &str,
    oai_id: &str,
    source_id: &str,
) -> Result<Box<dyn RecordDriver>, RecordError> {
    let fields = FieldedData::parse(data, oai_id, source_id)?;
    Ok(match format {
        "marc" => Box::new(MarcDriver { fields }),
        "dc" => Box::new(DcDriver { fields }),
        "ese" => Box::new(EseDriver { fields }),
        "lido" => Box::new(LidoDriver { fields }),
        "forward" => Box::new(ForwardDriver { fields }),
        other => return Err(RecordError::UnsupportedFormat(other.to_string())),
    })
}

/// True when a format string names a known driver.
pub fn is_supported_format(format: &str) -> bool {
    matches!(format, "marc" | "dc" | "ese" | "lido" | "forward")
}

/// Shared parsed payload the concrete drivers delegate to.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldedData {
    fields: BTreeMap<String, Vec<String>>,
}

impl FieldedData {
    fn parse(data: &str, _oai_id: &str, _source_id: &str) -> Result<Self, RecordError> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| RecordError::Parse(format!("payload is not valid JSON: {err}")))?;
        let serde_json::Value::Object(map) = value else {
            return Err(RecordError::Parse("payload is not a JSON object".to_string()));
        };

        let mut fields = BTreeMap::new();
        for (key, value) in map {
            let values = match value {
                serde_json::Value::String(s) => vec![s],
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
                serde_json::Value::Number(n) => vec![n.to_string()],
                serde_json::Value::Bool(b) => vec![b.to_string()],
                serde_json::Value::Null => Vec::new(),
                other => {
                    return Err(RecordError::Parse(format!(
                        "field {key} has unsupported value {other}"
                    )))
                }
            };
            fields.insert(key, values);
        }

        Ok(Self { fields })
    }

    fn first(&self, field: &str) -> &str {
        self.fields
            .get(field)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    fn all(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    fn serialize(&self) -> Result<String, RecordError> {
        // Deterministic output: BTreeMap ordering plus single-element
        // arrays collapsed, so equality against the original is meaningful.
        let mut map = serde_json::Map::new();
        for (key, values) in &self.fields {
            let value = if values.len() == 1 {
                serde_json::Value::String(values[0].clone())
            } else {
                serde_json::Value::Array(
                    values
                        .iter()
                        .map(|v| serde_json::Value::String(v.clone()))
                        .collect(),
                )
            };
            map.insert(key.clone(), value);
        }
        Ok(serde_json::to_string(&serde_json::Value::Object(map))?)
    }

    /// Common cleanup: trim values, collapse internal whitespace runs and
    /// drop fields that end up empty.
    fn normalize(&mut self) {
        for values in self.fields.values_mut() {
            for value in values.iter_mut() {
                let collapsed: String = value.split_whitespace().collect::<Vec<_>>().join(" ");
                *value = collapsed;
            }
            values.retain(|value| !value.is_empty());
        }
        self.fields.retain(|_, values| !values.is_empty());
    }

    fn id(&self) -> String {
        self.first("id").to_string()
    }

    fn get_host_record_id(&self) -> String {
        self.first("host_record_id").to_string()
    }

    fn get_linking_id(&self) -> String {
        let linking = self.first("linking_id");
        if linking.is_empty() {
            self.id()
        } else {
            linking.to_string()
        }
    }

    fn title(&self) -> String {
        self.first("title").to_string()
    }

    fn filing_title(&self, articles: &[&str]) -> String {
        let title = self.title();
        let lowered = title.to_lowercase();
        for article in articles {
            if lowered.starts_with(article) {
                return title[article.len()..].trim_start().to_string();
            }
        }
        title
    }

    fn isbns(&self) -> Vec<String> {
        let mut isbns: Vec<String> = self
            .all("isbn")
            .iter()
            .filter_map(|raw| normalize_isbn(raw))
            .collect();
        dedup_preserving_order(&mut isbns);
        isbns
    }

    fn issns(&self) -> Vec<String> {
        self.all("issn")
            .iter()
            .map(|raw| raw.trim().to_uppercase())
            .filter(|issn| !issn.is_empty())
            .collect()
    }

    fn publication_year(&self, field: &str) -> Option<i32> {
        first_number_of_width(self.first(field), 4).and_then(|year| i32::try_from(year).ok())
    }

    fn page_count(&self) -> Option<u32> {
        first_integer(self.first("pages")).and_then(|pages| u32::try_from(pages).ok())
    }

    fn base_solr_doc(&self, format: String) -> SolrDoc {
        let mut doc = SolrDoc::new();
        push_one(&mut doc, "title", self.title());
        push_one(
            &mut doc,
            "title_short",
            self.title().split(':').next().unwrap_or("").trim().to_string(),
        );
        push_one(&mut doc, "title_full", self.title());
        push_one(&mut doc, "author", self.first("author").to_string());
        push_all(&mut doc, "author2", self.all("author2"));
        push_one(&mut doc, "format", format);
        push_all(&mut doc, "isbn", &self.isbns());
        push_all(&mut doc, "issn", &self.issns());
        push_one(&mut doc, "publisher", self.first("publisher").to_string());
        push_all(&mut doc, "language", self.all("language"));
        push_all(&mut doc, "series", self.all("series"));
        push_all(&mut doc, "topic", self.all("topic"));
        push_all(&mut doc, "building", self.all("building"));
        push_one(&mut doc, "unit_id", self.first("unit_id").to_string());

        let mut allfields = Vec::new();
        for values in self.fields.values() {
            allfields.extend(values.iter().cloned());
        }
        push_one(&mut doc, "allfields", allfields.join(" "));
        doc
    }

    /// Default component folding: component titles become `contents`
    /// entries on the host, their authors and topics are inherited.
    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize {
        for component in components {
            if let Some(titles) = component.get("title") {
                doc.entry("contents".to_string())
                    .or_default()
                    .extend(titles.iter().cloned());
            }
            for field in ["author", "author2"] {
                if let Some(values) = component.get(field) {
                    doc.entry("author2".to_string())
                        .or_default()
                        .extend(values.iter().cloned());
                }
            }
            if let Some(values) = component.get("topic") {
                doc.entry("topic".to_string())
                    .or_default()
                    .extend(values.iter().cloned());
            }
        }
        for values in doc.values_mut() {
            dedup_preserving_order(values);
        }
        components.len()
    }
}

fn push_one(doc: &mut SolrDoc, field: &str, value: String) {
    if !value.is_empty() {
        doc.insert(field.to_string(), vec![value]);
    }
}

fn push_all(doc: &mut SolrDoc, field: &str, values: &[String]) {
    let values: Vec<String> = values.iter().filter(|v| !v.is_empty()).cloned().collect();
    if !values.is_empty() {
        doc.insert(field.to_string(), values);
    }
}

fn dedup_preserving_order(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|value| seen.insert(value.clone()));
}

fn first_number_of_width(text: &str, width: usize) -> Option<u64> {
    let bytes = text.as_bytes();
    let mut start = None;
    for (pos, byte) in bytes.iter().enumerate() {
        if byte.is_ascii_digit() {
            if start.is_none() {
                start = Some(pos);
            }
        } else if let Some(from) = start.take() {
            if pos - from == width {
                return text[from..pos].parse().ok();
            }
        }
    }
    if let Some(from) = start {
        if bytes.len() - from == width {
            return text[from..].parse().ok();
        }
    }
    None
}

fn first_integer(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

const ENGLISH_ARTICLES: &[&str] = &["the ", "an ", "a "];
const MARC_ARTICLES: &[&str] = &[
    "the ", "an ", "a ", "der ", "die ", "das ", "le ", "la ", "les ", "el ",
];

/// MARC bibliographic records. Titles carry ISBD punctuation which
/// normalization strips.
pub struct MarcDriver {
    fields: FieldedData,
}

impl RecordDriver for MarcDriver {
    fn id(&self) -> String {
        self.fields.id()
    }

    fn serialize(&self) -> Result<String, RecordError> {
        self.fields.serialize()
    }

    fn normalize(&mut self) {
        self.fields.normalize();
        for field in ["title", "title_remainder", "publisher"] {
            if let Some(values) = self.fields.fields.get_mut(field) {
                for value in values.iter_mut() {
                    *value = strip_isbd_punctuation(value);
                }
            }
        }
        if let Some(values) = self.fields.fields.get_mut("isbn") {
            for value in values.iter_mut() {
                if let Some(normalized) = normalize_isbn(value) {
                    *value = normalized;
                }
            }
        }
    }

    fn get_host_record_id(&self) -> String {
        self.fields.get_host_record_id()
    }

    fn get_linking_id(&self) -> String {
        self.fields.get_linking_id()
    }

    fn get_title(&self, for_filing: bool) -> String {
        if for_filing {
            self.fields.filing_title(MARC_ARTICLES)
        } else {
            self.fields.title()
        }
    }

    fn get_main_author(&self) -> String {
        self.fields.first("author").to_string()
    }

    fn get_isbns(&self) -> Vec<String> {
        self.fields.isbns()
    }

    fn get_issns(&self) -> Vec<String> {
        self.fields.issns()
    }

    fn get_unique_ids(&self) -> Vec<String> {
        self.fields
            .all("identifier")
            .iter()
            .map(|raw| normalize_text(raw))
            .filter(|id| !id.is_empty())
            .collect()
    }

    fn get_format(&self) -> String {
        let format = self.fields.first("format");
        if format.is_empty() {
            "Book".to_string()
        } else {
            format.to_string()
        }
    }

    fn get_publication_year(&self) -> Option<i32> {
        self.fields.publication_year("date")
    }

    fn get_page_count(&self) -> Option<u32> {
        self.fields.page_count()
    }

    fn get_series_issn(&self) -> String {
        self.fields.first("series_issn").to_string()
    }

    fn get_series_numbering(&self) -> String {
        self.fields.first("series_numbering").to_string()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = self.fields.base_solr_doc(self.get_format());
        push_one(
            &mut doc,
            "title_sort",
            normalize_text(&self.get_title(true)),
        );
        if let Some(year) = self.get_publication_year() {
            push_one(&mut doc, "publish_date", year.to_string());
        }
        doc
    }

    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize {
        self.fields.merge_component_parts(components, doc)
    }
}

/// Dublin Core records.
pub struct DcDriver {
    fields: FieldedData,
}

impl RecordDriver for DcDriver {
    fn id(&self) -> String {
        self.fields.id()
    }

    fn serialize(&self) -> Result<String, RecordError> {
        self.fields.serialize()
    }

    fn normalize(&mut self) {
        self.fields.normalize();
    }

    fn get_host_record_id(&self) -> String {
        self.fields.get_host_record_id()
    }

    fn get_linking_id(&self) -> String {
        self.fields.get_linking_id()
    }

    fn get_title(&self, for_filing: bool) -> String {
        if for_filing {
            self.fields.filing_title(ENGLISH_ARTICLES)
        } else {
            self.fields.title()
        }
    }

    fn get_main_author(&self) -> String {
        self.fields.first("author").to_string()
    }

    fn get_isbns(&self) -> Vec<String> {
        self.fields.isbns()
    }

    fn get_issns(&self) -> Vec<String> {
        self.fields.issns()
    }

    fn get_format(&self) -> String {
        let format = self.fields.first("format");
        if format.is_empty() {
            "Unknown".to_string()
        } else {
            format.to_string()
        }
    }

    fn get_publication_year(&self) -> Option<i32> {
        self.fields.publication_year("date")
    }

    fn get_page_count(&self) -> Option<u32> {
        self.fields.page_count()
    }

    fn get_series_issn(&self) -> String {
        self.fields.first("series_issn").to_string()
    }

    fn get_series_numbering(&self) -> String {
        self.fields.first("series_numbering").to_string()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = self.fields.base_solr_doc(self.get_format());
        push_one(
            &mut doc,
            "title_sort",
            normalize_text(&self.get_title(true)),
        );
        if let Some(year) = self.get_publication_year() {
            push_one(&mut doc, "publish_date", year.to_string());
        }
        doc
    }

    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize {
        self.fields.merge_component_parts(components, doc)
    }
}

/// Europeana Semantic Elements records; Dublin Core shaped with the
/// publication year usually under `created`.
pub struct EseDriver {
    fields: FieldedData,
}

impl RecordDriver for EseDriver {
    fn id(&self) -> String {
        self.fields.id()
    }

    fn serialize(&self) -> Result<String, RecordError> {
        self.fields.serialize()
    }

    fn normalize(&mut self) {
        self.fields.normalize();
    }

    fn get_host_record_id(&self) -> String {
        self.fields.get_host_record_id()
    }

    fn get_linking_id(&self) -> String {
        self.fields.get_linking_id()
    }

    fn get_title(&self, for_filing: bool) -> String {
        if for_filing {
            self.fields.filing_title(ENGLISH_ARTICLES)
        } else {
            self.fields.title()
        }
    }

    fn get_main_author(&self) -> String {
        self.fields.first("author").to_string()
    }

    fn get_isbns(&self) -> Vec<String> {
        self.fields.isbns()
    }

    fn get_issns(&self) -> Vec<String> {
        self.fields.issns()
    }

    fn get_format(&self) -> String {
        let format = self.fields.first("format");
        if format.is_empty() {
            "Unknown".to_string()
        } else {
            format.to_string()
        }
    }

    fn get_publication_year(&self) -> Option<i32> {
        self.fields
            .publication_year("created")
            .or_else(|| self.fields.publication_year("date"))
    }

    fn get_page_count(&self) -> Option<u32> {
        None
    }

    fn get_series_issn(&self) -> String {
        String::new()
    }

    fn get_series_numbering(&self) -> String {
        String::new()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = self.fields.base_solr_doc(self.get_format());
        push_one(
            &mut doc,
            "title_sort",
            normalize_text(&self.get_title(true)),
        );
        if let Some(year) = self.get_publication_year() {
            push_one(&mut doc, "publish_date", year.to_string());
        }
        doc
    }

    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize {
        self.fields.merge_component_parts(components, doc)
    }
}

/// LIDO museum object records: no standard numbers, actors instead of
/// authors, object type instead of bibliographic format.
pub struct LidoDriver {
    fields: FieldedData,
}

impl RecordDriver for LidoDriver {
    fn id(&self) -> String {
        self.fields.id()
    }

    fn serialize(&self) -> Result<String, RecordError> {
        self.fields.serialize()
    }

    fn normalize(&mut self) {
        self.fields.normalize();
    }

    fn get_host_record_id(&self) -> String {
        self.fields.get_host_record_id()
    }

    fn get_linking_id(&self) -> String {
        self.fields.get_linking_id()
    }

    fn get_title(&self, _for_filing: bool) -> String {
        self.fields.title()
    }

    fn get_main_author(&self) -> String {
        let actor = self.fields.first("actor");
        if actor.is_empty() {
            self.fields.first("author").to_string()
        } else {
            actor.to_string()
        }
    }

    fn get_isbns(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_issns(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_format(&self) -> String {
        let object_type = self.fields.first("object_type");
        if object_type.is_empty() {
            "Object".to_string()
        } else {
            object_type.to_string()
        }
    }

    fn get_publication_year(&self) -> Option<i32> {
        self.fields.publication_year("date")
    }

    fn get_page_count(&self) -> Option<u32> {
        None
    }

    fn get_series_issn(&self) -> String {
        String::new()
    }

    fn get_series_numbering(&self) -> String {
        String::new()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = self.fields.base_solr_doc(self.get_format());
        push_one(&mut doc, "author", self.get_main_author());
        push_one(&mut doc, "title_sort", normalize_text(&self.get_title(true)));
        push_all(&mut doc, "material", self.fields.all("material"));
        if let Some(year) = self.get_publication_year() {
            push_one(&mut doc, "publish_date", year.to_string());
        }
        doc
    }

    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize {
        self.fields.merge_component_parts(components, doc)
    }
}

/// Forward film records: directors take the author role, production year
/// is the dedup year.
pub struct ForwardDriver {
    fields: FieldedData,
}

impl RecordDriver for ForwardDriver {
    fn id(&self) -> String {
        self.fields.id()
    }

    fn serialize(&self) -> Result<String, RecordError> {
        self.fields.serialize()
    }

    fn normalize(&mut self) {
        self.fields.normalize();
    }

    fn get_host_record_id(&self) -> String {
        self.fields.get_host_record_id()
    }

    fn get_linking_id(&self) -> String {
        self.fields.get_linking_id()
    }

    fn get_title(&self, for_filing: bool) -> String {
        if for_filing {
            self.fields.filing_title(ENGLISH_ARTICLES)
        } else {
            self.fields.title()
        }
    }

    fn get_main_author(&self) -> String {
        let director = self.fields.first("director");
        if director.is_empty() {
            self.fields.first("author").to_string()
        } else {
            director.to_string()
        }
    }

    fn get_isbns(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_issns(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_format(&self) -> String {
        "Video".to_string()
    }

    fn get_publication_year(&self) -> Option<i32> {
        self.fields
            .publication_year("production_year")
            .or_else(|| self.fields.publication_year("date"))
    }

    fn get_page_count(&self) -> Option<u32> {
        None
    }

    fn get_series_issn(&self) -> String {
        String::new()
    }

    fn get_series_numbering(&self) -> String {
        String::new()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = self.fields.base_solr_doc(self.get_format());
        push_one(&mut doc, "author", self.get_main_author());
        push_one(&mut doc, "title_sort", normalize_text(&self.get_title(true)));
        if let Some(year) = self.get_publication_year() {
            push_one(&mut doc, "publish_date", year.to_string());
        }
        doc
    }

    fn merge_component_parts(&self, components: &[SolrDoc], doc: &mut SolrDoc) -> usize {
        self.fields.merge_component_parts(components, doc)
    }
}

fn strip_isbd_punctuation(value: &str) -> String {
    value
        .trim_end_matches(|c: char| c == '/' || c == ':' || c == ';' || c == '.' || c == ' ')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marc(data: &str) -> Box<dyn RecordDriver> {
        create_driver("marc", data, "", "test").unwrap()
    }

    #[test]
    fn test_unknown_format_fails() {
        let err = create_driver("pdf", "{}", "", "test").unwrap_err();
        assert!(matches!(err, RecordError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_malformed_payload_fails() {
        let err = create_driver("dc", "<xml/>", "", "test").unwrap_err();
        assert!(matches!(err, RecordError::Parse(_)));
    }

    #[test]
    fn test_marc_normalize_strips_isbd() {
        let mut driver = marc(r#"{"id": "1", "title": "The art of computer programming /"}"#);
        driver.normalize();
        assert_eq!(driver.get_title(false), "The art of computer programming");
        assert_eq!(driver.get_title(true), "art of computer programming");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = r#"{"id": "1", "title": "  Some   title : subtitle /", "isbn": "0-201-03801-3"}"#;
        let mut driver = marc(raw);
        driver.normalize();
        let once = driver.serialize().unwrap();
        let mut driver = marc(&once);
        driver.normalize();
        assert_eq!(driver.serialize().unwrap(), once);
    }

    #[test]
    fn test_isbn_extraction_promotes_to_13() {
        let driver = marc(r#"{"id": "1", "isbn": ["0-201-03801-3"]}"#);
        assert_eq!(driver.get_isbns(), vec!["9780201038019".to_string()]);
    }

    #[test]
    fn test_publication_year_and_pages() {
        let driver = marc(r#"{"id": "1", "date": "cop. 1997", "pages": "xv, 650 p."}"#);
        assert_eq!(driver.get_publication_year(), Some(1997));
        assert_eq!(driver.get_page_count(), Some(650));
    }

    #[test]
    fn test_solr_doc_fields() {
        let driver = marc(
            r#"{"id": "1", "title": "Art : essays", "author": "Doe, Jane",
                "date": "1997", "language": ["eng", "fin"]}"#,
        );
        let doc = driver.to_solr_array();
        assert_eq!(doc["title_short"], vec!["Art"]);
        assert_eq!(doc["author"], vec!["Doe, Jane"]);
        assert_eq!(doc["publish_date"], vec!["1997"]);
        assert_eq!(doc["language"], vec!["eng", "fin"]);
        assert!(doc.contains_key("allfields"));
    }

    #[test]
    fn test_forward_director_is_author() {
        let driver =
            create_driver("forward", r#"{"id": "f1", "director": "Kaurismäki, Aki"}"#, "", "s")
                .unwrap();
        assert_eq!(driver.get_main_author(), "Kaurismäki, Aki");
        assert_eq!(driver.get_format(), "Video");
        assert!(driver.get_isbns().is_empty());
    }

    #[test]
    fn test_lido_object_type() {
        let driver = create_driver(
            "lido",
            r#"{"id": "l1", "object_type": "Painting", "actor": "Schjerfbeck, Helene"}"#,
            "",
            "s",
        )
        .unwrap();
        assert_eq!(driver.get_format(), "Painting");
        assert_eq!(driver.get_main_author(), "Schjerfbeck, Helene");
    }

    #[test]
    fn test_component_merge_counts_parts() {
        let host = marc(r#"{"id": "h1", "title": "Journal of Tests"}"#);
        let mut doc = host.to_solr_array();
        let mut part = SolrDoc::new();
        part.insert("title".to_string(), vec!["First article".to_string()]);
        part.insert("author".to_string(), vec!["Smith, A".to_string()]);
        let merged = host.merge_component_parts(&[part], &mut doc);
        assert_eq!(merged, 1);
        assert_eq!(doc["contents"], vec!["First article"]);
        assert!(doc["author2"].contains(&"Smith, A".to_string()));
    }

    #[test]
    fn test_linking_id_falls_back_to_id() {
        let driver = marc(r#"{"id": "42"}"#);
        assert_eq!(driver.get_linking_id(), "42");
    }
}
