//! # Field Mapper
//!
//! Declarative remapping of raw field values into the target vocabulary.
//! A mapping file is a newline-delimited sequence of `key = value` entries
//! with `;` comments; keys ending `[]` append to a list, and the special
//! keys `##default`, `##empty` and `##emptyarray` define fallbacks.
//!
//! Values containing `/` are treated as hierarchies: each level is mapped
//! independently (per-index keys `"{level}/{value}"` take precedence over
//! plain keys), an empty mapped level truncates the hierarchy, and every
//! cumulative prefix becomes an output value.

use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{DataSourceSettings, MappingKind};
use crate::drivers::SolrDoc;
use crate::error::RecordError;

/// One parsed mapping file.
#[derive(Debug, Clone)]
pub struct MappingTable {
    kind: MappingKind,
    /// Exact-lookup entries; a key may map to several values via `[]`.
    entries: FxHashMap<String, Vec<String>>,
    /// Compiled patterns in file order, for the regexp kinds.
    patterns: Vec<(Regex, String)>,
    default: Option<String>,
    empty: Option<String>,
    empty_array: Option<Vec<String>>,
}

impl MappingTable {
    /// Parse mapping file content. `name` is used for error reporting.
    pub fn parse(kind: MappingKind, name: &str, content: &str) -> Result<Self, RecordError> {
        let mut entries: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut patterns = Vec::new();
        let mut default = None;
        let mut empty = None;
        let mut empty_array = None;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            // `key = ` with an empty value survives the surrounding trim.
            let (raw_key, value) = match line.split_once(" = ") {
                Some((key, value)) => (key, value),
                None => match line.strip_suffix(" =") {
                    Some(key) => (key, ""),
                    None => {
                        return Err(RecordError::MalformedMapping {
                            file: name.to_string(),
                            line: line_no + 1,
                        })
                    }
                },
            };
            let raw_key = raw_key.trim();
            let value = value.trim().to_string();

            match raw_key {
                "##default" => default = Some(value),
                "##empty" => empty = Some(value),
                "##emptyarray" => empty_array = Some(vec![value]),
                _ => {
                    let (key, append) = match raw_key.strip_suffix("[]") {
                        Some(stripped) => (stripped.trim(), true),
                        None => (raw_key, false),
                    };
                    if kind != MappingKind::Normal {
                        let regex = Regex::new(key).map_err(|err| {
                            RecordError::Config(format!(
                                "bad pattern in {name} line {}: {err}",
                                line_no + 1
                            ))
                        })?;
                        patterns.push((regex, value));
                    } else if append {
                        entries.entry(key.to_string()).or_default().push(value);
                    } else {
                        entries.insert(key.to_string(), vec![value]);
                    }
                }
            }
        }

        Ok(Self {
            kind,
            entries,
            patterns,
            default,
            empty,
            empty_array,
        })
    }

    /// Map one raw value, producing zero or more outputs. Empty outputs
    /// are pruned by the caller.
    fn map_value(&self, raw: &str) -> Vec<String> {
        if raw.is_empty() {
            if let Some(values) = &self.empty_array {
                return values.clone();
            }
            if let Some(value) = &self.empty {
                return vec![value.clone()];
            }
            return vec![raw.to_string()];
        }

        if raw.contains('/') {
            return self.map_hierarchy(raw);
        }
        self.map_flat(raw, None)
    }

    fn map_flat(&self, raw: &str, level: Option<usize>) -> Vec<String> {
        match self.kind {
            MappingKind::Normal => {
                if let Some(index) = level {
                    if let Some(values) = self.entries.get(&format!("{index}/{raw}")) {
                        return values.clone();
                    }
                }
                if let Some(values) = self.entries.get(raw) {
                    return values.clone();
                }
                match &self.default {
                    Some(value) => vec![value.clone()],
                    None => vec![raw.to_string()],
                }
            }
            MappingKind::Regexp => {
                for (regex, replacement) in &self.patterns {
                    if regex.is_match(raw) {
                        return vec![regex.replace(raw, replacement.as_str()).into_owned()];
                    }
                }
                match &self.default {
                    Some(value) => vec![value.clone()],
                    None => vec![raw.to_string()],
                }
            }
            MappingKind::RegexpMulti => {
                let mut results = Vec::new();
                for (regex, replacement) in &self.patterns {
                    if regex.is_match(raw) {
                        results.push(regex.replace(raw, replacement.as_str()).into_owned());
                    }
                }
                if results.is_empty() {
                    match &self.default {
                        Some(value) => vec![value.clone()],
                        None => vec![raw.to_string()],
                    }
                } else {
                    results
                }
            }
        }
    }

    /// Map each hierarchy level independently; an empty level truncates.
    /// Every cumulative prefix becomes an output value.
    fn map_hierarchy(&self, raw: &str) -> Vec<String> {
        let mut mapped_levels: Vec<String> = Vec::new();
        for (index, level) in raw.split('/').enumerate() {
            let mapped = self.map_flat(level, Some(index));
            let level_value = mapped.into_iter().next().unwrap_or_default();
            if level_value.is_empty() {
                break;
            }
            mapped_levels.push(level_value);
        }

        let mut outputs = Vec::new();
        for end in 1..=mapped_levels.len() {
            outputs.push(mapped_levels[..end].join("/"));
        }
        outputs
    }
}

/// All mapping tables for all sources, constructed once per run.
#[derive(Debug, Default)]
pub struct FieldMapper {
    /// source id → field name → ordered chain of tables.
    by_source: FxHashMap<String, FxHashMap<String, Vec<MappingTable>>>,
}

impl FieldMapper {
    /// Load every mapping file referenced by the data source configs from
    /// `base_dir`.
    pub fn load(
        base_dir: &Path,
        sources: &BTreeMap<String, DataSourceSettings>,
    ) -> Result<Self, RecordError> {
        let mut mapper = Self::default();
        for (source_id, source) in sources {
            for (field, refs) in &source.field_mappings {
                let mut chain = Vec::new();
                for file_ref in refs {
                    let path = base_dir.join(&file_ref.file);
                    let content = std::fs::read_to_string(&path).map_err(|err| {
                        RecordError::Config(format!(
                            "cannot read mapping {}: {err}",
                            path.display()
                        ))
                    })?;
                    chain.push(MappingTable::parse(file_ref.kind, &file_ref.file, &content)?);
                }
                mapper.add_chain(source_id, field, chain);
            }
        }
        Ok(mapper)
    }

    /// Register a mapping chain directly; used by tests and previews.
    pub fn add_chain(&mut self, source_id: &str, field: &str, chain: Vec<MappingTable>) {
        self.by_source
            .entry(source_id.to_string())
            .or_default()
            .insert(field.to_string(), chain);
    }

    /// Whether any mapping is configured for the source at all.
    pub fn has_mappings(&self, source_id: &str) -> bool {
        self.by_source
            .get(source_id)
            .is_some_and(|fields| !fields.is_empty())
    }

    /// Remap every configured field present in the document. Array values
    /// map element-wise and are de-duplicated preserving first-seen order.
    pub fn map_values(&self, source_id: &str, doc: &mut SolrDoc) {
        let Some(fields) = self.by_source.get(source_id) else {
            return;
        };
        for (field, chain) in fields {
            let Some(values) = doc.get(field) else {
                continue;
            };

            let mut mapped = Vec::new();
            for value in values {
                let mut stage = vec![value.clone()];
                for table in chain {
                    let mut next = Vec::new();
                    for item in &stage {
                        next.extend(table.map_value(item));
                    }
                    stage = next;
                }
                mapped.extend(stage);
            }

            mapped.retain(|value| !value.is_empty());
            let mut seen = std::collections::HashSet::new();
            mapped.retain(|value| seen.insert(value.clone()));

            if mapped.is_empty() {
                doc.remove(field);
            } else {
                doc.insert(field.clone(), mapped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(kind: MappingKind, content: &str) -> MappingTable {
        MappingTable::parse(kind, "test.map", content).unwrap()
    }

    fn doc_with(field: &str, values: &[&str]) -> SolrDoc {
        let mut doc = SolrDoc::new();
        doc.insert(
            field.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        doc
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = MappingTable::parse(MappingKind::Normal, "bad.map", "key=value").unwrap_err();
        assert!(matches!(err, RecordError::MalformedMapping { line: 1, .. }));
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let t = table(MappingKind::Normal, "; comment\n\nA = B\n");
        assert_eq!(t.map_value("A"), vec!["B"]);
    }

    #[test]
    fn test_normal_mapping_with_default() {
        let t = table(MappingKind::Normal, "A = B\n##default = other\n");
        assert_eq!(t.map_value("A"), vec!["B"]);
        assert_eq!(t.map_value("Z"), vec!["other"]);
    }

    #[test]
    fn test_append_keys_fan_out() {
        let t = table(MappingKind::Normal, "A[] = B\nA[] = C\n");
        assert_eq!(t.map_value("A"), vec!["B", "C"]);
    }

    #[test]
    fn test_regexp_first_match_wins() {
        let t = table(
            MappingKind::Regexp,
            "^fi(.*) = fin$1\n^f.* = other\n",
        );
        assert_eq!(t.map_value("fiction"), vec!["finction"]);
        assert_eq!(t.map_value("fantasy"), vec!["other"]);
    }

    #[test]
    fn test_regexp_multi_collects_all_matches() {
        let t = table(MappingKind::RegexpMulti, "^a = x\na$ = y\n");
        let mut values = t.map_value("a");
        values.sort();
        assert_eq!(values, vec!["x", "y"]);
    }

    #[test]
    fn test_empty_value_fallbacks() {
        let t = table(MappingKind::Normal, "##empty = none\n");
        assert_eq!(t.map_value(""), vec!["none"]);

        let t = table(MappingKind::Normal, "A = B\n");
        assert_eq!(t.map_value(""), vec![""]);
    }

    #[test]
    fn test_hierarchy_mapping_produces_prefixes() {
        let t = table(MappingKind::Normal, "A1 = A\n2 = 2\n");
        assert_eq!(t.map_value("A1/2"), vec!["A", "A/2"]);
    }

    #[test]
    fn test_hierarchy_per_index_keys_take_precedence() {
        let t = table(MappingKind::Normal, "0/A1 = Top\nA1 = Wrong\n2 = 2\n");
        assert_eq!(t.map_value("A1/2"), vec!["Top", "Top/2"]);
    }

    #[test]
    fn test_hierarchy_empty_level_truncates() {
        let t = table(MappingKind::Normal, "A1 = A\n2 = \n");
        assert_eq!(t.map_value("A1/2"), vec!["A"]);
    }

    #[test]
    fn test_map_values_element_wise_with_dedup() {
        let t = table(MappingKind::Normal, "A = X\nB = X\n");
        let mut mapper = FieldMapper::default();
        mapper.add_chain("s1", "building", vec![t]);

        let mut doc = doc_with("building", &["A", "B"]);
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["building"], vec!["X"]);
    }

    #[test]
    fn test_map_values_leaves_unconfigured_fields() {
        let mapper = FieldMapper::default();
        let mut doc = doc_with("building", &["A"]);
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["building"], vec!["A"]);
    }

    #[test]
    fn test_map_values_removes_field_mapped_to_empty() {
        let t = table(MappingKind::Normal, "##default = \n");
        let mut mapper = FieldMapper::default();
        mapper.add_chain("s1", "building", vec![t]);

        let mut doc = doc_with("building", &["A"]);
        mapper.map_values("s1", &mut doc);
        assert!(!doc.contains_key("building"));
    }

    #[test]
    fn test_mapping_is_idempotent_for_normal_tables() {
        let t = table(MappingKind::Normal, "A = B\n##default = B\n");
        let mut mapper = FieldMapper::default();
        mapper.add_chain("s1", "building", vec![t]);

        let mut doc = doc_with("building", &["A"]);
        mapper.map_values("s1", &mut doc);
        let once = doc.clone();
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc, once);
    }
}
