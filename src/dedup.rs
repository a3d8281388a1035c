//! # Dedup Engine
//!
//! Candidate search over blocking keys, pairwise matching, and equivalence
//! class maintenance. Every decision is idempotent: re-running the pass on
//! the same inputs yields the same group assignments, which is what makes
//! restartable processing safe.

use lru::LruCache;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use tracing::{debug, info, warn};

use crate::config::DataSourceSettings;
use crate::drivers::create_driver;
use crate::error::RecordError;
use crate::keys::normalize_text;
use crate::model::{numeric_id_suffix, DedupGroup, Record};
use crate::store::{
    Filter, FindOptions, IterateControl, IterateOptions, Store, DEDUP_COLLECTION,
    RECORD_COLLECTION,
};
use crate::Cancellation;

/// Candidates per blocking key before the key is declared too common.
const CANDIDATE_CAP: usize = 1000;
/// Bounded memory for the per-pass too-many-candidates key set.
const TOO_MANY_CAPACITY: usize = 20_000;
/// Titles are compared over at most this many normalized characters.
const TITLE_COMPARE_CHARS: usize = 255;

/// Dedup-relevant features of one record, extracted through its driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupFeatures {
    pub format: String,
    pub isbns: Vec<String>,
    pub issns: Vec<String>,
    pub year: Option<i32>,
    pub pages: Option<u32>,
    pub series_issn: String,
    pub series_numbering: String,
    /// Normalized filing title, truncated for comparison.
    pub title: String,
    pub author: String,
}

impl DedupFeatures {
    pub fn from_record(record: &Record) -> Result<Self, RecordError> {
        let driver = create_driver(
            &record.format,
            record.effective_data(),
            &record.oai_id,
            &record.source_id,
        )?;
        Ok(Self {
            format: driver.get_format(),
            isbns: driver.get_isbns(),
            issns: driver.get_issns(),
            year: driver.get_publication_year(),
            pages: driver.get_page_count(),
            series_issn: driver.get_series_issn(),
            series_numbering: driver.get_series_numbering(),
            title: normalize_text(&driver.get_title(true))
                .chars()
                .take(TITLE_COMPARE_CHARS)
                .collect(),
            author: driver.get_main_author(),
        })
    }
}

/// Pairwise match decision. A shared ISBN short-circuits to a match; the
/// remaining checks all have to pass.
pub fn records_match(a: &DedupFeatures, b: &DedupFeatures) -> bool {
    if a.format != b.format {
        return false;
    }

    if !a.isbns.is_empty() && !b.isbns.is_empty() {
        // Both sides carry ISBNs: they either agree or they are different
        // publications.
        return a.isbns.iter().any(|isbn| b.isbns.contains(isbn));
    }

    if !a.issns.is_empty()
        && !b.issns.is_empty()
        && !a.issns.iter().any(|issn| b.issns.contains(issn))
    {
        return false;
    }

    if let (Some(year_a), Some(year_b)) = (a.year, b.year) {
        if (year_a - year_b).abs() > 1 {
            return false;
        }
    }

    if let (Some(pages_a), Some(pages_b)) = (a.pages, b.pages) {
        if pages_a.abs_diff(pages_b) > 10 {
            return false;
        }
    }

    if !a.series_issn.is_empty()
        && !b.series_issn.is_empty()
        && a.series_issn != b.series_issn
    {
        return false;
    }
    if !a.series_numbering.is_empty()
        && !b.series_numbering.is_empty()
        && a.series_numbering != b.series_numbering
    {
        return false;
    }

    if a.title.is_empty() || b.title.is_empty() {
        return false;
    }
    if scaled_distance(&a.title, &b.title) >= 0.10 {
        return false;
    }

    authors_compatible(&a.author, &b.author)
}

/// Levenshtein distance scaled by the longer input.
fn scaled_distance(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    strsim::levenshtein(a, b) as f64 / longest as f64
}

/// Author comparison: an absent author never vetoes a match; present ones
/// must agree on surname plus first initial, or be within 20% edit
/// distance.
fn authors_compatible(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a == b {
        return true;
    }
    if surname_initial_match(&a, &b) {
        return true;
    }
    scaled_distance(&a, &b) <= 0.20
}

/// `"surname given..."` forms match when surnames are equal and the given
/// names share a first initial.
fn surname_initial_match(a: &str, b: &str) -> bool {
    let parse = |name: &str| -> Option<(String, char)> {
        let mut words = name.split(' ');
        let surname = words.next()?.to_string();
        let initial = words.next()?.chars().next()?;
        Some((surname, initial))
    };
    match (parse(a), parse(b)) {
        (Some((surname_a, initial_a)), Some((surname_b, initial_b))) => {
            surname_a == surname_b && initial_a == initial_b
        }
        _ => false,
    }
}

/// Counters reported by a dedup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub processed: u64,
    pub matched: u64,
    pub groups_created: u64,
    pub detached: u64,
    pub component_groups: u64,
}

/// One dedup pass over all dirty records. The too-many-candidates set is
/// per pass by construction.
pub struct Deduplicator<'a> {
    store: &'a dyn Store,
    sources: &'a BTreeMap<String, DataSourceSettings>,
    too_many: LruCache<String, ()>,
    candidate_cap: usize,
    stats: DedupStats,
}

impl<'a> Deduplicator<'a> {
    pub fn new(store: &'a dyn Store, sources: &'a BTreeMap<String, DataSourceSettings>) -> Self {
        Self {
            store,
            sources,
            too_many: LruCache::new(NonZeroUsize::new(TOO_MANY_CAPACITY).expect("lru capacity")),
            candidate_cap: CANDIDATE_CAP,
            stats: DedupStats::default(),
        }
    }

    fn dedup_enabled(&self, source_id: &str) -> bool {
        self.sources
            .get(source_id)
            .map(|source| source.dedup)
            .unwrap_or(false)
    }

    /// Process every record with the dirty bit set. Returns pass counters.
    pub fn run(
        &mut self,
        source_filter: Option<&str>,
        cancellation: &Cancellation,
    ) -> Result<DedupStats, RecordError> {
        let mut filter = vec![
            Filter::eq("update_needed", true),
            Filter::eq("deleted", false),
            Filter::eq("host_record_id", ""),
        ];
        if let Some(source_id) = source_filter {
            filter.push(Filter::eq("source_id", source_id));
        }
        let filter = Filter::and(filter);

        let store = self.store;
        store.iterate(
            RECORD_COLLECTION,
            &filter,
            &IterateOptions::default(),
            &mut |doc| {
                if cancellation.is_cancelled() {
                    return Err(RecordError::Cancelled);
                }
                let mut record = Record::from_doc(doc)?;
                if !self.dedup_enabled(&record.source_id) {
                    record.update_needed = false;
                    store.save(RECORD_COLLECTION, record.to_doc())?;
                    return Ok(IterateControl::Continue);
                }
                self.stats.processed += 1;
                match self.dedup_record(&mut record) {
                    Ok(true) => self.stats.matched += 1,
                    Ok(false) => {}
                    Err(RecordError::Cancelled) => return Err(RecordError::Cancelled),
                    Err(err) => {
                        warn!(record = %record.id, error = %err, "dedup failed for record");
                    }
                }
                Ok(IterateControl::Continue)
            },
        )?;

        info!(
            processed = self.stats.processed,
            matched = self.stats.matched,
            groups_created = self.stats.groups_created,
            "dedup pass complete"
        );
        Ok(self.stats)
    }

    /// Try the record against candidates from its blocking keys, in key
    /// priority order: ISBN, other identifiers, title.
    fn dedup_record(&mut self, record: &mut Record) -> Result<bool, RecordError> {
        let features = DedupFeatures::from_record(record)?;

        let key_sets: [(&str, Vec<String>); 3] = [
            ("isbn_keys", record.isbn_keys.clone()),
            ("id_keys", record.id_keys.clone()),
            ("title_keys", record.title_keys.clone()),
        ];

        let mut checked: FxHashSet<String> = FxHashSet::default();
        for (field, keys) in &key_sets {
            let field = *field;
            for key in keys {
                let cache_key = format!("{field}:{key}");
                if self.too_many.get(&cache_key).is_some() {
                    continue;
                }

                let filter = Filter::and([
                    Filter::eq(field, key.as_str()),
                    Filter::ne("source_id", record.source_id.as_str()),
                    Filter::eq("host_record_id", ""),
                    Filter::eq("deleted", false),
                ]);
                let candidates = self.store.find(
                    RECORD_COLLECTION,
                    &filter,
                    &FindOptions::limited(self.candidate_cap + 1),
                )?;
                if candidates.len() > self.candidate_cap {
                    debug!(key = %cache_key, "blocking key over candidate cap, skipping");
                    self.too_many.put(cache_key, ());
                    continue;
                }

                for doc in candidates {
                    let candidate = Record::from_doc(doc)?;
                    if candidate.id == record.id || !checked.insert(candidate.id.clone()) {
                        continue;
                    }
                    if !self.dedup_enabled(&candidate.source_id) {
                        continue;
                    }
                    let candidate_features = match DedupFeatures::from_record(&candidate) {
                        Ok(features) => features,
                        Err(err) => {
                            warn!(record = %candidate.id, error = %err, "skipping candidate");
                            continue;
                        }
                    };
                    if !records_match(&features, &candidate_features) {
                        continue;
                    }

                    let mut candidate = candidate;
                    if self.assign_pair(record, &mut candidate)? {
                        self.co_dedup_components(record, &candidate)?;
                        return Ok(true);
                    }
                }
            }
        }

        // No candidate matched: the record keeps no group membership.
        if record.dedup_id.is_some() {
            detach_record(self.store, record)?;
            self.stats.detached += 1;
        }
        record.update_needed = false;
        self.store.save(RECORD_COLLECTION, record.to_doc())?;
        Ok(false)
    }

    /// Put a matched pair into the same group, honoring the rule that a
    /// group never holds two records from one source. Returns false when
    /// the existing group already has a competitor from the record's
    /// source, in which case the search continues.
    fn assign_pair(
        &mut self,
        record: &mut Record,
        candidate: &mut Record,
    ) -> Result<bool, RecordError> {
        if let Some(group_id) = candidate.dedup_id.clone() {
            if let Some(mut group) = self.load_live_group(&group_id)? {
                if record.dedup_id.as_deref() == Some(group.id.as_str()) {
                    // Already together; just clear the dirty bits.
                    record.update_needed = false;
                    candidate.update_needed = false;
                    self.store.save(RECORD_COLLECTION, record.to_doc())?;
                    self.store.save(RECORD_COLLECTION, candidate.to_doc())?;
                    return Ok(true);
                }
                if self.group_has_other_from_source(&group, &record.source_id, &record.id)? {
                    return Ok(false);
                }
                if record.dedup_id.is_some() {
                    detach_record(self.store, record)?;
                }
                group.ids.insert(record.id.clone());
                group.changed = true;
                group.updated = self.store.now();
                self.store.save(DEDUP_COLLECTION, group.to_doc())?;

                record.dedup_id = Some(group.id.clone());
                record.update_needed = false;
                // Membership changes count as record changes, so the
                // change-driven index scan picks the pair up.
                record.updated = self.store.now();
                candidate.update_needed = false;
                candidate.updated = self.store.now();
                self.store.save(RECORD_COLLECTION, record.to_doc())?;
                self.store.save(RECORD_COLLECTION, candidate.to_doc())?;
                return Ok(true);
            }
            candidate.dedup_id = None;
        }

        if let Some(group_id) = record.dedup_id.clone() {
            // Symmetric case: the record gained a group on an earlier pass
            // and the candidate has none yet.
            if let Some(mut group) = self.load_live_group(&group_id)? {
                if self.group_has_other_from_source(&group, &candidate.source_id, &candidate.id)? {
                    return Ok(false);
                }
                group.ids.insert(candidate.id.clone());
                group.changed = true;
                group.updated = self.store.now();
                self.store.save(DEDUP_COLLECTION, group.to_doc())?;

                candidate.dedup_id = Some(group.id.clone());
                record.update_needed = false;
                record.updated = self.store.now();
                candidate.update_needed = false;
                candidate.updated = self.store.now();
                self.store.save(RECORD_COLLECTION, record.to_doc())?;
                self.store.save(RECORD_COLLECTION, candidate.to_doc())?;
                return Ok(true);
            }
            record.dedup_id = None;
        }

        let group = DedupGroup::new([record.id.clone(), candidate.id.clone()]);
        self.store.save(DEDUP_COLLECTION, group.to_doc())?;
        record.dedup_id = Some(group.id.clone());
        candidate.dedup_id = Some(group.id);
        record.update_needed = false;
        record.updated = self.store.now();
        candidate.update_needed = false;
        candidate.updated = self.store.now();
        self.store.save(RECORD_COLLECTION, record.to_doc())?;
        self.store.save(RECORD_COLLECTION, candidate.to_doc())?;
        self.stats.groups_created += 1;
        Ok(true)
    }

    fn load_live_group(&self, group_id: &str) -> Result<Option<DedupGroup>, RecordError> {
        match self.store.get(DEDUP_COLLECTION, group_id)? {
            Some(doc) => {
                let group = DedupGroup::from_doc(doc)?;
                Ok((!group.deleted).then_some(group))
            }
            None => Ok(None),
        }
    }

    fn group_has_other_from_source(
        &self,
        group: &DedupGroup,
        source_id: &str,
        except_id: &str,
    ) -> Result<bool, RecordError> {
        for member_id in &group.ids {
            if member_id == except_id {
                continue;
            }
            if let Some(doc) = self.store.get(RECORD_COLLECTION, member_id)? {
                let member = Record::from_doc(doc)?;
                if !member.deleted && member.source_id == source_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// When two hosts merge, their component parts are aligned by the
    /// numeric suffix of their ids and grouped pairwise, but only when the
    /// full sequences line up. Partial alignment leaves the parts alone.
    fn co_dedup_components(
        &mut self,
        host_a: &Record,
        host_b: &Record,
    ) -> Result<(), RecordError> {
        let mut parts_a = self.component_parts_of(host_a)?;
        let mut parts_b = self.component_parts_of(host_b)?;
        if parts_a.is_empty() || parts_a.len() != parts_b.len() {
            return Ok(());
        }

        parts_a.sort_by_key(|part| numeric_id_suffix(&part.id));
        parts_b.sort_by_key(|part| numeric_id_suffix(&part.id));

        let mut pairs = Vec::with_capacity(parts_a.len());
        for (part_a, part_b) in parts_a.iter().zip(parts_b.iter()) {
            let features_a = DedupFeatures::from_record(part_a)?;
            let features_b = DedupFeatures::from_record(part_b)?;
            if !records_match(&features_a, &features_b) {
                return Ok(());
            }
            pairs.push((part_a.clone(), part_b.clone()));
        }

        for (mut part_a, mut part_b) in pairs {
            if self.assign_pair(&mut part_a, &mut part_b)? {
                self.stats.component_groups += 1;
            }
        }
        Ok(())
    }

    fn component_parts_of(&self, host: &Record) -> Result<Vec<Record>, RecordError> {
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
        docs.into_iter().map(Record::from_doc).collect()
    }
}

/// Remove a record from its group, deleting the group when it falls below
/// two distinct sources. The record's `dedup_id` is cleared in place and
/// persisted.
pub fn detach_record(store: &dyn Store, record: &mut Record) -> Result<(), RecordError> {
    let Some(group_id) = record.dedup_id.take() else {
        return Ok(());
    };

    if let Some(doc) = store.get(DEDUP_COLLECTION, &group_id)? {
        let mut group = DedupGroup::from_doc(doc)?;
        group.ids.remove(&record.id);
        group.changed = true;
        group.updated = store.now();

        let mut remaining = Vec::new();
        let mut sources = FxHashSet::default();
        for member_id in &group.ids {
            if let Some(member_doc) = store.get(RECORD_COLLECTION, member_id)? {
                let member = Record::from_doc(member_doc)?;
                if !member.deleted {
                    sources.insert(member.source_id.clone());
                    remaining.push(member);
                }
            }
        }

        if sources.len() < 2 {
            group.deleted = true;
            for mut member in remaining {
                member.dedup_id = None;
                member.update_needed = true;
                // The member must be re-delivered as a stand-alone
                // document once the merged one goes away.
                member.updated = store.now();
                store.save(RECORD_COLLECTION, member.to_doc())?;
            }
        }
        store.save(DEDUP_COLLECTION, group.to_doc())?;
    }

    record.updated = store.now();
    store.save(RECORD_COLLECTION, record.to_doc())?;
    Ok(())
}

/// Counters reported by the consistency check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub groups_checked: u64,
    pub stale_ids_removed: u64,
    pub groups_deleted: u64,
    pub orphans_cleared: u64,
}

/// Walk all groups and all grouped records, repairing every invariant
/// violation found. Violations are logged, never fatal.
pub fn check_dedup_consistency(
    store: &dyn Store,
    cancellation: &Cancellation,
) -> Result<RepairReport, RecordError> {
    let mut report = RepairReport::default();

    store.iterate(
        DEDUP_COLLECTION,
        &Filter::eq("deleted", false),
        &IterateOptions::default(),
        &mut |doc| {
            if cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            let mut group = DedupGroup::from_doc(doc)?;
            report.groups_checked += 1;

            let mut valid = Vec::new();
            let mut sources = FxHashSet::default();
            for member_id in group.ids.iter().cloned().collect::<Vec<_>>() {
                let member = match store.get(RECORD_COLLECTION, &member_id)? {
                    Some(member_doc) => Record::from_doc(member_doc)?,
                    None => {
                        warn!(
                            group = %group.id,
                            record = %member_id,
                            "{}",
                            RecordError::InvariantViolation(
                                "group references missing record".to_string()
                            )
                        );
                        group.ids.remove(&member_id);
                        report.stale_ids_removed += 1;
                        continue;
                    }
                };
                if member.deleted || member.dedup_id.as_deref() != Some(group.id.as_str()) {
                    warn!(
                        group = %group.id,
                        record = %member_id,
                        "{}",
                        RecordError::InvariantViolation(
                            "group member is deleted or points elsewhere".to_string()
                        )
                    );
                    group.ids.remove(&member_id);
                    report.stale_ids_removed += 1;
                    continue;
                }
                sources.insert(member.source_id.clone());
                valid.push(member);
            }

            if sources.len() < 2 {
                group.deleted = true;
                report.groups_deleted += 1;
                for mut member in valid {
                    member.dedup_id = None;
                    member.update_needed = true;
                    store.save(RECORD_COLLECTION, member.to_doc())?;
                }
            }
            store.save(DEDUP_COLLECTION, group.to_doc())?;
            Ok(IterateControl::Continue)
        },
    )?;

    // Records claiming membership in a group that no longer exists or no
    // longer contains them.
    store.iterate(
        RECORD_COLLECTION,
        &Filter::exists("dedup_id", true),
        &IterateOptions::default(),
        &mut |doc| {
            if cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            let mut record = Record::from_doc(doc)?;
            let Some(group_id) = record.dedup_id.clone() else {
                return Ok(IterateControl::Continue);
            };
            let group = match store.get(DEDUP_COLLECTION, &group_id)? {
                Some(group_doc) => Some(DedupGroup::from_doc(group_doc)?),
                None => None,
            };
            let valid = group
                .as_ref()
                .map(|g| !g.deleted && g.ids.contains(&record.id))
                .unwrap_or(false);
            if !valid {
                warn!(
                    record = %record.id,
                    group = %group_id,
                    "{}",
                    RecordError::InvariantViolation("record points to a stale group".to_string())
                );
                record.dedup_id = None;
                record.update_needed = true;
                store.save(RECORD_COLLECTION, record.to_doc())?;
                report.orphans_cleared += 1;
            }
            Ok(IterateControl::Continue)
        },
    )?;

    info!(
        groups = report.groups_checked,
        stale = report.stale_ids_removed,
        orphans = report.orphans_cleared,
        "dedup consistency check complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(format: &str, title: &str) -> DedupFeatures {
        DedupFeatures {
            format: format.to_string(),
            isbns: vec![],
            issns: vec![],
            year: None,
            pages: None,
            series_issn: String::new(),
            series_numbering: String::new(),
            title: normalize_text(title),
            author: String::new(),
        }
    }

    #[test]
    fn test_isbn_intersection_short_circuits() {
        let mut a = features("Book", "Completely different title");
        let mut b = features("Book", "Another thing entirely");
        a.isbns = vec!["9780201038019".to_string()];
        b.isbns = vec!["9780201038019".to_string()];
        assert!(records_match(&a, &b));
    }

    #[test]
    fn test_isbn_mismatch_vetoes() {
        let mut a = features("Book", "Same title");
        let mut b = features("Book", "Same title");
        a.isbns = vec!["9780201038019".to_string()];
        b.isbns = vec!["9780131103627".to_string()];
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_format_mismatch_vetoes() {
        let a = features("Book", "Same title");
        let b = features("Video", "Same title");
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_close_titles_match_without_isbn() {
        let a = features("Book", "Art of Computer Programming");
        let b = features("Book", "Art of Computer Programing");
        assert!(records_match(&a, &b));
    }

    #[test]
    fn test_distant_titles_do_not_match() {
        let a = features("Book", "Art of Computer Programming");
        let b = features("Book", "Gardening for Beginners");
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_year_and_pages_windows() {
        let mut a = features("Book", "Same title here");
        let mut b = features("Book", "Same title here");
        a.year = Some(1997);
        b.year = Some(1998);
        a.pages = Some(650);
        b.pages = Some(655);
        assert!(records_match(&a, &b));

        b.year = Some(2000);
        assert!(!records_match(&a, &b));
        b.year = Some(1998);
        b.pages = Some(700);
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_issn_must_intersect_when_both_present() {
        let mut a = features("Journal", "Acta Botanica");
        let mut b = features("Journal", "Acta Botanica");
        a.issns = vec!["1234-5679".to_string()];
        b.issns = vec!["9876-5432".to_string()];
        assert!(!records_match(&a, &b));

        b.issns.push("1234-5679".to_string());
        assert!(records_match(&a, &b));
    }

    #[test]
    fn test_author_surname_initial() {
        assert!(authors_compatible("Knuth, Donald", "Knuth, D. E."));
        assert!(authors_compatible("Knuth, Donald", ""));
        assert!(!authors_compatible("Knuth, Donald", "Dijkstra, Edsger"));
    }

    #[test]
    fn test_series_numbering_veto() {
        let mut a = features("Book", "Collected works");
        let mut b = features("Book", "Collected works");
        a.series_numbering = "vol. 1".to_string();
        b.series_numbering = "vol. 2".to_string();
        assert!(!records_match(&a, &b));
    }
}
