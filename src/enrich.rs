//! # Enrichment
//!
//! Enrichers run per document after the driver has produced its fields and
//! before mapping. The authority enricher resolves `*_uri` fields through
//! the URI cache, fetching misses over HTTP with the usual retry budget.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{EnrichmentSettings, HttpSettings};
use crate::drivers::SolrDoc;
use crate::error::RecordError;
use crate::harvest::fetch_optional;
use crate::model::{Record, UriCacheEntry};
use crate::store::{Store, URI_CACHE_COLLECTION};
use crate::Cancellation;

/// A document enricher. Implementations may mutate the document in place.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        store: &dyn Store,
        source_id: &str,
        record: &Record,
        doc: &mut SolrDoc,
    ) -> Result<(), RecordError>;
}

/// Look up a cached URI body, honoring the TTL.
pub fn cached_uri(
    store: &dyn Store,
    id: &str,
    ttl: ChronoDuration,
) -> Result<Option<UriCacheEntry>, RecordError> {
    let Some(doc) = store.get(URI_CACHE_COLLECTION, id)? else {
        return Ok(None);
    };
    let entry: UriCacheEntry = serde_json::from_value(doc)?;
    if entry.timestamp >= store.now() - ttl {
        Ok(Some(entry))
    } else {
        Ok(None)
    }
}

/// Persist a fetched URI body. Concurrent processes race on this insert;
/// the duplicate-key loser keeps the winner's entry.
pub fn store_uri(
    store: &dyn Store,
    id: &str,
    url: &str,
    body: &str,
) -> Result<(), RecordError> {
    let entry = UriCacheEntry {
        id: id.to_string(),
        timestamp: store.now(),
        url: url.to_string(),
        headers: Default::default(),
        body: body.to_string(),
    };
    match store.insert(URI_CACHE_COLLECTION, serde_json::to_value(&entry)?) {
        Ok(_) => Ok(()),
        Err(err) if err.is_duplicate_key() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Resolve a URI through the cache, fetching and persisting on miss.
/// Returns `None` for 404s.
pub async fn resolve_uri(
    store: &dyn Store,
    client: &reqwest::Client,
    http: &HttpSettings,
    uri: &str,
    ttl: ChronoDuration,
    cancellation: &Cancellation,
) -> Result<Option<String>, RecordError> {
    if let Some(entry) = cached_uri(store, uri, ttl)? {
        return Ok(Some(entry.body));
    }

    let url = reqwest::Url::parse(uri)
        .map_err(|err| RecordError::Parse(format!("bad enrichment uri {uri}: {err}")))?;
    let Some(body) = fetch_optional(client, url, http, cancellation).await? else {
        debug!(uri, "authority record not found");
        return Ok(None);
    };
    store_uri(store, uri, uri, &body)?;
    Ok(Some(body))
}

/// Fields the authority enricher resolves: URIs in the left field add
/// labels to the right field.
const AUTHORITY_FIELDS: &[(&str, &str)] = &[("author_uri", "author2"), ("topic_uri", "topic")];

/// Augments documents with preferred and alternate labels fetched from an
/// authority service. Responses are JSON objects with `label` and
/// optionally `alt_labels`.
pub struct AuthorityEnricher {
    client: reqwest::Client,
    http: HttpSettings,
    ttl: ChronoDuration,
    cancellation: Cancellation,
}

impl AuthorityEnricher {
    pub fn new(
        client: reqwest::Client,
        http: HttpSettings,
        enrichment: &EnrichmentSettings,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            client,
            http,
            ttl: ChronoDuration::seconds(enrichment.cache_expiration_secs as i64),
            cancellation,
        }
    }

    fn labels_from(body: &str) -> Vec<String> {
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            return Vec::new();
        };
        let mut labels = Vec::new();
        if let Some(label) = value.get("label").and_then(Value::as_str) {
            labels.push(label.to_string());
        }
        if let Some(alts) = value.get("alt_labels").and_then(Value::as_array) {
            labels.extend(
                alts.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
        }
        labels
    }
}

#[async_trait]
impl Enricher for AuthorityEnricher {
    async fn enrich(
        &self,
        store: &dyn Store,
        _source_id: &str,
        record: &Record,
        doc: &mut SolrDoc,
    ) -> Result<(), RecordError> {
        for (uri_field, target_field) in AUTHORITY_FIELDS {
            let Some(uris) = doc.get(*uri_field).cloned() else {
                continue;
            };
            for uri in uris {
                let body = match resolve_uri(
                    store,
                    &self.client,
                    &self.http,
                    &uri,
                    self.ttl,
                    &self.cancellation,
                )
                .await
                {
                    Ok(Some(body)) => body,
                    Ok(None) => continue,
                    Err(RecordError::Cancelled) => return Err(RecordError::Cancelled),
                    Err(err) => {
                        warn!(record = %record.id, uri = %uri, error = %err, "enrichment failed");
                        return Err(err);
                    }
                };
                let labels = Self::labels_from(&body);
                if labels.is_empty() {
                    continue;
                }
                let target = doc.entry(target_field.to_string()).or_default();
                for label in labels {
                    if !target.contains(&label) {
                        target.push(label);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_uri_cache_ttl() {
        let store = MemoryStore::new();
        store_uri(&store, "urn:a", "http://auth/a", "{\"label\":\"X\"}").unwrap();

        let hit = cached_uri(&store, "urn:a", ChronoDuration::hours(1)).unwrap();
        assert_eq!(hit.unwrap().body, "{\"label\":\"X\"}");

        // Zero TTL means everything is stale.
        let miss = cached_uri(&store, "urn:a", ChronoDuration::zero()).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_store_uri_tolerates_duplicates() {
        let store = MemoryStore::new();
        store_uri(&store, "urn:a", "http://auth/a", "one").unwrap();
        store_uri(&store, "urn:a", "http://auth/a", "two").unwrap();
        let entry = cached_uri(&store, "urn:a", ChronoDuration::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(entry.body, "one");
    }

    #[test]
    fn test_labels_from_authority_body() {
        let labels = AuthorityEnricher::labels_from(
            r#"{"label": "Knuth, Donald E.", "alt_labels": ["Knuth, D. E."]}"#,
        );
        assert_eq!(labels, vec!["Knuth, Donald E.", "Knuth, D. E."]);
        assert!(AuthorityEnricher::labels_from("not json").is_empty());
    }
}
