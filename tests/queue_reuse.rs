//! Update pipeline: queue construction, finalized-queue reuse, merged
//! document synthesis. Delivery goes into a recording sink, so nothing
//! here needs a Solr instance.

use chrono::{DateTime, Utc};
use recman::config::SiteSettings;
use recman::mapper::FieldMapper;
use recman::store::{MemoryStore, Store, RECORD_COLLECTION};
use recman::test_support::{book_payload, dc_source, ingest, sources_map, RecordingSink};
use recman::{Cancellation, Deduplicator, Record, SolrUpdater, UpdateOptions};

fn options_from_epoch() -> UpdateOptions {
    UpdateOptions {
        from: Some(DateTime::<Utc>::UNIX_EPOCH),
        ..UpdateOptions::default()
    }
}

#[tokio::test]
async fn second_run_reuses_queue_and_adds_nothing() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1"], dc_source(false));
    ingest(
        &store,
        "s1",
        &sources["s1"],
        "oai:a",
        &book_payload("A", "First Book", None, Some("1990")),
    )?;
    ingest(
        &store,
        "s1",
        &sources["s1"],
        "oai:b",
        &book_payload("B", "Second Book", None, Some("1991")),
    )?;

    let mapper = FieldMapper::default();
    let site = SiteSettings::default();
    let updater = SolrUpdater::new(&store, &sources, &mapper, &[], &site, Cancellation::new());

    let mut first = RecordingSink::new();
    let stats = updater.update_solr(&mut first, &options_from_epoch()).await?;
    assert!(!stats.queue_reused);
    assert_eq!(stats.updated, 2);
    assert_eq!(first.adds.len(), 2);

    // Same parameters, no intervening writes: the finalized queue is
    // reused and delivery resumes past its end.
    let mut second = RecordingSink::new();
    let stats = updater.update_solr(&mut second, &options_from_epoch()).await?;
    assert!(stats.queue_reused);
    assert_eq!(second.adds.len(), 0);
    Ok(())
}

#[tokio::test]
async fn merged_document_carries_group_id_and_union() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1", "s2"], dc_source(true));
    ingest(
        &store,
        "s1",
        &sources["s1"],
        "oai:a",
        &book_payload(
            "A",
            "The Art of Computer Programming",
            Some("0-201-03801-3"),
            Some("1997"),
        ),
    )?;
    ingest(
        &store,
        "s2",
        &sources["s2"],
        "oai:b",
        &book_payload(
            "B",
            "Art of Computer Programming",
            Some("9780201038019"),
            Some("1997"),
        ),
    )?;
    Deduplicator::new(&store, &sources).run(None, &Cancellation::new())?;

    let group_id = {
        let doc = store.get(RECORD_COLLECTION, "s1.A")?.unwrap();
        Record::from_doc(doc)?.dedup_id.unwrap()
    };

    let mapper = FieldMapper::default();
    let site = SiteSettings::default();
    let updater = SolrUpdater::new(&store, &sources, &mapper, &[], &site, Cancellation::new());
    let mut sink = RecordingSink::new();
    let stats = updater.update_solr(&mut sink, &options_from_epoch()).await?;

    assert_eq!(stats.updated, 1, "one merged document for the pair");
    let merged = &sink.adds[0];
    assert_eq!(merged["id"], group_id.as_str());
    assert_eq!(merged["merged_boolean"], true);
    // Both source collections survive the union.
    let collections = merged["collection"].as_array().unwrap();
    assert!(collections.contains(&serde_json::json!("s1")));
    assert!(collections.contains(&serde_json::json!("s2")));
    // Stand-alone member documents are withdrawn.
    assert!(sink.deletes.contains(&"s1.A".to_string()));
    assert!(sink.deletes.contains(&"s2.B".to_string()));
    Ok(())
}

#[tokio::test]
async fn deleted_record_emits_solr_delete() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1"], dc_source(false));
    ingest(
        &store,
        "s1",
        &sources["s1"],
        "oai:a",
        &book_payload("A", "Ephemeral", None, None),
    )?;
    recman::Ingestor::new(&store, "s1", &sources["s1"]).store_record("oai:a", true, "")?;

    let mapper = FieldMapper::default();
    let site = SiteSettings::default();
    let updater = SolrUpdater::new(&store, &sources, &mapper, &[], &site, Cancellation::new());
    let mut sink = RecordingSink::new();
    let stats = updater.update_solr(&mut sink, &options_from_epoch()).await?;

    assert_eq!(stats.deleted, 1);
    assert_eq!(sink.deletes, vec!["s1.A"]);
    assert!(sink.adds.is_empty());
    Ok(())
}

#[tokio::test]
async fn single_id_filter_limits_delivery() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1"], dc_source(false));
    for (local, title) in [("A", "First Book"), ("B", "Second Book")] {
        ingest(
            &store,
            "s1",
            &sources["s1"],
            &format!("oai:{local}"),
            &book_payload(local, title, None, None),
        )?;
    }

    let mapper = FieldMapper::default();
    let site = SiteSettings::default();
    let updater = SolrUpdater::new(&store, &sources, &mapper, &[], &site, Cancellation::new());
    let mut sink = RecordingSink::new();
    let options = UpdateOptions {
        from: Some(DateTime::<Utc>::UNIX_EPOCH),
        single_id: Some("s1.B".to_string()),
        ..UpdateOptions::default()
    };
    updater.update_solr(&mut sink, &options).await?;

    assert_eq!(sink.added_ids(), vec!["s1.B"]);
    Ok(())
}
