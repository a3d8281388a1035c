//! ListIdentifiers mark-and-sweep deletion reconciliation.

use recman::harvest::{clear_deletion_marks, mark_identifiers, sweep_unmarked};
use recman::store::{MemoryStore, Store, RECORD_COLLECTION};
use recman::test_support::{book_payload, dc_source, ingest, sources_map};
use recman::Record;

fn record(store: &MemoryStore, id: &str) -> Record {
    Record::from_doc(store.get(RECORD_COLLECTION, id).unwrap().unwrap()).unwrap()
}

#[test]
fn unlisted_records_are_tombstoned() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1"], dc_source(false));

    for local in ["x", "y", "z"] {
        ingest(
            &store,
            "s1",
            &sources["s1"],
            &format!("oai:{local}"),
            &book_payload(local, &format!("Title {local}"), None, None),
        )?;
    }

    clear_deletion_marks(&store, "s1")?;
    // The server listed only x and y this time.
    mark_identifiers(
        &store,
        "s1",
        &["oai:x".to_string(), "oai:y".to_string()],
    )?;
    let removed = sweep_unmarked(&store, "s1")?;

    assert_eq!(removed, 1);
    assert!(record(&store, "s1.z").deleted);
    assert!(!record(&store, "s1.x").deleted);
    assert!(!record(&store, "s1.y").deleted);
    Ok(())
}

#[test]
fn sweep_ignores_other_sources() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1", "s2"], dc_source(false));

    ingest(
        &store,
        "s1",
        &sources["s1"],
        "oai:x",
        &book_payload("x", "Title x", None, None),
    )?;
    ingest(
        &store,
        "s2",
        &sources["s2"],
        "oai:other",
        &book_payload("other", "Unrelated", None, None),
    )?;

    clear_deletion_marks(&store, "s1")?;
    mark_identifiers(&store, "s1", &[])?;
    let removed = sweep_unmarked(&store, "s1")?;

    assert_eq!(removed, 1);
    assert!(record(&store, "s1.x").deleted);
    assert!(!record(&store, "s2.other").deleted);
    Ok(())
}

#[test]
fn repeated_sweep_is_stable() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let sources = sources_map(&["s1"], dc_source(false));

    for local in ["x", "y"] {
        ingest(
            &store,
            "s1",
            &sources["s1"],
            &format!("oai:{local}"),
            &book_payload(local, &format!("Title {local}"), None, None),
        )?;
    }

    let ids = vec!["oai:x".to_string(), "oai:y".to_string()];
    clear_deletion_marks(&store, "s1")?;
    mark_identifiers(&store, "s1", &ids)?;
    assert_eq!(sweep_unmarked(&store, "s1")?, 0);

    clear_deletion_marks(&store, "s1")?;
    mark_identifiers(&store, "s1", &ids)?;
    assert_eq!(sweep_unmarked(&store, "s1")?, 0);
    Ok(())
}
