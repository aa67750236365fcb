use std::collections::BTreeMap;

use spectre::block_store::export::{build_archive, import_events, ImportEnvelope};
use spectre::block_store::format::{FileFooter, FOOTER_LEN};
use spectre::block_store::{BlockCache, BlockStore, EventQuery};
use spectre::event::{Event, EventKind, ResourceIdentity, ResourceStatus};
use tempfile::TempDir;
use uuid::Uuid;

fn event(kind: &str, name: &str, uid: &str, timestamp: i64) -> Event {
    Event {
        id: Uuid::new_v4(),
        timestamp,
        kind: EventKind::Create,
        identity: ResourceIdentity {
            api_group: if kind == "Deployment" { "apps".into() } else { String::new() },
            api_version: "v1".into(),
            kind: kind.into(),
            namespace: Some("default".into()),
            name: name.into(),
            uid: uid.into(),
            involved_object_uid: None,
        },
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        payload: serde_json::json!({"metadata": {"name": name}}),
        status: ResourceStatus::Ready,
        raw_size: 100,
        normalized_size: 50,
    }
}

async fn store_in(dir: &TempDir) -> BlockStore {
    BlockStore::open(dir.path(), 10 * 1024 * 1024, BlockCache::new(4 * 1024 * 1024))
        .await
        .unwrap()
}

#[tokio::test]
async fn write_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let original = vec![
        event("Pod", "p1", "uid-p1", 1_000_000_000_000),
        event("Pod", "p1", "uid-p1", 1_000_000_000_001),
        event("Service", "s1", "uid-s1", 1_000_000_000_002),
    ];
    for e in &original {
        store.append(e.clone()).await.unwrap();
    }
    store.flush().await.unwrap();

    let result = store.query(&EventQuery::range(0, i64::MAX)).await;
    assert_eq!(result.events.len(), 3);
    for (read, written) in result.events.iter().zip(&original) {
        assert_eq!(read.id, written.id);
        assert_eq!(read.timestamp, written.timestamp);
        assert_eq!(read.kind, written.kind);
        assert_eq!(read.identity, written.identity);
        assert_eq!(read.payload, written.payload);
    }
}

#[tokio::test]
async fn per_uid_order_is_monotonic_even_for_equal_input_timestamps() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    // Same uid, identical input timestamps: the store must bump them apart.
    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store.flush().await.unwrap();

    let result = store.query(&EventQuery::range(0, i64::MAX)).await;
    assert_eq!(result.events.len(), 2);
    assert!(result.events[0].timestamp < result.events[1].timestamp);
}

#[tokio::test]
async fn query_skips_blocks_by_metadata() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store
        .append(event("Deployment", "d1", "uid-d1", 1_000_000_300_000_000_000))
        .await
        .unwrap();
    store
        .append(event("Service", "s1", "uid-s1", 1_000_000_600_000_000_000))
        .await
        .unwrap();
    store.flush().await.unwrap();

    let mut query = EventQuery::range(0, 2_000_000_000_000_000_000);
    query.kind = Some("Deployment".into());
    let result = store.query(&query).await;

    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events[0].identity.name, "d1");
    // Pod and Service events land in different hour files; their blocks are
    // skipped purely from index metadata.
    assert_eq!(result.blocks_scanned, 1);
    assert_eq!(result.blocks_skipped, 2);
}

#[tokio::test]
async fn empty_range_returns_empty_result_with_zero_counters() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store.flush().await.unwrap();

    // from > to is an empty range.
    let result = store.query(&EventQuery::range(10, 5)).await;
    assert!(result.events.is_empty());
    assert_eq!(result.files_searched, 0);
    assert_eq!(result.blocks_scanned, 0);
    assert_eq!(result.blocks_skipped, 0);
}

#[tokio::test]
async fn single_event_file_yields_one_block() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store.flush().await.unwrap();

    let result = store.query(&EventQuery::range(0, i64::MAX)).await;
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.blocks_scanned, 1);
    assert_eq!(result.blocks_skipped, 0);
}

#[tokio::test]
async fn export_import_round_trip() {
    let source_dir = TempDir::new().unwrap();
    let source = store_in(&source_dir).await;
    for i in 0..5 {
        source
            .append(event("Pod", &format!("p{i}"), &format!("uid-{i}"), 1_000_000_000_000 + i))
            .await
            .unwrap();
    }
    source.flush().await.unwrap();

    // Archive assembles without error and contains the hour file.
    let archive = build_archive(&source, 0, i64::MAX, false, false).await.unwrap();
    assert!(!archive.is_empty());

    // Import the same events into a fresh store via the JSON envelope.
    let original = source.query(&EventQuery::range(0, i64::MAX)).await.events;
    let envelope = ImportEnvelope {
        events: original
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect(),
    };

    let target_dir = TempDir::new().unwrap();
    let target = store_in(&target_dir).await;
    let report = import_events(&target, envelope).await;
    assert_eq!(report.imported, 5);
    assert_eq!(report.failed, 0);
    target.flush().await.unwrap();

    let restored = target.query(&EventQuery::range(0, i64::MAX)).await.events;
    assert_eq!(restored.len(), original.len());
    for (a, b) in restored.iter().zip(&original) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.identity, b.identity);
    }
}

#[tokio::test]
async fn import_extracts_involved_object_uid_for_kubernetes_events() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let mut raw = event("Event", "pod-crashed", "uid-evt", 1_000_000_000_000);
    raw.payload = serde_json::json!({
        "involvedObject": {"uid": "uid-pod", "kind": "Pod"},
        "reason": "BackOff",
    });
    let envelope = ImportEnvelope {
        events: vec![serde_json::to_value(&raw).unwrap()],
    };
    let report = import_events(&store, envelope).await;
    assert_eq!(report.imported, 1);
    store.flush().await.unwrap();

    let events = store.query(&EventQuery::range(0, i64::MAX)).await.events;
    assert_eq!(events[0].identity.involved_object_uid.as_deref(), Some("uid-pod"));
}

#[tokio::test]
async fn crash_recovery_salvages_sealed_blocks() {
    let dir = TempDir::new().unwrap();
    {
        // A one-byte segment target seals a block per event, so both events
        // are durable in the temp file even though it was never closed.
        let store = BlockStore::open(dir.path(), 1, None).await.unwrap();
        store
            .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
            .await
            .unwrap();
        store
            .append(event("Pod", "p2", "uid-p2", 1_000_000_000_001))
            .await
            .unwrap();
        // Dropped without flush: simulates a crash mid-hour.
    }

    let store = store_in(&dir).await;
    let result = store.query(&EventQuery::range(0, i64::MAX)).await;
    assert_eq!(result.events.len(), 2);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn corrupt_block_is_skipped_and_reported() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    // Two events in different hours give two sealed files.
    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store
        .append(event("Pod", "p2", "uid-p2", 1_000_000_300_000_000_000))
        .await
        .unwrap();
    store.flush().await.unwrap();
    drop(store);

    // Flip a byte inside the first file's block payload, just before the
    // index section.
    let first = dir.path().join("1970-01-01-00");
    let mut bytes = std::fs::read(&first).unwrap();
    let footer = FileFooter::decode(&bytes[bytes.len() - FOOTER_LEN..]).unwrap();
    let target = footer.index_offset as usize - 5;
    bytes[target] ^= 0xff;
    std::fs::write(&first, &bytes).unwrap();

    let store = store_in(&dir).await;
    let result = store.query(&EventQuery::range(0, i64::MAX)).await;
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events[0].identity.name, "p2");
    assert!(result.blocks_skipped >= 1);
    assert!(!result.errors.is_empty());
}

#[tokio::test]
async fn metadata_aggregates_sealed_files() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    store
        .append(event("Pod", "p1", "uid-p1", 1_000_000_000_000))
        .await
        .unwrap();
    store
        .append(event("Deployment", "d1", "uid-d1", 1_000_000_000_001))
        .await
        .unwrap();
    store.flush().await.unwrap();

    let meta = store.metadata().await.unwrap();
    assert_eq!(meta.event_count, 2);
    assert_eq!(meta.kinds.get("Pod"), Some(&1));
    assert_eq!(meta.kinds.get("Deployment"), Some(&1));
    assert_eq!(meta.namespaces.get("default"), Some(&2));
}
