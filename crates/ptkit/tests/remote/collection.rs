//! RemoteCollection tests — snapshot application, feed lifecycle and
//! outbound writes against the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map};

use ptkit::error::{PtkitError, RemoteErrorKind};
use ptkit::reactive::{Change, ChangeKind, Event};
use ptkit::remote::{
    CollectionRef, RemoteCollection, RemoteCollectionOptions, RemoteStore, SnapshotEntry,
    SnapshotReport,
};

use super::mock::{by_rank, trip, trip_decoder, trip_json, wait_until, MockStore, Trip, Write};

const TRIPS: &str = "users/u1/trips";

fn options(store: &Arc<MockStore>) -> RemoteCollectionOptions<Trip> {
    let store: Arc<dyn RemoteStore> = store.clone();
    RemoteCollectionOptions::new(store, CollectionRef::new(TRIPS), trip_decoder())
}

fn collection(store: &Arc<MockStore>) -> RemoteCollection<Trip> {
    RemoteCollection::new("trips", by_rank, options(store))
}

fn record_events(trips: &RemoteCollection<Trip>) -> Arc<Mutex<Vec<Event<Trip>>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    trips
        .mirror()
        .register_listener("log", move |e: &Event<Trip>| sink.lock().unwrap().push(e.clone()))
        .unwrap();
    log
}

fn record_batches(trips: &RemoteCollection<Trip>) -> Arc<Mutex<Vec<Vec<Change<Trip>>>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    trips
        .mirror()
        .register_all_change_listener("all", move |b: &[Change<Trip>]| {
            sink.lock().unwrap().push(b.to_vec())
        })
        .unwrap();
    log
}

async fn seeded(store: &Arc<MockStore>, entries: &[(&str, &str, u32)]) -> RemoteCollection<Trip> {
    let trips = collection(store);
    let snapshot = entries
        .iter()
        .map(|(id, title, rank)| SnapshotEntry::added(*id, trip_json(title, *rank)))
        .collect();
    trips.apply_snapshot(snapshot).await.unwrap();
    trips
}

// ============================================================================
// Snapshot application
// ============================================================================

#[tokio::test]
async fn added_entries_are_sorted_into_the_mirror() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("t2", "Porto", 2), ("t1", "Lisbon", 1)]).await;

    assert_eq!(
        *trips.elems(),
        vec![trip("t1", "Lisbon", 1), trip("t2", "Porto", 2)]
    );
    assert_eq!(trips.get_by_id("t2"), Some(trip("t2", "Porto", 2)));
    assert_eq!(trips.get_by_id("t9"), None);
}

#[tokio::test]
async fn snapshot_fires_one_batch_and_counts_each_entry() {
    let store = MockStore::new();
    let trips = RemoteCollection::new(
        "trips",
        by_rank,
        RemoteCollectionOptions {
            sanity_filter: Some(Arc::new(|t: &Trip| t.rank > 0)),
            ..options(&store)
        },
    );
    let events = record_events(&trips);
    let batches = record_batches(&trips);

    let report = trips
        .apply_snapshot(vec![
            SnapshotEntry::added("t1", trip_json("Lisbon", 1)),
            SnapshotEntry::added("t1", trip_json("Lisbon", 1)),
            SnapshotEntry::added("t0", trip_json("Nowhere", 0)),
            SnapshotEntry::added("bad", json!({ "title": 5 })),
        ])
        .await
        .unwrap();

    assert_eq!(
        report,
        SnapshotReport {
            applied: 1,
            ignored: 1,
            rejected: 1,
            failed: 1,
        }
    );
    assert_eq!(events.lock().unwrap().len(), 1);
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2, "registration replay plus one snapshot batch");
    assert_eq!(batches[1], vec![Change::add(trip("t1", "Lisbon", 1))]);
}

#[tokio::test]
async fn empty_snapshot_still_fires_a_batch() {
    let store = MockStore::new();
    let trips = collection(&store);
    let batches = record_batches(&trips);

    trips.apply_snapshot(Vec::new()).await.unwrap();

    assert_eq!(batches.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn modified_entry_without_local_version_past_the_end_is_added() {
    let store = MockStore::new();
    let trips = collection(&store);
    let events = record_events(&trips);

    let report = trips
        .apply_snapshot(vec![
            SnapshotEntry::added("r1", trip_json("One", 1)),
            SnapshotEntry::modified("r2", trip_json("Two", 2)),
        ])
        .await
        .unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(*trips.elems(), vec![trip("r1", "One", 1), trip("r2", "Two", 2)]);
    let kinds: Vec<_> = events.lock().unwrap().iter().map(|e| e.change.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Add, ChangeKind::Add]);
}

#[tokio::test]
async fn modified_entry_without_local_version_inside_keeps_neighbours() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("r1", "One", 1), ("r3", "Three", 3)]).await;

    trips
        .apply_snapshot(vec![SnapshotEntry::modified("r2", trip_json("Two", 2))])
        .await
        .unwrap();

    assert_eq!(
        *trips.elems(),
        vec![trip("r1", "One", 1), trip("r2", "Two", 2), trip("r3", "Three", 3)]
    );
}

#[tokio::test]
async fn modified_entry_updates_in_place_with_resolved_before() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("t1", "Lisbon", 1), ("t2", "Porto", 2)]).await;
    let events = record_events(&trips);
    trips.mirror().flush().await.unwrap();
    events.lock().unwrap().clear();

    trips
        .apply_snapshot(vec![SnapshotEntry::modified("t1", trip_json("Lisboa", 1))])
        .await
        .unwrap();

    assert_eq!(trips.get_by_id("t1"), Some(trip("t1", "Lisboa", 1)));
    assert_eq!(
        *events.lock().unwrap(),
        vec![Event {
            change: Change::modify(trip("t1", "Lisbon", 1), trip("t1", "Lisboa", 1)),
            index: 0,
        }]
    );
}

#[tokio::test]
async fn sort_key_change_is_ignored_by_default() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("t1", "Lisbon", 1), ("t2", "Porto", 9)]).await;

    let report = trips
        .apply_snapshot(vec![SnapshotEntry::modified("t1", trip_json("Lisbon", 5))])
        .await
        .unwrap();

    assert_eq!(report.ignored, 1);
    assert_eq!(trips.get_by_id("t1"), Some(trip("t1", "Lisbon", 1)));
}

#[tokio::test]
async fn sort_key_change_resorts_when_enabled() {
    let store = MockStore::new();
    let trips = RemoteCollection::new(
        "trips",
        by_rank,
        RemoteCollectionOptions {
            resort_on_key_change: Some(true),
            ..options(&store)
        },
    );
    trips
        .apply_snapshot(vec![
            SnapshotEntry::added("t1", trip_json("Lisbon", 1)),
            SnapshotEntry::added("t2", trip_json("Porto", 3)),
        ])
        .await
        .unwrap();

    trips
        .apply_snapshot(vec![SnapshotEntry::modified("t1", trip_json("Lisbon", 5))])
        .await
        .unwrap();

    assert_eq!(
        *trips.elems(),
        vec![trip("t2", "Porto", 3), trip("t1", "Lisbon", 5)]
    );
}

#[tokio::test]
async fn resorted_entry_fires_remove_then_add_and_counts_once() {
    let store = MockStore::new();
    let trips = RemoteCollection::new(
        "trips",
        by_rank,
        RemoteCollectionOptions {
            resort_on_key_change: Some(true),
            ..options(&store)
        },
    );
    trips
        .apply_snapshot(vec![
            SnapshotEntry::added("t1", trip_json("Lisbon", 1)),
            SnapshotEntry::added("t2", trip_json("Porto", 3)),
        ])
        .await
        .unwrap();
    let events = record_events(&trips);
    let batches = record_batches(&trips);
    trips.mirror().flush().await.unwrap();
    events.lock().unwrap().clear();
    batches.lock().unwrap().clear();

    let report = trips
        .apply_snapshot(vec![SnapshotEntry::modified("t1", trip_json("Lisbon", 5))])
        .await
        .unwrap();

    assert_eq!(report.applied, 1);
    let kinds: Vec<_> = events.lock().unwrap().iter().map(|e| e.change.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Remove, ChangeKind::Add]);
    assert_eq!(
        *batches.lock().unwrap(),
        vec![vec![
            Change::remove(trip("t1", "Lisbon", 1)),
            Change::add(trip("t1", "Lisbon", 5)),
        ]]
    );
}

#[tokio::test]
async fn removed_entry_removes_local_version() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("t1", "Lisbon", 1), ("t2", "Porto", 2)]).await;

    let report = trips
        .apply_snapshot(vec![
            SnapshotEntry::removed("t1", trip_json("Lisbon", 1)),
            SnapshotEntry::removed("t9", trip_json("Ghost", 4)),
        ])
        .await
        .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.ignored, 1);
    assert_eq!(*trips.elems(), vec![trip("t2", "Porto", 2)]);
}

#[tokio::test]
async fn prepare_runs_before_the_sanity_filter() {
    let store = MockStore::new();
    let trips = RemoteCollection::new(
        "trips",
        by_rank,
        RemoteCollectionOptions {
            prepare: Some(Arc::new(|mut t: Trip| {
                t.title = t.title.to_uppercase();
                t
            })),
            sanity_filter: Some(Arc::new(|t: &Trip| t.title != "SKIP")),
            ..options(&store)
        },
    );

    trips
        .apply_snapshot(vec![
            SnapshotEntry::added("t1", trip_json("lisbon", 1)),
            SnapshotEntry::added("t2", trip_json("skip", 2)),
        ])
        .await
        .unwrap();

    assert_eq!(*trips.elems(), vec![trip("t1", "LISBON", 1)]);
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[tokio::test]
async fn feed_snapshots_reach_the_mirror() {
    let store = MockStore::new();
    let trips = RemoteCollection::open(
        "trips",
        by_rank,
        RemoteCollectionOptions {
            query: Some(json!({ "rank": { "$gt": 0 } })),
            ..options(&store)
        },
    )
    .await
    .unwrap();

    store.push(TRIPS, vec![SnapshotEntry::added("t1", trip_json("Lisbon", 1))]);
    store.push(TRIPS, vec![SnapshotEntry::modified("t1", trip_json("Lisboa", 1))]);
    wait_until(|| trips.get_by_id("t1").is_some_and(|t| t.title == "Lisboa")).await;

    assert!(trips.is_subscribed());
    assert_eq!(store.queries(), vec![Some(json!({ "rank": { "$gt": 0 } }))]);
}

#[tokio::test]
async fn subscribing_twice_keeps_one_subscription() {
    let store = MockStore::new();
    let trips = collection(&store);

    trips.subscribe().await.unwrap();
    trips.subscribe().await.unwrap();

    assert_eq!(store.subscriptions(), 1);
}

#[tokio::test]
async fn feed_error_halts_until_resubscribed() {
    let store = MockStore::new();
    let trips = RemoteCollection::open("trips", by_rank, options(&store))
        .await
        .unwrap();

    store.fail_feed(TRIPS, "connection lost");
    wait_until(|| !trips.is_subscribed()).await;

    store.push(TRIPS, vec![SnapshotEntry::added("t1", trip_json("Lisbon", 1))]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(trips.elems().is_empty());

    trips.subscribe().await.unwrap();
    store.push(TRIPS, vec![SnapshotEntry::added("t2", trip_json("Porto", 2))]);
    wait_until(|| trips.get_by_id("t2").is_some()).await;
    assert!(trips.get_by_id("t1").is_none());
}

#[tokio::test]
async fn failed_subscribe_is_reported() {
    let store = MockStore::new();
    store.fail_subscribe(true);
    let trips = collection(&store);

    let err = trips.subscribe().await.unwrap_err();

    assert!(matches!(err, PtkitError::Remote(_)));
    assert!(!trips.is_subscribed());
}

#[tokio::test]
async fn clean_unsubscribes_and_empties() {
    let store = MockStore::new();
    let trips = RemoteCollection::open("trips", by_rank, options(&store))
        .await
        .unwrap();
    store.push(TRIPS, vec![SnapshotEntry::added("t1", trip_json("Lisbon", 1))]);
    wait_until(|| trips.elems().len() == 1).await;
    let events = record_events(&trips);

    trips.clean().await.unwrap();
    store.push(TRIPS, vec![SnapshotEntry::added("t2", trip_json("Porto", 2))]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!trips.is_subscribed());
    assert!(trips.elems().is_empty());
    assert_eq!(events.lock().unwrap().len(), 1, "only the registration replay");
}

// ============================================================================
// Outbound writes
// ============================================================================

#[tokio::test]
async fn writes_go_to_the_store_not_the_mirror() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("t1", "Lisbon", 1)]).await;

    let generated = trips.insert(&trip("", "Porto", 2), None).await.unwrap();
    let fixed = trips.insert(&trip("", "Faro", 3), Some("t3")).await.unwrap();
    let mut fields = Map::new();
    fields.insert("title".into(), json!("Lisboa"));
    trips.update("t1", fields).await.unwrap();
    trips.remove_at(0).await.unwrap();

    assert_eq!(generated, "generated-0");
    assert_eq!(fixed, "t3");
    assert_eq!(
        store.writes(),
        vec![
            Write::Add {
                collection: TRIPS.into(),
                record: trip_json("Porto", 2),
            },
            Write::Set {
                collection: TRIPS.into(),
                id: "t3".into(),
                record: trip_json("Faro", 3),
                merge: false,
            },
            Write::Set {
                collection: TRIPS.into(),
                id: "t1".into(),
                record: json!({ "title": "Lisboa" }),
                merge: true,
            },
            Write::Delete {
                collection: TRIPS.into(),
                id: "t1".into(),
            },
        ]
    );
    assert_eq!(*trips.elems(), vec![trip("t1", "Lisbon", 1)]);
}

#[tokio::test]
async fn remove_uses_the_record_id() {
    let store = MockStore::new();
    let trips = seeded(&store, &[("t1", "Lisbon", 1)]).await;

    trips.remove(&trip("t1", "Lisbon", 1)).await.unwrap();
    trips.remove_by_id("t7").await.unwrap();

    assert_eq!(
        store.writes(),
        vec![
            Write::Delete {
                collection: TRIPS.into(),
                id: "t1".into(),
            },
            Write::Delete {
                collection: TRIPS.into(),
                id: "t7".into(),
            },
        ]
    );
}

#[tokio::test]
async fn remove_at_out_of_range_errors() {
    let store = MockStore::new();
    let trips = collection(&store);

    let err = trips.remove_at(2).await.unwrap_err();

    assert!(matches!(err, PtkitError::IndexOutOfRange { index: 2, len: 0 }));
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn failed_write_surfaces_the_remote_error() {
    let store = MockStore::new();
    store.fail_writes(true);
    let trips = collection(&store);

    let err = trips.remove_by_id("t1").await.unwrap_err();

    match err {
        PtkitError::Remote(e) => assert_eq!(e.kind, RemoteErrorKind::PermissionDenied),
        other => panic!("expected remote error, got {other:?}"),
    }
}
