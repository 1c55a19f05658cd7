//! Applier replay, recovery and resource release

use indexbuild_coordinator::{
    ApplyOutcome, BuildState, ConflictPolicy, CoordinatorConfig, CoordinatorError,
    IndexBuildCoordinator, InMemoryOplog, LeadershipEvent, OpTime, OplogEntry,
    RecordingDiagnostics,
};
use indexbuild_storage::{IndexCatalogStore, KeySpec, MemoryCatalogStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const NS: &str = "test.coll";

fn node(store: &MemoryCatalogStore) -> (IndexBuildCoordinator, Arc<RecordingDiagnostics>) {
    let diagnostics = Arc::new(RecordingDiagnostics::new());
    let config = CoordinatorConfig::default().with_scan_chunk_size(4);
    let coordinator =
        IndexBuildCoordinator::new(config, Arc::new(store.clone()), diagnostics.clone()).unwrap();
    (coordinator, diagnostics)
}

async fn seeded_store(count: usize) -> MemoryCatalogStore {
    let store = MemoryCatalogStore::new();
    let docs = (0..count).map(|i| json!({"a": i, "b": i % 5})).collect();
    store.insert_documents(NS, docs).await.unwrap();
    store
}

#[tokio::test]
async fn test_repeated_abort_cycles_release_everything() {
    let store = seeded_store(64).await;
    store.set_scan_delay(Duration::from_millis(2));
    let (node, diagnostics) = node(&store);

    for term in 1..=10u64 {
        node.step_up(term);
        let handle = node
            .start_index_build(NS, "myidx", KeySpec::from_json(json!({"a": 1})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;

        node.step_down(term + 1);
        // Either the abort lands or the build already passed its commit fence
        match handle.wait().await {
            Err(CoordinatorError::BuildAbortedByInterrupt { .. }) => {}
            Ok(_) => {
                let published = store.find_index(NS, "myidx").await.unwrap().unwrap();
                assert_eq!(published.descriptor.name, "myidx");
                return;
            }
            Err(other) => panic!("Unexpected error: {other:?}"),
        }

        assert!(node.registry().is_empty(), "entry leaked in term {term}");
        assert_eq!(store.open_allocations(), 0, "storage leaked in term {term}");
    }

    assert_eq!(diagnostics.count("build_aborted"), 10);
    assert!(store.find_index(NS, "myidx").await.unwrap().is_none());
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let store = seeded_store(10).await;
    let oplog = InMemoryOplog::new();
    oplog
        .append_create_index(1, NS, "a_1", KeySpec::from_json(json!({"a": 1})))
        .unwrap();
    oplog
        .append_create_index(1, NS, "b_1", KeySpec::from_json(json!({"b": 1})))
        .unwrap();

    let (first, _) = node(&store);
    let report = first.applier().run_from(&oplog).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.builds_committed, 2);
    assert_eq!(report.last_applied, Some(OpTime::new(1, 2)));

    // Same node again: nothing after the durable position
    let again = first.applier().run_from(&oplog).await.unwrap();
    assert_eq!(again.applied, 0);

    // A fresh node that lost its position re-applies as no-ops
    store.record_applied(OpTime::new(0, 0)).await.unwrap();
    let (restarted, _) = node(&store);
    restarted.recover().await.unwrap();
    let replayed = restarted.applier().run_from(&oplog).await.unwrap();
    assert_eq!(replayed.applied, 2);
    assert_eq!(replayed.builds_committed, 0);
    assert_eq!(store.list_indexes(NS).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_apply_entry_skips_applied_positions() {
    let store = seeded_store(3).await;
    let (node, _) = node(&store);
    let entry = OplogEntry::create_index(
        OpTime::new(3, 7),
        NS,
        "a_1",
        KeySpec::from_json(json!({"a": 1})),
    );

    match node.applier().apply_entry(&entry).await.unwrap() {
        ApplyOutcome::Started(handle) => {
            handle.wait().await.unwrap();
        }
        other => panic!("Expected Started, got {other:?}"),
    }
    assert!(matches!(
        node.applier().apply_entry(&entry).await.unwrap(),
        ApplyOutcome::Skipped
    ));
    assert_eq!(node.applier().last_applied(), Some(OpTime::new(3, 7)));
}

#[tokio::test]
async fn test_catalog_divergence_is_fatal() {
    let store = seeded_store(3).await;
    let (primary, _) = node(&store);
    primary.step_up(1);
    primary
        .start_index_build(NS, "myidx", KeySpec::from_json(json!({"a": 1})))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    primary.step_down(2);

    let err = primary
        .applier()
        .apply(NS, "myidx", KeySpec::from_json(json!({"b": 1})), OpTime::new(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::CatalogDivergence { .. }));
    assert!(primary.halt_signal().is_halted());

    // Local commands are refused once halted, even after stepping up again
    primary.step_up(3);
    assert!(matches!(
        primary
            .start_index_build(NS, "other", KeySpec::from_json(json!({"b": 1})))
            .await,
        Err(CoordinatorError::Halted(_))
    ));
}

#[tokio::test]
async fn test_compound_key_order_divergence_is_fatal() {
    let store = seeded_store(3).await;
    let (primary, diagnostics) = node(&store);
    primary.step_up(1);
    primary
        .start_index_build(NS, "idx", KeySpec::from_json(json!({"a": 1, "b": 1})))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    primary.step_down(2);

    // Same fields, different order: a different index
    let err = primary
        .applier()
        .apply(NS, "idx", KeySpec::from_json(json!({"b": 1, "a": 1})), OpTime::new(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::CatalogDivergence { .. }));
    assert!(primary.halt_signal().is_halted());
    assert_eq!(diagnostics.count("fatal_halt"), 1);
}

/// Primary in term 1 holding `myidx` on `{a: 1}` at the fail point, with the
/// matching entry in the log
async fn held_primary_build(store: &MemoryCatalogStore) -> (IndexBuildCoordinator, InMemoryOplog) {
    let (primary, _) = node(store);
    primary.fail_points().hang_after_initializing_index_build.enable();
    primary.step_up(1);
    primary
        .start_index_build(NS, "myidx", KeySpec::from_json(json!({"a": 1})))
        .await
        .unwrap();

    let oplog = InMemoryOplog::new();
    oplog
        .append_create_index(1, NS, "myidx", KeySpec::from_json(json!({"a": 1})))
        .unwrap();
    (primary, oplog)
}

#[tokio::test]
async fn test_replay_position_not_durable_before_covering_build_commits() {
    let store = seeded_store(12).await;
    let (primary, oplog) = held_primary_build(&store).await;

    {
        let replay = primary.applier().run_from(&oplog);
        tokio::pin!(replay);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut replay)
                .await
                .is_err(),
            "replay finished while the covering build was still running"
        );
        assert_eq!(store.last_applied().await.unwrap(), None);

        // Crash while the covering build is held
        primary.terminate();
        assert!(matches!(
            replay.await,
            Err(CoordinatorError::Terminated(_))
        ));
    }
    assert_eq!(store.last_applied().await.unwrap(), None);
    drop(primary);

    let (restarted, _) = node(&store);
    let recovery = restarted.recover().await.unwrap();
    assert_eq!(recovery.rolled_back.len(), 1);
    assert_eq!(recovery.last_applied, None);

    let report = restarted.applier().run_from(&oplog).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.builds_committed, 1);
    let published = store.find_index(NS, "myidx").await.unwrap().unwrap();
    assert_eq!(published.descriptor.key_spec, KeySpec::from_json(json!({"a": 1})));
    assert_eq!(published.entry_count, 12);
    assert_eq!(store.open_allocations(), 0);
}

#[tokio::test]
async fn test_replay_waits_for_covering_build_to_publish() {
    let store = seeded_store(12).await;
    let (primary, oplog) = held_primary_build(&store).await;

    let replay = primary.applier().run_from(&oplog);
    tokio::pin!(replay);
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut replay)
        .await
        .is_err());

    primary
        .fail_points()
        .hang_after_initializing_index_build
        .disable();
    let report = replay.await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.builds_committed, 0);
    assert_eq!(report.last_applied, Some(OpTime::new(1, 1)));

    // Durable only after the index exists
    assert_eq!(store.last_applied().await.unwrap(), Some(OpTime::new(1, 1)));
    assert!(store.find_index(NS, "myidx").await.unwrap().is_some());
    assert!(primary.registry().is_empty());
}

#[tokio::test]
async fn test_stale_term_build_conflicts() {
    let store = seeded_store(3).await;
    let (node, diagnostics) = node(&store);
    node.fail_points().hang_after_initializing_index_build.enable();

    // Replicated build from term 1 still running (held at the fail point)
    let held = match node
        .applier()
        .apply(NS, "myidx", KeySpec::from_json(json!({"b": 1})), OpTime::new(1, 1))
        .await
        .unwrap()
    {
        ApplyOutcome::Started(handle) => handle,
        other => panic!("Expected Started, got {other:?}"),
    };

    // Same name from term 2, even with the same pattern
    let err = node
        .applier()
        .apply(NS, "myidx", KeySpec::from_json(json!({"b": 1})), OpTime::new(2, 2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::ReplicationConflictUnresolved {
            state: BuildState::Initializing,
            ..
        }
    ));
    assert_eq!(diagnostics.count("fatal_halt"), 1);

    node.fail_points().hang_after_initializing_index_build.disable();
    held.wait().await.unwrap();
}

#[tokio::test]
async fn test_secondary_replicated_build_survives_stepdown_of_other_terms() {
    let store = seeded_store(8).await;
    let (node, _) = node(&store);
    node.fail_points().hang_after_initializing_index_build.enable();

    let handle = match node
        .applier()
        .apply(NS, "b_1", KeySpec::from_json(json!({"b": 1})), OpTime::new(5, 1))
        .await
        .unwrap()
    {
        ApplyOutcome::Started(handle) => handle,
        other => panic!("Expected Started, got {other:?}"),
    };

    // Losing leadership of an older term does not touch builds of term 5
    node.step_up(3);
    assert!(node.step_down(4).is_empty());

    node.fail_points().hang_after_initializing_index_build.disable();
    assert_eq!(handle.wait().await.unwrap().entries_indexed, 8);
}

#[tokio::test]
async fn test_leadership_watch_channel_drives_stepdown() {
    let store = seeded_store(32).await;
    store.set_scan_delay(Duration::from_millis(5));
    let (node, diagnostics) = node(&store);
    let node = Arc::new(node);

    let (leadership, events) = watch::channel(LeadershipEvent::step_up(1));
    let listener = node.clone().watch_leadership(events);

    for _ in 0..100 {
        if node.replication().is_primary() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let handle = node
        .start_index_build(NS, "myidx", KeySpec::from_json(json!({"a": 1})))
        .await
        .unwrap();

    leadership.send(LeadershipEvent::step_down(2)).unwrap();
    assert!(matches!(
        handle.wait().await,
        Err(CoordinatorError::BuildAbortedByInterrupt { .. })
    ));
    assert_eq!(diagnostics.count("abort_initiated"), 1);

    drop(leadership);
    listener.await.unwrap();
}

#[tokio::test]
async fn test_recover_refuses_with_live_builds() {
    let store = seeded_store(3).await;
    let (node, _) = node(&store);
    node.fail_points().hang_after_initializing_index_build.enable();
    node.step_up(1);
    let _handle = node
        .start_index_build(NS, "myidx", KeySpec::from_json(json!({"a": 1})))
        .await
        .unwrap();

    assert!(node.recover().await.is_err());
    node.terminate();
}

#[tokio::test]
async fn test_wait_policy_times_out_into_halt() {
    let store = seeded_store(3).await;
    let diagnostics = Arc::new(RecordingDiagnostics::new());
    let config = CoordinatorConfig::default()
        .with_conflict_policy(ConflictPolicy::wait_for(Duration::from_millis(40)));
    let node = IndexBuildCoordinator::new(config, Arc::new(store.clone()), diagnostics.clone())
        .unwrap();
    node.step_up(1);
    node.fail_points().hang_after_initializing_index_build.enable();

    let handle = node
        .start_index_build(NS, "myidx", KeySpec::from_json(json!({"a": 1})))
        .await
        .unwrap();
    node.step_down(2);

    let err = node
        .applier()
        .apply(NS, "myidx", KeySpec::from_json(json!({"b": 1})), OpTime::new(2, 1))
        .await
        .unwrap_err();
    match err {
        CoordinatorError::ReplicationConflictUnresolved { waited_ms, .. } => {
            assert!(waited_ms >= 40)
        }
        other => panic!("Expected ReplicationConflictUnresolved, got {other:?}"),
    }
    assert!(node.halt_signal().is_halted());

    node.fail_points().hang_after_initializing_index_build.disable();
    assert!(handle.wait().await.is_err());
    assert_eq!(store.open_allocations(), 0);
}
