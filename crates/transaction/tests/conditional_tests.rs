//! Tests for conditional create, update, upsert and delete.

mod common;

use helios_transaction::config::ProcessorConfig;
use helios_transaction::error::{ResolutionError, StorageError, TransactionError};
use helios_transaction::types::{
    Bundle, BundleEntry, EntryOutcome, RequestContext, RequestPartitionId, Resolution,
};

use common::*;

const FIRST: &str = "urn:uuid:9f0c3f52-1b8a-4d5e-8c11-2a3b4c5d6e01";
const SECOND: &str = "urn:uuid:9f0c3f52-1b8a-4d5e-8c11-2a3b4c5d6e02";

// ============================================================================
// Conditional Create
// ============================================================================

/// Test that identical conditional creates in one bundle share one resource.
#[tokio::test]
async fn test_identical_conditional_creates_share_one_resource() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let expression = mrn_match("123");

    let bundle = Bundle::new(vec![
        BundleEntry::create(patient("123"))
            .with_full_url(FIRST)
            .with_if_none_exist(&expression),
        BundleEntry::create(patient("123"))
            .with_full_url(SECOND)
            .with_if_none_exist(&expression),
        BundleEntry::create(observation(SECOND)),
    ]);
    let response = commit(&processor, bundle).await;

    let first = response.for_placeholder(FIRST).unwrap();
    let second = response.for_placeholder(SECOND).unwrap();
    assert!(matches!(first, EntryOutcome::Created { .. }));
    assert!(matches!(second, EntryOutcome::NoOp { .. }));
    assert_eq!(first.persistent_id(), second.persistent_id());

    let observation = store.get(response.entries[2].identity().unwrap()).unwrap();
    assert_eq!(
        observation.content["subject"]["reference"],
        serde_json::json!(first.identity().unwrap().to_string())
    );
    assert_eq!(store.len(), 2);
    assert_eq!(response.stats.match_queries, 1);
}

/// Test that a conditional create matching a committed resource is a no-op.
#[tokio::test]
async fn test_conditional_create_matches_existing() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 2).await;
    store.reset_query_counts();

    let bundle = Bundle::new(vec![
        BundleEntry::create(patient("mrn-1"))
            .with_full_url(FIRST)
            .with_if_none_exist(mrn_match("mrn-1")),
    ]);
    let response = commit(&processor, bundle).await;

    match response.for_placeholder(FIRST) {
        Some(EntryOutcome::NoOp { identity, pid }) => {
            assert_eq!(identity.as_ref(), Some(&identities[1]));
            assert!(pid.is_some());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(store.len(), 2);
    assert_eq!(store.query_counts().hash_lookups, 1);
}

/// Test that a conditional create without match creates the resource.
#[tokio::test]
async fn test_conditional_create_without_match_creates() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    seed_patients(&processor, 1).await;

    let response = commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient("fresh")).with_if_none_exist(mrn_match("fresh")),
        ]),
    )
    .await;

    assert!(matches!(response.entries[0], EntryOutcome::Created { .. }));
    assert_eq!(store.len(), 2);
}

// ============================================================================
// Conditional Update and Upsert
// ============================================================================

/// Test that an upsert creates on the first run and updates on the second.
#[tokio::test]
async fn test_conditional_upsert_creates_then_updates() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let bundle = Bundle::new(vec![BundleEntry::conditional_upsert(
        mrn_match("777"),
        patient("777"),
    )]);

    let first = commit(&processor, bundle.clone()).await;
    assert!(matches!(first.entries[0], EntryOutcome::Created { version: 1, .. }));

    let second = commit(&processor, bundle).await;
    assert!(matches!(second.entries[0], EntryOutcome::Updated { version: 2, .. }));
    assert_eq!(first.entries[0].persistent_id(), second.entries[0].persistent_id());
    assert_eq!(store.len(), 1);
}

/// Test that an update by match URL that matches nothing fails.
#[tokio::test]
async fn test_update_by_match_without_result_fails() {
    let (store, processor) = memory_processor(ProcessorConfig::default());

    let err = processor
        .process_transaction(
            &Bundle::new(vec![BundleEntry::update_by_match(
                mrn_match("absent"),
                patient("absent"),
            )]),
            &RequestContext::new(),
        )
        .await
        .unwrap_err();

    let TransactionError::RolledBack { source, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(matches!(
        source.as_ref(),
        StorageError::Resolution(ResolutionError::NoMatch { .. })
    ));
    assert!(store.is_empty());
}

/// Test that a match URL hitting two resources fails during bulk resolution.
#[tokio::test]
async fn test_ambiguous_match_fails() {
    let (_store, processor) = memory_processor(ProcessorConfig::default());
    commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient_with_id("twin-a", "shared")),
            BundleEntry::create(patient_with_id("twin-b", "shared")),
        ]),
    )
    .await;

    let err = processor
        .process_transaction(
            &Bundle::new(vec![BundleEntry::conditional_upsert(
                mrn_match("shared"),
                patient("shared"),
            )]),
            &RequestContext::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some("matches-resolved"));
    let TransactionError::RolledBack { source, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(matches!(
        source.as_ref(),
        StorageError::Resolution(ResolutionError::AmbiguousMatch { .. })
    ));
}

/// Test that the per-entry path reports multiple matches when bulk resolution is off.
#[tokio::test]
async fn test_multiple_matches_on_per_entry_path() {
    let (_store, processor) =
        memory_processor(ProcessorConfig::default().with_bulk_match_resolution(false));
    commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient_with_id("twin-a", "shared")),
            BundleEntry::create(patient_with_id("twin-b", "shared")),
        ]),
    )
    .await;

    let err = processor
        .process_transaction(
            &Bundle::new(vec![BundleEntry::delete_by_match(mrn_match("shared"))]),
            &RequestContext::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some("entries-applied"));
    let TransactionError::RolledBack { source, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(matches!(
        source.as_ref(),
        StorageError::Resolution(ResolutionError::MultipleMatches { count: 2, .. })
    ));
}

// ============================================================================
// Standing Cache
// ============================================================================

/// Test that committed resolutions are reused and invalidated by deletes.
#[tokio::test]
async fn test_standing_cache_reuse_and_invalidation() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let expression = mrn_match("cached");

    let created = commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient("cached")).with_if_none_exist(&expression),
        ]),
    )
    .await;
    let pid = created.entries[0].persistent_id().unwrap();
    assert_eq!(
        processor
            .match_url_cache()
            .get(&RequestPartitionId::AllPartitions, "Patient", &expression),
        Some(Resolution::Found(pid))
    );

    store.reset_query_counts();
    let again = commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient("cached")).with_if_none_exist(&expression),
        ]),
    )
    .await;
    assert!(matches!(again.entries[0], EntryOutcome::NoOp { .. }));
    assert_eq!(again.stats.match_queries, 0);
    assert_eq!(store.query_counts().hash_lookups, 0);

    let deleted = commit(
        &processor,
        Bundle::new(vec![BundleEntry::delete_by_match(&expression)]),
    )
    .await;
    assert!(matches!(deleted.entries[0], EntryOutcome::Deleted { .. }));
    assert!(
        processor
            .match_url_cache()
            .get(&RequestPartitionId::AllPartitions, "Patient", &expression)
            .is_none()
    );

    let recreated = commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient("cached")).with_if_none_exist(&expression),
        ]),
    )
    .await;
    assert!(matches!(recreated.entries[0], EntryOutcome::Created { .. }));
}
