//! Tests for bulk resolution, prefetching and partition scoping.

mod common;

use std::sync::Arc;

use serde_json::json;

use helios_transaction::backends::memory::InMemoryStore;
use helios_transaction::config::{PartitionSettings, ProcessorConfig};
use helios_transaction::error::TransactionError;
use helios_transaction::partition::{RequestPartitionResolver, ResourceTypePartitionResolver};
use helios_transaction::processor::TransactionProcessor;
use helios_transaction::types::{
    Bundle, BundleEntry, EntryOutcome, IndexRow, PartitionId, RequestContext, RequestPartitionId,
    ResourceIdentity, TransactionResponse,
};

use common::*;

const PARTITION_A: PartitionId = PartitionId::new(1);
const PARTITION_B: PartitionId = PartitionId::new(2);

fn updates_of(identities: &[ResourceIdentity]) -> Vec<BundleEntry> {
    identities
        .iter()
        .map(|identity| {
            let mut resource = patient_with_id(identity.id(), "unchanged");
            resource["active"] = json!(true);
            BundleEntry::update(identity.clone(), resource)
        })
        .collect()
}

fn partitioned_processor() -> (Arc<InMemoryStore>, TransactionProcessor<InMemoryStore>) {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let config = ProcessorConfig::default().with_partitioning(PartitionSettings::enabled());
    let resolver = ResourceTypePartitionResolver::new()
        .with_type("Patient", PARTITION_A)
        .with_type("Observation", PARTITION_B);
    let processor =
        TransactionProcessor::new(store.clone(), config).with_partition_resolver(Arc::new(resolver));
    (store, processor)
}

/// A processor placing every resource in the partition its request names.
fn tenant_processor(config: ProcessorConfig) -> (Arc<InMemoryStore>, TransactionProcessor<InMemoryStore>) {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let config = config.with_partitioning(PartitionSettings::enabled());
    let processor = TransactionProcessor::new(store.clone(), config)
        .with_partition_resolver(Arc::new(RequestPartitionResolver));
    (store, processor)
}

async fn commit_in(
    processor: &TransactionProcessor<InMemoryStore>,
    partition: PartitionId,
    entries: Vec<BundleEntry>,
) -> Result<TransactionResponse, TransactionError> {
    processor
        .process_transaction(
            &Bundle::new(entries),
            &RequestContext::new().with_partition(partition),
        )
        .await
}

fn kind(outcome: &EntryOutcome) -> &'static str {
    match outcome {
        EntryOutcome::Created { .. } => "created",
        EntryOutcome::Updated { .. } => "updated",
        EntryOutcome::Deleted { .. } => "deleted",
        EntryOutcome::NoOp { .. } => "noop",
    }
}

/// Seeds `Patient/a0..a2` in partition A and `Patient/x` in partition B.
async fn seed_tenants(processor: &TransactionProcessor<InMemoryStore>) -> ResourceIdentity {
    let ours = (0..3)
        .map(|i| {
            let id = format!("a{}", i);
            BundleEntry::update(
                ResourceIdentity::new("Patient", id.clone()),
                patient_with_id(&id, &format!("mrn-{}", i)),
            )
        })
        .collect();
    commit_in(processor, PARTITION_A, ours).await.unwrap();

    let theirs = ResourceIdentity::new("Patient", "x");
    commit_in(
        processor,
        PARTITION_B,
        vec![BundleEntry::update(theirs.clone(), patient_with_id("x", "b-mrn"))],
    )
    .await
    .unwrap();
    theirs
}

// ============================================================================
// Prefetch Threshold
// ============================================================================

/// Test that a transaction touching only two resources skips prefetch.
#[tokio::test]
async fn test_small_transaction_skips_prefetch() {
    let (_store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 2).await;

    let response = commit(&processor, Bundle::new(updates_of(&identities))).await;

    assert!(!response.stats.prefetched);
    assert_eq!(response.stats.prefetch_queries, 0);
    assert_eq!(response.stats.identity_queries, 1);
    assert!(response.entries.iter().all(|o| matches!(o, EntryOutcome::Updated { version: 2, .. })));
}

/// Test that three resolved resources are prefetched with one identity query.
#[tokio::test]
async fn test_prefetch_above_threshold() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 3).await;
    store.reset_query_counts();

    let response = commit(&processor, Bundle::new(updates_of(&identities))).await;

    assert!(response.stats.prefetched);
    assert_eq!(response.stats.identity_queries, 1);
    assert_eq!(response.stats.identities_resolved, 3);
    assert!(response.stats.joined_categories.contains(&"token".to_string()));
    assert!(response.stats.joined_categories.contains(&"string".to_string()));

    let counts = store.query_counts();
    assert_eq!(counts.identity_lookups, 1);
    assert!(counts.index_joins >= 1);
}

/// Test that a raised prefetch threshold keeps the transaction on the lazy path.
#[tokio::test]
async fn test_configured_prefetch_threshold() {
    let (_store, processor) =
        memory_processor(ProcessorConfig::default().with_prefetch_threshold(5));
    let identities = seed_patients(&processor, 4).await;

    let response = commit(&processor, Bundle::new(updates_of(&identities))).await;

    assert!(!response.stats.prefetched);
    assert_eq!(response.entries.len(), 4);
}

// ============================================================================
// Bulk Query Counts
// ============================================================================

/// Test that mixed updates and conditional creates need one query per kind.
#[tokio::test]
async fn test_bulk_resolution_query_counts() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let seeded = seed_patients(&processor, 6).await;
    store.reset_query_counts();

    let mut entries = updates_of(&seeded[..3]);
    for i in 3..6 {
        let mrn = format!("mrn-{}", i);
        entries.push(BundleEntry::create(patient(&mrn)).with_if_none_exist(mrn_match(&mrn)));
    }
    let response = commit(&processor, Bundle::new(entries)).await;

    let counts = store.query_counts();
    assert!(counts.identity_lookups <= 1);
    assert!(counts.hash_lookups <= 1);
    assert_eq!(response.stats.match_urls_resolved, 3);
    assert!(response.stats.prefetched);
    assert!(response.entries[3..].iter().all(|o| matches!(o, EntryOutcome::NoOp { .. })));
    assert_eq!(store.len(), 6);
}

/// Test that failing index joins degrade prefetch without failing the transaction.
#[tokio::test]
async fn test_failed_index_join_is_tolerated() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 3).await;
    store.fail_index_joins(true);

    let response = commit(&processor, Bundle::new(updates_of(&identities))).await;

    assert!(response.stats.prefetched);
    assert!(response.stats.joined_categories.is_empty());
    for identity in &identities {
        assert_eq!(store.get(identity).unwrap().version, 2);
    }
}

// ============================================================================
// Partition Scope
// ============================================================================

/// Test that a bundle spanning two partitions skips the bulk phases but still commits.
#[tokio::test]
async fn test_mixed_partitions_skip_bulk_phases() {
    let (store, processor) = partitioned_processor();
    let identities = seed_patients(&processor, 3).await;
    store.reset_query_counts();

    let mut entries = updates_of(&identities[..2]);
    entries.push(BundleEntry::create(observation(&identities[0].to_string())));
    let response = commit(&processor, Bundle::new(entries)).await;

    assert_eq!(response.stats.partition, Some(RequestPartitionId::Undetermined));
    assert_eq!(response.stats.identity_queries, 0);
    assert_eq!(response.stats.match_queries, 0);
    assert!(!response.stats.prefetched);
    assert!(matches!(response.entries[0], EntryOutcome::Updated { .. }));
    assert!(matches!(response.entries[2], EntryOutcome::Created { .. }));

    let observation = store.get(response.entries[2].identity().unwrap()).unwrap();
    assert_eq!(observation.partition, Some(PARTITION_B));
}

/// Test that a single-partition bundle runs the bulk phases under that partition.
#[tokio::test]
async fn test_single_partition_runs_bulk_phases() {
    let (store, processor) = partitioned_processor();
    let identities = seed_patients(&processor, 3).await;
    assert_eq!(store.get(&identities[0]).unwrap().partition, Some(PARTITION_A));

    let response = commit(&processor, Bundle::new(updates_of(&identities))).await;

    assert_eq!(
        response.stats.partition,
        Some(RequestPartitionId::Partition(PARTITION_A))
    );
    assert_eq!(response.stats.identity_queries, 1);
    assert!(response.stats.prefetched);
}

/// Test that a conditional create in a partition matches only within it.
#[tokio::test]
async fn test_partitioned_conditional_create_matches() {
    let (store, processor) = partitioned_processor();
    seed_patients(&processor, 1).await;

    let response = commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient("mrn-0")).with_if_none_exist(mrn_match("mrn-0")),
        ]),
    )
    .await;

    assert!(matches!(response.entries[0], EntryOutcome::NoOp { .. }));
    assert_eq!(response.stats.match_queries, 1);
    assert_eq!(store.len(), 1);
}

// ============================================================================
// Tenant Isolation
// ============================================================================

/// Test that per-entry lookups never reach a resource in another partition.
#[tokio::test]
async fn test_per_entry_lookups_stay_in_their_partition() {
    let (store, processor) = tenant_processor(ProcessorConfig::default());
    let theirs = seed_tenants(&processor).await;
    let mut hijack = patient_with_id("x", "a-mrn");
    hijack["active"] = json!(false);

    let alone = commit_in(
        &processor,
        PARTITION_A,
        vec![BundleEntry::update(theirs.clone(), hijack.clone())],
    )
    .await
    .unwrap_err();
    let with_delete = commit_in(
        &processor,
        PARTITION_A,
        vec![
            BundleEntry::update(theirs.clone(), hijack),
            BundleEntry::delete(theirs.clone()),
        ],
    )
    .await
    .unwrap_err();
    assert!(alone.phase().is_some());
    assert_eq!(alone.phase(), with_delete.phase());

    let deleted = commit_in(&processor, PARTITION_A, vec![BundleEntry::delete(theirs.clone())])
        .await
        .unwrap();
    assert!(matches!(deleted.entries[0], EntryOutcome::NoOp { pid: None, .. }));

    let row = store.get(&theirs).unwrap();
    assert_eq!(row.partition, Some(PARTITION_B));
    assert_eq!(row.version, 1);
    assert!(!row.deleted);
    assert_eq!(row.content["identifier"][0]["value"], json!("b-mrn"));
}

/// Test that a standing match from one partition does not answer another.
#[tokio::test]
async fn test_standing_matches_stay_in_their_partition() {
    let (store, processor) = tenant_processor(ProcessorConfig::default());
    let create = || {
        vec![BundleEntry::create(patient("shared")).with_if_none_exist(mrn_match("shared"))]
    };

    let first = commit_in(&processor, PARTITION_A, create()).await.unwrap();
    let second = commit_in(&processor, PARTITION_B, create()).await.unwrap();
    let again = commit_in(&processor, PARTITION_A, create()).await.unwrap();

    assert!(matches!(first.entries[0], EntryOutcome::Created { .. }));
    assert!(matches!(second.entries[0], EntryOutcome::Created { .. }));
    assert_ne!(first.entries[0].persistent_id(), second.entries[0].persistent_id());
    assert!(matches!(again.entries[0], EntryOutcome::NoOp { .. }));
    assert_eq!(again.entries[0].persistent_id(), first.entries[0].persistent_id());
    assert_eq!(store.len(), 2);

    let theirs = store.get(second.entries[0].identity().unwrap()).unwrap();
    assert_eq!(theirs.partition, Some(PARTITION_B));
}

/// Runs updates of the partition A patients plus a conditional create whose
/// only match lives in partition B, optionally with a delete of `Patient/x`.
async fn mixed_run(
    config: ProcessorConfig,
    with_delete: bool,
) -> (Arc<InMemoryStore>, TransactionResponse) {
    let (store, processor) = tenant_processor(config);
    let theirs = seed_tenants(&processor).await;

    let mut entries: Vec<BundleEntry> = (0..3)
        .map(|i| {
            let id = format!("a{}", i);
            let mut resource = patient_with_id(&id, &format!("mrn-{}", i));
            resource["active"] = json!(true);
            BundleEntry::update(ResourceIdentity::new("Patient", id), resource)
        })
        .collect();
    entries.push(BundleEntry::create(patient("b-mrn")).with_if_none_exist(mrn_match("b-mrn")));
    if with_delete {
        entries.push(BundleEntry::delete(theirs));
    }
    let response = commit_in(&processor, PARTITION_A, entries).await.unwrap();
    (store, response)
}

fn same_rows(left: &[IndexRow], right: &[IndexRow]) -> bool {
    left.len() == right.len() && left.iter().all(|row| right.contains(row))
}

/// Test that entry outcomes do not depend on whether prefetch or the bulk phases ran.
#[tokio::test]
async fn test_outcomes_match_with_and_without_prefetch() {
    let (prefetched_store, prefetched) = mixed_run(ProcessorConfig::default(), false).await;
    let (lazy_store, lazy) =
        mixed_run(ProcessorConfig::default().with_prefetch_threshold(100), false).await;
    let (_, per_entry) = mixed_run(ProcessorConfig::default(), true).await;

    assert!(prefetched.stats.prefetched);
    assert!(!lazy.stats.prefetched);
    assert_eq!(per_entry.stats.partition, Some(RequestPartitionId::Undetermined));

    let kinds = |response: &TransactionResponse| {
        response.entries[..4].iter().map(kind).collect::<Vec<_>>()
    };
    assert_eq!(kinds(&prefetched), vec!["updated", "updated", "updated", "created"]);
    assert_eq!(kinds(&prefetched), kinds(&lazy));
    assert_eq!(kinds(&prefetched), kinds(&per_entry));
    assert!(matches!(per_entry.entries[4], EntryOutcome::NoOp { pid: None, .. }));

    for i in 0..3 {
        let identity = ResourceIdentity::new("Patient", format!("a{}", i));
        let pid = prefetched_store.get(&identity).unwrap().pid;
        assert_eq!(lazy_store.get(&identity).unwrap().pid, pid);
        assert!(same_rows(
            &prefetched_store.indexes_of(pid),
            &lazy_store.indexes_of(pid)
        ));
    }
}

/// Test that a prefetched update keeps its unchanged index rows.
#[tokio::test]
async fn test_prefetched_update_reuses_unchanged_indexes() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 3).await;
    let pid = store.get(&identities[0]).unwrap().pid;
    let before = store.indexes_of(pid);

    let entries = identities
        .iter()
        .enumerate()
        .map(|(i, identity)| {
            let mut resource = patient_with_id(identity.id(), &format!("mrn-{}", i));
            resource["active"] = json!(true);
            BundleEntry::update(identity.clone(), resource)
        })
        .collect();
    let response = commit(&processor, Bundle::new(entries)).await;

    assert!(response.stats.prefetched);
    assert!(response.stats.index_rows_reused > 0);
    let after = store.indexes_of(pid);
    assert!(before.iter().all(|row| after.iter().filter(|r| *r == row).count() == 1));
    assert_eq!(store.get(&identities[0]).unwrap().version, 2);
}
