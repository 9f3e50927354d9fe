//! Tests for atomic bundle processing.
//!
//! This module covers placeholder resolution, versioning, deletes and the
//! guarantee that a failure in any state leaves nothing behind.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use helios_transaction::applier::{ApplyContext, WriteApplier};
use helios_transaction::config::ProcessorConfig;
use helios_transaction::core::{PendingWrite, ResourceStore, StoreSession};
use helios_transaction::error::{StorageError, StorageResult, TransactionError, ValidationError};
use helios_transaction::types::{
    Bundle, BundleEntry, ChunkSelection, EntryOutcome, IndexPopulation, RequestContext,
    ResourceIdentity, ResourceRow, TransactionPhase,
};

use common::*;

const PATIENT_URL: &str = "urn:uuid:0b3d8a1e-4c3f-4a8e-9d2b-6f1a2c3d4e5f";

// ============================================================================
// Placeholders
// ============================================================================

/// Test that references to a placeholder are rewritten to the created identity.
#[tokio::test]
async fn test_placeholder_references_are_rewritten() {
    let (store, processor) = memory_processor(ProcessorConfig::default());

    let bundle = Bundle::new(vec![
        BundleEntry::create(patient("mrn-1")).with_full_url(PATIENT_URL),
        BundleEntry::create(observation(PATIENT_URL)),
    ]);
    let response = commit(&processor, bundle).await;

    let created = response
        .for_placeholder(PATIENT_URL)
        .and_then(EntryOutcome::identity)
        .cloned()
        .unwrap();
    assert_eq!(created.resource_type(), "Patient");

    let observation = response.entries[1].identity().unwrap();
    let stored = store.get(observation).unwrap();
    assert_eq!(
        stored.content["subject"]["reference"],
        json!(created.to_string())
    );
    assert_eq!(stored.content["meta"]["versionId"], json!("1"));
}

/// Test that a placeholder declared twice fails before anything is resolved.
#[tokio::test]
async fn test_duplicate_placeholder_is_rejected() {
    let (store, processor) = memory_processor(ProcessorConfig::default());

    let bundle = Bundle::new(vec![
        BundleEntry::create(patient("mrn-1")).with_full_url(PATIENT_URL),
        BundleEntry::create(patient("mrn-2")).with_full_url(PATIENT_URL),
    ]);
    let err = processor
        .process_transaction(&bundle, &RequestContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some("partition-determined"));
    assert!(store.is_empty());
}

/// Test that referencing a placeholder before its entry runs is an error.
#[tokio::test]
async fn test_forward_placeholder_reference_fails() {
    let (store, processor) = memory_processor(ProcessorConfig::default());

    let bundle = Bundle::new(vec![
        BundleEntry::create(observation(PATIENT_URL)),
        BundleEntry::create(patient("mrn-1")).with_full_url(PATIENT_URL),
    ]);
    let err = processor
        .process_transaction(&bundle, &RequestContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some("entries-applied"));
    assert!(store.is_empty());
}

// ============================================================================
// Versioning and Deletes
// ============================================================================

/// Test that updating an existing identity produces version 2.
#[tokio::test]
async fn test_update_creates_new_version() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 1).await;
    let identity = &identities[0];

    let mut changed = patient_with_id(identity.id(), "mrn-0");
    changed["active"] = json!(false);
    let response = commit(
        &processor,
        Bundle::new(vec![BundleEntry::update(identity.clone(), changed)]),
    )
    .await;

    assert!(matches!(
        response.for_identity(identity),
        Some(EntryOutcome::Updated { version: 2, .. })
    ));
    let stored = store.get(identity).unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.content["active"], json!(false));
    assert_eq!(stored.content["meta"]["versionId"], json!("2"));
}

/// Test that creating an identity that already exists fails.
#[tokio::test]
async fn test_create_with_existing_identity_fails() {
    let (_store, processor) = memory_processor(ProcessorConfig::default());
    seed_patients(&processor, 1).await;

    let err = processor
        .process_transaction(
            &Bundle::new(vec![BundleEntry::create(patient_with_id("p0", "mrn-0"))]),
            &RequestContext::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some("entries-applied"));
}

/// Test that deleting twice is a no-op the second time.
#[tokio::test]
async fn test_delete_is_idempotent() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 2).await;
    let target = identities[0].clone();

    let first = commit(
        &processor,
        Bundle::new(vec![BundleEntry::delete(target.clone())]),
    )
    .await;
    assert!(matches!(
        first.entries[0],
        EntryOutcome::Deleted { version: 2, .. }
    ));

    let second = commit(
        &processor,
        Bundle::new(vec![BundleEntry::delete(target.clone())]),
    )
    .await;
    assert!(!second.entries[0].is_write());

    let missing = commit(
        &processor,
        Bundle::new(vec![BundleEntry::delete(ResourceIdentity::new(
            "Patient", "never",
        ))]),
    )
    .await;
    assert!(matches!(missing.entries[0], EntryOutcome::NoOp { pid: None, .. }));

    assert!(store.get(&target).unwrap().deleted);
    let selection = ChunkSelection::all();
    let live = store
        .fetch_id_page(helios_transaction::core::IdPageQuery {
            selection: &selection,
            after: None,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
}

/// Test that a committed response reports the final state and write counts.
#[tokio::test]
async fn test_committed_stats() {
    let (_store, processor) = memory_processor(ProcessorConfig::default());
    let response = commit(
        &processor,
        Bundle::new(vec![
            BundleEntry::create(patient("mrn-1")),
            BundleEntry::create(patient("mrn-2")),
        ]),
    )
    .await;

    assert_eq!(response.stats.phase, TransactionPhase::Committed);
    assert_eq!(response.stats.flushed.inserts, 2);
    assert_eq!(response.stats.flushed.updates, 0);
}

// ============================================================================
// Atomicity
// ============================================================================

/// Test that a failing entry rolls back the writes of earlier entries.
#[tokio::test]
async fn test_failed_entry_rolls_back_earlier_writes() {
    let (store, processor) = memory_processor(ProcessorConfig::default());

    let bundle = Bundle::new(vec![
        BundleEntry::update(
            ResourceIdentity::new("Patient", "kept-out"),
            patient_with_id("kept-out", "mrn-1"),
        ),
        BundleEntry::update_by_match(mrn_match("nobody"), patient("nobody")),
    ]);
    let err = processor
        .process_transaction(&bundle, &RequestContext::new())
        .await
        .unwrap_err();

    match &err {
        TransactionError::RolledBack { phase, source } => {
            assert_eq!(phase, "entries-applied");
            assert!(matches!(**source, StorageError::Resolution(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.is_empty());
    assert_eq!(store.query_counts().rollbacks, 1);
    assert_eq!(store.query_counts().commits, 0);
}

/// Test that an entry without a payload is rejected as a validation error.
#[tokio::test]
async fn test_create_without_payload_is_a_validation_error() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let mut empty = BundleEntry::create(patient("mrn-1"));
    empty.resource = None;

    let err = processor
        .process_transaction(
            &Bundle::new(vec![BundleEntry::create(patient("mrn-2")), empty]),
            &RequestContext::new(),
        )
        .await
        .unwrap_err();

    match &err {
        TransactionError::RolledBack { phase, source } => {
            assert_eq!(phase, "entries-applied");
            assert!(matches!(
                **source,
                StorageError::Validation(ValidationError::MissingResource { index: 1, .. })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.is_empty());
}

/// Stages two rows with the same identity so the flush has to reject them.
struct DuplicatingApplier;

#[async_trait]
impl<S: StoreSession> WriteApplier<S> for DuplicatingApplier {
    async fn apply(
        &self,
        _index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome> {
        let identity = ResourceIdentity::new("Patient", "duplicate");
        let pid = ctx.session.allocate_pid().await?;
        ctx.session.stage(PendingWrite::Insert {
            row: ResourceRow {
                pid,
                identity: identity.clone(),
                partition: None,
                version: 1,
                deleted: false,
                content: entry.resource.clone().unwrap_or_default(),
                last_updated: Utc::now(),
                populated: IndexPopulation::default(),
            },
            indexes: Vec::new(),
        })?;
        Ok(EntryOutcome::Created {
            identity,
            pid,
            version: 1,
        })
    }
}

/// Test that a constraint violation surfacing at flush time rolls back.
#[tokio::test]
async fn test_flush_constraint_violation_rolls_back() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let processor = processor.with_applier(DuplicatingApplier);

    let bundle = Bundle::new(vec![
        BundleEntry::create(patient("mrn-1")),
        BundleEntry::create(patient("mrn-2")),
    ]);
    let err = processor
        .process_transaction(&bundle, &RequestContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some("flushed"));
    let TransactionError::RolledBack { source, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(source.is_constraint_violation());
    match source.as_ref() {
        StorageError::Transaction(TransactionError::FlushFailed { resource_types, .. }) => {
            assert_eq!(resource_types, &vec!["Patient".to_string()]);
        }
        other => panic!("unexpected source: {other}"),
    }
    assert!(err.to_string().contains("Error flushing transaction with resource types"));
    assert!(store.is_empty());
}

/// Test that a committed transaction is not affected by a later failed one.
#[tokio::test]
async fn test_failed_transaction_leaves_committed_state_intact() {
    let (store, processor) = memory_processor(ProcessorConfig::default());
    let identities = seed_patients(&processor, 1).await;

    let bundle = Bundle::new(vec![
        BundleEntry::update(
            identities[0].clone(),
            patient_with_id(identities[0].id(), "mrn-changed"),
        ),
        BundleEntry::update_by_match(mrn_match("nobody"), patient("nobody")),
    ]);
    assert!(
        processor
            .process_transaction(&bundle, &RequestContext::new())
            .await
            .is_err()
    );

    let stored = store.get(&identities[0]).unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.content["identifier"][0]["value"], json!("mrn-0"));
}
