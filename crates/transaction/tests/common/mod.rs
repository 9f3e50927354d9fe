//! Shared fixtures for the transaction engine tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};

use helios_transaction::backends::memory::InMemoryStore;
use helios_transaction::config::ProcessorConfig;
use helios_transaction::core::ResourceStore;
use helios_transaction::processor::TransactionProcessor;
use helios_transaction::types::{
    Bundle, BundleEntry, RequestContext, ResourceIdentity, TransactionResponse,
};

/// Identifier system used by the patient fixtures.
pub const MRN: &str = "http://hospital.example/mrn";

/// Installs a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A patient with one MRN identifier and a family name.
pub fn patient(mrn: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "identifier": [{"system": MRN, "value": mrn}],
        "name": [{"family": format!("Family-{}", mrn), "given": ["Test"]}]
    })
}

/// A patient with a client-assigned id.
pub fn patient_with_id(id: &str, mrn: &str) -> Value {
    let mut resource = patient(mrn);
    resource["id"] = json!(id);
    resource
}

/// An observation about `subject`.
pub fn observation(subject: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "status": "final",
        "subject": {"reference": subject},
        "valueQuantity": {"value": 72.0, "unit": "beats/minute", "code": "/min"}
    })
}

/// The conditional expression matching a fixture patient by MRN.
pub fn mrn_match(mrn: &str) -> String {
    format!("Patient?identifier={}|{}", MRN, mrn)
}

/// A memory store and a processor over it.
pub fn memory_processor(config: ProcessorConfig) -> (Arc<InMemoryStore>, TransactionProcessor<InMemoryStore>) {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let processor = TransactionProcessor::new(store.clone(), config);
    (store, processor)
}

/// Commits `Patient/p{i}` with MRN `mrn-{i}` for every `i` in `0..count`.
pub async fn seed_patients<S: ResourceStore>(
    processor: &TransactionProcessor<S>,
    count: usize,
) -> Vec<ResourceIdentity> {
    let identities: Vec<ResourceIdentity> = (0..count)
        .map(|i| ResourceIdentity::new("Patient", format!("p{}", i)))
        .collect();
    let entries = identities
        .iter()
        .enumerate()
        .map(|(i, identity)| {
            BundleEntry::update(
                identity.clone(),
                patient_with_id(identity.id(), &format!("mrn-{}", i)),
            )
        })
        .collect();
    commit(processor, Bundle::new(entries)).await;
    identities
}

/// Processes a bundle that is expected to commit.
pub async fn commit<S: ResourceStore>(
    processor: &TransactionProcessor<S>,
    bundle: Bundle,
) -> TransactionResponse {
    processor
        .process_transaction(&bundle, &RequestContext::new())
        .await
        .expect("transaction should commit")
}
