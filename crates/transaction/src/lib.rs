//! Helios FHIR Server Transaction Engine
//!
//! This crate applies FHIR-style transaction bundles atomically and produces
//! bounded pages of resource ids for batch jobs such as reindexing.
//!
//! # Features
//!
//! - **Bulk Resolution**: every identity and conditional match URL of a bundle
//!   is resolved with at most one store query each, before any entry is applied
//! - **Prefetching**: resources the bundle touches are loaded ahead of time,
//!   joined with the index categories they populate
//! - **Partition Routing**: one partition scope per transaction, with bulk work
//!   skipped when the entries disagree
//! - **Atomicity**: any failure, including one reported at flush time, rolls
//!   the whole transaction back
//! - **Chunked Id Paging**: ordered, non-overlapping id pages with opaque
//!   resumption markers
//!
//! # Architecture
//!
//! - [`types`] - bundles, identities, partitions, index rows and id pages
//! - [`error`] - error types for all operations
//! - [`core`] - the store traits and the session write buffer
//! - [`index`] - search hashing and index extraction
//! - [`cache`] - transaction-scoped and standing caches
//! - [`partition`] - partition routing
//! - [`resolver`] - identity and match-URL resolution
//! - [`prefetch`] - bulk prefetch of touched resources
//! - [`applier`] - per-entry write application
//! - [`processor`] - the transaction state machine
//! - [`jobs`] - chunked id production for batch jobs
//! - [`backends`] - store implementations (memory, SQLite)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use helios_transaction::backends::memory::InMemoryStore;
//! use helios_transaction::config::ProcessorConfig;
//! use helios_transaction::processor::TransactionProcessor;
//! use helios_transaction::types::{Bundle, BundleEntry, RequestContext};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let processor = TransactionProcessor::new(store, ProcessorConfig::default());
//!
//! let bundle = Bundle::new(vec![
//!     BundleEntry::create(json!({"resourceType": "Patient"}))
//!         .with_full_url("urn:uuid:7c1b2a64-0b0e-4e05-9f5d-0f8b1b6e4c11"),
//!     BundleEntry::create(json!({
//!         "resourceType": "Observation",
//!         "subject": {"reference": "urn:uuid:7c1b2a64-0b0e-4e05-9f5d-0f8b1b6e4c11"}
//!     })),
//! ]);
//!
//! let response = processor
//!     .process_transaction(&bundle, &RequestContext::new())
//!     .await?;
//! assert_eq!(response.entries.len(), 2);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod applier;
pub mod backends;
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod jobs;
pub mod partition;
pub mod prefetch;
pub mod processor;
pub mod resolver;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{ChunkConfig, PartitionSettings, ProcessorConfig};
pub use error::{StorageError, StorageResult, TransactionError, TransactionResult};
pub use processor::TransactionProcessor;
pub use types::{Bundle, BundleEntry, BundleVerb, RequestContext, TransactionResponse};

// Re-export core traits
pub use core::{ResourceStore, StoreSession};
pub use jobs::{IdChunkProducer, ReindexIdChunkProducer, ResourceIdListStep};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
