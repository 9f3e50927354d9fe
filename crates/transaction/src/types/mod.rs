//! Core types for the transaction engine.
//!
//! This module contains the data model shared by the bundle processor, the
//! stores and the batch job id producer:
//!
//! - [`ResourceIdentity`], [`PersistentId`], [`Resolution`] - identities and lookups
//! - [`RequestPartitionId`], [`PartitionId`] - partition scopes
//! - [`Bundle`], [`BundleEntry`], [`BundleVerb`] - transaction input
//! - [`EntryOutcome`], [`TransactionResponse`] - transaction output
//! - [`ResourceRow`], [`IndexRow`], [`IndexCategory`] - stored rows
//! - [`IdPage`], [`ResumeMarker`], [`ChunkSelection`] - batch job paging

mod bundle;
mod identity;
mod index;
mod outcome;
mod page;
mod partition;

pub use bundle::{Bundle, BundleEntry, BundleVerb, RequestContext};
pub use identity::{
    PLACEHOLDER_PREFIXES, PersistentId, Resolution, ResolvedIdentity, ResourceIdentity,
    is_placeholder,
};
pub use index::{
    IndexCategory, IndexPopulation, IndexRow, IndexValue, LoadedResource, ResourceRow,
    TokenIndexMatch,
};
pub use outcome::{
    EntryOutcome, TransactionKey, TransactionPhase, TransactionResponse, TransactionStats,
    WriteCounts,
};
pub use page::{ChunkSelection, IdPage, ResumeMarker, TypedPersistentId};
pub use partition::{PartitionId, RequestPartitionId};
