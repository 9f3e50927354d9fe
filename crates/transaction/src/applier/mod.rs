//! Per-entry write application.
//!
//! The processor hands every bundle entry, in order, to a [`WriteApplier`]
//! together with an [`ApplyContext`]: the open session, the transaction caches
//! and the shared [`ApplyServices`]. The applier may read the caches the bulk
//! phases filled and falls back to individual lookups for anything missing.

mod default;
mod references;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::TransactionCaches;
use crate::core::StoreSession;
use crate::error::StorageResult;
use crate::index::{IndexExtractor, SearchHasher};
use crate::partition::PartitionRouter;
use crate::resolver::{ConditionalMatchResolver, IdentityResolver};
use crate::types::{BundleEntry, EntryOutcome, RequestContext, RequestPartitionId};

pub use default::DefaultWriteApplier;
pub use references::rewrite_references;

/// Collaborators shared by every transaction of a processor.
#[derive(Clone)]
pub struct ApplyServices {
    /// Partition routing.
    pub router: PartitionRouter,
    /// Identity resolution.
    pub identities: IdentityResolver,
    /// Match-URL resolution.
    pub matcher: ConditionalMatchResolver,
    /// Search hash computation.
    pub hasher: SearchHasher,
    /// Secondary index extraction.
    pub extractor: Arc<dyn IndexExtractor>,
}

impl std::fmt::Debug for ApplyServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyServices")
            .field("router", &self.router)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Everything an applier may touch while applying one entry.
pub struct ApplyContext<'a, S: StoreSession> {
    /// The open store session.
    pub session: &'a mut S,
    /// Caches of the running transaction.
    pub caches: &'a mut TransactionCaches,
    /// The request the bundle arrived with.
    pub request: &'a RequestContext,
    /// Scope the bulk phases ran under; `Undetermined` when they were skipped.
    pub scope: RequestPartitionId,
    /// Shared collaborators.
    pub services: &'a ApplyServices,
}

impl<S: StoreSession> ApplyContext<'_, S> {
    /// The scope for lookups made on behalf of `entry`.
    ///
    /// The transaction scope when one was determined, else the entry's own
    /// read partition.
    pub fn lookup_scope(&self, entry: &BundleEntry) -> RequestPartitionId {
        if self.scope.is_determined() {
            return self.scope;
        }
        self.services.router.read_partition_of(entry, self.request)
    }
}

/// Applies one bundle entry inside an open transaction.
#[async_trait]
pub trait WriteApplier<S: StoreSession>: Send + Sync {
    /// Applies entry `index` and reports what happened to it.
    async fn apply(
        &self,
        index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome>;
}
