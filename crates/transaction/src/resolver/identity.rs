//! Identity pre-resolution.

use std::collections::HashMap;

use tracing::debug;

use crate::cache::TransactionCaches;
use crate::core::StoreSession;
use crate::error::{ResolutionError, StorageResult};
use crate::types::{PersistentId, RequestPartitionId, Resolution, ResolvedIdentity, ResourceIdentity};

/// Result of a bulk identity resolution.
#[derive(Debug, Clone, Default)]
pub struct IdentityReport {
    /// One entry per distinct requested identity, in request order.
    pub resolved: Vec<ResolvedIdentity>,
    /// Store queries issued (0 or 1).
    pub queries: usize,
}

/// Maps logical identities to persistent ids through the transaction cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    /// Creates a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Resolves every identity with at most one store query.
    ///
    /// Identities already in the cache are answered from it. Every queried
    /// identity is recorded, as `NotFound` when the store has no row for it.
    pub async fn resolve_all<S: StoreSession>(
        &self,
        session: &mut S,
        caches: &mut TransactionCaches,
        scope: &RequestPartitionId,
        identities: &[ResourceIdentity],
    ) -> StorageResult<IdentityReport> {
        let mut ordered: Vec<&ResourceIdentity> = Vec::with_capacity(identities.len());
        for identity in identities {
            if !ordered.contains(&identity) {
                ordered.push(identity);
            }
        }

        let uncached: Vec<ResourceIdentity> = ordered
            .iter()
            .filter(|identity| caches.identity(identity).is_none())
            .map(|identity| (*identity).clone())
            .collect();

        let mut queries = 0;
        if !uncached.is_empty() {
            let rows = session.resolve_persistent_ids(scope, &uncached).await?;
            queries += 1;
            let found = group_unique(rows)?;
            for identity in uncached {
                let resolution = found.get(&identity).copied().into();
                caches.record_identity(identity, resolution);
            }
        }

        let resolved: Vec<ResolvedIdentity> = ordered
            .into_iter()
            .map(|identity| ResolvedIdentity {
                identity: identity.clone(),
                resolution: caches.identity(identity).unwrap_or(Resolution::NotFound),
            })
            .collect();

        debug!(
            requested = identities.len(),
            found = resolved.iter().filter(|r| r.resolution.is_found()).count(),
            queries,
            "Pre-resolved transaction identities"
        );
        Ok(IdentityReport { resolved, queries })
    }

    /// Resolves one identity, querying the store only on a cache miss.
    pub async fn resolve_one<S: StoreSession>(
        &self,
        session: &mut S,
        caches: &mut TransactionCaches,
        scope: &RequestPartitionId,
        identity: &ResourceIdentity,
    ) -> StorageResult<Resolution> {
        if let Some(cached) = caches.identity(identity) {
            return Ok(cached);
        }
        let rows = session
            .resolve_persistent_ids(scope, std::slice::from_ref(identity))
            .await?;
        let resolution: Resolution = group_unique(rows)?.get(identity).copied().into();
        caches.record_identity(identity.clone(), resolution);
        Ok(resolution)
    }
}

fn group_unique(
    rows: Vec<(ResourceIdentity, PersistentId)>,
) -> Result<HashMap<ResourceIdentity, PersistentId>, ResolutionError> {
    let mut found: HashMap<ResourceIdentity, PersistentId> = HashMap::with_capacity(rows.len());
    for (identity, pid) in rows {
        if let Some(existing) = found.get(&identity)
            && *existing != pid
        {
            return Err(ResolutionError::AmbiguousIdentity {
                resource_type: identity.resource_type().to_string(),
                id: identity.id().to_string(),
                ids: vec![*existing, pid],
            });
        }
        found.insert(identity, pid);
    }
    Ok(found)
}
