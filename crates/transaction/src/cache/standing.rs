//! Standing match-URL cache shared across transactions.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{PersistentId, RequestPartitionId, Resolution};

use super::transaction::MatchKey;

/// Transaction-independent cache of match-URL resolutions.
///
/// Shared by concurrent transactions. A stale or missing entry only costs a
/// query, so implementations may evict freely. Entries are keyed by the scope
/// they were resolved under and must never answer another scope.
pub trait MatchUrlCache: Send + Sync {
    /// Cached resolution of a match URL under `scope`.
    fn get(&self, scope: &RequestPartitionId, resource_type: &str, match_url: &str) -> Option<Resolution>;

    /// Records a resolution made under `scope`.
    fn put(
        &self,
        scope: &RequestPartitionId,
        resource_type: &str,
        match_url: &str,
        resolution: Resolution,
    );

    /// Drops every entry that resolved to `pid`.
    fn invalidate_resource(&self, pid: PersistentId);
}

/// In-process [`MatchUrlCache`] behind a read-write lock.
///
/// Only found resolutions are kept; putting `NotFound` evicts the key, since
/// absence can change as soon as another transaction commits.
#[derive(Debug, Default)]
pub struct InMemoryMatchUrlCache {
    entries: RwLock<HashMap<MatchKey, PersistentId>>,
    max_entries: Option<usize>,
}

impl InMemoryMatchUrlCache {
    /// Creates an unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache that is cleared whenever it would exceed `max_entries`.
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: Some(max_entries),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl MatchUrlCache for InMemoryMatchUrlCache {
    fn get(&self, scope: &RequestPartitionId, resource_type: &str, match_url: &str) -> Option<Resolution> {
        self.entries
            .read()
            .get(&MatchKey::new(*scope, resource_type, match_url))
            .map(|pid| Resolution::Found(*pid))
    }

    fn put(
        &self,
        scope: &RequestPartitionId,
        resource_type: &str,
        match_url: &str,
        resolution: Resolution,
    ) {
        let key = MatchKey::new(*scope, resource_type, match_url);
        let mut entries = self.entries.write();
        match resolution {
            Resolution::Found(pid) => {
                if let Some(max) = self.max_entries
                    && entries.len() >= max
                    && !entries.contains_key(&key)
                {
                    entries.clear();
                }
                entries.insert(key, pid);
            }
            Resolution::NotFound => {
                entries.remove(&key);
            }
        }
    }

    fn invalidate_resource(&self, pid: PersistentId) {
        self.entries.write().retain(|_, cached| *cached != pid);
    }
}
