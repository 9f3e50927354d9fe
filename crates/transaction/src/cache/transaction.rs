//! Caches private to one in-flight transaction.
//!
//! [`TransactionCaches`] is created by the processor when a transaction starts
//! and passed by mutable reference through every phase. Nothing in it is
//! shared, so it needs no synchronization.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::ValidationError;
use crate::types::{
    IndexCategory, IndexRow, LoadedResource, PersistentId, RequestPartitionId, Resolution,
    ResourceIdentity, ResourceRow,
};

/// Key of a resolved match URL.
///
/// The same expression may resolve differently in two partitions, so the scope
/// it was resolved under is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    /// Partition scope of the lookup.
    pub scope: RequestPartitionId,
    /// Target resource type.
    pub resource_type: String,
    /// The full expression, e.g. `Patient?identifier=sys|1`.
    pub match_url: String,
}

impl MatchKey {
    /// Creates a key.
    pub fn new(
        scope: RequestPartitionId,
        resource_type: impl Into<String>,
        match_url: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            resource_type: resource_type.into(),
            match_url: match_url.into(),
        }
    }
}

/// State of a placeholder full-URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderState {
    /// Declared by an entry that has not been applied yet.
    Pending,
    /// The owning entry was applied.
    Resolved {
        /// Identity the entry was written under.
        identity: ResourceIdentity,
        /// Persistent id of the written resource.
        pid: PersistentId,
    },
}

/// Transaction-scoped placeholder bookkeeping.
#[derive(Debug, Default)]
pub struct PlaceholderMap {
    states: HashMap<String, PlaceholderState>,
}

impl PlaceholderMap {
    /// Declares a placeholder as pending.
    pub fn declare(&mut self, placeholder: &str) -> Result<(), ValidationError> {
        if self.states.contains_key(placeholder) {
            return Err(ValidationError::DuplicatePlaceholder {
                placeholder: placeholder.to_string(),
            });
        }
        self.states
            .insert(placeholder.to_string(), PlaceholderState::Pending);
        Ok(())
    }

    /// Marks a placeholder resolved once its entry has been applied.
    pub fn resolve(&mut self, placeholder: &str, identity: ResourceIdentity, pid: PersistentId) {
        self.states.insert(
            placeholder.to_string(),
            PlaceholderState::Resolved { identity, pid },
        );
    }

    /// Current state of a placeholder, if it was declared.
    pub fn state(&self, placeholder: &str) -> Option<&PlaceholderState> {
        self.states.get(placeholder)
    }

    /// The identity a placeholder resolved to.
    ///
    /// Fails for pending and undeclared placeholders.
    pub fn resolved(&self, placeholder: &str) -> Result<&ResourceIdentity, ValidationError> {
        match self.states.get(placeholder) {
            Some(PlaceholderState::Resolved { identity, .. }) => Ok(identity),
            _ => Err(ValidationError::UnresolvedPlaceholder {
                placeholder: placeholder.to_string(),
            }),
        }
    }

    /// Number of declared placeholders.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no placeholder was declared.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Rows bulk-loaded ahead of entry application.
///
/// Index rows are tracked per pid and category: a category is known for a pid
/// once it was joined for that pid or the transaction wrote the pid itself.
#[derive(Debug, Default)]
pub struct SessionCache {
    rows: HashMap<PersistentId, ResourceRow>,
    indexes: HashMap<PersistentId, Vec<IndexRow>>,
    known: HashMap<PersistentId, BTreeSet<IndexCategory>>,
    joined: BTreeSet<IndexCategory>,
    reused: usize,
}

impl SessionCache {
    /// Attaches primary rows loaded without an index join.
    ///
    /// Rows already cached are kept, as they may be newer than the store's.
    pub fn attach_rows(&mut self, loaded: Vec<LoadedResource>) {
        for resource in loaded {
            self.rows.entry(resource.row.pid).or_insert(resource.row);
        }
    }

    /// Attaches the index rows of one joined category.
    pub fn attach_indexes(&mut self, category: IndexCategory, loaded: Vec<LoadedResource>) {
        self.joined.insert(category);
        for resource in loaded {
            let pid = resource.row.pid;
            if !self.known.entry(pid).or_default().insert(category) {
                continue;
            }
            self.indexes.entry(pid).or_default().extend(
                resource
                    .indexes
                    .into_iter()
                    .filter(|index| index.category() == category),
            );
            self.rows.entry(pid).or_insert(resource.row);
        }
    }

    /// A cached primary row.
    pub fn row(&self, pid: PersistentId) -> Option<&ResourceRow> {
        self.rows.get(&pid)
    }

    /// Cached index rows of a category, if that category is known for `pid`.
    pub fn indexes(&self, pid: PersistentId, category: IndexCategory) -> Option<Vec<&IndexRow>> {
        if !self.known.get(&pid).is_some_and(|known| known.contains(&category)) {
            return None;
        }
        Some(
            self.indexes
                .get(&pid)
                .into_iter()
                .flatten()
                .filter(|index| index.category() == category)
                .collect(),
        )
    }

    /// The stored index rows of one category of `row`, when they are known.
    ///
    /// A category the row does not populate is known to be empty.
    pub fn prior_indexes(&self, row: &ResourceRow, category: IndexCategory) -> Option<Vec<IndexRow>> {
        if !row.populated.contains(category) {
            return Some(Vec::new());
        }
        self.indexes(row.pid, category)
            .map(|rows| rows.into_iter().cloned().collect())
    }

    /// Categories that were joined.
    pub fn joined(&self) -> impl Iterator<Item = IndexCategory> + '_ {
        self.joined.iter().copied()
    }

    /// Replaces a cached row after the transaction wrote a new version.
    ///
    /// Every category of the pid is known afterwards.
    pub fn refresh(&mut self, row: ResourceRow, indexes: &[IndexRow]) {
        let pid = row.pid;
        self.rows.insert(pid, row);
        self.indexes.insert(pid, indexes.to_vec());
        self.known.insert(pid, IndexCategory::ALL.into_iter().collect());
    }

    /// Counts index rows a write kept without rewriting them.
    pub fn record_reused(&mut self, rows: usize) {
        self.reused += rows;
    }

    /// Index rows kept without rewriting them so far.
    pub fn reused(&self) -> usize {
        self.reused
    }

    /// Number of cached primary rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if nothing was prefetched.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Every cache scoped to one transaction.
#[derive(Debug, Default)]
pub struct TransactionCaches {
    identities: HashMap<ResourceIdentity, Resolution>,
    match_urls: HashMap<MatchKey, Resolution>,
    placeholders: PlaceholderMap,
    session: SessionCache,
    deleted: HashSet<PersistentId>,
}

impl TransactionCaches {
    /// Creates empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached resolution of an identity.
    pub fn identity(&self, identity: &ResourceIdentity) -> Option<Resolution> {
        self.identities.get(identity).copied()
    }

    /// Records the resolution of an identity, replacing any earlier one.
    pub fn record_identity(&mut self, identity: ResourceIdentity, resolution: Resolution) {
        self.identities.insert(identity, resolution);
    }

    /// Number of cached identity resolutions.
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Pids of every identity cached as found.
    pub fn found_identities(&self) -> impl Iterator<Item = PersistentId> + '_ {
        self.identities.values().filter_map(Resolution::persistent_id)
    }

    /// Cached resolution of a match URL under `scope`.
    pub fn match_url(
        &self,
        scope: &RequestPartitionId,
        resource_type: &str,
        match_url: &str,
    ) -> Option<Resolution> {
        self.match_urls
            .get(&MatchKey::new(*scope, resource_type, match_url))
            .copied()
    }

    /// Records the resolution of a match URL under `scope`, replacing any earlier one.
    pub fn record_match_url(
        &mut self,
        scope: &RequestPartitionId,
        resource_type: impl Into<String>,
        match_url: impl Into<String>,
        resolution: Resolution,
    ) {
        self.match_urls
            .insert(MatchKey::new(*scope, resource_type, match_url), resolution);
    }

    /// Number of cached match-URL resolutions.
    pub fn match_url_count(&self) -> usize {
        self.match_urls.len()
    }

    /// Match URLs resolved to a resource.
    pub fn found_match_urls(&self) -> impl Iterator<Item = (&MatchKey, PersistentId)> {
        self.match_urls
            .iter()
            .filter_map(|(key, resolution)| resolution.persistent_id().map(|pid| (key, pid)))
    }

    /// Drops every match URL that resolved to `pid`.
    pub fn forget_matches_of(&mut self, pid: PersistentId) {
        self.match_urls
            .retain(|_, resolution| resolution.persistent_id() != Some(pid));
    }

    /// Placeholder bookkeeping.
    pub fn placeholders(&self) -> &PlaceholderMap {
        &self.placeholders
    }

    /// Mutable placeholder bookkeeping.
    pub fn placeholders_mut(&mut self) -> &mut PlaceholderMap {
        &mut self.placeholders
    }

    /// Prefetched rows.
    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    /// Mutable prefetched rows.
    pub fn session_mut(&mut self) -> &mut SessionCache {
        &mut self.session
    }

    /// Records that the transaction deleted `pid`.
    pub fn record_deleted(&mut self, pid: PersistentId) {
        self.deleted.insert(pid);
        self.forget_matches_of(pid);
    }

    /// Pids deleted by the transaction.
    pub fn deleted(&self) -> impl Iterator<Item = PersistentId> + '_ {
        self.deleted.iter().copied()
    }
}
