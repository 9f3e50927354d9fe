//! In-memory store.
//!
//! A complete [`ResourceStore`] kept in process memory. Sessions stage writes
//! in a [`WriteBuffer`], move them into a private overlay on flush, and apply
//! the overlay to the shared state on commit. Other sessions never observe
//! uncommitted writes.
//!
//! The store counts every query it serves (see [`QueryCounts`]) so callers can
//! check how many round trips a transaction took.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{
    IdPageQuery, PendingWrite, ResourceStore, StoreSession, TokenHashPredicate, WriteBuffer,
};
use crate::error::{BackendError, StorageResult};
use crate::types::{
    IndexCategory, IndexRow, IndexValue, LoadedResource, PersistentId, RequestPartitionId,
    ResourceIdentity, ResourceRow, TokenIndexMatch, TypedPersistentId, WriteCounts,
};

const BACKEND_NAME: &str = "memory";

/// Number of queries served, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCounts {
    /// Natural key lookups.
    pub identity_lookups: usize,
    /// Token hash lookups.
    pub hash_lookups: usize,
    /// Primary row loads, joined or not.
    pub resource_loads: usize,
    /// Loads that joined an index category.
    pub index_joins: usize,
    /// Session flushes.
    pub flushes: usize,
    /// Id page queries.
    pub id_pages: usize,
    /// Committed sessions.
    pub commits: usize,
    /// Rolled back sessions.
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<PersistentId, ResourceRow>,
    indexes: HashMap<PersistentId, Vec<IndexRow>>,
    by_identity: HashMap<ResourceIdentity, PersistentId>,
}

impl MemoryState {
    fn apply(&mut self, resource: LoadedResource) {
        let pid = resource.row.pid;
        self.by_identity.insert(resource.row.identity.clone(), pid);
        self.indexes.insert(pid, resource.indexes);
        self.rows.insert(pid, resource.row);
    }
}

#[derive(Debug, Default)]
struct Faults {
    index_joins: AtomicBool,
}

/// A transactional store held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    next_pid: Arc<AtomicI64>,
    counts: Arc<Mutex<QueryCounts>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries served so far.
    pub fn query_counts(&self) -> QueryCounts {
        *self.counts.lock()
    }

    /// Resets the query counters.
    pub fn reset_query_counts(&self) {
        *self.counts.lock() = QueryCounts::default();
    }

    /// Makes every index-joined load fail until turned off again.
    pub fn fail_index_joins(&self, fail: bool) {
        self.faults.index_joins.store(fail, Ordering::SeqCst);
    }

    /// The committed row of an identity, deleted or not.
    pub fn get(&self, identity: &ResourceIdentity) -> Option<ResourceRow> {
        let state = self.state.read();
        let pid = state.by_identity.get(identity)?;
        state.rows.get(pid).cloned()
    }

    /// The committed index rows of a pid.
    pub fn indexes_of(&self, pid: PersistentId) -> Vec<IndexRow> {
        self.state
            .read()
            .indexes
            .get(&pid)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of committed rows, including deleted ones.
    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    /// Returns true if nothing was ever committed.
    pub fn is_empty(&self) -> bool {
        self.state.read().rows.is_empty()
    }

    fn count(&self, update: impl FnOnce(&mut QueryCounts)) {
        update(&mut self.counts.lock());
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    type Session = InMemorySession;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn begin(&self) -> StorageResult<Self::Session> {
        Ok(InMemorySession {
            store: self.clone(),
            buffer: WriteBuffer::new(),
            overlay: BTreeMap::new(),
            overlay_identities: HashMap::new(),
        })
    }

    async fn fetch_id_page(&self, query: IdPageQuery<'_>) -> StorageResult<Vec<TypedPersistentId>> {
        self.count(|c| c.id_pages += 1);
        let state = self.state.read();
        let start = query
            .after
            .map(|pid| PersistentId::new(pid.value().saturating_add(1)))
            .unwrap_or(PersistentId::new(i64::MIN));
        let selection = query.selection;

        let ids = state
            .rows
            .range(start..)
            .map(|(_, row)| row)
            .filter(|row| !row.deleted)
            .filter(|row| selection.selects_type(row.identity.resource_type()))
            .filter(|row| selection.selects_time(row.last_updated))
            .filter(|row| selection.partition.admits(row.partition))
            .take(query.limit)
            .map(|row| TypedPersistentId {
                resource_type: row.identity.resource_type().to_string(),
                pid: row.pid,
                partition: row.partition,
            })
            .collect();
        Ok(ids)
    }
}

/// An open transaction against an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryStore,
    buffer: WriteBuffer,
    overlay: BTreeMap<PersistentId, LoadedResource>,
    overlay_identities: HashMap<ResourceIdentity, PersistentId>,
}

impl InMemorySession {
    /// The newest state of a pid visible to this session.
    fn visible(&self, state: &MemoryState, pid: PersistentId) -> Option<LoadedResource> {
        if let Some(staged) = self.buffer.loaded(pid) {
            return Some(staged);
        }
        if let Some(flushed) = self.overlay.get(&pid) {
            return Some(flushed.clone());
        }
        let row = state.rows.get(&pid)?;
        Some(LoadedResource {
            row: row.clone(),
            indexes: state.indexes.get(&pid).cloned().unwrap_or_default(),
        })
    }

    fn visible_pid(&self, state: &MemoryState, identity: &ResourceIdentity) -> Option<PersistentId> {
        self.overlay_identities
            .get(identity)
            .or_else(|| state.by_identity.get(identity))
            .copied()
    }

    fn constraint(&self, resource_types: Vec<String>, identity: &ResourceIdentity) -> BackendError {
        BackendError::ConstraintViolation {
            backend_name: BACKEND_NAME.to_string(),
            resource_types,
            message: format!("duplicate resource identity {}", identity),
        }
    }
}

fn token_hit(index: &IndexRow) -> Option<TokenIndexMatch> {
    match &index.value {
        IndexValue::Token {
            hash_value,
            hash_system_and_value,
            ..
        } => Some(TokenIndexMatch {
            pid: index.pid,
            partition: index.partition,
            hash_value: *hash_value,
            hash_system_and_value: *hash_system_and_value,
        }),
        _ => None,
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn resolve_persistent_ids(
        &mut self,
        partition: &RequestPartitionId,
        identities: &[ResourceIdentity],
    ) -> StorageResult<Vec<(ResourceIdentity, PersistentId)>> {
        self.store.count(|c| c.identity_lookups += 1);
        let state = self.store.state.read();

        let mut found = Vec::new();
        for identity in identities {
            if let Some(pid) = self.buffer.find_identity(partition, identity) {
                found.push((identity.clone(), pid));
                continue;
            }
            let Some(pid) = self.visible_pid(&state, identity) else {
                continue;
            };
            if self
                .visible(&state, pid)
                .is_some_and(|r| partition.admits(r.row.partition))
            {
                found.push((identity.clone(), pid));
            }
        }
        Ok(found)
    }

    async fn find_token_matches(
        &mut self,
        predicates: &[TokenHashPredicate],
    ) -> StorageResult<Vec<TokenIndexMatch>> {
        self.store.count(|c| c.hash_lookups += 1);
        let state = self.store.state.read();

        let shadowed: HashSet<PersistentId> = self.buffer.shadowed().collect();
        let mut hits = self.buffer.token_matches(predicates);

        let admits = |hit: &TokenIndexMatch| predicates.iter().any(|p| p.matches(hit));
        for (pid, resource) in &self.overlay {
            if shadowed.contains(pid) {
                continue;
            }
            hits.extend(resource.indexes.iter().filter_map(token_hit).filter(admits));
        }
        for (pid, indexes) in &state.indexes {
            if shadowed.contains(pid) || self.overlay.contains_key(pid) {
                continue;
            }
            hits.extend(indexes.iter().filter_map(token_hit).filter(admits));
        }
        Ok(hits)
    }

    async fn load_resources(
        &mut self,
        pids: &[PersistentId],
        join: Option<IndexCategory>,
    ) -> StorageResult<Vec<LoadedResource>> {
        self.store.count(|c| {
            c.resource_loads += 1;
            if join.is_some() {
                c.index_joins += 1;
            }
        });
        if let Some(category) = join {
            if self.store.faults.index_joins.load(Ordering::SeqCst) {
                return Err(BackendError::QueryError {
                    message: format!("{} index join failed", category),
                }
                .into());
            }
        }

        let state = self.store.state.read();
        let loaded = pids
            .iter()
            .filter_map(|&pid| self.visible(&state, pid))
            .map(|mut resource| {
                match join {
                    Some(category) => resource.indexes.retain(|i| i.category() == category),
                    None => resource.indexes.clear(),
                }
                resource
            })
            .collect();
        Ok(loaded)
    }

    async fn allocate_pid(&mut self) -> StorageResult<PersistentId> {
        Ok(PersistentId::new(
            self.store.next_pid.fetch_add(1, Ordering::SeqCst) + 1,
        ))
    }

    fn stage(&mut self, write: PendingWrite) -> StorageResult<()> {
        self.buffer.stage(write);
        Ok(())
    }

    fn pending_counts(&self) -> WriteCounts {
        self.buffer.counts()
    }

    async fn flush(&mut self) -> Result<WriteCounts, BackendError> {
        self.store.count(|c| c.flushes += 1);
        if self.buffer.is_empty() {
            return Ok(WriteCounts::default());
        }

        let counts = self.buffer.counts();
        let resource_types = self.buffer.resource_types();
        let writes = self.buffer.drain();

        {
            let state = self.store.state.read();
            let mut batch: HashMap<&ResourceIdentity, PersistentId> = HashMap::new();
            for write in &writes {
                let row = write.row();
                let owner = batch
                    .get(&row.identity)
                    .copied()
                    .or_else(|| self.visible_pid(&state, &row.identity));
                if owner.is_some_and(|pid| pid != row.pid) {
                    return Err(self.constraint(resource_types, &row.identity));
                }
                batch.insert(&row.identity, row.pid);
            }
        }

        let state = self.store.state.read();
        for write in writes {
            let pid = write.row().pid;
            let indexes = match write.changes() {
                None => write.indexes().to_vec(),
                Some(changes) => {
                    let mut stored = match self.overlay.get(&pid) {
                        Some(flushed) => flushed.indexes.clone(),
                        None => state.indexes.get(&pid).cloned().unwrap_or_default(),
                    };
                    changes.apply(&mut stored);
                    stored
                }
            };
            let row = match write {
                PendingWrite::Insert { row, .. }
                | PendingWrite::Update { row, .. }
                | PendingWrite::Delete { row, .. } => row,
            };
            self.overlay_identities.insert(row.identity.clone(), row.pid);
            self.overlay.insert(pid, LoadedResource { row, indexes });
        }
        drop(state);

        debug!(
            backend = BACKEND_NAME,
            inserts = counts.inserts,
            updates = counts.updates,
            deletes = counts.deletes,
            "Flushed session writes"
        );
        Ok(counts)
    }

    async fn commit(mut self) -> StorageResult<()> {
        if !self.buffer.is_empty() {
            self.flush().await?;
        }

        let mut state = self.store.state.write();
        for (identity, pid) in &self.overlay_identities {
            if state.by_identity.get(identity).is_some_and(|owner| owner != pid) {
                let resource_types = vec![identity.resource_type().to_string()];
                return Err(self.constraint(resource_types, identity).into());
            }
        }
        for resource in std::mem::take(&mut self.overlay).into_values() {
            state.apply(resource);
        }
        drop(state);

        self.store.count(|c| c.commits += 1);
        Ok(())
    }

    async fn rollback(self) -> StorageResult<()> {
        self.store.count(|c| c.rollbacks += 1);
        debug!(
            backend = BACKEND_NAME,
            discarded = self.overlay.len(),
            "Rolled back session"
        );
        Ok(())
    }
}
