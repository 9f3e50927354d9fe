//! Session-local buffer of staged writes.
//!
//! Every backend session keeps its unflushed writes here so that reads within
//! the same transaction see them before the flush reaches the store.

use std::collections::HashMap;

use crate::types::{
    IndexValue, LoadedResource, PersistentId, RequestPartitionId, ResourceIdentity,
    TokenIndexMatch, WriteCounts,
};

use super::store::{PendingWrite, TokenHashPredicate};

/// Ordered staged writes of one session.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    writes: Vec<PendingWrite>,
    latest: HashMap<PersistentId, usize>,
}

impl WriteBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a write. A later write for the same pid shadows earlier ones.
    pub fn stage(&mut self, write: PendingWrite) {
        self.latest.insert(write.row().pid, self.writes.len());
        self.writes.push(write);
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Counts staged writes per kind.
    pub fn counts(&self) -> WriteCounts {
        let mut counts = WriteCounts::default();
        for write in &self.writes {
            match write {
                PendingWrite::Insert { .. } => counts.inserts += 1,
                PendingWrite::Update { .. } => counts.updates += 1,
                PendingWrite::Delete { .. } => counts.deletes += 1,
            }
        }
        counts
    }

    /// Resource types touched by staged writes, sorted and deduplicated.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .writes
            .iter()
            .map(|w| w.row().identity.resource_type().to_string())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Takes every staged write in staging order.
    pub fn drain(&mut self) -> Vec<PendingWrite> {
        self.latest.clear();
        std::mem::take(&mut self.writes)
    }

    /// The newest staged state of a pid.
    pub fn latest(&self, pid: PersistentId) -> Option<&PendingWrite> {
        self.latest.get(&pid).map(|&i| &self.writes[i])
    }

    /// The newest staged state of a pid as a loaded resource.
    pub fn loaded(&self, pid: PersistentId) -> Option<LoadedResource> {
        self.latest(pid).map(|write| LoadedResource {
            row: write.row().clone(),
            indexes: write.indexes().to_vec(),
        })
    }

    /// Finds the pid a staged write assigned to an identity within a scope.
    pub fn find_identity(
        &self,
        partition: &RequestPartitionId,
        identity: &ResourceIdentity,
    ) -> Option<PersistentId> {
        self.latest
            .values()
            .map(|&i| self.writes[i].row())
            .find(|row| &row.identity == identity && partition.admits(row.partition))
            .map(|row| row.pid)
    }

    /// Pids whose staged state shadows whatever the store holds.
    pub fn shadowed(&self) -> impl Iterator<Item = PersistentId> + '_ {
        self.latest.keys().copied()
    }

    /// Token index hits among the newest staged states.
    pub fn token_matches(&self, predicates: &[TokenHashPredicate]) -> Vec<TokenIndexMatch> {
        let mut hits = Vec::new();
        for &i in self.latest.values() {
            for index in self.writes[i].indexes() {
                let IndexValue::Token {
                    hash_value,
                    hash_system_and_value,
                    ..
                } = &index.value
                else {
                    continue;
                };
                let hit = TokenIndexMatch {
                    pid: index.pid,
                    partition: index.partition,
                    hash_value: *hash_value,
                    hash_system_and_value: *hash_system_and_value,
                };
                if predicates.iter().any(|p| p.matches(&hit)) {
                    hits.push(hit);
                }
            }
        }
        hits
    }
}
