//! Store traits consumed by the transaction engine.
//!
//! The persistence engine itself is external. The engine only needs:
//!
//! - bulk lookup by natural key ([`StoreSession::resolve_persistent_ids`])
//! - bulk lookup by token hash ([`StoreSession::find_token_matches`])
//! - bulk load with an optional index join ([`StoreSession::load_resources`])
//! - buffered writes flushed in one batch ([`StoreSession::flush`])
//! - a transaction boundary ([`ResourceStore::begin`], commit, rollback)
//! - forward id paging for batch jobs ([`ResourceStore::fetch_id_page`])

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, StorageResult};
use crate::types::{
    ChunkSelection, IndexCategory, IndexRow, LoadedResource, PartitionId, PersistentId,
    RequestPartitionId, ResourceIdentity, ResourceRow, TokenIndexMatch, TypedPersistentId,
    WriteCounts,
};

/// Which token hash column a predicate compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenHash {
    /// Compare `hash_value`.
    Value(i64),
    /// Compare `hash_system_and_value`.
    SystemAndValue(i64),
}

impl TokenHash {
    /// Returns true if a token index hit satisfies this hash.
    pub fn matches(&self, hit: &TokenIndexMatch) -> bool {
        match self {
            TokenHash::Value(hash) => hit.hash_value == *hash,
            TokenHash::SystemAndValue(hash) => hit.hash_system_and_value == *hash,
        }
    }
}

/// Partition restriction attached to a hash predicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionPredicate {
    /// No restriction.
    Any,
    /// Only rows of the default partition (partition IS NULL).
    DefaultOnly,
    /// Only rows of the listed partitions.
    In(Vec<PartitionId>),
}

impl PartitionPredicate {
    /// Returns true if a row stored under `partition` passes.
    pub fn admits(&self, partition: Option<PartitionId>) -> bool {
        match self {
            PartitionPredicate::Any => true,
            PartitionPredicate::DefaultOnly => partition.is_none(),
            PartitionPredicate::In(ids) => partition.is_some_and(|p| ids.contains(&p)),
        }
    }
}

/// One disjunct of a bulk token hash lookup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenHashPredicate {
    /// The hash to compare.
    pub hash: TokenHash,
    /// The partition restriction.
    pub partition: PartitionPredicate,
}

impl TokenHashPredicate {
    /// Returns true if a token index hit satisfies this predicate.
    pub fn matches(&self, hit: &TokenIndexMatch) -> bool {
        self.hash.matches(hit) && self.partition.admits(hit.partition)
    }
}

/// How a write changes the stored index rows of its resource.
///
/// Built from the rows the transaction already knows. Categories whose stored
/// rows are unknown are cleared and rewritten; known categories only drop and
/// add the rows that differ.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexChanges {
    /// Categories whose stored rows are all dropped.
    pub cleared: BTreeSet<IndexCategory>,
    /// Stored rows to drop individually.
    pub removed: Vec<IndexRow>,
    /// Rows to write after dropping.
    pub added: Vec<IndexRow>,
    /// Known stored rows kept as they are.
    pub unchanged: usize,
}

impl IndexChanges {
    /// Diffs the new index rows of a resource against its known stored rows.
    ///
    /// `prior` answers the stored rows of one category, `None` when unknown.
    pub fn between(
        rows: &[IndexRow],
        mut prior: impl FnMut(IndexCategory) -> Option<Vec<IndexRow>>,
    ) -> Self {
        let mut changes = Self::default();
        for category in IndexCategory::ALL {
            let new: Vec<&IndexRow> = rows.iter().filter(|r| r.category() == category).collect();
            match prior(category) {
                None => {
                    changes.cleared.insert(category);
                    changes.added.extend(new.into_iter().cloned());
                }
                Some(old) if new.is_empty() => {
                    if !old.is_empty() {
                        changes.cleared.insert(category);
                    }
                }
                Some(old) => {
                    for row in &old {
                        if new.contains(&row) {
                            changes.unchanged += 1;
                        } else {
                            changes.removed.push(row.clone());
                        }
                    }
                    changes
                        .added
                        .extend(new.into_iter().filter(|row| !old.contains(*row)).cloned());
                }
            }
        }
        changes
    }

    /// Applies the changes to a resource's stored rows.
    pub fn apply(&self, stored: &mut Vec<IndexRow>) {
        stored.retain(|row| !self.cleared.contains(&row.category()) && !self.removed.contains(row));
        stored.extend(self.added.iter().cloned());
    }

    /// Returns true if the stored rows stay as they are.
    pub fn is_empty(&self) -> bool {
        self.cleared.is_empty() && self.removed.is_empty() && self.added.is_empty()
    }
}

/// A write staged in a session until the next flush.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// A new resource with its index rows.
    Insert {
        /// The first version.
        row: ResourceRow,
        /// Every index row of the resource.
        indexes: Vec<IndexRow>,
    },
    /// A new version of an existing resource.
    Update {
        /// The new version.
        row: ResourceRow,
        /// Every index row of the new version.
        indexes: Vec<IndexRow>,
        /// What changes against the stored rows.
        changes: IndexChanges,
    },
    /// A deletion; the row keeps its identity and loses its index rows.
    Delete {
        /// The deleted version.
        row: ResourceRow,
        /// The stored rows to drop.
        changes: IndexChanges,
    },
}

impl PendingWrite {
    /// The row this write produces.
    pub fn row(&self) -> &ResourceRow {
        match self {
            PendingWrite::Insert { row, .. }
            | PendingWrite::Update { row, .. }
            | PendingWrite::Delete { row, .. } => row,
        }
    }

    /// The index rows this write leaves behind.
    pub fn indexes(&self) -> &[IndexRow] {
        match self {
            PendingWrite::Insert { indexes, .. } | PendingWrite::Update { indexes, .. } => indexes,
            PendingWrite::Delete { .. } => &[],
        }
    }

    /// The index rows a backend has to write.
    pub fn added_indexes(&self) -> &[IndexRow] {
        match self {
            PendingWrite::Insert { indexes, .. } => indexes,
            PendingWrite::Update { changes, .. } | PendingWrite::Delete { changes, .. } => {
                &changes.added
            }
        }
    }

    /// Changes against the stored rows; `None` for inserts.
    pub fn changes(&self) -> Option<&IndexChanges> {
        match self {
            PendingWrite::Insert { .. } => None,
            PendingWrite::Update { changes, .. } | PendingWrite::Delete { changes, .. } => {
                Some(changes)
            }
        }
    }
}

/// Forward id page request.
#[derive(Debug, Clone)]
pub struct IdPageQuery<'a> {
    /// The job's selection.
    pub selection: &'a ChunkSelection,
    /// Only ids strictly greater than this one.
    pub after: Option<PersistentId>,
    /// Maximum number of ids.
    pub limit: usize,
}

/// A transactional store.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// The session type returned by [`begin`](Self::begin).
    type Session: StoreSession;

    /// A short name used in logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Begins a transaction.
    async fn begin(&self) -> StorageResult<Self::Session>;

    /// Returns up to `limit` selected, non-deleted ids after `after`, in
    /// ascending persistent id order.
    async fn fetch_id_page(&self, query: IdPageQuery<'_>) -> StorageResult<Vec<TypedPersistentId>>;
}

/// One open transaction against a store.
///
/// Reads see the session's own staged and flushed writes. Nothing becomes
/// visible to other sessions before [`commit`](Self::commit).
#[async_trait]
pub trait StoreSession: Send {
    /// Bulk lookup of natural keys within a partition scope.
    ///
    /// Returns one pair per matching row; absent identities are simply missing.
    async fn resolve_persistent_ids(
        &mut self,
        partition: &RequestPartitionId,
        identities: &[ResourceIdentity],
    ) -> StorageResult<Vec<(ResourceIdentity, PersistentId)>>;

    /// Bulk disjunctive lookup of token hashes.
    async fn find_token_matches(
        &mut self,
        predicates: &[TokenHashPredicate],
    ) -> StorageResult<Vec<TokenIndexMatch>>;

    /// Bulk load of primary rows, optionally joined with one index category.
    async fn load_resources(
        &mut self,
        pids: &[PersistentId],
        join: Option<IndexCategory>,
    ) -> StorageResult<Vec<LoadedResource>>;

    /// Reserves a fresh persistent id.
    async fn allocate_pid(&mut self) -> StorageResult<PersistentId>;

    /// Stages a write until the next flush.
    fn stage(&mut self, write: PendingWrite) -> StorageResult<()>;

    /// Counts of staged, unflushed writes.
    fn pending_counts(&self) -> WriteCounts;

    /// Writes every staged write to the store in one batch.
    async fn flush(&mut self) -> Result<WriteCounts, BackendError>;

    /// Commits the transaction, flushing first if needed.
    async fn commit(self) -> StorageResult<()>;

    /// Discards every write of the transaction.
    async fn rollback(self) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexValue;

    fn hit(partition: Option<PartitionId>) -> TokenIndexMatch {
        TokenIndexMatch {
            pid: PersistentId::new(1),
            partition,
            hash_value: 10,
            hash_system_and_value: 20,
        }
    }

    #[test]
    fn test_hash_predicate_compares_the_right_column() {
        assert!(TokenHash::Value(10).matches(&hit(None)));
        assert!(!TokenHash::Value(20).matches(&hit(None)));
        assert!(TokenHash::SystemAndValue(20).matches(&hit(None)));
    }

    #[test]
    fn test_partition_predicates() {
        let a = PartitionId::new(1);
        let predicate = TokenHashPredicate {
            hash: TokenHash::Value(10),
            partition: PartitionPredicate::In(vec![a]),
        };
        assert!(predicate.matches(&hit(Some(a))));
        assert!(!predicate.matches(&hit(None)));

        let default_only = TokenHashPredicate {
            hash: TokenHash::Value(10),
            partition: PartitionPredicate::DefaultOnly,
        };
        assert!(default_only.matches(&hit(None)));
        assert!(!default_only.matches(&hit(Some(a))));
    }

    fn index(param_name: &str, value: IndexValue) -> IndexRow {
        IndexRow {
            pid: PersistentId::new(1),
            partition: None,
            resource_type: "Patient".to_string(),
            param_name: param_name.to_string(),
            value,
        }
    }

    fn family(value: &str) -> IndexRow {
        index(
            "family",
            IndexValue::String {
                value: value.to_string(),
            },
        )
    }

    fn birthdate(value: &str) -> IndexRow {
        index(
            "birthdate",
            IndexValue::Date {
                value: value.to_string(),
            },
        )
    }

    #[test]
    fn test_index_changes_keep_known_rows() {
        let stored = vec![family("smith"), family("jones"), birthdate("1970-01-01")];
        let rows = vec![family("smith"), family("brown"), birthdate("1970-01-01")];

        let changes = IndexChanges::between(&rows, |category| match category {
            IndexCategory::String => Some(vec![family("smith"), family("jones")]),
            IndexCategory::Date => None,
            _ => Some(Vec::new()),
        });

        assert_eq!(changes.unchanged, 1);
        assert_eq!(changes.removed, vec![family("jones")]);
        assert_eq!(changes.added, vec![family("brown"), birthdate("1970-01-01")]);
        assert_eq!(changes.cleared.iter().copied().collect::<Vec<_>>(), vec![IndexCategory::Date]);

        let mut applied = stored;
        changes.apply(&mut applied);
        assert_eq!(applied.len(), rows.len());
        assert!(rows.iter().all(|row| applied.contains(row)));
    }

    #[test]
    fn test_index_changes_for_removed_rows() {
        let changes = IndexChanges::between(&[], |category| match category {
            IndexCategory::String => Some(vec![family("smith")]),
            _ => Some(Vec::new()),
        });
        assert_eq!(changes.cleared.iter().copied().collect::<Vec<_>>(), vec![IndexCategory::String]);
        assert!(changes.added.is_empty());

        let unchanged = IndexChanges::between(&[family("smith")], |category| match category {
            IndexCategory::String => Some(vec![family("smith")]),
            _ => Some(Vec::new()),
        });
        assert!(unchanged.is_empty());
        assert_eq!(unchanged.unchanged, 1);
    }
}
