//! Results of applying a transaction bundle.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{PersistentId, ResourceIdentity};
use super::partition::RequestPartitionId;

/// Final persistent outcome of one bundle entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EntryOutcome {
    /// A new resource was stored.
    Created {
        /// Identity of the new resource.
        identity: ResourceIdentity,
        /// Its persistent id.
        pid: PersistentId,
        /// The version written.
        version: u64,
    },
    /// An existing resource received a new version.
    Updated {
        /// Identity of the updated resource.
        identity: ResourceIdentity,
        /// Its persistent id.
        pid: PersistentId,
        /// The version written.
        version: u64,
    },
    /// A resource was marked deleted.
    Deleted {
        /// Identity of the deleted resource.
        identity: ResourceIdentity,
        /// Its persistent id.
        pid: PersistentId,
        /// The version written.
        version: u64,
    },
    /// Nothing was written: an `if-none-exist` matched, or the delete target
    /// did not exist.
    NoOp {
        /// Identity of the matched or targeted resource, when known.
        identity: Option<ResourceIdentity>,
        /// Persistent id of the matched resource, when one exists.
        pid: Option<PersistentId>,
    },
}

impl EntryOutcome {
    /// The resource identity the entry ended up addressing.
    pub fn identity(&self) -> Option<&ResourceIdentity> {
        match self {
            EntryOutcome::Created { identity, .. }
            | EntryOutcome::Updated { identity, .. }
            | EntryOutcome::Deleted { identity, .. } => Some(identity),
            EntryOutcome::NoOp { identity, .. } => identity.as_ref(),
        }
    }

    /// The persistent id the entry ended up addressing.
    pub fn persistent_id(&self) -> Option<PersistentId> {
        match self {
            EntryOutcome::Created { pid, .. }
            | EntryOutcome::Updated { pid, .. }
            | EntryOutcome::Deleted { pid, .. } => Some(*pid),
            EntryOutcome::NoOp { pid, .. } => *pid,
        }
    }

    /// The version assigned by the write, if any.
    pub fn version(&self) -> Option<u64> {
        match self {
            EntryOutcome::Created { version, .. }
            | EntryOutcome::Updated { version, .. }
            | EntryOutcome::Deleted { version, .. } => Some(*version),
            EntryOutcome::NoOp { .. } => None,
        }
    }

    /// Returns true if a write was staged for this entry.
    pub fn is_write(&self) -> bool {
        !matches!(self, EntryOutcome::NoOp { .. })
    }
}

/// The key a caller uses to look up an entry's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum TransactionKey {
    /// The entry's placeholder full-URL.
    Placeholder(String),
    /// The declared or resulting resource identity.
    Resource(ResourceIdentity),
    /// The entry position, for entries that addressed nothing.
    Entry(usize),
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKey::Placeholder(token) => write!(f, "{}", token),
            TransactionKey::Resource(identity) => write!(f, "{}", identity),
            TransactionKey::Entry(index) => write!(f, "entry[{}]", index),
        }
    }
}

/// Counts of buffered writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    /// Inserted resources.
    pub inserts: usize,
    /// Updated resources (new versions).
    pub updates: usize,
    /// Deleted resources.
    pub deletes: usize,
}

impl WriteCounts {
    /// Total number of writes.
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

/// States of the transaction state machine.
///
/// A transaction moves forward through the states in declaration order;
/// [`Failed`](Self::Failed) is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionPhase {
    /// Session open, nothing done yet.
    #[default]
    Start,
    /// Partition scope decided.
    PartitionDetermined,
    /// Direct identities pre-resolved.
    IdentitiesResolved,
    /// Eligible match URLs pre-resolved.
    MatchesResolved,
    /// Prefetch ran or was skipped.
    Prefetched,
    /// Every entry applied in bundle order.
    EntriesApplied,
    /// Buffered writes reached the store.
    Flushed,
    /// Transaction committed.
    Committed,
    /// Transaction rolled back.
    Failed,
}

impl TransactionPhase {
    /// The state that follows this one on success, if any.
    pub fn next(&self) -> Option<TransactionPhase> {
        use TransactionPhase::*;
        match self {
            Start => Some(PartitionDetermined),
            PartitionDetermined => Some(IdentitiesResolved),
            IdentitiesResolved => Some(MatchesResolved),
            MatchesResolved => Some(Prefetched),
            Prefetched => Some(EntriesApplied),
            EntriesApplied => Some(Flushed),
            Flushed => Some(Committed),
            Committed | Failed => None,
        }
    }

    /// Returns true for `Committed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionPhase::Committed | TransactionPhase::Failed)
    }

    /// Kebab-case name used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPhase::Start => "start",
            TransactionPhase::PartitionDetermined => "partition-determined",
            TransactionPhase::IdentitiesResolved => "identities-resolved",
            TransactionPhase::MatchesResolved => "matches-resolved",
            TransactionPhase::Prefetched => "prefetched",
            TransactionPhase::EntriesApplied => "entries-applied",
            TransactionPhase::Flushed => "flushed",
            TransactionPhase::Committed => "committed",
            TransactionPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics collected while processing one transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionStats {
    /// Last state reached.
    pub phase: TransactionPhase,
    /// Partition scope the bulk phases ran under.
    pub partition: Option<RequestPartitionId>,
    /// Whether the prefetcher loaded anything.
    pub prefetched: bool,
    /// Bulk identity lookups issued.
    pub identity_queries: usize,
    /// Bulk match-URL lookups issued.
    pub match_queries: usize,
    /// Prefetch queries issued (primary rows plus index joins).
    pub prefetch_queries: usize,
    /// Index categories joined by the prefetcher.
    pub joined_categories: Vec<String>,
    /// Identities resolved before entry application.
    pub identities_resolved: usize,
    /// Match URLs resolved before entry application.
    pub match_urls_resolved: usize,
    /// Known stored index rows that updates kept instead of rewriting.
    pub index_rows_reused: usize,
    /// Writes flushed.
    pub flushed: WriteCounts,
    /// Flush duration in milliseconds.
    pub flush_millis: u64,
}

/// The result of a committed transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionResponse {
    /// Outcomes keyed by the identity the caller used for each entry.
    pub outcomes: HashMap<TransactionKey, EntryOutcome>,
    /// Outcomes in bundle order.
    pub entries: Vec<EntryOutcome>,
    /// Processing diagnostics.
    pub stats: TransactionStats,
}

impl TransactionResponse {
    /// Looks up the outcome for a placeholder full-URL.
    pub fn for_placeholder(&self, placeholder: &str) -> Option<&EntryOutcome> {
        self.outcomes
            .get(&TransactionKey::Placeholder(placeholder.to_string()))
    }

    /// Looks up the outcome for a resource identity.
    pub fn for_identity(&self, identity: &ResourceIdentity) -> Option<&EntryOutcome> {
        self.outcomes
            .get(&TransactionKey::Resource(identity.clone()))
    }
}
