//! Partition identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A concrete storage partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(i32);

impl PartitionId {
    /// Wraps a raw partition number.
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Returns the raw partition number.
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The partition scope of a request or transaction.
///
/// Resources in the default partition carry no partition id in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPartitionId {
    /// Partitioning is disabled, or the request spans every partition.
    AllPartitions,
    /// The default partition.
    Default,
    /// One concrete partition.
    Partition(PartitionId),
    /// Entries disagree or could not be placed; prefetching is disabled.
    Undetermined,
}

impl RequestPartitionId {
    /// Returns true for the all-partitions scope.
    pub fn is_all_partitions(&self) -> bool {
        matches!(self, RequestPartitionId::AllPartitions)
    }

    /// Returns true for the default partition.
    pub fn is_default_partition(&self) -> bool {
        matches!(self, RequestPartitionId::Default)
    }

    /// Returns true unless the scope is undetermined.
    pub fn is_determined(&self) -> bool {
        !matches!(self, RequestPartitionId::Undetermined)
    }

    /// Returns the partition a new resource in this scope is stored under.
    ///
    /// `None` means the default partition.
    pub fn storage_partition(&self) -> Option<PartitionId> {
        match self {
            RequestPartitionId::Partition(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns true if a row stored under `partition` is visible in this scope.
    pub fn admits(&self, partition: Option<PartitionId>) -> bool {
        match self {
            RequestPartitionId::AllPartitions | RequestPartitionId::Undetermined => true,
            RequestPartitionId::Default => partition.is_none(),
            RequestPartitionId::Partition(id) => partition == Some(*id),
        }
    }
}

impl fmt::Display for RequestPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPartitionId::AllPartitions => write!(f, "all-partitions"),
            RequestPartitionId::Default => write!(f, "default"),
            RequestPartitionId::Partition(id) => write!(f, "partition-{}", id),
            RequestPartitionId::Undetermined => write!(f, "undetermined"),
        }
    }
}
