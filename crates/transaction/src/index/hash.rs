//! Search hash computation.
//!
//! Token index rows carry two precomputed hashes so that a single-predicate
//! match URL becomes one equality lookup:
//!
//! - `hash_value` over (resource type, parameter, value)
//! - `hash_system_and_value` over (resource type, parameter, system, value)
//!
//! When the deployment folds partitions into hashes, the partition number is
//! hashed first, so lookups need no separate partition predicate.

use xxhash_rust::xxh3::Xxh3;

use crate::config::PartitionSettings;
use crate::types::PartitionId;

const SEPARATOR: &[u8] = &[0x1f];

/// Computes search hashes for a deployment's partition settings.
#[derive(Debug, Clone, Default)]
pub struct SearchHasher {
    settings: PartitionSettings,
}

impl SearchHasher {
    /// Creates a hasher for the given partition settings.
    pub fn new(settings: PartitionSettings) -> Self {
        Self { settings }
    }

    /// Returns the partition settings.
    pub fn settings(&self) -> &PartitionSettings {
        &self.settings
    }

    /// Hash of (resource type, parameter, value).
    pub fn hash_value(
        &self,
        partition: Option<PartitionId>,
        resource_type: &str,
        param_name: &str,
        value: &str,
    ) -> i64 {
        self.hash(partition, &[resource_type, param_name, value])
    }

    /// Hash of (resource type, parameter, system, value).
    pub fn hash_system_and_value(
        &self,
        partition: Option<PartitionId>,
        resource_type: &str,
        param_name: &str,
        system: &str,
        value: &str,
    ) -> i64 {
        self.hash(partition, &[resource_type, param_name, system, value])
    }

    fn hash(&self, partition: Option<PartitionId>, components: &[&str]) -> i64 {
        let mut hasher = Xxh3::new();
        if self.settings.enabled && self.settings.include_partition_in_search_hashes {
            let number = partition
                .map(|p| p.value())
                .or(self.settings.default_partition_id);
            match number {
                Some(n) => hasher.update(n.to_string().as_bytes()),
                None => hasher.update(b"default"),
            }
            hasher.update(SEPARATOR);
        }
        for component in components {
            hasher.update(component.as_bytes());
            hasher.update(SEPARATOR);
        }
        hasher.digest() as i64
    }
}
