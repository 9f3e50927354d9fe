//! Configuration for the transaction processor and batch id paging.
//!
//! All settings deserialize with serde and fall back to defaults, so a
//! deployment only spells out what it changes:
//!
//! ```
//! use helios_transaction::config::ProcessorConfig;
//!
//! let config: ProcessorConfig = serde_json::from_str(r#"{
//!     "partitioning": { "enabled": true }
//! }"#).unwrap();
//!
//! assert!(config.partitioning.enabled);
//! assert_eq!(config.prefetch_threshold, 2);
//! ```

use serde::{Deserialize, Serialize};

/// Partitioning settings of the deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSettings {
    /// Whether resources are stored in partitions at all.
    #[serde(default)]
    pub enabled: bool,

    /// Whether the partition id is folded into search hashes.
    ///
    /// When it is, hash lookups need no separate partition predicate.
    #[serde(default)]
    pub include_partition_in_search_hashes: bool,

    /// Partition number hashed for the default partition.
    #[serde(default)]
    pub default_partition_id: Option<i32>,
}

impl PartitionSettings {
    /// Settings with partitioning disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Settings with partitioning enabled.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Folds the partition into search hashes.
    pub fn with_partition_in_hashes(mut self) -> Self {
        self.include_partition_in_search_hashes = true;
        self
    }

    /// Returns true if hash lookups must carry a separate partition predicate.
    pub fn needs_partition_predicate(&self) -> bool {
        self.enabled && !self.include_partition_in_search_hashes
    }
}

/// Settings of the transaction bundle processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Prefetch runs only when more than this many ids were pre-resolved.
    #[serde(default = "default_prefetch_threshold")]
    pub prefetch_threshold: usize,

    /// An index category is joined only when more than this many prefetched
    /// rows populate it.
    #[serde(default = "default_index_join_threshold")]
    pub index_join_threshold: usize,

    /// Whether single-predicate match URLs are resolved in one bulk query.
    #[serde(default = "default_true")]
    pub bulk_match_resolution: bool,

    /// Partitioning settings.
    #[serde(default)]
    pub partitioning: PartitionSettings,
}

fn default_prefetch_threshold() -> usize {
    2
}

fn default_index_join_threshold() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            prefetch_threshold: default_prefetch_threshold(),
            index_join_threshold: default_index_join_threshold(),
            bulk_match_resolution: true,
            partitioning: PartitionSettings::default(),
        }
    }
}

impl ProcessorConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prefetch activation threshold.
    pub fn with_prefetch_threshold(mut self, threshold: usize) -> Self {
        self.prefetch_threshold = threshold;
        self
    }

    /// Sets the index join threshold.
    pub fn with_index_join_threshold(mut self, threshold: usize) -> Self {
        self.index_join_threshold = threshold;
        self
    }

    /// Enables or disables bulk match-URL resolution.
    pub fn with_bulk_match_resolution(mut self, enabled: bool) -> Self {
        self.bulk_match_resolution = enabled;
        self
    }

    /// Sets partitioning settings.
    pub fn with_partitioning(mut self, partitioning: PartitionSettings) -> Self {
        self.partitioning = partitioning;
        self
    }
}

/// Settings of the chunked id producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Page size used when a job does not ask for one.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Largest page size a job may ask for.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_page_size() -> usize {
    500
}

fn default_max_page_size() -> usize {
    10_000
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl ChunkConfig {
    /// Sets the default page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the maximum page size.
    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size;
        self
    }
}
