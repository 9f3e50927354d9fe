//! Bulk prefetch of resolved resources.
//!
//! After identities and match URLs are resolved, the prefetcher loads every
//! found resource in one query and joins each index category that enough of
//! those rows populate. Results go into the transaction's
//! [`SessionCache`](crate::cache::SessionCache).
//!
//! Prefetch is an optimization only. A failing query is logged and the
//! transaction continues with whatever was loaded; entry application falls back
//! to individual reads for anything missing.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::cache::TransactionCaches;
use crate::config::ProcessorConfig;
use crate::core::StoreSession;
use crate::types::{IndexCategory, PersistentId, RequestPartitionId};

/// What the prefetcher loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchSet {
    /// Persistent ids whose primary rows were loaded.
    pub ids: Vec<PersistentId>,
    /// Index categories joined for those rows.
    pub joined: Vec<IndexCategory>,
}

/// Why prefetch did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchSkip {
    /// Entries did not agree on one partition.
    PartitionUndetermined,
    /// Not more than the threshold of ids were resolved.
    BelowThreshold {
        /// Ids resolved before application.
        count: usize,
        /// The configured prefetch threshold.
        threshold: usize,
    },
}

/// Result of a prefetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Nothing was loaded.
    Skipped(PrefetchSkip),
    /// Rows were loaded; `set.joined` names the categories that made it.
    Loaded {
        /// What was loaded.
        set: PrefetchSet,
        /// Queries issued.
        queries: usize,
    },
    /// The primary load failed; nothing was attached.
    Degraded {
        /// Queries issued.
        queries: usize,
        /// The backend's error message.
        message: String,
    },
}

impl PrefetchOutcome {
    /// Queries issued, successful or not.
    pub fn queries(&self) -> usize {
        match self {
            PrefetchOutcome::Skipped(_) => 0,
            PrefetchOutcome::Loaded { queries, .. } | PrefetchOutcome::Degraded { queries, .. } => {
                *queries
            }
        }
    }

    /// The loaded set, if anything was loaded.
    pub fn set(&self) -> Option<&PrefetchSet> {
        match self {
            PrefetchOutcome::Loaded { set, .. } => Some(set),
            _ => None,
        }
    }
}

/// Decides when to prefetch and what to join.
#[derive(Debug, Clone, Copy)]
pub struct Prefetcher {
    prefetch_threshold: usize,
    index_join_threshold: usize,
}

impl Default for Prefetcher {
    fn default() -> Self {
        Self::from_config(&ProcessorConfig::default())
    }
}

impl Prefetcher {
    /// Creates a prefetcher with the processor's thresholds.
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            prefetch_threshold: config.prefetch_threshold,
            index_join_threshold: config.index_join_threshold,
        }
    }

    /// Ids eligible for prefetch: every found identity and match URL, deduplicated.
    pub fn candidates(caches: &TransactionCaches) -> Vec<PersistentId> {
        caches
            .found_identities()
            .chain(caches.found_match_urls().map(|(_, pid)| pid))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Prefetches under `scope` if the transaction qualifies.
    pub async fn prefetch<S: StoreSession>(
        &self,
        session: &mut S,
        caches: &mut TransactionCaches,
        scope: &RequestPartitionId,
    ) -> PrefetchOutcome {
        if !scope.is_determined() {
            debug!("Skipping prefetch, partition undetermined");
            return PrefetchOutcome::Skipped(PrefetchSkip::PartitionUndetermined);
        }

        let ids = Self::candidates(caches);
        if ids.len() <= self.prefetch_threshold {
            debug!(
                count = ids.len(),
                threshold = self.prefetch_threshold,
                "Skipping prefetch, too few resolved ids"
            );
            return PrefetchOutcome::Skipped(PrefetchSkip::BelowThreshold {
                count: ids.len(),
                threshold: self.prefetch_threshold,
            });
        }

        let mut queries = 1;
        let loaded = match session.load_resources(&ids, None).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, ids = ids.len(), "Prefetch of primary rows failed, continuing without it");
                return PrefetchOutcome::Degraded {
                    queries,
                    message: e.to_string(),
                };
            }
        };

        let populations: Vec<_> = loaded.iter().map(|r| (r.row.pid, r.row.populated)).collect();
        debug!(ids = ids.len(), rows = loaded.len(), "Prefetched primary rows");
        caches.session_mut().attach_rows(loaded);

        let mut joined = Vec::new();
        for category in IndexCategory::ALL {
            let pids: Vec<PersistentId> = populations
                .iter()
                .filter(|(_, populated)| populated.contains(category))
                .map(|(pid, _)| *pid)
                .collect();
            if pids.len() <= self.index_join_threshold {
                continue;
            }
            queries += 1;
            match session.load_resources(&pids, Some(category)).await {
                Ok(rows) => {
                    debug!(category = %category, rows = rows.len(), "Prefetched index rows");
                    caches.session_mut().attach_indexes(category, rows);
                    joined.push(category);
                }
                Err(e) => {
                    warn!(category = %category, error = %e, "Prefetch of index rows failed, skipping category");
                }
            }
        }

        PrefetchOutcome::Loaded {
            set: PrefetchSet { ids, joined },
            queries,
        }
    }
}
