//! Transaction bundle processing.
//!
//! [`TransactionProcessor::process_transaction`] applies a whole bundle as one
//! atomic unit. The transaction walks a fixed sequence of states:
//!
//! ```text
//! START -> PARTITION-DETERMINED -> IDENTITIES-RESOLVED -> MATCHES-RESOLVED
//!       -> PREFETCHED -> ENTRIES-APPLIED -> FLUSHED -> COMMITTED
//! ```
//!
//! Any error moves it to FAILED, rolls the store session back and surfaces as
//! [`TransactionError::RolledBack`] naming the state that failed.
//!
//! The three bulk phases only run when every entry agrees on one partition;
//! otherwise entry application resolves everything individually.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::applier::{ApplyContext, ApplyServices, DefaultWriteApplier, WriteApplier};
use crate::cache::{InMemoryMatchUrlCache, MatchUrlCache, TransactionCaches};
use crate::config::ProcessorConfig;
use crate::core::{ResourceStore, StoreSession};
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::index::{BasicIndexExtractor, IndexExtractor, SearchHasher};
use crate::partition::{PartitionResolver, PartitionRouter, RequestPartitionResolver};
use crate::prefetch::{PrefetchOutcome, Prefetcher};
use crate::resolver::{
    ConditionalMatchResolver, IdentityResolver, MatchUrlParser, SearchParamRegistry,
};
use crate::types::{
    Bundle, EntryOutcome, RequestContext, Resolution, ResourceIdentity, TransactionKey,
    TransactionPhase, TransactionResponse, TransactionStats,
};

/// Mutable state of one running transaction.
#[derive(Debug, Default)]
struct TransactionRun {
    phase: TransactionPhase,
    attempting: TransactionPhase,
    caches: TransactionCaches,
    stats: TransactionStats,
}

impl TransactionRun {
    /// Marks the start of the transition into the next state.
    fn begin_next(&mut self) {
        if let Some(next) = self.phase.next() {
            self.attempting = next;
        }
    }

    /// Completes the transition started by [`begin_next`](Self::begin_next).
    fn complete(&mut self) {
        self.phase = self.attempting;
        self.stats.phase = self.phase;
    }

    fn step(&mut self) -> TransactionPhase {
        self.begin_next();
        self.attempting
    }
}

/// Applies transaction bundles against a [`ResourceStore`].
pub struct TransactionProcessor<S: ResourceStore, A = DefaultWriteApplier> {
    store: Arc<S>,
    applier: A,
    config: ProcessorConfig,
    services: ApplyServices,
    prefetcher: Prefetcher,
}

impl<S: ResourceStore> TransactionProcessor<S, DefaultWriteApplier> {
    /// Creates a processor with the default applier, request-based partition
    /// resolution, an in-memory standing match-URL cache and basic index extraction.
    pub fn new(store: Arc<S>, config: ProcessorConfig) -> Self {
        let hasher = SearchHasher::new(config.partitioning.clone());
        let services = ApplyServices {
            router: PartitionRouter::new(
                config.partitioning.clone(),
                Arc::new(RequestPartitionResolver),
            ),
            identities: IdentityResolver::new(),
            matcher: ConditionalMatchResolver::new(
                MatchUrlParser::default(),
                hasher.clone(),
                Arc::new(InMemoryMatchUrlCache::new()),
            ),
            hasher,
            extractor: Arc::new(BasicIndexExtractor),
        };
        Self {
            store,
            applier: DefaultWriteApplier::new(),
            prefetcher: Prefetcher::from_config(&config),
            config,
            services,
        }
    }
}

impl<S, A> TransactionProcessor<S, A>
where
    S: ResourceStore,
    A: WriteApplier<S::Session>,
{
    /// Replaces the write applier.
    pub fn with_applier<B: WriteApplier<S::Session>>(self, applier: B) -> TransactionProcessor<S, B> {
        TransactionProcessor {
            store: self.store,
            applier,
            config: self.config,
            services: self.services,
            prefetcher: self.prefetcher,
        }
    }

    /// Replaces the partition resolver.
    pub fn with_partition_resolver(mut self, resolver: Arc<dyn PartitionResolver>) -> Self {
        self.services.router = PartitionRouter::new(self.config.partitioning.clone(), resolver);
        self
    }

    /// Replaces the standing match-URL cache.
    pub fn with_match_url_cache(mut self, cache: Arc<dyn MatchUrlCache>) -> Self {
        self.services.matcher = ConditionalMatchResolver::new(
            self.services.matcher.parser().clone(),
            self.services.hasher.clone(),
            cache,
        );
        self
    }

    /// Replaces the token search parameter registry.
    pub fn with_search_params(mut self, registry: SearchParamRegistry) -> Self {
        self.services.matcher = ConditionalMatchResolver::new(
            MatchUrlParser::new(registry),
            self.services.hasher.clone(),
            self.services.matcher.standing_cache().clone(),
        );
        self
    }

    /// Replaces the index extractor.
    pub fn with_index_extractor(mut self, extractor: Arc<dyn IndexExtractor>) -> Self {
        self.services.extractor = extractor;
        self
    }

    /// The store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The configuration.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// The standing match-URL cache.
    pub fn match_url_cache(&self) -> &Arc<dyn MatchUrlCache> {
        self.services.matcher.standing_cache()
    }

    /// Applies `bundle` atomically.
    ///
    /// On success every write is committed and the response maps each
    /// placeholder and identity of the bundle to its final outcome. On failure
    /// nothing is visible and the error names the state that failed.
    pub async fn process_transaction(
        &self,
        bundle: &Bundle,
        request: &RequestContext,
    ) -> Result<TransactionResponse, TransactionError> {
        let mut run = TransactionRun::default();
        let mut session = self.store.begin().await.map_err(|e| rolled_back(&run, e))?;

        let entries = match self.run_phases(&mut session, &mut run, bundle, request).await {
            Ok(entries) => entries,
            Err(e) => {
                let failed = run.attempting;
                debug!(
                    request_id = %request.request_id,
                    phase = %failed,
                    error = %e,
                    "Transaction failed, rolling back"
                );
                if let Err(rollback) = session.rollback().await {
                    warn!(error = %rollback, "Rollback after failed transaction also failed");
                }
                run.stats.phase = TransactionPhase::Failed;
                return Err(rolled_back(&run, e));
            }
        };

        run.begin_next();
        if let Err(e) = session.commit().await {
            run.stats.phase = TransactionPhase::Failed;
            return Err(rolled_back(&run, e));
        }
        run.complete();
        self.publish(&run.caches, &entries);

        debug!(
            request_id = %request.request_id,
            entries = entries.len(),
            "Transaction committed"
        );
        Ok(build_response(bundle, entries, run.stats))
    }

    async fn run_phases(
        &self,
        session: &mut S::Session,
        run: &mut TransactionRun,
        bundle: &Bundle,
        request: &RequestContext,
    ) -> StorageResult<Vec<EntryOutcome>> {
        // START -> PARTITION-DETERMINED
        run.step();
        for entry in &bundle.entries {
            if let Some(placeholder) = entry.placeholder() {
                run.caches.placeholders_mut().declare(placeholder)?;
            }
        }
        let scope = self.services.router.determine(&bundle.entries, request);
        run.stats.partition = Some(scope);
        debug!(partition = %scope, entries = bundle.len(), "Determined transaction partition");
        run.complete();

        // -> IDENTITIES-RESOLVED
        run.step();
        if scope.is_determined() {
            let identities: Vec<ResourceIdentity> = bundle
                .entries
                .iter()
                .filter_map(|entry| entry.target_identity())
                .collect();
            if !identities.is_empty() {
                let report = self
                    .services
                    .identities
                    .resolve_all(session, &mut run.caches, &scope, &identities)
                    .await?;
                run.stats.identity_queries += report.queries;
                run.stats.identities_resolved = report.resolved.len();
            }
        }
        run.complete();

        // -> MATCHES-RESOLVED
        run.step();
        if scope.is_determined() && self.config.bulk_match_resolution {
            let report = self
                .services
                .matcher
                .resolve_bulk(session, &mut run.caches, &bundle.entries, &scope)
                .await?;
            run.stats.match_queries += report.queries;
            run.stats.match_urls_resolved = report.resolved + report.from_standing_cache;
        }
        run.complete();

        // -> PREFETCHED
        run.step();
        let outcome = self.prefetcher.prefetch(session, &mut run.caches, &scope).await;
        run.stats.prefetch_queries += outcome.queries();
        if let PrefetchOutcome::Loaded { set, .. } = &outcome {
            run.stats.prefetched = true;
            run.stats.joined_categories = set.joined.iter().map(|c| c.to_string()).collect();
        }
        run.complete();

        // -> ENTRIES-APPLIED
        run.step();
        let mut outcomes = Vec::with_capacity(bundle.len());
        {
            let mut ctx = ApplyContext {
                session: &mut *session,
                caches: &mut run.caches,
                request,
                scope,
                services: &self.services,
            };
            for (index, entry) in bundle.entries.iter().enumerate() {
                let outcome = self.applier.apply(index, entry, &mut ctx).await.inspect_err(|e| {
                    debug!(index, verb = %entry.verb, error = %e, "Entry application failed");
                })?;
                outcomes.push(outcome);
            }
        }
        run.stats.index_rows_reused = run.caches.session().reused();
        run.complete();

        // -> FLUSHED
        run.step();
        let started = Instant::now();
        let flushed = session.flush().await.map_err(|source| {
            StorageError::Transaction(TransactionError::FlushFailed {
                resource_types: resource_types(bundle),
                source,
            })
        })?;
        let millis = started.elapsed().as_millis() as u64;
        debug!(
            "Session flush took {}ms for {} inserts and {} updates",
            millis, flushed.inserts, flushed.updates
        );
        run.stats.flushed = flushed;
        run.stats.flush_millis = millis;
        run.complete();

        Ok(outcomes)
    }

    /// Publishes committed match-URL resolutions to the standing cache.
    fn publish(&self, caches: &TransactionCaches, entries: &[EntryOutcome]) {
        let standing = self.services.matcher.standing_cache();
        for pid in caches.deleted() {
            standing.invalidate_resource(pid);
        }
        // An update may have changed the indexed values a cached match relied on.
        let updated: BTreeSet<_> = entries
            .iter()
            .filter_map(|outcome| match outcome {
                EntryOutcome::Updated { pid, .. } => Some(*pid),
                _ => None,
            })
            .collect();
        for pid in &updated {
            standing.invalidate_resource(*pid);
        }
        for (key, pid) in caches.found_match_urls() {
            if !updated.contains(&pid) {
                standing.put(&key.scope, &key.resource_type, &key.match_url, Resolution::Found(pid));
            }
        }
    }
}

fn rolled_back(run: &TransactionRun, source: StorageError) -> TransactionError {
    TransactionError::RolledBack {
        phase: run.attempting.to_string(),
        source: Box::new(source),
    }
}

fn resource_types(bundle: &Bundle) -> Vec<String> {
    bundle
        .entries
        .iter()
        .filter_map(|entry| entry.resource_type())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn build_response(
    bundle: &Bundle,
    entries: Vec<EntryOutcome>,
    stats: TransactionStats,
) -> TransactionResponse {
    let mut response = TransactionResponse {
        stats,
        ..TransactionResponse::default()
    };
    for (index, (entry, outcome)) in bundle.entries.iter().zip(&entries).enumerate() {
        let mut keyed = false;
        if let Some(placeholder) = entry.placeholder() {
            response
                .outcomes
                .insert(TransactionKey::Placeholder(placeholder.to_string()), outcome.clone());
            keyed = true;
        }
        if let Some(identity) = outcome.identity() {
            response
                .outcomes
                .insert(TransactionKey::Resource(identity.clone()), outcome.clone());
            keyed = true;
        }
        if !keyed {
            response
                .outcomes
                .insert(TransactionKey::Entry(index), outcome.clone());
        }
    }
    response.entries = entries;
    response
}
