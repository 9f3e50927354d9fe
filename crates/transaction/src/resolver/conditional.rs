//! Conditional match resolution.
//!
//! Collects every eligible match URL of a bundle and answers them with one
//! disjunctive token hash query. Expressions the bulk path cannot translate are
//! left for [`ConditionalMatchResolver::resolve_single`] at entry application.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{MatchUrlCache, TransactionCaches};
use crate::config::PartitionSettings;
use crate::core::{PartitionPredicate, StoreSession, TokenHashPredicate};
use crate::error::{ResolutionError, StorageResult};
use crate::index::SearchHasher;
use crate::types::{BundleEntry, PersistentId, RequestPartitionId, Resolution, TokenIndexMatch};

use super::match_url::MatchUrlParser;

/// A pending match URL with the hash used to look it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchUrlToResolve {
    /// Target resource type.
    pub resource_type: String,
    /// The expression as written in the bundle.
    pub match_url: String,
    /// The partition-qualified hash predicate.
    pub predicate: TokenHashPredicate,
    /// Set once the bulk query answered the expression.
    pub resolved: bool,
}

/// Result of bulk match resolution.
#[derive(Debug, Clone, Default)]
pub struct MatchReport {
    /// Expressions answered by the bulk query.
    pub resolved: usize,
    /// Expressions answered by the standing cache.
    pub from_standing_cache: usize,
    /// Store queries issued (0 or 1).
    pub queries: usize,
}

/// The partition restriction a hash lookup needs under a scope.
pub fn partition_predicate(
    settings: &PartitionSettings,
    scope: &RequestPartitionId,
) -> PartitionPredicate {
    if !settings.needs_partition_predicate() {
        return PartitionPredicate::Any;
    }
    match scope {
        RequestPartitionId::Default => PartitionPredicate::DefaultOnly,
        RequestPartitionId::Partition(id) => PartitionPredicate::In(vec![*id]),
        RequestPartitionId::AllPartitions | RequestPartitionId::Undetermined => {
            PartitionPredicate::Any
        }
    }
}

/// Resolves conditional match URLs.
#[derive(Clone)]
pub struct ConditionalMatchResolver {
    parser: MatchUrlParser,
    hasher: SearchHasher,
    standing: Arc<dyn MatchUrlCache>,
}

impl std::fmt::Debug for ConditionalMatchResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalMatchResolver")
            .field("parser", &self.parser)
            .field("hasher", &self.hasher)
            .finish_non_exhaustive()
    }
}

impl ConditionalMatchResolver {
    /// Creates a resolver.
    pub fn new(parser: MatchUrlParser, hasher: SearchHasher, standing: Arc<dyn MatchUrlCache>) -> Self {
        Self {
            parser,
            hasher,
            standing,
        }
    }

    /// The match URL parser.
    pub fn parser(&self) -> &MatchUrlParser {
        &self.parser
    }

    /// The standing cache.
    pub fn standing_cache(&self) -> &Arc<dyn MatchUrlCache> {
        &self.standing
    }

    /// Collects the bundle's eligible, unanswered match URLs.
    ///
    /// Expressions found in the standing cache are copied into the transaction
    /// cache instead. Only entries carrying a payload take part.
    pub fn collect(
        &self,
        entries: &[BundleEntry],
        caches: &mut TransactionCaches,
        scope: &RequestPartitionId,
        report: &mut MatchReport,
    ) -> Vec<MatchUrlToResolve> {
        let partition = partition_predicate(self.hasher.settings(), scope);
        let mut pending: Vec<MatchUrlToResolve> = Vec::new();

        for entry in entries.iter().filter(|e| e.resource.is_some()) {
            let (Some(resource_type), Some(match_url)) =
                (entry.resource_type(), entry.conditional_expression())
            else {
                continue;
            };
            if caches.match_url(scope, resource_type, match_url).is_some()
                || pending
                    .iter()
                    .any(|p| p.resource_type == resource_type && p.match_url == match_url)
            {
                continue;
            }
            if let Some(resolution @ Resolution::Found(_)) =
                self.standing.get(scope, resource_type, match_url)
            {
                caches.record_match_url(scope, resource_type, match_url, resolution);
                report.from_standing_cache += 1;
                continue;
            }
            let Some(single) = self.parser.single_token(match_url) else {
                continue;
            };
            if single.resource_type != resource_type {
                continue;
            }
            let hash = single.token.hash(
                &self.hasher,
                scope.storage_partition(),
                &single.resource_type,
                &single.param_name,
            );
            pending.push(MatchUrlToResolve {
                resource_type: resource_type.to_string(),
                match_url: match_url.to_string(),
                predicate: TokenHashPredicate {
                    hash,
                    partition: partition.clone(),
                },
                resolved: false,
            });
        }
        pending
    }

    /// Resolves the bundle's eligible match URLs with at most one query.
    pub async fn resolve_bulk<S: StoreSession>(
        &self,
        session: &mut S,
        caches: &mut TransactionCaches,
        entries: &[BundleEntry],
        scope: &RequestPartitionId,
    ) -> StorageResult<MatchReport> {
        let mut report = MatchReport::default();
        let mut pending = self.collect(entries, caches, scope, &mut report);
        if pending.is_empty() {
            return Ok(report);
        }

        let predicates: Vec<TokenHashPredicate> = pending
            .iter()
            .map(|p| p.predicate.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let hits = session.find_token_matches(&predicates).await?;
        report.queries += 1;

        for to_resolve in &mut pending {
            let resolution = single_resolution(
                &to_resolve.resource_type,
                &to_resolve.match_url,
                hits.iter().filter(|hit| to_resolve.predicate.matches(hit)),
            )?;
            caches.record_match_url(
                scope,
                &to_resolve.resource_type,
                &to_resolve.match_url,
                resolution,
            );
            to_resolve.resolved = true;
            report.resolved += 1;
        }

        debug!(
            match_urls = report.resolved,
            from_standing_cache = report.from_standing_cache,
            hits = hits.len(),
            "Resolved match URLs in bulk"
        );
        Ok(report)
    }

    /// Resolves one match URL on the per-entry path.
    ///
    /// Consults the transaction cache, then the standing cache, then intersects
    /// one lookup per predicate. More than one surviving resource is a
    /// [`ResolutionError::MultipleMatches`] for `operation`.
    pub async fn resolve_single<S: StoreSession>(
        &self,
        session: &mut S,
        caches: &mut TransactionCaches,
        match_url: &str,
        scope: &RequestPartitionId,
        operation: &str,
    ) -> StorageResult<Resolution> {
        let (resource_type, tokens) = self.parser.token_predicates(match_url)?;
        if let Some(cached) = caches.match_url(scope, &resource_type, match_url) {
            return Ok(cached);
        }
        if let Some(resolution @ Resolution::Found(_)) =
            self.standing.get(scope, &resource_type, match_url)
        {
            caches.record_match_url(scope, &resource_type, match_url, resolution);
            return Ok(resolution);
        }

        let partition = partition_predicate(self.hasher.settings(), scope);
        let mut candidates: Option<BTreeSet<PersistentId>> = None;
        for (param_name, token) in &tokens {
            let predicate = TokenHashPredicate {
                hash: token.hash(&self.hasher, scope.storage_partition(), &resource_type, param_name),
                partition: partition.clone(),
            };
            let hits = session.find_token_matches(std::slice::from_ref(&predicate)).await?;
            let pids: BTreeSet<PersistentId> = hits.iter().map(|hit| hit.pid).collect();
            let narrowed = match candidates {
                None => pids,
                Some(existing) => existing.intersection(&pids).copied().collect(),
            };
            let exhausted = narrowed.is_empty();
            candidates = Some(narrowed);
            if exhausted {
                break;
            }
        }

        let candidates = candidates.unwrap_or_default();
        let resolution = match candidates.len() {
            0 => Resolution::NotFound,
            1 => candidates
                .first()
                .copied()
                .map(Resolution::Found)
                .unwrap_or(Resolution::NotFound),
            count => {
                return Err(ResolutionError::MultipleMatches {
                    operation: operation.to_string(),
                    match_url: match_url.to_string(),
                    count,
                }
                .into());
            }
        };
        caches.record_match_url(scope, resource_type, match_url, resolution);
        Ok(resolution)
    }
}

fn single_resolution<'a>(
    resource_type: &str,
    match_url: &str,
    hits: impl Iterator<Item = &'a TokenIndexMatch>,
) -> Result<Resolution, ResolutionError> {
    let pids: BTreeSet<PersistentId> = hits.map(|hit| hit.pid).collect();
    match pids.len() {
        0 => Ok(Resolution::NotFound),
        1 => Ok(pids.into_iter().next().into()),
        _ => Err(ResolutionError::AmbiguousMatch {
            resource_type: resource_type.to_string(),
            match_url: match_url.to_string(),
            ids: pids.into_iter().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryMatchUrlCache;
    use crate::core::TokenHash;
    use crate::types::PartitionId;
    use serde_json::json;

    fn resolver(settings: PartitionSettings) -> ConditionalMatchResolver {
        ConditionalMatchResolver::new(
            MatchUrlParser::default(),
            SearchHasher::new(settings),
            Arc::new(InMemoryMatchUrlCache::new()),
        )
    }

    fn conditional_create(expression: &str) -> BundleEntry {
        BundleEntry::create(json!({"resourceType": "Patient"})).with_if_none_exist(expression)
    }

    #[test]
    fn test_partition_predicate_rules() {
        let enabled = PartitionSettings::enabled();
        let a = PartitionId::new(3);
        assert_eq!(
            partition_predicate(&enabled, &RequestPartitionId::Default),
            PartitionPredicate::DefaultOnly
        );
        assert_eq!(
            partition_predicate(&enabled, &RequestPartitionId::Partition(a)),
            PartitionPredicate::In(vec![a])
        );
        assert_eq!(
            partition_predicate(&enabled, &RequestPartitionId::AllPartitions),
            PartitionPredicate::Any
        );
        assert_eq!(
            partition_predicate(
                &enabled.clone().with_partition_in_hashes(),
                &RequestPartitionId::Partition(a)
            ),
            PartitionPredicate::Any
        );
        assert_eq!(
            partition_predicate(&PartitionSettings::disabled(), &RequestPartitionId::Default),
            PartitionPredicate::Any
        );
    }

    #[test]
    fn test_collect_dedupes_and_skips_ineligible() {
        let resolver = resolver(PartitionSettings::disabled());
        let entries = vec![
            conditional_create("Patient?identifier=sys|1"),
            conditional_create("Patient?identifier=sys|1"),
            conditional_create("Patient?identifier=sys|2&name=x"),
            BundleEntry::delete_by_match("Patient?identifier=sys|3"),
        ];
        let mut caches = TransactionCaches::new();
        let mut report = MatchReport::default();
        let pending = resolver.collect(
            &entries,
            &mut caches,
            &RequestPartitionId::AllPartitions,
            &mut report,
        );
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].match_url, "Patient?identifier=sys|1");
        assert!(matches!(pending[0].predicate.hash, TokenHash::SystemAndValue(_)));
    }

    #[test]
    fn test_collect_uses_standing_cache() {
        let resolver = resolver(PartitionSettings::disabled());
        let all = RequestPartitionId::AllPartitions;
        resolver.standing_cache().put(
            &all,
            "Patient",
            "Patient?identifier=sys|1",
            Resolution::Found(PersistentId::new(8)),
        );
        let mut caches = TransactionCaches::new();
        let mut report = MatchReport::default();
        let pending = resolver.collect(
            &[conditional_create("Patient?identifier=sys|1")],
            &mut caches,
            &all,
            &mut report,
        );
        assert!(pending.is_empty());
        assert_eq!(report.from_standing_cache, 1);
        assert_eq!(
            caches.match_url(&all, "Patient", "Patient?identifier=sys|1"),
            Some(Resolution::Found(PersistentId::new(8)))
        );
    }

    #[test]
    fn test_collect_ignores_standing_entries_of_other_partitions() {
        let resolver = resolver(PartitionSettings::enabled());
        let a = RequestPartitionId::Partition(PartitionId::new(1));
        let b = RequestPartitionId::Partition(PartitionId::new(2));
        resolver.standing_cache().put(
            &a,
            "Patient",
            "Patient?identifier=sys|1",
            Resolution::Found(PersistentId::new(8)),
        );
        let mut caches = TransactionCaches::new();
        let mut report = MatchReport::default();
        let pending = resolver.collect(
            &[conditional_create("Patient?identifier=sys|1")],
            &mut caches,
            &b,
            &mut report,
        );
        assert_eq!(pending.len(), 1);
        assert_eq!(report.from_standing_cache, 0);
        assert_eq!(
            pending[0].predicate.partition,
            PartitionPredicate::In(vec![PartitionId::new(2)])
        );
        assert!(caches.match_url(&b, "Patient", "Patient?identifier=sys|1").is_none());
    }

    #[test]
    fn test_single_resolution_requires_one_pid() {
        let hit = |pid: i64| TokenIndexMatch {
            pid: PersistentId::new(pid),
            partition: None,
            hash_value: 1,
            hash_system_and_value: 2,
        };
        let same = [hit(1), hit(1)];
        assert_eq!(
            single_resolution("Patient", "Patient?identifier=a", same.iter()).unwrap(),
            Resolution::Found(PersistentId::new(1))
        );
        let conflicting = [hit(1), hit(2)];
        assert!(matches!(
            single_resolution("Patient", "Patient?identifier=a", conflicting.iter()),
            Err(ResolutionError::AmbiguousMatch { .. })
        ));
        assert_eq!(
            single_resolution("Patient", "Patient?identifier=a", std::iter::empty()).unwrap(),
            Resolution::NotFound
        );
    }
}
