//! Default write semantics for the four bundle verbs.
//!
//! | Verb | Target | Found | Not found |
//! |------|--------|-------|-----------|
//! | CREATE | `if-none-exist` | no-op, placeholder maps to the match | create |
//! | CREATE | identity | error | create with that id |
//! | UPDATE | identity | new version | create with that id |
//! | UPDATE | match URL | new version | error |
//! | DELETE | identity or match URL | delete | no-op |
//! | CONDITIONAL-UPSERT | match URL | new version | create |

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::core::{IndexChanges, PendingWrite, StoreSession};
use crate::error::{ResolutionError, StorageResult, ValidationError};
use crate::types::{
    BundleEntry, BundleVerb, EntryOutcome, IndexPopulation, IndexRow, PersistentId,
    RequestPartitionId, Resolution, ResourceIdentity, ResourceRow,
};

use super::references::rewrite_references;
use super::{ApplyContext, WriteApplier};

type ApplyFuture<'a> = Pin<Box<dyn Future<Output = StorageResult<EntryOutcome>> + Send + 'a>>;

type VerbHandler<S> = for<'a, 'b> fn(
    &'a DefaultWriteApplier,
    usize,
    &'a BundleEntry,
    &'a mut ApplyContext<'b, S>,
) -> ApplyFuture<'a>;

/// Handlers indexed by [`BundleVerb::ordinal`].
fn verb_table<S: StoreSession>() -> [VerbHandler<S>; 4] {
    [
        create_entry::<S>,
        update_entry::<S>,
        delete_entry::<S>,
        upsert_entry::<S>,
    ]
}

fn create_entry<'a, 'b, S: StoreSession>(
    applier: &'a DefaultWriteApplier,
    index: usize,
    entry: &'a BundleEntry,
    ctx: &'a mut ApplyContext<'b, S>,
) -> ApplyFuture<'a> {
    Box::pin(applier.create(index, entry, ctx))
}

fn update_entry<'a, 'b, S: StoreSession>(
    applier: &'a DefaultWriteApplier,
    index: usize,
    entry: &'a BundleEntry,
    ctx: &'a mut ApplyContext<'b, S>,
) -> ApplyFuture<'a> {
    Box::pin(applier.update(index, entry, ctx))
}

fn delete_entry<'a, 'b, S: StoreSession>(
    applier: &'a DefaultWriteApplier,
    index: usize,
    entry: &'a BundleEntry,
    ctx: &'a mut ApplyContext<'b, S>,
) -> ApplyFuture<'a> {
    Box::pin(applier.delete(index, entry, ctx))
}

fn upsert_entry<'a, 'b, S: StoreSession>(
    applier: &'a DefaultWriteApplier,
    index: usize,
    entry: &'a BundleEntry,
    ctx: &'a mut ApplyContext<'b, S>,
) -> ApplyFuture<'a> {
    Box::pin(applier.conditional_upsert(index, entry, ctx))
}

/// Applies entries with standard create/update/delete/upsert semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWriteApplier;

impl DefaultWriteApplier {
    /// Creates the applier.
    pub fn new() -> Self {
        Self
    }

    async fn create<S: StoreSession>(
        &self,
        index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome> {
        let (resource_type, payload) = payload_of(index, entry)?;

        if let Some(expression) = entry.conditional_expression() {
            let scope = ctx.lookup_scope(entry);
            let resolution = self
                .resolve_match(ctx, resource_type, expression, &scope, entry.verb)
                .await?;
            if let Resolution::Found(pid) = resolution {
                let row = self.load_current(ctx, pid).await?;
                debug!(index, match_url = expression, pid = %pid, "Conditional create matched, skipping");
                if let Some(placeholder) = entry.placeholder() {
                    ctx.caches
                        .placeholders_mut()
                        .resolve(placeholder, row.identity.clone(), pid);
                }
                return Ok(EntryOutcome::NoOp {
                    identity: Some(row.identity),
                    pid: Some(pid),
                });
            }
        }

        let identity = match entry.target_identity() {
            Some(identity) => {
                let resolution = self.resolve_identity(ctx, entry, &identity).await?;
                if resolution.is_found() {
                    return Err(ValidationError::AlreadyExists {
                        resource_type: identity.resource_type().to_string(),
                        id: identity.id().to_string(),
                    }
                    .into());
                }
                identity
            }
            None => ResourceIdentity::new(resource_type, uuid::Uuid::new_v4().to_string()),
        };

        let outcome = self.insert(ctx, entry, identity, payload.clone()).await?;
        if let (Some(expression), Some(pid)) = (entry.conditional_expression(), outcome.persistent_id()) {
            let scope = ctx.lookup_scope(entry);
            ctx.caches
                .record_match_url(&scope, resource_type, expression, Resolution::Found(pid));
        }
        Ok(outcome)
    }

    async fn update<S: StoreSession>(
        &self,
        index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome> {
        let (resource_type, payload) = payload_of(index, entry)?;

        if entry.identity.is_none()
            && let Some(expression) = entry.conditional_expression()
        {
            let scope = ctx.lookup_scope(entry);
            return match self
                .resolve_match(ctx, resource_type, expression, &scope, entry.verb)
                .await?
            {
                Resolution::Found(pid) => {
                    let current = self.load_current(ctx, pid).await?;
                    self.new_version(ctx, entry, current, payload.clone()).await
                }
                Resolution::NotFound => Err(ResolutionError::NoMatch {
                    resource_type: resource_type.to_string(),
                    match_url: expression.to_string(),
                }
                .into()),
            };
        }

        let identity = entry
            .target_identity()
            .ok_or_else(|| missing_identity(index, entry.verb))?;
        match self.resolve_identity(ctx, entry, &identity).await? {
            Resolution::Found(pid) => {
                let current = self.load_current(ctx, pid).await?;
                self.new_version(ctx, entry, current, payload.clone()).await
            }
            Resolution::NotFound => self.insert(ctx, entry, identity, payload.clone()).await,
        }
    }

    async fn delete<S: StoreSession>(
        &self,
        index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome> {
        let (target, resolution) = match (&entry.identity, entry.match_url.as_deref()) {
            (Some(identity), _) => {
                let resolution = self.resolve_identity(ctx, entry, identity).await?;
                (Some(identity.clone()), resolution)
            }
            (None, Some(match_url)) if match_url.contains('?') => {
                let scope = ctx.lookup_scope(entry);
                let resolution = ctx
                    .services
                    .matcher
                    .resolve_single(
                        &mut *ctx.session,
                        &mut *ctx.caches,
                        match_url,
                        &scope,
                        &entry.verb.to_string(),
                    )
                    .await?;
                (None, self.within_scope(ctx, resolution, &scope).await?)
            }
            (None, Some(reference)) => {
                let identity = ResourceIdentity::parse(reference)
                    .ok_or_else(|| missing_identity(index, entry.verb))?;
                let resolution = self.resolve_identity(ctx, entry, &identity).await?;
                (Some(identity), resolution)
            }
            (None, None) => return Err(missing_identity(index, entry.verb).into()),
        };

        let Resolution::Found(pid) = resolution else {
            return Ok(EntryOutcome::NoOp {
                identity: target,
                pid: None,
            });
        };
        let current = self.load_current(ctx, pid).await?;
        if current.deleted {
            return Ok(EntryOutcome::NoOp {
                identity: Some(current.identity),
                pid: Some(pid),
            });
        }

        let changes = index_changes(ctx, &current, &[]);
        let row = ResourceRow {
            version: current.version + 1,
            deleted: true,
            last_updated: Utc::now(),
            populated: IndexPopulation::default(),
            ..current
        };
        let outcome = EntryOutcome::Deleted {
            identity: row.identity.clone(),
            pid,
            version: row.version,
        };
        ctx.caches.session_mut().refresh(row.clone(), &[]);
        ctx.session.stage(PendingWrite::Delete { row, changes })?;
        ctx.caches.record_deleted(pid);
        Ok(outcome)
    }

    async fn conditional_upsert<S: StoreSession>(
        &self,
        index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome> {
        let (resource_type, payload) = payload_of(index, entry)?;
        let expression = entry
            .conditional_expression()
            .ok_or_else(|| missing_identity(index, entry.verb))?;

        let scope = ctx.lookup_scope(entry);
        match self
            .resolve_match(ctx, resource_type, expression, &scope, entry.verb)
            .await?
        {
            Resolution::Found(pid) => {
                let current = self.load_current(ctx, pid).await?;
                self.new_version(ctx, entry, current, payload.clone()).await
            }
            Resolution::NotFound => {
                let identity = ResourceIdentity::from_resource(payload).unwrap_or_else(|| {
                    ResourceIdentity::new(resource_type, uuid::Uuid::new_v4().to_string())
                });
                let outcome = self.insert(ctx, entry, identity, payload.clone()).await?;
                if let Some(pid) = outcome.persistent_id() {
                    ctx.caches
                        .record_match_url(&scope, resource_type, expression, Resolution::Found(pid));
                }
                Ok(outcome)
            }
        }
    }

    async fn resolve_identity<S: StoreSession>(
        &self,
        ctx: &mut ApplyContext<'_, S>,
        entry: &BundleEntry,
        identity: &ResourceIdentity,
    ) -> StorageResult<Resolution> {
        let scope = ctx.lookup_scope(entry);
        let resolution = ctx
            .services
            .identities
            .resolve_one(&mut *ctx.session, &mut *ctx.caches, &scope, identity)
            .await?;
        self.within_scope(ctx, resolution, &scope).await
    }

    async fn resolve_match<S: StoreSession>(
        &self,
        ctx: &mut ApplyContext<'_, S>,
        resource_type: &str,
        expression: &str,
        scope: &RequestPartitionId,
        verb: BundleVerb,
    ) -> StorageResult<Resolution> {
        let resolution = match ctx.caches.match_url(scope, resource_type, expression) {
            Some(cached) => cached,
            None => {
                ctx.services
                    .matcher
                    .resolve_single(
                        &mut *ctx.session,
                        &mut *ctx.caches,
                        expression,
                        scope,
                        &verb.to_string(),
                    )
                    .await?
            }
        };
        self.within_scope(ctx, resolution, scope).await
    }

    /// Downgrades a resolution to `NotFound` when the resource lies outside `scope`.
    ///
    /// Transaction caches are shared by every entry, so a hit recorded for one
    /// entry's partition must not serve an entry of another.
    async fn within_scope<S: StoreSession>(
        &self,
        ctx: &mut ApplyContext<'_, S>,
        resolution: Resolution,
        scope: &RequestPartitionId,
    ) -> StorageResult<Resolution> {
        let Resolution::Found(pid) = resolution else {
            return Ok(resolution);
        };
        if scope.is_all_partitions() {
            return Ok(resolution);
        }
        let current = self.load_current(ctx, pid).await?;
        if scope.admits(current.partition) {
            return Ok(resolution);
        }
        debug!(pid = %pid, scope = %scope, "Resolved resource is outside the entry's partition");
        Ok(Resolution::NotFound)
    }

    async fn load_current<S: StoreSession>(
        &self,
        ctx: &mut ApplyContext<'_, S>,
        pid: PersistentId,
    ) -> StorageResult<ResourceRow> {
        if let Some(row) = ctx.caches.session().row(pid) {
            return Ok(row.clone());
        }
        let loaded = ctx.session.load_resources(&[pid], None).await?;
        ctx.caches.session_mut().attach_rows(loaded);
        ctx.caches.session().row(pid).cloned().ok_or_else(|| {
            ValidationError::NotFound {
                resource_type: "Resource".to_string(),
                id: pid.to_string(),
            }
            .into()
        })
    }

    async fn insert<S: StoreSession>(
        &self,
        ctx: &mut ApplyContext<'_, S>,
        entry: &BundleEntry,
        identity: ResourceIdentity,
        payload: Value,
    ) -> StorageResult<EntryOutcome> {
        let content = prepare_content(payload, &identity, 1, ctx)?;
        let pid = ctx.session.allocate_pid().await?;
        let partition = ctx.services.router.storage_partition(
            identity.resource_type(),
            &content,
            ctx.request,
        );
        let indexes = index_rows(ctx, pid, partition, &identity, &content);
        let row = ResourceRow {
            pid,
            identity: identity.clone(),
            partition,
            version: 1,
            deleted: false,
            content,
            last_updated: Utc::now(),
            populated: IndexPopulation::of(&indexes),
        };

        ctx.caches.session_mut().refresh(row.clone(), &indexes);
        ctx.session.stage(PendingWrite::Insert { row, indexes })?;
        ctx.caches
            .record_identity(identity.clone(), Resolution::Found(pid));
        if let Some(placeholder) = entry.placeholder() {
            ctx.caches
                .placeholders_mut()
                .resolve(placeholder, identity.clone(), pid);
        }
        Ok(EntryOutcome::Created {
            identity,
            pid,
            version: 1,
        })
    }

    async fn new_version<S: StoreSession>(
        &self,
        ctx: &mut ApplyContext<'_, S>,
        entry: &BundleEntry,
        current: ResourceRow,
        payload: Value,
    ) -> StorageResult<EntryOutcome> {
        let version = current.version + 1;
        let content = prepare_content(payload, &current.identity, version, ctx)?;
        let indexes = index_rows(ctx, current.pid, current.partition, &current.identity, &content);
        let changes = index_changes(ctx, &current, &indexes);
        let row = ResourceRow {
            version,
            deleted: false,
            content,
            last_updated: Utc::now(),
            populated: IndexPopulation::of(&indexes),
            ..current
        };
        let outcome = EntryOutcome::Updated {
            identity: row.identity.clone(),
            pid: row.pid,
            version,
        };

        if let Some(placeholder) = entry.placeholder() {
            ctx.caches
                .placeholders_mut()
                .resolve(placeholder, row.identity.clone(), row.pid);
        }
        ctx.caches.session_mut().refresh(row.clone(), &indexes);
        ctx.session.stage(PendingWrite::Update {
            row,
            indexes,
            changes,
        })?;
        Ok(outcome)
    }
}

#[async_trait]
impl<S: StoreSession> WriteApplier<S> for DefaultWriteApplier {
    async fn apply(
        &self,
        index: usize,
        entry: &BundleEntry,
        ctx: &mut ApplyContext<'_, S>,
    ) -> StorageResult<EntryOutcome> {
        let handler = verb_table::<S>()[entry.verb.ordinal()];
        handler(self, index, entry, ctx).await
    }
}

fn payload_of(index: usize, entry: &BundleEntry) -> Result<(&str, &Value), ValidationError> {
    let missing = || ValidationError::MissingResource {
        index,
        verb: entry.verb.to_string(),
    };
    let payload = entry.resource.as_ref().ok_or_else(missing)?;
    let resource_type = entry.resource_type().ok_or_else(missing)?;
    Ok((resource_type, payload))
}

fn missing_identity(index: usize, verb: BundleVerb) -> ValidationError {
    ValidationError::MissingIdentity {
        index,
        verb: verb.to_string(),
    }
}

/// Rewrites placeholder references and stamps identity and version metadata.
fn prepare_content<S: StoreSession>(
    mut payload: Value,
    identity: &ResourceIdentity,
    version: u64,
    ctx: &ApplyContext<'_, S>,
) -> StorageResult<Value> {
    rewrite_references(&mut payload, ctx.caches.placeholders())?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(
            "resourceType".to_string(),
            Value::String(identity.resource_type().to_string()),
        );
        obj.insert("id".to_string(), Value::String(identity.id().to_string()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), Value::String(version.to_string()));
            meta.insert(
                "lastUpdated".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
    }
    Ok(payload)
}

fn index_rows<S: StoreSession>(
    ctx: &ApplyContext<'_, S>,
    pid: PersistentId,
    partition: Option<crate::types::PartitionId>,
    identity: &ResourceIdentity,
    content: &Value,
) -> Vec<IndexRow> {
    ctx.services
        .extractor
        .extract(identity.resource_type(), content)
        .into_iter()
        .map(|extracted| {
            extracted.into_row(pid, partition, identity.resource_type(), &ctx.services.hasher)
        })
        .collect()
}

/// Diffs new index rows against the stored rows the transaction already holds.
fn index_changes<S: StoreSession>(
    ctx: &mut ApplyContext<'_, S>,
    current: &ResourceRow,
    indexes: &[IndexRow],
) -> IndexChanges {
    let cache = ctx.caches.session();
    let changes = IndexChanges::between(indexes, |category| cache.prior_indexes(current, category));
    ctx.caches.session_mut().record_reused(changes.unchanged);
    changes
}
