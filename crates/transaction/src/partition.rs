//! Partition routing.
//!
//! A [`PartitionResolver`] (supplied by the deployment) names the partition of
//! one payload. The [`PartitionRouter`] combines the answers for every entry of
//! a bundle into the single scope the bulk phases run under.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::PartitionSettings;
use crate::types::{BundleEntry, PartitionId, RequestContext, RequestPartitionId};

/// Decides which partition a resource belongs to.
pub trait PartitionResolver: Send + Sync {
    /// The partition of `payload`, a resource of `resource_type`.
    fn partition_for(
        &self,
        resource_type: &str,
        payload: &Value,
        request: &RequestContext,
    ) -> RequestPartitionId;

    /// The partition reads of `resource_type` are scoped to when no payload is
    /// at hand, e.g. for a delete.
    fn read_partition_for(&self, resource_type: &str, request: &RequestContext) -> RequestPartitionId {
        self.partition_for(resource_type, &Value::Null, request)
    }
}

/// Places every resource in the partition named by the request, or in the
/// default partition when the request names none.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestPartitionResolver;

impl PartitionResolver for RequestPartitionResolver {
    fn partition_for(
        &self,
        _resource_type: &str,
        _payload: &Value,
        request: &RequestContext,
    ) -> RequestPartitionId {
        match request.partition {
            Some(partition) => RequestPartitionId::Partition(partition),
            None => RequestPartitionId::Default,
        }
    }
}

/// Places resources by type, e.g. shared terminology in one partition.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypePartitionResolver {
    by_type: HashMap<String, PartitionId>,
    fallback: RequestPartitionResolver,
}

impl ResourceTypePartitionResolver {
    /// Creates a resolver that falls back to the request's partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins a resource type to a partition.
    pub fn with_type(mut self, resource_type: impl Into<String>, partition: PartitionId) -> Self {
        self.by_type.insert(resource_type.into(), partition);
        self
    }
}

impl PartitionResolver for ResourceTypePartitionResolver {
    fn partition_for(
        &self,
        resource_type: &str,
        payload: &Value,
        request: &RequestContext,
    ) -> RequestPartitionId {
        match self.by_type.get(resource_type) {
            Some(partition) => RequestPartitionId::Partition(*partition),
            None => self.fallback.partition_for(resource_type, payload, request),
        }
    }
}

/// Computes the partition scope of a transaction.
#[derive(Clone)]
pub struct PartitionRouter {
    settings: PartitionSettings,
    resolver: Arc<dyn PartitionResolver>,
}

impl std::fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PartitionRouter {
    /// Creates a router.
    pub fn new(settings: PartitionSettings, resolver: Arc<dyn PartitionResolver>) -> Self {
        Self { settings, resolver }
    }

    /// A router for a deployment without partitioning.
    pub fn unpartitioned() -> Self {
        Self::new(PartitionSettings::disabled(), Arc::new(RequestPartitionResolver))
    }

    /// Partition settings.
    pub fn settings(&self) -> &PartitionSettings {
        &self.settings
    }

    /// The scope every entry of `entries` agrees on.
    ///
    /// Returns [`RequestPartitionId::AllPartitions`] without partitioning, and
    /// [`RequestPartitionId::Undetermined`] when entries disagree, when an entry
    /// has no payload, or when the bundle is empty.
    pub fn determine(&self, entries: &[BundleEntry], request: &RequestContext) -> RequestPartitionId {
        if !self.settings.enabled {
            return RequestPartitionId::AllPartitions;
        }

        let mut agreed: Option<RequestPartitionId> = None;
        for (index, entry) in entries.iter().enumerate() {
            let partition = self.partition_of(entry, request);
            if !partition.is_determined() {
                debug!(index, "Entry has no resolvable partition, skipping bulk phases");
                return RequestPartitionId::Undetermined;
            }
            match agreed {
                None => agreed = Some(partition),
                Some(existing) if existing == partition => {}
                Some(existing) => {
                    debug!(
                        first = %existing,
                        other = %partition,
                        "Bundle spans more than one partition, skipping bulk phases"
                    );
                    return RequestPartitionId::Undetermined;
                }
            }
        }
        agreed.unwrap_or(RequestPartitionId::Undetermined)
    }

    /// The partition of a single entry's payload.
    pub fn partition_of(&self, entry: &BundleEntry, request: &RequestContext) -> RequestPartitionId {
        if !self.settings.enabled {
            return RequestPartitionId::AllPartitions;
        }
        match (entry.resource_type(), entry.resource.as_ref()) {
            (Some(resource_type), Some(payload)) => {
                self.resolver.partition_for(resource_type, payload, request)
            }
            _ => RequestPartitionId::Undetermined,
        }
    }

    /// The scope reads made on behalf of one entry run under.
    ///
    /// Entries without a payload are scoped by their target type and the
    /// request. Never answers `AllPartitions` while partitioning is enabled.
    pub fn read_partition_of(&self, entry: &BundleEntry, request: &RequestContext) -> RequestPartitionId {
        if !self.settings.enabled {
            return RequestPartitionId::AllPartitions;
        }
        let scope = match (entry.resource_type(), entry.resource.as_ref()) {
            (Some(resource_type), Some(payload)) => {
                self.resolver.partition_for(resource_type, payload, request)
            }
            (Some(resource_type), None) => self.resolver.read_partition_for(resource_type, request),
            (None, _) => RequestPartitionId::Undetermined,
        };
        match scope {
            RequestPartitionId::AllPartitions | RequestPartitionId::Undetermined => {
                match request.partition {
                    Some(partition) => RequestPartitionId::Partition(partition),
                    None => RequestPartitionId::Default,
                }
            }
            scope => scope,
        }
    }

    /// The partition a new row of `resource_type` is stored in.
    ///
    /// `None` is the default partition, and the only answer without partitioning.
    pub fn storage_partition(
        &self,
        resource_type: &str,
        payload: &Value,
        request: &RequestContext,
    ) -> Option<PartitionId> {
        if !self.settings.enabled {
            return None;
        }
        self.resolver
            .partition_for(resource_type, payload, request)
            .storage_partition()
    }
}
