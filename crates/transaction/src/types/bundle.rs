//! Transaction bundle types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identity::{ResourceIdentity, is_placeholder};
use super::partition::PartitionId;

/// Write verb of a bundle entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleVerb {
    /// Create a new resource (optionally guarded by `if-none-exist`).
    Create,
    /// Update a resource by identity, or by a match URL that must match.
    Update,
    /// Delete a resource by identity or by match URL.
    Delete,
    /// Update the resource matched by a match URL, creating it when nothing matches.
    ConditionalUpsert,
}

impl BundleVerb {
    /// All verbs, in dispatch table order.
    pub const ALL: [BundleVerb; 4] = [
        BundleVerb::Create,
        BundleVerb::Update,
        BundleVerb::Delete,
        BundleVerb::ConditionalUpsert,
    ];

    /// Position of this verb in a dispatch table.
    pub const fn ordinal(&self) -> usize {
        match self {
            BundleVerb::Create => 0,
            BundleVerb::Update => 1,
            BundleVerb::Delete => 2,
            BundleVerb::ConditionalUpsert => 3,
        }
    }
}

impl fmt::Display for BundleVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleVerb::Create => write!(f, "CREATE"),
            BundleVerb::Update => write!(f, "UPDATE"),
            BundleVerb::Delete => write!(f, "DELETE"),
            BundleVerb::ConditionalUpsert => write!(f, "CONDITIONAL-UPSERT"),
        }
    }
}

/// One operation in a transaction bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    /// The write verb.
    pub verb: BundleVerb,
    /// The resource payload, opaque to the engine apart from `resourceType`,
    /// `id` and references.
    pub resource: Option<Value>,
    /// The declared target identity.
    pub identity: Option<ResourceIdentity>,
    /// The entry full-URL: a placeholder or a real identity.
    pub full_url: Option<String>,
    /// Conditional-match expression (`Type?param=value`).
    pub match_url: Option<String>,
    /// `if-none-exist` expression guarding a create.
    pub if_none_exist: Option<String>,
}

impl BundleEntry {
    fn with_verb(verb: BundleVerb) -> Self {
        Self {
            verb,
            resource: None,
            identity: None,
            full_url: None,
            match_url: None,
            if_none_exist: None,
        }
    }

    /// A create entry.
    pub fn create(resource: Value) -> Self {
        Self {
            resource: Some(resource),
            ..Self::with_verb(BundleVerb::Create)
        }
    }

    /// An update entry targeting the given identity.
    pub fn update(identity: ResourceIdentity, resource: Value) -> Self {
        Self {
            resource: Some(resource),
            identity: Some(identity),
            ..Self::with_verb(BundleVerb::Update)
        }
    }

    /// An update entry targeting whatever a match URL resolves to.
    pub fn update_by_match(match_url: impl Into<String>, resource: Value) -> Self {
        Self {
            resource: Some(resource),
            match_url: Some(match_url.into()),
            ..Self::with_verb(BundleVerb::Update)
        }
    }

    /// A conditional upsert entry.
    pub fn conditional_upsert(match_url: impl Into<String>, resource: Value) -> Self {
        Self {
            resource: Some(resource),
            match_url: Some(match_url.into()),
            ..Self::with_verb(BundleVerb::ConditionalUpsert)
        }
    }

    /// A delete-by-identity entry.
    pub fn delete(identity: ResourceIdentity) -> Self {
        Self {
            identity: Some(identity),
            ..Self::with_verb(BundleVerb::Delete)
        }
    }

    /// A delete-by-match entry.
    pub fn delete_by_match(match_url: impl Into<String>) -> Self {
        Self {
            match_url: Some(match_url.into()),
            ..Self::with_verb(BundleVerb::Delete)
        }
    }

    /// Sets the full-URL.
    pub fn with_full_url(mut self, full_url: impl Into<String>) -> Self {
        self.full_url = Some(full_url.into());
        self
    }

    /// Sets the `if-none-exist` expression.
    pub fn with_if_none_exist(mut self, expression: impl Into<String>) -> Self {
        self.if_none_exist = Some(expression.into());
        self
    }

    /// Returns the placeholder token if the full-URL is one.
    pub fn placeholder(&self) -> Option<&str> {
        self.full_url.as_deref().filter(|url| is_placeholder(url))
    }

    /// Returns the resource type this entry targets.
    pub fn resource_type(&self) -> Option<&str> {
        if let Some(resource_type) = self
            .resource
            .as_ref()
            .and_then(|r| r.get("resourceType"))
            .and_then(Value::as_str)
        {
            return Some(resource_type);
        }
        if let Some(identity) = &self.identity {
            return Some(identity.resource_type());
        }
        self.match_url
            .as_deref()
            .and_then(|url| url.split(['?', '/']).next())
            .filter(|t| !t.is_empty())
    }

    /// Returns the fully-qualified identity this entry targets directly.
    ///
    /// The declared identity wins, then a non-placeholder full-URL, then the
    /// payload's own `resourceType`/`id`. Placeholder entries never have one.
    pub fn target_identity(&self) -> Option<ResourceIdentity> {
        if self.placeholder().is_some() {
            return None;
        }
        self.identity
            .clone()
            .or_else(|| self.full_url.as_deref().and_then(ResourceIdentity::parse))
            .or_else(|| self.resource.as_ref().and_then(ResourceIdentity::from_resource))
    }

    /// Returns the conditional expression eligible for pre-resolution.
    ///
    /// That is the match URL of an update or conditional upsert, or the
    /// `if-none-exist` of a create; only expressions with a query part count.
    pub fn conditional_expression(&self) -> Option<&str> {
        let expression = match self.verb {
            BundleVerb::Update | BundleVerb::ConditionalUpsert => self.match_url.as_deref(),
            BundleVerb::Create => self.if_none_exist.as_deref(),
            BundleVerb::Delete => None,
        };
        expression.filter(|e| e.contains('?'))
    }
}

/// A batch of entries applied as one atomic unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    /// The entries, in client order.
    pub entries: Vec<BundleEntry>,
}

impl Bundle {
    /// Creates a bundle from entries.
    pub fn new(entries: Vec<BundleEntry>) -> Self {
        Self { entries }
    }

    /// Appends an entry.
    pub fn with_entry(mut self, entry: BundleEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bundle has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request-scoped information passed to the partition resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation id for logging.
    pub request_id: String,
    /// Partition selected by the caller (for example from a tenant header).
    pub partition: Option<PartitionId>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            partition: None,
        }
    }
}

impl RequestContext {
    /// A context with a fresh request id and no partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a partition.
    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }
}
