//! Resource identity types.
//!
//! A [`ResourceIdentity`] is the logical, version-less `Type/id` pair a client
//! uses. A [`PersistentId`] is the store-internal identifier the engine resolves
//! it to. [`Resolution`] pairs the two outcomes of a lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefixes marking a full-URL as a transaction-local placeholder.
pub const PLACEHOLDER_PREFIXES: &[&str] = &["urn:uuid:", "urn:oid:"];

/// Store-internal persistent identifier of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentId(i64);

impl PersistentId {
    /// Wraps a raw store identifier.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw store identifier.
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PersistentId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A logical, version-less resource identity (`Type/id`).
///
/// # Examples
///
/// ```
/// use helios_transaction::types::ResourceIdentity;
///
/// let identity = ResourceIdentity::parse("http://example.org/fhir/Patient/123/_history/4").unwrap();
/// assert_eq!(identity.resource_type(), "Patient");
/// assert_eq!(identity.id(), "123");
/// assert_eq!(identity.to_string(), "Patient/123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    resource_type: String,
    id: String,
}

impl ResourceIdentity {
    /// Creates an identity from a resource type and natural key.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Parses a relative or absolute reference, dropping any version suffix.
    ///
    /// Returns `None` for placeholders and for strings without a `Type/id` tail.
    pub fn parse(reference: &str) -> Option<Self> {
        if is_placeholder(reference) {
            return None;
        }

        let path = reference.split(['?', '#']).next().unwrap_or_default();
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if let Some(pos) = segments.iter().position(|s| *s == "_history") {
            segments.truncate(pos);
        }

        if segments.len() < 2 {
            return None;
        }

        let id = segments[segments.len() - 1];
        let resource_type = segments[segments.len() - 2];
        if !is_resource_type_name(resource_type) {
            return None;
        }

        Some(Self::new(resource_type, id))
    }

    /// Extracts the identity declared by a resource payload, if it has both
    /// `resourceType` and `id`.
    pub fn from_resource(resource: &serde_json::Value) -> Option<Self> {
        let resource_type = resource.get("resourceType")?.as_str()?;
        let id = resource.get("id")?.as_str()?;
        if id.is_empty() {
            return None;
        }
        Some(Self::new(resource_type, id))
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the natural key.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// Returns true if the given full-URL is a transaction-local placeholder.
pub fn is_placeholder(full_url: &str) -> bool {
    PLACEHOLDER_PREFIXES
        .iter()
        .any(|prefix| full_url.starts_with(prefix))
}

fn is_resource_type_name(segment: &str) -> bool {
    segment
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
        && segment.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Outcome of resolving an identity or a match URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// The identity resolved to exactly one persistent id.
    Found(PersistentId),
    /// Nothing in the store matches.
    NotFound,
}

impl Resolution {
    /// Returns the persistent id if found.
    pub fn persistent_id(&self) -> Option<PersistentId> {
        match self {
            Resolution::Found(pid) => Some(*pid),
            Resolution::NotFound => None,
        }
    }

    /// Returns true if the lookup found a resource.
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

impl From<Option<PersistentId>> for Resolution {
    fn from(value: Option<PersistentId>) -> Self {
        match value {
            Some(pid) => Resolution::Found(pid),
            None => Resolution::NotFound,
        }
    }
}

/// A logical identity paired with its resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    /// The version-less logical identity.
    pub identity: ResourceIdentity,
    /// Where it resolved to.
    pub resolution: Resolution,
}
