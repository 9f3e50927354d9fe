//! Stored resource rows and their secondary index rows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identity::{PersistentId, ResourceIdentity};
use super::partition::PartitionId;

/// Categories of secondary index the prefetcher can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexCategory {
    /// String search parameters.
    String,
    /// Token search parameters.
    Token,
    /// Date search parameters.
    Date,
    /// Quantity search parameters.
    Quantity,
    /// Outgoing resource references.
    ResourceLink,
}

impl IndexCategory {
    /// All categories, in prefetch order.
    pub const ALL: [IndexCategory; 5] = [
        IndexCategory::String,
        IndexCategory::Token,
        IndexCategory::Date,
        IndexCategory::Quantity,
        IndexCategory::ResourceLink,
    ];

    /// Stable storage name of this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexCategory::String => "string",
            IndexCategory::Token => "token",
            IndexCategory::Date => "date",
            IndexCategory::Quantity => "quantity",
            IndexCategory::ResourceLink => "resource-link",
        }
    }

    /// Parses a storage name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for IndexCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which index categories a stored resource has rows in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPopulation {
    /// Has string index rows.
    pub string: bool,
    /// Has token index rows.
    pub token: bool,
    /// Has date index rows.
    pub date: bool,
    /// Has quantity index rows.
    pub quantity: bool,
    /// Has outgoing reference links.
    pub links: bool,
}

impl IndexPopulation {
    /// Returns true if the category is populated.
    pub fn contains(&self, category: IndexCategory) -> bool {
        match category {
            IndexCategory::String => self.string,
            IndexCategory::Token => self.token,
            IndexCategory::Date => self.date,
            IndexCategory::Quantity => self.quantity,
            IndexCategory::ResourceLink => self.links,
        }
    }

    /// Marks a category as populated.
    pub fn insert(&mut self, category: IndexCategory) {
        match category {
            IndexCategory::String => self.string = true,
            IndexCategory::Token => self.token = true,
            IndexCategory::Date => self.date = true,
            IndexCategory::Quantity => self.quantity = true,
            IndexCategory::ResourceLink => self.links = true,
        }
    }

    /// Computes the population flags of a set of index rows.
    pub fn of<'a>(rows: impl IntoIterator<Item = &'a IndexRow>) -> Self {
        let mut population = Self::default();
        for row in rows {
            population.insert(row.category());
        }
        population
    }
}

/// The primary row of a stored resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRow {
    /// Persistent id.
    pub pid: PersistentId,
    /// Logical identity.
    pub identity: ResourceIdentity,
    /// Storage partition, `None` for the default partition.
    pub partition: Option<PartitionId>,
    /// Current version, starting at 1.
    pub version: u64,
    /// Whether the current version is a deletion.
    pub deleted: bool,
    /// Resource content.
    pub content: Value,
    /// Time of the last write.
    pub last_updated: DateTime<Utc>,
    /// Populated index categories.
    pub populated: IndexPopulation,
}

/// A value held by a secondary index row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IndexValue {
    /// A normalized string.
    String {
        /// The normalized text.
        value: String,
    },
    /// A coded token with its precomputed hashes.
    Token {
        /// Code system, if any.
        system: Option<String>,
        /// The code.
        value: String,
        /// Hash of the code alone.
        hash_value: i64,
        /// Hash of system and code.
        hash_system_and_value: i64,
    },
    /// A date or date-time literal.
    Date {
        /// The literal as written.
        value: String,
    },
    /// A numeric quantity.
    Quantity {
        /// Numeric value.
        value: f64,
        /// Unit code or display unit.
        unit: Option<String>,
    },
    /// A reference to another resource.
    Link {
        /// The referenced resource, e.g. `Patient/p1`.
        target: String,
    },
}

impl IndexValue {
    /// The category this value belongs to.
    pub fn category(&self) -> IndexCategory {
        match self {
            IndexValue::String { .. } => IndexCategory::String,
            IndexValue::Token { .. } => IndexCategory::Token,
            IndexValue::Date { .. } => IndexCategory::Date,
            IndexValue::Quantity { .. } => IndexCategory::Quantity,
            IndexValue::Link { .. } => IndexCategory::ResourceLink,
        }
    }
}

/// A secondary index row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    /// The owning resource.
    pub pid: PersistentId,
    /// The owning resource's partition.
    pub partition: Option<PartitionId>,
    /// The owning resource's type.
    pub resource_type: String,
    /// Search parameter name (or path for links).
    pub param_name: String,
    /// The indexed value.
    pub value: IndexValue,
}

impl IndexRow {
    /// The category of this row.
    pub fn category(&self) -> IndexCategory {
        self.value.category()
    }
}

/// A resource row together with the index rows a load joined.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedResource {
    /// The primary row.
    pub row: ResourceRow,
    /// Index rows of the joined category, empty without a join.
    pub indexes: Vec<IndexRow>,
}

/// A token index hit returned by a bulk hash lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIndexMatch {
    /// The resource the token belongs to.
    pub pid: PersistentId,
    /// The resource's partition.
    pub partition: Option<PartitionId>,
    /// Value-only hash.
    pub hash_value: i64,
    /// System-and-value hash.
    pub hash_system_and_value: i64,
}
