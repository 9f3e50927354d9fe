//! Id paging types for batch jobs.
//!
//! Batch jobs (reindexing, bulk expunge) walk the full identifier space of the
//! store one bounded [`IdPage`] at a time. Each page carries a
//! [`ResumeMarker`] that the next request passes back.
//!
//! # Marker Encoding
//!
//! Markers travel between job steps as opaque strings: url-safe base64 of a
//! small JSON document.
//!
//! ```
//! use helios_transaction::types::{PersistentId, ResumeMarker};
//!
//! let marker = ResumeMarker::after(PersistentId::new(42), None);
//! let encoded = marker.encode();
//! let decoded = ResumeMarker::decode(&encoded).unwrap();
//! assert_eq!(decoded.last_pid(), PersistentId::new(42));
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

use super::identity::PersistentId;
use super::partition::{PartitionId, RequestPartitionId};

const MARKER_VERSION: u8 = 1;

/// A persistent id together with the type and partition it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypedPersistentId {
    /// Resource type.
    pub resource_type: String,
    /// Persistent id.
    pub pid: PersistentId,
    /// Storage partition, `None` for the default partition.
    pub partition: Option<PartitionId>,
}

/// Position after which the next page starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    version: u8,
    last_pid: PersistentId,
    partition: Option<PartitionId>,
}

impl ResumeMarker {
    /// A marker positioned after the given id.
    pub fn after(last_pid: PersistentId, partition: Option<PartitionId>) -> Self {
        Self {
            version: MARKER_VERSION,
            last_pid,
            partition,
        }
    }

    /// The last id of the previous page.
    pub fn last_pid(&self) -> PersistentId {
        self.last_pid
    }

    /// The partition of the last id of the previous page.
    pub fn partition(&self) -> Option<PartitionId> {
        self.partition
    }

    /// Encodes the marker as an opaque string.
    pub fn encode(&self) -> String {
        // Serializing a struct of plain integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a marker produced by [`encode`](Self::encode).
    pub fn decode(encoded: &str) -> Result<Self, JobError> {
        let invalid = || JobError::InvalidMarker {
            marker: encoded.to_string(),
        };
        let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| invalid())?;
        let marker: ResumeMarker = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
        if marker.version != MARKER_VERSION {
            return Err(invalid());
        }
        Ok(marker)
    }
}

/// One bounded, ordered page of ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPage {
    /// Ids in ascending persistent id order.
    pub ids: Vec<TypedPersistentId>,
    /// Where the next page starts; `None` once the id space is exhausted.
    pub marker: Option<ResumeMarker>,
}

impl IdPage {
    /// The terminal page.
    pub fn exhausted() -> Self {
        Self::default()
    }

    /// Builds a page, deriving the marker from the last id.
    pub fn from_ids(ids: Vec<TypedPersistentId>) -> Self {
        let marker = ids
            .last()
            .map(|last| ResumeMarker::after(last.pid, last.partition));
        Self { ids, marker }
    }

    /// Returns true for the terminal page.
    pub fn is_exhausted(&self) -> bool {
        self.ids.is_empty() && self.marker.is_none()
    }

    /// Number of ids on this page.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the page carries no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Job-scoped selection of the ids to page through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSelection {
    /// Restrict to these resource types; `None` selects every type.
    pub resource_types: Option<Vec<String>>,
    /// Inclusive lower bound on the last update time.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the last update time.
    pub end: Option<DateTime<Utc>>,
    /// Partition scope.
    pub partition: RequestPartitionId,
}

impl Default for ChunkSelection {
    fn default() -> Self {
        Self {
            resource_types: None,
            start: None,
            end: None,
            partition: RequestPartitionId::AllPartitions,
        }
    }
}

impl ChunkSelection {
    /// Selects every resource in every partition.
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects the given resource types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_types: Some(types.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Restricts to resources last updated within `[start, end)`.
    pub fn with_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Restricts to a partition scope.
    pub fn with_partition(mut self, partition: RequestPartitionId) -> Self {
        self.partition = partition;
        self
    }

    /// Pins the upper bound to the job start when the caller gave none.
    pub fn snapshot_at(mut self, job_started: DateTime<Utc>) -> Self {
        if self.end.is_none() {
            self.end = Some(job_started);
        }
        self
    }

    /// Returns true if a resource of this type is selected.
    pub fn selects_type(&self, resource_type: &str) -> bool {
        self.resource_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == resource_type))
    }

    /// Returns true if a resource updated at `when` is selected.
    pub fn selects_time(&self, when: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| when >= start) && self.end.is_none_or(|end| when < end)
    }
}
