//! Error types for the transaction engine.
//!
//! Errors are split by the layer that raises them: resolution errors from the
//! identity and match-URL phases, transaction errors from the bundle processor,
//! backend errors from the store, validation errors from entry application and
//! job errors from the chunked id producer.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

use crate::types::PersistentId;

/// The primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Identity or match-URL resolution errors
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Transaction errors
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Batch job errors
    #[error(transparent)]
    Job(#[from] JobError),
}

impl StorageError {
    /// Returns true if this error was raised by the store's constraint checks.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StorageError::Backend(BackendError::ConstraintViolation { .. }) => true,
            StorageError::Transaction(TransactionError::FlushFailed { source, .. }) => {
                matches!(source, BackendError::ConstraintViolation { .. })
            }
            StorageError::Transaction(TransactionError::RolledBack { source, .. }) => {
                source.is_constraint_violation()
            }
            _ => false,
        }
    }
}

/// Errors raised while resolving identities and conditional matches.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// A single-predicate hash resolved to more than one resource.
    #[error("match URL {match_url} resolved to multiple resources: {ids:?}")]
    AmbiguousMatch {
        resource_type: String,
        match_url: String,
        ids: Vec<PersistentId>,
    },

    /// A natural key resolved to more than one persistent id.
    #[error("resource {resource_type}/{id} resolved to multiple persistent ids: {ids:?}")]
    AmbiguousIdentity {
        resource_type: String,
        id: String,
        ids: Vec<PersistentId>,
    },

    /// A conditional operation required a match and found none.
    #[error("no {resource_type} matches conditional URL {match_url}")]
    NoMatch {
        resource_type: String,
        match_url: String,
    },

    /// A conditional operation matched more than one resource.
    #[error("conditional {operation} on {match_url} matched {count} resources, expected at most 1")]
    MultipleMatches {
        operation: String,
        match_url: String,
        count: usize,
    },
}

/// Errors related to transaction processing.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The transaction failed and every write was rolled back.
    #[error("transaction rolled back during {phase}: {source}")]
    RolledBack {
        phase: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Flushing buffered writes failed.
    #[error("Error flushing transaction with resource types: {resource_types:?}: {source}")]
    FlushFailed {
        resource_types: Vec<String>,
        #[source]
        source: BackendError,
    },

    /// Transaction is no longer valid (already committed or rolled back).
    #[error("transaction no longer valid")]
    InvalidTransaction,

    /// Rollback itself failed after an earlier error.
    #[error("rollback failed: {message}")]
    RollbackFailed { message: String },
}

impl TransactionError {
    /// Returns the phase name for a rolled back transaction.
    pub fn phase(&self) -> Option<&str> {
        match self {
            TransactionError::RolledBack { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

/// Errors originating from the backing store.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// A uniqueness or integrity constraint was violated.
    #[error("constraint violation in {backend_name}: {message}")]
    ConstraintViolation {
        backend_name: String,
        resource_types: Vec<String>,
        message: String,
    },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution error.
    #[error("query execution failed: {message}")]
    QueryError { message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Schema initialisation error.
    #[error("schema initialization failed: {message}")]
    SchemaError { message: String },
}

/// Errors related to bundle entry content.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// An entry carries no resource where one is required.
    #[error("entry {index} ({verb}) requires a resource")]
    MissingResource { index: usize, verb: String },

    /// An entry carries no target identity where one is required.
    #[error("entry {index} ({verb}) requires a target identity")]
    MissingIdentity { index: usize, verb: String },

    /// A reference names a placeholder whose entry has not been applied yet.
    #[error("reference to placeholder {placeholder} before its entry was applied")]
    UnresolvedPlaceholder { placeholder: String },

    /// Two entries declare the same placeholder full-URL.
    #[error("placeholder {placeholder} is declared by more than one entry")]
    DuplicatePlaceholder { placeholder: String },

    /// A resource of the given type and id does not exist.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// A create names an identity that is already stored.
    #[error("resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    /// Invalid conditional expression.
    #[error("invalid match URL '{match_url}': {message}")]
    InvalidMatchUrl { match_url: String, message: String },
}

/// Errors related to chunked id production for batch jobs.
#[derive(Error, Debug)]
pub enum JobError {
    /// The resumption marker could not be decoded.
    #[error("invalid resumption marker: {marker}")]
    InvalidMarker { marker: String },

    /// The requested page size is zero.
    #[error("page size {requested} outside of 1..={max}")]
    InvalidPageSize { requested: usize, max: usize },

    /// The downstream sink refused a page.
    #[error("work chunk sink rejected page {page}: {message}")]
    SinkRejected { page: usize, message: String },
}

/// Result type alias for engine operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::Unavailable {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
        })
    }
}
