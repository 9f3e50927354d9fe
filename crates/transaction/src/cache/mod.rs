//! Resolution caches.
//!
//! - [`TransactionCaches`] - private to one transaction, threaded through every phase
//! - [`MatchUrlCache`] - shared across transactions, tolerant of staleness

mod standing;
mod transaction;

pub use standing::{InMemoryMatchUrlCache, MatchUrlCache};
pub use transaction::{MatchKey, PlaceholderMap, PlaceholderState, SessionCache, TransactionCaches};
