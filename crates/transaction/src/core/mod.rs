//! Core traits at the store boundary.
//!
//! - [`ResourceStore`] / [`StoreSession`] - the transactional store
//! - [`WriteBuffer`] - staged writes a session reads back before flushing

mod buffer;
mod store;

pub use buffer::WriteBuffer;
pub use store::{
    IdPageQuery, IndexChanges, PartitionPredicate, PendingWrite, ResourceStore, StoreSession, TokenHash,
    TokenHashPredicate,
};
