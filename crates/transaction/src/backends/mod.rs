//! Store implementations.
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | Memory | always | Process-local store with query counters, for tests and embedding |
//! | SQLite | `sqlite` | Embedded database with a pooled connection per session |

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;
