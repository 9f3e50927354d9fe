//! SQLite store.
//!
//! A [`ResourceStore`](crate::core::ResourceStore) on top of an r2d2 pool of
//! SQLite connections. It supports both in-memory databases (for tests) and
//! file databases.
//!
//! # Schema
//!
//! - `resources`: one row per resource holding its newest version, unique on
//!   `(resource_type, id)`
//! - `resource_index`: secondary index rows of the newest version, tagged with
//!   their category; token rows carry both search hashes
//!
//! # Transactions
//!
//! Each session owns one pooled connection for its whole lifetime and opens it
//! with `BEGIN IMMEDIATE`, so concurrent writers serialize on the database
//! lock. Flushed writes stay inside the open transaction until commit.
//!
//! ```no_run
//! use helios_transaction::backends::sqlite::SqliteStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("./data/transactions.db")?;
//! # Ok(())
//! # }
//! ```

mod schema;
mod store;

pub use schema::{SCHEMA_VERSION, initialize_schema};
pub use store::{SqliteSession, SqliteStore, SqliteStoreConfig};
