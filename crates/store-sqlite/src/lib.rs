//! SQLite backend for stategraph.
//!
//! One database file holds states, content, output keys, labels and
//! dependency edges. Every trait call runs in its own transaction on a
//! blocking worker, so the async runtime never waits on disk I/O.
//!
//! Locks are a compare-and-swap on `states.lock_id`, which keeps them
//! correct when several server processes open the same file.

mod schema;
mod store;

pub use schema::SCHEMA_VERSION;
pub use store::{SqliteStore, SqliteStoreConfig, SqliteStoreError};
