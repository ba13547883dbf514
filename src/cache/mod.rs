//! Local durable key-value cache.
//!
//! Every read and write in the crate funnels through this module:
//! - `KeyValueStore` persists JSON documents by key (SQLite or in-memory)
//! - `LocalStore` adds list appends and enqueues a pending change for each
//!   write to a key that maps to a remote table

mod layer;
mod storage;
mod types;

pub use layer::LocalStore;
pub use storage::{KeyValueStore, MemoryStorage, SqliteStorage};
pub use types::{AppendOptions, SetOptions, DEFAULT_MAX_ITEMS};
