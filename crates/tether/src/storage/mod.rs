//! Durable entry storage
//!
//! - `index`: SQLite index of cached keys (size, kind, timestamps, TTL)
//! - `blob_file`: content files, one per key
//! - `store`: the [`EntryStore`] that keeps the two consistent

mod blob_file;
mod entry;
mod index;
mod store;

pub use entry::{CacheEntry, CacheStatistics, CacheValue, DataKind, SizeInfo};
pub use store::EntryStore;
