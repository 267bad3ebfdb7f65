//! In-process caching
//!
//! Independent of the durable [`EntryStore`](crate::storage::EntryStore);
//! nothing here touches disk.

mod cache;
mod memoize;

pub use cache::{MemoryCache, MemoryStats};
pub use memoize::Memoized;
