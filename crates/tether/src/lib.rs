//! Tether - Offline cache and sync subsystem
//!
//! This crate keeps an application usable without a network connection:
//! - Connectivity monitoring with change notifications
//! - A durable, size-bounded entry store with TTL and LRU eviction
//! - An in-memory cache with expiration queue and memoization
//! - A durable sync queue drained when the network is reachable
//!
//! Components are constructed explicitly and shared through `Arc`; there
//! is no global registry. All I/O is synchronous and executor-agnostic.

pub mod config;
pub mod connectivity;
pub mod memory;
pub mod storage;
pub mod sync;

pub use crate::config::{CacheConfig, ConfigError, ConnectivityConfig, MemoryConfig, SyncConfig, TetherConfig};
pub use connectivity::{
    ConnectionEvent, ConnectionQuality, ConnectionStatus, ConnectivityMonitor, NetworkProber, ObserverId,
    ProbeError, Prober,
};
pub use memory::{MemoryCache, MemoryStats, Memoized};
pub use storage::{CacheEntry, CacheStatistics, CacheValue, DataKind, EntryStore, SizeInfo};
pub use sync::{
    FlaggedConflict, LocalArchiveTransport, MergePolicy, OperationId, OperationKind, SyncEngine, SyncOperation,
    SyncResult, SyncState, SyncStatus, SyncStatusReport, Transport, TransportError,
};
