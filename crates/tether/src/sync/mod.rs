//! Offline-first synchronization
//!
//! Provides a durable operation queue that is drained through a pluggable
//! [`Transport`] whenever the connectivity monitor reports the network is
//! reachable. Divergent copies are reconciled by a per-resource
//! [`MergePolicy`].

mod engine;
mod merge;
mod operation;
mod queue;
mod timing;
mod transport;

pub use engine::{ResultCallback, SyncEngine};
pub use merge::{MergeOutcome, MergePolicy, merge};
pub use operation::{
    OperationId, OperationKind, SyncOperation, SyncResult, SyncState, SyncStatus, SyncStatusReport,
};
pub use queue::FlaggedConflict;
pub use timing::{backoff_delay, next_drain_delay};
pub use transport::{LocalArchiveTransport, Transport, TransportError};
