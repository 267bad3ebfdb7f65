//! Network connectivity monitoring
//!
//! - `probe`: the [`Prober`] seam and the real network prober
//! - `status`: status, events and quality scoring
//! - `monitor`: the [`ConnectivityMonitor`] itself

mod monitor;
mod probe;
mod status;

pub use monitor::{ConnectivityMonitor, ObserverId};
pub use probe::{NetworkProber, ProbeError, ProbeOutcome, Prober, classify};
pub use status::{ConnectionEvent, ConnectionQuality, ConnectionStatus, assess_quality};

#[cfg(test)]
pub(crate) use probe::testing;
