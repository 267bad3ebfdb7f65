//! Reachability and latency probes
//!
//! Uses synchronous I/O (std TCP, ureq) to be executor-agnostic.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

use super::status::ConnectionStatus;
use crate::config::ConnectivityConfig;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("{endpoint} answered with HTTP {status}")]
    Http { endpoint: String, status: u16 },

    #[error("probe failed: {0}")]
    Transport(String),
}

/// Source of connectivity measurements
pub trait Prober: Send + Sync {
    /// Cheap low-level check that the network is there at all
    fn reachable(&self) -> bool;

    /// Fetch one endpoint, returning the round-trip time
    fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError>;
}

impl<P: Prober + ?Sized> Prober for Arc<P> {
    fn reachable(&self) -> bool {
        (**self).reachable()
    }

    fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError> {
        (**self).probe(endpoint)
    }
}

/// Probes the real network: a raw TCP connect, then HTTP GETs
pub struct NetworkProber {
    reachability_addr: String,
    reachability_timeout: Duration,
    agent: ureq::Agent,
}

impl NetworkProber {
    pub fn new(config: &ConnectivityConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.probe_timeout()))
            .build()
            .into();

        Self {
            reachability_addr: config.reachability_addr.clone(),
            reachability_timeout: config.reachability_timeout(),
            agent,
        }
    }
}

impl Prober for NetworkProber {
    fn reachable(&self) -> bool {
        let addrs = match self.reachability_addr.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("[NET] Cannot resolve {}: {}", self.reachability_addr, e);
                return false;
            }
        };

        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.reachability_timeout).is_ok())
    }

    fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError> {
        let started = Instant::now();

        match self.agent.get(endpoint).call() {
            Ok(_) => Ok(started.elapsed()),
            Err(ureq::Error::StatusCode(status)) => Err(ProbeError::Http {
                endpoint: endpoint.to_string(),
                status,
            }),
            Err(ureq::Error::Timeout(_)) => Err(ProbeError::Timeout),
            Err(e) => Err(ProbeError::Transport(e.to_string())),
        }
    }
}

/// Outcome of one probe cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: ConnectionStatus,
    /// Mean latency over successful probes
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn unreachable() -> Self {
        Self {
            status: ConnectionStatus::Offline,
            latency_ms: None,
            error: Some("network unreachable".to_string()),
        }
    }
}

/// Classify a set of probe results
///
/// No successes is Offline. Fewer than half succeeding, or a mean latency
/// above the threshold, is Limited. Anything else is Online.
pub fn classify(results: &[Result<Duration, ProbeError>], latency_threshold_ms: u64) -> ProbeOutcome {
    let latencies: Vec<u64> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|d| d.as_millis() as u64)
        .collect();
    let error = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .map(|e| e.to_string());

    if latencies.is_empty() {
        return ProbeOutcome {
            status: ConnectionStatus::Offline,
            latency_ms: None,
            error: error.or_else(|| Some("no probe endpoints".to_string())),
        };
    }

    let mean = latencies.iter().sum::<u64>() / latencies.len() as u64;
    let status = if latencies.len() * 2 < results.len() || mean > latency_threshold_ms {
        ConnectionStatus::Limited
    } else {
        ConnectionStatus::Online
    };

    ProbeOutcome {
        status,
        latency_ms: Some(mean),
        error,
    }
}
