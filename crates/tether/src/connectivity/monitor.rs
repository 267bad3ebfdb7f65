//! Connectivity monitor
//!
//! Runs probe cycles on demand or on a background thread, keeps the current
//! status and a bounded event history, and notifies observers on change.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;

use super::probe::{NetworkProber, ProbeOutcome, Prober, classify};
use super::status::{ConnectionEvent, ConnectionQuality, ConnectionStatus, QUALITY_WINDOW_MINUTES, assess_quality};
use crate::config::ConnectivityConfig;

/// Handle returned by [`ConnectivityMonitor::add_observer`]
pub type ObserverId = u64;

type Observer = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    status: ConnectionStatus,
    history: VecDeque<ConnectionEvent>,
    latencies: VecDeque<(DateTime<Utc>, u64)>,
}

struct Worker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ConnectivityMonitor {
    prober: Box<dyn Prober>,
    config: ConnectivityConfig,
    state: RwLock<MonitorState>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer_id: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl ConnectivityMonitor {
    /// Monitor that probes the real network
    pub fn new(config: ConnectivityConfig) -> Result<Self> {
        config.validate()?;
        let prober = NetworkProber::new(&config);
        Ok(Self::with_prober(config, Box::new(prober)))
    }

    pub fn with_prober(config: ConnectivityConfig, prober: Box<dyn Prober>) -> Self {
        Self {
            prober,
            config,
            state: RwLock::new(MonitorState::default()),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    /// Run one probe cycle and return the resulting status
    pub fn check_now(&self) -> ConnectionStatus {
        let outcome = self.probe_cycle();
        debug!(
            "[NET] Probe cycle: {} (latency {:?}ms)",
            outcome.status, outcome.latency_ms
        );
        self.record(outcome)
    }

    fn probe_cycle(&self) -> ProbeOutcome {
        if !self.prober.reachable() {
            return ProbeOutcome::unreachable();
        }

        let prober = self.prober.as_ref();
        let results: Vec<_> = self
            .config
            .probe_endpoints
            .par_iter()
            .map(|endpoint| prober.probe(endpoint))
            .collect();

        classify(&results, self.config.latency_threshold_ms)
    }

    /// Apply a cycle's outcome; notifies observers if the status changed
    fn record(&self, outcome: ProbeOutcome) -> ConnectionStatus {
        let now = Utc::now();

        let event = {
            let mut state = self.state.write().unwrap();

            if let Some(latency) = outcome.latency_ms {
                state.latencies.push_back((now, latency));
            }
            let horizon = now - chrono::Duration::minutes(QUALITY_WINDOW_MINUTES);
            while state.latencies.front().is_some_and(|(at, _)| *at < horizon) {
                state.latencies.pop_front();
            }

            if state.status == outcome.status {
                return outcome.status;
            }

            let event = ConnectionEvent {
                timestamp: now,
                old_status: state.status,
                new_status: outcome.status,
                latency_ms: outcome.latency_ms,
                error: outcome.error,
            };

            state.status = outcome.status;
            state.history.push_back(event.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
            event
        };

        info!(
            "[NET] Status changed: {} -> {}",
            event.old_status, event.new_status
        );
        self.notify(&event);
        event.new_status
    }

    fn notify(&self, event: &ConnectionEvent) {
        // Snapshot so observers can add or remove observers
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                warn!("[NET] Connectivity observer panicked");
            }
        }
    }

    /// Mark the connection Offline without probing. The next cycle
    /// re-evaluates normally.
    pub fn force_offline_mode(&self) -> ConnectionStatus {
        info!("[NET] Forcing offline mode");
        self.record(ProbeOutcome {
            status: ConnectionStatus::Offline,
            latency_ms: None,
            error: Some("forced".to_string()),
        })
    }

    pub fn add_observer(&self, observer: impl Fn(&ConnectionEvent) + Send + Sync + 'static) -> ObserverId {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().unwrap().push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.state.read().unwrap().status
    }

    pub fn is_online(&self) -> bool {
        self.current_status() == ConnectionStatus::Online
    }

    /// The most recent `limit` events, oldest first
    pub fn get_history(&self, limit: usize) -> Vec<ConnectionEvent> {
        let state = self.state.read().unwrap();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn get_connection_quality(&self) -> ConnectionQuality {
        let state = self.state.read().unwrap();
        assess_quality(state.status, &state.history, &state.latencies, Utc::now())
    }

    /// Start probing every `interval` on a background thread.
    ///
    /// Returns false if monitoring is already running.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> bool {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let monitor = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("tether-connectivity".to_string())
            .spawn(move || monitor_loop(monitor, stop_rx, interval));

        match handle {
            Ok(handle) => {
                info!("[NET] Monitoring started ({:?} interval)", interval);
                *worker = Some(Worker { stop_tx, handle });
                true
            }
            Err(e) => {
                warn!("[NET] Failed to spawn monitor thread: {}", e);
                false
            }
        }
    }

    /// Stop the background thread, waiting for an in-flight cycle.
    ///
    /// Returns false if monitoring was not running.
    pub fn stop_monitoring(&self) -> bool {
        let Some(worker) = self.worker.lock().unwrap().take() else {
            return false;
        };
        shutdown(worker);
        info!("[NET] Monitoring stopped");
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().ok().and_then(Option::take) {
            shutdown(worker);
        }
    }
}

fn shutdown(worker: Worker) {
    let _ = worker.stop_tx.send(());
    // The last Arc may be released on the worker itself
    if worker.handle.thread().id() != thread::current().id() && worker.handle.join().is_err() {
        warn!("[NET] Monitor thread panicked");
    }
}

fn monitor_loop(monitor: Weak<ConnectivityMonitor>, stop_rx: mpsc::Receiver<()>, interval: Duration) {
    loop {
        match monitor.upgrade() {
            Some(monitor) => {
                monitor.check_now();
            }
            None => break,
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("[NET] Monitor loop exited");
}
