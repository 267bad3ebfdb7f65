//! Sync engine: drains the operation queue when connectivity allows
//!
//! Operations are processed one at a time in priority order. Each result is
//! recorded in a bounded history and handed to registered callbacks.
//! Draining runs under a single drain lock, whether it was triggered by
//! `sync_now`, the auto-sync timer, or a connectivity transition.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use super::merge::merge;
use super::operation::{
    OperationId, OperationKind, SyncOperation, SyncResult, SyncState, SyncStatusReport,
};
use super::queue::{DurableQueue, FlaggedConflict};
use super::timing::next_drain_delay;
use super::transport::{LocalArchiveTransport, Transport, TransportError};
use crate::config::{SyncConfig, TetherConfig};
use crate::connectivity::{ConnectionStatus, ConnectivityMonitor, ObserverId};
use crate::storage::{CacheValue, EntryStore};

/// Budget for the queue's own store; it only ever holds two entries
const QUEUE_STORE_BUDGET: u64 = 1024 * 1024 * 1024;

pub type ResultCallback = Arc<dyn Fn(&SyncResult) + Send + Sync>;

/// What to do with an operation after one attempt
enum Disposition {
    Remove,
    Retry(SyncOperation),
    Flag(Value),
}

#[derive(Default)]
struct EngineState {
    state: SyncState,
    last_outcome: Option<SyncState>,
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

enum Wake {
    Online,
    Stop,
}

struct AutoSync {
    wake_tx: mpsc::Sender<Wake>,
    handle: JoinHandle<()>,
    observer_id: ObserverId,
}

pub struct SyncEngine {
    config: SyncConfig,
    data: Arc<EntryStore>,
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectivityMonitor>,
    queue: Mutex<DurableQueue>,
    drain_lock: Mutex<()>,
    state: Mutex<EngineState>,
    history: Mutex<VecDeque<SyncResult>>,
    callbacks: Mutex<Vec<ResultCallback>>,
    auto_sync: Mutex<Option<AutoSync>>,
}

impl SyncEngine {
    /// Create an engine whose queue lives in `queue_store`. Uploads are
    /// archived locally until a transport is supplied.
    pub fn new(
        config: SyncConfig,
        queue_store: EntryStore,
        data: Arc<EntryStore>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        let transport = Arc::new(LocalArchiveTransport::new(data.clone()));

        Self {
            config,
            transport,
            monitor,
            queue: Mutex::new(DurableQueue::open(queue_store)),
            data,
            drain_lock: Mutex::new(()),
            state: Mutex::new(EngineState::default()),
            history: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            auto_sync: Mutex::new(None),
        }
    }

    /// Open the queue store under the configured sync directory
    pub fn from_config(
        config: &TetherConfig,
        data: Arc<EntryStore>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Result<Self> {
        let queue_store = EntryStore::open(config.sync_dir()?, QUEUE_STORE_BUDGET)?;
        Ok(Self::new(config.sync.clone(), queue_store, data, monitor))
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Queue an operation and persist the queue. Lower `priority` runs first.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        resource_type: &str,
        payload: Value,
        priority: u8,
    ) -> OperationId {
        let operation = SyncOperation::new(kind, resource_type, payload, priority, self.config.max_retries);
        let id = operation.id.clone();

        let mut queue = self.queue.lock().unwrap();
        queue.push(operation);
        queue.persist();

        info!(
            "[SYNC] Queued {} {} (priority {}, {} pending)",
            kind,
            resource_type,
            priority,
            queue.len()
        );
        id
    }

    /// Process every pending operation once.
    ///
    /// While offline, and unless `force` is set, returns a single error
    /// result and leaves the queue untouched.
    pub fn sync_now(&self, force: bool) -> Vec<SyncResult> {
        let _drain = self.drain_lock.lock().unwrap();

        let connection = self.monitor.current_status();
        if !force && !connection.is_reachable() {
            debug!("[SYNC] Skipping sync: connection is {}", connection);
            return vec![SyncResult::error(
                None,
                format!("Cannot sync while {}", connection),
            )];
        }

        let operations = self.queue.lock().unwrap().pending().to_vec();
        self.state.lock().unwrap().state = SyncState::Syncing;
        info!("[SYNC] Draining {} operations", operations.len());

        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            let (result, disposition) = self.process(operation.clone());
            self.apply(&operation.id, disposition);
            self.record(&result);
            results.push(result);
        }

        let errors = results.iter().filter(|r| r.is_error()).count();
        {
            let mut state = self.state.lock().unwrap();
            state.state = SyncState::Idle;
            state.last_sync_at = Some(Utc::now());
            if errors == 0 {
                state.last_outcome = Some(SyncState::Success);
                state.last_error = None;
            } else {
                state.last_outcome = Some(SyncState::Error);
                state.last_error = results
                    .iter()
                    .rev()
                    .find(|r| r.is_error())
                    .map(|r| r.message.clone());
            }
        }

        info!(
            "[SYNC] Drain complete: {} processed, {} errors",
            results.len(),
            errors
        );
        results
    }

    fn process(&self, operation: SyncOperation) -> (SyncResult, Disposition) {
        match operation.kind {
            OperationKind::Upload => self.process_upload(operation),
            OperationKind::Download => self.process_download(operation),
            OperationKind::Merge => self.process_merge(operation),
        }
    }

    fn process_upload(&self, operation: SyncOperation) -> (SyncResult, Disposition) {
        let payload = operation.resolution.as_ref().unwrap_or(&operation.payload);

        match self.transport.upload(&operation.resource_type, payload) {
            Ok(ack) => (
                SyncResult::success(
                    &operation.id,
                    format!("Uploaded {}", operation.resource_type),
                    Some(ack),
                ),
                Disposition::Remove,
            ),
            Err(e) => self.failed(operation, e),
        }
    }

    fn process_download(&self, operation: SyncOperation) -> (SyncResult, Disposition) {
        let data = if let Some(resolution) = operation.resolution.clone() {
            resolution
        } else {
            match self
                .transport
                .download(&operation.resource_type, &operation.payload)
            {
                Ok(data) => data,
                Err(e) => return self.failed(operation, e),
            }
        };

        let key = cache_key(&operation, "remote");
        if !self.data.store(&key, CacheValue::Structured(data), None) {
            return self.failed(
                operation,
                TransportError::Network(format!("could not cache download as {}", key)),
            );
        }

        (
            SyncResult::success(
                &operation.id,
                format!("Downloaded {}", operation.resource_type),
                Some(serde_json::json!({ "cached_as": key })),
            ),
            Disposition::Remove,
        )
    }

    fn process_merge(&self, operation: SyncOperation) -> (SyncResult, Disposition) {
        let key = cache_key(&operation, "merged");

        if let Some(resolution) = &operation.resolution {
            if !self.data.store(&key, CacheValue::Structured(resolution.clone()), None) {
                return self.failed(
                    operation,
                    TransportError::Network(format!("could not cache resolution as {}", key)),
                );
            }
            return (
                SyncResult::success(
                    &operation.id,
                    format!("Applied external resolution for {}", operation.resource_type),
                    Some(resolution.clone()),
                ),
                Disposition::Remove,
            );
        }

        let (Some(local), Some(remote)) = (operation.payload.get("local"), operation.payload.get("remote"))
        else {
            warn!(
                "[SYNC] Merge {} is missing its local or remote half; dropping",
                operation.id
            );
            return (
                SyncResult::error(
                    Some(&operation.id),
                    "Merge payload must contain both `local` and `remote`",
                ),
                Disposition::Remove,
            );
        };

        let policy = self.config.merge_policy(&operation.resource_type);
        let outcome = merge(policy, local, remote, &self.config.additive_fields);

        if !self.data.store(&key, CacheValue::Structured(outcome.merged.clone()), None) {
            return self.failed(
                operation,
                TransportError::Network(format!("could not cache merge result as {}", key)),
            );
        }

        let result = if outcome.has_conflicts() {
            debug!(
                "[SYNC] Merge {} resolved conflicts in {:?}",
                operation.id, outcome.conflicting_fields
            );
            SyncResult::conflict(
                &operation.id,
                format!(
                    "Resolved {} conflicting fields in {}",
                    outcome.conflicting_fields.len(),
                    operation.resource_type
                ),
                outcome.conflicting_fields,
                Some(outcome.merged),
            )
        } else {
            SyncResult::success(
                &operation.id,
                format!("Merged {}", operation.resource_type),
                Some(outcome.merged),
            )
        };

        (result, Disposition::Remove)
    }

    /// Turn a failed attempt into a result and decide the operation's fate
    fn failed(&self, mut operation: SyncOperation, error: TransportError) -> (SyncResult, Disposition) {
        match error {
            TransportError::Conflict { remote } => {
                info!("[SYNC] {} flagged for conflict resolution", operation.id);
                (
                    SyncResult::conflict(
                        &operation.id,
                        format!(
                            "Remote {} conflicts with local copy; awaiting resolution",
                            operation.resource_type
                        ),
                        Vec::new(),
                        Some(remote.clone()),
                    ),
                    Disposition::Flag(remote),
                )
            }
            error if !error.is_retryable() => {
                warn!("[SYNC] {} failed permanently: {}", operation.id, error);
                (
                    SyncResult::error(Some(&operation.id), error.to_string()),
                    Disposition::Remove,
                )
            }
            error => {
                operation.retry_count += 1;

                if operation.retries_exhausted() {
                    warn!(
                        "[SYNC] {} dropped after {} attempts: {}",
                        operation.id, operation.retry_count, error
                    );
                    (
                        SyncResult::error(
                            Some(&operation.id),
                            format!(
                                "Gave up after {} attempts: {}",
                                operation.retry_count, error
                            ),
                        ),
                        Disposition::Remove,
                    )
                } else {
                    debug!(
                        "[SYNC] {} attempt {}/{} failed: {}",
                        operation.id, operation.retry_count, operation.max_retries, error
                    );
                    (
                        SyncResult::error(
                            Some(&operation.id),
                            format!(
                                "Attempt {}/{} failed: {}",
                                operation.retry_count, operation.max_retries, error
                            ),
                        ),
                        Disposition::Retry(operation),
                    )
                }
            }
        }
    }

    fn apply(&self, id: &OperationId, disposition: Disposition) {
        let mut queue = self.queue.lock().unwrap();

        // The queue may have been cleared while the operation ran
        let changed = match disposition {
            Disposition::Remove => queue.remove(id).is_some(),
            Disposition::Retry(operation) => queue.update(operation),
            Disposition::Flag(remote) => queue.flag_conflict(id, remote),
        };

        if changed {
            queue.persist();
        }
    }

    fn record(&self, result: &SyncResult) {
        {
            let mut history = self.history.lock().unwrap();
            history.push_back(result.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        let callbacks: Vec<ResultCallback> = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                warn!("[SYNC] Result callback panicked");
            }
        }
    }

    /// Register a callback for every per-operation result.
    ///
    /// Callbacks run on the draining thread and must not call `sync_now`.
    pub fn add_callback(&self, callback: impl Fn(&SyncResult) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Arc::new(callback));
    }

    pub fn get_sync_status(&self) -> SyncStatusReport {
        let (pending_operations, flagged_conflicts) = {
            let queue = self.queue.lock().unwrap();
            (queue.len(), queue.conflicts().len())
        };
        let state = self.state.lock().unwrap();

        SyncStatusReport {
            state: state.state,
            last_outcome: state.last_outcome,
            connection: self.monitor.current_status(),
            pending_operations,
            flagged_conflicts,
            last_sync_at: state.last_sync_at,
            last_error: state.last_error.clone(),
            auto_sync_running: self.auto_sync.lock().unwrap().is_some(),
        }
    }

    pub fn get_pending_operations(&self) -> Vec<SyncOperation> {
        self.queue.lock().unwrap().pending().to_vec()
    }

    /// The most recent `limit` results, oldest first
    pub fn get_sync_history(&self, limit: usize) -> Vec<SyncResult> {
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn get_conflicts(&self) -> Vec<FlaggedConflict> {
        self.queue.lock().unwrap().conflicts().to_vec()
    }

    /// Re-queue a flagged conflict with an externally decided value.
    ///
    /// Returns false if no conflict is flagged under `id`.
    pub fn resolve_conflict(&self, id: &OperationId, resolution: Value) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let Some(conflict) = queue.take_conflict(id) else {
            return false;
        };

        let mut operation = conflict.operation;
        operation.resolution = Some(resolution);
        operation.retry_count = 0;
        queue.push(operation);
        queue.persist();

        info!("[SYNC] Conflict {} resolved and re-queued", id);
        true
    }

    /// Drop every pending operation. Flagged conflicts are kept.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let removed = queue.clear();
        queue.persist();
        info!("[SYNC] Cleared {} pending operations", removed);
        removed
    }

    fn should_auto_drain(&self) -> bool {
        self.monitor.current_status().is_reachable() && !self.queue.lock().unwrap().is_empty()
    }

    /// Drain on a timer, and immediately whenever the monitor reports a
    /// transition into Online.
    ///
    /// Returns false if auto-sync is already running.
    pub fn start_auto_sync(self: &Arc<Self>, interval: Duration) -> bool {
        let mut auto_sync = self.auto_sync.lock().unwrap();
        if auto_sync.is_some() {
            return false;
        }

        let (wake_tx, wake_rx) = mpsc::channel();

        let online_tx = wake_tx.clone();
        let observer_id = self.monitor.add_observer(move |event| {
            if event.new_status == ConnectionStatus::Online {
                let _ = online_tx.send(Wake::Online);
            }
        });

        let engine = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("tether-auto-sync".to_string())
            .spawn(move || auto_sync_loop(engine, wake_rx, interval));

        match handle {
            Ok(handle) => {
                info!("[SYNC] Auto-sync started ({:?} interval)", interval);
                *auto_sync = Some(AutoSync {
                    wake_tx,
                    handle,
                    observer_id,
                });
                true
            }
            Err(e) => {
                warn!("[SYNC] Failed to spawn auto-sync thread: {}", e);
                self.monitor.remove_observer(observer_id);
                false
            }
        }
    }

    /// Stop auto-sync, waiting for an in-flight drain to finish.
    ///
    /// Returns false if auto-sync was not running.
    pub fn stop_auto_sync(&self) -> bool {
        let Some(auto_sync) = self.auto_sync.lock().unwrap().take() else {
            return false;
        };
        self.shutdown(auto_sync);
        info!("[SYNC] Auto-sync stopped");
        true
    }

    fn shutdown(&self, auto_sync: AutoSync) {
        self.monitor.remove_observer(auto_sync.observer_id);
        let _ = auto_sync.wake_tx.send(Wake::Stop);

        // The last Arc may be released on the auto-sync thread itself
        if auto_sync.handle.thread().id() != thread::current().id() && auto_sync.handle.join().is_err() {
            warn!("[SYNC] Auto-sync thread panicked");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(auto_sync) = self.auto_sync.get_mut().ok().and_then(Option::take) {
            self.shutdown(auto_sync);
        }
    }
}

/// Cache key for an operation's result: `payload.key`, else `<prefix>/<resource_type>`
fn cache_key(operation: &SyncOperation, prefix: &str) -> String {
    match operation.payload_key() {
        Some(key) => key.to_string(),
        None => format!("{}/{}", prefix, operation.resource_type),
    }
}

fn auto_sync_loop(engine: Weak<SyncEngine>, wake_rx: mpsc::Receiver<Wake>, interval: Duration) {
    let mut failures = 0u32;

    loop {
        let delay = {
            let Some(engine) = engine.upgrade() else {
                break;
            };

            if engine.should_auto_drain() {
                let results = engine.sync_now(false);
                if results.iter().any(SyncResult::is_error) {
                    failures = failures.saturating_add(1);
                } else {
                    failures = 0;
                }
            }

            next_drain_delay(failures, interval, &engine.config)
        };

        match wake_rx.recv_timeout(delay) {
            Ok(Wake::Online) => {
                debug!("[SYNC] Connection came online, draining");
                failures = 0;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Ok(Wake::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("[SYNC] Auto-sync loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivityConfig;
    use crate::connectivity::testing::ScriptedProber;
    use crate::sync::SyncStatus;
    use crate::sync::transport::testing::ScriptedTransport;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Harness {
        engine: Arc<SyncEngine>,
        monitor: Arc<ConnectivityMonitor>,
        prober: Arc<ScriptedProber>,
        data: Arc<EntryStore>,
        dir: TempDir,
    }

    fn harness(online: bool, transport: Option<Arc<dyn Transport>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        harness_in(dir, online, transport)
    }

    fn harness_in(dir: TempDir, online: bool, transport: Option<Arc<dyn Transport>>) -> Harness {
        build_harness(dir, SyncConfig::default(), online, transport)
    }

    fn build_harness(
        dir: TempDir,
        config: SyncConfig,
        online: bool,
        transport: Option<Arc<dyn Transport>>,
    ) -> Harness {
        let prober = Arc::new(if online {
            ScriptedProber::online()
        } else {
            ScriptedProber::offline()
        });
        let monitor = Arc::new(ConnectivityMonitor::with_prober(
            ConnectivityConfig::default(),
            Box::new(prober.clone()),
        ));
        monitor.check_now();

        let data = Arc::new(EntryStore::open(dir.path().join("data"), 10 * 1024 * 1024).unwrap());
        let queue_store = EntryStore::open(dir.path().join("sync"), QUEUE_STORE_BUDGET).unwrap();
        let mut engine = SyncEngine::new(config, queue_store, data.clone(), monitor.clone());
        if let Some(transport) = transport {
            engine = engine.with_transport(transport);
        }

        Harness {
            engine: Arc::new(engine),
            monitor,
            prober,
            data,
            dir,
        }
    }

    #[test]
    fn test_offline_sync_is_refused() {
        let h = harness(false, None);
        h.engine.enqueue(OperationKind::Upload, "settings", json!({ "theme": "dark" }), 1);
        let before = h.engine.get_pending_operations();

        let results = h.engine.sync_now(false);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, SyncStatus::Error);
        assert_eq!(h.engine.get_pending_operations(), before);
        assert!(h.engine.get_sync_history(10).is_empty());
    }

    #[test]
    fn test_forced_sync_runs_offline() {
        let h = harness(false, None);
        h.engine.enqueue(OperationKind::Upload, "settings", json!({ "theme": "dark" }), 1);

        let results = h.engine.sync_now(true);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, SyncStatus::Success);
        assert!(h.data.exists("archive/settings/latest"));
        assert!(h.engine.get_pending_operations().is_empty());
    }

    #[test]
    fn test_operations_run_in_priority_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(true, Some(transport));
        let low = h.engine.enqueue(OperationKind::Upload, "a", json!({}), 5);
        let high = h.engine.enqueue(OperationKind::Upload, "b", json!({}), 1);
        let high2 = h.engine.enqueue(OperationKind::Upload, "c", json!({}), 1);

        let ids: Vec<_> = h
            .engine
            .sync_now(false)
            .into_iter()
            .filter_map(|r| r.operation_id)
            .collect();
        assert_eq!(ids, vec![high, high2, low]);
        let status = h.engine.get_sync_status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_outcome, Some(SyncState::Success));
    }

    #[test]
    fn test_retry_bound() {
        let transport = Arc::new(ScriptedTransport::failing(|| TransportError::Network("down".into())));
        let h = harness(true, Some(transport.clone()));
        h.engine.enqueue(OperationKind::Upload, "progress", json!({ "score": 1 }), 1);

        for attempt in 1..=3 {
            let results = h.engine.sync_now(false);
            assert_eq!(results.len(), 1, "attempt {}", attempt);
            assert!(results[0].is_error());
        }

        assert_eq!(transport.uploads.load(Ordering::SeqCst), 3);
        assert!(h.engine.get_pending_operations().is_empty());
        assert!(h.engine.sync_now(false).is_empty());
        assert_eq!(transport.uploads.load(Ordering::SeqCst), 3);

        let status = h.engine.get_sync_status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_outcome, Some(SyncState::Success));
        assert_eq!(h.engine.get_sync_history(10).len(), 3);
    }

    #[test]
    fn test_retry_count_is_persisted() {
        let transport = Arc::new(ScriptedTransport::failing(|| TransportError::Timeout));
        let h = harness(true, Some(transport));
        h.engine.enqueue(OperationKind::Upload, "progress", json!({}), 1);
        h.engine.sync_now(false);
        let status = h.engine.get_sync_status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_outcome, Some(SyncState::Error));
        assert!(status.last_error.is_some());

        let Harness { engine, dir, .. } = h;
        drop(engine);

        let reopened = harness_in(dir, true, None);
        let pending = reopened.engine.get_pending_operations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
    }

    #[test]
    fn test_rejected_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_failure(TransportError::Rejected("bad payload".into()));
        let h = harness(true, Some(transport.clone()));
        h.engine.enqueue(OperationKind::Upload, "progress", json!({}), 1);

        let results = h.engine.sync_now(false);
        assert!(results[0].is_error());
        assert!(h.engine.get_pending_operations().is_empty());
    }

    #[test]
    fn test_merge_resolves_to_higher_score() {
        let h = harness(true, None);
        let id = h.engine.enqueue(
            OperationKind::Merge,
            "progress",
            json!({
                "key": "progress/user-1",
                "local": { "total_score": 80, "completed": ["A", "B"] },
                "remote": { "total_score": 95, "completed": ["B", "C"] }
            }),
            1,
        );

        let results = h.engine.sync_now(false);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].operation_id.as_ref(), Some(&id));
        assert_eq!(results[0].status, SyncStatus::Conflict);
        assert_eq!(
            results[0].conflicting_fields.as_deref(),
            Some(&["completed".to_string(), "total_score".to_string()][..])
        );

        let merged = h.data.retrieve("progress/user-1").and_then(CacheValue::into_json).unwrap();
        assert_eq!(merged["total_score"], 95);
        assert_eq!(merged["completed"], json!(["A", "B", "C"]));
        assert!(h.engine.get_pending_operations().is_empty());
    }

    #[test]
    fn test_merge_without_both_halves_is_dropped() {
        let h = harness(true, None);
        h.engine.enqueue(OperationKind::Merge, "progress", json!({ "local": {} }), 1);

        let results = h.engine.sync_now(false);
        assert_eq!(results[0].status, SyncStatus::Error);
        assert!(h.engine.get_pending_operations().is_empty());
    }

    #[test]
    fn test_unlisted_resource_uses_remote_wins() {
        let h = harness(true, None);
        h.engine.enqueue(
            OperationKind::Merge,
            "preferences",
            json!({ "local": { "a": 1, "b": 1 }, "remote": { "a": 2 } }),
            1,
        );

        h.engine.sync_now(false);
        let merged = h.data.retrieve("merged/preferences").and_then(CacheValue::into_json).unwrap();
        assert_eq!(merged, json!({ "a": 2, "b": 1 }));
    }

    #[test]
    fn test_download_is_cached() {
        let transport = Arc::new(ScriptedTransport::default());
        *transport.remote.lock().unwrap() = json!({ "lessons": 12 });
        let h = harness(true, Some(transport));
        h.engine.enqueue(OperationKind::Download, "catalog", json!({}), 1);

        let results = h.engine.sync_now(false);
        assert_eq!(results[0].status, SyncStatus::Success);
        assert_eq!(
            h.data.retrieve("remote/catalog"),
            Some(CacheValue::Structured(json!({ "lessons": 12 })))
        );
    }

    #[test]
    fn test_transport_conflict_is_flagged_then_resolved() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_failure(TransportError::Conflict {
            remote: json!({ "theme": "light" }),
        });
        let h = harness(true, Some(transport.clone()));
        let id = h.engine.enqueue(OperationKind::Upload, "settings", json!({ "theme": "dark" }), 1);

        let results = h.engine.sync_now(false);
        assert_eq!(results[0].status, SyncStatus::Conflict);
        assert!(h.engine.get_pending_operations().is_empty());
        assert_eq!(h.engine.get_conflicts().len(), 1);
        assert_eq!(h.engine.get_sync_status().flagged_conflicts, 1);

        assert!(h.engine.resolve_conflict(&id, json!({ "theme": "dark", "resolved": true })));
        assert!(!h.engine.resolve_conflict(&id, json!({})));
        let pending = h.engine.get_pending_operations();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].resolution.is_some());

        let results = h.engine.sync_now(false);
        assert_eq!(results[0].status, SyncStatus::Success);
        assert_eq!(
            results[0].synced_summary.as_ref().unwrap()["received"]["resolved"],
            true
        );
    }

    #[test]
    fn test_callbacks_see_results_and_panics_are_contained() {
        let h = harness(true, None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        h.engine.add_callback(|_| panic!("callback failure"));
        let sink = seen.clone();
        h.engine.add_callback(move |result| sink.lock().unwrap().push(result.status));

        h.engine.enqueue(OperationKind::Upload, "a", json!({}), 1);
        h.engine.enqueue(OperationKind::Upload, "b", json!({}), 1);
        h.engine.sync_now(false);

        assert_eq!(*seen.lock().unwrap(), vec![SyncStatus::Success, SyncStatus::Success]);
    }

    #[test]
    fn test_state_is_syncing_only_during_drain() {
        let h = harness(true, None);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let engine = Arc::downgrade(&h.engine);
        let sink = observed.clone();
        h.engine.add_callback(move |_| {
            if let Some(engine) = engine.upgrade() {
                sink.lock().unwrap().push(engine.get_sync_status().state);
            }
        });

        assert_eq!(h.engine.get_sync_status().last_outcome, None);
        h.engine.enqueue(OperationKind::Upload, "a", json!({}), 1);
        h.engine.sync_now(false);

        assert_eq!(*observed.lock().unwrap(), vec![SyncState::Syncing]);
        let status = h.engine.get_sync_status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_outcome, Some(SyncState::Success));
        assert!(status.last_sync_at.is_some());
    }

    #[test]
    fn test_history_keeps_newest_results() {
        let config = SyncConfig {
            history_limit: 3,
            ..SyncConfig::default()
        };
        let h = build_harness(tempfile::tempdir().unwrap(), config, true, None);

        let ids: Vec<_> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|rt| h.engine.enqueue(OperationKind::Upload, rt, json!({}), 1))
            .collect();
        assert_eq!(h.engine.sync_now(false).len(), 5);

        let history: Vec<_> = h
            .engine
            .get_sync_history(10)
            .into_iter()
            .filter_map(|r| r.operation_id)
            .collect();
        assert_eq!(history, ids[2..].to_vec());

        let latest: Vec<_> = h
            .engine
            .get_sync_history(2)
            .into_iter()
            .filter_map(|r| r.operation_id)
            .collect();
        assert_eq!(latest, ids[3..].to_vec());
        assert!(h.engine.get_sync_history(0).is_empty());
    }

    #[test]
    fn test_clear_queue() {
        let h = harness(false, None);
        h.engine.enqueue(OperationKind::Upload, "a", json!({}), 1);
        h.engine.enqueue(OperationKind::Upload, "b", json!({}), 1);

        assert_eq!(h.engine.clear_queue(), 2);
        assert_eq!(h.engine.get_sync_status().pending_operations, 0);
    }

    #[test]
    fn test_auto_sync_drains_when_coming_online() {
        let h = harness(false, None);
        let successes = Arc::new(Mutex::new(0usize));
        let counter = successes.clone();
        h.engine.add_callback(move |result| {
            if result.status == SyncStatus::Success {
                *counter.lock().unwrap() += 1;
            }
        });

        h.engine.enqueue(OperationKind::Upload, "a", json!({}), 1);
        h.engine.enqueue(OperationKind::Upload, "b", json!({}), 1);

        assert!(h.engine.start_auto_sync(Duration::from_secs(3600)));
        assert!(!h.engine.start_auto_sync(Duration::from_secs(3600)));

        h.prober.set_reachable(true);
        assert_eq!(h.monitor.check_now(), ConnectionStatus::Online);

        let deadline = Instant::now() + Duration::from_secs(5);
        while *successes.lock().unwrap() < 2 {
            assert!(Instant::now() < deadline, "queue was not drained");
            thread::sleep(Duration::from_millis(10));
        }

        assert!(h.engine.get_pending_operations().is_empty());
        assert!(h.engine.get_sync_status().auto_sync_running);
        assert!(h.engine.stop_auto_sync());
        assert!(!h.engine.stop_auto_sync());
        assert_eq!(*successes.lock().unwrap(), 2);
    }
}
