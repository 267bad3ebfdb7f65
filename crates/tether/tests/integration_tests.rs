//! Integration tests for the tether crate
//!
//! These tests wire the components together the way an application would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;
use tether::{
    CacheValue, ConnectionStatus, ConnectivityConfig, ConnectivityMonitor, EntryStore, MemoryCache,
    OperationKind, ProbeError, Prober, SyncConfig, SyncEngine, SyncStatus,
};

/// Prober whose reachability the test flips by hand
struct SwitchProber {
    online: AtomicBool,
}

impl Prober for SwitchProber {
    fn reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn probe(&self, _endpoint: &str) -> Result<Duration, ProbeError> {
        Ok(Duration::from_millis(25))
    }
}

struct App {
    monitor: Arc<ConnectivityMonitor>,
    prober: Arc<SwitchProber>,
    data: Arc<EntryStore>,
    engine: Arc<SyncEngine>,
    _dir: TempDir,
}

fn create_app(online: bool) -> App {
    let dir = TempDir::new().unwrap();
    let prober = Arc::new(SwitchProber {
        online: AtomicBool::new(online),
    });
    let monitor = Arc::new(ConnectivityMonitor::with_prober(
        ConnectivityConfig::default(),
        Box::new(prober.clone()),
    ));
    monitor.check_now();

    let data = Arc::new(EntryStore::open(dir.path().join("entries"), 10 * 1024 * 1024).unwrap());
    let queue_store = EntryStore::open(dir.path().join("sync"), 10 * 1024 * 1024).unwrap();
    let engine = Arc::new(SyncEngine::new(
        SyncConfig::default(),
        queue_store,
        data.clone(),
        monitor.clone(),
    ));

    App {
        monitor,
        prober,
        data,
        engine,
        _dir: dir,
    }
}

#[test]
fn test_ttl_entry_expires() {
    let dir = TempDir::new().unwrap();
    let store = EntryStore::open(dir.path(), 1024 * 1024).unwrap();

    assert!(store.store(
        "settings",
        json!({ "theme": "dark" }),
        Some(chrono::Duration::seconds(1))
    ));
    assert!(store.exists("settings"));

    thread::sleep(Duration::from_secs(2));

    assert!(!store.exists("settings"));
    assert_eq!(store.retrieve("settings"), None);
}

#[test]
fn test_lru_keeps_frequently_read_entry() {
    let dir = TempDir::new().unwrap();
    // Room for three 100-byte entries
    let store = EntryStore::open(dir.path(), 300).unwrap();
    let value = "v".repeat(100);

    store.store("k1", value.as_str(), None);
    for key in ["k2", "k3", "k4"] {
        assert!(store.retrieve("k1").is_some());
        store.store(key, value.as_str(), None);
    }

    assert!(store.exists("k1"));
    assert!(store.exists("k4"));
    let untouched_left = ["k2", "k3"].iter().filter(|k| store.exists(k)).count();
    assert!(untouched_left < 2);
    assert!(store.get_size_info().total_size_bytes <= 300);
}

#[test]
fn test_uploads_drain_when_connection_returns() {
    let app = create_app(false);
    assert_eq!(app.monitor.current_status(), ConnectionStatus::Offline);

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    app.engine.add_callback(move |result| sink.lock().unwrap().push(result.clone()));

    app.engine
        .enqueue(OperationKind::Upload, "progress", json!({ "key": "p1", "score": 10 }), 1);
    app.engine
        .enqueue(OperationKind::Upload, "settings", json!({ "key": "s1", "theme": "dark" }), 2);
    assert!(app.engine.start_auto_sync(Duration::from_secs(3600)));

    app.prober.online.store(true, Ordering::SeqCst);
    app.monitor.check_now();

    let deadline = Instant::now() + Duration::from_secs(5);
    while results.lock().unwrap().len() < 2 {
        assert!(Instant::now() < deadline, "auto-sync did not drain the queue");
        thread::sleep(Duration::from_millis(10));
    }
    app.engine.stop_auto_sync();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == SyncStatus::Success));
    assert!(app.engine.get_pending_operations().is_empty());

    // The default transport archives uploads locally
    assert!(app.data.exists("archive/progress/p1"));
    assert!(app.data.exists("archive/settings/s1"));
}

#[test]
fn test_conflicting_scores_merge_to_maximum() {
    let app = create_app(true);

    for (local, remote) in [(80, 95), (95, 80)] {
        app.engine.enqueue(
            OperationKind::Merge,
            "progress",
            json!({
                "key": "progress/user-1",
                "local": { "total_score": local },
                "remote": { "total_score": remote }
            }),
            1,
        );
    }

    let results = app.engine.sync_now(false);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == SyncStatus::Conflict));

    let merged = app
        .data
        .retrieve("progress/user-1")
        .and_then(CacheValue::into_json)
        .unwrap();
    assert_eq!(merged["total_score"], 95);
}

#[test]
fn test_offline_sync_leaves_queue_alone() {
    let app = create_app(false);
    app.engine.enqueue(OperationKind::Upload, "progress", json!({ "score": 1 }), 1);
    app.engine.enqueue(OperationKind::Download, "catalog", json!({}), 3);
    let before = app.engine.get_pending_operations();

    let results = app.engine.sync_now(false);

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, SyncStatus::Error);
    assert_eq!(app.engine.get_pending_operations(), before);
}

#[test]
fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let prober = Arc::new(SwitchProber {
        online: AtomicBool::new(false),
    });
    let monitor = Arc::new(ConnectivityMonitor::with_prober(
        ConnectivityConfig::default(),
        Box::new(prober.clone()),
    ));
    let data = Arc::new(EntryStore::open(dir.path().join("entries"), 1024 * 1024).unwrap());

    let open_engine = || {
        let queue_store = EntryStore::open(dir.path().join("sync"), 1024 * 1024).unwrap();
        SyncEngine::new(SyncConfig::default(), queue_store, data.clone(), monitor.clone())
    };

    let expected = {
        let engine = open_engine();
        engine.enqueue(OperationKind::Upload, "b", json!({}), 2);
        engine.enqueue(OperationKind::Upload, "a", json!({}), 1);
        engine.enqueue(OperationKind::Upload, "c", json!({}), 2);
        engine.get_pending_operations()
    };

    let engine = open_engine();
    let restored = engine.get_pending_operations();
    assert_eq!(restored, expected);
    let order: Vec<_> = restored.iter().map(|op| op.resource_type.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[test]
fn test_memory_cache_never_returns_expired() {
    let cache = MemoryCache::new(64 * 1024, 1000, Duration::from_secs(60));

    for i in 0..100u32 {
        let ttl = if i % 2 == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60)
        };
        cache.set(&format!("k{}", i % 10), i, Some(ttl));
    }

    for i in 0..10u32 {
        let value = cache.get(&format!("k{}", i));
        // Last write for even keys had a zero TTL
        if i % 2 == 0 {
            assert_eq!(value, None);
        } else {
            assert_eq!(value, Some(90 + i));
        }
    }
}
