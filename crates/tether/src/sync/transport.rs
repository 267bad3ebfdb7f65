//! Pluggable remote transport for sync operations

use std::sync::Arc;

use log::debug;
use serde_json::{Value, json};
use thiserror::Error;

use crate::storage::{CacheValue, EntryStore};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// The remote refused the request; retrying will not help
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The remote holds a different version that needs reconciling
    #[error("remote has a conflicting version")]
    Conflict { remote: Value },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Network(_))
    }
}

/// Remote endpoint the sync engine pushes to and pulls from.
///
/// Implementations must bound every call with a timeout.
pub trait Transport: Send + Sync {
    /// Push a payload, returning the remote's acknowledgement
    fn upload(&self, resource_type: &str, payload: &Value) -> Result<Value, TransportError>;

    /// Fetch remote state described by `request`
    fn download(&self, resource_type: &str, request: &Value) -> Result<Value, TransportError>;
}

/// Transport used when no remote backend is configured.
///
/// Uploads are archived into the entry store as a local backup, and
/// downloads read those archives back.
pub struct LocalArchiveTransport {
    store: Arc<EntryStore>,
}

impl LocalArchiveTransport {
    pub fn new(store: Arc<EntryStore>) -> Self {
        Self { store }
    }

    /// Archive key: `archive/<resource_type>/<payload.key or "latest">`
    pub fn archive_key(resource_type: &str, payload: &Value) -> String {
        let name = payload.get("key").and_then(Value::as_str).unwrap_or("latest");
        format!("archive/{}/{}", resource_type, name)
    }
}

impl Transport for LocalArchiveTransport {
    fn upload(&self, resource_type: &str, payload: &Value) -> Result<Value, TransportError> {
        let key = Self::archive_key(resource_type, payload);

        if !self.store.store(&key, CacheValue::Structured(payload.clone()), None) {
            return Err(TransportError::Network(format!("could not write local archive {}", key)));
        }

        debug!("[SYNC] Archived {} payload as {}", resource_type, key);
        Ok(json!({ "archived_as": key }))
    }

    fn download(&self, resource_type: &str, request: &Value) -> Result<Value, TransportError> {
        let key = Self::archive_key(resource_type, request);

        self.store
            .retrieve(&key)
            .and_then(CacheValue::into_json)
            .ok_or_else(|| TransportError::Rejected(format!("nothing archived under {}", key)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Transport that replays scripted outcomes, then succeeds
    #[derive(Default)]
    pub struct ScriptedTransport {
        outcomes: Mutex<VecDeque<TransportError>>,
        fail_always: Mutex<Option<fn() -> TransportError>>,
        pub uploads: AtomicUsize,
        pub downloads: AtomicUsize,
        pub remote: Mutex<Value>,
    }

    impl ScriptedTransport {
        pub fn failing(make_error: fn() -> TransportError) -> Self {
            let transport = Self::default();
            *transport.fail_always.lock().unwrap() = Some(make_error);
            transport
        }

        pub fn push_failure(&self, error: TransportError) {
            self.outcomes.lock().unwrap().push_back(error);
        }

        pub fn recover(&self) {
            *self.fail_always.lock().unwrap() = None;
        }

        fn next_failure(&self) -> Option<TransportError> {
            if let Some(make_error) = *self.fail_always.lock().unwrap() {
                return Some(make_error());
            }
            self.outcomes.lock().unwrap().pop_front()
        }
    }

    impl Transport for ScriptedTransport {
        fn upload(&self, _resource_type: &str, payload: &Value) -> Result<Value, TransportError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            match self.next_failure() {
                Some(error) => Err(error),
                None => Ok(json!({ "received": payload })),
            }
        }

        fn download(&self, _resource_type: &str, _request: &Value) -> Result<Value, TransportError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            match self.next_failure() {
                Some(error) => Err(error),
                None => Ok(self.remote.lock().unwrap().clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_archive_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Arc::new(EntryStore::open(dir.path(), 1024 * 1024).unwrap());
        let transport = LocalArchiveTransport::new(store.clone());

        let ack = transport
            .upload("settings", &json!({ "key": "user-1", "theme": "dark" }))
            .unwrap();
        assert_eq!(ack["archived_as"], "archive/settings/user-1");
        assert!(store.exists("archive/settings/user-1"));

        let restored = transport.download("settings", &json!({ "key": "user-1" })).unwrap();
        assert_eq!(restored["theme"], "dark");
    }

    #[test]
    fn test_download_without_archive_is_rejected() {
        let dir = tempdir().unwrap();
        let store = Arc::new(EntryStore::open(dir.path(), 1024 * 1024).unwrap());
        let transport = LocalArchiveTransport::new(store);

        let err = transport.download("progress", &json!({})).unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unkeyed_payload_archives_as_latest() {
        assert_eq!(
            LocalArchiveTransport::archive_key("progress", &json!({ "score": 1 })),
            "archive/progress/latest"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(!TransportError::Conflict { remote: json!({}) }.is_retryable());
    }
}
