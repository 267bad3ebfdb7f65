//! Queued sync operations and their results

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connectivity::ConnectionStatus;

/// Unique identifier for a queued operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Push local state to the remote
    Upload,
    /// Fetch remote state into the local cache
    Download,
    /// Reconcile a `{local, remote}` pair
    Merge,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Merge => "merge",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of pending synchronization work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Selects the merge policy and the cache key namespace
    pub resource_type: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// 1 is the highest priority
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Externally decided value that overrides automatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
}

impl SyncOperation {
    pub fn new(
        kind: OperationKind,
        resource_type: impl Into<String>,
        payload: Value,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            kind,
            resource_type: resource_type.into(),
            payload,
            enqueued_at: Utc::now(),
            priority,
            retry_count: 0,
            max_retries,
            resolution: None,
        }
    }

    /// Whether the failure just recorded was the last allowed attempt
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Cache key named by the payload's `key` field, if any
    pub fn payload_key(&self) -> Option<&str> {
        self.payload.get("key").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
    /// Local and remote disagreed; see `conflicting_fields`
    Conflict,
}

/// Outcome of processing one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// None for results not tied to an operation (e.g. skipped while offline)
    pub operation_id: Option<OperationId>,
    pub status: SyncStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicting_fields: Option<Vec<String>>,
}

impl SyncResult {
    fn new(operation_id: Option<&OperationId>, status: SyncStatus, message: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.cloned(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
            synced_summary: None,
            conflicting_fields: None,
        }
    }

    pub fn success(operation_id: &OperationId, message: impl Into<String>, summary: Option<Value>) -> Self {
        Self {
            synced_summary: summary,
            ..Self::new(Some(operation_id), SyncStatus::Success, message)
        }
    }

    pub fn error(operation_id: Option<&OperationId>, message: impl Into<String>) -> Self {
        Self::new(operation_id, SyncStatus::Error, message)
    }

    pub fn conflict(
        operation_id: &OperationId,
        message: impl Into<String>,
        fields: Vec<String>,
        summary: Option<Value>,
    ) -> Self {
        Self {
            synced_summary: summary,
            conflicting_fields: Some(fields),
            ..Self::new(Some(operation_id), SyncStatus::Conflict, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == SyncStatus::Error
    }
}

/// Engine-wide state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    /// Drain finished without errors
    Success,
    /// Drain produced at least one error
    Error,
}

/// Snapshot reported by `SyncEngine::get_sync_status`
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    /// `Syncing` while a drain runs, `Idle` otherwise
    pub state: SyncState,
    /// `Success` or `Error` for the most recent drain, None before the first
    pub last_outcome: Option<SyncState>,
    pub connection: ConnectionStatus,
    pub pending_operations: usize,
    pub flagged_conflicts: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub auto_sync_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_roundtrips_through_json() {
        let mut op = SyncOperation::new(
            OperationKind::Merge,
            "progress",
            json!({ "local": {}, "remote": {} }),
            2,
            3,
        );
        op.resolution = Some(json!({ "score": 1 }));

        let json = serde_json::to_string(&op).unwrap();
        let back: SyncOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_resolution_is_optional_on_disk() {
        let op = SyncOperation::new(OperationKind::Upload, "settings", json!({}), 1, 3);
        let json = serde_json::to_value(&op).unwrap();
        assert!(json.get("resolution").is_none());
        assert_eq!(json["kind"], "upload");
    }

    #[test]
    fn test_retries_exhausted() {
        let mut op = SyncOperation::new(OperationKind::Upload, "settings", json!({}), 1, 2);
        assert!(!op.retries_exhausted());
        op.retry_count = 1;
        assert!(!op.retries_exhausted());
        op.retry_count = 2;
        assert!(op.retries_exhausted());
    }

    #[test]
    fn test_payload_key() {
        let op = SyncOperation::new(OperationKind::Download, "lesson", json!({ "key": "lesson/7" }), 1, 3);
        assert_eq!(op.payload_key(), Some("lesson/7"));

        let op = SyncOperation::new(OperationKind::Download, "lesson", json!({ "key": 7 }), 1, 3);
        assert_eq!(op.payload_key(), None);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(OperationId::generate(), OperationId::generate());
    }
}
