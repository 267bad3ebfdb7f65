//! Cache entry records and the value codec

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// How a cached value is encoded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// JSON document, stored as JSON text
    Structured,
    /// UTF-8 text, stored raw
    Text,
    /// Raw bytes, stored zstd-compressed
    Binary,
    /// Serialized object snapshot, stored as zstd-compressed JSON
    Opaque,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Structured => "structured",
            DataKind::Text => "text",
            DataKind::Binary => "binary",
            DataKind::Opaque => "opaque",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "structured" => Ok(DataKind::Structured),
            "text" => Ok(DataKind::Text),
            "binary" => Ok(DataKind::Binary),
            "opaque" => Ok(DataKind::Opaque),
            other => Err(ConfigError::UnknownDataKind(other.to_string())),
        }
    }
}

/// A value held by the entry store, tagged with its encoding
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Structured(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
    Opaque(serde_json::Value),
}

impl CacheValue {
    pub fn kind(&self) -> DataKind {
        match self {
            CacheValue::Structured(_) => DataKind::Structured,
            CacheValue::Text(_) => DataKind::Text,
            CacheValue::Binary(_) => DataKind::Binary,
            CacheValue::Opaque(_) => DataKind::Opaque,
        }
    }

    /// Serialize to the on-disk representation for this kind
    pub fn encode(&self, compression_level: i32) -> Result<Vec<u8>> {
        match self {
            CacheValue::Structured(value) => {
                serde_json::to_vec(value).context("Failed to encode structured value")
            }
            CacheValue::Text(text) => Ok(text.as_bytes().to_vec()),
            CacheValue::Binary(bytes) => zstd::encode_all(bytes.as_slice(), compression_level)
                .context("Failed to compress binary value"),
            CacheValue::Opaque(value) => {
                let json = serde_json::to_vec(value).context("Failed to encode opaque value")?;
                zstd::encode_all(json.as_slice(), compression_level)
                    .context("Failed to compress opaque value")
            }
        }
    }

    /// Parse bytes previously produced by [`CacheValue::encode`]
    pub fn decode(kind: DataKind, bytes: &[u8]) -> Result<Self> {
        match kind {
            DataKind::Structured => serde_json::from_slice(bytes)
                .map(CacheValue::Structured)
                .context("Failed to decode structured value"),
            DataKind::Text => String::from_utf8(bytes.to_vec())
                .map(CacheValue::Text)
                .context("Cached text is not valid UTF-8"),
            DataKind::Binary => zstd::decode_all(bytes)
                .map(CacheValue::Binary)
                .context("Failed to decompress binary value"),
            DataKind::Opaque => {
                let json = zstd::decode_all(bytes).context("Failed to decompress opaque value")?;
                serde_json::from_slice(&json)
                    .map(CacheValue::Opaque)
                    .context("Failed to decode opaque value")
            }
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Structured(v) | CacheValue::Opaque(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            CacheValue::Structured(v) | CacheValue::Opaque(v) => Some(v),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Structured(value)
    }
}

impl From<String> for CacheValue {
    fn from(text: String) -> Self {
        CacheValue::Text(text)
    }
}

impl From<&str> for CacheValue {
    fn from(text: &str) -> Self {
        CacheValue::Text(text.to_string())
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(bytes: Vec<u8>) -> Self {
        CacheValue::Binary(bytes)
    }
}

/// Index record for one cached key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data_kind: DataKind,
    /// Content file name inside the blob directory
    pub file_name: String,
    /// Exact size of the content file on disk
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// None means the entry never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<HashMap<String, String>>,
    /// Write generation, replaced on every store of the key
    #[serde(default)]
    pub revision: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Aggregate size figures for the store
#[derive(Debug, Clone, Default, Serialize)]
pub struct SizeInfo {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub average_size_bytes: u64,
    pub budget_bytes: u64,
    /// Share of the budget in use, 0-100 (may exceed 100 for oversize entries)
    pub usage_percent: f64,
}

/// Size figures plus access statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub size: SizeInfo,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    /// Entries past their TTL that no sweep or lookup has removed yet
    pub expired_entries: usize,
    pub entries_by_kind: HashMap<DataKind, usize>,
    pub oldest_entry_at: Option<DateTime<Utc>>,
}
