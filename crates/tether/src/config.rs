//! Configuration for the offline cache and sync subsystem
//!
//! Supports loading configuration from (in order of priority):
//! 1. An explicit JSON file
//! 2. `tether.json` in the shared Tether config directory
//! 3. Built-in defaults
//!
//! Environment variables are applied on top of whichever source was used.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::MergePolicy;

/// Config filename in the Tether config directory
const CONFIG_FILE: &str = "tether.json";

/// Environment variable overriding the entry store directory
const ENV_CACHE_DIR: &str = "TETHER_CACHE_DIR";
/// Environment variable overriding the entry store budget, in megabytes
const ENV_CACHE_BUDGET_MB: &str = "TETHER_CACHE_BUDGET_MB";
/// Environment variable overriding the probe endpoints (comma separated)
const ENV_PROBE_ENDPOINTS: &str = "TETHER_PROBE_ENDPOINTS";

/// Invalid configuration. These indicate a defect in the caller's setup
/// rather than an environmental condition.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid probe endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Unknown data kind: {0}")]
    UnknownDataKind(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub connectivity: ConnectivityConfig,
    pub sync: SyncConfig,
}

/// Durable entry store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for the index and blobs (None = platform cache dir)
    pub dir: Option<PathBuf>,
    /// Size budget for all cached content, in bytes
    pub budget_bytes: u64,
    /// Usage fraction above which eviction starts
    pub evict_high_water: f64,
    /// Usage fraction eviction brings the store back down to
    pub evict_low_water: f64,
    /// zstd level for binary and opaque blobs
    pub compression_level: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            budget_bytes: 100 * 1024 * 1024,
            evict_high_water: 0.9,
            evict_low_water: 0.7,
            compression_level: 3,
        }
    }
}

/// In-process cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_size_bytes: usize,
    pub max_entries: usize,
    /// TTL applied when `set` is called without one
    pub default_ttl_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 16 * 1024 * 1024,
            max_entries: 10_000,
            default_ttl_secs: 300,
        }
    }
}

impl MemoryConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Reachability probing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// `host:port` for the raw TCP reachability check
    pub reachability_addr: String,
    pub reachability_timeout_ms: u64,
    /// HTTP endpoints hit on every probe cycle
    pub probe_endpoints: Vec<String>,
    pub probe_timeout_ms: u64,
    /// Mean latency above which the connection is `Limited`
    pub latency_threshold_ms: u64,
    pub check_interval_secs: u64,
    pub history_limit: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            reachability_addr: "1.1.1.1:53".to_string(),
            reachability_timeout_ms: 2_000,
            probe_endpoints: vec![
                "https://www.google.com/generate_204".to_string(),
                "https://cloudflare.com/cdn-cgi/trace".to_string(),
            ],
            probe_timeout_ms: 5_000,
            latency_threshold_ms: 3_000,
            check_interval_secs: 30,
            history_limit: 1_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Reject probe settings the monitor cannot run with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.probe_endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one probe endpoint is required".into()));
        }
        for endpoint in &self.probe_endpoints {
            validate_endpoint(endpoint)?;
        }
        match self.reachability_addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(ConfigError::InvalidEndpoint {
                    endpoint: self.reachability_addr.clone(),
                    reason: "expected host:port".into(),
                });
            }
        }
        if self.check_interval_secs == 0 || self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe interval and timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Sync queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory for the persisted queue (None = `<cache dir>/sync`)
    pub dir: Option<PathBuf>,
    pub max_retries: u32,
    pub auto_sync_interval_minutes: u64,
    pub history_limit: usize,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// Merge strategy per resource type; unlisted types use remote-wins
    pub merge_policies: HashMap<String, MergePolicy>,
    /// Numeric fields summed (rather than maxed) by the progress merge
    pub additive_fields: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let merge_policies = [
            ("progress", MergePolicy::Progress),
            ("user_progress", MergePolicy::Progress),
            ("settings", MergePolicy::RemoteWins),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            dir: None,
            max_retries: 3,
            auto_sync_interval_minutes: 15,
            history_limit: 1_000,
            backoff_initial_secs: 30,
            backoff_max_secs: 3_600,
            merge_policies,
            additive_fields: vec![
                "time_spent".to_string(),
                "time_spent_seconds".to_string(),
                "total_time_spent".to_string(),
            ],
        }
    }
}

impl SyncConfig {
    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_minutes * 60)
    }

    /// Merge policy for a resource type, falling back to remote-wins
    pub fn merge_policy(&self, resource_type: &str) -> MergePolicy {
        self.merge_policies
            .get(resource_type)
            .copied()
            .unwrap_or(MergePolicy::RemoteWins)
    }
}

impl TetherConfig {
    /// Load configuration from the shared config directory, falling back
    /// to defaults, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let base = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };

        Ok(base.with_env_overrides())
    }

    /// Load configuration from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::load_json_file(path)?;
        Ok(config.with_env_overrides())
    }

    /// Parse configuration from a JSON string (no environment overrides)
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse tether config JSON")
    }

    /// Apply `TETHER_*` environment variables
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
            self.cache.dir = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup(ENV_CACHE_BUDGET_MB) {
            match raw.trim().parse::<u64>() {
                Ok(mb) => self.cache.budget_bytes = mb * 1024 * 1024,
                Err(_) => log::warn!("[CONFIG] Ignoring invalid {}={}", ENV_CACHE_BUDGET_MB, raw),
            }
        }

        if let Some(raw) = lookup(ENV_PROBE_ENDPOINTS) {
            let endpoints: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !endpoints.is_empty() {
                self.connectivity.probe_endpoints = endpoints;
            }
        }

        self
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.cache.budget_bytes == 0 {
            return Err(ConfigError::Invalid("cache budget must be non-zero".into()));
        }
        let (low, high) = (self.cache.evict_low_water, self.cache.evict_high_water);
        if !(0.0 < low && low < high && high <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "eviction watermarks must satisfy 0 < low < high <= 1 (got {} / {})",
                low, high
            )));
        }
        if self.memory.max_size_bytes == 0 || self.memory.max_entries == 0 {
            return Err(ConfigError::Invalid("memory cache limits must be non-zero".into()));
        }

        self.connectivity.validate()?;

        if self.sync.max_retries == 0 {
            return Err(ConfigError::Invalid("sync max_retries must be at least 1".into()));
        }
        if self.sync.auto_sync_interval_minutes == 0 {
            return Err(ConfigError::Invalid("auto sync interval must be non-zero".into()));
        }

        Ok(())
    }

    /// Directory holding the entry store index and blobs
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache.dir {
            Some(dir) => Ok(dir.clone()),
            None => config::cache_dir()
                .map(|d| d.join("entries"))
                .context("Could not determine cache directory"),
        }
    }

    /// Directory holding the persisted sync queue
    pub fn sync_dir(&self) -> Result<PathBuf> {
        match &self.sync.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.cache_dir()?.join("sync")),
        }
    }
}

fn validate_endpoint(endpoint: &str) -> std::result::Result<(), ConfigError> {
    let parsed = url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TetherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.evict_high_water, 0.9);
        assert_eq!(config.cache.evict_low_water, 0.7);
        assert_eq!(config.connectivity.latency_threshold_ms, 3_000);
        assert_eq!(config.connectivity.probe_endpoints.len(), 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "cache": { "budget_bytes": 1024 }, "sync": { "max_retries": 5 } }"#;
        let config = TetherConfig::from_json(json).unwrap();

        assert_eq!(config.cache.budget_bytes, 1024);
        assert_eq!(config.cache.compression_level, 3);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.memory.max_entries, 10_000);
    }

    #[test]
    fn test_overrides() {
        let config = TetherConfig::default().with_overrides_from(|name| match name {
            "TETHER_CACHE_DIR" => Some("/tmp/tether-test".to_string()),
            "TETHER_CACHE_BUDGET_MB" => Some("8".to_string()),
            "TETHER_PROBE_ENDPOINTS" => Some("http://a.test/, http://b.test/".to_string()),
            _ => None,
        });

        assert_eq!(config.cache.dir, Some(PathBuf::from("/tmp/tether-test")));
        assert_eq!(config.cache.budget_bytes, 8 * 1024 * 1024);
        assert_eq!(
            config.connectivity.probe_endpoints,
            vec!["http://a.test/".to_string(), "http://b.test/".to_string()]
        );
    }

    #[test]
    fn test_invalid_budget_override_is_ignored() {
        let config = TetherConfig::default()
            .with_overrides_from(|name| (name == "TETHER_CACHE_BUDGET_MB").then(|| "lots".into()));
        assert_eq!(config.cache.budget_bytes, CacheConfig::default().budget_bytes);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TetherConfig::default();
        config.cache.budget_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = TetherConfig::default();
        config.connectivity.probe_endpoints = vec!["ftp://example.com".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));

        let mut config = TetherConfig::default();
        config.connectivity.reachability_addr = "no-port".to_string();
        assert!(config.validate().is_err());

        let mut config = TetherConfig::default();
        config.cache.evict_low_water = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_policy_fallback() {
        let config = SyncConfig::default();
        assert_eq!(config.merge_policy("progress"), MergePolicy::Progress);
        assert_eq!(config.merge_policy("anything-else"), MergePolicy::RemoteWins);
    }

    #[test]
    fn test_sync_dir_defaults_under_cache_dir() {
        let mut config = TetherConfig::default();
        config.cache.dir = Some(PathBuf::from("/data/cache"));
        assert_eq!(config.sync_dir().unwrap(), PathBuf::from("/data/cache/sync"));
    }
}
