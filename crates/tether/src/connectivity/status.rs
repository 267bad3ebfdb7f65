//! Connection status, change events and quality scoring

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Window for quality and latency averages
pub const QUALITY_WINDOW_MINUTES: i64 = 10;
/// Window for counting status changes
pub const STABILITY_WINDOW_MINUTES: i64 = 60;
/// Stability points lost per status change in the window
const STABILITY_PENALTY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
    /// Reachable, but slow or partially failing
    Limited,
    #[default]
    Unknown,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Limited => "limited",
            ConnectionStatus::Unknown => "unknown",
        }
    }

    /// Online or Limited
    pub fn is_reachable(&self) -> bool {
        matches!(self, ConnectionStatus::Online | ConnectionStatus::Limited)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition. Only emitted when the status actually changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub old_status: ConnectionStatus,
    pub new_status: ConnectionStatus,
    /// Mean probe latency of the cycle that caused the transition
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionQuality {
    pub status: ConnectionStatus,
    /// Share of recent events that were transitions into Online, 0-100
    pub quality: u8,
    pub avg_latency_ms: Option<f64>,
    /// 100 minus a penalty per recent status change, 0-100
    pub stability: u8,
}

/// Score connection quality from event history and latency samples
pub fn assess_quality<'a>(
    status: ConnectionStatus,
    events: impl IntoIterator<Item = &'a ConnectionEvent>,
    latencies: impl IntoIterator<Item = &'a (DateTime<Utc>, u64)>,
    now: DateTime<Utc>,
) -> ConnectionQuality {
    let quality_since = now - Duration::minutes(QUALITY_WINDOW_MINUTES);
    let stability_since = now - Duration::minutes(STABILITY_WINDOW_MINUTES);

    let mut recent = 0u32;
    let mut recent_online = 0u32;
    let mut changes = 0u32;

    for event in events {
        if event.timestamp >= stability_since {
            changes += 1;
        }
        if event.timestamp >= quality_since {
            recent += 1;
            if event.new_status == ConnectionStatus::Online {
                recent_online += 1;
            }
        }
    }

    let quality = match (recent, status) {
        (0, ConnectionStatus::Online) => 100,
        (0, _) => 0,
        (n, _) => (recent_online * 100 / n) as u8,
    };

    let stability = 100u32.saturating_sub(STABILITY_PENALTY.saturating_mul(changes)) as u8;

    let (sum, count) = latencies
        .into_iter()
        .filter(|(at, _)| *at >= quality_since)
        .fold((0u64, 0u64), |(sum, count), (_, ms)| (sum + ms, count + 1));

    ConnectionQuality {
        status,
        quality,
        avg_latency_ms: (count > 0).then(|| sum as f64 / count as f64),
        stability,
    }
}
