//! Auto-sync scheduling
//!
//! Pure functions that can be tested without threads.

use std::time::Duration;

use crate::config::SyncConfig;

/// Delay before retrying after `failures` consecutive failed drains.
///
/// Doubles from `initial` per failure and never exceeds `max`.
pub fn backoff_delay(failures: u32, initial: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures - 1);
    initial.saturating_mul(factor).min(max)
}

/// How long the auto-sync loop sleeps before its next drain attempt
pub fn next_drain_delay(failures: u32, interval: Duration, config: &SyncConfig) -> Duration {
    if failures == 0 {
        interval
    } else {
        backoff_delay(
            failures,
            Duration::from_secs(config.backoff_initial_secs),
            Duration::from_secs(config.backoff_max_secs),
        )
    }
}
