//! Tunables for the sync layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sync layer configuration. Every field has a default, so hosts can embed a
/// partial `[sync]` table in their own config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on concurrent gateway calls within one wave of a pass.
    pub max_concurrency: usize,
    /// Per-call timeout. Expiry counts as a transient failure.
    pub request_timeout_ms: u64,
    /// First backoff step after a transient failure.
    pub backoff_base_secs: u64,
    /// Backoff stops doubling after this many failures.
    pub backoff_max_exponent: u32,
    /// Safety-net pass cadence in case a reconnect edge is missed. `None`
    /// disables the timer.
    pub periodic_interval_secs: Option<u64>,
    /// Kick the background runner after every local write made while online.
    pub sync_on_write: bool,
}

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MAX_EXPONENT: u32 = 8;
pub const DEFAULT_PERIODIC_INTERVAL_SECS: u64 = 45;

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_exponent: DEFAULT_BACKOFF_MAX_EXPONENT,
            periodic_interval_secs: Some(DEFAULT_PERIODIC_INTERVAL_SECS),
            sync_on_write: true,
        }
    }
}

impl SyncConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Delay before the next attempt after `attempts` consecutive transient
    /// failures: `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(self.backoff_max_exponent).min(30);
        let secs = self.backoff_base_secs.saturating_mul(1_u64 << exponent);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
    }
}
