//! Configuration for the sync engine and its components.
//!
//! Durations are stored as integer milliseconds so the whole tree can be
//! loaded from JSON app settings.

use hearth_types::kinds::DEFAULT_SHAREABLE_COLLECTIONS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryConfig,
    pub reachability: ReachabilityConfig,
    pub queue: QueueConfig,
    pub channel: ChannelConfig,
    pub status: StatusConfig,
    pub sharing: SharingConfig,
}

/// Backoff and timeout settings shared by every remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry (ms).
    pub base_delay_ms: u64,
    /// Upper bound for any single delay (ms).
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the base delay.
    pub jitter_ratio: f64,
    /// Timeout for a single attempt (ms).
    pub attempt_timeout_ms: u64,
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.3,
            attempt_timeout_ms: 15_000,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// How long a new connectivity state must hold before it is published (ms).
    pub stability_window_ms: u64,
    /// State assumed before the platform reports anything.
    pub initially_online: bool,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            stability_window_ms: 1_500,
            initially_online: true,
        }
    }
}

/// Lower bound for the reachability stability window (ms).
pub const MIN_STABILITY_WINDOW_MS: u64 = 1_000;

impl ReachabilityConfig {
    /// The configured window, never shorter than [`MIN_STABILITY_WINDOW_MS`].
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms.max(MIN_STABILITY_WINDOW_MS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Safety-net drain period (ms).
    pub drain_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 60_000,
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Consecutive reconnect failures before a side is reported degraded.
    pub max_reconnect_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// How long succeeded/failed entries stay queryable (ms).
    pub retention_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            retention_ms: 10 * 60 * 1_000,
        }
    }
}

impl StatusConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Collections whose records follow a collaboration grant.
    pub shareable_collections: Vec<String>,
    /// Also share the invitee's library with the inviter.
    pub bidirectional: bool,
    /// Roll back the whole acceptance when any record set cannot be shared.
    pub atomic_propagation: bool,
    /// Pause between reconciliation rounds (ms).
    pub reconciliation_interval_ms: u64,
    /// Rounds before a reconciliation task gives up.
    pub max_reconciliation_rounds: u32,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            shareable_collections: DEFAULT_SHAREABLE_COLLECTIONS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            bidirectional: true,
            atomic_propagation: false,
            reconciliation_interval_ms: 30_000,
            max_reconciliation_rounds: 10,
        }
    }
}

impl SharingConfig {
    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }
}
