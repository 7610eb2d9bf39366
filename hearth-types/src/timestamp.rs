//! Hybrid Logical Clock timestamps used as `updated_at` on records.
//!
//! The remote store stamps every accepted write with a timestamp strictly
//! greater than the one it replaces, so last-write-wins comparisons stay
//! meaningful even when two writes land in the same millisecond.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// A Hybrid Logical Clock timestamp.
///
/// - `wall_time`: milliseconds since the Unix epoch
/// - `logical`: counter ordering events within the same millisecond
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    wall_time: u64,
    logical: u32,
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl HybridTimestamp {
    /// The smallest possible timestamp.
    pub const ZERO: Self = Self::new(0, 0);

    /// Creates a timestamp at the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            wall_time: wall_clock_millis(),
            logical: 0,
        }
    }

    /// Creates a timestamp from components.
    #[must_use]
    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    #[must_use]
    pub const fn wall_time(&self) -> u64 {
        self.wall_time
    }

    #[must_use]
    pub const fn logical(&self) -> u32 {
        self.logical
    }

    /// Returns the next timestamp after `self`, never going backwards even
    /// if the wall clock did.
    #[must_use]
    pub fn tick(&self) -> Self {
        let now = wall_clock_millis();
        if now > self.wall_time {
            Self {
                wall_time: now,
                logical: 0,
            }
        } else {
            Self {
                wall_time: self.wall_time,
                logical: self.logical.saturating_add(1),
            }
        }
    }

    /// Merges a timestamp observed from elsewhere, producing one greater than
    /// both `self` and `other`.
    #[must_use]
    pub fn receive(&self, other: &Self) -> Self {
        let now = wall_clock_millis();
        let max_wall = now.max(self.wall_time).max(other.wall_time);

        let logical = if max_wall == self.wall_time && max_wall == other.wall_time {
            self.logical.max(other.logical).saturating_add(1)
        } else if max_wall == self.wall_time {
            self.logical.saturating_add(1)
        } else if max_wall == other.wall_time {
            other.logical.saturating_add(1)
        } else {
            0
        };

        Self {
            wall_time: max_wall,
            logical,
        }
    }

    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self < other
    }

    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self > other
    }
}

impl Default for HybridTimestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_time
            .cmp(&other.wall_time)
            .then(self.logical.cmp(&other.logical))
    }
}
