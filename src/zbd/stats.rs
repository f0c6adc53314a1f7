//! Device-wide counters
//!
//! Lock-free accounting updated by the write path and the cleaner; a
//! consistent [`ZbdStatsSnapshot`] can be taken at any time for logging or
//! export.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for the zone management core.
#[derive(Debug, Default)]
pub struct ZbdStats {
    /// Total payload bytes recorded through the write path.
    pub wr_data: AtomicU64,
    /// Watermark of `wr_data` at the last rotation; the delta between the
    /// two is the write volume since the previous observation.
    pub last_wr_data: AtomicU64,
    /// Zone-cleaning passes run.
    pub zc_count: AtomicU64,
    /// Zones reset (housekeeping and cleaning combined).
    pub reset_count: AtomicU64,
    /// Bytes copied while evacuating live extents.
    pub gc_copied_bytes: AtomicU64,
    /// Allocation requests that found no zone.
    pub alloc_failures: AtomicU64,
}

impl ZbdStats {
    /// Record payload bytes accepted by the write path.
    pub fn record_written(&self, bytes: u64) {
        self.wr_data.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes written since the last rotation, advancing the watermark.
    pub fn take_write_delta(&self) -> u64 {
        let current = self.wr_data.load(Ordering::Relaxed);
        let last = self.last_wr_data.swap(current, Ordering::Relaxed);
        current.saturating_sub(last)
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> ZbdStatsSnapshot {
        ZbdStatsSnapshot {
            wr_data: self.wr_data.load(Ordering::Relaxed),
            zc_count: self.zc_count.load(Ordering::Relaxed),
            reset_count: self.reset_count.load(Ordering::Relaxed),
            gc_copied_bytes: self.gc_copied_bytes.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ZbdStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZbdStatsSnapshot {
    pub wr_data: u64,
    pub zc_count: u64,
    pub reset_count: u64,
    pub gc_copied_bytes: u64,
    pub alloc_failures: u64,
}
