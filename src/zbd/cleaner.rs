//! Zone cleaning (garbage collection)
//!
//! Reclaims space by evacuating the still-valid extents out of
//! heavily-invalidated zones into the reserved pool, then resetting the
//! victims:
//!
//! ```text
//!   victim (io pool)                     destination (reserved pool)
//! ┌──────────────────────┐             ┌──────────────────────┐
//! │ ████ dead ████ live ─┼── copy ───► │ live                 │
//! │ ██ dead ██ live ─────┼── copy ───► │ live                 │
//! └──────────────────────┘             └──────────────────────┘
//!          │ reset                      file extent lists and the
//!          ▼                            file→zone map are rewritten
//!   empty, joins reserved pool          to point at the destination
//! ```
//!
//! Victims are ranked by invalid bytes, most garbage first. After a pass the
//! reserved pool is rebalanced back to its target size from empty io zones.

use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};

use super::buffer::AlignedBuf;
use super::device::{ZonedBlockDevice, RESERVED_FOR_CLEANING};
use super::zone::{block_align, Zone, ZoneExtent};

/// A cleaning candidate: max-heap entry ordered by invalid bytes, ties going
/// to the lower zone id.
pub(crate) struct GcVictim {
    zone: Arc<Zone>,
    invalid_bytes: u64,
}

impl GcVictim {
    pub(crate) fn new(zone: Arc<Zone>, invalid_bytes: u64) -> Self {
        Self { zone, invalid_bytes }
    }

    pub(crate) fn invalid_bytes(&self) -> u64 {
        self.invalid_bytes
    }

    fn into_zone(self) -> Arc<Zone> {
        self.zone
    }
}

impl PartialEq for GcVictim {
    fn eq(&self, other: &Self) -> bool {
        self.invalid_bytes == other.invalid_bytes && self.zone.id() == other.zone.id()
    }
}

impl Eq for GcVictim {}

impl PartialOrd for GcVictim {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcVictim {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.invalid_bytes
            .cmp(&other.invalid_bytes)
            .then_with(|| other.zone.id().cmp(&self.zone.id()))
    }
}

impl ZonedBlockDevice {
    /// Run a cleaning pass over the io pool, resetting up to `nr_reset`
    /// victims. `nr_reset == 0` instead returns one reserved zone to the io
    /// pool, trimming the reserve when cleaning is not needed. Returns the
    /// number of zones reset.
    pub fn zone_cleaning(&self, nr_reset: usize) -> usize {
        let mut io = self.io_zones.lock();
        let (mut queue, _total_invalid) = self.build_gc_queue(&io);
        self.zone_cleaning_with(&mut io, &mut queue, nr_reset)
    }

    /// Cleaning entry point for callers already holding the io pool.
    pub(crate) fn zone_cleaning_with(
        &self,
        io: &mut Vec<Arc<Zone>>,
        queue: &mut BinaryHeap<GcVictim>,
        nr_reset: usize,
    ) -> usize {
        let _cleaning_guard = self.zone_cleaning_mtx.lock();
        self.zc_in_progress.store(true, Ordering::SeqCst);
        let reset = self.run_zone_cleaning(io, queue, nr_reset);
        self.zc_in_progress.store(false, Ordering::SeqCst);
        reset
    }

    fn run_zone_cleaning(
        &self,
        io: &mut Vec<Arc<Zone>>,
        queue: &mut BinaryHeap<GcVictim>,
        nr_reset: usize,
    ) -> usize {
        if nr_reset == 0 {
            let mut reserved = self.reserved_zones.lock();
            if !reserved.is_empty() {
                io.push(reserved.remove(0));
            }
            return 0;
        }

        let mut reset = 0usize;
        let mut copied_bytes = 0u64;

        while let Some(victim) = queue.pop() {
            debug!(
                zone = victim.zone.id(),
                invalid_bytes = victim.invalid_bytes(),
                "cleaning victim zone"
            );
            let victim = victim.into_zone();
            let victim_id = victim.id();

            let mut evacuation_failed = false;
            for extent in victim.valid_extents() {
                if !self.evacuate_extent(io, &victim, &extent, &mut copied_bytes) {
                    evacuation_failed = true;
                    break;
                }
            }
            if evacuation_failed {
                warn!(zone = victim_id, "victim left in place after failed evacuation");
                continue;
            }

            debug_assert!(!victim.open_for_write());
            victim.store_used(0);
            self.purge_zone_mapping(&victim);
            if let Err(e) = victim.reset() {
                warn!(zone = victim_id, error = %e, "failed resetting cleaned zone");
            }
            self.notify_io_zone_full();
            self.stats().reset_count.fetch_add(1, Ordering::Relaxed);
            reset += 1;

            {
                let mut reserved = self.reserved_zones.lock();
                if reserved.len() < RESERVED_FOR_CLEANING {
                    if let Some(pos) = io.iter().position(|z| z.id() == victim_id) {
                        reserved.push(io.remove(pos));
                    }
                }
            }

            if reset >= nr_reset {
                break;
            }
        }

        self.rebalance_reserved(io);

        self.stats().zc_count.fetch_add(1, Ordering::Relaxed);
        self.stats()
            .gc_copied_bytes
            .fetch_add(copied_bytes, Ordering::Relaxed);
        #[cfg(feature = "experiment")]
        tracing::info!(copied_bytes, "total copied data in zone cleaning");

        reset
    }

    /// Copy one live extent out of `victim` into reserved zones, splicing
    /// the file's extent list and the file→zone map to the new location.
    /// Returns false if the extent could not be moved; the victim must then
    /// be left in place.
    fn evacuate_extent(
        &self,
        io: &mut Vec<Arc<Zone>>,
        victim: &Arc<Zone>,
        extent: &Arc<ZoneExtent>,
        copied_bytes: &mut u64,
    ) -> bool {
        let victim_id = victim.id();
        let Some(file) = self.file(extent.file_id()) else {
            warn!(
                zone = victim_id,
                extent = extent.id(),
                file = extent.file_id(),
                "live extent owned by unregistered file"
            );
            return false;
        };

        // Extent boundaries stay stable for the whole relocation.
        let mut file_extents = file.extents.write();

        let valid_size = extent.length();
        let data_size = block_align(valid_size, self.block_size());
        let pad = data_size - valid_size;

        let mut buf = match AlignedBuf::zeroed(data_size as usize, self.block_size() as usize) {
            Ok(buf) => buf,
            Err(e) => {
                error!(error = %e, "failed allocating aligned copy buffer");
                return false;
            }
        };
        if let Err(e) = self.read_extent_payload(extent, &mut buf[..valid_size as usize]) {
            error!(
                zone = victim_id,
                extent = extent.id(),
                error = %e,
                "failed reading extent payload"
            );
            return false;
        }

        let mut dest = self.allocate_zone_for_cleaning();
        let mut left = data_size;
        let mut offset = 0u64;
        let mut new_extents: Vec<Arc<ZoneExtent>> = Vec::new();

        loop {
            let cap = dest.capacity_left();
            if left <= cap {
                if let Err(e) = dest.append(&buf[offset as usize..(offset + left) as usize]) {
                    error!(zone = dest.id(), error = %e, "copy append failed");
                    dest.set_open_for_write(false);
                    self.notify_io_zone_closed();
                    return false;
                }
                let segment_valid = left - pad;
                let new_extent =
                    self.attach_extent(&file, &dest, dest.wp() - left, segment_valid);
                new_extents.push(new_extent);
                *copied_bytes += left;
                dest.set_open_for_write(false);
                self.notify_io_zone_closed();
                break;
            }

            // The destination cannot hold the whole extent: fill it, finish
            // it, move it into the io pool and continue on a fresh reserved
            // zone.
            if cap > 0 {
                if let Err(e) = dest.append(&buf[offset as usize..(offset + cap) as usize]) {
                    error!(zone = dest.id(), error = %e, "copy append failed");
                    dest.set_open_for_write(false);
                    self.notify_io_zone_closed();
                    return false;
                }
                let new_extent = self.attach_extent(&file, &dest, dest.wp() - cap, cap);
                new_extents.push(new_extent);
                *copied_bytes += cap;
                left -= cap;
                offset += cap;
            }
            dest.set_open_for_write(false);
            self.notify_io_zone_closed();
            if let Err(e) = dest.finish() {
                warn!(zone = dest.id(), error = %e, "failed finishing filled destination");
            }
            self.notify_io_zone_full();
            {
                let mut reserved = self.reserved_zones.lock();
                if let Some(pos) = reserved.iter().position(|z| z.id() == dest.id()) {
                    io.push(reserved.remove(pos));
                }
            }
            dest = self.allocate_zone_for_cleaning();
        }

        // The old record is dead; the destination records carry the bytes.
        extent.invalidate();
        victim.sub_used(valid_size);

        if let Some(pos) = file_extents.iter().position(|e| e.id() == extent.id()) {
            file_extents.splice(pos..pos + 1, new_extents.iter().cloned());
        } else {
            warn!(
                file = file.id(),
                extent = extent.id(),
                "relocated extent missing from file extent list"
            );
        }

        {
            let mut sst = self.sst_to_zone.lock();
            if let Some(zones) = sst.get_mut(&file.id()) {
                if let Some(pos) = zones.iter().position(|&zid| zid == victim_id) {
                    zones.remove(pos);
                }
            }
        }
        true
    }

    fn read_extent_payload(&self, extent: &ZoneExtent, buf: &mut [u8]) -> Result<()> {
        if let Ok(n) = self.backend().pread(buf, extent.start()) {
            if n == buf.len() {
                return Ok(());
            }
        }
        let n = self.backend().pread_direct(buf, extent.start())?;
        if n != buf.len() {
            return Err(Error::io(format!(
                "short read of extent at {}: {} of {} bytes",
                extent.start(),
                n,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Restore the reserved pool to its target: expel anything written or
    /// used, refill from empty io zones, trim any excess back.
    fn rebalance_reserved(&self, io: &mut Vec<Arc<Zone>>) {
        let mut reserved = self.reserved_zones.lock();

        let mut idx = 0;
        while idx < reserved.len() {
            if !reserved[idx].is_empty() || reserved[idx].is_used() {
                io.push(reserved.remove(idx));
            } else {
                idx += 1;
            }
        }

        if reserved.len() < RESERVED_FOR_CLEANING {
            let mut idx = 0;
            while idx < io.len() && reserved.len() < RESERVED_FOR_CLEANING {
                if io[idx].is_empty() && !io[idx].open_for_write() {
                    reserved.push(io.remove(idx));
                } else {
                    idx += 1;
                }
            }
        }

        while reserved.len() > RESERVED_FOR_CLEANING {
            let zone = reserved.pop().expect("len checked above");
            debug_assert!(zone.is_empty() && !zone.open_for_write());
            io.push(zone);
        }
    }
}
