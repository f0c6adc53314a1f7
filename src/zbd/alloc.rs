//! Write-target allocation
//!
//! Picks the zone a new SSTable is written into, given the file's lifetime
//! hint, key range and LSM level. Selection is serialized on the io-zone
//! lock and gated on the device's open-zone limit; when free space runs low
//! the allocator triggers zone cleaning before (pre-emptive) or after
//! (forced) looking for a target.
//!
//! Placement preference order:
//!
//! 1. first writer on an empty device takes the lowest empty zone
//! 2. zones already holding key-overlapping files, best overlap first
//! 3. zones with the most level-0 data, for level-0 or unlevelled writes
//! 4. any empty zone, if the active limit allows
//! 5. zones of same-level files that neighbour the new key range
//! 6. the partially-filled zone with the closest lifetime hint

use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::cleaner::GcVictim;
use super::device::{ZonedBlockDevice, RESERVED_FOR_CLEANING};
use super::host::{InternalKey, InternalKeyComparator, NO_LEVEL_INFO};
use super::zone::{lifetime_diff, Zone, WriteLifetimeHint, LIFETIME_DIFF_NOT_GOOD};
use super::{FileId, ZoneId};

/// Free-space ratio (percent) at or below which allocation triggers
/// pre-emptive cleaning.
const GC_TRIGGER_FREE_RATIO: f64 = 25.0;

impl ZonedBlockDevice {
    /// Return a metadata zone free for writing, resetting a non-empty unused
    /// one first. `None` when every meta zone is in use.
    pub fn allocate_meta_zone(&self) -> Option<Arc<Zone>> {
        for zone in self.meta_zones() {
            if zone.is_used() {
                continue;
            }
            if !zone.is_empty() {
                if let Err(e) = zone.reset() {
                    warn!(zone = zone.id(), error = %e, "failed resetting meta zone");
                    continue;
                }
            }
            return Some(zone.clone());
        }
        None
    }

    /// Reset every io zone whose extents have all been invalidated.
    pub fn reset_unused_io_zones(&self) {
        let io = self.io_zones.lock();
        for zone in io.iter() {
            if zone.is_used() || zone.is_empty() {
                continue;
            }
            if !zone.is_full() {
                self.notify_io_zone_full();
            }
            self.purge_zone_mapping(zone);
            if let Err(e) = zone.reset() {
                warn!(zone = zone.id(), error = %e, "failed resetting zone");
                continue;
            }
            self.stats().reset_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Choose and open a zone for a new file write.
    ///
    /// Blocks until an open-zone slot is available, does a housekeeping pass
    /// over the io pool, cleans pre-emptively when free space is low, then
    /// works through the placement preferences. On success the returned zone
    /// is exclusively held (`open_for_write`) until the writer calls
    /// [`Zone::close_wr`]. Returns `None` only when no zone can be produced
    /// even after forced cleaning.
    pub fn allocate_zone(
        &self,
        file_lifetime: WriteLifetimeHint,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: i32,
    ) -> Option<Arc<Zone>> {
        let mut io = self.io_zones.lock();

        self.wait_for_open_io_zone();

        self.housekeep_io_zones(&io);

        #[cfg(not(feature = "lazy"))]
        self.maybe_preemptive_clean(&mut io);

        // A device with no SSTables yet: take the lowest empty zone and
        // stamp the file's lifetime on it.
        if self.sst_to_zone.lock().is_empty() {
            if let Some(zone) = self.take_empty_zone(&io, file_lifetime) {
                return Some(self.commit_allocation(zone));
            }
        }

        if let Some(zone) = self.select_target_zone(&io, file_lifetime, smallest, largest, level) {
            return Some(self.commit_allocation(zone));
        }

        // Nothing fits: clean, then retry the selection once.
        let (mut queue, total_invalid) = self.build_gc_queue(&io);
        let one_zone = io.first().map(|z| z.max_capacity()).unwrap_or(0);
        let nr_to_reset = if total_invalid < one_zone {
            // Cleaning could not free a whole zone; just trim the reserve.
            0
        } else {
            RESERVED_FOR_CLEANING
        };
        self.zone_cleaning_with(&mut io, &mut queue, nr_to_reset);

        if let Some(zone) = self.select_target_zone(&io, file_lifetime, smallest, largest, level) {
            return Some(self.commit_allocation(zone));
        }

        self.stats()
            .alloc_failures
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        drop(io);
        self.log_zone_stats();
        None
    }

    /// Admission-gated handle on the head of the reserved pool, used as the
    /// copy target during cleaning. The reserved pool being empty means the
    /// cleaner's refill invariant was broken; nothing sensible can continue
    /// from there.
    pub fn allocate_zone_for_cleaning(&self) -> Arc<Zone> {
        self.wait_for_open_io_zone();

        let zone = self.reserved_zones.lock().first().cloned();
        let Some(zone) = zone else {
            tracing::error!("reserved zone pool drained during zone cleaning");
            std::process::abort();
        };
        debug_assert!(!zone.open_for_write());
        zone.set_open_for_write(true);
        self.open_io_zones
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        zone
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn commit_allocation(&self, zone: Arc<Zone>) -> Arc<Zone> {
        debug_assert!(!zone.open_for_write());
        zone.set_open_for_write(true);
        self.open_io_zones
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        debug!(zone = zone.id(), wp = zone.wp(), "allocated io zone");
        zone
    }

    /// Reset fully-invalidated zones and finish zones whose remaining
    /// capacity fell below the finish threshold, releasing their active
    /// slots.
    fn housekeep_io_zones(&self, io: &[Arc<Zone>]) {
        for zone in io {
            if zone.open_for_write() || zone.is_empty() || (zone.is_full() && zone.is_used()) {
                continue;
            }

            if !zone.is_used() {
                // Every extent was invalidated; reclaim the zone now.
                if !zone.is_full() {
                    self.notify_io_zone_full();
                }
                self.purge_zone_mapping(zone);
                if let Err(e) = zone.reset() {
                    warn!(zone = zone.id(), error = %e, "failed resetting zone");
                } else {
                    self.stats()
                        .reset_count
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                continue;
            }

            if zone.capacity_left() < zone.max_capacity() * self.finish_threshold / 100 {
                if let Err(e) = zone.finish() {
                    warn!(zone = zone.id(), error = %e, "failed finishing zone");
                }
                self.notify_io_zone_full();
            }
        }
    }

    /// Clean ahead of need once the free-space ratio falls to the trigger,
    /// with a budget that grows as the ratio shrinks.
    #[cfg(not(feature = "lazy"))]
    fn maybe_preemptive_clean(&self, io: &mut Vec<Arc<Zone>>) {
        let Some(first) = io.first() else { return };
        let total = io.len() as u64 * first.max_capacity();
        if total == 0 {
            return;
        }
        let free: u64 = io.iter().map(|z| z.capacity_left()).sum();
        let free_ratio = free as f64 / total as f64 * 100.0;
        if free_ratio > GC_TRIGGER_FREE_RATIO {
            return;
        }

        let nr_zones = io.len();
        let nr_to_reset = if free_ratio > 25.0 {
            nr_zones / 15
        } else if free_ratio >= 20.0 {
            nr_zones / 10
        } else {
            nr_zones / 5
        };
        debug!(
            free_ratio,
            budget = nr_to_reset,
            "free space low, cleaning pre-emptively"
        );
        let (mut queue, _) = self.build_gc_queue(io);
        self.zone_cleaning_with(io, &mut queue, nr_to_reset);
    }

    /// Rank io zones by invalid bytes for victim selection. Also returns the
    /// total invalid bytes across the pool.
    pub(crate) fn build_gc_queue(&self, io: &[Arc<Zone>]) -> (BinaryHeap<GcVictim>, u64) {
        let mut queue = BinaryHeap::new();
        let mut total_invalid = 0u64;
        for zone in io {
            // Extent boundaries are stable once no append is in flight; a
            // zone has a single writer so the wait is bounded.
            zone.wait_append_idle();
            let (_valid, invalid) = zone.padded_extent_lengths();
            if invalid > 0 && !zone.open_for_write() {
                total_invalid += invalid;
                queue.push(GcVictim::new(zone.clone(), invalid));
            }
        }
        (queue, total_invalid)
    }

    /// Steps 5–9 of the placement policy, in order. Pure selection: the only
    /// state change is stamping lifetime/active on an empty-zone fallback.
    fn select_target_zone(
        &self,
        io: &[Arc<Zone>],
        file_lifetime: WriteLifetimeHint,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: i32,
    ) -> Option<Arc<Zone>> {
        let host = self.host();

        // Colocate with key-overlapping files, best overlap ratio first.
        if let Some(host) = &host {
            let comparator = host.comparator();
            let mut overlapping = host.all_overlapping_files(smallest, largest);
            if !overlapping.is_empty() {
                self.rank_by_overlap(&mut overlapping, smallest, largest, comparator.as_ref());
                if let Some(zone) = self.pick_zone_of_files(&overlapping) {
                    return Some(zone);
                }
            }
            // No overlap target. Level-0 files are compacted together, so
            // writes without better information go where L0 already lives.
            if level == 0 || level == NO_LEVEL_INFO {
                let l0_files = host.same_level_file_list(0);
                let zone_ids = self.zone_ids_of_files(&l0_files);
                if let Some(zone) = self.pick_most_l0_zone(&zone_ids) {
                    return Some(zone);
                }
            }
        }

        if let Some(zone) = self.take_empty_zone(io, file_lifetime) {
            return Some(zone);
        }

        if let Some(host) = &host {
            if level != NO_LEVEL_INFO {
                let same_level = host.same_level_file_list(level);
                if let Some(zone) = self.allocate_with_same_level_files(
                    &same_level,
                    smallest,
                    largest,
                    host.comparator().as_ref(),
                ) {
                    return Some(zone);
                }
            }
        }

        // Fill an already-written zone with the best lifetime match.
        let mut best: Option<Arc<Zone>> = None;
        let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
        for zone in io {
            if !zone.open_for_write() && zone.used() > 0 && !zone.is_full() {
                let diff = lifetime_diff(zone.lifetime(), file_lifetime);
                if diff <= best_diff {
                    best = Some(zone.clone());
                    best_diff = diff;
                }
            }
        }
        best
    }

    /// Lowest empty, unheld zone if the active limit allows, stamped with
    /// the file's lifetime.
    fn take_empty_zone(
        &self,
        io: &[Arc<Zone>],
        file_lifetime: WriteLifetimeHint,
    ) -> Option<Arc<Zone>> {
        if self.active_io_zone_count() >= self.max_nr_active_io_zones() {
            return None;
        }
        let zone = io
            .iter()
            .find(|z| !z.open_for_write() && z.is_empty())?
            .clone();
        zone.set_lifetime(file_lifetime);
        self.active_io_zones
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Some(zone)
    }

    /// Order `files` by how much of each file's own key range the new range
    /// covers, descending; ties break on file id.
    fn rank_by_overlap(
        &self,
        file_ids: &mut Vec<FileId>,
        smallest: &InternalKey,
        largest: &InternalKey,
        comparator: &dyn InternalKeyComparator,
    ) {
        use std::cmp::Ordering as CmpOrdering;

        let files = self.files.lock();
        let mut ratios: Vec<(FileId, f64)> = Vec::with_capacity(file_ids.len());
        for &fid in file_ids.iter() {
            let Some(file) = files.get(&fid) else {
                continue;
            };
            let over_min = if comparator.compare(file.smallest(), smallest) == CmpOrdering::Less {
                smallest
            } else {
                file.smallest()
            };
            let over_max = if comparator.compare(file.largest(), largest) == CmpOrdering::Greater {
                largest
            } else {
                file.largest()
            };
            let own_width = comparator.user_key_width(file.smallest(), file.largest());
            let overlap_width = comparator.user_key_width(over_min, over_max);
            let ratio = if own_width <= 0.0 {
                1.0
            } else {
                overlap_width / own_width
            };
            ratios.push((fid, ratio));
        }
        drop(files);

        ratios.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        *file_ids = ratios.into_iter().map(|(fid, _)| fid).collect();
    }

    /// First non-full, unheld zone among the zones of `file_ids`, preserving
    /// the given file preference order.
    fn pick_zone_of_files(&self, file_ids: &[FileId]) -> Option<Arc<Zone>> {
        let sst = self.sst_to_zone.lock();
        for fid in file_ids {
            let Some(zone_ids) = sst.get(fid) else {
                continue;
            };
            for &zid in zone_ids {
                let Some(zone) = self.zone_by_id(zid) else {
                    continue;
                };
                if !zone.is_full() && !zone.open_for_write() {
                    return Some(zone);
                }
            }
        }
        None
    }

    fn zone_ids_of_files(&self, file_ids: &[FileId]) -> std::collections::BTreeSet<ZoneId> {
        let sst = self.sst_to_zone.lock();
        let mut ids = std::collections::BTreeSet::new();
        for fid in file_ids {
            if let Some(zone_ids) = sst.get(fid) {
                ids.extend(zone_ids.iter().copied());
            }
        }
        ids
    }

    /// Among `zone_ids`, the writable zone holding the most valid level-0
    /// bytes.
    fn pick_most_l0_zone(
        &self,
        zone_ids: &std::collections::BTreeSet<ZoneId>,
    ) -> Option<Arc<Zone>> {
        let mut max = 0u64;
        let mut best: Option<Arc<Zone>> = None;
        for &zid in zone_ids {
            let Some(zone) = self.zone_by_id(zid) else {
                continue;
            };
            if zone.open_for_write() || zone.is_full() {
                continue;
            }
            let l0_bytes: u64 = zone
                .extent_snapshot()
                .iter()
                .filter(|e| e.level() == 0 && e.is_valid())
                .map(|e| e.length())
                .sum();
            if l0_bytes >= max {
                max = l0_bytes;
                best = Some(zone);
            }
        }
        best
    }

    /// Colocate with a same-level neighbour: find where the new range sorts
    /// within the level and walk outward from the insertion point,
    /// alternating sides. At the edges the walk only goes inward.
    fn allocate_with_same_level_files(
        &self,
        file_ids: &[FileId],
        _smallest: &InternalKey,
        largest: &InternalKey,
        comparator: &dyn InternalKeyComparator,
    ) -> Option<Arc<Zone>> {
        use std::cmp::Ordering as CmpOrdering;

        if file_ids.is_empty() {
            return None;
        }
        if file_ids.len() == 1 {
            return self.pick_zone_of_files(&file_ids[..1]);
        }

        // The first file whose range starts at or after the new range's end.
        let insert_at = {
            let files = self.files.lock();
            let mut at = file_ids.len();
            for (idx, fid) in file_ids.iter().enumerate() {
                let Some(file) = files.get(fid) else {
                    continue;
                };
                if comparator.compare(largest, file.smallest()) != CmpOrdering::Greater {
                    at = idx;
                    break;
                }
            }
            at
        };

        if insert_at == 0 {
            // New range sorts before the whole level; walk right.
            for fid in file_ids {
                if let Some(zone) = self.pick_zone_of_files(std::slice::from_ref(fid)) {
                    return Some(zone);
                }
            }
            return None;
        }
        if insert_at == file_ids.len() {
            // New range sorts after the whole level; walk left.
            for fid in file_ids.iter().rev() {
                if let Some(zone) = self.pick_zone_of_files(std::slice::from_ref(fid)) {
                    return Some(zone);
                }
            }
            return None;
        }

        let mut left = insert_at as i64 - 1;
        let mut right = insert_at;
        while left >= 0 || right < file_ids.len() {
            if left >= 0 {
                let fid = file_ids[left as usize];
                if let Some(zone) = self.pick_zone_of_files(&[fid]) {
                    return Some(zone);
                }
                left -= 1;
            }
            if right < file_ids.len() {
                let fid = file_ids[right];
                if let Some(zone) = self.pick_zone_of_files(&[fid]) {
                    return Some(zone);
                }
                right += 1;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zbd::device::DeviceOptions;
    use crate::zbd::host::LsmHost;
    use crate::zbd::mock::MockZbd;
    use std::cmp::Ordering as CmpOrdering;

    const ZONE_SIZE: u64 = 1 << 20;
    const BLOCK: u64 = 4096;

    fn open_device(nr_zones: u32) -> (Arc<MockZbd>, ZonedBlockDevice) {
        let backend = Arc::new(MockZbd::new(nr_zones, ZONE_SIZE, BLOCK));
        let dev = ZonedBlockDevice::open(backend.clone(), DeviceOptions::default()).unwrap();
        (backend, dev)
    }

    struct NoFiles;

    impl LsmHost for NoFiles {
        fn comparator(&self) -> Arc<dyn InternalKeyComparator> {
            Arc::new(crate::zbd::host::HexPrefixComparator)
        }
        fn level_count(&self) -> i32 {
            7
        }
        fn same_level_file_list(&self, _level: i32) -> Vec<FileId> {
            Vec::new()
        }
        fn adjacent_file_list(
            &self,
            _smallest: &InternalKey,
            _largest: &InternalKey,
            _level: i32,
        ) -> Vec<FileId> {
            Vec::new()
        }
        fn all_overlapping_files(
            &self,
            _smallest: &InternalKey,
            _largest: &InternalKey,
        ) -> Vec<FileId> {
            Vec::new()
        }
        fn compaction_args(&self) -> Vec<FileId> {
            Vec::new()
        }
    }

    #[test]
    fn test_first_allocation_takes_lowest_empty_zone() {
        let (_backend, dev) = open_device(40);
        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Medium,
                &InternalKey::new(b"00", 1),
                &InternalKey::new(b"ff", 1),
                1,
            )
            .unwrap();
        // Zones 0..3 are meta, 3..13 reserved; the first io zone is id 13.
        assert_eq!(zone.id(), 13);
        assert!(zone.open_for_write());
        assert_eq!(zone.lifetime(), WriteLifetimeHint::Medium);
        assert_eq!(dev.open_io_zone_count(), 1);
        assert_eq!(dev.active_io_zone_count(), 1);
    }

    #[test]
    fn test_allocate_meta_zone() {
        let (_backend, dev) = open_device(40);
        let meta = dev.allocate_meta_zone().unwrap();
        assert_eq!(meta.id(), 0);
    }

    #[test]
    fn test_lifetime_fallback_prefers_closest_hint() {
        let (_backend, dev) = open_device(40);
        dev.set_host(Arc::new(NoFiles));

        // Occupy two zones with different lifetimes and some live data.
        for (lt, fid) in [(WriteLifetimeHint::Extreme, 1u64), (WriteLifetimeHint::Medium, 2u64)] {
            let z = dev
                .allocate_zone(lt, &InternalKey::new(b"00", 1), &InternalKey::new(b"01", 1), 1)
                .unwrap();
            dev.register_file(fid, InternalKey::new(b"00", 1), InternalKey::new(b"01", 1), 1, lt);
            let wp = z.wp();
            z.append(&vec![1u8; BLOCK as usize]).unwrap();
            dev.record_extent(fid, &z, wp, BLOCK).unwrap();
            z.close_wr(&dev).unwrap();
        }

        // Exhaust the active limit so the empty-zone fallback is skipped.
        dev.active_io_zones
            .store(dev.max_nr_active_io_zones(), std::sync::atomic::Ordering::SeqCst);

        // A Short-lived file fits best in the Medium zone (diff 1) over the
        // Extreme zone (diff 3).
        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Short,
                &InternalKey::new(b"f0", 1),
                &InternalKey::new(b"f1", 1),
                3,
            )
            .unwrap();
        assert_eq!(zone.lifetime(), WriteLifetimeHint::Medium);
        zone.close_wr(&dev).unwrap();
    }

    #[test]
    fn test_rank_by_overlap_orders_best_first() {
        let (_backend, dev) = open_device(40);
        // File 1 is fully covered by the probe range, file 2 only half.
        dev.register_file(
            1,
            InternalKey::new(b"0020", 1),
            InternalKey::new(b"0040", 1),
            1,
            WriteLifetimeHint::Medium,
        );
        dev.register_file(
            2,
            InternalKey::new(b"0050", 1),
            InternalKey::new(b"0090", 1),
            1,
            WriteLifetimeHint::Medium,
        );
        let comparator = crate::zbd::host::HexPrefixComparator;
        let mut ids = vec![2, 1];
        dev.rank_by_overlap(
            &mut ids,
            &InternalKey::new(b"0010", 1),
            &InternalKey::new(b"0070", 1),
            &comparator,
        );
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_same_level_walk_comparisons() {
        let comparator = crate::zbd::host::HexPrefixComparator;
        let a = InternalKey::new(b"0010", 1);
        let b = InternalKey::new(b"0020", 1);
        assert_eq!(comparator.compare(&a, &b), CmpOrdering::Less);
    }
}
