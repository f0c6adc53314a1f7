//! Zones and extent records
//!
//! A [`Zone`] mirrors one physical zone of the device: geometry, write
//! pointer, remaining capacity and the insertion-ordered list of extents
//! written into it. A [`ZoneExtent`] is one contiguous run of bytes owned by
//! a file; invalidating an extent marks bytes dead without freeing them, and
//! space only comes back when the whole zone is reset.
//!
//! # Zone lifecycle
//!
//! ```text
//! Empty → Open → (ClosedPartial ↔ Open) → Full
//!                       │                   │
//!                       └── used == 0 ──────┴──→ Reset → Empty
//! ```
//!
//! A zone has at most one writer at a time (`open_for_write`); the cleaner
//! synchronizes with that writer through the `is_append` flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

use super::backend::{ZbdBackend, ZoneCondition, ZoneReport};
use super::device::ZonedBlockDevice;
use super::{ExtentId, FileId, ZoneId};

/// A lifetime diff that disqualifies a zone/file pairing.
pub const LIFETIME_DIFF_NOT_GOOD: u32 = 100;

/// Writer-supplied classification of expected data longevity. Used to
/// colocate similarly-lived data in the same zone so whole zones die
/// together.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum WriteLifetimeHint {
    #[default]
    NotSet,
    None,
    Short,
    Medium,
    Long,
    Extreme,
}

impl WriteLifetimeHint {
    /// Numeric rank used for diffs and weighted means.
    pub fn rank(self) -> u32 {
        self as u32
    }
}

/// Distance between a zone's lifetime hint and a prospective file's hint.
///
/// Files without a real hint only match zones stamped the same way. A zone
/// expected to outlive the file scores by how much; a zone expected to die
/// first is as bad as no match.
pub fn lifetime_diff(zone_lifetime: WriteLifetimeHint, file_lifetime: WriteLifetimeHint) -> u32 {
    if matches!(
        file_lifetime,
        WriteLifetimeHint::NotSet | WriteLifetimeHint::None
    ) {
        return if zone_lifetime == file_lifetime {
            0
        } else {
            LIFETIME_DIFF_NOT_GOOD
        };
    }
    if zone_lifetime > file_lifetime {
        zone_lifetime.rank() - file_lifetime.rank()
    } else {
        LIFETIME_DIFF_NOT_GOOD
    }
}

/// Round `len` up to the next multiple of `block_size`.
pub(crate) fn block_align(len: u64, block_size: u64) -> u64 {
    let rem = len % block_size;
    if rem == 0 {
        len
    } else {
        len + (block_size - rem)
    }
}

// =============================================================================
// Extent records
// =============================================================================

/// One contiguous written range inside a zone.
///
/// Created on append, flipped invalid exactly once, destroyed when its zone
/// is reset. Back-references to the zone and the owning file are dense ids;
/// lookups go through the device maps.
#[derive(Debug)]
pub struct ZoneExtent {
    id: ExtentId,
    start: u64,
    length: u64,
    zone: ZoneId,
    file: FileId,
    level: i32,
    lifetime: WriteLifetimeHint,
    valid: AtomicBool,
}

impl ZoneExtent {
    pub(crate) fn new(
        id: ExtentId,
        start: u64,
        length: u64,
        zone: ZoneId,
        file: FileId,
        level: i32,
        lifetime: WriteLifetimeHint,
    ) -> Self {
        Self {
            id,
            start,
            length,
            zone,
            file,
            level,
            lifetime,
            valid: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ExtentId {
        self.id
    }

    /// Device offset of the first byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Valid payload length in bytes (excludes block padding).
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone
    }

    pub fn file_id(&self) -> FileId {
        self.file
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.lifetime
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Flip to invalid. Returns false if the extent was already invalid.
    pub(crate) fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::SeqCst)
    }

    /// On-device footprint: length rounded up to the block size.
    pub(crate) fn padded_length(&self, block_size: u64) -> u64 {
        block_align(self.length, block_size)
    }
}

// =============================================================================
// Zones
// =============================================================================

/// One physical zone of the device.
pub struct Zone {
    id: ZoneId,
    start: u64,
    zone_size: u64,
    block_size: u64,
    max_capacity: AtomicU64,
    capacity: AtomicU64,
    wp: AtomicU64,
    used_capacity: AtomicU64,
    open_for_write: AtomicBool,
    is_append: AtomicBool,
    lifetime: Mutex<WriteLifetimeHint>,
    secondary_lifetime: Mutex<f64>,
    extents: Mutex<Vec<Arc<ZoneExtent>>>,
    /// Serializes write-pointer advances during appends.
    wr_lock: Mutex<()>,
    backend: Arc<dyn ZbdBackend>,
}

impl Zone {
    pub(crate) fn new(
        backend: Arc<dyn ZbdBackend>,
        report: &ZoneReport,
        id: ZoneId,
        zone_size: u64,
        block_size: u64,
    ) -> Self {
        let writable = !matches!(
            report.condition,
            ZoneCondition::Full | ZoneCondition::Offline | ZoneCondition::ReadOnly
        );
        let capacity = if writable {
            report.capacity - (report.wp - report.start)
        } else {
            0
        };
        Self {
            id,
            start: report.start,
            zone_size,
            block_size,
            max_capacity: AtomicU64::new(report.capacity),
            capacity: AtomicU64::new(capacity),
            wp: AtomicU64::new(report.wp),
            used_capacity: AtomicU64::new(0),
            open_for_write: AtomicBool::new(false),
            is_append: AtomicBool::new(false),
            lifetime: Mutex::new(WriteLifetimeHint::NotSet),
            secondary_lifetime: Mutex::new(WriteLifetimeHint::NotSet.rank() as f64),
            extents: Mutex::new(Vec::new()),
            wr_lock: Mutex::new(()),
            backend,
        }
    }

    // -------------------------------------------------------------------------
    // State queries
    // -------------------------------------------------------------------------

    pub fn id(&self) -> ZoneId {
        self.id
    }

    /// Device byte offset where this zone starts.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::SeqCst)
    }

    /// Bytes still writable ahead of the write pointer.
    pub fn capacity_left(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::SeqCst)
    }

    /// Sum of the lengths of still-valid extents.
    pub fn used(&self) -> u64 {
        self.used_capacity.load(Ordering::SeqCst)
    }

    /// A zone is in use while it holds live data or a writer.
    pub fn is_used(&self) -> bool {
        self.used() > 0 || self.open_for_write()
    }

    pub fn is_full(&self) -> bool {
        self.capacity_left() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    /// Ordinal position of this zone on the device.
    pub fn zone_nr(&self) -> u64 {
        self.start / self.zone_size
    }

    pub fn open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open_for_write(&self, open: bool) {
        self.open_for_write.store(open, Ordering::SeqCst);
    }

    pub fn lifetime(&self) -> WriteLifetimeHint {
        *self.lifetime.lock()
    }

    pub(crate) fn set_lifetime(&self, hint: WriteLifetimeHint) {
        *self.lifetime.lock() = hint;
    }

    /// Length-weighted mean of the lifetime hints of everything in the zone.
    pub fn secondary_lifetime(&self) -> f64 {
        *self.secondary_lifetime.lock()
    }

    pub(crate) fn append_in_flight(&self) -> bool {
        self.is_append.load(Ordering::Acquire)
    }

    /// Spin until no append is in flight, so the extent list and write
    /// pointer are stable. Sound because a zone has at most one writer.
    pub(crate) fn wait_append_idle(&self) {
        while self.append_in_flight() {
            std::hint::spin_loop();
        }
    }

    // -------------------------------------------------------------------------
    // Device operations
    // -------------------------------------------------------------------------

    /// Write `data` at the current write pointer.
    ///
    /// The length must be a multiple of the device block size and fit in the
    /// remaining capacity. The write pointer reflects exactly the bytes the
    /// device acknowledged, even on partial failure.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if size % self.block_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "append size {size} not a multiple of block size {}",
                self.block_size
            )));
        }
        if self.capacity_left() < size {
            return Err(Error::NoSpace(format!(
                "zone {}: append of {size} bytes exceeds capacity {}",
                self.id,
                self.capacity_left()
            )));
        }

        self.is_append.store(true, Ordering::Release);
        let result = self.append_inner(data);
        self.is_append.store(false, Ordering::Release);
        result
    }

    fn append_inner(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let wp = self.wp();
            let written = self.backend.pwrite(&data[offset..], wp)?;
            if written == 0 {
                return Err(Error::io(format!("zone {}: device accepted 0 bytes", self.id)));
            }
            {
                let _wp_guard = self.wr_lock.lock();
                self.wp.fetch_add(written as u64, Ordering::SeqCst);
            }
            self.capacity.fetch_sub(written as u64, Ordering::SeqCst);
            offset += written;
        }
        Ok(())
    }

    /// Reset the zone and rewind the write pointer.
    ///
    /// Must not be called while the zone holds live data or a writer. If the
    /// zone comes back offline the capacity stays at zero.
    pub fn reset(&self) -> Result<()> {
        debug_assert!(!self.is_used());
        self.backend.reset_zone(self.start, self.zone_size)?;
        let report = self.backend.report_zone(self.start)?;

        if report.condition == ZoneCondition::Offline {
            self.capacity.store(0, Ordering::SeqCst);
        } else {
            self.max_capacity.store(report.capacity, Ordering::SeqCst);
            self.capacity.store(report.capacity, Ordering::SeqCst);
        }
        self.wp.store(self.start, Ordering::SeqCst);
        self.set_lifetime(WriteLifetimeHint::NotSet);
        self.extents.lock().clear();
        Ok(())
    }

    /// Transition the zone to Full, releasing its active resources on the
    /// device. Must not be called while a writer holds the zone.
    pub fn finish(&self) -> Result<()> {
        debug_assert!(!self.open_for_write());
        self.backend.finish_zone(self.start, self.zone_size)?;
        self.capacity.store(0, Ordering::SeqCst);
        self.wp.store(self.start + self.zone_size, Ordering::SeqCst);
        Ok(())
    }

    /// Close the zone on the device. A no-op when the zone is empty or full,
    /// since neither state holds open resources.
    pub fn close(&self) -> Result<()> {
        debug_assert!(!self.open_for_write());
        if !(self.is_empty() || self.is_full()) {
            self.backend.close_zone(self.start, self.zone_size)?;
        }
        Ok(())
    }

    /// Release the writer's hold on this zone: clear `open_for_write`, close
    /// the zone, and return the open slot (and the active slot, if the zone
    /// filled up) to the device.
    pub fn close_wr(&self, dev: &ZonedBlockDevice) -> Result<()> {
        debug_assert!(self.open_for_write());
        self.set_open_for_write(false);
        let result = self.close();
        if result.is_ok() {
            dev.notify_io_zone_closed();
        }
        if self.capacity_left() == 0 {
            dev.notify_io_zone_full();
        }
        result
    }

    // -------------------------------------------------------------------------
    // Extent bookkeeping
    // -------------------------------------------------------------------------

    /// Mark the extent dead and return its bytes to the reclaimable pool.
    /// Passing an unknown or already-invalid extent is reported but not
    /// fatal.
    pub fn invalidate(&self, extent_id: ExtentId) {
        let extents = self.extents.lock();
        let Some(extent) = extents.iter().find(|e| e.id() == extent_id) else {
            warn!(zone = self.id, extent = extent_id, "extent to invalidate not found in zone");
            return;
        };
        if !extent.invalidate() {
            warn!(zone = self.id, extent = extent_id, "extent already invalidated");
            return;
        }
        self.used_capacity.fetch_sub(extent.length(), Ordering::SeqCst);
    }

    /// Fold a prospective extent of `length` bytes with hint `hint` into the
    /// length-weighted mean of the hints of everything already in the zone.
    pub fn update_secondary_lifetime(&self, hint: WriteLifetimeHint, length: u64) {
        let extents = self.extents.lock();
        let total: u64 = extents.iter().map(|e| e.length()).sum::<u64>() + length;
        if total == 0 {
            *self.secondary_lifetime.lock() = hint.rank() as f64;
            return;
        }
        let mut mean = 0.0;
        for extent in extents.iter() {
            let weight = extent.length() as f64 / total as f64;
            mean += weight * extent.lifetime().rank() as f64;
        }
        mean += (length as f64 / total as f64) * hint.rank() as f64;
        *self.secondary_lifetime.lock() = mean;
    }

    /// Advisory distance between this zone's secondary lifetime and what it
    /// would become after admitting a typically-sized extent with
    /// `file_lifetime`. Computed for parity with the hint machinery; the
    /// allocator does not currently consult it.
    pub fn secondary_lifetime_diff(&self, file_lifetime: WriteLifetimeHint) -> f64 {
        let current = self.secondary_lifetime();
        let extents = self.extents.lock();
        if extents.is_empty() {
            return (current - file_lifetime.rank() as f64).abs();
        }
        let total: u64 = extents.iter().map(|e| e.length()).sum();
        let expected = total / extents.len() as u64;
        let denom = (total + expected) as f64;
        let mut mean = 0.0;
        for extent in extents.iter() {
            mean += (extent.length() as f64 / denom) * extent.lifetime().rank() as f64;
        }
        mean += (expected as f64 / denom) * file_lifetime.rank() as f64;
        (current - mean).abs()
    }

    pub(crate) fn push_extent(&self, extent: Arc<ZoneExtent>) {
        self.used_capacity.fetch_add(extent.length(), Ordering::SeqCst);
        self.extents.lock().push(extent);
    }

    pub(crate) fn sub_used(&self, bytes: u64) {
        self.used_capacity.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn store_used(&self, bytes: u64) {
        self.used_capacity.store(bytes, Ordering::SeqCst);
    }

    /// Snapshot of the extent list in insertion order.
    pub fn extent_snapshot(&self) -> Vec<Arc<ZoneExtent>> {
        self.extents.lock().clone()
    }

    /// Snapshot of the still-valid extents in insertion order.
    pub fn valid_extents(&self) -> Vec<Arc<ZoneExtent>> {
        self.extents
            .lock()
            .iter()
            .filter(|e| e.is_valid())
            .cloned()
            .collect()
    }

    /// Block-padded byte totals of (valid, invalid) extents; the invalid
    /// total drives garbage-collection victim ranking.
    pub(crate) fn padded_extent_lengths(&self) -> (u64, u64) {
        let extents = self.extents.lock();
        let mut valid = 0u64;
        let mut invalid = 0u64;
        for extent in extents.iter() {
            let padded = extent.padded_length(self.block_size);
            if extent.is_valid() {
                valid += padded;
            } else {
                invalid += padded;
            }
        }
        (valid, invalid)
    }

}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("wp", &self.wp())
            .field("capacity", &self.capacity_left())
            .field("used_capacity", &self.used())
            .field("open_for_write", &self.open_for_write())
            .field("is_used", &self.is_used())
            .field("is_full", &self.is_full())
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zbd::mock::MockZbd;

    const ZONE_SIZE: u64 = 1 << 20;
    const BLOCK: u64 = 4096;

    fn test_zone() -> (Arc<MockZbd>, Zone) {
        let backend = Arc::new(MockZbd::new(4, ZONE_SIZE, BLOCK));
        let report = backend.report_zone(0).unwrap();
        let zone = Zone::new(backend.clone(), &report, 0, ZONE_SIZE, BLOCK);
        (backend, zone)
    }

    // =========================================================================
    // Lifetime diff
    // =========================================================================

    #[test]
    fn test_lifetime_diff_unset_file() {
        use WriteLifetimeHint::*;
        assert_eq!(lifetime_diff(NotSet, NotSet), 0);
        assert_eq!(lifetime_diff(Medium, NotSet), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(lifetime_diff(None, None), 0);
    }

    #[test]
    fn test_lifetime_diff_ordering() {
        use WriteLifetimeHint::*;
        assert_eq!(lifetime_diff(Extreme, Short), 3);
        assert_eq!(lifetime_diff(Long, Medium), 1);
        // Zone expected to die before the file is a bad match.
        assert_eq!(lifetime_diff(Short, Long), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(lifetime_diff(Medium, Medium), LIFETIME_DIFF_NOT_GOOD);
    }

    // =========================================================================
    // Geometry and state predicates
    // =========================================================================

    #[test]
    fn test_new_zone_is_empty() {
        let (_backend, zone) = test_zone();
        assert!(zone.is_empty());
        assert!(!zone.is_full());
        assert!(!zone.is_used());
        assert_eq!(zone.capacity_left(), ZONE_SIZE);
        assert_eq!(zone.wp(), 0);
    }

    #[test]
    fn test_append_advances_wp() {
        let (_backend, zone) = test_zone();
        zone.append(&[7u8; 2 * BLOCK as usize]).unwrap();
        assert_eq!(zone.wp(), 2 * BLOCK);
        assert_eq!(zone.capacity_left(), ZONE_SIZE - 2 * BLOCK);
        assert!(!zone.is_empty());
    }

    #[test]
    fn test_append_rejects_unaligned() {
        let (_backend, zone) = test_zone();
        let err = zone.append(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_append_rejects_oversize() {
        let (_backend, zone) = test_zone();
        zone.capacity.store(BLOCK, Ordering::SeqCst);
        let err = zone.append(&[0u8; 2 * BLOCK as usize]).unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
        // Nothing was written.
        assert_eq!(zone.wp(), 0);
    }

    #[test]
    fn test_append_failure_leaves_wp() {
        let (backend, zone) = test_zone();
        backend.set_write_failure(true);
        assert!(zone.append(&[0u8; BLOCK as usize]).is_err());
        assert_eq!(zone.wp(), 0);
        assert_eq!(zone.capacity_left(), ZONE_SIZE);
        assert!(!zone.append_in_flight());
    }

    #[test]
    fn test_reset_restores_geometry() {
        let (_backend, zone) = test_zone();
        zone.append(&[1u8; BLOCK as usize]).unwrap();
        zone.set_lifetime(WriteLifetimeHint::Long);
        zone.reset().unwrap();
        assert!(zone.is_empty());
        assert_eq!(zone.capacity_left(), ZONE_SIZE);
        assert_eq!(zone.lifetime(), WriteLifetimeHint::NotSet);
        assert!(zone.extent_snapshot().is_empty());
    }

    #[test]
    fn test_finish_fills_zone() {
        let (_backend, zone) = test_zone();
        zone.append(&[1u8; BLOCK as usize]).unwrap();
        zone.finish().unwrap();
        assert!(zone.is_full());
        assert_eq!(zone.wp(), ZONE_SIZE);
        assert_eq!(zone.capacity_left(), 0);
    }

    // =========================================================================
    // Extents
    // =========================================================================

    #[test]
    fn test_invalidate_returns_bytes() {
        let (_backend, zone) = test_zone();
        let ext = Arc::new(ZoneExtent::new(
            1,
            0,
            BLOCK,
            0,
            10,
            1,
            WriteLifetimeHint::Medium,
        ));
        zone.push_extent(ext.clone());
        assert_eq!(zone.used(), BLOCK);
        zone.invalidate(1);
        assert_eq!(zone.used(), 0);
        assert!(!ext.is_valid());
        // Double invalidate is reported but must not underflow.
        zone.invalidate(1);
        assert_eq!(zone.used(), 0);
    }

    #[test]
    fn test_invalidate_unknown_extent_is_harmless() {
        let (_backend, zone) = test_zone();
        zone.invalidate(999);
        assert_eq!(zone.used(), 0);
    }

    #[test]
    fn test_padded_extent_lengths() {
        let (_backend, zone) = test_zone();
        let a = Arc::new(ZoneExtent::new(1, 0, 100, 0, 1, 0, WriteLifetimeHint::Short));
        let b = Arc::new(ZoneExtent::new(2, BLOCK, BLOCK, 0, 1, 0, WriteLifetimeHint::Short));
        zone.push_extent(a);
        zone.push_extent(b.clone());
        b.invalidate();
        let (valid, invalid) = zone.padded_extent_lengths();
        assert_eq!(valid, BLOCK); // 100 rounds up to one block
        assert_eq!(invalid, BLOCK);
    }

    #[test]
    fn test_secondary_lifetime_weighted_mean() {
        let (_backend, zone) = test_zone();
        zone.push_extent(Arc::new(ZoneExtent::new(
            1,
            0,
            3 * BLOCK,
            0,
            1,
            0,
            WriteLifetimeHint::Short,
        )));
        // Prospective extent of equal weight with a Long hint: mean of the
        // two ranks.
        zone.update_secondary_lifetime(WriteLifetimeHint::Long, 3 * BLOCK);
        let expected = (WriteLifetimeHint::Short.rank() + WriteLifetimeHint::Long.rank()) as f64 / 2.0;
        assert!((zone.secondary_lifetime() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_block_align() {
        assert_eq!(block_align(0, BLOCK), 0);
        assert_eq!(block_align(1, BLOCK), BLOCK);
        assert_eq!(block_align(BLOCK, BLOCK), BLOCK);
        assert_eq!(block_align(BLOCK + 1, BLOCK), 2 * BLOCK);
    }
}
