//! Zoned block device: zone pools, index maps and space accounting
//!
//! [`ZonedBlockDevice`] owns every [`Zone`] on the device, partitioned into
//! three pools at open time:
//!
//! ```text
//! ┌───────────────┬──────────────────────┬─────────────────────────────┐
//! │  meta_zones   │    reserved_zones    │          io_zones           │
//! │  (exactly 3)  │  (target 10, moves   │  (everything else; all      │
//! │               │   under cleaning)    │   SSTable writes land here) │
//! └───────────────┴──────────────────────┴─────────────────────────────┘
//! ```
//!
//! It also carries the index maps tying the LSM layer to the device:
//! `sst_to_zone` (file → zones holding its extents), `id_to_zone`, and
//! `files` (file → key range, level, lifetime and extent list). The
//! metadata log of the hosting filesystem replays into these maps at
//! startup through [`ZonedBlockDevice::register_file`] and
//! [`ZonedBlockDevice::record_extent`]; nothing here is persisted.
//!
//! # Lock ordering
//!
//! `io_zones` → `zone_cleaning_mtx` → `reserved_zones` → `zone_resources_mtx`
//! → `sst_to_zone` → `files`, or any strict subset. Per-zone and per-file
//! locks nest innermost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::backend::{DeviceModel, ZbdBackend, ZoneType};
use super::host::{InternalKey, LsmHost};
use super::stats::ZbdStats;
use super::zone::{Zone, ZoneExtent, WriteLifetimeHint};
use super::{ExtentId, FileId, ZoneId};

const MB: u64 = 1024 * 1024;

/// Zones set aside for the filesystem metadata log. Two are needed to roll
/// the log safely, one more covers a zone going offline.
pub const META_ZONES: usize = 3;

/// Minimum number of zones for the core to make sense.
pub const MIN_ZONES: u32 = 32;

/// Target size of the reserved pool used as cleaning copy targets.
pub const RESERVED_FOR_CLEANING: usize = 10;

/// Runtime options for opening a device.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Finish a non-open zone once its remaining capacity drops below this
    /// percentage of its max capacity. 0 disables finishing.
    pub finish_threshold: u64,
    /// Open without a write descriptor; allocation and cleaning are not
    /// available.
    pub readonly: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            finish_threshold: 0,
            readonly: false,
        }
    }
}

impl DeviceOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.finish_threshold > 100 {
            return Err(Error::InvalidArgument(format!(
                "finish_threshold {} must be a percentage",
                self.finish_threshold
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Files
// =============================================================================

/// Core-side record of one SSTable: its key range, level, lifetime hint and
/// the ordered extent list the cleaner rewrites when it relocates data.
pub struct FileMeta {
    id: FileId,
    smallest: InternalKey,
    largest: InternalKey,
    level: i32,
    lifetime: WriteLifetimeHint,
    /// Extent list in file order. The write half is held across a cleaning
    /// relocation so readers never observe a half-spliced list.
    pub(crate) extents: RwLock<Vec<Arc<ZoneExtent>>>,
}

impl FileMeta {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn smallest(&self) -> &InternalKey {
        &self.smallest
    }

    pub fn largest(&self) -> &InternalKey {
        &self.largest
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.lifetime
    }

    /// Snapshot of the extent list in file order.
    pub fn extent_snapshot(&self) -> Vec<Arc<ZoneExtent>> {
        self.extents.read().clone()
    }
}

// =============================================================================
// Device
// =============================================================================

/// The zone management core for one host-managed zoned block device.
///
/// Instantiate once at startup and hand an explicit reference to every
/// collaborator; all state is interior so collaborators share `&self`.
impl std::fmt::Debug for ZonedBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedBlockDevice")
            .field("block_size", &self.block_size)
            .field("zone_size", &self.zone_size)
            .field("nr_zones", &self.nr_zones)
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

pub struct ZonedBlockDevice {
    backend: Arc<dyn ZbdBackend>,
    block_size: u64,
    zone_size: u64,
    nr_zones: u32,
    readonly: bool,
    pub(crate) finish_threshold: u64,
    max_nr_open_io_zones: i64,
    max_nr_active_io_zones: i64,

    /// Allocator serialization: held for the whole of a zone selection.
    pub(crate) io_zones: Mutex<Vec<Arc<Zone>>>,
    pub(crate) reserved_zones: Mutex<Vec<Arc<Zone>>>,
    meta_zones: Vec<Arc<Zone>>,
    id_to_zone: HashMap<ZoneId, Arc<Zone>>,

    pub(crate) sst_to_zone: Mutex<HashMap<FileId, Vec<ZoneId>>>,
    pub(crate) files: Mutex<HashMap<FileId, Arc<FileMeta>>>,

    pub(crate) open_io_zones: AtomicI64,
    pub(crate) active_io_zones: AtomicI64,
    zone_resources_mtx: Mutex<()>,
    zone_resources: Condvar,
    pub(crate) zone_cleaning_mtx: Mutex<()>,
    pub(crate) zc_in_progress: AtomicBool,

    next_extent_id: AtomicU64,
    host: RwLock<Option<Arc<dyn LsmHost>>>,
    stats: ZbdStats,
    start_time: Instant,
}

impl ZonedBlockDevice {
    /// Open the device behind `backend` and partition its zones.
    ///
    /// Refuses devices that are not host-managed or report fewer than
    /// [`MIN_ZONES`] zones. One open and one active slot are reserved for
    /// the metadata log; zero limits from the device mean "no limit".
    pub fn open(backend: Arc<dyn ZbdBackend>, options: DeviceOptions) -> Result<Self> {
        options.validate()?;
        let info = backend.info();

        if info.model != DeviceModel::HostManaged {
            return Err(Error::NotSupported(
                "not a host-managed block device".into(),
            ));
        }
        if info.nr_zones < MIN_ZONES {
            return Err(Error::NotSupported(format!(
                "too few zones on device: {} ({MIN_ZONES} required)",
                info.nr_zones
            )));
        }

        let max_nr_active_io_zones = if info.max_nr_active_zones == 0 {
            info.nr_zones as i64
        } else {
            info.max_nr_active_zones as i64 - 1
        };
        let max_nr_open_io_zones = if info.max_nr_open_zones == 0 {
            info.nr_zones as i64
        } else {
            info.max_nr_open_zones as i64 - 1
        };

        info!(
            nr_zones = info.nr_zones,
            zone_size = info.zone_size,
            block_size = info.block_size,
            max_active = info.max_nr_active_zones,
            max_open = info.max_nr_open_zones,
            "opening zoned block device"
        );

        let reports = backend.report_zones()?;
        if reports.len() != info.nr_zones as usize {
            return Err(Error::io(format!(
                "zone report returned {} zones, expected {}",
                reports.len(),
                info.nr_zones
            )));
        }

        let mut meta_zones = Vec::with_capacity(META_ZONES);
        let mut reserved = Vec::with_capacity(RESERVED_FOR_CLEANING);
        let mut io = Vec::new();
        let mut id_to_zone = HashMap::new();
        let mut active: i64 = 0;
        let mut zone_id: ZoneId = 0;

        for report in &reports {
            if report.zone_type != ZoneType::SequentialWriteRequired {
                continue;
            }
            if report.condition == super::backend::ZoneCondition::Offline {
                continue;
            }
            let zone = Arc::new(Zone::new(
                backend.clone(),
                report,
                zone_id,
                info.zone_size,
                info.block_size,
            ));
            id_to_zone.insert(zone_id, zone.clone());
            zone_id += 1;

            if meta_zones.len() < META_ZONES {
                meta_zones.push(zone);
                continue;
            }

            // Non-meta zones left open or closed by a previous mount count
            // against the active limit until they are finished or reset.
            if report.condition.is_active() {
                active += 1;
                if report.condition.is_open() && !options.readonly {
                    if let Err(e) = zone.close() {
                        warn!(zone = zone.id(), error = %e, "failed closing zone at open");
                    }
                }
            }

            if reserved.len() < RESERVED_FOR_CLEANING {
                reserved.push(zone);
            } else {
                io.push(zone);
            }
        }

        if meta_zones.len() < META_ZONES {
            return Err(Error::NotSupported(
                "not enough usable zones for the metadata log".into(),
            ));
        }

        Ok(Self {
            backend,
            block_size: info.block_size,
            zone_size: info.zone_size,
            nr_zones: info.nr_zones,
            readonly: options.readonly,
            finish_threshold: options.finish_threshold,
            max_nr_open_io_zones,
            max_nr_active_io_zones,
            io_zones: Mutex::new(io),
            reserved_zones: Mutex::new(reserved),
            meta_zones,
            id_to_zone,
            sst_to_zone: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            open_io_zones: AtomicI64::new(0),
            active_io_zones: AtomicI64::new(active),
            zone_resources_mtx: Mutex::new(()),
            zone_resources: Condvar::new(),
            zone_cleaning_mtx: Mutex::new(()),
            zc_in_progress: AtomicBool::new(false),
            next_extent_id: AtomicU64::new(1),
            host: RwLock::new(None),
            stats: ZbdStats::default(),
            start_time: Instant::now(),
        })
    }

    /// Attach the hosting LSM engine. Until this is called the allocator
    /// falls back to the placement steps that need no file information.
    pub fn set_host(&self, host: Arc<dyn LsmHost>) {
        *self.host.write() = Some(host);
    }

    pub(crate) fn host(&self) -> Option<Arc<dyn LsmHost>> {
        self.host.read().clone()
    }

    // -------------------------------------------------------------------------
    // Geometry and counters
    // -------------------------------------------------------------------------

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    pub fn nr_zones(&self) -> u32 {
        self.nr_zones
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn max_nr_open_io_zones(&self) -> i64 {
        self.max_nr_open_io_zones
    }

    pub fn max_nr_active_io_zones(&self) -> i64 {
        self.max_nr_active_io_zones
    }

    pub fn open_io_zone_count(&self) -> i64 {
        self.open_io_zones.load(Ordering::SeqCst)
    }

    pub fn active_io_zone_count(&self) -> i64 {
        self.active_io_zones.load(Ordering::SeqCst)
    }

    pub fn nr_meta_zones(&self) -> usize {
        self.meta_zones.len()
    }

    pub fn nr_reserved_zones(&self) -> usize {
        self.reserved_zones.lock().len()
    }

    pub fn nr_io_zones(&self) -> usize {
        self.io_zones.lock().len()
    }

    /// True while a cleaning pass is running.
    pub fn zone_cleaning_in_progress(&self) -> bool {
        self.zc_in_progress.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ZbdStats {
        &self.stats
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ZbdBackend> {
        &self.backend
    }

    pub(crate) fn meta_zones(&self) -> &[Arc<Zone>] {
        &self.meta_zones
    }

    // -------------------------------------------------------------------------
    // Zone lookups
    // -------------------------------------------------------------------------

    pub fn zone_by_id(&self, id: ZoneId) -> Option<Arc<Zone>> {
        self.id_to_zone.get(&id).cloned()
    }

    /// The io zone whose address range contains `offset`.
    pub fn get_io_zone(&self, offset: u64) -> Option<Arc<Zone>> {
        let io = self.io_zones.lock();
        io.iter()
            .find(|z| z.start() <= offset && offset < z.start() + self.zone_size)
            .cloned()
    }

    /// Snapshot of the io pool, in zone-id order.
    pub fn io_zone_snapshot(&self) -> Vec<Arc<Zone>> {
        self.io_zones.lock().clone()
    }

    /// Snapshot of the reserved pool.
    pub fn reserved_zone_snapshot(&self) -> Vec<Arc<Zone>> {
        self.reserved_zones.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Space accounting
    // -------------------------------------------------------------------------

    /// Bytes written across all io zones (write-pointer positions).
    pub fn total_written(&self) -> u64 {
        let io = self.io_zones.lock();
        io.iter().map(|z| z.wp() - z.start()).sum()
    }

    /// Writable bytes left across all io zones.
    pub fn free_space(&self) -> u64 {
        let io = self.io_zones.lock();
        io.iter().map(|z| z.capacity_left()).sum()
    }

    /// Live bytes across all io zones.
    pub fn used_space(&self) -> u64 {
        let io = self.io_zones.lock();
        io.iter().map(|z| z.used()).sum()
    }

    /// Dead bytes in full zones, recoverable by cleaning.
    pub fn reclaimable_space(&self) -> u64 {
        let io = self.io_zones.lock();
        io.iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity() - z.used())
            .sum()
    }

    /// One-line utilization summary at info level.
    pub fn log_zone_stats(&self) {
        let io = self.io_zones.lock();
        let mut used_capacity = 0u64;
        let mut reclaimable_capacity = 0u64;
        let mut reclaimables_max_capacity = 0u64;
        let mut partial = 0u64;
        for z in io.iter() {
            used_capacity += z.used();
            if z.used() > 0 {
                reclaimable_capacity += z.max_capacity() - z.used();
                reclaimables_max_capacity += z.max_capacity();
            }
            if !(z.is_full() || z.is_empty()) {
                partial += 1;
            }
        }
        if reclaimables_max_capacity == 0 {
            reclaimables_max_capacity = 1;
        }
        info!(
            uptime_s = self.start_time.elapsed().as_secs(),
            used_mb = used_capacity / MB,
            reclaimable_mb = reclaimable_capacity / MB,
            avg_reclaimable_pct = 100 * reclaimable_capacity / reclaimables_max_capacity,
            partial_zones = partial,
            active_io_zones = self.active_io_zone_count(),
            open_io_zones = self.open_io_zone_count(),
            "zone stats"
        );
    }

    /// Per-zone live-byte usage at debug level.
    pub fn log_zone_usage(&self) {
        let io = self.io_zones.lock();
        for z in io.iter() {
            let used = z.used();
            if used > 0 {
                debug!(
                    zone = z.id(),
                    start = z.start(),
                    used_bytes = used,
                    used_mb = used / MB,
                    "zone usage"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Open/active resource gating
    // -------------------------------------------------------------------------

    /// Block until an open-zone slot is available.
    pub(crate) fn wait_for_open_io_zone(&self) {
        let mut guard = self.zone_resources_mtx.lock();
        while self.open_io_zones.load(Ordering::SeqCst) >= self.max_nr_open_io_zones {
            self.zone_resources.wait(&mut guard);
        }
    }

    /// A writer released its open zone.
    pub(crate) fn notify_io_zone_closed(&self) {
        let _guard = self.zone_resources_mtx.lock();
        self.open_io_zones.fetch_sub(1, Ordering::SeqCst);
        self.zone_resources.notify_one();
    }

    /// A zone stopped counting against the active limit (filled or reset).
    pub(crate) fn notify_io_zone_full(&self) {
        let _guard = self.zone_resources_mtx.lock();
        self.active_io_zones.fetch_sub(1, Ordering::SeqCst);
        self.zone_resources.notify_one();
    }

    // -------------------------------------------------------------------------
    // File and extent registration
    // -------------------------------------------------------------------------

    /// Register an SSTable with its key range, level and lifetime hint.
    /// Called by the hosting engine when a file is created, and during
    /// metadata-log replay at startup.
    pub fn register_file(
        &self,
        file_id: FileId,
        smallest: InternalKey,
        largest: InternalKey,
        level: i32,
        lifetime: WriteLifetimeHint,
    ) -> Arc<FileMeta> {
        let meta = Arc::new(FileMeta {
            id: file_id,
            smallest,
            largest,
            level,
            lifetime,
            extents: RwLock::new(Vec::new()),
        });
        self.files.lock().insert(file_id, meta.clone());
        meta
    }

    /// Drop a deleted file: invalidate its remaining valid extents and
    /// remove it from the index maps. Space comes back when the affected
    /// zones are reset.
    pub fn remove_file(&self, file_id: FileId) {
        let Some(meta) = self.files.lock().remove(&file_id) else {
            warn!(file = file_id, "remove_file: unknown file");
            return;
        };
        for extent in meta.extent_snapshot() {
            if !extent.is_valid() {
                continue;
            }
            match self.zone_by_id(extent.zone_id()) {
                Some(zone) => zone.invalidate(extent.id()),
                None => warn!(
                    file = file_id,
                    zone = extent.zone_id(),
                    "extent references unknown zone"
                ),
            }
        }
        self.sst_to_zone.lock().remove(&file_id);
    }

    /// Look up a registered file.
    pub fn file(&self, file_id: FileId) -> Option<Arc<FileMeta>> {
        self.files.lock().get(&file_id).cloned()
    }

    /// Zones currently holding extents of `file_id`.
    pub fn zones_for_file(&self, file_id: FileId) -> Vec<ZoneId> {
        self.sst_to_zone
            .lock()
            .get(&file_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn alloc_extent_id(&self) -> ExtentId {
        self.next_extent_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an extent record on `zone` for `file` and index it, without
    /// touching the file's own extent list. The cleaner uses this directly
    /// when splicing relocated extents.
    pub(crate) fn attach_extent(
        &self,
        file: &Arc<FileMeta>,
        zone: &Arc<Zone>,
        start: u64,
        length: u64,
    ) -> Arc<ZoneExtent> {
        let extent = Arc::new(ZoneExtent::new(
            self.alloc_extent_id(),
            start,
            length,
            zone.id(),
            file.id,
            file.level,
            file.lifetime,
        ));
        zone.push_extent(extent.clone());
        let mut sst = self.sst_to_zone.lock();
        let zones = sst.entry(file.id).or_default();
        if !zones.contains(&zone.id()) {
            zones.push(zone.id());
        }
        extent
    }

    /// Record `length` payload bytes just appended to `zone` at `start` as a
    /// new extent of `file_id`. Updates the zone's used capacity and
    /// secondary lifetime, the file's extent list and the file→zone map.
    pub fn record_extent(
        &self,
        file_id: FileId,
        zone: &Arc<Zone>,
        start: u64,
        length: u64,
    ) -> Result<Arc<ZoneExtent>> {
        let Some(file) = self.file(file_id) else {
            return Err(Error::InvalidArgument(format!(
                "record_extent: unknown file {file_id}"
            )));
        };
        zone.update_secondary_lifetime(file.lifetime, length);
        let extent = self.attach_extent(&file, zone, start, length);
        file.extents.write().push(extent.clone());
        self.stats.record_written(length);
        Ok(extent)
    }

    /// Remove `zone`'s id from every file mapping that still points at it.
    /// Called just before a zone reset so invariant "file maps only to zones
    /// holding its extents" survives the reset.
    pub(crate) fn purge_zone_mapping(&self, zone: &Zone) {
        let file_ids: Vec<FileId> = {
            let mut ids: Vec<FileId> =
                zone.extent_snapshot().iter().map(|e| e.file_id()).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        if file_ids.is_empty() {
            return;
        }
        let mut sst = self.sst_to_zone.lock();
        for fid in file_ids {
            if let Some(zones) = sst.get_mut(&fid) {
                zones.retain(|&zid| zid != zone.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zbd::backend::ZoneCondition;
    use crate::zbd::mock::MockZbd;

    const ZONE_SIZE: u64 = 1 << 20;
    const BLOCK: u64 = 4096;

    fn open_device(nr_zones: u32) -> (Arc<MockZbd>, ZonedBlockDevice) {
        let backend = Arc::new(MockZbd::new(nr_zones, ZONE_SIZE, BLOCK));
        let dev = ZonedBlockDevice::open(backend.clone(), DeviceOptions::default()).unwrap();
        (backend, dev)
    }

    // =========================================================================
    // Open procedure
    // =========================================================================

    #[test]
    fn test_open_rejects_host_aware() {
        let backend = Arc::new(MockZbd::new(40, ZONE_SIZE, BLOCK).with_model(DeviceModel::HostAware));
        let err = ZonedBlockDevice::open(backend, DeviceOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_open_rejects_too_few_zones() {
        let backend = Arc::new(MockZbd::new(31, ZONE_SIZE, BLOCK));
        let err = ZonedBlockDevice::open(backend, DeviceOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_open_partitions_pools() {
        let (_backend, dev) = open_device(40);
        assert_eq!(dev.nr_meta_zones(), META_ZONES);
        assert_eq!(dev.nr_reserved_zones(), RESERVED_FOR_CLEANING);
        assert_eq!(dev.nr_io_zones(), 40 - META_ZONES - RESERVED_FOR_CLEANING);
    }

    #[test]
    fn test_open_limits_reserve_one_for_meta() {
        let backend = Arc::new(MockZbd::new(40, ZONE_SIZE, BLOCK).with_limits(14, 14));
        let dev = ZonedBlockDevice::open(backend, DeviceOptions::default()).unwrap();
        assert_eq!(dev.max_nr_open_io_zones(), 13);
        assert_eq!(dev.max_nr_active_io_zones(), 13);
    }

    #[test]
    fn test_open_zero_limit_means_no_limit() {
        let (_backend, dev) = open_device(40);
        assert_eq!(dev.max_nr_open_io_zones(), 40);
        assert_eq!(dev.max_nr_active_io_zones(), 40);
    }

    #[test]
    fn test_open_counts_and_closes_leftover_zones() {
        let backend = Arc::new(MockZbd::new(40, ZONE_SIZE, BLOCK));
        // Non-meta zones left over from a previous mount.
        backend.seed_zone(20, 2 * BLOCK, ZoneCondition::ImplicitOpen);
        backend.seed_zone(21, 4 * BLOCK, ZoneCondition::Closed);
        let dev = ZonedBlockDevice::open(backend.clone(), DeviceOptions::default()).unwrap();
        assert_eq!(dev.active_io_zone_count(), 2);
        // The open zone was closed during the walk.
        assert_eq!(
            backend.report_zone(20 * ZONE_SIZE).unwrap().condition,
            ZoneCondition::Closed
        );
    }

    #[test]
    fn test_options_validation() {
        let opts = DeviceOptions {
            finish_threshold: 101,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    // =========================================================================
    // Files, extents and accounting
    // =========================================================================

    #[test]
    fn test_record_extent_updates_maps() {
        let (_backend, dev) = open_device(40);
        dev.register_file(
            7,
            InternalKey::new(b"00", 1),
            InternalKey::new(b"10", 1),
            1,
            WriteLifetimeHint::Medium,
        );
        let zone = dev.io_zone_snapshot()[0].clone();
        let wp = zone.wp();
        zone.append(&[9u8; BLOCK as usize]).unwrap();
        let extent = dev.record_extent(7, &zone, wp, BLOCK).unwrap();

        assert_eq!(zone.used(), BLOCK);
        assert_eq!(dev.zones_for_file(7), vec![zone.id()]);
        let file = dev.file(7).unwrap();
        assert_eq!(file.extent_snapshot().len(), 1);
        assert_eq!(extent.file_id(), 7);
        assert_eq!(dev.stats().snapshot().wr_data, BLOCK);
    }

    #[test]
    fn test_record_extent_unknown_file() {
        let (_backend, dev) = open_device(40);
        let zone = dev.io_zone_snapshot()[0].clone();
        assert!(matches!(
            dev.record_extent(99, &zone, 0, BLOCK),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_file_invalidates_extents() {
        let (_backend, dev) = open_device(40);
        dev.register_file(
            7,
            InternalKey::new(b"00", 1),
            InternalKey::new(b"10", 1),
            1,
            WriteLifetimeHint::Medium,
        );
        let zone = dev.io_zone_snapshot()[0].clone();
        let wp = zone.wp();
        zone.append(&[9u8; BLOCK as usize]).unwrap();
        dev.record_extent(7, &zone, wp, BLOCK).unwrap();

        dev.remove_file(7);
        assert_eq!(zone.used(), 0);
        assert!(dev.file(7).is_none());
        assert!(dev.zones_for_file(7).is_empty());
    }

    #[test]
    fn test_space_accounting() {
        let (_backend, dev) = open_device(40);
        dev.register_file(
            1,
            InternalKey::new(b"00", 1),
            InternalKey::new(b"10", 1),
            0,
            WriteLifetimeHint::Short,
        );
        let zone = dev.io_zone_snapshot()[0].clone();
        let wp = zone.wp();
        zone.append(&[1u8; (2 * BLOCK) as usize]).unwrap();
        dev.record_extent(1, &zone, wp, 2 * BLOCK).unwrap();

        let io_count = dev.nr_io_zones() as u64;
        assert_eq!(dev.total_written(), 2 * BLOCK);
        assert_eq!(dev.used_space(), 2 * BLOCK);
        assert_eq!(dev.free_space(), io_count * ZONE_SIZE - 2 * BLOCK);
        // Nothing is full yet, so nothing is reclaimable.
        assert_eq!(dev.reclaimable_space(), 0);
    }

    #[test]
    fn test_get_io_zone() {
        let (_backend, dev) = open_device(40);
        let first_io = dev.io_zone_snapshot()[0].clone();
        let found = dev.get_io_zone(first_io.start() + 100).unwrap();
        assert_eq!(found.id(), first_io.id());
        // Meta zone offsets are not io zones.
        assert!(dev.get_io_zone(0).is_none());
    }

    #[test]
    fn test_purge_zone_mapping() {
        let (_backend, dev) = open_device(40);
        dev.register_file(
            5,
            InternalKey::new(b"00", 1),
            InternalKey::new(b"10", 1),
            1,
            WriteLifetimeHint::Medium,
        );
        let zone = dev.io_zone_snapshot()[0].clone();
        let wp = zone.wp();
        zone.append(&[1u8; BLOCK as usize]).unwrap();
        dev.record_extent(5, &zone, wp, BLOCK).unwrap();
        assert_eq!(dev.zones_for_file(5), vec![zone.id()]);

        dev.purge_zone_mapping(&zone);
        assert!(dev.zones_for_file(5).is_empty());
    }
}
