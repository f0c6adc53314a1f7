//! Zone management core for host-managed zoned block devices
//!
//! This module keeps a log-structured SSTable store running on a zoned
//! block device: it allocates zones for new writes, tracks which bytes in
//! each zone are still live, and reclaims space by copying survivors out of
//! heavily-invalidated zones before resetting them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        ZonedBlockDevice                           │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │   LSM writer ──► allocate_zone ──► Zone ──► append / extents      │
//! │                      │                          │                 │
//! │                      │ free space low           │ invalidate      │
//! │                      ▼                          ▼                 │
//! │                 zone_cleaning ◄──── GC queue (invalid bytes)      │
//! │                      │                                            │
//! │                      └─► evacuate live extents ──► reserved pool  │
//! │                          reset victims ──► back to io pool        │
//! │                                                                   │
//! ├───────────────────────────────────────────────────────────────────┤
//! │            ZbdBackend (libzbd device  /  in-memory mock)          │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hosting LSM engine participates through [`host::LsmHost`]
//! (file-by-level and key-overlap queries) and persists the file→extent
//! mapping in its own metadata log; at startup it replays that log into
//! [`device::ZonedBlockDevice::register_file`] and
//! [`device::ZonedBlockDevice::record_extent`].

mod alloc;
pub mod backend;
pub mod buffer;
mod cleaner;
pub mod device;
pub mod host;
#[cfg(feature = "mock-zbd")]
pub mod mock;
#[cfg(feature = "mock-zbd")]
mod proptest;
pub mod stats;
pub mod zone;

/// Dense zone identifier, assigned in report order at open time.
pub type ZoneId = u32;

/// SSTable file number, assigned by the hosting engine.
pub type FileId = u64;

/// Dense extent identifier, unique per device instance.
pub type ExtentId = u64;

pub use backend::{DeviceModel, ZbdBackend, ZbdInfo, ZoneCondition, ZoneReport, ZoneType};
#[cfg(feature = "libzbd")]
pub use backend::ZbdFileBackend;
pub use buffer::AlignedBuf;
pub use device::{
    DeviceOptions, FileMeta, ZonedBlockDevice, META_ZONES, MIN_ZONES, RESERVED_FOR_CLEANING,
};
pub use host::{
    parse_internal_key, HexPrefixComparator, InternalKey, InternalKeyComparator, LsmHost,
    ParsedInternalKey, NO_LEVEL_INFO,
};
#[cfg(feature = "mock-zbd")]
pub use mock::MockZbd;
pub use stats::{ZbdStats, ZbdStatsSnapshot};
pub use zone::{
    lifetime_diff, WriteLifetimeHint, Zone, ZoneExtent, LIFETIME_DIFF_NOT_GOOD,
};
