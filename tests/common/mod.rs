//! Shared helpers for the integration tests

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use zonestor::zbd::{
    DeviceOptions, InternalKey, MockZbd, WriteLifetimeHint, Zone, ZonedBlockDevice,
    RESERVED_FOR_CLEANING,
};

/// Open a device over a fresh mock backend.
pub fn open_device(
    nr_zones: u32,
    zone_size: u64,
    block_size: u64,
    options: DeviceOptions,
) -> (Arc<MockZbd>, ZonedBlockDevice) {
    let backend = Arc::new(MockZbd::new(nr_zones, zone_size, block_size));
    let dev = ZonedBlockDevice::open(backend.clone(), options).unwrap();
    (backend, dev)
}

/// Allocate a zone, write one extent of `blocks` device blocks filled with
/// `fill` for `file_id`, and release the zone. The file must already be
/// registered. Returns the zone written to.
pub fn write_file_extent(
    dev: &ZonedBlockDevice,
    file_id: u64,
    blocks: u64,
    fill: u8,
    level: i32,
    lifetime: WriteLifetimeHint,
) -> Arc<Zone> {
    let file = dev.file(file_id).expect("file must be registered");
    let zone = dev
        .allocate_zone(lifetime, file.smallest(), file.largest(), level)
        .expect("allocation must succeed");
    let len = blocks * dev.block_size();
    let wp = zone.wp();
    zone.append(&vec![fill; len as usize]).unwrap();
    dev.record_extent(file_id, &zone, wp, len).unwrap();
    zone.close_wr(dev).unwrap();
    zone
}

/// Register a file whose key range is `[smallest, largest]` as hex strings.
pub fn register_hex_file(
    dev: &ZonedBlockDevice,
    file_id: u64,
    smallest: &str,
    largest: &str,
    level: i32,
    lifetime: WriteLifetimeHint,
) {
    dev.register_file(
        file_id,
        InternalKey::new(smallest.as_bytes(), 1),
        InternalKey::new(largest.as_bytes(), 1),
        level,
        lifetime,
    );
}

/// Structural invariants that must hold after every public operation.
pub fn check_invariants(dev: &ZonedBlockDevice) {
    let block_size = dev.block_size();
    let mut zones = dev.io_zone_snapshot();
    zones.extend(dev.reserved_zone_snapshot());

    let mut open_zones = 0i64;
    for zone in &zones {
        let extents = zone.extent_snapshot();
        let written: u64 = extents
            .iter()
            .map(|e| {
                let rem = e.length() % block_size;
                if rem == 0 {
                    e.length()
                } else {
                    e.length() + block_size - rem
                }
            })
            .sum();
        let valid: u64 = extents
            .iter()
            .filter(|e| e.is_valid())
            .map(|e| e.length())
            .sum();

        assert!(
            zone.wp() - zone.start() >= written,
            "zone {}: wp advance {} below extent footprint {}",
            zone.id(),
            zone.wp() - zone.start(),
            written
        );
        assert_eq!(
            zone.used(),
            valid,
            "zone {}: used capacity does not match valid extents",
            zone.id()
        );
        assert_eq!(
            zone.capacity_left() + (zone.wp() - zone.start()),
            zone.max_capacity(),
            "zone {}: capacity accounting broken",
            zone.id()
        );
        if zone.open_for_write() {
            open_zones += 1;
        }
    }

    assert_eq!(
        dev.open_io_zone_count(),
        open_zones,
        "open count does not match zones held for write"
    );
    assert!(dev.open_io_zone_count() <= dev.max_nr_open_io_zones());
    assert!(dev.nr_reserved_zones() <= RESERVED_FOR_CLEANING);

    // file → zone consistency, both directions
    for zone in &zones {
        for extent in zone.extent_snapshot() {
            if extent.is_valid() {
                assert!(
                    dev.zones_for_file(extent.file_id()).contains(&zone.id()),
                    "valid extent of file {} in zone {} missing from the file map",
                    extent.file_id(),
                    zone.id()
                );
            }
        }
    }
    for zone in &zones {
        let zid = zone.id();
        for extent in zone.extent_snapshot() {
            let mapped = dev.zones_for_file(extent.file_id());
            if mapped.contains(&zid) {
                let has_valid = zone
                    .extent_snapshot()
                    .iter()
                    .any(|e| e.file_id() == extent.file_id() && e.is_valid());
                assert!(
                    has_valid,
                    "file {} maps to zone {zid} without a valid extent there",
                    extent.file_id()
                );
            }
        }
    }
}
