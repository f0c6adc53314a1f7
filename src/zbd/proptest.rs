//! Property-Based Tests for Zone Accounting and Cleaning
//!
//! Uses proptest to verify the core bookkeeping invariants across randomized
//! extent layouts and invalidation patterns.
//!
//! # Test Properties
//!
//! 1. **Accounting**: used capacity always equals the sum of valid extent
//!    lengths, and capacity + write-pointer advance equals max capacity
//! 2. **Copy preservation**: cleaning never loses or corrupts live bytes
//! 3. **Reserve bound**: the reserved pool never exceeds its target size

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::backend::ZbdBackend;
use super::device::{DeviceOptions, ZonedBlockDevice, RESERVED_FOR_CLEANING};
use super::host::InternalKey;
use super::mock::MockZbd;
use super::zone::WriteLifetimeHint;

const BLOCK: u64 = 4096;
const ZONE_BLOCKS: u64 = 8;

/// One extent to write: payload blocks and whether the owning file survives.
#[derive(Debug, Clone)]
struct ExtentPlan {
    blocks: u64,
    keep: bool,
}

fn extent_strategy() -> impl Strategy<Value = ExtentPlan> {
    (1u64..=2, any::<bool>()).prop_map(|(blocks, keep)| ExtentPlan { blocks, keep })
}

/// Groups of extents, one group per zone (each group fits in a zone).
fn layout_strategy() -> impl Strategy<Value = Vec<Vec<ExtentPlan>>> {
    prop::collection::vec(prop::collection::vec(extent_strategy(), 1..=3), 1..6)
}

fn fill_byte(group: usize, index: usize) -> u8 {
    (group * 16 + index + 1) as u8
}

fn open_device() -> (Arc<MockZbd>, ZonedBlockDevice) {
    let backend = Arc::new(MockZbd::new(40, ZONE_BLOCKS * BLOCK, BLOCK));
    let dev = ZonedBlockDevice::open(backend.clone(), DeviceOptions::default()).unwrap();
    (backend, dev)
}

fn assert_zone_accounting(dev: &ZonedBlockDevice) {
    let mut zones = dev.io_zone_snapshot();
    zones.extend(dev.reserved_zone_snapshot());
    for zone in &zones {
        let valid: u64 = zone
            .extent_snapshot()
            .iter()
            .filter(|e| e.is_valid())
            .map(|e| e.length())
            .sum();
        assert_eq!(zone.used(), valid, "zone {} used/valid mismatch", zone.id());
        assert_eq!(
            zone.capacity_left() + (zone.wp() - zone.start()),
            zone.max_capacity(),
            "zone {} capacity accounting broken",
            zone.id()
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: accounting holds and live bytes survive cleaning for any
    /// extent layout and invalidation pattern.
    #[test]
    fn prop_cleaning_preserves_live_data(layout in layout_strategy()) {
        let (backend, dev) = open_device();

        // Write each group into one zone, one file per extent.
        let mut file_id = 0u64;
        let mut written: Vec<(u64, u8, u64)> = Vec::new(); // (file, fill, blocks)
        for (g, group) in layout.iter().enumerate() {
            let smallest = InternalKey::new(format!("{g:02x}00").as_bytes(), 1);
            let largest = InternalKey::new(format!("{g:02x}ff").as_bytes(), 1);
            let zone = dev
                .allocate_zone(WriteLifetimeHint::Medium, &smallest, &largest, 1)
                .expect("allocation must succeed");
            for (i, plan) in group.iter().enumerate() {
                file_id += 1;
                dev.register_file(
                    file_id,
                    smallest.clone(),
                    largest.clone(),
                    1,
                    WriteLifetimeHint::Medium,
                );
                let fill = fill_byte(g, i);
                let len = plan.blocks * BLOCK;
                let wp = zone.wp();
                zone.append(&vec![fill; len as usize]).unwrap();
                dev.record_extent(file_id, &zone, wp, len).unwrap();
                written.push((file_id, fill, plan.blocks));
            }
            zone.close_wr(&dev).unwrap();
        }
        assert_zone_accounting(&dev);

        // Delete the doomed files.
        for (idx, (fid, _, _)) in written.iter().enumerate() {
            let plan = layout.iter().flatten().nth(idx).unwrap();
            if !plan.keep {
                dev.remove_file(*fid);
            }
        }
        assert_zone_accounting(&dev);

        dev.zone_cleaning(2);

        // Survivors kept their bytes, wherever they live now.
        for (idx, (fid, fill, blocks)) in written.iter().enumerate() {
            let plan = layout.iter().flatten().nth(idx).unwrap();
            if !plan.keep {
                continue;
            }
            let file = dev.file(*fid).expect("surviving file still registered");
            let extents = file.extent_snapshot();
            let total: u64 = extents.iter().map(|e| e.length()).sum();
            prop_assert_eq!(total, blocks * BLOCK, "file {} lost bytes", fid);
            for extent in &extents {
                prop_assert!(extent.is_valid());
                let mut buf = vec![0u8; extent.length() as usize];
                backend.pread(&mut buf, extent.start()).unwrap();
                prop_assert!(
                    buf.iter().all(|&b| b == *fill),
                    "file {} bytes corrupted after cleaning",
                    fid
                );
            }
        }

        assert_zone_accounting(&dev);
        prop_assert!(dev.nr_reserved_zones() <= RESERVED_FOR_CLEANING);
    }

    /// Property: a zone's write pointer never retreats across appends and
    /// the capacity mirror tracks it exactly.
    #[test]
    fn prop_append_advances_wp_monotonically(sizes in prop::collection::vec(1u64..=4, 1..8)) {
        let (_backend, dev) = open_device();
        let smallest = InternalKey::new(b"00", 1);
        let largest = InternalKey::new(b"ff", 1);
        let zone = dev
            .allocate_zone(WriteLifetimeHint::Short, &smallest, &largest, 0)
            .expect("allocation must succeed");

        let mut expected_wp = zone.start();
        for blocks in sizes {
            let len = blocks * BLOCK;
            if len > zone.capacity_left() {
                prop_assert!(zone.append(&vec![0u8; len as usize]).is_err());
                continue;
            }
            zone.append(&vec![0u8; len as usize]).unwrap();
            expected_wp += len;
            prop_assert_eq!(zone.wp(), expected_wp);
            prop_assert_eq!(
                zone.capacity_left(),
                zone.max_capacity() - (expected_wp - zone.start())
            );
        }
        zone.close_wr(&dev).unwrap();
    }
}
