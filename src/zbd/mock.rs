//! In-memory zoned block device emulation
//!
//! `MockZbd` behaves like a small host-managed SWR device: sequential-write
//! enforcement at the write pointer, wholesale zone resets, explicit finish
//! and close transitions, and open/active conditions derived from the write
//! pointer. Zone payloads are kept in per-zone buffers that grow on demand,
//! so a 256 MiB-zone geometry costs nothing until bytes are written.
//!
//! Fault-injection switches let tests exercise the error paths of the
//! allocator and the cleaner without a real device.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::backend::{DeviceModel, ZbdBackend, ZbdInfo, ZoneCondition, ZoneReport, ZoneType};

struct MockZone {
    start: u64,
    wp: u64,
    cond: ZoneCondition,
    data: Vec<u8>,
}

/// In-memory host-managed zoned device.
pub struct MockZbd {
    nr_zones: u32,
    zone_size: u64,
    block_size: u64,
    max_nr_open_zones: u32,
    max_nr_active_zones: u32,
    model: DeviceModel,
    zones: Mutex<Vec<MockZone>>,
    fail_resets: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockZbd {
    /// A device with `nr_zones` zones of `zone_size` bytes and the given
    /// block size. Open/active limits default to "no limit" (0).
    pub fn new(nr_zones: u32, zone_size: u64, block_size: u64) -> Self {
        let zones = (0..nr_zones as u64)
            .map(|i| MockZone {
                start: i * zone_size,
                wp: i * zone_size,
                cond: ZoneCondition::Empty,
                data: Vec::new(),
            })
            .collect();
        Self {
            nr_zones,
            zone_size,
            block_size,
            max_nr_open_zones: 0,
            max_nr_active_zones: 0,
            model: DeviceModel::HostManaged,
            zones: Mutex::new(zones),
            fail_resets: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Set the reported open/active zone limits.
    pub fn with_limits(mut self, max_open: u32, max_active: u32) -> Self {
        self.max_nr_open_zones = max_open;
        self.max_nr_active_zones = max_active;
        self
    }

    /// Report a different device model (to test the open-time rejection).
    pub fn with_model(mut self, model: DeviceModel) -> Self {
        self.model = model;
        self
    }

    /// Pre-seed a zone's condition and write-pointer offset, emulating state
    /// left behind by a previous mount.
    pub fn seed_zone(&self, index: u32, wp_offset: u64, cond: ZoneCondition) {
        let mut zones = self.zones.lock();
        let z = &mut zones[index as usize];
        z.wp = z.start + wp_offset;
        z.cond = cond;
    }

    /// Make every subsequent zone reset fail with an I/O error.
    pub fn set_reset_failure(&self, fail: bool) {
        self.fail_resets.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn zone_index(&self, offset: u64) -> Result<usize> {
        let idx = (offset / self.zone_size) as usize;
        if idx >= self.nr_zones as usize {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} beyond device end"
            )));
        }
        Ok(idx)
    }

    fn report_one(&self, z: &MockZone) -> ZoneReport {
        ZoneReport {
            start: z.start,
            wp: z.wp,
            capacity: self.zone_size,
            zone_type: ZoneType::SequentialWriteRequired,
            condition: z.cond,
        }
    }
}

impl ZbdBackend for MockZbd {
    fn info(&self) -> ZbdInfo {
        ZbdInfo {
            model: self.model,
            nr_zones: self.nr_zones,
            zone_size: self.zone_size,
            block_size: self.block_size,
            max_nr_open_zones: self.max_nr_open_zones,
            max_nr_active_zones: self.max_nr_active_zones,
        }
    }

    fn report_zones(&self) -> Result<Vec<ZoneReport>> {
        let zones = self.zones.lock();
        Ok(zones.iter().map(|z| self.report_one(z)).collect())
    }

    fn report_zone(&self, start: u64) -> Result<ZoneReport> {
        let idx = self.zone_index(start)?;
        let zones = self.zones.lock();
        Ok(self.report_one(&zones[idx]))
    }

    fn reset_zone(&self, start: u64, _len: u64) -> Result<()> {
        if self.fail_resets.load(Ordering::SeqCst) {
            return Err(Error::io("injected reset failure"));
        }
        let idx = self.zone_index(start)?;
        let mut zones = self.zones.lock();
        let z = &mut zones[idx];
        z.wp = z.start;
        z.cond = ZoneCondition::Empty;
        z.data.clear();
        Ok(())
    }

    fn finish_zone(&self, start: u64, _len: u64) -> Result<()> {
        let idx = self.zone_index(start)?;
        let mut zones = self.zones.lock();
        let z = &mut zones[idx];
        z.wp = z.start + self.zone_size;
        z.cond = ZoneCondition::Full;
        Ok(())
    }

    fn close_zone(&self, start: u64, _len: u64) -> Result<()> {
        let idx = self.zone_index(start)?;
        let mut zones = self.zones.lock();
        let z = &mut zones[idx];
        if z.cond.is_open() {
            z.cond = ZoneCondition::Closed;
        }
        Ok(())
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let idx = self.zone_index(offset)?;
        let zones = self.zones.lock();
        let z = &zones[idx];
        let in_zone = (offset - z.start) as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = z.data.get(in_zone + i).copied().unwrap_or(0);
        }
        Ok(buf.len())
    }

    fn pread_direct(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.pread(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::io("injected write failure"));
        }
        let idx = self.zone_index(offset)?;
        let mut zones = self.zones.lock();
        let zone_size = self.zone_size;
        let z = &mut zones[idx];
        if offset != z.wp {
            return Err(Error::io(format!(
                "unaligned write: offset {offset} != wp {}",
                z.wp
            )));
        }
        if z.wp + buf.len() as u64 > z.start + zone_size {
            return Err(Error::io("write crosses zone boundary"));
        }
        let in_zone = (offset - z.start) as usize;
        let end = in_zone + buf.len();
        if z.data.len() < end {
            z.data.resize(end, 0);
        }
        z.data[in_zone..end].copy_from_slice(buf);
        z.wp += buf.len() as u64;
        z.cond = if z.wp == z.start + zone_size {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImplicitOpen
        };
        Ok(buf.len())
    }
}
