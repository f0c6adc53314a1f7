//! Zoned block device access layer
//!
//! Everything the core needs from the hardware goes through the [`ZbdBackend`]
//! trait: zone reports, zone state transitions and raw reads/writes at device
//! offsets. The real implementation ([`ZbdFileBackend`], `libzbd` feature)
//! drives a host-managed device through libzbd; the in-memory twin lives in
//! [`crate::zbd::mock`] behind the `mock-zbd` feature.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Device zone model as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceModel {
    /// All writes must respect zone write pointers; the only model we accept.
    HostManaged,
    /// Write-pointer violations are tolerated by the device. Not supported.
    HostAware,
}

/// Zone type. The core only ever writes to sequential-write-required zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneType {
    SequentialWriteRequired,
    Conventional,
}

/// Device-level zone condition from a zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneCondition {
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    ReadOnly,
    Full,
    Offline,
}

impl ZoneCondition {
    /// Open at the device level, implicitly or explicitly.
    pub fn is_open(self) -> bool {
        matches!(self, ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen)
    }

    /// Counts against the device's active-zone limit.
    pub fn is_active(self) -> bool {
        self.is_open() || self == ZoneCondition::Closed
    }
}

impl fmt::Display for ZoneCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneCondition::Empty => "Empty",
            ZoneCondition::ImplicitOpen => "ImplicitOpen",
            ZoneCondition::ExplicitOpen => "ExplicitOpen",
            ZoneCondition::Closed => "Closed",
            ZoneCondition::ReadOnly => "ReadOnly",
            ZoneCondition::Full => "Full",
            ZoneCondition::Offline => "Offline",
        };
        f.write_str(s)
    }
}

/// Static device geometry and limits, read once at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZbdInfo {
    pub model: DeviceModel,
    /// Total zones on the device.
    pub nr_zones: u32,
    /// Zone size in bytes (address-space stride between zone starts).
    pub zone_size: u64,
    /// Physical block size in bytes; all writes are multiples of this.
    pub block_size: u64,
    /// Maximum simultaneously open zones; 0 means "no limit".
    pub max_nr_open_zones: u32,
    /// Maximum simultaneously active zones; 0 means "no limit".
    pub max_nr_active_zones: u32,
}

/// One entry of a zone report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReport {
    /// Start offset of the zone on the device, in bytes.
    pub start: u64,
    /// Current write pointer, in bytes.
    pub wp: u64,
    /// Usable capacity of the zone in bytes (may be below the zone size).
    pub capacity: u64,
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
}

/// Low-level zoned block device operations.
///
/// Implementations must be safe to share across the writer threads and the
/// cleaner; all methods take `&self`.
pub trait ZbdBackend: Send + Sync {
    /// Device geometry and limits.
    fn info(&self) -> ZbdInfo;

    /// Report every zone on the device, in ascending start order.
    fn report_zones(&self) -> Result<Vec<ZoneReport>>;

    /// Report the single zone starting at `start`.
    fn report_zone(&self, start: u64) -> Result<ZoneReport>;

    /// Reset the zone range. All data in it is discarded and the write
    /// pointer rewinds to the zone start.
    fn reset_zone(&self, start: u64, len: u64) -> Result<()>;

    /// Transition the zone range to Full, releasing its active resources.
    fn finish_zone(&self, start: u64, len: u64) -> Result<()>;

    /// Close an open zone range.
    fn close_zone(&self, start: u64, len: u64) -> Result<()>;

    /// Buffered positional read.
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Positional read through the O_DIRECT descriptor; fallback path when
    /// the buffered read fails.
    fn pread_direct(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Positional write at `offset`, which must equal the write pointer of
    /// the containing zone. Returns the number of bytes accepted.
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize>;
}

// =============================================================================
// libzbd backend
// =============================================================================

#[cfg(feature = "libzbd")]
mod ffi {
    use std::ffi::c_char;

    pub const ZBD_VENDOR_ID_LENGTH: usize = 32;

    pub const ZBD_DM_HOST_MANAGED: u32 = 1;
    pub const ZBD_DM_HOST_AWARE: u32 = 2;

    pub const ZBD_ZONE_TYPE_CNV: u32 = 1;
    pub const ZBD_ZONE_TYPE_SWR: u32 = 2;

    pub const ZBD_ZONE_COND_NOT_WP: u32 = 0x0;
    pub const ZBD_ZONE_COND_EMPTY: u32 = 0x1;
    pub const ZBD_ZONE_COND_IMP_OPEN: u32 = 0x2;
    pub const ZBD_ZONE_COND_EXP_OPEN: u32 = 0x3;
    pub const ZBD_ZONE_COND_CLOSED: u32 = 0x4;
    pub const ZBD_ZONE_COND_READONLY: u32 = 0xd;
    pub const ZBD_ZONE_COND_FULL: u32 = 0xe;
    pub const ZBD_ZONE_COND_OFFLINE: u32 = 0xf;

    pub const ZBD_RO_ALL: u32 = 0;

    /// Mirrors `struct zbd_info` from libzbd's zbd.h.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct ZbdRawInfo {
        pub vendor_id: [c_char; ZBD_VENDOR_ID_LENGTH],
        pub nr_sectors: u64,
        pub nr_lblocks: u64,
        pub nr_pblocks: u64,
        pub zone_size: u64,
        pub zone_sectors: u32,
        pub lblock_size: u32,
        pub pblock_size: u32,
        pub nr_zones: u32,
        pub max_nr_open_zones: u32,
        pub max_nr_active_zones: u32,
        pub model: u32,
    }

    /// Mirrors `struct zbd_zone` from libzbd's zbd.h.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct ZbdRawZone {
        pub start: u64,
        pub len: u64,
        pub capacity: u64,
        pub wp: u64,
        pub flags: u32,
        pub zone_type: u32,
        pub cond: u32,
        pub reserved: [u8; 20],
    }

    extern "C" {
        pub fn zbd_open(filename: *const c_char, flags: i32, info: *mut ZbdRawInfo) -> i32;
        pub fn zbd_close(fd: i32);
        pub fn zbd_report_zones(
            fd: i32,
            ofst: u64,
            len: u64,
            ro: u32,
            zones: *mut ZbdRawZone,
            nr_zones: *mut u32,
        ) -> i32;
        pub fn zbd_reset_zones(fd: i32, ofst: u64, len: u64) -> i32;
        pub fn zbd_finish_zones(fd: i32, ofst: u64, len: u64) -> i32;
        pub fn zbd_close_zones(fd: i32, ofst: u64, len: u64) -> i32;
    }
}

/// libzbd-backed implementation of [`ZbdBackend`].
///
/// The device is opened three times: buffered read, direct read (fallback
/// path for the cleaner) and, unless read-only, `O_WRONLY | O_DIRECT` for
/// zone appends.
#[cfg(feature = "libzbd")]
pub struct ZbdFileBackend {
    filename: std::ffi::CString,
    read_fd: i32,
    read_direct_fd: i32,
    write_fd: i32,
    info: ZbdInfo,
}

#[cfg(feature = "libzbd")]
impl ZbdFileBackend {
    /// Open `/dev/<bdevname>`; `readonly` suppresses the write descriptor.
    pub fn open(bdevname: &str, readonly: bool) -> Result<Self> {
        use crate::error::Error;

        let path = format!("/dev/{bdevname}");
        let filename = std::ffi::CString::new(path.clone())
            .map_err(|_| Error::InvalidArgument(format!("bad device name {path:?}")))?;

        let mut raw: ffi::ZbdRawInfo = unsafe { std::mem::zeroed() };
        let read_fd = unsafe { ffi::zbd_open(filename.as_ptr(), libc::O_RDONLY, &mut raw) };
        if read_fd < 0 {
            return Err(Error::InvalidArgument(format!(
                "failed to open zoned block device {path}"
            )));
        }
        let read_direct_fd =
            unsafe { ffi::zbd_open(filename.as_ptr(), libc::O_RDONLY | libc::O_DIRECT, &mut raw) };
        if read_direct_fd < 0 {
            unsafe { ffi::zbd_close(read_fd) };
            return Err(Error::InvalidArgument(format!(
                "failed to open zoned block device {path} (direct)"
            )));
        }
        let write_fd = if readonly {
            -1
        } else {
            let fd = unsafe {
                ffi::zbd_open(filename.as_ptr(), libc::O_WRONLY | libc::O_DIRECT, &mut raw)
            };
            if fd < 0 {
                unsafe {
                    ffi::zbd_close(read_fd);
                    ffi::zbd_close(read_direct_fd);
                }
                return Err(Error::InvalidArgument(format!(
                    "failed to open zoned block device {path} for writing"
                )));
            }
            fd
        };

        let model = match raw.model {
            ffi::ZBD_DM_HOST_MANAGED => DeviceModel::HostManaged,
            ffi::ZBD_DM_HOST_AWARE => DeviceModel::HostAware,
            other => {
                unsafe {
                    ffi::zbd_close(read_fd);
                    ffi::zbd_close(read_direct_fd);
                    if write_fd >= 0 {
                        ffi::zbd_close(write_fd);
                    }
                }
                return Err(Error::NotSupported(format!("unknown device model {other}")));
            }
        };

        let info = ZbdInfo {
            model,
            nr_zones: raw.nr_zones,
            zone_size: raw.zone_size,
            block_size: raw.pblock_size as u64,
            max_nr_open_zones: raw.max_nr_open_zones,
            max_nr_active_zones: raw.max_nr_active_zones,
        };

        Ok(Self {
            filename,
            read_fd,
            read_direct_fd,
            write_fd,
            info,
        })
    }

    /// Device node path this backend was opened from.
    pub fn filename(&self) -> &str {
        self.filename.to_str().unwrap_or("<non-utf8>")
    }

    fn convert_zone(raw: &ffi::ZbdRawZone) -> ZoneReport {
        let zone_type = if raw.zone_type == ffi::ZBD_ZONE_TYPE_CNV {
            ZoneType::Conventional
        } else {
            ZoneType::SequentialWriteRequired
        };
        let condition = match raw.cond {
            ffi::ZBD_ZONE_COND_EMPTY => ZoneCondition::Empty,
            ffi::ZBD_ZONE_COND_IMP_OPEN => ZoneCondition::ImplicitOpen,
            ffi::ZBD_ZONE_COND_EXP_OPEN => ZoneCondition::ExplicitOpen,
            ffi::ZBD_ZONE_COND_CLOSED => ZoneCondition::Closed,
            ffi::ZBD_ZONE_COND_READONLY => ZoneCondition::ReadOnly,
            ffi::ZBD_ZONE_COND_FULL => ZoneCondition::Full,
            ffi::ZBD_ZONE_COND_OFFLINE => ZoneCondition::Offline,
            _ => ZoneCondition::ReadOnly,
        };
        ZoneReport {
            start: raw.start,
            wp: raw.wp,
            capacity: raw.capacity,
            zone_type,
            condition,
        }
    }

    fn report_range(&self, start: u64, len: u64) -> Result<Vec<ZoneReport>> {
        let max = (len / self.info.zone_size).max(1) as usize;
        let mut raw: Vec<ffi::ZbdRawZone> = vec![unsafe { std::mem::zeroed() }; max];
        let mut nr: u32 = max as u32;
        let ret = unsafe {
            ffi::zbd_report_zones(self.read_fd, start, len, ffi::ZBD_RO_ALL, raw.as_mut_ptr(), &mut nr)
        };
        if ret != 0 {
            return Err(crate::error::Error::io(format!("zone report failed: {ret}")));
        }
        raw.truncate(nr as usize);
        Ok(raw.iter().map(Self::convert_zone).collect())
    }
}

#[cfg(feature = "libzbd")]
impl Drop for ZbdFileBackend {
    fn drop(&mut self) {
        unsafe {
            ffi::zbd_close(self.read_fd);
            ffi::zbd_close(self.read_direct_fd);
            if self.write_fd >= 0 {
                ffi::zbd_close(self.write_fd);
            }
        }
    }
}

#[cfg(feature = "libzbd")]
impl ZbdBackend for ZbdFileBackend {
    fn info(&self) -> ZbdInfo {
        self.info.clone()
    }

    fn report_zones(&self) -> Result<Vec<ZoneReport>> {
        let span = self.info.nr_zones as u64 * self.info.zone_size;
        self.report_range(0, span)
    }

    fn report_zone(&self, start: u64) -> Result<ZoneReport> {
        let mut zones = self.report_range(start, self.info.zone_size)?;
        if zones.is_empty() {
            return Err(crate::error::Error::io("zone report returned no zones"));
        }
        Ok(zones.remove(0))
    }

    fn reset_zone(&self, start: u64, len: u64) -> Result<()> {
        let ret = unsafe { ffi::zbd_reset_zones(self.write_fd, start, len) };
        if ret != 0 {
            return Err(crate::error::Error::io("zone reset failed"));
        }
        Ok(())
    }

    fn finish_zone(&self, start: u64, len: u64) -> Result<()> {
        let ret = unsafe { ffi::zbd_finish_zones(self.write_fd, start, len) };
        if ret != 0 {
            return Err(crate::error::Error::io("zone finish failed"));
        }
        Ok(())
    }

    fn close_zone(&self, start: u64, len: u64) -> Result<()> {
        let ret = unsafe { ffi::zbd_close_zones(self.write_fd, start, len) };
        if ret != 0 {
            return Err(crate::error::Error::io("zone close failed"));
        }
        Ok(())
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = unsafe {
            libc::pread(
                self.read_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(n as usize)
    }

    fn pread_direct(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = unsafe {
            libc::pread(
                self.read_direct_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(n as usize)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.write_fd < 0 {
            return Err(crate::error::Error::InvalidArgument(
                "device opened read-only".into(),
            ));
        }
        let n = unsafe {
            libc::pwrite(
                self.write_fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(n as usize)
    }
}
