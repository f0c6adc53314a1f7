//! zonestor - Zone Management Core for Zoned Block Devices
//!
//! zonestor is the zone-management and space-reclamation core of a
//! filesystem backend for host-managed zoned block devices (ZBDs), built to
//! carry an LSM-tree SSTable store. A ZBD exposes storage as an array of
//! fixed-size zones that must be written sequentially and can only be
//! rewritten wholesale, with device-enforced caps on how many zones are
//! open and active at once.
//!
//! The core provides:
//!
//! - the zone state model under the write-pointer discipline
//! - extent tracking tying live byte ranges to zones and owning files
//! - a write-target allocator that colocates overlapping and
//!   similarly-lived data while respecting the open/active caps
//! - zone cleaning: victim selection by invalid bytes, live-extent
//!   evacuation into a reserved pool, and zone resets
//!
//! The LSM engine itself (compaction, MVCC, key comparison) and the
//! metadata log are collaborators: the engine is plugged in through
//! [`zbd::host::LsmHost`], and the metadata log replays the persistent
//! file→extent mapping back into the core at startup.
//!
//! # Modules
//!
//! - [`error`] - Error types
//! - [`zbd`] - The zone management core (feature-gated on a backend)
//!
//! # Features
//!
//! - `libzbd` - real device access through libzbd
//! - `mock-zbd` - in-memory device emulation (default; used by the tests)
//! - `lazy` - disable pre-emptive cleaning in the allocator
//! - `experiment` - emit copied-byte accounting from the cleaner

pub mod error;

// Zone management core: needs a device backend to be useful.
#[cfg(any(feature = "libzbd", feature = "mock-zbd"))]
pub mod zbd;

pub use error::{Error, Result};
