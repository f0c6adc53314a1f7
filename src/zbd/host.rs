//! LSM engine collaborator surface
//!
//! The core never inspects SSTable contents itself. Key ordering, file
//! enumeration by level and key-range overlap queries are delegated to the
//! hosting LSM engine through [`LsmHost`], and key comparison/width through
//! [`InternalKeyComparator`]. The allocator uses these to colocate
//! overlapping and same-level data in the same zones.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use super::FileId;

/// Level value meaning "no level information available" for a write.
pub const NO_LEVEL_INFO: i32 = 100;

/// An internal key: user key followed by an 8-byte trailer packing the
/// sequence number and value kind, as produced by the hosting engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey(Bytes);

impl InternalKey {
    /// Build an internal key from a user key and sequence number with the
    /// regular value kind.
    pub fn new(user_key: &[u8], sequence: u64) -> Self {
        Self::from_parts(user_key, sequence, 1)
    }

    /// Build an internal key with an explicit value-kind byte.
    pub fn from_parts(user_key: &[u8], sequence: u64, kind: u8) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + 8);
        buf.extend_from_slice(user_key);
        let trailer = (sequence << 8) | kind as u64;
        buf.extend_from_slice(&trailer.to_le_bytes());
        Self(Bytes::from(buf))
    }

    /// Wrap an already-encoded internal key.
    pub fn from_encoded(encoded: Bytes) -> Self {
        Self(encoded)
    }

    /// The full encoded representation.
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// The user-key prefix (everything before the 8-byte trailer).
    pub fn user_key(&self) -> &[u8] {
        let len = self.0.len();
        if len >= 8 {
            &self.0[..len - 8]
        } else {
            &self.0
        }
    }

    fn trailer(&self) -> u64 {
        let len = self.0.len();
        if len < 8 {
            return 0;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[len - 8..]);
        u64::from_le_bytes(raw)
    }
}

/// Decoded form of an [`InternalKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInternalKey {
    pub user_key: Bytes,
    pub sequence: u64,
    pub kind: u8,
}

/// Split an internal key into user key, sequence number and kind.
/// Returns `None` if the key is too short to carry a trailer.
pub fn parse_internal_key(key: &InternalKey) -> Option<ParsedInternalKey> {
    if key.0.len() < 8 {
        return None;
    }
    let trailer = key.trailer();
    Some(ParsedInternalKey {
        user_key: key.0.slice(..key.0.len() - 8),
        sequence: trailer >> 8,
        kind: (trailer & 0xff) as u8,
    })
}

/// Ordering and geometry of internal keys.
///
/// `user_key_width` turns a pair of keys into a numeric distance; the
/// allocator divides an overlap width by a file's own width to rank
/// colocation candidates. Keeping it on the comparator makes the key
/// encoding pluggable rather than baked into the allocator.
pub trait InternalKeyComparator: Send + Sync {
    fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering;

    /// Numeric distance from `lo` to `hi` in user-key space. Implementations
    /// return 0.0 when `hi` does not sort after `lo`.
    fn user_key_width(&self, lo: &InternalKey, hi: &InternalKey) -> f64;
}

/// Comparator for engines whose user keys start with a hexadecimal run.
///
/// Keys order bytewise on the user key, then by descending sequence number.
/// Width is the difference of the hex-decoded prefixes, which matches how
/// the hosting engine spaces its keys. Keys without a leading hex digit
/// decode to 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexPrefixComparator;

impl HexPrefixComparator {
    fn hex_prefix_value(key: &[u8]) -> u64 {
        let mut value = 0u64;
        let mut digits = 0;
        for &c in key {
            let Some(d) = (c as char).to_digit(16) else {
                break;
            };
            if digits == 16 {
                break;
            }
            value = (value << 4) | d as u64;
            digits += 1;
        }
        value
    }
}

impl InternalKeyComparator for HexPrefixComparator {
    fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        match a.user_key().cmp(b.user_key()) {
            // Same user key: newer entries (higher sequence) sort first.
            Ordering::Equal => b.trailer().cmp(&a.trailer()),
            ord => ord,
        }
    }

    fn user_key_width(&self, lo: &InternalKey, hi: &InternalKey) -> f64 {
        let lo_v = Self::hex_prefix_value(lo.user_key()) as f64;
        let hi_v = Self::hex_prefix_value(hi.user_key()) as f64;
        (hi_v - lo_v).max(0.0)
    }
}

/// Queries the core consumes from the hosting LSM engine.
///
/// File lists are expected in the engine's level order (ascending smallest
/// key) so that neighbour walks in the allocator are meaningful.
pub trait LsmHost: Send + Sync {
    /// The comparator governing this engine's internal keys.
    fn comparator(&self) -> Arc<dyn InternalKeyComparator>;

    /// Number of LSM levels.
    fn level_count(&self) -> i32;

    /// File numbers of every live SSTable on `level`, in key order.
    fn same_level_file_list(&self, level: i32) -> Vec<FileId>;

    /// File numbers on adjacent levels whose key ranges overlap
    /// `[smallest, largest]`.
    fn adjacent_file_list(
        &self,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: i32,
    ) -> Vec<FileId>;

    /// File numbers on any level whose key ranges overlap
    /// `[smallest, largest]`.
    fn all_overlapping_files(&self, smallest: &InternalKey, largest: &InternalKey)
        -> Vec<FileId>;

    /// File numbers involved in the currently scheduled compaction, if any.
    fn compaction_args(&self) -> Vec<FileId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_roundtrip() {
        let key = InternalKey::from_parts(b"00ff", 42, 1);
        let parsed = parse_internal_key(&key).unwrap();
        assert_eq!(&parsed.user_key[..], b"00ff");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.kind, 1);
    }

    #[test]
    fn test_short_key_does_not_parse() {
        let key = InternalKey::from_encoded(Bytes::from_static(b"abc"));
        assert!(parse_internal_key(&key).is_none());
        assert_eq!(key.user_key(), b"abc");
    }

    #[test]
    fn test_compare_orders_by_user_key() {
        let cmp = HexPrefixComparator;
        let a = InternalKey::new(b"0001", 5);
        let b = InternalKey::new(b"0002", 5);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        assert_eq!(cmp.compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_compare_same_user_key_newer_first() {
        let cmp = HexPrefixComparator;
        let older = InternalKey::new(b"0001", 5);
        let newer = InternalKey::new(b"0001", 9);
        assert_eq!(cmp.compare(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_hex_width() {
        let cmp = HexPrefixComparator;
        let lo = InternalKey::new(b"0010", 1);
        let hi = InternalKey::new(b"0030", 1);
        assert_eq!(cmp.user_key_width(&lo, &hi), 32.0);
        // Reversed bounds clamp to zero.
        assert_eq!(cmp.user_key_width(&hi, &lo), 0.0);
    }

    #[test]
    fn test_hex_prefix_stops_at_non_hex() {
        assert_eq!(HexPrefixComparator::hex_prefix_value(b"1fz9"), 0x1f);
        assert_eq!(HexPrefixComparator::hex_prefix_value(b"zzz"), 0);
    }
}
