// File: hash.rs
//
// The purpose of this file is to hash a given key with SHA-1 into a full
// 160-bit ring identifier and to determine if a given identifier is
// between two other identifiers in the ring.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;

/// Width of a ring identifier in bytes (160 bits).
pub const ID_BYTES: usize = 20;
/// Width of a ring identifier in bits, used for finger table offsets.
pub const ID_BITS: u32 = (ID_BYTES as u32) * 8;

/// A 160-bit identifier on the Chord ring. Stored big-endian so that
/// byte-wise lexicographic comparison matches numeric ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The identifier 0, used as a harmless placeholder and in tests.
    pub fn zero() -> NodeId {
        NodeId([0u8; ID_BYTES])
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> NodeId {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(ID_BYTES * 2);
        for b in self.0.iter() {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(s: &str) -> Result<NodeId, String> {
        if s.len() != ID_BYTES * 2 {
            return Err(format!(
                "identifier must be {} hex chars, got {}",
                ID_BYTES * 2,
                s.len()
            ));
        }
        let mut bytes = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            let byte_str = &s[i * 2..i * 2 + 2];
            bytes[i] = u8::from_str_radix(byte_str, 16).map_err(|e| e.to_string())?;
        }
        Ok(NodeId(bytes))
    }

    /// Returns `self + 2^i mod 2^160`, the start of finger table entry `i`
    /// (using a 0-based offset; callers pass `i - 1` for the Chord paper's
    /// 1-based finger index).
    pub fn add_pow2(&self, i: u32) -> NodeId {
        assert!(i < ID_BITS, "offset {} exceeds identifier width", i);
        let mut bytes = self.0;
        let byte_index = ID_BYTES - 1 - (i / 8) as usize;
        let mut carry: u16 = 1u16 << (i % 8);
        let mut idx = byte_index as isize;
        while carry > 0 && idx >= 0 {
            let sum = bytes[idx as usize] as u16 + carry;
            bytes[idx as usize] = (sum & 0xFF) as u8;
            carry = sum >> 8;
            idx -= 1;
        }
        // Any carry past the most significant byte wraps around mod 2^160
        // and is simply dropped.
        NodeId(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a 40-character hex string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
        NodeId::from_hex(v).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<NodeId, D::Error> {
        deserializer.deserialize_str(NodeIdVisitor)
    }
}

/// Hashes a string into a ring identifier using SHA-1 over its UTF-8 bytes.
pub fn hash(key: &str) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.input(key.as_bytes());
    let digest = hasher.result();
    let mut bytes = [0u8; ID_BYTES];
    bytes.copy_from_slice(&digest);
    NodeId(bytes)
}

/// Returns whether `k` lies in the circular interval `(a, b)` (or `(a, b]`
/// when `inclusive_right` is set), walking clockwise from `a` to `b`.
pub fn in_interval(k: NodeId, a: NodeId, b: NodeId, inclusive_right: bool) -> bool {
    match a.cmp(&b) {
        Ordering::Less => {
            if inclusive_right {
                a < k && k <= b
            } else {
                a < k && k < b
            }
        }
        Ordering::Greater => {
            if inclusive_right {
                k > a || k <= b
            } else {
                k > a || k < b
            }
        }
        Ordering::Equal => inclusive_right && k == a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(last_byte: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1] = last_byte;
        NodeId(bytes)
    }

    #[test]
    fn hash_is_deterministic_and_full_width() {
        let a = hash("k1");
        let b = hash("k1");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), ID_BYTES * 2);
    }

    #[test]
    fn hash_differs_across_keys() {
        assert_ne!(hash("k1"), hash("k2"));
    }

    #[test]
    fn hex_round_trip() {
        let original = hash("round-trip-me");
        let hex = original.to_hex();
        let parsed = NodeId::from_hex(&hex).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn interval_simple_non_wrapping() {
        assert!(in_interval(id(15), id(10), id(20), false));
        assert!(!in_interval(id(20), id(10), id(20), false));
        assert!(in_interval(id(20), id(10), id(20), true));
        assert!(!in_interval(id(25), id(10), id(20), true));
    }

    // B4: wrap-around interval with k = 0x00...01, a = 0xff...fe, b = 0x00...02.
    #[test]
    fn interval_wrap_around() {
        let mut a_bytes = [0xffu8; ID_BYTES];
        a_bytes[ID_BYTES - 1] = 0xfe;
        let a = NodeId(a_bytes);
        let b = id(0x02);
        let k = id(0x01);
        assert!(in_interval(k, a, b, true));
    }

    #[test]
    fn interval_degenerate_equal_bounds() {
        let a = id(5);
        assert!(in_interval(id(5), a, a, true));
        assert!(!in_interval(id(5), a, a, false));
        assert!(!in_interval(id(6), a, a, true));
    }

    #[test]
    fn add_pow2_wraps_modulo_ring_size() {
        let max = NodeId([0xff; ID_BYTES]);
        let wrapped = max.add_pow2(0);
        assert_eq!(wrapped, NodeId::zero());
    }

    #[test]
    fn add_pow2_matches_manual_addition() {
        let base = id(0);
        let plus_one = base.add_pow2(0);
        assert_eq!(plus_one, id(1));
        let plus_two = base.add_pow2(1);
        assert_eq!(plus_two, id(2));
    }
}
