//! Shard identifiers and their canonical order.
//!
//! A shard id is a bit prefix in a binary trie: `used_bits` low-order bits of
//! `raw` are significant, read least-significant bit first. Ordering goes
//! through `to_key`, which bit-reverses the prefix and stores the prefix
//! length in the low 6 bits. That puts every shard directly before all of its
//! descendants (trie pre-order), which is the order expansion, cursor
//! resumption, and the shard database all agree on.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Widest prefix a shard id can carry.
pub const MAX_USED_BITS: u8 = 58;

const USED_BITS_MASK: u64 = 0x3f;

fn prefix_mask(used_bits: u8) -> u64 {
    if used_bits == 0 {
        0
    } else {
        u64::MAX >> (64 - u32::from(used_bits))
    }
}

/// Identifier of one shard (or super-shard) in the hierarchical namespace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId {
    used_bits: u8,
    raw: u64,
}

impl ShardId {
    /// Cursor value for a visit that has made no progress yet.
    pub const UNSET: ShardId = ShardId {
        used_bits: 0,
        raw: 0,
    };

    /// Cursor value meaning "nothing left to visit in this super-shard".
    pub const MAX_SENTINEL: ShardId = ShardId {
        used_bits: MAX_USED_BITS,
        raw: u64::MAX >> (64 - MAX_USED_BITS as u32),
    };

    /// Build a shard id, clamping the prefix length and masking off bits
    /// beyond it so equal prefixes always compare equal.
    pub fn new(used_bits: u8, raw: u64) -> Self {
        let used_bits = used_bits.min(MAX_USED_BITS);
        Self {
            used_bits,
            raw: raw & prefix_mask(used_bits),
        }
    }

    pub fn used_bits(&self) -> u8 {
        self.used_bits
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn is_set(&self) -> bool {
        *self != Self::UNSET
    }

    pub fn is_max_sentinel(&self) -> bool {
        *self == Self::MAX_SENTINEL
    }

    /// True when `other` lies in this shard's subtree (including `self`).
    pub fn contains(&self, other: &ShardId) -> bool {
        other.used_bits >= self.used_bits && other.raw & prefix_mask(self.used_bits) == self.raw
    }

    /// Every prefix of this id from the root down to (and including) itself.
    pub fn ancestors_and_self(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..=self.used_bits).map(move |bits| ShardId::new(bits, self.raw))
    }

    /// Sort key realizing the canonical order.
    pub fn to_key(&self) -> u64 {
        self.raw.reverse_bits() | u64::from(self.used_bits)
    }

    pub fn from_key(key: u64) -> Self {
        let used_bits = (key & USED_BITS_MASK) as u8;
        Self::new(used_bits, (key & !USED_BITS_MASK).reverse_bits())
    }
}

impl Ord for ShardId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_key().cmp(&other.to_key())
    }
}

impl PartialOrd for ShardId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.used_bits, self.raw)
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({self})")
    }
}

/// Failure to parse the `bits:raw` text form of a shard id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid shard id {input:?}: {reason}")]
pub struct ParseShardIdError {
    input: String,
    reason: &'static str,
}

impl FromStr for ShardId {
    type Err = ParseShardIdError;

    /// Accepts `bits:raw` where `raw` is decimal or `0x`-prefixed hex.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseShardIdError {
            input: input.to_string(),
            reason,
        };
        let (bits, raw) = input.trim().split_once(':').ok_or_else(|| err("expected bits:raw"))?;
        let used_bits = bits
            .trim()
            .parse::<u8>()
            .map_err(|_| err("bit count is not a number"))?;
        if used_bits > MAX_USED_BITS {
            return Err(err("bit count exceeds 58"));
        }
        let raw = raw.trim();
        let raw = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => raw.parse::<u64>(),
        }
        .map_err(|_| err("raw value is not a number"))?;
        if raw & !prefix_mask(used_bits) != 0 {
            return Err(err("raw value has bits beyond the prefix length"));
        }
        Ok(ShardId::new(used_bits, raw))
    }
}

impl TryFrom<String> for ShardId {
    type Error = ParseShardIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShardId> for String {
    fn from(value: ShardId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(bits: u8, raw: u64) -> ShardId {
        ShardId::new(bits, raw)
    }

    #[test]
    fn parent_sorts_before_every_descendant() {
        let parent = id(2, 0b01);
        let (left, right) = (id(3, 0b001), id(3, 0b101));
        let (left_left, left_right) = (id(4, 0b0001), id(4, 0b1001));

        let mut shards = vec![right, left_right, parent, left, left_left];
        shards.sort();
        assert_eq!(shards, vec![parent, left, left_left, left_right, right]);
    }

    #[test]
    fn subtree_is_contiguous_in_key_order() {
        let parent = id(2, 0b01);
        let sibling = id(2, 0b11);
        let below = id(6, 0b110101);
        assert!(parent.contains(&below));
        assert!(parent < below);
        assert!(below < sibling);
        assert!(!parent.contains(&sibling));
    }

    #[test]
    fn contains_is_reflexive_and_prefix_based() {
        let shard = id(3, 0b101);
        assert!(shard.contains(&shard));
        assert!(shard.contains(&id(5, 0b11101)));
        assert!(!shard.contains(&id(5, 0b11001)));
        assert!(!shard.contains(&id(2, 0b01)));
        assert!(id(2, 0b01).contains(&shard));
    }

    #[test]
    fn unset_cursor_sorts_first_and_sentinel_last() {
        let shard = id(MAX_USED_BITS, 12345);
        assert!(ShardId::UNSET < id(1, 0));
        assert!(shard < ShardId::MAX_SENTINEL);
        assert!(!ShardId::UNSET.is_set());
        assert!(ShardId::MAX_SENTINEL.is_max_sentinel());
    }

    #[test]
    fn new_masks_bits_beyond_prefix() {
        assert_eq!(id(2, 0b1101), id(2, 0b01));
        assert_eq!(id(70, 1).used_bits(), MAX_USED_BITS);
    }

    #[test]
    fn key_round_trips() {
        for shard in [id(0, 0), id(1, 1), id(17, 0x1abcd), ShardId::MAX_SENTINEL] {
            assert_eq!(ShardId::from_key(shard.to_key()), shard);
        }
    }

    #[test]
    fn parses_text_form() {
        assert_eq!("3:0x5".parse::<ShardId>().unwrap(), id(3, 0b101));
        assert_eq!("3:5".parse::<ShardId>().unwrap(), id(3, 0b101));
        assert!("3:0x9".parse::<ShardId>().is_err());
        assert!("59:0".parse::<ShardId>().is_err());
        assert!("nope".parse::<ShardId>().is_err());
        assert_eq!(id(3, 0b101).to_string(), "3:0x5");
    }

    #[test]
    fn serializes_as_text() {
        let json = serde_json::to_string(&id(4, 0b1001)).unwrap();
        assert_eq!(json, "\"4:0x9\"");
        let back: ShardId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id(4, 0b1001));
    }
}
