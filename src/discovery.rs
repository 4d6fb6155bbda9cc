use std::collections::BTreeSet;
use std::num::NonZeroU8;

use crate::bits::bit_value;

/// Machine input registers holding the configured zone bitmaps.
pub const ZONE_BITMAP_ADDRESS: u16 = 9;
pub const ZONE_BITMAP_COUNT: u16 = 2;

/// Identifier of a zone within a machine, `1..=16`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct ZoneId(NonZeroU8);

impl ZoneId {
    pub const MAX: u8 = 16;
    /// Register address distance between consecutive zones.
    pub const STRIDE: u16 = 256;

    pub const fn new(id: u8) -> Option<Self> {
        if id > Self::MAX {
            return None;
        }
        match NonZeroU8::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub const fn get(self) -> u8 {
        self.0.get()
    }

    /// First register of this zone's block.
    pub const fn base_address(self) -> u16 {
        self.0.get() as u16 * Self::STRIDE
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ZoneId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.parse::<u8>().map_err(|e| e.to_string())?;
        Self::new(id).ok_or_else(|| format!("zone ids range from 1 to {}", Self::MAX))
    }
}

/// Derive the configured zones from the two zone bitmaps.
///
/// Bit `i` of `first` marks zone `i + 1`, bit `i` of `second` marks zone `i + 9`.
pub fn discover_zones(first: u16, second: u16) -> BTreeSet<ZoneId> {
    let first = (0..16).filter(|&bit| bit_value(first, bit)).map(|bit| bit + 1);
    let second = (0..16).filter(|&bit| bit_value(second, bit)).map(|bit| bit + 9);
    first.chain(second).filter_map(ZoneId::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(zones: &BTreeSet<ZoneId>) -> Vec<u8> {
        zones.iter().map(|z| z.get()).collect()
    }

    #[test]
    fn zones_from_both_bitmaps() {
        let zones = discover_zones(0b0000_0000_0000_0101, 0b0000_0000_0000_0010);
        assert_eq!(ids(&zones), [1, 3, 10]);
    }

    #[test]
    fn no_zones() {
        assert!(discover_zones(0, 0).is_empty());
    }

    #[test]
    fn all_zones() {
        let zones = discover_zones(0x00ff, 0x00ff);
        assert_eq!(ids(&zones), (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn overlapping_ids_are_merged() {
        // Bit 8 of the first bitmap and bit 0 of the second both name zone 9.
        let zones = discover_zones(1 << 8, 1);
        assert_eq!(ids(&zones), [9]);
    }

    #[test]
    fn ids_past_sixteen_are_dropped() {
        let zones = discover_zones(0, 0xff00);
        assert!(zones.is_empty());
    }

    #[test]
    fn rediscovery_is_idempotent() {
        assert_eq!(discover_zones(0x1234, 0x0042), discover_zones(0x1234, 0x0042));
    }

    #[test]
    fn zone_zero_is_invalid() {
        assert!(ZoneId::new(0).is_none());
        assert!(ZoneId::new(17).is_none());
        assert_eq!(ZoneId::new(3).unwrap().base_address(), 768);
        assert!("0".parse::<ZoneId>().is_err());
        assert_eq!("12".parse::<ZoneId>().unwrap().get(), 12);
    }
}
