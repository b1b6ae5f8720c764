//! Ranges of addresses and disjoint sets thereof.

use super::{Address, SpaceId};
use crate::prelude::*;

use std::fmt::{self, Display};

/// A contiguous, non-empty range of bytes within one address space.
///
/// Stored as first and last byte offset (both inclusive) so that a range may
/// reach the very top of a space.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Range {
    space: SpaceId,
    first: u64,
    last: u64,
}

impl Range {
    /// Returns a new range covering `[first, last]` in the given space.
    pub fn new(space: SpaceId, first: u64, last: u64) -> Range {
        debug_assert!(first <= last);
        Range { space, first, last }
    }

    /// Returns the range covering `size` bytes starting at the given address.
    pub fn from_size(addr: Address, size: u64) -> Range {
        debug_assert!(size > 0);
        Range {
            space: addr.space(),
            first: addr.offset(),
            last: addr.offset() + (size - 1),
        }
    }

    /// Returns the space containing this range.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Returns the offset of the first byte.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Returns the offset of the last byte.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Returns the address of the first byte.
    pub fn first_addr(&self) -> Address {
        Address::new(self.space, self.first)
    }

    /// Returns true iff the given address lies in this range.
    pub fn contains(&self, addr: &Address) -> bool {
        addr.space() == self.space && self.first <= addr.offset() && addr.offset() <= self.last
    }

    /// Returns true iff this range and `other` share at least one byte.
    pub fn intersects(&self, other: &Range) -> bool {
        self.space == other.space && self.first <= other.last && other.first <= self.last
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[0x{:x},0x{:x}]", self.space.index(), self.first, self.last)
    }
}

/// A set of non-overlapping [`Range`]s, possibly across several spaces.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default)]
pub struct RangeList {
    /// Sorted, disjoint, non-adjacent ranges.
    ranges: Vec<Range>,
}

impl RangeList {
    /// Returns an empty range list.
    pub fn new() -> RangeList {
        RangeList { ranges: Vec::new() }
    }

    /// Returns true iff the list contains no ranges.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Removes all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Inserts the range `[first, last]` in the given space, merging with any
    /// ranges it overlaps or abuts.
    pub fn insert(&mut self, space: SpaceId, first: u64, mut last: u64) {
        let mut first = first;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;
        for range in self.ranges.iter() {
            if inserted || range.space != space {
                merged.push(*range);
                continue;
            }
            // Adjacent ranges fuse as well, hence the saturating +1 checks.
            if range.last < first && range.last.saturating_add(1) < first {
                merged.push(*range);
            } else if last < range.first && last.saturating_add(1) < range.first {
                merged.push(Range::new(space, first, last));
                merged.push(*range);
                inserted = true;
            } else {
                first = first.min(range.first);
                last = last.max(range.last);
            }
        }
        if !inserted {
            merged.push(Range::new(space, first, last));
        }
        merged.sort();
        self.ranges = merged;
    }

    /// Removes the range `[first, last]` in the given space, splitting any
    /// partially covered range.
    pub fn remove(&mut self, space: SpaceId, first: u64, last: u64) {
        let mut result = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.iter() {
            if range.space != space || range.last < first || last < range.first {
                result.push(*range);
                continue;
            }
            if range.first < first {
                result.push(Range::new(space, range.first, first - 1));
            }
            if last < range.last {
                result.push(Range::new(space, last + 1, range.last));
            }
        }
        self.ranges = result;
    }

    /// Returns true iff the given address lies in some range of the list.
    pub fn contains(&self, addr: &Address) -> bool {
        self.find_range(addr).is_some()
    }

    /// Returns true iff the whole range `[addr, addr + size)` lies in a
    /// single range of the list.
    pub fn contains_range(&self, addr: &Address, size: u64) -> bool {
        match self.find_range(addr) {
            Some(range) => addr.offset() + (size - 1) <= range.last(),
            None => false,
        }
    }

    /// Returns the range containing the given address, if any.
    pub fn find_range(&self, addr: &Address) -> Option<&Range> {
        self.ranges.iter().find(|range| range.contains(addr))
    }

    /// Restricts this list to the ranges that intersect `other`, clipped to
    /// the intersection.
    pub fn intersect(&mut self, other: &RangeList) {
        let mut result = Vec::new();
        for a in self.ranges.iter() {
            for b in other.ranges.iter() {
                if a.intersects(b) {
                    result.push(Range::new(
                        a.space,
                        a.first.max(b.first),
                        a.last.min(b.last),
                    ));
                }
            }
        }
        result.sort();
        self.ranges = result;
    }

    /// Merges all ranges of `other` into this list.
    pub fn union(&mut self, other: &RangeList) {
        for range in other.ranges.iter() {
            self.insert(range.space, range.first, range.last);
        }
    }

    /// Returns an iterator over the ranges, sorted by (space, offset).
    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }
}

impl Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_overlaps() {
        let ram = SpaceId::mock_ram();
        let mut list = RangeList::new();
        list.insert(ram, 0x10, 0x1f);
        list.insert(ram, 0x30, 0x3f);
        list.insert(ram, 0x18, 0x34);
        assert_eq!(list.iter().count(), 1);
        assert!(list.contains(&Address::new(ram, 0x25)));
        assert!(!list.contains(&Address::new(ram, 0x40)));
    }

    #[test]
    fn insert_merges_adjacent() {
        let ram = SpaceId::mock_ram();
        let mut list = RangeList::new();
        list.insert(ram, 0x10, 0x1f);
        list.insert(ram, 0x20, 0x2f);
        assert_eq!(list.iter().count(), 1);
        assert!(list.contains_range(&Address::new(ram, 0x10), 0x20));
    }

    #[test]
    fn remove_splits() {
        let ram = SpaceId::mock_ram();
        let mut list = RangeList::new();
        list.insert(ram, 0x0, 0xff);
        list.remove(ram, 0x10, 0x1f);
        assert_eq!(list.iter().count(), 2);
        assert!(list.contains(&Address::new(ram, 0xf)));
        assert!(!list.contains(&Address::new(ram, 0x10)));
        assert!(list.contains(&Address::new(ram, 0x20)));
    }

    #[test]
    fn intersection() {
        let ram = SpaceId::mock_ram();
        let reg = SpaceId::mock_register();
        let mut a = RangeList::new();
        a.insert(ram, 0x0, 0xff);
        a.insert(reg, 0x0, 0xf);
        let mut b = RangeList::new();
        b.insert(ram, 0x80, 0x180);
        a.intersect(&b);
        assert_eq!(a.iter().count(), 1);
        assert!(a.contains(&Address::new(ram, 0x80)));
        assert!(!a.contains(&Address::new(reg, 0x0)));
    }
}
