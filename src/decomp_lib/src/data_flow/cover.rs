//! Live ranges of varnodes over the block graph.

use crate::prelude::*;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use super::BlockId;

/// The part of one basic block covered by a live range.
///
/// Boundaries are expressed as op *order* indices within the block. A start
/// of 0 means the range enters through the top of the block; a stop of
/// `u32::MAX` means it leaves through the bottom.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct CoverBlock {
    /// The order index where the range begins.
    pub start: u32,
    /// The order index where the range ends.
    pub stop: u32,
}

impl CoverBlock {
    /// A cover block spanning the whole basic block.
    pub const FULL: CoverBlock = CoverBlock {
        start: 0,
        stop: u32::MAX,
    };

    /// Returns the intersection level with another cover block:
    /// 0 for disjoint, 1 for touching in a single boundary point, 2 for
    /// proper overlap.
    pub fn intersect(&self, other: &CoverBlock) -> u32 {
        let start = self.start.max(other.start);
        let stop = self.stop.min(other.stop);
        if start > stop {
            0
        } else if start == stop {
            1
        } else {
            2
        }
    }

    /// Extends this cover block to also contain the other.
    pub fn merge(&mut self, other: &CoverBlock) {
        self.start = self.start.min(other.start);
        self.stop = self.stop.max(other.stop);
    }

    /// Returns true iff the op order index lies in the covered part.
    pub fn contains(&self, order: u32) -> bool {
        self.start <= order && order <= self.stop
    }
}

/// A live range: per-block intervals over the block graph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Cover {
    blocks: BTreeMap<BlockId, CoverBlock>,
}

impl Cover {
    /// Returns an empty cover.
    pub fn new() -> Cover {
        Cover::default()
    }

    /// Returns true iff the cover contains no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns the covered part of the given block, if any.
    pub fn block(&self, id: BlockId) -> Option<&CoverBlock> {
        self.blocks.get(&id)
    }

    /// Returns an iterator over the covered blocks.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &CoverBlock)> {
        self.blocks.iter()
    }

    /// Records that the range starts at op order `order` in the given block.
    pub fn add_def_point(&mut self, block: BlockId, order: u32) {
        let entry = self
            .blocks
            .entry(block)
            .or_insert(CoverBlock { start: order, stop: order });
        entry.start = entry.start.min(order);
        entry.stop = entry.stop.max(order);
    }

    /// Records that the range reaches op order `order` in the given block.
    ///
    /// Returns true iff the block was not covered before, i.e. the caller
    /// must continue propagating into predecessors. A block that is already
    /// covered has propagated through its top already.
    pub fn add_ref_point(&mut self, block: BlockId, order: u32) -> bool {
        match self.blocks.get_mut(&block) {
            Some(cb) => {
                cb.stop = cb.stop.max(order);
                false
            }
            None => {
                self.blocks.insert(block, CoverBlock { start: 0, stop: order });
                true
            }
        }
    }

    /// Marks the whole block as covered.
    ///
    /// Returns false iff the block was already fully covered.
    pub fn add_full_block(&mut self, block: BlockId) -> bool {
        match self.blocks.get_mut(&block) {
            Some(cb) if *cb == CoverBlock::FULL => false,
            Some(cb) => {
                *cb = CoverBlock::FULL;
                true
            }
            None => {
                self.blocks.insert(block, CoverBlock::FULL);
                true
            }
        }
    }

    /// Returns the intersection level with another cover: the maximum
    /// [`CoverBlock::intersect`] level over all common blocks.
    pub fn intersect(&self, other: &Cover) -> u32 {
        let mut level = 0;
        for (id, cb) in self.blocks.iter() {
            if let Some(ocb) = other.blocks.get(id) {
                level = level.max(cb.intersect(ocb));
                if level == 2 {
                    break;
                }
            }
        }
        level
    }

    /// Extends this cover to also contain the other.
    pub fn merge(&mut self, other: &Cover) {
        for (id, ocb) in other.blocks.iter() {
            self.blocks
                .entry(*id)
                .and_modify(|cb| cb.merge(ocb))
                .or_insert(*ocb);
        }
    }

    /// Returns true iff the point (block, order) lies in the cover.
    pub fn contains(&self, block: BlockId, order: u32) -> bool {
        self.blocks
            .get(&block)
            .map(|cb| cb.contains(order))
            .unwrap_or(false)
    }
}

impl Display for Cover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, cb) in self.blocks.iter() {
            write!(f, "[blk{}:{}..{}]", id.index(), cb.start, cb.stop)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_levels() {
        let mut a = Cover::new();
        a.add_def_point(BlockId(0), 2);
        a.add_ref_point(BlockId(0), 5);
        let mut b = Cover::new();
        b.add_def_point(BlockId(0), 5);
        b.add_ref_point(BlockId(0), 9);
        // Touching at order 5 only.
        assert_eq!(a.intersect(&b), 1);
        let mut c = Cover::new();
        c.add_def_point(BlockId(0), 3);
        c.add_ref_point(BlockId(0), 7);
        assert_eq!(a.intersect(&c), 2);
        let mut d = Cover::new();
        d.add_def_point(BlockId(1), 0);
        assert_eq!(a.intersect(&d), 0);
    }

    #[test]
    fn ref_point_propagation() {
        let mut cover = Cover::new();
        // A read in an uncovered block covers the block top down to the read
        // and asks for predecessor propagation.
        assert!(cover.add_ref_point(BlockId(2), 4));
        // A later read below the current stop does not propagate further.
        assert!(!cover.add_ref_point(BlockId(2), 2));
        assert!(cover.contains(BlockId(2), 0));
        assert!(!cover.contains(BlockId(2), 5));
    }
}
