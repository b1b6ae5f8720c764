//! Addresses, address spaces and ranges.
//!
//! Every byte that the decompiler can reason about lives in an address space:
//! RAM, processor registers, compiler temporaries, constants and so on. An
//! [`Address`] is simply a space together with an offset. Registers are not
//! special; they are modelled as bytes in their own space. Indirection through
//! pointers only exists via the LOAD and STORE operations.

use crate::prelude::*;

use std::fmt::{self, Display};

mod join;
mod range;
mod space;

pub use join::JoinRecord;
pub use range::{Range, RangeList};
pub use space::{AddrSpace, AddrSpaceManager, SpaceId, SpaceKind};

/// A low-level machine address: an address space together with a byte offset.
///
/// Equality and ordering are by (space index, offset). An address in the
/// invalid space is the *null* address. An address in the constant space
/// carries its value in the offset.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Address {
    space: SpaceId,
    offset: u64,
}

impl Address {
    /// Returns a new address in the given space.
    pub fn new(space: SpaceId, offset: u64) -> Address {
        Address { space, offset }
    }

    /// Returns the null address.
    pub fn invalid() -> Address {
        Address {
            space: SpaceId::INVALID,
            offset: 0,
        }
    }

    /// Returns an address in the constant space holding the given value.
    pub fn constant(value: u64) -> Address {
        Address {
            space: SpaceId::CONSTANT,
            offset: value,
        }
    }

    /// Returns true iff this is the null address.
    pub fn is_invalid(&self) -> bool {
        self.space == SpaceId::INVALID
    }

    /// Returns true iff this address lies in the constant space.
    pub fn is_constant(&self) -> bool {
        self.space == SpaceId::CONSTANT
    }

    /// Returns the space this address lies in.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Returns the byte offset within the space.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the address `count` bytes after this one, wrapping at the top
    /// of the space.
    pub fn add_wrap(&self, count: u64) -> Address {
        Address {
            space: self.space,
            offset: self.offset.wrapping_add(count),
        }
    }

    /// Determines how the byte range starting `skip` bytes into this address
    /// overlaps the range `[op, op + size)`.
    ///
    /// Returns the index of the byte `self + skip` within the given range, or
    /// `None` if the byte lies outside the range or in a different space.
    pub fn overlap(&self, skip: u64, op: &Address, size: u64) -> Option<u64> {
        if self.space != op.space || self.space == SpaceId::CONSTANT {
            return None;
        }
        let dist = self.offset.wrapping_add(skip).wrapping_sub(op.offset);
        if dist >= size {
            return None;
        }
        Some(dist)
    }

    /// Returns true iff the range `[self, self + sz)` forms a contiguous
    /// region with `[loaddr, loaddr + losz)` as its most significant part.
    pub fn is_contiguous(&self, sz: u64, loaddr: &Address, losz: u64, big_endian: bool) -> bool {
        if self.space != loaddr.space {
            return false;
        }
        if big_endian {
            self.offset.wrapping_add(sz) == loaddr.offset
        } else {
            loaddr.offset.wrapping_add(losz) == self.offset
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "<invalid>")
        } else {
            write!(f, "{}:0x{:x}", self.space.index(), self.offset)
        }
    }
}

/// A (space, offset, size) triple describing the storage of a value.
///
/// This is the wire form of a varnode: raw p-code handed to the flow builder
/// refers to its inputs and outputs through these descriptors.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct VarnodeData {
    /// The storage location.
    pub addr: Address,
    /// The size in bytes.
    pub size: u32,
}

impl VarnodeData {
    /// Returns a new storage descriptor.
    pub fn new(addr: Address, size: u32) -> VarnodeData {
        VarnodeData { addr, size }
    }
}

impl Display for VarnodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.size)
    }
}

/// A unique label for a PcodeOp.
///
/// Several p-code operations generated for a single machine instruction share
/// one address, so ops are distinguished by the instruction address plus a
/// *uniquifier* assigned at creation time. The uniquifier is stable for the
/// life of the op; the separate intra-block order of an op may change as the
/// graph is transformed.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct SeqNum {
    pc: Address,
    uniq: u32,
}

impl SeqNum {
    /// Returns a new sequence number.
    pub fn new(pc: Address, uniq: u32) -> SeqNum {
        SeqNum { pc, uniq }
    }

    /// Returns the instruction address.
    pub fn addr(&self) -> Address {
        self.pc
    }

    /// Returns the uniquifier.
    pub fn uniq(&self) -> u32 {
        self.uniq
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pc, self.uniq)
    }
}

/// Returns a mask covering the given number of bytes, i.e. `0xff` for size 1.
///
/// Sizes of 8 bytes and above saturate to the all-ones mask.
pub fn calc_mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Sign-extends the value of the given byte width to 64 bits.
pub fn sign_extend(value: u64, size: u32) -> i64 {
    if size >= 8 {
        return value as i64;
    }
    let shift = 64 - size * 8;
    ((value << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_overlap() {
        let ram = SpaceId::mock_ram();
        let a = Address::new(ram, 0x1000);
        let b = Address::new(ram, 0x0ffc);
        assert_eq!(a.overlap(0, &b, 8), Some(4));
        assert_eq!(a.overlap(4, &b, 8), None);
        assert_eq!(Address::constant(4).overlap(0, &Address::constant(4), 8), None);
    }

    #[test]
    fn masks() {
        assert_eq!(calc_mask(1), 0xff);
        assert_eq!(calc_mask(4), 0xffff_ffff);
        assert_eq!(calc_mask(8), u64::MAX);
        assert_eq!(sign_extend(0xff, 1), -1);
        assert_eq!(sign_extend(0x7f, 1), 127);
    }
}
