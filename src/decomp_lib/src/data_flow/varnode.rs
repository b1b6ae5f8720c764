//! Varnodes: the values of the SSA graph.

use crate::address::{calc_mask, Address};
use crate::datatype::DataType;
use crate::prelude::*;

use std::fmt::{self, Display};
use std::sync::Arc;

use super::{Cover, HighId, OpId};

/// Boolean properties of a [`Varnode`].
pub mod varnode_flags {
    /// The varnode is a formal input to the function.
    pub const INPUT: u32 = 0x1;
    /// The varnode holds a constant; its address offset is the value.
    pub const CONSTANT: u32 = 0x2;
    /// The varnode is an annotation marker, not part of data-flow.
    pub const ANNOTATION: u32 = 0x4;
    /// The storage is read-only memory.
    pub const READONLY: u32 = 0x8;
    /// The storage persists beyond the lifetime of the function.
    pub const PERSIST: u32 = 0x10;
    /// The value must be stored at its address; other storage may alias it.
    pub const ADDRTIED: u32 = 0x20;
    /// The value must be kept at its address even if it looks dead.
    pub const ADDRFORCE: u32 = 0x40;
    /// The data-type may not be changed by analysis.
    pub const TYPELOCK: u32 = 0x80;
    /// The symbol name may not be changed by analysis.
    pub const NAMELOCK: u32 = 0x100;
    /// The varnode was created out of nothing by an INDIRECT op.
    pub const INDIRECT_CREATION: u32 = 0x200;
    /// The varnode is bound to a symbol in the database.
    pub const MAPPED: u32 = 0x400;
    /// The copy producing this varnode carries no information.
    pub const INCIDENTAL_COPY: u32 = 0x800;
    /// The varnode is excluded from SSA linking (already rewritten).
    pub const WRITEMASK: u32 = 0x1000;
    /// The varnode takes part in the current heritage pass.
    pub const ACTIVE_HERITAGE: u32 = 0x2000;
    /// The storage is unaffected by calls (per the prototype model).
    pub const UNAFFECTED: u32 = 0x4000;
    /// The varnode holds the return address of the function.
    pub const RETURN_ADDRESS: u32 = 0x8000;
    /// The storage is volatile memory.
    pub const VOLATILE: u32 = 0x10000;
    /// The varnode must stay live even without reads (landing pads etc.).
    pub const AUTOLIVE: u32 = 0x20000;
    /// The storage is the base register of a space (stack pointer etc.).
    pub const SPACEBASE: u32 = 0x40000;
}

/// One value or location in the SSA graph.
///
/// A varnode is identified by its size, its address, and (for written
/// varnodes) its unique defining op. A varnode with no defining op and no
/// input flag is *free*: its relationship to the data-flow has not been
/// determined yet.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Varnode {
    /// The size of the value in bytes.
    size: u32,
    /// The storage location. Constants store their value in the offset.
    addr: Address,
    /// The op producing this value, if any.
    def: Option<OpId>,
    /// Boolean properties.
    flags: u32,
    /// The ops reading this value.
    descend: Vec<OpId>,
    /// The data-type, once one has been assigned.
    datatype: Option<Arc<DataType>>,
    /// Bits that may possibly be non-zero in any reachable value.
    nzmask: u64,
    /// The live range, once computed.
    cover: Option<Cover>,
    /// The high-level variable grouping, once computed.
    high: Option<HighId>,
    /// Monotonic creation index, used for phase boundaries.
    create_index: u32,
}

impl Varnode {
    pub(crate) fn new(size: u32, addr: Address, create_index: u32) -> Varnode {
        let mut flags = 0;
        let mut nzmask = calc_mask(size);
        if addr.is_constant() {
            flags |= varnode_flags::CONSTANT;
            nzmask = addr.offset() & nzmask;
        }
        Varnode {
            size,
            addr,
            def: None,
            flags,
            descend: Vec::new(),
            datatype: None,
            nzmask,
            cover: None,
            high: None,
            create_index,
        }
    }

    /// Returns the size of the value in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the storage location.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Returns the op defining this value, if any.
    pub fn def(&self) -> Option<OpId> {
        self.def
    }

    /// Returns true iff the varnode is the output of an op.
    pub fn is_written(&self) -> bool {
        self.def.is_some()
    }

    /// Returns true iff the varnode is a formal function input.
    pub fn is_input(&self) -> bool {
        self.flags & varnode_flags::INPUT != 0
    }

    /// Returns true iff the varnode holds a constant.
    pub fn is_constant(&self) -> bool {
        self.flags & varnode_flags::CONSTANT != 0
    }

    /// Returns the constant value.
    ///
    /// Only meaningful if [`is_constant`](Self::is_constant) holds.
    pub fn constant_value(&self) -> u64 {
        self.addr.offset()
    }

    /// Returns true iff the varnode is free: neither written nor an input.
    pub fn is_free(&self) -> bool {
        self.def.is_none() && !self.is_input() && !self.is_constant()
    }

    /// Returns true iff the relationship of this varnode to the data-flow
    /// is fully known.
    pub fn is_heritage_known(&self) -> bool {
        self.is_written() || self.is_input() || self.is_constant() || self.is_annotation()
    }

    /// Returns true iff this is an annotation marker.
    pub fn is_annotation(&self) -> bool {
        self.flags & varnode_flags::ANNOTATION != 0
    }

    /// Returns true iff the given flag bits are all set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    /// Returns all flag bits.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub(crate) fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub(crate) fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub(crate) fn set_def(&mut self, def: Option<OpId>) {
        self.def = def;
    }

    /// Returns the ops reading this value.
    pub fn descendants(&self) -> &[OpId] {
        &self.descend
    }

    /// Returns true iff no op reads this value.
    pub fn has_no_descend(&self) -> bool {
        self.descend.is_empty()
    }

    /// Returns the single reading op, if there is exactly one.
    pub fn lone_descend(&self) -> Option<OpId> {
        match self.descend.as_slice() {
            [op] => Some(*op),
            _ => None,
        }
    }

    pub(crate) fn add_descend(&mut self, op: OpId) {
        self.descend.push(op);
    }

    pub(crate) fn remove_descend(&mut self, op: OpId) {
        if let Some(pos) = self.descend.iter().position(|&o| o == op) {
            self.descend.remove(pos);
        }
    }

    /// Returns the data-type, if one has been assigned.
    pub fn datatype(&self) -> Option<&Arc<DataType>> {
        self.datatype.as_ref()
    }

    /// Assigns the data-type.
    ///
    /// Type-locked varnodes only accept types of their locked size.
    pub fn set_datatype(&mut self, datatype: Arc<DataType>) -> bool {
        if self.has_flag(varnode_flags::TYPELOCK) && datatype.size() != self.size {
            return false;
        }
        self.datatype = Some(datatype);
        true
    }

    /// Returns the known non-zero bits mask.
    pub fn nzmask(&self) -> u64 {
        self.nzmask
    }

    pub(crate) fn set_nzmask(&mut self, nzmask: u64) {
        self.nzmask = nzmask & calc_mask(self.size);
    }

    /// Returns the live range, if computed.
    pub fn cover(&self) -> Option<&Cover> {
        self.cover.as_ref()
    }

    pub(crate) fn set_cover(&mut self, cover: Option<Cover>) {
        self.cover = cover;
    }

    /// Returns the high-level variable this varnode belongs to, if any.
    pub fn high(&self) -> Option<HighId> {
        self.high
    }

    pub(crate) fn set_high(&mut self, high: Option<HighId>) {
        self.high = high;
    }

    /// Returns the creation index of this varnode.
    pub fn create_index(&self) -> u32 {
        self.create_index
    }

    /// Determines the overlap of this varnode onto the range
    /// `[addr, addr + size)`: the index of this varnode's first byte within
    /// the range, or `None` for no containment.
    pub fn overlap(&self, addr: &Address, size: u64) -> Option<u64> {
        let start = self.addr.overlap(0, addr, size)?;
        if start + self.size as u64 <= size {
            Some(start)
        } else {
            None
        }
    }
}

impl Display for Varnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_constant() {
            write!(f, "#0x{:x}:{}", self.constant_value(), self.size)
        } else {
            write!(f, "{}:{}", self.addr, self.size)
        }
    }
}
