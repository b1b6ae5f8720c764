//! Owned collections of varnodes and ops with their lookup indices.

use crate::address::{Address, SeqNum, SpaceId};
use crate::prelude::*;

use std::collections::BTreeMap;

use super::{OpCode, OpId, PcodeOp, Varnode, VarnodeId};

/// Location sort key: (space, offset, size, creation index).
///
/// The creation index makes keys unique while keeping iteration over a
/// storage range deterministic.
type LocKey = (SpaceId, u64, u32, u32);

/// Definition sort key: location plus the sequence number of the defining op.
type DefKey = (SpaceId, u64, u32, SeqNum, u32);

/// The owned collection of all varnodes of one function.
///
/// Every varnode reachable from any op is present in the bank. Two indices
/// are maintained: the *location tree* sorted by storage address and the
/// *definition tree* sorted by storage address plus defining op, giving
/// `O(log n)` lookup of written varnodes.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VarnodeBank {
    arena: Vec<Option<Varnode>>,
    loc_tree: BTreeMap<LocKey, VarnodeId>,
    def_tree: BTreeMap<DefKey, VarnodeId>,
    create_count: u32,
}

impl VarnodeBank {
    /// Returns an empty bank.
    pub fn new() -> VarnodeBank {
        VarnodeBank::default()
    }

    /// Returns the monotonic creation counter, used for phase boundaries.
    pub fn create_count(&self) -> u32 {
        self.create_count
    }

    /// Returns the number of live varnodes.
    pub fn len(&self) -> usize {
        self.loc_tree.len()
    }

    /// Returns true iff the bank holds no varnodes.
    pub fn is_empty(&self) -> bool {
        self.loc_tree.is_empty()
    }

    /// Creates a free varnode at the given location.
    pub fn create(&mut self, size: u32, addr: Address) -> VarnodeId {
        let create_index = self.create_count;
        self.create_count += 1;
        let vn = Varnode::new(size, addr, create_index);
        let id = VarnodeId(self.arena.len() as u32);
        self.loc_tree
            .insert((addr.space(), addr.offset(), size, create_index), id);
        self.arena.push(Some(vn));
        id
    }

    /// Returns the varnode with the given id.
    ///
    /// Panics if the varnode has been destroyed; ids must not be used after
    /// destruction.
    pub fn varnode(&self, id: VarnodeId) -> &Varnode {
        self.arena[id.index()]
            .as_ref()
            .expect("dereference of destroyed varnode")
    }

    /// Returns the varnode with the given id.
    pub fn varnode_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        self.arena[id.index()]
            .as_mut()
            .expect("dereference of destroyed varnode")
    }

    /// Returns true iff the id refers to a live varnode.
    pub fn is_live(&self, id: VarnodeId) -> bool {
        self.arena
            .get(id.index())
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Records the defining op of a free varnode, moving it into the
    /// definition index.
    ///
    /// `def_seq` is the sequence number of the defining op.
    pub fn set_def(&mut self, id: VarnodeId, op: OpId, def_seq: SeqNum) -> Result<(), Error> {
        let vn = self.varnode(id);
        if vn.is_written() {
            bail!("output varnode {} is already defined", vn);
        }
        let key = (vn.addr().space(), vn.addr().offset(), vn.size(), def_seq, id.0);
        self.varnode_mut(id).set_def(Some(op));
        self.def_tree.insert(key, id);
        Ok(())
    }

    /// Clears the defining op of a varnode, making it free again.
    pub fn clear_def(&mut self, id: VarnodeId, def_seq: SeqNum) {
        let vn = self.varnode(id);
        let key = (vn.addr().space(), vn.addr().offset(), vn.size(), def_seq, id.0);
        self.def_tree.remove(&key);
        self.varnode_mut(id).set_def(None);
    }

    /// Destroys a varnode. Only free varnodes without readers may be
    /// destroyed.
    pub fn destroy(&mut self, id: VarnodeId) -> Result<(), Error> {
        let vn = self.varnode(id);
        if vn.is_written() {
            bail!("attempt to destroy written varnode {}", vn);
        }
        if !vn.has_no_descend() {
            bail!("attempt to destroy varnode {} that still has readers", vn);
        }
        let key = (
            vn.addr().space(),
            vn.addr().offset(),
            vn.size(),
            vn.create_index(),
        );
        self.loc_tree.remove(&key);
        self.arena[id.index()] = None;
        Ok(())
    }

    /// Finds a written varnode by location and defining op address.
    ///
    /// If `uniq` is given, the defining op must carry exactly that
    /// uniquifier; otherwise the first match in sequence order is returned.
    pub fn find_written(
        &self,
        size: u32,
        addr: Address,
        def_addr: Address,
        uniq: Option<u32>,
    ) -> Option<VarnodeId> {
        let lower = (
            addr.space(),
            addr.offset(),
            size,
            SeqNum::new(def_addr, 0),
            0u32,
        );
        let upper = (
            addr.space(),
            addr.offset(),
            size,
            SeqNum::new(def_addr, u32::MAX),
            u32::MAX,
        );
        self.def_tree
            .range(lower..=upper)
            .find(|((_, _, _, seq, _), _)| match uniq {
                Some(uniq) => seq.uniq() == uniq,
                None => true,
            })
            .map(|(_, &id)| id)
    }

    /// Returns the ids of all varnodes whose start lies in
    /// `[addr, addr + size)`, in location order.
    pub fn ids_in_range(&self, addr: Address, size: u64) -> Vec<VarnodeId> {
        let lower = (addr.space(), addr.offset(), 0u32, 0u32);
        let end = addr.offset().checked_add(size);
        self.loc_tree
            .range(lower..)
            .take_while(|((space, offset, _, _), _)| {
                *space == addr.space()
                    && match end {
                        Some(end) => *offset < end,
                        None => true,
                    }
            })
            .map(|(_, &id)| id)
            .collect()
    }

    /// Returns the ids of all varnodes in the given space, in location order.
    pub fn ids_in_space(&self, space: SpaceId) -> Vec<VarnodeId> {
        let lower = (space, 0u64, 0u32, 0u32);
        self.loc_tree
            .range(lower..)
            .take_while(|((spc, _, _, _), _)| *spc == space)
            .map(|(_, &id)| id)
            .collect()
    }

    /// Returns the ids of all varnodes, in location order.
    pub fn ids(&self) -> Vec<VarnodeId> {
        self.loc_tree.values().copied().collect()
    }

    /// Returns the ids of all written varnodes, sorted by location and then
    /// by definition site.
    pub fn ids_defined(&self) -> Vec<VarnodeId> {
        self.def_tree.values().copied().collect()
    }
}

/// The owned collection of all p-code ops of one function.
///
/// Ops are *alive* (attached to a block), *dead* (detached), or destroyed.
/// Both lists are sorted by sequence number, which makes every whole-graph
/// iteration deterministic. Alive ops are additionally indexed by op-code.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct OpBank {
    arena: Vec<Option<PcodeOp>>,
    alive: BTreeMap<SeqNum, OpId>,
    dead: BTreeMap<SeqNum, OpId>,
    by_code: BTreeMap<(OpCode, SeqNum), OpId>,
    uniq_counter: u32,
}

impl OpBank {
    /// Returns an empty bank.
    pub fn new() -> OpBank {
        OpBank::default()
    }

    /// Creates a new op in the dead list.
    pub fn create(&mut self, opcode: OpCode, pc: Address) -> OpId {
        let seq = SeqNum::new(pc, self.uniq_counter);
        self.uniq_counter += 1;
        let id = OpId(self.arena.len() as u32);
        self.arena.push(Some(PcodeOp::new(opcode, seq)));
        self.dead.insert(seq, id);
        id
    }

    /// Creates a new op in the dead list with an explicit sequence number.
    ///
    /// Used when restoring serialized state; the uniquifier counter advances
    /// past the restored value.
    pub(crate) fn create_with_seq(&mut self, opcode: OpCode, seq: SeqNum) -> OpId {
        self.uniq_counter = self.uniq_counter.max(seq.uniq() + 1);
        let id = OpId(self.arena.len() as u32);
        self.arena.push(Some(PcodeOp::new(opcode, seq)));
        self.dead.insert(seq, id);
        id
    }

    /// Returns the op with the given id.
    ///
    /// Panics if the op has been destroyed.
    pub fn op(&self, id: OpId) -> &PcodeOp {
        self.arena[id.index()]
            .as_ref()
            .expect("dereference of destroyed op")
    }

    /// Returns the op with the given id.
    pub fn op_mut(&mut self, id: OpId) -> &mut PcodeOp {
        self.arena[id.index()]
            .as_mut()
            .expect("dereference of destroyed op")
    }

    /// Returns true iff the id refers to a live op.
    pub fn is_live(&self, id: OpId) -> bool {
        self.arena
            .get(id.index())
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Moves the op from the dead to the alive list.
    pub fn mark_alive(&mut self, id: OpId) {
        let op = self.op(id);
        let seq = op.seq();
        let code = op.code();
        self.dead.remove(&seq);
        self.alive.insert(seq, id);
        self.by_code.insert((code, seq), id);
        self.op_mut(id).clear_flag(super::op_flags::DEAD);
    }

    /// Moves the op from the alive to the dead list.
    pub fn mark_dead(&mut self, id: OpId) {
        let op = self.op(id);
        let seq = op.seq();
        let code = op.code();
        self.alive.remove(&seq);
        self.by_code.remove(&(code, seq));
        self.dead.insert(seq, id);
        self.op_mut(id).set_flag(super::op_flags::DEAD);
    }

    /// Changes the op-code of an op in place, rebinding the per-code index.
    pub fn set_opcode(&mut self, id: OpId, opcode: OpCode) {
        let op = self.op(id);
        let seq = op.seq();
        let old = op.code();
        if !op.is_dead() {
            self.by_code.remove(&(old, seq));
            self.by_code.insert((opcode, seq), id);
        }
        self.op_mut(id).set_code(opcode);
    }

    /// Destroys a dead op.
    pub fn destroy(&mut self, id: OpId) -> Result<(), Error> {
        let op = self.op(id);
        if !op.is_dead() {
            bail!("attempt to destroy alive op {}", op);
        }
        let seq = op.seq();
        self.dead.remove(&seq);
        self.arena[id.index()] = None;
        Ok(())
    }

    /// Returns the alive op with the given sequence number, if any.
    pub fn find_alive(&self, seq: SeqNum) -> Option<OpId> {
        self.alive.get(&seq).copied()
    }

    /// Returns the ids of all alive ops in sequence order.
    pub fn alive_ids(&self) -> Vec<OpId> {
        self.alive.values().copied().collect()
    }

    /// Returns the ids of all dead ops in sequence order.
    pub fn dead_ids(&self) -> Vec<OpId> {
        self.dead.values().copied().collect()
    }

    /// Returns the ids of all alive ops with the given op-code, in sequence
    /// order.
    pub fn alive_ids_by_code(&self, opcode: OpCode) -> Vec<OpId> {
        let lower = (opcode, SeqNum::new(Address::new(SpaceId::CONSTANT, 0), 0));
        self.by_code
            .range(lower..)
            .take_while(|((code, _), _)| *code == opcode)
            .map(|(_, &id)| id)
            .collect()
    }

    /// Returns the number of alive ops.
    pub fn num_alive(&self) -> usize {
        self.alive.len()
    }

    /// Returns the number of dead ops.
    pub fn num_dead(&self) -> usize {
        self.dead.len()
    }
}
