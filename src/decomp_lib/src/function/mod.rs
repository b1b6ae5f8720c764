//! The per-function context object.
//!
//! A [`FunctionData`] owns everything belonging to one function under
//! decompilation: the varnode and op banks, the block graph, the local
//! symbol scope, the call and jump-table lists, and the accumulated
//! warnings. Every mutation of the data-flow graph goes through its API,
//! which keeps the def/descend edges of the graph consistent in both
//! directions.

use crate::address::{Address, AddrSpaceManager, SpaceId};
use crate::data_flow::{
    op_flags, varnode_flags, BlockGraph, BlockId, HighId, HighVariable, OpBank, OpCode, OpId,
    PcodeOp, Varnode, VarnodeBank, VarnodeId,
};
use crate::database::Scope;
use crate::prelude::*;
use crate::ssa::Heritage;
use crate::utils::log::LogMessage;

use std::collections::BTreeMap;

mod flow;
mod jumptable;
mod prototype;

pub use flow::{FlowBuilder, FlowOverride, InjectPayload, RawInstruction, RawPcodeOp};
pub use jumptable::{JumpTable, JumpTableRecovery, NoJumpTableRecovery};
pub use prototype::{
    EffectRecord, EffectType, FuncCallSpecs, FuncProto, ParamActive, ParamTrial, ProtoModel,
    ProtoParameter,
};

/// Status flags of a function context.
pub mod function_flags {
    /// Unparseable machine data was encountered.
    pub const BADDATA_PRESENT: u32 = 0x1;
    /// Instructions without p-code semantics were encountered.
    pub const UNIMPLEMENTED_PRESENT: u32 = 0x2;
    /// An action requested that the transformation pipeline restarts.
    pub const RESTART_PENDING: u32 = 0x4;
    /// Decompilation of this function has started.
    pub const PROCESSING_STARTED: u32 = 0x8;
    /// Decompilation of this function has finished.
    pub const PROCESSING_COMPLETE: u32 = 0x10;
}

/// The state of one function under decompilation.
pub struct FunctionData {
    name: String,
    entry: Address,
    flags: u32,
    vbank: VarnodeBank,
    obank: OpBank,
    blocks: BlockGraph,
    locals: Scope,
    warnings: Vec<LogMessage>,
    call_specs: Vec<FuncCallSpecs>,
    jump_tables: Vec<JumpTable>,
    proto: FuncProto,
    active_output: Option<ParamActive>,
    highs: Vec<HighVariable>,
    pub(crate) heritage: Heritage,
    overrides: BTreeMap<Address, FlowOverride>,
    unique_space: SpaceId,
    unique_offset: u64,
}

impl FunctionData {
    /// Returns a fresh context for the function at the given entry address.
    pub fn new(name: &str, entry: Address, manager: &AddrSpaceManager) -> FunctionData {
        let unique_space = manager
            .iter()
            .find(|spc| spc.kind() == crate::address::SpaceKind::Unique)
            .map(|spc| spc.id())
            .unwrap_or(SpaceId::CONSTANT);
        FunctionData {
            name: name.to_string(),
            entry,
            flags: 0,
            vbank: VarnodeBank::new(),
            obank: OpBank::new(),
            blocks: BlockGraph::new(),
            locals: Scope::new_local(name),
            warnings: Vec::new(),
            call_specs: Vec::new(),
            jump_tables: Vec::new(),
            proto: FuncProto::default(),
            active_output: None,
            highs: Vec::new(),
            heritage: Heritage::new(manager),
            overrides: BTreeMap::new(),
            unique_space,
            // Offsets above this bound are reserved for analysis temporaries
            // and cannot collide with lifted unique varnodes.
            unique_offset: 0x8000_0000,
        }
    }

    /// Returns the name of the function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the entry address of the function.
    pub fn entry(&self) -> Address {
        self.entry
    }

    // ------------------------------------------------------------------
    // Status flags and warnings
    // ------------------------------------------------------------------

    /// Returns true iff the given status flags are all set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    /// Sets status flags.
    pub fn set_function_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    /// Clears status flags.
    pub fn clear_function_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    /// Marks or clears the restart request of the transformation pipeline.
    pub fn set_restart_pending(&mut self, pending: bool) {
        if pending {
            self.flags |= function_flags::RESTART_PENDING;
        } else {
            self.flags &= !function_flags::RESTART_PENDING;
        }
    }

    /// Returns true iff a restart of the transformation pipeline was
    /// requested.
    pub fn is_restart_pending(&self) -> bool {
        self.has_flag(function_flags::RESTART_PENDING)
    }

    /// Attaches a warning to the given address. Identical warnings are
    /// recorded once.
    pub fn warning(&mut self, text: &str, addr: Address) {
        let msg = LogMessage::new_error(text).location(addr);
        if !self.warnings.contains(&msg) {
            self.warnings.push(msg);
        }
    }

    /// Returns all warnings recorded so far.
    pub fn warnings(&self) -> &[LogMessage] {
        &self.warnings
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Returns the varnode with the given id.
    pub fn varnode(&self, id: VarnodeId) -> &Varnode {
        self.vbank.varnode(id)
    }

    /// Returns the varnode with the given id.
    pub fn varnode_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        self.vbank.varnode_mut(id)
    }

    /// Returns the op with the given id.
    pub fn op(&self, id: OpId) -> &PcodeOp {
        self.obank.op(id)
    }

    /// Returns the op with the given id.
    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut PcodeOp {
        self.obank.op_mut(id)
    }

    /// Returns the varnode bank.
    pub fn vbank(&self) -> &VarnodeBank {
        &self.vbank
    }

    /// Returns the op bank.
    pub fn obank(&self) -> &OpBank {
        &self.obank
    }

    /// Returns the block graph.
    pub fn blocks(&self) -> &BlockGraph {
        &self.blocks
    }

    /// Returns the block graph for mutation.
    ///
    /// Only structural setup (block creation, edges, entry marking) goes
    /// through the graph directly; op placement must use the `op_insert`
    /// family so that op orders stay consistent.
    pub fn blocks_mut(&mut self) -> &mut BlockGraph {
        &mut self.blocks
    }

    /// Returns the function-local symbol scope.
    pub fn locals(&self) -> &Scope {
        &self.locals
    }

    /// Returns the function-local symbol scope.
    pub fn locals_mut(&mut self) -> &mut Scope {
        &mut self.locals
    }

    /// Returns the prototype of the function.
    pub fn proto(&self) -> &FuncProto {
        &self.proto
    }

    /// Returns the prototype of the function.
    pub fn proto_mut(&mut self) -> &mut FuncProto {
        &mut self.proto
    }

    /// Returns the return-value trials, if recovery is active.
    pub fn active_output(&self) -> Option<&ParamActive> {
        self.active_output.as_ref()
    }

    /// Returns the return-value trials, if recovery is active.
    pub fn active_output_mut(&mut self) -> Option<&mut ParamActive> {
        self.active_output.as_mut()
    }

    /// Starts collecting return-value trials.
    pub fn activate_output_recovery(&mut self) {
        let mut active = ParamActive::new();
        active.activate();
        self.active_output = Some(active);
    }

    // ------------------------------------------------------------------
    // SSA construction
    // ------------------------------------------------------------------

    /// Returns the heritage state of the function.
    pub fn heritage(&self) -> &Heritage {
        &self.heritage
    }

    /// Returns the heritage state of the function.
    pub fn heritage_mut(&mut self) -> &mut Heritage {
        &mut self.heritage
    }

    /// Performs one pass of SSA construction.
    pub fn heritage_pass(&mut self, arch: &crate::architecture::Architecture) -> Result<(), Error> {
        let mut heritage = std::mem::replace(&mut self.heritage, Heritage::placeholder());
        let result = heritage.heritage(self, arch);
        self.heritage = heritage;
        result
    }

    // ------------------------------------------------------------------
    // Varnode creation and destruction
    // ------------------------------------------------------------------

    /// Creates a free varnode at the given location.
    pub fn new_varnode(&mut self, size: u32, addr: Address) -> VarnodeId {
        self.vbank.create(size, addr)
    }

    /// Creates a constant varnode holding the given value.
    pub fn new_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        self.vbank
            .create(size, Address::constant(value & crate::address::calc_mask(size)))
    }

    /// Creates a fresh temporary in the unique space.
    pub fn new_unique(&mut self, size: u32) -> VarnodeId {
        let offset = self.unique_offset;
        self.unique_offset += size.max(8) as u64;
        self.vbank.create(size, Address::new(self.unique_space, offset))
    }

    /// Creates a varnode and attaches it as the output of the given op.
    pub fn new_varnode_out(&mut self, size: u32, addr: Address, op: OpId) -> Result<VarnodeId, Error> {
        let vn = self.vbank.create(size, addr);
        self.op_set_output(op, vn)?;
        Ok(vn)
    }

    /// Creates a unique-space temporary as the output of the given op.
    pub fn new_unique_out(&mut self, size: u32, op: OpId) -> Result<VarnodeId, Error> {
        let vn = self.new_unique(size);
        self.op_set_output(op, vn)?;
        Ok(vn)
    }

    /// Marks a free varnode as a formal function input.
    ///
    /// If an input with the same storage already exists it is returned
    /// instead and the argument is deleted.
    pub fn set_input_varnode(&mut self, vn: VarnodeId) -> Result<VarnodeId, Error> {
        let (size, addr) = {
            let v = self.varnode(vn);
            if v.is_input() {
                return Ok(vn);
            }
            if v.is_written() {
                bail!("cannot mark written varnode {} as input", v);
            }
            (v.size(), v.addr())
        };
        let existing = self
            .vbank
            .ids_in_range(addr, size as u64)
            .into_iter()
            .find(|&id| {
                let v = self.varnode(id);
                id != vn && v.is_input() && v.size() == size && v.addr() == addr
            });
        if let Some(existing) = existing {
            if self.varnode(vn).has_no_descend() {
                self.delete_varnode(vn)?;
            }
            return Ok(existing);
        }
        self.varnode_mut(vn).set_flag(varnode_flags::INPUT);
        Ok(vn)
    }

    /// Destroys a free varnode without readers.
    pub fn delete_varnode(&mut self, vn: VarnodeId) -> Result<(), Error> {
        self.vbank.destroy(vn)
    }

    /// Retargets every reader of `old` to read `new` instead.
    pub fn total_replace(&mut self, old: VarnodeId, new: VarnodeId) -> Result<(), Error> {
        if old == new {
            bail!("total_replace with identical varnodes");
        }
        let readers: Vec<OpId> = self.varnode(old).descendants().to_vec();
        for op in readers {
            while let Some(slot) = self.op(op).slot_of(old) {
                self.op_set_input(op, new, slot);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Op creation and opcode changes
    // ------------------------------------------------------------------

    /// Creates a new dead op at the given code address.
    pub fn new_op(&mut self, pc: Address, opc: OpCode) -> OpId {
        self.obank.create(opc, pc)
    }

    /// Creates a new dead op with an explicit sequence number, for state
    /// restoration.
    pub(crate) fn new_op_with_seq(&mut self, seq: crate::address::SeqNum, opc: OpCode) -> OpId {
        self.obank.create_with_seq(opc, seq)
    }

    /// Changes the op-code of an op in place, rebinding its behavior.
    pub fn op_set_opcode(&mut self, op: OpId, opc: OpCode) {
        self.obank.set_opcode(op, opc);
    }

    // ------------------------------------------------------------------
    // Input and output wiring
    // ------------------------------------------------------------------

    /// Sets the input of `op` at `slot`, registering the descend relation.
    ///
    /// A slot equal to the current input count appends. Constants that are
    /// already read elsewhere are duplicated, so that a constant varnode
    /// never has more than one reader.
    pub fn op_set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) {
        let vn = self.uniquify_constant(op, vn);
        let old = self.op(op).try_input(slot);
        if old == Some(vn) {
            return;
        }
        if let Some(old) = old {
            self.drop_input_ref(op, old);
        }
        if slot == self.op(op).num_inputs() {
            self.op_mut(op).inputs_mut().push(vn);
        } else {
            self.op_mut(op).inputs_mut()[slot] = vn;
        }
        self.varnode_mut(vn).add_descend(op);
    }

    /// Inserts a new input of `op` at `slot`, shifting later slots up.
    pub fn op_insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) {
        let vn = self.uniquify_constant(op, vn);
        self.op_mut(op).inputs_mut().insert(slot, vn);
        self.varnode_mut(vn).add_descend(op);
    }

    /// Removes the input of `op` at `slot`, shifting later slots down.
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) {
        let old = self.op(op).input(slot);
        self.op_mut(op).inputs_mut().remove(slot);
        self.drop_input_ref(op, old);
    }

    /// Replaces all inputs of `op`.
    pub fn op_set_all_input(&mut self, op: OpId, inputs: Vec<VarnodeId>) {
        while self.op(op).num_inputs() > 0 {
            self.op_remove_input(op, self.op(op).num_inputs() - 1);
        }
        for vn in inputs {
            let slot = self.op(op).num_inputs();
            self.op_set_input(op, vn, slot);
        }
    }

    /// Swaps two input slots of `op`.
    pub fn op_swap_input(&mut self, op: OpId, slot1: usize, slot2: usize) {
        self.op_mut(op).inputs_mut().swap(slot1, slot2);
    }

    /// Attaches a free varnode as the output of `op`.
    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) -> Result<(), Error> {
        if let Some(old) = self.op(op).output() {
            let seq = self.op(op).seq();
            self.vbank.clear_def(old, seq);
        }
        let seq = self.op(op).seq();
        self.vbank.set_def(vn, op, seq)?;
        self.op_mut(op).set_output(Some(vn));
        Ok(())
    }

    /// Detaches the output of `op`, making the varnode free again.
    pub fn op_unset_output(&mut self, op: OpId) -> Option<VarnodeId> {
        let out = self.op(op).output()?;
        let seq = self.op(op).seq();
        self.vbank.clear_def(out, seq);
        self.op_mut(op).set_output(None);
        Some(out)
    }

    /// Unregisters a reader, deleting constants that become unused.
    fn drop_input_ref(&mut self, op: OpId, vn: VarnodeId) {
        self.varnode_mut(vn).remove_descend(op);
        let v = self.varnode(vn);
        if v.is_constant() && v.has_no_descend() && !v.is_annotation() {
            let _ = self.vbank.destroy(vn);
        }
    }

    /// Duplicates a constant that is already read by another op.
    fn uniquify_constant(&mut self, op: OpId, vn: VarnodeId) -> VarnodeId {
        let v = self.varnode(vn);
        if v.is_constant() && !v.is_annotation() && !v.has_no_descend() {
            let reads_elsewhere = v.descendants().iter().any(|&reader| reader != op);
            if reads_elsewhere {
                return self.new_constant(v.size(), v.constant_value());
            }
        }
        vn
    }

    // ------------------------------------------------------------------
    // Block insertion and removal
    // ------------------------------------------------------------------

    /// Inserts a dead op into a block at the given position.
    pub fn op_insert(&mut self, op: OpId, blk: BlockId, pos: usize) {
        debug_assert!(self.op(op).is_dead());
        self.obank.mark_alive(op);
        self.op_mut(op).set_parent(Some(blk));
        self.blocks.block_mut(blk).ops_mut().insert(pos, op);
        self.renumber_block(blk, pos);
    }

    /// Inserts a dead op at the beginning of a block.
    ///
    /// Non-phi ops are placed after any existing MULTIEQUAL ops.
    pub fn op_insert_begin(&mut self, op: OpId, blk: BlockId) {
        let mut pos = 0;
        if self.op(op).code() != OpCode::MULTIEQUAL {
            let ops = self.blocks.block(blk).ops().to_vec();
            for id in ops {
                if self.op(id).code() != OpCode::MULTIEQUAL {
                    break;
                }
                pos += 1;
            }
        }
        self.op_insert(op, blk, pos);
    }

    /// Inserts a dead op at the end of a block, before any trailing branch.
    pub fn op_insert_end(&mut self, op: OpId, blk: BlockId) {
        let mut pos = self.blocks.block(blk).ops().len();
        if pos > 0 {
            let last = self.blocks.block(blk).ops()[pos - 1];
            let code = self.op(last).code();
            if code.is_branch() || code.is_flow_break() {
                pos -= 1;
            }
        }
        self.op_insert(op, blk, pos);
    }

    /// Inserts a dead op immediately before an alive op.
    pub fn op_insert_before(&mut self, op: OpId, follow: OpId) {
        let blk = self.op(follow).parent().expect("insertion before dead op");
        let pos = self.op(follow).order() as usize;
        self.op_insert(op, blk, pos);
    }

    /// Inserts a dead op immediately after an alive op.
    pub fn op_insert_after(&mut self, op: OpId, prev: OpId) {
        let blk = self.op(prev).parent().expect("insertion after dead op");
        let pos = self.op(prev).order() as usize + 1;
        self.op_insert(op, blk, pos);
    }

    /// Removes an alive op from its block, marking it dead.
    pub fn op_uninsert(&mut self, op: OpId) {
        let blk = self.op(op).parent().expect("uninsert of dead op");
        let pos = self.op(op).order() as usize;
        self.blocks.block_mut(blk).ops_mut().remove(pos);
        self.op_mut(op).set_parent(None);
        self.obank.mark_dead(op);
        self.renumber_block(blk, pos);
    }

    /// Detaches an op from the graph entirely: inputs, output, and block.
    pub fn op_unlink(&mut self, op: OpId) {
        while self.op(op).num_inputs() > 0 {
            self.op_remove_input(op, self.op(op).num_inputs() - 1);
        }
        self.op_unset_output(op);
        if !self.op(op).is_dead() {
            self.op_uninsert(op);
        }
    }

    /// Destroys an op, freeing its output varnode.
    ///
    /// Returns the freed output, if the op had one, so the caller can reuse
    /// or delete it.
    pub fn op_destroy(&mut self, op: OpId) -> Result<Option<VarnodeId>, Error> {
        let out = self.op(op).output();
        self.op_unlink(op);
        self.obank.destroy(op)?;
        Ok(out)
    }

    /// Destroys an op together with its output varnode and retargets all
    /// readers of the output to the replacement.
    pub fn op_destroy_replace(&mut self, op: OpId, replacement: VarnodeId) -> Result<(), Error> {
        let out = self
            .op(op)
            .output()
            .ok_or_else(|| anyhow!("op_destroy_replace on op without output"))?;
        self.total_replace(out, replacement)?;
        self.op_unlink(op);
        self.obank.destroy(op)?;
        self.delete_varnode(out)?;
        Ok(())
    }

    /// Marks an op as a halt point of the given kind.
    pub fn op_mark_halt(&mut self, op: OpId, flag: u32) {
        self.op_mut(op).set_flag(flag | op_flags::HALT);
    }

    /// Restores the invariant that op order indices match block positions.
    fn renumber_block(&mut self, blk: BlockId, from: usize) {
        let ops: Vec<OpId> = self.blocks.block(blk).ops()[from..].to_vec();
        for (i, id) in ops.into_iter().enumerate() {
            self.op_mut(id).set_order((from + i) as u32);
        }
    }

    // ------------------------------------------------------------------
    // INDIRECT construction
    // ------------------------------------------------------------------

    /// Creates an annotation constant referring to another op.
    ///
    /// INDIRECT ops carry such a reference in their second slot to name the
    /// op they guard.
    pub fn new_op_ref(&mut self, target: OpId) -> VarnodeId {
        let vn = self.new_constant(8, target.index() as u64);
        self.varnode_mut(vn).set_flag(varnode_flags::ANNOTATION);
        vn
    }

    /// Decodes an op reference created by [`new_op_ref`](Self::new_op_ref).
    pub fn read_op_ref(&self, vn: VarnodeId) -> Option<OpId> {
        let v = self.varnode(vn);
        if !v.is_annotation() || !v.is_constant() {
            return None;
        }
        let id = OpId(v.constant_value() as u32);
        if self.obank.is_live(id) {
            Some(id)
        } else {
            None
        }
    }

    /// Builds an INDIRECT op making data-flow through `effect_op` explicit
    /// for the given storage range.
    ///
    /// The INDIRECT is inserted immediately before the effect op. Its first
    /// input is a fresh free varnode representing the old value; its output
    /// is a fresh varnode representing the value after the effect.
    pub fn new_indirect_op(
        &mut self,
        effect_op: OpId,
        addr: Address,
        size: u32,
    ) -> Result<OpId, Error> {
        let pc = self.op(effect_op).seq().addr();
        let indop = self.new_op(pc, OpCode::INDIRECT);
        let invn = self.new_varnode(size, addr);
        self.op_set_input(indop, invn, 0);
        let refvn = self.new_op_ref(effect_op);
        self.op_set_input(indop, refvn, 1);
        self.new_varnode_out(size, addr, indop)?;
        self.op_insert_before(indop, effect_op);
        Ok(indop)
    }

    /// Builds an INDIRECT op whose output is created out of nothing by
    /// `effect_op` (a call killing the storage).
    pub fn new_indirect_creation(
        &mut self,
        effect_op: OpId,
        addr: Address,
        size: u32,
        possible_out: bool,
    ) -> Result<OpId, Error> {
        let pc = self.op(effect_op).seq().addr();
        let indop = self.new_op(pc, OpCode::INDIRECT);
        let invn = self.new_constant(size, 0);
        self.op_set_input(indop, invn, 0);
        let refvn = self.new_op_ref(effect_op);
        self.op_set_input(indop, refvn, 1);
        let out = self.new_varnode_out(size, addr, indop)?;
        self.op_mut(indop).set_flag(op_flags::INDIRECT_CREATION);
        if possible_out {
            self.op_mut(indop)
                .set_flag(op_flags::INDIRECT_CREATION_POSSIBLE_OUT);
        }
        self.varnode_mut(out)
            .set_flag(varnode_flags::INDIRECT_CREATION);
        self.op_insert_before(indop, effect_op);
        Ok(indop)
    }

    /// Returns the op an alive INDIRECT guards, if decodable.
    pub fn indirect_effect_op(&self, indop: OpId) -> Option<OpId> {
        if self.op(indop).code() != OpCode::INDIRECT {
            return None;
        }
        self.read_op_ref(self.op(indop).try_input(1)?)
    }

    // ------------------------------------------------------------------
    // Calls, jump tables, overrides
    // ------------------------------------------------------------------

    /// Registers the specs of one call site.
    pub fn add_call_spec(&mut self, spec: FuncCallSpecs) {
        self.call_specs.push(spec);
    }

    /// Returns the number of call sites.
    pub fn num_calls(&self) -> usize {
        self.call_specs.len()
    }

    /// Returns the specs of the `i`-th call site.
    pub fn call_spec(&self, i: usize) -> &FuncCallSpecs {
        &self.call_specs[i]
    }

    /// Returns the specs of the `i`-th call site.
    pub fn call_spec_mut(&mut self, i: usize) -> &mut FuncCallSpecs {
        &mut self.call_specs[i]
    }

    /// Returns the specs registered for the given call op, if any.
    pub fn call_spec_for(&self, op: OpId) -> Option<&FuncCallSpecs> {
        self.call_specs.iter().find(|spec| spec.op() == op)
    }

    /// Records a recovered jump table.
    pub fn add_jump_table(&mut self, table: JumpTable) {
        self.jump_tables.push(table);
    }

    /// Returns the recovered jump tables.
    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jump_tables
    }

    /// Overrides the interpretation of the flow op at the given address.
    pub fn add_override(&mut self, addr: Address, over: FlowOverride) {
        self.overrides.insert(addr, over);
    }

    /// Returns the flow override at the given address, if any.
    pub fn override_at(&self, addr: Address) -> Option<FlowOverride> {
        self.overrides.get(&addr).copied()
    }

    // ------------------------------------------------------------------
    // High variables
    // ------------------------------------------------------------------

    /// Creates a fresh high variable with a single member.
    pub fn new_high(&mut self, member: VarnodeId) -> HighId {
        let id = HighId(self.highs.len() as u32);
        self.highs.push(HighVariable::new(member));
        self.varnode_mut(member).set_high(Some(id));
        id
    }

    /// Returns the high variable with the given id.
    pub fn high(&self, id: HighId) -> &HighVariable {
        &self.highs[id.index()]
    }

    /// Returns the high variable with the given id.
    pub fn high_mut(&mut self, id: HighId) -> &mut HighVariable {
        &mut self.highs[id.index()]
    }

    /// Returns all high variables.
    pub fn highs(&self) -> &[HighVariable] {
        &self.highs
    }

    /// Discards all high variables and member links.
    pub fn clear_highs(&mut self) {
        for id in self.vbank.ids() {
            self.varnode_mut(id).set_high(None);
        }
        self.highs.clear();
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::address::AddrSpaceManager;

    impl FunctionData {
        /// Mock an empty function context on the mock space manager.
        pub fn mock(manager: &AddrSpaceManager) -> FunctionData {
            FunctionData::new(
                "mock_fn",
                Address::new(SpaceId::mock_ram(), 0x1000),
                manager,
            )
        }
    }

    #[test]
    fn output_definition_is_unique() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let op1 = fd.new_op(pc, OpCode::COPY);
        let op2 = fd.new_op(pc, OpCode::COPY);
        let addr = Address::new(SpaceId::mock_register(), 0x8);
        let out = fd.new_varnode_out(4, addr, op1).unwrap();
        assert_eq!(fd.varnode(out).def(), Some(op1));
        // A second definition of the same varnode is a structural error.
        assert!(fd.op_set_output(op2, out).is_err());
    }

    #[test]
    fn descend_lists_follow_rewiring() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let op = fd.new_op(pc, OpCode::INT_ADD);
        let a = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let b = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0xc));
        fd.op_set_input(op, a, 0);
        fd.op_set_input(op, b, 1);
        assert_eq!(fd.varnode(a).descendants(), &[op]);
        let c = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x10));
        fd.op_set_input(op, c, 0);
        assert!(fd.varnode(a).has_no_descend());
        assert_eq!(fd.varnode(c).descendants(), &[op]);
    }

    #[test]
    fn constants_are_duplicated_per_reader() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let op1 = fd.new_op(pc, OpCode::INT_ADD);
        let op2 = fd.new_op(pc, OpCode::INT_ADD);
        let c = fd.new_constant(4, 7);
        fd.op_set_input(op1, c, 0);
        fd.op_set_input(op2, c, 0);
        let c1 = fd.op(op1).input(0);
        let c2 = fd.op(op2).input(0);
        assert_ne!(c1, c2);
        assert_eq!(fd.varnode(c2).constant_value(), 7);
        assert_eq!(fd.varnode(c1).descendants().len(), 1);
    }

    #[test]
    fn block_insertion_keeps_order() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let blk = fd.blocks_mut().new_block(pc);
        let first = fd.new_op(pc, OpCode::COPY);
        let second = fd.new_op(pc, OpCode::COPY);
        let phi = fd.new_op(pc, OpCode::MULTIEQUAL);
        fd.op_insert_end(first, blk);
        fd.op_insert_end(second, blk);
        fd.op_insert_begin(phi, blk);
        let ops = fd.blocks().block(blk).ops().to_vec();
        assert_eq!(ops, vec![phi, first, second]);
        assert_eq!(fd.op(phi).order(), 0);
        assert_eq!(fd.op(second).order(), 2);
        fd.op_uninsert(first);
        assert_eq!(fd.op(second).order(), 1);
        assert!(fd.op(first).is_dead());
    }
}
