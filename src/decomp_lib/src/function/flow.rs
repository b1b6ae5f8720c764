//! Assembly of raw p-code into the basic block graph.
//!
//! The builder consumes already-lifted p-code sequences, one per instruction
//! address. It discovers the reachable instructions from the entry point,
//! splits them into basic blocks at branch targets, wires the control-flow
//! edges, and registers the call sites. Indirect branches get no out-edges;
//! an external jump-table recovery pass may patch them in later.

use crate::address::{Address, VarnodeData};
use crate::data_flow::{op_flags, varnode_flags, BlockId, OpCode, OpId};
use crate::prelude::*;

use std::collections::{BTreeMap, BTreeSet};

use super::function_flags;
use super::prototype::{FuncCallSpecs, FuncProto};
use super::FunctionData;

/// One raw p-code operation as handed to the flow builder.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct RawPcodeOp {
    /// The operation.
    pub opcode: OpCode,
    /// The input storage descriptors.
    pub inputs: Vec<VarnodeData>,
    /// The output storage descriptor, if the op produces a value.
    pub output: Option<VarnodeData>,
}

/// The lifted p-code of one machine instruction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct RawInstruction {
    /// The address of the instruction.
    pub addr: Address,
    /// The length of the instruction in bytes.
    pub length: u32,
    /// The p-code ops of the instruction, in execution order.
    pub ops: Vec<RawPcodeOp>,
}

/// Per-address overrides of control-flow interpretation.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum FlowOverride {
    /// Treat the call at this address as a plain branch.
    Branch,
    /// Treat the branch at this address as a call.
    Call,
    /// Treat the flow op at this address as a return.
    Return,
}

/// A provider of injection payloads for user-defined CALLOTHER ops.
///
/// When a CALLOTHER carries an injectable user-op index, its semantics are
/// spliced into the instruction in place of the call.
pub trait InjectPayload {
    /// Returns the replacement p-code for the user-op with the given index,
    /// or `None` if the op is not injectable.
    fn payload(&self, userop_index: u64) -> Option<Vec<RawPcodeOp>>;
}

/// Builds the basic block graph of one function from raw p-code.
pub struct FlowBuilder<'a> {
    instructions: BTreeMap<Address, RawInstruction>,
    inject: Option<&'a dyn InjectPayload>,
    default_proto: FuncProto,
    /// Upper bound on the number of instructions to follow.
    insn_max: usize,
}

impl<'a> FlowBuilder<'a> {
    /// Returns a new builder over the given instructions.
    pub fn new(instructions: Vec<RawInstruction>, default_proto: FuncProto) -> FlowBuilder<'a> {
        FlowBuilder {
            instructions: instructions
                .into_iter()
                .map(|insn| (insn.addr, insn))
                .collect(),
            inject: None,
            default_proto,
            insn_max: 100_000,
        }
    }

    /// Attaches an injection library for user-defined ops.
    pub fn with_injection(mut self, inject: &'a dyn InjectPayload) -> FlowBuilder<'a> {
        self.inject = Some(inject);
        self
    }

    /// Restricts the number of instructions to follow.
    pub fn with_insn_max(mut self, insn_max: usize) -> FlowBuilder<'a> {
        self.insn_max = insn_max;
        self
    }

    /// Assembles the block graph into the given function context.
    ///
    /// A function with no instructions at its entry produces an empty graph
    /// and no errors.
    pub fn build(&self, fd: &mut FunctionData) -> Result<(), Error> {
        let reachable = self.follow_flow(fd)?;
        if reachable.is_empty() {
            return Ok(());
        }
        let leaders = self.find_leaders(fd, &reachable);

        // Lay out blocks over the reachable instructions in address order.
        let mut block_of_insn: BTreeMap<Address, BlockId> = BTreeMap::new();
        let mut current: Option<BlockId> = None;
        let mut last_ends_flow = false;
        for &addr in reachable.iter() {
            if current.is_none() || leaders.contains(&addr) || last_ends_flow {
                current = Some(fd.blocks_mut().new_block(addr));
            }
            let blk = current.unwrap();
            block_of_insn.insert(addr, blk);
            fd.blocks_mut().block_mut(blk).set_stop(addr);
            last_ends_flow = self.ends_flow(fd, addr);
        }

        // Emit the ops of each instruction into its block.
        let mut branch_edges: Vec<(BlockId, Address)> = Vec::new();
        let mut fall_edges: Vec<(BlockId, Address)> = Vec::new();
        for &addr in reachable.iter() {
            let insn = self.instructions.get(&addr).unwrap();
            let blk = block_of_insn[&addr];
            let ops = self.expand_ops(fd, insn);
            let mut first = true;
            let mut saw_branch = false;
            for raw in ops.iter() {
                let op = self.emit_op(fd, addr, raw)?;
                if first {
                    fd.op_mut(op).set_flag(op_flags::STARTINSTRUCTION);
                    first = false;
                }
                let pos = fd.blocks().block(blk).ops().len();
                fd.op_insert(op, blk, pos);
                match self.effective_code(fd, addr, raw.opcode) {
                    OpCode::BRANCH => {
                        branch_edges.push((blk, self.branch_target(raw)?));
                        saw_branch = true;
                    }
                    OpCode::CBRANCH => {
                        // Slot order: fallthrough first, then the taken edge.
                        fall_edges.push((blk, self.fallthrough(insn)));
                        branch_edges.push((blk, self.branch_target(raw)?));
                        saw_branch = true;
                    }
                    OpCode::BRANCHIND => {
                        fd.warning(
                            "Indirect branch without recovered jump table",
                            addr,
                        );
                        saw_branch = true;
                    }
                    OpCode::RETURN => {
                        saw_branch = true;
                    }
                    OpCode::CALL | OpCode::CALLIND => {
                        let mut spec = FuncCallSpecs::new(op, self.default_proto.clone());
                        if raw.opcode == OpCode::CALL {
                            spec.entry = raw.inputs.first().map(|input| input.addr);
                        }
                        fd.add_call_spec(spec);
                    }
                    OpCode::UNIMPLEMENTED => {
                        fd.set_function_flag(function_flags::UNIMPLEMENTED_PRESENT);
                        fd.op_mark_halt(op, op_flags::UNIMPLEMENTED_HALT);
                        fd.warning("Unimplemented instruction semantics", addr);
                    }
                    _ => (),
                }
            }
            // Instructions that simply run off their end fall through.
            if !saw_branch {
                let next = self.fallthrough(insn);
                if block_of_insn.get(&next) != Some(&blk) {
                    fall_edges.push((blk, next));
                }
            }
        }

        // Fallthrough edges come first so that the CBRANCH slot convention
        // (slot 0 = fallthrough, slot 1 = taken) holds per block.
        for (from, target) in fall_edges.into_iter().chain(branch_edges) {
            if let Some(&to) = block_of_insn.get(&target) {
                fd.blocks_mut().add_edge(from, to);
            } else {
                fd.set_function_flag(function_flags::BADDATA_PRESENT);
                fd.warning("Control flow into missing instruction", target);
            }
        }

        let entry_addr = fd.entry();
        if let Some(&entry_block) = block_of_insn.get(&entry_addr) {
            fd.blocks_mut().set_entry(entry_block);
        }
        Ok(())
    }

    /// Discovers the set of reachable instruction addresses from the entry.
    fn follow_flow(&self, fd: &mut FunctionData) -> Result<BTreeSet<Address>, Error> {
        let mut reachable = BTreeSet::new();
        let mut worklist = vec![fd.entry()];
        while let Some(addr) = worklist.pop() {
            if reachable.contains(&addr) {
                continue;
            }
            let Some(insn) = self.instructions.get(&addr) else {
                if addr == fd.entry() {
                    // Zero instructions at the entry is an empty function.
                    return Ok(reachable);
                }
                continue;
            };
            if reachable.len() >= self.insn_max {
                fd.set_function_flag(function_flags::BADDATA_PRESENT);
                fd.warning("Flow exceeded maximum instruction count", addr);
                break;
            }
            reachable.insert(addr);
            let mut falls_through = true;
            for raw in insn.ops.iter() {
                match self.effective_code(fd, addr, raw.opcode) {
                    OpCode::BRANCH => {
                        worklist.push(self.branch_target(raw)?);
                        falls_through = false;
                    }
                    OpCode::CBRANCH => {
                        worklist.push(self.branch_target(raw)?);
                    }
                    OpCode::BRANCHIND | OpCode::RETURN => {
                        falls_through = false;
                    }
                    _ => (),
                }
            }
            if falls_through {
                worklist.push(self.fallthrough(insn));
            }
        }
        Ok(reachable)
    }

    /// Returns the addresses that must start a basic block.
    fn find_leaders(&self, fd: &FunctionData, reachable: &BTreeSet<Address>) -> BTreeSet<Address> {
        let mut leaders = BTreeSet::new();
        leaders.insert(fd.entry());
        for &addr in reachable.iter() {
            let insn = self.instructions.get(&addr).unwrap();
            for raw in insn.ops.iter() {
                match self.effective_code(fd, addr, raw.opcode) {
                    OpCode::BRANCH | OpCode::CBRANCH => {
                        if let Ok(target) = self.branch_target(raw) {
                            leaders.insert(target);
                        }
                        leaders.insert(self.fallthrough(insn));
                    }
                    OpCode::BRANCHIND | OpCode::RETURN => {
                        leaders.insert(self.fallthrough(insn));
                    }
                    _ => (),
                }
            }
        }
        leaders
    }

    /// Applies flow overrides to an op-code.
    fn effective_code(&self, fd: &FunctionData, addr: Address, code: OpCode) -> OpCode {
        match (fd.override_at(addr), code) {
            (Some(FlowOverride::Branch), OpCode::CALL) => OpCode::BRANCH,
            (Some(FlowOverride::Call), OpCode::BRANCH) => OpCode::CALL,
            (Some(FlowOverride::Return), OpCode::BRANCHIND) => OpCode::RETURN,
            (_, code) => code,
        }
    }

    /// Splices injection payloads into the op list of an instruction.
    fn expand_ops(&self, fd: &mut FunctionData, insn: &RawInstruction) -> Vec<RawPcodeOp> {
        let Some(inject) = self.inject else {
            return insn.ops.clone();
        };
        let mut result = Vec::with_capacity(insn.ops.len());
        for raw in insn.ops.iter() {
            if raw.opcode == OpCode::CALLOTHER {
                let index = raw
                    .inputs
                    .first()
                    .filter(|input| input.addr.is_constant())
                    .map(|input| input.addr.offset());
                if let Some(payload) = index.and_then(|index| inject.payload(index)) {
                    result.extend(payload);
                    continue;
                }
                fd.warning("Unimplemented user operation", insn.addr);
            }
            result.push(raw.clone());
        }
        result
    }

    /// Creates the op and varnodes for one raw op. The op stays dead; the
    /// caller inserts it.
    fn emit_op(&self, fd: &mut FunctionData, addr: Address, raw: &RawPcodeOp) -> Result<OpId, Error> {
        let effective = self.effective_code(fd, addr, raw.opcode);
        let op = fd.new_op(addr, effective);
        for (slot, input) in raw.inputs.iter().enumerate() {
            let vn = if input.addr.is_constant() {
                fd.new_constant(input.size, input.addr.offset())
            } else {
                fd.new_varnode(input.size, input.addr)
            };
            // Branch and call targets are annotations, not data-flow.
            let is_target = slot == 0
                && matches!(
                    effective,
                    OpCode::BRANCH | OpCode::CBRANCH | OpCode::CALL
                );
            if is_target {
                fd.varnode_mut(vn).set_flag(varnode_flags::ANNOTATION);
            }
            fd.op_set_input(op, vn, slot);
        }
        if let Some(output) = &raw.output {
            fd.new_varnode_out(output.size, output.addr, op)?;
        }
        Ok(op)
    }

    /// Returns the target of a direct branch or call op.
    fn branch_target(&self, raw: &RawPcodeOp) -> Result<Address, Error> {
        let input = raw
            .inputs
            .first()
            .ok_or_else(|| anyhow!("branch op without target input"))?;
        if input.addr.is_constant() {
            bail!("p-code relative branch is not supported by this flow builder");
        }
        Ok(input.addr)
    }

    /// Returns the address of the next instruction.
    fn fallthrough(&self, insn: &RawInstruction) -> Address {
        insn.addr.add_wrap(insn.length as u64)
    }

    /// Returns true iff the instruction cannot fall through.
    fn ends_flow(&self, fd: &FunctionData, addr: Address) -> bool {
        let Some(insn) = self.instructions.get(&addr) else {
            return true;
        };
        insn.ops.iter().any(|raw| {
            matches!(
                self.effective_code(fd, addr, raw.opcode),
                OpCode::BRANCH
                    | OpCode::CBRANCH
                    | OpCode::BRANCHIND
                    | OpCode::RETURN
            )
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::address::{AddrSpaceManager, SpaceId};

    pub fn reg(offset: u64, size: u32) -> VarnodeData {
        VarnodeData::new(Address::new(SpaceId::mock_register(), offset), size)
    }

    pub fn con(value: u64, size: u32) -> VarnodeData {
        VarnodeData::new(Address::constant(value), size)
    }

    pub fn ram(offset: u64) -> Address {
        Address::new(SpaceId::mock_ram(), offset)
    }

    fn insn(addr: Address, ops: Vec<RawPcodeOp>) -> RawInstruction {
        RawInstruction {
            addr,
            length: 4,
            ops,
        }
    }

    fn raw(opcode: OpCode, inputs: Vec<VarnodeData>, output: Option<VarnodeData>) -> RawPcodeOp {
        RawPcodeOp {
            opcode,
            inputs,
            output,
        }
    }

    #[test]
    fn empty_function_builds_empty_graph() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let builder = FlowBuilder::new(Vec::new(), FuncProto::default());
        builder.build(&mut fd).unwrap();
        assert!(fd.blocks().is_empty());
        assert!(fd.vbank().is_empty());
        assert!(fd.warnings().is_empty());
    }

    #[test]
    fn diamond_flow() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        // 0x1000: cbranch 0x1008; 0x1004: branch 0x100c; 0x1008: fallthru;
        // 0x100c: return
        let instructions = vec![
            insn(
                ram(0x1000),
                vec![raw(
                    OpCode::CBRANCH,
                    vec![
                        VarnodeData::new(ram(0x1008), 1),
                        reg(0x0, 1),
                    ],
                    None,
                )],
            ),
            insn(
                ram(0x1004),
                vec![raw(
                    OpCode::BRANCH,
                    vec![VarnodeData::new(ram(0x100c), 1)],
                    None,
                )],
            ),
            insn(
                ram(0x1008),
                vec![raw(OpCode::COPY, vec![con(1, 4)], Some(reg(0x8, 4)))],
            ),
            insn(
                ram(0x100c),
                vec![raw(OpCode::RETURN, vec![reg(0x0, 8)], None)],
            ),
        ];
        let builder = FlowBuilder::new(instructions, FuncProto::default());
        builder.build(&mut fd).unwrap();
        assert_eq!(fd.blocks().num_blocks(), 4);
        let entry = fd.blocks().entry().unwrap();
        let entry_block = fd.blocks().block(entry);
        // Fallthrough in slot 0, taken edge in slot 1.
        assert_eq!(entry_block.num_out(), 2);
        let fall = entry_block.out_edges()[0];
        let taken = entry_block.out_edges()[1];
        assert_eq!(fd.blocks().block(fall).start(), ram(0x1004));
        assert_eq!(fd.blocks().block(taken).start(), ram(0x1008));
    }

    #[test]
    fn call_sites_are_registered() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let instructions = vec![
            insn(
                ram(0x1000),
                vec![raw(
                    OpCode::CALL,
                    vec![VarnodeData::new(ram(0x8000), 1)],
                    None,
                )],
            ),
            insn(
                ram(0x1004),
                vec![raw(OpCode::RETURN, vec![reg(0x0, 8)], None)],
            ),
        ];
        let builder = FlowBuilder::new(instructions, FuncProto::default());
        builder.build(&mut fd).unwrap();
        assert_eq!(fd.num_calls(), 1);
        assert_eq!(fd.call_spec(0).entry, Some(ram(0x8000)));
        // The call falls through to the next instruction.
        let entry = fd.blocks().entry().unwrap();
        assert_eq!(fd.blocks().block(entry).num_out(), 1);
    }
}
