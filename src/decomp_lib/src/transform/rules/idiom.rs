//! Machine idiom recognition: conditional moves and three-way compares.

use crate::architecture::Architecture;
use crate::data_flow::{BlockId, OpCode, OpId, VarnodeId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{const_val, def_with_code, propagatable};

/// Collapses the phi of a constant diamond into an expression over the
/// branch condition: `phi(#1 from taken, #0 from fallthrough)` is
/// `zext(cond)`, and with swapped constants `zext(!cond)`.
pub struct RuleConditionalMove;

impl RuleConditionalMove {
    /// Returns the deciding CBRANCH of the diamond feeding a two-input phi
    /// block, together with the out-slot of the deciding block that each
    /// phi slot is reached through.
    fn find_decider(
        fd: &FunctionData,
        phi_block: BlockId,
    ) -> Option<(OpId, [usize; 2])> {
        let block = fd.blocks().block(phi_block);
        if block.num_in() != 2 {
            return None;
        }
        // Each predecessor is either the deciding block itself or an empty
        // arm with a single predecessor.
        let mut decider: Option<BlockId> = None;
        let mut arm_root = [BlockId(0); 2];
        for (i, &pred) in block.in_edges().iter().enumerate() {
            let root = if fd.blocks().block(pred).num_in() == 1 {
                fd.blocks().block(pred).in_edges()[0]
            } else {
                pred
            };
            match decider {
                None => decider = Some(root),
                Some(d) if d == root => (),
                Some(_) => return None,
            }
            arm_root[i] = pred;
        }
        let decider = decider?;
        let dblock = fd.blocks().block(decider);
        if dblock.num_out() != 2 {
            return None;
        }
        let last = *dblock.ops().last()?;
        if fd.op(last).code() != OpCode::CBRANCH {
            return None;
        }
        // Which out-slot of the decider leads to each phi slot.
        let mut slots = [usize::MAX; 2];
        for (i, &arm) in arm_root.iter().enumerate() {
            let via = if arm == decider { phi_block } else { arm };
            slots[i] = dblock.out_edges().iter().position(|&out| out == via)?;
        }
        if slots[0] == slots[1] {
            return None;
        }
        Some((last, slots))
    }
}

impl Rule for RuleConditionalMove {
    fn name(&self) -> &'static str {
        "conditionalmove"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleConditionalMove)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::MULTIEQUAL]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        if fd.op(op).num_inputs() != 2 {
            return Ok(0);
        }
        let (Some(c0), Some(c1)) = (
            const_val(fd, fd.op(op).input(0)),
            const_val(fd, fd.op(op).input(1)),
        ) else {
            return Ok(0);
        };
        if !(c0 == 0 && c1 == 1) && !(c0 == 1 && c1 == 0) {
            return Ok(0);
        }
        let Some(blk) = fd.op(op).parent() else {
            return Ok(0);
        };
        let Some((cbranch, slots)) = Self::find_decider(fd, blk) else {
            return Ok(0);
        };
        let cond = fd.op(cbranch).input(1);
        if !propagatable(fd, cond) {
            return Ok(0);
        }
        // CBRANCH out-slot 1 is the taken edge: the arm reached when the
        // condition is true.
        let value_when_true = if slots[0] == 1 { c0 } else { c1 };
        let out_size = fd.varnode(fd.op(op).output().unwrap()).size();
        let pc = fd.op(op).seq().addr();
        let condvar = if value_when_true == 1 {
            cond
        } else {
            let negate = fd.new_op(pc, OpCode::BOOL_NEGATE);
            fd.op_set_input(negate, cond, 0);
            let negated = fd.new_unique_out(1, negate)?;
            fd.op_insert_begin(negate, blk);
            negated
        };
        if out_size == 1 {
            fd.op_set_opcode(op, OpCode::COPY);
        } else {
            fd.op_set_opcode(op, OpCode::INT_ZEXT);
        }
        fd.op_set_all_input(op, vec![condvar]);
        Ok(1)
    }
}

/// Rewrites comparisons of a three-way compare value against zero.
///
/// A three-way compare is the idiom `t = zext(b < a) - zext(a < b)`, which
/// takes the values -1, 0, 1. Tests of `t` against zero reduce to a single
/// comparison of `a` and `b`.
pub struct RuleThreeWayCompare;

impl RuleThreeWayCompare {
    /// Matches `t = INT_SUB(INT_ZEXT(b < a), INT_ZEXT(a < b))` and returns
    /// `(cmp_code, a, b)`.
    fn match_three_way(
        fd: &FunctionData,
        vn: VarnodeId,
    ) -> Option<(OpCode, VarnodeId, VarnodeId)> {
        let sub = def_with_code(fd, vn, OpCode::INT_SUB)?;
        let gt_ext = def_with_code(fd, fd.op(sub).input(0), OpCode::INT_ZEXT)?;
        let lt_ext = def_with_code(fd, fd.op(sub).input(1), OpCode::INT_ZEXT)?;
        let gt = fd.varnode(fd.op(gt_ext).input(0)).def()?;
        let lt = fd.varnode(fd.op(lt_ext).input(0)).def()?;
        let code = fd.op(gt).code();
        if code != fd.op(lt).code() {
            return None;
        }
        if !matches!(
            code,
            OpCode::INT_LESS | OpCode::INT_SLESS | OpCode::FLOAT_LESS
        ) {
            return None;
        }
        let (b, a) = (fd.op(gt).input(0), fd.op(gt).input(1));
        // The second comparison must be the mirror image of the first.
        if fd.op(lt).input(0) != a || fd.op(lt).input(1) != b {
            return None;
        }
        Some((code, a, b))
    }

    fn equality_for(code: OpCode) -> OpCode {
        if code == OpCode::FLOAT_LESS {
            OpCode::FLOAT_EQUAL
        } else {
            OpCode::INT_EQUAL
        }
    }
}

impl Rule for RuleThreeWayCompare {
    fn name(&self) -> &'static str {
        "threewaycompare"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleThreeWayCompare)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_EQUAL, OpCode::INT_NOTEQUAL, OpCode::INT_SLESS]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let code = fd.op(op).code();
        // One side must be the three-way value, the other the constant 0.
        let (three_slot, zero_slot) = if const_val(fd, fd.op(op).input(1)) == Some(0) {
            (0, 1)
        } else if const_val(fd, fd.op(op).input(0)) == Some(0) {
            (1, 0)
        } else {
            return Ok(0);
        };
        let three = fd.op(op).input(three_slot);
        let Some((cmp, a, b)) = Self::match_three_way(fd, three) else {
            return Ok(0);
        };
        if !propagatable(fd, a) || !propagatable(fd, b) {
            return Ok(0);
        }
        match (code, three_slot) {
            // (a <=> b) == 0   is   a == b
            (OpCode::INT_EQUAL, _) => {
                fd.op_set_opcode(op, Self::equality_for(cmp));
                fd.op_set_all_input(op, vec![a, b]);
            }
            // (a <=> b) != 0   is   !(a == b)
            (OpCode::INT_NOTEQUAL, _) => {
                let eq = Self::equality_for(cmp);
                let negated = eq.boolean_negate().unwrap();
                fd.op_set_opcode(op, negated);
                fd.op_set_all_input(op, vec![a, b]);
            }
            // (a <=> b) < 0    is   a < b
            (OpCode::INT_SLESS, 0) => {
                fd.op_set_opcode(op, cmp);
                fd.op_set_all_input(op, vec![a, b]);
            }
            // 0 < (a <=> b)    is   b < a
            (OpCode::INT_SLESS, _) => {
                fd.op_set_opcode(op, cmp);
                fd.op_set_all_input(op, vec![b, a]);
            }
            _ => return Ok(0),
        }
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    fn reg(fd: &mut FunctionData, offset: u64) -> VarnodeId {
        let vn = fd.new_varnode(4, Address::new(SpaceId::mock_register(), offset));
        fd.set_input_varnode(vn).unwrap()
    }

    fn build_three_way(fd: &mut FunctionData, a: VarnodeId, b: VarnodeId) -> VarnodeId {
        let pc = fd.entry();
        let gt = fd.new_op(pc, OpCode::INT_SLESS);
        fd.op_set_input(gt, b, 0);
        fd.op_set_input(gt, a, 1);
        let gt_out = fd.new_unique_out(1, gt).unwrap();
        let lt = fd.new_op(pc, OpCode::INT_SLESS);
        fd.op_set_input(lt, a, 0);
        fd.op_set_input(lt, b, 1);
        let lt_out = fd.new_unique_out(1, lt).unwrap();
        let gt_ext = fd.new_op(pc, OpCode::INT_ZEXT);
        fd.op_set_input(gt_ext, gt_out, 0);
        let gt_wide = fd.new_unique_out(4, gt_ext).unwrap();
        let lt_ext = fd.new_op(pc, OpCode::INT_ZEXT);
        fd.op_set_input(lt_ext, lt_out, 0);
        let lt_wide = fd.new_unique_out(4, lt_ext).unwrap();
        let sub = fd.new_op(pc, OpCode::INT_SUB);
        fd.op_set_input(sub, gt_wide, 0);
        fd.op_set_input(sub, lt_wide, 1);
        fd.new_unique_out(4, sub).unwrap()
    }

    #[test]
    fn three_way_equality() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let a = reg(&mut fd, 0x8);
        let b = reg(&mut fd, 0x10);
        let three = build_three_way(&mut fd, a, b);
        let cmp = fd.new_op(pc, OpCode::INT_EQUAL);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(cmp, three, 0);
        fd.op_set_input(cmp, zero, 1);
        fd.new_unique_out(1, cmp).unwrap();

        assert_eq!(RuleThreeWayCompare.apply_op(cmp, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(cmp).code(), OpCode::INT_EQUAL);
        assert_eq!(fd.op(cmp).inputs(), &[a, b]);
    }

    #[test]
    fn three_way_less() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let a = reg(&mut fd, 0x8);
        let b = reg(&mut fd, 0x10);
        let three = build_three_way(&mut fd, a, b);
        let cmp = fd.new_op(pc, OpCode::INT_SLESS);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(cmp, three, 0);
        fd.op_set_input(cmp, zero, 1);
        fd.new_unique_out(1, cmp).unwrap();

        assert_eq!(RuleThreeWayCompare.apply_op(cmp, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(cmp).code(), OpCode::INT_SLESS);
        assert_eq!(fd.op(cmp).inputs(), &[a, b]);
    }

    #[test]
    fn conditional_move_diamond() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        // decider -> arm0 -> join, decider -> join (taken edge second).
        let decider = fd.blocks_mut().new_block(pc);
        let arm = fd.blocks_mut().new_block(pc.add_wrap(4));
        let join = fd.blocks_mut().new_block(pc.add_wrap(8));
        fd.blocks_mut().add_edge(decider, arm); // slot 0: fallthrough
        fd.blocks_mut().add_edge(decider, join); // slot 1: taken
        fd.blocks_mut().add_edge(arm, join);
        fd.blocks_mut().set_entry(decider);

        let cond = fd.new_varnode(1, Address::new(SpaceId::mock_register(), 0x0));
        let cond = fd.set_input_varnode(cond).unwrap();
        let cbranch = fd.new_op(pc, OpCode::CBRANCH);
        let target = fd.new_varnode(8, Address::new(SpaceId::mock_ram(), 0x2000));
        fd.varnode_mut(target)
            .set_flag(crate::data_flow::varnode_flags::ANNOTATION);
        fd.op_set_input(cbranch, target, 0);
        fd.op_set_input(cbranch, cond, 1);
        fd.op_insert_end(cbranch, decider);

        // join phi: slot 0 from decider (taken, value 1), slot 1 from arm
        // (fallthrough, value 0).
        let phi = fd.new_op(pc.add_wrap(8), OpCode::MULTIEQUAL);
        let one = fd.new_constant(4, 1);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(phi, one, 0);
        fd.op_set_input(phi, zero, 1);
        fd.new_unique_out(4, phi).unwrap();
        fd.op_insert_begin(phi, join);

        assert_eq!(RuleConditionalMove.apply_op(phi, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(phi).code(), OpCode::INT_ZEXT);
        assert_eq!(fd.op(phi).inputs(), &[cond]);
    }
}
