//! SUBPIECE and PIECE rewriting.

use crate::architecture::Architecture;
use crate::data_flow::{OpCode, OpId, VarnodeId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{def_with_code, in_const, is_locked, propagatable};

/// Merges nested truncations: `SUBPIECE(SUBPIECE(x, #c1), #c2)` becomes
/// `SUBPIECE(x, #(c1+c2))`.
pub struct RuleDoubleSub;

impl Rule for RuleDoubleSub {
    fn name(&self) -> &'static str {
        "doublesub"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleDoubleSub)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::SUBPIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let Some(c2) = in_const(fd, op, 1) else {
            return Ok(0);
        };
        let mid = fd.op(op).input(0);
        let Some(inner) = def_with_code(fd, mid, OpCode::SUBPIECE) else {
            return Ok(0);
        };
        let Some(c1) = in_const(fd, inner, 1) else {
            return Ok(0);
        };
        let x = fd.op(inner).input(0);
        if !propagatable(fd, mid) || !propagatable(fd, x) {
            return Ok(0);
        }
        let size = fd.varnode(fd.op(inner).input(1)).size();
        let combined = fd.new_constant(size, c1 + c2);
        fd.op_set_input(op, x, 0);
        fd.op_set_input(op, combined, 1);
        Ok(1)
    }
}

/// Cancels a truncation against the extension it undoes:
/// `SUBPIECE(INT_ZEXT(x), 0)` is `x` (or a smaller truncation or extension
/// of `x`, depending on the sizes). Sign extensions cancel the same way as
/// long as the truncation stays within the original width.
pub struct RuleSubCancel;

impl Rule for RuleSubCancel {
    fn name(&self) -> &'static str {
        "subcancel"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleSubCancel)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::SUBPIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        if in_const(fd, op, 1) != Some(0) {
            return Ok(0);
        }
        let mid = fd.op(op).input(0);
        let ext = match fd.varnode(mid).def() {
            Some(def)
                if matches!(
                    fd.op(def).code(),
                    OpCode::INT_ZEXT | OpCode::INT_SEXT
                ) =>
            {
                def
            }
            _ => return Ok(0),
        };
        let x = fd.op(ext).input(0);
        if !propagatable(fd, mid) || !propagatable(fd, x) || is_locked(fd, x) {
            return Ok(0);
        }
        let out = fd.op(op).output().unwrap();
        let out_size = fd.varnode(out).size();
        let x_size = fd.varnode(x).size();
        if out_size == x_size {
            fd.op_set_opcode(op, OpCode::COPY);
            fd.op_set_all_input(op, vec![x]);
        } else if out_size < x_size {
            let zero = fd.new_constant(4, 0);
            fd.op_set_all_input(op, vec![x, zero]);
        } else if fd.op(ext).code() == OpCode::INT_ZEXT {
            fd.op_set_opcode(op, OpCode::INT_ZEXT);
            fd.op_set_all_input(op, vec![x]);
        } else {
            return Ok(0); // A partial sign extension does not cancel.
        }
        Ok(1)
    }
}

/// Lifts a truncation through a phi node: `SUBPIECE(MULTIEQUAL(a, b), #c)`
/// becomes a MULTIEQUAL over truncations of the phi inputs, each computed
/// at the end of the corresponding predecessor block.
pub struct RulePullsubMulti;

impl Rule for RulePullsubMulti {
    fn name(&self) -> &'static str {
        "pullsubmulti"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RulePullsubMulti)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::SUBPIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let Some(c) = in_const(fd, op, 1) else {
            return Ok(0);
        };
        let phi_out = fd.op(op).input(0);
        let Some(phi) = def_with_code(fd, phi_out, OpCode::MULTIEQUAL) else {
            return Ok(0);
        };
        // Only pull when the truncation is the single reader; otherwise the
        // wide phi stays alive anyway and nothing is saved.
        if fd.varnode(phi_out).lone_descend() != Some(op) {
            return Ok(0);
        }
        if !propagatable(fd, phi_out) {
            return Ok(0);
        }
        let Some(blk) = fd.op(phi).parent() else {
            return Ok(0);
        };
        let num_in = fd.blocks().block(blk).num_in();
        if num_in != fd.op(phi).num_inputs() {
            return Ok(0);
        }
        let out = fd.op(op).output().unwrap();
        let out_size = fd.varnode(out).size();

        let start = fd.blocks().block(blk).start();
        let newphi = fd.new_op(start, OpCode::MULTIEQUAL);
        let newout = fd.new_unique_out(out_size, newphi)?;
        let inputs: Vec<VarnodeId> = fd.op(phi).inputs().to_vec();
        for (slot, ai) in inputs.into_iter().enumerate() {
            let newin = if ai == phi_out {
                // A loop-carried value truncates to the new phi itself.
                newout
            } else if let Some(value) = super::const_val(fd, ai) {
                let shifted = (value >> (c.min(8) * 8))
                    & crate::address::calc_mask(out_size);
                fd.new_constant(out_size, shifted)
            } else {
                let pred = fd.blocks().block(blk).in_edges()[slot];
                let pc = fd.blocks().block(pred).stop();
                let subop = fd.new_op(pc, OpCode::SUBPIECE);
                let constvn = fd.new_constant(4, c);
                fd.op_set_input(subop, ai, 0);
                fd.op_set_input(subop, constvn, 1);
                let subout = fd.new_unique_out(out_size, subop)?;
                fd.op_insert_end(subop, pred);
                subout
            };
            fd.op_set_input(newphi, newin, slot);
        }
        fd.op_insert_begin(newphi, blk);
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_all_input(op, vec![newout]);
        Ok(1)
    }
}

/// Recognizes a zero extension written as a concatenation with zero:
/// `PIECE(#0, x)` is `INT_ZEXT(x)`.
pub struct RulePiece2Zext;

impl Rule for RulePiece2Zext {
    fn name(&self) -> &'static str {
        "piece2zext"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RulePiece2Zext)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::PIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        if in_const(fd, op, 0) != Some(0) {
            return Ok(0);
        }
        let x = fd.op(op).input(1);
        if !propagatable(fd, x) {
            return Ok(0);
        }
        fd.op_set_opcode(op, OpCode::INT_ZEXT);
        fd.op_set_all_input(op, vec![x]);
        Ok(1)
    }
}

/// Reassembles a value split into its own pieces:
/// `PIECE(SUBPIECE(x, #hi), SUBPIECE(x, #0))` is `x` when the two pieces
/// tile `x` exactly.
pub struct RuleHumptyDumpty;

impl Rule for RuleHumptyDumpty {
    fn name(&self) -> &'static str {
        "humptydumpty"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleHumptyDumpty)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::PIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let hi = fd.op(op).input(0);
        let lo = fd.op(op).input(1);
        let (Some(hidef), Some(lodef)) = (
            def_with_code(fd, hi, OpCode::SUBPIECE),
            def_with_code(fd, lo, OpCode::SUBPIECE),
        ) else {
            return Ok(0);
        };
        let x = fd.op(hidef).input(0);
        if fd.op(lodef).input(0) != x {
            return Ok(0);
        }
        if in_const(fd, lodef, 1) != Some(0) {
            return Ok(0);
        }
        let lo_size = fd.varnode(lo).size() as u64;
        if in_const(fd, hidef, 1) != Some(lo_size) {
            return Ok(0);
        }
        let out = fd.op(op).output().unwrap();
        if fd.varnode(out).size() != fd.varnode(x).size() {
            return Ok(0);
        }
        if !propagatable(fd, x) {
            return Ok(0);
        }
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_all_input(op, vec![x]);
        Ok(1)
    }
}

/// Commutes a low truncation into the operation it truncates:
/// `SUBPIECE(a OP b, 0)` becomes `SUBPIECE(a,0) OP SUBPIECE(b,0)` for
/// operations whose low bytes do not depend on the discarded high bytes.
pub struct RuleSubCommute;

impl Rule for RuleSubCommute {
    fn name(&self) -> &'static str {
        "subcommute"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleSubCommute)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::SUBPIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        use OpCode::*;
        if in_const(fd, op, 1) != Some(0) {
            return Ok(0);
        }
        let wide = fd.op(op).input(0);
        let Some(def) = fd.varnode(wide).def() else {
            return Ok(0);
        };
        let code = fd.op(def).code();
        if !matches!(code, INT_ADD | INT_MULT | INT_AND | INT_OR | INT_XOR) {
            return Ok(0);
        }
        if fd.varnode(wide).lone_descend() != Some(op) {
            return Ok(0);
        }
        if !propagatable(fd, wide) {
            return Ok(0);
        }
        let (a, b) = (fd.op(def).input(0), fd.op(def).input(1));
        let out_size = fd.varnode(fd.op(op).output().unwrap()).size();
        let pc = fd.op(op).seq().addr();
        let mut narrow = |fd: &mut FunctionData, vn: VarnodeId| -> Result<VarnodeId, Error> {
            if let Some(value) = super::const_val(fd, vn) {
                return Ok(fd.new_constant(
                    out_size,
                    value & crate::address::calc_mask(out_size),
                ));
            }
            let subop = fd.new_op(pc, SUBPIECE);
            let zero = fd.new_constant(4, 0);
            fd.op_set_input(subop, vn, 0);
            fd.op_set_input(subop, zero, 1);
            let subout = fd.new_unique_out(out_size, subop)?;
            fd.op_insert_before(subop, op);
            Ok(subout)
        };
        let na = narrow(fd, a)?;
        let nb = narrow(fd, b)?;
        fd.op_set_opcode(op, code);
        fd.op_set_all_input(op, vec![na, nb]);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};
    use crate::transform::rules::const_val;

    #[test]
    fn double_sub_merges() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(8, Address::new(SpaceId::mock_register(), 0x8));
        let inner = fd.new_op(pc, OpCode::SUBPIECE);
        let two = fd.new_constant(4, 2);
        fd.op_set_input(inner, x, 0);
        fd.op_set_input(inner, two, 1);
        let mid = fd.new_unique_out(4, inner).unwrap();
        let outer = fd.new_op(pc, OpCode::SUBPIECE);
        let one = fd.new_constant(4, 1);
        fd.op_set_input(outer, mid, 0);
        fd.op_set_input(outer, one, 1);
        fd.new_unique_out(1, outer).unwrap();

        assert_eq!(RuleDoubleSub.apply_op(outer, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(outer).input(0), x);
        assert_eq!(in_const(&fd, outer, 1), Some(3));
    }

    #[test]
    fn sub_cancels_zext() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(2, Address::new(SpaceId::mock_register(), 0x8));
        let x = fd.set_input_varnode(x).unwrap();
        let ext = fd.new_op(pc, OpCode::INT_ZEXT);
        fd.op_set_input(ext, x, 0);
        let wide = fd.new_unique_out(8, ext).unwrap();
        let sub = fd.new_op(pc, OpCode::SUBPIECE);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(sub, wide, 0);
        fd.op_set_input(sub, zero, 1);
        fd.new_unique_out(2, sub).unwrap();

        assert_eq!(RuleSubCancel.apply_op(sub, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(sub).code(), OpCode::COPY);
        assert_eq!(fd.op(sub).inputs(), &[x]);
    }

    #[test]
    fn humpty_dumpty_reassembles() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let x = fd.set_input_varnode(x).unwrap();
        let hidef = fd.new_op(pc, OpCode::SUBPIECE);
        let two = fd.new_constant(4, 2);
        fd.op_set_input(hidef, x, 0);
        fd.op_set_input(hidef, two, 1);
        let hi = fd.new_unique_out(2, hidef).unwrap();
        let lodef = fd.new_op(pc, OpCode::SUBPIECE);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(lodef, x, 0);
        fd.op_set_input(lodef, zero, 1);
        let lo = fd.new_unique_out(2, lodef).unwrap();
        let piece = fd.new_op(pc, OpCode::PIECE);
        fd.op_set_input(piece, hi, 0);
        fd.op_set_input(piece, lo, 1);
        fd.new_unique_out(4, piece).unwrap();

        assert_eq!(RuleHumptyDumpty.apply_op(piece, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(piece).code(), OpCode::COPY);
        assert_eq!(fd.op(piece).inputs(), &[x]);
    }

    #[test]
    fn piece_of_zero_is_zext() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let zero = fd.new_constant(4, 0);
        let piece = fd.new_op(pc, OpCode::PIECE);
        fd.op_set_input(piece, zero, 0);
        fd.op_set_input(piece, x, 1);
        fd.new_unique_out(8, piece).unwrap();
        assert_eq!(RulePiece2Zext.apply_op(piece, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(piece).code(), OpCode::INT_ZEXT);
        assert_eq!(fd.op(piece).inputs(), &[x]);
        assert_eq!(const_val(&fd, fd.op(piece).input(0)), None);
    }
}
