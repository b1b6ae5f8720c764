//! Constant folding and algebraic simplification.

use crate::address::calc_mask;
use crate::architecture::Architecture;
use crate::data_flow::{evaluate_binary, evaluate_unary, OpCode, OpId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{const_val, in_const, propagatable};

/// Removes dead COPY ops early: a COPY whose output is never read and has no
/// address force is clutter the dead-code action would catch much later.
pub struct RuleEarlyRemoval;

impl Rule for RuleEarlyRemoval {
    fn name(&self) -> &'static str {
        "earlyremoval"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleEarlyRemoval)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::COPY]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let Some(out) = fd.op(op).output() else {
            return Ok(0);
        };
        let v = fd.varnode(out);
        if !v.has_no_descend() || !propagatable(fd, out) {
            return Ok(0);
        }
        let space = v.addr().space();
        if !fd.heritage().dead_removal_allowed(space) {
            return Ok(0);
        }
        let freed = fd.op_destroy(op)?;
        if let Some(freed) = freed {
            fd.delete_varnode(freed)?;
        }
        Ok(1)
    }
}

/// Reorders commutative ops so that a constant sits in the second slot.
///
/// Later rules only match the canonical orientation.
pub struct RuleTermOrder;

impl Rule for RuleTermOrder {
    fn name(&self) -> &'static str {
        "termorder"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleTermOrder)
    }

    fn op_list(&self) -> Vec<OpCode> {
        Vec::new()
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        if !fd.op(op).code().is_commutative() || fd.op(op).num_inputs() != 2 {
            return Ok(0);
        }
        if in_const(fd, op, 0).is_some() && in_const(fd, op, 1).is_none() {
            fd.op_swap_input(op, 0, 1);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Folds any op whose inputs are all constant into a COPY of the computed
/// constant.
pub struct RuleCollapseConstants;

impl Rule for RuleCollapseConstants {
    fn name(&self) -> &'static str {
        "collapseconstants"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleCollapseConstants)
    }

    fn op_list(&self) -> Vec<OpCode> {
        Vec::new()
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let o = fd.op(op);
        let code = o.code();
        if code.is_marker()
            || code.is_call()
            || code.is_branch()
            || code.is_flow_break()
            || matches!(
                code,
                OpCode::COPY
                    | OpCode::LOAD
                    | OpCode::STORE
                    | OpCode::CAST
                    | OpCode::PTRADD
                    | OpCode::PTRSUB
                    | OpCode::SEGMENTOP
                    | OpCode::CPOOLREF
                    | OpCode::INSERT
                    | OpCode::EXTRACT
                    | OpCode::UNIMPLEMENTED
            )
        {
            return Ok(0);
        }
        let Some(out) = o.output() else {
            return Ok(0);
        };
        let out_size = fd.varnode(out).size();
        let folded = match o.num_inputs() {
            1 => {
                let c0 = match in_const(fd, op, 0) {
                    Some(c) => c,
                    None => return Ok(0),
                };
                let in_size = fd.varnode(o.input(0)).size();
                evaluate_unary(code, out_size, in_size, c0)
            }
            2 => {
                let (Some(c0), Some(c1)) = (in_const(fd, op, 0), in_const(fd, op, 1)) else {
                    return Ok(0);
                };
                let in_size = fd.varnode(o.input(0)).size();
                evaluate_binary(code, out_size, in_size, c0, c1)
            }
            _ => None,
        };
        let Some(value) = folded else {
            return Ok(0);
        };
        let constvn = fd.new_constant(out_size, value);
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_all_input(op, vec![constvn]);
        Ok(1)
    }
}

/// Eliminates identity elements: `x + 0`, `x * 1`, `x | 0`, `x ^ 0`,
/// `x << 0`, `x & ~0`, `x * 0`, `x & 0`, and the boolean counterparts.
pub struct RuleIdentityEl;

impl Rule for RuleIdentityEl {
    fn name(&self) -> &'static str {
        "identityel"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleIdentityEl)
    }

    fn op_list(&self) -> Vec<OpCode> {
        use OpCode::*;
        vec![
            INT_ADD, INT_SUB, INT_MULT, INT_OR, INT_XOR, INT_AND, INT_LEFT, INT_RIGHT,
            INT_SRIGHT, BOOL_OR, BOOL_AND, BOOL_XOR,
        ]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        use OpCode::*;
        let code = fd.op(op).code();
        let Some(c) = in_const(fd, op, 1) else {
            return Ok(0);
        };
        let other = fd.op(op).input(0);
        if !propagatable(fd, other) {
            return Ok(0);
        }
        let size = fd.varnode(other).size();
        let mask = calc_mask(size);
        // x OP identity == x
        let is_identity = match code {
            INT_ADD | INT_SUB | INT_OR | INT_XOR | INT_LEFT | INT_RIGHT | INT_SRIGHT
            | BOOL_OR | BOOL_XOR => c == 0,
            INT_MULT => c == 1,
            INT_AND => c == mask,
            BOOL_AND => c == 1,
            _ => false,
        };
        if is_identity {
            fd.op_set_opcode(op, COPY);
            fd.op_remove_input(op, 1);
            return Ok(1);
        }
        // x OP absorber == absorber
        let absorber = match code {
            INT_MULT | INT_AND | BOOL_AND => (c == 0).then_some(0u64),
            BOOL_OR => (c == 1).then_some(1u64),
            _ => None,
        };
        if let Some(value) = absorber {
            let out_size = fd.varnode(fd.op(op).output().unwrap()).size();
            let constvn = fd.new_constant(out_size, value);
            fd.op_set_opcode(op, COPY);
            fd.op_set_all_input(op, vec![constvn]);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Collapses ops whose two inputs are the same varnode: `x - x`, `x ^ x`,
/// `x & x`, `x | x`, and comparisons of a value with itself.
pub struct RuleTrivialArith;

impl Rule for RuleTrivialArith {
    fn name(&self) -> &'static str {
        "trivialarith"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleTrivialArith)
    }

    fn op_list(&self) -> Vec<OpCode> {
        use OpCode::*;
        vec![
            INT_SUB, INT_XOR, INT_AND, INT_OR, INT_EQUAL, INT_NOTEQUAL, INT_LESS, INT_SLESS,
            INT_LESSEQUAL, INT_SLESSEQUAL, BOOL_XOR, BOOL_AND, BOOL_OR,
        ]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        use OpCode::*;
        if fd.op(op).num_inputs() != 2 {
            return Ok(0);
        }
        let (a, b) = (fd.op(op).input(0), fd.op(op).input(1));
        if a != b || !propagatable(fd, a) {
            return Ok(0);
        }
        let code = fd.op(op).code();
        let out_size = fd.varnode(fd.op(op).output().unwrap()).size();
        enum Rewrite {
            Const(u64),
            CopyInput,
        }
        let rewrite = match code {
            INT_SUB | INT_XOR | BOOL_XOR => Rewrite::Const(0),
            INT_AND | INT_OR | BOOL_AND | BOOL_OR => Rewrite::CopyInput,
            INT_EQUAL | INT_LESSEQUAL | INT_SLESSEQUAL => Rewrite::Const(1),
            INT_NOTEQUAL | INT_LESS | INT_SLESS => Rewrite::Const(0),
            _ => return Ok(0),
        };
        match rewrite {
            Rewrite::Const(value) => {
                let constvn = fd.new_constant(out_size, value);
                fd.op_set_opcode(op, COPY);
                fd.op_set_all_input(op, vec![constvn]);
            }
            Rewrite::CopyInput => {
                fd.op_set_opcode(op, COPY);
                fd.op_remove_input(op, 1);
            }
        }
        Ok(1)
    }
}

/// Cancels double negations: `~~x` and `-(-x)`.
pub struct RuleNegateIdentity;

impl Rule for RuleNegateIdentity {
    fn name(&self) -> &'static str {
        "negateidentity"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleNegateIdentity)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_NEGATE, OpCode::INT_2COMP, OpCode::BOOL_NEGATE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let code = fd.op(op).code();
        let input = fd.op(op).input(0);
        let Some(def) = super::def_with_code(fd, input, code) else {
            return Ok(0);
        };
        let inner = fd.op(def).input(0);
        if !propagatable(fd, inner) || !propagatable(fd, input) {
            return Ok(0);
        }
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_input(op, inner, 0);
        Ok(1)
    }
}

/// Converts subtraction of a constant into addition: `x - #c` becomes
/// `x + #(-c)`, giving the addition-collapsing rules a single form.
pub struct RuleSub2Add;

impl Rule for RuleSub2Add {
    fn name(&self) -> &'static str {
        "sub2add"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleSub2Add)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_SUB]
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
        if c == 0 {
            return Ok(0); // IdentityEl handles this.
        }
        let size = fd.varnode(fd.op(op).input(1)).size();
        let negated = fd.new_constant(size, c.wrapping_neg());
        fd.op_set_opcode(op, OpCode::INT_ADD);
        fd.op_set_input(op, negated, 1);
        Ok(1)
    }
}

/// Reassociates constant chains: `(x + #c1) + #c2` becomes `x + #(c1+c2)`
/// and `(x * #c1) * #c2` becomes `x * #(c1*c2)`.
pub struct RuleAddMultCollapse;

impl Rule for RuleAddMultCollapse {
    fn name(&self) -> &'static str {
        "addmultcollapse"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleAddMultCollapse)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_ADD, OpCode::INT_MULT]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let code = fd.op(op).code();
        let Some(c2) = in_const(fd, op, 1) else {
            return Ok(0);
        };
        let inner_vn = fd.op(op).input(0);
        let Some(inner) = super::def_with_code(fd, inner_vn, code) else {
            return Ok(0);
        };
        let Some(c1) = in_const(fd, inner, 1) else {
            return Ok(0);
        };
        let x = fd.op(inner).input(0);
        if !propagatable(fd, x) || !propagatable(fd, inner_vn) {
            return Ok(0);
        }
        let size = fd.varnode(inner_vn).size();
        let combined = match code {
            OpCode::INT_ADD => c1.wrapping_add(c2),
            _ => c1.wrapping_mul(c2),
        } & calc_mask(size);
        let constvn = fd.new_constant(size, combined);
        fd.op_set_input(op, x, 0);
        fd.op_set_input(op, constvn, 1);
        Ok(1)
    }
}

/// Converts a left shift by a constant into a multiplication when the result
/// flows into arithmetic, normalizing address computations.
pub struct RuleShift2Mult;

impl Rule for RuleShift2Mult {
    fn name(&self) -> &'static str {
        "shift2mult"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleShift2Mult)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_LEFT]
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
        let out = fd.op(op).output().unwrap();
        let size = fd.varnode(out).size();
        if c >= (size * 8) as u64 {
            return Ok(0); // TrivialShift turns this into zero.
        }
        let arithmetic_use = fd.varnode(out).descendants().iter().any(|&reader| {
            matches!(
                fd.op(reader).code(),
                OpCode::INT_ADD | OpCode::INT_SUB | OpCode::INT_MULT | OpCode::PTRADD
            )
        });
        if !arithmetic_use {
            return Ok(0);
        }
        let in_size = fd.varnode(fd.op(op).input(1)).size();
        let factor = fd.new_constant(in_size.max(size), 1u64 << c);
        fd.op_set_opcode(op, OpCode::INT_MULT);
        fd.op_set_input(op, factor, 1);
        Ok(1)
    }
}

/// Simplifies shifts by degenerate counts: a shift by zero is a COPY, a
/// shift by at least the bit width is zero (or a sign smear).
pub struct RuleTrivialShift;

impl Rule for RuleTrivialShift {
    fn name(&self) -> &'static str {
        "trivialshift"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleTrivialShift)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_LEFT, OpCode::INT_RIGHT, OpCode::INT_SRIGHT]
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
        let input = fd.op(op).input(0);
        let bits = fd.varnode(input).size() as u64 * 8;
        if c == 0 {
            fd.op_set_opcode(op, OpCode::COPY);
            fd.op_remove_input(op, 1);
            return Ok(1);
        }
        if c >= bits && fd.op(op).code() != OpCode::INT_SRIGHT {
            let out_size = fd.varnode(fd.op(op).output().unwrap()).size();
            let zero = fd.new_constant(out_size, 0);
            fd.op_set_opcode(op, OpCode::COPY);
            fd.op_set_all_input(op, vec![zero]);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Removes an AND whose mask covers every possibly non-zero bit of the other
/// input.
///
/// This also fires when the mask constant equals the zero-extension mask of
/// a value of smaller logical width.
pub struct RuleAndMask;

impl Rule for RuleAndMask {
    fn name(&self) -> &'static str {
        "andmask"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleAndMask)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_AND]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let Some(mask) = in_const(fd, op, 1) else {
            return Ok(0);
        };
        let other = fd.op(op).input(0);
        if !propagatable(fd, other) {
            return Ok(0);
        }
        if fd.varnode(other).nzmask() & !mask != 0 {
            return Ok(0);
        }
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_remove_input(op, 1);
        Ok(1)
    }
}

/// Collapses an OR whose constant covers every bit of the output to the
/// constant itself.
pub struct RuleOrMask;

impl Rule for RuleOrMask {
    fn name(&self) -> &'static str {
        "ormask"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleOrMask)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_OR]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let Some(mask) = in_const(fd, op, 1) else {
            return Ok(0);
        };
        let out = fd.op(op).output().unwrap();
        let size = fd.varnode(out).size();
        if mask != calc_mask(size) {
            return Ok(0);
        }
        let other = fd.op(op).input(0);
        if !propagatable(fd, other) {
            return Ok(0);
        }
        let constvn = fd.new_constant(size, mask);
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_all_input(op, vec![constvn]);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    fn setup() -> (AddrSpaceManager, Architecture, FunctionData) {
        let manager = AddrSpaceManager::mock();
        let arch = Architecture::mock();
        let fd = FunctionData::mock(&manager);
        (manager, arch, fd)
    }

    #[test]
    fn collapse_constants_folds_add() {
        let (_, arch, mut fd) = setup();
        let pc = fd.entry();
        let op = fd.new_op(pc, OpCode::INT_ADD);
        let three = fd.new_constant(4, 3);
        let four = fd.new_constant(4, 4);
        fd.op_set_input(op, three, 0);
        fd.op_set_input(op, four, 1);
        let out = fd.new_unique_out(4, op).unwrap();
        let blk = fd.blocks_mut().new_block(pc);
        fd.op_insert_end(op, blk);

        let changes = RuleCollapseConstants.apply_op(op, &mut fd, &arch).unwrap();
        assert_eq!(changes, 1);
        assert_eq!(fd.op(op).code(), OpCode::COPY);
        assert_eq!(const_val(&fd, fd.op(op).input(0)), Some(7));
        assert_eq!(fd.op(op).output(), Some(out));
    }

    #[test]
    fn identity_and_mask_with_nzmask() {
        let (_, arch, mut fd) = setup();
        let pc = fd.entry();
        // v = SUBPIECE(x, 0):1 has a one-byte nzmask; AND with 0xff is a
        // no-op and must collapse to a COPY.
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let sub = fd.new_op(pc, OpCode::SUBPIECE);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(sub, x, 0);
        fd.op_set_input(sub, zero, 1);
        let narrow = fd.new_unique_out(1, sub).unwrap();

        let and_op = fd.new_op(pc, OpCode::INT_AND);
        let mask = fd.new_constant(1, 0xff);
        fd.op_set_input(and_op, narrow, 0);
        fd.op_set_input(and_op, mask, 1);
        fd.new_unique_out(1, and_op).unwrap();

        let changes = RuleAndMask.apply_op(and_op, &mut fd, &arch).unwrap();
        assert_eq!(changes, 1);
        assert_eq!(fd.op(and_op).code(), OpCode::COPY);
        assert_eq!(fd.op(and_op).num_inputs(), 1);
        assert_eq!(fd.op(and_op).input(0), narrow);
    }

    #[test]
    fn term_order_moves_constant_right() {
        let (_, arch, mut fd) = setup();
        let pc = fd.entry();
        let op = fd.new_op(pc, OpCode::INT_ADD);
        let c = fd.new_constant(4, 5);
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        fd.op_set_input(op, c, 0);
        fd.op_set_input(op, x, 1);
        fd.new_unique_out(4, op).unwrap();
        assert_eq!(RuleTermOrder.apply_op(op, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(op).input(0), x);
        // Second application changes nothing: idempotent.
        assert_eq!(RuleTermOrder.apply_op(op, &mut fd, &arch).unwrap(), 0);
    }

    #[test]
    fn add_mult_collapse() {
        let (_, arch, mut fd) = setup();
        let pc = fd.entry();
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let inner = fd.new_op(pc, OpCode::INT_ADD);
        let c1 = fd.new_constant(4, 0x10);
        fd.op_set_input(inner, x, 0);
        fd.op_set_input(inner, c1, 1);
        let mid = fd.new_unique_out(4, inner).unwrap();
        let outer = fd.new_op(pc, OpCode::INT_ADD);
        let c2 = fd.new_constant(4, 0x20);
        fd.op_set_input(outer, mid, 0);
        fd.op_set_input(outer, c2, 1);
        fd.new_unique_out(4, outer).unwrap();

        assert_eq!(RuleAddMultCollapse.apply_op(outer, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(outer).input(0), x);
        assert_eq!(in_const(&fd, outer, 1), Some(0x30));
    }
}
