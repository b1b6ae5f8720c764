//! Comparison normalization.

use crate::address::{calc_mask, sign_extend};
use crate::architecture::Architecture;
use crate::data_flow::{OpCode, OpId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{in_const, propagatable};

/// Converts non-strict comparisons against constants into strict ones:
/// `a <= #c` becomes `a < #(c+1)`, `#c <= a` becomes `#(c-1) < a`, with
/// overflow checks at the byte width.
pub struct RuleLessEqual;

impl Rule for RuleLessEqual {
    fn name(&self) -> &'static str {
        "lessequal"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleLessEqual)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_LESSEQUAL, OpCode::INT_SLESSEQUAL]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let signed = fd.op(op).code() == OpCode::INT_SLESSEQUAL;
        let strict = if signed {
            OpCode::INT_SLESS
        } else {
            OpCode::INT_LESS
        };
        if let Some(c) = in_const(fd, op, 1) {
            let size = fd.varnode(fd.op(op).input(1)).size();
            let mask = calc_mask(size);
            let overflow = if signed {
                sign_extend(c, size) == sign_extend(mask >> 1, size)
            } else {
                c == mask
            };
            if overflow {
                return Ok(0); // `a <= MAX` is always true; other rules fold.
            }
            let adjusted = fd.new_constant(size, c.wrapping_add(1) & mask);
            fd.op_set_opcode(op, strict);
            fd.op_set_input(op, adjusted, 1);
            return Ok(1);
        }
        if let Some(c) = in_const(fd, op, 0) {
            let size = fd.varnode(fd.op(op).input(0)).size();
            let mask = calc_mask(size);
            let underflow = if signed {
                sign_extend(c, size) == sign_extend(mask ^ (mask >> 1), size)
            } else {
                c == 0
            };
            if underflow {
                return Ok(0);
            }
            let adjusted = fd.new_constant(size, c.wrapping_sub(1) & mask);
            fd.op_set_opcode(op, strict);
            fd.op_set_input(op, adjusted, 0);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Collapses comparisons whose result is decided by the known-zero masks:
/// `x == x` is handled by the trivial-arithmetic rule; this rule decides
/// `x == #c` when `#c` has bits outside the possible bits of `x`.
pub struct RuleEquality;

impl Rule for RuleEquality {
    fn name(&self) -> &'static str {
        "equality"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleEquality)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_EQUAL, OpCode::INT_NOTEQUAL]
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
        let x = fd.op(op).input(0);
        if !propagatable(fd, x) {
            return Ok(0);
        }
        if c & !fd.varnode(x).nzmask() == 0 {
            return Ok(0); // The constant is a possible value.
        }
        // The comparison can never hold.
        let value = (fd.op(op).code() == OpCode::INT_NOTEQUAL) as u64;
        let constvn = fd.new_constant(1, value);
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_all_input(op, vec![constvn]);
        Ok(1)
    }
}

/// Rewrites an exclusive-or of two truth values as an inequality test.
pub struct RuleBxor2NotEqual;

impl Rule for RuleBxor2NotEqual {
    fn name(&self) -> &'static str {
        "bxor2notequal"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleBxor2NotEqual)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::BOOL_XOR]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        fd.op_set_opcode(op, OpCode::INT_NOTEQUAL);
        Ok(1)
    }
}

/// Simplifies comparisons against zero: `x < #0` is false, `#0 < x` is
/// `x != #0`, and `#0 <= x` is true.
pub struct RuleLess2Zero;

impl Rule for RuleLess2Zero {
    fn name(&self) -> &'static str {
        "less2zero"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleLess2Zero)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_LESS, OpCode::INT_LESSEQUAL]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let code = fd.op(op).code();
        if in_const(fd, op, 1) == Some(0) {
            if code == OpCode::INT_LESS {
                // Nothing is unsigned-less than zero.
                let constvn = fd.new_constant(1, 0);
                fd.op_set_opcode(op, OpCode::COPY);
                fd.op_set_all_input(op, vec![constvn]);
                return Ok(1);
            }
            // `x <= #0` is `x == #0`.
            fd.op_set_opcode(op, OpCode::INT_EQUAL);
            return Ok(1);
        }
        if in_const(fd, op, 0) == Some(0) {
            if code == OpCode::INT_LESS {
                // `#0 < x` is `x != #0`.
                let x = fd.op(op).input(1);
                let size = fd.varnode(x).size();
                let zero = fd.new_constant(size, 0);
                fd.op_set_opcode(op, OpCode::INT_NOTEQUAL);
                fd.op_set_input(op, x, 0);
                fd.op_set_input(op, zero, 1);
                return Ok(1);
            }
            // `#0 <= x` always holds.
            let constvn = fd.new_constant(1, 1);
            fd.op_set_opcode(op, OpCode::COPY);
            fd.op_set_all_input(op, vec![constvn]);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Pushes a boolean negation into the comparison it negates, when the
/// comparison has a direct complement and no other reader.
pub struct RuleBoolNegate;

impl Rule for RuleBoolNegate {
    fn name(&self) -> &'static str {
        "boolnegate"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleBoolNegate)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::BOOL_NEGATE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let input = fd.op(op).input(0);
        let Some(def) = fd.varnode(input).def() else {
            return Ok(0);
        };
        let Some(negated) = fd.op(def).code().boolean_negate() else {
            return Ok(0);
        };
        if fd.varnode(input).lone_descend() != Some(op) {
            return Ok(0);
        }
        let (a, b) = (fd.op(def).input(0), fd.op(def).input(1));
        fd.op_set_opcode(op, negated);
        fd.op_set_input(op, a, 0);
        fd.op_set_input(op, b, 1);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};
    use crate::transform::rules::const_val;

    #[test]
    fn lessequal_becomes_strict() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let op = fd.new_op(pc, OpCode::INT_LESSEQUAL);
        let c = fd.new_constant(4, 9);
        fd.op_set_input(op, x, 0);
        fd.op_set_input(op, c, 1);
        fd.new_unique_out(1, op).unwrap();

        assert_eq!(RuleLessEqual.apply_op(op, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(op).code(), OpCode::INT_LESS);
        assert_eq!(in_const(&fd, op, 1), Some(10));

        // The boundary constant refuses the transform.
        let op2 = fd.new_op(pc, OpCode::INT_LESSEQUAL);
        let max = fd.new_constant(4, 0xffff_ffff);
        let x2 = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        fd.op_set_input(op2, x2, 0);
        fd.op_set_input(op2, max, 1);
        fd.new_unique_out(1, op2).unwrap();
        assert_eq!(RuleLessEqual.apply_op(op2, &mut fd, &arch).unwrap(), 0);
    }

    #[test]
    fn less_against_zero() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let op = fd.new_op(pc, OpCode::INT_LESS);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(op, x, 0);
        fd.op_set_input(op, zero, 1);
        fd.new_unique_out(1, op).unwrap();

        assert_eq!(RuleLess2Zero.apply_op(op, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(op).code(), OpCode::COPY);
        assert_eq!(const_val(&fd, fd.op(op).input(0)), Some(0));
    }
}
