//! Reconstruction of division and remainder from magic-number sequences.
//!
//! Compilers replace division by a constant with a multiply by a scaled
//! reciprocal and a shift. The reconstruction inverts the magic constant:
//! given `q = (zext(n) * #magic) >> #shift`, the divisor is
//! `d = ceil(2^shift / magic)`, accepted only if the quotient matches
//! integer division over the whole input range.

use crate::address::calc_mask;
use crate::architecture::Architecture;
use crate::data_flow::{OpCode, OpId, VarnodeId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{def_with_code, in_const, propagatable};

/// Computes the divisor hidden in a magic multiply, verifying it over the
/// extremes of the input range.
fn recover_divisor(magic: u64, shift: u32, in_bytes: u32) -> Option<u64> {
    if magic == 0 || shift >= 127 {
        return None;
    }
    let power: u128 = 1u128 << shift;
    let divisor = power.div_ceil(magic as u128);
    if divisor == 0 || divisor > calc_mask(in_bytes) as u128 {
        return None;
    }
    // The approximation must reproduce exact division at the top of the
    // input range, where the error is largest.
    let n_max = calc_mask(in_bytes) as u128;
    for n in [n_max, n_max / 2 + 1, divisor - 1] {
        let approx = (n * magic as u128) >> shift;
        if approx != n / divisor {
            return None;
        }
    }
    Some(divisor as u64)
}

/// Matches `(INT_ZEXT(n) * #magic) >> #shift` (with the shift expressed as
/// INT_RIGHT or as a SUBPIECE of the high half) and returns
/// `(n, divisor, extended_size)`.
fn match_magic_div(fd: &FunctionData, op: OpId) -> Option<(VarnodeId, u64)> {
    let (mult_vn, shift) = match fd.op(op).code() {
        OpCode::INT_RIGHT => {
            let shift = in_const(fd, op, 1)?;
            (fd.op(op).input(0), shift as u32)
        }
        OpCode::SUBPIECE => {
            let cut = in_const(fd, op, 1)?;
            (fd.op(op).input(0), cut as u32 * 8)
        }
        _ => return None,
    };
    let mult = def_with_code(fd, mult_vn, OpCode::INT_MULT)?;
    let magic = in_const(fd, mult, 1)?;
    let zext_vn = fd.op(mult).input(0);
    let zext = def_with_code(fd, zext_vn, OpCode::INT_ZEXT)?;
    let n = fd.op(zext).input(0);
    if !propagatable(fd, n) || !propagatable(fd, mult_vn) || !propagatable(fd, zext_vn) {
        return None;
    }
    let in_bytes = fd.varnode(n).size();
    // The output must come back down to the original width.
    let out = fd.op(op).output()?;
    if fd.varnode(out).size() != in_bytes {
        return None;
    }
    let divisor = recover_divisor(magic, shift, in_bytes)?;
    Some((n, divisor))
}

/// Replaces a multiply-by-magic sequence with an unsigned division.
pub struct RuleDivOpt;

impl Rule for RuleDivOpt {
    fn name(&self) -> &'static str {
        "divopt"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleDivOpt)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_RIGHT, OpCode::SUBPIECE]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let Some((n, divisor)) = match_magic_div(fd, op) else {
            return Ok(0);
        };
        let size = fd.varnode(n).size();
        let divconst = fd.new_constant(size, divisor);
        fd.op_set_opcode(op, OpCode::INT_DIV);
        fd.op_set_all_input(op, vec![n, divconst]);
        Ok(1)
    }
}

/// Rebuilds a remainder from the division that produced it:
/// `n - (n / #d) * #d` becomes `n % #d`.
pub struct RuleModOpt;

impl Rule for RuleModOpt {
    fn name(&self) -> &'static str {
        "modopt"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleModOpt)
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
        let n = fd.op(op).input(0);
        let scaled = fd.op(op).input(1);
        let Some(mult) = def_with_code(fd, scaled, OpCode::INT_MULT) else {
            return Ok(0);
        };
        let Some(d) = in_const(fd, mult, 1) else {
            return Ok(0);
        };
        let quotient = fd.op(mult).input(0);
        let Some(div) = def_with_code(fd, quotient, OpCode::INT_DIV) else {
            return Ok(0);
        };
        if fd.op(div).input(0) != n || in_const(fd, div, 1) != Some(d) {
            return Ok(0);
        }
        if !propagatable(fd, n) || !propagatable(fd, scaled) {
            return Ok(0);
        }
        let size = fd.varnode(n).size();
        let divconst = fd.new_constant(size, d);
        fd.op_set_opcode(op, OpCode::INT_REM);
        fd.op_set_all_input(op, vec![n, divconst]);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    #[test]
    fn divisor_recovery() {
        // The canonical 32-bit divide-by-3: magic 0xaaaaaaab, shift 33.
        assert_eq!(recover_divisor(0xaaaa_aaab, 33, 4), Some(3));
        // Divide-by-10: magic 0xcccccccd, shift 35.
        assert_eq!(recover_divisor(0xcccc_cccd, 35, 4), Some(10));
        // A random constant does not verify.
        assert_eq!(recover_divisor(0x1234_5678, 33, 4), None);
    }

    #[test]
    fn magic_divide_is_rewritten() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let n = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let n = fd.set_input_varnode(n).unwrap();
        let zext = fd.new_op(pc, OpCode::INT_ZEXT);
        fd.op_set_input(zext, n, 0);
        let wide = fd.new_unique_out(8, zext).unwrap();
        let mult = fd.new_op(pc, OpCode::INT_MULT);
        let magic = fd.new_constant(8, 0xaaaa_aaab);
        fd.op_set_input(mult, wide, 0);
        fd.op_set_input(mult, magic, 1);
        let product = fd.new_unique_out(8, mult).unwrap();
        let shift = fd.new_op(pc, OpCode::INT_RIGHT);
        let count = fd.new_constant(4, 33);
        fd.op_set_input(shift, product, 0);
        fd.op_set_input(shift, count, 1);
        fd.new_unique_out(4, shift).unwrap();

        assert_eq!(RuleDivOpt.apply_op(shift, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(shift).code(), OpCode::INT_DIV);
        assert_eq!(fd.op(shift).input(0), n);
        assert_eq!(in_const(&fd, shift, 1), Some(3));
    }

    #[test]
    fn remainder_is_rebuilt() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let n = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let n = fd.set_input_varnode(n).unwrap();
        let div = fd.new_op(pc, OpCode::INT_DIV);
        let ten = fd.new_constant(4, 10);
        fd.op_set_input(div, n, 0);
        fd.op_set_input(div, ten, 1);
        let q = fd.new_unique_out(4, div).unwrap();
        let mult = fd.new_op(pc, OpCode::INT_MULT);
        let ten2 = fd.new_constant(4, 10);
        fd.op_set_input(mult, q, 0);
        fd.op_set_input(mult, ten2, 1);
        let scaled = fd.new_unique_out(4, mult).unwrap();
        let sub = fd.new_op(pc, OpCode::INT_SUB);
        fd.op_set_input(sub, n, 0);
        fd.op_set_input(sub, scaled, 1);
        fd.new_unique_out(4, sub).unwrap();

        assert_eq!(RuleModOpt.apply_op(sub, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(sub).code(), OpCode::INT_REM);
        assert_eq!(in_const(&fd, sub, 1), Some(10));
    }
}
