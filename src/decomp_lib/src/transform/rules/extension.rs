//! Zero- and sign-extension trimming.

use crate::address::calc_mask;
use crate::architecture::Architecture;
use crate::data_flow::{OpCode, OpId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{def_with_code, in_const, is_locked, propagatable};

/// Eliminates an extension feeding a comparison against a constant that
/// fits the unextended width: the comparison happens on the original value.
pub struct RuleZextEliminate;

impl Rule for RuleZextEliminate {
    fn name(&self) -> &'static str {
        "zexteliminate"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleZextEliminate)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![
            OpCode::INT_EQUAL,
            OpCode::INT_NOTEQUAL,
            OpCode::INT_LESS,
            OpCode::INT_LESSEQUAL,
        ]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        // Handle both orientations of (zext(x), #c).
        for (ext_slot, const_slot) in [(0usize, 1usize), (1, 0)] {
            let Some(c) = in_const(fd, op, const_slot) else {
                continue;
            };
            let ext_vn = fd.op(op).input(ext_slot);
            let Some(ext) = def_with_code(fd, ext_vn, OpCode::INT_ZEXT) else {
                continue;
            };
            let x = fd.op(ext).input(0);
            if !propagatable(fd, ext_vn) || !propagatable(fd, x) || is_locked(fd, x) {
                continue;
            }
            let x_size = fd.varnode(x).size();
            if c > calc_mask(x_size) {
                continue; // The comparison result is decided; let folding act.
            }
            let narrow_const = fd.new_constant(x_size, c);
            fd.op_set_input(op, x, ext_slot);
            fd.op_set_input(op, narrow_const, const_slot);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Merges stacked zero extensions into one.
pub struct RuleDoubleZext;

impl Rule for RuleDoubleZext {
    fn name(&self) -> &'static str {
        "doublezext"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleDoubleZext)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_ZEXT]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let mid = fd.op(op).input(0);
        let Some(inner) = def_with_code(fd, mid, OpCode::INT_ZEXT) else {
            return Ok(0);
        };
        let x = fd.op(inner).input(0);
        if !propagatable(fd, mid) || !propagatable(fd, x) {
            return Ok(0);
        }
        fd.op_set_input(op, x, 0);
        Ok(1)
    }
}

/// Weakens a sign extension to a zero extension when the known-zero mask
/// proves the sign bit clear. With the aggressive-trim option the proof is
/// skipped for values whose uses never reach the extended bits.
pub struct RuleSext2Zext;

impl Rule for RuleSext2Zext {
    fn name(&self) -> &'static str {
        "sext2zext"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleSext2Zext)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_SEXT]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        arch: &Architecture,
    ) -> Result<i32, Error> {
        let x = fd.op(op).input(0);
        if !propagatable(fd, x) {
            return Ok(0);
        }
        let x_size = fd.varnode(x).size();
        let sign_bit = 1u64 << (x_size * 8 - 1);
        let sign_clear = fd.varnode(x).nzmask() & sign_bit == 0;
        if !sign_clear {
            if !arch.options().aggressive_trim {
                return Ok(0);
            }
            // Aggressive mode: allow the weakening when every reader
            // truncates back below the original width.
            let out = fd.op(op).output().unwrap();
            let all_truncated = fd.varnode(out).descendants().iter().all(|&reader| {
                fd.op(reader).code() == OpCode::SUBPIECE
                    && fd.op(reader).slot_of(out) == Some(0)
                    && in_const(fd, reader, 1) == Some(0)
                    && fd
                        .op(reader)
                        .output()
                        .map(|subout| fd.varnode(subout).size() <= x_size)
                        .unwrap_or(false)
            });
            if !all_truncated {
                return Ok(0);
            }
        }
        fd.op_set_opcode(op, OpCode::INT_ZEXT);
        Ok(1)
    }
}

/// Narrows a value that is only consumed through its low-byte subfield:
/// when every reader of `v = INT_AND(x, #lowmask)` is a truncation to the
/// masked width, the truncations read `x` directly and the AND dies.
pub struct RuleSubvarSubpiece;

impl Rule for RuleSubvarSubpiece {
    fn name(&self) -> &'static str {
        "subvarsubpiece"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleSubvarSubpiece)
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
        // The mask must select a whole number of low bytes.
        let masked_bytes = match mask {
            0xff => 1u32,
            0xffff => 2,
            0xffff_ffff => 4,
            _ => return Ok(0),
        };
        let x = fd.op(op).input(0);
        let out = match fd.op(op).output() {
            Some(out) => out,
            None => return Ok(0),
        };
        if masked_bytes >= fd.varnode(x).size() {
            return Ok(0); // AndMask covers the full-width case.
        }
        if !propagatable(fd, x) || !propagatable(fd, out) {
            return Ok(0);
        }
        let readers = fd.varnode(out).descendants().to_vec();
        if readers.is_empty() {
            return Ok(0);
        }
        let all_subfield = readers.iter().all(|&reader| {
            fd.op(reader).code() == OpCode::SUBPIECE
                && fd.op(reader).slot_of(out) == Some(0)
                && in_const(fd, reader, 1) == Some(0)
                && fd
                    .op(reader)
                    .output()
                    .map(|subout| fd.varnode(subout).size() <= masked_bytes)
                    .unwrap_or(false)
        });
        if !all_subfield {
            return Ok(0);
        }
        let mut changes = 0;
        for reader in readers {
            fd.op_set_input(reader, x, 0);
            changes += 1;
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    #[test]
    fn zext_compare_narrows() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(1, Address::new(SpaceId::mock_register(), 0x8));
        let x = fd.set_input_varnode(x).unwrap();
        let ext = fd.new_op(pc, OpCode::INT_ZEXT);
        fd.op_set_input(ext, x, 0);
        let wide = fd.new_unique_out(4, ext).unwrap();
        let cmp = fd.new_op(pc, OpCode::INT_EQUAL);
        let c = fd.new_constant(4, 0x41);
        fd.op_set_input(cmp, wide, 0);
        fd.op_set_input(cmp, c, 1);
        fd.new_unique_out(1, cmp).unwrap();

        assert_eq!(RuleZextEliminate.apply_op(cmp, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(cmp).input(0), x);
        assert_eq!(in_const(&fd, cmp, 1), Some(0x41));
        assert_eq!(fd.varnode(fd.op(cmp).input(1)).size(), 1);

        // A constant outside the narrow width is left alone.
        let cmp2 = fd.new_op(pc, OpCode::INT_EQUAL);
        let big = fd.new_constant(4, 0x1234);
        fd.op_set_input(cmp2, wide, 0);
        fd.op_set_input(cmp2, big, 1);
        fd.new_unique_out(1, cmp2).unwrap();
        assert_eq!(RuleZextEliminate.apply_op(cmp2, &mut fd, &arch).unwrap(), 0);
    }

    #[test]
    fn sext_weakens_with_clear_sign() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        // A value produced by AND with 0x7f provably has a clear sign bit.
        let x = fd.new_varnode(1, Address::new(SpaceId::mock_register(), 0x8));
        let x = fd.set_input_varnode(x).unwrap();
        let and_op = fd.new_op(pc, OpCode::INT_AND);
        let mask = fd.new_constant(1, 0x7f);
        fd.op_set_input(and_op, x, 0);
        fd.op_set_input(and_op, mask, 1);
        let masked = fd.new_unique_out(1, and_op).unwrap();
        let nz = crate::data_flow::output_nzmask(
            OpCode::INT_AND,
            1,
            &[
                crate::data_flow::MaskInput {
                    nzmask: 0xff,
                    size: 1,
                    constant: None,
                },
                crate::data_flow::MaskInput {
                    nzmask: 0x7f,
                    size: 1,
                    constant: Some(0x7f),
                },
            ],
        );
        fd.varnode_mut(masked).set_nzmask(nz);

        let sext = fd.new_op(pc, OpCode::INT_SEXT);
        fd.op_set_input(sext, masked, 0);
        fd.new_unique_out(4, sext).unwrap();
        assert_eq!(RuleSext2Zext.apply_op(sext, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(sext).code(), OpCode::INT_ZEXT);
    }
}
