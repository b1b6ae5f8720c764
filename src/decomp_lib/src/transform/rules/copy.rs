//! Copy propagation and marker-op collapse.

use crate::architecture::Architecture;
use crate::data_flow::{op_flags, varnode_flags, OpCode, OpId, VarnodeId};
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::propagatable;

/// Replaces reads of a COPY output with reads of the COPY input.
///
/// Propagation never crosses volatile or persistent storage, incidental
/// copies, or address-forced values; the COPY op itself is left for dead
/// code removal.
pub struct RulePropagateCopy;

impl Rule for RulePropagateCopy {
    fn name(&self) -> &'static str {
        "propagatecopy"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RulePropagateCopy)
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
        let mut changes = 0;
        for slot in 0..fd.op(op).num_inputs() {
            let vn = fd.op(op).input(slot);
            let v = fd.varnode(vn);
            if v.is_annotation() {
                continue;
            }
            let Some(def) = v.def() else {
                continue;
            };
            if fd.op(def).code() != OpCode::COPY {
                continue;
            }
            if fd.op(def).has_flag(op_flags::NO_COLLAPSE) {
                continue;
            }
            let src = fd.op(def).input(0);
            if src == vn {
                continue;
            }
            if fd.varnode(src).def() == Some(op) {
                continue; // Never wire an op to read its own output.
            }
            if !propagatable(fd, vn) || !propagatable(fd, src) {
                continue;
            }
            if fd.varnode(vn).has_flag(varnode_flags::INCIDENTAL_COPY)
                || fd.varnode(src).has_flag(varnode_flags::INCIDENTAL_COPY)
            {
                continue;
            }
            if !fd.varnode(src).is_heritage_known() {
                continue;
            }
            fd.op_set_input(op, src, slot);
            changes += 1;
        }
        Ok(changes)
    }
}

/// Collapses an INDIRECT whose guarded op no longer exists or no longer can
/// affect the storage: the value flows through unchanged.
///
/// Indirect creations (values made from nothing by a call) never collapse.
pub struct RuleIndirectCollapse;

impl Rule for RuleIndirectCollapse {
    fn name(&self) -> &'static str {
        "indirectcollapse"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleIndirectCollapse)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INDIRECT]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        if fd.op(op).has_flag(op_flags::INDIRECT_CREATION) {
            return Ok(0);
        }
        let collapse = match fd.indirect_effect_op(op) {
            None => true,
            Some(effect) => fd.op(effect).is_dead(),
        };
        if !collapse {
            return Ok(0);
        }
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_remove_input(op, 1);
        Ok(1)
    }
}

/// Collapses a MULTIEQUAL whose inputs all deliver the same value.
///
/// Inputs equal to the output itself (values carried around a loop) are
/// ignored; if a single distinct value remains, the phi is a COPY of it.
pub struct RuleMultiCollapse;

impl Rule for RuleMultiCollapse {
    fn name(&self) -> &'static str {
        "multicollapse"
    }

    fn group(&self) -> &'static str {
        "analysis"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleMultiCollapse)
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
        if fd.op(op).num_inputs() < 2 {
            // A single-input phi carries a loop-entry value; collapsing it
            // would let readers reach around their own definitions.
            return Ok(0);
        }
        let out = fd.op(op).output().unwrap();
        let mut distinct: Option<VarnodeId> = None;
        for slot in 0..fd.op(op).num_inputs() {
            let vn = fd.op(op).input(slot);
            if vn == out {
                continue;
            }
            match distinct {
                None => distinct = Some(vn),
                Some(prev) if prev == vn => (),
                Some(prev) => {
                    // Two constants with equal value also count as one.
                    let same_const = match (
                        super::const_val(fd, prev),
                        super::const_val(fd, vn),
                    ) {
                        (Some(a), Some(b)) => {
                            a == b && fd.varnode(prev).size() == fd.varnode(vn).size()
                        }
                        _ => false,
                    };
                    if !same_const {
                        return Ok(0);
                    }
                }
            }
        }
        let Some(value) = distinct else {
            return Ok(0);
        };
        if !propagatable(fd, value) {
            return Ok(0);
        }
        fd.op_set_opcode(op, OpCode::COPY);
        fd.op_set_all_input(op, vec![value]);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    #[test]
    fn copy_propagation_rewires_reader() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let src = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let src = fd.set_input_varnode(src).unwrap();
        let cop = fd.new_op(pc, OpCode::COPY);
        fd.op_set_input(cop, src, 0);
        let copied = fd.new_unique_out(4, cop).unwrap();
        let user = fd.new_op(pc, OpCode::INT_2COMP);
        fd.op_set_input(user, copied, 0);
        fd.new_unique_out(4, user).unwrap();

        assert_eq!(RulePropagateCopy.apply_op(user, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(user).input(0), src);
        assert!(fd.varnode(copied).has_no_descend());
    }

    #[test]
    fn copy_propagation_respects_volatile() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let src = fd.new_varnode(4, Address::new(SpaceId::mock_ram(), 0x100));
        let src = fd.set_input_varnode(src).unwrap();
        fd.varnode_mut(src).set_flag(varnode_flags::VOLATILE);
        let cop = fd.new_op(pc, OpCode::COPY);
        fd.op_set_input(cop, src, 0);
        let copied = fd.new_unique_out(4, cop).unwrap();
        let user = fd.new_op(pc, OpCode::INT_2COMP);
        fd.op_set_input(user, copied, 0);
        fd.new_unique_out(4, user).unwrap();

        assert_eq!(RulePropagateCopy.apply_op(user, &mut fd, &arch).unwrap(), 0);
        assert_eq!(fd.op(user).input(0), copied);
    }

    #[test]
    fn multiequal_of_one_value_collapses() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let x = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let x = fd.set_input_varnode(x).unwrap();
        let phi = fd.new_op(pc, OpCode::MULTIEQUAL);
        let out = fd.new_varnode_out(4, Address::new(SpaceId::mock_register(), 0x8), phi);
        let out = out.unwrap();
        fd.op_set_input(phi, x, 0);
        fd.op_set_input(phi, out, 1); // loop-carried self reference
        assert_eq!(RuleMultiCollapse.apply_op(phi, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(phi).code(), OpCode::COPY);
        assert_eq!(fd.op(phi).inputs(), &[x]);
    }
}
