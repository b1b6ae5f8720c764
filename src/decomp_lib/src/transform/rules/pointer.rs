//! Pointer arithmetic reconstruction.

use crate::architecture::Architecture;
use crate::data_flow::{OpCode, OpId};
use crate::datatype::DataType;
use crate::function::FunctionData;
use crate::prelude::*;

use super::super::Rule;
use super::{def_with_code, in_const, propagatable};

/// Rewrites additions on typed pointers as array and field accesses.
///
/// `ptr + index * #elsize` becomes `PTRADD(ptr, index, #elsize)` when the
/// element size matches the pointed-to type; `ptr + #c` becomes
/// `PTRSUB(ptr, #c)` when `#c` is a field offset of the pointed-to
/// composite. The result is re-typed as a pointer to the component.
pub struct RulePtrArith;

impl Rule for RulePtrArith {
    fn name(&self) -> &'static str {
        "ptrarith"
    }

    fn group(&self) -> &'static str {
        "typerecovery"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RulePtrArith)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_ADD]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        let ptr = fd.op(op).input(0);
        let Some(pointee) = fd
            .varnode(ptr)
            .datatype()
            .and_then(|dt| dt.pointee())
            .cloned()
        else {
            return Ok(0);
        };
        if !propagatable(fd, ptr) {
            return Ok(0);
        }
        let ptr_size = fd.varnode(ptr).size();
        let ptr_type = fd.varnode(ptr).datatype().cloned().unwrap();
        let other = fd.op(op).input(1);

        // ptr + index * #elsize
        if let Some(mult) = def_with_code(fd, other, OpCode::INT_MULT) {
            if let Some(elsize) = in_const(fd, mult, 1) {
                if elsize == pointee.size() as u64 && elsize != 0 {
                    let index = fd.op(mult).input(0);
                    if propagatable(fd, index) {
                        let elconst = fd.new_constant(ptr_size, elsize);
                        fd.op_set_opcode(op, OpCode::PTRADD);
                        fd.op_set_all_input(op, vec![ptr, index, elconst]);
                        let out = fd.op(op).output().unwrap();
                        fd.varnode_mut(out).set_datatype(ptr_type);
                        return Ok(1);
                    }
                }
            }
        }

        // ptr + #field_offset
        if let Some(offset) = in_const(fd, op, 1) {
            if pointee.component_at(offset).is_some() && offset != 0 {
                let (component, _) = pointee.component_at(offset).unwrap();
                let component = component.clone();
                let offconst = fd.new_constant(ptr_size, offset);
                fd.op_set_opcode(op, OpCode::PTRSUB);
                fd.op_set_all_input(op, vec![ptr, offconst]);
                let out = fd.op(op).output().unwrap();
                fd.varnode_mut(out)
                    .set_datatype(DataType::pointer(ptr_size, component));
                return Ok(1);
            }
        }
        Ok(0)
    }
}

/// Propagates the pointed-to type of a LOAD address to the loaded value.
pub struct RuleLoadType;

impl Rule for RuleLoadType {
    fn name(&self) -> &'static str {
        "loadtype"
    }

    fn group(&self) -> &'static str {
        "typerecovery"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(RuleLoadType)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::LOAD]
    }

    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        // LOAD inputs: (space annotation, pointer).
        let Some(pointer) = fd.op(op).try_input(1) else {
            return Ok(0);
        };
        let Some(pointee) = fd
            .varnode(pointer)
            .datatype()
            .and_then(|dt| dt.pointee())
            .cloned()
        else {
            return Ok(0);
        };
        let Some(out) = fd.op(op).output() else {
            return Ok(0);
        };
        if fd.varnode(out).size() != pointee.size() {
            return Ok(0);
        }
        if fd.varnode(out).datatype() == Some(&pointee) {
            return Ok(0); // Already typed; stay idempotent.
        }
        if !fd.varnode_mut(out).set_datatype(pointee) {
            return Ok(0); // Type lock forbids the change.
        }
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    #[test]
    fn ptradd_recognition() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();

        // ptr: int32_t*, v1 = INT_ADD(ptr, INT_MULT(i, #4)); v2 = LOAD(v1)
        let ptr = fd.new_varnode(8, Address::new(SpaceId::mock_register(), 0x8));
        let ptr = fd.set_input_varnode(ptr).unwrap();
        fd.varnode_mut(ptr)
            .set_datatype(DataType::pointer(8, DataType::int(4)));
        let index = fd.new_varnode(8, Address::new(SpaceId::mock_register(), 0x10));
        let index = fd.set_input_varnode(index).unwrap();

        let mult = fd.new_op(pc, OpCode::INT_MULT);
        let four = fd.new_constant(8, 4);
        fd.op_set_input(mult, index, 0);
        fd.op_set_input(mult, four, 1);
        let scaled = fd.new_unique_out(8, mult).unwrap();

        let add = fd.new_op(pc, OpCode::INT_ADD);
        fd.op_set_input(add, ptr, 0);
        fd.op_set_input(add, scaled, 1);
        let sum = fd.new_unique_out(8, add).unwrap();

        let load = fd.new_op(pc, OpCode::LOAD);
        let space = fd.new_constant(8, SpaceId::mock_ram().index() as u64);
        fd.op_set_input(load, space, 0);
        fd.op_set_input(load, sum, 1);
        let loaded = fd.new_unique_out(4, load).unwrap();

        assert_eq!(RulePtrArith.apply_op(add, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(add).code(), OpCode::PTRADD);
        assert_eq!(fd.op(add).num_inputs(), 3);
        assert_eq!(fd.op(add).input(0), ptr);
        assert_eq!(fd.op(add).input(1), index);
        assert!(fd.varnode(sum).datatype().unwrap().is_pointer());

        assert_eq!(RuleLoadType.apply_op(load, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.varnode(loaded).datatype(), Some(&DataType::int(4)));
        // Idempotent.
        assert_eq!(RuleLoadType.apply_op(load, &mut fd, &arch).unwrap(), 0);
    }

    #[test]
    fn ptrsub_recognition() {
        let arch = Architecture::mock();
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();

        let composite = std::sync::Arc::new(DataType::Struct {
            name: "point".to_string(),
            fields: vec![
                crate::datatype::StructField {
                    offset: 0,
                    name: "x".to_string(),
                    datatype: DataType::int(4),
                },
                crate::datatype::StructField {
                    offset: 4,
                    name: "y".to_string(),
                    datatype: DataType::int(4),
                },
            ],
            size: 8,
        });
        let ptr = fd.new_varnode(8, Address::new(SpaceId::mock_register(), 0x8));
        let ptr = fd.set_input_varnode(ptr).unwrap();
        fd.varnode_mut(ptr)
            .set_datatype(DataType::pointer(8, composite));

        let add = fd.new_op(pc, OpCode::INT_ADD);
        let offset = fd.new_constant(8, 4);
        fd.op_set_input(add, ptr, 0);
        fd.op_set_input(add, offset, 1);
        fd.new_unique_out(8, add).unwrap();

        assert_eq!(RulePtrArith.apply_op(add, &mut fd, &arch).unwrap(), 1);
        assert_eq!(fd.op(add).code(), OpCode::PTRSUB);
    }
}
