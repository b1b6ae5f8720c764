//! The leaf actions of the transformation pipeline.

use crate::architecture::Architecture;
use crate::data_flow::{varnode_flags, OpCode, VarnodeId};
use crate::function::{FunctionData, ProtoParameter};
use crate::datatype::DataType;
use crate::prelude::*;

use super::LeafAction;

/// Performs one heritage pass per application until every address space has
/// been incorporated into SSA form.
///
/// Reports a change for each executed pass, so an enclosing repeating group
/// interleaves rule application between the passes.
#[derive(Debug, Default)]
pub struct ActionHeritage;

impl LeafAction for ActionHeritage {
    fn name(&self) -> &'static str {
        "heritage"
    }

    fn clone_leaf(&self) -> Box<dyn LeafAction> {
        Box::new(ActionHeritage)
    }

    fn apply(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<i32, Error> {
        let needed: i32 = arch
            .manager()
            .iter()
            .filter(|spc| spc.is_heritaged())
            .map(|spc| spc.delay() as i32)
            .max()
            .unwrap_or(0)
            + 1;
        if fd.heritage().pass() >= needed {
            return Ok(0);
        }
        fd.heritage_pass(arch)?;
        Ok(1)
    }
}

/// Recomputes the known-zero-bit masks of written varnodes.
///
/// Masks start out fully conservative; this action tightens them from the
/// op behaviors until fixed point so that mask-sensitive rules see precise
/// information.
#[derive(Debug, Default)]
pub struct ActionNzMask;

impl LeafAction for ActionNzMask {
    fn name(&self) -> &'static str {
        "nzmask"
    }

    fn clone_leaf(&self) -> Box<dyn LeafAction> {
        Box::new(ActionNzMask)
    }

    fn apply(&mut self, fd: &mut FunctionData, _arch: &Architecture) -> Result<i32, Error> {
        loop {
            let mut pass_changes = 0;
            for op in fd.obank().alive_ids() {
                let o = fd.op(op);
                let Some(out) = o.output() else {
                    continue;
                };
                let code = o.code();
                let inputs: Vec<crate::data_flow::MaskInput> = o
                    .inputs()
                    .iter()
                    .map(|&vn| {
                        let v = fd.varnode(vn);
                        crate::data_flow::MaskInput {
                            nzmask: v.nzmask(),
                            size: v.size(),
                            constant: if v.is_constant() && !v.is_annotation() {
                                Some(v.constant_value())
                            } else {
                                None
                            },
                        }
                    })
                    .collect();
                let out_size = fd.varnode(out).size();
                let mask = crate::data_flow::output_nzmask(code, out_size, &inputs);
                let old = fd.varnode(out).nzmask();
                if mask & old != old {
                    fd.varnode_mut(out).set_nzmask(mask & old);
                    pass_changes += 1;
                }
            }
            if pass_changes == 0 {
                // Tightening masks is not a graph change; the action only
                // feeds later rules and never reports one.
                return Ok(0);
            }
        }
    }
}

/// Removes alive ops whose outputs are never read.
///
/// Ops with side effects (calls, stores, control flow) survive, as do
/// outputs that are address-forced or must stay live. Removal honors the
/// per-space dead-code delay of the heritage engine.
#[derive(Debug, Default)]
pub struct ActionDeadCode;

impl LeafAction for ActionDeadCode {
    fn name(&self) -> &'static str {
        "deadcode"
    }

    fn clone_leaf(&self) -> Box<dyn LeafAction> {
        Box::new(ActionDeadCode)
    }

    fn apply(&mut self, fd: &mut FunctionData, _arch: &Architecture) -> Result<i32, Error> {
        let mut total = 0;
        loop {
            let mut changes = 0;
            for op in fd.obank().alive_ids().into_iter().rev() {
                if !fd.obank().is_live(op) || fd.op(op).is_dead() {
                    continue;
                }
                let o = fd.op(op);
                let code = o.code();
                if code.is_call()
                    || code.is_branch()
                    || code.is_flow_break()
                    || code == OpCode::STORE
                {
                    continue;
                }
                if o.has_flag(crate::data_flow::op_flags::NO_COLLAPSE) {
                    continue;
                }
                let Some(out) = o.output() else {
                    continue;
                };
                let outvn = fd.varnode(out);
                if !outvn.has_no_descend() {
                    continue;
                }
                if outvn.has_flag(varnode_flags::ADDRFORCE)
                    || outvn.has_flag(varnode_flags::AUTOLIVE)
                {
                    continue;
                }
                let space = outvn.addr().space();
                if !fd.heritage_mut().dead_removal_allowed_seen(space) {
                    continue;
                }
                let inputs: Vec<VarnodeId> = fd.op(op).inputs().to_vec();
                let freed = fd.op_destroy(op)?;
                if let Some(freed) = freed {
                    fd.delete_varnode(freed)?;
                }
                for vn in inputs {
                    if !fd.vbank().is_live(vn) {
                        continue;
                    }
                    let v = fd.varnode(vn);
                    if v.has_no_descend() && !v.is_written() && !v.is_input() {
                        fd.delete_varnode(vn)?;
                    }
                }
                changes += 1;
            }
            total += changes;
            if changes == 0 {
                return Ok(total);
            }
        }
    }
}

/// Aggregates varnodes into high-level variables and links symbols.
#[derive(Debug, Default)]
pub struct ActionMerge;

impl LeafAction for ActionMerge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn clone_leaf(&self) -> Box<dyn LeafAction> {
        Box::new(ActionMerge)
    }

    fn apply(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<i32, Error> {
        crate::merge::Merger::new().run(fd, arch)?;
        Ok(0)
    }
}

/// Recovers the input parameters and return storage of the function from the
/// trials registered during heritage.
#[derive(Debug, Default)]
pub struct ActionParamRecovery;

impl LeafAction for ActionParamRecovery {
    fn name(&self) -> &'static str {
        "paramrecovery"
    }

    fn clone_leaf(&self) -> Box<dyn LeafAction> {
        Box::new(ActionParamRecovery)
    }

    fn apply(&mut self, fd: &mut FunctionData, _arch: &Architecture) -> Result<i32, Error> {
        if fd.proto().input_locked {
            return Ok(0);
        }
        // A function input varnode that is actually read is a recovered
        // parameter, if the prototype model allows storage there.
        let mut params: Vec<ProtoParameter> = Vec::new();
        for vn in fd.vbank().ids() {
            let v = fd.varnode(vn);
            if !v.is_input() || v.has_no_descend() {
                continue;
            }
            let (addr, size) = (v.addr(), v.size());
            if !fd.proto().possible_input_param(&addr, size) {
                continue;
            }
            let storage = crate::address::VarnodeData::new(addr, size);
            if params.iter().any(|p| p.storage == storage) {
                continue;
            }
            params.push(ProtoParameter {
                name: None,
                storage,
                datatype: DataType::unknown(size),
            });
        }
        // Allocation order of the model decides the parameter order.
        params.sort_by_key(|p| {
            fd.proto()
                .model
                .input_ranges
                .iter()
                .position(|range| {
                    p.storage
                        .addr
                        .overlap(0, &range.addr, range.size as u64)
                        .is_some()
                })
                .unwrap_or(usize::MAX)
        });
        let changes = if params.is_empty() { 0 } else { 1 };
        fd.proto_mut().inputs = params;

        // The return storage comes from confirmed output trials.
        if !fd.proto().output_locked {
            let confirmed = fd.active_output().and_then(|active| {
                active
                    .trials()
                    .iter()
                    .find(|trial| trial.confirmed)
                    .map(|trial| trial.storage)
            });
            if let Some(storage) = confirmed {
                fd.proto_mut().output = Some(ProtoParameter {
                    name: None,
                    storage,
                    datatype: DataType::unknown(storage.size),
                });
            }
        }
        Ok(changes)
    }
}
