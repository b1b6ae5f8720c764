//! The catalog of local transformation rules.
//!
//! Rules are registered in the declaration order of their group; the order
//! is part of the observable fixed-point behavior and must stay stable.

use crate::data_flow::{varnode_flags, OpId, VarnodeId};
use crate::function::FunctionData;

use super::Rule;

mod arith;
mod compare;
mod copy;
mod division;
mod extension;
mod idiom;
mod pointer;
mod subpiece;

pub use arith::*;
pub use compare::*;
pub use copy::*;
pub use division::*;
pub use extension::*;
pub use idiom::*;
pub use pointer::*;
pub use subpiece::*;

/// Returns every rule of the catalog, in registration order.
pub fn all_rules() -> Vec<Box<dyn Rule>> {
    vec![
        // Arithmetic.
        Box::new(RuleEarlyRemoval),
        Box::new(RuleTermOrder),
        Box::new(RuleCollapseConstants),
        Box::new(RuleIdentityEl),
        Box::new(RuleTrivialArith),
        Box::new(RuleNegateIdentity),
        Box::new(RuleSub2Add),
        Box::new(RuleAddMultCollapse),
        Box::new(RuleShift2Mult),
        Box::new(RuleTrivialShift),
        Box::new(RuleAndMask),
        Box::new(RuleOrMask),
        // Comparisons.
        Box::new(RuleLessEqual),
        Box::new(RuleEquality),
        Box::new(RuleBxor2NotEqual),
        Box::new(RuleLess2Zero),
        Box::new(RuleBoolNegate),
        // Copy propagation and markers.
        Box::new(RulePropagateCopy),
        Box::new(RuleIndirectCollapse),
        Box::new(RuleMultiCollapse),
        // SUBPIECE / PIECE.
        Box::new(RuleDoubleSub),
        Box::new(RuleSubCancel),
        Box::new(RulePullsubMulti),
        Box::new(RulePiece2Zext),
        Box::new(RuleHumptyDumpty),
        Box::new(RuleSubCommute),
        // Extensions.
        Box::new(RuleZextEliminate),
        Box::new(RuleDoubleZext),
        Box::new(RuleSext2Zext),
        Box::new(RuleSubvarSubpiece),
        // Pointer arithmetic.
        Box::new(RulePtrArith),
        Box::new(RuleLoadType),
        // Division reconstruction.
        Box::new(RuleDivOpt),
        Box::new(RuleModOpt),
        // Idioms.
        Box::new(RuleConditionalMove),
        Box::new(RuleThreeWayCompare),
    ]
}

/// Returns the constant value of a varnode, if it is a plain constant.
pub(crate) fn const_val(fd: &FunctionData, vn: VarnodeId) -> Option<u64> {
    let v = fd.varnode(vn);
    if v.is_constant() && !v.is_annotation() {
        Some(v.constant_value())
    } else {
        None
    }
}

/// Returns the constant value of the input in the given slot.
pub(crate) fn in_const(fd: &FunctionData, op: OpId, slot: usize) -> Option<u64> {
    const_val(fd, fd.op(op).try_input(slot)?)
}

/// Returns true iff a rule may rewire reads of this varnode.
///
/// Folding never crosses volatile or persistent storage, annotation markers,
/// or address-forced values.
pub(crate) fn propagatable(fd: &FunctionData, vn: VarnodeId) -> bool {
    let v = fd.varnode(vn);
    !v.has_flag(varnode_flags::VOLATILE)
        && !v.has_flag(varnode_flags::PERSIST)
        && !v.has_flag(varnode_flags::ADDRFORCE)
        && !v.is_annotation()
}

/// Returns the defining op of a varnode if it has the given op-code.
pub(crate) fn def_with_code(
    fd: &FunctionData,
    vn: VarnodeId,
    code: crate::data_flow::OpCode,
) -> Option<OpId> {
    let def = fd.varnode(vn).def()?;
    if fd.op(def).code() == code {
        Some(def)
    } else {
        None
    }
}

/// Returns true iff changing the size or type of this varnode would violate
/// a lock.
pub(crate) fn is_locked(fd: &FunctionData, vn: VarnodeId) -> bool {
    let v = fd.varnode(vn);
    v.has_flag(varnode_flags::TYPELOCK) || v.has_flag(varnode_flags::NAMELOCK)
}
