use super::database::{ActionDatabase, DecompileEngine};
use super::*;

use anyhow::Error;
use crate::address::{Address, AddrSpaceManager, SpaceId};
use crate::architecture::Architecture;
use crate::data_flow::OpCode;
use crate::function::FunctionData;

/// A rule that rewrites the first INT_ADD it sees into INT_OR, once.
struct MockRule;

impl Rule for MockRule {
    fn name(&self) -> &'static str {
        "mockrule"
    }

    fn group(&self) -> &'static str {
        "mockgroup"
    }

    fn clone_rule(&self) -> Box<dyn Rule> {
        Box::new(MockRule)
    }

    fn op_list(&self) -> Vec<OpCode> {
        vec![OpCode::INT_ADD]
    }

    fn apply_op(
        &mut self,
        op: crate::data_flow::OpId,
        fd: &mut FunctionData,
        _arch: &Architecture,
    ) -> Result<i32, Error> {
        fd.op_set_opcode(op, OpCode::INT_OR);
        Ok(1)
    }
}

fn mock_function(manager: &AddrSpaceManager) -> FunctionData {
    let mut fd = FunctionData::mock(manager);
    let pc = fd.entry();
    let blk = fd.blocks_mut().new_block(pc);
    fd.blocks_mut().set_entry(blk);
    let op = fd.new_op(pc, OpCode::INT_ADD);
    let a = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
    let a = fd.set_input_varnode(a).unwrap();
    let b = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0xc));
    let b = fd.set_input_varnode(b).unwrap();
    fd.op_set_input(op, a, 0);
    fd.op_set_input(op, b, 1);
    fd.new_unique_out(4, op).unwrap();
    fd.op_insert_end(op, blk);
    fd
}

fn snapshot(fd: &FunctionData) -> Vec<(OpCode, usize)> {
    fd.obank()
        .alive_ids()
        .into_iter()
        .map(|op| (fd.op(op).code(), fd.op(op).num_inputs()))
        .collect()
}

#[test]
fn empty_pool_is_identity() {
    let manager = AddrSpaceManager::mock();
    let arch = Architecture::mock();
    let mut fd = mock_function(&manager);
    let before = snapshot(&fd);
    let mut pool = Action::new_pool("emptypool", Vec::new());
    let ctl = EngineControl::new();
    assert_eq!(pool.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Completed);
    assert_eq!(pool.count(), 0);
    assert_eq!(snapshot(&fd), before);
}

#[test]
fn pool_reaches_fixed_point_and_is_idempotent() {
    let manager = AddrSpaceManager::mock();
    let arch = Architecture::mock();
    let mut fd = mock_function(&manager);
    let mut pool = Action::new_pool("mockpool", vec![Box::new(MockRule)]);
    let ctl = EngineControl::new();
    assert_eq!(pool.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Completed);
    assert_eq!(pool.count(), 1);
    let after = snapshot(&fd);
    // A second run after "no changes" makes no changes.
    pool.reset(&fd);
    assert_eq!(pool.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Completed);
    assert_eq!(pool.count(), 0);
    assert_eq!(snapshot(&fd), after);
}

#[test]
fn rule_breakpoint_suspends_and_resumes() {
    let manager = AddrSpaceManager::mock();
    let arch = Architecture::mock();
    let mut fd = mock_function(&manager);
    let pool = Action::new_pool("mockpool", vec![Box::new(MockRule)]);
    let mut group = Action::new_group("root", 0, vec![pool]);
    group.set_breakpoint("mockrule", break_flags::BREAK_ACTION);
    let ctl = EngineControl::new();
    assert_eq!(group.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Break);
    // The change before the break stays committed.
    assert_eq!(snapshot(&fd)[0].0, OpCode::INT_OR);
    // Resuming completes the run.
    assert_eq!(group.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Completed);
}

#[test]
fn cancellation_unwinds_cleanly() {
    let manager = AddrSpaceManager::mock();
    let arch = Architecture::mock();
    let mut fd = mock_function(&manager);
    let pool = Action::new_pool("mockpool", vec![Box::new(MockRule)]);
    let mut group = Action::new_group("root", 0, vec![pool]);
    let ctl = EngineControl::new();
    ctl.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(group.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Cancelled);
    // Nothing ran; the graph is consistent and untouched.
    assert_eq!(snapshot(&fd)[0].0, OpCode::INT_ADD);
    // Clearing the flag and re-performing resumes normally.
    ctl.cancel_flag().store(false, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(group.perform(&mut fd, &arch, &ctl).unwrap(), Outcome::Completed);
    assert_eq!(snapshot(&fd)[0].0, OpCode::INT_OR);
}

#[test]
fn statistics_count_tests_and_applies() {
    let manager = AddrSpaceManager::mock();
    let arch = Architecture::mock();
    let mut fd = mock_function(&manager);
    let mut pool = Action::new_pool("mockpool", vec![Box::new(MockRule)]);
    let ctl = EngineControl::new();
    pool.perform(&mut fd, &arch, &ctl).unwrap();
    let mut report = Vec::new();
    pool.collect_statistics(&mut report);
    let rule_entry = report.iter().find(|entry| entry.is_rule).unwrap();
    assert_eq!(rule_entry.name, "mockrule");
    assert_eq!(rule_entry.stats.count_apply, 1);
    assert!(rule_entry.stats.count_tests >= 1);
}

#[test]
fn root_action_derivation_filters_groups() {
    let mut db = ActionDatabase::new();
    db.set_group("mockroot", &["mockgroup"]);
    // The standard universal has no "mockgroup" rules, so the pool of the
    // derived root is empty but the derivation of standard roots works.
    assert!(db.derive_root("decompile").is_ok());
    assert!(db.derive_root("paramid").is_ok());
    assert!(db.derive_root("nosuchroot").is_err());
    db.set_current("paramid").unwrap();
    assert_eq!(db.current_name(), "paramid");
    assert!(db.set_current("nosuchroot").is_err());
}

#[test]
fn engine_runs_decompile_root_on_trivial_function() {
    let manager = AddrSpaceManager::mock();
    let mut arch = Architecture::new(AddrSpaceManager::mock());
    arch.start_analysis();
    let db = ActionDatabase::new();
    let mut engine = DecompileEngine::new(&db, "decompile").unwrap();
    let mut fd = mock_function(&manager);
    let outcome = engine.perform(&mut fd, &arch).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert!(fd.has_flag(crate::function::function_flags::PROCESSING_COMPLETE));
}
