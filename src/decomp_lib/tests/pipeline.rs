//! End-to-end scenarios over the whole decompilation pipeline.

use decomp_lib::address::{Address, AddrSpaceManager, SpaceId, SpaceKind, VarnodeData};
use decomp_lib::architecture::Architecture;
use decomp_lib::data_flow::{op_flags, OpCode, OpId, VarnodeId};
use decomp_lib::database::DynamicHash;
use decomp_lib::database::SymbolKind;
use decomp_lib::datatype::DataType;
use decomp_lib::function::{
    EffectRecord, EffectType, FlowBuilder, FuncProto, FunctionData, ProtoModel, RawInstruction,
    RawPcodeOp,
};
use decomp_lib::serialize::{restore_function, save_function};
use decomp_lib::transform::database::{ActionDatabase, DecompileEngine};
use decomp_lib::transform::{rules, Action, EngineControl, Outcome};

struct Setup {
    arch: Architecture,
    ram: SpaceId,
    register: SpaceId,
    stack: SpaceId,
}

fn setup_env() -> Setup {
    let mut manager = AddrSpaceManager::new();
    let ram = manager
        .add_space("ram", SpaceKind::Ram, 8, 1, false, 0, 0, None)
        .unwrap();
    let register = manager
        .add_space("register", SpaceKind::Register, 4, 1, false, 0, 0, None)
        .unwrap();
    manager
        .add_space("unique", SpaceKind::Unique, 4, 1, false, 0, 0, None)
        .unwrap();
    let stack = manager
        .add_space("stack", SpaceKind::Stack, 8, 1, false, 1, 1, None)
        .unwrap();
    manager
        .add_space("join", SpaceKind::Join, 8, 1, false, 0, 0, None)
        .unwrap();
    manager.set_default_space(ram);
    let mut arch = Architecture::new(manager);
    arch.add_proto_model(ProtoModel::new("default")).unwrap();
    Setup {
        arch,
        ram,
        register,
        stack,
    }
}

fn insn(addr: Address, ops: Vec<RawPcodeOp>) -> RawInstruction {
    RawInstruction {
        addr,
        length: 4,
        ops,
    }
}

fn raw(opcode: OpCode, inputs: Vec<VarnodeData>, output: Option<VarnodeData>) -> RawPcodeOp {
    RawPcodeOp {
        opcode,
        inputs,
        output,
    }
}

fn con(value: u64, size: u32) -> VarnodeData {
    VarnodeData::new(Address::constant(value), size)
}

fn decompile(setup: &mut Setup, fd: &mut FunctionData) {
    setup.arch.start_analysis();
    let db = ActionDatabase::new();
    let mut engine = DecompileEngine::new(&db, "decompile").unwrap();
    assert_eq!(engine.perform(fd, &setup.arch).unwrap(), Outcome::Completed);
}

fn find_return(fd: &FunctionData) -> OpId {
    fd.obank()
        .alive_ids()
        .into_iter()
        .find(|&op| fd.op(op).code() == OpCode::RETURN)
        .expect("function has no RETURN")
}

fn alive_codes(fd: &FunctionData) -> Vec<OpCode> {
    fd.obank()
        .alive_ids()
        .into_iter()
        .map(|op| fd.op(op).code())
        .collect()
}

/// A chain of constant arithmetic collapses into a single constant return.
#[test]
fn constant_fold_chain() {
    let mut setup = setup_env();
    let entry = Address::new(setup.ram, 0x1000);
    let unique = |offset| {
        VarnodeData::new(
            Address::new(
                setup.arch.manager().space_by_name("unique").unwrap().id(),
                offset,
            ),
            4,
        )
    };
    let instructions = vec![insn(
        entry,
        vec![
            raw(OpCode::INT_ADD, vec![con(3, 4), con(4, 4)], Some(unique(0x10))),
            raw(
                OpCode::INT_MULT,
                vec![unique(0x10), con(2, 4)],
                Some(unique(0x20)),
            ),
            raw(OpCode::RETURN, vec![unique(0x20)], None),
        ],
    )];
    let mut fd = FunctionData::new("fold", entry, setup.arch.manager());
    FlowBuilder::new(instructions, FuncProto::default())
        .build(&mut fd)
        .unwrap();
    decompile(&mut setup, &mut fd);

    let ret = find_return(&fd);
    let result = fd.op(ret).input(0);
    assert!(fd.varnode(result).is_constant());
    assert_eq!(fd.varnode(result).constant_value(), 14);
    // The arithmetic itself is gone.
    let codes = alive_codes(&fd);
    assert!(!codes.contains(&OpCode::INT_ADD));
    assert!(!codes.contains(&OpCode::INT_MULT));
}

/// A byte-wide AND of an already byte-wide SUBPIECE is an identity and
/// disappears; the truncation itself stays.
#[test]
fn masked_subpiece_identity() {
    let mut setup = setup_env();
    let entry = Address::new(setup.ram, 0x1000);
    let unique_space = setup.arch.manager().space_by_name("unique").unwrap().id();
    let unique = |offset, size| VarnodeData::new(Address::new(unique_space, offset), size);
    let instructions = vec![insn(
        entry,
        vec![
            raw(
                OpCode::LOAD,
                vec![con(setup.ram.index() as u64, 8), con(0x2000, 8)],
                Some(unique(0x10, 4)),
            ),
            raw(
                OpCode::SUBPIECE,
                vec![unique(0x10, 4), con(0, 4)],
                Some(unique(0x20, 1)),
            ),
            raw(
                OpCode::INT_AND,
                vec![unique(0x20, 1), con(0xff, 1)],
                Some(unique(0x30, 1)),
            ),
            raw(OpCode::RETURN, vec![unique(0x30, 1)], None),
        ],
    )];
    let mut fd = FunctionData::new("mask", entry, setup.arch.manager());
    FlowBuilder::new(instructions, FuncProto::default())
        .build(&mut fd)
        .unwrap();
    decompile(&mut setup, &mut fd);

    let codes = alive_codes(&fd);
    assert!(!codes.contains(&OpCode::INT_AND));
    assert!(codes.contains(&OpCode::SUBPIECE));
    let ret = find_return(&fd);
    let result = fd.op(ret).input(0);
    let def = fd.varnode(result).def().unwrap();
    assert_eq!(fd.op(def).code(), OpCode::SUBPIECE);
}

fn call_scenario(setup: &mut Setup, r0_effect: EffectType) -> (FunctionData, VarnodeId) {
    let entry = Address::new(setup.ram, 0x1000);
    let r0 = VarnodeData::new(Address::new(setup.register, 0x0), 8);
    let r1 = VarnodeData::new(Address::new(setup.register, 0x8), 8);
    let r2 = VarnodeData::new(Address::new(setup.register, 0x10), 8);
    let target = VarnodeData::new(Address::new(setup.ram, 0x8000), 1);

    let mut model = ProtoModel::new("default");
    // Everything except r0 is callee-saved; r0 carries the configured
    // effect.
    model.effects.push(EffectRecord::new(r0, r0_effect));
    model.effects.push(EffectRecord::new(
        VarnodeData::new(Address::new(setup.register, 0x8), 0x100),
        EffectType::Unaffected,
    ));
    let proto = FuncProto::new(model);

    let instructions = vec![
        insn(entry, vec![raw(OpCode::COPY, vec![r0], Some(r1))]),
        insn(
            Address::new(setup.ram, 0x1004),
            vec![raw(OpCode::CALL, vec![target], None)],
        ),
        insn(
            Address::new(setup.ram, 0x1008),
            vec![raw(OpCode::COPY, vec![r0], Some(r2))],
        ),
        insn(
            Address::new(setup.ram, 0x100c),
            vec![raw(OpCode::RETURN, vec![r2], None)],
        ),
    ];
    let mut fd = FunctionData::new("call", entry, setup.arch.manager());
    FlowBuilder::new(instructions, proto).build(&mut fd).unwrap();
    decompile(setup, &mut fd);
    let ret = find_return(&fd);
    let result = fd.op(ret).input(0);
    (fd, result)
}

/// A call that kills r0 forces the post-call read through an
/// indirect-creation; a call that leaves r0 alone lets the original input
/// value flow to the return.
#[test]
fn indirect_around_call() {
    let mut setup = setup_env();
    let (fd, result) = call_scenario(&mut setup, EffectType::KilledByCall);
    let def = fd
        .varnode(result)
        .def()
        .expect("killed r0 must come from an op");
    assert_eq!(fd.op(def).code(), OpCode::INDIRECT);
    assert!(fd.op(def).has_flag(op_flags::INDIRECT_CREATION));

    let mut setup = setup_env();
    let (fd, result) = call_scenario(&mut setup, EffectType::Unaffected);
    let v = fd.varnode(result);
    assert!(v.is_input());
    assert_eq!(v.addr(), Address::new(setup.register, 0x0));
}

/// A sum of a typed pointer and a scaled index becomes PTRADD, and the load
/// through it is re-typed to the element.
#[test]
fn pointer_arith_recognition() {
    let setup = setup_env();
    let entry = Address::new(setup.ram, 0x1000);
    let mut fd = FunctionData::new("ptr", entry, setup.arch.manager());
    let blk = fd.blocks_mut().new_block(entry);
    fd.blocks_mut().set_entry(blk);

    let ptr = fd.new_varnode(8, Address::new(setup.register, 0x8));
    let ptr = fd.set_input_varnode(ptr).unwrap();
    fd.varnode_mut(ptr)
        .set_datatype(DataType::pointer(8, DataType::int(4)));
    let index = fd.new_varnode(8, Address::new(setup.register, 0x10));
    let index = fd.set_input_varnode(index).unwrap();

    let mult = fd.new_op(entry, OpCode::INT_MULT);
    let four = fd.new_constant(8, 4);
    fd.op_set_input(mult, index, 0);
    fd.op_set_input(mult, four, 1);
    let scaled = fd.new_unique_out(8, mult).unwrap();
    fd.op_insert_end(mult, blk);

    let add = fd.new_op(entry, OpCode::INT_ADD);
    fd.op_set_input(add, ptr, 0);
    fd.op_set_input(add, scaled, 1);
    let sum = fd.new_unique_out(8, add).unwrap();
    fd.op_insert_end(add, blk);

    let load = fd.new_op(entry, OpCode::LOAD);
    let space = fd.new_constant(8, setup.ram.index() as u64);
    fd.op_set_input(load, space, 0);
    fd.op_set_input(load, sum, 1);
    let loaded = fd.new_unique_out(4, load).unwrap();
    fd.op_insert_end(load, blk);

    let ret = fd.new_op(entry, OpCode::RETURN);
    fd.op_set_input(ret, loaded, 0);
    fd.op_insert_end(ret, blk);

    // Run only the rule pool over the already-built SSA graph.
    let mut pool = Action::new_pool("oppool", rules::all_rules());
    let ctl = EngineControl::new();
    assert_eq!(
        pool.perform(&mut fd, &setup.arch, &ctl).unwrap(),
        Outcome::Completed
    );

    assert_eq!(fd.op(add).code(), OpCode::PTRADD);
    assert_eq!(fd.op(add).input(1), index);
    assert_eq!(fd.varnode(loaded).datatype(), Some(&DataType::int(4)));
}

fn diamond_function(setup: &Setup) -> FunctionData {
    let entry = Address::new(setup.ram, 0x1000);
    let slot = VarnodeData::new(Address::new(setup.stack, 0x8), 4);
    let cond = VarnodeData::new(Address::new(setup.register, 0x0), 1);
    let instructions = vec![
        insn(
            entry,
            vec![raw(
                OpCode::CBRANCH,
                vec![VarnodeData::new(Address::new(setup.ram, 0x100c), 1), cond],
                None,
            )],
        ),
        insn(
            Address::new(setup.ram, 0x1004),
            vec![raw(OpCode::COPY, vec![con(1, 4)], Some(slot))],
        ),
        insn(
            Address::new(setup.ram, 0x1008),
            vec![raw(
                OpCode::BRANCH,
                vec![VarnodeData::new(Address::new(setup.ram, 0x1010), 1)],
                None,
            )],
        ),
        insn(
            Address::new(setup.ram, 0x100c),
            vec![raw(OpCode::COPY, vec![con(2, 4)], Some(slot))],
        ),
        insn(
            Address::new(setup.ram, 0x1010),
            vec![raw(OpCode::RETURN, vec![slot], None)],
        ),
    ];
    let mut fd = FunctionData::new("diamond", entry, setup.arch.manager());
    FlowBuilder::new(instructions, FuncProto::default())
        .build(&mut fd)
        .unwrap();
    fd
}

/// Two branches writing one stack slot meet in a join block that reads it:
/// SSA construction places exactly one phi with one input per predecessor.
#[test]
fn phi_placement_at_diamond() {
    let mut setup = setup_env();
    let mut fd = diamond_function(&setup);
    decompile(&mut setup, &mut fd);

    let phis: Vec<OpId> = fd
        .obank()
        .alive_ids()
        .into_iter()
        .filter(|&op| fd.op(op).code() == OpCode::MULTIEQUAL)
        .collect();
    assert_eq!(phis.len(), 1);
    let phi = phis[0];
    assert_eq!(fd.op(phi).num_inputs(), 2);
    let out = fd.op(phi).output().unwrap();
    assert_eq!(fd.varnode(out).addr(), Address::new(setup.stack, 0x8));
    assert_eq!(fd.varnode(out).size(), 4);
    // The phi sits first in its block.
    assert_eq!(fd.op(phi).order(), 0);
    // The return value comes from the phi.
    let ret = find_return(&fd);
    let result = fd.op(ret).input(0);
    assert_eq!(fd.varnode(result).def(), Some(phi));
}

/// Serializing a function after SSA construction and restoring it into a
/// fresh context reproduces the graph exactly.
#[test]
fn serialize_roundtrip_after_ssa() {
    let mut setup = setup_env();
    let mut fd = diamond_function(&setup);
    decompile(&mut setup, &mut fd);

    let saved = save_function(&fd);
    let restored = restore_function(&saved, setup.arch.manager()).unwrap();
    // A second round-trip is a fixed point: ids have settled into canonical
    // order, and the tag trees compare equal element for element.
    let saved_once = save_function(&restored);
    let restored_twice = restore_function(&saved_once, setup.arch.manager()).unwrap();
    assert_eq!(saved_once, save_function(&restored_twice));

    // Structure is preserved.
    assert_eq!(restored.blocks().num_blocks(), fd.blocks().num_blocks());
    assert_eq!(restored.obank().num_alive(), fd.obank().num_alive());
    let phi_seqs: Vec<_> = fd
        .obank()
        .alive_ids()
        .into_iter()
        .filter(|&op| fd.op(op).code() == OpCode::MULTIEQUAL)
        .map(|op| fd.op(op).seq())
        .collect();
    let restored_phi_seqs: Vec<_> = restored
        .obank()
        .alive_ids()
        .into_iter()
        .filter(|&op| restored.op(op).code() == OpCode::MULTIEQUAL)
        .map(|op| restored.op(op).seq())
        .collect();
    assert_eq!(phi_seqs, restored_phi_seqs);

    // The persisted form also survives a JSON round trip.
    let json = serde_json::to_string(&saved).unwrap();
    let back: decomp_lib::serialize::Element = serde_json::from_str(&json).unwrap();
    assert_eq!(back, saved);
}

/// A dynamic symbol keyed by an expression hash is rediscovered by
/// recomputing the hash.
#[test]
fn dynamic_symbol_rediscovery() {
    let setup = setup_env();
    let entry = Address::new(setup.ram, 0x1000);
    let mut fd = FunctionData::new("dyn", entry, setup.arch.manager());
    let blk = fd.blocks_mut().new_block(entry);
    fd.blocks_mut().set_entry(blk);

    let base = fd.new_varnode(4, Address::new(setup.register, 0x8));
    let base = fd.set_input_varnode(base).unwrap();
    let add = fd.new_op(entry, OpCode::INT_ADD);
    let seven = fd.new_constant(4, 7);
    fd.op_set_input(add, base, 0);
    fd.op_set_input(add, seven, 1);
    let value = fd.new_unique_out(4, add).unwrap();
    fd.op_insert_end(add, blk);

    let anchor = DynamicHash::anchor(&fd, value).unwrap();
    let hash = DynamicHash::calc_hash(&fd, value);
    let symbol =
        fd.locals_mut()
            .add_symbol("derived", DataType::int(4), SymbolKind::Variable);
    fd.locals_mut().add_dynamic_entry(symbol, anchor, hash, 4);

    // A later pass walks the op tree from the anchor and finds the varnode
    // again, reattaching the symbol.
    let found = DynamicHash::find_varnode(&fd, anchor, hash).unwrap();
    assert_eq!(found, value);
    let (_, entry_ref) = fd.locals().find_dynamic(&anchor, hash).unwrap();
    assert_eq!(entry_ref.symbol(), symbol);
    assert_eq!(fd.locals().symbol(symbol).name(), "derived");
}

/// A function with zero instructions produces an empty context and no
/// errors, and the whole pipeline runs on it without complaint.
#[test]
fn empty_function() {
    let mut setup = setup_env();
    let entry = Address::new(setup.ram, 0x1000);
    let mut fd = FunctionData::new("empty", entry, setup.arch.manager());
    FlowBuilder::new(Vec::new(), FuncProto::default())
        .build(&mut fd)
        .unwrap();
    assert!(fd.blocks().is_empty());
    assert!(fd.vbank().is_empty());
    decompile(&mut setup, &mut fd);
    assert!(fd.warnings().is_empty());
}

/// A single block branching to itself keeps one block with a self edge and
/// gets a phi for the live value flowing around the loop.
#[test]
fn self_loop() {
    let mut setup = setup_env();
    let entry = Address::new(setup.ram, 0x1000);
    let r0 = VarnodeData::new(Address::new(setup.register, 0x0), 4);
    let instructions = vec![insn(
        entry,
        vec![
            raw(OpCode::INT_ADD, vec![r0, con(1, 4)], Some(r0)),
            raw(
                OpCode::BRANCH,
                vec![VarnodeData::new(entry, 1)],
                None,
            ),
        ],
    )];
    let mut fd = FunctionData::new("selfloop", entry, setup.arch.manager());
    FlowBuilder::new(instructions, FuncProto::default())
        .build(&mut fd)
        .unwrap();
    assert_eq!(fd.blocks().num_blocks(), 1);
    let entry_block = fd.blocks().entry().unwrap();
    assert_eq!(fd.blocks().block(entry_block).out_edges(), &[entry_block]);

    decompile(&mut setup, &mut fd);
    let phis: Vec<OpId> = fd
        .obank()
        .alive_ids()
        .into_iter()
        .filter(|&op| fd.op(op).code() == OpCode::MULTIEQUAL)
        .collect();
    assert_eq!(phis.len(), 1);
    assert_eq!(fd.op(phis[0]).num_inputs(), 1);
}
