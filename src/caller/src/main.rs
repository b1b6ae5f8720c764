//! This crate defines the command line interface for the decompiler core.
//! General documentation about the engine is contained in the
//! [`decomp_lib`] crate.

use anyhow::{Context, Error};
use clap::Parser;

use decomp_lib::address::{AddrSpaceManager, Address, SpaceKind};
use decomp_lib::architecture::Architecture;
use decomp_lib::function::{FlowBuilder, FunctionData, RawInstruction};
use decomp_lib::transform::database::{ActionDatabase, DecompileEngine};
use decomp_lib::transform::Outcome;
use decomp_lib::utils::log::print_all_messages;

use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
/// Decompile a function from lifted p-code
struct CmdlineArgs {
    /// Path to a JSON file holding the lifted instructions of one function.
    #[arg(value_parser = check_file_existence)]
    pcode: PathBuf,

    /// The entry address of the function, e.g. 0x1000.
    #[arg(long, short, value_parser = parse_address_offset)]
    entry: u64,

    /// The root action to run.
    #[arg(long, default_value = "decompile")]
    root: String,

    /// Options applied to the architecture, as key=value pairs.
    #[arg(long, short = 'o')]
    option: Vec<String>,

    /// Print action and rule statistics after the run.
    #[arg(long)]
    statistics: bool,
}

fn check_file_existence(path: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(path);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("{} is not a file", path.display()))
    }
}

fn parse_address_offset(value: &str) -> Result<u64, String> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(trimmed, 16).map_err(|err| err.to_string())
}

/// Builds the standard five-space little endian architecture the lifter
/// assumes.
fn build_architecture() -> Result<Architecture, Error> {
    let mut manager = AddrSpaceManager::new();
    let ram = manager.add_space("ram", SpaceKind::Ram, 8, 1, false, 0, 0, None)?;
    manager.add_space("register", SpaceKind::Register, 4, 1, false, 0, 0, None)?;
    manager.add_space("unique", SpaceKind::Unique, 4, 1, false, 0, 0, None)?;
    manager.add_space("stack", SpaceKind::Stack, 8, 1, false, 1, 1, None)?;
    manager.add_space("join", SpaceKind::Join, 8, 1, false, 0, 0, None)?;
    manager.set_default_space(ram);
    Ok(Architecture::new(manager))
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = CmdlineArgs::parse();

    let mut arch = build_architecture()?;
    for option in args.option.iter() {
        let (key, value) = option
            .split_once('=')
            .context("options must have the form key=value")?;
        arch.set_option(key, value)?;
    }

    let json = std::fs::read_to_string(&args.pcode)
        .context("could not read the p-code input file")?;
    let instructions: Vec<RawInstruction> =
        serde_json::from_str(&json).context("could not parse the p-code input file")?;

    let entry = Address::new(arch.manager().default_space().id(), args.entry);
    let mut fd = FunctionData::new("function", entry, arch.manager());
    let proto = decomp_lib::function::FuncProto::new(arch.default_proto_model());
    FlowBuilder::new(instructions, proto).build(&mut fd)?;

    arch.start_analysis();
    let db = ActionDatabase::new();
    let mut engine = DecompileEngine::new(&db, &args.root)?;
    match engine.perform(&mut fd, &arch)? {
        Outcome::Completed => {}
        Outcome::Break => println!("analysis stopped at a breakpoint"),
        Outcome::Cancelled => println!("analysis was cancelled"),
    }

    println!(
        "function {}: {} blocks, {} alive ops, {} high variables",
        fd.name(),
        fd.blocks().num_blocks(),
        fd.obank().num_alive(),
        fd.highs().len(),
    );
    print_all_messages(fd.warnings());

    if args.statistics {
        for entry in engine.statistics() {
            println!(
                "{:>8} {:>8}  {}{}",
                entry.stats.count_tests,
                entry.stats.count_apply,
                if entry.is_rule { "rule " } else { "" },
                entry.name,
            );
        }
    }
    Ok(())
}
