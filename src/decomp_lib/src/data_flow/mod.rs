//! The SSA data-flow representation: varnodes, p-code ops, and basic blocks.
//!
//! All objects live in arenas owned by the function context and are referred
//! to by plain typed indices. The reverse edges from a value to its readers
//! (the *descend list*) and the forward edge from a value to its defining op
//! are both maintained by the mutation API of
//! [`FunctionData`](crate::function::FunctionData); nothing outside that API
//! may rewire the graph.

use crate::prelude::*;

mod bank;
mod behavior;
mod block;
mod cover;
mod high;
mod op;
mod opcode;
mod varnode;

pub use bank::{OpBank, VarnodeBank};
pub use behavior::{evaluate_binary, evaluate_unary, output_nzmask, FloatFormat, MaskInput};
pub use block::{BasicBlock, BlockGraph, DomTree};
pub use cover::{Cover, CoverBlock};
pub use high::HighVariable;
pub use op::{op_flags, PcodeOp};
pub use opcode::OpCode;
pub use varnode::{varnode_flags, Varnode};

/// Index of a varnode within the varnode bank.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct VarnodeId(pub(crate) u32);

impl VarnodeId {
    /// Returns the index into the bank's arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a p-code op within the op bank.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct OpId(pub(crate) u32);

impl OpId {
    /// Returns the index into the bank's arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a basic block within the block graph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Returns the index into the graph's block list.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a high-level variable within the function context.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct HighId(pub(crate) u32);

impl HighId {
    /// Returns the index into the function's high variable list.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the id for a list index.
    pub fn from_index(index: usize) -> HighId {
        HighId(index as u32)
    }
}
