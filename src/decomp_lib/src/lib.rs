//! The core decompilation engine: transformation of lifted p-code into a
//! structured, source-like program representation.
//!
//! The pipeline, from the bottom up:
//!
//! - [`address`] models address spaces, addresses and ranges.
//! - [`database`] is the scoped symbol database with its spatial index.
//! - [`data_flow`] holds the SSA representation: varnodes, p-code ops, the
//!   basic block graph, and the per-opcode behavior tables.
//! - [`function`] ties one function's state together and assembles raw
//!   p-code into basic blocks.
//! - [`ssa`] links the data-flow into Static Single Assignment form.
//! - [`transform`] is the rule/action engine rewriting the graph to fixed
//!   point.
//! - [`merge`] aggregates varnodes into high-level variables and binds them
//!   to symbols.
//! - [`serialize`] persists function state as a tag tree.
//!
//! Instruction decoding, control-flow structuring and target-language
//! printing live outside this crate; they consume the transformed function
//! state read-only.

pub mod address;
pub mod architecture;
pub mod data_flow;
pub mod database;
pub mod datatype;
pub mod function;
pub mod merge;
pub mod options;
pub mod serialize;
pub mod ssa;
pub mod transform;
pub mod utils;

mod prelude {
    //! Shared imports of the crate.
    pub use serde::{Deserialize, Serialize};

    pub use anyhow::{anyhow, bail, Error};
    #[allow(unused_imports)]
    pub use anyhow::Context as _;
}
