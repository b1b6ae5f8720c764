//! Jump tables and the interface to an external recovery pass.
//!
//! Recovering the address table behind an indirect branch requires emulation
//! machinery that lives outside the core. The core only stores the recovered
//! descriptors and exposes the [`JumpTableRecovery`] hooks so that an
//! external pass can plug in.

use crate::address::Address;
use crate::prelude::*;

use super::super::data_flow::OpId;
use super::FunctionData;

/// A recovered jump table: the switch targets behind one indirect branch.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct JumpTable {
    /// The address of the BRANCHIND op the table belongs to.
    addr: Address,
    /// The possible branch targets.
    targets: Vec<Address>,
    /// The case label for each target, parallel to `targets`.
    labels: Vec<u64>,
}

impl JumpTable {
    /// Returns a new empty jump table anchored at the given address.
    pub fn new(addr: Address) -> JumpTable {
        JumpTable {
            addr,
            targets: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Returns the address of the owning indirect branch.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Returns the possible branch targets.
    pub fn targets(&self) -> &[Address] {
        &self.targets
    }

    /// Returns the case labels, parallel to the targets.
    pub fn labels(&self) -> &[u64] {
        &self.labels
    }

    /// Adds one case to the table.
    pub fn add_case(&mut self, label: u64, target: Address) {
        self.labels.push(label);
        self.targets.push(target);
    }

    /// Returns the number of cases.
    pub fn num_cases(&self) -> usize {
        self.targets.len()
    }
}

/// Hooks for an external jump-table recovery pass.
pub trait JumpTableRecovery {
    /// Requests recovery of the table feeding the indirect branch at the
    /// given address. Returns the recovered table, or `None` if recovery
    /// failed.
    fn install_jump_table(&mut self, fd: &FunctionData, addr: Address) -> Option<JumpTable>;

    /// Returns the already recovered table for the given branch op, if any.
    fn find_jump_table(&self, fd: &FunctionData, branch_op: OpId) -> Option<&JumpTable>;
}

/// The bundled null recovery: never recovers anything.
///
/// Functions analyzed with this recovery keep their BRANCHIND dead ends and
/// receive a warning per indirect branch.
#[derive(Debug, Default)]
pub struct NoJumpTableRecovery;

impl JumpTableRecovery for NoJumpTableRecovery {
    fn install_jump_table(&mut self, _fd: &FunctionData, _addr: Address) -> Option<JumpTable> {
        None
    }

    fn find_jump_table(&self, _fd: &FunctionData, _branch_op: OpId) -> Option<&JumpTable> {
        None
    }
}
