//! The registry of root actions and the engine driver.

use crate::architecture::Architecture;
use crate::function::{function_flags, FunctionData};
use crate::prelude::*;

use std::collections::{BTreeMap, BTreeSet};

use super::actions::{
    ActionDeadCode, ActionHeritage, ActionMerge, ActionNzMask, ActionParamRecovery,
};
use super::{action_flags, Action, EngineControl, Outcome, StatisticsEntry};

/// The set of group names defining one root action.
#[derive(Debug, Clone, Default)]
pub struct ActionGroupList {
    list: BTreeSet<String>,
}

impl ActionGroupList {
    /// Returns a group list over the given names.
    pub fn new<'a>(groups: impl IntoIterator<Item = &'a str>) -> ActionGroupList {
        ActionGroupList {
            list: groups.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Returns true iff the list contains the given group.
    pub fn contains(&self, group: &str) -> bool {
        self.list.contains(group)
    }

    /// Adds a group to the list.
    pub fn add(&mut self, group: &str) {
        self.list.insert(group.to_string());
    }

    /// Removes a group from the list.
    pub fn remove(&mut self, group: &str) {
        self.list.remove(group);
    }
}

/// Builds the universal action containing every registered action and rule.
///
/// Root actions are derived from this tree by filtering on group names.
pub fn build_universal() -> Action {
    let fullloop = Action::new_group(
        "fullloop",
        action_flags::REPEAT_APPLY,
        vec![
            Action::new_leaf("base", 0, Box::new(ActionHeritage)),
            Action::new_leaf("base", 0, Box::new(ActionNzMask)),
            Action::new_pool("oppool", super::rules::all_rules()),
            Action::new_leaf("deadcode", 0, Box::new(ActionDeadCode)),
        ],
    );
    Action::new_restart_group(
        "universal",
        0,
        5,
        vec![
            fullloop,
            Action::new_leaf(
                "protorecovery",
                action_flags::ONCE_PER_FUNC,
                Box::new(ActionParamRecovery),
            ),
            Action::new_leaf("merge", action_flags::ONCE_PER_FUNC, Box::new(ActionMerge)),
        ],
    )
}

/// The process-wide database of root actions.
///
/// The universal action is registered once; root actions (like "decompile")
/// are derived from it by a group list and cloned per engine instance.
pub struct ActionDatabase {
    universal: Action,
    group_map: BTreeMap<String, ActionGroupList>,
    current: String,
}

impl ActionDatabase {
    /// Returns a database over the default universal action, with the
    /// standard root actions registered.
    pub fn new() -> ActionDatabase {
        let mut db = ActionDatabase {
            universal: build_universal(),
            group_map: BTreeMap::new(),
            current: "decompile".to_string(),
        };
        db.set_group(
            "decompile",
            &[
                "base",
                "analysis",
                "typerecovery",
                "deadcode",
                "protorecovery",
                "merge",
            ],
        );
        db.set_group(
            "paramid",
            &["base", "analysis", "deadcode", "protorecovery"],
        );
        db
    }

    /// Replaces the universal action.
    pub fn register_universal(&mut self, universal: Action) {
        self.universal = universal;
    }

    /// Establishes (or replaces) the group list of a root action.
    pub fn set_group(&mut self, name: &str, groups: &[&str]) {
        self.group_map
            .insert(name.to_string(), ActionGroupList::new(groups.iter().copied()));
    }

    /// Returns the group list of a root action.
    pub fn group(&self, name: &str) -> Option<&ActionGroupList> {
        self.group_map.get(name)
    }

    /// Copies the group list of one root action under a new name.
    pub fn clone_group(&mut self, old: &str, new: &str) -> Result<(), Error> {
        let list = self
            .group_map
            .get(old)
            .ok_or_else(|| anyhow!("unknown root action: {}", old))?
            .clone();
        self.group_map.insert(new.to_string(), list);
        Ok(())
    }

    /// Adds a group to a root action's list. Returns false iff already
    /// present.
    pub fn add_to_group(&mut self, name: &str, group: &str) -> bool {
        let Some(list) = self.group_map.get_mut(name) else {
            return false;
        };
        if list.contains(group) {
            return false;
        }
        list.add(group);
        true
    }

    /// Removes a group from a root action's list. Returns false iff absent.
    pub fn remove_from_group(&mut self, name: &str, group: &str) -> bool {
        let Some(list) = self.group_map.get_mut(name) else {
            return false;
        };
        if !list.contains(group) {
            return false;
        }
        list.remove(group);
        true
    }

    /// Marks the current root action.
    pub fn set_current(&mut self, name: &str) -> Result<(), Error> {
        if !self.group_map.contains_key(name) {
            bail!("unknown root action: {}", name);
        }
        self.current = name.to_string();
        Ok(())
    }

    /// Returns the name of the current root action.
    pub fn current_name(&self) -> &str {
        &self.current
    }

    /// Derives a fresh instance of the named root action by cloning the
    /// universal action filtered through its group list.
    pub fn derive_root(&self, name: &str) -> Result<Action, Error> {
        let list = self
            .group_map
            .get(name)
            .ok_or_else(|| anyhow!("unknown root action: {}", name))?;
        self.universal
            .clone_filtered(list)
            .ok_or_else(|| anyhow!("root action {} selects no actions", name))
    }
}

impl Default for ActionDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// One engine instance: a root action plus its control state.
///
/// An engine is single-threaded; decompiling functions concurrently requires
/// one engine per thread over a shared, read-only architecture.
pub struct DecompileEngine {
    root: Action,
    ctl: EngineControl,
}

impl DecompileEngine {
    /// Returns an engine running the named root action of the database.
    pub fn new(db: &ActionDatabase, root_name: &str) -> Result<DecompileEngine, Error> {
        Ok(DecompileEngine {
            root: db.derive_root(root_name)?,
            ctl: EngineControl::new(),
        })
    }

    /// Returns the control handle for cancellation.
    pub fn control(&self) -> EngineControl {
        self.ctl.clone()
    }

    /// Runs (or resumes) the root action on the function.
    ///
    /// On a fatal structural error the function is marked with
    /// `BADDATA_PRESENT` and should be abandoned; partial changes stay
    /// committed.
    pub fn perform(
        &mut self,
        fd: &mut FunctionData,
        arch: &Architecture,
    ) -> Result<Outcome, Error> {
        if !fd.has_flag(function_flags::PROCESSING_STARTED) {
            log::debug!("starting decompilation of function {}", fd.name());
            fd.set_function_flag(function_flags::PROCESSING_STARTED);
        }
        match self.root.perform(fd, arch, &self.ctl) {
            Ok(Outcome::Completed) => {
                log::debug!(
                    "finished function {}: {} alive ops, {} warnings",
                    fd.name(),
                    fd.obank().num_alive(),
                    fd.warnings().len()
                );
                fd.set_function_flag(function_flags::PROCESSING_COMPLETE);
                Ok(Outcome::Completed)
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                log::warn!("abandoning function {}: {}", fd.name(), err);
                fd.set_function_flag(function_flags::BADDATA_PRESENT);
                Err(err)
            }
        }
    }

    /// Clears per-function state for a fresh run.
    pub fn reset(&mut self, fd: &FunctionData) {
        self.root.reset(fd);
    }

    /// Sets a breakpoint on the named action or rule.
    pub fn set_breakpoint(&mut self, name: &str, break_flags: u32) -> bool {
        self.root.set_breakpoint(name, break_flags)
    }

    /// Enables or disables the named rule.
    pub fn toggle_rule(&mut self, name: &str, disable: bool) -> bool {
        self.root.toggle_rule(name, disable)
    }

    /// Returns the statistics of every action and rule of the root.
    pub fn statistics(&self) -> Vec<StatisticsEntry> {
        let mut report = Vec::new();
        self.root.collect_statistics(&mut report);
        report
    }
}
