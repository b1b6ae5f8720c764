//! The transformation engine: actions, rules, and their scheduling.
//!
//! A [`Rule`] is a named local rewrite that fires on single p-code ops. An
//! [`Action`] is a coarse transformation step; actions form a tree of
//! groups, rule pools and leaves that is built once at startup, registered
//! in the [`ActionDatabase`], and cloned per active *root action*. Cloned
//! instances carry their own statistics and breakpoint state; the rule
//! definitions themselves are stateless across functions.
//!
//! Scheduling is single-threaded and cooperative: exactly one action of one
//! function executes at a time, suspension happens only at breakpoints, and
//! a cancellation flag is polled at every action boundary.

use crate::architecture::Architecture;
use crate::data_flow::{OpCode, OpId};
use crate::function::FunctionData;
use crate::prelude::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod actions;
pub mod database;
pub mod rules;

pub use database::{ActionDatabase, ActionGroupList};

/// Behavior properties of an [`Action`].
pub mod action_flags {
    /// Re-apply the action until a pass makes no change.
    pub const REPEAT_APPLY: u32 = 0x4;
    /// Apply the action at most once per function.
    pub const ONCE_PER_FUNC: u32 = 0x8;
    /// Make at most one change per function.
    pub const ONE_ACT_PER_FUNC: u32 = 0x10;
    /// Issue a warning when the action changes anything.
    pub const WARNINGS_ON: u32 = 0x40;
    /// A warning has already been issued.
    pub const WARNINGS_GIVEN: u32 = 0x80;
}

/// Breakpoint properties of an [`Action`] or [`Rule`].
pub mod break_flags {
    /// Break before the action starts.
    pub const BREAK_START: u32 = 0x1;
    /// One-shot break before the action starts.
    pub const TMPBREAK_START: u32 = 0x2;
    /// Break after the action made a change.
    pub const BREAK_ACTION: u32 = 0x4;
}

/// Invocation counters of an action or rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    /// Number of apply() invocations.
    pub count_tests: u32,
    /// Number of apply() invocations that changed the graph.
    pub count_apply: u32,
}

/// One entry of a statistics report.
#[derive(Debug, Clone)]
pub struct StatisticsEntry {
    /// The name of the action or rule.
    pub name: String,
    /// Whether the entry describes a rule.
    pub is_rule: bool,
    /// The counters.
    pub stats: Statistics,
}

/// The result of performing an action.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Outcome {
    /// The action ran to completion.
    Completed,
    /// A breakpoint was hit; the next perform call resumes.
    Break,
    /// The cancellation flag was observed; the function context is left in
    /// a consistent but partially transformed state.
    Cancelled,
}

/// Shared control state of one engine run.
#[derive(Clone, Default)]
pub struct EngineControl {
    cancel: Arc<AtomicBool>,
}

impl EngineControl {
    /// Returns a new control handle with the cancellation flag cleared.
    pub fn new() -> EngineControl {
        EngineControl::default()
    }

    /// Returns the flag used to request cancellation from another thread.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Returns true iff cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// A single transformation on a p-code op.
///
/// Rules are stateless across functions except for state cleared by
/// [`reset`](Rule::reset). A rule fires by mutating the graph through the
/// function context and returning a positive change count.
pub trait Rule {
    /// Returns the name of the rule.
    fn name(&self) -> &'static str;

    /// Returns the group the rule belongs to.
    fn group(&self) -> &'static str;

    /// Returns a fresh boxed copy of the rule.
    fn clone_rule(&self) -> Box<dyn Rule>;

    /// Returns the op-codes the rule can fire on. An empty list means every
    /// op-code.
    fn op_list(&self) -> Vec<OpCode>;

    /// Attempts to apply the rule at the given op.
    ///
    /// Returns the number of changes made (zero for no match). Structural
    /// errors propagate as fatal.
    fn apply_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        arch: &Architecture,
    ) -> Result<i32, Error>;

    /// Clears per-function state.
    fn reset(&mut self, _fd: &FunctionData) {}
}

/// A leaf transformation step with its own apply semantics.
pub trait LeafAction {
    /// Returns the name of the action.
    fn name(&self) -> &'static str;

    /// Returns a fresh boxed copy of the action.
    fn clone_leaf(&self) -> Box<dyn LeafAction>;

    /// Makes a single attempt to apply the action to the function.
    ///
    /// Returns the number of changes made.
    fn apply(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<i32, Error>;

    /// Clears per-function state.
    fn reset(&mut self, _fd: &FunctionData) {}
}

/// A rule together with its pool-local toggles and counters.
struct RuleSlot {
    rule: Box<dyn Rule>,
    disabled: bool,
    breakpoint: u32,
    warnings_on: bool,
    warnings_given: bool,
    stats: Statistics,
}

impl RuleSlot {
    fn new(rule: Box<dyn Rule>) -> RuleSlot {
        RuleSlot {
            rule,
            disabled: false,
            breakpoint: 0,
            warnings_on: false,
            warnings_given: false,
            stats: Statistics::default(),
        }
    }
}

/// The kind-specific part of an [`Action`].
enum ActionKind {
    /// An action with its own apply semantics.
    Leaf(Box<dyn LeafAction>),
    /// An ordered list of child actions applied in sequence.
    Group(Vec<Action>),
    /// A group that observes the restart-pending flag of the function and
    /// reruns itself up to a maximum number of restarts.
    RestartGroup {
        children: Vec<Action>,
        max_restarts: i32,
        cur_restart: i32,
    },
    /// A set of rules given the opportunity to apply to every alive op.
    Pool(Vec<RuleSlot>),
}

/// A node of the action tree.
pub struct Action {
    name: String,
    group: String,
    flags: u32,
    breakpoint: u32,
    stats: Statistics,
    /// Changes made in the current function, folded upward and reset by
    /// the enclosing group at every pass boundary.
    count: i32,
    /// Changes made in the current function, never reset by the parent.
    total_count: i32,
    /// The action has fully completed once for the current function.
    done_once: bool,
    /// Resume position for groups interrupted by a breakpoint.
    resume_child: Option<usize>,
    /// A start breakpoint has fired and must not re-fire on resume.
    start_break_hit: bool,
    kind: ActionKind,
}

impl Action {
    /// Returns a new leaf action node.
    pub fn new_leaf(group: &str, flags: u32, leaf: Box<dyn LeafAction>) -> Action {
        Action {
            name: leaf.name().to_string(),
            group: group.to_string(),
            flags,
            breakpoint: 0,
            stats: Statistics::default(),
            count: 0,
            total_count: 0,
            done_once: false,
            resume_child: None,
            start_break_hit: false,
            kind: ActionKind::Leaf(leaf),
        }
    }

    /// Returns a new group node.
    pub fn new_group(name: &str, flags: u32, children: Vec<Action>) -> Action {
        Action {
            name: name.to_string(),
            group: String::new(),
            flags,
            breakpoint: 0,
            stats: Statistics::default(),
            count: 0,
            total_count: 0,
            done_once: false,
            resume_child: None,
            start_break_hit: false,
            kind: ActionKind::Group(children),
        }
    }

    /// Returns a new restart-group node.
    pub fn new_restart_group(
        name: &str,
        flags: u32,
        max_restarts: i32,
        children: Vec<Action>,
    ) -> Action {
        Action {
            name: name.to_string(),
            group: String::new(),
            flags,
            breakpoint: 0,
            stats: Statistics::default(),
            count: 0,
            total_count: 0,
            done_once: false,
            resume_child: None,
            start_break_hit: false,
            kind: ActionKind::RestartGroup {
                children,
                max_restarts,
                cur_restart: 0,
            },
        }
    }

    /// Returns a new rule pool node. Pools always repeat until fixed point.
    pub fn new_pool(name: &str, rules: Vec<Box<dyn Rule>>) -> Action {
        Action {
            name: name.to_string(),
            group: String::new(),
            flags: action_flags::REPEAT_APPLY,
            breakpoint: 0,
            stats: Statistics::default(),
            count: 0,
            total_count: 0,
            done_once: false,
            resume_child: None,
            start_break_hit: false,
            kind: ActionKind::Pool(rules.into_iter().map(RuleSlot::new).collect()),
        }
    }

    /// Returns the name of the action.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of changes made in the current function.
    pub fn count(&self) -> i32 {
        self.count
    }

    /// Clones the action, keeping only leaves and rules whose group is in
    /// the list. Returns `None` if nothing survives.
    pub fn clone_filtered(&self, grouplist: &ActionGroupList) -> Option<Action> {
        let kind = match &self.kind {
            ActionKind::Leaf(leaf) => {
                if !grouplist.contains(&self.group) {
                    return None;
                }
                ActionKind::Leaf(leaf.clone_leaf())
            }
            ActionKind::Group(children) => {
                let filtered: Vec<Action> = children
                    .iter()
                    .filter_map(|child| child.clone_filtered(grouplist))
                    .collect();
                if filtered.is_empty() {
                    return None;
                }
                ActionKind::Group(filtered)
            }
            ActionKind::RestartGroup {
                children,
                max_restarts,
                ..
            } => {
                let filtered: Vec<Action> = children
                    .iter()
                    .filter_map(|child| child.clone_filtered(grouplist))
                    .collect();
                if filtered.is_empty() {
                    return None;
                }
                ActionKind::RestartGroup {
                    children: filtered,
                    max_restarts: *max_restarts,
                    cur_restart: 0,
                }
            }
            ActionKind::Pool(slots) => {
                let filtered: Vec<RuleSlot> = slots
                    .iter()
                    .filter(|slot| grouplist.contains(slot.rule.group()))
                    .map(|slot| RuleSlot::new(slot.rule.clone_rule()))
                    .collect();
                // An empty pool is kept: applying it is the identity.
                ActionKind::Pool(filtered)
            }
        };
        Some(Action {
            name: self.name.clone(),
            group: self.group.clone(),
            flags: self.flags,
            breakpoint: 0,
            stats: Statistics::default(),
            count: 0,
            total_count: 0,
            done_once: false,
            resume_child: None,
            start_break_hit: false,
            kind,
        })
    }

    /// Clears per-function state, recursively.
    pub fn reset(&mut self, fd: &FunctionData) {
        self.count = 0;
        self.total_count = 0;
        self.done_once = false;
        self.resume_child = None;
        self.start_break_hit = false;
        match &mut self.kind {
            ActionKind::Leaf(leaf) => leaf.reset(fd),
            ActionKind::Group(children) => {
                for child in children.iter_mut() {
                    child.reset(fd);
                }
            }
            ActionKind::RestartGroup {
                children,
                cur_restart,
                ..
            } => {
                *cur_restart = 0;
                for child in children.iter_mut() {
                    child.reset(fd);
                }
            }
            ActionKind::Pool(slots) => {
                for slot in slots.iter_mut() {
                    slot.rule.reset(fd);
                }
            }
        }
    }

    /// Clears the statistics counters, recursively.
    pub fn reset_stats(&mut self) {
        self.stats = Statistics::default();
        match &mut self.kind {
            ActionKind::Leaf(_) => (),
            ActionKind::Group(children)
            | ActionKind::RestartGroup { children, .. } => {
                for child in children.iter_mut() {
                    child.reset_stats();
                }
            }
            ActionKind::Pool(slots) => {
                for slot in slots.iter_mut() {
                    slot.stats = Statistics::default();
                }
            }
        }
    }

    /// Collects the statistics of this subtree into the report.
    pub fn collect_statistics(&self, report: &mut Vec<StatisticsEntry>) {
        report.push(StatisticsEntry {
            name: self.name.clone(),
            is_rule: false,
            stats: self.stats,
        });
        match &self.kind {
            ActionKind::Leaf(_) => (),
            ActionKind::Group(children)
            | ActionKind::RestartGroup { children, .. } => {
                for child in children.iter() {
                    child.collect_statistics(report);
                }
            }
            ActionKind::Pool(slots) => {
                for slot in slots.iter() {
                    report.push(StatisticsEntry {
                        name: slot.rule.name().to_string(),
                        is_rule: true,
                        stats: slot.stats,
                    });
                }
            }
        }
    }

    /// Sets a breakpoint on the action or rule with the given name within
    /// this subtree. Returns true iff the name was found.
    pub fn set_breakpoint(&mut self, name: &str, break_flags: u32) -> bool {
        if self.name == name {
            self.breakpoint |= break_flags;
            return true;
        }
        match &mut self.kind {
            ActionKind::Leaf(_) => false,
            ActionKind::Group(children)
            | ActionKind::RestartGroup { children, .. } => children
                .iter_mut()
                .any(|child| child.set_breakpoint(name, break_flags)),
            ActionKind::Pool(slots) => {
                for slot in slots.iter_mut() {
                    if slot.rule.name() == name {
                        slot.breakpoint |= break_flags;
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Enables or disables the rule with the given name within this subtree.
    pub fn toggle_rule(&mut self, name: &str, disable: bool) -> bool {
        match &mut self.kind {
            ActionKind::Leaf(_) => false,
            ActionKind::Group(children)
            | ActionKind::RestartGroup { children, .. } => children
                .iter_mut()
                .any(|child| child.toggle_rule(name, disable)),
            ActionKind::Pool(slots) => {
                for slot in slots.iter_mut() {
                    if slot.rule.name() == name {
                        slot.disabled = disable;
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Performs this action on the function, honoring repeat and once-per
    /// semantics, breakpoints, and cancellation.
    pub fn perform(
        &mut self,
        fd: &mut FunctionData,
        arch: &Architecture,
        ctl: &EngineControl,
    ) -> Result<Outcome, Error> {
        if ctl.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if self.done_once && self.flags & action_flags::ONCE_PER_FUNC != 0 {
            return Ok(Outcome::Completed);
        }
        if self.total_count > 0 && self.flags & action_flags::ONE_ACT_PER_FUNC != 0 {
            return Ok(Outcome::Completed);
        }
        if self.resume_child.is_none() {
            let hit_start = self.breakpoint & break_flags::BREAK_START != 0
                || self.breakpoint & break_flags::TMPBREAK_START != 0;
            if hit_start && !self.start_break_hit {
                self.start_break_hit = true;
                self.breakpoint &= !break_flags::TMPBREAK_START;
                return Ok(Outcome::Break);
            }
        }

        self.stats.count_tests += 1;
        let before = self.count;
        let outcome = if matches!(self.kind, ActionKind::Leaf(_)) {
            self.perform_leaf(fd, arch)?
        } else if matches!(self.kind, ActionKind::Group(_)) {
            self.perform_group(fd, arch, ctl)?
        } else if matches!(self.kind, ActionKind::RestartGroup { .. }) {
            self.perform_restart_group(fd, arch, ctl)?
        } else {
            self.perform_pool(fd, arch, ctl)?
        };
        if self.count > before {
            self.stats.count_apply += 1;
        }
        self.total_count += self.count - before;
        if outcome == Outcome::Completed {
            self.done_once = true;
            self.start_break_hit = false;
            if self.count > 0
                && self.flags & action_flags::WARNINGS_ON != 0
                && self.flags & action_flags::WARNINGS_GIVEN == 0
            {
                self.flags |= action_flags::WARNINGS_GIVEN;
                fd.warning(&format!("Action {} applied", self.name), fd.entry());
            }
        }
        Ok(outcome)
    }

    fn perform_leaf(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<Outcome, Error> {
        let repeat = self.flags & action_flags::REPEAT_APPLY != 0;
        loop {
            let ActionKind::Leaf(leaf) = &mut self.kind else {
                unreachable!()
            };
            let changes = leaf.apply(fd, arch)?;
            if changes > 0 {
                self.count += changes;
                if self.breakpoint & break_flags::BREAK_ACTION != 0 {
                    return Ok(Outcome::Break);
                }
                if repeat {
                    continue;
                }
            }
            return Ok(Outcome::Completed);
        }
    }

    fn perform_group(
        &mut self,
        fd: &mut FunctionData,
        arch: &Architecture,
        ctl: &EngineControl,
    ) -> Result<Outcome, Error> {
        let repeat = self.flags & action_flags::REPEAT_APPLY != 0;
        loop {
            let start_child = self.resume_child.take().unwrap_or(0);
            let ActionKind::Group(children) = &mut self.kind else {
                unreachable!()
            };
            for index in start_child..children.len() {
                let outcome = children[index].perform(fd, arch, ctl)?;
                match outcome {
                    Outcome::Completed => (),
                    Outcome::Break | Outcome::Cancelled => {
                        self.resume_child = Some(index);
                        return Ok(outcome);
                    }
                }
            }
            // One full pass is done; fold the child counts into this group.
            let mut pass_changes = 0;
            for child in children.iter_mut() {
                pass_changes += child.count;
                child.count = 0;
            }
            self.count += pass_changes;
            if !repeat || pass_changes == 0 {
                return Ok(Outcome::Completed);
            }
        }
    }

    fn perform_restart_group(
        &mut self,
        fd: &mut FunctionData,
        arch: &Architecture,
        ctl: &EngineControl,
    ) -> Result<Outcome, Error> {
        loop {
            let start_child = self.resume_child.take().unwrap_or(0);
            let ActionKind::RestartGroup { children, .. } = &mut self.kind else {
                unreachable!()
            };
            for index in start_child..children.len() {
                let outcome = children[index].perform(fd, arch, ctl)?;
                match outcome {
                    Outcome::Completed => (),
                    Outcome::Break | Outcome::Cancelled => {
                        self.resume_child = Some(index);
                        return Ok(outcome);
                    }
                }
            }
            let ActionKind::RestartGroup {
                children,
                max_restarts,
                cur_restart,
            } = &mut self.kind
            else {
                unreachable!()
            };
            let mut pass_changes = 0;
            for child in children.iter_mut() {
                pass_changes += child.count;
                child.count = 0;
            }
            self.count += pass_changes;
            if fd.is_restart_pending() && *cur_restart < *max_restarts {
                *cur_restart += 1;
                fd.set_restart_pending(false);
                fd.heritage_mut().force_restructure();
                for child in children.iter_mut() {
                    child.reset(fd);
                }
                continue;
            }
            return Ok(Outcome::Completed);
        }
    }

    fn perform_pool(
        &mut self,
        fd: &mut FunctionData,
        arch: &Architecture,
        ctl: &EngineControl,
    ) -> Result<Outcome, Error> {
        loop {
            if ctl.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            let mut pass_changes = 0;
            // Alive ops are visited in sequence-number order; the list is
            // captured per pass so rules see their own changes on the next
            // pass at the latest.
            for op in fd.obank().alive_ids() {
                if !fd.obank().is_live(op) || fd.op(op).is_dead() {
                    continue;
                }
                let changes = self.process_op(op, fd, arch)?;
                if changes < 0 {
                    return Ok(Outcome::Break);
                }
                pass_changes += changes;
            }
            self.count += pass_changes;
            if pass_changes == 0 {
                return Ok(Outcome::Completed);
            }
        }
    }

    /// Gives every applicable rule the chance to fire on one op, restarting
    /// from the first rule after each change until no rule fires.
    ///
    /// Returns the number of changes, or -1 if a rule breakpoint was hit.
    fn process_op(
        &mut self,
        op: OpId,
        fd: &mut FunctionData,
        arch: &Architecture,
    ) -> Result<i32, Error> {
        let ActionKind::Pool(slots) = &mut self.kind else {
            unreachable!()
        };
        let mut total = 0;
        'retry: loop {
            if !fd.obank().is_live(op) || fd.op(op).is_dead() {
                break;
            }
            let code = fd.op(op).code();
            for slot in slots.iter_mut() {
                if slot.disabled {
                    continue;
                }
                let oplist = slot.rule.op_list();
                if !oplist.is_empty() && !oplist.contains(&code) {
                    continue;
                }
                slot.stats.count_tests += 1;
                let changes = slot.rule.apply_op(op, fd, arch)?;
                if changes > 0 {
                    slot.stats.count_apply += 1;
                    total += changes;
                    if slot.warnings_on && !slot.warnings_given {
                        slot.warnings_given = true;
                        fd.warning(
                            &format!("Rule {} applied", slot.rule.name()),
                            fd.entry(),
                        );
                    }
                    if slot.breakpoint & break_flags::BREAK_ACTION != 0 {
                        return Ok(-1);
                    }
                    continue 'retry;
                }
            }
            break;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests;
