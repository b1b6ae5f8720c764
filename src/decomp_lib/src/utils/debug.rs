//! Little helpers for developers that try to understand what their code is
//! doing.

#![allow(dead_code)]
#![allow(missing_docs)]

#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
/// Stages of the decompilation pipeline that can be debugged separately.
#[non_exhaustive]
pub enum Stage {
    #[default]
    No,
    All,
    /// The raw p-code as handed to the flow builder.
    PcodeRaw,
    /// The basic block graph before SSA construction.
    Flow,
    /// The data-flow graph after a heritage pass.
    Ssa(u32),
    /// The graph after the rule engine reached fixed point.
    Transformed,
    /// The graph after variable merging.
    Merged,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
/// Controls generation of log messages.
#[non_exhaustive]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

#[derive(PartialEq, Eq, Clone, Default, Debug)]
/// Configuration of the debugging behavior.
pub struct Settings {
    stage: Stage,
    verbose: Verbosity,
}

#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct SettingsBuilder {
    inner: Settings,
}

impl SettingsBuilder {
    pub fn build(self) -> Settings {
        self.inner
    }

    pub fn set_stage(mut self, stage: Stage) -> Self {
        self.inner.stage = stage;
        self
    }

    pub fn set_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.inner.verbose = verbosity;
        self
    }
}

impl Settings {
    /// Returns true iff the `stage` is being debugged.
    pub fn should_debug(&self, stage: Stage) -> bool {
        debug_assert_ne!(stage, Stage::No);

        stage == self.stage || matches!(self.stage, Stage::All)
    }

    /// Displays the `obj`ect if the stage is being debugged.
    pub fn print<T: std::fmt::Display>(&self, obj: &T, stage: Stage) {
        if self.should_debug(stage) {
            println!("{}", obj);
        }
    }

    /// Displays the `obj`ect if the stage is being debugged.
    pub fn dbg<T: std::fmt::Debug>(&self, obj: &T, stage: Stage) {
        if self.should_debug(stage) {
            println!("{:?}", obj);
        }
    }

    /// Returns true if the logging level is at least verbose.
    pub fn verbose(&self) -> bool {
        matches!(self.verbose, Verbosity::Verbose)
    }

    /// Returns true if logging is disabled.
    pub fn quiet(&self) -> bool {
        matches!(self.verbose, Verbosity::Quiet)
    }
}
