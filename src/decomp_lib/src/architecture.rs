//! The process-lifetime root object of the decompiler.
//!
//! An [`Architecture`] bundles the shared registries: the address space
//! manager, the symbol database, the prototype models, and the option set.
//! The registries are populated during an explicit setup phase; once
//! analysis starts they become immutable and may be shared read-only
//! between engine instances on different threads.

use crate::address::{AddrSpaceManager, Range};
use crate::database::Database;
use crate::function::ProtoModel;
use crate::options::Options;
use crate::prelude::*;

use std::collections::BTreeMap;

/// The shared, process-lifetime state of the decompiler.
pub struct Architecture {
    manager: AddrSpaceManager,
    database: Database,
    options: Options,
    proto_models: BTreeMap<String, ProtoModel>,
    started: bool,
}

impl Architecture {
    /// Returns a new architecture over the given address spaces.
    pub fn new(manager: AddrSpaceManager) -> Architecture {
        Architecture {
            manager,
            database: Database::new(),
            options: Options::default(),
            proto_models: BTreeMap::new(),
            started: false,
        }
    }

    /// Returns the address space manager.
    pub fn manager(&self) -> &AddrSpaceManager {
        &self.manager
    }

    /// Returns the address space manager for setup-time mutation.
    pub fn manager_mut(&mut self) -> Result<&mut AddrSpaceManager, Error> {
        self.check_not_started()?;
        Ok(&mut self.manager)
    }

    /// Returns the symbol database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Returns the symbol database for mutation.
    ///
    /// During analysis only explicit promotion of function-local results may
    /// write here, and the caller is responsible for synchronization.
    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    /// Returns the option set.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Registers a prototype model under its name.
    pub fn add_proto_model(&mut self, model: ProtoModel) -> Result<(), Error> {
        self.check_not_started()?;
        self.proto_models.insert(model.name.clone(), model);
        Ok(())
    }

    /// Returns the prototype model with the given name.
    pub fn proto_model(&self, name: &str) -> Option<&ProtoModel> {
        self.proto_models.get(name)
    }

    /// Returns the model named by the `defaultprototype` option, or an empty
    /// model if none is registered.
    pub fn default_proto_model(&self) -> ProtoModel {
        self.proto_models
            .get(&self.options.default_prototype)
            .cloned()
            .unwrap_or_default()
    }

    /// Applies a keyed option.
    ///
    /// The range-valued keys `readonly` and `volatile` expect a value of the
    /// form `0x<first>:0x<last>` in the default data space and update the
    /// global property map; all other keys are applied to the option set.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "readonly" | "volatile" => {
                let range = self.parse_range(value)?;
                let properties = &mut self.database.properties;
                let list = if key == "readonly" {
                    &mut properties.read_only
                } else {
                    &mut properties.volatile
                };
                list.insert(range.space(), range.first(), range.last());
                Ok(())
            }
            _ => self.options.set(key, value),
        }
    }

    fn parse_range(&self, value: &str) -> Result<Range, Error> {
        let (first, last) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("expected range of the form 0x<first>:0x<last>"))?;
        let parse = |text: &str| -> Result<u64, Error> {
            let text = text.strip_prefix("0x").unwrap_or(text);
            u64::from_str_radix(text, 16).map_err(|_| anyhow!("malformed range bound: {}", text))
        };
        let first = parse(first)?;
        let last = parse(last)?;
        if last < first {
            bail!("empty range: 0x{:x}:0x{:x}", first, last);
        }
        Ok(Range::new(self.manager.default_space().id(), first, last))
    }

    /// Marks the start of analysis. Registry mutation is rejected from here
    /// on.
    pub fn start_analysis(&mut self) {
        self.manager.seal();
        self.started = true;
    }

    /// Returns true iff analysis has started.
    pub fn has_started(&self) -> bool {
        self.started
    }

    fn check_not_started(&self) -> Result<(), Error> {
        if self.started {
            bail!("registry mutation after analysis start");
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    impl Architecture {
        /// Mock an architecture over the mock space manager.
        pub fn mock() -> Architecture {
            let mut arch = Architecture::new(AddrSpaceManager::mock());
            arch.add_proto_model(ProtoModel::new("default")).unwrap();
            arch
        }
    }

    #[test]
    fn registries_freeze_after_start() {
        let mut arch = Architecture::mock();
        assert!(arch.manager_mut().is_ok());
        arch.start_analysis();
        assert!(arch.manager_mut().is_err());
        assert!(arch.add_proto_model(ProtoModel::new("late")).is_err());
    }

    #[test]
    fn range_options_update_properties() {
        let mut arch = Architecture::mock();
        arch.set_option("readonly", "0x1000:0x1fff").unwrap();
        let addr = crate::address::Address::new(arch.manager().default_space().id(), 0x1800);
        assert_eq!(
            arch.database().properties.query(&addr, 4),
            crate::database::property::READ_ONLY
        );
    }
}
