//! Address spaces and the process-lifetime space manager.

use super::join::JoinRecord;
use super::{Address, VarnodeData};
use crate::prelude::*;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Index of an address space within the [`AddrSpaceManager`].
///
/// Spaces live for the whole process, so the index is a stable, cheap handle
/// that is embedded in every [`Address`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct SpaceId(u8);

impl SpaceId {
    /// The id of the constant space. The manager always creates the constant
    /// space first.
    pub const CONSTANT: SpaceId = SpaceId(0);
    /// The id marking the invalid (null) address.
    pub const INVALID: SpaceId = SpaceId(u8::MAX);

    /// Returns the index of the space within the manager.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the id for a manager index.
    pub fn from_index(index: usize) -> SpaceId {
        debug_assert!(index < u8::MAX as usize);
        SpaceId(index as u8)
    }
}

/// The kind of an address space.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    /// Holds constant values; the offset of an address is the value.
    Constant,
    /// Models processor registers.
    Register,
    /// General random-access memory.
    Ram,
    /// Compiler temporaries that never escape a single instruction.
    Unique,
    /// Storage addressed relative to a base register (stack frames).
    Stack,
    /// Annotation markers that do not take part in data-flow.
    Annotation,
    /// Synthetic space whose offsets index [`JoinRecord`]s describing
    /// logical values spread over several physical locations.
    Join,
}

impl Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SpaceKind::*;
        match self {
            Constant => write!(f, "const"),
            Register => write!(f, "register"),
            Ram => write!(f, "ram"),
            Unique => write!(f, "unique"),
            Stack => write!(f, "stack"),
            Annotation => write!(f, "annotation"),
            Join => write!(f, "join"),
        }
    }
}

/// A named region of byte-addressable storage.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct AddrSpace {
    /// The name of the space.
    name: String,
    /// What kind of storage the space models.
    kind: SpaceKind,
    /// The index of this space within the manager.
    index: SpaceId,
    /// Number of bytes needed to represent an offset into the space.
    addr_size: u32,
    /// Number of bytes in an addressable word.
    word_size: u32,
    /// Whether multi-byte values are stored most significant byte first.
    big_endian: bool,
    /// Number of heritage passes to wait before SSA construction touches
    /// this space.
    delay: u32,
    /// Number of heritage passes to wait before dead Varnodes in this space
    /// may be removed.
    deadcode_delay: u32,
    /// The register naming this space for offset-relative storage, if any.
    base_register: Option<VarnodeData>,
}

impl AddrSpace {
    /// Returns the name of the space.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kind of the space.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Returns the id of the space.
    pub fn id(&self) -> SpaceId {
        self.index
    }

    /// Returns the number of bytes needed to represent an offset.
    pub fn addr_size(&self) -> u32 {
        self.addr_size
    }

    /// Returns the number of bytes in an addressable word.
    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    /// Returns true iff data in this space is big endian.
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Returns true iff SSA construction should link Varnodes in this space.
    pub fn is_heritaged(&self) -> bool {
        !matches!(
            self.kind,
            SpaceKind::Constant | SpaceKind::Annotation | SpaceKind::Join
        )
    }

    /// Returns the heritage delay in passes.
    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Returns the dead code removal delay in passes.
    pub fn deadcode_delay(&self) -> u32 {
        self.deadcode_delay
    }

    /// Returns the base register binding for stack-like spaces.
    pub fn base_register(&self) -> Option<&VarnodeData> {
        self.base_register.as_ref()
    }

    /// Returns the largest valid offset into this space.
    pub fn highest_offset(&self) -> u64 {
        super::calc_mask(self.addr_size) * self.word_size as u64
    }
}

/// The process-lifetime collection of address spaces.
///
/// Spaces are registered once during setup. After [`seal`](Self::seal) is
/// called the set of spaces is immutable and the manager may be shared
/// read-only between analysis threads. Only the join table may still grow,
/// which requires exclusive access.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddrSpaceManager {
    spaces: Vec<AddrSpace>,
    default_space: SpaceId,
    join_space: Option<SpaceId>,
    join_records: Vec<JoinRecord>,
    join_lookup: BTreeMap<JoinRecord, u64>,
    sealed: bool,
}

impl AddrSpaceManager {
    /// Returns a new manager containing only the constant space.
    pub fn new() -> AddrSpaceManager {
        let mut manager = AddrSpaceManager {
            spaces: Vec::new(),
            default_space: SpaceId::CONSTANT,
            join_space: None,
            join_records: Vec::new(),
            join_lookup: BTreeMap::new(),
            sealed: false,
        };
        manager
            .add_space("const", SpaceKind::Constant, 8, 1, false, 0, 0, None)
            .expect("constant space registration cannot fail");
        manager
    }

    /// Registers a new address space and returns its id.
    ///
    /// Fails if the manager has been sealed or the space limit is reached.
    #[allow(clippy::too_many_arguments)]
    pub fn add_space(
        &mut self,
        name: &str,
        kind: SpaceKind,
        addr_size: u32,
        word_size: u32,
        big_endian: bool,
        delay: u32,
        deadcode_delay: u32,
        base_register: Option<VarnodeData>,
    ) -> Result<SpaceId, Error> {
        if self.sealed {
            bail!("attempt to register address space {} after sealing", name);
        }
        if self.spaces.len() >= SpaceId::INVALID.index() {
            bail!("address space limit exceeded");
        }
        if kind == SpaceKind::Constant && !self.spaces.is_empty() {
            bail!("only one constant space is allowed");
        }
        let index = SpaceId(self.spaces.len() as u8);
        self.spaces.push(AddrSpace {
            name: name.to_string(),
            kind,
            index,
            addr_size,
            word_size,
            big_endian,
            delay,
            deadcode_delay: deadcode_delay.max(delay),
            base_register,
        });
        if kind == SpaceKind::Join {
            self.join_space = Some(index);
        }
        Ok(index)
    }

    /// Marks the default space for memory accesses without an explicit space.
    pub fn set_default_space(&mut self, id: SpaceId) {
        self.default_space = id;
    }

    /// Seals the manager; any further space registration fails.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Returns the space with the given id.
    ///
    /// Panics on the invalid id; addresses must be checked with
    /// [`Address::is_invalid`] before their space is looked up.
    pub fn space(&self, id: SpaceId) -> &AddrSpace {
        &self.spaces[id.index()]
    }

    /// Returns the space with the given name, if registered.
    pub fn space_by_name(&self, name: &str) -> Option<&AddrSpace> {
        self.spaces.iter().find(|spc| spc.name == name)
    }

    /// Returns the default space.
    pub fn default_space(&self) -> &AddrSpace {
        &self.spaces[self.default_space.index()]
    }

    /// Returns the join space id, if one was registered.
    pub fn join_space(&self) -> Option<SpaceId> {
        self.join_space
    }

    /// Returns the number of registered spaces.
    pub fn num_spaces(&self) -> usize {
        self.spaces.len()
    }

    /// Returns an iterator over all registered spaces.
    pub fn iter(&self) -> impl Iterator<Item = &AddrSpace> {
        self.spaces.iter()
    }

    /// Looks up the join record for the given join-space offset.
    pub fn join_record(&self, offset: u64) -> Option<&JoinRecord> {
        self.join_records.get(offset as usize)
    }

    /// Returns the address of the join record describing the given pieces,
    /// registering a new record if none exists yet.
    ///
    /// Pieces must be ordered most significant first.
    pub fn find_add_join(
        &mut self,
        pieces: Vec<VarnodeData>,
        logical_size: u32,
    ) -> Result<Address, Error> {
        let join_space = self
            .join_space
            .ok_or_else(|| anyhow!("no join space registered"))?;
        let record = JoinRecord::new(pieces, logical_size);
        if let Some(&offset) = self.join_lookup.get(&record) {
            return Ok(Address::new(join_space, offset));
        }
        let offset = self.join_records.len() as u64;
        self.join_lookup.insert(record.clone(), offset);
        self.join_records.push(record);
        Ok(Address::new(join_space, offset))
    }
}

impl Default for AddrSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    impl SpaceId {
        /// The id the mock manager assigns to the RAM space.
        pub fn mock_ram() -> SpaceId {
            SpaceId(1)
        }

        /// The id the mock manager assigns to the register space.
        pub fn mock_register() -> SpaceId {
            SpaceId(2)
        }

        /// The id the mock manager assigns to the unique space.
        pub fn mock_unique() -> SpaceId {
            SpaceId(3)
        }

        /// The id the mock manager assigns to the stack space.
        pub fn mock_stack() -> SpaceId {
            SpaceId(4)
        }
    }

    impl AddrSpaceManager {
        /// Mock a manager with the standard five spaces of a little endian
        /// 64-bit target plus a join space.
        pub fn mock() -> AddrSpaceManager {
            let mut manager = AddrSpaceManager::new();
            let ram = manager
                .add_space("ram", SpaceKind::Ram, 8, 1, false, 0, 0, None)
                .unwrap();
            manager
                .add_space("register", SpaceKind::Register, 4, 1, false, 0, 0, None)
                .unwrap();
            manager
                .add_space("unique", SpaceKind::Unique, 4, 1, false, 0, 0, None)
                .unwrap();
            let sp = VarnodeData::new(Address::new(SpaceId::mock_register(), 0x20), 8);
            manager
                .add_space("stack", SpaceKind::Stack, 8, 1, false, 1, 1, Some(sp))
                .unwrap();
            manager
                .add_space("join", SpaceKind::Join, 8, 1, false, 0, 0, None)
                .unwrap();
            manager.set_default_space(ram);
            manager
        }
    }

    #[test]
    fn space_registration() {
        let mut manager = AddrSpaceManager::mock();
        assert_eq!(manager.num_spaces(), 6);
        assert_eq!(manager.space(SpaceId::CONSTANT).kind(), SpaceKind::Constant);
        assert_eq!(manager.default_space().name(), "ram");
        assert!(manager.space(SpaceId::mock_stack()).base_register().is_some());

        manager.seal();
        assert!(manager
            .add_space("late", SpaceKind::Ram, 8, 1, false, 0, 0, None)
            .is_err());
    }

    #[test]
    fn join_records_are_uniqued() {
        let mut manager = AddrSpaceManager::mock();
        let hi = VarnodeData::new(Address::new(SpaceId::mock_register(), 0x8), 4);
        let lo = VarnodeData::new(Address::new(SpaceId::mock_register(), 0x0), 4);
        let a = manager.find_add_join(vec![hi, lo], 8).unwrap();
        let b = manager.find_add_join(vec![hi, lo], 8).unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.join_record(a.offset()).unwrap().num_pieces(), 2);
    }
}
