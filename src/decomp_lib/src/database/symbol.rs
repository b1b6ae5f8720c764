//! Symbols and their storage mappings.

use crate::address::{Address, RangeList};
use crate::datatype::DataType;
use crate::prelude::*;

use std::fmt::{self, Display};
use std::sync::Arc;

use super::ScopeId;

/// Index of a symbol within its owning scope.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct SymbolId(pub(crate) u32);

impl SymbolId {
    /// Returns the index of the symbol within its scope's arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a symbol entry within its owning scope.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    /// Returns the index of the entry within its scope's arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The category a symbol belongs to.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum SymbolCategory {
    /// No special category.
    #[default]
    None,
    /// The symbol is a formal parameter of a function. The index gives the
    /// position within the parameter list.
    Parameter(u32),
    /// The symbol is an equate: a name for a constant.
    Equate,
}

/// The kind-specific payload of a symbol.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default)]
pub enum SymbolKind {
    /// An ordinary variable.
    #[default]
    Variable,
    /// The symbol names a function entry point.
    Function,
    /// A name for a constant value.
    Equate {
        /// The named value.
        value: u64,
    },
    /// A code label.
    Label,
    /// A reference to a symbol in another executable.
    ExternRef {
        /// The name of the symbol in the external executable.
        target: String,
    },
}

/// A named object within a [`Scope`](super::Scope).
///
/// Distinct symbols with identical names may coexist in one scope; they are
/// distinguished by a deduplication id assigned at insertion time.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Symbol {
    /// The name of the symbol.
    name: String,
    /// Deduplication index among same-named symbols of the scope.
    dedup_id: u32,
    /// The data-type of the symbol.
    datatype: Arc<DataType>,
    /// The category of the symbol.
    category: SymbolCategory,
    /// Kind-specific payload.
    kind: SymbolKind,
    /// The scope owning this symbol.
    scope: ScopeId,
    /// The data-type may not be changed by analysis.
    type_locked: bool,
    /// The name may not be changed by analysis.
    name_locked: bool,
    /// The storage mappings of the symbol.
    entries: Vec<EntryId>,
}

impl Symbol {
    pub(crate) fn new(
        name: String,
        dedup_id: u32,
        datatype: Arc<DataType>,
        kind: SymbolKind,
        scope: ScopeId,
    ) -> Symbol {
        Symbol {
            name,
            dedup_id,
            datatype,
            category: SymbolCategory::None,
            kind,
            scope,
            type_locked: false,
            name_locked: false,
            entries: Vec::new(),
        }
    }

    /// Returns the name of the symbol.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the deduplication index of the symbol.
    pub fn dedup_id(&self) -> u32 {
        self.dedup_id
    }

    /// Returns the data-type of the symbol.
    pub fn datatype(&self) -> &Arc<DataType> {
        &self.datatype
    }

    /// Sets the data-type of the symbol.
    pub(crate) fn set_datatype(&mut self, datatype: Arc<DataType>) {
        self.datatype = datatype;
    }

    /// Returns the category of the symbol.
    pub fn category(&self) -> SymbolCategory {
        self.category
    }

    /// Assigns the category of the symbol.
    pub fn set_category(&mut self, category: SymbolCategory) {
        self.category = category;
    }

    /// Returns the kind-specific payload.
    pub fn kind(&self) -> &SymbolKind {
        &self.kind
    }

    /// Returns the scope owning this symbol.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Returns true iff analysis may not change the data-type.
    pub fn is_type_locked(&self) -> bool {
        self.type_locked
    }

    /// Returns true iff analysis may not change the name.
    pub fn is_name_locked(&self) -> bool {
        self.name_locked
    }

    /// Locks or unlocks the data-type.
    pub fn set_type_lock(&mut self, lock: bool) {
        self.type_locked = lock;
    }

    /// Locks or unlocks the name.
    pub fn set_name_lock(&mut self, lock: bool) {
        self.name_locked = lock;
    }

    /// Returns the ids of all storage mappings of the symbol.
    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    pub(crate) fn add_entry(&mut self, entry: EntryId) {
        self.entries.push(entry);
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dedup_id == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}${}", self.name, self.dedup_id)
        }
    }
}

/// The storage half of a symbol mapping.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum EntryStorage {
    /// The symbol lives at a fixed address.
    Static {
        /// The first address of the storage.
        addr: Address,
    },
    /// The symbol is attached to a local p-code expression instead of a
    /// storage address.
    Dynamic {
        /// The code address anchoring the expression.
        anchor: Address,
        /// The 64-bit hash of the expression tree.
        hash: u64,
    },
}

/// One mapping from a storage location to (part of) a symbol.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct SymbolEntry {
    /// The mapped symbol.
    symbol: SymbolId,
    /// Where the mapping lives.
    storage: EntryStorage,
    /// Byte offset of this mapping within the whole symbol.
    offset: u32,
    /// Number of bytes covered by this mapping.
    size: u32,
    /// Code addresses at which the mapping is valid. Empty means everywhere.
    uselimit: RangeList,
}

impl SymbolEntry {
    pub(crate) fn new(
        symbol: SymbolId,
        storage: EntryStorage,
        offset: u32,
        size: u32,
        uselimit: RangeList,
    ) -> SymbolEntry {
        SymbolEntry {
            symbol,
            storage,
            offset,
            size,
            uselimit,
        }
    }

    /// Returns the mapped symbol.
    pub fn symbol(&self) -> SymbolId {
        self.symbol
    }

    /// Returns the storage of this mapping.
    pub fn storage(&self) -> &EntryStorage {
        &self.storage
    }

    /// Returns the starting address for a static mapping.
    pub fn addr(&self) -> Option<Address> {
        match &self.storage {
            EntryStorage::Static { addr } => Some(*addr),
            EntryStorage::Dynamic { .. } => None,
        }
    }

    /// Returns the byte offset of this mapping within the symbol.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns the number of bytes covered.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the code addresses at which the mapping is valid.
    pub fn uselimit(&self) -> &RangeList {
        &self.uselimit
    }

    /// Returns true iff the mapping is valid at the given code address.
    ///
    /// An invalid use-point matches everything, as does an empty uselimit.
    pub fn admits(&self, usepoint: &Address) -> bool {
        usepoint.is_invalid() || self.uselimit.is_empty() || self.uselimit.contains(usepoint)
    }
}
