//! The symbol database: scopes, symbols and their storage mappings.
//!
//! A [`Scope`] is a named container of symbols with a set of claimed
//! data-address ranges. Scopes form a tree rooted at the global scope. The
//! scope is the unique owner of both its symbols and their entries; all other
//! references are plain indices so they survive growth of the arenas.
//!
//! The [`Database`] is the root of the scope tree. It also carries the
//! code-address to namespace-scope map and the global boolean property map
//! (read-only, volatile, incidental-copy) that the rule engine queries when
//! resolving memory accesses.

use crate::address::{Address, Range, RangeList, SpaceId};
use crate::datatype::DataType;
use crate::prelude::*;

use std::collections::BTreeMap;
use std::sync::Arc;

mod dynamic_hash;
mod entry_map;
mod symbol;

pub use dynamic_hash::DynamicHash;
pub use entry_map::EntryMap;
pub use symbol::{
    EntryId, EntryStorage, Symbol, SymbolCategory, SymbolEntry, SymbolId, SymbolKind,
};

/// Index of a scope within the database.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct ScopeId(u32);

impl ScopeId {
    /// The id of the global scope.
    pub const GLOBAL: ScopeId = ScopeId(0);

    /// The id of a function-local scope, which lives in its function context
    /// rather than in the database.
    pub const LOCAL: ScopeId = ScopeId(u32::MAX);

    /// Returns the index of the scope within the database.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Boolean memory properties attached to address ranges.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PropertyMap {
    /// Memory that analysis must treat as never written.
    pub read_only: RangeList,
    /// Memory whose accesses may not be reordered or folded.
    pub volatile: RangeList,
    /// Storage whose copies carry no information (e.g. save/restore slots).
    pub incidental_copy: RangeList,
}

/// Property query result bits.
pub mod property {
    /// The range is read-only.
    pub const READ_ONLY: u32 = 1;
    /// The range is volatile.
    pub const VOLATILE: u32 = 2;
    /// Copies in the range are incidental.
    pub const INCIDENTAL_COPY: u32 = 4;
}

impl PropertyMap {
    /// Returns the property bits holding for the whole range
    /// `[addr, addr + size)`.
    pub fn query(&self, addr: &Address, size: u64) -> u32 {
        let mut flags = 0;
        if self.read_only.contains_range(addr, size) {
            flags |= property::READ_ONLY;
        }
        if self.volatile.contains_range(addr, size) {
            flags |= property::VOLATILE;
        }
        if self.incidental_copy.contains_range(addr, size) {
            flags |= property::INCIDENTAL_COPY;
        }
        flags
    }
}

/// A named collection of symbols with claimed storage ranges.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Scope {
    id: ScopeId,
    name: String,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    symbols: Vec<Symbol>,
    entries: Vec<SymbolEntry>,
    /// Spatial index per address space over the static entries.
    maps: BTreeMap<SpaceId, EntryMap>,
    /// Entries keyed by expression hash instead of storage address.
    dynamic_entries: Vec<EntryId>,
    /// Data-address ranges claimed by this scope.
    owned_ranges: RangeList,
    /// Next deduplication index per symbol name.
    name_dedup: BTreeMap<String, u32>,
}

impl Scope {
    fn new(id: ScopeId, name: String, parent: Option<ScopeId>) -> Scope {
        Scope {
            id,
            name,
            parent,
            children: Vec::new(),
            symbols: Vec::new(),
            entries: Vec::new(),
            maps: BTreeMap::new(),
            dynamic_entries: Vec::new(),
            owned_ranges: RangeList::new(),
            name_dedup: BTreeMap::new(),
        }
    }

    /// Returns a detached scope for the locals of one function.
    ///
    /// Local scopes are owned by their function context instead of the
    /// database, so that analysis writes stay function-local.
    pub fn new_local(name: &str) -> Scope {
        Scope::new(ScopeId::LOCAL, name.to_string(), Some(ScopeId::GLOBAL))
    }

    /// Returns the id of this scope.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Returns the name of this scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the parent scope, if this is not the global scope.
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    /// Returns the child scopes.
    pub fn children(&self) -> &[ScopeId] {
        &self.children
    }

    /// Returns the data-address ranges claimed by this scope.
    pub fn owned_ranges(&self) -> &RangeList {
        &self.owned_ranges
    }

    /// Claims a data-address range for this scope.
    pub fn claim_range(&mut self, range: Range) {
        self.owned_ranges
            .insert(range.space(), range.first(), range.last());
    }

    /// Adds a new symbol and returns its id.
    ///
    /// A symbol with an already used name gets the next deduplication index
    /// for that name.
    pub fn add_symbol(
        &mut self,
        name: &str,
        datatype: Arc<DataType>,
        kind: SymbolKind,
    ) -> SymbolId {
        let dedup = self.name_dedup.entry(name.to_string()).or_insert(0);
        let dedup_id = *dedup;
        *dedup += 1;
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols
            .push(Symbol::new(name.to_string(), dedup_id, datatype, kind, self.id));
        id
    }

    /// Returns the symbol with the given id.
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    /// Returns the symbol with the given id.
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    /// Returns an iterator over all symbols with their ids.
    pub fn iter_symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| (SymbolId(i as u32), sym))
    }

    /// Returns all symbols with the given name, ordered by deduplication id.
    pub fn find_by_name(&self, name: &str) -> Vec<SymbolId> {
        self.iter_symbols()
            .filter(|(_, sym)| sym.name() == name)
            .map(|(id, _)| id)
            .collect()
    }

    /// Returns the entry with the given id.
    pub fn entry(&self, id: EntryId) -> &SymbolEntry {
        &self.entries[id.index()]
    }

    /// Maps `size` bytes of the symbol starting at `offset` to the storage
    /// address `addr`, valid at the code addresses in `uselimit`.
    pub fn add_map_entry(
        &mut self,
        symbol: SymbolId,
        addr: Address,
        offset: u32,
        size: u32,
        uselimit: RangeList,
    ) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        let entry = SymbolEntry::new(symbol, EntryStorage::Static { addr }, offset, size, uselimit);
        self.maps
            .entry(addr.space())
            .or_default()
            .insert(id, &entry);
        self.entries.push(entry);
        self.symbols[symbol.index()].add_entry(id);
        id
    }

    /// Attaches the symbol to a local p-code expression via its hash.
    pub fn add_dynamic_entry(
        &mut self,
        symbol: SymbolId,
        anchor: Address,
        hash: u64,
        size: u32,
    ) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        let entry = SymbolEntry::new(
            symbol,
            EntryStorage::Dynamic { anchor, hash },
            0,
            size,
            RangeList::new(),
        );
        self.entries.push(entry);
        self.dynamic_entries.push(id);
        self.symbols[symbol.index()].add_entry(id);
        id
    }

    /// Returns the dynamic entry with the given anchor and hash, if present.
    pub fn find_dynamic(&self, anchor: &Address, hash: u64) -> Option<(EntryId, &SymbolEntry)> {
        self.dynamic_entries.iter().find_map(|&id| {
            let entry = &self.entries[id.index()];
            match entry.storage() {
                EntryStorage::Dynamic {
                    anchor: a,
                    hash: h,
                } if a == anchor && *h == hash => Some((id, entry)),
                _ => None,
            }
        })
    }

    /// Returns an iterator over the ids of all dynamic entries.
    pub fn iter_dynamic(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.dynamic_entries.iter().copied()
    }

    /// Finds an entry starting exactly at `addr` that is valid at `usepoint`.
    pub fn find_addr(&self, addr: &Address, usepoint: &Address) -> Option<(EntryId, &SymbolEntry)> {
        self.maps
            .get(&addr.space())?
            .find_addr(addr, usepoint, &self.entries)
    }

    /// Finds the smallest entry containing `[addr, addr + size)` that is
    /// valid at `usepoint`.
    pub fn find_container(
        &self,
        addr: &Address,
        size: u32,
        usepoint: &Address,
    ) -> Option<(EntryId, &SymbolEntry)> {
        self.maps
            .get(&addr.space())?
            .find_container(addr, size, usepoint, &self.entries)
    }

    /// Finds the entry best approximating `[addr, addr + size)` that is
    /// valid at `usepoint`.
    pub fn find_closest_fit(
        &self,
        addr: &Address,
        size: u32,
        usepoint: &Address,
    ) -> Option<(EntryId, &SymbolEntry)> {
        self.maps
            .get(&addr.space())?
            .find_closest_fit(addr, size, usepoint, &self.entries)
    }

    /// Finds any entry overlapping `[addr, addr + size)`.
    pub fn find_overlap(&self, addr: &Address, size: u32) -> Option<(EntryId, &SymbolEntry)> {
        self.maps
            .get(&addr.space())?
            .find_overlap(addr, size, &self.entries)
    }

    /// Finds the neighbor entry starting closest before `addr`.
    pub fn find_before(&self, addr: &Address) -> Option<(EntryId, &SymbolEntry)> {
        self.maps.get(&addr.space())?.find_before(addr, &self.entries)
    }

    /// Finds the neighbor entry starting closest after `addr`.
    pub fn find_after(&self, addr: &Address) -> Option<(EntryId, &SymbolEntry)> {
        self.maps.get(&addr.space())?.find_after(addr, &self.entries)
    }
}

/// The root of the scope tree.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Database {
    scopes: Vec<Scope>,
    /// Code-address ranges mapped to the namespace scope owning them.
    ///
    /// Only proper namespaces appear here; the global scope matches anything
    /// unmapped and function scopes are resolved by name lookup.
    namespace_map: Vec<(Range, ScopeId)>,
    /// Global boolean memory properties.
    pub properties: PropertyMap,
}

impl Database {
    /// Returns a new database holding only the global scope.
    pub fn new() -> Database {
        Database {
            scopes: vec![Scope::new(ScopeId::GLOBAL, "".to_string(), None)],
            namespace_map: Vec::new(),
            properties: PropertyMap::default(),
        }
    }

    /// Returns the global scope.
    pub fn global_scope(&self) -> &Scope {
        &self.scopes[0]
    }

    /// Returns the global scope.
    pub fn global_scope_mut(&mut self) -> &mut Scope {
        &mut self.scopes[0]
    }

    /// Creates a child scope under the given parent and returns its id.
    pub fn add_scope(&mut self, name: &str, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(id, name.to_string(), Some(parent)));
        self.scopes[parent.index()].children.push(id);
        id
    }

    /// Returns the scope with the given id.
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    /// Returns the scope with the given id.
    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.index()]
    }

    /// Returns the number of scopes.
    pub fn num_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Declares that the namespace scope owns the given code-address range.
    pub fn map_namespace(&mut self, range: Range, scope: ScopeId) {
        self.namespace_map.push((range, scope));
        self.namespace_map.sort_by_key(|(range, _)| *range);
    }

    /// Returns the scope owning the variable accessed at the given code
    /// address: the innermost mapped namespace, or the global scope.
    pub fn map_scope(&self, code_addr: &Address) -> ScopeId {
        let mut best: Option<(u64, ScopeId)> = None;
        for (range, scope) in self.namespace_map.iter() {
            if range.contains(code_addr) {
                let width = range.last() - range.first();
                match best {
                    Some((prev_width, _)) if prev_width <= width => (),
                    _ => best = Some((width, *scope)),
                }
            }
        }
        best.map(|(_, scope)| scope).unwrap_or(ScopeId::GLOBAL)
    }

    /// Walks from the given scope toward the global scope looking for a
    /// containing entry for the storage range.
    pub fn find_container_up(
        &self,
        start: ScopeId,
        addr: &Address,
        size: u32,
        usepoint: &Address,
    ) -> Option<(ScopeId, EntryId)> {
        let mut current = Some(start);
        while let Some(id) = current {
            let scope = self.scope(id);
            if let Some((entry, _)) = scope.find_container(addr, size, usepoint) {
                return Some((id, entry));
            }
            current = scope.parent();
        }
        None
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;

    fn ram(offset: u64) -> Address {
        Address::new(SpaceId::mock_ram(), offset)
    }

    fn stack_scope() -> (Database, ScopeId) {
        let mut database = Database::new();
        let scope = database.add_scope("main", ScopeId::GLOBAL);
        (database, scope)
    }

    #[test]
    fn name_deduplication() {
        let (mut database, scope_id) = stack_scope();
        let scope = database.scope_mut(scope_id);
        let a = scope.add_symbol("local", DataType::int(4), SymbolKind::Variable);
        let b = scope.add_symbol("local", DataType::int(4), SymbolKind::Variable);
        assert_eq!(scope.symbol(a).dedup_id(), 0);
        assert_eq!(scope.symbol(b).dedup_id(), 1);
        assert_eq!(scope.find_by_name("local").len(), 2);
        assert_eq!(scope.symbol(a).scope(), scope_id);
    }

    #[test]
    fn container_queries() {
        let (mut database, scope_id) = stack_scope();
        let scope = database.scope_mut(scope_id);
        let big = scope.add_symbol("big", DataType::unknown(16), SymbolKind::Variable);
        let small = scope.add_symbol("small", DataType::int(4), SymbolKind::Variable);
        scope.add_map_entry(big, ram(0x100), 0, 16, RangeList::new());
        scope.add_map_entry(small, ram(0x104), 0, 4, RangeList::new());

        let none = Address::invalid();
        // Exact address match.
        let (_, entry) = scope.find_addr(&ram(0x104), &none).unwrap();
        assert_eq!(entry.symbol(), small);
        // The smaller of two nested containers wins.
        let (_, entry) = scope.find_container(&ram(0x105), 2, &none).unwrap();
        assert_eq!(entry.symbol(), small);
        // A range not covered by the small symbol falls back to the big one.
        let (_, entry) = scope.find_container(&ram(0x102), 8, &none).unwrap();
        assert_eq!(entry.symbol(), big);
        // Neighbors.
        let (_, entry) = scope.find_before(&ram(0x104)).unwrap();
        assert_eq!(entry.symbol(), big);
        let (_, entry) = scope.find_after(&ram(0x100)).unwrap();
        assert_eq!(entry.symbol(), small);
        // Overlap.
        assert!(scope.find_overlap(&ram(0x10e), 4).is_some());
        assert!(scope.find_overlap(&ram(0x110), 4).is_none());
    }

    #[test]
    fn uselimit_disambiguates() {
        let (mut database, scope_id) = stack_scope();
        let scope = database.scope_mut(scope_id);
        let early = scope.add_symbol("early", DataType::int(4), SymbolKind::Variable);
        let late = scope.add_symbol("late", DataType::int(4), SymbolKind::Variable);
        let mut early_limit = RangeList::new();
        early_limit.insert(SpaceId::mock_ram(), 0x1000, 0x1fff);
        let mut late_limit = RangeList::new();
        late_limit.insert(SpaceId::mock_ram(), 0x2000, 0x2fff);
        scope.add_map_entry(early, ram(0x80), 0, 4, early_limit);
        scope.add_map_entry(late, ram(0x80), 0, 4, late_limit);

        let (_, entry) = scope.find_addr(&ram(0x80), &ram(0x1800)).unwrap();
        assert_eq!(entry.symbol(), early);
        let (_, entry) = scope.find_addr(&ram(0x80), &ram(0x2800)).unwrap();
        assert_eq!(entry.symbol(), late);
        assert!(scope.find_addr(&ram(0x80), &ram(0x3800)).is_none());
        // The invalid use-point matches anything.
        assert!(scope.find_addr(&ram(0x80), &Address::invalid()).is_some());
    }

    #[test]
    fn namespace_mapping() {
        let (mut database, scope_id) = stack_scope();
        let inner = database.add_scope("inner", scope_id);
        database.map_namespace(Range::new(SpaceId::mock_ram(), 0x0, 0xffff), scope_id);
        database.map_namespace(Range::new(SpaceId::mock_ram(), 0x4000, 0x4fff), inner);
        assert_eq!(database.map_scope(&ram(0x4800)), inner);
        assert_eq!(database.map_scope(&ram(0x100)), scope_id);
        assert_eq!(database.map_scope(&ram(0x10_0000)), ScopeId::GLOBAL);
    }
}
