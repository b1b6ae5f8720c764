//! The spatial index from storage ranges to symbol entries.

use crate::address::Address;
use crate::prelude::*;

use std::collections::BTreeMap;

use super::symbol::{EntryId, SymbolEntry};

/// Sort key of an entry within one address space.
///
/// Primary order is by (first offset, last offset). The secondary key is the
/// first offset of the uselimit, which disambiguates multiple symbols
/// occupying the same storage at different code points. The trailing entry id
/// keeps keys unique.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
struct EntryKey {
    first: u64,
    last: u64,
    use_first: u64,
    entry: EntryId,
}

/// A range map over the static symbol entries of one address space.
///
/// Supports the spatial queries of the symbol database: exact address match,
/// smallest container, best fit, overlap, and address-order neighbors. All
/// queries honor the uselimit of the entries.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EntryMap {
    tree: BTreeMap<EntryKey, ()>,
    /// Largest entry size seen, bounding the backward scan of the queries.
    max_size: u64,
}

impl EntryMap {
    /// Returns an empty map.
    pub fn new() -> EntryMap {
        EntryMap::default()
    }

    fn key(entry_id: EntryId, entry: &SymbolEntry) -> EntryKey {
        let addr = entry
            .addr()
            .expect("only static entries are spatially indexed");
        let use_first = entry
            .uselimit()
            .iter()
            .next()
            .map(|range| range.first())
            .unwrap_or(0);
        EntryKey {
            first: addr.offset(),
            last: addr.offset() + (entry.size() as u64 - 1),
            use_first,
            entry: entry_id,
        }
    }

    /// Inserts a static entry into the map.
    pub fn insert(&mut self, entry_id: EntryId, entry: &SymbolEntry) {
        self.tree.insert(Self::key(entry_id, entry), ());
        self.max_size = self.max_size.max(entry.size() as u64);
    }

    /// Removes a static entry from the map.
    pub fn remove(&mut self, entry_id: EntryId, entry: &SymbolEntry) {
        self.tree.remove(&Self::key(entry_id, entry));
    }

    /// Returns the number of indexed entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Returns true iff the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Returns an iterator over all entry ids in address order.
    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.tree.keys().map(|key| key.entry)
    }

    /// Finds an entry whose storage starts exactly at the given address and
    /// whose uselimit admits the use-point.
    pub fn find_addr<'a>(
        &self,
        addr: &Address,
        usepoint: &Address,
        entries: &'a [SymbolEntry],
    ) -> Option<(EntryId, &'a SymbolEntry)> {
        let lower = EntryKey {
            first: addr.offset(),
            last: 0,
            use_first: 0,
            entry: EntryId(0),
        };
        for key in self.tree.range(lower..).map(|(key, ())| key) {
            if key.first != addr.offset() {
                break;
            }
            let entry = &entries[key.entry.index()];
            if entry.admits(usepoint) {
                return Some((key.entry, entry));
            }
        }
        None
    }

    /// Finds the smallest entry whose storage contains `[addr, addr + size)`
    /// and whose uselimit admits the use-point.
    pub fn find_container<'a>(
        &self,
        addr: &Address,
        size: u32,
        usepoint: &Address,
        entries: &'a [SymbolEntry],
    ) -> Option<(EntryId, &'a SymbolEntry)> {
        let need_last = addr.offset() + (size as u64 - 1);
        let mut best: Option<(EntryId, &SymbolEntry)> = None;
        for key in self.candidates(addr.offset()) {
            if key.first <= addr.offset() && need_last <= key.last {
                let entry = &entries[key.entry.index()];
                if !entry.admits(usepoint) {
                    continue;
                }
                match best {
                    Some((_, prev)) if prev.size() <= entry.size() => (),
                    _ => best = Some((key.entry, entry)),
                }
            }
        }
        best
    }

    /// Finds the entry whose storage range best approximates
    /// `[addr, addr + size)`: the containing entry minimizing the excess
    /// bytes around the requested range.
    pub fn find_closest_fit<'a>(
        &self,
        addr: &Address,
        size: u32,
        usepoint: &Address,
        entries: &'a [SymbolEntry],
    ) -> Option<(EntryId, &'a SymbolEntry)> {
        let need_last = addr.offset() + (size as u64 - 1);
        let mut best: Option<(u64, EntryId, &SymbolEntry)> = None;
        for key in self.candidates(addr.offset()) {
            if key.first <= addr.offset() && need_last <= key.last {
                let entry = &entries[key.entry.index()];
                if !entry.admits(usepoint) {
                    continue;
                }
                let excess = (addr.offset() - key.first) + (key.last - need_last);
                match best {
                    Some((prev_excess, ..)) if prev_excess <= excess => (),
                    _ => best = Some((excess, key.entry, entry)),
                }
            }
        }
        best.map(|(_, id, entry)| (id, entry))
    }

    /// Finds any entry whose storage overlaps `[addr, addr + size)`.
    pub fn find_overlap<'a>(
        &self,
        addr: &Address,
        size: u32,
        entries: &'a [SymbolEntry],
    ) -> Option<(EntryId, &'a SymbolEntry)> {
        let last = addr.offset() + (size as u64 - 1);
        for key in self.candidates(last) {
            if key.first <= last && addr.offset() <= key.last {
                return Some((key.entry, &entries[key.entry.index()]));
            }
        }
        None
    }

    /// Finds the entry starting closest before the given address.
    pub fn find_before<'a>(
        &self,
        addr: &Address,
        entries: &'a [SymbolEntry],
    ) -> Option<(EntryId, &'a SymbolEntry)> {
        let upper = EntryKey {
            first: addr.offset(),
            last: 0,
            use_first: 0,
            entry: EntryId(0),
        };
        self.tree
            .range(..upper)
            .next_back()
            .map(|(key, ())| (key.entry, &entries[key.entry.index()]))
    }

    /// Finds the entry starting closest after the given address.
    pub fn find_after<'a>(
        &self,
        addr: &Address,
        entries: &'a [SymbolEntry],
    ) -> Option<(EntryId, &'a SymbolEntry)> {
        let lower = EntryKey {
            first: addr.offset() + 1,
            last: 0,
            use_first: 0,
            entry: EntryId(0),
        };
        self.tree
            .range(lower..)
            .next()
            .map(|(key, ())| (key.entry, &entries[key.entry.index()]))
    }

    /// Returns the keys that can possibly contain or overlap a range ending
    /// at or after `offset`, using the maximum entry size as the scan bound.
    fn candidates(&self, offset: u64) -> impl Iterator<Item = EntryKey> + '_ {
        let lower = EntryKey {
            first: offset.saturating_sub(self.max_size.saturating_sub(1)),
            last: 0,
            use_first: 0,
            entry: EntryId(0),
        };
        let upper = EntryKey {
            first: offset,
            last: u64::MAX,
            use_first: u64::MAX,
            entry: EntryId(u32::MAX),
        };
        self.tree.range(lower..=upper).map(|(key, ())| *key)
    }
}
