//! Aggregation of varnodes into high-level variables.
//!
//! After the rule engine reaches fixed point, varnodes that represent the
//! same source-level variable are merged into [`HighVariable`]s: first the
//! live-range cover of every varnode is computed, then compatible varnodes
//! are grouped with a union-find structure, and finally each group is linked
//! against the symbol database.

use crate::architecture::Architecture;
use crate::data_flow::{varnode_flags, BlockId, Cover, OpCode, VarnodeId};
use crate::database::SymbolKind;
use crate::datatype::DataType;
use crate::function::FunctionData;
use crate::prelude::*;

use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs the merge phase over one function.
#[derive(Default)]
pub struct Merger {
    ids: Vec<VarnodeId>,
    index_of: BTreeMap<VarnodeId, usize>,
    parent: Vec<usize>,
    /// Aggregate cover per union-find root.
    group_cover: Vec<Cover>,
}

impl Merger {
    /// Returns a fresh merger.
    pub fn new() -> Merger {
        Merger::default()
    }

    /// Computes covers, merges varnodes into high variables, and links
    /// symbols.
    pub fn run(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<(), Error> {
        fd.clear_highs();
        self.collect_candidates(fd);
        self.compute_covers(fd)?;
        self.merge_markers(fd)?;
        self.merge_address_tied(fd);
        self.merge_copies(fd);
        self.build_highs(fd)?;
        self.link_symbols(fd, arch)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Union-find
    // ------------------------------------------------------------------

    fn collect_candidates(&mut self, fd: &FunctionData) {
        self.ids.clear();
        self.index_of.clear();
        for vn in fd.vbank().ids() {
            let v = fd.varnode(vn);
            if v.is_constant() || v.is_annotation() {
                continue;
            }
            if !v.is_written() && !v.is_input() {
                continue;
            }
            self.index_of.insert(vn, self.ids.len());
            self.ids.push(vn);
        }
        self.parent = (0..self.ids.len()).collect();
        self.group_cover = vec![Cover::new(); self.ids.len()];
    }

    fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = index;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Merges the groups of the two varnodes if their data-types are
    /// compatible and the aggregate covers of the groups do not properly
    /// intersect. Touching covers (the copy point of a COPY shadow) are
    /// allowed.
    ///
    /// Returns false iff the merge was refused.
    fn try_union(&mut self, fd: &FunctionData, a: VarnodeId, b: VarnodeId) -> bool {
        let (Some(&ia), Some(&ib)) = (self.index_of.get(&a), self.index_of.get(&b)) else {
            return false;
        };
        let ra = self.find(ia);
        let rb = self.find(ib);
        if ra == rb {
            return true;
        }
        let (va, vb) = (fd.varnode(a), fd.varnode(b));
        if va.size() != vb.size() {
            return false;
        }
        match (va.datatype(), vb.datatype()) {
            (Some(ta), Some(tb)) if ta != tb => return false,
            _ => (),
        }
        // Address-tied varnodes of distinct storage never share a variable.
        if va.has_flag(varnode_flags::ADDRTIED)
            && vb.has_flag(varnode_flags::ADDRTIED)
            && va.addr() != vb.addr()
        {
            return false;
        }
        if self.group_cover[ra].intersect(&self.group_cover[rb]) == 2 {
            return false;
        }
        self.parent[rb] = ra;
        let cover = self.group_cover[rb].clone();
        self.group_cover[ra].merge(&cover);
        true
    }

    // ------------------------------------------------------------------
    // Cover computation
    // ------------------------------------------------------------------

    fn compute_covers(&mut self, fd: &mut FunctionData) -> Result<(), Error> {
        for (index, &vn) in self.ids.iter().enumerate() {
            let cover = Self::build_cover(fd, vn)?;
            self.group_cover[index] = cover.clone();
            fd.varnode_mut(vn).set_cover(Some(cover));
        }
        Ok(())
    }

    /// Builds the live range of one varnode: from its definition to every
    /// read, walking blocks backward from each read until the defining
    /// block.
    fn build_cover(fd: &FunctionData, vn: VarnodeId) -> Result<Cover, Error> {
        let mut cover = Cover::new();
        let v = fd.varnode(vn);
        let def_block = match v.def() {
            Some(def) => {
                let block = fd
                    .op(def)
                    .parent()
                    .ok_or_else(|| anyhow!("cover of varnode defined by dead op"))?;
                cover.add_def_point(block, fd.op(def).order());
                Some(block)
            }
            // Inputs are live from the function entry.
            None => match fd.blocks().entry() {
                Some(entry) => {
                    cover.add_def_point(entry, 0);
                    Some(entry)
                }
                None => None,
            },
        };

        let mut worklist: Vec<(BlockId, u32)> = Vec::new();
        for &reader in v.descendants() {
            if fd.op(reader).is_dead() {
                continue;
            }
            let Some(block) = fd.op(reader).parent() else {
                continue;
            };
            if fd.op(reader).code() == OpCode::MULTIEQUAL {
                // A phi reads its input at the bottom of the corresponding
                // predecessor block.
                for (slot, &input) in fd.op(reader).inputs().iter().enumerate() {
                    if input != vn {
                        continue;
                    }
                    let preds = fd.blocks().block(block).in_edges();
                    if slot < preds.len() {
                        worklist.push((preds[slot], u32::MAX));
                    }
                }
            } else {
                worklist.push((block, fd.op(reader).order()));
            }
        }
        while let Some((block, order)) = worklist.pop() {
            let newly_covered = cover.add_ref_point(block, order);
            if newly_covered && Some(block) != def_block {
                for &pred in fd.blocks().block(block).in_edges() {
                    worklist.push((pred, u32::MAX));
                }
            }
        }
        Ok(cover)
    }

    // ------------------------------------------------------------------
    // Merge passes
    // ------------------------------------------------------------------

    /// Merges the inputs and outputs of MULTIEQUAL and INDIRECT markers.
    ///
    /// These merges are required for a consistent rendering; when the cover
    /// test forbids one, the varnodes stay separate and a warning is
    /// recorded.
    fn merge_markers(&mut self, fd: &mut FunctionData) -> Result<(), Error> {
        for op in fd.obank().alive_ids() {
            let code = fd.op(op).code();
            if !matches!(code, OpCode::MULTIEQUAL | OpCode::INDIRECT) {
                continue;
            }
            let Some(out) = fd.op(op).output() else {
                continue;
            };
            if !self.index_of.contains_key(&out) {
                continue;
            }
            let slots: usize = match code {
                // The guarded-op reference of an INDIRECT is not data.
                OpCode::INDIRECT => 1,
                _ => fd.op(op).num_inputs(),
            };
            for slot in 0..slots {
                let input = fd.op(op).input(slot);
                if !self.index_of.contains_key(&input) {
                    continue;
                }
                if !self.try_union(fd, out, input) {
                    let addr = fd.op(op).seq().addr();
                    fd.warning(
                        "Unable to merge phi-linked variables; they remain distinct",
                        addr,
                    );
                }
            }
        }
        Ok(())
    }

    /// Merges address-tied varnodes occupying the same storage.
    fn merge_address_tied(&mut self, fd: &FunctionData) {
        let mut by_storage: BTreeMap<(crate::address::Address, u32), VarnodeId> = BTreeMap::new();
        for &vn in self.ids.clone().iter() {
            let v = fd.varnode(vn);
            if !v.has_flag(varnode_flags::ADDRTIED) {
                continue;
            }
            let key = (v.addr(), v.size());
            match by_storage.get(&key) {
                Some(&first) => {
                    self.try_union(fd, first, vn);
                }
                None => {
                    by_storage.insert(key, vn);
                }
            }
        }
    }

    /// Speculatively merges across COPY ops whose covers only touch.
    fn merge_copies(&mut self, fd: &FunctionData) {
        for op in fd.obank().alive_ids() {
            if fd.op(op).code() != OpCode::COPY {
                continue;
            }
            let Some(out) = fd.op(op).output() else {
                continue;
            };
            let input = fd.op(op).input(0);
            self.try_union(fd, out, input);
        }
    }

    // ------------------------------------------------------------------
    // High variable construction and symbol linking
    // ------------------------------------------------------------------

    fn build_highs(&mut self, fd: &mut FunctionData) -> Result<(), Error> {
        let mut high_of_root: BTreeMap<usize, crate::data_flow::HighId> = BTreeMap::new();
        for index in 0..self.ids.len() {
            let vn = self.ids[index];
            let root = self.find(index);
            match high_of_root.get(&root) {
                Some(&high) => {
                    fd.high_mut(high).add_member(vn);
                    fd.varnode_mut(vn).set_high(Some(high));
                }
                None => {
                    let high = fd.new_high(vn);
                    high_of_root.insert(root, high);
                }
            }
        }
        // Fill in the aggregate cover and data-type of every group.
        for high_id in high_of_root.values() {
            let members = fd.high(*high_id).members().to_vec();
            let mut cover = Cover::new();
            let mut datatype: Option<Arc<DataType>> = None;
            for &member in members.iter() {
                if let Some(member_cover) = fd.varnode(member).cover() {
                    cover.merge(member_cover);
                }
                if datatype.is_none() {
                    datatype = fd.varnode(member).datatype().cloned();
                }
            }
            let size = fd.varnode(members[0]).size();
            let high = fd.high_mut(*high_id);
            *high.cover_mut() = cover;
            high.set_datatype(datatype.unwrap_or_else(|| DataType::unknown(size)));
        }
        Ok(())
    }

    /// Attaches a symbol to every high variable whose storage resolves in
    /// the symbol database, creating anonymous locals for unclaimed stack
    /// storage.
    fn link_symbols(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<(), Error> {
        for high_index in 0..fd.highs().len() {
            let high_id = crate::data_flow::HighId::from_index(high_index);
            let rep = fd.high(high_id).members()[0];
            let v = fd.varnode(rep);
            let (addr, size) = (v.addr(), v.size());
            let usepoint = v
                .def()
                .map(|def| fd.op(def).seq().addr())
                .unwrap_or_else(crate::address::Address::invalid);

            if let Some((_, entry)) = fd.locals().find_container(&addr, size, &usepoint) {
                let symbol = entry.symbol();
                let offset =
                    entry.offset() + (addr.offset() - entry.addr().unwrap().offset()) as u32;
                let scope_id = fd.locals().id();
                fd.high_mut(high_id).set_symbol(scope_id, symbol, offset);
                for member in fd.high(high_id).members().to_vec() {
                    fd.varnode_mut(member).set_flag(varnode_flags::MAPPED);
                }
                continue;
            }
            // Unclaimed storage in the stack frame gets an anonymous local.
            let kind = arch.manager().space(addr.space()).kind();
            if kind == crate::address::SpaceKind::Stack {
                let name = format!("local_{:x}", addr.offset());
                let symbol = fd.locals_mut().add_symbol(
                    &name,
                    DataType::unknown(size),
                    SymbolKind::Variable,
                );
                fd.locals_mut().add_map_entry(
                    symbol,
                    addr,
                    0,
                    size,
                    crate::address::RangeList::new(),
                );
                let scope_id = fd.locals().id();
                fd.high_mut(high_id).set_symbol(scope_id, symbol, 0);
                for member in fd.high(high_id).members().to_vec() {
                    fd.varnode_mut(member).set_flag(varnode_flags::MAPPED);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddrSpaceManager, SpaceId};

    /// Two stack writes in separate branches merging at a phi: all three
    /// varnodes should end up in one high variable bound to one anonymous
    /// stack symbol.
    #[test]
    fn phi_members_share_a_high() {
        let manager = AddrSpaceManager::mock();
        let arch = Architecture::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let b0 = fd.blocks_mut().new_block(pc);
        let b1 = fd.blocks_mut().new_block(pc.add_wrap(4));
        let b2 = fd.blocks_mut().new_block(pc.add_wrap(8));
        let b3 = fd.blocks_mut().new_block(pc.add_wrap(12));
        fd.blocks_mut().add_edge(b0, b1);
        fd.blocks_mut().add_edge(b0, b2);
        fd.blocks_mut().add_edge(b1, b3);
        fd.blocks_mut().add_edge(b2, b3);
        fd.blocks_mut().set_entry(b0);

        let slot = Address::new(SpaceId::mock_stack(), 0x8);
        let c1 = fd.new_constant(4, 1);
        let w1 = fd.new_op(pc.add_wrap(4), OpCode::COPY);
        fd.op_set_input(w1, c1, 0);
        let v1 = fd.new_varnode_out(4, slot, w1).unwrap();
        fd.op_insert_end(w1, b1);

        let c2 = fd.new_constant(4, 2);
        let w2 = fd.new_op(pc.add_wrap(8), OpCode::COPY);
        fd.op_set_input(w2, c2, 0);
        let v2 = fd.new_varnode_out(4, slot, w2).unwrap();
        fd.op_insert_end(w2, b2);

        let phi = fd.new_op(pc.add_wrap(12), OpCode::MULTIEQUAL);
        fd.op_set_input(phi, v1, 0);
        fd.op_set_input(phi, v2, 1);
        let merged = fd.new_varnode_out(4, slot, phi).unwrap();
        fd.op_insert_begin(phi, b3);

        // A read keeps the phi output alive.
        let user = fd.new_op(pc.add_wrap(12), OpCode::INT_2COMP);
        fd.op_set_input(user, merged, 0);
        fd.new_unique_out(4, user).unwrap();
        fd.op_insert_end(user, b3);

        Merger::new().run(&mut fd, &arch).unwrap();
        let high = fd.varnode(merged).high().unwrap();
        assert_eq!(fd.varnode(v1).high(), Some(high));
        assert_eq!(fd.varnode(v2).high(), Some(high));
        // The stack slot got an anonymous local symbol.
        let (scope, symbol) = fd.high(high).symbol().unwrap();
        assert_eq!(scope, fd.locals().id());
        assert!(fd.locals().symbol(symbol).name().starts_with("local_"));
    }

    /// Intersecting covers refuse to merge and leave a warning.
    #[test]
    fn intersecting_covers_stay_separate() {
        let manager = AddrSpaceManager::mock();
        let arch = Architecture::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        let blk = fd.blocks_mut().new_block(pc);
        fd.blocks_mut().set_entry(blk);

        let r0 = Address::new(SpaceId::mock_register(), 0x0);
        let r8 = Address::new(SpaceId::mock_register(), 0x8);
        // a = input; b = -a; phi-like INDIRECT tie where a stays live past b.
        let a = fd.new_varnode(4, r0);
        let a = fd.set_input_varnode(a).unwrap();
        let neg = fd.new_op(pc, OpCode::INT_2COMP);
        fd.op_set_input(neg, a, 0);
        let b = fd.new_varnode_out(4, r8, neg).unwrap();
        fd.op_insert_end(neg, blk);
        // Both values are read afterwards, so their covers overlap.
        let use_a = fd.new_op(pc, OpCode::INT_ADD);
        fd.op_set_input(use_a, a, 0);
        fd.op_set_input(use_a, b, 1);
        fd.new_unique_out(4, use_a).unwrap();
        fd.op_insert_end(use_a, blk);

        let phi = fd.new_op(pc, OpCode::MULTIEQUAL);
        fd.op_set_input(phi, a, 0);
        fd.op_set_input(phi, b, 1);
        fd.new_varnode_out(4, r0, phi).unwrap();
        fd.op_insert_begin(phi, blk);

        Merger::new().run(&mut fd, &arch).unwrap();
        assert_ne!(fd.varnode(a).high(), fd.varnode(b).high());
        assert!(!fd.warnings().is_empty());
    }
}
