//! Construction of Static Single Assignment form.
//!
//! The [`Heritage`] object links the free varnodes of a function into the
//! formal data-flow graph, one *pass* at a time. Passes exist because some
//! storage only becomes visible after earlier passes propagate values:
//! register data-flow is analyzed first, stack locations are discovered and
//! promoted in a later pass (see the per-space `delay`).
//!
//! Phi-node placement uses the augmented dominator tree of Bilardi and
//! Pingali ("The Static Single Assignment Form and its Computation", 1999);
//! renaming is the classical algorithm of Cytron, Ferrante, Rosen, Wegman
//! and Zadeck (TOPLAS 13(4), 1991).

use crate::address::{Address, AddrSpaceManager, SpaceId, SpaceKind};
use crate::architecture::Architecture;
use crate::data_flow::{varnode_flags, BlockId, OpCode, OpId, VarnodeId};
use crate::function::{EffectType, FunctionData};
use crate::prelude::*;

use std::collections::BTreeMap;

/// Extent and pass number of a heritaged address range.
#[derive(Debug, Clone, Copy)]
struct SizePass {
    size: u64,
    pass: i32,
}

/// Result codes of [`LocationMap::add`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Intersect {
    /// The range is new, or only intersects ranges from the current pass.
    New,
    /// The range partially overlaps a range from a previous pass.
    Partial,
    /// The range is completely contained in a range from a previous pass.
    Contained,
}

/// Map tracking which address ranges have been heritaged and in which pass.
#[derive(Debug, Clone, Default)]
pub struct LocationMap {
    map: BTreeMap<Address, SizePass>,
}

impl LocationMap {
    /// Marks a new range as heritaged, merging it with overlapping ranges.
    ///
    /// Returns the enclosing disjoint range after merging together with the
    /// intersection code against ranges of earlier passes.
    pub fn add(&mut self, mut addr: Address, mut size: u64, pass: i32) -> (Address, u64, Intersect) {
        let mut intersect = Intersect::New;

        // Find the first entry at or before the new range that could touch it.
        let prev = self
            .map
            .range(..=addr)
            .next_back()
            .map(|(a, sp)| (*a, *sp))
            .filter(|(a, sp)| addr.overlap(0, a, sp.size).is_some());
        if let Some((a, sp)) = prev {
            if let Some(whereat) = addr.overlap(0, &a, sp.size) {
                if whereat + size <= sp.size {
                    // Completely contained in the previous element.
                    if sp.pass < pass {
                        intersect = Intersect::Contained;
                    }
                    return (a, sp.size, intersect);
                }
                addr = a;
                size += whereat;
                if sp.pass < pass {
                    intersect = Intersect::Partial;
                }
                self.map.remove(&a);
            }
        }
        // Swallow all following entries that the grown range overlaps.
        loop {
            let next = self
                .map
                .range(addr..)
                .next()
                .map(|(a, sp)| (*a, *sp))
                .filter(|(a, _)| a.overlap(0, &addr, size).is_some());
            let Some((a, sp)) = next else { break };
            let whereat = a.overlap(0, &addr, size).unwrap();
            if whereat + sp.size > size {
                size = whereat + sp.size;
            }
            if sp.pass < pass {
                intersect = Intersect::Partial;
            }
            self.map.remove(&a);
        }
        self.map.insert(addr, SizePass { size, pass });
        (addr, size, intersect)
    }

    /// Returns the pass in which the given address was heritaged, if it was.
    pub fn find_pass(&self, addr: Address) -> Option<i32> {
        self.map
            .range(..=addr)
            .next_back()
            .filter(|(a, sp)| addr.overlap(0, a, sp.size).is_some())
            .map(|(_, sp)| sp.pass)
    }

    /// Returns the disjoint ranges in address order.
    pub fn ranges(&self) -> Vec<(Address, u64)> {
        self.map.iter().map(|(a, sp)| (*a, sp.size)).collect()
    }

    /// Clears the map.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Work-list for the phi-node placement algorithm: a stack per dominator
/// depth, serviced in non-increasing depth order.
#[derive(Debug, Default)]
struct PriorityQueue {
    queue: Vec<Vec<BlockId>>,
    curdepth: i32,
}

impl PriorityQueue {
    fn reset(&mut self, maxdepth: i32) {
        self.queue.clear();
        self.queue.resize((maxdepth + 1) as usize, Vec::new());
        self.curdepth = -1;
    }

    fn insert(&mut self, bl: BlockId, depth: i32) {
        self.queue[depth as usize].push(bl);
        if depth > self.curdepth {
            self.curdepth = depth;
        }
    }

    fn extract(&mut self) -> BlockId {
        let res = self.queue[self.curdepth as usize].pop().unwrap();
        while self.curdepth >= 0 && self.queue[self.curdepth as usize].is_empty() {
            self.curdepth -= 1;
        }
        res
    }

    fn is_empty(&self) -> bool {
        self.curdepth == -1
    }
}

/// Heritage status of one address space.
#[derive(Debug, Clone)]
struct HeritageInfo {
    /// Passes to wait before heritaging the space.
    delay: i32,
    /// Passes to wait before removing dead varnodes of the space.
    deadcode_delay: i32,
    /// Dead varnodes of this space have been eliminated.
    dead_removed: bool,
    /// A warning about late discoveries has been issued.
    warning_issued: bool,
    /// The space takes part in SSA construction at all.
    heritaged: bool,
    /// The space kind, cached for guard decisions.
    kind: SpaceKind,
    big_endian: bool,
    addr_size: u32,
}

/// Block flags of the augmented dominator tree.
const BOUNDARY_NODE: u32 = 1;
const MARK_NODE: u32 = 2;
const MERGED_NODE: u32 = 4;

/// The stack system of the renaming algorithm: every disjoint address range
/// (indexed by its initial address) maps to its own varnode stack.
type VariableStack = BTreeMap<Address, Vec<VarnodeId>>;

/// Manages SSA construction for one function.
pub struct Heritage {
    /// Disjoint cover of every range heritaged so far.
    global_disjoint: LocationMap,
    /// Disjoint cover of the ranges being heritaged this pass.
    disjoint: LocationMap,
    /// Per-space status, indexed by space id.
    infolist: Vec<HeritageInfo>,
    /// The current pass number.
    pass: i32,
    /// Augmented edges per block.
    augment: Vec<Vec<BlockId>>,
    /// ADT flags per block.
    flags: Vec<u32>,
    /// Dominator tree children per block.
    domchild: Vec<Vec<BlockId>>,
    /// Immediate dominator per block.
    idom: Vec<Option<BlockId>>,
    /// Dominator depth per block.
    depth: Vec<i32>,
    /// Dominator-tree preorder position per block.
    pre: Vec<usize>,
    /// Maximum dominator depth, or -1 if a restructure is needed.
    maxdepth: i32,
    pq: PriorityQueue,
    /// Blocks that should receive a MULTIEQUAL this round.
    merge: Vec<BlockId>,
    join_space: Option<SpaceId>,
}

impl Heritage {
    /// Returns a fresh heritage manager over the given space set.
    pub fn new(manager: &AddrSpaceManager) -> Heritage {
        let infolist = manager
            .iter()
            .map(|spc| HeritageInfo {
                delay: spc.delay() as i32,
                deadcode_delay: spc.deadcode_delay() as i32,
                dead_removed: false,
                warning_issued: false,
                heritaged: spc.is_heritaged(),
                kind: spc.kind(),
                big_endian: spc.is_big_endian(),
                addr_size: spc.addr_size(),
            })
            .collect();
        Heritage {
            global_disjoint: LocationMap::default(),
            disjoint: LocationMap::default(),
            infolist,
            pass: 0,
            augment: Vec::new(),
            flags: Vec::new(),
            domchild: Vec::new(),
            idom: Vec::new(),
            depth: Vec::new(),
            pre: Vec::new(),
            maxdepth: -1,
            pq: PriorityQueue::default(),
            merge: Vec::new(),
            join_space: manager.join_space(),
        }
    }

    /// Returns an empty placeholder, used to temporarily replace the
    /// heritage state while a pass borrows the function context.
    pub(crate) fn placeholder() -> Heritage {
        Heritage {
            global_disjoint: LocationMap::default(),
            disjoint: LocationMap::default(),
            infolist: Vec::new(),
            pass: 0,
            augment: Vec::new(),
            flags: Vec::new(),
            domchild: Vec::new(),
            idom: Vec::new(),
            depth: Vec::new(),
            pre: Vec::new(),
            maxdepth: -1,
            pq: PriorityQueue::default(),
            merge: Vec::new(),
            join_space: None,
        }
    }

    /// Returns the number of completed passes.
    pub fn pass(&self) -> i32 {
        self.pass
    }

    /// Returns the pass in which the given address was heritaged, if any.
    pub fn heritage_pass_of(&self, addr: Address) -> Option<i32> {
        self.global_disjoint.find_pass(addr)
    }

    /// Forces regeneration of the dominator structures on the next pass.
    pub fn force_restructure(&mut self) {
        self.maxdepth = -1;
    }

    /// Resets all heritage state for a fresh analysis of the function.
    pub fn clear(&mut self) {
        self.global_disjoint.clear();
        self.disjoint.clear();
        self.pass = 0;
        self.maxdepth = -1;
        for info in self.infolist.iter_mut() {
            info.dead_removed = false;
            info.warning_issued = false;
        }
    }

    /// Returns true iff dead code in the given space may be removed this
    /// pass.
    pub fn dead_removal_allowed(&self, space: SpaceId) -> bool {
        let info = &self.infolist[space.index()];
        info.heritaged && self.pass > info.deadcode_delay
    }

    /// Like [`dead_removal_allowed`](Self::dead_removal_allowed), but also
    /// records that removal has happened.
    pub fn dead_removal_allowed_seen(&mut self, space: SpaceId) -> bool {
        let allowed = self.dead_removal_allowed(space);
        if allowed {
            self.infolist[space.index()].dead_removed = true;
        }
        allowed
    }

    /// Sets the dead code removal delay for the given space.
    pub fn set_deadcode_delay(&mut self, space: SpaceId, delay: i32) {
        self.infolist[space.index()].deadcode_delay = delay;
    }

    /// Delays dead code removal of the space holding the given varnode and
    /// requests a pipeline restart.
    ///
    /// Used when a live read is discovered in a space whose dead code was
    /// already removed.
    fn bump_deadcode_delay(&mut self, fd: &mut FunctionData, vn: VarnodeId) {
        let space = fd.varnode(vn).addr().space();
        let info = &mut self.infolist[space.index()];
        if !matches!(info.kind, SpaceKind::Register | SpaceKind::Stack | SpaceKind::Ram) {
            return;
        }
        if info.deadcode_delay != info.delay {
            // A delay has already been installed once.
            return;
        }
        info.deadcode_delay += 1;
        fd.set_restart_pending(true);
    }

    // ------------------------------------------------------------------
    // Pass driver
    // ------------------------------------------------------------------

    /// Performs one pass of SSA construction.
    ///
    /// Free varnodes of every eligible address space are collected, guarded,
    /// and linked into the data-flow with phi nodes and renaming.
    pub fn heritage(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<(), Error> {
        if fd.blocks().is_empty() {
            self.pass += 1;
            return Ok(());
        }
        if self.maxdepth == -1 {
            self.build_adt(fd)?;
        }
        self.process_joins(fd, arch.manager())?;

        for space_index in 0..self.infolist.len() {
            let space = SpaceId::from_index(space_index);
            let info = &self.infolist[space_index];
            if !info.heritaged {
                continue;
            }
            if self.pass < info.delay {
                continue;
            }
            let mut needwarning = false;
            let mut warnvn: Option<VarnodeId> = None;

            for vn in fd.vbank().ids_in_space(space) {
                let v = fd.varnode(vn);
                if !v.is_written()
                    && v.has_no_descend()
                    && !v.has_flag(varnode_flags::UNAFFECTED)
                    && !v.is_input()
                {
                    continue;
                }
                if v.has_flag(varnode_flags::WRITEMASK) {
                    continue;
                }
                let addr = v.addr();
                let size = v.size() as u64;
                if matches!(
                    self.infolist[space_index].kind,
                    SpaceKind::Ram | SpaceKind::Stack
                ) {
                    fd.varnode_mut(vn).set_flag(varnode_flags::ADDRTIED);
                }
                let (gaddr, gsize, intersect) = self.global_disjoint.add(addr, size, self.pass);
                match intersect {
                    Intersect::New => {
                        self.disjoint.add(gaddr, gsize, self.pass);
                    }
                    Intersect::Contained => {
                        let v = fd.varnode(vn);
                        if v.is_heritage_known() || v.has_no_descend() {
                            continue;
                        }
                        if !needwarning && self.infolist[space_index].dead_removed {
                            needwarning = true;
                            self.bump_deadcode_delay(fd, vn);
                            warnvn = Some(vn);
                        }
                        self.disjoint.add(gaddr, gsize, self.pass);
                    }
                    Intersect::Partial => {
                        let v = fd.varnode(vn);
                        if !needwarning && self.infolist[space_index].dead_removed {
                            if v.is_heritage_known() {
                                continue;
                            }
                            needwarning = true;
                            self.bump_deadcode_delay(fd, vn);
                            warnvn = Some(vn);
                        }
                        self.disjoint.add(gaddr, gsize, self.pass);
                    }
                }
            }

            if needwarning && !self.infolist[space_index].warning_issued {
                self.infolist[space_index].warning_issued = true;
                if let Some(warnvn) = warnvn {
                    let addr = fd.varnode(warnvn).addr();
                    fd.warning(
                        "Heritage of dead storage after dead code removal; \
                         treating the new read as an input",
                        addr,
                    );
                }
            }
        }

        self.place_multiequals(fd, arch)?;
        self.rename(fd)?;
        self.pass += 1;
        log::debug!(
            "heritage pass {} of {} done: {} varnodes, {} alive ops",
            self.pass,
            fd.name(),
            fd.vbank().len(),
            fd.obank().num_alive()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Augmented dominator tree
    // ------------------------------------------------------------------

    /// Builds the augmented dominator tree for phi-node placement.
    fn build_adt(&mut self, fd: &mut FunctionData) -> Result<(), Error> {
        let dom = fd.blocks().build_dom_tree()?;
        let size = fd.blocks().num_blocks();

        self.augment.clear();
        self.augment.resize(size, Vec::new());
        self.flags.clear();
        self.flags.resize(size, 0);
        self.domchild = dom.children.clone();
        self.idom = dom.idom.clone();
        self.depth = dom.depth.clone();
        self.maxdepth = dom.max_depth;

        // Dominator-tree preorder, giving a total order on every ancestor
        // chain.
        let mut pre = vec![usize::MAX; size];
        let mut preorder: Vec<BlockId> = Vec::with_capacity(size);
        let mut stack = vec![dom.entry];
        while let Some(block) = stack.pop() {
            pre[block.index()] = preorder.len();
            preorder.push(block);
            for &child in self.domchild[block.index()].iter().rev() {
                stack.push(child);
            }
        }
        self.pre = pre;

        // Collect the up-edges: CFG edges u -> v where u is not idom(v).
        let mut upstart: Vec<BlockId> = Vec::new();
        let mut upend: Vec<BlockId> = Vec::new();
        let mut b = vec![0i64; size];
        let mut t = vec![0i64; size];
        for block in fd.blocks().iter() {
            let v = block.id();
            let Some(parent) = self.idom[v.index()] else {
                continue;
            };
            for &u in block.in_edges() {
                if u != parent {
                    upstart.push(u);
                    upend.push(v);
                    b[u.index()] += 1;
                    t[parent.index()] += 1;
                }
            }
        }

        // Bottom-up over the dominator tree: decide the boundary nodes.
        let mut a = vec![0i64; size];
        let mut z = vec![0i64; size];
        for &block in preorder.iter().rev() {
            let i = block.index();
            let mut k = 0;
            let mut l = 0;
            for child in self.domchild[i].iter() {
                k += a[child.index()];
                l += z[child.index()];
            }
            a[i] = b[i] - t[i] + k;
            z[i] = 1 + l;
            if self.domchild[i].is_empty() || z[i] > a[i] + 1 {
                self.flags[i] |= BOUNDARY_NODE;
                z[i] = 1;
            }
        }

        // Top-down: z becomes the nearest boundary ancestor (as a preorder
        // position), -1 for none.
        let mut boundary_anc = vec![-1i64; size];
        for &block in preorder.iter() {
            let i = block.index();
            let Some(parent) = self.idom[i] else {
                continue;
            };
            let j = parent.index();
            boundary_anc[i] = if self.flags[j] & BOUNDARY_NODE != 0 {
                self.pre[j] as i64
            } else {
                boundary_anc[j]
            };
        }

        // Attach each up-edge to the augmented lists of the dominator
        // ancestors of its start, down to idom(v).
        for (i, &u) in upstart.iter().enumerate() {
            let v = upend[i];
            let parent = self.idom[v.index()].expect("up-edge into entry block");
            let j = self.pre[parent.index()] as i64;
            let mut k = self.pre[u.index()] as i64;
            while j < k {
                let block = preorder[k as usize];
                self.augment[block.index()].push(v);
                k = boundary_anc[block.index()];
            }
        }
        Ok(())
    }

    /// Walks the dominance tree from a given block, collecting the children
    /// in its dominance frontier into the merge list.
    fn visit_incr(&mut self, qnode: BlockId, vnode: BlockId) {
        let i = vnode.index();
        let j = self.pre[qnode.index()];
        for v in self.augment[i].clone() {
            let vdom = self.idom[v.index()].expect("augmented edge into entry");
            if self.pre[vdom.index()] < j {
                let k = v.index();
                if self.flags[k] & MERGED_NODE == 0 {
                    self.merge.push(v);
                    self.flags[k] |= MERGED_NODE;
                }
                if self.flags[k] & MARK_NODE == 0 {
                    self.flags[k] |= MARK_NODE;
                    self.pq.insert(v, self.depth[k]);
                }
            }
        }
        if self.flags[i] & BOUNDARY_NODE == 0 {
            for child in self.domchild[i].clone() {
                if self.flags[child.index()] & MARK_NODE == 0 {
                    self.visit_incr(qnode, child);
                }
            }
        }
    }

    /// Computes the blocks that need a MULTIEQUAL for one address range,
    /// given the list of written varnodes of the range.
    fn calc_multiequals(&mut self, fd: &FunctionData, write: &[VarnodeId]) {
        self.pq.reset(self.maxdepth);
        self.merge.clear();

        for &vn in write.iter() {
            let def = fd.varnode(vn).def().expect("write list entry without def");
            let bl = fd.op(def).parent().expect("defining op outside any block");
            let j = bl.index();
            if self.flags[j] & MARK_NODE != 0 {
                continue;
            }
            self.pq.insert(bl, self.depth[j]);
            self.flags[j] |= MARK_NODE;
        }
        let entry = fd.blocks().entry().expect("phi placement without entry");
        if self.flags[entry.index()] & MARK_NODE == 0 {
            self.pq.insert(entry, self.depth[entry.index()]);
            self.flags[entry.index()] |= MARK_NODE;
        }

        while !self.pq.is_empty() {
            let bl = self.pq.extract();
            self.visit_incr(bl, bl);
        }
        // The augmented tree is rooted at the entry, so a back edge into the
        // entry itself (a function looping to its own first instruction) is
        // invisible to the walk. Such an entry is its own merge point.
        if fd.blocks().block(entry).num_in() > 0
            && self.flags[entry.index()] & MERGED_NODE == 0
        {
            self.merge.push(entry);
        }
        for flag in self.flags.iter_mut() {
            *flag &= !(MARK_NODE | MERGED_NODE);
        }
    }

    // ------------------------------------------------------------------
    // Collection and guards
    // ------------------------------------------------------------------

    /// Collects the free reads, writes and inputs in the given range.
    ///
    /// Returns the maximum size of a write.
    fn collect(
        &self,
        fd: &FunctionData,
        addr: Address,
        size: u64,
    ) -> (Vec<VarnodeId>, Vec<VarnodeId>, Vec<VarnodeId>, u64) {
        let mut read = Vec::new();
        let mut write = Vec::new();
        let mut input = Vec::new();
        let mut maxsize = 0;
        for vn in fd.vbank().ids_in_range(addr, size) {
            let v = fd.varnode(vn);
            if v.has_flag(varnode_flags::WRITEMASK) {
                continue;
            }
            if v.is_written() {
                maxsize = maxsize.max(v.size() as u64);
                write.push(vn);
            } else if !v.is_heritage_known() && !v.has_no_descend() {
                read.push(vn);
            } else if v.is_input() {
                input.push(vn);
            }
        }
        (read, write, input, maxsize)
    }

    /// Queries the boolean storage properties of a range.
    fn range_properties(&self, arch: &Architecture, addr: Address, size: u64) -> u32 {
        let mut flags = arch.database().properties.query(&addr, size);
        let info = &self.infolist[addr.space().index()];
        if matches!(info.kind, SpaceKind::Ram) {
            flags |= range_flags::PERSIST;
        }
        if matches!(info.kind, SpaceKind::Ram | SpaceKind::Stack) {
            flags |= range_flags::ADDRTIED;
        }
        flags
    }

    /// Normalizes sizes and makes indirect data-flow explicit for one range,
    /// so that phi placement and renaming can assume uniform varnodes.
    fn guard(
        &mut self,
        fd: &mut FunctionData,
        arch: &Architecture,
        addr: Address,
        size: u64,
        read: &mut Vec<VarnodeId>,
        write: &mut Vec<VarnodeId>,
        input: &[VarnodeId],
    ) -> Result<(), Error> {
        let mut guardneeded = true;

        for vn in read.iter_mut() {
            if (fd.varnode(*vn).size() as u64) < size {
                *vn = self.normalize_read_size(fd, *vn, addr, size)?;
            }
            fd.varnode_mut(*vn).set_flag(varnode_flags::ACTIVE_HERITAGE);
        }
        for vn in write.iter_mut() {
            if (fd.varnode(*vn).size() as u64) < size {
                *vn = self.normalize_write_size(fd, *vn, addr, size)?;
            }
            fd.varnode_mut(*vn).set_flag(varnode_flags::ACTIVE_HERITAGE);
            let v = fd.varnode(*vn);
            if v.has_flag(varnode_flags::ADDRFORCE) {
                guardneeded = false;
            } else if let Some(def) = v.def() {
                if fd.op(def).code() == OpCode::INDIRECT {
                    // Evidence of a previous guard. Multiple INDIRECT guards
                    // for one address confuse the renaming algorithm.
                    guardneeded = false;
                }
            }
        }

        if read.is_empty() && write.is_empty() && input.is_empty() {
            return Ok(());
        }
        if guardneeded {
            let flags = self.range_properties(arch, addr, size);
            self.guard_calls(fd, flags, addr, size, write)?;
            self.guard_returns(fd, flags, addr, size)?;
            if matches!(
                self.infolist[addr.space().index()].kind,
                SpaceKind::Ram | SpaceKind::Stack
            ) {
                self.guard_stores(fd, addr, size, write)?;
            }
        }
        Ok(())
    }

    /// Makes data-flow across call sites explicit for one range.
    fn guard_calls(
        &mut self,
        fd: &mut FunctionData,
        flags: u32,
        addr: Address,
        size: u64,
        write: &mut Vec<VarnodeId>,
    ) -> Result<(), Error> {
        let holdind = flags & range_flags::ADDRTIED != 0;
        for i in 0..fd.num_calls() {
            let call_op = fd.call_spec(i).op();
            if fd.op(call_op).is_dead() {
                continue;
            }
            if let Some(out) = fd.op(call_op).output() {
                let v = fd.varnode(out);
                if v.addr() == addr && v.size() as u64 == size {
                    continue;
                }
            }
            let mut effecttype = fd.call_spec(i).effect_for(&addr, size as u32);
            let mut possibleoutput = false;
            if fd.call_spec(i).active_output.is_active()
                && fd.call_spec(i).proto.possible_output_param(&addr, size as u32)
            {
                let active = &mut fd.call_spec_mut(i).active_output;
                if active.which_trial(&addr, size as u32).is_none() {
                    active.register_trial(addr, size as u32);
                    // A potential output is always killed by the call.
                    effecttype = EffectType::KilledByCall;
                    possibleoutput = true;
                }
            }
            if fd.call_spec(i).active_input.is_active()
                && fd.call_spec(i).proto.possible_input_param(&addr, size as u32)
            {
                let active = &mut fd.call_spec_mut(i).active_input;
                if active.which_trial(&addr, size as u32).is_none() {
                    active.register_trial(addr, size as u32);
                    let vn = fd.new_varnode(size as u32, addr);
                    fd.varnode_mut(vn).set_flag(varnode_flags::ACTIVE_HERITAGE);
                    let slot = fd.op(call_op).num_inputs();
                    fd.op_set_input(call_op, vn, slot);
                }
            }
            match effecttype {
                EffectType::Unknown | EffectType::ReturnAddress => {
                    let indop = fd.new_indirect_op(call_op, addr, size as u32)?;
                    let invn = fd.op(indop).input(0);
                    fd.varnode_mut(invn).set_flag(varnode_flags::ACTIVE_HERITAGE);
                    let out = fd.op(indop).output().unwrap();
                    fd.varnode_mut(out).set_flag(varnode_flags::ACTIVE_HERITAGE);
                    if holdind {
                        fd.varnode_mut(out).set_flag(varnode_flags::ADDRFORCE);
                    }
                    if effecttype == EffectType::ReturnAddress {
                        fd.varnode_mut(out).set_flag(varnode_flags::RETURN_ADDRESS);
                    }
                    write.push(out);
                }
                EffectType::KilledByCall => {
                    let indop = fd.new_indirect_creation(call_op, addr, size as u32, possibleoutput)?;
                    let out = fd.op(indop).output().unwrap();
                    fd.varnode_mut(out).set_flag(varnode_flags::ACTIVE_HERITAGE);
                    write.push(out);
                }
                EffectType::Unaffected => (),
            }
        }
        Ok(())
    }

    /// Makes data-flow across STORE ops explicit for one range.
    fn guard_stores(
        &mut self,
        fd: &mut FunctionData,
        addr: Address,
        size: u64,
        write: &mut Vec<VarnodeId>,
    ) -> Result<(), Error> {
        for op in fd.obank().alive_ids_by_code(OpCode::STORE) {
            if fd.op(op).is_dead() {
                continue;
            }
            // The first input of a STORE encodes the space being written.
            let space_vn = fd.op(op).input(0);
            let target_space = SpaceId::from_index(fd.varnode(space_vn).constant_value() as usize);
            if target_space != addr.space() {
                continue;
            }
            let indop = fd.new_indirect_op(op, addr, size as u32)?;
            let invn = fd.op(indop).input(0);
            fd.varnode_mut(invn).set_flag(varnode_flags::ACTIVE_HERITAGE);
            let out = fd.op(indop).output().unwrap();
            fd.varnode_mut(out).set_flag(varnode_flags::ACTIVE_HERITAGE);
            write.push(out);
        }
        Ok(())
    }

    /// Prepopulates data-flow for persistent storage at RETURN ops, and
    /// registers return-value trials.
    fn guard_returns(
        &mut self,
        fd: &mut FunctionData,
        flags: u32,
        addr: Address,
        size: u64,
    ) -> Result<(), Error> {
        let possible_out = fd.proto().possible_output_param(&addr, size as u32);
        if fd.active_output().map(|a| a.is_active()).unwrap_or(false) && possible_out {
            fd.active_output_mut()
                .unwrap()
                .register_trial(addr, size as u32);
            for op in fd.obank().alive_ids_by_code(OpCode::RETURN) {
                if fd.op(op).is_dead() || fd.op(op).halt_type() != 0 {
                    continue;
                }
                let invn = fd.new_varnode(size as u32, addr);
                fd.varnode_mut(invn).set_flag(varnode_flags::ACTIVE_HERITAGE);
                let slot = fd.op(op).num_inputs();
                fd.op_set_input(op, invn, slot);
            }
        }
        if flags & range_flags::PERSIST == 0 {
            return Ok(());
        }
        for op in fd.obank().alive_ids_by_code(OpCode::RETURN) {
            if fd.op(op).is_dead() {
                continue;
            }
            let pc = fd.op(op).seq().addr();
            let copyop = fd.new_op(pc, OpCode::COPY);
            let vn = fd.new_varnode_out(size as u32, addr, copyop)?;
            fd.varnode_mut(vn)
                .set_flag(varnode_flags::ADDRFORCE | varnode_flags::ACTIVE_HERITAGE);
            let invn = fd.new_varnode(size as u32, addr);
            fd.varnode_mut(invn).set_flag(varnode_flags::ACTIVE_HERITAGE);
            fd.op_set_input(copyop, invn, 0);
            fd.op_insert_before(copyop, op);
        }
        Ok(())
    }

    /// Normalizes pre-existing partial input varnodes to the full range by
    /// defining them as SUBPIECEs of one whole-range input.
    fn guard_input(
        &mut self,
        fd: &mut FunctionData,
        addr: Address,
        size: u64,
        input: &[VarnodeId],
    ) -> Result<(), Error> {
        let partial: Vec<VarnodeId> = input
            .iter()
            .copied()
            .filter(|&vn| (fd.varnode(vn).size() as u64) < size)
            .collect();
        if partial.is_empty() {
            return Ok(());
        }
        let whole = fd.new_varnode(size as u32, addr);
        let whole = fd.set_input_varnode(whole)?;
        self.split_pieces(fd, &partial, None, addr, size, whole)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Size normalization
    // ------------------------------------------------------------------

    /// Replaces a too-small free read with a full-range read plus SUBPIECE.
    fn normalize_read_size(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        addr: Address,
        size: u64,
    ) -> Result<VarnodeId, Error> {
        let op = fd
            .varnode(vn)
            .lone_descend()
            .ok_or_else(|| anyhow!("free varnode with multiple reads"))?;
        let pc = fd.op(op).seq().addr();
        let overlap = fd
            .varnode(vn)
            .addr()
            .overlap(0, &addr, size)
            .ok_or_else(|| anyhow!("read outside range being normalized"))?;
        let addr_size = self.infolist[addr.space().index()].addr_size;
        let newop = fd.new_op(pc, OpCode::SUBPIECE);
        let big = fd.new_varnode(size as u32, addr);
        let truncation = self.truncation_offset(addr, size, overlap, fd.varnode(vn).size() as u64);
        let constvn = fd.new_constant(addr_size, truncation);
        fd.op_set_input(newop, big, 0);
        fd.op_set_input(newop, constvn, 1);
        fd.op_set_output(newop, vn)?;
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        fd.op_insert_before(newop, op);
        Ok(big)
    }

    /// Replaces a too-small write with PIECE expressions producing a
    /// full-range write.
    fn normalize_write_size(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        addr: Address,
        size: u64,
    ) -> Result<VarnodeId, Error> {
        let def = fd
            .varnode(vn)
            .def()
            .expect("write normalization of undefined varnode");
        let pc = fd.op(def).seq().addr();
        let big_endian = self.infolist[addr.space().index()].big_endian;
        let addr_size = self.infolist[addr.space().index()].addr_size;
        let overlap = fd
            .varnode(vn)
            .addr()
            .overlap(0, &addr, size)
            .ok_or_else(|| anyhow!("write outside range being normalized"))?;
        let vnsize = fd.varnode(vn).size() as u64;
        let mostsigsize = size - (overlap + vnsize);

        let mostvn = if mostsigsize != 0 {
            let pieceaddr = if big_endian {
                addr
            } else {
                addr.add_wrap(overlap + vnsize)
            };
            if fd.op(def).is_call() && self.call_op_indirect_effect(fd, pieceaddr, mostsigsize, def) {
                let newop = fd.new_indirect_creation(def, pieceaddr, mostsigsize as u32, false)?;
                Some(fd.op(newop).output().unwrap())
            } else {
                let newop = fd.new_op(pc, OpCode::SUBPIECE);
                let out = fd.new_varnode_out(mostsigsize as u32, pieceaddr, newop)?;
                let big = fd.new_varnode(size as u32, addr);
                fd.varnode_mut(big).set_flag(varnode_flags::ACTIVE_HERITAGE);
                let constvn = fd.new_constant(addr_size, overlap + vnsize);
                fd.op_set_input(newop, big, 0);
                fd.op_set_input(newop, constvn, 1);
                fd.op_insert_before(newop, def);
                Some(out)
            }
        } else {
            None
        };

        let leastvn = if overlap != 0 {
            let pieceaddr = if big_endian {
                addr.add_wrap(size - overlap)
            } else {
                addr
            };
            if fd.op(def).is_call() && self.call_op_indirect_effect(fd, pieceaddr, overlap, def) {
                let newop = fd.new_indirect_creation(def, pieceaddr, overlap as u32, false)?;
                Some(fd.op(newop).output().unwrap())
            } else {
                let newop = fd.new_op(pc, OpCode::SUBPIECE);
                let out = fd.new_varnode_out(overlap as u32, pieceaddr, newop)?;
                let big = fd.new_varnode(size as u32, addr);
                fd.varnode_mut(big).set_flag(varnode_flags::ACTIVE_HERITAGE);
                let constvn = fd.new_constant(addr_size, 0);
                fd.op_set_input(newop, big, 0);
                fd.op_set_input(newop, constvn, 1);
                fd.op_insert_before(newop, def);
                Some(out)
            }
        } else {
            None
        };

        let midvn = if let Some(leastvn) = leastvn {
            let newop = fd.new_op(pc, OpCode::PIECE);
            let midaddr = if big_endian {
                fd.varnode(vn).addr()
            } else {
                addr
            };
            let mid = fd.new_varnode_out((overlap + vnsize) as u32, midaddr, newop)?;
            fd.op_set_input(newop, vn, 0);
            fd.op_set_input(newop, leastvn, 1);
            fd.op_insert_after(newop, def);
            mid
        } else {
            vn
        };

        let bigout = if let Some(mostvn) = mostvn {
            let newop = fd.new_op(pc, OpCode::PIECE);
            let out = fd.new_varnode_out(size as u32, addr, newop)?;
            fd.op_set_input(newop, mostvn, 0);
            fd.op_set_input(newop, midvn, 1);
            let middef = fd.varnode(midvn).def().unwrap();
            fd.op_insert_after(newop, middef);
            out
        } else {
            midvn
        };
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        Ok(bigout)
    }

    /// Returns true unless the call op definitely leaves the range alone.
    fn call_op_indirect_effect(
        &self,
        fd: &FunctionData,
        addr: Address,
        size: u64,
        op: OpId,
    ) -> bool {
        match fd.op(op).code() {
            OpCode::CALL | OpCode::CALLIND => match fd.call_spec_for(op) {
                Some(spec) => spec.effect_for(&addr, size as u32) != EffectType::Unaffected,
                None => true,
            },
            // CALLOTHER and NEW only affect their own outputs.
            _ => false,
        }
    }

    /// Returns the SUBPIECE truncation constant for a piece of a range.
    fn truncation_offset(&self, addr: Address, size: u64, overlap: u64, piece_size: u64) -> u64 {
        if self.infolist[addr.space().index()].big_endian {
            size - (overlap + piece_size)
        } else {
            overlap
        }
    }

    // ------------------------------------------------------------------
    // Refinement
    // ------------------------------------------------------------------

    /// Splits a range accessed at incompatible sub-granularities into the
    /// finest common refinement, rewriting accesses through PIECE/SUBPIECE.
    ///
    /// Returns the refined sub-ranges, or `None` if the range was already
    /// uniform.
    fn refinement(
        &mut self,
        fd: &mut FunctionData,
        addr: Address,
        size: u64,
        read: &[VarnodeId],
        write: &[VarnodeId],
        input: &[VarnodeId],
    ) -> Result<Option<Vec<(Address, u64)>>, Error> {
        if size > 1024 {
            return Ok(None);
        }
        // Mark the boundaries of every access in the refinement array.
        let mut refine = vec![0u32; size as usize + 1];
        for &vn in read.iter().chain(write).chain(input) {
            let v = fd.varnode(vn);
            let diff = (v.addr().offset() - addr.offset()) as usize;
            refine[diff] = 1;
            refine[diff + v.size() as usize] = 1;
        }
        // Convert boundary marks into piece sizes.
        let mut lastpos = 0;
        for pos in 1..size as usize {
            if refine[pos] != 0 {
                refine[lastpos] = (pos - lastpos) as u32;
                lastpos = pos;
            } else {
                refine[pos] = 0;
            }
        }
        refine[lastpos] = (size as usize - lastpos) as u32;
        if refine[0] as u64 == size {
            return Ok(None); // Already uniform.
        }
        self.remove_13_refinement(&mut refine);
        if refine[0] as u64 == size {
            return Ok(None);
        }

        for &vn in read.iter() {
            self.refine_read(fd, vn, addr, &refine)?;
        }
        for &vn in write.iter() {
            self.refine_write(fd, vn, addr, &refine)?;
        }
        for &vn in input.iter() {
            self.refine_input(fd, vn, addr, &refine)?;
        }

        // The pieces become separate disjoint ranges.
        let mut pieces = Vec::new();
        let mut pos = 0usize;
        while pos < size as usize {
            let sz = refine[pos];
            if sz == 0 {
                break;
            }
            let pieceaddr = addr.add_wrap(pos as u64);
            pieces.push((pieceaddr, sz as u64));
            pos += sz as usize;
        }
        Ok(Some(pieces))
    }

    /// A 1+3 or 3+1 refinement of a 4-byte range is artificial; widen it
    /// back to 4.
    fn remove_13_refinement(&self, refine: &mut [u32]) {
        if refine.is_empty() {
            return;
        }
        let mut pos = 0usize;
        let mut lastsize = refine[pos];
        if lastsize == 0 {
            return;
        }
        pos += lastsize as usize;
        while pos < refine.len() {
            let cursize = refine[pos];
            if cursize == 0 {
                break;
            }
            if (lastsize == 1 && cursize == 3) || (lastsize == 3 && cursize == 1) {
                refine[pos - lastsize as usize] = 4;
                lastsize = 4;
                pos += cursize as usize;
            } else {
                lastsize = cursize;
                pos += cursize as usize;
            }
        }
    }

    /// Returns the pieces a varnode splits into under the refinement.
    fn split_by_refinement(
        &self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        addr: Address,
        refine: &[u32],
    ) -> Vec<VarnodeId> {
        let v = fd.varnode(vn);
        let mut curaddr = v.addr();
        let mut sz = v.size() as i64;
        let mut diff = (curaddr.offset().wrapping_sub(addr.offset())) as usize;
        let mut cutsz = refine[diff] as i64;
        if sz <= cutsz {
            return Vec::new(); // Already refined.
        }
        let mut split = Vec::new();
        while sz > 0 {
            let piece = fd.new_varnode(cutsz as u32, curaddr);
            split.push(piece);
            curaddr = curaddr.add_wrap(cutsz as u64);
            sz -= cutsz;
            diff = (curaddr.offset().wrapping_sub(addr.offset())) as usize;
            cutsz = if diff < refine.len() { refine[diff] as i64 } else { sz };
            if cutsz > sz {
                cutsz = sz; // Final piece.
            }
        }
        split
    }

    /// Splits a free read along the refinement, concatenating the pieces.
    fn refine_read(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        addr: Address,
        refine: &[u32],
    ) -> Result<(), Error> {
        let pieces = self.split_by_refinement(fd, vn, addr, refine);
        if pieces.is_empty() {
            return Ok(());
        }
        let size = fd.varnode(vn).size();
        let replace = fd.new_unique(size);
        let op = fd
            .varnode(vn)
            .lone_descend()
            .ok_or_else(|| anyhow!("refining free varnode with multiple reads"))?;
        let slot = fd.op(op).slot_of(vn).unwrap();
        self.concat_pieces(fd, &pieces, Some(op), replace)?;
        fd.op_set_input(op, replace, slot);
        if fd.varnode(vn).has_no_descend() {
            fd.delete_varnode(vn)?;
        } else {
            bail!("refining non-free varnode");
        }
        Ok(())
    }

    /// Splits a write along the refinement, defining each piece by SUBPIECE.
    fn refine_write(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        addr: Address,
        refine: &[u32],
    ) -> Result<(), Error> {
        let pieces = self.split_by_refinement(fd, vn, addr, refine);
        if pieces.is_empty() {
            return Ok(());
        }
        let size = fd.varnode(vn).size();
        let vnaddr = fd.varnode(vn).addr();
        let replace = fd.new_unique(size);
        let def = fd.varnode(vn).def().expect("refining unwritten write");
        fd.op_unset_output(def);
        fd.op_set_output(def, replace)?;
        self.split_pieces(fd, &pieces, Some(def), vnaddr, size as u64, replace)?;
        fd.total_replace(vn, replace)?;
        fd.delete_varnode(vn)?;
        Ok(())
    }

    /// Splits a known input along the refinement.
    fn refine_input(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        addr: Address,
        refine: &[u32],
    ) -> Result<(), Error> {
        let pieces = self.split_by_refinement(fd, vn, addr, refine);
        if pieces.is_empty() {
            return Ok(());
        }
        let vnaddr = fd.varnode(vn).addr();
        let size = fd.varnode(vn).size() as u64;
        self.split_pieces(fd, &pieces, None, vnaddr, size, vn)?;
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        Ok(())
    }

    // ------------------------------------------------------------------
    // PIECE/SUBPIECE expression builders
    // ------------------------------------------------------------------

    /// Concatenates pieces (most significant first) into `finalvn` with a
    /// chain of PIECE ops inserted before `insertop` (or at the start of the
    /// entry block).
    fn concat_pieces(
        &mut self,
        fd: &mut FunctionData,
        pieces: &[VarnodeId],
        insertop: Option<OpId>,
        finalvn: VarnodeId,
    ) -> Result<VarnodeId, Error> {
        let big_endian = self.infolist[fd.varnode(pieces[0]).addr().space().index()].big_endian;
        let ordered: Vec<VarnodeId> = if big_endian {
            pieces.to_vec()
        } else {
            pieces.iter().rev().copied().collect()
        };
        let pc = match insertop {
            Some(op) => fd.op(op).seq().addr(),
            None => fd.entry(),
        };
        let mut preexist = ordered[0];
        for (i, &vn) in ordered.iter().enumerate().skip(1) {
            let newop = fd.new_op(pc, OpCode::PIECE);
            let newvn = if i == ordered.len() - 1 {
                fd.op_set_output(newop, finalvn)?;
                finalvn
            } else {
                let size = fd.varnode(preexist).size() + fd.varnode(vn).size();
                fd.new_unique_out(size, newop)?
            };
            fd.op_set_input(newop, preexist, 0);
            fd.op_set_input(newop, vn, 1);
            match insertop {
                Some(op) => fd.op_insert_before(newop, op),
                None => {
                    let entry = fd
                        .blocks()
                        .entry()
                        .ok_or_else(|| anyhow!("piece insertion without entry block"))?;
                    fd.op_insert_begin(newop, entry);
                }
            }
            preexist = newvn;
        }
        Ok(preexist)
    }

    /// Defines each piece as a SUBPIECE of `startvn`, inserting after
    /// `insertop` (or at the start of the entry block).
    fn split_pieces(
        &mut self,
        fd: &mut FunctionData,
        pieces: &[VarnodeId],
        insertop: Option<OpId>,
        addr: Address,
        size: u64,
        startvn: VarnodeId,
    ) -> Result<(), Error> {
        let big_endian = self.infolist[addr.space().index()].big_endian;
        let baseoff = if big_endian {
            addr.offset() + size
        } else {
            addr.offset()
        };
        let pc = match insertop {
            Some(op) => fd.op(op).seq().addr(),
            None => fd.entry(),
        };
        for &vn in pieces.iter() {
            let diff = if big_endian {
                baseoff - (fd.varnode(vn).addr().offset() + fd.varnode(vn).size() as u64)
            } else {
                fd.varnode(vn).addr().offset() - baseoff
            };
            let newop = fd.new_op(pc, OpCode::SUBPIECE);
            let constvn = fd.new_constant(4, diff);
            fd.op_set_input(newop, startvn, 0);
            fd.op_set_input(newop, constvn, 1);
            fd.op_set_output(newop, vn)?;
            match insertop {
                Some(op) => fd.op_insert_after(newop, op),
                None => {
                    let entry = fd
                        .blocks()
                        .entry()
                        .ok_or_else(|| anyhow!("piece insertion without entry block"))?;
                    fd.op_insert_begin(newop, entry);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Joins and float extensions
    // ------------------------------------------------------------------

    /// Rewrites reads and writes of join-space varnodes into per-piece
    /// accesses connected by PIECE/SUBPIECE, or float casts for extension
    /// records.
    ///
    /// The wide float varnode of an extension record is materialized
    /// eagerly, on the pass in which its piece space becomes eligible.
    fn process_joins(&mut self, fd: &mut FunctionData, manager: &AddrSpaceManager) -> Result<(), Error> {
        let Some(join_space) = self.join_space else {
            return Ok(());
        };
        for vn in fd.vbank().ids_in_space(join_space) {
            let v = fd.varnode(vn);
            if v.has_flag(varnode_flags::WRITEMASK) {
                continue;
            }
            let Some(record) = manager.join_record(v.addr().offset()).cloned() else {
                bail!("varnode in join space without join record");
            };
            let piece_space = record.piece(0).addr.space();
            if self.pass != self.infolist[piece_space.index()].delay {
                continue; // Too soon to heritage the pieces.
            }
            if fd.varnode(vn).is_written() {
                if record.is_float_extension() {
                    self.float_extension_write(fd, vn, &record)?;
                } else {
                    self.split_join_write(fd, vn, &record)?;
                }
            } else if !fd.varnode(vn).has_no_descend() {
                if record.is_float_extension() {
                    self.float_extension_read(fd, vn, &record)?;
                } else {
                    self.split_join_read(fd, vn, &record)?;
                }
            }
        }
        Ok(())
    }

    /// Replaces a read of a join varnode by reads of its pieces.
    ///
    /// The pieces of a join record are in logical order (most significant
    /// first) independent of memory endianness, so the PIECE chain is built
    /// directly over that order.
    fn split_join_read(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        record: &crate::address::JoinRecord,
    ) -> Result<(), Error> {
        let op = fd
            .varnode(vn)
            .lone_descend()
            .ok_or_else(|| anyhow!("join read with multiple descendants"))?;
        let pc = fd.op(op).seq().addr();
        let pieces: Vec<VarnodeId> = record
            .iter()
            .map(|piece| fd.new_varnode(piece.size, piece.addr))
            .collect();
        let slot = fd.op(op).slot_of(vn).unwrap();
        let mut preexist = pieces[0];
        for (i, &piece) in pieces.iter().enumerate().skip(1) {
            let newop = fd.new_op(pc, OpCode::PIECE);
            let newvn = if i == pieces.len() - 1 {
                fd.new_unique_out(fd.varnode(vn).size(), newop)?
            } else {
                let size = fd.varnode(preexist).size() + fd.varnode(piece).size();
                fd.new_unique_out(size, newop)?
            };
            fd.op_set_input(newop, preexist, 0);
            fd.op_set_input(newop, piece, 1);
            fd.op_insert_before(newop, op);
            preexist = newvn;
        }
        fd.op_set_input(op, preexist, slot);
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        if fd.varnode(vn).has_no_descend() {
            fd.delete_varnode(vn)?;
        }
        Ok(())
    }

    /// Replaces a write of a join varnode by SUBPIECE writes of its pieces.
    fn split_join_write(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        record: &crate::address::JoinRecord,
    ) -> Result<(), Error> {
        let def = fd.varnode(vn).def().expect("join write without def");
        let pc = fd.op(def).seq().addr();
        // Walk the logical offsets from the most significant end down.
        let mut loff = record.logical_size();
        for piece in record.iter().cloned().collect::<Vec<_>>() {
            loff -= piece.size;
            let newop = fd.new_op(pc, OpCode::SUBPIECE);
            let constvn = fd.new_constant(4, loff as u64);
            fd.op_set_input(newop, vn, 0);
            fd.op_set_input(newop, constvn, 1);
            fd.new_varnode_out(piece.size, piece.addr, newop)?;
            fd.op_insert_after(newop, def);
        }
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        Ok(())
    }

    /// Replaces a read of a float-extension varnode by a truncating cast of
    /// the wide physical register.
    fn float_extension_read(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        record: &crate::address::JoinRecord,
    ) -> Result<(), Error> {
        let op = fd
            .varnode(vn)
            .lone_descend()
            .ok_or_else(|| anyhow!("float extension read with multiple descendants"))?;
        let pc = fd.op(op).seq().addr();
        let piece = record.piece(0);
        let big = fd.new_varnode(piece.size, piece.addr);
        let newop = fd.new_op(pc, OpCode::FLOAT_FLOAT2FLOAT);
        fd.op_set_input(newop, big, 0);
        fd.op_set_output(newop, vn)?;
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        fd.op_insert_before(newop, op);
        Ok(())
    }

    /// Mirrors a write of a float-extension varnode into the wide physical
    /// register with an extending cast.
    fn float_extension_write(
        &mut self,
        fd: &mut FunctionData,
        vn: VarnodeId,
        record: &crate::address::JoinRecord,
    ) -> Result<(), Error> {
        let def = fd.varnode(vn).def().expect("float extension write without def");
        let pc = fd.op(def).seq().addr();
        let piece = record.piece(0);
        let newop = fd.new_op(pc, OpCode::FLOAT_FLOAT2FLOAT);
        fd.op_set_input(newop, vn, 0);
        fd.new_varnode_out(piece.size, piece.addr, newop)?;
        fd.op_insert_after(newop, def);
        fd.varnode_mut(vn).set_flag(varnode_flags::WRITEMASK);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phi placement and renaming
    // ------------------------------------------------------------------

    /// Places MULTIEQUAL ops for every range being heritaged this pass.
    fn place_multiequals(&mut self, fd: &mut FunctionData, arch: &Architecture) -> Result<(), Error> {
        let mut worklist: std::collections::VecDeque<(Address, u64)> =
            self.disjoint.ranges().into();
        while let Some((addr, size)) = worklist.pop_front() {
            let (mut read, mut write, input, maxsize) = self.collect(fd, addr, size);
            if size > 4 && maxsize < size {
                // Accesses at incompatible sub-granularities: refine.
                if let Some(pieces) = self.refinement(fd, addr, size, &read, &write, &input)? {
                    // The refined pieces become separate ranges, processed in
                    // place of the original.
                    for piece in pieces.into_iter().rev() {
                        worklist.push_front(piece);
                    }
                    continue;
                }
            }
            if read.is_empty()
                && self.infolist[addr.space().index()].kind == SpaceKind::Unique
            {
                continue;
            }
            self.guard_input(fd, addr, size, &input)?;
            self.guard(fd, arch, addr, size, &mut read, &mut write, &input)?;
            if read.is_empty() && write.is_empty() {
                continue;
            }
            self.calc_multiequals(fd, &write);
            for bl in self.merge.clone() {
                let num_in = fd.blocks().block(bl).num_in();
                let start = fd.blocks().block(bl).start();
                let multiop = fd.new_op(start, OpCode::MULTIEQUAL);
                let out = fd.new_varnode_out(size as u32, addr, multiop)?;
                fd.varnode_mut(out).set_flag(varnode_flags::ACTIVE_HERITAGE);
                for j in 0..num_in {
                    let vnin = fd.new_varnode(size as u32, addr);
                    fd.op_set_input(multiop, vnin, j);
                }
                fd.op_insert_begin(multiop, bl);
            }
        }
        self.merge.clear();
        Ok(())
    }

    /// Runs the renaming algorithm over the dominator tree.
    fn rename(&mut self, fd: &mut FunctionData) -> Result<(), Error> {
        let Some(entry) = fd.blocks().entry() else {
            self.disjoint.clear();
            return Ok(());
        };
        let mut varstack = VariableStack::new();
        self.rename_recurse(fd, entry, &mut varstack)?;
        self.disjoint.clear();
        Ok(())
    }

    fn rename_recurse(
        &mut self,
        fd: &mut FunctionData,
        bl: BlockId,
        varstack: &mut VariableStack,
    ) -> Result<(), Error> {
        let mut writelist: Vec<VarnodeId> = Vec::new();

        for op in fd.blocks().block(bl).ops().to_vec() {
            if fd.op(op).code() != OpCode::MULTIEQUAL {
                // First replace reads with the top of the stack.
                for slot in 0..fd.op(op).num_inputs() {
                    let vnin = fd.op(op).input(slot);
                    let v = fd.varnode(vnin);
                    if v.is_heritage_known() {
                        continue;
                    }
                    if !v.has_flag(varnode_flags::ACTIVE_HERITAGE) {
                        continue; // Not being heritaged this round.
                    }
                    let (size, addr) = (v.size(), v.addr());
                    fd.varnode_mut(vnin)
                        .clear_flag(varnode_flags::ACTIVE_HERITAGE);
                    if varstack.get(&addr).map_or(true, |stack| stack.is_empty()) {
                        // No definition reaches this read: promote a formal
                        // function input.
                        let fresh = fd.new_varnode(size, addr);
                        let fresh = fd.set_input_varnode(fresh)?;
                        varstack.entry(addr).or_default().push(fresh);
                    }
                    let mut vnnew = *varstack[&addr].last().unwrap();
                    // An INDIRECT and the op it guards happen at the same
                    // time; the guarded op must not read the INDIRECT's own
                    // output.
                    if let Some(def) = fd.varnode(vnnew).def() {
                        if fd.op(def).code() == OpCode::INDIRECT
                            && fd.indirect_effect_op(def) == Some(op)
                        {
                            let stack = varstack.get_mut(&addr).unwrap();
                            if stack.len() == 1 {
                                let fresh = fd.new_varnode(size, addr);
                                let fresh = fd.set_input_varnode(fresh)?;
                                stack.insert(0, fresh);
                                vnnew = fresh;
                            } else {
                                vnnew = stack[stack.len() - 2];
                            }
                        }
                    }
                    fd.op_set_input(op, vnnew, slot);
                    if fd.varnode(vnin).has_no_descend() {
                        fd.delete_varnode(vnin)?;
                    }
                }
            }
            // Then push writes onto the stack.
            let Some(vnout) = fd.op(op).output() else {
                continue;
            };
            if !fd.varnode(vnout).has_flag(varnode_flags::ACTIVE_HERITAGE) {
                continue; // Not a normalized write.
            }
            fd.varnode_mut(vnout)
                .clear_flag(varnode_flags::ACTIVE_HERITAGE);
            varstack.entry(fd.varnode(vnout).addr()).or_default().push(vnout);
            writelist.push(vnout);
        }

        // Fill in MULTIEQUAL inputs of the successors.
        for i in 0..fd.blocks().block(bl).num_out() {
            let subbl = fd.blocks().block(bl).out_edges()[i];
            let slot = fd.blocks().block(bl).out_rev_index(i);
            for multiop in fd.blocks().block(subbl).ops().to_vec() {
                if fd.op(multiop).code() != OpCode::MULTIEQUAL {
                    break;
                }
                if slot >= fd.op(multiop).num_inputs() {
                    bail!("MULTIEQUAL input count does not match predecessors");
                }
                let vnin = fd.op(multiop).input(slot);
                if fd.varnode(vnin).is_heritage_known() {
                    continue;
                }
                let (size, addr) = {
                    let v = fd.varnode(vnin);
                    (v.size(), v.addr())
                };
                if varstack.get(&addr).map_or(true, |stack| stack.is_empty()) {
                    let fresh = fd.new_varnode(size, addr);
                    let fresh = fd.set_input_varnode(fresh)?;
                    varstack.entry(addr).or_default().push(fresh);
                }
                let vnnew = *varstack[&addr].last().unwrap();
                fd.op_set_input(multiop, vnnew, slot);
                if fd.varnode(vnin).has_no_descend() {
                    fd.delete_varnode(vnin)?;
                }
            }
        }

        // Recurse into the dominator subtrees.
        for child in self.domchild[bl.index()].clone() {
            self.rename_recurse(fd, child, varstack)?;
        }

        // Pop this block's writes off the stacks.
        for vnout in writelist {
            let addr = fd.varnode(vnout).addr();
            varstack.get_mut(&addr).unwrap().pop();
        }
        Ok(())
    }
}

/// Boolean properties of an address range, queried during guarding.
mod range_flags {
    /// Data-flow must persist beyond the end of the function.
    pub const PERSIST: u32 = 0x100;
    /// The storage may be aliased through pointers.
    pub const ADDRTIED: u32 = 0x200;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_map_intersect_codes() {
        let ram = SpaceId::mock_ram();
        let mut map = LocationMap::default();
        let a = Address::new(ram, 0x100);
        let (addr, size, code) = map.add(a, 8, 0);
        assert_eq!((addr, size, code), (a, 8, Intersect::New));
        // Contained in a range of the same pass is still "new".
        let (_, _, code) = map.add(Address::new(ram, 0x102), 2, 0);
        assert_eq!(code, Intersect::New);
        // Contained in a range of an earlier pass.
        let (addr, size, code) = map.add(Address::new(ram, 0x102), 2, 1);
        assert_eq!((addr, size, code), (a, 8, Intersect::Contained));
        // Partial overlap with an earlier pass widens the range.
        let (addr, size, code) = map.add(Address::new(ram, 0x104), 8, 1);
        assert_eq!((addr, size, code), (a, 12, Intersect::Partial));
        assert_eq!(map.find_pass(Address::new(ram, 0x10a)), Some(1));
        assert_eq!(map.find_pass(Address::new(ram, 0x10c)), None);
    }

    #[test]
    fn priority_queue_services_deepest_first() {
        let mut pq = PriorityQueue::default();
        pq.reset(3);
        pq.insert(BlockId(0), 0);
        pq.insert(BlockId(5), 3);
        pq.insert(BlockId(2), 1);
        assert_eq!(pq.extract(), BlockId(5));
        assert_eq!(pq.extract(), BlockId(2));
        assert_eq!(pq.extract(), BlockId(0));
        assert!(pq.is_empty());
    }
}
