//! Basic blocks and the control-flow graph of one function.

use crate::address::Address;
use crate::prelude::*;

use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};

use super::{BlockId, OpId};

/// A basic block: a straight-line sequence of ops with edges to and from
/// other blocks.
///
/// The op list is ordered for execution: MULTIEQUAL ops come first, INDIRECT
/// ops sit immediately before their effect op, and at most one branch op is
/// last. Edge slots are stable: the i-th in-edge of a block corresponds to
/// the i-th input of every MULTIEQUAL in the block.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BasicBlock {
    index: BlockId,
    /// Ops in execution order.
    ops: Vec<OpId>,
    in_edges: Vec<BlockId>,
    out_edges: Vec<BlockId>,
    /// For each out-edge, the slot this block occupies in the target's
    /// in-edge list.
    out_rev: Vec<usize>,
    /// First code address owned by the block.
    start: Address,
    /// Last code address owned by the block.
    stop: Address,
}

impl BasicBlock {
    fn new(index: BlockId, start: Address) -> BasicBlock {
        BasicBlock {
            index,
            ops: Vec::new(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            out_rev: Vec::new(),
            start,
            stop: start,
        }
    }

    /// Returns the id of this block.
    pub fn id(&self) -> BlockId {
        self.index
    }

    /// Returns the ops of the block in execution order.
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub(crate) fn ops_mut(&mut self) -> &mut Vec<OpId> {
        &mut self.ops
    }

    /// Returns the predecessor blocks in slot order.
    pub fn in_edges(&self) -> &[BlockId] {
        &self.in_edges
    }

    /// Returns the successor blocks in slot order.
    pub fn out_edges(&self) -> &[BlockId] {
        &self.out_edges
    }

    /// Returns the number of predecessors.
    pub fn num_in(&self) -> usize {
        self.in_edges.len()
    }

    /// Returns the number of successors.
    pub fn num_out(&self) -> usize {
        self.out_edges.len()
    }

    /// Returns the slot this block occupies in the in-edge list of its
    /// `i`-th successor.
    pub fn out_rev_index(&self, i: usize) -> usize {
        self.out_rev[i]
    }

    /// Returns the first code address owned by the block.
    pub fn start(&self) -> Address {
        self.start
    }

    /// Returns the last code address owned by the block.
    pub fn stop(&self) -> Address {
        self.stop
    }

    pub(crate) fn set_stop(&mut self, stop: Address) {
        self.stop = stop;
    }
}

/// The control-flow graph over the basic blocks of one function.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BlockGraph {
    blocks: Vec<BasicBlock>,
    entry: Option<BlockId>,
}

impl BlockGraph {
    /// Returns an empty graph.
    pub fn new() -> BlockGraph {
        BlockGraph::default()
    }

    /// Creates a new block owning code starting at the given address.
    pub fn new_block(&mut self, start: Address) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, start));
        id
    }

    /// Returns the number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true iff the graph holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns the block with the given id.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// Returns an iterator over all blocks in index order.
    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    /// Marks the function entry block.
    pub fn set_entry(&mut self, id: BlockId) {
        self.entry = Some(id);
    }

    /// Returns the function entry block, if set.
    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    /// Adds a control-flow edge. The new edge occupies the next free out
    /// slot of `from` and the next free in slot of `to`.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        let rev = self.blocks[to.index()].in_edges.len();
        self.blocks[to.index()].in_edges.push(from);
        let from_block = &mut self.blocks[from.index()];
        from_block.out_edges.push(to);
        from_block.out_rev.push(rev);
    }

    /// Computes the dominator tree of the graph.
    ///
    /// Fails if no entry block has been marked.
    pub fn build_dom_tree(&self) -> Result<DomTree, Error> {
        let entry = self
            .entry
            .ok_or_else(|| anyhow!("dominator computation without entry block"))?;
        let mut graph: DiGraph<BlockId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = self
            .blocks
            .iter()
            .map(|block| graph.add_node(block.id()))
            .collect();
        for block in self.blocks.iter() {
            for &succ in block.out_edges() {
                graph.add_edge(nodes[block.id().index()], nodes[succ.index()], ());
            }
        }
        let result = dominators::simple_fast(&graph, nodes[entry.index()]);

        let mut idom: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); self.blocks.len()];
        for block in self.blocks.iter() {
            if block.id() == entry {
                continue;
            }
            if let Some(dom) = result.immediate_dominator(nodes[block.id().index()]) {
                let dom_id = graph[dom];
                idom[block.id().index()] = Some(dom_id);
                children[dom_id.index()].push(block.id());
            }
        }

        // Depth is zero at the entry and strictly increases along tree paths.
        let mut depth: Vec<i32> = vec![-1; self.blocks.len()];
        let mut max_depth = 0;
        let mut stack = vec![entry];
        depth[entry.index()] = 0;
        while let Some(current) = stack.pop() {
            for &child in children[current.index()].iter() {
                depth[child.index()] = depth[current.index()] + 1;
                max_depth = max_depth.max(depth[child.index()]);
                stack.push(child);
            }
        }

        Ok(DomTree {
            entry,
            idom,
            children,
            depth,
            max_depth,
        })
    }
}

/// The dominator tree of a block graph.
#[derive(Debug, Clone)]
pub struct DomTree {
    /// The entry block, i.e. the root of the tree.
    pub entry: BlockId,
    /// Immediate dominator per block; `None` for the entry and unreachable
    /// blocks.
    pub idom: Vec<Option<BlockId>>,
    /// Dominator-tree children per block.
    pub children: Vec<Vec<BlockId>>,
    /// Dominator depth per block; `-1` for unreachable blocks.
    pub depth: Vec<i32>,
    /// The maximum dominator depth.
    pub max_depth: i32,
}

impl DomTree {
    /// Returns true iff `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut current = Some(b);
        while let Some(block) = current {
            if block == a {
                return true;
            }
            current = self.idom[block.index()];
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;

    fn diamond() -> BlockGraph {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let mut graph = BlockGraph::new();
        let addr = |offset| Address::new(SpaceId::mock_ram(), offset);
        let b0 = graph.new_block(addr(0x0));
        let b1 = graph.new_block(addr(0x10));
        let b2 = graph.new_block(addr(0x20));
        let b3 = graph.new_block(addr(0x30));
        graph.add_edge(b0, b1);
        graph.add_edge(b0, b2);
        graph.add_edge(b1, b3);
        graph.add_edge(b2, b3);
        graph.set_entry(b0);
        graph
    }

    #[test]
    fn dominators_of_diamond() {
        let graph = diamond();
        let dom = graph.build_dom_tree().unwrap();
        assert_eq!(dom.depth[0], 0);
        assert_eq!(dom.idom[3], Some(BlockId(0)));
        assert_eq!(dom.idom[1], Some(BlockId(0)));
        assert!(dom.dominates(BlockId(0), BlockId(3)));
        assert!(!dom.dominates(BlockId(1), BlockId(3)));
        assert_eq!(dom.max_depth, 1);
    }

    #[test]
    fn edge_slots_are_stable() {
        let graph = diamond();
        let join = graph.block(BlockId(3));
        assert_eq!(join.in_edges(), &[BlockId(1), BlockId(2)]);
        // Block 1's only out-edge lands in slot 0 of the join block,
        // block 2's in slot 1.
        assert_eq!(graph.block(BlockId(1)).out_rev_index(0), 0);
        assert_eq!(graph.block(BlockId(2)).out_rev_index(0), 1);
    }
}
