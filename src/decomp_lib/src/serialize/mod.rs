//! Tag-tree persistence of function state.
//!
//! The serialized form is a tree of [`Element`]s (name, attributes, nested
//! children, text) mirroring the in-memory structures. Round-tripping a
//! function after SSA construction reproduces the varnode bank, op list and
//! block graph exactly, up to transient analysis state (statistics counters,
//! breakpoint flags, covers).

use crate::address::{Address, AddrSpaceManager, SeqNum, SpaceId};
use crate::data_flow::{BlockId, OpCode, OpId, VarnodeId};
use crate::function::FunctionData;
use crate::prelude::*;

use std::collections::BTreeMap;

/// One node of the tag tree.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Element {
    /// The element name.
    pub name: String,
    /// The attributes, in insertion order.
    pub attrs: Vec<(String, String)>,
    /// The nested elements.
    pub children: Vec<Element>,
    /// The text content.
    pub text: String,
}

impl Element {
    /// Returns an empty element with the given name.
    pub fn new(name: &str) -> Element {
        Element {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Adds an attribute.
    pub fn attr(&mut self, key: &str, value: impl ToString) -> &mut Element {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    /// Returns the value of the attribute with the given key.
    pub fn get_attr(&self, key: &str) -> Result<&str, Error> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| anyhow!("element <{}> is missing attribute {}", self.name, key))
    }

    /// Returns the attribute parsed as an integer (decimal or 0x-hex).
    pub fn get_int(&self, key: &str) -> Result<u64, Error> {
        let value = self.get_attr(key)?;
        let parsed = if let Some(hex) = value.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else {
            value.parse()
        };
        parsed.map_err(|_| anyhow!("malformed integer attribute {}={}", key, value))
    }

    /// Returns the children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Returns the first child with the given name.
    pub fn child<'a>(&'a self, name: &'a str) -> Result<&'a Element, Error> {
        self.children_named(name)
            .next()
            .ok_or_else(|| anyhow!("element <{}> is missing child <{}>", self.name, name))
    }
}

fn addr_attrs(element: &mut Element, prefix: &str, addr: Address) {
    element.attr(&format!("{}space", prefix), addr.space().index());
    element.attr(&format!("{}offset", prefix), format!("0x{:x}", addr.offset()));
}

fn read_addr(element: &Element, prefix: &str) -> Result<Address, Error> {
    let space = element.get_int(&format!("{}space", prefix))? as usize;
    let offset = element.get_int(&format!("{}offset", prefix))?;
    if space >= SpaceId::INVALID.index() {
        return Ok(Address::invalid());
    }
    Ok(Address::new(SpaceId::from_index(space), offset))
}

/// Serializes the data-flow state of a function into a tag tree.
pub fn save_function(fd: &FunctionData) -> Element {
    let mut root = Element::new("function");
    root.attr("name", fd.name());
    addr_attrs(&mut root, "entry_", fd.entry());

    let mut varnodes = Element::new("varnodes");
    for vn in fd.vbank().ids() {
        let v = fd.varnode(vn);
        let mut element = Element::new("varnode");
        element.attr("id", vn.index());
        addr_attrs(&mut element, "", v.addr());
        element.attr("size", v.size());
        element.attr("flags", format!("0x{:x}", v.flags()));
        element.attr("nzmask", format!("0x{:x}", v.nzmask()));
        varnodes.children.push(element);
    }
    root.children.push(varnodes);

    let mut ops = Element::new("ops");
    let mut all_ops: Vec<OpId> = fd.obank().alive_ids();
    all_ops.extend(fd.obank().dead_ids());
    all_ops.sort_by_key(|&op| fd.op(op).seq());
    for op in all_ops {
        let o = fd.op(op);
        let mut element = Element::new("op");
        element.attr("id", op.index());
        element.attr("code", format!("{}", o.code()));
        addr_attrs(&mut element, "pc_", o.seq().addr());
        element.attr("uniq", o.seq().uniq());
        element.attr("dead", o.is_dead() as u32);
        if let Some(out) = o.output() {
            element.attr("output", out.index());
        }
        element.text = o
            .inputs()
            .iter()
            .map(|vn| vn.index().to_string())
            .collect::<Vec<_>>()
            .join(",");
        ops.children.push(element);
    }
    root.children.push(ops);

    let mut blocks = Element::new("blocks");
    if let Some(entry) = fd.blocks().entry() {
        blocks.attr("entry", entry.index());
    }
    for block in fd.blocks().iter() {
        let mut element = Element::new("block");
        element.attr("index", block.id().index());
        addr_attrs(&mut element, "start_", block.start());
        addr_attrs(&mut element, "stop_", block.stop());
        let mut edges = Element::new("out");
        edges.text = block
            .out_edges()
            .iter()
            .map(|b| b.index().to_string())
            .collect::<Vec<_>>()
            .join(",");
        element.children.push(edges);
        let mut oplist = Element::new("oplist");
        oplist.text = block
            .ops()
            .iter()
            .map(|op| op.index().to_string())
            .collect::<Vec<_>>()
            .join(",");
        element.children.push(oplist);
        blocks.children.push(element);
    }
    root.children.push(blocks);
    root
}

fn parse_id_list(text: &str) -> Result<Vec<usize>, Error> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| anyhow!("malformed id list entry: {}", part))
        })
        .collect()
}

fn parse_opcode(name: &str) -> Result<OpCode, Error> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| anyhow!("unknown op-code: {}", name))
}

/// Restores a function from its tag tree into a fresh context.
///
/// Malformed input is reported as an error; no partial state is exposed.
pub fn restore_function(
    root: &Element,
    manager: &AddrSpaceManager,
) -> Result<FunctionData, Error> {
    if root.name != "function" {
        bail!("expected <function> element, found <{}>", root.name);
    }
    let name = root.get_attr("name")?;
    let entry = read_addr(root, "entry_")?;
    let mut fd = FunctionData::new(name, entry, manager);

    // Varnodes, with an id map from serialized to fresh ids.
    let mut vn_map: BTreeMap<usize, VarnodeId> = BTreeMap::new();
    for element in root.child("varnodes")?.children_named("varnode") {
        let old_id = element.get_int("id")? as usize;
        let addr = read_addr(element, "")?;
        let size = element.get_int("size")? as u32;
        let flags = element.get_int("flags")?;
        let nzmask = element.get_int("nzmask")?;
        let vn = fd.new_varnode(size, addr);
        fd.varnode_mut(vn).set_flag(flags as u32);
        fd.varnode_mut(vn).set_nzmask(nzmask);
        vn_map.insert(old_id, vn);
    }

    // Ops, created dead with their original sequence numbers. An op stays
    // dead unless some block claims it below.
    let mut op_map: BTreeMap<usize, OpId> = BTreeMap::new();
    for element in root.child("ops")?.children_named("op") {
        let old_id = element.get_int("id")? as usize;
        let code = parse_opcode(element.get_attr("code")?)?;
        let pc = read_addr(element, "pc_")?;
        let uniq = element.get_int("uniq")? as u32;
        let op = fd.new_op_with_seq(SeqNum::new(pc, uniq), code);
        for (slot, input) in parse_id_list(&element.text)?.into_iter().enumerate() {
            let vn = *vn_map
                .get(&input)
                .ok_or_else(|| anyhow!("op input refers to unknown varnode {}", input))?;
            fd.op_set_input(op, vn, slot);
        }
        if let Ok(out) = element.get_int("output") {
            let vn = *vn_map
                .get(&(out as usize))
                .ok_or_else(|| anyhow!("op output refers to unknown varnode {}", out))?;
            fd.op_set_output(op, vn)?;
        }
        op_map.insert(old_id, op);
    }

    // Blocks and edges, with ops inserted in serialized order.
    let blocks_element = root.child("blocks")?;
    let mut blk_map: BTreeMap<usize, BlockId> = BTreeMap::new();
    let mut edge_lists: Vec<(BlockId, Vec<usize>)> = Vec::new();
    for element in blocks_element.children_named("block") {
        let old_index = element.get_int("index")? as usize;
        let start = read_addr(element, "start_")?;
        let stop = read_addr(element, "stop_")?;
        let blk = fd.blocks_mut().new_block(start);
        fd.blocks_mut().block_mut(blk).set_stop(stop);
        blk_map.insert(old_index, blk);
        edge_lists.push((blk, parse_id_list(&element.child("out")?.text)?));
    }
    for (from, outs) in edge_lists {
        for target in outs {
            let to = *blk_map
                .get(&target)
                .ok_or_else(|| anyhow!("edge to unknown block {}", target))?;
            fd.blocks_mut().add_edge(from, to);
        }
    }
    for element in blocks_element.children_named("block") {
        let old_index = element.get_int("index")? as usize;
        let blk = blk_map[&old_index];
        for (pos, old_op) in parse_id_list(&element.child("oplist")?.text)?
            .into_iter()
            .enumerate()
        {
            let op = *op_map
                .get(&old_op)
                .ok_or_else(|| anyhow!("block refers to unknown op {}", old_op))?;
            fd.op_insert(op, blk, pos);
        }
    }
    if let Ok(entry) = blocks_element.get_int("entry") {
        let blk = *blk_map
            .get(&(entry as usize))
            .ok_or_else(|| anyhow!("unknown entry block {}", entry))?;
        fd.blocks_mut().set_entry(blk);
    }

    // INDIRECT ops name the op they guard through an annotation constant
    // holding the op id; those references must follow the renumbering.
    for &op in op_map.values() {
        if fd.op(op).code() != OpCode::INDIRECT {
            continue;
        }
        let Some(refvn) = fd.op(op).try_input(1) else {
            continue;
        };
        let v = fd.varnode(refvn);
        if !v.is_annotation() || !v.is_constant() {
            continue;
        }
        let old_target = v.constant_value() as usize;
        if let Some(&new_target) = op_map.get(&old_target) {
            let newref = fd.new_op_ref(new_target);
            fd.op_set_input(op, newref, 1);
            if fd.vbank().is_live(refvn) && fd.varnode(refvn).has_no_descend() {
                fd.delete_varnode(refvn)?;
            }
        }
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddrSpaceManager;

    #[test]
    fn element_roundtrips_through_json() {
        let mut element = Element::new("function");
        element.attr("name", "main").attr("entry_offset", "0x1000");
        element.children.push(Element::new("varnodes"));
        let json = serde_json::to_string(&element).unwrap();
        let back: Element = serde_json::from_str(&json).unwrap();
        assert_eq!(element, back);
        assert_eq!(back.get_attr("name").unwrap(), "main");
        assert_eq!(back.get_int("entry_offset").unwrap(), 0x1000);
    }

    #[test]
    fn malformed_restore_is_an_error() {
        let manager = AddrSpaceManager::mock();
        let bogus = Element::new("nonsense");
        assert!(restore_function(&bogus, &manager).is_err());
        let mut missing = Element::new("function");
        missing.attr("name", "f");
        assert!(restore_function(&missing, &manager).is_err());
    }
}
