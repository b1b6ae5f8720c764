//! Hashing of local p-code expressions.
//!
//! Symbols for values without stable storage (temporaries, constant
//! patterns) are keyed by a 64-bit hash of the expression tree around the
//! varnode plus an anchor code address. The hash is deterministic over the
//! shape of the expression, so a later pass can recompute it and rediscover
//! the varnode after the graph has been rebuilt.

use crate::address::Address;
use crate::data_flow::VarnodeId;
use crate::function::FunctionData;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Maximum depth of the expression walk feeding the hash.
const MAX_DEPTH: u32 = 4;

/// Computes and resolves expression hashes for dynamic symbols.
pub struct DynamicHash;

impl DynamicHash {
    /// Returns the anchor address of a varnode: the address of its defining
    /// op, or of its first reader for free varnodes.
    pub fn anchor(fd: &FunctionData, vn: VarnodeId) -> Option<Address> {
        let v = fd.varnode(vn);
        if let Some(def) = v.def() {
            return Some(fd.op(def).seq().addr());
        }
        v.descendants()
            .first()
            .map(|&op| fd.op(op).seq().addr())
    }

    /// Computes the hash of the expression tree producing the varnode.
    pub fn calc_hash(fd: &FunctionData, vn: VarnodeId) -> u64 {
        let mut hash = FNV_OFFSET;
        Self::hash_varnode(fd, vn, MAX_DEPTH, &mut hash);
        hash
    }

    fn mix(hash: &mut u64, value: u64) {
        for byte in value.to_le_bytes() {
            *hash ^= byte as u64;
            *hash = hash.wrapping_mul(FNV_PRIME);
        }
    }

    fn hash_varnode(fd: &FunctionData, vn: VarnodeId, depth: u32, hash: &mut u64) {
        let v = fd.varnode(vn);
        Self::mix(hash, v.size() as u64);
        if v.is_constant() {
            Self::mix(hash, 1);
            Self::mix(hash, v.constant_value());
            return;
        }
        if v.is_input() || depth == 0 {
            // Inputs and cut-off points hash as leaves of their size only,
            // so the hash survives renaming of the storage.
            Self::mix(hash, 2);
            return;
        }
        match v.def() {
            Some(def) => {
                let op = fd.op(def);
                Self::mix(hash, 3);
                Self::mix(hash, op.code() as u64);
                Self::mix(hash, op.num_inputs() as u64);
                for &input in op.inputs() {
                    Self::hash_varnode(fd, input, depth - 1, hash);
                }
            }
            None => Self::mix(hash, 4),
        }
    }

    /// Re-locates the varnode with the given anchor and hash by walking the
    /// op tree of the function.
    ///
    /// Returns `None` if no varnode matches, or if the hash has become
    /// ambiguous (two distinct varnodes at the anchor produce it).
    pub fn find_varnode(fd: &FunctionData, anchor: Address, hash: u64) -> Option<VarnodeId> {
        let mut found: Option<VarnodeId> = None;
        for vn in fd.vbank().ids() {
            if Self::anchor(fd, vn) != Some(anchor) {
                continue;
            }
            if Self::calc_hash(fd, vn) != hash {
                continue;
            }
            match found {
                // Same varnode reached twice through the location index
                // cannot happen; two distinct hits make the hash ambiguous.
                Some(prev) if prev != vn => return None,
                _ => found = Some(vn),
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddrSpaceManager, SpaceId};
    use crate::data_flow::OpCode;

    #[test]
    fn hash_rediscovers_varnode() {
        let manager = AddrSpaceManager::mock();
        let mut fd = FunctionData::mock(&manager);
        let pc = fd.entry();
        // u = r8 + #7
        let op = fd.new_op(pc, OpCode::INT_ADD);
        let base = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let seven = fd.new_constant(4, 7);
        fd.op_set_input(op, base, 0);
        fd.op_set_input(op, seven, 1);
        let out = fd.new_unique_out(4, op).unwrap();

        let anchor = DynamicHash::anchor(&fd, out).unwrap();
        assert_eq!(anchor, pc);
        let hash = DynamicHash::calc_hash(&fd, out);
        assert_eq!(DynamicHash::find_varnode(&fd, anchor, hash), Some(out));

        // A structurally different expression does not collide.
        let op2 = fd.new_op(pc, OpCode::INT_SUB);
        let base2 = fd.new_varnode(4, Address::new(SpaceId::mock_register(), 0x8));
        let eight = fd.new_constant(4, 8);
        fd.op_set_input(op2, base2, 0);
        fd.op_set_input(op2, eight, 1);
        let out2 = fd.new_unique_out(4, op2).unwrap();
        assert_ne!(DynamicHash::calc_hash(&fd, out2), hash);
    }
}
