//! High-level variables: groups of varnodes rendered as one source variable.

use crate::database::{ScopeId, SymbolId};
use crate::datatype::DataType;
use crate::prelude::*;

use std::sync::Arc;

use super::{Cover, VarnodeId};

/// An equivalence class of varnodes that should render as a single
/// source-level variable.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HighVariable {
    /// The member varnodes.
    members: Vec<VarnodeId>,
    /// The aggregate data-type of the variable.
    datatype: Option<Arc<DataType>>,
    /// The bound symbol, if one has been linked.
    symbol: Option<(ScopeId, SymbolId)>,
    /// Byte offset of the variable within the bound symbol.
    symbol_offset: u32,
    /// The union of the member covers.
    cover: Cover,
}

impl HighVariable {
    /// Returns a new high variable with a single member.
    pub fn new(member: VarnodeId) -> HighVariable {
        HighVariable {
            members: vec![member],
            datatype: None,
            symbol: None,
            symbol_offset: 0,
            cover: Cover::new(),
        }
    }

    /// Returns the member varnodes.
    pub fn members(&self) -> &[VarnodeId] {
        &self.members
    }

    /// Returns the number of members.
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn add_member(&mut self, member: VarnodeId) {
        self.members.push(member);
    }

    /// Returns the aggregate data-type.
    pub fn datatype(&self) -> Option<&Arc<DataType>> {
        self.datatype.as_ref()
    }

    /// Assigns the aggregate data-type.
    pub fn set_datatype(&mut self, datatype: Arc<DataType>) {
        self.datatype = Some(datatype);
    }

    /// Returns the bound symbol, if any.
    pub fn symbol(&self) -> Option<(ScopeId, SymbolId)> {
        self.symbol
    }

    /// Returns the byte offset of the variable within its symbol.
    pub fn symbol_offset(&self) -> u32 {
        self.symbol_offset
    }

    /// Binds the variable to a symbol.
    pub fn set_symbol(&mut self, scope: ScopeId, symbol: SymbolId, offset: u32) {
        self.symbol = Some((scope, symbol));
        self.symbol_offset = offset;
    }

    /// Returns the union of the member covers.
    pub fn cover(&self) -> &Cover {
        &self.cover
    }

    pub(crate) fn cover_mut(&mut self) -> &mut Cover {
        &mut self.cover
    }
}
