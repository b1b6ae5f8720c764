//! Logical values stored across disjoint physical locations.

use super::VarnodeData;
use crate::prelude::*;

use std::fmt::{self, Display};

/// An ordered sequence of storage pieces representing one logical value.
///
/// The pieces are ordered most significant first. A join record is assigned a
/// unique offset in the synthetic join space; records compare by their piece
/// list (lexicographic) and then by total logical size, so identical piece
/// layouts map to the same join-space offset.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct JoinRecord {
    pieces: Vec<VarnodeData>,
    logical_size: u32,
}

impl JoinRecord {
    /// Returns a new join record over the given pieces.
    pub fn new(pieces: Vec<VarnodeData>, logical_size: u32) -> JoinRecord {
        JoinRecord {
            pieces,
            logical_size,
        }
    }

    /// Returns the number of pieces.
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Returns the piece with the given index, most significant first.
    pub fn piece(&self, index: usize) -> &VarnodeData {
        &self.pieces[index]
    }

    /// Returns an iterator over the pieces, most significant first.
    pub fn iter(&self) -> impl Iterator<Item = &VarnodeData> {
        self.pieces.iter()
    }

    /// Returns the size in bytes of the whole logical value.
    pub fn logical_size(&self) -> u32 {
        self.logical_size
    }

    /// Returns true iff this record models a small float stored in a larger
    /// register, rather than a value split over several locations.
    pub fn is_float_extension(&self) -> bool {
        self.pieces.len() == 1 && self.pieces[0].size > self.logical_size
    }
}

impl Display for JoinRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "join(")?;
        for (i, piece) in self.pieces.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", piece)?;
        }
        write!(f, "):{}", self.logical_size)
    }
}
