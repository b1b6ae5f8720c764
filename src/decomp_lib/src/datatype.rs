//! A minimal model of source-level data-types.
//!
//! The transformation rules only need enough type structure to drive
//! re-typing decisions: byte sizes, signedness, float-ness, and the element
//! and field layout behind pointers. Full type recovery is the business of a
//! downstream analysis and is not modelled here.

use crate::prelude::*;

use std::fmt::{self, Display};
use std::sync::Arc;

/// A data-type attached to a Varnode.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum DataType {
    /// A value of known size but unknown interpretation.
    Unknown {
        /// The size in bytes.
        size: u32,
    },
    /// A one-byte truth value.
    Bool,
    /// A two's-complement integer.
    Int {
        /// The size in bytes.
        size: u32,
        /// Whether the integer is signed.
        signed: bool,
    },
    /// An IEEE-754 floating point value.
    Float {
        /// The size in bytes.
        size: u32,
    },
    /// A pointer to another type.
    Pointer {
        /// The size of the pointer itself in bytes.
        size: u32,
        /// The referenced type.
        to: Arc<DataType>,
    },
    /// A homogeneous array.
    Array {
        /// The element type.
        element: Arc<DataType>,
        /// The number of elements.
        count: u64,
    },
    /// A composite with named fields at fixed offsets.
    Struct {
        /// The name of the composite.
        name: String,
        /// The fields, sorted by offset.
        fields: Vec<StructField>,
        /// The total size in bytes.
        size: u32,
    },
}

/// One field of a [`DataType::Struct`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct StructField {
    /// The byte offset of the field within the composite.
    pub offset: u64,
    /// The name of the field.
    pub name: String,
    /// The type of the field.
    pub datatype: Arc<DataType>,
}

impl DataType {
    /// Returns the size of the type in bytes.
    pub fn size(&self) -> u32 {
        match self {
            DataType::Unknown { size } => *size,
            DataType::Bool => 1,
            DataType::Int { size, .. } => *size,
            DataType::Float { size } => *size,
            DataType::Pointer { size, .. } => *size,
            DataType::Array { element, count } => element.size() * *count as u32,
            DataType::Struct { size, .. } => *size,
        }
    }

    /// Returns true iff this is a pointer type.
    pub fn is_pointer(&self) -> bool {
        matches!(self, DataType::Pointer { .. })
    }

    /// Returns true iff this is a float type.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float { .. })
    }

    /// Returns true iff nothing is known about the value beyond its size.
    pub fn is_unknown(&self) -> bool {
        matches!(self, DataType::Unknown { .. })
    }

    /// Returns the referenced type, if this is a pointer.
    pub fn pointee(&self) -> Option<&Arc<DataType>> {
        match self {
            DataType::Pointer { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Returns the component type at the given byte offset, together with the
    /// remaining offset into that component.
    ///
    /// For arrays this resolves to the element, for structs to the field
    /// covering the offset. Scalars resolve to themselves at offset zero only.
    pub fn component_at(&self, offset: u64) -> Option<(&Arc<DataType>, u64)> {
        match self {
            DataType::Array { element, count } => {
                let elsize = element.size() as u64;
                if elsize == 0 || offset >= elsize * count {
                    return None;
                }
                Some((element, offset % elsize))
            }
            DataType::Struct { fields, .. } => {
                let field = fields
                    .iter()
                    .rev()
                    .find(|field| field.offset <= offset)?;
                let diff = offset - field.offset;
                if diff >= field.datatype.size() as u64 {
                    return None;
                }
                Some((&field.datatype, diff))
            }
            _ => None,
        }
    }

    /// Returns an unknown type of the given size.
    pub fn unknown(size: u32) -> Arc<DataType> {
        Arc::new(DataType::Unknown { size })
    }

    /// Returns a signed integer type of the given size.
    pub fn int(size: u32) -> Arc<DataType> {
        Arc::new(DataType::Int { size, signed: true })
    }

    /// Returns an unsigned integer type of the given size.
    pub fn uint(size: u32) -> Arc<DataType> {
        Arc::new(DataType::Int {
            size,
            signed: false,
        })
    }

    /// Returns a float type of the given size.
    pub fn float(size: u32) -> Arc<DataType> {
        Arc::new(DataType::Float { size })
    }

    /// Returns a pointer of the given size to the given type.
    pub fn pointer(size: u32, to: Arc<DataType>) -> Arc<DataType> {
        Arc::new(DataType::Pointer { size, to })
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Unknown { size } => write!(f, "undefined{}", size),
            DataType::Bool => write!(f, "bool"),
            DataType::Int { size, signed: true } => write!(f, "int{}", size * 8),
            DataType::Int {
                size,
                signed: false,
            } => write!(f, "uint{}", size * 8),
            DataType::Float { size } => write!(f, "float{}", size * 8),
            DataType::Pointer { to, .. } => write!(f, "{} *", to),
            DataType::Array { element, count } => write!(f, "{}[{}]", element, count),
            DataType::Struct { name, .. } => write!(f, "struct {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_lookup() {
        let int4 = DataType::int(4);
        let array = Arc::new(DataType::Array {
            element: int4.clone(),
            count: 8,
        });
        let (element, rem) = array.component_at(9).unwrap();
        assert_eq!(element, &int4);
        assert_eq!(rem, 1);
        assert!(array.component_at(32).is_none());

        let composite = DataType::Struct {
            name: "pair".to_string(),
            fields: vec![
                StructField {
                    offset: 0,
                    name: "first".to_string(),
                    datatype: int4.clone(),
                },
                StructField {
                    offset: 8,
                    name: "second".to_string(),
                    datatype: int4.clone(),
                },
            ],
            size: 16,
        };
        let (field, rem) = composite.component_at(8).unwrap();
        assert_eq!(field, &int4);
        assert_eq!(rem, 0);
        assert!(composite.component_at(6).is_none());
    }
}
