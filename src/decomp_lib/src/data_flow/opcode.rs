//! The closed enumeration of p-code operations.

use crate::prelude::*;

use std::fmt::{self, Display};

/// A p-code operation code.
///
/// Each op takes an ordered list of input varnodes and produces at most one
/// output varnode. The first block of codes is produced directly by
/// instruction lifting; the codes from [`MULTIEQUAL`](OpCode::MULTIEQUAL)
/// onward are introduced by the analysis itself.
#[allow(missing_docs)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum OpCode {
    COPY,
    LOAD,
    STORE,

    BRANCH,
    CBRANCH,
    BRANCHIND,
    CALL,
    CALLIND,
    CALLOTHER,
    RETURN,

    INT_EQUAL,
    INT_NOTEQUAL,
    INT_SLESS,
    INT_SLESSEQUAL,
    INT_LESS,
    INT_LESSEQUAL,

    INT_ZEXT,
    INT_SEXT,

    INT_ADD,
    INT_SUB,
    INT_CARRY,
    INT_SCARRY,
    INT_SBORROW,
    INT_2COMP,
    INT_NEGATE,

    INT_XOR,
    INT_AND,
    INT_OR,

    INT_LEFT,
    INT_RIGHT,
    INT_SRIGHT,

    INT_MULT,
    INT_DIV,
    INT_SDIV,
    INT_REM,
    INT_SREM,

    BOOL_NEGATE,
    BOOL_XOR,
    BOOL_AND,
    BOOL_OR,

    FLOAT_EQUAL,
    FLOAT_NOTEQUAL,
    FLOAT_LESS,
    FLOAT_LESSEQUAL,
    FLOAT_NAN,

    FLOAT_ADD,
    FLOAT_DIV,
    FLOAT_MULT,
    FLOAT_SUB,
    FLOAT_NEG,
    FLOAT_ABS,
    FLOAT_SQRT,

    FLOAT_INT2FLOAT,
    FLOAT_FLOAT2FLOAT,
    FLOAT_TRUNC,
    FLOAT_CEIL,
    FLOAT_FLOOR,
    FLOAT_ROUND,

    POPCOUNT,
    LZCOUNT,

    MULTIEQUAL,
    INDIRECT,
    PIECE,
    SUBPIECE,

    CAST,
    PTRADD,
    PTRSUB,

    SEGMENTOP,
    CPOOLREF,
    NEW,
    INSERT,
    EXTRACT,

    UNIMPLEMENTED,
}

impl OpCode {
    /// Returns true iff this op transfers control flow within the function.
    pub fn is_branch(&self) -> bool {
        use OpCode::*;
        matches!(self, BRANCH | CBRANCH | BRANCHIND)
    }

    /// Returns true iff this op calls another function.
    ///
    /// NEW counts as a call because it invokes an allocator with
    /// caller-invisible effects.
    pub fn is_call(&self) -> bool {
        use OpCode::*;
        matches!(self, CALL | CALLIND | CALLOTHER | NEW)
    }

    /// Returns true iff this op ends the control flow of the function.
    pub fn is_flow_break(&self) -> bool {
        matches!(self, OpCode::RETURN)
    }

    /// Returns true iff this op is an analysis marker rather than an
    /// executable operation.
    pub fn is_marker(&self) -> bool {
        use OpCode::*;
        matches!(self, MULTIEQUAL | INDIRECT)
    }

    /// Returns true iff the output of this op is a one-byte truth value.
    pub fn is_boolean_output(&self) -> bool {
        use OpCode::*;
        matches!(
            self,
            INT_EQUAL
                | INT_NOTEQUAL
                | INT_SLESS
                | INT_SLESSEQUAL
                | INT_LESS
                | INT_LESSEQUAL
                | INT_CARRY
                | INT_SCARRY
                | INT_SBORROW
                | BOOL_NEGATE
                | BOOL_XOR
                | BOOL_AND
                | BOOL_OR
                | FLOAT_EQUAL
                | FLOAT_NOTEQUAL
                | FLOAT_LESS
                | FLOAT_LESSEQUAL
                | FLOAT_NAN
        )
    }

    /// Returns true iff swapping the two inputs of this op does not change
    /// its result.
    pub fn is_commutative(&self) -> bool {
        use OpCode::*;
        matches!(
            self,
            INT_EQUAL
                | INT_NOTEQUAL
                | INT_ADD
                | INT_XOR
                | INT_AND
                | INT_OR
                | INT_MULT
                | INT_CARRY
                | INT_SCARRY
                | BOOL_XOR
                | BOOL_AND
                | BOOL_OR
                | FLOAT_EQUAL
                | FLOAT_NOTEQUAL
                | FLOAT_ADD
                | FLOAT_MULT
        )
    }

    /// Returns true iff this op operates on floating point values.
    pub fn is_float_op(&self) -> bool {
        use OpCode::*;
        matches!(
            self,
            FLOAT_EQUAL
                | FLOAT_NOTEQUAL
                | FLOAT_LESS
                | FLOAT_LESSEQUAL
                | FLOAT_NAN
                | FLOAT_ADD
                | FLOAT_DIV
                | FLOAT_MULT
                | FLOAT_SUB
                | FLOAT_NEG
                | FLOAT_ABS
                | FLOAT_SQRT
                | FLOAT_INT2FLOAT
                | FLOAT_FLOAT2FLOAT
                | FLOAT_TRUNC
                | FLOAT_CEIL
                | FLOAT_FLOOR
                | FLOAT_ROUND
        )
    }

    /// Returns the op computing the boolean complement of this comparison,
    /// with the same inputs, if one exists.
    pub fn boolean_negate(&self) -> Option<OpCode> {
        use OpCode::*;
        match self {
            INT_EQUAL => Some(INT_NOTEQUAL),
            INT_NOTEQUAL => Some(INT_EQUAL),
            FLOAT_EQUAL => Some(FLOAT_NOTEQUAL),
            FLOAT_NOTEQUAL => Some(FLOAT_EQUAL),
            _ => None,
        }
    }

    /// Returns the number of inputs the op takes when lifted from machine
    /// code, or `None` for ops with variable arity.
    pub fn min_inputs(&self) -> Option<usize> {
        use OpCode::*;
        match self {
            COPY | INT_ZEXT | INT_SEXT | INT_2COMP | INT_NEGATE | BOOL_NEGATE | FLOAT_NEG
            | FLOAT_ABS | FLOAT_SQRT | FLOAT_INT2FLOAT | FLOAT_FLOAT2FLOAT | FLOAT_TRUNC
            | FLOAT_CEIL | FLOAT_FLOOR | FLOAT_ROUND | FLOAT_NAN | POPCOUNT | LZCOUNT
            | BRANCH | BRANCHIND => Some(1),
            LOAD | CBRANCH | SUBPIECE | PIECE => Some(2),
            STORE | PTRADD => Some(3),
            MULTIEQUAL | INDIRECT | CALL | CALLIND | CALLOTHER | RETURN | SEGMENTOP
            | CPOOLREF | NEW | INSERT | EXTRACT | UNIMPLEMENTED => None,
            _ => Some(2),
        }
    }
}

impl Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(OpCode::CBRANCH.is_branch());
        assert!(OpCode::NEW.is_call());
        assert!(OpCode::MULTIEQUAL.is_marker());
        assert!(OpCode::INT_ADD.is_commutative());
        assert!(!OpCode::INT_SUB.is_commutative());
        assert!(OpCode::INT_SLESS.is_boolean_output());
        assert_eq!(OpCode::INT_EQUAL.boolean_negate(), Some(OpCode::INT_NOTEQUAL));
    }
}
