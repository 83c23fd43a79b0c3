//! Kernel IR
//!
//! The lowered half of the two-level IR: scoped statements (for-loops,
//! conditionals, allocations, barriers) whose leaves are math operations
//! over address-computed tensor slots. Scalar operands stay as math-IR
//! value handles; tensor operands are `TensorIndex` values produced by the
//! indexing pass.

use crate::ir::{Fusion, ValId, ValKind};
use crate::types::{BinaryOpKind, MemoryType, TernaryOpKind, UnaryOpKind};

/// A lowered operand: either an address-computed tensor slot or a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KirVal {
    /// A `TensorIndex` value
    TensorSlot(ValId),
    /// Any scalar value
    Scalar(ValId),
}

impl KirVal {
    pub fn val(self) -> ValId {
        match self {
            KirVal::TensorSlot(v) | KirVal::Scalar(v) => v,
        }
    }

    /// The tensor view behind this operand, if it is a tensor slot.
    pub fn tensor_view(self, fusion: &Fusion) -> Option<ValId> {
        match self {
            KirVal::TensorSlot(ti) => match fusion.val(ti).kind() {
                ValKind::TensorIndex(index) => Some(index.view),
                _ => None,
            },
            KirVal::Scalar(_) => None,
        }
    }
}

/// A lowered for-loop: an index variable iterating an iteration domain.
/// Parallel domains carry the corresponding named index and emit no loop
/// statement.
#[derive(Debug, Clone)]
pub struct ForLoop {
    pub index: ValId,
    pub iter_domain: ValId,
    pub body: Vec<KirExpr>,
}

/// A lowered statement.
#[derive(Debug, Clone)]
pub enum KirExpr {
    /// `out = op(input)`
    Unary { op: UnaryOpKind, out: KirVal, input: KirVal },
    /// `out = lhs op rhs`
    Binary { op: BinaryOpKind, out: KirVal, lhs: KirVal, rhs: KirVal },
    /// `out = op(a, b, c)`
    Ternary { op: TernaryOpKind, out: KirVal, a: KirVal, b: KirVal, c: KirVal },
    /// Reduction update; folds `input` into `out` with `op`. When the
    /// output's reduction axes are device-parallel this lowers to a
    /// block/grid reduction helper call, guarded by `pred`.
    Reduction {
        op: BinaryOpKind,
        out: KirVal,
        input: KirVal,
        init: ValId,
        pred: Option<ValId>,
    },
    /// Value broadcast across threads of the parallel dimensions the output
    /// spans but the input does not.
    Broadcast { out: KirVal, input: KirVal },
    /// Scoped loop
    ForLoop(ForLoop),
    /// Conditional (tail-guard predicates)
    IfThenElse { cond: ValId, then_body: Vec<KirExpr>, else_body: Vec<KirExpr> },
    /// Buffer declaration for a tensor view, with a symbolic element count
    Allocate { tv: ValId, memory: MemoryType, size: ValId },
    /// Block-wide barrier; `war` marks barriers inserted for
    /// write-after-read protection
    Sync { war: bool },
}

impl KirExpr {
    /// Is this a tensor math statement (not scoping, not bookkeeping)?
    pub fn is_tensor_op(&self) -> bool {
        matches!(
            self,
            KirExpr::Unary { .. }
                | KirExpr::Binary { .. }
                | KirExpr::Ternary { .. }
                | KirExpr::Reduction { .. }
                | KirExpr::Broadcast { .. }
        )
    }

    /// The tensor view written by this statement, if any.
    pub fn output_tv(&self, fusion: &Fusion) -> Option<ValId> {
        match self {
            KirExpr::Unary { out, .. }
            | KirExpr::Binary { out, .. }
            | KirExpr::Ternary { out, .. }
            | KirExpr::Reduction { out, .. }
            | KirExpr::Broadcast { out, .. } => out.tensor_view(fusion),
            _ => None,
        }
    }

    /// Tensor views read by this statement.
    pub fn input_tvs(&self, fusion: &Fusion) -> Vec<ValId> {
        let operands: Vec<KirVal> = match self {
            KirExpr::Unary { input, .. } => vec![*input],
            KirExpr::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            KirExpr::Ternary { a, b, c, .. } => vec![*a, *b, *c],
            KirExpr::Reduction { input, .. } => vec![*input],
            KirExpr::Broadcast { input, .. } => vec![*input],
            _ => Vec::new(),
        };
        operands
            .into_iter()
            .filter_map(|v| v.tensor_view(fusion))
            .collect()
    }
}

/// A lowered kernel: the top-level statement list plus summary facts the
/// code emitter and executor need.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub top_level: Vec<KirExpr>,
    /// Fusion uses Philox RNG and needs a (seed, offset) argument pair
    pub has_rng: bool,
    /// Fusion contains a grid reduction and needs scratch buffers
    pub has_grid_reduction: bool,
}
