//! IR Node Types
//!
//! A fusion is a typed DAG of values (`Val`) and operations (`Expr`). Both
//! are stored by value inside the owning [`Fusion`](super::Fusion) arena and
//! referenced through index handles (`ValId`, `ExprId`), so node identity is
//! stable and no reference counting is involved.
//!
//! Every `Val` records its defining `Expr` (if any); every `Expr` holds its
//! ordered input and output handles. Iteration domains, tensor domains,
//! tensor views and lowered tensor indices are all `Val` kinds, which lets
//! domain transformations (`Split`, `Merge`) live in the same DAG as the
//! math expressions they describe.

use crate::types::{
    BinaryOpKind, DataType, IterType, MemoryType, ParallelType, TernaryOpKind, UnaryOpKind,
};
use std::fmt;

/// Handle of a value inside its owning fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValId(pub(crate) u32);

/// Handle of an expression inside its owning fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) u32);

impl ValId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Constant payload of a scalar value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarConst {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarConst {
    pub fn as_int(self) -> Option<i64> {
        match self {
            ScalarConst::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarConst::Int(v) => write!(f, "{v}"),
            ScalarConst::Float(v) => {
                if v.fract() == 0.0 {
                    write!(f, "{v:.1}f")
                } else {
                    write!(f, "{v}f")
                }
            }
            ScalarConst::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A half-open iteration range `[start, start + extent)` with a parallel
/// mapping tag and a role flag.
#[derive(Debug, Clone, PartialEq)]
pub struct IterDomain {
    /// Range start (scalar Val, almost always the zero constant)
    pub start: ValId,
    /// Range extent (scalar Val; symbolic until bound at launch)
    pub extent: ValId,
    /// Parallel mapping chosen by the scheduler
    pub parallel: ParallelType,
    /// Iteration / reduction / broadcast role
    pub iter_type: IterType,
    /// Remains from splitting a reduction into two stages
    pub is_rfactor: bool,
}

impl IterDomain {
    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    pub fn is_broadcast(&self) -> bool {
        self.iter_type.is_broadcast()
    }

    pub fn is_block_dim(&self) -> bool {
        self.parallel.is_block_dim()
    }

    pub fn is_thread_dim(&self) -> bool {
        self.parallel.is_thread_dim()
    }

    /// Mapped to any device-parallel dimension.
    pub fn is_thread(&self) -> bool {
        self.parallel.is_thread()
    }
}

/// An ordered tuple of iteration domains, remembering the original (root)
/// tuple and, after an rfactor, the rfactor tuple.
///
/// `split`/`merge`/`reorder` rewrite only `domain`; `root` is immutable for
/// the lifetime of the tensor and carries the per-axis contiguity flags.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDomain {
    /// Pre-transformation axes; contiguity flags index into this tuple
    pub root: Vec<ValId>,
    /// Root of the post-rfactor view (empty when no rfactor happened)
    pub rfactor: Vec<ValId>,
    /// Current axes after scheduling transformations
    pub domain: Vec<ValId>,
    /// Per-root-axis contiguity
    pub contiguity: Vec<bool>,
}

impl TensorDomain {
    pub fn n_dims(&self) -> usize {
        self.domain.len()
    }

    pub fn has_rfactor(&self) -> bool {
        !self.rfactor.is_empty()
    }

    /// The rfactor tuple when present, the root tuple otherwise. Indexing
    /// propagates loop variables back to this tuple.
    pub fn maybe_rfactor(&self) -> &[ValId] {
        if self.rfactor.is_empty() {
            &self.root
        } else {
            &self.rfactor
        }
    }
}

/// Record of a computeAt relation: this tensor's first `pos` current-domain
/// axes are shared loops with `consumer`'s first `pos` axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeAtLink {
    pub consumer: ValId,
    pub pos: usize,
}

/// A tensor surface backed by a [`TensorDomain`].
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    /// Backing domain (a `Val` of kind `TensorDomain`)
    pub domain: ValId,
    /// Memory class; intermediates default to `Local` until lowering decides
    pub memory: MemoryType,
    /// Directional computeAt link, if set by the scheduler
    pub compute_at: Option<ComputeAtLink>,
    /// How many of this tensor's own leading axes live in loops shared with
    /// a neighbor (its computeAt target, or a producer computed into it)
    pub this_compute_at_pos: usize,
}

/// A lowered address for one tensor slot: an ordered list of scalar values
/// (strided sub-expressions) to be summed at emission.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorIndex {
    pub view: ValId,
    pub indices: Vec<ValId>,
}

/// Discriminated payload of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValKind {
    /// A scalar, constant when `value` is present
    Scalar { value: Option<ScalarConst> },
    /// A scalar with a fixed spelling in the emitted kernel
    /// (e.g. `threadIdx.x`, `T3.stride[2]`)
    NamedScalar { name: String },
    IterDomain(IterDomain),
    TensorDomain(TensorDomain),
    TensorView(TensorView),
    TensorIndex(TensorIndex),
}

/// A typed value handle owned by a fusion.
#[derive(Debug, Clone)]
pub struct Val {
    pub(crate) name: u64,
    pub(crate) dtype: DataType,
    pub(crate) kind: ValKind,
    pub(crate) definition: Option<ExprId>,
    pub(crate) uses: Vec<ExprId>,
}

impl Val {
    /// Per-fusion unique name, monotonically assigned at registration.
    pub fn name(&self) -> u64 {
        self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn kind(&self) -> &ValKind {
        &self.kind
    }

    /// The expression producing this value, if any.
    pub fn definition(&self) -> Option<ExprId> {
        self.definition
    }

    /// Expressions consuming this value, in registration order.
    pub fn uses(&self) -> &[ExprId] {
        &self.uses
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ValKind::Scalar { .. } | ValKind::NamedScalar { .. })
    }

    pub fn is_tensor_view(&self) -> bool {
        matches!(self.kind, ValKind::TensorView(_))
    }

    pub fn is_iter_domain(&self) -> bool {
        matches!(self.kind, ValKind::IterDomain(_))
    }

    /// Constant scalar payload, if this is a constant scalar.
    pub fn const_scalar(&self) -> Option<ScalarConst> {
        match &self.kind {
            ValKind::Scalar { value } => *value,
            _ => None,
        }
    }

    /// Constant integer payload, if this is a constant `Int` scalar.
    pub fn const_int(&self) -> Option<i64> {
        self.const_scalar().and_then(ScalarConst::as_int)
    }

    pub fn is_const_scalar(&self) -> bool {
        self.const_scalar().is_some()
    }

    pub fn is_zero_int(&self) -> bool {
        self.const_int() == Some(0)
    }

    pub fn is_one_int(&self) -> bool {
        self.const_int() == Some(1)
    }

    pub fn as_iter_domain(&self) -> Option<&IterDomain> {
        match &self.kind {
            ValKind::IterDomain(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_tensor_domain(&self) -> Option<&TensorDomain> {
        match &self.kind {
            ValKind::TensorDomain(td) => Some(td),
            _ => None,
        }
    }

    pub fn as_tensor_view(&self) -> Option<&TensorView> {
        match &self.kind {
            ValKind::TensorView(tv) => Some(tv),
            _ => None,
        }
    }
}

/// Discriminated payload of an expression.
///
/// Math expressions connect tensor views and scalars; `Split` and `Merge`
/// connect iteration domains and form the transformation history consumed by
/// backward index propagation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// inputs: `[in]`, outputs: `[out]`
    Unary { op: UnaryOpKind },
    /// inputs: `[lhs, rhs]`, outputs: `[out]`
    Binary { op: BinaryOpKind },
    /// inputs: `[a, b, c]`, outputs: `[out]`
    Ternary { op: TernaryOpKind },
    /// inputs: `[in]`, outputs: `[out]`; reduces the axes flagged as
    /// reduction in the output's root domain, folding with `op` from `init`
    Reduction { op: BinaryOpKind, init: ValId },
    /// inputs: `[in]`, outputs: `[out]`; `is_new_axis[i]` marks output root
    /// axes with no producer counterpart
    Broadcast { is_new_axis: Vec<bool> },
    /// inputs: `[in]`, outputs: `[outer, inner]`; `inner` has extent
    /// `factor`, `outer` has extent `ceilDiv(in.extent, factor)`
    Split { factor: ValId },
    /// inputs: `[outer, inner]`, outputs: `[out]`; row-major `(outer, inner)`
    Merge,
}

impl ExprKind {
    /// True for expressions whose inputs/outputs are iteration domains.
    pub fn is_domain_transform(&self) -> bool {
        matches!(self, ExprKind::Split { .. } | ExprKind::Merge)
    }
}

/// An operation node owned by a fusion.
#[derive(Debug, Clone)]
pub struct Expr {
    pub(crate) name: u64,
    pub(crate) kind: ExprKind,
    pub(crate) inputs: Vec<ValId>,
    pub(crate) outputs: Vec<ValId>,
}

impl Expr {
    pub fn name(&self) -> u64 {
        self.name
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.outputs
    }

    /// First output; every expression has at least one.
    pub fn output(&self) -> ValId {
        self.outputs[0]
    }

    pub fn is_domain_transform(&self) -> bool {
        self.kind.is_domain_transform()
    }
}
