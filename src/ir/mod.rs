//! Math IR
//!
//! The symbolic, pre-lowering half of the two-level IR: the `Fusion` arena,
//! its `Val`/`Expr` nodes, arithmetic builders, and the dispatch/comparison
//! framework. The lowered kernel IR lives in [`crate::lower`].

mod arith;
mod fusion;
mod node;
mod visitor;

pub use fusion::Fusion;
pub use node::{
    ComputeAtLink, Expr, ExprId, ExprKind, IterDomain, ScalarConst, TensorDomain, TensorIndex,
    TensorView, Val, ValId, ValKind,
};
pub use visitor::IrVisitor;
