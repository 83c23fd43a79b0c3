//! IR Dispatch and Structural Comparison
//!
//! Double-dispatch over expression kinds through a small trait with one
//! handler per kind, plus the read-only structural `same_as` comparison
//! (equality modulo names, scalar-constant aware) used by caches and tests.

use crate::ir::fusion::Fusion;
use crate::ir::node::{ExprId, ExprKind, ValId, ValKind};

/// Read-only visitor over the expressions of a fusion.
///
/// `dispatch` routes an expression to its kind handler; every handler
/// defaults to a no-op, so implementors override only what they care about.
pub trait IrVisitor {
    fn handle_unary(&mut self, _fusion: &Fusion, _expr: ExprId) {}
    fn handle_binary(&mut self, _fusion: &Fusion, _expr: ExprId) {}
    fn handle_ternary(&mut self, _fusion: &Fusion, _expr: ExprId) {}
    fn handle_reduction(&mut self, _fusion: &Fusion, _expr: ExprId) {}
    fn handle_broadcast(&mut self, _fusion: &Fusion, _expr: ExprId) {}
    fn handle_split(&mut self, _fusion: &Fusion, _expr: ExprId) {}
    fn handle_merge(&mut self, _fusion: &Fusion, _expr: ExprId) {}

    fn dispatch(&mut self, fusion: &Fusion, expr: ExprId) {
        match fusion.expr(expr).kind() {
            ExprKind::Unary { .. } => self.handle_unary(fusion, expr),
            ExprKind::Binary { .. } => self.handle_binary(fusion, expr),
            ExprKind::Ternary { .. } => self.handle_ternary(fusion, expr),
            ExprKind::Reduction { .. } => self.handle_reduction(fusion, expr),
            ExprKind::Broadcast { .. } => self.handle_broadcast(fusion, expr),
            ExprKind::Split { .. } => self.handle_split(fusion, expr),
            ExprKind::Merge => self.handle_merge(fusion, expr),
        }
    }

    /// Visit all expressions reachable from the fusion outputs in forward
    /// dependency order.
    fn traverse(&mut self, fusion: &Fusion)
    where
        Self: Sized,
    {
        for expr in fusion.exprs_from_outputs() {
            self.dispatch(fusion, expr);
        }
    }

    /// Visit all expressions reachable from the fusion outputs in reverse
    /// dependency order (consumers before producers).
    fn traverse_backward(&mut self, fusion: &Fusion)
    where
        Self: Sized,
    {
        for expr in fusion.exprs_from_outputs().into_iter().rev() {
            self.dispatch(fusion, expr);
        }
    }
}

impl Fusion {
    /// Structural equality of two values modulo names. Constant scalars
    /// compare by value; composite values compare component-wise.
    pub fn same_as_vals(&self, a: ValId, b: ValId) -> bool {
        if a == b {
            return true;
        }
        let va = self.val(a);
        let vb = self.val(b);
        if va.dtype() != vb.dtype() {
            return false;
        }
        match (va.kind(), vb.kind()) {
            (ValKind::Scalar { value: ca }, ValKind::Scalar { value: cb }) => match (ca, cb) {
                (Some(x), Some(y)) => x == y,
                // Two distinct symbolic scalars are only the same value if
                // their defining expressions are.
                (None, None) => match (va.definition(), vb.definition()) {
                    (Some(ea), Some(eb)) => self.same_as_exprs(ea, eb),
                    _ => false,
                },
                _ => false,
            },
            (ValKind::NamedScalar { name: na }, ValKind::NamedScalar { name: nb }) => na == nb,
            (ValKind::IterDomain(da), ValKind::IterDomain(db)) => {
                da.parallel == db.parallel
                    && da.iter_type == db.iter_type
                    && da.is_rfactor == db.is_rfactor
                    && self.same_as_vals(da.start, db.start)
                    && self.same_as_vals(da.extent, db.extent)
            }
            (ValKind::TensorDomain(ta), ValKind::TensorDomain(tb)) => {
                self.same_as_val_lists(&ta.root, &tb.root)
                    && self.same_as_val_lists(&ta.rfactor, &tb.rfactor)
                    && self.same_as_val_lists(&ta.domain, &tb.domain)
                    && ta.contiguity == tb.contiguity
            }
            (ValKind::TensorView(tva), ValKind::TensorView(tvb)) => {
                tva.memory == tvb.memory && self.same_as_vals(tva.domain, tvb.domain)
            }
            (ValKind::TensorIndex(ia), ValKind::TensorIndex(ib)) => {
                self.same_as_vals(ia.view, ib.view)
                    && self.same_as_val_lists(&ia.indices, &ib.indices)
            }
            _ => false,
        }
    }

    fn same_as_val_lists(&self, a: &[ValId], b: &[ValId]) -> bool {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(&x, &y)| self.same_as_vals(x, y))
    }

    /// Structural equality of two expressions modulo names.
    pub fn same_as_exprs(&self, a: ExprId, b: ExprId) -> bool {
        if a == b {
            return true;
        }
        let ea = self.expr(a);
        let eb = self.expr(b);
        let kinds_match = match (ea.kind(), eb.kind()) {
            (ExprKind::Split { factor: fa }, ExprKind::Split { factor: fb }) => {
                self.same_as_vals(*fa, *fb)
            }
            (ExprKind::Reduction { op: oa, init: ia }, ExprKind::Reduction { op: ob, init: ib }) => {
                oa == ob && self.same_as_vals(*ia, *ib)
            }
            (ka, kb) => ka == kb,
        };
        kinds_match
            && self.same_as_val_lists(ea.inputs(), eb.inputs())
            && self.same_as_val_lists(ea.outputs(), eb.outputs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinaryOpKind, DataType};

    #[test]
    fn test_constant_scalars_compare_by_value() {
        let mut fusion = Fusion::new();
        let a = fusion.new_int(3);
        let b = fusion.new_int(3);
        let c = fusion.new_int(4);
        assert!(fusion.same_as_vals(a, b));
        assert!(!fusion.same_as_vals(a, c));
    }

    #[test]
    fn test_symbolic_scalars_compare_by_definition() {
        let mut fusion = Fusion::new();
        let x = fusion.new_scalar(DataType::Int);
        let y = fusion.new_scalar(DataType::Int);
        let two = fusion.new_int(2);
        let a = fusion.mul(x, two);
        let two2 = fusion.new_int(2);
        let b = fusion.mul(x, two2);
        let c = fusion.mul(y, two);
        assert!(fusion.same_as_vals(a, b));
        assert!(!fusion.same_as_vals(a, c));
    }

    #[test]
    fn test_visitor_dispatch_counts_kinds() {
        #[derive(Default)]
        struct Counter {
            binary: usize,
            unary: usize,
        }
        impl IrVisitor for Counter {
            fn handle_binary(&mut self, _f: &Fusion, _e: ExprId) {
                self.binary += 1;
            }
            fn handle_unary(&mut self, _f: &Fusion, _e: ExprId) {
                self.unary += 1;
            }
        }

        let mut fusion = Fusion::new();
        let a = fusion.new_tensor(DataType::Float, 1);
        let b = fusion.new_tensor(DataType::Float, 1);
        let sum = fusion.binary(BinaryOpKind::Add, a, b);
        let neg = fusion.unary(crate::types::UnaryOpKind::Neg, sum);
        fusion.add_output(neg);

        let mut counter = Counter::default();
        counter.traverse(&fusion);
        assert_eq!(counter.binary, 1);
        assert_eq!(counter.unary, 1);
    }
}
