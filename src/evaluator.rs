//! Scalar Expression Evaluator
//!
//! Evaluates integer scalar expressions over a set of bindings, typically
//! root-domain extents bound from the concrete sizes of the tensors handed
//! to a launch. The reduction scheduler uses it to size its tiling; the
//! executor uses it to materialize the launch configuration.

use std::collections::HashMap;

use crate::ir::{ExprKind, Fusion, ValId, ValKind};
use crate::types::{BinaryOpKind, UnaryOpKind};

/// Binding-based evaluator over a fusion's scalar values.
#[derive(Debug)]
pub struct ExpressionEvaluator<'a> {
    fusion: &'a Fusion,
    bindings: HashMap<ValId, i64>,
    memo: HashMap<ValId, Option<i64>>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(fusion: &'a Fusion) -> Self {
        ExpressionEvaluator { fusion, bindings: HashMap::new(), memo: HashMap::new() }
    }

    /// Bind a value (usually a symbolic extent) to a concrete integer.
    pub fn bind(&mut self, val: ValId, value: i64) {
        self.bindings.insert(val, value);
        self.memo.clear();
    }

    /// Evaluate a scalar value; `None` when it depends on an unbound
    /// symbol.
    pub fn evaluate(&mut self, val: ValId) -> Option<i64> {
        if let Some(&v) = self.bindings.get(&val) {
            return Some(v);
        }
        if let Some(&memoized) = self.memo.get(&val) {
            return memoized;
        }
        let result = self.evaluate_uncached(val);
        self.memo.insert(val, result);
        result
    }

    fn evaluate_uncached(&mut self, val: ValId) -> Option<i64> {
        match self.fusion.val(val).kind() {
            ValKind::Scalar { value: Some(c) } => c.as_int(),
            ValKind::Scalar { value: None } => {
                let def = self.fusion.val(val).definition()?;
                self.evaluate_expr(def, val)
            }
            ValKind::NamedScalar { .. } => None,
            _ => None,
        }
    }

    fn evaluate_expr(&mut self, expr: crate::ir::ExprId, _out: ValId) -> Option<i64> {
        let (kind, inputs) = {
            let e = self.fusion.expr(expr);
            (e.kind().clone(), e.inputs().to_vec())
        };
        match kind {
            ExprKind::Unary { op } => {
                let v = self.evaluate(inputs[0])?;
                match op {
                    UnaryOpKind::Neg => Some(-v),
                    UnaryOpKind::Abs => Some(v.abs()),
                    UnaryOpKind::Set | UnaryOpKind::Cast => Some(v),
                    _ => None,
                }
            }
            ExprKind::Binary { op } => {
                let lhs = self.evaluate(inputs[0])?;
                let rhs = self.evaluate(inputs[1])?;
                match op {
                    BinaryOpKind::Add => Some(lhs + rhs),
                    BinaryOpKind::Sub => Some(lhs - rhs),
                    BinaryOpKind::Mul => Some(lhs * rhs),
                    BinaryOpKind::Div => (rhs != 0).then(|| lhs / rhs),
                    BinaryOpKind::Mod => (rhs != 0).then(|| lhs % rhs),
                    BinaryOpKind::CeilDiv => (rhs != 0).then(|| (lhs + rhs - 1) / rhs),
                    BinaryOpKind::Max => Some(lhs.max(rhs)),
                    BinaryOpKind::Min => Some(lhs.min(rhs)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
