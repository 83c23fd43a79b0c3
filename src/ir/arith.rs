//! IR Construction Helpers
//!
//! Builder methods on [`Fusion`] for scalars, iteration domains, tensors and
//! the math operations connecting them. Tensor-typed operations create the
//! output tensor view with a fresh root domain mirroring the producer's
//! non-reduction axes, so reduction axes never leak into consumers.
//!
//! Scalar arithmetic applies light constant folding on integer identities
//! (`x + 0`, `x * 1`, `x * 0`); backward index propagation relies on zero
//! indices staying recognizably zero.

use crate::ir::fusion::Fusion;
use crate::ir::node::{
    ExprKind, IterDomain, ScalarConst, TensorDomain, TensorView, ValId, ValKind,
};
use crate::types::{
    BinaryOpKind, DataType, IterType, MemoryType, ParallelType, TernaryOpKind, UnaryOpKind,
};

impl Fusion {
    // ------------------------------------------------------------------
    // Scalars
    // ------------------------------------------------------------------

    /// A fresh symbolic scalar of the given type.
    pub fn new_scalar(&mut self, dtype: DataType) -> ValId {
        self.register_val(dtype, ValKind::Scalar { value: None })
    }

    /// A constant integer scalar.
    pub fn new_int(&mut self, value: i64) -> ValId {
        self.register_val(
            DataType::Int,
            ValKind::Scalar { value: Some(ScalarConst::Int(value)) },
        )
    }

    /// A constant float scalar.
    pub fn new_float(&mut self, value: f64) -> ValId {
        self.register_val(
            DataType::Float,
            ValKind::Scalar { value: Some(ScalarConst::Float(value)) },
        )
    }

    /// A constant bool scalar.
    pub fn new_bool(&mut self, value: bool) -> ValId {
        self.register_val(
            DataType::Bool,
            ValKind::Scalar { value: Some(ScalarConst::Bool(value)) },
        )
    }

    /// The integer zero constant.
    pub fn zero(&mut self) -> ValId {
        self.new_int(0)
    }

    /// The integer one constant.
    pub fn one(&mut self) -> ValId {
        self.new_int(1)
    }

    /// A scalar with a fixed spelling in the emitted kernel.
    pub fn named_scalar(&mut self, name: impl Into<String>, dtype: DataType) -> ValId {
        self.register_val(dtype, ValKind::NamedScalar { name: name.into() })
    }

    // ------------------------------------------------------------------
    // Iteration domains and tensors
    // ------------------------------------------------------------------

    /// Register a new iteration domain value.
    pub fn new_iter_domain(
        &mut self,
        start: ValId,
        extent: ValId,
        parallel: ParallelType,
        iter_type: IterType,
        is_rfactor: bool,
    ) -> ValId {
        self.register_val(
            DataType::Int,
            ValKind::IterDomain(IterDomain { start, extent, parallel, iter_type, is_rfactor }),
        )
    }

    /// A serial iteration domain `[0, extent)`.
    pub fn iter_domain_from_extent(&mut self, extent: ValId) -> ValId {
        let start = self.zero();
        self.new_iter_domain(start, extent, ParallelType::Serial, IterType::Iteration, false)
    }

    /// Register a tensor domain whose current tuple starts as its root.
    pub fn new_tensor_domain(&mut self, root: Vec<ValId>, contiguity: Vec<bool>) -> ValId {
        assert_eq!(root.len(), contiguity.len(), "contiguity flags are per root axis");
        self.register_val(
            DataType::Int,
            ValKind::TensorDomain(TensorDomain {
                domain: root.clone(),
                root,
                rfactor: Vec::new(),
                contiguity,
            }),
        )
    }

    /// Register a tensor view over an existing domain.
    pub fn new_tensor_view_from_domain(&mut self, domain: ValId, dtype: DataType) -> ValId {
        self.register_val(
            dtype,
            ValKind::TensorView(TensorView {
                domain,
                memory: MemoryType::Local,
                compute_at: None,
                this_compute_at_pos: 0,
            }),
        )
    }

    /// A rank-`n_dims` tensor with symbolic extents, no contiguity known.
    pub fn new_tensor(&mut self, dtype: DataType, n_dims: usize) -> ValId {
        let root: Vec<ValId> = (0..n_dims)
            .map(|_| {
                let extent = self.new_scalar(DataType::Int);
                self.iter_domain_from_extent(extent)
            })
            .collect();
        let contiguity = vec![false; n_dims];
        let td = self.new_tensor_domain(root, contiguity);
        let tv = self.new_tensor_view_from_domain(td, dtype);
        self.tv_set_memory(tv, MemoryType::Global);
        tv
    }

    /// A fully contiguous tensor with the given constant sizes.
    pub fn new_contiguous_tensor(&mut self, dtype: DataType, sizes: &[i64]) -> ValId {
        let root: Vec<ValId> = sizes
            .iter()
            .map(|&s| {
                let extent = self.new_int(s);
                self.iter_domain_from_extent(extent)
            })
            .collect();
        let contiguity = vec![true; sizes.len()];
        let td = self.new_tensor_domain(root, contiguity);
        let tv = self.new_tensor_view_from_domain(td, dtype);
        self.tv_set_memory(tv, MemoryType::Global);
        tv
    }

    /// Fresh iteration domains mirroring `src` (same start/extent/role,
    /// serial, non-rfactor). Used to build output root domains.
    fn mirror_iter_domains(&mut self, src: &[ValId]) -> Vec<ValId> {
        src.iter()
            .map(|&id| {
                let dom = self.iter_domain(id).clone();
                self.new_iter_domain(dom.start, dom.extent, ParallelType::Serial, dom.iter_type, false)
            })
            .collect()
    }

    fn tv_like(&mut self, src_ids: &[ValId], dtype: DataType) -> ValId {
        let root = self.mirror_iter_domains(src_ids);
        let contiguity = vec![false; root.len()];
        let td = self.new_tensor_domain(root, contiguity);
        self.new_tensor_view_from_domain(td, dtype)
    }

    // ------------------------------------------------------------------
    // Scalar / mixed arithmetic
    // ------------------------------------------------------------------

    fn promote(&self, lhs: ValId, rhs: ValId) -> DataType {
        let lt = self.val(lhs).dtype();
        let rt = self.val(rhs).dtype();
        if lt == rt {
            lt
        } else if lt.is_floating_point() || rt.is_floating_point() {
            DataType::Float
        } else {
            DataType::Int
        }
    }

    /// Apply a unary operation; works on scalars and tensor views alike.
    pub fn unary(&mut self, op: UnaryOpKind, input: ValId) -> ValId {
        let dtype = self.val(input).dtype();
        let out = if self.val(input).is_tensor_view() {
            let src = self.tv_maybe_rfactor(input);
            let src = self.no_reductions(&src);
            self.tv_like(&src, dtype)
        } else {
            self.new_scalar(dtype)
        };
        self.register_expr(ExprKind::Unary { op }, vec![input], vec![out]);
        out
    }

    /// Element-type conversion.
    pub fn cast(&mut self, dtype: DataType, input: ValId) -> ValId {
        let out = if self.val(input).is_tensor_view() {
            let src = self.tv_maybe_rfactor(input);
            let src = self.no_reductions(&src);
            self.tv_like(&src, dtype)
        } else {
            self.new_scalar(dtype)
        };
        self.register_expr(ExprKind::Unary { op: UnaryOpKind::Cast }, vec![input], vec![out]);
        out
    }

    /// A uniform random tensor shaped like the input.
    pub fn rand_like(&mut self, input: ValId) -> ValId {
        self.unary(UnaryOpKind::RandLike, input)
    }

    /// Apply a binary operation. At least one tensor operand produces a
    /// tensor output; two scalars produce a scalar, with integer identity
    /// folding.
    pub fn binary(&mut self, op: BinaryOpKind, lhs: ValId, rhs: ValId) -> ValId {
        let lhs_tv = self.val(lhs).is_tensor_view();
        let rhs_tv = self.val(rhs).is_tensor_view();
        let dtype = if op.is_logical() { DataType::Bool } else { self.promote(lhs, rhs) };

        if !lhs_tv && !rhs_tv {
            if let Some(folded) = self.fold_int_binary(op, lhs, rhs) {
                return folded;
            }
            let out = self.new_scalar(dtype);
            self.register_expr(ExprKind::Binary { op }, vec![lhs, rhs], vec![out]);
            return out;
        }

        let out = if lhs_tv && rhs_tv {
            let l_root = self.no_reductions(&self.tv_maybe_rfactor(lhs));
            let r_root = self.no_reductions(&self.tv_maybe_rfactor(rhs));
            assert_eq!(
                l_root.len(),
                r_root.len(),
                "binary tensor operands must agree on rank"
            );
            // Prefer the concrete side of each axis pair.
            let merged: Vec<ValId> = l_root
                .iter()
                .zip(r_root.iter())
                .map(|(&l, &r)| {
                    let l_bcast = self.iter_domain(l).is_broadcast();
                    let r_bcast = self.iter_domain(r).is_broadcast();
                    if l_bcast && !r_bcast {
                        r
                    } else {
                        l
                    }
                })
                .collect();
            self.tv_like(&merged, dtype)
        } else {
            let tv = if lhs_tv { lhs } else { rhs };
            let src = self.no_reductions(&self.tv_maybe_rfactor(tv));
            self.tv_like(&src, dtype)
        };
        self.register_expr(ExprKind::Binary { op }, vec![lhs, rhs], vec![out]);
        out
    }

    fn fold_int_binary(&mut self, op: BinaryOpKind, lhs: ValId, rhs: ValId) -> Option<ValId> {
        let l = self.val(lhs).const_int();
        let r = self.val(rhs).const_int();
        match op {
            BinaryOpKind::Add => {
                if l == Some(0) {
                    return Some(rhs);
                }
                if r == Some(0) {
                    return Some(lhs);
                }
                if let (Some(a), Some(b)) = (l, r) {
                    return Some(self.new_int(a + b));
                }
            }
            BinaryOpKind::Mul => {
                if l == Some(0) || r == Some(0) {
                    return Some(self.new_int(0));
                }
                if l == Some(1) {
                    return Some(rhs);
                }
                if r == Some(1) {
                    return Some(lhs);
                }
                if let (Some(a), Some(b)) = (l, r) {
                    return Some(self.new_int(a * b));
                }
            }
            BinaryOpKind::Div => {
                if r == Some(1) {
                    return Some(lhs);
                }
            }
            BinaryOpKind::CeilDiv => {
                if r == Some(1) {
                    return Some(lhs);
                }
                if let (Some(a), Some(b)) = (l, r) {
                    if b != 0 {
                        return Some(self.new_int((a + b - 1) / b));
                    }
                }
            }
            _ => {}
        }
        None
    }

    /// Apply a ternary operation; output is shaped like the first tensor
    /// operand, or scalar when all operands are scalars.
    pub fn ternary(&mut self, op: TernaryOpKind, a: ValId, b: ValId, c: ValId) -> ValId {
        let first_tv = [a, b, c].into_iter().find(|&v| self.val(v).is_tensor_view());
        let dtype = self.promote(b, c);
        let out = match first_tv {
            Some(tv) => {
                let src = self.no_reductions(&self.tv_maybe_rfactor(tv));
                self.tv_like(&src, dtype)
            }
            None => self.new_scalar(dtype),
        };
        self.register_expr(ExprKind::Ternary { op }, vec![a, b, c], vec![out]);
        out
    }

    pub fn add(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.binary(BinaryOpKind::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.binary(BinaryOpKind::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.binary(BinaryOpKind::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.binary(BinaryOpKind::Div, lhs, rhs)
    }

    pub fn modulo(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.binary(BinaryOpKind::Mod, lhs, rhs)
    }

    /// `(lhs + rhs - 1) / rhs`.
    pub fn ceil_div(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.binary(BinaryOpKind::CeilDiv, lhs, rhs)
    }

    // ------------------------------------------------------------------
    // Reductions and broadcasts
    // ------------------------------------------------------------------

    /// Reduce `tv` over `axes` folding with `op` starting from `init`.
    ///
    /// The output's root domain keeps the reduced axes in place, flagged as
    /// reduction; consumers see them stripped.
    pub fn reduce(
        &mut self,
        op: BinaryOpKind,
        init: ScalarConst,
        tv: ValId,
        axes: &[isize],
    ) -> ValId {
        let src = self.no_reductions(&self.tv_maybe_rfactor(tv));
        let n = src.len() as isize;
        let mut reduced = vec![false; src.len()];
        for &axis in axes {
            let idx = if axis < 0 { axis + n } else { axis };
            assert!(idx >= 0 && idx < n, "reduction axis {axis} out of range for rank {n}");
            reduced[idx as usize] = true;
        }

        let dtype = self.val(tv).dtype();
        let root: Vec<ValId> = src
            .iter()
            .zip(reduced.iter())
            .map(|(&id, &is_red)| {
                let dom = self.iter_domain(id).clone();
                let iter_type = if is_red { IterType::Reduction } else { dom.iter_type };
                self.new_iter_domain(dom.start, dom.extent, ParallelType::Serial, iter_type, false)
            })
            .collect();
        let contiguity = vec![false; root.len()];
        let td = self.new_tensor_domain(root, contiguity);
        let out = self.new_tensor_view_from_domain(td, dtype);

        let init_val = self.register_val(dtype, ValKind::Scalar { value: Some(init) });
        self.register_expr(ExprKind::Reduction { op, init: init_val }, vec![tv], vec![out]);
        out
    }

    /// Sum-reduction over `axes`.
    pub fn sum(&mut self, tv: ValId, axes: &[isize]) -> ValId {
        let init = match self.val(tv).dtype() {
            DataType::Int => ScalarConst::Int(0),
            _ => ScalarConst::Float(0.0),
        };
        self.reduce(BinaryOpKind::Add, init, tv, axes)
    }

    /// Max-reduction over `axes`.
    pub fn max_reduce(&mut self, tv: ValId, axes: &[isize]) -> ValId {
        let init = match self.val(tv).dtype() {
            DataType::Int => ScalarConst::Int(i64::MIN),
            _ => ScalarConst::Float(f64::NEG_INFINITY),
        };
        self.reduce(BinaryOpKind::Max, init, tv, axes)
    }

    /// Insert broadcast axes where `is_new_axis` is true; the other slots
    /// consume the producer's non-reduction axes in order.
    pub fn broadcast(&mut self, tv: ValId, is_new_axis: &[bool]) -> ValId {
        let src = self.no_reductions(&self.tv_maybe_rfactor(tv));
        let n_kept = is_new_axis.iter().filter(|&&b| !b).count();
        assert_eq!(
            n_kept,
            src.len(),
            "broadcast flags must keep exactly the producer's axes"
        );

        let dtype = self.val(tv).dtype();
        let mut src_it = src.iter();
        let root: Vec<ValId> = is_new_axis
            .iter()
            .map(|&is_new| {
                if is_new {
                    let start = self.zero();
                    let extent = self.one();
                    self.new_iter_domain(
                        start,
                        extent,
                        ParallelType::Serial,
                        IterType::BroadcastWithoutStride,
                        false,
                    )
                } else {
                    let &id = src_it.next().expect("kept axis count matches");
                    let dom = self.iter_domain(id).clone();
                    self.new_iter_domain(
                        dom.start,
                        dom.extent,
                        ParallelType::Serial,
                        dom.iter_type,
                        false,
                    )
                }
            })
            .collect();
        let contiguity = vec![false; root.len()];
        let td = self.new_tensor_domain(root, contiguity);
        let out = self.new_tensor_view_from_domain(td, dtype);
        self.register_expr(
            ExprKind::Broadcast { is_new_axis: is_new_axis.to_vec() },
            vec![tv],
            vec![out],
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Fusion;

    #[test]
    fn test_scalar_constant_folding() {
        let mut fusion = Fusion::new();
        let x = fusion.new_scalar(DataType::Int);
        let zero = fusion.zero();
        let one = fusion.one();

        assert_eq!(fusion.add(x, zero), x);
        assert_eq!(fusion.mul(x, one), x);
        let folded_zero = fusion.mul(x, zero);
        assert!(fusion.val(folded_zero).is_zero_int());

        let two = fusion.new_int(2);
        let three = fusion.new_int(3);
        let six = fusion.mul(two, three);
        assert_eq!(fusion.val(six).const_int(), Some(6));
    }

    #[test]
    fn test_tensor_binary_shapes_output_like_inputs() {
        let mut fusion = Fusion::new();
        let a = fusion.new_tensor(DataType::Float, 2);
        let b = fusion.new_tensor(DataType::Float, 2);
        let c = fusion.add(a, b);
        assert!(fusion.val(c).is_tensor_view());
        assert_eq!(fusion.tv_n_dims(c), 2);
    }

    #[test]
    fn test_reduction_flags_axes() {
        let mut fusion = Fusion::new();
        let a = fusion.new_tensor(DataType::Float, 2);
        let s = fusion.sum(a, &[1]);
        let root = fusion.tv_root(s);
        assert!(!fusion.iter_domain(root[0]).is_reduction());
        assert!(fusion.iter_domain(root[1]).is_reduction());
        assert!(fusion.has_reduction() == false); // not an output yet
        fusion.add_output(s);
        assert!(fusion.has_reduction());
    }

    #[test]
    fn test_reduction_axes_hidden_from_consumers() {
        let mut fusion = Fusion::new();
        let a = fusion.new_tensor(DataType::Float, 2);
        let s = fusion.sum(a, &[1]);
        let one = fusion.new_float(1.0);
        let t = fusion.add(s, one);
        assert_eq!(fusion.tv_n_dims(t), 1);
    }

    #[test]
    fn test_broadcast_inserts_new_axes() {
        let mut fusion = Fusion::new();
        let a = fusion.new_tensor(DataType::Float, 1);
        let b = fusion.broadcast(a, &[true, false, true]);
        let root = fusion.tv_root(b);
        assert_eq!(root.len(), 3);
        assert!(fusion.iter_domain(root[0]).is_broadcast());
        assert!(!fusion.iter_domain(root[1]).is_broadcast());
        assert!(fusion.iter_domain(root[2]).is_broadcast());
    }

    #[test]
    fn test_comparison_produces_bool() {
        let mut fusion = Fusion::new();
        let x = fusion.new_scalar(DataType::Int);
        let y = fusion.new_scalar(DataType::Int);
        let cmp = fusion.binary(BinaryOpKind::Lt, x, y);
        assert_eq!(fusion.val(cmp).dtype(), DataType::Bool);
    }
}
