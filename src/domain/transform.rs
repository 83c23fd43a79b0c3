//! Domain Transformations
//!
//! `split`, `merge` and `reorder` rewrite a tensor's current iteration-domain
//! tuple while recording Split/Merge provenance in the expression DAG;
//! `rfactor` splits a reduction into two stages. All validation happens
//! before any mutation, so a failed transformation leaves the domain exactly
//! as it was.

use std::collections::HashMap;

use thiserror::Error;

use crate::ir::{ExprKind, Fusion, ValId, ValKind};
use crate::types::{DataType, IterType, MemoryType, ParallelType};

/// Structural errors raised by domain transformations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Axis index outside the current rank
    #[error("axis {axis} does not exist in a domain of rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },

    /// Split factor must be a positive value
    #[error("invalid split factor {factor}; factor must be > 0")]
    BadSplitFactor { factor: i64 },

    /// Merge of a reduction axis with a non-reduction axis
    #[error("cannot merge axes {outer} and {inner}: reduction and non-reduction axes do not merge")]
    MergeMismatchedKinds { outer: usize, inner: usize },

    /// Merge arguments must be adjacent in the current domain
    #[error("cannot merge non-adjacent axes {outer} and {inner}")]
    MergeNonAdjacent { outer: usize, inner: usize },

    /// Reorder map is not a permutation of the current rank
    #[error("invalid reorder: {reason}")]
    InvalidReorder { reason: String },

    /// rFactor axis is not a reduction axis
    #[error("rFactor axis {axis} is not a reduction axis")]
    RFactorNonReduction { axis: isize },

    /// rFactor requires the tensor to be produced by a reduction
    #[error("rFactor target is not the output of a reduction")]
    RFactorNotReduction,

    /// rFactor must leave at least one reduction axis unselected or select
    /// at least one
    #[error("rFactor axis selection is empty")]
    RFactorEmptySelection,
}

fn normalize_axis(axis: isize, rank: usize) -> Result<usize, TransformError> {
    let n = rank as isize;
    let idx = if axis < 0 { axis + n } else { axis };
    if idx < 0 || idx >= n {
        return Err(TransformError::AxisOutOfRange { axis, rank });
    }
    Ok(idx as usize)
}

impl Fusion {
    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    /// Split current-domain axis `axis` of `tv` into `(outer, inner)` where
    /// `inner` has extent `factor` and `outer` has extent
    /// `ceilDiv(extent, factor)`. Reduction/broadcast roles propagate to
    /// both outputs; the parallel tag does not.
    pub fn split(&mut self, tv: ValId, axis: isize, factor: i64) -> Result<(), TransformError> {
        if factor <= 0 {
            return Err(TransformError::BadSplitFactor { factor });
        }
        let factor_val = self.new_int(factor);
        self.split_by_val(tv, axis, factor_val)
    }

    /// Split by a (possibly symbolic) factor value.
    pub fn split_by_val(
        &mut self,
        tv: ValId,
        axis: isize,
        factor: ValId,
    ) -> Result<(), TransformError> {
        let rank = self.tv_n_dims(tv);
        let idx = normalize_axis(axis, rank)?;
        if let Some(f) = self.val(factor).const_int() {
            if f <= 0 {
                return Err(TransformError::BadSplitFactor { factor: f });
            }
        }
        let td_id = self.tensor_view(tv).domain;
        let in_id = self.tensor_domain(td_id).domain[idx];
        let (outer, inner) = self.split_iter_domain(in_id, factor);
        let domain = &mut self.tensor_domain_mut(td_id).domain;
        domain[idx] = outer;
        domain.insert(idx + 1, inner);
        Ok(())
    }

    /// Split a lone iteration domain, recording the Split expression.
    pub(crate) fn split_iter_domain(&mut self, in_id: ValId, factor: ValId) -> (ValId, ValId) {
        let in_dom = self.iter_domain(in_id).clone();
        let outer_extent = self.ceil_div(in_dom.extent, factor);
        let zero_o = self.zero();
        let outer = self.new_iter_domain(
            zero_o,
            outer_extent,
            ParallelType::Serial,
            in_dom.iter_type,
            in_dom.is_rfactor,
        );
        let zero_i = self.zero();
        let inner = self.new_iter_domain(
            zero_i,
            factor,
            ParallelType::Serial,
            in_dom.iter_type,
            in_dom.is_rfactor,
        );
        self.register_expr(ExprKind::Split { factor }, vec![in_id], vec![outer, inner]);
        (outer, inner)
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// Merge current-domain axis `axis` with `axis + 1`, iterating the
    /// result in row-major `(outer, inner)` order. Legal only when both are
    /// reductions or both are non-reductions.
    pub fn merge(&mut self, tv: ValId, axis: isize) -> Result<(), TransformError> {
        let rank = self.tv_n_dims(tv);
        let outer_idx = normalize_axis(axis, rank)?;
        let inner_idx = outer_idx + 1;
        if inner_idx >= rank {
            return Err(TransformError::MergeNonAdjacent { outer: outer_idx, inner: inner_idx });
        }
        let td_id = self.tensor_view(tv).domain;
        let outer_id = self.tensor_domain(td_id).domain[outer_idx];
        let inner_id = self.tensor_domain(td_id).domain[inner_idx];
        if self.iter_domain(outer_id).is_reduction() != self.iter_domain(inner_id).is_reduction() {
            return Err(TransformError::MergeMismatchedKinds { outer: outer_idx, inner: inner_idx });
        }
        let out = self.merge_iter_domains(outer_id, inner_id);
        let domain = &mut self.tensor_domain_mut(td_id).domain;
        domain[outer_idx] = out;
        domain.remove(inner_idx);
        Ok(())
    }

    /// Merge two iteration domains, recording the Merge expression.
    pub(crate) fn merge_iter_domains(&mut self, outer_id: ValId, inner_id: ValId) -> ValId {
        let outer_dom = self.iter_domain(outer_id).clone();
        let inner_dom = self.iter_domain(inner_id).clone();
        let extent = self.mul(outer_dom.extent, inner_dom.extent);
        // A broadcast axis merged with a concrete axis yields a concrete axis.
        let iter_type = match (outer_dom.iter_type, inner_dom.iter_type) {
            (IterType::Reduction, _) | (_, IterType::Reduction) => IterType::Reduction,
            (a, b) if a.is_broadcast() && b.is_broadcast() => a,
            (a, _) if !a.is_broadcast() => a,
            (_, b) => b,
        };
        let zero = self.zero();
        let out = self.new_iter_domain(
            zero,
            extent,
            ParallelType::Serial,
            iter_type,
            outer_dom.is_rfactor || inner_dom.is_rfactor,
        );
        self.register_expr(ExprKind::Merge, vec![outer_id, inner_id], vec![out]);
        out
    }

    // ------------------------------------------------------------------
    // Reorder
    // ------------------------------------------------------------------

    /// Permute the current domain according to `old2new` (`old2new[i] = (old
    /// position, new position)`, both possibly negative). Unmentioned axes
    /// fill the remaining slots preserving their relative order. The root
    /// domain is untouched.
    pub fn reorder(&mut self, tv: ValId, old2new: &[(isize, isize)]) -> Result<(), TransformError> {
        let rank = self.tv_n_dims(tv);
        let mut normalized: HashMap<usize, usize> = HashMap::new();
        let mut new_taken = vec![false; rank];
        for &(old, new) in old2new {
            let old_idx = normalize_axis(old, rank)?;
            let new_idx = normalize_axis(new, rank)?;
            if normalized.insert(old_idx, new_idx).is_some() {
                return Err(TransformError::InvalidReorder {
                    reason: format!("old position {old_idx} mapped twice"),
                });
            }
            if new_taken[new_idx] {
                return Err(TransformError::InvalidReorder {
                    reason: format!("new position {new_idx} mapped twice"),
                });
            }
            new_taken[new_idx] = true;
        }

        let td_id = self.tensor_view(tv).domain;
        let old_domain = self.tensor_domain(td_id).domain.clone();
        let mut new_domain: Vec<Option<ValId>> = vec![None; rank];
        for (&old_idx, &new_idx) in &normalized {
            new_domain[new_idx] = Some(old_domain[old_idx]);
        }
        let mut leftover = (0..rank).filter(|i| !normalized.contains_key(i));
        for slot in new_domain.iter_mut() {
            if slot.is_none() {
                let src = leftover.next().expect("slot counts match");
                *slot = Some(old_domain[src]);
            }
        }
        self.tensor_domain_mut(td_id).domain = new_domain
            .into_iter()
            .map(|slot| slot.expect("all slots filled"))
            .collect();
        Ok(())
    }

    // ------------------------------------------------------------------
    // rFactor
    // ------------------------------------------------------------------

    /// Split the reduction producing `tv` into two stages. The selected
    /// current-domain `axes` stay reductions in a new intermediate tensor
    /// (stage one); the remaining reduction axes survive as rfactor axes and
    /// are reduced by `tv` itself (stage two) over the intermediate.
    ///
    /// Returns the intermediate tensor view.
    pub fn rfactor(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId, TransformError> {
        if axes.is_empty() {
            return Err(TransformError::RFactorEmptySelection);
        }
        let def = self
            .val(tv)
            .definition()
            .ok_or(TransformError::RFactorNotReduction)?;
        let (red_op, red_init) = match self.expr(def).kind() {
            ExprKind::Reduction { op, init } => (*op, *init),
            _ => return Err(TransformError::RFactorNotReduction),
        };
        let red_input = self.expr(def).inputs()[0];

        let current = self.tv_current_domain(tv);
        let rank = current.len();
        let mut selected = vec![false; rank];
        for &axis in axes {
            let idx = normalize_axis(axis, rank)?;
            if !self.iter_domain(current[idx]).is_reduction() {
                return Err(TransformError::RFactorNonReduction { axis });
            }
            selected[idx] = true;
        }

        // Stage one: intermediate tensor. Its root mirrors the original
        // root; the original transformation history is replayed onto it so
        // its current domain matches tv's structurally.
        let old_root = self.tv_root(tv);
        let producer_root = self.mirror_domain_list(&old_root);
        let mut id_map: HashMap<ValId, ValId> = old_root
            .iter()
            .copied()
            .zip(producer_root.iter().copied())
            .collect();
        let history = self.domain_transform_history(&current);
        for expr in history {
            self.replay_transform_expr(expr, &mut id_map);
        }
        let producer_current: Vec<ValId> = current
            .iter()
            .map(|id| *id_map.get(id).expect("replayed history covers the current domain"))
            .collect();

        // Unselected reduction axes become rfactor iteration axes of the
        // intermediate.
        for (i, &id) in producer_current.iter().enumerate() {
            let dom = self.iter_domain_mut(id);
            if dom.iter_type == IterType::Reduction && !selected[i] {
                dom.iter_type = IterType::Iteration;
                dom.is_rfactor = true;
            }
        }
        // Root axes feeding only surviving (stage-two) reductions keep their
        // reduction role; mirrored roots of selected subtrees stay as-is.

        let dtype = self.val(tv).dtype();
        let contiguity = vec![false; producer_root.len()];
        let producer_td = self.register_val(
            DataType::Int,
            ValKind::TensorDomain(crate::ir::TensorDomain {
                root: producer_root,
                rfactor: producer_current.clone(),
                domain: producer_current.clone(),
                contiguity,
            }),
        );
        let producer_tv = self.new_tensor_view_from_domain(producer_td, dtype);
        self.tv_set_memory(producer_tv, MemoryType::Local);

        // Stage two: tv's domain is rebuilt over the intermediate's rfactor
        // view; the selected axes disappear, surviving rfactor axes are
        // reduced here.
        let consumer_root: Vec<ValId> = producer_current
            .iter()
            .enumerate()
            .filter(|(i, _)| !selected[*i])
            .map(|(_, &id)| {
                let dom = self.iter_domain(id).clone();
                let iter_type = if dom.is_rfactor { IterType::Reduction } else { dom.iter_type };
                self.new_iter_domain(dom.start, dom.extent, dom.parallel, iter_type, false)
            })
            .collect();
        let consumer_contiguity = vec![false; consumer_root.len()];
        let consumer_td = self.new_tensor_domain(consumer_root, consumer_contiguity);
        self.tensor_view_mut(tv).domain = consumer_td;

        // Rewire the expression DAG: input -> intermediate -> tv.
        self.detach_expr(def);
        self.register_expr(
            ExprKind::Reduction { op: red_op, init: red_init },
            vec![red_input],
            vec![producer_tv],
        );
        self.register_expr(
            ExprKind::Reduction { op: red_op, init: red_init },
            vec![producer_tv],
            vec![tv],
        );
        Ok(producer_tv)
    }

    /// Fresh mirror of a list of iteration domains (same start/extent/role).
    pub(crate) fn mirror_domain_list(&mut self, ids: &[ValId]) -> Vec<ValId> {
        ids.iter()
            .map(|&id| {
                let dom = self.iter_domain(id).clone();
                self.new_iter_domain(dom.start, dom.extent, dom.parallel, dom.iter_type, dom.is_rfactor)
            })
            .collect()
    }

    /// Split/Merge expressions reaching the given leaves, in dependency
    /// order.
    pub fn domain_transform_history(&self, leaves: &[ValId]) -> Vec<crate::ir::ExprId> {
        self.exprs_reachable_from(leaves)
            .into_iter()
            .filter(|&e| self.expr(e).is_domain_transform())
            .collect()
    }

    /// Replay one Split/Merge under `id_map` (source id -> replica id),
    /// applying the same transformation to the replica ids and extending the
    /// map with the outputs. Skips the expression when its inputs are not in
    /// the map.
    pub(crate) fn replay_transform_expr(
        &mut self,
        expr: crate::ir::ExprId,
        id_map: &mut HashMap<ValId, ValId>,
    ) {
        let (kind, inputs, outputs) = {
            let e = self.expr(expr);
            (e.kind().clone(), e.inputs().to_vec(), e.outputs().to_vec())
        };
        match kind {
            ExprKind::Split { factor } => {
                let Some(&mapped_in) = id_map.get(&inputs[0]) else { return };
                let (outer, inner) = self.split_iter_domain(mapped_in, factor);
                id_map.insert(outputs[0], outer);
                id_map.insert(outputs[1], inner);
            }
            ExprKind::Merge => {
                let (Some(&mapped_outer), Some(&mapped_inner)) =
                    (id_map.get(&inputs[0]), id_map.get(&inputs[1]))
                else {
                    return;
                };
                let out = self.merge_iter_domains(mapped_outer, mapped_inner);
                id_map.insert(outputs[0], out);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Parallelization
    // ------------------------------------------------------------------

    /// Tag current-domain axis `axis` of `tv` with a parallel mapping.
    pub fn parallelize(&mut self, tv: ValId, axis: isize, parallel: ParallelType) -> Result<(), TransformError> {
        let rank = self.tv_n_dims(tv);
        let idx = normalize_axis(axis, rank)?;
        let id = self.tv_domain(tv).domain[idx];
        self.iter_domain_mut(id).parallel = parallel;
        Ok(())
    }
}

/// Product of constant extents of a domain tuple, when fully constant.
pub fn const_domain_product(fusion: &Fusion, ids: &[ValId]) -> Option<i64> {
    let mut product = 1i64;
    for &id in ids {
        let extent = fusion.iter_domain(id).extent;
        product *= fusion.val(extent).const_int()?;
    }
    Some(product)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Fusion;

    fn contiguous_2d(fusion: &mut Fusion) -> ValId {
        fusion.new_contiguous_tensor(DataType::Float, &[12, 8])
    }

    #[test]
    fn test_split_shapes_and_provenance() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        fusion.split(tv, 1, 4).expect("valid split");
        assert_eq!(fusion.tv_n_dims(tv), 3);
        let domain = fusion.tv_current_domain(tv);
        let inner = fusion.iter_domain(domain[2]);
        assert_eq!(fusion.val(inner.extent).const_int(), Some(4));
        let outer = fusion.iter_domain(domain[1]);
        assert_eq!(fusion.val(outer.extent).const_int(), Some(2));
        // Root untouched
        assert_eq!(fusion.tv_root(tv).len(), 2);
    }

    #[test]
    fn test_split_rejects_bad_factor_and_axis() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        assert!(matches!(
            fusion.split(tv, 1, 0),
            Err(TransformError::BadSplitFactor { .. })
        ));
        assert!(matches!(
            fusion.split(tv, 5, 4),
            Err(TransformError::AxisOutOfRange { .. })
        ));
        // Domain unchanged after failures
        assert_eq!(fusion.tv_n_dims(tv), 2);
    }

    #[test]
    fn test_merge_multiplies_extents() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        fusion.merge(tv, 0).expect("valid merge");
        assert_eq!(fusion.tv_n_dims(tv), 1);
        let domain = fusion.tv_current_domain(tv);
        let merged = fusion.iter_domain(domain[0]);
        assert_eq!(fusion.val(merged.extent).const_int(), Some(96));
    }

    #[test]
    fn test_merge_rejects_reduction_with_iteration() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        let red = fusion.sum(tv, &[1]);
        assert!(matches!(
            fusion.merge(red, 0),
            Err(TransformError::MergeMismatchedKinds { .. })
        ));
        assert_eq!(fusion.tv_n_dims(red), 2);
    }

    #[test]
    fn test_reorder_permutes_current_only() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        let before = fusion.tv_current_domain(tv);
        fusion.reorder(tv, &[(0, 1), (1, 0)]).expect("valid reorder");
        let after = fusion.tv_current_domain(tv);
        assert_eq!(after, vec![before[1], before[0]]);
        assert_eq!(fusion.tv_root(tv), before);
    }

    #[test]
    fn test_reorder_rejects_duplicate_target() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        assert!(matches!(
            fusion.reorder(tv, &[(0, 0), (1, 0)]),
            Err(TransformError::InvalidReorder { .. })
        ));
    }

    #[test]
    fn test_split_merge_round_trip_preserves_product() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        fusion.split(tv, 0, 4).expect("split");
        fusion.split(tv, 2, 2).expect("split");
        fusion.merge(tv, 1).expect("merge");
        let domain = fusion.tv_current_domain(tv);
        let product = const_domain_product(&fusion, &domain).expect("constant extents");
        // ceilDiv(12,4)=3, then 8 split by 2 and re-merged: 3*4*8 = 96
        assert_eq!(product, 96);
    }

    #[test]
    fn test_rfactor_two_stages() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        let red = fusion.sum(tv, &[1]);
        fusion.split(red, 1, 4).expect("split reduction");
        // domain: [i0, r_outer, r_inner(4)]
        let intermediate = fusion.rfactor(red, &[1]).expect("valid rfactor");

        // Intermediate reduces the selected axis, keeps the rest as rfactor
        let inter_domain = fusion.tv_current_domain(intermediate);
        assert_eq!(inter_domain.len(), 3);
        assert!(fusion.iter_domain(inter_domain[1]).is_reduction());
        assert!(fusion.iter_domain(inter_domain[2]).is_rfactor);
        assert!(!fusion.iter_domain(inter_domain[2]).is_reduction());

        // Original tensor now reduces the surviving axis over the
        // intermediate
        let red_domain = fusion.tv_current_domain(red);
        assert_eq!(red_domain.len(), 2);
        assert!(fusion.iter_domain(red_domain[1]).is_reduction());
        let def = fusion.val(red).definition().expect("redefined");
        assert_eq!(fusion.expr(def).inputs(), &[intermediate]);
    }

    #[test]
    fn test_rfactor_rejects_non_reduction_axis() {
        let mut fusion = Fusion::new();
        let tv = contiguous_2d(&mut fusion);
        let red = fusion.sum(tv, &[1]);
        let before = fusion.tv_current_domain(red);
        assert!(matches!(
            fusion.rfactor(red, &[0]),
            Err(TransformError::RFactorNonReduction { .. })
        ));
        assert_eq!(fusion.tv_current_domain(red), before);
    }

    #[test]
    fn test_rfactor_rejects_pointwise_output() {
        let mut fusion = Fusion::new();
        let a = contiguous_2d(&mut fusion);
        let b = contiguous_2d(&mut fusion);
        let c = fusion.add(a, b);
        assert!(matches!(
            fusion.rfactor(c, &[0]),
            Err(TransformError::RFactorNotReduction)
        ));
    }
}
