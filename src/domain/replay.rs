//! Transformation Replay
//!
//! Two flavors of replay over Split/Merge histories:
//!
//! * [`best_effort_replay`] — read-only: walk the consumer's transformation
//!   history and pair it with matching structure already present in the
//!   producer, returning a consumer→producer id map covering roots,
//!   intermediates and leaves. Used to build the loop equivalence map and to
//!   carry index/extent maps across the computeAt stack.
//! * [`replay_producer_as_consumer`] — mutating: apply the consumer's
//!   history onto the producer's root axes so the producer's current domain
//!   structurally matches the consumer's. Used by computeAt and by producer
//!   indexing.
//!
//! Merges whose missing side is a broadcast axis are forwarded: the merge
//! output maps to the producer id of the mapped side, which is how a
//! producer that never had the broadcast dimension still lands in the
//! consumer's fused loop.

use std::collections::{HashMap, HashSet};

use crate::ir::{ExprId, ExprKind, Fusion, ValId};

/// Result of a mutating producer-as-consumer replay.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// Consumer id (root, intermediate or leaf) → producer id
    pub c2p: HashMap<ValId, ValId>,
    /// Producer's replayed current-domain tuple
    pub domain: Vec<ValId>,
    /// How many producer axes landed in the consumer-aligned prefix; this is
    /// the producer's own computeAt position
    pub producer_pos: usize,
    /// How many of the requested leading consumer axes are covered (mapped,
    /// or consumer-only broadcast loops the producer sits inside of)
    pub covered_consumer: usize,
}

/// Pair the consumer's transformation history with matching structure in the
/// producer without mutating anything.
///
/// `c2p_root` seeds the map with consumer-root → producer-root pairs.
pub fn best_effort_replay(
    fusion: &Fusion,
    producer_domain: &[ValId],
    consumer_domain: &[ValId],
    c2p_root: &HashMap<ValId, ValId>,
) -> HashMap<ValId, ValId> {
    let mut map = c2p_root.clone();
    let producer_history = fusion.domain_transform_history(producer_domain);
    let consumer_history = fusion.domain_transform_history(consumer_domain);
    let mut used_producer_exprs: HashSet<ExprId> = HashSet::new();

    for c_expr_id in consumer_history {
        let c_expr = fusion.expr(c_expr_id);
        match c_expr.kind() {
            ExprKind::Split { factor: c_factor } => {
                let c_in = c_expr.inputs()[0];
                let Some(&p_in) = map.get(&c_in) else { continue };
                let matched = producer_history.iter().copied().find(|&p_expr_id| {
                    if used_producer_exprs.contains(&p_expr_id) {
                        return false;
                    }
                    let p_expr = fusion.expr(p_expr_id);
                    match p_expr.kind() {
                        ExprKind::Split { factor: p_factor } => {
                            p_expr.inputs()[0] == p_in && fusion.same_as_vals(*c_factor, *p_factor)
                        }
                        _ => false,
                    }
                });
                if let Some(p_expr_id) = matched {
                    used_producer_exprs.insert(p_expr_id);
                    let p_expr = fusion.expr(p_expr_id);
                    map.insert(c_expr.outputs()[0], p_expr.outputs()[0]);
                    map.insert(c_expr.outputs()[1], p_expr.outputs()[1]);
                }
            }
            ExprKind::Merge => {
                let c_outer = c_expr.inputs()[0];
                let c_inner = c_expr.inputs()[1];
                match (map.get(&c_outer).copied(), map.get(&c_inner).copied()) {
                    (Some(p_outer), Some(p_inner)) => {
                        let matched = producer_history.iter().copied().find(|&p_expr_id| {
                            if used_producer_exprs.contains(&p_expr_id) {
                                return false;
                            }
                            let p_expr = fusion.expr(p_expr_id);
                            matches!(p_expr.kind(), ExprKind::Merge)
                                && p_expr.inputs() == [p_outer, p_inner]
                        });
                        if let Some(p_expr_id) = matched {
                            used_producer_exprs.insert(p_expr_id);
                            map.insert(
                                c_expr.outputs()[0],
                                fusion.expr(p_expr_id).outputs()[0],
                            );
                        }
                    }
                    // Forward through a merge with a broadcast side the
                    // producer never had.
                    (Some(p_outer), None) if fusion.iter_domain(c_inner).is_broadcast() => {
                        map.insert(c_expr.outputs()[0], p_outer);
                    }
                    (None, Some(p_inner)) if fusion.iter_domain(c_outer).is_broadcast() => {
                        map.insert(c_expr.outputs()[0], p_inner);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    map
}

/// Apply the consumer's transformation history onto the producer's root
/// axes, mutating the fusion (new iteration domains and Split/Merge
/// provenance), and order the producer's new domain so its first axes line
/// up with the consumer's first `pos` axes.
///
/// Returns the replay map and the new domain; the caller decides whether
/// the mapped prefix is acceptable and installs the domain on the tensor.
pub fn replay_producer_as_consumer(
    fusion: &mut Fusion,
    c2p_root: &HashMap<ValId, ValId>,
    producer: ValId,
    consumer: ValId,
    pos: usize,
) -> ReplayResult {
    let mut map = c2p_root.clone();

    // Leaf tracking: the producer's evolving current-domain order.
    let mut leaves: Vec<ValId> = fusion.tv_maybe_rfactor(producer);

    let consumer_domain = fusion.tv_current_domain(consumer);
    let consumer_history = fusion.domain_transform_history(&consumer_domain);

    for c_expr_id in consumer_history {
        let (kind, c_inputs, c_outputs) = {
            let e = fusion.expr(c_expr_id);
            (e.kind().clone(), e.inputs().to_vec(), e.outputs().to_vec())
        };
        match kind {
            ExprKind::Split { factor } => {
                let Some(&p_in) = map.get(&c_inputs[0]) else { continue };
                let Some(leaf_pos) = leaves.iter().position(|&l| l == p_in) else { continue };
                let (outer, inner) = fusion.split_iter_domain(p_in, factor);
                leaves[leaf_pos] = outer;
                leaves.insert(leaf_pos + 1, inner);
                map.insert(c_outputs[0], outer);
                map.insert(c_outputs[1], inner);
            }
            ExprKind::Merge => {
                let p_outer = map.get(&c_inputs[0]).copied();
                let p_inner = map.get(&c_inputs[1]).copied();
                match (p_outer, p_inner) {
                    (Some(p_o), Some(p_i)) => {
                        let (Some(o_pos), Some(_)) = (
                            leaves.iter().position(|&l| l == p_o),
                            leaves.iter().position(|&l| l == p_i),
                        ) else {
                            continue;
                        };
                        let out = fusion.merge_iter_domains(p_o, p_i);
                        leaves.retain(|&l| l != p_o && l != p_i);
                        let insert_at = o_pos.min(leaves.len());
                        leaves.insert(insert_at, out);
                        map.insert(c_outputs[0], out);
                    }
                    (Some(p_o), None) if fusion.iter_domain(c_inputs[1]).is_broadcast() => {
                        map.insert(c_outputs[0], p_o);
                    }
                    (None, Some(p_i)) if fusion.iter_domain(c_inputs[0]).is_broadcast() => {
                        map.insert(c_outputs[0], p_i);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // Order: consumer-aligned prefix first, then the remaining producer
    // leaves in their existing relative order.
    let mut ordered: Vec<ValId> = Vec::new();
    let mut used: HashSet<ValId> = HashSet::new();
    let mut covered_consumer = 0;
    for &c_axis in consumer_domain.iter().take(pos) {
        if let Some(&p_leaf) = map.get(&c_axis) {
            if leaves.contains(&p_leaf) && used.insert(p_leaf) {
                ordered.push(p_leaf);
                covered_consumer += 1;
            }
        } else if fusion.iter_domain(c_axis).is_broadcast() {
            // Consumer-only broadcast loop; the producer simply has no axis
            // here and is indexed with zero inside it.
            covered_consumer += 1;
        }
    }
    let producer_pos = ordered.len();
    for &leaf in &leaves {
        if !used.contains(&leaf) {
            ordered.push(leaf);
        }
    }

    ReplayResult { c2p: map, domain: ordered, producer_pos, covered_consumer }
}

/// Install a replayed domain on a tensor view, preserving root, rfactor and
/// contiguity.
pub fn apply_replay_to_tv(fusion: &mut Fusion, tv: ValId, new_domain: Vec<ValId>) {
    let td_id = fusion.tensor_view(tv).domain;
    fusion.tensor_domain_mut(td_id).domain = new_domain;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_best_effort_replay_pairs_matching_splits() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[16, 8]);
        let b = fusion.add(a, a);
        // Same schedule applied to both tensors
        fusion.merge(a, 0).expect("merge a");
        fusion.split(a, 0, 4).expect("split a");
        fusion.merge(b, 0).expect("merge b");
        fusion.split(b, 0, 4).expect("split b");

        let a_root = fusion.tv_root(a);
        let b_root = fusion.tv_root(b);
        let c2p_root: HashMap<ValId, ValId> =
            b_root.iter().copied().zip(a_root.iter().copied()).collect();

        let a_domain = fusion.tv_current_domain(a);
        let b_domain = fusion.tv_current_domain(b);
        let map = best_effort_replay(&fusion, &a_domain, &b_domain, &c2p_root);
        assert_eq!(map.get(&b_domain[0]), Some(&a_domain[0]));
        assert_eq!(map.get(&b_domain[1]), Some(&a_domain[1]));
    }

    #[test]
    fn test_replay_producer_as_consumer_builds_matching_leaves() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[16, 8]);
        let b = fusion.add(a, a);
        fusion.merge(b, 0).expect("merge b");
        fusion.split(b, 0, 4).expect("split b");

        let a_root = fusion.tv_root(a);
        let b_root = fusion.tv_root(b);
        let c2p_root: HashMap<ValId, ValId> =
            b_root.iter().copied().zip(a_root.iter().copied()).collect();

        let result = replay_producer_as_consumer(&mut fusion, &c2p_root, a, b, 1);
        assert_eq!(result.producer_pos, 1);
        assert_eq!(result.domain.len(), 2);
        let b_domain = fusion.tv_current_domain(b);
        assert_eq!(result.c2p.get(&b_domain[0]), Some(&result.domain[0]));

        apply_replay_to_tv(&mut fusion, a, result.domain.clone());
        assert_eq!(fusion.tv_current_domain(a), result.domain);
        // The producer's root is untouched by the replay.
        assert_eq!(fusion.tv_root(a), a_root);
    }

    #[test]
    fn test_replay_forwards_broadcast_merge() {
        let mut fusion = Fusion::new();
        // producer: 1-D; consumer: broadcast to 2-D then merged flat
        let a = fusion.new_contiguous_tensor(DataType::Float, &[8]);
        let bc = fusion.broadcast(a, &[true, false]);
        fusion.merge(bc, 0).expect("merge bc");

        let a_root = fusion.tv_root(a);
        let bc_root = fusion.tv_root(bc);
        // Positional pairing: new broadcast axis has no producer counterpart
        let c2p_root: HashMap<ValId, ValId> = HashMap::from([(bc_root[1], a_root[0])]);

        let result = replay_producer_as_consumer(&mut fusion, &c2p_root, a, bc, 1);
        // The merged consumer axis forwards to the producer's only axis.
        let bc_domain = fusion.tv_current_domain(bc);
        assert_eq!(result.c2p.get(&bc_domain[0]), Some(&a_root[0]));
        assert_eq!(result.covered_consumer, 1);
    }
}
