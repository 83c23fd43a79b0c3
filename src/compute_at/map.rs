//! Loop Equivalence Map
//!
//! Answers "do these two iteration domains denote the same loop?" for every
//! axis in the fusion — roots, intermediates and leaves — by closing the
//! pairwise root maps and best-effort transform replays under union-find.
//! Expression sorting, loop-nest generation and synchronization placement
//! all consult this map instead of comparing axis handles directly.

use std::collections::HashSet;

use crate::domain::best_effort_replay;
use crate::ir::{ComputeAtLink, Fusion, ValId};
use crate::root_map::{root_map_c2p, DisjointSet};

/// Whole-fusion loop equivalence over iteration domains.
#[derive(Debug, Default, Clone)]
pub struct ComputeAtMap {
    loop_map: DisjointSet<ValId>,
}

impl ComputeAtMap {
    /// Build the map for the current (scheduled) state of the fusion.
    pub fn build(fusion: &Fusion) -> Self {
        let mut loop_map = DisjointSet::new();

        // Producer-consumer pairs: pair the roots, then replay the
        // consumer's transformations over the producer's to match leaves.
        for expr_id in fusion.tensor_exprs() {
            let expr = fusion.expr(expr_id);
            let out_tv = expr.output();
            let inputs: Vec<ValId> = expr
                .inputs()
                .iter()
                .copied()
                .filter(|&v| fusion.val(v).is_tensor_view())
                .collect();
            for in_tv in inputs {
                join_pair(fusion, &mut loop_map, out_tv, in_tv);
            }
        }

        // Sibling computeAt links connect tensors that are not direct
        // pairs; close over them as well.
        for tv in fusion.vals().filter(|&v| fusion.val(v).is_tensor_view()) {
            if let Some(ComputeAtLink { consumer, .. }) = fusion.tv_compute_at(tv) {
                join_pair(fusion, &mut loop_map, consumer, tv);
            }
        }

        ComputeAtMap { loop_map }
    }

    /// Do these two iteration domains denote the same loop?
    pub fn are_mapped(&self, a: ValId, b: ValId) -> bool {
        a == b || self.loop_map.are_equivalent(&a, &b)
    }

    /// A deterministic representative of the loop class of `id`, preferring
    /// domains with the fewest broadcast roots behind them so the loop
    /// extent reflects the concretized size.
    pub fn concrete_id(&self, fusion: &Fusion, id: ValId) -> ValId {
        let mut best = id;
        let mut best_score = broadcast_root_count(fusion, id);
        for candidate in self.loop_map.all_elements() {
            if candidate == id || !self.loop_map.are_equivalent(&candidate, &id) {
                continue;
            }
            let score = broadcast_root_count(fusion, candidate);
            if score < best_score || (score == best_score && candidate < best) {
                best = candidate;
                best_score = score;
            }
        }
        best
    }
}

fn join_pair(fusion: &Fusion, loop_map: &mut DisjointSet<ValId>, consumer: ValId, producer: ValId) {
    let c2p_root = root_map_c2p(fusion, consumer, producer);
    let producer_domain = fusion.tv_current_domain(producer);
    let consumer_domain = fusion.tv_current_domain(consumer);
    let replay = best_effort_replay(fusion, &producer_domain, &consumer_domain, &c2p_root);
    for (c_id, p_id) in replay {
        loop_map.join(&c_id, &p_id);
    }
}

/// How many broadcast root axes feed `id` through its transform history.
fn broadcast_root_count(fusion: &Fusion, id: ValId) -> usize {
    let mut count = 0;
    let mut stack = vec![id];
    let mut seen: HashSet<ValId> = HashSet::new();
    while let Some(v) = stack.pop() {
        if !seen.insert(v) {
            continue;
        }
        match fusion.val(v).definition() {
            Some(def) if fusion.expr(def).is_domain_transform() => {
                stack.extend(fusion.expr(def).inputs().iter().copied());
            }
            _ => {
                if fusion.iter_domain(v).is_broadcast() {
                    count += 1;
                }
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_pointwise_leaves_map_after_identical_schedule() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[16, 8]);
        let b = fusion.add(a, a);
        fusion.add_input(a);
        fusion.add_output(b);
        fusion.merge(b, 0).expect("merge");
        fusion.split(b, 0, 4).expect("split");
        crate::compute_at::compute_at(&mut fusion, a, b, 1).expect("computeAt");

        let map = ComputeAtMap::build(&fusion);
        let a_domain = fusion.tv_current_domain(a);
        let b_domain = fusion.tv_current_domain(b);
        assert!(map.are_mapped(a_domain[0], b_domain[0]));
        assert!(map.are_mapped(a_domain[1], b_domain[1]));
        assert!(!map.are_mapped(a_domain[0], b_domain[1]));
    }

    #[test]
    fn test_concrete_id_prefers_non_broadcast() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[8]);
        let big = fusion.new_contiguous_tensor(DataType::Float, &[4, 8]);
        let bc = fusion.broadcast(a, &[true, false]);
        let out = fusion.add(bc, big);
        fusion.add_input(a);
        fusion.add_input(big);
        fusion.add_output(out);

        let map = ComputeAtMap::build(&fusion);
        let bc_root = fusion.tv_root(bc);
        let concrete = map.concrete_id(&fusion, bc_root[0]);
        // The broadcast axis resolves to a concretized (non-broadcast) loop.
        assert!(!fusion.iter_domain(concrete).is_broadcast());
    }
}
