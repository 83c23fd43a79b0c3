//! ComputeAt
//!
//! `compute_at(producer, consumer, pos)` ties the producer's outer loops to
//! the consumer's: the producer's domain is replayed to structurally match
//! the consumer's first `pos` axes, the relation is recorded on the tensor
//! view, and the constraint propagates to every intermediate tensor on any
//! dataflow path between the two. Consumers of the producer that are not on
//! such a path (siblings) are pulled into the same shared loops, and a
//! lowest common descendant, when one exists, receives the tightest
//! constraint.
//!
//! Rejections (`InvalidComputeAt`) come from the root-domain map: a
//! consumer axis inside the requested position that cannot be mapped to the
//! producer without recomputation (typically across a reduction or an
//! unresolvable broadcast).

mod map;

pub use map::ComputeAtMap;

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::domain::{apply_replay_to_tv, replay_producer_as_consumer};
use crate::ir::{ComputeAtLink, Fusion, ValId};
use crate::root_map::{root_map_c2p, ComputeAtRootDomainMap, MappingError};

/// Errors raised by computeAt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeAtError {
    /// Position outside `[0, consumer rank]`
    #[error("computeAt position {pos} outside [0, {rank}]")]
    InvalidPosition { pos: isize, rank: usize },

    /// Producer does not reach the consumer through any expression path
    #[error("{producer} is not a producer of {consumer}")]
    NotADependency { producer: ValId, consumer: ValId },

    /// The requested position cannot be mapped between the two tensors
    #[error("cannot computeAt {producer} into {consumer} at position {pos}: axis {failed_axis} has no mapping")]
    Unmappable { producer: ValId, consumer: ValId, pos: usize, failed_axis: usize },

    /// Root-domain mapping failure
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Record that `producer`'s first `pos` current-domain axes are shared
/// loops with `consumer`'s first `pos`, propagating the constraint through
/// intermediates and sibling consumers. Negative `pos` wraps (`-1` means
/// the consumer's full rank).
pub fn compute_at(
    fusion: &mut Fusion,
    producer: ValId,
    consumer: ValId,
    pos: isize,
) -> Result<(), ComputeAtError> {
    let rank = fusion.tv_n_dims(consumer);
    let norm_pos = if pos < 0 { pos + rank as isize + 1 } else { pos };
    if norm_pos < 0 || norm_pos > rank as isize {
        return Err(ComputeAtError::InvalidPosition { pos, rank });
    }
    let norm_pos = norm_pos as usize;

    if !fusion.is_dependency_of(producer, consumer) {
        return Err(ComputeAtError::NotADependency { producer, consumer });
    }

    // The equivalence analysis validates every replay below; building it
    // once up front also surfaces graph-level contradictions early.
    let root_map = ComputeAtRootDomainMap::build(fusion);

    // Propagation replays domains as it walks; run it on a copy so a
    // rejection leaves the caller's IR untouched.
    let mut trial = fusion.deep_copy();
    let mut positions: HashMap<ValId, usize> = HashMap::new();
    positions.insert(consumer, norm_pos);
    propagate_chains(&mut trial, &root_map, producer, consumer, &mut positions, true)?;
    *fusion = trial;
    Ok(())
}

/// Propagate computeAt positions backward along every dependency chain from
/// `producer` to `consumer`. `positions[consumer]` must be seeded.
fn propagate_chains(
    fusion: &mut Fusion,
    root_map: &ComputeAtRootDomainMap,
    producer: ValId,
    consumer: ValId,
    positions: &mut HashMap<ValId, usize>,
    allow_siblings: bool,
) -> Result<(), ComputeAtError> {
    let chains = fusion.dependency_chains(producer, consumer);
    let chain_tvs: HashSet<ValId> = chains.iter().flatten().copied().collect();

    for chain in &chains {
        for k in (0..chain.len() - 1).rev() {
            let tv = chain[k];
            let succ = chain[k + 1];
            if !fusion.val(tv).is_tensor_view() || !fusion.val(succ).is_tensor_view() {
                continue;
            }
            let succ_pos = positions.get(&succ).copied().unwrap_or(0);
            let tv_pos = bind_pair(fusion, root_map, tv, succ, succ_pos)?;
            let entry = positions.entry(tv).or_insert(0);
            *entry = (*entry).max(tv_pos);
            trace!(tv = %tv, succ = %succ, pos = tv_pos, "computeAt propagated");
        }
    }

    if !allow_siblings {
        return Ok(());
    }

    // Pull consumers of chain tensors that do not lead to the anchor into
    // the shared loops as well.
    let chain_list: Vec<ValId> = chain_tvs
        .iter()
        .copied()
        .filter(|&tv| fusion.val(tv).is_tensor_view() && tv != consumer)
        .collect();
    for tv in chain_list {
        let tv_pos = positions.get(&tv).copied().unwrap_or(0);
        if tv_pos == 0 {
            continue;
        }
        let uses = fusion.val(tv).uses().to_vec();
        for use_expr in uses {
            if fusion.expr(use_expr).is_domain_transform() {
                continue;
            }
            let outs = fusion.expr(use_expr).outputs().to_vec();
            for sibling in outs {
                if chain_tvs.contains(&sibling) || !fusion.val(sibling).is_tensor_view() {
                    continue;
                }
                if let Some(common) = lowest_common_descendant(fusion, sibling, consumer) {
                    // Lowest shared descendant receives the tightest
                    // constraint and propagation re-runs up to it.
                    let entry = positions.entry(common).or_insert(0);
                    *entry = (*entry).max(tv_pos.min(fusion.tv_n_dims(common)));
                    propagate_chains(fusion, root_map, tv, common, positions, false)?;
                } else {
                    // No rejoin point: structure the sibling against its
                    // producer so they share the outer loops.
                    let sib_pos = bind_pair(fusion, root_map, sibling, tv, tv_pos)?;
                    let entry = positions.entry(sibling).or_insert(0);
                    *entry = (*entry).max(sib_pos);
                }
            }
        }
    }
    Ok(())
}

/// Replay `tv` to match `target`'s first `target_pos` axes and record the
/// computeAt relation on `tv`. Returns `tv`'s own shared-prefix length.
///
/// The root pairing goes through the whole-graph equivalence map, so a
/// target axis whose mapping would cross a reduction stays unmapped here
/// and surfaces as `Unmappable` when it falls inside `target_pos`.
fn bind_pair(
    fusion: &mut Fusion,
    root_map: &ComputeAtRootDomainMap,
    tv: ValId,
    target: ValId,
    target_pos: usize,
) -> Result<usize, ComputeAtError> {
    let existing = fusion.tv_compute_at(tv);
    let target_td = fusion.tensor_view(target).domain;
    let tv_td = fusion.tensor_view(tv).domain;
    let target_root = fusion.tv_root(target);
    let mut c2p_root: std::collections::HashMap<ValId, ValId> = std::collections::HashMap::new();
    for &c_id in &target_root {
        if let Ok(m) = root_map.map_consumer_to_producer(fusion, target_td, tv_td, &[c_id]) {
            c2p_root.extend(m);
        }
    }
    // Pairs connected only structurally (e.g. siblings before the map saw
    // their schedule) fall back to positional alignment.
    if c2p_root.is_empty() {
        c2p_root = root_map_c2p(fusion, target, tv);
    }
    let result = replay_producer_as_consumer(fusion, &c2p_root, tv, target, target_pos);
    if result.covered_consumer < target_pos {
        return Err(ComputeAtError::Unmappable {
            producer: tv,
            consumer: target,
            pos: target_pos,
            failed_axis: result.covered_consumer,
        });
    }

    // Monotonic: never pull a tensor back out of a shared loop.
    let keep_existing = existing.is_some_and(|link| link.pos > result.producer_pos);
    if !keep_existing {
        apply_replay_to_tv(fusion, tv, result.domain.clone());
        let view = fusion.tensor_view_mut(tv);
        view.compute_at = Some(ComputeAtLink { consumer: target, pos: result.producer_pos });
        view.this_compute_at_pos = view.this_compute_at_pos.max(result.producer_pos);
    }
    // The target shares those loops too.
    let target_view = fusion.tensor_view_mut(target);
    target_view.this_compute_at_pos = target_view.this_compute_at_pos.max(result.covered_consumer);

    Ok(fusion.produced_at(tv))
}

/// The earliest tensor (in registration order) that both `a` and `b` reach.
fn lowest_common_descendant(fusion: &Fusion, a: ValId, b: ValId) -> Option<ValId> {
    fusion
        .vals()
        .find(|&v| {
            fusion.val(v).is_tensor_view()
                && fusion.is_dependency_of(a, v)
                && fusion.is_dependency_of(b, v)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_compute_at_simple_chain() {
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[16, 8]);
        let half = fusion.new_float(0.5);
        let tv1 = fusion.mul(tv0, half);
        let two = fusion.new_float(2.0);
        let tv2 = fusion.mul(tv1, two);
        fusion.add_input(tv0);
        fusion.add_output(tv2);

        compute_at(&mut fusion, tv1, tv2, 1).expect("valid computeAt");
        assert_eq!(fusion.produced_at(tv1), 1);
        let link = fusion.tv_compute_at(tv1).expect("link recorded");
        assert_eq!(link.consumer, tv2);
        assert_eq!(link.pos, 1);
        // The consumer shares the loop.
        assert_eq!(fusion.produced_at(tv2), 1);
    }

    #[test]
    fn test_compute_at_position_validation() {
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[16, 8]);
        let one = fusion.new_float(1.0);
        let tv1 = fusion.add(tv0, one);
        fusion.add_input(tv0);
        fusion.add_output(tv1);

        assert!(matches!(
            compute_at(&mut fusion, tv0, tv1, 3),
            Err(ComputeAtError::InvalidPosition { .. })
        ));
        // -1 wraps to the full rank.
        compute_at(&mut fusion, tv0, tv1, -1).expect("full-depth computeAt");
        assert_eq!(fusion.produced_at(tv0), 2);
    }

    #[test]
    fn test_compute_at_rejects_non_dependency() {
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[8]);
        let tv1 = fusion.new_contiguous_tensor(DataType::Float, &[8]);
        let one = fusion.new_float(1.0);
        let tv2 = fusion.add(tv1, one);
        fusion.add_output(tv2);
        assert!(matches!(
            compute_at(&mut fusion, tv0, tv2, 1),
            Err(ComputeAtError::NotADependency { .. })
        ));
    }

    #[test]
    fn test_double_consumer_pulls_sibling() {
        // tv1 = tv0 * 0.5; tv2 = tv1 * -1; tv3 = tv1 * -2
        // tv1.computeAt(tv3, 1) must pull tv2 into the shared loop.
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[16]);
        let half = fusion.new_float(0.5);
        let tv1 = fusion.mul(tv0, half);
        let neg1 = fusion.new_float(-1.0);
        let tv2 = fusion.mul(tv1, neg1);
        let neg2 = fusion.new_float(-2.0);
        let tv3 = fusion.mul(tv1, neg2);
        fusion.add_input(tv0);
        fusion.add_output(tv2);
        fusion.add_output(tv3);

        compute_at(&mut fusion, tv1, tv3, 1).expect("valid computeAt");
        assert_eq!(fusion.produced_at(tv1), 1);
        assert_eq!(fusion.produced_at(tv3), 1);
        // The sibling consumer is in the shared loop as well.
        assert_eq!(fusion.produced_at(tv2), 1);
    }

    #[test]
    fn test_compute_at_monotonic() {
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[16, 8]);
        let one = fusion.new_float(1.0);
        let tv1 = fusion.add(tv0, one);
        let two = fusion.new_float(2.0);
        let tv2 = fusion.add(tv1, two);
        fusion.add_input(tv0);
        fusion.add_output(tv2);

        compute_at(&mut fusion, tv1, tv2, 2).expect("deep computeAt");
        assert_eq!(fusion.produced_at(tv1), 2);
        // A later, looser call does not pull the tensor back out.
        compute_at(&mut fusion, tv1, tv2, 1).expect("looser computeAt");
        assert_eq!(fusion.produced_at(tv1), 2);
    }

    #[test]
    fn test_reduction_blocks_full_depth_compute_at() {
        // x -> max over axis 1 -> broadcast back -> subtract: computing the
        // input fully inline would recompute through the reduction.
        let mut fusion = Fusion::new();
        let x = fusion.new_contiguous_tensor(DataType::Float, &[4, 8]);
        let mx = fusion.max_reduce(x, &[1]);
        let bc = fusion.broadcast(mx, &[false, true]);
        let out = fusion.sub(x, bc);
        fusion.add_input(x);
        fusion.add_output(out);

        let err = compute_at(&mut fusion, x, out, -1);
        assert!(matches!(err, Err(ComputeAtError::Unmappable { .. })));

        // Position 1 only shares the outer loop and is fine.
        let mut fusion2 = Fusion::new();
        let x = fusion2.new_contiguous_tensor(DataType::Float, &[4, 8]);
        let mx = fusion2.max_reduce(x, &[1]);
        let bc = fusion2.broadcast(mx, &[false, true]);
        let out = fusion2.sub(x, bc);
        fusion2.add_input(x);
        fusion2.add_output(out);
        compute_at(&mut fusion2, x, out, 1).expect("outer-loop computeAt");
        assert_eq!(fusion2.produced_at(x), 1);
    }
}
