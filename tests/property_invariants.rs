//! Property-based invariant tests (proptest).
//!
//! Quantified invariants of the core: transformation round trips preserve
//! the domain size product, backward indexing preserves zero, the root
//! domain map is symmetric, and contiguity analysis is idempotent.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use fusor::domain::const_domain_product;
use fusor::index::{find_contiguous_ids, IndexCompute};
use fusor::{ComputeAtRootDomainMap, DataType, Fusion};

/// A sequence of splits and merges applied at pseudo-random positions.
#[derive(Debug, Clone)]
enum Step {
    Split { axis: usize, factor: i64 },
    Merge { axis: usize },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..4, 1i64..9).prop_map(|(axis, factor)| Step::Split { axis, factor }),
        (0usize..4).prop_map(|axis| Step::Merge { axis }),
    ]
}

fn apply_steps(fusion: &mut Fusion, tv: fusor::ValId, steps: &[Step]) {
    for step in steps {
        let rank = fusion.tv_n_dims(tv);
        match *step {
            Step::Split { axis, factor } => {
                let axis = (axis % rank) as isize;
                let _ = fusion.split(tv, axis, factor.max(1));
            }
            Step::Merge { axis } => {
                if rank >= 2 {
                    let axis = (axis % (rank - 1)) as isize;
                    let _ = fusion.merge(tv, axis);
                }
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_split_merge_round_trip_covers_root(
        d0 in 1i64..64,
        d1 in 1i64..64,
        steps in prop::collection::vec(step_strategy(), 0..8),
    ) {
        let mut fusion = Fusion::new();
        let tv = fusion.new_contiguous_tensor(DataType::Float, &[d0, d1]);
        let root_product = const_domain_product(&fusion, &fusion.tv_root(tv)).expect("const");

        apply_steps(&mut fusion, tv, &steps);

        let domain = fusion.tv_current_domain(tv);
        let domain_product = const_domain_product(&fusion, &domain).expect("const");
        // ceilDiv splits can only pad upward; the iteration space always
        // covers the root space.
        prop_assert!(domain_product >= root_product);
        // The root never changes.
        let root_after = const_domain_product(&fusion, &fusion.tv_root(tv)).expect("const");
        prop_assert_eq!(root_after, root_product);
    }

    #[test]
    fn prop_index_zero_preservation(
        d0 in 1i64..32,
        d1 in 1i64..32,
        steps in prop::collection::vec(step_strategy(), 0..6),
    ) {
        let mut fusion = Fusion::new();
        let tv = fusion.new_contiguous_tensor(DataType::Float, &[d0, d1]);
        apply_steps(&mut fusion, tv, &steps);

        let domain = fusion.tv_current_domain(tv);
        let initial: HashMap<_, _> = domain
            .iter()
            .map(|&axis| {
                let zero = fusion.zero();
                (axis, zero)
            })
            .collect();
        let mut ic = IndexCompute::new(initial, HashMap::new(), HashSet::new(), HashSet::new());
        let root = fusion.tv_root(tv);
        ic.run(&mut fusion, &domain, &root);

        for &axis in &root {
            let ind = ic.index_map()[&axis];
            prop_assert!(fusion.val(ind).is_zero_int());
        }
    }

    #[test]
    fn prop_root_map_symmetry(rank in 1usize..4) {
        let mut fusion = Fusion::new();
        let sizes: Vec<i64> = (0..rank).map(|i| 4 + i as i64).collect();
        let a = fusion.new_contiguous_tensor(DataType::Float, &sizes);
        let b = fusion.new_contiguous_tensor(DataType::Float, &sizes);
        let c = fusion.add(a, b);
        let one = fusion.new_float(1.0);
        let d = fusion.add(c, one);
        fusion.add_input(a);
        fusion.add_input(b);
        fusion.add_output(d);

        let map = ComputeAtRootDomainMap::build(&fusion);
        let tds: Vec<_> = [a, b, c, d]
            .iter()
            .map(|&tv| (fusion.tensor_view(tv).domain, fusion.tv_root(tv)))
            .collect();
        for (td_x, root_x) in &tds {
            for (td_y, root_y) in &tds {
                for &id_x in root_x {
                    for &id_y in root_y {
                        let forward = map.can_map(&fusion, *td_x, id_x, *td_y, id_y);
                        let backward = map.can_map(&fusion, *td_y, id_y, *td_x, id_x);
                        prop_assert_eq!(forward, backward);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_contiguity_analysis_idempotent(
        contig in prop::collection::vec(any::<bool>(), 3),
        merge_twice in any::<bool>(),
    ) {
        let mut fusion = Fusion::new();
        let tv = fusion.new_contiguous_tensor(DataType::Float, &[4, 6, 8]);
        fusion.merge(tv, 0).expect("merge");
        if merge_twice {
            fusion.merge(tv, 0).expect("merge");
        }

        let domain = fusion.tv_current_domain(tv);
        let root = fusion.tv_root(tv);
        let first = find_contiguous_ids(&fusion, &domain, &root, &contig);
        let second = find_contiguous_ids(&fusion, &domain, &root, &contig);
        prop_assert_eq!(first, second);
    }
}
