//! Domain Transformation Tests
//!
//! Split/Merge/Reorder/rFactor over tensor domains: shapes, provenance,
//! error behavior, and the root-size round-trip invariant.

use fusor::domain::const_domain_product;
use fusor::{DataType, Fusion, TransformError};

#[test]
fn test_split_creates_outer_ceil_div_extent() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[100]);
    fusion.split(tv, 0, 32).expect("split");

    let domain = fusion.tv_current_domain(tv);
    assert_eq!(domain.len(), 2);
    let outer = fusion.iter_domain(domain[0]);
    let inner = fusion.iter_domain(domain[1]);
    // ceilDiv(100, 32) = 4
    assert_eq!(fusion.val(outer.extent).const_int(), Some(4));
    assert_eq!(fusion.val(inner.extent).const_int(), Some(32));
}

#[test]
fn test_split_propagates_reduction_flag_not_parallel_tag() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[8, 64]);
    let red = fusion.sum(tv, &[1]);
    fusion
        .parallelize(red, 1, fusor::ParallelType::TIDx)
        .expect("parallelize");
    fusion.split(red, 1, 16).expect("split");

    let domain = fusion.tv_current_domain(red);
    let outer = fusion.iter_domain(domain[1]);
    let inner = fusion.iter_domain(domain[2]);
    assert!(outer.is_reduction());
    assert!(inner.is_reduction());
    // The parallel tag stays behind on the split input.
    assert_eq!(outer.parallel, fusor::ParallelType::Serial);
    assert_eq!(inner.parallel, fusor::ParallelType::Serial);
}

#[test]
fn test_merge_requires_matching_kinds() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[8, 64]);
    let red = fusion.sum(tv, &[1]);
    let err = fusion.merge(red, 0);
    assert!(matches!(err, Err(TransformError::MergeMismatchedKinds { .. })));
    // Failure leaves the domain unchanged.
    assert_eq!(fusion.tv_n_dims(red), 2);
}

#[test]
fn test_invalid_axis_errors_leave_domain_unchanged() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[8, 8]);
    let before = fusion.tv_current_domain(tv);

    assert!(matches!(
        fusion.split(tv, 7, 2),
        Err(TransformError::AxisOutOfRange { .. })
    ));
    assert!(matches!(
        fusion.split(tv, 0, -3),
        Err(TransformError::BadSplitFactor { .. })
    ));
    assert!(matches!(
        fusion.reorder(tv, &[(0, 5)]),
        Err(TransformError::AxisOutOfRange { .. })
    ));
    assert_eq!(fusion.tv_current_domain(tv), before);
}

#[test]
fn test_transformation_round_trip_preserves_size_product() {
    // Arbitrary split/merge sequences keep the domain size product equal
    // to the root size product.
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[6, 10, 14]);
    let root_product = const_domain_product(&fusion, &fusion.tv_root(tv)).expect("const");

    fusion.merge(tv, 0).expect("merge");
    fusion.split(tv, 0, 5).expect("split");
    fusion.split(tv, 2, 7).expect("split");
    fusion.merge(tv, 1).expect("merge");

    let domain = fusion.tv_current_domain(tv);
    let domain_product = const_domain_product(&fusion, &domain).expect("const");
    // Splits can round up, never down.
    assert!(domain_product >= root_product);
    // With dividing factors the product is exact.
    let mut fusion2 = Fusion::new();
    let tv2 = fusion2.new_contiguous_tensor(DataType::Float, &[8, 16]);
    let root2 = const_domain_product(&fusion2, &fusion2.tv_root(tv2)).expect("const");
    fusion2.merge(tv2, 0).expect("merge");
    fusion2.split(tv2, 0, 4).expect("split");
    fusion2.split(tv2, 1, 2).expect("split");
    let domain2 = fusion2.tv_current_domain(tv2);
    assert_eq!(const_domain_product(&fusion2, &domain2).expect("const"), root2);
}

#[test]
fn test_reorder_full_cycle_restores_order() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[2, 3, 4]);
    let before = fusion.tv_current_domain(tv);
    fusion.reorder(tv, &[(0, 2), (1, 0), (2, 1)]).expect("reorder");
    fusion.reorder(tv, &[(2, 0), (0, 1), (1, 2)]).expect("reorder");
    assert_eq!(fusion.tv_current_domain(tv), before);
}

#[test]
fn test_rfactor_splits_reduction_into_two_stages() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[1025, 129]);
    let red = fusion.sum(tv, &[1]);
    fusion.add_input(tv);
    fusion.add_output(red);

    // Textbook staging: split by tidx, then unroll, then tidy.
    fusion.split(red, 1, 16).expect("split tidx");
    fusion.split(red, 1, 4).expect("split unroll");
    fusion.split(red, 1, 8).expect("split tidy");
    // domain: [i, r/.., r8, r4, r16]
    let rf = fusion.rfactor(red, &[1, 2]).expect("rfactor outer two");

    // Stage one keeps the selected axes as reductions.
    let rf_domain = fusion.tv_current_domain(rf);
    assert!(fusion.iter_domain(rf_domain[1]).is_reduction());
    assert!(fusion.iter_domain(rf_domain[2]).is_reduction());
    assert!(fusion.iter_domain(rf_domain[3]).is_rfactor);
    assert!(fusion.iter_domain(rf_domain[4]).is_rfactor);

    // Stage two reduces what survives.
    let red_domain = fusion.tv_current_domain(red);
    assert_eq!(red_domain.len(), 3);
    assert!(fusion.iter_domain(red_domain[1]).is_reduction());
    assert!(fusion.iter_domain(red_domain[2]).is_reduction());

    // The DAG now chains input -> rf -> red.
    let stage2 = fusion.val(red).definition().expect("redefined");
    assert_eq!(fusion.expr(stage2).inputs(), &[rf]);
    let stage1 = fusion.val(rf).definition().expect("defined");
    assert_eq!(fusion.expr(stage1).inputs(), &[tv]);
}

#[test]
fn test_rfactor_errors() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[16, 16]);
    let red = fusion.sum(tv, &[1]);

    assert!(matches!(
        fusion.rfactor(red, &[0]),
        Err(TransformError::RFactorNonReduction { .. })
    ));
    assert!(matches!(
        fusion.rfactor(red, &[]),
        Err(TransformError::RFactorEmptySelection)
    ));
    assert!(matches!(
        fusion.rfactor(tv, &[0]),
        Err(TransformError::RFactorNotReduction)
    ));
}

#[test]
fn test_fusion_clone_preserves_transforms() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_contiguous_tensor(DataType::Float, &[16, 16]);
    fusion.merge(tv, 0).expect("merge");
    fusion.split(tv, 0, 8).expect("split");

    let copy = fusion.deep_copy();
    assert_eq!(copy.tv_n_dims(tv), fusion.tv_n_dims(tv));
    assert_eq!(copy.num_exprs(), fusion.num_exprs());
}
