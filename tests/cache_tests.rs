//! Execution Cache Tests
//!
//! The two-level cache end to end against the stub backend: canonical-key
//! registration, requirement compliance, permutation normalization,
//! argument validation and marshalling order.

use std::sync::Arc;

use fusor::exec::{DevicePtr, InputsRequirement};
use fusor::graph::{GraphNode, GraphOpKind, GraphTensorType, GraphValue};
use fusor::{
    ArgValue, BinaryOpKind, Config, DataType, DeviceId, Error, ExecError, GraphCache, GraphDef,
    ScalarConst, StubBackend, TensorArg,
};

fn contiguous_input(ptr: u64, sizes: &[i64]) -> ArgValue {
    ArgValue::Tensor(TensorArg::contiguous(
        DevicePtr(ptr),
        DataType::Float,
        DeviceId(0),
        sizes,
    ))
}

fn pointwise_graph(rank: usize) -> GraphDef {
    GraphDef {
        values: vec![
            GraphValue::Tensor(GraphTensorType::contiguous(DataType::Float, DeviceId(0), rank)),
            GraphValue::Tensor(GraphTensorType::contiguous(DataType::Float, DeviceId(0), rank)),
            GraphValue::Tensor(GraphTensorType::contiguous(DataType::Float, DeviceId(0), rank)),
        ],
        inputs: vec![0, 1],
        nodes: vec![GraphNode {
            op: GraphOpKind::Binary(BinaryOpKind::Add),
            inputs: vec![0, 1],
            outputs: vec![2],
        }],
        outputs: vec![2],
    }
}

fn reduction_graph() -> GraphDef {
    GraphDef {
        values: vec![
            GraphValue::Tensor(GraphTensorType::contiguous(DataType::Float, DeviceId(0), 2)),
            GraphValue::Scalar { dtype: DataType::Float, literal: Some(ScalarConst::Float(2.0)) },
            GraphValue::Scalar { dtype: DataType::Float, literal: None },
            GraphValue::Scalar { dtype: DataType::Float, literal: None },
        ],
        inputs: vec![0],
        nodes: vec![
            GraphNode {
                op: GraphOpKind::Binary(BinaryOpKind::Add),
                inputs: vec![0, 1],
                outputs: vec![2],
            },
            GraphNode {
                op: GraphOpKind::Reduction { op: BinaryOpKind::Add, axes: vec![1] },
                inputs: vec![2],
                outputs: vec![3],
            },
        ],
        outputs: vec![3],
    }
}

#[test]
fn test_cache_hit_determinism_across_sizes() {
    // Two runs whose InputsRequirement values compare equal route to the
    // same compiled kernel handle.
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend.clone(), Config::default());
    let graph = pointwise_graph(3);

    cache
        .run_graph(&graph, &[contiguous_input(0x100, &[16, 8, 8]), contiguous_input(0x200, &[16, 8, 8])])
        .expect("first run");
    cache
        .run_graph(&graph, &[contiguous_input(0x300, &[12, 6, 6]), contiguous_input(0x400, &[12, 6, 6])])
        .expect("second run");

    assert_eq!(backend.compile_count(), 1);
    let launches = backend.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].kernel, launches[1].kernel);
}

#[test]
fn test_graph_shape_cache_keys_on_canonical_text() {
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend, Config::default());

    let id_a = cache.register_or_get(&pointwise_graph(2));
    let id_b = cache.register_or_get(&pointwise_graph(2));
    assert_eq!(id_a, id_b);

    // Different rank annotation, different entry.
    let id_c = cache.register_or_get(&pointwise_graph(3));
    assert_ne!(id_a, id_c);

    // Different literal, different entry.
    let mut with_literal = pointwise_graph(2);
    with_literal.values[1] =
        GraphValue::Scalar { dtype: DataType::Float, literal: Some(ScalarConst::Float(3.0)) };
    with_literal.inputs = vec![0];
    let id_d = cache.register_or_get(&with_literal);
    assert_ne!(id_a, id_d);
}

#[test]
fn test_permuted_inputs_share_entry_but_not_kernel() {
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend.clone(), Config::default());
    let graph = pointwise_graph(2);
    let id = cache.register_or_get(&graph);

    cache
        .run_graph_with_inputs(id, &[contiguous_input(0x1, &[16, 8]), contiguous_input(0x2, &[16, 8])])
        .expect("row-major");

    let column_major = |ptr: u64| {
        ArgValue::Tensor(TensorArg {
            ptr: DevicePtr(ptr),
            dtype: DataType::Float,
            device: DeviceId(0),
            sizes: vec![16, 8],
            strides: vec![1, 16],
        })
    };
    let outputs = cache
        .run_graph_with_inputs(id, &[column_major(0x3), column_major(0x4)])
        .expect("column-major");

    // Same graph entry, second kernel for the new layout class.
    assert_eq!(backend.compile_count(), 2);
    // The caller sees its own layout back.
    assert_eq!(outputs[0].sizes, vec![16, 8]);
}

#[test]
fn test_permutation_round_trip_for_reduction_graph() {
    // Permuted input layout on a single-reduction graph: the output layout
    // matches running on unpermuted inputs and applying the inverse
    // permutation.
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend, Config::default());
    let graph = reduction_graph();

    let transposed = ArgValue::Tensor(TensorArg {
        ptr: DevicePtr(0x10),
        dtype: DataType::Float,
        device: DeviceId(0),
        sizes: vec![64, 128],
        strides: vec![1, 64],
    });
    let outputs = cache.run_graph(&graph, &[transposed]).expect("permuted run");
    assert_eq!(outputs.len(), 1);
    // Reducing axis 1 of a [64, 128] input leaves 64 elements; the
    // reduction axis was remapped through the permutation, so the permuted
    // execution still eliminated the caller's axis 1.
    assert_eq!(outputs[0].sizes.iter().product::<i64>(), 64);
}

#[test]
fn test_requirement_equality_routes_identically() {
    let a = vec![contiguous_input(0x1, &[16, 8]), contiguous_input(0x2, &[16, 8])];
    let b = vec![contiguous_input(0x9, &[4, 20]), contiguous_input(0x8, &[4, 20])];
    let req_a = InputsRequirement::from_args(&a, &[]).expect("requirement");
    let req_b = InputsRequirement::from_args(&b, &[]).expect("requirement");
    assert!(req_a.comply_with(&req_b));

    // Broadcast-mask difference breaks compliance.
    let c = vec![contiguous_input(0x1, &[1, 8]), contiguous_input(0x2, &[16, 8])];
    let req_c = InputsRequirement::from_args(&c, &[]).expect("requirement");
    assert!(!req_a.comply_with(&req_c));
}

#[test]
fn test_argument_validation_raises_without_evicting() {
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend.clone(), Config::default());
    let graph = pointwise_graph(2);
    let id = cache.register_or_get(&graph);

    cache
        .run_graph_with_inputs(id, &[contiguous_input(0x1, &[8, 8]), contiguous_input(0x2, &[8, 8])])
        .expect("valid run");
    let compiles_before = backend.compile_count();

    // Wrong dtype trips validation at dispatch, not a recompile.
    let bad = vec![
        ArgValue::Tensor(TensorArg::contiguous(DevicePtr(0x5), DataType::Int, DeviceId(0), &[8, 8])),
        ArgValue::Tensor(TensorArg::contiguous(DevicePtr(0x6), DataType::Int, DeviceId(0), &[8, 8])),
    ];
    let err = cache.run_graph_with_inputs(id, &bad).expect_err("must fail");
    assert!(matches!(
        err,
        Error::Exec(ExecError::IncompatibleLaunchConfig { .. })
    ));

    // Deterministic repetition of the failure.
    let err = cache.run_graph_with_inputs(id, &bad).expect_err("fails again");
    assert!(matches!(
        err,
        Error::Exec(ExecError::IncompatibleLaunchConfig { .. })
    ));

    // And the healthy path still hits the cached kernel.
    cache
        .run_graph_with_inputs(id, &[contiguous_input(0x7, &[2, 2]), contiguous_input(0x8, &[2, 2])])
        .expect("cache intact");
    assert_eq!(backend.compile_count(), compiles_before);
}

#[test]
fn test_wrong_arity_rejected() {
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend, Config::default());
    let graph = pointwise_graph(2);
    let id = cache.register_or_get(&graph);

    let err = cache
        .run_graph_with_inputs(id, &[contiguous_input(0x1, &[8, 8])])
        .expect_err("one argument short");
    assert!(matches!(
        err,
        Error::Exec(ExecError::IncompatibleLaunchConfig { .. })
    ));
}

#[test]
fn test_reduction_graph_launch_carries_scratch_args() {
    // A cross-block-sized reduction marshals work/sync buffers after the
    // tensors and scalars.
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend.clone(), Config::default());
    let graph = reduction_graph();

    cache
        .run_graph(&graph, &[contiguous_input(0x10, &[8, 1 << 20])])
        .expect("cross-block run");

    let launches = backend.launches();
    assert_eq!(launches.len(), 1);
    // input tensor + output tensor + philox-free + 2 scratch pointers
    assert_eq!(launches[0].num_args, 4);
    assert!(launches[0].dims.grid.1 > 1, "cross-block schedule uses grid y");
}

#[test]
fn test_unknown_cache_id_is_invalid() {
    let backend = Arc::new(StubBackend::new(DeviceId(0)));
    let cache = GraphCache::new(backend, Config::default());
    let err = cache
        .run_graph_with_inputs(fusor::CacheId(99), &[contiguous_input(0x1, &[4])])
        .expect_err("unknown id");
    assert!(matches!(err, Error::Exec(ExecError::InvalidArguments { .. })));
}
