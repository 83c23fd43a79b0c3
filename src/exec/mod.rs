//! Execution Cache
//!
//! The runtime pipeline from an incoming typed graph to a launched kernel,
//! cached at two levels:
//!
//! * **Graph-shape cache**: canonical graph text → cache id. A miss
//!   assigns a fresh id and remembers the graph and its reduction axes.
//! * **Kernel-shape cache** (per id): [`InputsRequirement`] → compiled
//!   executor. A miss normalizes the input layout (stride-order
//!   permutation), builds the fusion, runs the scheduler and the lowering
//!   pipeline, compiles through the backend and stores the executor; a hit
//!   marshals arguments and launches.
//!
//! Both levels sit behind a single lock held across register-or-get and
//! run; entries never move once inserted. Compile failures are not stored;
//! argument-validation failures do not evict.

pub mod args;
pub mod backend;
mod executor;
mod requirements;

pub use args::{contiguous_strides, ArgValue, KernelArgBuffer, TensorArg};
pub use backend::{CompiledKernel, DeviceBackend, DevicePtr, LaunchDims, StubBackend};
pub use executor::FusionExecutor;
pub use requirements::{
    permutation_per_sorted_stride, reverse_permutation, AxisRequirement, InputsRequirement,
    TensorRequirement,
};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::graph::GraphDef;
use crate::ir::ValId;
use crate::scheduler::schedule;

/// Execution-cache and runtime errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Argument validation against the cached kernel's parameters failed
    #[error("incompatible launch arguments: {reason}")]
    IncompatibleLaunchConfig { reason: String },

    /// The external compiler returned a failure; the accumulated
    /// diagnostic log is attached
    #[error("kernel compilation failed:\n{log}")]
    Compile { log: String },

    /// Malformed run request (unknown cache id, missing tensors, mixed
    /// devices)
    #[error("invalid arguments: {reason}")]
    InvalidArguments { reason: String },

    /// Driver-level failure from the backend collaborator
    #[error("device driver error: {reason}")]
    Driver { reason: String },
}

/// Id of a graph-shape cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(pub u32);

struct ShapeEntry {
    requirement: InputsRequirement,
    executor: FusionExecutor,
}

struct GraphEntry {
    graph: GraphDef,
    reduction_axes: Vec<usize>,
    shapes: Vec<ShapeEntry>,
}

struct CacheState {
    ids: HashMap<String, CacheId>,
    entries: Vec<GraphEntry>,
}

/// The two-level execution cache.
pub struct GraphCache {
    backend: Arc<dyn DeviceBackend>,
    config: Config,
    state: Mutex<CacheState>,
}

impl GraphCache {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: Config) -> Self {
        GraphCache {
            backend,
            config,
            state: Mutex::new(CacheState { ids: HashMap::new(), entries: Vec::new() }),
        }
    }

    /// Whether the embedding application should fall back to direct graph
    /// execution when compilation fails. The core only exposes the hook.
    pub fn fallback_enabled(&self) -> bool {
        self.config.cache.enable_fallback
    }

    /// Canonicalize the graph and return its cache id, registering a new
    /// entry on first sight.
    pub fn register_or_get(&self, graph: &GraphDef) -> CacheId {
        let mut state = self.state.lock();
        let key = graph.canonical();
        if let Some(&id) = state.ids.get(&key) {
            return id;
        }
        let id = CacheId(state.entries.len() as u32);
        debug!(id = id.0, "new graph cache entry");
        state.entries.push(GraphEntry {
            graph: graph.clone(),
            reduction_axes: graph.reduction_axes(),
            shapes: Vec::new(),
        });
        state.ids.insert(key, id);
        id
    }

    /// Run a registered graph with concrete inputs; compiles on the first
    /// sight of this input shape class.
    pub fn run_graph_with_inputs(
        &self,
        id: CacheId,
        inputs: &[ArgValue],
    ) -> Result<Vec<TensorArg>> {
        let mut state = self.state.lock();
        let entry_index = id.0 as usize;
        if entry_index >= state.entries.len() {
            return Err(ExecError::InvalidArguments {
                reason: format!("unknown cache id {}", id.0),
            }
            .into());
        }

        let reduction_axes = state.entries[entry_index].reduction_axes.clone();
        let requirement = InputsRequirement::from_args(inputs, &reduction_axes)?;

        let shape_index = state.entries[entry_index]
            .shapes
            .iter()
            .position(|shape| requirement.comply_with(&shape.requirement));

        let shape_index = match shape_index {
            Some(index) => {
                debug!(id = id.0, index, "kernel-shape cache hit");
                index
            }
            None => {
                debug!(id = id.0, "kernel-shape cache miss; compiling");
                let executor =
                    self.compile_for(&state.entries[entry_index], &requirement, inputs, id)?;
                let entry = &mut state.entries[entry_index];
                entry.shapes.push(ShapeEntry { requirement: requirement.clone(), executor });
                entry.shapes.len() - 1
            }
        };

        // Dispatch, normalizing input layout and restoring output layout.
        let needs_permutation = requirement.requires_permutation();
        let run_inputs: Vec<ArgValue> = if needs_permutation {
            inputs
                .iter()
                .map(|arg| match arg {
                    ArgValue::Tensor(t) => {
                        ArgValue::Tensor(t.permute(&requirement.input_permutation))
                    }
                    other => other.clone(),
                })
                .collect()
        } else {
            inputs.to_vec()
        };

        let entry = &mut state.entries[entry_index];
        let outputs = entry.shapes[shape_index]
            .executor
            .run(&run_inputs, self.backend.as_ref())?;

        if needs_permutation {
            Ok(outputs
                .into_iter()
                .map(|out| out.permute(&requirement.output_permutation))
                .collect())
        } else {
            Ok(outputs)
        }
    }

    /// Convenience entry point: register and run in one call, holding the
    /// lock once per step.
    pub fn run_graph(&self, graph: &GraphDef, inputs: &[ArgValue]) -> Result<Vec<TensorArg>> {
        let id = self.register_or_get(graph);
        self.run_graph_with_inputs(id, inputs)
    }

    fn compile_for(
        &self,
        entry: &GraphEntry,
        requirement: &InputsRequirement,
        inputs: &[ArgValue],
        id: CacheId,
    ) -> Result<FusionExecutor> {
        // Normalize the graph to the common stride order.
        let graph = if requirement.requires_permutation() {
            entry.graph.permute(&requirement.input_permutation)
        } else {
            entry.graph.clone()
        };

        let (mut fusion, input_handles) = graph.build_fusion();

        // Bind extents of the (layout-normalized) inputs for the scheduler.
        let mut input_extents: Vec<(ValId, i64)> = Vec::new();
        for (&handle, arg) in input_handles.iter().zip(inputs.iter()) {
            if let (true, Some(tensor)) = (fusion.val(handle).is_tensor_view(), arg.as_tensor()) {
                let permuted = if requirement.requires_permutation() {
                    tensor.permute(&requirement.input_permutation)
                } else {
                    tensor.clone()
                };
                let root = fusion.tv_root(handle);
                for (k, &axis) in root.iter().enumerate() {
                    if let Some(&size) = permuted.sizes.get(k) {
                        input_extents.push((fusion.iter_domain(axis).extent, size));
                    }
                }
            }
        }

        let launch = schedule(
            &mut fusion,
            &input_extents,
            &self.config.device,
            &self.config.scheduler,
        )?;

        FusionExecutor::compile(
            fusion,
            launch,
            self.backend.as_ref(),
            &self.config.cache,
            id.0 as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphNode, GraphOpKind, GraphTensorType, GraphValue};
    use crate::types::{BinaryOpKind, DataType, DeviceId};

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

    fn make_inputs(sizes: &[i64]) -> Vec<ArgValue> {
        vec![
            ArgValue::Tensor(TensorArg::contiguous(
                DevicePtr(0x100),
                DataType::Float,
                DeviceId(0),
                sizes,
            )),
            ArgValue::Tensor(TensorArg::contiguous(
                DevicePtr(0x200),
                DataType::Float,
                DeviceId(0),
                sizes,
            )),
        ]
    }

    #[test]
    fn test_register_or_get_deduplicates_by_canonical_form() {
        let backend = Arc::new(StubBackend::new(DeviceId(0)));
        let cache = GraphCache::new(backend, Config::default());
        let id1 = cache.register_or_get(&pointwise_graph(2));
        let id2 = cache.register_or_get(&pointwise_graph(2));
        assert_eq!(id1, id2);
        let id3 = cache.register_or_get(&pointwise_graph(3));
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_cache_reuse_across_differing_sizes() {
        let backend = Arc::new(StubBackend::new(DeviceId(0)));
        let cache = GraphCache::new(backend.clone(), Config::default());
        let graph = pointwise_graph(3);

        let out1 = cache.run_graph(&graph, &make_inputs(&[16, 8, 8])).expect("first run");
        let out2 = cache.run_graph(&graph, &make_inputs(&[12, 6, 6])).expect("second run");
        assert_eq!(out1.len(), 1);
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0].sizes, vec![12, 6, 6]);

        // One compile, two launches of the same handle.
        assert_eq!(backend.compile_count(), 1);
        let launches = backend.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].kernel, launches[1].kernel);
    }

    #[test]
    fn test_layout_change_compiles_new_kernel() {
        let backend = Arc::new(StubBackend::new(DeviceId(0)));
        let cache = GraphCache::new(backend.clone(), Config::default());
        let graph = pointwise_graph(2);

        cache.run_graph(&graph, &make_inputs(&[16, 8])).expect("row-major run");

        // Transposed layout: same graph id, different requirement.
        let transposed = vec![
            ArgValue::Tensor(TensorArg {
                ptr: DevicePtr(0x100),
                dtype: DataType::Float,
                device: DeviceId(0),
                sizes: vec![16, 8],
                strides: vec![1, 16],
            }),
            ArgValue::Tensor(TensorArg {
                ptr: DevicePtr(0x200),
                dtype: DataType::Float,
                device: DeviceId(0),
                sizes: vec![16, 8],
                strides: vec![1, 16],
            }),
        ];
        let out = cache.run_graph(&graph, &transposed).expect("transposed run");
        assert_eq!(backend.compile_count(), 2);
        // Output restored to the caller's layout.
        assert_eq!(out[0].sizes, vec![16, 8]);
    }

    #[test]
    fn test_argument_validation_does_not_evict() {
        let backend = Arc::new(StubBackend::new(DeviceId(0)));
        let cache = GraphCache::new(backend.clone(), Config::default());
        let graph = pointwise_graph(2);
        let id = cache.register_or_get(&graph);

        cache.run_graph_with_inputs(id, &make_inputs(&[16, 8])).expect("valid run");

        // Wrong element type.
        let bad = vec![
            ArgValue::Tensor(TensorArg::contiguous(
                DevicePtr(0x100),
                DataType::Int,
                DeviceId(0),
                &[16, 8],
            )),
            ArgValue::Tensor(TensorArg::contiguous(
                DevicePtr(0x200),
                DataType::Int,
                DeviceId(0),
                &[16, 8],
            )),
        ];
        let err = cache.run_graph_with_inputs(id, &bad);
        assert!(err.is_err());

        // The original entry still serves hits without recompiling.
        cache.run_graph_with_inputs(id, &make_inputs(&[4, 4])).expect("still cached");
        assert!(backend.compile_count() >= 1);
    }
}
