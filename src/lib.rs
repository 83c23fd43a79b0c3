//! # Fusor
//!
//! A fusion compiler for pointwise and reduction tensor operations
//! targeting GPU-class accelerators: given a dataflow subgraph of tensor
//! primitives, lower it into a single device kernel whose iteration
//! structure is chosen by an automatic scheduler, whose memory accesses are
//! computed by a symbolic indexer, and whose execution is dispatched
//! through a runtime cache keyed on shape/stride/contiguity signatures.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Typed dataflow graph
//!     ↓
//! [Graph-shape cache]        → canonical text → cache id
//!     ↓ (miss)
//! [Permutation normalization]→ stride-sorted graph
//!     ↓
//! [Fusion build]             → math IR (Val/Expr arena)
//!     ↓
//! [Scheduler]                → Split/Merge/rFactor/computeAt + LaunchParams
//!     ↓
//! [Expression sorting]       → loop-structure order
//!     ↓
//! [Loop nests + Indexing]    → kernel IR over TensorIndex slots
//!     ↓
//! [Sync insertion]           → RAW/WAR barriers
//!     ↓
//! [Codegen]                  → kernel source → backend compile
//!     ↓
//! [Kernel-shape cache]       → marshalled launch
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fusor::{Config, GraphCache, StubBackend};
//!
//! let backend = Arc::new(StubBackend::new(fusor::DeviceId(0)));
//! let cache = GraphCache::new(backend, Config::load()?);
//!
//! let id = cache.register_or_get(&graph);
//! let outputs = cache.run_graph_with_inputs(id, &inputs)?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ir` | Val/Expr arena (the fusion), builders, structural comparison |
//! | `domain` | Split/Merge/Reorder/rFactor and transformation replay |
//! | `root_map` | root-domain equivalence with broadcast concretization |
//! | `compute_at` | computeAt propagation and the loop equivalence map |
//! | `sort` | computeAt-aware expression sorting |
//! | `index` | backward index propagation and contiguity analysis |
//! | `lower` | kernel IR, loop-nest generation, barrier insertion |
//! | `codegen` | kernel source emission |
//! | `scheduler` | pointwise and reduction schedulers |
//! | `exec` | two-level execution cache, argument marshalling, backend |

pub mod compute_at;
pub mod config;
pub mod domain;
pub mod error;
pub mod evaluator;
pub mod exec;
pub mod graph;
pub mod index;
pub mod ir;
pub mod lower;
pub mod root_map;
pub mod scheduler;
pub mod sort;
pub mod types;

pub mod codegen;

// Re-export the main surface
pub use compute_at::{compute_at, ComputeAtError, ComputeAtMap};
pub use config::{CacheConfig, Config, DeviceConfig, LoggingConfig, SchedulerConfig};
pub use domain::TransformError;
pub use error::{Error, Result};
pub use evaluator::ExpressionEvaluator;
pub use exec::{
    ArgValue, CacheId, DeviceBackend, ExecError, FusionExecutor, GraphCache, InputsRequirement,
    StubBackend, TensorArg,
};
pub use graph::{GraphDef, GraphNode, GraphOpKind, GraphTensorType, GraphValue, StrideProperty};
pub use ir::{Fusion, ScalarConst, ValId};
pub use lower::{lower_fusion, Kernel, LoweringError};
pub use root_map::{ComputeAtRootDomainMap, MappingError, PairwiseRootDomainMap};
pub use scheduler::{
    schedule, schedule_pointwise, schedule_reduction, LaunchParams, SchedulerError,
};
pub use types::{
    BinaryOpKind, DataType, DeviceId, IterType, MemoryType, ParallelType, TernaryOpKind,
    UnaryOpKind,
};
