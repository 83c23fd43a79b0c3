//! Iteration Domain Algebra
//!
//! Split/Merge/Reorder/rFactor over tensor domains, plus replay of
//! transformation histories between tensors. The node types themselves
//! (`IterDomain`, `TensorDomain`) live in [`crate::ir`]; this module owns
//! the operations that rewrite them.

mod replay;
mod transform;

pub use replay::{
    apply_replay_to_tv, best_effort_replay, replay_producer_as_consumer, ReplayResult,
};
pub use transform::{const_domain_product, TransformError};
