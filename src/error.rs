//! Crate Error Taxonomy
//!
//! Each subsystem defines its own `thiserror` enum next to the code that
//! raises it; this module unifies them into a single crate-level `Error` so
//! callers of the cache's run entry point see one type. Scheduling and
//! lowering failures leave the IR they were applied to unchanged; argument
//! validation failures do not evict cache entries; compile failures do.

use thiserror::Error;

use crate::compute_at::ComputeAtError;
use crate::domain::TransformError;
use crate::exec::ExecError;
use crate::lower::LoweringError;
use crate::root_map::MappingError;
use crate::scheduler::SchedulerError;

/// Top-level error for the fusion compiler.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid domain transformation (split/merge/reorder/rfactor)
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Invalid computeAt configuration
    #[error(transparent)]
    ComputeAt(#[from] ComputeAtError),

    /// Root-domain mapping failure
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Lowering / indexing failure
    #[error(transparent)]
    Lowering(#[from] LoweringError),

    /// Scheduler failure
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Execution cache / runtime failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Configuration loading failure
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
