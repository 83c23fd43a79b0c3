//! Automatic Schedulers
//!
//! Turn an unscheduled fusion into a parallelized one: the pointwise
//! scheduler flattens and tiles the output for a one-dimensional grid, the
//! reduction scheduler (see [`reduction`]) picks block/grid tiling and
//! cross-thread/cross-block strategies from the evaluated extents. Both
//! stash the chosen launch configuration on the fusion and return a
//! [`LaunchParams`] record.

mod reduction;

pub use reduction::{reduction_heuristic, schedule_reduction, ReductionParams};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::compute_at::{compute_at, ComputeAtError};
use crate::config::{DeviceConfig, SchedulerConfig};
use crate::domain::TransformError;
use crate::ir::{Fusion, ValId};
use crate::types::{LaunchConfigType, ParallelType};

/// Launch configuration chosen by a scheduler. A `-1` entry means "inherit
/// from the fusion's stored launch config at runtime".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub bidx: i64,
    pub bidy: i64,
    pub bidz: i64,
    pub tidx: i64,
    pub tidy: i64,
    pub tidz: i64,
    pub shared_bytes: i64,
}

impl Default for LaunchParams {
    fn default() -> Self {
        LaunchParams { bidx: -1, bidy: -1, bidz: -1, tidx: -1, tidy: -1, tidz: -1, shared_bytes: -1 }
    }
}

/// Scheduler errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The reduction scheduler needs a reduction in the fusion
    #[error("fusion has no reduction to schedule")]
    NoReduction,

    /// A reduction extent could not be evaluated from the bound sizes
    #[error("could not evaluate the extent of reduction axis {axis}")]
    UnboundExtent { axis: ValId },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    ComputeAt(#[from] ComputeAtError),
}

/// Dispatch to the reduction or pointwise scheduler.
pub fn schedule(
    fusion: &mut Fusion,
    input_extents: &[(ValId, i64)],
    device: &DeviceConfig,
    config: &SchedulerConfig,
) -> Result<LaunchParams, SchedulerError> {
    if fusion.has_reduction() {
        schedule_reduction(fusion, input_extents, device, config)
    } else {
        schedule_pointwise(fusion, config)
    }
}

/// Pointwise scheduler: merge every output flat, split by the block size
/// and (unless RNG disables it) the unroll factor, pull all inputs into the
/// outer loop, and parallelize `(BIDx, Unroll, TIDx)`.
pub fn schedule_pointwise(
    fusion: &mut Fusion,
    config: &SchedulerConfig,
) -> Result<LaunchParams, SchedulerError> {
    let disable_unroll = config.disable_unroll || fusion.has_rng();
    let unroll_factor = if disable_unroll { 1 } else { i64::from(config.unroll_factor) };
    let block_size = i64::from(config.pointwise_block_size);
    debug!(block_size, unroll_factor, "pointwise schedule");

    let outputs: Vec<ValId> = fusion
        .outputs()
        .iter()
        .copied()
        .filter(|&v| fusion.val(v).is_tensor_view())
        .collect();

    for &out_tv in &outputs {
        while fusion.tv_n_dims(out_tv) > 1 {
            fusion.merge(out_tv, 0)?;
        }
        fusion.split(out_tv, 0, block_size)?;
        if !disable_unroll {
            fusion.split(out_tv, 0, unroll_factor)?;
        }
    }

    for &out_tv in &outputs {
        let inputs = fusion.inputs_of(out_tv);
        for inp in inputs {
            if fusion.val(inp).is_tensor_view() {
                compute_at(fusion, inp, out_tv, 1)?;
            }
        }
        fusion.parallelize(out_tv, 0, ParallelType::BIDx)?;
    }

    // Bind the inner axes of every non-input tensor.
    for tv in fusion.vals().collect::<Vec<_>>() {
        if !fusion.val(tv).is_tensor_view() || fusion.is_input(tv) {
            continue;
        }
        let n_dims = fusion.tv_n_dims(tv);
        if !disable_unroll && n_dims == 3 {
            fusion.parallelize(tv, -2, ParallelType::Unroll)?;
            fusion.parallelize(tv, -1, ParallelType::TIDx)?;
        } else if n_dims == 2 {
            fusion.parallelize(tv, -1, ParallelType::TIDx)?;
        }
    }

    // Grid size follows the first output's outer extent at launch time.
    let out0 = outputs[0];
    let outer_extent = {
        let axis0 = fusion.tv_axis(out0, 0);
        fusion.iter_domain(axis0).extent
    };
    fusion.set_launch_config(LaunchConfigType::BIDx, outer_extent);
    let tidx = fusion.new_int(block_size);
    fusion.set_launch_config(LaunchConfigType::TIDx, tidx);
    let one_slots = [
        LaunchConfigType::BIDy,
        LaunchConfigType::BIDz,
        LaunchConfigType::TIDy,
        LaunchConfigType::TIDz,
    ];
    for slot in one_slots {
        let one = fusion.one();
        fusion.set_launch_config(slot, one);
    }
    let zero = fusion.zero();
    fusion.set_launch_config(LaunchConfigType::SharedMemory, zero);

    Ok(LaunchParams::default())
}
