//! Reduction Scheduler
//!
//! Cost model for single-reduction fusions: from the evaluated output and
//! reduction extents it rounds an initial block shape to powers of two
//! under the thread caps, decides between multiple reductions per block,
//! cross-warp and cross-block strategies from the per-thread work bounds,
//! then applies the matching Split/rFactor/parallelize sequence and stashes
//! the launch configuration.

use tracing::debug;

use crate::compute_at::compute_at;
use crate::config::{DeviceConfig, SchedulerConfig};
use crate::evaluator::ExpressionEvaluator;
use crate::ir::{ExprKind, Fusion, ValId};
use crate::scheduler::{LaunchParams, SchedulerError};
use crate::types::{DataType, LaunchConfigType, ParallelType};

const MAX_NUM_THREADS: i64 = 512;
const VECTOR_SIZE: i64 = 4;
const MIN_VALUES_PER_THREAD: i64 = 16;
const MAX_VALUES_PER_THREAD: i64 = 256;

/// Blocking and strategy chosen by the reduction heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionParams {
    pub grid_dim_x: i64,
    pub grid_dim_y: i64,
    pub block_dim_x: i64,
    pub block_dim_y: i64,
    pub fastest_dim: bool,
    pub cross_warp: bool,
    pub cross_block: bool,
    pub mul_reds_per_blk: bool,
}

impl Default for ReductionParams {
    fn default() -> Self {
        ReductionParams {
            grid_dim_x: 1,
            grid_dim_y: 1,
            block_dim_x: 1,
            block_dim_y: 1,
            fastest_dim: true,
            cross_warp: false,
            cross_block: false,
            mul_reds_per_blk: false,
        }
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Largest power of two not above `n`.
fn last_pow2(n: i64) -> i64 {
    let mut n = n;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n |= n >> 32;
    1.max(n - (n >> 1))
}

/// The heuristic of the cost model; pure function of the extents and the
/// device shape.
pub fn reduction_heuristic(
    red_outputs: i64,
    red_elems: i64,
    red_on_fastest_dim: bool,
    device: &DeviceConfig,
) -> ReductionParams {
    let mut rparams = ReductionParams { fastest_dim: red_on_fastest_dim, ..Default::default() };

    // Initial block shape straight from the extents.
    if rparams.fastest_dim {
        rparams.block_dim_x = red_elems;
        rparams.block_dim_y = red_outputs;
    } else {
        rparams.block_dim_x = red_outputs;
        rparams.block_dim_y = red_elems;
    }

    // Power-of-two rounding under the thread caps; a non-fastest-dim
    // reduction reserves a 4-wide vector.
    let num_threads =
        if rparams.fastest_dim { MAX_NUM_THREADS } else { MAX_NUM_THREADS / VECTOR_SIZE };
    let warp_size = i64::from(device.warp_size);

    rparams.block_dim_x = if rparams.block_dim_x < num_threads {
        last_pow2(rparams.block_dim_x)
    } else {
        num_threads
    };
    rparams.block_dim_y = if rparams.block_dim_y < num_threads {
        last_pow2(rparams.block_dim_y)
    } else {
        num_threads
    };

    let block_dim_x_prev = rparams.block_dim_x;
    rparams.block_dim_x = rparams.block_dim_x.min(warp_size);
    rparams.block_dim_y = rparams.block_dim_y.min(num_threads / rparams.block_dim_x);
    rparams.block_dim_x = block_dim_x_prev.min(num_threads / rparams.block_dim_y);

    // Distribute work across the block.
    let mut inputs_consumed_per_block_iter = 1;
    let mut red_elems_per_thread = red_elems;
    let mut outputs_produced_per_block_iter = 1;

    if rparams.fastest_dim {
        inputs_consumed_per_block_iter *= rparams.block_dim_x;
        red_elems_per_thread = ceil_div(red_elems_per_thread, inputs_consumed_per_block_iter);
    } else {
        outputs_produced_per_block_iter *= rparams.block_dim_x;
    }

    let mut reduce_inputs_across_warps = false;
    if red_elems_per_thread >= rparams.block_dim_y * MIN_VALUES_PER_THREAD
        || red_elems_per_thread >= MAX_VALUES_PER_THREAD
    {
        red_elems_per_thread = ceil_div(red_elems_per_thread, rparams.block_dim_y);
        reduce_inputs_across_warps = true;
        rparams.cross_warp = true;
    } else {
        rparams.mul_reds_per_blk = true;
        outputs_produced_per_block_iter *= rparams.block_dim_y;
    }

    // Distribute work across blocks.
    let blocks_per_sm = i64::from(device.max_threads_per_multiprocessor)
        / (rparams.block_dim_x * rparams.block_dim_y);
    let target_grid_size = i64::from(device.multiprocessor_count) * blocks_per_sm;

    rparams.grid_dim_x = ceil_div(red_outputs, outputs_produced_per_block_iter);

    if reduce_inputs_across_warps
        && red_elems_per_thread >= MAX_VALUES_PER_THREAD
        && rparams.grid_dim_x <= target_grid_size
    {
        let blks_per_out_1 = ceil_div(target_grid_size, rparams.grid_dim_x);
        let blks_per_out_2 = ceil_div(red_elems_per_thread, MIN_VALUES_PER_THREAD);
        let blks_per_out_3 = ceil_div(red_elems_per_thread, MAX_VALUES_PER_THREAD);
        let blks_per_output = blks_per_out_1.min(blks_per_out_2).max(blks_per_out_3);

        rparams.grid_dim_y = blks_per_output.max(1);
        if blks_per_output > 1 {
            rparams.cross_block = true;
        }
    }

    debug!(
        red_elems,
        red_outputs,
        red_on_fastest_dim,
        mul_reds_per_blk = rparams.mul_reds_per_blk,
        cross_warp = rparams.cross_warp,
        cross_block = rparams.cross_block,
        grid_x = rparams.grid_dim_x,
        grid_y = rparams.grid_dim_y,
        block_x = rparams.block_dim_x,
        block_y = rparams.block_dim_y,
        "reduction heuristic"
    );
    rparams
}

/// Schedule the fusion's single distinguished reduction from the bound
/// input extents, apply the transformations and stash the launch config.
pub fn schedule_reduction(
    fusion: &mut Fusion,
    input_extents: &[(ValId, i64)],
    device: &DeviceConfig,
    _config: &SchedulerConfig,
) -> Result<LaunchParams, SchedulerError> {
    // Find the reduction tensor.
    let red_tv = fusion
        .exprs_from_outputs()
        .into_iter()
        .find(|&e| matches!(fusion.expr(e).kind(), ExprKind::Reduction { .. }))
        .map(|e| fusion.expr(e).output())
        .ok_or(SchedulerError::NoReduction)?;

    // Evaluate the extents of the reduction tensor's axes.
    let red_ids = fusion.tv_current_domain(red_tv);
    let mut red_dims: Vec<i64> = Vec::with_capacity(red_ids.len());
    {
        let mut eval = ExpressionEvaluator::new(fusion);
        for &(val, size) in input_extents {
            eval.bind(val, size);
        }
        for &id in &red_ids {
            let extent = fusion.iter_domain(id).extent;
            let size = eval
                .evaluate(extent)
                .ok_or(SchedulerError::UnboundExtent { axis: id })?;
            red_dims.push(size);
        }
    }

    let mut red_outputs = 1i64;
    let mut red_elems = 1i64;
    let mut red_idx = 0usize;
    for (i, &id) in red_ids.iter().enumerate() {
        if fusion.iter_domain(id).is_reduction() {
            red_idx = i;
            red_elems *= red_dims[i];
        } else {
            red_outputs *= red_dims[i];
        }
    }
    let red_on_fastest_dim = red_idx == red_ids.len() - 1;

    let rparams = reduction_heuristic(red_outputs, red_elems, red_on_fastest_dim, device);

    // Coalesce reductions to the right, then merge down to (iter, red).
    coalesce_reduction(fusion, red_tv)?;
    let num_red_axes = fusion
        .tv_current_domain(red_tv)
        .iter()
        .filter(|&&id| fusion.iter_domain(id).is_reduction())
        .count();
    while fusion.tv_n_dims(red_tv) > num_red_axes + 1 {
        fusion.merge(red_tv, 0)?;
    }
    while fusion.tv_n_dims(red_tv) > 2 {
        fusion.merge(red_tv, 1)?;
    }

    let intermediate = apply_reduction_schedule(fusion, red_tv, &rparams)?;

    // Pull pointwise producers inline with the first reduction stage.
    let stage_one = intermediate.unwrap_or(red_tv);
    for inp in fusion.inputs().to_vec() {
        if fusion.val(inp).is_tensor_view() && fusion.is_dependency_of(inp, stage_one) {
            compute_at(fusion, inp, stage_one, -1)?;
        }
    }

    // Shared scratch for the block reduction tree.
    let shared_bytes = if rparams.cross_warp || rparams.cross_block || rparams.mul_reds_per_blk {
        rparams.block_dim_x * rparams.block_dim_y * DataType::Float.size_of() as i64
    } else {
        0
    };

    let launch = LaunchParams {
        bidx: rparams.grid_dim_x,
        bidy: rparams.grid_dim_y,
        bidz: 1,
        tidx: rparams.block_dim_x,
        tidy: rparams.block_dim_y,
        tidz: 1,
        shared_bytes,
    };
    stash_launch_config(fusion, launch);
    Ok(launch)
}

/// Reorder all reduction axes to the rightmost positions.
fn coalesce_reduction(fusion: &mut Fusion, tv: ValId) -> Result<(), SchedulerError> {
    let domain = fusion.tv_current_domain(tv);
    let n_dims = domain.len();
    let reduction_axes: Vec<usize> = domain
        .iter()
        .enumerate()
        .filter(|(_, &id)| fusion.iter_domain(id).is_reduction())
        .map(|(i, _)| i)
        .collect();
    let mut permute: Vec<(isize, isize)> = Vec::new();
    for (i, &axis) in reduction_axes.iter().enumerate() {
        let new_pos = i + n_dims - reduction_axes.len();
        if new_pos == axis {
            break;
        }
        permute.push((axis as isize, new_pos as isize));
    }
    if !permute.is_empty() {
        fusion.reorder(tv, &permute)?;
    }
    Ok(())
}

/// Apply the Split/rFactor/parallelize sequence for the chosen strategy.
/// Returns the rFactor intermediate when one is created.
fn apply_reduction_schedule(
    fusion: &mut Fusion,
    red_tv: ValId,
    rparams: &ReductionParams,
) -> Result<Option<ValId>, SchedulerError> {
    if rparams.fastest_dim {
        if rparams.mul_reds_per_blk {
            // [O, R] -> [O/bdy, bdy, R/bdx, bdx]; each block covers bdy
            // reductions.
            fusion.split(red_tv, -1, rparams.block_dim_x)?;
            fusion.split(red_tv, 0, rparams.block_dim_y)?;
            let rf = fusion.rfactor(red_tv, &[-2])?;
            compute_at(fusion, rf, red_tv, 1)?;

            fusion.parallelize(red_tv, 0, ParallelType::BIDx)?;
            fusion.parallelize(red_tv, 1, ParallelType::TIDy)?;
            fusion.parallelize(red_tv, -1, ParallelType::TIDx)?;
            fusion.parallelize(rf, 1, ParallelType::TIDy)?;
            fusion.parallelize(rf, -1, ParallelType::TIDx)?;
            Ok(Some(rf))
        } else if rparams.cross_block {
            // [O, R] -> [O, R/(gy*bdy*bdx), gy, bdy, bdx], serial residual
            // rFactored out.
            fusion.split(red_tv, -1, rparams.block_dim_x)?;
            fusion.split(red_tv, -2, rparams.block_dim_y)?;
            fusion.split(red_tv, -3, rparams.grid_dim_y)?;
            let rf = fusion.rfactor(red_tv, &[-4])?;
            compute_at(fusion, rf, red_tv, 1)?;

            fusion.parallelize(red_tv, 0, ParallelType::BIDx)?;
            fusion.parallelize(rf, -3, ParallelType::BIDy)?;
            fusion.parallelize(rf, -2, ParallelType::TIDy)?;
            fusion.parallelize(rf, -1, ParallelType::TIDx)?;
            fusion.parallelize(red_tv, -3, ParallelType::BIDy)?;
            fusion.parallelize(red_tv, -2, ParallelType::TIDy)?;
            fusion.parallelize(red_tv, -1, ParallelType::TIDx)?;
            Ok(Some(rf))
        } else {
            // Cross-warp: [O, R] -> [O, R/(bdy*bdx), bdy, bdx].
            fusion.split(red_tv, -1, rparams.block_dim_x)?;
            fusion.split(red_tv, -2, rparams.block_dim_y)?;
            let rf = fusion.rfactor(red_tv, &[-3])?;
            compute_at(fusion, rf, red_tv, 1)?;

            fusion.parallelize(red_tv, 0, ParallelType::BIDx)?;
            fusion.parallelize(rf, -2, ParallelType::TIDy)?;
            fusion.parallelize(rf, -1, ParallelType::TIDx)?;
            fusion.parallelize(red_tv, -2, ParallelType::TIDy)?;
            fusion.parallelize(red_tv, -1, ParallelType::TIDx)?;
            Ok(Some(rf))
        }
    } else if rparams.block_dim_y > 1 {
        // Warp threads cover outputs; the reduction runs across y threads
        // (and across blocks when grid_y > 1).
        fusion.split(red_tv, 0, rparams.block_dim_x)?;
        fusion.split(red_tv, -1, rparams.block_dim_y)?;
        if rparams.grid_dim_y > 1 {
            fusion.split(red_tv, -2, rparams.grid_dim_y)?;
        }
        let rf_axis = if rparams.grid_dim_y > 1 { -3 } else { -2 };
        let rf = fusion.rfactor(red_tv, &[rf_axis])?;
        compute_at(fusion, rf, red_tv, 1)?;

        fusion.parallelize(red_tv, 0, ParallelType::BIDx)?;
        fusion.parallelize(red_tv, 1, ParallelType::TIDx)?;
        fusion.parallelize(rf, 1, ParallelType::TIDx)?;
        if rparams.grid_dim_y > 1 {
            fusion.parallelize(rf, -2, ParallelType::BIDy)?;
            fusion.parallelize(red_tv, -2, ParallelType::BIDy)?;
        }
        fusion.parallelize(rf, -1, ParallelType::TIDy)?;
        fusion.parallelize(red_tv, -1, ParallelType::TIDy)?;
        Ok(Some(rf))
    } else {
        fusion.split(red_tv, 0, rparams.block_dim_x)?;
        fusion.parallelize(red_tv, 0, ParallelType::BIDx)?;
        fusion.parallelize(red_tv, 1, ParallelType::TIDx)?;
        Ok(None)
    }
}

fn stash_launch_config(fusion: &mut Fusion, launch: LaunchParams) {
    let entries = [
        (LaunchConfigType::BIDx, launch.bidx),
        (LaunchConfigType::BIDy, launch.bidy),
        (LaunchConfigType::BIDz, launch.bidz),
        (LaunchConfigType::TIDx, launch.tidx),
        (LaunchConfigType::TIDy, launch.tidy),
        (LaunchConfigType::TIDz, launch.tidz),
        (LaunchConfigType::SharedMemory, launch.shared_bytes),
    ];
    for (slot, value) in entries {
        let val = fusion.new_int(value);
        fusion.set_launch_config(slot, val);
    }
}
