//! Fusion Executor
//!
//! Owns one compiled kernel: lowers a scheduled fusion, emits and compiles
//! the source through the backend collaborator, then dispatches launches —
//! validating arguments against the kernel's parameter list, binding
//! extents, evaluating the launch configuration, appending the Philox pair
//! and grid-reduction scratch buffers, and marshalling everything into an
//! aligned argument buffer.

use tracing::debug;

use crate::codegen::{generate_kernel_source, kernel_entry_name};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::evaluator::ExpressionEvaluator;
use crate::exec::args::{ArgValue, KernelArgBuffer, TensorArg};
use crate::exec::backend::{CompiledKernel, DeviceBackend, LaunchDims};
use crate::exec::ExecError;
use crate::ir::{ExprKind, Fusion};
use crate::lower::{lower_fusion, Kernel};
use crate::scheduler::LaunchParams;
use crate::types::{DataType, DeviceId, IterType, LaunchConfigType, ParallelType};

/// One compiled kernel and everything needed to launch it.
#[derive(Debug)]
pub struct FusionExecutor {
    fusion: Fusion,
    kernel: Kernel,
    source: String,
    compiled: CompiledKernel,
    launch: LaunchParams,
    device: DeviceId,
    philox_seed: u64,
    philox_offset: u64,
}

impl FusionExecutor {
    /// Lower, emit and compile a scheduled fusion. A compile failure
    /// surfaces with the accumulated diagnostic log and nothing is kept.
    pub fn compile(
        mut fusion: Fusion,
        launch: LaunchParams,
        backend: &dyn DeviceBackend,
        config: &CacheConfig,
        cache_id: usize,
    ) -> Result<Self> {
        let kernel = lower_fusion(&mut fusion)?;
        let source = generate_kernel_source(&fusion, &kernel);

        if let Some(dir) = &config.debug_dump_dir {
            let path = dir.join(format!("kernel_{cache_id}.cu"));
            if let Err(err) = std::fs::create_dir_all(dir)
                .and_then(|()| std::fs::write(&path, &source))
            {
                tracing::warn!(?path, %err, "failed to dump kernel source");
            }
        }
        debug!(cache_id, bytes = source.len(), "compiling kernel");

        let compiled = backend
            .compile(&kernel_entry_name(), &source)
            .map_err(|e| ExecError::Compile { log: format!("{e:#}") })?;

        Ok(FusionExecutor {
            fusion,
            kernel,
            source,
            compiled,
            launch,
            device: backend.device(),
            philox_seed: rand::random(),
            philox_offset: 0,
        })
    }

    pub fn compiled_kernel(&self) -> CompiledKernel {
        self.compiled
    }

    pub fn kernel_source(&self) -> &str {
        &self.source
    }

    /// Validate, marshal and launch; returns the output tensor
    /// descriptors. Outputs are valid after stream synchronization.
    pub fn run(
        &mut self,
        inputs: &[ArgValue],
        backend: &dyn DeviceBackend,
    ) -> Result<Vec<TensorArg>> {
        self.validate_args(inputs)?;

        // Bind every input tensor's root extents to the argument sizes.
        let mut eval = ExpressionEvaluator::new(&self.fusion);
        let fusion_inputs = self.fusion.inputs().to_vec();
        for (&param, arg) in fusion_inputs.iter().zip(inputs.iter()) {
            if let (true, Some(tensor)) = (self.fusion.val(param).is_tensor_view(), arg.as_tensor())
            {
                let root = self.fusion.tv_root(param);
                for (k, &id) in root.iter().enumerate() {
                    if let Some(&size) = tensor.sizes.get(k) {
                        eval.bind(self.fusion.iter_domain(id).extent, size);
                    }
                }
            }
        }

        let dims = self.evaluate_launch(&mut eval)?;

        // Allocate outputs.
        let mut outputs: Vec<TensorArg> = Vec::new();
        for &out_tv in self.fusion.outputs() {
            let mut sizes: Vec<i64> = Vec::new();
            for &id in &self.fusion.tv_root(out_tv) {
                let dom = self.fusion.iter_domain(id);
                if dom.is_reduction() {
                    continue;
                }
                let extent = dom.extent;
                let size =
                    eval.evaluate(extent).ok_or_else(|| ExecError::IncompatibleLaunchConfig {
                        reason: format!("unbound output extent on tensor {out_tv}"),
                    })?;
                sizes.push(size);
            }
            let dtype = self.fusion.val(out_tv).dtype();
            let bytes = sizes.iter().product::<i64>().max(1) as usize * dtype.size_of();
            let ptr = backend
                .allocate(bytes)
                .map_err(|e| ExecError::Driver { reason: format!("{e:#}") })?;
            outputs.push(TensorArg::contiguous(ptr, dtype, self.device, &sizes));
        }

        // Marshal: tensor inputs, outputs, scalar inputs, philox pair,
        // grid-reduction scratch.
        let mut args = KernelArgBuffer::new();
        for arg in inputs {
            if let ArgValue::Tensor(tensor) = arg {
                args.push_tensor(tensor);
            }
        }
        for out in &outputs {
            args.push_tensor(out);
        }
        for arg in inputs {
            match arg {
                ArgValue::Tensor(_) => {}
                ArgValue::Float(v) => args.push_float(*v as f32),
                ArgValue::Int(v) => args.push_int(*v),
                ArgValue::Bool(v) => args.push_bool(*v),
            }
        }
        if self.kernel.has_rng {
            let numel = outputs.first().map_or(1, TensorArg::numel).max(1);
            let rand_offset =
                4 * ((numel as f64 / (4.0 * 128.0 * dims.grid.0 as f64)).ceil() as u64 + 1);
            args.push_u64(self.philox_seed);
            args.push_u64(self.philox_offset);
            self.philox_offset += rand_offset;
        }
        if self.kernel.has_grid_reduction {
            let (work_bytes, sync_bytes) = self.grid_reduction_buffer_sizes(dims);
            let work_buf = backend
                .allocate(work_bytes)
                .map_err(|e| ExecError::Driver { reason: format!("{e:#}") })?;
            let sync_flags = backend
                .allocate(sync_bytes)
                .map_err(|e| ExecError::Driver { reason: format!("{e:#}") })?;
            args.push_ptr(work_buf);
            args.push_ptr(sync_flags);
        }

        backend
            .launch(self.compiled, dims, &args)
            .map_err(|e| ExecError::Driver { reason: format!("{e:#}") })?;
        Ok(outputs)
    }

    /// Compare each argument's kind, rank, element type and device against
    /// the kernel's parameter list. Mismatches surface without touching the
    /// cache entry.
    fn validate_args(&self, inputs: &[ArgValue]) -> Result<()> {
        let params = self.fusion.inputs();
        if inputs.len() != params.len() {
            return Err(ExecError::IncompatibleLaunchConfig {
                reason: format!(
                    "wrong number of kernel inputs: got {}, expected {}",
                    inputs.len(),
                    params.len()
                ),
            }
            .into());
        }
        for (i, (&param, arg)) in params.iter().zip(inputs.iter()).enumerate() {
            let param_is_tensor = self.fusion.val(param).is_tensor_view();
            match (param_is_tensor, arg) {
                (true, ArgValue::Tensor(tensor)) => {
                    let param_rank = self
                        .fusion
                        .no_reductions(&self.fusion.tv_root(param))
                        .len();
                    if tensor.rank() > param_rank {
                        return Err(ExecError::IncompatibleLaunchConfig {
                            reason: format!(
                                "input {i}: rank {} exceeds parameter rank {param_rank}",
                                tensor.rank()
                            ),
                        }
                        .into());
                    }
                    if tensor.dtype != self.fusion.val(param).dtype() {
                        return Err(ExecError::IncompatibleLaunchConfig {
                            reason: format!(
                                "input {i}: element type {:?} does not match parameter {:?}",
                                tensor.dtype,
                                self.fusion.val(param).dtype()
                            ),
                        }
                        .into());
                    }
                    if tensor.device != self.device {
                        return Err(ExecError::IncompatibleLaunchConfig {
                            reason: format!(
                                "input {i}: device {} is not the compiled device {}",
                                tensor.device, self.device
                            ),
                        }
                        .into());
                    }
                }
                (false, ArgValue::Tensor(_)) => {
                    return Err(ExecError::IncompatibleLaunchConfig {
                        reason: format!("input {i}: argument is a tensor, parameter is a scalar"),
                    }
                    .into());
                }
                (true, _) => {
                    return Err(ExecError::IncompatibleLaunchConfig {
                        reason: format!("input {i}: argument is a scalar, parameter is a tensor"),
                    }
                    .into());
                }
                (false, _) => {}
            }
        }
        Ok(())
    }

    /// Evaluate the launch configuration: explicit fields win, `-1` fields
    /// inherit from the fusion's stored launch config.
    fn evaluate_launch(&self, eval: &mut ExpressionEvaluator<'_>) -> Result<LaunchDims> {
        let mut slot = |field: i64, config: LaunchConfigType, default: i64| -> Result<i64> {
            if field != -1 {
                return Ok(field);
            }
            match self.fusion.launch_config(config) {
                Some(val) => eval.evaluate(val).ok_or_else(|| {
                    ExecError::IncompatibleLaunchConfig {
                        reason: format!("launch config slot {config:?} did not evaluate"),
                    }
                    .into()
                }),
                None => Ok(default),
            }
        };
        let dims = LaunchDims {
            grid: (
                slot(self.launch.bidx, LaunchConfigType::BIDx, 1)?,
                slot(self.launch.bidy, LaunchConfigType::BIDy, 1)?,
                slot(self.launch.bidz, LaunchConfigType::BIDz, 1)?,
            ),
            block: (
                slot(self.launch.tidx, LaunchConfigType::TIDx, 1)?,
                slot(self.launch.tidy, LaunchConfigType::TIDy, 1)?,
                slot(self.launch.tidz, LaunchConfigType::TIDz, 1)?,
            ),
            shared_bytes: slot(self.launch.shared_bytes, LaunchConfigType::SharedMemory, 0)?,
        };
        Ok(dims)
    }

    /// Work-buffer and sync-flag byte sizes for grid reductions, maxed over
    /// every grid reduction in the fusion.
    fn grid_reduction_buffer_sizes(&self, dims: LaunchDims) -> (usize, usize) {
        let mut buffer_size = 0usize;
        let mut sync_flag_size = 0usize;
        for expr_id in self.fusion.exprs_from_outputs() {
            let expr = self.fusion.expr(expr_id);
            if !matches!(expr.kind(), ExprKind::Reduction { .. }) {
                continue;
            }
            let out_tv = expr.output();
            let mut block = [false; 3];
            let mut grid = [false; 3];
            for id in self.fusion.tv_current_domain(out_tv) {
                let dom = self.fusion.iter_domain(id);
                if !dom.is_reduction() {
                    continue;
                }
                match dom.parallel {
                    ParallelType::TIDx => block[0] = true,
                    ParallelType::TIDy => block[1] = true,
                    ParallelType::TIDz => block[2] = true,
                    ParallelType::BIDx => grid[0] = true,
                    ParallelType::BIDy => grid[1] = true,
                    ParallelType::BIDz => grid[2] = true,
                    _ => {}
                }
            }
            if !grid.iter().any(|&g| g) {
                continue;
            }
            // Thread-reduced dimensions finished before the grid stage and
            // sit out of the work buffer.
            let rb_size = (if block[0] { 1 } else { dims.block.0 })
                * (if block[1] { 1 } else { dims.block.1 })
                * (if block[2] { 1 } else { dims.block.2 });
            let num_blocks = dims.grid_blocks();
            let element_size = self.fusion.val(out_tv).dtype().size_of();
            buffer_size =
                buffer_size.max((num_blocks * rb_size).max(1) as usize * element_size);

            let segments = (if grid[0] { 1 } else { dims.grid.0 })
                * (if grid[1] { 1 } else { dims.grid.1 })
                * (if grid[2] { 1 } else { dims.grid.2 });
            sync_flag_size =
                sync_flag_size.max(segments.max(1) as usize * std::mem::size_of::<u32>());
        }
        (buffer_size, sync_flag_size)
    }

    /// Number of expected output tensors.
    pub fn num_outputs(&self) -> usize {
        self.fusion.outputs().len()
    }

    /// Rank of each output after reduction elimination.
    pub fn output_ranks(&self) -> Vec<usize> {
        self.fusion
            .outputs()
            .iter()
            .map(|&tv| {
                self.fusion
                    .tv_root(tv)
                    .iter()
                    .filter(|&&id| {
                        let dom = self.fusion.iter_domain(id);
                        !dom.is_reduction() && dom.iter_type != IterType::BroadcastWithoutStride
                    })
                    .count()
            })
            .collect()
    }

    /// Float-typed outputs' dtypes, in output order.
    pub fn output_dtypes(&self) -> Vec<DataType> {
        self.fusion
            .outputs()
            .iter()
            .map(|&tv| self.fusion.val(tv).dtype())
            .collect()
    }
}
