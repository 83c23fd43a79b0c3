//! Device Backend
//!
//! The textual-kernel compiler and driver are external collaborators hidden
//! behind [`DeviceBackend`]: compile a translation unit into a module
//! handle, allocate device buffers, launch with a marshalled argument
//! buffer. Compilation is synchronous and may be slow; launches are
//! asynchronous on the device stream.
//!
//! [`StubBackend`] implements the trait in-process for tests and dry runs:
//! it hands out fake handles and records every compile and launch.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::exec::args::KernelArgBuffer;
use crate::types::DeviceId;

/// Opaque handle of a compiled kernel; owned by its cache entry and stable
/// after insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledKernel {
    pub handle: u64,
}

/// A raw device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePtr(pub u64);

/// Evaluated launch shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: (i64, i64, i64),
    pub block: (i64, i64, i64),
    pub shared_bytes: i64,
}

impl LaunchDims {
    pub fn block_threads(&self) -> i64 {
        self.block.0 * self.block.1 * self.block.2
    }

    pub fn grid_blocks(&self) -> i64 {
        self.grid.0 * self.grid.1 * self.grid.2
    }
}

/// External compiler + driver collaborator.
pub trait DeviceBackend: Send + Sync {
    fn device(&self) -> DeviceId;

    /// Compile a kernel translation unit; the error carries the compiler's
    /// accumulated diagnostic log.
    fn compile(&self, entry_name: &str, source: &str) -> anyhow::Result<CompiledKernel>;

    /// Allocate a device buffer of `bytes`.
    fn allocate(&self, bytes: usize) -> anyhow::Result<DevicePtr>;

    /// Launch a compiled kernel with the marshalled arguments. Asynchronous
    /// on the device stream; outputs are valid after synchronization.
    fn launch(
        &self,
        kernel: CompiledKernel,
        dims: LaunchDims,
        args: &KernelArgBuffer,
    ) -> anyhow::Result<()>;
}

/// Record of one launch through the stub backend.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub kernel: CompiledKernel,
    pub dims: LaunchDims,
    pub num_args: usize,
}

/// In-process stand-in for the real compiler/driver pair.
#[derive(Debug, Default)]
pub struct StubBackend {
    device: DeviceId,
    next_handle: AtomicU64,
    next_ptr: AtomicU64,
    compiles: Mutex<Vec<String>>,
    launches: Mutex<Vec<LaunchRecord>>,
}

impl StubBackend {
    pub fn new(device: DeviceId) -> Self {
        StubBackend {
            device,
            next_handle: AtomicU64::new(1),
            next_ptr: AtomicU64::new(0x1000),
            compiles: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.lock().len()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }

    pub fn last_source(&self) -> Option<String> {
        self.compiles.lock().last().cloned()
    }
}

impl DeviceBackend for StubBackend {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn compile(&self, _entry_name: &str, source: &str) -> anyhow::Result<CompiledKernel> {
        self.compiles.lock().push(source.to_string());
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(CompiledKernel { handle })
    }

    fn allocate(&self, bytes: usize) -> anyhow::Result<DevicePtr> {
        let aligned = (bytes.max(1) as u64 + 255) & !255;
        let ptr = self.next_ptr.fetch_add(aligned, Ordering::Relaxed);
        Ok(DevicePtr(ptr))
    }

    fn launch(
        &self,
        kernel: CompiledKernel,
        dims: LaunchDims,
        args: &KernelArgBuffer,
    ) -> anyhow::Result<()> {
        self.launches.lock().push(LaunchRecord { kernel, dims, num_args: args.num_args() });
        Ok(())
    }
}
