//! Shared Type Tags
//!
//! Small enums shared across the IR, scheduler, lowering and codegen:
//! element types, parallel mappings, iteration-domain roles, memory classes
//! and operator kinds. Everything here is `Copy` and cheap to compare; the
//! structural information lives in the IR nodes themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element type of a value or tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Single-precision float
    Float,
    /// Half-precision float
    Half,
    /// 64-bit signed integer
    Int,
    /// Boolean
    Bool,
}

impl DataType {
    /// Size of one element in bytes, as laid out by the emitted kernel.
    pub fn size_of(self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Half => 2,
            DataType::Int => 8,
            DataType::Bool => 1,
        }
    }

    /// Type name in the emitted kernel source.
    pub fn kernel_type(self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Half => "__half",
            DataType::Int => "int64_t",
            DataType::Bool => "bool",
        }
    }

    /// True for float-family types, which pick float arithmetic in codegen.
    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float | DataType::Half)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_type())
    }
}

/// Parallel mapping of an iteration domain.
///
/// Grid dimensions (`BIDx/y/z`) map a loop onto the block index, block
/// dimensions (`TIDx/y/z`) onto the thread index. `Unroll` requests loop
/// unrolling, `Serial` is an ordinary sequential loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParallelType {
    BIDz,
    BIDy,
    BIDx,
    TIDz,
    TIDy,
    TIDx,
    Unroll,
    Serial,
}

impl ParallelType {
    /// True for grid (block-index) dimensions.
    pub fn is_block_dim(self) -> bool {
        matches!(self, ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz)
    }

    /// True for block (thread-index) dimensions.
    pub fn is_thread_dim(self) -> bool {
        matches!(self, ParallelType::TIDx | ParallelType::TIDy | ParallelType::TIDz)
    }

    /// True for any device-parallel dimension (grid or block).
    pub fn is_thread(self) -> bool {
        self.is_block_dim() || self.is_thread_dim()
    }

    /// The index variable this dimension reads in the kernel
    /// (e.g. `threadIdx.x`), if it is device-parallel.
    pub fn index_name(self) -> Option<&'static str> {
        match self {
            ParallelType::BIDx => Some("blockIdx.x"),
            ParallelType::BIDy => Some("blockIdx.y"),
            ParallelType::BIDz => Some("blockIdx.z"),
            ParallelType::TIDx => Some("threadIdx.x"),
            ParallelType::TIDy => Some("threadIdx.y"),
            ParallelType::TIDz => Some("threadIdx.z"),
            ParallelType::Unroll | ParallelType::Serial => None,
        }
    }

    /// The extent variable of this dimension in the kernel
    /// (e.g. `blockDim.x`), if it is device-parallel.
    pub fn dim_name(self) -> Option<&'static str> {
        match self {
            ParallelType::BIDx => Some("gridDim.x"),
            ParallelType::BIDy => Some("gridDim.y"),
            ParallelType::BIDz => Some("gridDim.z"),
            ParallelType::TIDx => Some("blockDim.x"),
            ParallelType::TIDy => Some("blockDim.y"),
            ParallelType::TIDz => Some("blockDim.z"),
            ParallelType::Unroll | ParallelType::Serial => None,
        }
    }
}

impl fmt::Display for ParallelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParallelType::BIDz => "blockIdx.z",
            ParallelType::BIDy => "blockIdx.y",
            ParallelType::BIDx => "blockIdx.x",
            ParallelType::TIDz => "threadIdx.z",
            ParallelType::TIDy => "threadIdx.y",
            ParallelType::TIDx => "threadIdx.x",
            ParallelType::Unroll => "unroll",
            ParallelType::Serial => "serial",
        };
        f.write_str(s)
    }
}

/// Role of an iteration domain within its tensor domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterType {
    /// Ordinary iteration axis
    Iteration,
    /// Axis eliminated by a reduction
    Reduction,
    /// Broadcast axis backed by a real (size-1) allocation, so it has a
    /// stride slot in the tensor argument
    BroadcastWithStride,
    /// Broadcast axis with no backing storage; drops out of addressing
    BroadcastWithoutStride,
}

impl IterType {
    pub fn is_broadcast(self) -> bool {
        matches!(self, IterType::BroadcastWithStride | IterType::BroadcastWithoutStride)
    }
}

/// Memory class of a tensor surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Device-global memory, addressed through the tensor argument's strides
    Global,
    /// Block-shared scratchpad
    Shared,
    /// Per-thread registers / local memory
    Local,
}

/// Unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpKind {
    /// Plain copy; also used to initialize reduction accumulators
    Set,
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Reciprocal,
    Relu,
    Sigmoid,
    /// Element-type conversion; output dtype differs from input
    Cast,
    /// Philox-backed uniform random value shaped like the input
    RandLike,
}

/// Binary operator kinds. Comparison operators produce `Bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// `(a + b - 1) / b`; the extent of a split's outer output
    CeilDiv,
    Max,
    Min,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
}

impl BinaryOpKind {
    /// True when the result type is `Bool` regardless of operand types.
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            BinaryOpKind::Lt
                | BinaryOpKind::Gt
                | BinaryOpKind::Le
                | BinaryOpKind::Ge
                | BinaryOpKind::Eq
                | BinaryOpKind::Ne
                | BinaryOpKind::And
        )
    }

    /// Infix symbol in the emitted kernel source, if the op has one.
    pub fn kernel_symbol(self) -> Option<&'static str> {
        match self {
            BinaryOpKind::Add => Some("+"),
            BinaryOpKind::Sub => Some("-"),
            BinaryOpKind::Mul => Some("*"),
            BinaryOpKind::Div => Some("/"),
            BinaryOpKind::Mod => Some("%"),
            BinaryOpKind::Lt => Some("<"),
            BinaryOpKind::Gt => Some(">"),
            BinaryOpKind::Le => Some("<="),
            BinaryOpKind::Ge => Some(">="),
            BinaryOpKind::Eq => Some("=="),
            BinaryOpKind::Ne => Some("!="),
            BinaryOpKind::And => Some("&&"),
            BinaryOpKind::CeilDiv | BinaryOpKind::Max | BinaryOpKind::Min => None,
        }
    }
}

/// Ternary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOpKind {
    /// `cond ? a : b`
    Where,
    /// `min(max(x, lo), hi)`
    Clamp,
}

/// Slot of the per-fusion launch configuration stashed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchConfigType {
    BIDx,
    BIDy,
    BIDz,
    TIDx,
    TIDy,
    TIDz,
    SharedMemory,
}

impl LaunchConfigType {
    pub const ALL: [LaunchConfigType; 7] = [
        LaunchConfigType::BIDx,
        LaunchConfigType::BIDy,
        LaunchConfigType::BIDz,
        LaunchConfigType::TIDx,
        LaunchConfigType::TIDy,
        LaunchConfigType::TIDz,
        LaunchConfigType::SharedMemory,
    ];
}

/// Logical device a tensor lives on. The core compiles for one device at a
/// time; the id only participates in cache keys and argument validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}
