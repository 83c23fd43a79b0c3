//! Kernel Source Emission
//!
//! Prints a lowered kernel as a single CUDA-dialect translation unit: the
//! `Tensor<T, N>` argument struct, reduction/broadcast helper templates and
//! the Philox snippet, followed by one `__global__` entry function named
//! `kernel` inside the codegen namespace. Scalar expressions print by
//! recursing through their defining expressions; tensor slots print as the
//! base tensor indexed by the sum of their strided sub-expressions.

use std::fmt::Write as _;

use crate::ir::{ExprKind, Fusion, ScalarConst, ValId, ValKind};
use crate::lower::{ForLoop, Kernel, KirExpr, KirVal};
use crate::types::{BinaryOpKind, DataType, MemoryType, ParallelType, TernaryOpKind, UnaryOpKind};

const CG_NAMESPACE: &str = "FusorCodeGen";
const KERNEL_NAME: &str = "kernel";

/// Fully qualified name of the emitted entry function.
pub fn kernel_entry_name() -> String {
    format!("{CG_NAMESPACE}::{KERNEL_NAME}")
}

/// Emit the complete kernel translation unit.
pub fn generate_kernel_source(fusion: &Fusion, kernel: &Kernel) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "namespace {CG_NAMESPACE} {{");
    out.push_str(RESOURCE_TENSOR_STRUCT);
    out.push_str(RESOURCE_HELPERS);
    if kernel.has_rng {
        out.push_str(RESOURCE_RANDOM);
    }
    out.push_str(RESOURCE_BLOCK_REDUCTION);
    if kernel.has_grid_reduction {
        out.push_str(RESOURCE_GRID_REDUCTION);
    }
    out.push_str(RESOURCE_BLOCK_BROADCAST);

    emit_signature(fusion, kernel, &mut out);
    for stmt in &kernel.top_level {
        emit_stmt(fusion, stmt, 1, &mut out);
    }
    out.push_str("}\n");
    let _ = writeln!(out, "}} // namespace {CG_NAMESPACE}");
    out
}

// ----------------------------------------------------------------------
// Signature
// ----------------------------------------------------------------------

fn tensor_param(fusion: &Fusion, tv: ValId) -> String {
    let rank = fusion
        .no_reductions(&fusion.tv_maybe_rfactor(tv))
        .iter()
        .filter(|&&id| {
            fusion.iter_domain(id).iter_type != crate::types::IterType::BroadcastWithoutStride
        })
        .count()
        .max(1);
    format!(
        "Tensor<{}, {}> T{}",
        fusion.val(tv).dtype().kernel_type(),
        rank,
        fusion.val(tv).name()
    )
}

fn emit_signature(fusion: &Fusion, kernel: &Kernel, out: &mut String) {
    let mut params: Vec<String> = Vec::new();
    for &input in fusion.inputs() {
        if fusion.val(input).is_tensor_view() {
            params.push(tensor_param(fusion, input));
        }
    }
    for &output in fusion.outputs() {
        params.push(tensor_param(fusion, output));
    }
    for &input in fusion.inputs() {
        if !fusion.val(input).is_tensor_view() {
            let val = fusion.val(input);
            params.push(format!("{} s{}", val.dtype().kernel_type(), val.name()));
        }
    }
    if kernel.has_rng {
        params.push("uint64_t philox_seed".to_string());
        params.push("uint64_t philox_offset".to_string());
    }
    if kernel.has_grid_reduction {
        params.push("float* work_buf".to_string());
        params.push("unsigned* sync_flags".to_string());
    }
    let _ = writeln!(out, "__global__ void {KERNEL_NAME}({}) {{", params.join(", "));
    if kernel.has_rng {
        out.push_str(
            "  Philox rnd(philox_seed, blockIdx.x * blockDim.x + threadIdx.x, philox_offset);\n",
        );
    }
}

// ----------------------------------------------------------------------
// Statements
// ----------------------------------------------------------------------

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn emit_stmt(fusion: &Fusion, stmt: &KirExpr, level: usize, out: &mut String) {
    match stmt {
        KirExpr::ForLoop(fl) => emit_for_loop(fusion, fl, level, out),
        KirExpr::IfThenElse { cond, then_body, else_body } => {
            indent(out, level);
            let _ = writeln!(out, "if ({}) {{", print_val(fusion, *cond));
            for s in then_body {
                emit_stmt(fusion, s, level + 1, out);
            }
            if else_body.is_empty() {
                indent(out, level);
                out.push_str("}\n");
            } else {
                indent(out, level);
                out.push_str("} else {\n");
                for s in else_body {
                    emit_stmt(fusion, s, level + 1, out);
                }
                indent(out, level);
                out.push_str("}\n");
            }
        }
        KirExpr::Allocate { tv, memory, size } => {
            indent(out, level);
            let dtype = fusion.val(*tv).dtype().kernel_type();
            let name = fusion.val(*tv).name();
            match memory {
                MemoryType::Shared => {
                    let _ = writeln!(out, "__shared__ {dtype} T{name}[{}];", print_val(fusion, *size));
                }
                _ => {
                    let _ = writeln!(out, "{dtype} T{name}[{}];", print_val(fusion, *size));
                }
            }
        }
        KirExpr::Sync { .. } => {
            indent(out, level);
            out.push_str("__syncthreads();\n");
        }
        KirExpr::Unary { op, out: dst, input } => {
            indent(out, level);
            let _ = writeln!(
                out,
                "{} = {};",
                print_kir_val(fusion, *dst),
                print_unary(fusion, *op, *input, fusion_dtype(fusion, *dst))
            );
        }
        KirExpr::Binary { op, out: dst, lhs, rhs } => {
            indent(out, level);
            let _ = writeln!(
                out,
                "{} = {};",
                print_kir_val(fusion, *dst),
                print_binary_value(fusion, *op, *lhs, *rhs, fusion_dtype(fusion, *dst))
            );
        }
        KirExpr::Ternary { op, out: dst, a, b, c } => {
            indent(out, level);
            let expr = match op {
                TernaryOpKind::Where => format!(
                    "{} ? {} : {}",
                    print_kir_val(fusion, *a),
                    print_kir_val(fusion, *b),
                    print_kir_val(fusion, *c)
                ),
                TernaryOpKind::Clamp => format!(
                    "fminf(fmaxf({}, {}), {})",
                    print_kir_val(fusion, *a),
                    print_kir_val(fusion, *b),
                    print_kir_val(fusion, *c)
                ),
            };
            let _ = writeln!(out, "{} = {};", print_kir_val(fusion, *dst), expr);
        }
        KirExpr::Reduction { op, out: dst, input, init, pred } => {
            emit_reduction(fusion, *op, *dst, *input, *init, *pred, level, out);
        }
        KirExpr::Broadcast { out: dst, input } => {
            indent(out, level);
            let needs_block_broadcast = input
                .tensor_view(fusion)
                .is_some_and(|tv| has_thread_reduction(fusion, tv));
            if needs_block_broadcast {
                let _ = writeln!(
                    out,
                    "blockBroadcast({}, {});",
                    print_kir_val(fusion, *dst),
                    print_kir_val(fusion, *input)
                );
            } else {
                let _ = writeln!(
                    out,
                    "{} = {};",
                    print_kir_val(fusion, *dst),
                    print_kir_val(fusion, *input)
                );
            }
        }
    }
}

fn emit_for_loop(fusion: &Fusion, fl: &ForLoop, level: usize, out: &mut String) {
    let parallel = fusion.iter_domain(fl.iter_domain).parallel;
    if parallel.is_thread() {
        // Device-parallel loops are implicit; the body reads the named
        // parallel index directly.
        for s in &fl.body {
            emit_stmt(fusion, s, level, out);
        }
        return;
    }
    if parallel == ParallelType::Unroll {
        indent(out, level);
        out.push_str("#pragma unroll\n");
    }
    let idx = print_val(fusion, fl.index);
    let extent = print_val(fusion, fusion.iter_domain(fl.iter_domain).extent);
    indent(out, level);
    let _ = writeln!(out, "for (int64_t {idx} = 0; {idx} < {extent}; ++{idx}) {{");
    for s in &fl.body {
        emit_stmt(fusion, s, level + 1, out);
    }
    indent(out, level);
    out.push_str("}\n");
}

fn emit_reduction(
    fusion: &Fusion,
    op: BinaryOpKind,
    dst: KirVal,
    input: KirVal,
    init: ValId,
    pred: Option<ValId>,
    level: usize,
    out: &mut String,
) {
    let out_tv = dst.tensor_view(fusion);
    let (block_dims, grid_dims) = out_tv.map_or(([false; 3], [false; 3]), |tv| {
        parallel_reduction_dims(fusion, tv)
    });
    let dtype = fusion_dtype(fusion, dst);
    let op_fn = reduction_functor(op, dtype);

    indent(out, level);
    if grid_dims.iter().any(|&b| b) {
        let _ = writeln!(
            out,
            "gridReduce<{}, {}, {}, {}, {}, {}>({}, {}, {}, work_buf, sync_flags, {}, {});",
            grid_dims[0],
            grid_dims[1],
            grid_dims[2],
            !block_dims[0],
            !block_dims[1],
            !block_dims[2],
            print_kir_val(fusion, dst),
            print_kir_val(fusion, input),
            op_fn,
            print_val(fusion, init),
            pred.map_or_else(|| "true".to_string(), |p| print_val(fusion, p)),
        );
    } else if block_dims.iter().any(|&b| b) {
        let _ = writeln!(
            out,
            "blockReduce<{}, {}, {}>({}, {}, {}, {}, {});",
            block_dims[0],
            block_dims[1],
            block_dims[2],
            print_kir_val(fusion, dst),
            print_kir_val(fusion, input),
            op_fn,
            print_val(fusion, init),
            pred.map_or_else(|| "true".to_string(), |p| print_val(fusion, p)),
        );
    } else {
        let lhs = print_kir_val(fusion, dst);
        let rhs = print_kir_val(fusion, input);
        let folded = fold_expression(op, &lhs, &rhs, dtype);
        let _ = writeln!(out, "{lhs} = {folded};");
    }
}

/// Which TID/BID dimensions participate in this tensor's reduction axes.
fn parallel_reduction_dims(fusion: &Fusion, tv: ValId) -> ([bool; 3], [bool; 3]) {
    let mut block = [false; 3];
    let mut grid = [false; 3];
    for id in fusion.tv_current_domain(tv) {
        let dom = fusion.iter_domain(id);
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
    (block, grid)
}

fn has_thread_reduction(fusion: &Fusion, tv: ValId) -> bool {
    let (block, grid) = parallel_reduction_dims(fusion, tv);
    block.iter().any(|&b| b) || grid.iter().any(|&b| b)
}

// ----------------------------------------------------------------------
// Values
// ----------------------------------------------------------------------

fn fusion_dtype(fusion: &Fusion, v: KirVal) -> DataType {
    fusion.val(v.val()).dtype()
}

fn print_kir_val(fusion: &Fusion, v: KirVal) -> String {
    match v {
        KirVal::Scalar(s) => print_val(fusion, s),
        KirVal::TensorSlot(ti) => match fusion.val(ti).kind() {
            ValKind::TensorIndex(index) => {
                let name = fusion.val(index.view).name();
                let terms: Vec<String> =
                    index.indices.iter().map(|&i| print_val(fusion, i)).collect();
                let sum = if terms.is_empty() { "0".to_string() } else { terms.join(" + ") };
                format!("T{name}[{sum}]")
            }
            _ => print_val(fusion, ti),
        },
    }
}

/// Print a scalar value, recursing through its defining expression.
pub fn print_val(fusion: &Fusion, val: ValId) -> String {
    match fusion.val(val).kind() {
        ValKind::Scalar { value: Some(c) } => match c {
            ScalarConst::Int(v) => format!("{v}"),
            ScalarConst::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    format!("{v:.1}f")
                } else if v.is_finite() {
                    format!("{v}f")
                } else if *v == f64::NEG_INFINITY {
                    "-INFINITY".to_string()
                } else {
                    "INFINITY".to_string()
                }
            }
            ScalarConst::Bool(v) => format!("{v}"),
        },
        ValKind::NamedScalar { name } => name.clone(),
        ValKind::Scalar { value: None } => match fusion.val(val).definition() {
            Some(def) => print_scalar_expr(fusion, def),
            None => {
                // Free symbolic scalars: loop indices and kernel parameters.
                if fusion.is_input(val) {
                    format!("s{}", fusion.val(val).name())
                } else {
                    format!("i{}", fusion.val(val).name())
                }
            }
        },
        _ => format!("v{}", fusion.val(val).name()),
    }
}

fn print_scalar_expr(fusion: &Fusion, expr: crate::ir::ExprId) -> String {
    let e = fusion.expr(expr);
    match e.kind() {
        ExprKind::Unary { op } => {
            let input = print_val(fusion, e.inputs()[0]);
            let dtype = fusion.val(e.output()).dtype();
            print_unary_str(*op, &input, dtype)
        }
        ExprKind::Binary { op } => {
            let lhs = print_val(fusion, e.inputs()[0]);
            let rhs = print_val(fusion, e.inputs()[1]);
            let dtype = fusion.val(e.output()).dtype();
            fold_expression(*op, &lhs, &rhs, dtype)
        }
        ExprKind::Ternary { op } => {
            let a = print_val(fusion, e.inputs()[0]);
            let b = print_val(fusion, e.inputs()[1]);
            let c = print_val(fusion, e.inputs()[2]);
            match op {
                TernaryOpKind::Where => format!("({a} ? {b} : {c})"),
                TernaryOpKind::Clamp => format!("fminf(fmaxf({a}, {b}), {c})"),
            }
        }
        _ => format!("i{}", fusion.val(e.output()).name()),
    }
}

fn print_unary(fusion: &Fusion, op: UnaryOpKind, input: KirVal, dtype: DataType) -> String {
    let operand = print_kir_val(fusion, input);
    print_unary_str(op, &operand, dtype)
}

fn print_unary_str(op: UnaryOpKind, operand: &str, dtype: DataType) -> String {
    match op {
        UnaryOpKind::Set => operand.to_string(),
        UnaryOpKind::Neg => format!("(-{operand})"),
        UnaryOpKind::Abs => {
            if dtype == DataType::Int {
                format!("llabs({operand})")
            } else {
                format!("fabsf({operand})")
            }
        }
        UnaryOpKind::Exp => format!("expf({operand})"),
        UnaryOpKind::Log => format!("logf({operand})"),
        UnaryOpKind::Sqrt => format!("sqrtf({operand})"),
        UnaryOpKind::Reciprocal => format!("(1.0f / {operand})"),
        UnaryOpKind::Relu => format!("fmaxf({operand}, 0.0f)"),
        UnaryOpKind::Sigmoid => format!("(1.0f / (1.0f + expf(-{operand})))"),
        UnaryOpKind::Cast => format!("static_cast<{}>({operand})", dtype.kernel_type()),
        UnaryOpKind::RandLike => "uniformf((unsigned int)rnd())".to_string(),
    }
}

fn print_binary_value(
    fusion: &Fusion,
    op: BinaryOpKind,
    lhs: KirVal,
    rhs: KirVal,
    dtype: DataType,
) -> String {
    let l = print_kir_val(fusion, lhs);
    let r = print_kir_val(fusion, rhs);
    fold_expression(op, &l, &r, dtype)
}

fn fold_expression(op: BinaryOpKind, lhs: &str, rhs: &str, dtype: DataType) -> String {
    if let Some(symbol) = op.kernel_symbol() {
        return format!("({lhs} {symbol} {rhs})");
    }
    match op {
        BinaryOpKind::CeilDiv => format!("ceilDiv({lhs}, {rhs})"),
        BinaryOpKind::Max => {
            if dtype == DataType::Int {
                format!("max({lhs}, {rhs})")
            } else {
                format!("fmaxf({lhs}, {rhs})")
            }
        }
        BinaryOpKind::Min => {
            if dtype == DataType::Int {
                format!("min({lhs}, {rhs})")
            } else {
                format!("fminf({lhs}, {rhs})")
            }
        }
        _ => format!("({lhs} /* {op:?} */ {rhs})"),
    }
}

fn reduction_functor(op: BinaryOpKind, dtype: DataType) -> &'static str {
    match (op, dtype == DataType::Int) {
        (BinaryOpKind::Add, _) => "[](auto a, auto b) { return a + b; }",
        (BinaryOpKind::Mul, _) => "[](auto a, auto b) { return a * b; }",
        (BinaryOpKind::Max, false) => "[](auto a, auto b) { return fmaxf(a, b); }",
        (BinaryOpKind::Max, true) => "[](auto a, auto b) { return max(a, b); }",
        (BinaryOpKind::Min, false) => "[](auto a, auto b) { return fminf(a, b); }",
        (BinaryOpKind::Min, true) => "[](auto a, auto b) { return min(a, b); }",
        _ => "[](auto a, auto b) { return a + b; }",
    }
}

// ----------------------------------------------------------------------
// Resource strings
// ----------------------------------------------------------------------

const RESOURCE_TENSOR_STRUCT: &str = r"
typedef long long int int64_t;
typedef unsigned long long int uint64_t;

template <typename T, int N>
struct Tensor {
  __device__ T& operator[](int64_t ind) {
    return data[ind];
  }
  T* data;
  int64_t size[N];
  int64_t stride[N];
};
";

const RESOURCE_HELPERS: &str = r"
__device__ constexpr int64_t ceilDiv(int64_t a, int64_t b) {
  return (a + b - 1) / b;
}
__device__ constexpr int64_t alignBufferSize(int64_t buffer, int64_t size) {
  return (buffer + (size - 1)) & ~(size - 1);
}
";

const RESOURCE_RANDOM: &str = r"
class Philox {
 public:
  __device__ Philox(uint64_t seed, uint64_t subsequence, uint64_t offset) {
    key.x = (unsigned int)seed;
    key.y = (unsigned int)(seed >> 32);
    counter = make_uint4(0, 0, 0, 0);
    counter.z = (unsigned int)(subsequence);
    counter.w = (unsigned int)(subsequence >> 32);
    STATE = 0;
    incr_n(offset / 4);
  }
  __device__ unsigned long operator()() {
    if (STATE == 0) {
      uint4 counter_ = counter;
      uint2 key_ = key;
      for (int i = 0; i < 9; i++) {
        counter_ = single_round(counter_, key_);
        key_.x += (kPhilox10A);
        key_.y += (kPhilox10B);
      }
      output = single_round(counter_, key_);
      incr();
    }
    unsigned long ret = 0;
    switch (STATE) {
      case 0: ret = output.x; break;
      case 1: ret = output.y; break;
      case 2: ret = output.z; break;
      case 3: ret = output.w; break;
    }
    STATE = (STATE + 1) % 4;
    return ret;
  }
 private:
  __device__ void incr_n(uint64_t n) {
    unsigned int nlo = (unsigned int)(n);
    unsigned int nhi = (unsigned int)(n >> 32);
    counter.x += nlo;
    if (counter.x < nlo) nhi++;
    counter.y += nhi;
    if (nhi <= counter.y) return;
    if (++counter.z) return;
    ++counter.w;
  }
  __device__ void incr() {
    if (++counter.x) return;
    if (++counter.y) return;
    if (++counter.z) return;
    ++counter.w;
  }
  __device__ unsigned int mulhilo32(unsigned int a, unsigned int b, unsigned int* result_high) {
    *result_high = __umulhi(a, b);
    return a * b;
  }
  __device__ uint4 single_round(uint4 ctr, uint2 key) {
    unsigned int hi0;
    unsigned int hi1;
    unsigned int lo0 = mulhilo32(kPhiloxSA, ctr.x, &hi0);
    unsigned int lo1 = mulhilo32(kPhiloxSB, ctr.z, &hi1);
    uint4 ret = {hi1 ^ ctr.y ^ key.x, lo1, hi0 ^ ctr.w ^ key.y, lo0};
    return ret;
  }
  static constexpr unsigned long kPhilox10A = 0x9E3779B9;
  static constexpr unsigned long kPhilox10B = 0xBB67AE85;
  static constexpr unsigned long kPhiloxSA = 0xD2511F53;
  static constexpr unsigned long kPhiloxSB = 0xCD9E8D57;
  uint4 counter;
  uint4 output;
  uint2 key;
  unsigned int STATE;
};

__device__ float uniformf(unsigned int x) {
  constexpr float kRanInvM32 = 2.3283064e-10f;
  return x * kRanInvM32;
}
";

const RESOURCE_BLOCK_REDUCTION: &str = r"
// Reduce across the marked thread dimensions of a block. Participating
// threads stage values through shared scratch; the result lands on the
// reduction segment's first thread and is re-read by all participants.
template <bool X_REDUCE, bool Y_REDUCE, bool Z_REDUCE, typename T, typename Func>
__device__ void blockReduce(T& out, const T& inp_val, Func reduction_op, T init_val, bool read_write_pred) {
  extern __shared__ char shared_mem[];
  T* shared_buf = reinterpret_cast<T*>(shared_mem);

  unsigned int reduction_size = (X_REDUCE ? blockDim.x : 1) *
      (Y_REDUCE ? blockDim.y : 1) * (Z_REDUCE ? blockDim.z : 1);
  unsigned int reduction_tid =
      (Z_REDUCE ? threadIdx.z : 0) * (Y_REDUCE ? blockDim.y : 1) * (X_REDUCE ? blockDim.x : 1) +
      (Y_REDUCE ? threadIdx.y : 0) * (X_REDUCE ? blockDim.x : 1) +
      (X_REDUCE ? threadIdx.x : 0);
  unsigned int reduction_idx =
      (!Z_REDUCE ? threadIdx.z : 0) * (!Y_REDUCE ? blockDim.y : 1) * (!X_REDUCE ? blockDim.x : 1) +
      (!Y_REDUCE ? threadIdx.y : 0) * (!X_REDUCE ? blockDim.x : 1) +
      (!X_REDUCE ? threadIdx.x : 0);

  unsigned int smem_offset = reduction_idx * reduction_size;
  if (read_write_pred) {
    shared_buf[smem_offset + reduction_tid] = inp_val;
  } else {
    shared_buf[smem_offset + reduction_tid] = init_val;
  }
  __syncthreads();

  for (unsigned int stride = reduction_size / 2; stride > 0; stride >>= 1) {
    if (reduction_tid < stride) {
      shared_buf[smem_offset + reduction_tid] = reduction_op(
          shared_buf[smem_offset + reduction_tid],
          shared_buf[smem_offset + reduction_tid + stride]);
    }
    __syncthreads();
  }
  if (read_write_pred) {
    out = reduction_op(out, shared_buf[smem_offset]);
  }
  __syncthreads();
}
";

const RESOURCE_GRID_REDUCTION: &str = r"
// Two-stage cross-block reduction: each block reduces locally, writes its
// partial to the work buffer, and atomically bumps the segment's sync flag.
// The last block to arrive reduces the partials and publishes the result.
template <bool X_BLOCK, bool Y_BLOCK, bool Z_BLOCK,
          bool X_THREAD, bool Y_THREAD, bool Z_THREAD, typename T, typename Func>
__device__ void gridReduce(T& out, T inp_val, Func reduction_op,
                           volatile T* work_buf, unsigned* sync_flags,
                           T init_val, bool read_write_pred) {
  blockReduce<X_THREAD, Y_THREAD, Z_THREAD>(inp_val, inp_val, reduction_op, init_val, read_write_pred);

  unsigned int seg_size = (X_BLOCK ? gridDim.x : 1) *
      (Y_BLOCK ? gridDim.y : 1) * (Z_BLOCK ? gridDim.z : 1);
  unsigned int seg_idx =
      (!Z_BLOCK ? blockIdx.z : 0) * (!Y_BLOCK ? gridDim.y : 1) * (!X_BLOCK ? gridDim.x : 1) +
      (!Y_BLOCK ? blockIdx.y : 0) * (!X_BLOCK ? gridDim.x : 1) +
      (!X_BLOCK ? blockIdx.x : 0);
  unsigned int blk_in_seg =
      (Z_BLOCK ? blockIdx.z : 0) * (Y_BLOCK ? gridDim.y : 1) * (X_BLOCK ? gridDim.x : 1) +
      (Y_BLOCK ? blockIdx.y : 0) * (X_BLOCK ? gridDim.x : 1) +
      (X_BLOCK ? blockIdx.x : 0);

  bool is_block_leader = threadIdx.x == 0 && threadIdx.y == 0 && threadIdx.z == 0;
  if (is_block_leader) {
    work_buf[seg_idx * seg_size + blk_in_seg] = inp_val;
    __threadfence();
    unsigned int arrived = atomicAdd(&sync_flags[seg_idx], 1u);
    if (arrived == seg_size - 1) {
      T acc = init_val;
      for (unsigned int i = 0; i < seg_size; i++) {
        acc = reduction_op(acc, work_buf[seg_idx * seg_size + i]);
      }
      if (read_write_pred) {
        out = reduction_op(out, acc);
      }
      sync_flags[seg_idx] = 0;
    }
  }
}
";

const RESOURCE_BLOCK_BROADCAST: &str = r"
// Publish a value computed by a reduction segment's first thread to every
// thread of the block.
template <typename T>
__device__ void blockBroadcast(T& out, const T& inp_val) {
  extern __shared__ char shared_mem[];
  T* shared_buf = reinterpret_cast<T*>(shared_mem);
  bool is_leader = threadIdx.x == 0 && threadIdx.y == 0 && threadIdx.z == 0;
  if (is_leader) {
    shared_buf[0] = inp_val;
  }
  __syncthreads();
  out = shared_buf[0];
}
";
