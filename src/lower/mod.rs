//! Lowering
//!
//! Turns a scheduled fusion into a kernel-IR statement tree: validate the
//! parallel mapping, sort expressions by their computeAt loop structure,
//! generate the loop nests with allocations and address-computed operands,
//! then insert the shared-memory barriers.

pub mod kernel_ir;
mod loops;
mod sync;
mod validate;

pub use kernel_ir::{ForLoop, Kernel, KirExpr, KirVal};
pub use loops::generate_loop_nests;
pub use sync::{insert_raw_syncs, insert_war_syncs};
pub use validate::validate_parallel_use;

use thiserror::Error;
use tracing::debug;

use crate::compute_at::ComputeAtMap;
use crate::ir::{Fusion, ValId};
use crate::sort::sort_exprs;
use crate::types::ParallelType;

/// Errors raised during lowering and indexing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    /// An axis on the backward index walk has no recorded index; the
    /// producer's replay did not match the consumer.
    #[error("missing index for axis {axis} of tensor {tensor} during backward index propagation")]
    MissingIndex { tensor: ValId, axis: ValId },

    /// Two axes share a parallel tag they cannot share
    #[error("incompatible use of parallel dimension {tag}: axes {a} and {b}")]
    IncompatibleParallel { tag: ParallelType, a: ValId, b: ValId },
}

/// Lower a scheduled fusion to kernel IR.
pub fn lower_fusion(fusion: &mut Fusion) -> Result<Kernel, LoweringError> {
    let ca_map = ComputeAtMap::build(fusion);
    validate_parallel_use(fusion, &ca_map)?;

    let sorted = sort_exprs(fusion, &ca_map);
    debug!(exprs = sorted.len(), "lowering sorted expressions");

    let mut top_level = generate_loop_nests(fusion, &ca_map, &sorted)?;
    insert_raw_syncs(fusion, &mut top_level);
    insert_war_syncs(fusion, &mut top_level);

    Ok(Kernel {
        top_level,
        has_rng: fusion.has_rng(),
        has_grid_reduction: fusion.has_grid_reduction(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_at::compute_at;
    use crate::types::{DataType, MemoryType};

    #[test]
    fn test_lower_pointwise_produces_loops_and_statement() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[64]);
        let one = fusion.new_float(1.0);
        let b = fusion.add(a, one);
        fusion.tv_set_memory(b, MemoryType::Global);
        fusion.add_input(a);
        fusion.add_output(b);

        let kernel = lower_fusion(&mut fusion).expect("lowering succeeds");
        assert_eq!(kernel.top_level.len(), 1);
        let KirExpr::ForLoop(fl) = &kernel.top_level[0] else {
            panic!("expected an outer loop");
        };
        assert_eq!(fl.body.len(), 1);
        assert!(fl.body[0].is_tensor_op());
        assert!(!kernel.has_rng);
        assert!(!kernel.has_grid_reduction);
    }

    #[test]
    fn test_lower_inline_chain_shares_loop() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[64]);
        let one = fusion.new_float(1.0);
        let b = fusion.add(a, one);
        let two = fusion.new_float(2.0);
        let c = fusion.mul(b, two);
        fusion.tv_set_memory(c, MemoryType::Global);
        fusion.add_input(a);
        fusion.add_output(c);
        compute_at(&mut fusion, b, c, 1).expect("computeAt");

        let kernel = lower_fusion(&mut fusion).expect("lowering succeeds");
        // One fused loop holding the local allocation and both statements.
        assert_eq!(kernel.top_level.len(), 1);
        let KirExpr::ForLoop(fl) = &kernel.top_level[0] else {
            panic!("expected an outer loop");
        };
        let allocs = fl
            .body
            .iter()
            .filter(|s| matches!(s, KirExpr::Allocate { .. }))
            .count();
        let ops = fl.body.iter().filter(|s| s.is_tensor_op()).count();
        assert_eq!(allocs, 1);
        assert_eq!(ops, 2);
    }

    #[test]
    fn test_lower_serial_reduction_emits_init() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[4, 8]);
        let s = fusion.sum(a, &[1]);
        fusion.tv_set_memory(s, MemoryType::Global);
        fusion.add_input(a);
        fusion.add_output(s);

        let kernel = lower_fusion(&mut fusion).expect("lowering succeeds");
        // An init nest over the kept axis precedes the accumulation nest.
        fn contains_init(body: &[KirExpr]) -> bool {
            body.iter().any(|s| match s {
                KirExpr::Unary { op: crate::types::UnaryOpKind::Set, .. } => true,
                KirExpr::ForLoop(fl) => contains_init(&fl.body),
                _ => false,
            })
        }
        fn contains_reduction(body: &[KirExpr]) -> bool {
            body.iter().any(|s| match s {
                KirExpr::Reduction { .. } => true,
                KirExpr::ForLoop(fl) => contains_reduction(&fl.body),
                KirExpr::IfThenElse { then_body, .. } => contains_reduction(then_body),
                _ => false,
            })
        }
        assert!(contains_init(&kernel.top_level), "accumulator is initialized");
        assert!(contains_reduction(&kernel.top_level), "reduction update emitted");
        let init_pos = kernel.top_level.iter().position(|s| {
            matches!(s, KirExpr::ForLoop(fl) if contains_init(&fl.body))
                || matches!(s, KirExpr::Unary { op: crate::types::UnaryOpKind::Set, .. })
        });
        let red_pos = kernel
            .top_level
            .iter()
            .position(|s| matches!(s, KirExpr::ForLoop(fl) if contains_reduction(&fl.body)));
        assert!(init_pos.expect("init present") <= red_pos.expect("reduction present"));
    }

    #[test]
    fn test_lower_split_adds_tail_predicate() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[100]);
        let one = fusion.new_float(1.0);
        let b = fusion.add(a, one);
        fusion.tv_set_memory(b, MemoryType::Global);
        fusion.add_input(a);
        fusion.add_output(b);
        fusion.split(b, 0, 32).expect("split");

        let kernel = lower_fusion(&mut fusion).expect("lowering succeeds");
        fn find_guard(body: &[KirExpr]) -> bool {
            body.iter().any(|s| match s {
                KirExpr::IfThenElse { .. } => true,
                KirExpr::ForLoop(fl) => find_guard(&fl.body),
                _ => false,
            })
        }
        assert!(find_guard(&kernel.top_level), "split tail must be guarded");
    }
}
