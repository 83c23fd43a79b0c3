//! Pre-Lowering Validation
//!
//! Parallel-mapping sanity over the scheduled fusion: a grid dimension tag
//! names one loop in the whole kernel, so every axis carrying it must be
//! the same loop under the loop map; axes sharing a block dimension tag may
//! be distinct loops but must agree on extent (one `blockDim` value serves
//! them all).

use crate::compute_at::ComputeAtMap;
use crate::ir::{Fusion, ValId};
use crate::lower::LoweringError;
use crate::types::ParallelType;

pub fn validate_parallel_use(fusion: &Fusion, ca_map: &ComputeAtMap) -> Result<(), LoweringError> {
    let mut by_tag: Vec<(ParallelType, ValId)> = Vec::new();
    for tv in fusion.vals().filter(|&v| fusion.val(v).is_tensor_view()) {
        for id in fusion.tv_current_domain(tv) {
            let parallel = fusion.iter_domain(id).parallel;
            if parallel.is_thread() {
                by_tag.push((parallel, id));
            }
        }
    }

    for (i, &(tag, id)) in by_tag.iter().enumerate() {
        for &(other_tag, other_id) in &by_tag[i + 1..] {
            if tag != other_tag || id == other_id {
                continue;
            }
            if tag.is_block_dim() {
                if !ca_map.are_mapped(id, other_id) {
                    return Err(LoweringError::IncompatibleParallel {
                        tag,
                        a: id,
                        b: other_id,
                    });
                }
            } else {
                // Block-dimension tags need matching extents.
                let ext_a = fusion.iter_domain(id).extent;
                let ext_b = fusion.iter_domain(other_id).extent;
                if !ca_map.are_mapped(id, other_id) && !fusion.same_as_vals(ext_a, ext_b) {
                    return Err(LoweringError::IncompatibleParallel {
                        tag,
                        a: id,
                        b: other_id,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_mismatched_tid_extents_rejected() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[64]);
        let one = fusion.new_float(1.0);
        let b = fusion.add(a, one);
        let two = fusion.new_float(2.0);
        let c = fusion.add(b, two);
        fusion.add_input(a);
        fusion.add_output(c);

        // Unrelated extents both tagged TIDx.
        fusion.split(b, 0, 8).expect("split");
        fusion.split(c, 0, 16).expect("split");
        fusion.parallelize(b, 1, ParallelType::TIDx).expect("parallelize");
        fusion.parallelize(c, 1, ParallelType::TIDx).expect("parallelize");

        let ca_map = ComputeAtMap::build(&fusion);
        assert!(matches!(
            validate_parallel_use(&fusion, &ca_map),
            Err(LoweringError::IncompatibleParallel { .. })
        ));
    }

    #[test]
    fn test_shared_schedule_passes() {
        let mut fusion = Fusion::new();
        let a = fusion.new_contiguous_tensor(DataType::Float, &[64]);
        let one = fusion.new_float(1.0);
        let b = fusion.add(a, one);
        fusion.add_input(a);
        fusion.add_output(b);
        fusion.split(b, 0, 16).expect("split");
        fusion.parallelize(b, 0, ParallelType::BIDx).expect("parallelize");
        fusion.parallelize(b, 1, ParallelType::TIDx).expect("parallelize");

        let ca_map = ComputeAtMap::build(&fusion);
        validate_parallel_use(&fusion, &ca_map).expect("consistent schedule");
    }
}
