//! Inputs Requirement
//!
//! The kernel-shape cache key: device, the stride-order permutations, and
//! per-input `(rank, per-axis (is_size_1, stride_index, contiguity))`
//! observations. Two requirements comply when all of those agree — concrete
//! sizes may differ, which is exactly what lets two runs with different
//! extents share one compiled kernel.
//!
//! The input permutation sorts dimensions by observed stride order
//! (slowest to fastest) so a permuted-layout tensor compiles as if it were
//! row-major; the output permutation is its inverse, adjusted for axes a
//! reduction eliminated.

use crate::exec::args::{ArgValue, TensorArg};
use crate::exec::ExecError;
use crate::graph::{GraphDef, GraphValue};
use crate::types::DeviceId;

/// Per-axis observation of one tensor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisRequirement {
    pub is_size_one: bool,
    pub stride_index: Option<usize>,
    pub contiguous: Option<bool>,
}

/// Per-input observation; `None` for scalar arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRequirement {
    pub rank: usize,
    pub axes: Vec<AxisRequirement>,
}

/// The kernel-shape cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputsRequirement {
    pub device: DeviceId,
    pub input_permutation: Vec<usize>,
    pub output_permutation: Vec<usize>,
    pub per_input: Vec<Option<TensorRequirement>>,
}

impl InputsRequirement {
    /// Build from runtime arguments.
    pub fn from_args(inputs: &[ArgValue], reduction_axes: &[usize]) -> Result<Self, ExecError> {
        let mut per_input: Vec<Option<TensorRequirement>> = Vec::with_capacity(inputs.len());
        let mut device: Option<DeviceId> = None;
        let mut acc_props: Option<Vec<Option<usize>>> = None;

        for input in inputs {
            match input {
                ArgValue::Tensor(tensor) => {
                    per_input.push(Some(tensor_requirement(tensor)));
                    match device {
                        None => device = Some(tensor.device),
                        Some(d) if d == tensor.device => {}
                        Some(d) => {
                            return Err(ExecError::InvalidArguments {
                                reason: format!(
                                    "requires a fixed device for all inputs: {d} vs {}",
                                    tensor.device
                                ),
                            })
                        }
                    }
                    merge_stride_slots(&mut acc_props, &stride_slots_of_arg(tensor));
                }
                _ => per_input.push(None),
            }
        }

        let device = device.ok_or_else(|| ExecError::InvalidArguments {
            reason: "could not detect device: no tensor inputs".to_string(),
        })?;
        let input_permutation = permutation_per_sorted_stride(acc_props.unwrap_or_default());
        let output_permutation = reverse_permutation(&input_permutation, reduction_axes);
        Ok(InputsRequirement { device, input_permutation, output_permutation, per_input })
    }

    /// Build from the graph's annotated input types.
    pub fn from_graph(graph: &GraphDef, reduction_axes: &[usize]) -> Result<Self, ExecError> {
        let mut per_input: Vec<Option<TensorRequirement>> = Vec::with_capacity(graph.inputs.len());
        let mut device: Option<DeviceId> = None;
        let mut acc_props: Option<Vec<Option<usize>>> = None;

        for &idx in &graph.inputs {
            match &graph.values[idx] {
                GraphValue::Tensor(t) => {
                    per_input.push(Some(TensorRequirement {
                        rank: t.rank(),
                        axes: t
                            .sizes
                            .iter()
                            .zip(t.stride_properties.iter())
                            .map(|(&size, prop)| AxisRequirement {
                                is_size_one: size == Some(1),
                                stride_index: prop.stride_index,
                                contiguous: prop.contiguous,
                            })
                            .collect(),
                    }));
                    device.get_or_insert(t.device);
                    let slots: Vec<Option<usize>> =
                        t.stride_properties.iter().map(|p| p.stride_index).collect();
                    merge_stride_slots(&mut acc_props, &slots);
                }
                GraphValue::Scalar { .. } => per_input.push(None),
            }
        }

        let device = device.ok_or_else(|| ExecError::InvalidArguments {
            reason: "graph has no tensor inputs".to_string(),
        })?;
        let input_permutation = permutation_per_sorted_stride(acc_props.unwrap_or_default());
        let output_permutation = reverse_permutation(&input_permutation, reduction_axes);
        Ok(InputsRequirement { device, input_permutation, output_permutation, per_input })
    }

    /// Do the inputs need layout normalization before dispatch?
    pub fn requires_permutation(&self) -> bool {
        self.input_permutation.iter().enumerate().any(|(i, &p)| i != p)
    }

    /// Compliance: same device, same permutations, and agreeing per-input
    /// observations. Concrete sizes do not participate.
    pub fn comply_with(&self, expect: &InputsRequirement) -> bool {
        if self.device != expect.device
            || self.input_permutation != expect.input_permutation
            || self.output_permutation != expect.output_permutation
            || self.per_input.len() != expect.per_input.len()
        {
            return false;
        }
        for (mine, theirs) in self.per_input.iter().zip(expect.per_input.iter()) {
            match (mine, theirs) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    if a.rank != b.rank || a.axes.len() != b.axes.len() {
                        return false;
                    }
                    for (ax, bx) in a.axes.iter().zip(b.axes.iter()) {
                        if ax.is_size_one != bx.is_size_one
                            || ax.stride_index != bx.stride_index
                            || ax.contiguous != bx.contiguous
                        {
                            return false;
                        }
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

fn tensor_requirement(tensor: &TensorArg) -> TensorRequirement {
    let slots = tensor.stride_order();
    let contiguity = tensor.contiguity();
    TensorRequirement {
        rank: tensor.rank(),
        axes: (0..tensor.rank())
            .map(|axis| AxisRequirement {
                is_size_one: tensor.sizes[axis] == 1,
                stride_index: Some(slots[axis]),
                contiguous: Some(contiguity[axis]),
            })
            .collect(),
    }
}

fn stride_slots_of_arg(tensor: &TensorArg) -> Vec<Option<usize>> {
    tensor.stride_order().into_iter().map(Some).collect()
}

/// Accumulate per-axis stride slots across the tensor inputs: the first
/// full observation wins per axis; rank mismatches are skipped (broadcast
/// operands do not vote on the common layout).
fn merge_stride_slots(acc: &mut Option<Vec<Option<usize>>>, slots: &[Option<usize>]) {
    match acc {
        None => *acc = Some(slots.to_vec()),
        Some(existing) => {
            if existing.len() != slots.len() {
                return;
            }
            for (slot, &new) in existing.iter_mut().zip(slots.iter()) {
                if slot.is_none() {
                    *slot = new;
                }
            }
        }
    }
}

/// The permutation achieving sorted stride order: entry `k` is the axis
/// sitting at stride slot `k` (slowest first). Axes without a designated
/// slot fill the gaps in order.
pub fn permutation_per_sorted_stride(per_axis_slot: Vec<Option<usize>>) -> Vec<usize> {
    let rank = per_axis_slot.len();
    let mut permute_seq: Vec<Option<usize>> = vec![None; rank];
    let mut ordered_axes: Vec<bool> = vec![false; rank];
    for (axis, &slot) in per_axis_slot.iter().enumerate() {
        if let Some(slot) = slot {
            if slot < rank && permute_seq[slot].is_none() {
                permute_seq[slot] = Some(axis);
                ordered_axes[axis] = true;
            }
        }
    }
    let mut unallocated = (0..rank).filter(|&axis| !ordered_axes[axis]);
    permute_seq
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| unallocated.next().expect("slot counts match")))
        .collect()
}

/// Invert `permuted`, then drop axes eliminated by the reduction and shift
/// the ones above them down.
pub fn reverse_permutation(permuted: &[usize], reduction_axes: &[usize]) -> Vec<usize> {
    let rank = permuted.len();
    let mut permutation = vec![0usize; rank];
    for (i, &p) in permuted.iter().enumerate() {
        permutation[p] = i;
    }
    if reduction_axes.is_empty() {
        return permutation;
    }
    let mut adjusted = Vec::new();
    for &dim in &permutation {
        let mut offset = 0usize;
        let mut eliminated = false;
        for &red_dim in reduction_axes {
            if red_dim < dim {
                offset += 1;
            } else if red_dim == dim {
                eliminated = true;
                break;
            }
        }
        if !eliminated {
            adjusted.push(dim - offset);
        }
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::backend::DevicePtr;
    use crate::types::DataType;

    fn tensor(sizes: &[i64], strides: &[i64]) -> ArgValue {
        ArgValue::Tensor(TensorArg {
            ptr: DevicePtr(0),
            dtype: DataType::Float,
            device: DeviceId(0),
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
        })
    }

    #[test]
    fn test_identity_permutation_for_row_major() {
        let inputs = vec![tensor(&[4, 8], &[8, 1])];
        let req = InputsRequirement::from_args(&inputs, &[]).expect("valid inputs");
        assert_eq!(req.input_permutation, vec![0, 1]);
        assert_eq!(req.output_permutation, vec![0, 1]);
        assert!(!req.requires_permutation());
    }

    #[test]
    fn test_transposed_layout_is_normalized() {
        // Column-major: axis 1 is slowest.
        let inputs = vec![tensor(&[4, 8], &[1, 4])];
        let req = InputsRequirement::from_args(&inputs, &[]).expect("valid inputs");
        assert_eq!(req.input_permutation, vec![1, 0]);
        assert!(req.requires_permutation());
        // Output permutation inverts the normalization.
        assert_eq!(req.output_permutation, vec![1, 0]);
    }

    #[test]
    fn test_reverse_permutation_drops_reduced_axes() {
        // Identity layout, reduce axis 1 of a rank-3 tensor.
        let out = reverse_permutation(&[0, 1, 2], &[1]);
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn test_compliance_ignores_sizes() {
        let a = vec![tensor(&[16, 8], &[8, 1])];
        let b = vec![tensor(&[12, 6], &[6, 1])];
        let req_a = InputsRequirement::from_args(&a, &[]).expect("valid inputs");
        let req_b = InputsRequirement::from_args(&b, &[]).expect("valid inputs");
        assert!(req_a.comply_with(&req_b));
        assert!(req_b.comply_with(&req_a));
    }

    #[test]
    fn test_compliance_breaks_on_stride_order() {
        let a = vec![tensor(&[16, 8], &[8, 1])];
        let b = vec![tensor(&[16, 8], &[1, 16])];
        let req_a = InputsRequirement::from_args(&a, &[]).expect("valid inputs");
        let req_b = InputsRequirement::from_args(&b, &[]).expect("valid inputs");
        assert!(!req_a.comply_with(&req_b));
    }

    #[test]
    fn test_compliance_breaks_on_broadcast_mask() {
        let a = vec![tensor(&[16, 1], &[1, 1])];
        let b = vec![tensor(&[16, 8], &[8, 1])];
        let req_a = InputsRequirement::from_args(&a, &[]).expect("valid inputs");
        let req_b = InputsRequirement::from_args(&b, &[]).expect("valid inputs");
        assert!(!req_a.comply_with(&req_b));
    }

    #[test]
    fn test_mixed_scalar_inputs_keep_slots() {
        let inputs = vec![tensor(&[4, 4], &[4, 1]), ArgValue::Float(2.0)];
        let req = InputsRequirement::from_args(&inputs, &[]).expect("valid inputs");
        assert_eq!(req.per_input.len(), 2);
        assert!(req.per_input[0].is_some());
        assert!(req.per_input[1].is_none());
    }
}
