//! Incoming Graph Model
//!
//! The typed dataflow subgraph handed to the execution cache: value slots
//! (tensors with per-axis extent and stride properties, scalars with
//! optional literals) and operation nodes over them. The canonical text
//! form keys the graph-shape cache — it carries operator schemas, value
//! indices, ranks and devices, but no concrete sizes, so graphs differing
//! only in extent share an entry. `build_fusion` materializes the graph
//! into the math IR.

use std::fmt::Write as _;

use crate::ir::{Fusion, ScalarConst, ValId, ValKind};
use crate::types::{BinaryOpKind, DataType, DeviceId, TernaryOpKind, UnaryOpKind};

/// Per-axis stride observation of a tensor input: position of this axis in
/// the stride order (0 = slowest), contiguity, and the concrete stride when
/// profiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrideProperty {
    pub stride_index: Option<usize>,
    pub contiguous: Option<bool>,
    pub stride: Option<i64>,
}

/// Type of a tensor-valued graph slot.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphTensorType {
    pub dtype: DataType,
    pub device: DeviceId,
    /// Static extents when known, `None` when symbolic
    pub sizes: Vec<Option<i64>>,
    pub stride_properties: Vec<StrideProperty>,
}

impl GraphTensorType {
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Fully contiguous symbolic tensor of a given rank.
    pub fn contiguous(dtype: DataType, device: DeviceId, rank: usize) -> Self {
        GraphTensorType {
            dtype,
            device,
            sizes: vec![None; rank],
            stride_properties: (0..rank)
                .map(|i| StrideProperty {
                    stride_index: Some(i),
                    contiguous: Some(true),
                    stride: None,
                })
                .collect(),
        }
    }
}

/// A graph value slot.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphValue {
    Tensor(GraphTensorType),
    Scalar { dtype: DataType, literal: Option<ScalarConst> },
}

/// Operation kinds of graph nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOpKind {
    Unary(UnaryOpKind),
    Binary(BinaryOpKind),
    Ternary(TernaryOpKind),
    Reduction { op: BinaryOpKind, axes: Vec<usize> },
    Broadcast { is_new_axis: Vec<bool> },
    Cast(DataType),
}

/// A graph operation: op kind plus ordered value-slot indices.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub op: GraphOpKind,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// A dataflow subgraph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphDef {
    pub values: Vec<GraphValue>,
    /// Value slots that are graph inputs, in argument order
    pub inputs: Vec<usize>,
    pub nodes: Vec<GraphNode>,
    /// Value slots that are graph outputs, in result order
    pub outputs: Vec<usize>,
}

impl GraphDef {
    /// Deterministic canonical text: operator schemas and value indices,
    /// `(rank, device)` tensor annotations without sizes, scalar literals
    /// inlined. Independent of addresses and allocation order.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        out.push_str("graph(");
        for (k, &idx) in self.inputs.iter().enumerate() {
            if k > 0 {
                out.push_str(", ");
            }
            match &self.values[idx] {
                GraphValue::Tensor(t) => {
                    let _ = write!(out, "%{idx}: tensor<{:?}, rank{}, {}>", t.dtype, t.rank(), t.device);
                }
                GraphValue::Scalar { dtype, literal } => match literal {
                    Some(c) => {
                        let _ = write!(out, "%{idx}: {dtype:?} = {c}");
                    }
                    None => {
                        let _ = write!(out, "%{idx}: {dtype:?}");
                    }
                },
            }
        }
        out.push_str("):\n");
        for node in &self.nodes {
            out.push_str("  ");
            for (k, &o) in node.outputs.iter().enumerate() {
                if k > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "%{o}");
            }
            out.push_str(" = ");
            match &node.op {
                GraphOpKind::Unary(op) => {
                    let _ = write!(out, "unary.{op:?}");
                }
                GraphOpKind::Binary(op) => {
                    let _ = write!(out, "binary.{op:?}");
                }
                GraphOpKind::Ternary(op) => {
                    let _ = write!(out, "ternary.{op:?}");
                }
                GraphOpKind::Reduction { op, axes } => {
                    let _ = write!(out, "reduction.{op:?}[axes={axes:?}]");
                }
                GraphOpKind::Broadcast { is_new_axis } => {
                    let _ = write!(out, "broadcast[{is_new_axis:?}]");
                }
                GraphOpKind::Cast(dtype) => {
                    let _ = write!(out, "cast.{dtype:?}");
                }
            }
            out.push('(');
            for (k, &i) in node.inputs.iter().enumerate() {
                if k > 0 {
                    out.push_str(", ");
                }
                match &self.values[i] {
                    GraphValue::Scalar { literal: Some(c), .. } => {
                        let _ = write!(out, "{c}");
                    }
                    _ => {
                        let _ = write!(out, "%{i}");
                    }
                }
            }
            out.push_str(")\n");
        }
        out.push_str("  return (");
        for (k, &o) in self.outputs.iter().enumerate() {
            if k > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "%{o}");
        }
        out.push_str(")\n");
        out
    }

    /// Reduction axes of the graph's distinguished reduction, if any.
    /// Mirrors the single-output constraint of the permutation machinery.
    pub fn reduction_axes(&self) -> Vec<usize> {
        let mut axes = Vec::new();
        for node in &self.nodes {
            if let GraphOpKind::Reduction { axes: node_axes, .. } = &node.op {
                axes.extend(node_axes.iter().copied());
            }
        }
        axes.sort_unstable();
        axes.dedup();
        axes
    }

    /// Rewrite the graph with every tensor-input type permuted by
    /// `input_permutation` (new axis `i` comes from old axis
    /// `input_permutation[i]`), remapping stride indices and reduction axis
    /// lists accordingly.
    pub fn permute(&self, input_permutation: &[usize]) -> GraphDef {
        let mut permuted = self.clone();
        for &idx in &self.inputs {
            if let GraphValue::Tensor(t) = &self.values[idx] {
                if t.rank() != input_permutation.len() {
                    continue;
                }
                let mut new_type = t.clone();
                for (new_pos, &old_pos) in input_permutation.iter().enumerate() {
                    new_type.sizes[new_pos] = t.sizes[old_pos];
                    let mut prop = t.stride_properties[old_pos];
                    // Permutation only renumbers the stride order slot.
                    if let Some(stride_index) = prop.stride_index {
                        prop.stride_index = input_permutation
                            .iter()
                            .position(|&p| p == stride_index);
                    }
                    new_type.stride_properties[new_pos] = prop;
                }
                permuted.values[idx] = GraphValue::Tensor(new_type);
            }
        }
        for node in &mut permuted.nodes {
            if let GraphOpKind::Reduction { axes, .. } = &mut node.op {
                let adjusted: Vec<usize> = axes
                    .iter()
                    .filter_map(|&dim| input_permutation.iter().position(|&p| p == dim))
                    .collect();
                *axes = adjusted;
            }
        }
        permuted
    }

    /// Materialize the graph into a fresh fusion. Returns the fusion and
    /// the value-slot → IR-handle mapping for the graph inputs.
    pub fn build_fusion(&self) -> (Fusion, Vec<ValId>) {
        let mut fusion = Fusion::new();
        let mut slot_vals: Vec<Option<ValId>> = vec![None; self.values.len()];

        for &idx in &self.inputs {
            let val = match &self.values[idx] {
                GraphValue::Tensor(t) => {
                    let tv = fusion.new_tensor(t.dtype, t.rank());
                    // Contiguity flags come from the observed stride
                    // properties.
                    let td_id = fusion.tensor_view(tv).domain;
                    let contiguity: Vec<bool> = t
                        .stride_properties
                        .iter()
                        .map(|p| p.contiguous.unwrap_or(false))
                        .collect();
                    fusion.tensor_domain_mut(td_id).contiguity = contiguity;
                    // Extents print as the tensor argument's size array.
                    let tv_name = fusion.val(tv).name();
                    let root = fusion.tv_root(tv);
                    for (k, &id) in root.iter().enumerate() {
                        let extent = fusion.iter_domain(id).extent;
                        fusion.val_mut(extent).kind =
                            ValKind::NamedScalar { name: format!("T{tv_name}.size[{k}]") };
                    }
                    tv
                }
                GraphValue::Scalar { dtype, literal } => match literal {
                    Some(c) => fusion.register_val(*dtype, ValKind::Scalar { value: Some(*c) }),
                    None => fusion.new_scalar(*dtype),
                },
            };
            fusion.add_input(val);
            slot_vals[idx] = Some(val);
        }

        for node in &self.nodes {
            let inputs: Vec<ValId> = node
                .inputs
                .iter()
                .map(|&i| {
                    slot_vals[i].unwrap_or_else(|| {
                        // Non-input scalar literal referenced directly.
                        match &self.values[i] {
                            GraphValue::Scalar { dtype, literal: Some(c) } => {
                                fusion.register_val(*dtype, ValKind::Scalar { value: Some(*c) })
                            }
                            _ => panic!("graph value %{i} used before definition"),
                        }
                    })
                })
                .collect();
            let out = match &node.op {
                GraphOpKind::Unary(op) => fusion.unary(*op, inputs[0]),
                GraphOpKind::Binary(op) => fusion.binary(*op, inputs[0], inputs[1]),
                GraphOpKind::Ternary(op) => fusion.ternary(*op, inputs[0], inputs[1], inputs[2]),
                GraphOpKind::Reduction { op, axes } => {
                    let signed: Vec<isize> = axes.iter().map(|&a| a as isize).collect();
                    let init = match (op, fusion.val(inputs[0]).dtype()) {
                        (BinaryOpKind::Max, DataType::Int) => ScalarConst::Int(i64::MIN),
                        (BinaryOpKind::Max, _) => ScalarConst::Float(f64::NEG_INFINITY),
                        (BinaryOpKind::Min, DataType::Int) => ScalarConst::Int(i64::MAX),
                        (BinaryOpKind::Min, _) => ScalarConst::Float(f64::INFINITY),
                        (_, DataType::Int) => ScalarConst::Int(0),
                        _ => ScalarConst::Float(0.0),
                    };
                    fusion.reduce(*op, init, inputs[0], &signed)
                }
                GraphOpKind::Broadcast { is_new_axis } => fusion.broadcast(inputs[0], is_new_axis),
                GraphOpKind::Cast(dtype) => fusion.cast(*dtype, inputs[0]),
            };
            slot_vals[node.outputs[0]] = Some(out);
        }

        let mut input_handles = Vec::new();
        for &idx in &self.inputs {
            input_handles.push(slot_vals[idx].expect("inputs materialized"));
        }
        for &idx in &self.outputs {
            let out = slot_vals[idx].expect("graph outputs must be produced by a node");
            fusion.tv_set_memory(out, crate::types::MemoryType::Global);
            fusion.add_output(out);
        }
        (fusion, input_handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_graph() -> GraphDef {
        // %2 = add(%0, %1); reduce %2 over axis 1
        GraphDef {
            values: vec![
                GraphValue::Tensor(GraphTensorType::contiguous(DataType::Float, DeviceId(0), 2)),
                GraphValue::Scalar { dtype: DataType::Float, literal: Some(ScalarConst::Float(2.0)) },
                GraphValue::Scalar { dtype: DataType::Float, literal: None },
                GraphValue::Scalar { dtype: DataType::Float, literal: None },
            ],
            inputs: vec![0, 1],
            nodes: vec![
                GraphNode {
                    op: GraphOpKind::Binary(BinaryOpKind::Add),
                    inputs: vec![0, 1],
                    outputs: vec![2],
                },
                GraphNode {
                    op: GraphOpKind::Reduction { op: BinaryOpKind::Add, axes: vec![1] },
                    inputs: vec![2],
                    outputs: vec![3],
                },
            ],
            outputs: vec![3],
        }
    }

    #[test]
    fn test_canonical_is_deterministic_and_size_free() {
        let g = simple_graph();
        let c1 = g.canonical();
        let c2 = g.clone().canonical();
        assert_eq!(c1, c2);
        assert!(c1.contains("rank2"));
        assert!(c1.contains("reduction.Add[axes=[1]]"));
        // Scalar literal inlined at the call site.
        assert!(c1.contains("2f") || c1.contains("2.0f"));
        assert!(!c1.contains("1025"));
    }

    #[test]
    fn test_canonical_differs_on_rank() {
        let g2 = simple_graph();
        let mut g3 = simple_graph();
        g3.values[0] =
            GraphValue::Tensor(GraphTensorType::contiguous(DataType::Float, DeviceId(0), 3));
        assert_ne!(g2.canonical(), g3.canonical());
    }

    #[test]
    fn test_permute_adjusts_reduction_axes() {
        let g = simple_graph();
        // Swap the two axes: old axis 1 becomes new axis 0.
        let permuted = g.permute(&[1, 0]);
        assert_eq!(permuted.reduction_axes(), vec![0]);
    }

    #[test]
    fn test_build_fusion_shapes() {
        let g = simple_graph();
        let (fusion, inputs) = g.build_fusion();
        assert_eq!(inputs.len(), 2);
        assert!(fusion.val(inputs[0]).is_tensor_view());
        assert!(fusion.has_reduction());
        assert_eq!(fusion.outputs().len(), 1);
        // Input extents print as the argument's size array.
        let root = fusion.tv_root(inputs[0]);
        let extent = fusion.iter_domain(root[0]).extent;
        assert!(matches!(fusion.val(extent).kind(), ValKind::NamedScalar { name } if name.contains(".size[0]")));
    }
}
