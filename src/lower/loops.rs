//! Loop Nest Generation
//!
//! Walks the sorted expression sequence keeping a stack of open loops.
//! For each expression the target loop structure is its output's shared
//! (computeAt) prefix — resolved to concrete loop domains through the loop
//! map — followed by the output's remaining axes. Loops are closed and
//! opened to match, allocations are placed at the boundary between the two,
//! and the math expression is rewritten over address-computed slots.
//!
//! Serial reductions additionally emit an accumulator-initialization nest
//! at the allocation scope; parallel reductions lower to a single helper
//! call and carry their tail predicate inline.

use std::collections::HashSet;

use crate::compute_at::ComputeAtMap;
use crate::index::{bind_loops_to_domain, Index, IndexCompute, OpenLoop};
use crate::ir::{ExprId, ExprKind, Fusion, ValId};
use crate::lower::kernel_ir::{ForLoop, KirExpr, KirVal};
use crate::lower::LoweringError;
use crate::types::{BinaryOpKind, DataType, MemoryType};

/// Generate the lowered statement list for the sorted expressions.
pub fn generate_loop_nests(
    fusion: &mut Fusion,
    ca_map: &ComputeAtMap,
    sorted: &[ExprId],
) -> Result<Vec<KirExpr>, LoweringError> {
    let mut generator = LoopNestGenerator {
        top: Vec::new(),
        stack: Vec::new(),
        allocated: HashSet::new(),
    };
    for &expr in sorted {
        generator.handle(fusion, ca_map, expr)?;
    }
    generator.close_to(0);
    Ok(generator.top)
}

struct LoopNestGenerator {
    top: Vec<KirExpr>,
    stack: Vec<(OpenLoop, Vec<KirExpr>)>,
    allocated: HashSet<ValId>,
}

impl LoopNestGenerator {
    fn current_scope(&mut self) -> &mut Vec<KirExpr> {
        match self.stack.last_mut() {
            Some((_, body)) => body,
            None => &mut self.top,
        }
    }

    fn open_loops(&self) -> Vec<OpenLoop> {
        self.stack.iter().map(|(l, _)| *l).collect()
    }

    fn open_for(&mut self, fusion: &mut Fusion, iter_domain: ValId) {
        let parallel = fusion.iter_domain(iter_domain).parallel;
        let index = match parallel.index_name() {
            Some(name) => fusion.named_scalar(name, DataType::Int),
            None => fusion.new_scalar(DataType::Int),
        };
        self.stack.push((OpenLoop { iter_domain, index }, Vec::new()));
    }

    fn close_for(&mut self) {
        let (open_loop, body) = self.stack.pop().expect("close_for with open loops");
        let loop_expr = KirExpr::ForLoop(ForLoop {
            index: open_loop.index,
            iter_domain: open_loop.iter_domain,
            body,
        });
        self.current_scope().push(loop_expr);
    }

    fn close_to(&mut self, depth: usize) {
        while self.stack.len() > depth {
            self.close_for();
        }
    }

    fn handle(
        &mut self,
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        expr_id: ExprId,
    ) -> Result<(), LoweringError> {
        let out_tv = fusion.expr(expr_id).output();
        let domain = fusion.tv_current_domain(out_tv);
        let produce_pos = fusion.produced_at(out_tv).min(domain.len());
        // The tensor's own binding into its consumer's nest; allocation and
        // accumulator init live at this depth, even when deeper loops are
        // shared with producers computed into this tensor.
        let bind_pos = fusion
            .tv_compute_at(out_tv)
            .map_or(0, |link| link.pos)
            .min(produce_pos);

        // Target loop structure: shared prefix through concrete loop ids,
        // then the tensor's own axes.
        let mut target: Vec<ValId> = Vec::new();
        for &axis in domain.iter().take(produce_pos) {
            target.push(ca_map.concrete_id(fusion, axis));
        }
        for &axis in domain.iter().skip(produce_pos) {
            target.push(axis);
        }

        // Keep the open loops that form a prefix of the target.
        let mut matched = 0;
        while matched < self.stack.len()
            && matched < target.len()
            && ca_map.are_mapped(self.stack[matched].0.iter_domain, target[matched])
        {
            matched += 1;
        }
        self.close_to(matched);

        // Open up to the binding point, place the allocation, then open the
        // rest.
        for &id in target.iter().take(bind_pos).skip(matched) {
            self.open_for(fusion, id);
        }

        if fusion.tv_memory(out_tv) != MemoryType::Global && self.allocated.insert(out_tv) {
            let size = allocation_size(fusion, out_tv, bind_pos);
            let memory = fusion.tv_memory(out_tv);
            self.current_scope().push(KirExpr::Allocate { tv: out_tv, memory, size });
        }

        let kind = fusion.expr(expr_id).kind().clone();
        let serial_reduction = matches!(kind, ExprKind::Reduction { .. })
            && !has_parallel_reduction_axis(fusion, out_tv);
        if let ExprKind::Reduction { init, .. } = kind {
            if serial_reduction {
                let init_nest = self.build_reduction_init(
                    fusion,
                    ca_map,
                    out_tv,
                    init,
                    bind_pos,
                )?;
                self.current_scope().push(init_nest);
            }
        }

        for &id in target.iter().skip(bind_pos.max(matched)) {
            self.open_for(fusion, id);
        }

        // Rewrite operands over address-computed slots.
        let loops = self.open_loops();
        let out_slot = KirVal::TensorSlot(Index::get_consumer_index(fusion, ca_map, out_tv, &loops)?);
        let input_ids = fusion.expr(expr_id).inputs().to_vec();
        let mut operands: Vec<KirVal> = Vec::new();
        for inp in input_ids {
            if fusion.val(inp).is_tensor_view() {
                let slot = Index::get_producer_index(fusion, ca_map, inp, out_tv, &loops)?;
                operands.push(KirVal::TensorSlot(slot));
            } else {
                operands.push(KirVal::Scalar(inp));
            }
        }

        let pred = tail_predicate(fusion, ca_map, out_tv, &loops);
        let stmt = match fusion.expr(expr_id).kind().clone() {
            ExprKind::Unary { op } => KirExpr::Unary { op, out: out_slot, input: operands[0] },
            ExprKind::Binary { op } => {
                KirExpr::Binary { op, out: out_slot, lhs: operands[0], rhs: operands[1] }
            }
            ExprKind::Ternary { op } => KirExpr::Ternary {
                op,
                out: out_slot,
                a: operands[0],
                b: operands[1],
                c: operands[2],
            },
            ExprKind::Reduction { op, init } => KirExpr::Reduction {
                op,
                out: out_slot,
                input: operands[0],
                init,
                pred,
            },
            ExprKind::Broadcast { .. } => {
                KirExpr::Broadcast { out: out_slot, input: operands[0] }
            }
            ExprKind::Split { .. } | ExprKind::Merge => unreachable!("domain transforms are not lowered"),
        };

        // Reductions carry their predicate into the helper call; everything
        // else is wrapped in a guard.
        let is_reduction = matches!(stmt, KirExpr::Reduction { .. });
        let guarded = match pred {
            Some(cond) if !is_reduction => {
                KirExpr::IfThenElse { cond, then_body: vec![stmt], else_body: Vec::new() }
            }
            _ => stmt,
        };
        self.current_scope().push(guarded);
        Ok(())
    }

    /// A nest of fresh loops over the output's non-reduction tail axes that
    /// sets every accumulator slot to the reduction identity.
    fn build_reduction_init(
        &mut self,
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        out_tv: ValId,
        init: ValId,
        produce_pos: usize,
    ) -> Result<KirExpr, LoweringError> {
        let domain = fusion.tv_current_domain(out_tv);
        let tail_iter_axes: Vec<ValId> = domain[produce_pos..]
            .iter()
            .copied()
            .filter(|&id| {
                let dom = fusion.iter_domain(id);
                !dom.is_reduction() && !dom.is_broadcast()
            })
            .collect();

        let mut init_loops: Vec<OpenLoop> = Vec::new();
        for &id in &tail_iter_axes {
            let parallel = fusion.iter_domain(id).parallel;
            let index = match parallel.index_name() {
                Some(name) => fusion.named_scalar(name, DataType::Int),
                None => fusion.new_scalar(DataType::Int),
            };
            init_loops.push(OpenLoop { iter_domain: id, index });
        }

        let mut all_loops = self.open_loops();
        all_loops.extend(init_loops.iter().copied());
        let out_slot = Index::get_consumer_index(fusion, ca_map, out_tv, &all_loops)?;

        let mut stmt = KirExpr::Unary {
            op: crate::types::UnaryOpKind::Set,
            out: KirVal::TensorSlot(out_slot),
            input: KirVal::Scalar(init),
        };
        for open_loop in init_loops.into_iter().rev() {
            stmt = KirExpr::ForLoop(ForLoop {
                index: open_loop.index,
                iter_domain: open_loop.iter_domain,
                body: vec![stmt],
            });
        }
        Ok(stmt)
    }
}

/// Does the reduction output have a device-parallel reduction axis?
fn has_parallel_reduction_axis(fusion: &Fusion, out_tv: ValId) -> bool {
    fusion.tv_current_domain(out_tv).iter().any(|&id| {
        let dom = fusion.iter_domain(id);
        dom.is_reduction() && dom.is_thread()
    })
}

/// Element count of a scratchpad allocation: extents of the tensor's axes
/// below its producedAt prefix, excluding reductions, broadcasts, and the
/// parallel dimensions its memory class already spans.
fn allocation_size(fusion: &mut Fusion, tv: ValId, produce_pos: usize) -> ValId {
    let memory = fusion.tv_memory(tv);
    let domain = fusion.tv_current_domain(tv);
    let mut size: Option<ValId> = None;
    for &id in &domain[produce_pos.min(domain.len())..] {
        let dom = fusion.iter_domain(id).clone();
        if dom.is_reduction() || dom.is_broadcast() {
            continue;
        }
        let spanned_by_memory = match memory {
            MemoryType::Local => dom.is_thread(),
            MemoryType::Shared => dom.is_block_dim(),
            MemoryType::Global => false,
        };
        if spanned_by_memory {
            continue;
        }
        size = Some(match size {
            Some(acc) => fusion.mul(acc, dom.extent),
            None => dom.extent,
        });
    }
    size.unwrap_or_else(|| fusion.one())
}

/// Tail-guard predicate: when the output's history contains a split, the
/// loop space can overrun the root extents, so conjoin
/// `root_index < root_extent` over the indexed root axes.
fn tail_predicate(
    fusion: &mut Fusion,
    ca_map: &ComputeAtMap,
    out_tv: ValId,
    loops: &[OpenLoop],
) -> Option<ValId> {
    let domain = fusion.tv_current_domain(out_tv);
    let has_split = fusion
        .domain_transform_history(&domain)
        .iter()
        .any(|&e| matches!(fusion.expr(e).kind(), ExprKind::Split { .. }));
    if !has_split {
        return None;
    }

    let mut remaining: std::collections::VecDeque<OpenLoop> = loops.iter().copied().collect();
    let mut bound = HashSet::new();
    let initial = bind_loops_to_domain(
        fusion,
        ca_map,
        &domain,
        &mut remaining,
        &|_, l| l.index,
        &mut bound,
    );
    let root = fusion.tv_maybe_rfactor(out_tv);
    let mut ic = IndexCompute::new(initial, Default::default(), Default::default(), Default::default());
    ic.run(fusion, &domain, &root);

    let mut pred: Option<ValId> = None;
    for &root_id in &root {
        let dom = fusion.iter_domain(root_id).clone();
        if dom.is_broadcast() {
            continue;
        }
        let Some(&ind) = ic.index_map().get(&root_id) else { continue };
        if fusion.val(ind).is_zero_int() {
            continue;
        }
        let in_range = fusion.binary(BinaryOpKind::Lt, ind, dom.extent);
        pred = Some(match pred {
            Some(acc) => fusion.binary(BinaryOpKind::And, acc, in_range),
            None => in_range,
        });
    }
    pred
}
