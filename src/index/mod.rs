//! Indexing
//!
//! Runs backward over the transformation history: current-domain axes carry
//! the loop variables, root axes carry the memory strides, and Split/Merge
//! expressions in between are inverted one by one
//! (`i_in = i_outer * extent(inner) + i_inner` for a split,
//! `i_outer = i / extent(inner)`, `i_inner = i % extent(inner)` for a
//! merge).
//!
//! Zero indices flow specially: a zero from a broadcast axis is ordinary,
//! but a zero standing in for a loop the tensor does not span (scratchpad
//! tensors inside their allocation point, thread-mapped axes of local
//! tensors) marks the merged-into domain so later steps keep the non-zero
//! side unscaled. Extents may be overridden per axis: walking a computeAt
//! stack from consumer to producer carries consumer extents onto producer
//! axes, which is what makes concretized broadcasts decompose correctly.
//!
//! Contiguity analysis finds merges whose root inputs are in original
//! order, all contiguous and split-free; such merges flatten into a single
//! multiply instead of a div/mod chain.

use std::collections::{HashMap, HashSet};

use crate::compute_at::ComputeAtMap;
use crate::domain::replay_producer_as_consumer;
use crate::ir::{ExprKind, Fusion, TensorIndex, ValId, ValKind};
use crate::lower::LoweringError;
use crate::root_map::root_map_c2p;
use crate::types::{DataType, IterType, MemoryType};

/// An open loop at an emission point: the concrete iteration domain the
/// loop runs over and the scalar holding its index.
#[derive(Debug, Clone, Copy)]
pub struct OpenLoop {
    pub iter_domain: ValId,
    pub index: ValId,
}

// ----------------------------------------------------------------------
// Contiguity
// ----------------------------------------------------------------------

/// Root inputs of `ids` restricted to `order`, sorted by position in
/// `order`.
fn iter_domain_inputs_ordered_as(fusion: &Fusion, ids: &[ValId], order: &[ValId]) -> Vec<ValId> {
    let mut found: Vec<ValId> = Vec::new();
    let mut stack: Vec<ValId> = ids.to_vec();
    let mut seen: HashSet<ValId> = HashSet::new();
    while let Some(v) = stack.pop() {
        if !seen.insert(v) {
            continue;
        }
        if order.contains(&v) {
            found.push(v);
            continue;
        }
        match fusion.val(v).definition() {
            Some(def) if fusion.expr(def).is_domain_transform() => {
                stack.extend(fusion.expr(def).inputs().iter().copied());
            }
            _ => {}
        }
    }
    found.sort_by_key(|id| order.iter().position(|o| o == id));
    found
}

/// Find iteration domains that are the result of contiguous merges: every
/// root input contiguous, inputs adjacent and in root order, and no split
/// anywhere on the path. Indexing may treat such a domain as one flat axis.
pub fn find_contiguous_ids(
    fusion: &Fusion,
    ids: &[ValId],
    root_domain: &[ValId],
    root_contiguity: &[bool],
) -> HashSet<ValId> {
    debug_assert_eq!(root_domain.len(), root_contiguity.len());
    let mut contig_ids: HashSet<ValId> = HashSet::new();
    let is_contig_root: HashMap<ValId, bool> = root_domain
        .iter()
        .copied()
        .zip(root_contiguity.iter().copied())
        .collect();
    for (&id, &contig) in root_domain.iter().zip(root_contiguity.iter()) {
        if contig {
            contig_ids.insert(id);
        }
    }

    for expr_id in fusion.domain_transform_history(ids) {
        let expr = fusion.expr(expr_id);
        let ExprKind::Merge = expr.kind() else { continue };
        let outer = expr.inputs()[0];
        let inner = expr.inputs()[1];
        if !contig_ids.contains(&outer) || !contig_ids.contains(&inner) {
            continue;
        }

        let lhs_inputs = iter_domain_inputs_ordered_as(fusion, &[outer], root_domain);
        let rhs_inputs = iter_domain_inputs_ordered_as(fusion, &[inner], root_domain);
        let mut ordered_inputs: Vec<ValId> = lhs_inputs;
        ordered_inputs.extend(rhs_inputs);
        if ordered_inputs.is_empty()
            || !ordered_inputs
                .iter()
                .all(|id| is_contig_root.get(id).copied().unwrap_or(false))
        {
            continue;
        }

        // The inputs must be a consecutive run of the root domain.
        let Some(first_pos) = root_domain.iter().position(|&r| r == ordered_inputs[0]) else {
            continue;
        };
        let consecutive = ordered_inputs
            .iter()
            .enumerate()
            .all(|(k, &id)| root_domain.get(first_pos + k) == Some(&id));
        if consecutive {
            contig_ids.insert(expr.output());
        }
    }
    contig_ids
}

// ----------------------------------------------------------------------
// Backward index propagation
// ----------------------------------------------------------------------

/// Backward propagation state over one tensor domain.
#[derive(Debug, Clone, Default)]
pub struct IndexCompute {
    /// IterDomain → index expression
    index_map: HashMap<ValId, ValId>,
    /// IterDomain → overriding extent (inherited from a consumer)
    extent_map: HashMap<ValId, ValId>,
    /// Domains that had a structural zero merged into them
    zero_merged_in: HashSet<ValId>,
    /// Flat-merge shortcut domains
    contig_ids: HashSet<ValId>,
}

impl IndexCompute {
    pub fn new(
        initial_index_map: HashMap<ValId, ValId>,
        extent_map: HashMap<ValId, ValId>,
        zero_merged_in: HashSet<ValId>,
        contig_ids: HashSet<ValId>,
    ) -> Self {
        IndexCompute { index_map: initial_index_map, extent_map, zero_merged_in, contig_ids }
    }

    pub fn index_map(&self) -> &HashMap<ValId, ValId> {
        &self.index_map
    }

    pub fn extent_map(&self) -> &HashMap<ValId, ValId> {
        &self.extent_map
    }

    fn get_extent(&self, fusion: &Fusion, id: ValId) -> ValId {
        self.extent_map
            .get(&id)
            .copied()
            .unwrap_or_else(|| fusion.iter_domain(id).extent)
    }

    fn has_zero_merged(&self, id: ValId) -> bool {
        self.zero_merged_in.contains(&id)
    }

    /// Run the Split/Merge history of `domain` backward, landing indices on
    /// the root axes. `root_for_contig` is the root tuple contiguous merges
    /// are resolved against.
    pub fn run(&mut self, fusion: &mut Fusion, domain: &[ValId], root_for_contig: &[ValId]) {
        let history = fusion.domain_transform_history(domain);
        for expr_id in history.into_iter().rev() {
            let (kind, inputs, outputs) = {
                let e = fusion.expr(expr_id);
                (e.kind().clone(), e.inputs().to_vec(), e.outputs().to_vec())
            };
            match kind {
                ExprKind::Split { .. } => {
                    self.handle_split(fusion, inputs[0], outputs[0], outputs[1]);
                }
                ExprKind::Merge => {
                    self.handle_merge(
                        fusion,
                        outputs[0],
                        inputs[0],
                        inputs[1],
                        root_for_contig,
                    );
                }
                _ => {}
            }
        }
    }

    fn handle_split(&mut self, fusion: &mut Fusion, in_id: ValId, outer_id: ValId, inner_id: ValId) {
        let (Some(&outer_ind), Some(&inner_ind)) =
            (self.index_map.get(&outer_id), self.index_map.get(&inner_id))
        else {
            return;
        };

        let outer_zero = fusion.val(outer_ind).is_zero_int();
        let inner_zero = fusion.val(inner_ind).is_zero_int();
        let outer_bcast = fusion.iter_domain(outer_id).is_broadcast();
        let inner_bcast = fusion.iter_domain(inner_id).is_broadcast();

        // A zero index from a broadcast is ordinary traversal; a zero from
        // a loop the tensor does not span must propagate as zero-merged.
        if (outer_zero && !outer_bcast)
            || (inner_zero && !inner_bcast)
            || self.has_zero_merged(inner_id)
            || self.has_zero_merged(outer_id)
        {
            self.zero_merged_in.insert(in_id);
        } else {
            self.zero_merged_in.remove(&in_id);
        }

        if outer_zero && inner_zero {
            let zero = fusion.zero();
            self.index_map.insert(in_id, zero);
        } else if outer_zero {
            self.index_map.insert(in_id, inner_ind);
            self.zero_merged_in.insert(in_id);
            let ext = self.get_extent(fusion, inner_id);
            self.extent_map.insert(in_id, ext);
        } else if inner_zero {
            self.index_map.insert(in_id, outer_ind);
            self.zero_merged_in.insert(in_id);
            let ext = self.get_extent(fusion, outer_id);
            self.extent_map.insert(in_id, ext);
        } else {
            let inner_extent = self.get_extent(fusion, inner_id);
            let scaled = fusion.mul(outer_ind, inner_extent);
            let combined = fusion.add(scaled, inner_ind);
            self.index_map.insert(in_id, combined);
        }
    }

    fn handle_merge(
        &mut self,
        fusion: &mut Fusion,
        out_id: ValId,
        outer_id: ValId,
        inner_id: ValId,
        root_for_contig: &[ValId],
    ) {
        let Some(&out_ind) = self.index_map.get(&out_id) else { return };

        if fusion.val(out_ind).is_zero_int() {
            let zero_a = fusion.zero();
            let zero_b = fusion.zero();
            let zero_ext_a = fusion.zero();
            let zero_ext_b = fusion.zero();
            self.index_map.insert(outer_id, zero_a);
            self.index_map.insert(inner_id, zero_b);
            self.extent_map.insert(outer_id, zero_ext_a);
            self.extent_map.insert(inner_id, zero_ext_b);
            return;
        }

        if !self.has_zero_merged(out_id) && self.contig_ids.contains(&out_id) {
            // Flat-merge shortcut: every root input gets zero, the
            // innermost gets the whole index.
            let input_ids = iter_domain_inputs_ordered_as(fusion, &[out_id], root_for_contig);
            debug_assert!(!input_ids.is_empty());
            for &root_id in &input_ids {
                let zero = fusion.zero();
                self.index_map.insert(root_id, zero);
            }
            if let Some(&last) = input_ids.last() {
                self.index_map.insert(last, out_ind);
            }
            return;
        }

        let inner_extent = self.get_extent(fusion, inner_id);
        let outer_extent = self.get_extent(fusion, outer_id);
        let inner_bcast_one =
            fusion.iter_domain(inner_id).is_broadcast() && fusion.val(inner_extent).is_one_int();
        let outer_bcast_one =
            fusion.iter_domain(outer_id).is_broadcast() && fusion.val(outer_extent).is_one_int();

        if inner_bcast_one {
            let zero = fusion.zero();
            self.index_map.insert(outer_id, out_ind);
            self.index_map.insert(inner_id, zero);
            let ext = self.get_extent(fusion, out_id);
            self.extent_map.insert(outer_id, ext);
        } else if outer_bcast_one {
            let zero = fusion.zero();
            self.index_map.insert(outer_id, zero);
            self.index_map.insert(inner_id, out_ind);
            let ext = self.get_extent(fusion, out_id);
            self.extent_map.insert(inner_id, ext);
        } else if self.has_zero_merged(out_id) {
            let zero = fusion.zero();
            let zero_ext = fusion.zero();
            self.index_map.insert(inner_id, out_ind);
            let ext = self.get_extent(fusion, out_id);
            self.extent_map.insert(inner_id, ext);
            self.index_map.insert(outer_id, zero);
            self.extent_map.insert(outer_id, zero_ext);
            self.zero_merged_in.insert(inner_id);
            self.zero_merged_in.insert(outer_id);
        } else {
            let outer_ind = fusion.div(out_ind, inner_extent);
            let inner_ind = fusion.modulo(out_ind, inner_extent);
            self.index_map.insert(outer_id, outer_ind);
            self.index_map.insert(inner_id, inner_ind);
        }
    }

    /// Carry this state onto the next tensor of a computeAt stack through a
    /// previous→new id map, merging in fresh loop bindings.
    pub fn update(
        &self,
        fusion: &Fusion,
        id_map: &HashMap<ValId, ValId>,
        new_index_entries: HashMap<ValId, ValId>,
        contig_ids: HashSet<ValId>,
    ) -> IndexCompute {
        let mut updated_index_map = new_index_entries;
        let mut updated_extent_map = HashMap::new();
        let mut updated_zero_merged = HashSet::new();
        for (&prev_id, &new_id) in id_map {
            if let Some(&ind) = self.index_map.get(&prev_id) {
                updated_index_map.insert(new_id, ind);
            }
            updated_extent_map.insert(new_id, self.get_extent(fusion, prev_id));
            if self.zero_merged_in.contains(&prev_id) {
                updated_zero_merged.insert(new_id);
            }
        }
        IndexCompute::new(updated_index_map, updated_extent_map, updated_zero_merged, contig_ids)
    }
}

// ----------------------------------------------------------------------
// ComputeAt stack walking
// ----------------------------------------------------------------------

/// The computeAt view chain ending at `from_tv`: `[outermost, .., from_tv]`.
pub fn compute_at_stack(fusion: &Fusion, from_tv: ValId) -> Vec<ValId> {
    let mut stack = vec![from_tv];
    let mut seen: HashSet<ValId> = HashSet::from([from_tv]);
    let mut running = from_tv;
    while let Some(link) = fusion.tv_compute_at(running) {
        if !seen.insert(link.consumer) {
            break;
        }
        stack.insert(0, link.consumer);
        running = link.consumer;
    }
    stack
}

/// Bind open loops to axes of `domain` in order, consuming from the front
/// of `remaining` while a binding is found.
pub(crate) fn bind_loops_to_domain(
    fusion: &Fusion,
    ca_map: &ComputeAtMap,
    domain: &[ValId],
    remaining: &mut std::collections::VecDeque<OpenLoop>,
    loop_index_override: &dyn Fn(&Fusion, OpenLoop) -> ValId,
    bound: &mut HashSet<ValId>,
) -> HashMap<ValId, ValId> {
    let mut map = HashMap::new();
    while let Some(&open_loop) = remaining.front() {
        let matched = domain.iter().copied().find(|&axis| {
            !bound.contains(&axis) && ca_map.are_mapped(axis, open_loop.iter_domain)
        });
        let Some(axis) = matched else { break };
        bound.insert(axis);
        map.insert(axis, loop_index_override(fusion, open_loop));
        remaining.pop_front();
    }
    map
}

/// Walk the computeAt stack mapping loop indices (and inherited extents)
/// from the outermost tensor down to the last entry, whose domain is given
/// explicitly (it may be a replayed view not installed on the tensor).
fn generate_index_and_extent_map(
    fusion: &mut Fusion,
    ca_map: &ComputeAtMap,
    stack: &[ValId],
    last_domain: &[ValId],
    last_root: &[ValId],
    last_c2p: Option<&HashMap<ValId, ValId>>,
    loops: &[OpenLoop],
    loop_index_override: &dyn Fn(&Fusion, OpenLoop) -> ValId,
    last_contig_ids: HashSet<ValId>,
) -> (HashMap<ValId, ValId>, HashMap<ValId, ValId>) {
    debug_assert!(!stack.is_empty());

    // Consumer→producer replay maps between adjacent stack entries.
    let mut pair_maps: Vec<HashMap<ValId, ValId>> = Vec::new();
    for i in 0..stack.len() - 1 {
        let c_tv = stack[i];
        let p_tv = stack[i + 1];
        let c2p_root = root_map_c2p(fusion, c_tv, p_tv);
        let p_domain = fusion.tv_current_domain(p_tv);
        let c_domain = fusion.tv_current_domain(c_tv);
        pair_maps.push(crate::domain::best_effort_replay(
            fusion, &p_domain, &c_domain, &c2p_root,
        ));
    }
    if let Some(c2p) = last_c2p {
        pair_maps.push(c2p.clone());
    }

    let mut remaining: std::collections::VecDeque<OpenLoop> = loops.iter().copied().collect();
    let mut bound: HashSet<ValId> = HashSet::new();

    let first_domain = if stack.len() == 1 && last_c2p.is_none() {
        last_domain.to_vec()
    } else {
        fusion.tv_current_domain(stack[0])
    };
    let initial = bind_loops_to_domain(
        fusion,
        ca_map,
        &first_domain,
        &mut remaining,
        loop_index_override,
        &mut bound,
    );
    let is_single_stage = stack.len() == 1 && last_c2p.is_none();
    let first_contig = if is_single_stage { last_contig_ids.clone() } else { HashSet::new() };
    let mut index_compute =
        IndexCompute::new(initial, HashMap::new(), HashSet::new(), first_contig);
    let first_root = if is_single_stage {
        last_root.to_vec()
    } else {
        fusion.tv_maybe_rfactor(stack[0])
    };
    index_compute.run(fusion, &first_domain, &first_root);

    for (stage, pair_map) in pair_maps.iter().enumerate() {
        let is_last = stage + 1 == pair_maps.len();
        let (domain, root) = if is_last && last_c2p.is_some() {
            (last_domain.to_vec(), last_root.to_vec())
        } else {
            let tv = stack[stage + 1];
            if is_last {
                (last_domain.to_vec(), last_root.to_vec())
            } else {
                (fusion.tv_current_domain(tv), fusion.tv_maybe_rfactor(tv))
            }
        };
        let mut new_bound = HashSet::new();
        let new_indices = bind_loops_to_domain(
            fusion,
            ca_map,
            &domain,
            &mut remaining,
            loop_index_override,
            &mut new_bound,
        );
        let contig = if is_last { last_contig_ids.clone() } else { HashSet::new() };
        let mut next = index_compute.update(fusion, pair_map, new_indices, contig);
        next.run(fusion, &domain, &root);
        index_compute = next;
    }

    (index_compute.index_map().clone(), index_compute.extent_map().clone())
}

// ----------------------------------------------------------------------
// Entry points
// ----------------------------------------------------------------------

/// Index builders for lowered tensor accesses.
pub struct Index;

impl Index {
    /// Address of a producer read inside the consumer's loop nest.
    pub fn get_producer_index(
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        producer: ValId,
        consumer: ValId,
        loops: &[OpenLoop],
    ) -> Result<ValId, LoweringError> {
        let producer_rank = fusion.no_reductions(&fusion.tv_current_domain(producer)).len();
        if producer_rank == 0 {
            return Ok(new_tensor_index(fusion, producer, Vec::new()));
        }
        if fusion.tv_memory(producer) == MemoryType::Global {
            Self::global_producer_index(fusion, ca_map, producer, consumer, loops)
        } else {
            Self::producer_index_impl(fusion, ca_map, producer, consumer, loops)
        }
    }

    /// Address of the consumer write at this emission point.
    pub fn get_consumer_index(
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        consumer: ValId,
        loops: &[OpenLoop],
    ) -> Result<ValId, LoweringError> {
        let consumer_rank = fusion.no_reductions(&fusion.tv_current_domain(consumer)).len();
        if consumer_rank == 0 {
            return Ok(new_tensor_index(fusion, consumer, Vec::new()));
        }
        if fusion.tv_memory(consumer) == MemoryType::Global {
            Self::global_consumer_index(fusion, ca_map, consumer, loops)
        } else {
            Self::consumer_index_impl(fusion, ca_map, consumer, loops)
        }
    }

    fn global_producer_index(
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        producer: ValId,
        consumer: ValId,
        loops: &[OpenLoop],
    ) -> Result<ValId, LoweringError> {
        // Replay the producer as the consumer: the loop nest is shaped like
        // the consumer, so indexing must see the producer through it.
        let c2p_root = root_map_c2p(fusion, consumer, producer);
        let consumer_rank = fusion.tv_n_dims(consumer);
        let replay =
            replay_producer_as_consumer(fusion, &c2p_root, producer, consumer, consumer_rank);

        let mut stack = compute_at_stack(fusion, consumer);
        stack.push(producer);

        let root_dom = fusion.tv_maybe_rfactor(producer);
        let contiguity = fusion.tv_domain(producer).contiguity.clone();
        let contig_ids = find_contiguous_ids(fusion, &replay.domain, &root_dom, &contiguity);

        let (index_map, _) = generate_index_and_extent_map(
            fusion,
            ca_map,
            &stack[..stack.len() - 1],
            &replay.domain,
            &root_dom,
            Some(&replay.c2p),
            loops,
            &|_, l| l.index,
            contig_ids,
        );

        strided_global_index(fusion, producer, &root_dom, &contiguity, &index_map)
    }

    fn producer_index_impl(
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        producer: ValId,
        consumer: ValId,
        loops: &[OpenLoop],
    ) -> Result<ValId, LoweringError> {
        let c2p_root = root_map_c2p(fusion, consumer, producer);
        let consumer_rank = fusion.tv_n_dims(consumer);
        let replay =
            replay_producer_as_consumer(fusion, &c2p_root, producer, consumer, consumer_rank);

        let mut stack = compute_at_stack(fusion, consumer);
        stack.push(producer);

        let root_dom = fusion.tv_maybe_rfactor(producer);
        let zeroed = scratchpad_loop_zeroing(fusion, ca_map, producer, loops);

        let (index_map, extent_map) = generate_index_and_extent_map(
            fusion,
            ca_map,
            &stack[..stack.len() - 1],
            &replay.domain,
            &root_dom,
            Some(&replay.c2p),
            loops,
            &zeroed,
            HashSet::new(),
        );

        strided_scratchpad_index(fusion, producer, &root_dom, &index_map, &extent_map)
    }

    fn global_consumer_index(
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        consumer: ValId,
        loops: &[OpenLoop],
    ) -> Result<ValId, LoweringError> {
        let stack = compute_at_stack(fusion, consumer);
        let domain = fusion.tv_current_domain(consumer);
        let root_dom = fusion.tv_maybe_rfactor(consumer);
        let contiguity = fusion.tv_domain(consumer).contiguity.clone();
        let contig_ids = find_contiguous_ids(fusion, &domain, &root_dom, &contiguity);

        let (index_map, _) = generate_index_and_extent_map(
            fusion,
            ca_map,
            &stack,
            &domain,
            &root_dom,
            None,
            loops,
            &|_, l| l.index,
            contig_ids,
        );

        strided_global_index(fusion, consumer, &root_dom, &contiguity, &index_map)
    }

    fn consumer_index_impl(
        fusion: &mut Fusion,
        ca_map: &ComputeAtMap,
        consumer: ValId,
        loops: &[OpenLoop],
    ) -> Result<ValId, LoweringError> {
        let stack = compute_at_stack(fusion, consumer);
        let domain = fusion.tv_current_domain(consumer);
        let root_dom = fusion.tv_maybe_rfactor(consumer);
        let zeroed = scratchpad_loop_zeroing(fusion, ca_map, consumer, loops);

        let (index_map, extent_map) = generate_index_and_extent_map(
            fusion,
            ca_map,
            &stack,
            &domain,
            &root_dom,
            None,
            loops,
            &zeroed,
            HashSet::new(),
        );

        strided_scratchpad_index(fusion, consumer, &root_dom, &index_map, &extent_map)
    }
}

/// Loop-index override for scratchpad tensors: loops outside the tensor's
/// allocation point contribute zero, as do block-mapped loops of shared
/// tensors and thread-mapped loops of local tensors.
fn scratchpad_loop_zeroing(
    fusion: &mut Fusion,
    ca_map: &ComputeAtMap,
    tv: ValId,
    loops: &[OpenLoop],
) -> Box<dyn Fn(&Fusion, OpenLoop) -> ValId + 'static> {
    let zero = fusion.zero();
    let is_shared = fusion.tv_memory(tv) == MemoryType::Shared;
    let is_local = fusion.tv_memory(tv) == MemoryType::Local;

    // The allocation point is the loop matching the tensor's own computeAt
    // binding; everything outside it is not spanned by the allocation.
    let produce_pos = fusion
        .tv_compute_at(tv)
        .map_or(0, |link| link.pos)
        .min(fusion.produced_at(tv));
    let mut alloc_loop_pos = 0;
    if produce_pos > 0 {
        let domain = fusion.tv_current_domain(tv);
        let mut matched = 0;
        for (i, l) in loops.iter().enumerate() {
            if matched < produce_pos
                && domain
                    .iter()
                    .take(produce_pos)
                    .any(|&axis| ca_map.are_mapped(axis, l.iter_domain))
            {
                matched += 1;
                alloc_loop_pos = i + 1;
            }
            if matched == produce_pos {
                break;
            }
        }
    }

    let outside: HashSet<ValId> = loops[..alloc_loop_pos.min(loops.len())]
        .iter()
        .map(|l| l.iter_domain)
        .collect();

    Box::new(move |fusion: &Fusion, open_loop: OpenLoop| {
        let dom = fusion.iter_domain(open_loop.iter_domain);
        let zeroed = outside.contains(&open_loop.iter_domain)
            || (is_shared && dom.is_block_dim())
            || (is_local && dom.is_thread());
        if zeroed {
            zero
        } else {
            open_loop.index
        }
    })
}

fn new_tensor_index(fusion: &mut Fusion, view: ValId, indices: Vec<ValId>) -> ValId {
    let dtype = fusion.val(view).dtype();
    fusion.register_val(dtype, ValKind::TensorIndex(TensorIndex { view, indices }))
}

/// Global tensors: sum of `root_index * T.stride[k]` terms, skipping
/// reductions and strideless broadcasts; strided broadcasts advance the
/// stride slot without contributing.
fn strided_global_index(
    fusion: &mut Fusion,
    tv: ValId,
    root_dom: &[ValId],
    contiguity: &[bool],
    index_map: &HashMap<ValId, ValId>,
) -> Result<ValId, LoweringError> {
    let inner_most_dim_contig = root_dom.last().is_some_and(|&last| {
        fusion.iter_domain(last).iter_type == IterType::Iteration
            && contiguity.last().copied().unwrap_or(false)
    });

    let tensor_name = fusion.val(tv).name();
    let mut stride_i = 0usize;
    let mut strided_inds: Vec<ValId> = Vec::new();
    for (i, &root_id) in root_dom.iter().enumerate() {
        let dom = fusion.iter_domain(root_id).clone();
        if dom.is_reduction() || dom.iter_type == IterType::BroadcastWithoutStride {
            continue;
        }
        if dom.iter_type == IterType::BroadcastWithStride {
            stride_i += 1;
            continue;
        }
        let &root_ind = index_map.get(&root_id).ok_or(LoweringError::MissingIndex {
            tensor: tv,
            axis: root_id,
        })?;

        if i == root_dom.len() - 1 && inner_most_dim_contig {
            strided_inds.push(root_ind);
        } else if fusion.val(root_ind).is_zero_int() {
            stride_i += 1;
        } else {
            let stride =
                fusion.named_scalar(format!("T{tensor_name}.stride[{stride_i}]"), DataType::Int);
            stride_i += 1;
            let term = fusion.mul(root_ind, stride);
            strided_inds.push(term);
        }
    }

    if strided_inds.is_empty() {
        strided_inds.push(fusion.zero());
    }
    Ok(new_tensor_index(fusion, tv, strided_inds))
}

/// Scratchpad tensors: strides are products of the inherited extents of the
/// more-inner non-broadcast, non-reduction axes.
fn strided_scratchpad_index(
    fusion: &mut Fusion,
    tv: ValId,
    root_dom: &[ValId],
    index_map: &HashMap<ValId, ValId>,
    extent_map: &HashMap<ValId, ValId>,
) -> Result<ValId, LoweringError> {
    let mut strided_inds: Vec<ValId> = Vec::new();
    for (i, &root_id) in root_dom.iter().enumerate() {
        let dom = fusion.iter_domain(root_id).clone();
        if dom.is_reduction() || dom.is_broadcast() {
            continue;
        }
        let &root_ind = index_map.get(&root_id).ok_or(LoweringError::MissingIndex {
            tensor: tv,
            axis: root_id,
        })?;
        if fusion.val(root_ind).is_zero_int() {
            continue;
        }

        let mut stride: Option<ValId> = None;
        for &inner_id in &root_dom[i + 1..] {
            let inner_dom = fusion.iter_domain(inner_id).clone();
            if inner_dom.is_broadcast() || inner_dom.is_reduction() {
                continue;
            }
            let inner_ind = index_map.get(&inner_id).copied();
            let inner_ext = extent_map
                .get(&inner_id)
                .copied()
                .unwrap_or(inner_dom.extent);
            let inner_is_zero = inner_ind.is_some_and(|ind| fusion.val(ind).is_zero_int());
            if !inner_is_zero {
                stride = Some(match stride {
                    Some(s) => fusion.mul(s, inner_ext),
                    None => inner_ext,
                });
            }
        }

        match stride {
            Some(s) => {
                let term = fusion.mul(root_ind, s);
                strided_inds.push(term);
            }
            None => strided_inds.push(root_ind),
        }
    }

    if strided_inds.is_empty() {
        strided_inds.push(fusion.zero());
    }
    Ok(new_tensor_index(fusion, tv, strided_inds))
}
