//! Fusion Container
//!
//! A `Fusion` is the single-owner arena for one subgraph under
//! transformation. It owns every `Val` and `Expr` by value, hands out index
//! handles, assigns monotonically increasing names, and answers dependency
//! queries over the DAG.
//!
//! Registration order is a topological order: an expression can only
//! reference values that already exist, so iterating expressions in
//! registration order always visits an expression after its inputs'
//! definitions. Reachability filtering on top of that order yields the
//! from-outputs-only view.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::ir::node::{
    ComputeAtLink, Expr, ExprId, ExprKind, IterDomain, TensorDomain, TensorView, Val, ValId,
    ValKind,
};
use crate::types::{DataType, LaunchConfigType, MemoryType};

/// Owning arena for one fusion subgraph.
#[derive(Debug, Default, Clone)]
pub struct Fusion {
    vals: Vec<Val>,
    exprs: Vec<Expr>,
    inputs: Vec<ValId>,
    outputs: Vec<ValId>,
    launch_config: HashMap<LaunchConfigType, ValId>,
    detached: HashSet<ExprId>,
    val_name_counter: u64,
    expr_name_counter: u64,
}

impl Fusion {
    pub fn new() -> Self {
        Fusion::default()
    }

    /// Drop all nodes and reset the name counters.
    pub fn clear(&mut self) {
        self.vals.clear();
        self.exprs.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.launch_config.clear();
        self.detached.clear();
        self.val_name_counter = 0;
        self.expr_name_counter = 0;
    }

    /// Move the fusion out, leaving `self` in a valid empty state.
    pub fn take(&mut self) -> Fusion {
        std::mem::take(self)
    }

    /// Deep copy: a structurally identical graph with its own (freshly
    /// restarted, hence equal) name sequence. Handles of the copy index the
    /// copy's arena only.
    pub fn deep_copy(&self) -> Fusion {
        // Pass 1 would allocate parallel nodes and pass 2 rewire them; with
        // index handles the old->new map is the identity, so a single
        // element-wise copy covers both passes.
        self.clone()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a new value and return its handle.
    pub fn register_val(&mut self, dtype: DataType, kind: ValKind) -> ValId {
        let id = ValId(self.vals.len() as u32);
        self.vals.push(Val {
            name: self.val_name_counter,
            dtype,
            kind,
            definition: None,
            uses: Vec::new(),
        });
        self.val_name_counter += 1;
        id
    }

    /// Register a new expression, wiring the back-references: each output's
    /// definition becomes this expression, each input records the use.
    ///
    /// A value has at most one defining expression; registering a second
    /// definition is a programming error in the caller.
    pub fn register_expr(
        &mut self,
        kind: ExprKind,
        inputs: Vec<ValId>,
        outputs: Vec<ValId>,
    ) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        for &out in &outputs {
            let val = &mut self.vals[out.index()];
            assert!(
                val.definition.is_none(),
                "value {out} already has a defining expression"
            );
            val.definition = Some(id);
        }
        for &inp in &inputs {
            let val = &mut self.vals[inp.index()];
            if !val.uses.contains(&id) {
                val.uses.push(id);
            }
        }
        self.exprs.push(Expr {
            name: self.expr_name_counter,
            kind,
            inputs,
            outputs,
        });
        self.expr_name_counter += 1;
        id
    }

    /// Unlink an expression from the DAG: its outputs lose their definition
    /// and its inputs drop the use. The node stays in the arena (handles
    /// remain valid) but no traversal visits it again. Used when a
    /// transformation rewrites a tensor's producing expression (rFactor).
    pub fn detach_expr(&mut self, expr: ExprId) {
        let (inputs, outputs) = {
            let e = &self.exprs[expr.index()];
            (e.inputs.clone(), e.outputs.clone())
        };
        for out in outputs {
            self.vals[out.index()].definition = None;
        }
        for inp in inputs {
            self.vals[inp.index()].uses.retain(|&e| e != expr);
        }
        self.detached.insert(expr);
    }

    pub fn is_detached(&self, expr: ExprId) -> bool {
        self.detached.contains(&expr)
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    pub fn val(&self, id: ValId) -> &Val {
        &self.vals[id.index()]
    }

    pub fn val_mut(&mut self, id: ValId) -> &mut Val {
        &mut self.vals[id.index()]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.index()]
    }

    pub fn num_vals(&self) -> usize {
        self.vals.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    /// All value handles in registration order.
    pub fn vals(&self) -> impl Iterator<Item = ValId> + '_ {
        (0..self.vals.len() as u32).map(ValId)
    }

    // ------------------------------------------------------------------
    // Inputs / outputs
    // ------------------------------------------------------------------

    /// Mark a value as a fusion input. Inputs have no defining expression.
    pub fn add_input(&mut self, val: ValId) {
        assert!(
            self.vals[val.index()].definition.is_none(),
            "fusion input {val} must not have a definition"
        );
        if !self.inputs.contains(&val) {
            self.inputs.push(val);
        }
    }

    /// Mark a value as a fusion output. Adding an output can expose
    /// transitively-reachable expressions that were dormant.
    pub fn add_output(&mut self, val: ValId) {
        if !self.outputs.contains(&val) {
            self.outputs.push(val);
        }
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.outputs
    }

    pub fn is_input(&self, val: ValId) -> bool {
        self.inputs.contains(&val)
    }

    pub fn is_output(&self, val: ValId) -> bool {
        self.outputs.contains(&val)
    }

    // ------------------------------------------------------------------
    // Topological iteration
    // ------------------------------------------------------------------

    /// Every live expression in dependency order (inputs before uses).
    pub fn exprs(&self) -> Vec<ExprId> {
        (0..self.exprs.len() as u32)
            .map(ExprId)
            .filter(|e| !self.detached.contains(e))
            .collect()
    }

    /// Expressions reachable backward from the fusion outputs, in dependency
    /// order.
    pub fn exprs_from_outputs(&self) -> Vec<ExprId> {
        self.exprs_reachable_from(&self.outputs)
    }

    /// Expressions reachable backward from `seeds`, in dependency order.
    pub fn exprs_reachable_from(&self, seeds: &[ValId]) -> Vec<ExprId> {
        let mut reachable: HashSet<ExprId> = HashSet::new();
        let mut stack: Vec<ValId> = seeds.to_vec();
        let mut seen_vals: HashSet<ValId> = HashSet::new();
        while let Some(val) = stack.pop() {
            if !seen_vals.insert(val) {
                continue;
            }
            if let Some(def) = self.vals[val.index()].definition {
                if reachable.insert(def) {
                    for &inp in self.exprs[def.index()].inputs() {
                        stack.push(inp);
                    }
                }
            }
        }
        let mut order: Vec<ExprId> = reachable.into_iter().collect();
        order.sort_unstable();
        order
    }

    /// Math expressions (tensor-view producing, from the fusion outputs) in
    /// dependency order, skipping domain transformations.
    pub fn tensor_exprs(&self) -> Vec<ExprId> {
        self.exprs_from_outputs()
            .into_iter()
            .filter(|&e| {
                let expr = self.expr(e);
                !expr.is_domain_transform() && self.val(expr.output()).is_tensor_view()
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Dependency queries
    // ------------------------------------------------------------------

    /// True iff a directed path of expressions leads `a` to `b`.
    pub fn is_dependency_of(&self, a: ValId, b: ValId) -> bool {
        if a == b {
            return false;
        }
        let mut stack = vec![b];
        let mut seen: HashSet<ValId> = HashSet::new();
        while let Some(v) = stack.pop() {
            if !seen.insert(v) {
                continue;
            }
            if let Some(def) = self.vals[v.index()].definition {
                for &inp in self.exprs[def.index()].inputs() {
                    if inp == a {
                        return true;
                    }
                    stack.push(inp);
                }
            }
        }
        false
    }

    /// One dependency chain from `a` to `b` (ordered from `a` to `b`), if
    /// any exists.
    pub fn single_dependency_chain(&self, a: ValId, b: ValId) -> Option<Vec<ValId>> {
        // BFS backward from b, remembering the first predecessor of each val.
        let mut prev: HashMap<ValId, ValId> = HashMap::new();
        let mut queue = VecDeque::from([b]);
        let mut seen: HashSet<ValId> = HashSet::from([b]);
        while let Some(v) = queue.pop_front() {
            if v == a {
                let mut chain = vec![a];
                let mut cur = a;
                while let Some(&next) = prev.get(&cur) {
                    chain.push(next);
                    cur = next;
                }
                return Some(chain);
            }
            if let Some(def) = self.vals[v.index()].definition {
                for &inp in self.exprs[def.index()].inputs() {
                    if seen.insert(inp) {
                        prev.insert(inp, v);
                        queue.push_back(inp);
                    }
                }
            }
        }
        None
    }

    /// All dependency chains from `a` to `b` (each ordered from `a` to `b`).
    pub fn dependency_chains(&self, a: ValId, b: ValId) -> Vec<Vec<ValId>> {
        let mut chains = Vec::new();
        let mut path = vec![a];
        self.collect_chains_forward(a, b, &mut path, &mut chains);
        chains
    }

    fn collect_chains_forward(
        &self,
        cur: ValId,
        target: ValId,
        path: &mut Vec<ValId>,
        chains: &mut Vec<Vec<ValId>>,
    ) {
        if cur == target {
            chains.push(path.clone());
            return;
        }
        for &use_expr in self.vals[cur.index()].uses() {
            for &out in self.exprs[use_expr.index()].outputs() {
                path.push(out);
                self.collect_chains_forward(out, target, path, chains);
                path.pop();
            }
        }
    }

    /// All use chains from `from` to terminating values (values without
    /// uses), each ordered from `from` outward.
    pub fn all_use_chains(&self, from: ValId) -> Vec<Vec<ValId>> {
        let mut chains = Vec::new();
        let mut path = vec![from];
        self.collect_use_chains(from, &mut path, &mut chains);
        chains
    }

    fn collect_use_chains(
        &self,
        cur: ValId,
        path: &mut Vec<ValId>,
        chains: &mut Vec<Vec<ValId>>,
    ) {
        let uses = self.vals[cur.index()].uses().to_vec();
        let math_uses: Vec<ExprId> = uses
            .into_iter()
            .filter(|&e| !self.exprs[e.index()].is_domain_transform())
            .collect();
        if math_uses.is_empty() {
            chains.push(path.clone());
            return;
        }
        for use_expr in math_uses {
            for &out in self.exprs[use_expr.index()].outputs() {
                path.push(out);
                self.collect_use_chains(out, path, chains);
                path.pop();
            }
        }
    }

    /// The fusion inputs that reach `val` through any path.
    pub fn inputs_of(&self, val: ValId) -> Vec<ValId> {
        let mut found = Vec::new();
        let mut stack = vec![val];
        let mut seen: HashSet<ValId> = HashSet::new();
        while let Some(v) = stack.pop() {
            if !seen.insert(v) {
                continue;
            }
            if self.is_input(v) {
                found.push(v);
                continue;
            }
            if let Some(def) = self.vals[v.index()].definition {
                stack.extend(self.exprs[def.index()].inputs().iter().copied());
            }
        }
        found.sort_unstable();
        found
    }

    // ------------------------------------------------------------------
    // Whole-graph predicates
    // ------------------------------------------------------------------

    /// Any reduction expression reachable from the outputs.
    pub fn has_reduction(&self) -> bool {
        self.exprs_from_outputs()
            .iter()
            .any(|&e| matches!(self.expr(e).kind(), ExprKind::Reduction { .. }))
    }

    /// Any RNG op reachable from the outputs.
    pub fn has_rng(&self) -> bool {
        use crate::types::UnaryOpKind;
        self.exprs_from_outputs().iter().any(|&e| {
            matches!(
                self.expr(e).kind(),
                ExprKind::Unary { op: UnaryOpKind::RandLike }
            )
        })
    }

    /// Any reduction whose reduction axes are grid-parallel.
    pub fn has_grid_reduction(&self) -> bool {
        self.exprs_from_outputs().iter().any(|&e| {
            let expr = self.expr(e);
            if !matches!(expr.kind(), ExprKind::Reduction { .. }) {
                return false;
            }
            let out = expr.output();
            self.tv_current_domain(out).iter().any(|&id| {
                let dom = self.iter_domain(id);
                dom.is_reduction() && dom.is_block_dim()
            })
        })
    }

    // ------------------------------------------------------------------
    // Launch configuration
    // ------------------------------------------------------------------

    /// Stash a launch-config slot, overriding any previous value.
    pub fn set_launch_config(&mut self, slot: LaunchConfigType, val: ValId) {
        self.launch_config.insert(slot, val);
    }

    pub fn launch_config(&self, slot: LaunchConfigType) -> Option<ValId> {
        self.launch_config.get(&slot).copied()
    }

    // ------------------------------------------------------------------
    // Iteration / tensor domain helpers
    // ------------------------------------------------------------------

    /// The `IterDomain` payload of a value. Panics if `id` is not an
    /// iteration domain; callers hold that invariant structurally.
    pub fn iter_domain(&self, id: ValId) -> &IterDomain {
        self.vals[id.index()]
            .as_iter_domain()
            .unwrap_or_else(|| panic!("{id} is not an IterDomain"))
    }

    pub fn iter_domain_mut(&mut self, id: ValId) -> &mut IterDomain {
        match &mut self.vals[id.index()].kind {
            ValKind::IterDomain(dom) => dom,
            _ => panic!("{id} is not an IterDomain"),
        }
    }

    pub fn tensor_domain(&self, id: ValId) -> &TensorDomain {
        self.vals[id.index()]
            .as_tensor_domain()
            .unwrap_or_else(|| panic!("{id} is not a TensorDomain"))
    }

    pub fn tensor_domain_mut(&mut self, id: ValId) -> &mut TensorDomain {
        match &mut self.vals[id.index()].kind {
            ValKind::TensorDomain(td) => td,
            _ => panic!("{id} is not a TensorDomain"),
        }
    }

    pub fn tensor_view(&self, tv: ValId) -> &TensorView {
        self.vals[tv.index()]
            .as_tensor_view()
            .unwrap_or_else(|| panic!("{tv} is not a TensorView"))
    }

    pub fn tensor_view_mut(&mut self, tv: ValId) -> &mut TensorView {
        match &mut self.vals[tv.index()].kind {
            ValKind::TensorView(view) => view,
            _ => panic!("{tv} is not a TensorView"),
        }
    }

    /// The `TensorDomain` backing a tensor view.
    pub fn tv_domain(&self, tv: ValId) -> &TensorDomain {
        self.tensor_domain(self.tensor_view(tv).domain)
    }

    pub fn tv_n_dims(&self, tv: ValId) -> usize {
        self.tv_domain(tv).n_dims()
    }

    /// Current-domain axes of a tensor view (cloned handle list).
    pub fn tv_current_domain(&self, tv: ValId) -> Vec<ValId> {
        self.tv_domain(tv).domain.clone()
    }

    /// Root axes of a tensor view.
    pub fn tv_root(&self, tv: ValId) -> Vec<ValId> {
        self.tv_domain(tv).root.clone()
    }

    /// Rfactor axes when present, root axes otherwise.
    pub fn tv_maybe_rfactor(&self, tv: ValId) -> Vec<ValId> {
        self.tv_domain(tv).maybe_rfactor().to_vec()
    }

    /// Current-domain axis `i` of a tensor view; negative values wrap.
    pub fn tv_axis(&self, tv: ValId, i: isize) -> ValId {
        let domain = &self.tv_domain(tv).domain;
        let n = domain.len() as isize;
        let idx = if i < 0 { i + n } else { i };
        assert!(idx >= 0 && idx < n, "axis {i} out of range for rank {n}");
        domain[idx as usize]
    }

    pub fn tv_memory(&self, tv: ValId) -> MemoryType {
        self.tensor_view(tv).memory
    }

    pub fn tv_set_memory(&mut self, tv: ValId, memory: MemoryType) {
        self.tensor_view_mut(tv).memory = memory;
    }

    pub fn tv_compute_at(&self, tv: ValId) -> Option<ComputeAtLink> {
        self.tensor_view(tv).compute_at
    }

    /// The largest prefix of `tv`'s axes bound into a shared loop nest
    /// (with its computeAt target, or with a producer computed into it).
    /// Non-decreasing over the life of a scheduling session.
    pub fn produced_at(&self, tv: ValId) -> usize {
        self.tensor_view(tv).this_compute_at_pos
    }

    /// Axes of `ids` that are not reductions.
    pub fn no_reductions(&self, ids: &[ValId]) -> Vec<ValId> {
        ids.iter()
            .copied()
            .filter(|&id| !self.iter_domain(id).is_reduction())
            .collect()
    }

    /// Axes of `ids` that are not broadcasts.
    pub fn no_broadcasts(&self, ids: &[ValId]) -> Vec<ValId> {
        ids.iter()
            .copied()
            .filter(|&id| !self.iter_domain(id).is_broadcast())
            .collect()
    }
}
