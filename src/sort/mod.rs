//! Expression Sorting
//!
//! Orders the fusion's tensor expressions so that a single linear walk can
//! emit correctly nested loops: each expression ends up inside exactly the
//! loops demanded by its computeAt prefix.
//!
//! The strategy is agglomerative grouping over the expression DAG. Each
//! expression starts as a singleton group carrying its output's shared-loop
//! axes as a stack. Neighboring groups merge when their innermost loops
//! agree under the loop equivalence map and the merge keeps the group graph
//! acyclic (the level criterion of the multilevel acyclic-partitioning
//! result the original segmenter is built on). When no merge applies, each
//! group whose deepest loop is not shared with any neighbor pops it, and
//! grouping resumes, until the groups are disjoint and stable.
//!
//! Ties between equally legal merges resolve by declaration order: groups
//! and candidate lists are visited in creation order.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::compute_at::ComputeAtMap;
use crate::ir::{ExprId, Fusion, ValId};

type GroupId = usize;
type EdgeId = usize;

#[derive(Debug, Clone)]
struct Edge {
    from: GroupId,
    to: GroupId,
    alive: bool,
}

#[derive(Debug, Clone, Default)]
struct Group {
    exprs: Vec<ExprId>,
    /// Shared-loop axes this group currently sits inside
    ca_domains: Vec<ValId>,
    producer_edges: Vec<EdgeId>,
    consumer_edges: Vec<EdgeId>,
    alive: bool,

    // Stateful traversal info
    level: i64,
    visited: bool,
    merge_with: Option<GroupId>,
    merged: bool,
}

/// Sort the fusion's tensor expressions by computeAt loop structure.
pub fn sort_exprs(fusion: &Fusion, ca_map: &ComputeAtMap) -> Vec<ExprId> {
    let exprs = fusion.tensor_exprs();
    if exprs.len() <= 1 {
        return exprs;
    }
    let mut sorter = ExprSorter::new(fusion, ca_map, &exprs);
    sorter.segment();
    sorter.flatten()
}

struct ExprSorter<'a> {
    fusion: &'a Fusion,
    ca_map: &'a ComputeAtMap,
    groups: Vec<Group>,
    edges: Vec<Edge>,
}

impl<'a> ExprSorter<'a> {
    fn new(fusion: &'a Fusion, ca_map: &'a ComputeAtMap, exprs: &[ExprId]) -> Self {
        let mut sorter = ExprSorter { fusion, ca_map, groups: Vec::new(), edges: Vec::new() };

        let mut expr2group: HashMap<ExprId, GroupId> = HashMap::new();
        for &expr in exprs {
            let group_id = sorter.make_group(expr);
            expr2group.insert(expr, group_id);
        }

        // Edges between groups follow value definitions.
        for &expr in exprs {
            let to = expr2group[&expr];
            for &inp in fusion.expr(expr).inputs() {
                if fusion.is_input(inp) {
                    continue;
                }
                let Some(def) = fusion.val(inp).definition() else { continue };
                let Some(&from) = expr2group.get(&def) else { continue };
                sorter.add_edge(from, to);
            }
        }
        sorter
    }

    fn make_group(&mut self, expr: ExprId) -> GroupId {
        let out_tv = self.fusion.expr(expr).output();
        let mut ca_domains = Vec::new();
        if self.fusion.val(out_tv).is_tensor_view() {
            let domain = self.fusion.tv_current_domain(out_tv);
            let produce_pos = self.fusion.produced_at(out_tv).min(domain.len());
            ca_domains.extend_from_slice(&domain[..produce_pos]);
        }
        self.groups.push(Group {
            exprs: vec![expr],
            ca_domains,
            alive: true,
            ..Group::default()
        });
        self.groups.len() - 1
    }

    fn add_edge(&mut self, from: GroupId, to: GroupId) {
        let id = self.edges.len();
        self.edges.push(Edge { from, to, alive: true });
        self.groups[from].consumer_edges.push(id);
        self.groups[to].producer_edges.push(id);
    }

    fn neighbors(&self, group: GroupId) -> Vec<GroupId> {
        let mut out = Vec::new();
        for &e in &self.groups[group].producer_edges {
            if self.edges[e].alive {
                out.push(self.edges[e].from);
            }
        }
        for &e in &self.groups[group].consumer_edges {
            if self.edges[e].alive {
                out.push(self.edges[e].to);
            }
        }
        out
    }

    // --------------------------------------------------------------
    // Level computation (DAG-safety criterion)
    // --------------------------------------------------------------

    fn reset_levels(&mut self) {
        let mut to_visit: VecDeque<GroupId> = VecDeque::new();
        let edges = &self.edges;
        for (id, group) in self.groups.iter_mut().enumerate() {
            if !group.alive {
                continue;
            }
            group.visited = false;
            group.level = 0;
            group.merge_with = None;
            group.merged = false;
            if group.producer_edges.iter().all(|&e| !edges[e].alive) {
                to_visit.push_back(id);
            }
        }

        while let Some(visit) = to_visit.pop_front() {
            if self.groups[visit].visited {
                continue;
            }
            let ready = self.groups[visit]
                .producer_edges
                .iter()
                .filter(|&&e| self.edges[e].alive)
                .all(|&e| self.groups[self.edges[e].from].visited);
            if !ready {
                to_visit.push_back(visit);
                continue;
            }
            self.groups[visit].visited = true;
            let mut level = 0;
            for &e in &self.groups[visit].producer_edges {
                if self.edges[e].alive {
                    level = level.max(self.groups[self.edges[e].from].level + 1);
                }
            }
            self.groups[visit].level = level;
            for &e in &self.groups[visit].consumer_edges.clone() {
                if self.edges[e].alive {
                    to_visit.push_back(self.edges[e].to);
                }
            }
        }
    }

    /// Neighbors this group could merge with while keeping the group graph
    /// a DAG: only neighbors within one level, avoiding interference from
    /// already-merged neighbors.
    fn merge_candidates(&self, group: GroupId) -> Vec<GroupId> {
        if self.groups[group].merged {
            return Vec::new();
        }
        let neighbors = self.neighbors(group);
        let my_level = self.groups[group].level;

        for &n in &neighbors {
            if !self.groups[n].merged {
                continue;
            }
            if (self.groups[n].level - my_level).abs() <= 1 {
                return Vec::new();
            }
            if let Some(mw) = self.groups[n].merge_with {
                if (self.groups[mw].level - my_level).abs() <= 1 {
                    return Vec::new();
                }
            }
        }

        let mut can_merge = vec![true; neighbors.len()];
        for (i, &n) in neighbors.iter().enumerate() {
            if (self.groups[n].level - my_level).abs() > 1 {
                can_merge[i] = false;
                continue;
            }
            for nn in self.neighbors(n) {
                if nn == n || !self.groups[nn].merged {
                    continue;
                }
                let nn_level = self.groups[nn].level;
                if (nn_level - my_level).abs() <= 1
                    || (nn_level - self.groups[n].level).abs() <= 1
                {
                    can_merge[i] = false;
                    break;
                }
                if let Some(mw) = self.groups[nn].merge_with {
                    let mw_level = self.groups[mw].level;
                    if (mw_level - my_level).abs() <= 1
                        || (mw_level - self.groups[n].level).abs() <= 1
                    {
                        can_merge[i] = false;
                        break;
                    }
                }
            }
        }

        neighbors
            .into_iter()
            .zip(can_merge)
            .filter_map(|(n, ok)| ok.then_some(n))
            .collect()
    }

    /// Two groups may fuse when their innermost current loops agree under
    /// the loop map (or both have no loops at all).
    fn supported_merge(&self, a: GroupId, b: GroupId) -> bool {
        let da = &self.groups[a].ca_domains;
        let db = &self.groups[b].ca_domains;
        match (da.last(), db.last()) {
            (None, None) => true,
            (Some(&la), Some(&lb)) => self.ca_map.are_mapped(la, lb),
            _ => false,
        }
    }

    // --------------------------------------------------------------
    // Merging
    // --------------------------------------------------------------

    fn merge_pair(&mut self, a: GroupId, b: GroupId) -> GroupId {
        // Keep expressions in topological order: producer group first.
        let a_produces_b = self.groups[a]
            .consumer_edges
            .iter()
            .any(|&e| self.edges[e].alive && self.edges[e].to == b);
        let (producer, consumer) = if a_produces_b { (a, b) } else { (b, a) };

        let merged_ca = self.merge_ca_domains(producer, consumer);

        let mut exprs = self.groups[producer].exprs.clone();
        exprs.extend(self.groups[consumer].exprs.iter().copied());

        let new_id = self.groups.len();
        self.groups.push(Group {
            exprs,
            ca_domains: merged_ca,
            alive: true,
            ..Group::default()
        });

        // Rewire surviving edges onto the joined group.
        let mut new_producers: Vec<GroupId> = Vec::new();
        let mut new_consumers: Vec<GroupId> = Vec::new();
        for &g in &[producer, consumer] {
            for &e in &self.groups[g].producer_edges.clone() {
                if !self.edges[e].alive {
                    continue;
                }
                let from = self.edges[e].from;
                self.edges[e].alive = false;
                if from != producer && from != consumer && !new_producers.contains(&from) {
                    new_producers.push(from);
                }
            }
            for &e in &self.groups[g].consumer_edges.clone() {
                if !self.edges[e].alive {
                    continue;
                }
                let to = self.edges[e].to;
                self.edges[e].alive = false;
                if to != producer && to != consumer && !new_consumers.contains(&to) {
                    new_consumers.push(to);
                }
            }
            self.groups[g].alive = false;
        }
        for from in new_producers {
            self.add_edge(from, new_id);
        }
        for to in new_consumers {
            self.add_edge(new_id, to);
        }
        new_id
    }

    /// Zipper the two loop stacks, preferring pairs the loop map equates
    /// and keeping unmatched axes in their relative order.
    fn merge_ca_domains(&self, a: GroupId, b: GroupId) -> Vec<ValId> {
        let da = self.groups[a].ca_domains.clone();
        let db = self.groups[b].ca_domains.clone();
        let mut result = Vec::new();
        let mut i = 0;
        let mut j = 0;
        while i < da.len() || j < db.len() {
            if i == da.len() {
                result.push(db[j]);
                j += 1;
            } else if j == db.len() {
                result.push(da[i]);
                i += 1;
            } else if self.ca_map.are_mapped(da[i], db[j]) {
                result.push(da[i]);
                i += 1;
                j += 1;
            } else if da[i + 1..].iter().any(|&x| self.ca_map.are_mapped(x, db[j])) {
                result.push(da[i]);
                i += 1;
            } else if db[j + 1..].iter().any(|&x| self.ca_map.are_mapped(x, da[i])) {
                result.push(db[j]);
                j += 1;
            } else {
                result.push(da[i]);
                result.push(db[j]);
                i += 1;
                j += 1;
            }
        }
        result
    }

    // --------------------------------------------------------------
    // Driver
    // --------------------------------------------------------------

    fn segment(&mut self) {
        let mut n_groups = self.alive_count();
        loop {
            // Merge until no neighboring pair is mergeable.
            loop {
                self.reset_levels();
                let mut to_merge: Vec<(GroupId, GroupId)> = Vec::new();
                let group_order: Vec<GroupId> = (0..self.groups.len())
                    .filter(|&g| self.groups[g].alive)
                    .collect();
                for g in group_order {
                    if self.groups[g].merged {
                        continue;
                    }
                    let candidates = self.merge_candidates(g);
                    let Some(&candidate) = candidates
                        .iter()
                        .find(|&&c| !self.groups[c].merged && self.supported_merge(g, c))
                    else {
                        continue;
                    };
                    self.groups[g].merged = true;
                    self.groups[g].merge_with = Some(candidate);
                    self.groups[candidate].merged = true;
                    self.groups[candidate].merge_with = Some(g);
                    to_merge.push((g, candidate));
                }
                if to_merge.is_empty() {
                    break;
                }
                for (a, b) in to_merge {
                    let joined = self.merge_pair(a, b);
                    trace!(group = joined, "merged expression groups");
                }
            }

            // Pop the deepest loop from groups whose innermost loop no
            // neighbor shares, and try again.
            let mut lowered = false;
            for g in 0..self.groups.len() {
                if !self.groups[g].alive {
                    continue;
                }
                let Some(&last) = self.groups[g].ca_domains.last() else { continue };
                let has_matching_neighbor = self.neighbors(g).iter().any(|&n| {
                    self.groups[n]
                        .ca_domains
                        .iter()
                        .any(|&id| self.ca_map.are_mapped(id, last))
                });
                if !has_matching_neighbor {
                    self.groups[g].ca_domains.pop();
                    lowered = true;
                }
            }

            let current = self.alive_count();
            if !lowered && current == n_groups {
                debug_assert!(
                    self.all_disconnected(),
                    "expression sorting could not flatten connected groups"
                );
                break;
            }
            n_groups = current;
        }
    }

    fn alive_count(&self) -> usize {
        self.groups.iter().filter(|g| g.alive).count()
    }

    fn all_disconnected(&self) -> bool {
        self.groups.iter().enumerate().all(|(i, g)| {
            !g.alive || self.neighbors(i).is_empty()
        })
    }

    /// Flatten surviving groups in creation order.
    fn flatten(&self) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut seen: HashSet<ExprId> = HashSet::new();
        for group in self.groups.iter().filter(|g| g.alive) {
            for &expr in &group.exprs {
                if seen.insert(expr) {
                    out.push(expr);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_at::compute_at;
    use crate::types::DataType;

    fn positions(_fusion: &Fusion, order: &[ExprId]) -> HashMap<ExprId, usize> {
        order.iter().enumerate().map(|(i, &e)| (e, i)).collect()
    }

    #[test]
    fn test_sort_respects_dependencies() {
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[16]);
        let one = fusion.new_float(1.0);
        let tv1 = fusion.add(tv0, one);
        let two = fusion.new_float(2.0);
        let tv2 = fusion.mul(tv1, two);
        fusion.add_input(tv0);
        fusion.add_output(tv2);

        let ca_map = ComputeAtMap::build(&fusion);
        let order = sort_exprs(&fusion, &ca_map);
        assert_eq!(order.len(), 2);
        let pos = positions(&fusion, &order);
        let def1 = fusion.val(tv1).definition().expect("defined");
        let def2 = fusion.val(tv2).definition().expect("defined");
        assert!(pos[&def1] < pos[&def2]);
    }

    #[test]
    fn test_sort_groups_shared_loop_exprs_adjacent() {
        // Two independent chains into one output: expressions sharing the
        // fused loop end up contiguous, dependencies preserved.
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[129, 127]);
        let tv1 = fusion.new_contiguous_tensor(DataType::Float, &[129, 127]);
        let two = fusion.new_float(2.0);
        let tv3 = fusion.add(tv1, two);
        let tv4 = fusion.add(tv0, tv3);
        fusion.add_input(tv0);
        fusion.add_input(tv1);
        fusion.add_output(tv4);

        fusion.merge(tv4, 0).expect("merge");
        fusion.split(tv4, 0, 128).expect("split");
        compute_at(&mut fusion, tv3, tv4, 1).expect("computeAt");

        let ca_map = ComputeAtMap::build(&fusion);
        let order = sort_exprs(&fusion, &ca_map);
        assert_eq!(order.len(), 2);
        let pos = positions(&fusion, &order);
        let def3 = fusion.val(tv3).definition().expect("defined");
        let def4 = fusion.val(tv4).definition().expect("defined");
        assert!(pos[&def3] < pos[&def4]);
    }

    #[test]
    fn test_sort_visits_each_expr_once() {
        let mut fusion = Fusion::new();
        let tv0 = fusion.new_contiguous_tensor(DataType::Float, &[16]);
        let half = fusion.new_float(0.5);
        let tv1 = fusion.mul(tv0, half);
        let neg1 = fusion.new_float(-1.0);
        let tv2 = fusion.mul(tv1, neg1);
        let neg2 = fusion.new_float(-2.0);
        let tv3 = fusion.mul(tv1, neg2);
        fusion.add_input(tv0);
        fusion.add_output(tv2);
        fusion.add_output(tv3);
        compute_at(&mut fusion, tv1, tv3, 1).expect("computeAt");

        let ca_map = ComputeAtMap::build(&fusion);
        let order = sort_exprs(&fusion, &ca_map);
        assert_eq!(order.len(), 3);
        let unique: HashSet<ExprId> = order.iter().copied().collect();
        assert_eq!(unique.len(), 3);
        // tv1 comes before both consumers.
        let pos = positions(&fusion, &order);
        let def1 = fusion.val(tv1).definition().expect("defined");
        let def2 = fusion.val(tv2).definition().expect("defined");
        let def3 = fusion.val(tv3).definition().expect("defined");
        assert!(pos[&def1] < pos[&def2]);
        assert!(pos[&def1] < pos[&def3]);
    }
}
