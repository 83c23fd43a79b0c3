//! Root Domain Map
//!
//! The equivalence relation "these two root iteration domains denote the
//! same loop", built as a fixed point over pairwise producer-consumer
//! relationships across the whole fusion.
//!
//! Broadcast domains are tracked per concretization: a broadcast axis
//! acquires the concrete axes it maps to downstream, and equivalence
//! queries on a broadcast fan out over its concretized keys. A broadcast
//! that never meets a concrete partner names itself as its concrete id.
//!
//! Before two candidate domains commit to one equivalence class the builder
//! checks that (a) no two distinct domains of the same tensor would
//! collide, and (b) no reduction output would end up mapped to an unrelated
//! consumer axis, which would require recomputing the reduction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

use crate::ir::{ExprKind, Fusion, ValId};

/// Mapping errors surfaced by root-domain-map queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// Mapping this domain would require recomputing its source tensor
    #[error("root domain {id} of tensor domain {td} cannot be mapped without recomputation")]
    Unmappable { td: ValId, id: ValId },

    /// The two tensors are not a producer-consumer pair
    #[error("tensors {producer} and {consumer} are not a producer-consumer pair")]
    NotProducerConsumer { producer: ValId, consumer: ValId },
}

// ----------------------------------------------------------------------
// Disjoint set
// ----------------------------------------------------------------------

/// A simple union-find over hashable keys. Queries work on `&self`; join
/// trees stay shallow for the workloads here, so no path compression.
#[derive(Debug, Clone)]
pub struct DisjointSet<T: Clone + Eq + Hash> {
    parent: HashMap<T, T>,
}

impl<T: Clone + Eq + Hash> Default for DisjointSet<T> {
    fn default() -> Self {
        DisjointSet { parent: HashMap::new() }
    }
}

impl<T: Clone + Eq + Hash> DisjointSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.parent.clear();
    }

    fn find(&self, x: &T) -> T {
        let mut cur = x.clone();
        while let Some(next) = self.parent.get(&cur) {
            if *next == cur {
                break;
            }
            cur = next.clone();
        }
        cur
    }

    pub fn join(&mut self, a: &T, b: &T) {
        self.parent.entry(a.clone()).or_insert_with(|| a.clone());
        self.parent.entry(b.clone()).or_insert_with(|| b.clone());
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    pub fn are_equivalent(&self, a: &T, b: &T) -> bool {
        self.find(a) == self.find(b)
    }

    pub fn all_elements(&self) -> Vec<T> {
        self.parent.keys().cloned().collect()
    }
}

// ----------------------------------------------------------------------
// Domain keys
// ----------------------------------------------------------------------

/// A (TensorDomain, IterDomain) pair, optionally refined by the concrete
/// domain a broadcast axis is viewed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainKey {
    pub td: ValId,
    pub id: ValId,
    pub concrete_id: Option<ValId>,
}

impl DomainKey {
    pub fn new(td: ValId, id: ValId) -> Self {
        DomainKey { td, id, concrete_id: None }
    }

    pub fn with_concrete(td: ValId, id: ValId, concrete_id: ValId) -> Self {
        DomainKey { td, id, concrete_id: Some(concrete_id) }
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.concrete_id {
            Some(c) => write!(f, "{{{}, {} ({})}}", self.td, self.id, c),
            None => write!(f, "{{{}, {}}}", self.td, self.id),
        }
    }
}

type DomainKeySet = BTreeSet<DomainKey>;

// ----------------------------------------------------------------------
// Pairwise map
// ----------------------------------------------------------------------

/// Positional root mapping between a direct producer-consumer pair.
///
/// Producer reduction axes are skipped (a consumer never sees them); new
/// consumer broadcast axes (per the broadcast op's flag mask) have no
/// producer counterpart.
#[derive(Debug, Clone)]
pub struct PairwiseRootDomainMap {
    producer_tv: ValId,
    consumer_tv: ValId,
    broadcast_flags: Vec<bool>,
}

impl PairwiseRootDomainMap {
    /// Build the map for a direct pair; errors when `producer` does not
    /// feed the expression defining `consumer`.
    pub fn new(fusion: &Fusion, producer: ValId, consumer: ValId) -> Result<Self, MappingError> {
        let def = fusion
            .val(consumer)
            .definition()
            .ok_or(MappingError::NotProducerConsumer { producer, consumer })?;
        let def_expr = fusion.expr(def);
        if !def_expr.inputs().contains(&producer) {
            return Err(MappingError::NotProducerConsumer { producer, consumer });
        }
        let broadcast_flags = match def_expr.kind() {
            ExprKind::Broadcast { is_new_axis } => is_new_axis.clone(),
            _ => vec![false; fusion.tv_root(consumer).len()],
        };
        Ok(PairwiseRootDomainMap { producer_tv: producer, consumer_tv: consumer, broadcast_flags })
    }

    /// Producer root axes → consumer root axes, restricted to
    /// `root_dims_to_map` (pass the full producer root for no filter).
    pub fn map_producer_to_consumer(
        &self,
        fusion: &Fusion,
        root_dims_to_map: &[ValId],
    ) -> HashMap<ValId, ValId> {
        self.map(fusion, root_dims_to_map, true)
    }

    /// Consumer root axes → producer root axes, restricted to
    /// `root_dims_to_map`.
    pub fn map_consumer_to_producer(
        &self,
        fusion: &Fusion,
        root_dims_to_map: &[ValId],
    ) -> HashMap<ValId, ValId> {
        self.map(fusion, root_dims_to_map, false)
    }

    fn map(
        &self,
        fusion: &Fusion,
        root_dims_to_map: &[ValId],
        producer_to_consumer: bool,
    ) -> HashMap<ValId, ValId> {
        let producer_root = fusion.tv_maybe_rfactor(self.producer_tv);
        let consumer_root = fusion.tv_root(self.consumer_tv);
        let mut dom_map = HashMap::new();
        let mut itp = 0;
        let mut itc = 0;
        while itc < consumer_root.len() && itp < producer_root.len() {
            let producer_id = producer_root[itp];
            let consumer_id = consumer_root[itc];
            if fusion.iter_domain(producer_id).is_reduction() {
                itp += 1;
                continue;
            }
            if self.broadcast_flags.get(itc).copied().unwrap_or(false) {
                itc += 1;
                continue;
            }
            let (key, value) = if producer_to_consumer {
                (producer_id, consumer_id)
            } else {
                (consumer_id, producer_id)
            };
            if root_dims_to_map.contains(&key) {
                dom_map.insert(key, value);
            }
            itc += 1;
            itp += 1;
        }
        dom_map
    }
}

/// Positional root pairing for tensors that are not a direct pair (e.g.
/// sibling outputs sharing a producer): aligns non-reduction axes in order.
pub fn positional_root_map(
    fusion: &Fusion,
    from: ValId,
    to: ValId,
) -> HashMap<ValId, ValId> {
    let from_root = fusion.no_reductions(&fusion.tv_maybe_rfactor(from));
    let to_root = fusion.no_reductions(&fusion.tv_maybe_rfactor(to));
    from_root
        .into_iter()
        .zip(to_root)
        .collect()
}

/// Consumer-root → producer-root pairing for two tensors on a computeAt
/// stack: the pairwise map when they form a direct pair, positional
/// alignment otherwise.
pub fn root_map_c2p(fusion: &Fusion, consumer: ValId, producer: ValId) -> HashMap<ValId, ValId> {
    if let Ok(pairwise) = PairwiseRootDomainMap::new(fusion, producer, consumer) {
        let consumer_root = fusion.tv_root(consumer);
        return pairwise.map_consumer_to_producer(fusion, &consumer_root);
    }
    positional_root_map(fusion, consumer, producer)
}

// ----------------------------------------------------------------------
// Unmappable reduction domains
// ----------------------------------------------------------------------

/// Reduction domains and the consumer domains they must never be joined
/// with: joining a reduction output's axis with an axis used independently
/// by another consumer would force recomputation of the reduction.
#[derive(Debug, Default, Clone)]
struct UnmappableReductionDomains {
    reduction_domains: BTreeMap<DomainKey, DomainKeySet>,
}

impl UnmappableReductionDomains {
    fn build(fusion: &Fusion) -> Self {
        let mut this = UnmappableReductionDomains::default();
        for expr_id in fusion.tensor_exprs() {
            let expr = fusion.expr(expr_id);
            if !matches!(expr.kind(), ExprKind::Reduction { .. }) {
                continue;
            }
            let out_tv = expr.output();
            let out_td = fusion.tensor_view(out_tv).domain;
            let mut reduction_keys = Vec::new();
            for id in fusion.tv_maybe_rfactor(out_tv) {
                if fusion.iter_domain(id).is_reduction() {
                    let key = DomainKey::new(out_td, id);
                    reduction_keys.push(key);
                    this.reduction_domains.entry(key).or_default();
                }
            }
            for chain in fusion.all_use_chains(out_tv) {
                for &tv in chain.iter().filter(|&&v| fusion.val(v).is_tensor_view()) {
                    let td = fusion.tensor_view(tv).domain;
                    for id in fusion.tv_root(tv) {
                        let consumer_key = DomainKey::new(td, id);
                        for key in &reduction_keys {
                            this.reduction_domains
                                .entry(*key)
                                .or_default()
                                .insert(consumer_key);
                        }
                    }
                }
            }
        }
        this
    }

    fn is_reduction_output_mapped(
        &self,
        fusion: &Fusion,
        consumer_domains: &[DomainKey],
        root_map: &ComputeAtRootDomainMap,
    ) -> bool {
        for (reduction_domain, incompatible_domains) in &self.reduction_domains {
            let mut domain_with_reduction = None;
            for consumer_domain in consumer_domains {
                if root_map.can_map_key(
                    fusion,
                    *consumer_domain,
                    reduction_domain.td,
                    reduction_domain.id,
                ) {
                    domain_with_reduction = Some(*consumer_domain);
                    break;
                }
            }
            let Some(domain_with_reduction) = domain_with_reduction else {
                continue;
            };
            for consumer_domain in consumer_domains {
                if *consumer_domain == domain_with_reduction {
                    continue;
                }
                if incompatible_domains.iter().any(|incompatible| {
                    root_map.can_map_keys(fusion, *consumer_domain, *incompatible)
                }) {
                    return true;
                }
            }
        }
        false
    }
}

// ----------------------------------------------------------------------
// ComputeAt root domain map
// ----------------------------------------------------------------------

/// Whole-fusion equivalence of root iteration domains, concretization
/// aware. Built once per scheduling session and queried by computeAt, the
/// loop map and lowering.
#[derive(Debug, Default, Clone)]
pub struct ComputeAtRootDomainMap {
    eq_set: DisjointSet<DomainKey>,
    /// Broadcast key → concrete iteration domains it maps to downstream
    bcast_map: BTreeMap<DomainKey, BTreeSet<ValId>>,
    /// Consumer broadcast axes introduced by a broadcast op
    new_broadcast_domains: DomainKeySet,
}

impl ComputeAtRootDomainMap {
    /// Build the map from scratch for the current state of the fusion.
    pub fn build(fusion: &Fusion) -> Self {
        let mut map = ComputeAtRootDomainMap::default();
        let builder = ComputeAtRootDomainMapBuilder::new(fusion, &mut map);
        builder.run();
        map
    }

    /// Is `id_a` of tensor domain `td_a` the same loop as `id_b` of `td_b`?
    /// Symmetric; broadcast axes compare through their concretized keys.
    pub fn can_map(
        &self,
        fusion: &Fusion,
        td_a: ValId,
        id_a: ValId,
        td_b: ValId,
        id_b: ValId,
    ) -> bool {
        if fusion.iter_domain(id_a).is_broadcast() {
            self.concretized_keys(td_a, id_a)
                .iter()
                .any(|&key_a| self.can_map_key(fusion, key_a, td_b, id_b))
        } else {
            self.can_map_key(fusion, DomainKey::new(td_a, id_a), td_b, id_b)
        }
    }

    fn can_map_key(&self, fusion: &Fusion, key_a: DomainKey, td_b: ValId, id_b: ValId) -> bool {
        if fusion.iter_domain(id_b).is_broadcast() {
            self.concretized_keys(td_b, id_b)
                .iter()
                .any(|&key_b| self.can_map_keys(fusion, key_a, key_b))
        } else {
            self.can_map_keys(fusion, key_a, DomainKey::new(td_b, id_b))
        }
    }

    fn can_map_keys(&self, _fusion: &Fusion, key_a: DomainKey, key_b: DomainKey) -> bool {
        key_a == key_b || self.eq_set.are_equivalent(&key_a, &key_b)
    }

    /// The concretized views of a broadcast key; a never-concretized
    /// broadcast names itself.
    fn concretized_keys(&self, td: ValId, id: ValId) -> Vec<DomainKey> {
        let key = DomainKey::new(td, id);
        match self.bcast_map.get(&key) {
            Some(concrete_ids) if !concrete_ids.is_empty() => concrete_ids
                .iter()
                .map(|&c| DomainKey::with_concrete(td, id, c))
                .collect(),
            _ => vec![DomainKey::with_concrete(td, id, id)],
        }
    }

    /// Map producer root axes to consumer root axes under the equivalence,
    /// restricted to `root_dims_to_map`. Axes with no mapping are reported
    /// as an error unless they are producer reductions.
    pub fn map_producer_to_consumer(
        &self,
        fusion: &Fusion,
        producer_td: ValId,
        consumer_td: ValId,
        root_dims_to_map: &[ValId],
    ) -> Result<HashMap<ValId, ValId>, MappingError> {
        self.map(fusion, producer_td, consumer_td, root_dims_to_map, true)
    }

    /// Map consumer root axes to producer root axes under the equivalence,
    /// restricted to `root_dims_to_map`. Axes with no mapping are reported
    /// as an error unless they are new consumer broadcasts.
    pub fn map_consumer_to_producer(
        &self,
        fusion: &Fusion,
        consumer_td: ValId,
        producer_td: ValId,
        root_dims_to_map: &[ValId],
    ) -> Result<HashMap<ValId, ValId>, MappingError> {
        self.map(fusion, producer_td, consumer_td, root_dims_to_map, false)
    }

    fn map(
        &self,
        fusion: &Fusion,
        producer_td: ValId,
        consumer_td: ValId,
        root_dims_to_map: &[ValId],
        producer_to_consumer: bool,
    ) -> Result<HashMap<ValId, ValId>, MappingError> {
        let producer_root = fusion.tensor_domain(producer_td).maybe_rfactor().to_vec();
        let consumer_root = fusion.tensor_domain(consumer_td).root.clone();
        let (src_td, dst_td, src_ids, dst_ids) = if producer_to_consumer {
            (producer_td, consumer_td, &producer_root, &consumer_root)
        } else {
            (consumer_td, producer_td, &consumer_root, &producer_root)
        };
        let mut id_map = HashMap::new();
        for &src_id in src_ids {
            if !root_dims_to_map.contains(&src_id) {
                continue;
            }
            let mut mapping_found = false;
            for &dst_id in dst_ids {
                if self.can_map(fusion, src_td, src_id, dst_td, dst_id) {
                    id_map.insert(src_id, dst_id);
                    mapping_found = true;
                }
            }
            if mapping_found {
                continue;
            }
            // A missing match is fine for producer reductions going forward
            // and new consumer broadcasts going backward; anything else
            // would require recomputing the source tensor.
            let src_is_reduction = fusion.iter_domain(src_id).is_reduction();
            let src_is_new_broadcast = self
                .new_broadcast_domains
                .contains(&DomainKey::new(src_td, src_id));
            if (producer_to_consumer && src_is_reduction)
                || (!producer_to_consumer && src_is_new_broadcast)
            {
                continue;
            }
            return Err(MappingError::Unmappable { td: src_td, id: src_id });
        }
        Ok(id_map)
    }

    /// Duplicate all mappings of `td` for `td_alias`; used after a tensor
    /// copy so the copy's domain answers the same queries.
    pub fn set_alias(&mut self, td: ValId, td_alias: ValId) {
        let mut new_bcast: Vec<(DomainKey, BTreeSet<ValId>)> = Vec::new();
        for (key, concrete_set) in &self.bcast_map {
            if key.td == td {
                new_bcast.push((DomainKey::new(td_alias, key.id), concrete_set.clone()));
            }
        }
        for (key, set) in new_bcast {
            self.bcast_map.insert(key, set);
        }

        for key in self.eq_set.all_elements() {
            if key.td == td {
                let alias_key = DomainKey { td: td_alias, id: key.id, concrete_id: key.concrete_id };
                self.eq_set.join(&key, &alias_key);
            }
        }

        let new_bcast_domains: Vec<DomainKey> = self
            .new_broadcast_domains
            .iter()
            .filter(|key| key.td == td)
            .map(|key| DomainKey::new(td_alias, key.id))
            .collect();
        self.new_broadcast_domains.extend(new_bcast_domains);
    }
}

// ----------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------

struct ComputeAtRootDomainMapBuilder<'a> {
    fusion: &'a Fusion,
    map: &'a mut ComputeAtRootDomainMap,
    incompatible_domains: UnmappableReductionDomains,
    /// Producer key → consumer keys awaiting a consistency check
    pending_map: BTreeMap<DomainKey, DomainKeySet>,
}

impl<'a> ComputeAtRootDomainMapBuilder<'a> {
    fn new(fusion: &'a Fusion, map: &'a mut ComputeAtRootDomainMap) -> Self {
        let incompatible_domains = UnmappableReductionDomains::build(fusion);
        ComputeAtRootDomainMapBuilder {
            fusion,
            map,
            incompatible_domains,
            pending_map: BTreeMap::new(),
        }
    }

    fn run(mut self) {
        // Broadcast axes on outputs never meet a concrete partner; seed
        // them as their own concrete id.
        for &out_tv in self.fusion.outputs() {
            if !self.fusion.val(out_tv).is_tensor_view() {
                continue;
            }
            let td = self.fusion.tensor_view(out_tv).domain;
            for id in self.fusion.tv_root(out_tv) {
                if self.fusion.iter_domain(id).is_broadcast() {
                    self.map
                        .bcast_map
                        .entry(DomainKey::new(td, id))
                        .or_default()
                        .insert(id);
                }
            }
        }

        // Visit expressions backward so every consumer of a tensor is seen
        // before the tensor itself; flush a producer's pending mappings once
        // all its uses are handled.
        let exprs = self.fusion.tensor_exprs();
        let mut remaining_uses: HashMap<ValId, usize> = HashMap::new();
        for &expr_id in &exprs {
            for &inp in self.fusion.expr(expr_id).inputs() {
                if self.fusion.val(inp).is_tensor_view() {
                    *remaining_uses.entry(inp).or_insert(0) += 1;
                }
            }
        }

        for &expr_id in exprs.iter().rev() {
            let expr = self.fusion.expr(expr_id);
            if !self.fusion.val(expr.output()).is_tensor_view() {
                continue;
            }
            match expr.kind() {
                ExprKind::Broadcast { is_new_axis } => {
                    self.handle_broadcast(expr_id, &is_new_axis.clone());
                }
                _ => self.map_pointwise_or_reduction(expr_id),
            }
            for &inp in self.fusion.expr(expr_id).inputs() {
                if !self.fusion.val(inp).is_tensor_view() {
                    continue;
                }
                let count = remaining_uses
                    .get_mut(&inp)
                    .expect("use counts cover all tensor inputs");
                *count -= 1;
                if *count == 0 {
                    self.flush_tensor(inp);
                }
            }
        }

        debug_assert!(
            self.pending_map.is_empty(),
            "pending root mappings left unresolved: {:?}",
            self.pending_map
        );
    }

    fn map_pointwise_or_reduction(&mut self, expr_id: crate::ir::ExprId) {
        let expr = self.fusion.expr(expr_id);
        let out_tv = expr.output();
        let out_td = self.fusion.tensor_view(out_tv).domain;
        let out_root = self.fusion.tv_root(out_tv);
        for &in_tv in expr.inputs() {
            if !self.fusion.val(in_tv).is_tensor_view() {
                continue;
            }
            let in_td = self.fusion.tensor_view(in_tv).domain;
            let in_root = self
                .fusion
                .no_reductions(&self.fusion.tv_maybe_rfactor(in_tv));
            debug_assert_eq!(in_root.len(), out_root.len());
            for (&p_id, &c_id) in in_root.iter().zip(out_root.iter()) {
                self.set_maybe_mapped(in_td, p_id, out_td, c_id);
            }
        }
    }

    fn handle_broadcast(&mut self, expr_id: crate::ir::ExprId, bcast_flags: &[bool]) {
        let expr = self.fusion.expr(expr_id);
        let in_tv = expr.inputs()[0];
        let out_tv = expr.output();
        let in_td = self.fusion.tensor_view(in_tv).domain;
        let out_td = self.fusion.tensor_view(out_tv).domain;
        let in_root = self.fusion.no_reductions(&self.fusion.tv_root(in_tv));
        let out_root = self.fusion.tv_root(out_tv);
        debug_assert_eq!(out_root.len(), bcast_flags.len());

        let mut in_it = in_root.iter();
        for (out_pos, &out_id) in out_root.iter().enumerate() {
            if bcast_flags[out_pos] {
                // New broadcast dim: no matching input dimension.
                self.map
                    .new_broadcast_domains
                    .insert(DomainKey::new(out_td, out_id));
                continue;
            }
            let &in_id = in_it.next().expect("input root covers non-broadcast output axes");
            self.set_maybe_mapped(in_td, in_id, out_td, out_id);
        }
        debug_assert!(in_it.next().is_none(), "unmatched input domain in broadcast");
    }

    /// Record that producer and consumer axes may be the same loop; the
    /// decision is deferred to the producer's flush so all consumers are
    /// checked together.
    fn set_maybe_mapped(
        &mut self,
        producer_td: ValId,
        producer_id: ValId,
        consumer_td: ValId,
        consumer_id: ValId,
    ) {
        let producer_key = DomainKey::new(producer_td, producer_id);
        let consumer_key = DomainKey::new(consumer_td, consumer_id);
        let producer_is_bcast = self.fusion.iter_domain(producer_id).is_broadcast();

        if producer_is_bcast {
            self.map.bcast_map.entry(producer_key).or_default();
        }

        if self.fusion.iter_domain(consumer_id).is_broadcast() {
            debug_assert!(producer_is_bcast, "broadcast consumer requires broadcast producer");
            // Propagate the consumer's concretizations to the producer.
            let consumer_keys = self.map.concretized_keys(consumer_td, consumer_id);
            for consumer_bcast_key in consumer_keys {
                let concrete_id = consumer_bcast_key
                    .concrete_id
                    .expect("concretized keys always carry a concrete id");
                self.map
                    .bcast_map
                    .entry(producer_key)
                    .or_default()
                    .insert(concrete_id);
                let producer_bcast_key =
                    DomainKey::with_concrete(producer_td, producer_id, concrete_id);
                self.add_pending(producer_bcast_key, consumer_bcast_key);
            }
        } else {
            let effective_producer_key = if producer_is_bcast {
                let concrete_id = consumer_id;
                self.map
                    .bcast_map
                    .entry(producer_key)
                    .or_default()
                    .insert(concrete_id);
                DomainKey::with_concrete(producer_td, producer_id, concrete_id)
            } else {
                producer_key
            };
            self.add_pending(effective_producer_key, consumer_key);
        }
    }

    fn add_pending(&mut self, producer: DomainKey, consumer: DomainKey) {
        self.pending_map.entry(producer).or_default().insert(consumer);
    }

    /// All uses of `tv` are handled; commit (or reject) its pending
    /// mappings.
    fn flush_tensor(&mut self, tv: ValId) {
        let td = self.fusion.tensor_view(tv).domain;
        let root = self
            .fusion
            .no_reductions(&self.fusion.tv_maybe_rfactor(tv));
        for id in root {
            if self.fusion.iter_domain(id).is_broadcast() {
                for key in self.map.concretized_keys(td, id) {
                    self.map_all_consumers(key);
                }
            } else {
                self.map_all_consumers(DomainKey::new(td, id));
            }
        }
    }

    fn map_all_consumers(&mut self, producer_key: DomainKey) {
        let Some(consumer_set) = self.pending_map.remove(&producer_key) else {
            return;
        };
        if self.safe_to_map(&consumer_set) {
            for consumer_key in &consumer_set {
                self.map.eq_set.join(&producer_key, consumer_key);
            }
        }
    }

    /// Can all consumers of a producer axis join one class without forcing
    /// recomputation?
    fn safe_to_map(&self, domains: &DomainKeySet) -> bool {
        if domains.len() <= 1 {
            return true;
        }
        // Filter out already-equivalent domains.
        let mut unique_domains: Vec<DomainKey> = Vec::new();
        for &domain in domains {
            if !unique_domains
                .iter()
                .any(|&unique| self.map.can_map_keys(self.fusion, domain, unique))
            {
                unique_domains.push(domain);
            }
        }
        if self.has_matching_domains(&unique_domains) {
            return false;
        }
        if self
            .incompatible_domains
            .is_reduction_output_mapped(self.fusion, &unique_domains, &*self.map)
        {
            return false;
        }
        true
    }

    /// Would joining these domains collide two distinct axes of one tensor?
    fn has_matching_domains(&self, unique_domains: &[DomainKey]) -> bool {
        for &key in unique_domains {
            for &other_key in unique_domains {
                if key == other_key {
                    continue;
                }
                let other_root = self.fusion.tensor_domain(other_key.td).root.clone();
                if other_root
                    .iter()
                    .any(|&id| self.map.can_map_key(self.fusion, key, other_key.td, id))
                {
                    return true;
                }
            }
        }
        false
    }
}
