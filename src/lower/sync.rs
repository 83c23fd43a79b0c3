//! Synchronization Insertion
//!
//! Two conservative passes over the lowered statement tree protect shared
//! scratchpad accesses:
//!
//! * **Read-after-write**: scanning statements in order, a read of a shared
//!   tensor written earlier (outside the reader's loop) needs a barrier
//!   between writer and reader, placed at the outermost scope the written
//!   tensor spans (its producedAt depth).
//! * **Write-after-read**: inside a loop, a shared tensor written at the
//!   top of the body and read at the bottom races with the next iteration;
//!   a barrier goes at the end of the body unless one is already there.
//!   Nested loops propagate their access sets outward on exit.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::ir::{Fusion, ValId};
use crate::lower::kernel_ir::KirExpr;
use crate::types::MemoryType;

// ----------------------------------------------------------------------
// Read-after-write
// ----------------------------------------------------------------------

/// Insert RAW barriers into the statement tree.
pub fn insert_raw_syncs(fusion: &Fusion, top_level: &mut Vec<KirExpr>) {
    // Pass 1: flatten tensor ops in order and find the writers a barrier
    // must follow.
    let mut smem_modified: HashMap<ValId, bool> = HashMap::new();
    let mut sync_requests: VecDeque<usize> = VecDeque::new();
    let mut seq = 0usize;
    let mut prev: Option<usize> = None;
    collect_raw_requests(
        fusion,
        top_level,
        &mut smem_modified,
        &mut sync_requests,
        &mut seq,
        &mut prev,
    );

    // Pass 2: place each barrier directly after its writer, which orders
    // the write before every later reader regardless of which nest the
    // reader sits in.
    let mut counter = 0usize;
    place_raw_syncs(top_level, &mut sync_requests, &mut counter);
}

fn collect_raw_requests(
    fusion: &Fusion,
    body: &[KirExpr],
    smem_modified: &mut HashMap<ValId, bool>,
    sync_requests: &mut VecDeque<usize>,
    seq: &mut usize,
    prev: &mut Option<usize>,
) {
    for stmt in body {
        match stmt {
            KirExpr::ForLoop(fl) => {
                collect_raw_requests(fusion, &fl.body, smem_modified, sync_requests, seq, prev);
            }
            KirExpr::IfThenElse { then_body, else_body, .. } => {
                collect_raw_requests(fusion, then_body, smem_modified, sync_requests, seq, prev);
                collect_raw_requests(fusion, else_body, smem_modified, sync_requests, seq, prev);
            }
            s if s.is_tensor_op() => {
                let needs_sync = s
                    .input_tvs(fusion)
                    .iter()
                    .any(|tv| smem_modified.get(tv).copied().unwrap_or(false));
                if needs_sync {
                    let prev_seq = prev.expect("a shared read implies an earlier shared write");
                    sync_requests.push_back(prev_seq);
                    for modified in smem_modified.values_mut() {
                        *modified = false;
                    }
                }
                if let Some(out) = s.output_tv(fusion) {
                    if fusion.tv_memory(out) == MemoryType::Shared {
                        smem_modified.insert(out, true);
                    }
                }
                *prev = Some(*seq);
                *seq += 1;
            }
            _ => {}
        }
    }
}

fn place_raw_syncs(body: &mut Vec<KirExpr>, sync_requests: &mut VecDeque<usize>, counter: &mut usize) {
    let mut i = 0;
    while i < body.len() {
        match &mut body[i] {
            KirExpr::ForLoop(fl) => {
                place_raw_syncs(&mut fl.body, sync_requests, counter);
            }
            KirExpr::IfThenElse { then_body, else_body, .. } => {
                place_raw_syncs(then_body, sync_requests, counter);
                place_raw_syncs(else_body, sync_requests, counter);
            }
            _ => {}
        }
        if body[i].is_tensor_op() {
            let matched = sync_requests.front() == Some(&*counter);
            *counter += 1;
            if matched {
                sync_requests.pop_front();
                body.insert(i + 1, KirExpr::Sync { war: false });
                i += 1;
            }
        }
        i += 1;
    }
}

// ----------------------------------------------------------------------
// Write-after-read
// ----------------------------------------------------------------------

type TvSet = HashSet<ValId>;

#[derive(Debug, Default)]
struct WarScopeInfo {
    /// Shared writes before the first barrier of the scope
    initial: TvSet,
    /// Shared reads after the last barrier of the scope
    final_reads: TvSet,
    /// All shared reads in the scope, including children
    all_inputs: TvSet,
    /// All shared writes in the scope, including children
    all_outputs: TvSet,
    /// A barrier was seen in the scope
    initial_sync: bool,
    /// A WAR barrier was inserted in the scope
    has_war_hazard_sync: bool,
}

/// Insert WAR barriers at the end of loop bodies that write shared memory
/// early and read it late.
pub fn insert_war_syncs(fusion: &Fusion, top_level: &mut Vec<KirExpr>) {
    handle_war_scope(fusion, top_level, None);
}

fn add_smem_tvs(fusion: &Fusion, tvs: &[ValId], set: &mut TvSet) {
    for &tv in tvs {
        if fusion.tv_memory(tv) == MemoryType::Shared {
            set.insert(tv);
        }
    }
}

fn handle_war_scope(
    fusion: &Fusion,
    body: &mut Vec<KirExpr>,
    loop_domain: Option<ValId>,
) -> WarScopeInfo {
    let mut info = WarScopeInfo::default();
    let mut is_last_op_sync = false;

    let mut i = 0;
    while i < body.len() {
        is_last_op_sync = false;
        match &mut body[i] {
            KirExpr::Sync { .. } => {
                info.initial_sync = true;
                is_last_op_sync = true;
                info.final_reads.clear();
            }
            KirExpr::ForLoop(fl) => {
                let child_domain = Some(fl.iter_domain);
                let child = handle_war_scope(fusion, &mut fl.body, child_domain);

                info.all_inputs.extend(child.all_inputs.iter().copied());
                info.all_outputs.extend(child.all_outputs.iter().copied());

                if !info.initial_sync {
                    if !child.initial_sync {
                        info.initial.extend(child.all_outputs.iter().copied());
                    } else if child.has_war_hazard_sync {
                        info.initial_sync = true;
                        is_last_op_sync = true;
                        info.initial.extend(child.initial.iter().copied());
                        info.final_reads.clear();
                    } else {
                        info.initial_sync = true;
                        info.initial.extend(child.initial.iter().copied());
                        info.final_reads.extend(child.final_reads.iter().copied());
                    }
                } else if !child.initial_sync {
                    info.final_reads.extend(child.all_inputs.iter().copied());
                } else if child.has_war_hazard_sync {
                    is_last_op_sync = true;
                    info.final_reads.clear();
                } else {
                    info.final_reads.extend(child.final_reads.iter().copied());
                }
            }
            KirExpr::IfThenElse { then_body, else_body, .. } => {
                for sub in [then_body, else_body] {
                    for stmt in sub.iter() {
                        if stmt.is_tensor_op() {
                            track_tensor_op(fusion, stmt, &mut info);
                        }
                    }
                }
            }
            s if s.is_tensor_op() => {
                let stmt = s.clone();
                track_tensor_op(fusion, &stmt, &mut info);
            }
            _ => {}
        }
        i += 1;
    }

    // A loop whose body writes a shared tensor it later reads needs a
    // trailing barrier before the next iteration overwrites it.
    let loop_is_serial = loop_domain.is_some_and(|id| {
        let dom = fusion.iter_domain(id);
        !dom.is_thread() && !dom.is_broadcast()
    });
    if loop_is_serial
        && intersects(&info.initial, &info.final_reads)
        && !matches!(body.last(), Some(KirExpr::Sync { .. }))
        && !is_last_op_sync
    {
        info.has_war_hazard_sync = true;
        body.push(KirExpr::Sync { war: true });
    }
    info
}

fn track_tensor_op(fusion: &Fusion, stmt: &KirExpr, info: &mut WarScopeInfo) {
    let inputs = stmt.input_tvs(fusion);
    let outputs: Vec<ValId> = stmt.output_tv(fusion).into_iter().collect();
    if info.initial_sync {
        add_smem_tvs(fusion, &inputs, &mut info.final_reads);
    } else {
        add_smem_tvs(fusion, &outputs, &mut info.initial);
    }
    add_smem_tvs(fusion, &inputs, &mut info.all_inputs);
    add_smem_tvs(fusion, &outputs, &mut info.all_outputs);
}

fn intersects(left: &TvSet, right: &TvSet) -> bool {
    left.iter().any(|item| right.contains(item))
}
