/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The transition planner.
//!
//! [`plan`] diffs two partitionings of the same space over the same
//! group into the actions required to preserve container semantics:
//! in-process copies, identity initialization of newly appearing
//! reduction regions, point-to-point transfers, and group reductions.
//! It is a pure function of its inputs; backends execute the result.
//!
//! Sends and receives come out sorted by `(peer, slice.from)`, so the
//! executors on both sides of a pair walk matching orders without
//! further coordination.

use std::collections::HashMap;
use std::sync::Arc;

use ndspan::Slice;

use crate::error::Error;
use crate::error::Result;
use crate::group::Group;
use crate::partitioning::AccessIntent;
use crate::partitioning::Partitioning;
use crate::types::ReduceOp;

/// A subset of a group's ranks, as referenced by reduction entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Members {
    /// Every rank of the group.
    All,
    /// The given ranks, sorted ascending.
    Ranks(Vec<usize>),
}

impl Members {
    fn from_ranks(mut ranks: Vec<usize>, group_size: usize) -> Members {
        ranks.sort_unstable();
        ranks.dedup();
        if ranks.len() == group_size {
            Members::All
        } else {
            Members::Ranks(ranks)
        }
    }

    /// True iff `rank` is a member.
    pub fn contains(&self, rank: usize) -> bool {
        match self {
            Members::All => true,
            Members::Ranks(rs) => rs.contains(&rank),
        }
    }

    /// Members in ascending rank order.
    pub fn ranks(&self, group_size: usize) -> Vec<usize> {
        match self {
            Members::All => (0..group_size).collect(),
            Members::Ranks(rs) => rs.clone(),
        }
    }

    /// The lowest member rank.
    pub fn first(&self, group_size: usize) -> Option<usize> {
        match self {
            Members::All => (group_size > 0).then_some(0),
            Members::Ranks(rs) => rs.first().copied(),
        }
    }

    /// True iff the subset covers the whole group.
    pub fn is_all(&self, group_size: usize) -> bool {
        match self {
            Members::All => true,
            Members::Ranks(rs) => rs.len() == group_size,
        }
    }
}

/// An in-process copy of a region present in both partitionings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyEntry {
    /// Region to copy.
    pub slice: Slice,
    /// Source mapping number in the old mapping list.
    pub from_map: usize,
    /// Destination mapping number in the new mapping list.
    pub to_map: usize,
}

/// Identity initialization of a newly appearing reduction region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitEntry {
    /// Region to initialize.
    pub slice: Slice,
    /// Destination mapping number.
    pub map_no: usize,
    /// Operator whose identity fills the region.
    pub op: ReduceOp,
}

/// A point-to-point transfer out of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    /// Region to send.
    pub slice: Slice,
    /// Destination rank.
    pub to: usize,
    /// Source mapping number.
    pub map_no: usize,
}

/// A point-to-point transfer into this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvEntry {
    /// Region to receive.
    pub slice: Slice,
    /// Source rank.
    pub from: usize,
    /// Destination mapping number.
    pub map_no: usize,
}

/// A group reduction over a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceEntry {
    /// Region reduced.
    pub slice: Slice,
    /// Element-wise operator.
    pub op: ReduceOp,
    /// Ranks contributing input values.
    pub input: Members,
    /// Ranks receiving the result.
    pub output: Members,
    /// This process's input mapping number.
    pub from_map: usize,
    /// This process's output mapping number.
    pub to_map: usize,
}

/// The derived product of diffing two partitionings: everything a
/// backend must do to carry container contents from the old
/// assignment to the new one.
#[derive(Debug)]
pub struct Transition {
    group: Arc<Group>,
    dims: usize,
    /// Regions present in both assignments on this process.
    pub local: Vec<CopyEntry>,
    /// Newly appearing reduction regions on this process.
    pub init: Vec<InitEntry>,
    /// Transfers out of this process.
    pub send: Vec<SendEntry>,
    /// Transfers into this process.
    pub recv: Vec<RecvEntry>,
    /// Group reductions this process participates in.
    pub red: Vec<ReduceEntry>,
}

impl Transition {
    /// The group both partitionings rank against.
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Dimensionality of the partitioned space.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// True iff nothing needs to happen.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
            && self.init.is_empty()
            && self.send.is_empty()
            && self.recv.is_empty()
            && self.red.is_empty()
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} local, {} init, {} send, {} recv, {} red",
            self.local.len(),
            self.init.len(),
            self.send.len(),
            self.recv.len(),
            self.red.len()
        )
    }
}

fn sort_key(s: &Slice) -> (i64, i64, i64) {
    (s.from().get(0), s.from().get(1), s.from().get(2))
}

/// Compute the transition from `old` to `new` for this process.
///
/// Both partitionings must cover the same space and rank against the
/// same group; `None` for `old` plans the first activation of a
/// container. The function performs no I/O.
pub fn plan(old: Option<&Partitioning>, new: &Partitioning) -> Result<Transition> {
    let group = Arc::clone(new.group());
    let dims = new.space().dims();
    let myid = group.myid();

    if let Some(old) = old {
        if old.group().gid() != new.group().gid() {
            return Err(Error::config(format!(
                "transition across groups (gid {} -> {}); migrate the container first",
                old.group().gid(),
                new.group().gid()
            )));
        }
        if old.space() != new.space() {
            return Err(Error::config(format!(
                "transition across spaces ({} -> {})",
                old.space(),
                new.space()
            )));
        }
    }

    let mut t = Transition {
        group,
        dims,
        local: Vec::new(),
        init: Vec::new(),
        send: Vec::new(),
        recv: Vec::new(),
        red: Vec::new(),
    };

    plan_reductions(old, new, &mut t, myid)?;

    let Some(old) = old else {
        // first activation: only reduction regions need initialization
        sort_entries(&mut t);
        return Ok(t);
    };

    // Receiver walk: for each of my new slices, find the old owners of
    // every overlap. My own old ownership of a region wins (local
    // copy); otherwise the lowest-ranked old owner covering the region
    // is the designated source, so both sides pair transfers
    // identically.
    if myid >= 0 {
        for mine in new.my_slices() {
            if !transfers(mine.intent) {
                continue;
            }
            for (j, old_entry) in old.slices().iter().enumerate() {
                let Some(overlap) = mine.slice.intersection(&old_entry.slice) else {
                    continue;
                };
                if covered_by_rank(old, &overlap, myid as usize) {
                    if old_entry.rank == myid as usize
                        && !covered_by_prior_owner(old, &overlap, j, Some(myid as usize))
                    {
                        t.local.push(CopyEntry {
                            slice: overlap,
                            from_map: 0,
                            to_map: 0,
                        });
                    }
                    continue;
                }
                if covered_by_prior_owner(old, &overlap, j, None) {
                    continue;
                }
                t.recv.push(RecvEntry {
                    slice: overlap,
                    from: old_entry.rank,
                    map_no: 0,
                });
            }
        }
    }

    // Sender walk, the mirror image: for each new owner elsewhere,
    // send the overlaps my old entries are the designated source of.
    if myid >= 0 {
        for new_entry in new.slices() {
            if new_entry.rank == myid as usize || !transfers(new_entry.intent) {
                continue;
            }
            for (j, old_entry) in old.slices().iter().enumerate() {
                if old_entry.rank != myid as usize {
                    continue;
                }
                let Some(overlap) = new_entry.slice.intersection(&old_entry.slice) else {
                    continue;
                };
                if covered_by_rank(old, &overlap, new_entry.rank) {
                    continue;
                }
                if covered_by_prior_owner(old, &overlap, j, None) {
                    continue;
                }
                t.send.push(SendEntry {
                    slice: overlap,
                    to: new_entry.rank,
                    map_no: 0,
                });
            }
        }
    }

    sort_entries(&mut t);
    Ok(t)
}

/// Intents whose regions move point-to-point (reductions are planned
/// separately).
fn transfers(intent: AccessIntent) -> bool {
    matches!(
        intent,
        AccessIntent::Read | AccessIntent::Write | AccessIntent::ReadWrite
    )
}

/// True iff some old entry of `rank` fully covers `region`.
fn covered_by_rank(old: &Partitioning, region: &Slice, rank: usize) -> bool {
    old.owned(rank)
        .any(|ts| region.is_within(&ts.slice) && !ts.slice.is_empty())
}

/// True iff an old entry preceding `j` in designated-source order
/// fully covers `region` (optionally restricted to entries of one
/// rank). Sources are ordered by rank first, then construction order,
/// making the lowest-ranked old owner of a region its designated
/// source regardless of how the partitioning was assembled.
fn covered_by_prior_owner(
    old: &Partitioning,
    region: &Slice,
    j: usize,
    rank: Option<usize>,
) -> bool {
    let owner = old.slices()[j].rank;
    old.slices().iter().enumerate().any(|(i, ts)| {
        (ts.rank, i) < (owner, j)
            && rank.map_or(true, |r| ts.rank == r)
            && !ts.slice.is_empty()
            && region.is_within(&ts.slice)
    })
}

/// Reduction planning: walk the new partitioning's Reduce regions
/// globally, grouped by (bounds, operator). The output subgroup is the
/// new owners; the input subgroup is every rank whose old intent
/// produced data on overlapping indices. Regions with no producer
/// initialize to the operator identity instead.
fn plan_reductions(
    old: Option<&Partitioning>,
    new: &Partitioning,
    t: &mut Transition,
    myid: i32,
) -> Result<()> {
    let group_size = new.group().size();
    let mut regions: HashMap<(Slice, ReduceOp), Vec<usize>> = HashMap::new();
    let mut order: Vec<(Slice, ReduceOp)> = Vec::new();
    for ts in new.slices() {
        let AccessIntent::Reduce(op) = ts.intent else {
            continue;
        };
        if ts.slice.is_empty() {
            continue;
        }
        let key = (ts.slice, op);
        let entry = regions.entry(key).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        entry.push(ts.rank);
    }

    for key in order {
        let (slice, op) = key;
        let output_ranks = regions.remove(&key).unwrap_or_default();
        let inputs: Vec<usize> = match old {
            Some(old) => old
                .slices()
                .iter()
                .filter(|ts| ts.intent.produces() && ts.slice.intersection(&slice).is_some())
                .map(|ts| ts.rank)
                .collect(),
            None => Vec::new(),
        };
        if inputs.is_empty() {
            // newly appearing region: identity-initialize on owners
            if myid >= 0 && output_ranks.contains(&(myid as usize)) {
                t.init.push(InitEntry {
                    slice,
                    map_no: 0,
                    op,
                });
            }
            continue;
        }
        let input = Members::from_ranks(inputs, group_size);
        let output = Members::from_ranks(output_ranks, group_size);
        let involved = myid >= 0
            && (input.contains(myid as usize) || output.contains(myid as usize));
        if involved {
            t.red.push(ReduceEntry {
                slice,
                op,
                input,
                output,
                from_map: 0,
                to_map: 0,
            });
        }
    }
    Ok(())
}

fn sort_entries(t: &mut Transition) {
    t.send.sort_by_key(|e| (e.to, sort_key(&e.slice)));
    t.recv.sort_by_key(|e| (e.from, sort_key(&e.slice)));
    t.local.sort_by_key(|e| sort_key(&e.slice));
    t.init.sort_by_key(|e| sort_key(&e.slice));
}
