/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The backend contract: the uniform interface containers drive data
//! movement through, plus the flat action form backends may prepare.
//!
//! Backends are selected per instance and dispatched through
//! `dyn Backend`; no backend-specific state leaks into the instance.
//! All operations are blocking from the caller's perspective (§5
//! scheduling model); `wait` and `probe` exist for backends that
//! overlap transfers internally.

use std::sync::Arc;

use ndspan::Slice;

use crate::error::Error;
use crate::error::Result;
use crate::group::Group;
use crate::mapping::MappingList;
use crate::transition::RecvEntry;
use crate::transition::SendEntry;
use crate::transition::Transition;
use crate::types::DataType;

pub mod collective;
pub mod net;
pub mod single;

/// Everything a backend needs to execute one transition: the element
/// type, the transition itself, and the two mapping lists. `from` is
/// absent on a container's first activation.
pub struct ExecCtx<'a> {
    /// Element type of the container.
    pub dtype: &'a DataType,
    /// Dimensionality of the partitioned space.
    pub dims: usize,
    /// The transition to execute.
    pub transition: &'a Transition,
    /// Mappings under the old partitioning.
    pub from: Option<&'a MappingList>,
    /// Mappings under the new partitioning.
    pub to: &'a mut MappingList,
}

/// One transfer of the double-sweep schedule.
#[derive(Debug, Clone, Copy)]
pub enum Transfer<'t> {
    /// Receive this entry from its peer.
    In(&'t RecvEntry),
    /// Send this entry to its peer.
    Out(&'t SendEntry),
}

/// Order a transition's transfers into the deadlock-free double-sweep
/// schedule for rank `me`.
///
/// The schedule has `2N` phases: in phase `p < N` a process receives
/// from peer `p` when `p` has the lower rank and sends to `p` when it
/// has the higher rank; in phases `p >= N` the polarity flips. Every
/// cross-process pair is thereby totally ordered and symmetric
/// exchanges cannot deadlock, without requiring non-blocking
/// operations. Both sides of a pair walk the planner's sorted entry
/// lists, so transfers pair deterministically.
pub fn sweep_order(t: &Transition, me: usize) -> Vec<Transfer<'_>> {
    let n = t.group().size();
    let mut order = Vec::with_capacity(t.send.len() + t.recv.len());
    for phase in 0..2 * n {
        let task = if phase < n { phase } else { 2 * n - phase - 1 };
        let first_half = phase < n;
        for r in t.recv.iter().filter(|r| r.from == task) {
            if (first_half && task < me) || (!first_half && task > me) {
                order.push(Transfer::In(r));
            }
        }
        for s in t.send.iter().filter(|s| s.to == task) {
            if (first_half && task > me) || (!first_half && task < me) {
                order.push(Transfer::Out(s));
            }
        }
    }
    order
}

/// A flat executable unit emitted by a backend's prepare phase.
///
/// Buffers and mappings are referenced by number: buffers index into
/// the owning [`TransitionPlan`], mappings into the transition's
/// mapping lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transmit `count` elements from a plan buffer to `peer`.
    Send {
        /// Plan buffer holding the data.
        buf: usize,
        /// Element count.
        count: u64,
        /// Destination rank.
        peer: usize,
    },
    /// Receive `count` elements from `peer` into a plan buffer.
    Recv {
        /// Plan buffer receiving the data.
        buf: usize,
        /// Element count.
        count: u64,
        /// Source rank.
        peer: usize,
    },
    /// Pack `slice` from a mapping and transmit it to `peer`.
    PackAndSend {
        /// Source mapping number.
        map_no: usize,
        /// Region to pack.
        slice: Slice,
        /// Destination rank.
        peer: usize,
    },
    /// Receive from `peer` and unpack into `slice` of a mapping.
    RecvAndUnpack {
        /// Destination mapping number.
        map_no: usize,
        /// Region to unpack.
        slice: Slice,
        /// Source rank.
        peer: usize,
    },
    /// Pack `slice` from a mapping into a plan buffer.
    Pack {
        /// Source mapping number.
        map_no: usize,
        /// Region to pack.
        slice: Slice,
        /// Destination plan buffer.
        buf: usize,
    },
    /// Unpack a plan buffer into `slice` of a mapping.
    Unpack {
        /// Destination mapping number.
        map_no: usize,
        /// Region to unpack.
        slice: Slice,
        /// Source plan buffer.
        buf: usize,
    },
    /// Copy `slice` between two mappings in-process.
    Copy {
        /// Source mapping number in the old list.
        from_map: usize,
        /// Destination mapping number in the new list.
        to_map: usize,
        /// Region to copy.
        slice: Slice,
    },
}

/// A replayable sequence of [`Action`]s with the buffers they
/// reference, produced by [`Backend::prepare`].
#[derive(Debug, Default)]
pub struct TransitionPlan {
    actions: Vec<Action>,
    bufs: Vec<Vec<u8>>,
    send_elems: u64,
    recv_elems: u64,
}

impl TransitionPlan {
    /// An empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a plan buffer of `size` bytes, returning its number.
    pub fn append_buf(&mut self, size: usize) -> usize {
        self.bufs.push(vec![0u8; size]);
        self.bufs.len() - 1
    }

    /// Append an action.
    pub fn record(&mut self, action: Action) {
        match &action {
            Action::Send { count, .. } => self.send_elems += count,
            Action::PackAndSend { slice, .. } => self.send_elems += slice.count(),
            Action::Recv { count, .. } => self.recv_elems += count,
            Action::RecvAndUnpack { slice, .. } => self.recv_elems += slice.count(),
            _ => {}
        }
        self.actions.push(action);
    }

    /// The recorded actions, in order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// A plan buffer by number.
    pub fn buf(&self, no: usize) -> Result<&[u8]> {
        self.bufs
            .get(no)
            .map(|b| b.as_slice())
            .ok_or_else(|| Error::logic(format!("plan buffer {no} out of {}", self.bufs.len())))
    }

    /// A plan buffer by number, mutably.
    pub fn buf_mut(&mut self, no: usize) -> Result<&mut [u8]> {
        let len = self.bufs.len();
        self.bufs
            .get_mut(no)
            .map(|b| b.as_mut_slice())
            .ok_or_else(|| Error::logic(format!("plan buffer {no} out of {len}")))
    }

    /// Total elements sent by the planned actions.
    pub fn send_elems(&self) -> u64 {
        self.send_elems
    }

    /// Total elements received by the planned actions.
    pub fn recv_elems(&self) -> u64 {
        self.recv_elems
    }
}

/// The uniform backend contract (§4.E).
///
/// `update_group` must be called exactly once per derived group before
/// `exec` runs on a container bound to it. Error classes raised:
/// `Config` for mis-sized groups, `Transport` for unrecoverable peer
/// failures, `Protocol` for malformed messages, `OutOfMemory` when a
/// buffer limit is exceeded. No silent retries at this layer.
pub trait Backend {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    /// Release backend globals. Idempotent.
    fn finalize(&mut self) {}

    /// Install per-group transport state for a derived group.
    fn update_group(&mut self, group: &Arc<Group>) -> Result<()> {
        let _ = group;
        Ok(())
    }

    /// Optionally pre-compute a plan of flat actions for a transition.
    /// Backends without a prepare phase return `None` and do the work
    /// in `exec` directly.
    fn prepare(&mut self, dtype: &DataType, transition: &Transition)
        -> Result<Option<TransitionPlan>> {
        let _ = (dtype, transition);
        Ok(None)
    }

    /// Perform all data movement of a transition. Blocking.
    fn exec(&mut self, ctx: &mut ExecCtx<'_>, plan: Option<&mut TransitionPlan>) -> Result<()>;

    /// Block until all transfers touching `map_no` have completed.
    fn wait(&mut self, plan: &TransitionPlan, map_no: usize) -> Result<()> {
        let _ = (plan, map_no);
        Ok(())
    }

    /// Non-blocking completion query for transfers touching `map_no`.
    fn probe(&self, plan: &TransitionPlan, map_no: usize) -> bool {
        let _ = (plan, map_no);
        true
    }

    /// Free a plan's buffers and actions.
    fn cleanup(&mut self, plan: TransitionPlan) {
        drop(plan);
    }

    /// Negotiate a membership change at a phase boundary. Backends
    /// without elasticity reject the call.
    fn resize(&mut self, phase: i32, leave: bool) -> Result<Arc<Group>> {
        let _ = (phase, leave);
        Err(Error::config(format!(
            "backend '{}' does not support resize",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::partitioning::AccessIntent;
    use crate::partitioning::Partitioning;
    use crate::partitioning::TaskSlice;
    use crate::transition::plan;
    use ndspan::Space;

    #[test]
    fn test_sweep_order_recv_lower_then_send_higher() {
        // middle rank of three: the first sweep receives from below,
        // then sends above; the second sweep does the reverse
        let g = Group::world(vec![0, 1, 2], 1);
        let space = Space::new_1d(9);
        let old = Partitioning::block_1d(Arc::clone(&g), space, AccessIntent::ReadWrite).unwrap();
        let new = Partitioning::from_slices(
            Arc::clone(&g),
            space,
            vec![
                TaskSlice {
                    rank: 1,
                    slice: Slice::new_1d(0, 9),
                    intent: AccessIntent::ReadWrite,
                },
            ],
        )
        .unwrap();
        let t = plan(Some(&old), &new).unwrap();
        let order: Vec<(bool, usize)> = sweep_order(&t, 1)
            .iter()
            .map(|x| match x {
                Transfer::In(r) => (true, r.from),
                Transfer::Out(s) => (false, s.to),
            })
            .collect();
        assert_eq!(order, vec![(true, 0), (true, 2)]);
    }

    #[test]
    fn test_plan_counters() {
        let mut plan = TransitionPlan::new();
        let b = plan.append_buf(64);
        plan.record(Action::Send {
            buf: b,
            count: 8,
            peer: 1,
        });
        plan.record(Action::RecvAndUnpack {
            map_no: 0,
            slice: Slice::new_1d(0, 4),
            peer: 1,
        });
        assert_eq!(plan.send_elems(), 8);
        assert_eq!(plan.recv_elems(), 4);
        assert_eq!(plan.actions().len(), 2);
        assert_eq!(plan.buf(b).unwrap().len(), 64);
        assert!(plan.buf(9).is_err());
    }
}
