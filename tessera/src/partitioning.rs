/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partitionings: the assignment of index slices to process ranks.

use std::sync::Arc;

use ndspan::Slice;
use ndspan::Space;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::group::Group;
use crate::types::ReduceOp;

/// How a rank accesses the indices of an owned slice during the phase
/// the partitioning is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessIntent {
    /// Values are read; previous contents must be preserved.
    Read,
    /// Values are overwritten; previous contents need not arrive.
    Write,
    /// Values are read and written; previous contents must arrive.
    ReadWrite,
    /// Partial values are combined with the given operator at the
    /// next transition; newly appearing indices start at the
    /// operator's identity.
    Reduce(ReduceOp),
}

impl AccessIntent {
    /// True iff old contents must be visible under this intent.
    pub fn preserves(&self) -> bool {
        matches!(self, AccessIntent::Read | AccessIntent::ReadWrite)
    }

    /// True iff a rank holding this intent produces data that
    /// reductions consume.
    pub fn produces(&self) -> bool {
        matches!(
            self,
            AccessIntent::Write | AccessIntent::ReadWrite | AccessIntent::Reduce(_)
        )
    }
}

/// One owned slice of one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSlice {
    /// Owning rank within the partitioning's group.
    pub rank: usize,
    /// The owned index region.
    pub slice: Slice,
    /// Access intent for this region.
    pub intent: AccessIntent,
}

/// An immutable assignment of index slices to the ranks of a group.
///
/// A well-formed partitioning either covers the space disjointly
/// (Write/ReadWrite intents) or may overlap when the intent is Read or
/// Reduce; validation enforces that writer slices never intersect and
/// that every slice lies within the space.
#[derive(Debug, Clone)]
pub struct Partitioning {
    space: Space,
    group: Arc<Group>,
    slices: Vec<TaskSlice>,
}

impl Partitioning {
    /// Build a partitioning from explicit slices, validating it.
    pub fn from_slices(
        group: Arc<Group>,
        space: Space,
        slices: Vec<TaskSlice>,
    ) -> Result<Self> {
        for ts in &slices {
            if ts.rank >= group.size() {
                return Err(Error::config(format!(
                    "slice owner rank {} outside group of size {}",
                    ts.rank,
                    group.size()
                )));
            }
            if ts.slice.dims() != space.dims() {
                return Err(Error::config(format!(
                    "slice dims {} != space dims {}",
                    ts.slice.dims(),
                    space.dims()
                )));
            }
            if !ts.slice.is_within(space.slice()) {
                return Err(Error::config(format!(
                    "slice {} outside space {}",
                    ts.slice, space
                )));
            }
        }
        // writer regions must be disjoint across ranks
        for (i, a) in slices.iter().enumerate() {
            if !matches!(a.intent, AccessIntent::Write | AccessIntent::ReadWrite) {
                continue;
            }
            for b in &slices[i + 1..] {
                if !matches!(b.intent, AccessIntent::Write | AccessIntent::ReadWrite) {
                    continue;
                }
                if a.rank != b.rank {
                    if let Some(overlap) = a.slice.intersection(&b.slice) {
                        return Err(Error::config(format!(
                            "writer slices of ranks {} and {} overlap at {}",
                            a.rank, b.rank, overlap
                        )));
                    }
                }
            }
        }
        Ok(Self {
            space,
            group,
            slices,
        })
    }

    /// Even contiguous 1-d blocks, one per rank, remainder spread over
    /// the leading ranks.
    pub fn block_1d(group: Arc<Group>, space: Space, intent: AccessIntent) -> Result<Self> {
        if space.dims() != 1 {
            return Err(Error::config(format!(
                "block_1d requires a 1-d space, got {} dims",
                space.dims()
            )));
        }
        let total = space.count() as i64;
        let n = group.size() as i64;
        let base = space.slice().from().get(0);
        let mut slices = Vec::with_capacity(group.size());
        let mut at = base;
        for rank in 0..n {
            let len = total / n + i64::from(rank < total % n);
            slices.push(TaskSlice {
                rank: rank as usize,
                slice: Slice::new_1d(at, at + len),
                intent,
            });
            at += len;
        }
        Self::from_slices(group, space, slices)
    }

    /// Every rank owns the whole space. Valid only for Read or Reduce
    /// intent, which permit overlap.
    pub fn all(group: Arc<Group>, space: Space, intent: AccessIntent) -> Result<Self> {
        if matches!(intent, AccessIntent::Write | AccessIntent::ReadWrite) {
            return Err(Error::config(
                "an all-ranks partitioning cannot carry a writer intent".to_string(),
            ));
        }
        let slices = (0..group.size())
            .map(|rank| TaskSlice {
                rank,
                slice: *space.slice(),
                intent,
            })
            .collect();
        Self::from_slices(group, space, slices)
    }

    /// The index space partitioned.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// The group ranks refer to.
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// All slices, in insertion order.
    pub fn slices(&self) -> &[TaskSlice] {
        &self.slices
    }

    /// Slices owned by the given rank.
    pub fn owned(&self, rank: usize) -> impl Iterator<Item = &TaskSlice> {
        self.slices.iter().filter(move |ts| ts.rank == rank)
    }

    /// Slices owned by this process.
    pub fn my_slices(&self) -> impl Iterator<Item = &TaskSlice> {
        let myid = self.group.myid();
        self.slices
            .iter()
            .filter(move |ts| myid >= 0 && ts.rank == myid as usize)
    }

    /// Bounding box of the rank's owned slices; `None` when the rank
    /// owns nothing (or only empty slices).
    pub fn required(&self, rank: usize) -> Option<Slice> {
        let mut hull: Option<Slice> = None;
        for ts in self.owned(rank) {
            if ts.slice.is_empty() {
                continue;
            }
            hull = Some(match hull {
                Some(h) => h.hull(&ts.slice),
                None => ts.slice,
            });
        }
        hull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group3() -> Arc<Group> {
        Group::world(vec![0, 1, 2], 0)
    }

    #[test]
    fn test_block_1d_even_split() {
        let p = Partitioning::block_1d(group3(), Space::new_1d(6), AccessIntent::ReadWrite)
            .unwrap();
        let owned: Vec<_> = p.slices().iter().map(|ts| ts.slice).collect();
        assert_eq!(
            owned,
            vec![
                Slice::new_1d(0, 2),
                Slice::new_1d(2, 4),
                Slice::new_1d(4, 6),
            ]
        );
    }

    #[test]
    fn test_block_1d_remainder_leading_ranks() {
        let p =
            Partitioning::block_1d(group3(), Space::new_1d(8), AccessIntent::Write).unwrap();
        let lens: Vec<u64> = p.slices().iter().map(|ts| ts.slice.count()).collect();
        assert_eq!(lens, vec![3, 3, 2]);
    }

    #[test]
    fn test_writer_overlap_rejected() {
        let g = group3();
        let space = Space::new_1d(8);
        let err = Partitioning::from_slices(
            g,
            space,
            vec![
                TaskSlice {
                    rank: 0,
                    slice: Slice::new_1d(0, 5),
                    intent: AccessIntent::Write,
                },
                TaskSlice {
                    rank: 1,
                    slice: Slice::new_1d(4, 8),
                    intent: AccessIntent::ReadWrite,
                },
            ],
        );
        assert!(matches!(err, Err(Error::Config { .. })));
    }

    #[test]
    fn test_reader_overlap_allowed() {
        let p = Partitioning::all(
            group3(),
            Space::new_1d(4),
            AccessIntent::Reduce(ReduceOp::Sum),
        )
        .unwrap();
        assert_eq!(p.slices().len(), 3);
        assert!(Partitioning::all(group3(), Space::new_1d(4), AccessIntent::Write).is_err());
    }

    #[test]
    fn test_out_of_space_rejected() {
        let err = Partitioning::from_slices(
            group3(),
            Space::new_1d(4),
            vec![TaskSlice {
                rank: 0,
                slice: Slice::new_1d(2, 6),
                intent: AccessIntent::Read,
            }],
        );
        assert!(matches!(err, Err(Error::Config { .. })));
    }

    #[test]
    fn test_required_hull() {
        let p = Partitioning::from_slices(
            group3(),
            Space::new_1d(10),
            vec![
                TaskSlice {
                    rank: 0,
                    slice: Slice::new_1d(0, 2),
                    intent: AccessIntent::Read,
                },
                TaskSlice {
                    rank: 0,
                    slice: Slice::new_1d(6, 8),
                    intent: AccessIntent::Read,
                },
            ],
        )
        .unwrap();
        assert_eq!(p.required(0), Some(Slice::new_1d(0, 8)));
        assert_eq!(p.required(1), None);
    }
}
