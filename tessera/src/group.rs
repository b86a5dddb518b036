/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process groups.
//!
//! A [`Group`] is an ordered set of process locations together with
//! this process's rank in it (`myid`, -1 when not a member). Groups
//! are immutable and `Arc`-shared: containers and partitionings hold
//! references to the group they were built against, and groups outlive
//! both. A group can be derived from a parent by shrinking; the
//! derivation records how parent ranks map into the child.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::error::Error;
use crate::error::Result;

static NEXT_GID: AtomicU64 = AtomicU64::new(0);

/// An ordered set of process locations.
#[derive(Debug)]
pub struct Group {
    gid: u64,
    size: usize,
    myid: i32,
    /// Location-ID per rank.
    locations: Vec<i32>,
    parent: Option<Arc<Group>>,
    /// `from_parent[parent_rank]` is the rank in this group, -1 if
    /// removed. Empty for root groups.
    from_parent: Vec<i32>,
}

impl Group {
    /// The root group of a world: rank k has location-ID
    /// `locations[k]`.
    pub fn world(locations: Vec<i32>, myid: i32) -> Arc<Group> {
        let size = locations.len();
        Arc::new(Group {
            gid: NEXT_GID.fetch_add(1, Ordering::Relaxed),
            size,
            myid,
            locations,
            parent: None,
            from_parent: Vec::new(),
        })
    }

    /// Derive a group from `parent` by removing the given parent
    /// ranks. Remaining ranks keep their relative order.
    pub fn shrink(parent: &Arc<Group>, remove_ranks: &[usize]) -> Result<Arc<Group>> {
        for &r in remove_ranks {
            if r >= parent.size {
                return Err(Error::config(format!(
                    "cannot remove rank {r} from group of size {}",
                    parent.size
                )));
            }
        }
        let mut from_parent = vec![-1i32; parent.size];
        let mut locations = Vec::with_capacity(parent.size - remove_ranks.len());
        let mut myid = -1;
        for rank in 0..parent.size {
            if remove_ranks.contains(&rank) {
                continue;
            }
            from_parent[rank] = locations.len() as i32;
            if rank as i32 == parent.myid {
                myid = locations.len() as i32;
            }
            locations.push(parent.locations[rank]);
        }
        let size = locations.len();
        Ok(Arc::new(Group {
            gid: NEXT_GID.fetch_add(1, Ordering::Relaxed),
            size,
            myid,
            locations,
            parent: Some(Arc::clone(parent)),
            from_parent,
        }))
    }

    /// Stable identifier of this group within the process.
    pub fn gid(&self) -> u64 {
        self.gid
    }

    /// Number of member processes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// This process's rank, -1 when not a member.
    pub fn myid(&self) -> i32 {
        self.myid
    }

    /// True iff this process is a member.
    pub fn is_member(&self) -> bool {
        self.myid >= 0
    }

    /// Location-ID of the given rank.
    pub fn location(&self, rank: usize) -> i32 {
        self.locations[rank]
    }

    /// Location-IDs of all ranks, in rank order.
    pub fn locations(&self) -> &[i32] {
        &self.locations
    }

    /// The parent this group was derived from, if any.
    pub fn parent(&self) -> Option<&Arc<Group>> {
        self.parent.as_ref()
    }

    /// Rank in this group for a parent rank, -1 if removed. Only
    /// meaningful on derived groups.
    pub fn from_parent(&self, parent_rank: usize) -> i32 {
        self.from_parent[parent_rank]
    }
}
