/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Containers: the user-visible handle owning one active partitioning
//! and its memory at a time.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use ndspan::Point;
use ndspan::Space;

use crate::backend::Backend;
use crate::backend::ExecCtx;
use crate::error::Error;
use crate::error::Result;
use crate::group::Group;
use crate::mapping::Mapping;
use crate::mapping::MappingList;
use crate::partitioning::Partitioning;
use crate::transition;
use crate::types::DataType;

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(0);

struct Active {
    partitioning: Partitioning,
    mappings: MappingList,
}

/// A typed data container over an index space.
///
/// Created with a space and a type, initially without a partitioning.
/// Each [`set_partitioning`](Container::set_partitioning) transition
/// atomically swaps in a new partitioning and mapping pair, freeing
/// the previous one after the transition completes.
pub struct Container {
    name: String,
    space: Space,
    dtype: DataType,
    group: Arc<Group>,
    active: Option<Active>,
}

impl Container {
    /// A new container without an active partitioning.
    pub fn new(group: Arc<Group>, space: Space, dtype: DataType) -> Result<Self> {
        if dtype.size() == 0 {
            return Err(Error::config(format!(
                "type '{}' has zero element size",
                dtype.name()
            )));
        }
        let id = NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            name: format!("data-{id}"),
            space,
            dtype,
            group,
            active: None,
        })
    }

    /// Rename the container, for diagnostics.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The container's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The index space.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// The element type.
    pub fn dtype(&self) -> &DataType {
        &self.dtype
    }

    /// The group the active partitioning ranks against.
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// The active partitioning, if one has been set.
    pub fn partitioning(&self) -> Option<&Partitioning> {
        self.active.as_ref().map(|a| &a.partitioning)
    }

    /// The active mappings, if a partitioning has been set.
    pub fn mappings(&self) -> Option<&MappingList> {
        self.active.as_ref().map(|a| &a.mappings)
    }

    /// Switch the container to a new partitioning.
    ///
    /// Plans the transition against the previously active
    /// partitioning, allocates new mappings, lets the backend move
    /// data, performs local copies and identity initialization, then
    /// swaps the new pair in and frees the old one. Transition N
    /// completes before transition N+1 can begin by construction: the
    /// call does not return earlier.
    pub fn set_partitioning(
        &mut self,
        backend: &mut dyn Backend,
        new: Partitioning,
    ) -> Result<()> {
        if new.space() != &self.space {
            return Err(Error::config(format!(
                "partitioning space {} does not match container space {}",
                new.space(),
                self.space
            )));
        }
        if new.group().gid() != self.group.gid() {
            return Err(Error::config(
                "partitioning group does not match container group; migrate first".to_string(),
            ));
        }

        let old = self.active.take();
        let t = transition::plan(old.as_ref().map(|a| &a.partitioning), &new)?;
        tracing::debug!(container = %self.name, transition = %t, "switch partitioning");

        let myid = new.group().myid();
        let mut to = if myid >= 0 {
            MappingList::alloc(&self.dtype, &new, myid as usize)
        } else {
            MappingList::new(vec![Mapping::unbacked(&self.dtype)])
        };

        let mut plan = backend.prepare(&self.dtype, &t)?;
        let mut ctx = ExecCtx {
            dtype: &self.dtype,
            dims: self.space.dims(),
            transition: &t,
            from: old.as_ref().map(|a| &a.mappings),
            to: &mut to,
        };
        backend.exec(&mut ctx, plan.as_mut())?;
        if let Some(plan) = plan {
            backend.wait(&plan, 0)?;
            backend.cleanup(plan);
        }

        // local copy from the old mappings into the overlap
        for entry in &t.local {
            let from_maps = old
                .as_ref()
                .map(|a| &a.mappings)
                .ok_or_else(|| Error::logic("local copy without old mapping".to_string()))?;
            to.map_mut(entry.to_map)?
                .copy_slice_from(from_maps.map(entry.from_map)?, &entry.slice)?;
        }

        // identity init of newly appearing reduction regions
        for entry in &t.init {
            to.map_mut(entry.map_no)?
                .fill_identity_slice(&self.dtype, &entry.slice, entry.op)?;
        }

        self.group = Arc::clone(new.group());
        self.active = Some(Active {
            partitioning: new,
            mappings: to,
        });
        // old mapping and partitioning dropped here
        Ok(())
    }

    /// Re-rank the active partitioning onto a group derived from the
    /// current one, without data movement.
    ///
    /// Every slice owned by a removed rank must be empty: transitions
    /// that move data off departing processes run while they are still
    /// members. This is the container half of elastic resize.
    pub fn migrate(&mut self, new_group: &Arc<Group>) -> Result<()> {
        let parent_gid = new_group
            .parent()
            .ok_or_else(|| Error::config("migrate target is not a derived group".to_string()))?
            .gid();
        if parent_gid != self.group.gid() {
            return Err(Error::config(
                "migrate target was not derived from the container's group".to_string(),
            ));
        }
        let Some(active) = self.active.take() else {
            self.group = Arc::clone(new_group);
            return Ok(());
        };

        let mut remapped = Vec::with_capacity(active.partitioning.slices().len());
        for ts in active.partitioning.slices() {
            let new_rank = new_group.from_parent(ts.rank);
            if new_rank < 0 {
                if !ts.slice.is_empty() {
                    return Err(Error::config(format!(
                        "rank {} leaves but still owns {}; move its data first",
                        ts.rank, ts.slice
                    )));
                }
                continue;
            }
            let mut ts = *ts;
            ts.rank = new_rank as usize;
            remapped.push(ts);
        }
        let partitioning =
            Partitioning::from_slices(Arc::clone(new_group), self.space, remapped)?;
        self.group = Arc::clone(new_group);
        self.active = Some(Active {
            partitioning,
            mappings: active.mappings,
        });
        Ok(())
    }

    fn my_mapping(&self) -> Result<&Mapping> {
        self.active
            .as_ref()
            .ok_or_else(|| Error::config("container has no active partitioning".to_string()))?
            .mappings
            .map(0)
    }

    fn my_mapping_mut(&mut self) -> Result<&mut Mapping> {
        self.active
            .as_mut()
            .ok_or_else(|| Error::config("container has no active partitioning".to_string()))?
            .mappings
            .map_mut(0)
    }

    fn check_f64(&self) -> Result<()> {
        if self.dtype != DataType::DOUBLE {
            return Err(Error::config(format!(
                "typed access as f64 on container of type '{}'",
                self.dtype.name()
            )));
        }
        Ok(())
    }

    /// Fill every locally mapped element with `v`.
    pub fn fill_f64(&mut self, v: f64) -> Result<()> {
        self.check_f64()?;
        let m = self.my_mapping_mut()?;
        for chunk in m.base_mut().chunks_exact_mut(8) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
        Ok(())
    }

    /// All locally mapped elements in layout order.
    pub fn values_f64(&self) -> Result<Vec<f64>> {
        self.check_f64()?;
        let m = self.my_mapping()?;
        Ok(m.base()
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes(c.try_into().expect("chunked to element size")))
            .collect())
    }

    /// Read the element at a global index.
    pub fn read_f64(&self, idx: &Point) -> Result<f64> {
        self.check_f64()?;
        let m = self.my_mapping()?;
        let range = m.byte_range(idx)?;
        Ok(f64::from_ne_bytes(
            m.base()[range].try_into().expect("element is 8 bytes"),
        ))
    }

    /// Write the element at a global index.
    pub fn write_f64(&mut self, idx: &Point, v: f64) -> Result<()> {
        self.check_f64()?;
        let m = self.my_mapping_mut()?;
        let range = m.byte_range(idx)?;
        m.base_mut()[range].copy_from_slice(&v.to_ne_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::single::SingleBackend;
    use crate::partitioning::AccessIntent;
    use crate::partitioning::TaskSlice;
    use crate::types::ReduceOp;
    use ndspan::Slice;

    fn single_world() -> Arc<Group> {
        Group::world(vec![0], 0)
    }

    #[test]
    fn test_fill_and_read() {
        let g = single_world();
        let mut backend = SingleBackend::new();
        let mut c = Container::new(Arc::clone(&g), Space::new_1d(8), DataType::DOUBLE).unwrap();
        let p = Partitioning::block_1d(g, Space::new_1d(8), AccessIntent::ReadWrite).unwrap();
        c.set_partitioning(&mut backend, p).unwrap();
        c.fill_f64(2.5).unwrap();
        assert_eq!(c.values_f64().unwrap(), vec![2.5; 8]);
        assert_eq!(c.read_f64(&Point::d1(3)).unwrap(), 2.5);
        c.write_f64(&Point::d1(3), 9.0).unwrap();
        assert_eq!(c.read_f64(&Point::d1(3)).unwrap(), 9.0);
    }

    #[test]
    fn test_repartition_preserves_overlap() {
        // §8 invariant: indices present in both partitionings keep
        // their value across the switch
        let g = single_world();
        let mut backend = SingleBackend::new();
        let space = Space::new_1d(8);
        let mut c = Container::new(Arc::clone(&g), space, DataType::DOUBLE).unwrap();
        let whole =
            Partitioning::block_1d(Arc::clone(&g), space, AccessIntent::ReadWrite).unwrap();
        c.set_partitioning(&mut backend, whole).unwrap();
        for i in 0..8 {
            c.write_f64(&Point::d1(i), i as f64).unwrap();
        }
        let narrowed = Partitioning::from_slices(
            Arc::clone(&g),
            space,
            vec![TaskSlice {
                rank: 0,
                slice: Slice::new_1d(2, 6),
                intent: AccessIntent::ReadWrite,
            }],
        )
        .unwrap();
        c.set_partitioning(&mut backend, narrowed).unwrap();
        assert_eq!(c.values_f64().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_reduce_region_initialized_to_identity() {
        let g = single_world();
        let mut backend = SingleBackend::new();
        let space = Space::new_1d(4);
        let mut c = Container::new(Arc::clone(&g), space, DataType::DOUBLE).unwrap();
        let p =
            Partitioning::all(Arc::clone(&g), space, AccessIntent::Reduce(ReduceOp::Prod))
                .unwrap();
        c.set_partitioning(&mut backend, p).unwrap();
        assert_eq!(c.values_f64().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_space_mismatch_rejected() {
        let g = single_world();
        let mut backend = SingleBackend::new();
        let mut c = Container::new(Arc::clone(&g), Space::new_1d(8), DataType::DOUBLE).unwrap();
        let p =
            Partitioning::block_1d(Arc::clone(&g), Space::new_1d(4), AccessIntent::Write)
                .unwrap();
        assert!(matches!(
            c.set_partitioning(&mut backend, p),
            Err(Error::Config { .. })
        ));
    }
}
