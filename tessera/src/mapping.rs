/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mappings: the local memory backing one process's share of a
//! partitioning.

use ndspan::Point;
use ndspan::Slice;

use crate::error::Error;
use crate::error::Result;
use crate::layout::DenseLayout;
use crate::layout::Layout;
use crate::partitioning::Partitioning;
use crate::types::DataType;
use crate::types::ReduceOp;

/// Concrete memory for this process's owned region of one
/// partitioning: a byte buffer (empty when zero-sized), the element
/// count, the required hull, and the attached [`Layout`].
#[derive(Debug)]
pub struct Mapping {
    base: Vec<u8>,
    count: u64,
    elemsize: usize,
    layout: Option<Box<dyn Layout>>,
}

impl Mapping {
    /// Allocate zero-filled memory for `rank`'s share of `p`.
    pub fn alloc(dtype: &DataType, p: &Partitioning, rank: usize) -> Mapping {
        match p.required(rank) {
            Some(required) => {
                let count = required.count();
                Mapping {
                    base: vec![0u8; count as usize * dtype.size()],
                    count,
                    elemsize: dtype.size(),
                    layout: Some(Box::new(DenseLayout::new(required))),
                }
            }
            None => Mapping {
                base: Vec::new(),
                count: 0,
                elemsize: dtype.size(),
                layout: None,
            },
        }
    }

    /// A mapping backing no memory, used for ranks that own nothing.
    pub fn unbacked(dtype: &DataType) -> Mapping {
        Mapping {
            base: Vec::new(),
            count: 0,
            elemsize: dtype.size(),
            layout: None,
        }
    }

    /// Number of elements backed by this mapping.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Element size in bytes.
    pub fn elemsize(&self) -> usize {
        self.elemsize
    }

    /// The required hull, `None` for a zero-sized mapping.
    pub fn required(&self) -> Option<&Slice> {
        self.layout.as_ref().map(|l| l.required())
    }

    /// Raw backing bytes.
    pub fn base(&self) -> &[u8] {
        &self.base
    }

    /// Mutable backing bytes.
    pub fn base_mut(&mut self) -> &mut [u8] {
        &mut self.base
    }

    /// The attached layout. Errors on a zero-sized mapping.
    pub fn layout(&self) -> Result<&dyn Layout> {
        self.layout
            .as_deref()
            .ok_or_else(|| Error::logic("layout access on zero-sized mapping".to_string()))
    }

    /// Byte range of the element at `idx`.
    pub fn byte_range(&self, idx: &Point) -> Result<std::ops::Range<usize>> {
        let off = self.layout()?.offset(idx) * self.elemsize;
        Ok(off..off + self.elemsize)
    }

    /// Deposit one element at `idx`: overwrite, or combine with the
    /// existing value when a reduction operator is given.
    pub fn deposit(
        &mut self,
        dtype: &DataType,
        idx: &Point,
        bytes: &[u8],
        op: Option<ReduceOp>,
    ) -> Result<()> {
        let range = self.byte_range(idx)?;
        match op {
            None => self.base[range].copy_from_slice(bytes),
            Some(op) => dtype.reduce_assign(&mut self.base[range], bytes, op)?,
        }
        Ok(())
    }

    /// Copy the elements of `slc` from another mapping of the same
    /// element size. 1-d regions copy as one contiguous run.
    pub fn copy_slice_from(&mut self, from: &Mapping, slc: &Slice) -> Result<()> {
        if slc.is_empty() {
            return Ok(());
        }
        if slc.dims() == 1 {
            let es = self.elemsize;
            let dst = self.byte_range(slc.from())?.start;
            let src = from.byte_range(slc.from())?.start;
            let len = slc.count() as usize * es;
            self.base[dst..dst + len].copy_from_slice(&from.base[src..src + len]);
            return Ok(());
        }
        for p in slc.iter() {
            let dst = self.byte_range(&p)?;
            let src = from.byte_range(&p)?;
            self.base[dst].copy_from_slice(&from.base[src]);
        }
        Ok(())
    }

    /// Fill the elements of `slc` with the identity of `op`.
    pub fn fill_identity_slice(
        &mut self,
        dtype: &DataType,
        slc: &Slice,
        op: ReduceOp,
    ) -> Result<()> {
        if slc.is_empty() {
            return Ok(());
        }
        if slc.dims() == 1 {
            let start = self.byte_range(slc.from())?.start;
            let len = slc.count() as usize * self.elemsize;
            return dtype.fill_identity(&mut self.base[start..start + len], op);
        }
        for p in slc.iter() {
            let range = self.byte_range(&p)?;
            dtype.fill_identity(&mut self.base[range], op)?;
        }
        Ok(())
    }

    /// Pack elements of `slc` into `buf` from `cursor`, returning
    /// bytes written. See [`Layout::pack`].
    pub fn pack(&self, slc: &Slice, cursor: &mut Point, buf: &mut [u8]) -> Result<usize> {
        Ok(self
            .layout()?
            .pack(&self.base, self.elemsize, slc, cursor, buf))
    }

    /// Unpack elements of `slc` from `buf` at `cursor`, returning
    /// bytes consumed. See [`Layout::unpack`].
    pub fn unpack(&mut self, slc: &Slice, cursor: &mut Point, buf: &[u8]) -> Result<usize> {
        let layout = self
            .layout
            .as_deref()
            .ok_or_else(|| Error::logic("unpack into zero-sized mapping".to_string()))?;
        Ok(layout.unpack(&mut self.base, self.elemsize, slc, cursor, buf))
    }
}

/// The mappings of one container under one partitioning. Today every
/// partitioning yields exactly one mapping per process; transition
/// entries address mappings by number to keep the contract open.
#[derive(Debug)]
pub struct MappingList {
    maps: Vec<Mapping>,
}

impl MappingList {
    /// A list holding the given mappings.
    pub fn new(maps: Vec<Mapping>) -> Self {
        Self { maps }
    }

    /// Allocate the (single) mapping for `rank`'s share of `p`.
    pub fn alloc(dtype: &DataType, p: &Partitioning, rank: usize) -> Self {
        Self::new(vec![Mapping::alloc(dtype, p, rank)])
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// True iff no mappings are held.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// The mapping with the given number.
    pub fn map(&self, no: usize) -> Result<&Mapping> {
        self.maps
            .get(no)
            .ok_or_else(|| Error::logic(format!("mapping {no} out of {}", self.maps.len())))
    }

    /// The mapping with the given number, mutably.
    pub fn map_mut(&mut self, no: usize) -> Result<&mut Mapping> {
        let len = self.maps.len();
        self.maps
            .get_mut(no)
            .ok_or_else(|| Error::logic(format!("mapping {no} out of {len}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::group::Group;
    use crate::partitioning::AccessIntent;
    use crate::partitioning::TaskSlice;
    use ndspan::Space;

    fn part_1d(own: Slice) -> Partitioning {
        let g = Group::world(vec![0], 0);
        Partitioning::from_slices(
            Arc::clone(&g),
            Space::new_1d(16),
            vec![TaskSlice {
                rank: 0,
                slice: own,
                intent: AccessIntent::ReadWrite,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_alloc_sizes() {
        let p = part_1d(Slice::new_1d(4, 12));
        let m = Mapping::alloc(&DataType::DOUBLE, &p, 0);
        assert_eq!(m.count(), 8);
        assert_eq!(m.base().len(), 64);
        assert_eq!(m.required(), Some(&Slice::new_1d(4, 12)));
    }

    #[test]
    fn test_zero_sized_mapping() {
        let g = Group::world(vec![0, 1], 1);
        let p = Partitioning::from_slices(
            g,
            Space::new_1d(4),
            vec![TaskSlice {
                rank: 0,
                slice: Slice::new_1d(0, 4),
                intent: AccessIntent::Write,
            }],
        )
        .unwrap();
        let m = Mapping::alloc(&DataType::DOUBLE, &p, 1);
        assert_eq!(m.count(), 0);
        assert!(m.base().is_empty());
        assert!(m.required().is_none());
    }

    #[test]
    fn test_deposit_and_reduce() {
        let p = part_1d(Slice::new_1d(0, 4));
        let mut m = Mapping::alloc(&DataType::DOUBLE, &p, 0);
        let idx = Point::d1(2);
        m.deposit(&DataType::DOUBLE, &idx, &3.0f64.to_ne_bytes(), None)
            .unwrap();
        m.deposit(
            &DataType::DOUBLE,
            &idx,
            &4.0f64.to_ne_bytes(),
            Some(ReduceOp::Sum),
        )
        .unwrap();
        let range = m.byte_range(&idx).unwrap();
        assert_eq!(
            f64::from_ne_bytes(m.base()[range].try_into().unwrap()),
            7.0
        );
    }

    #[test]
    fn test_copy_slice_between_mappings() {
        let from_p = part_1d(Slice::new_1d(0, 8));
        let to_p = part_1d(Slice::new_1d(4, 12));
        let mut from = Mapping::alloc(&DataType::CHAR, &from_p, 0);
        let mut to = Mapping::alloc(&DataType::CHAR, &to_p, 0);
        for (i, b) in from.base_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
        to.copy_slice_from(&from, &Slice::new_1d(4, 8)).unwrap();
        assert_eq!(&to.base()[0..4], &[4, 5, 6, 7]);
    }
}
