/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::MAX_DIMS;
use crate::Point;
use crate::SpanError;

/// A half-open hyper-rectangle `[from, to)` in an index space.
///
/// For every axis `from <= to`; the slice is empty iff any axis has
/// `from == to`. Slices are the unit of ownership in partitionings and
/// the unit of transfer in transitions.
///
/// ```
/// # use ndspan::{Point, Slice};
/// let s = Slice::new_1d(0, 8);
/// let t = Slice::new_1d(4, 12);
/// assert_eq!(s.intersection(&t), Some(Slice::new_1d(4, 8)));
/// assert_eq!(s.count(), 8);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    dims: usize,
    from: Point,
    to: Point,
}

impl Slice {
    /// Create a slice, validating `1 <= dims <= MAX_DIMS` and
    /// `from <= to` per axis.
    pub fn new(dims: usize, from: Point, to: Point) -> Result<Self, SpanError> {
        if dims == 0 || dims > MAX_DIMS {
            return Err(SpanError::InvalidDims {
                expected: MAX_DIMS,
                got: dims,
            });
        }
        for axis in 0..dims {
            if from.get(axis) > to.get(axis) {
                return Err(SpanError::InvalidBounds {
                    axis,
                    from: from.get(axis),
                    to: to.get(axis),
                });
            }
        }
        // normalize unused axes to the canonical [0, 1) so that count
        // and traversal need no special casing
        let mut from = from;
        let mut to = to;
        for axis in dims..MAX_DIMS {
            *from.get_mut(axis) = 0;
            *to.get_mut(axis) = 1;
        }
        Ok(Self { dims, from, to })
    }

    /// A 1-d slice `[from, to)`. Panics if `from > to`.
    pub fn new_1d(from: i64, to: i64) -> Self {
        Self::new(1, Point::d1(from), Point::d1(to)).expect("bounds checked by caller")
    }

    /// A 2-d slice.
    pub fn new_2d(from: (i64, i64), to: (i64, i64)) -> Self {
        Self::new(2, Point::d2(from.0, from.1), Point::d2(to.0, to.1))
            .expect("bounds checked by caller")
    }

    /// A 3-d slice.
    pub fn new_3d(from: (i64, i64, i64), to: (i64, i64, i64)) -> Self {
        Self::new(
            3,
            Point::d3(from.0, from.1, from.2),
            Point::d3(to.0, to.1, to.2),
        )
        .expect("bounds checked by caller")
    }

    /// Dimensionality of this slice.
    #[inline]
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Inclusive low corner.
    #[inline]
    pub fn from(&self) -> &Point {
        &self.from
    }

    /// Exclusive high corner.
    #[inline]
    pub fn to(&self) -> &Point {
        &self.to
    }

    /// True iff some axis has zero extent.
    pub fn is_empty(&self) -> bool {
        (0..self.dims).any(|d| self.from.get(d) == self.to.get(d))
    }

    /// Number of indices covered: the product of axis extents.
    pub fn count(&self) -> u64 {
        (0..self.dims)
            .map(|d| (self.to.get(d) - self.from.get(d)) as u64)
            .product()
    }

    /// True iff `p` lies inside the slice.
    pub fn contains(&self, p: &Point) -> bool {
        (0..self.dims).all(|d| p.get(d) >= self.from.get(d) && p.get(d) < self.to.get(d))
    }

    /// True iff every index of `self` lies inside `other`.
    pub fn is_within(&self, other: &Slice) -> bool {
        if self.is_empty() {
            return true;
        }
        (0..self.dims).all(|d| {
            self.from.get(d) >= other.from.get(d) && self.to.get(d) <= other.to.get(d)
        })
    }

    /// The overlap of two slices, or `None` when they are disjoint.
    pub fn intersection(&self, other: &Slice) -> Option<Slice> {
        let mut from = self.from;
        let mut to = self.to;
        for d in 0..self.dims {
            *from.get_mut(d) = self.from.get(d).max(other.from.get(d));
            *to.get_mut(d) = self.to.get(d).min(other.to.get(d));
            if from.get(d) >= to.get(d) {
                return None;
            }
        }
        Some(Slice {
            dims: self.dims,
            from,
            to,
        })
    }

    /// The bounding box covering both slices. Empty operands are
    /// absorbed.
    pub fn hull(&self, other: &Slice) -> Slice {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Slice {
            dims: self.dims,
            from: self.from.min(&other.from, self.dims),
            to: self.to.max(&other.to, self.dims),
        }
    }

    /// Iterate all covered points in lexicographic order, axis 0
    /// varying fastest.
    pub fn iter(&self) -> LexIter {
        LexIter {
            slice: *self,
            next: (!self.is_empty()).then_some(self.from),
        }
    }
}

/// Advance `idx` to the next point of `slc` in lexicographic order
/// (axis 0 fastest). Returns `false` when the traversal is complete;
/// `idx` is then unspecified.
///
/// This is the stepper behind [`LexIter`] and the pack/unpack cursors,
/// which need to resume a traversal across calls.
pub fn next_lex(slc: &Slice, idx: &mut Point) -> bool {
    for d in 0..slc.dims() {
        *idx.get_mut(d) += 1;
        if idx.get(d) < slc.to().get(d) {
            return true;
        }
        *idx.get_mut(d) = slc.from().get(d);
    }
    false
}

/// Iterator over the points of a [`Slice`] in lexicographic order.
pub struct LexIter {
    slice: Slice,
    next: Option<Point>,
}

impl Iterator for LexIter {
    type Item = Point;

    fn next(&mut self) -> Option<Point> {
        let cur = self.next?;
        let mut idx = cur;
        self.next = next_lex(&self.slice, &mut idx).then_some(idx);
        Some(cur)
    }
}

impl<'a> IntoIterator for &'a Slice {
    type Item = Point;
    type IntoIter = LexIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for d in 0..self.dims {
            if d > 0 {
                write!(f, "x")?;
            }
            write!(f, "[{};{}[", self.from.get(d), self.to.get(d))?;
        }
        Ok(())
    }
}
