/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::Point;
use crate::Slice;
use crate::SpanError;

/// An immutable index domain: dimensionality and an inclusive-low /
/// exclusive-high bound per axis. Bounds are finite and non-negative.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Space {
    slice: Slice,
}

impl Space {
    /// A domain with explicit bounds. Rejects negative coordinates.
    pub fn new(dims: usize, from: Point, to: Point) -> Result<Self, SpanError> {
        for axis in 0..dims {
            for value in [from.get(axis), to.get(axis)] {
                if value < 0 {
                    return Err(SpanError::NegativeCoordinate { axis, value });
                }
            }
        }
        Ok(Self {
            slice: Slice::new(dims, from, to)?,
        })
    }

    /// A 1-d domain `[0, s1)`.
    pub fn new_1d(s1: u64) -> Self {
        Self {
            slice: Slice::new_1d(0, s1 as i64),
        }
    }

    /// A 2-d domain `[0, s1) x [0, s2)`.
    pub fn new_2d(s1: u64, s2: u64) -> Self {
        Self {
            slice: Slice::new_2d((0, 0), (s1 as i64, s2 as i64)),
        }
    }

    /// A 3-d domain.
    pub fn new_3d(s1: u64, s2: u64, s3: u64) -> Self {
        Self {
            slice: Slice::new_3d((0, 0, 0), (s1 as i64, s2 as i64, s3 as i64)),
        }
    }

    /// Dimensionality.
    #[inline]
    pub fn dims(&self) -> usize {
        self.slice.dims()
    }

    /// The covering slice of the whole domain.
    #[inline]
    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    /// Total number of indices in the domain.
    pub fn count(&self) -> u64 {
        self.slice.count()
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slice)
    }
}
