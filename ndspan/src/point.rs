/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

/// The maximum dimensionality of a [`Space`](crate::Space).
pub const MAX_DIMS: usize = 3;

/// A coordinate in an index space of up to [`MAX_DIMS`] dimensions.
///
/// Points carry all `MAX_DIMS` coordinates; axes beyond the owning
/// space's dimensionality are zero and ignored by every operation.
/// This fixed-size representation keeps points `Copy`, which the
/// planner and the pack/unpack cursors rely on.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point(pub [i64; MAX_DIMS]);

impl Point {
    /// The origin.
    pub const ZERO: Point = Point([0; MAX_DIMS]);

    /// A 1-d point.
    pub fn d1(x: i64) -> Self {
        Point([x, 0, 0])
    }

    /// A 2-d point.
    pub fn d2(x: i64, y: i64) -> Self {
        Point([x, y, 0])
    }

    /// A 3-d point.
    pub fn d3(x: i64, y: i64, z: i64) -> Self {
        Point([x, y, z])
    }

    /// Coordinate on the given axis.
    #[inline]
    pub fn get(&self, axis: usize) -> i64 {
        self.0[axis]
    }

    /// Mutable coordinate on the given axis.
    #[inline]
    pub fn get_mut(&mut self, axis: usize) -> &mut i64 {
        &mut self.0[axis]
    }

    /// Component-wise maximum over the first `dims` axes.
    pub fn max(&self, other: &Point, dims: usize) -> Point {
        let mut out = *self;
        for d in 0..dims {
            out.0[d] = self.0[d].max(other.0[d]);
        }
        out
    }

    /// Component-wise minimum over the first `dims` axes.
    pub fn min(&self, other: &Point, dims: usize) -> Point {
        let mut out = *self;
        for d in 0..dims {
            out.0[d] = self.0[d].min(other.0[d]);
        }
        out
    }

    /// Renders `x`, `x/y` or `x/y/z` depending on `dims`, the format
    /// used in wire position tags.
    pub fn display(&self, dims: usize) -> String {
        match dims {
            1 => format!("{}", self.0[0]),
            2 => format!("{}/{}", self.0[0], self.0[1]),
            _ => format!("{}/{}/{}", self.0[0], self.0[1], self.0[2]),
        }
    }

    /// Parses the `display` format back into a point. Returns `None`
    /// on malformed input or a coordinate count other than `dims`.
    pub fn parse(s: &str, dims: usize) -> Option<Point> {
        let mut out = Point::ZERO;
        let mut n = 0;
        for part in s.split('/') {
            if n >= dims {
                return None;
            }
            out.0[n] = part.parse().ok()?;
            n += 1;
        }
        (n == dims).then_some(out)
    }
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}
