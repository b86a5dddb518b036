/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rectangular index algebra for partitioned containers.
//!
//! Provides [`Space`], an index domain over 1 to 3 dimensions, and
//! [`Slice`], a half-open hyper-rectangle `[from, to)` inside such a
//! domain. See [`Slice`] for the operations (intersection, hull,
//! lexicographic traversal) that the transition planner and the data
//! layouts are built on.
//!
//! The crate is pure: no I/O, no allocation beyond the iterator
//! adapters, enabling reuse from both the runtime and its tests.

#![deny(missing_docs)]

mod point;
mod slice;
mod space;

pub use point::MAX_DIMS;
pub use point::Point;
pub use slice::LexIter;
pub use slice::Slice;
pub use slice::next_lex;
pub use space::Space;

/// Property-based generators for randomized test input.
#[cfg(test)]
mod strategy;

/// The type of error for index algebra operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SpanError {
    /// Dimensionality outside `1..=MAX_DIMS`, or two operands with
    /// different dimensionality.
    #[error("invalid dims: expected {expected}, got {got}")]
    InvalidDims {
        /// Expected dimensionality.
        expected: usize,
        /// Provided dimensionality.
        got: usize,
    },

    /// A bound with `from > to` on some axis.
    #[error("invalid bounds on axis {axis}: {from} > {to}")]
    InvalidBounds {
        /// Offending axis.
        axis: usize,
        /// Inclusive low bound.
        from: i64,
        /// Exclusive high bound.
        to: i64,
    },

    /// A negative coordinate where the domain requires `>= 0`.
    #[error("negative coordinate {value} on axis {axis}")]
    NegativeCoordinate {
        /// Offending axis.
        axis: usize,
        /// Offending value.
        value: i64,
    },
}
