/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Property-based generators for [`Slice`] and related types.
//!
//! The main entry point is [`gen_slice_pair(max_len)`], which
//! generates two random slices of equal dimensionality inside a small
//! domain, used to exercise the algebraic laws the transition planner
//! depends on.

use proptest::prelude::*;

use crate::Point;
use crate::Slice;

/// Generates a random slice of the given dimensionality where each
/// axis spans a sub-range of `[0, max_len)`. May be empty.
fn gen_slice(dims: usize, max_len: i64) -> impl Strategy<Value = Slice> {
    let axis = (0..max_len).prop_flat_map(move |from| (Just(from), from..=max_len));
    proptest::collection::vec(axis, dims).prop_map(move |axes| {
        let mut from = Point::ZERO;
        let mut to = Point::ZERO;
        for (d, (f, t)) in axes.iter().enumerate() {
            *from.get_mut(d) = *f;
            *to.get_mut(d) = *t;
        }
        Slice::new(dims, from, to).expect("axis ranges are ordered by construction")
    })
}

/// Two random slices with a shared dimensionality in `1..=3`.
fn gen_slice_pair(max_len: i64) -> impl Strategy<Value = (Slice, Slice)> {
    (1usize..=3).prop_flat_map(move |dims| (gen_slice(dims, max_len), gen_slice(dims, max_len)))
}

proptest! {
    #[test]
    fn test_intersection_commutes((a, b) in gen_slice_pair(6)) {
        prop_assert_eq!(a.intersection(&b), b.intersection(&a));
    }

    #[test]
    fn test_intersection_is_contained((a, b) in gen_slice_pair(6)) {
        if let Some(i) = a.intersection(&b) {
            prop_assert!(i.is_within(&a));
            prop_assert!(i.is_within(&b));
            prop_assert!(i.count() <= a.count().min(b.count()));
        }
    }

    #[test]
    fn test_iter_len_is_count((a, _) in gen_slice_pair(6)) {
        prop_assert_eq!(a.iter().count() as u64, a.count());
    }

    #[test]
    fn test_hull_covers_both((a, b) in gen_slice_pair(6)) {
        let h = a.hull(&b);
        prop_assert!(a.is_within(&h));
        prop_assert!(b.is_within(&h));
    }
}
