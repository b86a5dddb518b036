/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Memory layouts: the translation from index to byte offset, and the
//! serialization of non-contiguous regions.
//!
//! A [`Layout`] maps points of a required hull to element offsets and
//! provides `pack`/`unpack` of a slice through a bounded buffer with
//! partial progress: the cursor advances in lexicographic order (axis
//! 0 fastest) and callers re-invoke until it reaches `slice.to`. The
//! default and only concrete variant is the dense row-major
//! [`DenseLayout`].

use ndspan::Point;
use ndspan::Slice;
use ndspan::next_lex;

/// A memory layout over a required hull.
///
/// `pack` and `unpack` have default implementations in terms of
/// [`Layout::offset`]; concrete layouts with a cheaper bulk path may
/// override them.
pub trait Layout: std::fmt::Debug + Send {
    /// The hull of indices this layout addresses.
    fn required(&self) -> &Slice;

    /// Element offset (not bytes) of `idx` within the mapping.
    fn offset(&self, idx: &Point) -> usize;

    /// Serialize elements of `slc` from `src` into `buf`, starting at
    /// `cursor`. Returns bytes written; `cursor` is advanced past the
    /// packed elements and equals `slc.to` once the slice is done.
    fn pack(
        &self,
        src: &[u8],
        elemsize: usize,
        slc: &Slice,
        cursor: &mut Point,
        buf: &mut [u8],
    ) -> usize {
        let mut written = 0;
        if *cursor == *slc.to() {
            return 0;
        }
        while written + elemsize <= buf.len() {
            let off = self.offset(cursor) * elemsize;
            buf[written..written + elemsize].copy_from_slice(&src[off..off + elemsize]);
            written += elemsize;
            if !next_lex(slc, cursor) {
                *cursor = *slc.to();
                break;
            }
        }
        written
    }

    /// Deposit elements of `slc` from `buf` into `dst`, starting at
    /// `cursor`. Returns bytes consumed; `cursor` mirrors [`Layout::pack`].
    fn unpack(
        &self,
        dst: &mut [u8],
        elemsize: usize,
        slc: &Slice,
        cursor: &mut Point,
        buf: &[u8],
    ) -> usize {
        let mut consumed = 0;
        if *cursor == *slc.to() {
            return 0;
        }
        while consumed + elemsize <= buf.len() {
            let off = self.offset(cursor) * elemsize;
            dst[off..off + elemsize].copy_from_slice(&buf[consumed..consumed + elemsize]);
            consumed += elemsize;
            if !next_lex(slc, cursor) {
                *cursor = *slc.to();
                break;
            }
        }
        consumed
    }
}

/// Dense row-major layout: axis 0 has stride 1, each further axis
/// strides by the product of the extents before it.
#[derive(Debug, Clone)]
pub struct DenseLayout {
    required: Slice,
    strides: [usize; ndspan::MAX_DIMS],
}

impl DenseLayout {
    /// Layout addressing the given hull.
    pub fn new(required: Slice) -> Self {
        let mut strides = [0usize; ndspan::MAX_DIMS];
        let mut stride = 1usize;
        for d in 0..required.dims() {
            strides[d] = stride;
            stride *= (required.to().get(d) - required.from().get(d)) as usize;
        }
        Self { required, strides }
    }
}

impl Layout for DenseLayout {
    fn required(&self) -> &Slice {
        &self.required
    }

    fn offset(&self, idx: &Point) -> usize {
        let mut off = 0;
        for d in 0..self.required.dims() {
            off += (idx.get(d) - self.required.from().get(d)) as usize * self.strides[d];
        }
        off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_offsets_1d() {
        let l = DenseLayout::new(Slice::new_1d(4, 8));
        assert_eq!(l.offset(&Point::d1(4)), 0);
        assert_eq!(l.offset(&Point::d1(7)), 3);
    }

    #[test]
    fn test_dense_offsets_2d_axis0_fastest() {
        let l = DenseLayout::new(Slice::new_2d((0, 0), (3, 2)));
        assert_eq!(l.offset(&Point::d2(0, 0)), 0);
        assert_eq!(l.offset(&Point::d2(1, 0)), 1);
        assert_eq!(l.offset(&Point::d2(0, 1)), 3);
        assert_eq!(l.offset(&Point::d2(2, 1)), 5);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        // 4x4 region, pack an interior 2x2 slice, unpack into a fresh
        // buffer with the same layout; the slice bytes must reproduce.
        let hull = Slice::new_2d((0, 0), (4, 4));
        let l = DenseLayout::new(hull);
        let elemsize = 2usize;
        let src: Vec<u8> = (0..16 * elemsize as i32).map(|v| v as u8).collect();

        let slc = Slice::new_2d((1, 1), (3, 3));
        let mut cursor = *slc.from();
        let mut buf = vec![0u8; 64];
        let written = l.pack(&src, elemsize, &slc, &mut cursor, &mut buf);
        assert_eq!(written, 4 * elemsize);
        assert_eq!(cursor, *slc.to());

        let mut dst = vec![0u8; src.len()];
        let mut cursor = *slc.from();
        let consumed = l.unpack(&mut dst, elemsize, &slc, &mut cursor, &buf[..written]);
        assert_eq!(consumed, written);
        assert_eq!(cursor, *slc.to());

        for p in slc.iter() {
            let off = l.offset(&p) * elemsize;
            assert_eq!(&dst[off..off + elemsize], &src[off..off + elemsize]);
        }
    }

    #[test]
    fn test_pack_partial_progress() {
        let hull = Slice::new_1d(0, 8);
        let l = DenseLayout::new(hull);
        let src: Vec<u8> = (0..8).collect();
        let slc = Slice::new_1d(0, 8);

        // a 3-byte buffer forces one element per call
        let mut cursor = *slc.from();
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        let mut calls = 0;
        while cursor != *slc.to() {
            let n = l.pack(&src, 1, &slc, &mut cursor, &mut buf);
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
            calls += 1;
        }
        assert_eq!(out, src);
        assert_eq!(calls, 3); // 3 + 3 + 2 elements
    }
}
