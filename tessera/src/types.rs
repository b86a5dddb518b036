/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Value descriptors and the per-type reduction engine.
//!
//! A [`DataType`] describes the elements stored in a container: a
//! name, a kind, and the element size in bytes. Reducible kinds
//! additionally carry the element-wise reduction used by transitions
//! with a [`ReduceOp`] access intent, and the per-operator identity
//! initializer for newly appearing regions.
//!
//! Reduction is exposed in accumulate form, `dst = dst op src`, so the
//! in-place convention (reducing into one of the inputs) is the only
//! form and needs no aliasing care. Elements are native-endian in
//! mapping memory.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// Reduction operators understood by reducible value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise addition; identity 0.
    Sum,
    /// Element-wise multiplication; identity 1.
    Prod,
    /// Element-wise minimum; identity is the type maximum.
    Min,
    /// Element-wise maximum; identity is the type minimum.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => write!(f, "sum"),
            ReduceOp::Prod => write!(f, "prod"),
            ReduceOp::Min => write!(f, "min"),
            ReduceOp::Max => write!(f, "max"),
        }
    }
}

/// Whether a type supports element-wise reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Plain-old-data: copyable bytes, no reduce/init.
    Pod,
    /// Carries a reduce function and per-op identities.
    Reducible,
}

type ReduceFn = fn(&mut [u8], &[u8], ReduceOp);
type InitFn = fn(&mut [u8], ReduceOp);

/// A value descriptor for container elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    name: &'static str,
    kind: TypeKind,
    size: usize,
    reduce: Option<ReduceFn>,
    init: Option<InitFn>,
}

macro_rules! reducible_impl {
    ($mod_name:ident, $t:ty) => {
        mod $mod_name {
            use super::ReduceOp;

            const SIZE: usize = std::mem::size_of::<$t>();

            fn get(bytes: &[u8]) -> $t {
                <$t>::from_ne_bytes(bytes.try_into().expect("chunked to element size"))
            }

            pub(super) fn reduce_assign(dst: &mut [u8], src: &[u8], op: ReduceOp) {
                for (d, s) in dst.chunks_exact_mut(SIZE).zip(src.chunks_exact(SIZE)) {
                    let a = get(d);
                    let b = get(s);
                    let r = match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    };
                    d.copy_from_slice(&r.to_ne_bytes());
                }
            }

            pub(super) fn fill_identity(dst: &mut [u8], op: ReduceOp) {
                let v: $t = match op {
                    ReduceOp::Sum => 0 as $t,
                    ReduceOp::Prod => 1 as $t,
                    ReduceOp::Min => <$t>::MAX,
                    ReduceOp::Max => <$t>::MIN,
                };
                for d in dst.chunks_exact_mut(SIZE) {
                    d.copy_from_slice(&v.to_ne_bytes());
                }
            }
        }
    };
}

reducible_impl!(red_i32, i32);
reducible_impl!(red_i64, i64);
reducible_impl!(red_f32, f32);
reducible_impl!(red_f64, f64);

impl DataType {
    /// 1-byte plain-old-data.
    pub const CHAR: DataType = DataType {
        name: "char",
        kind: TypeKind::Pod,
        size: 1,
        reduce: None,
        init: None,
    };

    /// 32-bit signed integer, reducible.
    pub const INT32: DataType = DataType {
        name: "int32",
        kind: TypeKind::Reducible,
        size: 4,
        reduce: Some(red_i32::reduce_assign),
        init: Some(red_i32::fill_identity),
    };

    /// 64-bit signed integer, reducible.
    pub const INT64: DataType = DataType {
        name: "int64",
        kind: TypeKind::Reducible,
        size: 8,
        reduce: Some(red_i64::reduce_assign),
        init: Some(red_i64::fill_identity),
    };

    /// 32-bit float, reducible.
    pub const FLOAT: DataType = DataType {
        name: "float",
        kind: TypeKind::Reducible,
        size: 4,
        reduce: Some(red_f32::reduce_assign),
        init: Some(red_f32::fill_identity),
    };

    /// 64-bit float, reducible.
    pub const DOUBLE: DataType = DataType {
        name: "double",
        kind: TypeKind::Reducible,
        size: 8,
        reduce: Some(red_f64::reduce_assign),
        init: Some(red_f64::fill_identity),
    };

    /// A custom plain-old-data type of the given element size.
    pub fn new_pod(name: &'static str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::config(format!("type '{name}' has zero element size")));
        }
        Ok(DataType {
            name,
            kind: TypeKind::Pod,
            size,
            reduce: None,
            init: None,
        })
    }

    /// Type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Plain-old-data or reducible.
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Element size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True iff the type carries a reduction.
    pub fn is_reducible(&self) -> bool {
        self.kind == TypeKind::Reducible
    }

    /// Element-wise `dst = dst op src` over whole-element buffers.
    ///
    /// Both buffers must hold the same whole number of elements.
    pub fn reduce_assign(&self, dst: &mut [u8], src: &[u8], op: ReduceOp) -> Result<()> {
        let reduce = self.reduce.ok_or_else(|| {
            Error::config(format!("type '{}' does not support reduction", self.name))
        })?;
        if dst.len() != src.len() || dst.len() % self.size != 0 {
            return Err(Error::logic(format!(
                "reduce buffer mismatch: dst {} src {} elemsize {}",
                dst.len(),
                src.len(),
                self.size
            )));
        }
        reduce(dst, src, op);
        Ok(())
    }

    /// Fill a whole-element buffer with the identity of `op`.
    pub fn fill_identity(&self, dst: &mut [u8], op: ReduceOp) -> Result<()> {
        let init = self.init.ok_or_else(|| {
            Error::config(format!("type '{}' has no identity initializer", self.name))
        })?;
        if dst.len() % self.size != 0 {
            return Err(Error::logic(format!(
                "init buffer of {} bytes is not a whole number of {}-byte elements",
                dst.len(),
                self.size
            )));
        }
        init(dst, op);
        Ok(())
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
