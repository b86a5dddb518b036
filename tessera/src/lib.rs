/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tessera is a library for partitioned parallel data containers
//! across a group of cooperating processes.
//!
//! An application declares a logical index space (1-3 dimensions),
//! allocates a typed [`Container`] over it, and attaches a
//! [`Partitioning`] assigning index slices to each process. When the
//! application later re-partitions, the library computes the
//! [`Transition`](transition::Transition) between the old and the new
//! assignment and executes the required data movement: point-to-point
//! transfers, group reductions, in-process copies, and identity
//! initialization of newly appearing reduction regions. Processes may
//! join or leave between transitions.
//!
//! # Architecture
//!
//! * The **transition planner** ([`transition`]) diffs two
//!   partitionings into an action list. It is a pure function.
//! * **Backends** ([`backend`]) drive those actions over a transport:
//!   the collective backend walks a deadlock-free double-sweep
//!   schedule over a group-collective transport ([`comm`]); the
//!   point-to-point backend speaks a line-oriented TCP protocol with
//!   credit-based flow control and runs the bootstrap and membership
//!   machinery (home process rendezvous, location-ID assignment,
//!   elastic resize).
//! * **Layouts** ([`layout`]) translate indices to byte offsets and
//!   serialize non-contiguous regions through bounded buffers.
//!
//! Each process is single-threaded: backend entry points block until
//! their work completes, suspending cooperatively in an internal
//! event loop where they must wait for peers.
//!
//! # Example
//!
//! ```no_run
//! use ndspan::Space;
//! use tessera::AccessIntent;
//! use tessera::Container;
//! use tessera::DataType;
//! use tessera::Partitioning;
//!
//! let mut inst = tessera::init()?;
//! let space = Space::new_1d(1 << 20);
//! let mut data = Container::new(inst.world().clone(), space, DataType::DOUBLE)?;
//! let blocks = Partitioning::block_1d(inst.world().clone(), space, AccessIntent::Write)?;
//! inst.switch(&mut data, blocks)?;
//! data.fill_f64(0.0)?;
//! # Ok::<(), tessera::Error>(())
//! ```

#![deny(missing_docs)]

pub mod backend;
pub mod comm;
pub mod config;
pub mod data;
pub mod error;
pub mod group;
pub mod layout;
pub mod mapping;
pub mod partitioning;
pub mod transition;
pub mod types;

mod instance;

pub use config::BackendKind;
pub use config::Config;
pub use data::Container;
pub use error::Error;
pub use error::Result;
pub use group::Group;
pub use instance::Instance;
pub use instance::default_location;
pub use instance::init;
pub use instance::init_with;
pub use mapping::Mapping;
pub use mapping::MappingList;
pub use partitioning::AccessIntent;
pub use partitioning::Partitioning;
pub use partitioning::TaskSlice;
pub use types::DataType;
pub use types::ReduceOp;
