/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end transitions over the in-process collective transport,
//! one thread per simulated process.

use std::sync::Arc;
use std::sync::Once;
use std::thread;

use ndspan::Point;
use ndspan::Slice;
use ndspan::Space;
use tessera::AccessIntent;
use tessera::Container;
use tessera::DataType;
use tessera::Group;
use tessera::Partitioning;
use tessera::ReduceOp;
use tessera::TaskSlice;
use tessera::backend::collective::CollectiveBackend;
use tessera::comm::Collective;
use tessera::comm::LocalComm;

/// Route backend logging to the test writer, honoring `RUST_LOG`.
fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Run `f(rank, comm)` on one thread per rank and collect the results
/// in rank order.
fn spawn_world<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, LocalComm) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = LocalComm::world(n)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(rank, comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("world thread panicked"))
        .collect()
}

fn owned(rank: usize, slice: Slice, intent: AccessIntent) -> TaskSlice {
    TaskSlice {
        rank,
        slice,
        intent,
    }
}

#[test]
fn test_two_process_exchange() -> anyhow::Result<()> {
    init_logging();
    // space 1-d [0,8) of doubles; ranks swap halves and read what the
    // other wrote
    let results = spawn_world(2, |rank, comm| {
        let group = Group::world(vec![0, 1], rank as i32);
        let mut backend = CollectiveBackend::new(comm);
        let space = Space::new_1d(8);
        let mut data = Container::new(Arc::clone(&group), space, DataType::DOUBLE).unwrap();

        let old = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![
                owned(0, Slice::new_1d(0, 4), AccessIntent::ReadWrite),
                owned(1, Slice::new_1d(4, 8), AccessIntent::ReadWrite),
            ],
        )
        .unwrap();
        data.set_partitioning(&mut backend, old).unwrap();
        let mine = if rank == 0 { 0..4 } else { 4..8 };
        for i in mine {
            data.write_f64(&Point::d1(i), (i + 1) as f64).unwrap();
        }

        let new = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![
                owned(0, Slice::new_1d(4, 8), AccessIntent::ReadWrite),
                owned(1, Slice::new_1d(0, 4), AccessIntent::ReadWrite),
            ],
        )
        .unwrap();
        data.set_partitioning(&mut backend, new).unwrap();
        data.values_f64().unwrap()
    });

    assert_eq!(results[0], vec![5.0, 6.0, 7.0, 8.0]);
    assert_eq!(results[1], vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn test_sum_allreduce_of_four_doubles() -> anyhow::Result<()> {
    init_logging();
    // three processes hold private inputs {1...}, {2...}, {4...}; a
    // Reduce(Sum) re-partitioning leaves every process with {7...}
    let results = spawn_world(3, |rank, comm| {
        let group = Group::world(vec![0, 1, 2], rank as i32);
        let mut backend = CollectiveBackend::new(comm);
        let space = Space::new_1d(4);
        let mut data = Container::new(Arc::clone(&group), space, DataType::DOUBLE).unwrap();

        let private = Partitioning::all(
            Arc::clone(&group),
            space,
            AccessIntent::Reduce(ReduceOp::Sum),
        )
        .unwrap();
        data.set_partitioning(&mut backend, private).unwrap();
        // newly appearing Reduce region starts at the identity
        assert_eq!(data.values_f64().unwrap(), vec![0.0; 4]);
        data.fill_f64([1.0, 2.0, 4.0][rank]).unwrap();

        let reduced = Partitioning::all(
            Arc::clone(&group),
            space,
            AccessIntent::Reduce(ReduceOp::Sum),
        )
        .unwrap();
        data.set_partitioning(&mut backend, reduced).unwrap();
        data.values_f64().unwrap()
    });

    for values in results {
        assert_eq!(values, vec![7.0; 4]);
    }
    Ok(())
}

#[test]
fn test_manual_subgroup_reduce() -> anyhow::Result<()> {
    init_logging();
    // input group {0, 1}, output group {2}, Max over 2 doubles
    let results = spawn_world(3, |rank, comm| {
        let group = Group::world(vec![0, 1, 2], rank as i32);
        let mut backend = CollectiveBackend::new(comm);
        let space = Space::new_1d(2);
        let mut data = Container::new(Arc::clone(&group), space, DataType::DOUBLE).unwrap();

        let inputs = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![
                owned(0, Slice::new_1d(0, 2), AccessIntent::Reduce(ReduceOp::Max)),
                owned(1, Slice::new_1d(0, 2), AccessIntent::Reduce(ReduceOp::Max)),
            ],
        )
        .unwrap();
        data.set_partitioning(&mut backend, inputs).unwrap();
        match rank {
            0 => {
                data.write_f64(&Point::d1(0), 3.0).unwrap();
                data.write_f64(&Point::d1(1), 9.0).unwrap();
            }
            1 => {
                data.write_f64(&Point::d1(0), 7.0).unwrap();
                data.write_f64(&Point::d1(1), 5.0).unwrap();
            }
            _ => {}
        }

        let output = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![owned(2, Slice::new_1d(0, 2), AccessIntent::Reduce(ReduceOp::Max))],
        )
        .unwrap();
        data.set_partitioning(&mut backend, output).unwrap();
        data.values_f64().unwrap()
    });

    assert_eq!(results[2], vec![7.0, 9.0]);
    // the input ranks own nothing under the new partitioning
    assert!(results[0].is_empty());
    assert!(results[1].is_empty());
    Ok(())
}

#[test]
fn test_two_dimensional_exchange_packs() -> anyhow::Result<()> {
    init_logging();
    // 4x2 space; the non-contiguous columns force the pack/unpack path
    let results = spawn_world(2, |rank, comm| {
        let group = Group::world(vec![0, 1], rank as i32);
        let mut backend = CollectiveBackend::new(comm);
        let space = Space::new_2d(4, 2);
        let mut data = Container::new(Arc::clone(&group), space, DataType::DOUBLE).unwrap();

        let left = Slice::new_2d((0, 0), (2, 2));
        let right = Slice::new_2d((2, 0), (4, 2));
        let old = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![
                owned(0, left, AccessIntent::ReadWrite),
                owned(1, right, AccessIntent::ReadWrite),
            ],
        )
        .unwrap();
        data.set_partitioning(&mut backend, old).unwrap();
        let mine = if rank == 0 { left } else { right };
        for p in mine.iter() {
            data.write_f64(&p, (10 * p.get(0) + p.get(1)) as f64).unwrap();
        }

        let new = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![
                owned(0, right, AccessIntent::ReadWrite),
                owned(1, left, AccessIntent::ReadWrite),
            ],
        )
        .unwrap();
        data.set_partitioning(&mut backend, new).unwrap();

        let mine = if rank == 0 { right } else { left };
        mine.iter()
            .map(|p| data.read_f64(&p).unwrap())
            .collect::<Vec<f64>>()
    });

    // every element still equals 10x + y after the swap
    assert_eq!(results[0], vec![20.0, 30.0, 21.0, 31.0]);
    assert_eq!(results[1], vec![0.0, 10.0, 1.0, 11.0]);
    Ok(())
}

#[test]
fn test_there_and_back_restores_values() -> anyhow::Result<()> {
    init_logging();
    // planning old -> new -> old with writer intents restores the
    // original owner layout and values
    let results = spawn_world(2, |rank, comm| {
        let group = Group::world(vec![0, 1], rank as i32);
        let mut backend = CollectiveBackend::new(comm);
        let space = Space::new_1d(6);
        let mut data = Container::new(Arc::clone(&group), space, DataType::DOUBLE).unwrap();

        let forward = Partitioning::block_1d(
            Arc::clone(&group),
            space,
            AccessIntent::ReadWrite,
        )
        .unwrap();
        data.set_partitioning(&mut backend, forward).unwrap();
        let base = rank as i64 * 3;
        for i in base..base + 3 {
            data.write_f64(&Point::d1(i), (100 + i) as f64).unwrap();
        }

        let swapped = Partitioning::from_slices(
            Arc::clone(&group),
            space,
            vec![
                owned(0, Slice::new_1d(3, 6), AccessIntent::ReadWrite),
                owned(1, Slice::new_1d(0, 3), AccessIntent::ReadWrite),
            ],
        )
        .unwrap();
        data.set_partitioning(&mut backend, swapped).unwrap();

        let back = Partitioning::block_1d(
            Arc::clone(&group),
            space,
            AccessIntent::ReadWrite,
        )
        .unwrap();
        data.set_partitioning(&mut backend, back).unwrap();
        data.values_f64().unwrap()
    });

    assert_eq!(results[0], vec![100.0, 101.0, 102.0]);
    assert_eq!(results[1], vec![103.0, 104.0, 105.0]);
    Ok(())
}

#[test]
fn test_update_group_required_for_derived_groups() -> anyhow::Result<()> {
    init_logging();
    let mut comms = LocalComm::world(1);
    let comm = comms.remove(0);
    assert_eq!(comm.size(), 1);
    let mut backend = CollectiveBackend::new(comm);
    let group = Group::world(vec![0, 1, 2], 0);
    let shrunk = Group::shrink(&group, &[2])?;
    use tessera::backend::Backend;
    backend.update_group(&shrunk)?;
    // a second installation for the same group is a config error
    assert!(backend.update_group(&shrunk).is_err());
    Ok(())
}
