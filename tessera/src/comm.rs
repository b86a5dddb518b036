/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The group-collective transport the collective backend drives.
//!
//! [`Collective`] is the native primitive set: point-to-point
//! `send`/`recv` between world ranks plus a group reduction. The
//! in-process implementation, [`LocalComm`], wires a world of
//! endpoints together with per-pair FIFO channels; a world is created
//! once and its endpoints handed to one thread per simulated process.

use std::sync::mpsc;

use crate::error::Error;
use crate::error::Result;
use crate::types::DataType;
use crate::types::ReduceOp;

/// A group-collective transport endpoint.
///
/// Ranks are world ranks. Per ordered pair of ranks, messages arrive
/// in send order. [`Collective::reduce_group`] is the transport's
/// native reduction; the default implementation gathers at the lowest
/// output rank, reduces pairwise, and fans the result out.
pub trait Collective: Send {
    /// This endpoint's world rank.
    fn rank(&self) -> usize;

    /// World size.
    fn size(&self) -> usize;

    /// Deliver `data` to `to`.
    fn send(&mut self, to: usize, data: Vec<u8>) -> Result<()>;

    /// Block until the next message from `from` arrives.
    fn recv(&mut self, from: usize) -> Result<Vec<u8>>;

    /// Group reduction: combine the contributions of `inputs` with
    /// `op` and deliver the result to every rank in `outputs`.
    ///
    /// `contrib` must be given iff this rank is an input; `result`
    /// must be given iff it is an output. Passing the same region as
    /// contribution and result is expressed by the caller copying in
    /// place; the primitive never aliases the two.
    fn reduce_group(
        &mut self,
        inputs: &[usize],
        outputs: &[usize],
        dtype: &DataType,
        op: ReduceOp,
        contrib: Option<&[u8]>,
        result: Option<&mut [u8]>,
    ) -> Result<()> {
        let me = self.rank();
        let root = *outputs
            .first()
            .ok_or_else(|| Error::logic("reduction with empty output group".to_string()))?;

        if me != root {
            if inputs.contains(&me) {
                let contrib = contrib
                    .ok_or_else(|| Error::logic("input rank without contribution".to_string()))?;
                self.send(root, contrib.to_vec())?;
            }
            if outputs.contains(&me) {
                let result = result
                    .ok_or_else(|| Error::logic("output rank without result buffer".to_string()))?;
                let data = self.recv(root)?;
                if data.len() != result.len() {
                    return Err(Error::logic(format!(
                        "reduction result of {} bytes into buffer of {}",
                        data.len(),
                        result.len()
                    )));
                }
                result.copy_from_slice(&data);
            }
            return Ok(());
        }

        // this rank runs the reduction
        let mut acc: Option<Vec<u8>> = None;
        if inputs.contains(&me) {
            let contrib = contrib
                .ok_or_else(|| Error::logic("input rank without contribution".to_string()))?;
            acc = Some(contrib.to_vec());
        }
        for &i in inputs {
            if i == me {
                continue;
            }
            let data = self.recv(i)?;
            match &mut acc {
                None => acc = Some(data),
                Some(acc) => dtype.reduce_assign(acc, &data, op)?,
            }
        }
        let acc = acc.ok_or_else(|| Error::logic("reduction with no inputs".to_string()))?;
        for &o in outputs {
            if o == me {
                continue;
            }
            self.send(o, acc.clone())?;
        }
        if let Some(result) = result {
            result.copy_from_slice(&acc);
        }
        Ok(())
    }
}

/// In-process transport: one endpoint per simulated process, wired
/// with unbounded FIFO channels per ordered rank pair.
pub struct LocalComm {
    rank: usize,
    txs: Vec<mpsc::Sender<Vec<u8>>>,
    rxs: Vec<mpsc::Receiver<Vec<u8>>>,
}

impl LocalComm {
    /// Create a world of `n` wired endpoints; endpoint `r` is handed
    /// to the thread simulating rank `r`.
    pub fn world(n: usize) -> Vec<LocalComm> {
        let mut txs: Vec<Vec<Option<mpsc::Sender<Vec<u8>>>>> = (0..n)
            .map(|_| (0..n).map(|_| None).collect())
            .collect();
        let mut rxs: Vec<Vec<Option<mpsc::Receiver<Vec<u8>>>>> = (0..n)
            .map(|_| (0..n).map(|_| None).collect())
            .collect();
        for from in 0..n {
            for to in 0..n {
                let (tx, rx) = mpsc::channel();
                txs[from][to] = Some(tx);
                rxs[to][from] = Some(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (tx_row, rx_row))| LocalComm {
                rank,
                txs: tx_row
                    .into_iter()
                    .map(|t| t.expect("fully wired above"))
                    .collect(),
                rxs: rx_row
                    .into_iter()
                    .map(|r| r.expect("fully wired above"))
                    .collect(),
            })
            .collect()
    }
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.txs.len()
    }

    fn send(&mut self, to: usize, data: Vec<u8>) -> Result<()> {
        self.txs[to].send(data).map_err(|_| Error::PeerLost {
            lid: to as i32,
            reason: "endpoint dropped".to_string(),
        })
    }

    fn recv(&mut self, from: usize) -> Result<Vec<u8>> {
        self.rxs[from].recv().map_err(|_| Error::PeerLost {
            lid: from as i32,
            reason: "endpoint dropped".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairwise_fifo() {
        let mut world = LocalComm::world(2);
        let mut b = world.pop().unwrap();
        let mut a = world.pop().unwrap();
        a.send(1, vec![1]).unwrap();
        a.send(1, vec![2]).unwrap();
        assert_eq!(b.recv(0).unwrap(), vec![1]);
        assert_eq!(b.recv(0).unwrap(), vec![2]);
    }

    #[test]
    fn test_reduce_group_sum_all() {
        let world = LocalComm::world(3);
        let handles: Vec<_> = world
            .into_iter()
            .map(|mut comm| {
                std::thread::spawn(move || {
                    let contrib = ((comm.rank() + 1) as f64).to_ne_bytes().to_vec();
                    let mut result = [0u8; 8];
                    comm.reduce_group(
                        &[0, 1, 2],
                        &[0, 1, 2],
                        &DataType::DOUBLE,
                        ReduceOp::Sum,
                        Some(&contrib),
                        Some(&mut result),
                    )
                    .unwrap();
                    f64::from_ne_bytes(result)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6.0);
        }
    }

    #[test]
    fn test_reduce_group_disjoint_output() {
        // inputs {0, 1}, output {2}
        let world = LocalComm::world(3);
        let handles: Vec<_> = world
            .into_iter()
            .map(|mut comm| {
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    let contrib = [3.0f64, 9.0, 7.0, 5.0][rank.min(1) * 2..][..2]
                        .iter()
                        .flat_map(|v| v.to_ne_bytes())
                        .collect::<Vec<u8>>();
                    let mut result = [0u8; 16];
                    comm.reduce_group(
                        &[0, 1],
                        &[2],
                        &DataType::DOUBLE,
                        ReduceOp::Max,
                        (rank < 2).then_some(&contrib[..]),
                        (rank == 2).then_some(&mut result[..]),
                    )
                    .unwrap();
                    result
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let out: Vec<f64> = results[2]
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![7.0, 9.0]);
    }
}
