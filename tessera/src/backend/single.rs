/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The degenerate one-process backend.
//!
//! With a world of one there is nothing to move between processes: a
//! reduction of a single contribution is the contribution itself, and
//! the planner never emits sends or receives. Local copies and
//! identity initialization are the container's job after `exec`.

use crate::backend::Action;
use crate::backend::Backend;
use crate::backend::ExecCtx;
use crate::backend::TransitionPlan;
use crate::error::Error;
use crate::error::Result;
use crate::transition::Transition;
use crate::types::DataType;

/// Backend for a single-process world.
#[derive(Debug, Default)]
pub struct SingleBackend;

impl SingleBackend {
    /// A new single-process backend.
    pub fn new() -> Self {
        Self
    }
}

impl Backend for SingleBackend {
    fn name(&self) -> &'static str {
        "single"
    }

    fn prepare(
        &mut self,
        _dtype: &DataType,
        transition: &Transition,
    ) -> Result<Option<TransitionPlan>> {
        // a one-member reduction is a copy of the only contribution,
        // so the whole plan is copy actions
        let mut plan = TransitionPlan::new();
        for red in &transition.red {
            plan.record(Action::Copy {
                from_map: red.from_map,
                to_map: red.to_map,
                slice: red.slice,
            });
        }
        Ok(Some(plan))
    }

    fn exec(
        &mut self,
        ctx: &mut ExecCtx<'_>,
        plan: Option<&mut TransitionPlan>,
    ) -> Result<()> {
        let t = ctx.transition;
        if !t.send.is_empty() || !t.recv.is_empty() {
            return Err(Error::config(format!(
                "single backend cannot transfer data ({} sends, {} recvs planned)",
                t.send.len(),
                t.recv.len()
            )));
        }
        let copies: Vec<_> = match plan {
            Some(plan) => plan
                .actions()
                .iter()
                .map(|action| match action {
                    Action::Copy {
                        from_map,
                        to_map,
                        slice,
                    } => Ok((*from_map, *to_map, *slice)),
                    other => Err(Error::logic(format!(
                        "single backend plan holds a transfer action {other:?}"
                    ))),
                })
                .collect::<Result<_>>()?,
            None => t
                .red
                .iter()
                .map(|red| (red.from_map, red.to_map, red.slice))
                .collect(),
        };
        for (from_map, to_map, slice) in copies {
            let from = ctx
                .from
                .ok_or_else(|| Error::logic("reduction without old mapping".to_string()))?
                .map(from_map)?;
            ctx.to.map_mut(to_map)?.copy_slice_from(from, &slice)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::Container;
    use crate::group::Group;
    use crate::partitioning::AccessIntent;
    use crate::partitioning::Partitioning;
    use crate::types::DataType;
    use crate::types::ReduceOp;
    use ndspan::Space;

    #[test]
    fn test_single_reduction_is_copy() {
        let g = Group::world(vec![0], 0);
        let mut backend = SingleBackend::new();
        let space = Space::new_1d(4);
        let mut c = Container::new(Arc::clone(&g), space, DataType::DOUBLE).unwrap();
        let p = Partitioning::all(
            Arc::clone(&g),
            space,
            AccessIntent::Reduce(ReduceOp::Sum),
        )
        .unwrap();
        c.set_partitioning(&mut backend, p).unwrap();
        c.fill_f64(5.0).unwrap();

        let p2 = Partitioning::all(
            Arc::clone(&g),
            space,
            AccessIntent::Reduce(ReduceOp::Sum),
        )
        .unwrap();
        c.set_partitioning(&mut backend, p2).unwrap();
        assert_eq!(c.values_f64().unwrap(), vec![5.0; 4]);
    }
}
