// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Node activation: readiness accounting, kernel dispatch and fan-out.
//!
//! One activation covers every variant of the contract:
//!
//! - a scheduler tick (`trigger == None`) runs a root emitter's kernel and
//!   fans out;
//! - a source trigger on a many-source collector records the completion
//!   flag and runs the kernel only when every source has fired, with
//!   inputs in source-registry insertion order, resetting flags afterwards;
//! - a source trigger on a single-source collector dispatches directly,
//!   with no flag accounting;
//! - a router is the collector path followed by the emitter path.
//!
//! Fan-out is a concurrent frontier: every sink activation is dispatched
//! together and awaited together, so the caller returns only when the
//! reachable subgraph below it has quiesced.

use crate::error::Error;
use crate::node::{Arity, NodeCell, Propagate};
use flowmesh_config::NodeId;
use futures::future::{LocalBoxFuture, join_all};

/// Activates a node, driving its kernel and, when the node completes with
/// propagation, its entire reachable frontier.
///
/// `trigger` is `None` for a scheduler tick of a root emitter and
/// `Some(source)` for a completion trigger from that source.
pub fn activate(cell: NodeCell, trigger: Option<NodeId>) -> LocalBoxFuture<'static, Result<(), Error>> {
    Box::pin(async move {
        let (node_id, kernel_rc, inputs, mut scratch) = {
            let mut node = cell.borrow_mut();
            let node_id = node.id().clone();
            let inputs = match &trigger {
                None => {
                    if node.in_arity().is_some() {
                        return Err(Error::InvalidActivation {
                            node: node_id,
                            detail: "scheduler tick on a collecting node".to_owned(),
                        });
                    }
                    Vec::new()
                }
                Some(source) => {
                    if !node.has_source(source) {
                        return Err(Error::UnknownSource {
                            node: node_id,
                            source_node: source.clone(),
                        });
                    }
                    match node.in_arity() {
                        Some(Arity::Many) => {
                            node.record_flag(source);
                            if !node.all_flags() {
                                return Ok(());
                            }
                            node.gather_inputs()?
                        }
                        Some(Arity::One) => node.gather_inputs()?,
                        None => {
                            return Err(Error::InvalidActivation {
                                node: node_id,
                                detail: "completion trigger on a non-collecting node".to_owned(),
                            });
                        }
                    }
                }
            };
            let scratch = node.output().cloned();
            (node_id, node.kernel_handle(), inputs, scratch)
        };

        // The kernel may already be mid-compute (triggers from two
        // independent upstream frontiers). The flag above is recorded; the
        // in-flight cycle's reset clears it, keeping compute at most once
        // per readiness cycle.
        let Ok(mut kernel) = kernel_rc.try_borrow_mut() else {
            return Ok(());
        };
        let verdict = kernel.compute(&inputs, scratch.as_mut()).await;
        let finished = kernel.finished() == Some(true);
        let announced = if finished {
            kernel.announce_finished().await
        } else {
            Ok(())
        };
        drop(kernel);

        // Commit the output and reset flags before surfacing any kernel
        // error, so a failed tick leaves the node reusable.
        let sinks = {
            let mut node = cell.borrow_mut();
            node.put_output(scratch);
            if node.in_arity() == Some(Arity::Many) {
                node.reset_flags();
            }
            let verdict = verdict?;
            announced?;
            if !finished && verdict == Propagate::Forward && node.out_arity().is_some() {
                node.sink_cells()?
            } else {
                Vec::new()
            }
        };
        if sinks.is_empty() {
            return Ok(());
        }

        let results = join_all(
            sinks
                .into_iter()
                .map(|sink| activate(sink, Some(node_id.clone()))),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    })
}
