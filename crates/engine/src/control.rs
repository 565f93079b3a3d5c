// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Control and readiness lanes between the orchestrator and its contexts.
//!
//! The orchestrator holds one control lane per context, carrying topology
//! mutations in FIFO order. All contexts share a single readiness lane back
//! to the orchestrator, on which each announces itself exactly once after
//! its resources are initialized.

use crate::node::ShippedNode;
use flowmesh_config::{ContextId, NodeId};
use serde::{Deserialize, Serialize};

/// A topology mutation shipped to a context worker.
///
/// Duplicated frames are harmless: `connect`/`disconnect` are idempotent by
/// construction, and the orchestrator guards `add` against duplicate ids
/// before shipping.
#[derive(Debug)]
pub enum ControlMsg {
    /// Instantiate a node in the context.
    Add(ShippedNode),
    /// Drop a node, disconnecting it from every recorded neighbor first.
    Remove(NodeId),
    /// Wire two nodes that both live in the context.
    Connect {
        /// The emitting side.
        parent: NodeId,
        /// The collecting side.
        child: NodeId,
    },
    /// Unwire two nodes that both live in the context.
    Disconnect {
        /// The emitting side.
        parent: NodeId,
        /// The collecting side.
        child: NodeId,
    },
}

/// Readiness announcement, context to orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMsg {
    /// The context that finished initializing its resources.
    pub ready: ContextId,
}

/// Sending end of a context's control lane.
pub type ControlSender = flume::Sender<ControlMsg>;
/// Receiving end of a context's control lane.
pub type ControlReceiver = flume::Receiver<ControlMsg>;
/// Sending end of the shared readiness lane.
pub type ReadySender = flume::Sender<ReadyMsg>;
/// Receiving end of the shared readiness lane.
pub type ReadyReceiver = flume::Receiver<ReadyMsg>;

/// Creates one context's control lane.
#[must_use]
pub fn control_channel(capacity: usize) -> (ControlSender, ControlReceiver) {
    flume::bounded(capacity)
}

/// Creates the shared readiness lane.
#[must_use]
pub fn readiness_channel() -> (ReadySender, ReadyReceiver) {
    flume::unbounded()
}
