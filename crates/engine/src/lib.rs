// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Graph execution substrate: the node contract, the per-context cooperative
//! scheduler, and the transport lanes between the orchestrator and its
//! context workers.
//!
//! A node is a tagged combination of two optional surfaces:
//!
//! - an **emitter** surface: an output record plus a sink registry;
//! - a **collector** surface: a source registry plus per-source completion
//!   flags.
//!
//! Each surface is refined by an [`node::Arity`], which encodes the six
//! constrained topologies (single/many × emitter/collector/router) at
//! construction time. The node-specific computation lives behind the
//! [`node::Kernel`] trait; everything else (wiring, readiness accounting,
//! fan-out) is uniform and lives in [`node`] and [`activation`].
//!
//! A context worker owns the live instances of the nodes placed in it and
//! drives all root emitters through a completion-queue scheduler on a
//! single-threaded runtime; see [`context`].

pub mod activation;
pub mod bus;
pub mod context;
pub mod control;
pub mod error;
pub mod node;
pub mod resource;

pub use activation::activate;
pub use bus::{BusPublisher, BusSubscriber, NotifyBus, await_terminal};
pub use context::{WorkerSettings, run_worker};
pub use control::{
    ControlMsg, ControlReceiver, ControlSender, ReadyMsg, ReadyReceiver, ReadySender,
    control_channel, readiness_channel,
};
pub use error::Error;
pub use node::{
    Arity, Blueprint, Kernel, Node, NodeBuilder, NodeCell, NodeManifest, Propagate, ShippedNode,
};
pub use resource::{ResourceMap, ResourceSpec, Resources};
