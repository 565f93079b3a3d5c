// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the graph execution substrate.
//!
//! These errors cross thread boundaries (worker results are surfaced to the
//! orchestrator at join time), so no `!Send` payloads.

use crate::resource::ResourceSpec;
use flowmesh_config::NodeId;

/// All errors that can occur in the execution substrate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wrapper for the data-layer errors.
    #[error("a data error occurred: {0}")]
    Data(#[from] flowmesh_data::Error),

    /// Adding a node under an id that is already registered.
    #[error("node `{node}` already exists")]
    NodeAlreadyExists {
        /// The duplicated node id.
        node: NodeId,
    },

    /// Addressing a node that is not registered.
    #[error("unknown node `{node}`")]
    UnknownNode {
        /// The unknown node id.
        node: NodeId,
    },

    /// A collector was triggered by a node that is not one of its sources.
    #[error("node `{node}` has no source `{source_node}`")]
    UnknownSource {
        /// The triggered collector.
        node: NodeId,
        /// The claimed source id.
        source_node: NodeId,
    },

    /// A node cannot be wired to itself.
    #[error("node `{node}` cannot be connected to itself")]
    SelfConnection {
        /// The offending node id.
        node: NodeId,
    },

    /// A second sink was assigned to a single-sink emitter.
    #[error("single-sink emitter `{node}` already sends to `{existing}`")]
    SinkAlreadyAssigned {
        /// The single-sink emitter.
        node: NodeId,
        /// Its existing sink.
        existing: NodeId,
    },

    /// A second source was assigned to a single-source collector.
    #[error("single-source collector `{node}` already receives from `{existing}`")]
    SourceAlreadyAssigned {
        /// The single-source collector.
        node: NodeId,
        /// Its existing source.
        existing: NodeId,
    },

    /// The parent side of an edge has no emitter surface.
    #[error("node `{node}` is not an emitter")]
    NotAnEmitter {
        /// The offending node id.
        node: NodeId,
    },

    /// The child side of an edge has no collector surface.
    #[error("node `{node}` is not a collector")]
    NotACollector {
        /// The offending node id.
        node: NodeId,
    },

    /// A root emitter was activated as if it had sources, or vice versa.
    #[error("node `{node}` cannot be activated this way: {detail}")]
    InvalidActivation {
        /// The offending node id.
        node: NodeId,
        /// What was wrong with the trigger.
        detail: String,
    },

    /// A wired neighbor was dropped without a disconnect.
    #[error("node `{node}` holds a stale handle to `{peer}`")]
    StaleHandle {
        /// The node holding the handle.
        node: NodeId,
        /// The dropped neighbor.
        peer: NodeId,
    },

    /// A node declaration whose surfaces are inconsistent.
    #[error("invalid manifest for node `{node}`: {detail}")]
    InvalidManifest {
        /// The offending node id.
        node: NodeId,
        /// The inconsistency.
        detail: String,
    },

    /// A kernel asked for a resource that was not provisioned.
    #[error("resource {resource:?} was not provided")]
    MissingResource {
        /// The resource that was requested.
        resource: ResourceSpec,
    },

    /// A kernel requested a resource this context cannot provide.
    #[error("resource {resource:?} is not available in this context")]
    ResourceUnavailable {
        /// The unavailable resource.
        resource: ResourceSpec,
    },

    /// Binding a notification address that is already bound.
    #[error("notification address `{addr}` is already bound")]
    AddressAlreadyBound {
        /// The contended address.
        addr: String,
    },

    /// The notification topic disappeared under a subscriber.
    #[error("notification lane closed for `{addr}`")]
    NotificationLaneClosed {
        /// The dead address.
        addr: String,
    },

    /// The readiness lane to the orchestrator is gone.
    #[error("readiness lane closed")]
    ReadinessLaneClosed,

    /// The control lane to a context is gone.
    #[error("control lane to context `{context}` closed")]
    ControlLaneClosed {
        /// The unreachable context.
        context: flowmesh_config::ContextId,
    },

    /// A node-specific kernel failure.
    #[error("kernel error in node `{node}`: {error}")]
    KernelError {
        /// The failing node.
        node: NodeId,
        /// The failure description.
        error: String,
    },
}
