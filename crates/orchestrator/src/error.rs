// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the orchestrator.

use flowmesh_config::{ContextId, NodeId};

/// All errors that can occur while orchestrating a graph.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wrapper for the execution-substrate errors.
    #[error("an engine error occurred: {0}")]
    Engine(#[from] flowmesh_engine::Error),

    /// A wrapper for the data-layer errors.
    #[error("a data error occurred: {0}")]
    Data(#[from] flowmesh_data::Error),

    /// Addressing a context that was never created or already destroyed.
    #[error("unknown context `{context}`")]
    UnknownContext {
        /// The unknown context id.
        context: ContextId,
    },

    /// Adding a node under an id that is already registered.
    #[error("node `{node}` is already registered")]
    NodeAlreadyExists {
        /// The duplicated node id.
        node: NodeId,
    },

    /// Addressing a node the orchestrator does not know.
    #[error("unknown node `{node}`")]
    UnknownNode {
        /// The unknown node id.
        node: NodeId,
    },

    /// `parameterize` targeting a node without a parameter record.
    #[error("node `{node}` is not parametrized")]
    NotParametrized {
        /// The non-parametrized target.
        node: NodeId,
    },

    /// The OS refused to spawn a context worker thread.
    #[error("failed to spawn worker thread for context `{context}`: {source}")]
    ThreadSpawnError {
        /// The context being spawned.
        context: ContextId,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// A context worker thread panicked.
    #[error("worker thread for context `{context}` panicked: {panic_message}")]
    ThreadJoinPanic {
        /// The panicked context.
        context: ContextId,
        /// Formatted panic payload.
        panic_message: String,
    },
}
