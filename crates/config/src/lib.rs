// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Identifiers and endpoint configuration for the flowmesh graph executor.
//!
//! Data model:
//! - a graph is a set of nodes interconnected by directed edges;
//! - every node is placed in exactly one execution context;
//! - contexts are wired to the orchestrator through a fixed set of endpoints.
//!
//! Endpoints are plain values passed explicitly through constructors. Nothing
//! in this crate is ambient process state.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// The id of a node in the graph.
pub type NodeId = Cow<'static, str>;

/// The id of an execution context.
pub type ContextId = Cow<'static, str>;

/// Generates a fresh unique node id.
#[must_use]
pub fn fresh_node_id() -> NodeId {
    Cow::Owned(format!("n-{}", short_uuid()))
}

/// Generates a fresh unique context id.
#[must_use]
pub fn fresh_context_id() -> ContextId {
    Cow::Owned(format!("ctx-{}", short_uuid()))
}

/// First segment of a v4 uuid, enough uniqueness for in-process ids while
/// keeping log lines readable.
fn short_uuid() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

/// Addresses of the three transport lanes between the orchestrator and its
/// context workers.
///
/// * `tx_url`: control lane, orchestrator to contexts (topic per context id).
/// * `rx_url`: readiness lane, contexts to orchestrator.
/// * `mc_url_base`: prefix of the per-publisher notification addresses; a
///   producer `p` publishes at `mc_url_base + p`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Control lane address.
    pub tx_url: String,
    /// Readiness lane address.
    pub rx_url: String,
    /// Per-publisher notification address prefix.
    pub mc_url_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            tx_url: "inproc://orch-tx".to_owned(),
            rx_url: "inproc://orch-rx".to_owned(),
            mc_url_base: "inproc://mc/".to_owned(),
        }
    }
}

impl Endpoints {
    /// Notification address of the publisher attached to `producer`.
    #[must_use]
    pub fn mc_addr(&self, producer: &NodeId) -> String {
        format!("{}{}", self.mc_url_base, producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique() {
        let a = fresh_node_id();
        let b = fresh_node_id();
        assert_ne!(a, b);
        assert!(a.starts_with("n-"));
        assert!(fresh_context_id().starts_with("ctx-"));
    }

    #[test]
    fn mc_addr_joins_prefix_and_producer() {
        let endpoints = Endpoints::default();
        let addr = endpoints.mc_addr(&NodeId::from("p1"));
        assert_eq!(addr, "inproc://mc/p1");
    }

    #[test]
    fn endpoints_round_trip_as_json() {
        let endpoints = Endpoints::default();
        let json = serde_json::to_string(&endpoints).expect("serialize");
        let back: Endpoints = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, endpoints);
    }
}
