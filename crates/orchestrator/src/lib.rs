// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! The orchestrator: authoritative graph state, context fleet management
//! and the cross-context link bridge.
//!
//! The orchestrator owns the canonical topology (node manifests, edge
//! mirrors, placements) and mediates every mutation. Same-context edges
//! are shipped to the owning worker as control frames; cross-context edges
//! are transparently bridged through a shared payload plus a notification
//! topic: one publisher per producer, one subscriber per
//! (producer, destination context) pair, both created lazily and garbage
//! collected when the last consumer goes away.
//!
//! For cross-context edges the mirror records the bridge topology
//! (`producer -> publisher`, `subscriber -> consumer`) exactly as it exists
//! in the workers; the logical producer/consumer pair lives in the
//! publication and subscription registries.

use crate::context::ContextHandle;
use flowmesh_config::{ContextId, Endpoints, NodeId, fresh_context_id};
use flowmesh_data::{PayloadDescriptor, SegmentManager, SharedPayload};
use flowmesh_engine::bus::NotifyBus;
use flowmesh_engine::control::{ControlMsg, ReadyReceiver, ReadySender, readiness_channel};
use flowmesh_engine::node::{Arity, Blueprint, NodeManifest};
use flowmesh_engine::Error as EngineError;
use flowmesh_nodes::{Publisher, Subscriber, WriteMode, Writer};
use futures::future::LocalBoxFuture;
use indexmap::IndexSet;
use std::collections::HashMap;
use tracing::{debug, info, warn};

mod context;
pub mod error;

pub use error::Error;

/// The orchestrator's mirror of one node.
struct NodeEntry {
    manifest: NodeManifest,
    sources: IndexSet<NodeId>,
    sinks: IndexSet<NodeId>,
}

impl NodeEntry {
    fn new(manifest: NodeManifest) -> Self {
        Self {
            manifest,
            sources: IndexSet::new(),
            sinks: IndexSet::new(),
        }
    }
}

/// The cross-context fan-out point of one producer: its publisher node and
/// the shared payload every subscriber reads.
pub struct Publication {
    publisher: NodeId,
    payload: SharedPayload,
}

impl Publication {
    /// Id of the publisher node.
    #[must_use]
    pub fn publisher(&self) -> &NodeId {
        &self.publisher
    }

    /// Descriptor of the shared payload.
    #[must_use]
    pub fn descriptor(&self) -> PayloadDescriptor {
        self.payload.descriptor()
    }
}

/// Graph execution runner and manager for nodes across execution contexts.
/// Restricted to a single machine.
pub struct Orchestrator {
    endpoints: Endpoints,
    smm: SegmentManager,
    bus: NotifyBus,
    readiness_tx: ReadySender,
    readiness_rx: ReadyReceiver,
    contexts: HashMap<ContextId, ContextHandle>,
    nodes: HashMap<NodeId, NodeEntry>,
    addrs: HashMap<NodeId, ContextId>,
    publications: HashMap<NodeId, Publication>,
    subscriptions: HashMap<(NodeId, ContextId), NodeId>,
}

impl Orchestrator {
    /// Creates an orchestrator with its own segment manager, notification
    /// bus and readiness lane.
    #[must_use]
    pub fn new(endpoints: Endpoints) -> Self {
        let (readiness_tx, readiness_rx) = readiness_channel();
        Self {
            endpoints,
            smm: SegmentManager::new(),
            bus: NotifyBus::new(),
            readiness_tx,
            readiness_rx,
            contexts: HashMap::new(),
            nodes: HashMap::new(),
            addrs: HashMap::new(),
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// The shared-memory segment manager, for layouts that allocate
    /// payloads of their own (parametrized nodes, probes).
    #[must_use]
    pub fn segment_manager(&self) -> &SegmentManager {
        &self.smm
    }

    /// The notification bus, for listening on terminal notifications.
    #[must_use]
    pub fn bus(&self) -> &NotifyBus {
        &self.bus
    }

    /// The configured endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Allocates a new execution context and launches its worker.
    ///
    /// The context is not ready until its announcement arrives; `notify`
    /// awaits it.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadSpawnError`] when the worker thread cannot start.
    pub fn new_context(&mut self) -> Result<ContextId, Error> {
        let id = fresh_context_id();
        let handle = ContextHandle::spawn(
            id.clone(),
            self.endpoints.clone(),
            self.bus.clone(),
            self.smm.clone(),
            self.readiness_tx.clone(),
        )?;
        let _ = self.contexts.insert(id.clone(), handle);
        info!(context = %id, "context created");
        Ok(id)
    }

    /// Places a node in a context and ships its definition.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownContext`] and [`Error::NodeAlreadyExists`] on
    /// precondition failures.
    pub async fn add(&mut self, blueprint: Blueprint, ctx_id: &ContextId) -> Result<(), Error> {
        if !self.contexts.contains_key(ctx_id) {
            return Err(Error::UnknownContext {
                context: ctx_id.clone(),
            });
        }
        let node_id = blueprint.id().clone();
        if self.nodes.contains_key(&node_id) {
            return Err(Error::NodeAlreadyExists { node: node_id });
        }
        let (manifest, shipped) = blueprint.ship();
        let _ = self.nodes.insert(node_id.clone(), NodeEntry::new(manifest));
        let _ = self.addrs.insert(node_id.clone(), ctx_id.clone());
        debug!(node = %node_id, context = %ctx_id, "node placed");
        self.notify(ctx_id, ControlMsg::Add(shipped)).await
    }

    /// Removes a node: tears down every incident edge (garbage collecting
    /// any bridge the node anchored), tells the owning context to drop the
    /// instance, and forgets it.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownNode`] when the node is not registered.
    pub async fn remove(&mut self, node_id: &NodeId) -> Result<(), Error> {
        self.remove_inner(node_id.clone()).await
    }

    /// Connects two running nodes. Idempotent. A cross-context pair is
    /// bridged; `buffer_size` selects a buffered link of that capacity.
    ///
    /// # Errors
    ///
    /// Unknown endpoints, surface or arity violations.
    pub async fn connect(
        &mut self,
        parent: &NodeId,
        child: &NodeId,
        buffer_size: Option<usize>,
    ) -> Result<(), Error> {
        self.connect_inner(parent.clone(), child.clone(), buffer_size)
            .await
    }

    /// Disconnects two nodes. Idempotent; tears down the bridge for a
    /// cross-context pair.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownNode`] when either endpoint is not registered.
    pub async fn disconnect(&mut self, parent: &NodeId, child: &NodeId) -> Result<(), Error> {
        self.disconnect_inner(parent.clone(), child.clone()).await
    }

    /// Routes `parent`'s output into `child`'s parameter record: a
    /// merge-mode writer in `parent`'s context, connected `parent -> writer`.
    ///
    /// # Errors
    ///
    /// [`Error::NotParametrized`] when `child` has no parameter record.
    pub async fn parameterize(&mut self, parent: &NodeId, child: &NodeId) -> Result<(), Error> {
        if !self.nodes.contains_key(parent) {
            return Err(Error::UnknownNode {
                node: parent.clone(),
            });
        }
        let params = self
            .nodes
            .get(child)
            .ok_or_else(|| Error::UnknownNode { node: child.clone() })?
            .manifest
            .params
            .clone()
            .ok_or_else(|| Error::NotParametrized { node: child.clone() })?;
        let ctx = self.context_of_checked(parent)?;
        let writer_id: NodeId = format!("param:{child}:{parent}").into();
        let blueprint = Writer::blueprint(writer_id.clone(), params, WriteMode::Merge);
        self.add(blueprint, &ctx).await?;
        self.connect_inner(parent.clone(), writer_id, None).await
    }

    /// Removes every node placed in a context.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownContext`] when the context does not exist.
    pub async fn clear_context(&mut self, ctx_id: &ContextId) -> Result<(), Error> {
        if !self.contexts.contains_key(ctx_id) {
            return Err(Error::UnknownContext {
                context: ctx_id.clone(),
            });
        }
        let placed: Vec<NodeId> = self
            .addrs
            .iter()
            .filter(|(_, ctx)| *ctx == ctx_id)
            .map(|(node, _)| node.clone())
            .collect();
        for node_id in placed {
            // A node may already be gone through a bridge cascade.
            if self.nodes.contains_key(&node_id) {
                self.remove_inner(node_id).await?;
            }
        }
        Ok(())
    }

    /// Clears a context and stops its worker.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownContext`], or the worker's own exit error.
    pub async fn destroy_context(&mut self, ctx_id: &ContextId) -> Result<(), Error> {
        self.clear_context(ctx_id).await?;
        let handle = self
            .contexts
            .remove(ctx_id)
            .ok_or_else(|| Error::UnknownContext {
                context: ctx_id.clone(),
            })?;
        info!(context = %ctx_id, "context destroyed");
        handle.shutdown_and_join()
    }

    /// Stops every worker without draining. Errors are reported, not
    /// propagated.
    pub fn shutdown(&mut self) {
        for handle in self.contexts.values_mut() {
            handle.shutdown();
        }
        for (ctx_id, handle) in self.contexts.drain() {
            if let Err(error) = handle.shutdown_and_join() {
                warn!(context = %ctx_id, error = %error, "context worker exited with error");
            }
        }
    }

    /// Runs a layout: `setup` once, then `run` raced against Ctrl-C, then a
    /// zero-drain shutdown.
    ///
    /// # Errors
    ///
    /// Whatever the layout surfaces.
    pub async fn execute<L: Layout>(&mut self, layout: &mut L) -> Result<(), Error> {
        layout.setup(self).await?;
        let result = tokio::select! {
            result = layout.run(self) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                Ok(())
            }
        };
        self.shutdown();
        result
    }

    // --- read-side accessors -------------------------------------------

    /// Whether a node is registered.
    #[must_use]
    pub fn has_node(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// The context a node is placed in.
    #[must_use]
    pub fn context_of(&self, node_id: &NodeId) -> Option<&ContextId> {
        self.addrs.get(node_id)
    }

    /// Mirror of a node's sinks, in insertion order.
    #[must_use]
    pub fn sinks_of(&self, node_id: &NodeId) -> Option<Vec<NodeId>> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.sinks.iter().cloned().collect())
    }

    /// Mirror of a node's sources, in insertion order.
    #[must_use]
    pub fn sources_of(&self, node_id: &NodeId) -> Option<Vec<NodeId>> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.sources.iter().cloned().collect())
    }

    /// The publication anchored at `producer`, if any.
    #[must_use]
    pub fn publication(&self, producer: &NodeId) -> Option<&Publication> {
        self.publications.get(producer)
    }

    /// Number of live publications.
    #[must_use]
    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }

    /// The subscriber serving `producer` in `ctx`, if any.
    #[must_use]
    pub fn subscriber_id(&self, producer: &NodeId, ctx: &ContextId) -> Option<&NodeId> {
        self.subscriptions.get(&(producer.clone(), ctx.clone()))
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // --- control plane -------------------------------------------------

    /// Ships a frame to a context, first awaiting its readiness.
    async fn notify(&mut self, ctx_id: &ContextId, msg: ControlMsg) -> Result<(), Error> {
        self.await_ready(ctx_id).await?;
        let handle = self
            .contexts
            .get(ctx_id)
            .ok_or_else(|| Error::UnknownContext {
                context: ctx_id.clone(),
            })?;
        handle.control.send_async(msg).await.map_err(|_| {
            Error::Engine(EngineError::ControlLaneClosed {
                context: ctx_id.clone(),
            })
        })
    }

    /// Drains the readiness lane until the target context has announced.
    async fn await_ready(&mut self, ctx_id: &ContextId) -> Result<(), Error> {
        if !self.contexts.contains_key(ctx_id) {
            return Err(Error::UnknownContext {
                context: ctx_id.clone(),
            });
        }
        while !self.contexts.get(ctx_id).is_some_and(|h| h.ready) {
            let msg = self
                .readiness_rx
                .recv_async()
                .await
                .map_err(|_| Error::Engine(EngineError::ReadinessLaneClosed))?;
            match self.contexts.get_mut(&msg.ready) {
                Some(handle) => handle.ready = true,
                None => warn!(context = %msg.ready, "readiness from unknown context"),
            }
        }
        Ok(())
    }

    fn context_of_checked(&self, node_id: &NodeId) -> Result<ContextId, Error> {
        self.addrs
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::UnknownNode {
                node: node_id.clone(),
            })
    }

    // --- topology mutations --------------------------------------------

    fn connect_inner(
        &mut self,
        parent: NodeId,
        child: NodeId,
        buffer_size: Option<usize>,
    ) -> LocalBoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let parent_ctx = self.context_of_checked(&parent)?;
            let child_ctx = self.context_of_checked(&child)?;
            if parent_ctx != child_ctx {
                // Cross-context: surface checks here, arity checks fall on
                // the bridge edges themselves.
                self.check_surfaces(&parent, &child)?;
                return self.link(&parent, &child, buffer_size).await;
            }

            if self
                .nodes
                .get(&parent)
                .is_some_and(|entry| entry.sinks.contains(&child))
            {
                return Ok(()); // already wired
            }
            self.check_surfaces(&parent, &child)?;
            self.check_arity(&parent, &child)?;
            if let Some(entry) = self.nodes.get_mut(&parent) {
                let _ = entry.sinks.insert(child.clone());
            }
            if let Some(entry) = self.nodes.get_mut(&child) {
                let _ = entry.sources.insert(parent.clone());
            }
            self.notify(&parent_ctx, ControlMsg::Connect { parent, child })
                .await
        })
    }

    fn disconnect_inner(
        &mut self,
        parent: NodeId,
        child: NodeId,
    ) -> LocalBoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let parent_ctx = self.context_of_checked(&parent)?;
            let child_ctx = self.context_of_checked(&child)?;
            if parent_ctx != child_ctx {
                return self.unlink(&parent, &child).await;
            }

            let present = self
                .nodes
                .get(&parent)
                .is_some_and(|entry| entry.sinks.contains(&child));
            if !present {
                return Ok(()); // idempotent
            }
            if let Some(entry) = self.nodes.get_mut(&parent) {
                let _ = entry.sinks.shift_remove(&child);
            }
            if let Some(entry) = self.nodes.get_mut(&child) {
                let _ = entry.sources.shift_remove(&parent);
            }
            self.notify(&parent_ctx, ControlMsg::Disconnect { parent, child })
                .await
        })
    }

    fn remove_inner(&mut self, node_id: NodeId) -> LocalBoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if !self.nodes.contains_key(&node_id) {
                return Err(Error::UnknownNode { node: node_id });
            }
            // A producer's bridge goes first, so its publisher and
            // subscribers disappear with it.
            if self.publications.contains_key(&node_id) {
                self.unpublish(&node_id).await?;
            }
            let (sources, sinks) = match self.nodes.get(&node_id) {
                Some(entry) => (
                    entry.sources.iter().cloned().collect::<Vec<_>>(),
                    entry.sinks.iter().cloned().collect::<Vec<_>>(),
                ),
                None => (Vec::new(), Vec::new()),
            };
            for source in sources {
                if !self.nodes.contains_key(&source) {
                    continue;
                }
                // A subscriber source means this node is the consumer side
                // of a bridge; tear the bridge down instead.
                match self.producer_of_subscriber(&source) {
                    Some(producer) => self.unlink(&producer, &node_id).await?,
                    None => self.disconnect_inner(source, node_id.clone()).await?,
                }
            }
            for sink in sinks {
                if !self.nodes.contains_key(&sink) {
                    continue;
                }
                self.disconnect_inner(node_id.clone(), sink).await?;
            }
            let ctx = self.context_of_checked(&node_id)?;
            self.notify(&ctx, ControlMsg::Remove(node_id.clone())).await?;
            let _ = self.nodes.remove(&node_id);
            let _ = self.addrs.remove(&node_id);
            debug!(node = %node_id, context = %ctx, "node removed");
            Ok(())
        })
    }

    // --- cross-context bridge ------------------------------------------

    /// Like `connect`, but across execution contexts.
    async fn link(
        &mut self,
        producer: &NodeId,
        consumer: &NodeId,
        buffer_size: Option<usize>,
    ) -> Result<(), Error> {
        let producer_ctx = self.context_of_checked(producer)?;
        let consumer_ctx = self.context_of_checked(consumer)?;

        if !self.publications.contains_key(producer) {
            let schema = self
                .nodes
                .get(producer)
                .and_then(|entry| entry.manifest.schema.clone())
                .ok_or_else(|| {
                    Error::Engine(EngineError::NotAnEmitter {
                        node: producer.clone(),
                    })
                })?;
            let payload = match buffer_size {
                None => SharedPayload::new_struct(&self.smm, schema),
                Some(capacity) => SharedPayload::new_stream(&self.smm, schema, capacity)?,
            };
            let publisher_id: NodeId = format!("pub:{producer}").into();
            let blueprint = Publisher::blueprint(
                publisher_id.clone(),
                producer.clone(),
                payload.descriptor(),
                1,
            );
            self.add(blueprint, &producer_ctx).await?;
            self.connect_inner(producer.clone(), publisher_id.clone(), None)
                .await?;
            let _ = self.publications.insert(
                producer.clone(),
                Publication {
                    publisher: publisher_id,
                    payload,
                },
            );
            debug!(producer = %producer, "publication created");
        }

        let key = (producer.clone(), consumer_ctx.clone());
        let subscriber_id = match self.subscriptions.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                let subscriber_id: NodeId = format!("sub:{producer}:{consumer_ctx}").into();
                let link = self
                    .publications
                    .get(producer)
                    .map(Publication::descriptor)
                    .ok_or_else(|| Error::UnknownNode {
                        node: producer.clone(),
                    })?;
                let blueprint =
                    Subscriber::blueprint(subscriber_id.clone(), producer.clone(), link);
                self.add(blueprint, &consumer_ctx).await?;
                let _ = self.subscriptions.insert(key, subscriber_id.clone());
                debug!(producer = %producer, context = %consumer_ctx, "subscription created");
                subscriber_id
            }
        };
        self.connect_inner(subscriber_id, consumer.clone(), None).await
    }

    /// Tears down the bridge edge between `producer` and `consumer`,
    /// garbage collecting the subscriber and then the publisher when they
    /// serve no one.
    async fn unlink(&mut self, producer: &NodeId, consumer: &NodeId) -> Result<(), Error> {
        let consumer_ctx = self.context_of_checked(consumer)?;
        let key = (producer.clone(), consumer_ctx);
        let Some(subscriber_id) = self.subscriptions.get(&key).cloned() else {
            return Ok(()); // already unlinked
        };
        self.disconnect_inner(subscriber_id.clone(), consumer.clone())
            .await?;

        let subscriber_idle = self
            .nodes
            .get(&subscriber_id)
            .is_none_or(|entry| entry.sinks.is_empty());
        if subscriber_idle {
            let _ = self.subscriptions.remove(&key);
            if self.nodes.contains_key(&subscriber_id) {
                self.remove_inner(subscriber_id).await?;
            }
            debug!(producer = %producer, "subscription dropped");
        }

        if !self.subscriptions.keys().any(|(p, _)| p == producer) {
            if let Some(publication) = self.publications.remove(producer) {
                if self.nodes.contains_key(&publication.publisher) {
                    self.remove_inner(publication.publisher.clone()).await?;
                }
                for segment in publication.descriptor().segment_names() {
                    self.smm.release(&segment);
                }
                debug!(producer = %producer, "publication dropped");
            }
        }
        Ok(())
    }

    /// Tears down the entire bridge anchored at a producer being removed.
    async fn unpublish(&mut self, producer: &NodeId) -> Result<(), Error> {
        let keys: Vec<(NodeId, ContextId)> = self
            .subscriptions
            .keys()
            .filter(|(p, _)| p == producer)
            .cloned()
            .collect();
        for key in keys {
            if let Some(subscriber_id) = self.subscriptions.remove(&key) {
                if self.nodes.contains_key(&subscriber_id) {
                    self.remove_inner(subscriber_id).await?;
                }
            }
        }
        if let Some(publication) = self.publications.remove(producer) {
            if self.nodes.contains_key(&publication.publisher) {
                self.remove_inner(publication.publisher.clone()).await?;
            }
            for segment in publication.descriptor().segment_names() {
                self.smm.release(&segment);
            }
        }
        Ok(())
    }

    fn producer_of_subscriber(&self, subscriber_id: &NodeId) -> Option<NodeId> {
        self.subscriptions
            .iter()
            .find(|(_, sub)| *sub == subscriber_id)
            .map(|((producer, _), _)| producer.clone())
    }

    fn check_surfaces(&self, parent: &NodeId, child: &NodeId) -> Result<(), Error> {
        if parent == child {
            return Err(Error::Engine(EngineError::SelfConnection {
                node: parent.clone(),
            }));
        }
        let parent_entry = self.nodes.get(parent).ok_or_else(|| Error::UnknownNode {
            node: parent.clone(),
        })?;
        let child_entry = self.nodes.get(child).ok_or_else(|| Error::UnknownNode {
            node: child.clone(),
        })?;
        if !parent_entry.manifest.emits() {
            return Err(Error::Engine(EngineError::NotAnEmitter {
                node: parent.clone(),
            }));
        }
        if !child_entry.manifest.collects() {
            return Err(Error::Engine(EngineError::NotACollector {
                node: child.clone(),
            }));
        }
        Ok(())
    }

    fn check_arity(&self, parent: &NodeId, child: &NodeId) -> Result<(), Error> {
        let parent_entry = &self.nodes[parent];
        let child_entry = &self.nodes[child];
        if parent_entry.manifest.out_arity == Some(Arity::One) {
            if let Some(existing) = parent_entry.sinks.first() {
                return Err(Error::Engine(EngineError::SinkAlreadyAssigned {
                    node: parent.clone(),
                    existing: existing.clone(),
                }));
            }
        }
        if child_entry.manifest.in_arity == Some(Arity::One) {
            if let Some(existing) = child_entry.sources.first() {
                return Err(Error::Engine(EngineError::SourceAlreadyAssigned {
                    node: child.clone(),
                    existing: existing.clone(),
                }));
            }
        }
        Ok(())
    }
}

/// Graph-construction hook: `setup` builds the initial graph once after
/// startup, `run` hosts long-running user coroutines.
#[async_trait::async_trait(?Send)]
pub trait Layout {
    /// Builds the initial graph.
    async fn setup(&mut self, orch: &mut Orchestrator) -> Result<(), Error>;

    /// Runs after `setup`; the default returns immediately.
    async fn run(&mut self, orch: &mut Orchestrator) -> Result<(), Error> {
        let _ = orch;
        Ok(())
    }
}
