// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! The node contract: kernels, runtime nodes and their wiring.
//!
//! A runtime node is a tagged combination of an emitter surface (output
//! record + sink registry) and a collector surface (source registry +
//! completion flags). Each present surface is refined by an [`Arity`],
//! giving the constrained topologies (single emitter, single collector,
//! pipe, out-branch, in-branch, router) at construction rather than
//! through a type hierarchy.
//!
//! Neighbor registries hold non-owning handles; the context's node registry
//! owns the `Rc`. Registries are insertion-ordered, which is what fixes the
//! argument order of a collector's `compute`.

use crate::error::Error;
use crate::resource::{ResourceSpec, Resources};
use flowmesh_config::NodeId;
use flowmesh_data::{FieldSchema, PayloadDescriptor, Struct};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// How many neighbors a surface admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// At most one neighbor.
    One,
    /// Any number of neighbors.
    Many,
}

/// Whether a completed compute propagates to the node's sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagate {
    /// Activate the sinks.
    Forward,
    /// Do not propagate this tick.
    Suppress,
}

/// The node-specific computation.
///
/// Kernels are `!Send`: they are built inside the owning context from a
/// shipped [`NodeBuilder`] and never leave it. Only asynchronous I/O may
/// suspend inside `compute`; everything else must be synchronous.
#[async_trait::async_trait(?Send)]
pub trait Kernel {
    /// Resources this kernel needs at start time.
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::empty()
    }

    /// Acquires resources. Called once, before the first activation, with
    /// exactly the subset declared by [`Kernel::rspec`].
    async fn start(&mut self, id: &NodeId, res: &Resources) -> Result<(), Error> {
        let _ = (id, res);
        Ok(())
    }

    /// Releases resources. Called once, when the node is removed or the
    /// context tears down.
    async fn stop(&mut self) {}

    /// Runs the kernel.
    ///
    /// `inputs` holds the source outputs in source-registry insertion order
    /// (empty for a root emitter). `output` is the node's output record when
    /// the node has an emitter surface; the write becomes visible to
    /// downstream readers only after `compute` returns.
    ///
    /// # Errors
    ///
    /// A kernel error propagates out of the activation; for a scheduled
    /// emitter this ends its scheduling.
    async fn compute(
        &mut self,
        inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error>;

    /// `Some(done)` for finite emitters, `None` otherwise.
    fn finished(&self) -> Option<bool> {
        None
    }

    /// Emits the terminal notification of a finite emitter. Called on every
    /// tick whose `finished` is true, instead of propagation.
    async fn announce_finished(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Shape of a node as declared by its builder: which surfaces exist, the
/// output schema, and the parameter payload for parametrized nodes.
#[derive(Clone, Debug)]
pub struct NodeManifest {
    /// Output schema; present iff the node has an emitter surface.
    pub schema: Option<FieldSchema>,
    /// Collector surface refinement, if any.
    pub in_arity: Option<Arity>,
    /// Emitter surface refinement, if any.
    pub out_arity: Option<Arity>,
    /// Descriptor of the parameter record, for parametrized nodes.
    pub params: Option<PayloadDescriptor>,
}

impl NodeManifest {
    /// An emitter-only node.
    #[must_use]
    pub fn emitter(schema: FieldSchema, out_arity: Arity) -> Self {
        Self {
            schema: Some(schema),
            in_arity: None,
            out_arity: Some(out_arity),
            params: None,
        }
    }

    /// A collector-only node.
    #[must_use]
    pub fn collector(in_arity: Arity) -> Self {
        Self {
            schema: None,
            in_arity: Some(in_arity),
            out_arity: None,
            params: None,
        }
    }

    /// A node with both surfaces.
    #[must_use]
    pub fn router(schema: FieldSchema, in_arity: Arity, out_arity: Arity) -> Self {
        Self {
            schema: Some(schema),
            in_arity: Some(in_arity),
            out_arity: Some(out_arity),
            params: None,
        }
    }

    /// Source-to-sink connector: one source, one sink.
    #[must_use]
    pub fn pipe(schema: FieldSchema) -> Self {
        Self::router(schema, Arity::One, Arity::One)
    }

    /// Single-source, many-sink connector.
    #[must_use]
    pub fn out_branch(schema: FieldSchema) -> Self {
        Self::router(schema, Arity::One, Arity::Many)
    }

    /// Many-source, single-sink connector.
    #[must_use]
    pub fn in_branch(schema: FieldSchema) -> Self {
        Self::router(schema, Arity::Many, Arity::One)
    }

    /// Attaches a parameter payload descriptor.
    #[must_use]
    pub fn with_params(mut self, params: PayloadDescriptor) -> Self {
        self.params = Some(params);
        self
    }

    /// Whether the node has an emitter surface.
    #[must_use]
    pub fn emits(&self) -> bool {
        self.out_arity.is_some()
    }

    /// Whether the node has a collector surface.
    #[must_use]
    pub fn collects(&self) -> bool {
        self.in_arity.is_some()
    }

    /// A root emitter emits but does not collect; these are the nodes a
    /// context scheduler drives.
    #[must_use]
    pub fn is_root_emitter(&self) -> bool {
        self.emits() && !self.collects()
    }

    fn validate(&self, id: &NodeId) -> Result<(), Error> {
        if self.schema.is_some() != self.emits() {
            return Err(Error::InvalidManifest {
                node: id.clone(),
                detail: "output schema and emitter surface must come together".to_owned(),
            });
        }
        if !self.emits() && !self.collects() {
            return Err(Error::InvalidManifest {
                node: id.clone(),
                detail: "a node needs at least one surface".to_owned(),
            });
        }
        Ok(())
    }
}

/// Builds a kernel inside the destination context.
///
/// Builders cross the control lane exactly once, orchestrator to context;
/// they are never shipped back, so the form needs no round trip.
pub trait NodeBuilder: Send {
    /// Consumes the builder, producing the live kernel.
    fn build(self: Box<Self>) -> Box<dyn Kernel>;
}

impl<F> NodeBuilder for F
where
    F: FnOnce() -> Box<dyn Kernel> + Send,
{
    fn build(self: Box<Self>) -> Box<dyn Kernel> {
        (*self)()
    }
}

/// A node definition in transit over the control lane.
pub struct ShippedNode {
    /// The node's id.
    pub id: NodeId,
    /// The declared shape.
    pub manifest: NodeManifest,
    builder: Box<dyn NodeBuilder>,
}

impl ShippedNode {
    /// Builds the kernel on the receiving side.
    #[must_use]
    pub fn into_kernel(self) -> Box<dyn Kernel> {
        self.builder.build()
    }
}

impl fmt::Debug for ShippedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShippedNode")
            .field("id", &self.id)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

/// A node definition held by the orchestrator before placement.
pub struct Blueprint {
    id: NodeId,
    manifest: NodeManifest,
    builder: Box<dyn NodeBuilder>,
}

impl Blueprint {
    /// Declares a node.
    #[must_use]
    pub fn new(
        id: NodeId,
        manifest: NodeManifest,
        build: impl FnOnce() -> Box<dyn Kernel> + Send + 'static,
    ) -> Self {
        Self {
            id,
            manifest,
            builder: Box::new(build),
        }
    }

    /// The node's id.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The declared shape.
    #[must_use]
    pub fn manifest(&self) -> &NodeManifest {
        &self.manifest
    }

    /// Splits into the orchestrator's mirror entry and the wire form.
    #[must_use]
    pub fn ship(self) -> (NodeManifest, ShippedNode) {
        (
            self.manifest.clone(),
            ShippedNode {
                id: self.id,
                manifest: self.manifest,
                builder: self.builder,
            },
        )
    }
}

/// A live node owned by a context's registry.
pub struct Node {
    id: NodeId,
    kernel: Rc<RefCell<Box<dyn Kernel>>>,
    output: Option<Struct>,
    in_arity: Option<Arity>,
    out_arity: Option<Arity>,
    sources: IndexMap<NodeId, Weak<RefCell<Node>>>,
    flags: IndexMap<NodeId, bool>,
    sinks: IndexMap<NodeId, Weak<RefCell<Node>>>,
}

/// Shared handle to a live node. The registry holds the owning `Rc`;
/// neighbor registries hold `Weak`s.
pub type NodeCell = Rc<RefCell<Node>>;

impl Node {
    /// Instantiates a node from its manifest and kernel.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidManifest`] when the surfaces are inconsistent.
    pub fn new(id: NodeId, manifest: NodeManifest, kernel: Box<dyn Kernel>) -> Result<Self, Error> {
        manifest.validate(&id)?;
        Ok(Self {
            id,
            kernel: Rc::new(RefCell::new(kernel)),
            output: manifest.schema.map(Struct::new),
            in_arity: manifest.in_arity,
            out_arity: manifest.out_arity,
            sources: IndexMap::new(),
            flags: IndexMap::new(),
            sinks: IndexMap::new(),
        })
    }

    /// The node's id.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The committed output record, for emitting nodes.
    #[must_use]
    pub fn output(&self) -> Option<&Struct> {
        self.output.as_ref()
    }

    /// Collector surface refinement.
    #[must_use]
    pub fn in_arity(&self) -> Option<Arity> {
        self.in_arity
    }

    /// Emitter surface refinement.
    #[must_use]
    pub fn out_arity(&self) -> Option<Arity> {
        self.out_arity
    }

    /// Whether the node is driven by the context scheduler.
    #[must_use]
    pub fn is_root_emitter(&self) -> bool {
        self.out_arity.is_some() && self.in_arity.is_none()
    }

    /// Source ids in insertion order.
    #[must_use]
    pub fn source_ids(&self) -> Vec<NodeId> {
        self.sources.keys().cloned().collect()
    }

    /// Sink ids in insertion order.
    #[must_use]
    pub fn sink_ids(&self) -> Vec<NodeId> {
        self.sinks.keys().cloned().collect()
    }

    /// The completion flag recorded for `source`, if wired.
    #[must_use]
    pub fn flag(&self, source: &NodeId) -> Option<bool> {
        self.flags.get(source).copied()
    }

    pub(crate) fn kernel_handle(&self) -> Rc<RefCell<Box<dyn Kernel>>> {
        self.kernel.clone()
    }

    pub(crate) fn has_source(&self, source: &NodeId) -> bool {
        self.sources.contains_key(source)
    }

    pub(crate) fn record_flag(&mut self, source: &NodeId) {
        if let Some(flag) = self.flags.get_mut(source) {
            *flag = true;
        }
    }

    pub(crate) fn all_flags(&self) -> bool {
        self.flags.values().all(|flag| *flag)
    }

    pub(crate) fn reset_flags(&mut self) {
        for flag in self.flags.values_mut() {
            *flag = false;
        }
    }

    pub(crate) fn put_output(&mut self, output: Option<Struct>) {
        self.output = output;
    }

    /// Source outputs in source-registry insertion order.
    pub(crate) fn gather_inputs(&self) -> Result<Vec<Struct>, Error> {
        let mut inputs = Vec::with_capacity(self.sources.len());
        for (source_id, weak) in &self.sources {
            let cell = weak.upgrade().ok_or_else(|| Error::StaleHandle {
                node: self.id.clone(),
                peer: source_id.clone(),
            })?;
            let source = cell.borrow();
            let output = source.output().ok_or_else(|| Error::NotAnEmitter {
                node: source_id.clone(),
            })?;
            inputs.push(output.clone());
        }
        Ok(inputs)
    }

    /// Strong handles to the sinks, in insertion order.
    pub(crate) fn sink_cells(&self) -> Result<Vec<NodeCell>, Error> {
        let mut cells = Vec::with_capacity(self.sinks.len());
        for (sink_id, weak) in &self.sinks {
            cells.push(weak.upgrade().ok_or_else(|| Error::StaleHandle {
                node: self.id.clone(),
                peer: sink_id.clone(),
            })?);
        }
        Ok(cells)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("in_arity", &self.in_arity)
            .field("out_arity", &self.out_arity)
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Wires `parent -> child`, installing both directions.
///
/// Idempotent: wiring an existing edge changes nothing.
///
/// # Errors
///
/// Arity and surface violations ([`Error::SelfConnection`],
/// [`Error::NotAnEmitter`], [`Error::NotACollector`],
/// [`Error::SinkAlreadyAssigned`], [`Error::SourceAlreadyAssigned`]).
pub fn sends_to(parent: &NodeCell, child: &NodeCell) -> Result<(), Error> {
    let parent_id = parent.borrow().id.clone();
    let child_id = child.borrow().id.clone();
    if Rc::ptr_eq(parent, child) || parent_id == child_id {
        return Err(Error::SelfConnection { node: parent_id });
    }
    {
        let parent_ref = parent.borrow();
        let child_ref = child.borrow();
        if parent_ref.out_arity.is_none() {
            return Err(Error::NotAnEmitter { node: parent_id });
        }
        if child_ref.in_arity.is_none() {
            return Err(Error::NotACollector { node: child_id });
        }
        if parent_ref.sinks.contains_key(&child_id) {
            return Ok(()); // already wired
        }
        if parent_ref.out_arity == Some(Arity::One) {
            if let Some(existing) = parent_ref.sinks.keys().next() {
                return Err(Error::SinkAlreadyAssigned {
                    node: parent_id,
                    existing: existing.clone(),
                });
            }
        }
        if child_ref.in_arity == Some(Arity::One) {
            if let Some(existing) = child_ref.sources.keys().next() {
                return Err(Error::SourceAlreadyAssigned {
                    node: child_id,
                    existing: existing.clone(),
                });
            }
        }
    }
    let _ = parent
        .borrow_mut()
        .sinks
        .insert(child_id.clone(), Rc::downgrade(child));
    let mut child_mut = child.borrow_mut();
    let _ = child_mut.sources.insert(parent_id.clone(), Rc::downgrade(parent));
    let _ = child_mut.flags.insert(parent_id, false);
    Ok(())
}

/// Wires `child <- parent`; the mirror image of [`sends_to`].
///
/// # Errors
///
/// Same as [`sends_to`].
pub fn receives_from(child: &NodeCell, parent: &NodeCell) -> Result<(), Error> {
    sends_to(parent, child)
}

/// Removes the `parent -> child` edge from both sides. Idempotent and
/// re-entry safe; unknown pairs are a no-op.
pub fn disconnect(parent: &NodeCell, child: &NodeCell) {
    if Rc::ptr_eq(parent, child) {
        return;
    }
    let child_id = child.borrow().id.clone();
    let parent_id = parent.borrow().id.clone();
    let _ = parent.borrow_mut().sinks.shift_remove(&child_id);
    let mut child_mut = child.borrow_mut();
    let _ = child_mut.sources.shift_remove(&parent_id);
    let _ = child_mut.flags.shift_remove(&parent_id);
}
