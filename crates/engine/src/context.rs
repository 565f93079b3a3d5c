// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-context cooperative scheduler.
//!
//! A context worker owns the live instances of the nodes placed in it.
//! Every root emitter runs as a one-shot tick task; the task reports its
//! node id on a completion queue and the worker immediately respawns it.
//! Respawning per tick (rather than looping inside the node) gives a
//! uniform cancellation point and lets topology updates interleave between
//! ticks without racing node state.
//!
//! The worker multiplexes three things on one thread: the cancellation
//! token, the control lane, and the completion queue, the latter gated on
//! the context-level `ready` flag. A detected invariant violation fails the
//! worker fast; the error surfaces to the orchestrator when the thread is
//! joined.

use crate::activation::activate;
use crate::control::{ControlMsg, ControlReceiver, ReadyMsg, ReadySender};
use crate::error::Error;
use crate::node::{Node, NodeCell, ShippedNode, disconnect, sends_to};
use crate::resource::ResourceMap;
use flowmesh_config::{ContextId, Endpoints, NodeId};
use flowmesh_data::SegmentManager;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a context worker needs to run, passed at spawn time.
pub struct WorkerSettings {
    /// The context's id, also the topic it filters control frames on.
    pub context_id: ContextId,
    /// Transport endpoints, shared with every other context.
    pub endpoints: Endpoints,
    /// The notification bus.
    pub bus: crate::bus::NotifyBus,
    /// The shared-memory segment manager.
    pub smm: SegmentManager,
    /// Receiving end of this context's control lane.
    pub control: ControlReceiver,
    /// Sending end of the shared readiness lane.
    pub readiness: ReadySender,
}

type Completion = (NodeId, Result<(), Error>);

struct ContextWorker {
    id: ContextId,
    resources: ResourceMap,
    nodes: HashMap<NodeId, NodeCell>,
    scheduled: HashMap<NodeId, AbortHandle>,
    ready: bool,
    completions_tx: mpsc::UnboundedSender<Completion>,
}

/// Runs a context worker until cancelled or failed.
///
/// Must run inside a `LocalSet` on a single-threaded runtime; tick tasks
/// are `spawn_local`ed.
///
/// # Errors
///
/// Any invariant violation or resource failure; the worker does not try to
/// recover.
pub async fn run_worker(settings: WorkerSettings, cancel: CancellationToken) -> Result<(), Error> {
    let WorkerSettings {
        context_id,
        endpoints,
        bus,
        smm,
        control,
        readiness,
    } = settings;
    let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
    let mut worker = ContextWorker {
        id: context_id.clone(),
        resources: ResourceMap::new(bus, endpoints, smm),
        nodes: HashMap::new(),
        scheduled: HashMap::new(),
        ready: false,
        completions_tx,
    };

    readiness
        .send_async(ReadyMsg {
            ready: context_id.clone(),
        })
        .await
        .map_err(|_| Error::ReadinessLaneClosed)?;
    info!(context = %context_id, "context worker started");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = control.recv_async() => match frame {
                Ok(msg) => {
                    if let Err(error) = worker.handle(msg).await {
                        break Err(error);
                    }
                }
                // The orchestrator dropped the lane; treated as shutdown.
                Err(_) => break Ok(()),
            },
            Some((node_id, tick)) = completions_rx.recv(), if worker.ready => {
                worker.on_tick_complete(&node_id, tick);
            }
        }
    };

    worker.teardown().await;
    info!(context = %context_id, "context worker stopped");
    result
}

impl ContextWorker {
    async fn handle(&mut self, msg: ControlMsg) -> Result<(), Error> {
        match msg {
            ControlMsg::Add(shipped) => self.add(shipped).await,
            ControlMsg::Remove(node_id) => self.remove(&node_id).await,
            ControlMsg::Connect { parent, child } => self.connect(&parent, &child),
            ControlMsg::Disconnect { parent, child } => self.disconnect(&parent, &child),
        }
    }

    async fn add(&mut self, shipped: ShippedNode) -> Result<(), Error> {
        let node_id = shipped.id.clone();
        if self.nodes.contains_key(&node_id) {
            return Err(Error::NodeAlreadyExists { node: node_id });
        }
        let manifest = shipped.manifest.clone();
        let mut kernel = shipped.into_kernel();
        let resources = self.resources.subset(kernel.rspec())?;
        kernel.start(&node_id, &resources).await?;

        let cell = Rc::new(RefCell::new(Node::new(
            node_id.clone(),
            manifest,
            kernel,
        )?));
        let is_root = cell.borrow().is_root_emitter();
        let _ = self.nodes.insert(node_id.clone(), cell);
        if is_root {
            self.schedule(&node_id);
            self.ready = true;
        }
        debug!(context = %self.id, node = %node_id, scheduled = is_root, "node added");
        Ok(())
    }

    async fn remove(&mut self, node_id: &NodeId) -> Result<(), Error> {
        let cell = self
            .nodes
            .get(node_id)
            .ok_or_else(|| Error::UnknownNode {
                node: node_id.clone(),
            })?
            .clone();

        let (source_ids, sink_ids) = {
            let node = cell.borrow();
            (node.source_ids(), node.sink_ids())
        };
        for source in source_ids {
            if let Some(source_cell) = self.nodes.get(&source) {
                disconnect(source_cell, &cell);
            }
        }
        for sink in sink_ids {
            if let Some(sink_cell) = self.nodes.get(&sink) {
                disconnect(&cell, sink_cell);
            }
        }

        self.unschedule(node_id);
        let _ = self.nodes.remove(node_id);

        // Stop the kernel instance before forgetting the node. A kernel
        // whose aborted tick has not been reaped yet skips the stop call.
        let kernel = cell.borrow().kernel_handle();
        match kernel.try_borrow_mut() {
            Ok(mut kernel) => kernel.stop().await,
            Err(_) => debug!(context = %self.id, node = %node_id, "kernel busy at remove, stop skipped"),
        }
        debug!(context = %self.id, node = %node_id, "node removed");
        Ok(())
    }

    fn connect(&mut self, parent: &NodeId, child: &NodeId) -> Result<(), Error> {
        let parent_cell = self.lookup(parent)?;
        let child_cell = self.lookup(child)?;
        sends_to(&parent_cell, &child_cell)
    }

    fn disconnect(&mut self, parent: &NodeId, child: &NodeId) -> Result<(), Error> {
        let parent_cell = self.lookup(parent)?;
        let child_cell = self.lookup(child)?;
        disconnect(&parent_cell, &child_cell);
        Ok(())
    }

    fn lookup(&self, node_id: &NodeId) -> Result<NodeCell, Error> {
        self.nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::UnknownNode {
                node: node_id.clone(),
            })
    }

    /// Spawns a one-shot tick task for a root emitter.
    fn schedule(&mut self, node_id: &NodeId) {
        let cell = match self.nodes.get(node_id) {
            Some(cell) => cell.clone(),
            None => return,
        };
        let completions = self.completions_tx.clone();
        let id = node_id.clone();
        let handle = tokio::task::spawn_local(async move {
            let tick = activate(cell, None).await;
            let _ = completions.send((id, tick));
        });
        let _ = self.scheduled.insert(node_id.clone(), handle.abort_handle());
    }

    fn on_tick_complete(&mut self, node_id: &NodeId, tick: Result<(), Error>) {
        match tick {
            Ok(()) if self.scheduled.contains_key(node_id) && self.nodes.contains_key(node_id) => {
                self.schedule(node_id);
            }
            // Removed between completion and dispatch; nothing to respawn.
            Ok(()) => {}
            Err(error) => {
                warn!(context = %self.id, node = %node_id, error = %error,
                      "emitter tick failed, no respawn");
                self.unschedule(node_id);
            }
        }
    }

    fn unschedule(&mut self, node_id: &NodeId) {
        if let Some(handle) = self.scheduled.remove(node_id) {
            handle.abort();
        }
        if self.scheduled.is_empty() {
            self.ready = false;
        }
    }

    async fn teardown(&mut self) {
        for (_, handle) in self.scheduled.drain() {
            handle.abort();
        }
        self.ready = false;
        for (node_id, cell) in self.nodes.drain() {
            let kernel = cell.borrow().kernel_handle();
            match kernel.try_borrow_mut() {
                Ok(mut kernel) => kernel.stop().await,
                Err(_) => debug!(context = %self.id, node = %node_id, "kernel busy at teardown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NotifyBus;
    use crate::control::{control_channel, readiness_channel};
    use crate::node::{Arity, Blueprint, Kernel, NodeManifest, Propagate};
    use flowmesh_config::fresh_context_id;
    use flowmesh_data::{FieldSchema, SharedStruct, Struct};
    use tokio::task::LocalSet;
    use tokio::time::{Duration, sleep};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    /// Counts its own ticks into a shared record so the test can observe
    /// progress from outside the worker.
    struct CountingKernel {
        report: SharedStruct,
        ticks: f64,
    }

    #[async_trait::async_trait(?Send)]
    impl Kernel for CountingKernel {
        async fn compute(
            &mut self,
            _inputs: &[Struct],
            output: Option<&mut Struct>,
        ) -> Result<Propagate, Error> {
            // Yield so the worker loop stays responsive between ticks.
            tokio::task::yield_now().await;
            self.ticks += 1.0;
            self.report.set_field("f0", self.ticks)?;
            if let Some(out) = output {
                out.set_field("f0", self.ticks)?;
            }
            Ok(Propagate::Forward)
        }
    }

    fn counting_blueprint(id: &str, report: &SharedStruct) -> Blueprint {
        let report = report.clone();
        Blueprint::new(
            NodeId::from(id.to_owned()),
            NodeManifest::emitter(FieldSchema::scalar(), Arity::Many),
            move || {
                Box::new(CountingKernel {
                    report,
                    ticks: 0.0,
                })
            },
        )
    }

    #[test]
    fn worker_announces_readiness_and_schedules_emitters() {
        let rt = runtime();
        let local = LocalSet::new();
        rt.block_on(local.run_until(async {
            let smm = SegmentManager::new();
            let report = SharedStruct::new(&smm, FieldSchema::scalar());
            let (control_tx, control_rx) = control_channel(16);
            let (ready_tx, ready_rx) = readiness_channel();
            let cancel = CancellationToken::new();
            let ctx_id = fresh_context_id();

            let settings = WorkerSettings {
                context_id: ctx_id.clone(),
                endpoints: Endpoints::default(),
                bus: NotifyBus::new(),
                smm: smm.clone(),
                control: control_rx,
                readiness: ready_tx,
            };
            let worker = tokio::task::spawn_local(run_worker(settings, cancel.clone()));

            let ready = ready_rx.recv_async().await.expect("readiness");
            assert_eq!(ready.ready, ctx_id);

            let (_, shipped) = counting_blueprint("p", &report).ship();
            control_tx
                .send_async(ControlMsg::Add(shipped))
                .await
                .expect("add");

            // The scheduler respawns the emitter; the count keeps growing.
            sleep(Duration::from_millis(50)).await;
            let first = report.item().expect("count");
            assert!(first >= 1.0, "emitter never ticked");
            sleep(Duration::from_millis(50)).await;
            assert!(report.item().expect("count") > first, "emitter stalled");

            cancel.cancel();
            worker.await.expect("join").expect("worker result");
        }));
    }

    #[test]
    fn removing_the_last_emitter_stops_the_ticks() {
        let rt = runtime();
        let local = LocalSet::new();
        rt.block_on(local.run_until(async {
            let smm = SegmentManager::new();
            let report = SharedStruct::new(&smm, FieldSchema::scalar());
            let (control_tx, control_rx) = control_channel(16);
            let (ready_tx, ready_rx) = readiness_channel();
            let cancel = CancellationToken::new();

            let settings = WorkerSettings {
                context_id: fresh_context_id(),
                endpoints: Endpoints::default(),
                bus: NotifyBus::new(),
                smm: smm.clone(),
                control: control_rx,
                readiness: ready_tx,
            };
            let worker = tokio::task::spawn_local(run_worker(settings, cancel.clone()));
            let _ = ready_rx.recv_async().await.expect("readiness");

            let (_, shipped) = counting_blueprint("p", &report).ship();
            control_tx
                .send_async(ControlMsg::Add(shipped))
                .await
                .expect("add");
            sleep(Duration::from_millis(30)).await;

            control_tx
                .send_async(ControlMsg::Remove(NodeId::from("p")))
                .await
                .expect("remove");
            sleep(Duration::from_millis(30)).await;
            let after_remove = report.item().expect("count");
            sleep(Duration::from_millis(30)).await;
            assert_eq!(report.item().expect("count"), after_remove, "ticks after remove");

            cancel.cancel();
            worker.await.expect("join").expect("worker result");
        }));
    }

    #[test]
    fn duplicate_add_fails_the_worker() {
        let rt = runtime();
        let local = LocalSet::new();
        rt.block_on(local.run_until(async {
            let smm = SegmentManager::new();
            let report = SharedStruct::new(&smm, FieldSchema::scalar());
            let (control_tx, control_rx) = control_channel(16);
            let (ready_tx, ready_rx) = readiness_channel();
            let cancel = CancellationToken::new();

            let settings = WorkerSettings {
                context_id: fresh_context_id(),
                endpoints: Endpoints::default(),
                bus: NotifyBus::new(),
                smm: smm.clone(),
                control: control_rx,
                readiness: ready_tx,
            };
            let worker = tokio::task::spawn_local(run_worker(settings, cancel.clone()));
            let _ = ready_rx.recv_async().await.expect("readiness");

            let (_, first) = counting_blueprint("p", &report).ship();
            let (_, duplicate) = counting_blueprint("p", &report).ship();
            control_tx
                .send_async(ControlMsg::Add(first))
                .await
                .expect("add");
            control_tx
                .send_async(ControlMsg::Add(duplicate))
                .await
                .expect("add duplicate");

            let result = worker.await.expect("join");
            assert!(matches!(result, Err(Error::NodeAlreadyExists { .. })));
        }));
    }
}
