// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Elements that carry data across the context boundary.
//!
//! A [`Writer`] commits collected values into a shared payload. A
//! [`Publisher`] is a writer that additionally announces each committed
//! write on its producer's notification address. A [`Subscriber`] is the
//! receiving half: an emitter that wakes on a notification and loads the
//! payload into its own output for propagation inside its context.
//!
//! The publisher writes before it notifies, so a subscriber woken by a
//! frame observes at least the state committed at that frame's moment.

use async_trait::async_trait;
use flowmesh_config::NodeId;
use flowmesh_data::{PayloadDescriptor, SharedPayload, Struct};
use flowmesh_engine::bus::{BusPublisher, BusSubscriber};
use flowmesh_engine::node::{Arity, Blueprint, Kernel, NodeManifest, Propagate};
use flowmesh_engine::resource::{ResourceSpec, Resources};
use flowmesh_engine::Error;

/// How a writer commits an unbuffered value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite every field.
    Fill,
    /// Overwrite only the fields named by the incoming value's schema.
    Merge,
}

/// A single-source collector that writes its input into a shared payload.
pub struct Writer;

/// A collector that announces on its own id whenever a predicate over its
/// completed inputs holds.
pub struct Trigger;

/// A writer that also owns the producer's notification address.
pub struct Publisher;

/// An emitter that mirrors a remote producer into its own context.
pub struct Subscriber;

fn commit(payload: &SharedPayload, mode: WriteMode, value: &Struct) -> Result<(), Error> {
    match payload {
        SharedPayload::Stream(ring) => ring.consume(value)?,
        SharedPayload::Struct(record) => match mode {
            WriteMode::Fill => record.set(value)?,
            WriteMode::Merge => record.merge(value)?,
        },
    }
    Ok(())
}

impl Writer {
    /// Declares a writer committing into `link` with the given mode.
    #[must_use]
    pub fn blueprint(id: NodeId, link: PayloadDescriptor, mode: WriteMode) -> Blueprint {
        let kernel_id = id.clone();
        Blueprint::new(id, NodeManifest::collector(Arity::One), move || {
            Box::new(WriterKernel {
                id: kernel_id,
                link,
                mode,
                payload: None,
            })
        })
    }
}

struct WriterKernel {
    id: NodeId,
    link: PayloadDescriptor,
    mode: WriteMode,
    payload: Option<SharedPayload>,
}

impl WriterKernel {
    fn payload(&self) -> Result<&SharedPayload, Error> {
        self.payload.as_ref().ok_or_else(|| Error::KernelError {
            node: self.id.clone(),
            error: "writer used before start".to_owned(),
        })
    }
}

#[async_trait(?Send)]
impl Kernel for WriterKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::SMM
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.payload = Some(SharedPayload::open(res.smm()?, &self.link)?);
        Ok(())
    }

    async fn compute(
        &mut self,
        inputs: &[Struct],
        _output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        let value = inputs.first().ok_or_else(|| Error::KernelError {
            node: self.id.clone(),
            error: "writer activated with no input".to_owned(),
        })?;
        commit(self.payload()?, self.mode, value)?;
        Ok(Propagate::Forward)
    }
}

impl Trigger {
    /// Declares a trigger firing when `predicate` holds over the scalar
    /// items of a completed input cycle. The notification goes out only
    /// after the cycle's compute has fully finished.
    #[must_use]
    pub fn blueprint(
        id: NodeId,
        predicate: impl Fn(&[f64]) -> bool + Send + 'static,
    ) -> Blueprint {
        let kernel_id = id.clone();
        Blueprint::new(id, NodeManifest::collector(Arity::Many), move || {
            Box::new(TriggerKernel {
                id: kernel_id,
                predicate: Box::new(predicate),
                sock: None,
            })
        })
    }
}

struct TriggerKernel {
    id: NodeId,
    predicate: Box<dyn Fn(&[f64]) -> bool + Send>,
    sock: Option<BusPublisher>,
}

#[async_trait(?Send)]
impl Kernel for TriggerKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::BUS
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.sock = Some(res.bus()?.bind(&self.id)?);
        Ok(())
    }

    async fn compute(
        &mut self,
        inputs: &[Struct],
        _output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        let items: Vec<f64> = inputs
            .iter()
            .map(|record| record.item().map_err(Error::from))
            .collect::<Result<_, _>>()?;
        if (self.predicate)(&items) {
            if let Some(sock) = &self.sock {
                sock.send();
            }
        }
        Ok(Propagate::Forward)
    }
}

impl Publisher {
    /// Declares a publisher for `source`, writing into `link` and notifying
    /// every `emit_every` writes (1 = every write).
    #[must_use]
    pub fn blueprint(
        id: NodeId,
        source: NodeId,
        link: PayloadDescriptor,
        emit_every: u32,
    ) -> Blueprint {
        let kernel_id = id.clone();
        Blueprint::new(id, NodeManifest::collector(Arity::One), move || {
            Box::new(PublisherKernel {
                id: kernel_id,
                source,
                link,
                emit_every: emit_every.max(1),
                n_writes: 0,
                payload: None,
                sock: None,
            })
        })
    }
}

struct PublisherKernel {
    id: NodeId,
    source: NodeId,
    link: PayloadDescriptor,
    emit_every: u32,
    n_writes: u32,
    payload: Option<SharedPayload>,
    sock: Option<BusPublisher>,
}

#[async_trait(?Send)]
impl Kernel for PublisherKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::SMM | ResourceSpec::MC_URL | ResourceSpec::BUS
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.payload = Some(SharedPayload::open(res.smm()?, &self.link)?);
        // One notification address per published producer.
        let addr = format!("{}{}", res.mc_url()?, self.source);
        self.sock = Some(res.bus()?.bind(&addr)?);
        Ok(())
    }

    async fn compute(
        &mut self,
        inputs: &[Struct],
        _output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        self.n_writes += 1;
        if self.n_writes == self.emit_every {
            let value = inputs.first().ok_or_else(|| Error::KernelError {
                node: self.id.clone(),
                error: "publisher activated with no input".to_owned(),
            })?;
            let payload = self.payload.as_ref().ok_or_else(|| Error::KernelError {
                node: self.id.clone(),
                error: "publisher used before start".to_owned(),
            })?;
            commit(payload, WriteMode::Fill, value)?;
            // Notify only after the write has committed.
            if let Some(sock) = &self.sock {
                sock.send();
            }
            self.n_writes = 0;
        }
        Ok(Propagate::Forward)
    }
}

impl Subscriber {
    /// Declares a subscriber mirroring `source` through `link`.
    #[must_use]
    pub fn blueprint(id: NodeId, source: NodeId, link: PayloadDescriptor) -> Blueprint {
        let schema = link.schema().clone();
        let kernel_id = id.clone();
        Blueprint::new(
            id,
            NodeManifest::emitter(schema, Arity::Many),
            move || {
                Box::new(SubscriberKernel {
                    id: kernel_id,
                    source,
                    link,
                    payload: None,
                    sock: None,
                })
            },
        )
    }
}

struct SubscriberKernel {
    id: NodeId,
    source: NodeId,
    link: PayloadDescriptor,
    payload: Option<SharedPayload>,
    sock: Option<BusSubscriber>,
}

#[async_trait(?Send)]
impl Kernel for SubscriberKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::SMM | ResourceSpec::MC_URL | ResourceSpec::BUS
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.payload = Some(SharedPayload::open(res.smm()?, &self.link)?);
        let addr = format!("{}{}", res.mc_url()?, self.source);
        self.sock = Some(res.bus()?.subscribe(&addr));
        Ok(())
    }

    async fn compute(
        &mut self,
        _inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        let sock = self.sock.as_mut().ok_or_else(|| Error::KernelError {
            node: self.id.clone(),
            error: "subscriber used before start".to_owned(),
        })?;
        // Any frame counts as a computation trigger.
        sock.recv().await?;
        let payload = self.payload.as_ref().ok_or_else(|| Error::KernelError {
            node: self.id.clone(),
            error: "subscriber used before start".to_owned(),
        })?;
        let snapshot = payload.snapshot_head()?;
        let out = output.ok_or_else(|| Error::KernelError {
            node: self.id.clone(),
            error: "subscriber has no output record".to_owned(),
        })?;
        out.set(&snapshot)?;
        Ok(Propagate::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_config::Endpoints;
    use flowmesh_data::{FieldSchema, SegmentManager};
    use flowmesh_engine::bus::NotifyBus;
    use flowmesh_engine::resource::ResourceMap;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    fn resources(smm: &SegmentManager, bus: &NotifyBus, spec: ResourceSpec) -> Resources {
        ResourceMap::new(bus.clone(), Endpoints::default(), smm.clone())
            .subset(spec)
            .expect("subset")
    }

    fn record(fields: &[(&str, f64)]) -> Struct {
        let schema = FieldSchema::new(fields.iter().map(|(name, _)| (*name).to_owned()));
        let values: Vec<f64> = fields.iter().map(|(_, v)| *v).collect();
        Struct::with_values(schema, &values).expect("record")
    }

    #[test]
    fn writer_fill_overwrites_every_field() {
        runtime().block_on(async {
            let smm = SegmentManager::new();
            let bus = NotifyBus::new();
            let target = SharedPayload::new_struct(&smm, FieldSchema::new(["a", "b"]));

            let (_, shipped) = Writer::blueprint(
                NodeId::from("w"),
                target.descriptor(),
                WriteMode::Fill,
            )
            .ship();
            let mut kernel = shipped.into_kernel();
            let res = resources(&smm, &bus, kernel.rspec());
            kernel.start(&NodeId::from("w"), &res).await.expect("start");

            let _ = kernel
                .compute(&[record(&[("a", 1.0), ("b", 2.0)])], None)
                .await
                .expect("compute");
            assert_eq!(target.snapshot_head().expect("head").values(), &[1.0, 2.0]);
        });
    }

    #[test]
    fn writer_merge_touches_named_fields_only() {
        runtime().block_on(async {
            let smm = SegmentManager::new();
            let bus = NotifyBus::new();
            let target = SharedPayload::new_struct(&smm, FieldSchema::new(["a", "b"]));
            if let SharedPayload::Struct(record_view) = &target {
                record_view.set(&record(&[("a", 1.0), ("b", 2.0)])).expect("seed");
            }

            let (_, shipped) = Writer::blueprint(
                NodeId::from("w"),
                target.descriptor(),
                WriteMode::Merge,
            )
            .ship();
            let mut kernel = shipped.into_kernel();
            let res = resources(&smm, &bus, kernel.rspec());
            kernel.start(&NodeId::from("w"), &res).await.expect("start");

            let _ = kernel
                .compute(&[record(&[("b", 9.0)])], None)
                .await
                .expect("compute");
            assert_eq!(target.snapshot_head().expect("head").values(), &[1.0, 9.0]);
        });
    }

    #[test]
    fn writer_appends_to_buffered_payloads() {
        runtime().block_on(async {
            let smm = SegmentManager::new();
            let bus = NotifyBus::new();
            let target =
                SharedPayload::new_stream(&smm, FieldSchema::scalar(), 4).expect("payload");

            let (_, shipped) = Writer::blueprint(
                NodeId::from("w"),
                target.descriptor(),
                WriteMode::Fill,
            )
            .ship();
            let mut kernel = shipped.into_kernel();
            let res = resources(&smm, &bus, kernel.rspec());
            kernel.start(&NodeId::from("w"), &res).await.expect("start");

            for v in [1.0, 2.0, 3.0] {
                let _ = kernel
                    .compute(&[Struct::scalar(v)], None)
                    .await
                    .expect("compute");
            }
            if let SharedPayload::Stream(ring) = &target {
                assert_eq!(ring.len(), 3);
                assert_eq!(ring.get(0).expect("head").item().expect("scalar"), 3.0);
            }
        });
    }

    #[test]
    fn publisher_writes_then_notifies_every_nth() {
        runtime().block_on(async {
            let smm = SegmentManager::new();
            let bus = NotifyBus::new();
            let endpoints = Endpoints::default();
            let target = SharedPayload::new_struct(&smm, FieldSchema::scalar());
            let mut sub = bus.subscribe(&endpoints.mc_addr(&NodeId::from("p")));

            let (_, shipped) = Publisher::blueprint(
                NodeId::from("pub"),
                NodeId::from("p"),
                target.descriptor(),
                2,
            )
            .ship();
            let mut kernel = shipped.into_kernel();
            let res = resources(&smm, &bus, kernel.rspec());
            kernel.start(&NodeId::from("pub"), &res).await.expect("start");

            // First write is skipped (emit_every = 2), second commits + notifies.
            let _ = kernel.compute(&[Struct::scalar(1.0)], None).await.expect("c1");
            assert!(target.snapshot_head().expect("head").item().expect("scalar").is_nan());
            let _ = kernel.compute(&[Struct::scalar(2.0)], None).await.expect("c2");
            sub.recv().await.expect("notified");
            assert_eq!(target.snapshot_head().expect("head").item().expect("scalar"), 2.0);
        });
    }

    #[test]
    fn trigger_fires_only_after_compute_completes() {
        runtime().block_on(async {
            let smm = SegmentManager::new();
            let bus = NotifyBus::new();
            let mut listener = bus.subscribe("t");

            let (_, shipped) =
                Trigger::blueprint(NodeId::from("t"), |items| items[0] > 1.0).ship();
            let mut kernel = shipped.into_kernel();
            let res = resources(&smm, &bus, kernel.rspec());
            kernel.start(&NodeId::from("t"), &res).await.expect("start");

            // Below threshold: no event.
            let _ = kernel
                .compute(&[record(&[("f0", 0.5)])], None)
                .await
                .expect("compute");
            assert!(
                tokio::time::timeout(std::time::Duration::from_millis(20), listener.recv())
                    .await
                    .is_err()
            );

            // Above threshold: the event fires after the cycle completed.
            let _ = kernel
                .compute(&[record(&[("f0", 2.0)])], None)
                .await
                .expect("compute");
            listener.recv().await.expect("event");
        });
    }

    #[test]
    fn subscriber_loads_the_committed_state() {
        runtime().block_on(async {
            let smm = SegmentManager::new();
            let bus = NotifyBus::new();
            let endpoints = Endpoints::default();
            let target = SharedPayload::new_struct(&smm, FieldSchema::scalar());

            let (manifest, shipped) = Subscriber::blueprint(
                NodeId::from("sub"),
                NodeId::from("p"),
                target.descriptor(),
            )
            .ship();
            assert!(manifest.is_root_emitter());
            let mut kernel = shipped.into_kernel();
            let res = resources(&smm, &bus, kernel.rspec());
            kernel.start(&NodeId::from("sub"), &res).await.expect("start");

            let publisher = bus
                .bind(&endpoints.mc_addr(&NodeId::from("p")))
                .expect("bind");
            if let SharedPayload::Struct(record_view) = &target {
                record_view.set(&Struct::scalar(7.0)).expect("commit");
            }
            publisher.send();

            let mut out = Struct::new(FieldSchema::scalar());
            let verdict = kernel
                .compute(&[], Some(&mut out))
                .await
                .expect("compute");
            assert_eq!(verdict, Propagate::Forward);
            assert_eq!(out.item().expect("scalar"), 7.0);
        });
    }
}
