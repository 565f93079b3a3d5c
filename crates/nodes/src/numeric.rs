// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Numeric elements: signal sources, lambdas, integrators and probes.

use async_trait::async_trait;
use flowmesh_config::{NodeId, fresh_node_id};
use flowmesh_data::{
    FieldSchema, PayloadDescriptor, SegmentManager, SharedStreamingArray, SharedStruct, Struct,
};
use flowmesh_engine::Error;
use flowmesh_engine::bus::BusPublisher;
use flowmesh_engine::node::{Arity, Blueprint, Kernel, NodeManifest, Propagate};
use flowmesh_engine::resource::{ResourceSpec, Resources};
use std::time::{Duration, Instant};
use tracing::info;

/// A finite emitter sampling `fun(ctr)` once per tick.
///
/// The counter advances by one each tick; the emitter is finished once the
/// counter reaches `limit`, after which it announces on its own id instead
/// of propagating. An infinite limit gives a free-running signal.
pub struct Signal;

/// A free-running signal pinned to one value.
pub struct Constant;

/// A router applying a scalar function over its fan-in.
pub struct Lambda;

/// Bounds of one parameter of a [`ParametrizedLambda`]: initial value plus
/// the lower/upper range used by optimizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    /// Initial parameter value.
    pub init: f64,
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

impl ParamSpec {
    /// Declares a parameter.
    #[must_use]
    pub const fn new(init: f64, lower: f64, upper: f64) -> Self {
        Self { init, lower, upper }
    }
}

/// A [`Lambda`] with a live parameter record (`p0`, `p1`, …) held in shared
/// memory, writable from any context through [`PayloadDescriptor`].
pub struct ParametrizedLambda;

/// A single-source, many-sink accumulator. The accumulator starts at zero.
pub struct Integrator;

/// An emitter of uniform random samples, optionally rate-limited.
pub struct Noise;

/// An emitter that logs wall-clock progress, for eyeballing liveness.
pub struct Clock;

/// A collector counting activations; reports its rate when stopped and can
/// mirror the running count into a shared record for observation.
pub struct Throughput;

/// A finite emitter replaying the records of a shared ring.
pub struct ArraySource;

impl Signal {
    /// Declares a signal with a fresh id.
    #[must_use]
    pub fn blueprint(fun: impl Fn(f64) -> f64 + Send + 'static, limit: f64) -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), fun, limit)
    }

    /// Declares a signal under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(
        id: NodeId,
        fun: impl Fn(f64) -> f64 + Send + 'static,
        limit: f64,
    ) -> Blueprint {
        Self::blueprint_named(id, "f0", fun, limit)
    }

    /// Declares a signal with an inter-tick delay, for sources that should
    /// pace the graph rather than saturate it.
    #[must_use]
    pub fn blueprint_throttled(
        id: NodeId,
        fun: impl Fn(f64) -> f64 + Send + 'static,
        limit: f64,
        delta: Duration,
    ) -> Blueprint {
        Self::blueprint_inner(id, "f0", fun, limit, delta)
    }

    /// Declares a signal whose single output field carries a chosen name,
    /// the way to target a parameter record, where a merge-mode write
    /// matches fields by name.
    #[must_use]
    pub fn blueprint_named(
        id: NodeId,
        field: &str,
        fun: impl Fn(f64) -> f64 + Send + 'static,
        limit: f64,
    ) -> Blueprint {
        Self::blueprint_inner(id, field, fun, limit, Duration::ZERO)
    }

    fn blueprint_inner(
        id: NodeId,
        field: &str,
        fun: impl Fn(f64) -> f64 + Send + 'static,
        limit: f64,
        delta: Duration,
    ) -> Blueprint {
        let kernel_id = id.clone();
        let field = field.to_owned();
        let schema = FieldSchema::new([field.clone()]);
        Blueprint::new(id, NodeManifest::emitter(schema, Arity::Many), move || {
            Box::new(SignalKernel {
                id: kernel_id,
                field,
                fun: Box::new(fun),
                limit,
                delta,
                ctr: 0.0,
                announcer: None,
            })
        })
    }
}

struct SignalKernel {
    id: NodeId,
    field: String,
    fun: Box<dyn Fn(f64) -> f64 + Send>,
    limit: f64,
    delta: Duration,
    ctr: f64,
    announcer: Option<BusPublisher>,
}

#[async_trait(?Send)]
impl Kernel for SignalKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::BUS
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        // Terminal notifications go out on the node's own id.
        self.announcer = Some(res.bus()?.bind(&self.id)?);
        Ok(())
    }

    async fn compute(
        &mut self,
        _inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        throttle(self.delta).await;
        if self.ctr > self.limit {
            return Ok(Propagate::Suppress);
        }
        self.ctr += 1.0;
        if let Some(out) = output {
            out.set_field(&self.field, (self.fun)(self.ctr))?;
        }
        Ok(Propagate::Forward)
    }

    fn finished(&self) -> Option<bool> {
        Some(self.ctr >= self.limit)
    }

    async fn announce_finished(&mut self) -> Result<(), Error> {
        if let Some(announcer) = &self.announcer {
            announcer.send();
        }
        Ok(())
    }
}

impl Constant {
    /// Declares a constant signal with a fresh id.
    #[must_use]
    pub fn blueprint(value: f64) -> Blueprint {
        Signal::blueprint(move |_| value, f64::INFINITY)
    }

    /// Declares a constant signal under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId, value: f64) -> Blueprint {
        Signal::blueprint_with_id(id, move |_| value, f64::INFINITY)
    }

    /// Declares a constant whose output field carries a chosen name, for
    /// parameter targeting.
    #[must_use]
    pub fn blueprint_named(id: NodeId, field: &str, value: f64) -> Blueprint {
        Signal::blueprint_named(id, field, move |_| value, f64::INFINITY)
    }
}

impl Lambda {
    /// Declares a lambda router with a fresh id.
    #[must_use]
    pub fn blueprint(fun: impl Fn(&[f64]) -> f64 + Send + 'static) -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), fun)
    }

    /// Declares a lambda router under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId, fun: impl Fn(&[f64]) -> f64 + Send + 'static) -> Blueprint {
        Blueprint::new(
            id,
            NodeManifest::router(FieldSchema::scalar(), Arity::Many, Arity::Many),
            move || Box::new(LambdaKernel { fun: Box::new(fun) }),
        )
    }
}

struct LambdaKernel {
    fun: Box<dyn Fn(&[f64]) -> f64 + Send>,
}

#[async_trait(?Send)]
impl Kernel for LambdaKernel {
    async fn compute(
        &mut self,
        inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        let args = scalars(inputs)?;
        if let Some(out) = output {
            out.set_field("f0", (self.fun)(&args))?;
        }
        Ok(Propagate::Forward)
    }
}

impl ParametrizedLambda {
    /// Declares a parametrized lambda with a fresh id. The parameter record
    /// (`p0`, `p1`, …) is allocated immediately so the orchestrator can
    /// target it with `parameterize` before the node even starts.
    ///
    /// # Errors
    ///
    /// Data-layer errors from allocating the parameter record.
    pub fn blueprint(
        smm: &SegmentManager,
        fun: impl Fn(&[f64], &[f64]) -> f64 + Send + 'static,
        params: &[ParamSpec],
    ) -> Result<Blueprint, Error> {
        Self::blueprint_with_id(fresh_node_id(), smm, fun, params)
    }

    /// Declares a parametrized lambda under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Data-layer errors from allocating the parameter record.
    pub fn blueprint_with_id(
        id: NodeId,
        smm: &SegmentManager,
        fun: impl Fn(&[f64], &[f64]) -> f64 + Send + 'static,
        params: &[ParamSpec],
    ) -> Result<Blueprint, Error> {
        let schema = FieldSchema::new((0..params.len()).map(|i| format!("p{i}")));
        let record = SharedStruct::new(smm, schema.clone());
        for (i, spec) in params.iter().enumerate() {
            record.set_field(&format!("p{i}"), spec.init)?;
        }
        let link = record.descriptor();
        let manifest = NodeManifest::router(FieldSchema::scalar(), Arity::Many, Arity::Many)
            .with_params(link.clone());
        Ok(Blueprint::new(id, manifest, move || {
            Box::new(ParametrizedLambdaKernel {
                fun: Box::new(fun),
                link,
                params: None,
            })
        }))
    }

    /// The `(lower, upper)` bound table of a parameter list, keyed like the
    /// parameter record's fields.
    #[must_use]
    pub fn bounds(params: &[ParamSpec]) -> Vec<(String, (f64, f64))> {
        params
            .iter()
            .enumerate()
            .map(|(i, spec)| (format!("p{i}"), (spec.lower, spec.upper)))
            .collect()
    }
}

struct ParametrizedLambdaKernel {
    fun: Box<dyn Fn(&[f64], &[f64]) -> f64 + Send>,
    link: PayloadDescriptor,
    params: Option<SharedStruct>,
}

#[async_trait(?Send)]
impl Kernel for ParametrizedLambdaKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::SMM
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.params = Some(SharedStruct::open(res.smm()?, &self.link)?);
        Ok(())
    }

    async fn compute(
        &mut self,
        inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        let args = scalars(inputs)?;
        let params = match &self.params {
            Some(params) => params.snapshot(),
            None => Struct::new(self.link.schema().clone()),
        };
        if let Some(out) = output {
            out.set_field("f0", (self.fun)(&args, params.values()))?;
        }
        Ok(Propagate::Forward)
    }
}

impl Integrator {
    /// Declares an integrator with a fresh id.
    #[must_use]
    pub fn blueprint() -> Blueprint {
        Self::blueprint_with_id(fresh_node_id())
    }

    /// Declares an integrator under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId) -> Blueprint {
        Blueprint::new(id, NodeManifest::out_branch(FieldSchema::scalar()), || {
            Box::new(IntegratorKernel { acc: 0.0 })
        })
    }
}

struct IntegratorKernel {
    acc: f64,
}

#[async_trait(?Send)]
impl Kernel for IntegratorKernel {
    async fn compute(
        &mut self,
        inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        let value = scalars(inputs)?.first().copied().unwrap_or(0.0);
        self.acc += value;
        if let Some(out) = output {
            out.set_field("f0", self.acc)?;
        }
        Ok(Propagate::Forward)
    }
}

impl Noise {
    /// Declares a noise emitter with a fresh id. `delta` throttles the tick
    /// rate; zero ticks as fast as the scheduler allows.
    #[must_use]
    pub fn blueprint(delta: Duration) -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), delta)
    }

    /// Declares a noise emitter under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId, delta: Duration) -> Blueprint {
        Blueprint::new(
            id,
            NodeManifest::emitter(FieldSchema::scalar(), Arity::Many),
            move || Box::new(NoiseKernel { delta }),
        )
    }
}

struct NoiseKernel {
    delta: Duration,
}

#[async_trait(?Send)]
impl Kernel for NoiseKernel {
    async fn compute(
        &mut self,
        _inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        throttle(self.delta).await;
        if let Some(out) = output {
            out.set_field("f0", rand::random::<f64>())?;
        }
        Ok(Propagate::Forward)
    }
}

impl Clock {
    /// Declares a clock emitter with a fresh id.
    #[must_use]
    pub fn blueprint(delta: Duration) -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), delta)
    }

    /// Declares a clock emitter under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId, delta: Duration) -> Blueprint {
        let kernel_id = id.clone();
        Blueprint::new(
            id,
            NodeManifest::emitter(FieldSchema::scalar(), Arity::Many),
            move || {
                Box::new(ClockKernel {
                    id: kernel_id,
                    delta,
                    started: Instant::now(),
                })
            },
        )
    }
}

struct ClockKernel {
    id: NodeId,
    delta: Duration,
    started: Instant,
}

#[async_trait(?Send)]
impl Kernel for ClockKernel {
    async fn compute(
        &mut self,
        _inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        throttle(self.delta).await;
        let elapsed = self.started.elapsed().as_secs_f64();
        info!(node = %self.id, elapsed_s = elapsed, "clock tick");
        if let Some(out) = output {
            out.set_field("f0", elapsed)?;
        }
        Ok(Propagate::Forward)
    }
}

impl Throughput {
    /// Declares a throughput probe with a fresh id.
    #[must_use]
    pub fn blueprint() -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), None)
    }

    /// Declares a throughput probe that mirrors its running count into the
    /// given shared record (`f0`).
    #[must_use]
    pub fn blueprint_with_report(report: PayloadDescriptor) -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), Some(report))
    }

    /// Declares a throughput probe under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId, report: Option<PayloadDescriptor>) -> Blueprint {
        let kernel_id = id.clone();
        Blueprint::new(id, NodeManifest::collector(Arity::Many), move || {
            Box::new(ThroughputKernel {
                id: kernel_id,
                link: report,
                report: None,
                started: None,
                ctr: 0,
            })
        })
    }
}

struct ThroughputKernel {
    id: NodeId,
    link: Option<PayloadDescriptor>,
    report: Option<SharedStruct>,
    started: Option<Instant>,
    ctr: u64,
}

#[async_trait(?Send)]
impl Kernel for ThroughputKernel {
    fn rspec(&self) -> ResourceSpec {
        if self.link.is_some() {
            ResourceSpec::SMM
        } else {
            ResourceSpec::empty()
        }
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.started = Some(Instant::now());
        if let Some(link) = &self.link {
            self.report = Some(SharedStruct::open(res.smm()?, link)?);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(started) = self.started {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                info!(node = %self.id, rate_per_s = self.ctr as f64 / elapsed, "throughput");
            }
        }
    }

    async fn compute(
        &mut self,
        _inputs: &[Struct],
        _output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        self.ctr += 1;
        if let Some(report) = &self.report {
            report.set_field("f0", self.ctr as f64)?;
        }
        Ok(Propagate::Forward)
    }
}

impl ArraySource {
    /// Declares a source replaying `array` record by record, most recent
    /// first, with a fresh id.
    #[must_use]
    pub fn blueprint(array: &SharedStreamingArray) -> Blueprint {
        Self::blueprint_with_id(fresh_node_id(), array)
    }

    /// Declares a replay source under a caller-chosen id.
    #[must_use]
    pub fn blueprint_with_id(id: NodeId, array: &SharedStreamingArray) -> Blueprint {
        let link = array.descriptor();
        let total = array.len();
        let schema = array.schema().clone();
        let kernel_id = id.clone();
        Blueprint::new(
            id,
            NodeManifest::emitter(schema, Arity::Many),
            move || {
                Box::new(ArraySourceKernel {
                    id: kernel_id,
                    link,
                    index: 0,
                    total,
                    view: None,
                    announcer: None,
                })
            },
        )
    }
}

struct ArraySourceKernel {
    id: NodeId,
    link: PayloadDescriptor,
    index: usize,
    total: usize,
    view: Option<SharedStreamingArray>,
    announcer: Option<BusPublisher>,
}

#[async_trait(?Send)]
impl Kernel for ArraySourceKernel {
    fn rspec(&self) -> ResourceSpec {
        ResourceSpec::SMM | ResourceSpec::BUS
    }

    async fn start(&mut self, _id: &NodeId, res: &Resources) -> Result<(), Error> {
        self.view = Some(SharedStreamingArray::open(res.smm()?, &self.link)?);
        self.announcer = Some(res.bus()?.bind(&self.id)?);
        Ok(())
    }

    async fn compute(
        &mut self,
        _inputs: &[Struct],
        output: Option<&mut Struct>,
    ) -> Result<Propagate, Error> {
        if self.index >= self.total {
            return Ok(Propagate::Suppress);
        }
        let view = self.view.as_ref().ok_or_else(|| Error::KernelError {
            node: self.id.clone(),
            error: "array source used before start".to_owned(),
        })?;
        let record = view.get(self.index)?;
        if let Some(out) = output {
            out.set(&record)?;
        }
        self.index += 1;
        Ok(Propagate::Forward)
    }

    fn finished(&self) -> Option<bool> {
        Some(self.index >= self.total)
    }

    async fn announce_finished(&mut self) -> Result<(), Error> {
        if let Some(announcer) = &self.announcer {
            announcer.send();
        }
        Ok(())
    }
}

fn scalars(inputs: &[Struct]) -> Result<Vec<f64>, Error> {
    inputs
        .iter()
        .map(|record| record.item().map_err(Error::from))
        .collect()
}

async fn throttle(delta: Duration) {
    if delta.is_zero() {
        // Stay cooperative even when unthrottled.
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delta).await;
    }
}
