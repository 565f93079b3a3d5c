// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Context worker threads.
//!
//! Each execution context is a dedicated OS thread running a
//! single-threaded tokio runtime with a `LocalSet`, so node state inside
//! the worker never needs to be `Send`. The handle carries the control
//! lane, the readiness flag and the cancellation token.

use crate::error::Error;
use flowmesh_config::{ContextId, Endpoints};
use flowmesh_data::SegmentManager;
use flowmesh_engine::bus::NotifyBus;
use flowmesh_engine::control::{ControlSender, ReadySender, control_channel};
use flowmesh_engine::context::{WorkerSettings, run_worker};
use std::thread;
use tokio::runtime::Builder as RtBuilder;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

/// Depth of one context's control lane.
const CONTROL_LANE_DEPTH: usize = 64;

/// A running context worker, as seen from the orchestrator.
pub(crate) struct ContextHandle {
    pub(crate) id: ContextId,
    pub(crate) control: ControlSender,
    /// Set once the worker's readiness announcement has been drained.
    pub(crate) ready: bool,
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<Result<(), flowmesh_engine::Error>>>,
}

impl ContextHandle {
    /// Spawns the worker thread and returns its handle. The context is not
    /// ready until its announcement arrives on the readiness lane.
    pub(crate) fn spawn(
        id: ContextId,
        endpoints: Endpoints,
        bus: NotifyBus,
        smm: SegmentManager,
        readiness: ReadySender,
    ) -> Result<Self, Error> {
        let (control_tx, control_rx) = control_channel(CONTROL_LANE_DEPTH);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let context_id = id.clone();

        let join = thread::Builder::new()
            .name(format!("flowmesh-{id}"))
            .spawn(move || {
                let rt = RtBuilder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build worker runtime");
                let local = LocalSet::new();
                let settings = WorkerSettings {
                    context_id,
                    endpoints,
                    bus,
                    smm,
                    control: control_rx,
                    readiness,
                };
                rt.block_on(local.run_until(run_worker(settings, token)))
            })
            .map_err(|source| Error::ThreadSpawnError {
                context: id.clone(),
                source,
            })?;

        Ok(Self {
            id,
            control: control_tx,
            ready: false,
            cancel,
            join: Some(join),
        })
    }

    /// Requests cancellation; idempotent and best-effort.
    pub(crate) fn shutdown(&mut self) {
        self.cancel.cancel();
    }

    /// Requests cancellation and waits for the thread to finish.
    pub(crate) fn shutdown_and_join(mut self) -> Result<(), Error> {
        self.shutdown();
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        match join.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Error::Engine(error)),
            Err(panic) => Err(Error::ThreadJoinPanic {
                context: self.id.clone(),
                panic_message: format!("{panic:?}"),
            }),
        }
    }
}
