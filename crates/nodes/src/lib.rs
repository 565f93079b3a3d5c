// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Node library for flowmesh graphs.
//!
//! [`numeric`] holds the computational elements (signals, lambdas,
//! integrators, probes); [`boundary`] holds the elements that cross the
//! context boundary (writers, publishers, subscribers). Every element is
//! declared as a [`flowmesh_engine::Blueprint`] and built inside its
//! destination context.

pub mod boundary;
pub mod numeric;

pub use boundary::{Publisher, Subscriber, Trigger, WriteMode, Writer};
pub use numeric::{
    ArraySource, Clock, Constant, Integrator, Lambda, Noise, ParamSpec, ParametrizedLambda, Signal,
    Throughput,
};
