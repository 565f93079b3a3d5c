// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Data primitives for the flowmesh graph executor.
//!
//! The value types come in two flavors with the same surface:
//!
//! - process-local: [`Struct`] and [`StreamingArray`];
//! - segment-backed: [`SharedStruct`] and [`SharedStreamingArray`], whose
//!   bytes live in a named segment handed out by a [`SegmentManager`] so
//!   that peer execution contexts can reconstruct a view from a serialized
//!   [`PayloadDescriptor`].
//!
//! A segment is written by exactly one writer and read by any number of
//! readers, without locks. Readers may observe a torn multi-field record;
//! notifications mean "a new value has arrived", not "this exact value".

pub mod error;
pub mod record;
pub mod schema;
pub mod segment;
pub mod shared;
pub mod streaming;

pub use error::Error;
pub use record::Struct;
pub use schema::FieldSchema;
pub use segment::{Segment, SegmentManager, SegmentName};
pub use shared::{PayloadDescriptor, SharedPayload, SharedStreamingArray, SharedStruct};
pub use streaming::StreamingArray;
