// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the data primitives.
//!
//! These errors are emitted from both the orchestrator thread and worker
//! threads, so no `!Send` payloads.

use crate::schema::FieldSchema;

/// All errors that can occur in the data layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A whole-record assignment between differently shaped records.
    #[error("schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch {
        /// Schema of the destination record.
        expected: FieldSchema,
        /// Schema of the value being assigned.
        actual: FieldSchema,
    },

    /// A field name not present in the schema.
    #[error("unknown field `{field}` in schema {schema}")]
    UnknownField {
        /// The missing field name.
        field: String,
        /// The schema that was addressed.
        schema: FieldSchema,
    },

    /// A scalar was requested from a record with more than one field.
    #[error("record with schema {schema} is not a scalar")]
    NotScalar {
        /// The offending schema.
        schema: FieldSchema,
    },

    /// Index beyond the logical window of a streaming array.
    #[error("index {index} out of bounds for streaming array of length {len}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Logical length at the time of the access.
        len: usize,
    },

    /// A streaming array must hold at least one record.
    #[error("streaming array capacity must be positive")]
    ZeroCapacity,

    /// The named segment is not tracked by this manager.
    #[error("unknown segment `{name}`")]
    UnknownSegment {
        /// The segment name that failed to resolve.
        name: String,
    },

    /// A segment smaller than the view that was requested over it.
    #[error("segment `{name}` holds {actual} cells, view needs {expected}")]
    SegmentSizeMismatch {
        /// The segment name.
        name: String,
        /// Cells required by the view.
        expected: usize,
        /// Cells actually allocated.
        actual: usize,
    },

    /// A descriptor whose shape does not match the view being opened.
    #[error("descriptor kind mismatch: {detail}")]
    DescriptorMismatch {
        /// What was expected versus found.
        detail: String,
    },
}
