// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Segment-backed records and rings, and the descriptors that let a peer
//! context reconstruct a view of the same cells.

use crate::error::Error;
use crate::record::Struct;
use crate::schema::FieldSchema;
use crate::segment::{Segment, SegmentManager, SegmentName};
use crate::streaming::{RingStorage, ring_consume, ring_get, ring_len};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Field name of the head index in a ring's metadata record.
const HEAD_INDEX_FIELD: &str = "head_index";

/// Serializable identity of a shared payload.
///
/// The descriptor carries everything a peer needs to open a view: the field
/// schema, the segment name, and for rings the capacity plus the metadata
/// record's own descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadDescriptor {
    /// An unbuffered single record.
    Struct {
        /// Field schema of the record.
        schema: FieldSchema,
        /// Name of the backing segment.
        segment: SegmentName,
    },
    /// A buffered ring of records.
    Stream {
        /// Field schema of each record.
        schema: FieldSchema,
        /// Logical capacity of the ring.
        buf_size: usize,
        /// Name of the backing segment.
        segment: SegmentName,
        /// Descriptor of the metadata record holding the head index.
        metadata: Box<PayloadDescriptor>,
    },
}

impl PayloadDescriptor {
    /// Field schema of the payload's records.
    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        match self {
            PayloadDescriptor::Struct { schema, .. } | PayloadDescriptor::Stream { schema, .. } => {
                schema
            }
        }
    }

    /// Whether the payload retains history.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self, PayloadDescriptor::Stream { .. })
    }

    /// Names of every segment the payload occupies, metadata included.
    #[must_use]
    pub fn segment_names(&self) -> Vec<SegmentName> {
        match self {
            PayloadDescriptor::Struct { segment, .. } => vec![segment.clone()],
            PayloadDescriptor::Stream {
                segment, metadata, ..
            } => {
                let mut names = vec![segment.clone()];
                names.extend(metadata.segment_names());
                names
            }
        }
    }
}

/// A structured record whose cells live in a shared segment.
#[derive(Clone)]
pub struct SharedStruct {
    schema: FieldSchema,
    segment: Arc<Segment>,
}

impl SharedStruct {
    /// Allocates a NaN-filled shared record.
    #[must_use]
    pub fn new(manager: &SegmentManager, schema: FieldSchema) -> Self {
        let segment = manager.create(schema.len());
        Self { schema, segment }
    }

    /// Allocates a shared record and fills it from `value`.
    #[must_use]
    pub fn from_struct(manager: &SegmentManager, value: &Struct) -> Self {
        let shared = Self::new(manager, value.schema().clone());
        for (cell, v) in value.values().iter().enumerate() {
            shared.segment.store(cell, *v);
        }
        shared
    }

    /// Opens a view over an existing shared record.
    ///
    /// # Errors
    ///
    /// [`Error::DescriptorMismatch`] for a ring descriptor,
    /// [`Error::UnknownSegment`] / [`Error::SegmentSizeMismatch`] when the
    /// segment cannot back the view.
    pub fn open(manager: &SegmentManager, descriptor: &PayloadDescriptor) -> Result<Self, Error> {
        let PayloadDescriptor::Struct { schema, segment } = descriptor else {
            return Err(Error::DescriptorMismatch {
                detail: "expected an unbuffered record descriptor, got a ring".to_owned(),
            });
        };
        let segment = manager.open(segment)?;
        check_segment_len(&segment, schema.len())?;
        Ok(Self {
            schema: schema.clone(),
            segment,
        })
    }

    /// The serializable identity of this record.
    #[must_use]
    pub fn descriptor(&self) -> PayloadDescriptor {
        PayloadDescriptor::Struct {
            schema: self.schema.clone(),
            segment: self.segment.name().to_owned(),
        }
    }

    /// The record's schema.
    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Reads a field by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`] when `name` is not in the schema.
    pub fn get(&self, name: &str) -> Result<f64, Error> {
        let cell = self.position(name)?;
        Ok(self.segment.load(cell))
    }

    /// Writes a field by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`] when `name` is not in the schema.
    pub fn set_field(&self, name: &str, value: f64) -> Result<(), Error> {
        let cell = self.position(name)?;
        self.segment.store(cell, value);
        Ok(())
    }

    /// Assigns every field from `value`.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaMismatch`] unless the schemas are equal.
    pub fn set(&self, value: &Struct) -> Result<(), Error> {
        if value.schema() != &self.schema {
            return Err(Error::SchemaMismatch {
                expected: self.schema.clone(),
                actual: value.schema().clone(),
            });
        }
        for (cell, v) in value.values().iter().enumerate() {
            self.segment.store(cell, *v);
        }
        Ok(())
    }

    /// Assigns only the fields named by `value`'s schema.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`] when `value` carries an unknown field.
    pub fn merge(&self, value: &Struct) -> Result<(), Error> {
        for (name, v) in value.schema().names().iter().zip(value.values().iter()) {
            self.set_field(name, *v)?;
        }
        Ok(())
    }

    /// Copies the current cells into a process-local record.
    #[must_use]
    pub fn snapshot(&self) -> Struct {
        let values: Vec<f64> = (0..self.schema.len())
            .map(|cell| self.segment.load(cell))
            .collect();
        Struct::with_values(self.schema.clone(), &values)
            .unwrap_or_else(|_| Struct::new(self.schema.clone()))
    }

    /// The sole field's value, for single-field schemas.
    ///
    /// # Errors
    ///
    /// [`Error::NotScalar`] when the schema has more than one field.
    pub fn item(&self) -> Result<f64, Error> {
        self.snapshot().item()
    }

    pub(crate) fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn position(&self, name: &str) -> Result<usize, Error> {
        self.schema.position(name).ok_or_else(|| Error::UnknownField {
            field: name.to_owned(),
            schema: self.schema.clone(),
        })
    }
}

/// A streaming ring whose rows live in a shared segment.
///
/// The head index lives in a one-field metadata record in its own segment,
/// so readers in other contexts can follow the window without coordination.
#[derive(Clone)]
pub struct SharedStreamingArray {
    schema: FieldSchema,
    buf_size: usize,
    segment: Arc<Segment>,
    metadata: SharedStruct,
}

impl SharedStreamingArray {
    /// Allocates an empty shared ring with logical capacity `buf_size`.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroCapacity`] when `buf_size` is zero.
    pub fn new(
        manager: &SegmentManager,
        schema: FieldSchema,
        buf_size: usize,
    ) -> Result<Self, Error> {
        if buf_size == 0 {
            return Err(Error::ZeroCapacity);
        }
        let size = 2 * buf_size;
        let segment = manager.create(size * schema.len());
        let metadata = SharedStruct::new(manager, FieldSchema::new([HEAD_INDEX_FIELD]));
        metadata.set_field(HEAD_INDEX_FIELD, (size - 1) as f64)?;
        Ok(Self {
            schema,
            buf_size,
            segment,
            metadata,
        })
    }

    /// Opens a view over an existing shared ring.
    ///
    /// # Errors
    ///
    /// [`Error::DescriptorMismatch`] for a record descriptor, or the segment
    /// resolution errors of [`SharedStruct::open`].
    pub fn open(manager: &SegmentManager, descriptor: &PayloadDescriptor) -> Result<Self, Error> {
        let PayloadDescriptor::Stream {
            schema,
            buf_size,
            segment,
            metadata,
        } = descriptor
        else {
            return Err(Error::DescriptorMismatch {
                detail: "expected a ring descriptor, got an unbuffered record".to_owned(),
            });
        };
        if *buf_size == 0 {
            return Err(Error::ZeroCapacity);
        }
        let segment = manager.open(segment)?;
        check_segment_len(&segment, 2 * buf_size * schema.len())?;
        let metadata = SharedStruct::open(manager, metadata)?;
        Ok(Self {
            schema: schema.clone(),
            buf_size: *buf_size,
            segment,
            metadata,
        })
    }

    /// The serializable identity of this ring.
    #[must_use]
    pub fn descriptor(&self) -> PayloadDescriptor {
        PayloadDescriptor::Stream {
            schema: self.schema.clone(),
            buf_size: self.buf_size,
            segment: self.segment.name().to_owned(),
            metadata: Box::new(self.metadata.descriptor()),
        }
    }

    /// The record schema.
    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Logical capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf_size
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        ring_len(self)
    }

    /// Whether no record has been consumed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a record and advances the head.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaMismatch`] when the record's schema differs.
    pub fn consume(&self, record: &Struct) -> Result<(), Error> {
        ring_consume(self, record)
    }

    /// Reads the record `index` steps behind the head (0 = most recent).
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfBounds`] beyond the logical window.
    pub fn get(&self, index: usize) -> Result<Struct, Error> {
        ring_get(self, index)
    }
}

impl RingStorage for SharedStreamingArray {
    fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn head(&self) -> usize {
        self.metadata.segment().load(0) as usize
    }

    fn set_head(&self, head: usize) {
        self.metadata.segment().store(0, head as f64);
    }

    fn read(&self, cell: usize) -> f64 {
        self.segment.load(cell)
    }

    fn write(&self, cell: usize, value: f64) {
        self.segment.store(cell, value);
    }
}

/// A shared payload of either flavor, as carried by a link.
#[derive(Clone)]
pub enum SharedPayload {
    /// Unbuffered: only the most recent record.
    Struct(SharedStruct),
    /// Buffered: a ring of recent records.
    Stream(SharedStreamingArray),
}

impl SharedPayload {
    /// Allocates an unbuffered payload.
    #[must_use]
    pub fn new_struct(manager: &SegmentManager, schema: FieldSchema) -> Self {
        SharedPayload::Struct(SharedStruct::new(manager, schema))
    }

    /// Allocates a buffered payload of capacity `buf_size`.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroCapacity`] when `buf_size` is zero.
    pub fn new_stream(
        manager: &SegmentManager,
        schema: FieldSchema,
        buf_size: usize,
    ) -> Result<Self, Error> {
        Ok(SharedPayload::Stream(SharedStreamingArray::new(
            manager, schema, buf_size,
        )?))
    }

    /// Opens a view matching the descriptor's flavor.
    ///
    /// # Errors
    ///
    /// The resolution errors of the matching `open`.
    pub fn open(manager: &SegmentManager, descriptor: &PayloadDescriptor) -> Result<Self, Error> {
        match descriptor {
            PayloadDescriptor::Struct { .. } => {
                Ok(SharedPayload::Struct(SharedStruct::open(manager, descriptor)?))
            }
            PayloadDescriptor::Stream { .. } => Ok(SharedPayload::Stream(
                SharedStreamingArray::open(manager, descriptor)?,
            )),
        }
    }

    /// The serializable identity of the payload.
    #[must_use]
    pub fn descriptor(&self) -> PayloadDescriptor {
        match self {
            SharedPayload::Struct(s) => s.descriptor(),
            SharedPayload::Stream(s) => s.descriptor(),
        }
    }

    /// The payload's record schema.
    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        match self {
            SharedPayload::Struct(s) => s.schema(),
            SharedPayload::Stream(s) => s.schema(),
        }
    }

    /// Snapshot of the most recent record: the record itself when
    /// unbuffered, index 0 of the ring when buffered.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfBounds`] when a buffered payload is still empty.
    pub fn snapshot_head(&self) -> Result<Struct, Error> {
        match self {
            SharedPayload::Struct(s) => Ok(s.snapshot()),
            SharedPayload::Stream(s) => s.get(0),
        }
    }
}

fn check_segment_len(segment: &Segment, expected: usize) -> Result<(), Error> {
    if segment.len() != expected {
        return Err(Error::SegmentSizeMismatch {
            name: segment.name().to_owned(),
            expected,
            actual: segment.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_struct_views_see_writes() {
        let manager = SegmentManager::new();
        let schema = FieldSchema::new(["a", "b"]);
        let writer = SharedStruct::new(&manager, schema.clone());
        let reader = SharedStruct::open(&manager, &writer.descriptor()).expect("open");

        writer
            .set(&Struct::with_values(schema, &[1.0, 2.0]).expect("values"))
            .expect("set");
        assert_eq!(reader.get("a").expect("field"), 1.0);
        assert_eq!(reader.snapshot().values(), &[1.0, 2.0]);
    }

    #[test]
    fn shared_struct_merge_touches_named_fields_only() {
        let manager = SegmentManager::new();
        let shared = SharedStruct::from_struct(
            &manager,
            &Struct::with_values(FieldSchema::new(["a", "b"]), &[1.0, 2.0]).expect("values"),
        );
        shared
            .merge(&Struct::with_values(FieldSchema::new(["b"]), &[9.0]).expect("values"))
            .expect("merge");
        assert_eq!(shared.snapshot().values(), &[1.0, 9.0]);
    }

    #[test]
    fn shared_ring_round_trips_through_descriptor() {
        let manager = SegmentManager::new();
        let ring = SharedStreamingArray::new(&manager, FieldSchema::scalar(), 3).expect("ring");
        let descriptor = ring.descriptor();
        let json = serde_json::to_string(&descriptor).expect("serialize");
        let parsed: PayloadDescriptor = serde_json::from_str(&json).expect("deserialize");
        let view = SharedStreamingArray::open(&manager, &parsed).expect("open");

        for v in 0..5 {
            ring.consume(&Struct::scalar(f64::from(v))).expect("consume");
        }
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(0).expect("head").item().expect("scalar"), 4.0);
        assert_eq!(view.get(2).expect("tail").item().expect("scalar"), 2.0);
    }

    #[test]
    fn descriptor_flavor_is_enforced() {
        let manager = SegmentManager::new();
        let record = SharedStruct::new(&manager, FieldSchema::scalar());
        assert!(matches!(
            SharedStreamingArray::open(&manager, &record.descriptor()),
            Err(Error::DescriptorMismatch { .. })
        ));
    }

    #[test]
    fn payload_snapshot_head_reads_most_recent() {
        let manager = SegmentManager::new();
        let payload =
            SharedPayload::new_stream(&manager, FieldSchema::scalar(), 2).expect("payload");
        assert!(matches!(
            payload.snapshot_head(),
            Err(Error::IndexOutOfBounds { .. })
        ));
        if let SharedPayload::Stream(ring) = &payload {
            ring.consume(&Struct::scalar(8.0)).expect("consume");
        }
        assert_eq!(payload.snapshot_head().expect("head").item().expect("scalar"), 8.0);
    }

    #[test]
    fn stream_descriptor_lists_both_segments() {
        let manager = SegmentManager::new();
        let ring = SharedStreamingArray::new(&manager, FieldSchema::scalar(), 2).expect("ring");
        assert_eq!(ring.descriptor().segment_names().len(), 2);
    }
}
