// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Streaming ring of structured records.
//!
//! The ring keeps the `buf_size` most recent records. Physically it is
//! `2 * buf_size` rows written at a descending head index; when the head
//! underflows, the live half is copied to the other half and the head is
//! reset to `buf_size - 1`, so a consume is O(1) amortized and the logical
//! window is always contiguous in memory.
//!
//! Index 0 is the most recent record. Indices grow towards older records.
//! The same ring logic drives both the process-local [`StreamingArray`] and
//! the segment-backed [`crate::SharedStreamingArray`].

use crate::error::Error;
use crate::record::Struct;
use crate::schema::FieldSchema;
use std::cell::Cell;

/// Cell-level storage driven by the shared ring logic.
///
/// `head` is a row index into `2 * buf_size` rows; `read`/`write` address
/// flat cells (`row * n_fields + field`).
pub(crate) trait RingStorage {
    fn schema(&self) -> &FieldSchema;
    fn buf_size(&self) -> usize;
    fn head(&self) -> usize;
    fn set_head(&self, head: usize);
    fn read(&self, cell: usize) -> f64;
    fn write(&self, cell: usize, value: f64);
}

/// Logical length: `min(#consumes, buf_size)`.
pub(crate) fn ring_len(storage: &impl RingStorage) -> usize {
    let size = 2 * storage.buf_size();
    (size - storage.head() - 1).min(storage.buf_size())
}

/// Appends `record` at the head, reshuffling on underflow.
pub(crate) fn ring_consume(storage: &impl RingStorage, record: &Struct) -> Result<(), Error> {
    if record.schema() != storage.schema() {
        return Err(Error::SchemaMismatch {
            expected: storage.schema().clone(),
            actual: record.schema().clone(),
        });
    }
    let n_fields = storage.schema().len();
    let buf_size = storage.buf_size();
    let head = storage.head();
    let head = if head == 0 {
        // Underflow: copy the live lower half up, clear the lower half.
        for cell in 0..buf_size * n_fields {
            storage.write(buf_size * n_fields + cell, storage.read(cell));
        }
        for cell in 0..buf_size * n_fields {
            storage.write(cell, f64::NAN);
        }
        buf_size - 1
    } else {
        head - 1
    };
    for (field, value) in record.values().iter().enumerate() {
        storage.write(head * n_fields + field, *value);
    }
    storage.set_head(head);
    Ok(())
}

/// Reads the record `index` steps behind the head (0 = most recent).
pub(crate) fn ring_get(storage: &impl RingStorage, index: usize) -> Result<Struct, Error> {
    let len = ring_len(storage);
    if index >= len {
        return Err(Error::IndexOutOfBounds { index, len });
    }
    let n_fields = storage.schema().len();
    let row = storage.head() + index;
    let values: Vec<f64> = (0..n_fields)
        .map(|field| storage.read(row * n_fields + field))
        .collect();
    Struct::with_values(storage.schema().clone(), &values)
}

/// Process-local streaming ring.
///
/// Same surface as [`crate::SharedStreamingArray`]; interior mutability keeps
/// the two interchangeable behind a shared reference.
pub struct StreamingArray {
    schema: FieldSchema,
    buf_size: usize,
    head: Cell<usize>,
    cells: Vec<Cell<f64>>,
}

impl StreamingArray {
    /// Creates an empty ring with logical capacity `buf_size`.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroCapacity`] when `buf_size` is zero.
    pub fn new(schema: FieldSchema, buf_size: usize) -> Result<Self, Error> {
        if buf_size == 0 {
            return Err(Error::ZeroCapacity);
        }
        let size = 2 * buf_size;
        Ok(Self {
            head: Cell::new(size - 1),
            cells: (0..size * schema.len()).map(|_| Cell::new(f64::NAN)).collect(),
            schema,
            buf_size,
        })
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

impl RingStorage for StreamingArray {
    fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn head(&self) -> usize {
        self.head.get()
    }

    fn set_head(&self, head: usize) {
        self.head.set(head);
    }

    fn read(&self, cell: usize) -> f64 {
        self.cells[cell].get()
    }

    fn write(&self, cell: usize, value: f64) {
        self.cells[cell].set(value);
    }
}
