// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Process-local structured records.

use crate::error::Error;
use crate::schema::FieldSchema;
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// A length-1 structured record: one `f64` per schema field.
///
/// Fresh records are NaN-filled, so an unset field is observably "no data"
/// rather than a misleading zero.
#[derive(Clone, PartialEq)]
pub struct Struct {
    schema: FieldSchema,
    values: Vec<f64>,
}

impl Struct {
    /// Creates a NaN-filled record over `schema`.
    #[must_use]
    pub fn new(schema: FieldSchema) -> Self {
        let values = vec![f64::NAN; schema.len()];
        Self { schema, values }
    }

    /// Creates a record over `schema` with the given field values.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaMismatch`] when the value count differs from the field
    /// count.
    pub fn with_values(schema: FieldSchema, values: &[f64]) -> Result<Self, Error> {
        if values.len() != schema.len() {
            return Err(Error::SchemaMismatch {
                expected: schema.clone(),
                actual: FieldSchema::new(values.iter().enumerate().map(|(i, _)| format!("f{i}"))),
            });
        }
        Ok(Self {
            schema,
            values: values.to_vec(),
        })
    }

    /// Convenience constructor for the single-field `f0` record.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            schema: FieldSchema::scalar(),
            values: vec![value],
        }
    }

    /// The record's schema.
    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Field values in schema order.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Reads a field by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`] when `name` is not in the schema.
    pub fn get(&self, name: &str) -> Result<f64, Error> {
        let idx = self.position(name)?;
        Ok(self.values[idx])
    }

    /// Writes a field by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`] when `name` is not in the schema.
    pub fn set_field(&mut self, name: &str, value: f64) -> Result<(), Error> {
        let idx = self.position(name)?;
        self.values[idx] = value;
        Ok(())
    }

    /// Assigns every field from `other`.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaMismatch`] unless the schemas are equal.
    pub fn set(&mut self, other: &Struct) -> Result<(), Error> {
        if other.schema != self.schema {
            return Err(Error::SchemaMismatch {
                expected: self.schema.clone(),
                actual: other.schema.clone(),
            });
        }
        self.values.copy_from_slice(&other.values);
        Ok(())
    }

    /// Assigns only the fields named by `other`'s schema.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`] when `other` carries a field this record does
    /// not have.
    pub fn merge(&mut self, other: &Struct) -> Result<(), Error> {
        for (name, value) in other.schema.names().iter().zip(other.values.iter()) {
            self.set_field(name, *value)?;
        }
        Ok(())
    }

    /// The sole field's value, for single-field schemas.
    ///
    /// # Errors
    ///
    /// [`Error::NotScalar`] when the schema has more or fewer than one field.
    pub fn item(&self) -> Result<f64, Error> {
        if self.schema.len() == 1 {
            Ok(self.values[0])
        } else {
            Err(Error::NotScalar {
                schema: self.schema.clone(),
            })
        }
    }

    /// Stable content hash over the field bytes and the schema descriptor.
    ///
    /// Two records with equal values but different schemas hash differently.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for value in &self.values {
            hasher.update(&value.to_le_bytes());
        }
        for name in self.schema.names() {
            hasher.update(name.as_bytes());
        }
        hasher.digest()
    }

    fn position(&self, name: &str) -> Result<usize, Error> {
        self.schema.position(name).ok_or_else(|| Error::UnknownField {
            field: name.to_owned(),
            schema: self.schema.clone(),
        })
    }
}

impl fmt::Debug for Struct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.schema.names().iter().zip(self.values.iter()) {
            let _ = map.key(name).value(value);
        }
        map.finish()
    }
}
