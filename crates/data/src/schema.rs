// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Field schemas for structured records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Ordered, named `f64` fields of a record.
///
/// Schemas are cheap to clone and compare by field list. Field order is
/// significant: it is the layout order in segments and the order of
/// [`crate::Struct::values`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct FieldSchema {
    fields: Arc<[String]>,
}

impl FieldSchema {
    /// Builds a schema from field names, in order.
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The conventional single-field schema (`f0`) used by scalar emitters.
    #[must_use]
    pub fn scalar() -> Self {
        Self::new(["f0"])
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names, in layout order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.fields
    }

    /// Position of `name` in the layout, if present.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

impl From<Vec<String>> for FieldSchema {
    fn from(fields: Vec<String>) -> Self {
        Self::new(fields)
    }
}

impl From<FieldSchema> for Vec<String> {
    fn from(schema: FieldSchema) -> Self {
        schema.fields.to_vec()
    }
}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.fields.iter()).finish()
    }
}

impl fmt::Display for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fields.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_follows_declaration_order() {
        let schema = FieldSchema::new(["x", "y", "z"]);
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.position("y"), Some(1));
        assert_eq!(schema.position("w"), None);
    }

    #[test]
    fn equality_is_by_field_list() {
        assert_eq!(FieldSchema::new(["f0"]), FieldSchema::scalar());
        assert_ne!(FieldSchema::new(["f0", "f1"]), FieldSchema::scalar());
        assert_ne!(FieldSchema::new(["a", "b"]), FieldSchema::new(["b", "a"]));
    }

    #[test]
    fn serde_round_trip() {
        let schema = FieldSchema::new(["x", "y"]);
        let json = serde_json::to_string(&schema).expect("serialize");
        assert_eq!(json, r#"["x","y"]"#);
        let back: FieldSchema = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, schema);
    }
}
