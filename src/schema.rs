//! Field name resolution for source record types.
//!
//! A [`Schema`] is an explicit, immutable mapping from a record's logical
//! field names to the names its documents are stored under. Types opt in by
//! implementing [`Entity`].

use crate::error::{Error, Result};

/// Resolves a logical field name to its stored (wire) name.
pub trait FieldResolver {
    fn resolve(&self, field: &str) -> Result<&str>;
}

/// A record type that can be the source of an aggregation.
///
/// ```
/// use oxidb_pipeline::{Entity, Schema};
///
/// struct User;
///
/// impl Entity for User {
///     fn schema() -> Schema {
///         Schema::new("User", "users")
///             .field("name", "n")
///             .field("age", "age")
///     }
/// }
/// ```
pub trait Entity {
    fn schema() -> Schema;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    entity: String,
    collection: String,
    fields: Vec<(String, String)>,
}

impl Schema {
    pub fn new(entity: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            collection: collection.into(),
            fields: Vec::new(),
        }
    }

    /// Register `logical` as stored under `stored`. Registering the same
    /// logical name twice replaces the earlier mapping.
    pub fn field(mut self, logical: impl Into<String>, stored: impl Into<String>) -> Self {
        let logical = logical.into();
        let stored = stored.into();
        match self.fields.iter_mut().find(|(name, _)| *name == logical) {
            Some(entry) => entry.1 = stored,
            None => self.fields.push((logical, stored)),
        }
        self
    }

    /// Register fields whose stored name equals the logical name.
    pub fn fields<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, |schema, name| {
            let name = name.into();
            schema.field(name.clone(), name)
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FieldResolver for Schema {
    fn resolve(&self, field: &str) -> Result<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, stored)| stored.as_str())
            .ok_or_else(|| Error::UnknownField {
                entity: self.entity.clone(),
                field: field.to_string(),
            })
    }
}
