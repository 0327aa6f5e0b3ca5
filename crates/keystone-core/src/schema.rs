//! # Schema Collaborator
//!
//! Read-only description of resource types: attribute names and
//! relationship declarations (cardinality, related type, inverse).
//!
//! The graph and the normalizer only ever *read* a schema through the
//! `SchemaSource` trait. `Schema` is the bundled implementation; it
//! deserializes from TOML or JSON:
//!
//! ```toml
//! [types.post]
//! attributes = ["title", "body"]
//!
//! [types.post.relationships.author]
//! kind = "one"
//! type = "user"
//! inverse = "posts"
//! ```

use crate::{Cardinality, KeystoneError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SCHEMASOURCE TRAIT
// =============================================================================

/// Lookup interface for resource definitions.
///
/// Implementations must be immutable for the lifetime of a store.
pub trait SchemaSource: Send + Sync {
    /// Definition of a resource type, if declared.
    fn resource(&self, resource_type: &str) -> Option<&ResourceSchema>;

    /// Definition of one relationship field.
    fn relationship(&self, resource_type: &str, field: &str) -> Option<&RelationshipSchema> {
        self.resource(resource_type)?.relationships.get(field)
    }

    /// Check whether a type is declared.
    fn has_type(&self, resource_type: &str) -> bool {
        self.resource(resource_type).is_some()
    }
}

// =============================================================================
// SCHEMA TYPES
// =============================================================================

/// One relationship declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSchema {
    /// `one` or `many`.
    pub kind: Cardinality,
    /// Type of the related resources.
    #[serde(rename = "type")]
    pub related_type: String,
    /// Reciprocal field on the related type. `None` means unidirectional.
    #[serde(default)]
    pub inverse: Option<String>,
}

impl RelationshipSchema {
    /// A to-one relationship without inverse.
    #[must_use]
    pub fn one(related_type: impl Into<String>) -> Self {
        Self {
            kind: Cardinality::One,
            related_type: related_type.into(),
            inverse: None,
        }
    }

    /// A to-many relationship without inverse.
    #[must_use]
    pub fn many(related_type: impl Into<String>) -> Self {
        Self {
            kind: Cardinality::Many,
            related_type: related_type.into(),
            inverse: None,
        }
    }

    /// Set the inverse field.
    #[must_use]
    pub fn inverse(mut self, field: impl Into<String>) -> Self {
        self.inverse = Some(field.into());
        self
    }
}

/// Definition of one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Declared attribute names.
    #[serde(default)]
    pub attributes: BTreeSet<String>,
    /// Relationship declarations keyed by field name.
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipSchema>,
}

impl ResourceSchema {
    /// Create an empty resource definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.insert(name.into());
        self
    }

    /// Declare a relationship.
    #[must_use]
    pub fn relationship(mut self, field: impl Into<String>, def: RelationshipSchema) -> Self {
        self.relationships.insert(field.into(), def);
        self
    }
}

/// A complete schema: resource type name -> definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub types: BTreeMap<String, ResourceSchema>,
}

impl Schema {
    /// Create an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource type definition.
    #[must_use]
    pub fn resource(mut self, name: impl Into<String>, def: ResourceSchema) -> Self {
        self.types.insert(name.into(), def);
        self
    }

    /// Check that every declaration is internally consistent.
    ///
    /// - Every related type is declared
    /// - Every inverse field exists on the related type
    /// - Inverse pairs point at each other and at each other's types
    pub fn validate(&self) -> Result<(), KeystoneError> {
        for (type_name, def) in &self.types {
            for (field, rel) in &def.relationships {
                let Some(related) = self.types.get(&rel.related_type) else {
                    return Err(KeystoneError::SchemaViolation(format!(
                        "{}.{} relates to undeclared type '{}'",
                        type_name, field, rel.related_type
                    )));
                };
                let Some(inverse) = &rel.inverse else {
                    continue;
                };
                let Some(inv) = related.relationships.get(inverse) else {
                    return Err(KeystoneError::SchemaViolation(format!(
                        "{}.{} declares inverse {}.{} which does not exist",
                        type_name, field, rel.related_type, inverse
                    )));
                };
                if inv.related_type != *type_name || inv.inverse.as_deref() != Some(field) {
                    return Err(KeystoneError::SchemaViolation(format!(
                        "{}.{} and {}.{} are not declared as inverses of each other",
                        type_name, field, rel.related_type, inverse
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of declared types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if no types are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl SchemaSource for Schema {
    fn resource(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.types.get(resource_type)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn blog() -> Schema {
        Schema::new()
            .resource(
                "post",
                ResourceSchema::new()
                    .attribute("title")
                    .relationship("author", RelationshipSchema::one("user").inverse("posts")),
            )
            .resource(
                "user",
                ResourceSchema::new()
                    .attribute("name")
                    .relationship("posts", RelationshipSchema::many("post").inverse("author")),
            )
    }

    #[test]
    fn valid_schema_passes() {
        assert!(blog().validate().is_ok());
    }

    #[test]
    fn missing_inverse_field_is_violation() {
        let schema = Schema::new()
            .resource(
                "post",
                ResourceSchema::new()
                    .relationship("author", RelationshipSchema::one("user").inverse("posts")),
            )
            .resource("user", ResourceSchema::new());
        assert!(matches!(
            schema.validate(),
            Err(KeystoneError::SchemaViolation(_))
        ));
    }

    #[test]
    fn one_sided_inverse_is_violation() {
        let schema = Schema::new()
            .resource(
                "post",
                ResourceSchema::new()
                    .relationship("author", RelationshipSchema::one("user").inverse("posts")),
            )
            .resource(
                "user",
                ResourceSchema::new().relationship("posts", RelationshipSchema::many("post")),
            );
        assert!(matches!(
            schema.validate(),
            Err(KeystoneError::SchemaViolation(_))
        ));
    }

    #[test]
    fn undeclared_related_type_is_violation() {
        let schema = Schema::new().resource(
            "post",
            ResourceSchema::new().relationship("tags", RelationshipSchema::many("tag")),
        );
        assert!(schema.validate().is_err());
    }

    #[test]
    fn lookup_through_trait() {
        let schema = blog();
        let source: &dyn SchemaSource = &schema;
        assert!(source.has_type("post"));
        assert!(!source.has_type("comment"));
        let rel = source.relationship("user", "posts").expect("relationship");
        assert_eq!(rel.kind, Cardinality::Many);
        assert_eq!(rel.inverse.as_deref(), Some("author"));
    }

    #[test]
    fn deserializes_from_toml() {
        let text = r#"
            [types.person]
            attributes = ["name"]

            [types.person.relationships.friends]
            kind = "many"
            type = "person"
            inverse = "friends"

            [types.person.relationships.mentor]
            kind = "one"
            type = "person"
        "#;
        let schema: Schema = toml::from_str(text).expect("parse");
        assert!(schema.validate().is_ok());
        let mentor = schema.relationship("person", "mentor").expect("mentor");
        assert_eq!(mentor.kind, Cardinality::One);
        assert!(mentor.inverse.is_none());
    }
}
