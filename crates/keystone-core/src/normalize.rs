//! # Normalization
//!
//! Inbound payload model and the validation pass that turns a payload into a
//! `NormalizationPlan`.
//!
//! Payload shape:
//!
//! ```json
//! {
//!   "data": { "type": "post", "id": "1",
//!             "attributes": { "title": "Hi" },
//!             "relationships": { "author": { "data": { "type": "user", "id": "9" } } } },
//!   "included": [ { "type": "user", "id": "9", "attributes": { "name": "Ann" } } ]
//! }
//! ```
//!
//! Planning is pure: it reads the schema and never touches a store. A plan
//! that was produced successfully only contains references the schema
//! accepts, so the store can apply it inside one transaction.

use crate::capabilities::Identifiable;
use crate::graph::EdgeLinks;
use crate::primitives::{MAX_ID_LENGTH, MAX_PAYLOAD_RESOURCES, MAX_TYPE_LENGTH};
use crate::schema::SchemaSource;
use crate::{Attributes, Cardinality, KeystoneError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// PAYLOAD TYPES
// =============================================================================

/// Reference to a resource: `{ type, id }` or `{ type, lid }`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceRef {
    /// Reference by server id.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
        }
    }
}

/// Linkage of a relationship: a single reference or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    Many(Vec<ResourceRef>),
    One(ResourceRef),
}

/// One relationship entry of a resource object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipObject {
    /// `None`: no `data` member. `Some(None)`: explicit `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<RelationshipData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<EdgeLinks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// A resource object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipObject>,
}

/// Primary data: one resource or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(Box<ResourceObject>),
}

/// A link value: either a bare URL or `{ "href": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Link {
    Url(String),
    Object { href: String },
}

impl Link {
    /// The target URL.
    #[must_use]
    pub fn href(&self) -> &str {
        match self {
            Self::Url(url) | Self::Object { href: url } => url,
        }
    }
}

/// Top-level document links, including pagination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLinks {
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<Link>,
}

/// A complete inbound document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    /// `None`: no `data` member (meta-only document). `Some(None)`: `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<PrimaryData>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<DocumentLinks>,
}

/// Distinguish an explicit `null` from a missing member.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

// =============================================================================
// PLAN
// =============================================================================

/// Validated identity of a resource inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlannedIdentity {
    pub resource_type: String,
    pub id: Option<String>,
    pub lid: Option<String>,
}

impl Identifiable for PlannedIdentity {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn lid(&self) -> Option<&str> {
        self.lid.as_deref()
    }
}

/// A relationship write inside a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRelationship {
    pub field: String,
    /// `None` when the payload carried links/meta but no linkage.
    pub members: Option<Vec<PlannedIdentity>>,
    pub links: Option<EdgeLinks>,
}

/// A resource write inside a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedResource {
    pub identity: PlannedIdentity,
    pub attributes: Attributes,
    pub relationships: Vec<PlannedRelationship>,
}

/// Shape of the primary data.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedPrimary {
    /// No `data` member.
    Absent,
    /// `"data": null`.
    Null,
    /// A single resource (index into `resources`).
    One(usize),
    /// A list of resources (indices into `resources`).
    Many(Vec<usize>),
}

/// Validated, schema-checked writes for one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationPlan {
    pub primary: PlannedPrimary,
    /// Primary resources first, then included ones, in payload order.
    pub resources: Vec<PlannedResource>,
    pub meta: Option<serde_json::Value>,
    pub links: Option<DocumentLinks>,
}

impl NormalizationPlan {
    /// Validate a document against a schema.
    ///
    /// - Malformed identities and unknown types -> `Normalization`
    /// - Linkage that contradicts a declared cardinality -> `SchemaViolation`
    /// - Undeclared attributes and relationships are dropped with a warning
    pub fn build(
        document: &ResourceDocument,
        schema: &dyn SchemaSource,
    ) -> Result<Self, KeystoneError> {
        let primary_objects: Vec<&ResourceObject> = match &document.data {
            None | Some(None) => Vec::new(),
            Some(Some(PrimaryData::One(object))) => vec![object.as_ref()],
            Some(Some(PrimaryData::Many(objects))) => objects.iter().collect(),
        };

        let total = primary_objects.len().saturating_add(document.included.len());
        if total > MAX_PAYLOAD_RESOURCES {
            return Err(KeystoneError::Normalization(format!(
                "payload holds {} resources (limit {})",
                total, MAX_PAYLOAD_RESOURCES
            )));
        }

        let mut resources = Vec::with_capacity(total);
        for object in primary_objects.iter().copied().chain(&document.included) {
            resources.push(plan_resource(object, schema)?);
        }

        let primary = match &document.data {
            None => PlannedPrimary::Absent,
            Some(None) => PlannedPrimary::Null,
            Some(Some(PrimaryData::One(_))) => PlannedPrimary::One(0),
            Some(Some(PrimaryData::Many(objects))) => {
                PlannedPrimary::Many((0..objects.len()).collect())
            }
        };

        Ok(Self {
            primary,
            resources,
            meta: document.meta.clone(),
            links: document.links.clone(),
        })
    }

    /// Number of resource writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check if the plan writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

fn plan_identity(
    item: &impl Identifiable,
    schema: &dyn SchemaSource,
) -> Result<PlannedIdentity, KeystoneError> {
    let resource_type = item.resource_type();
    if resource_type.is_empty() || resource_type.len() > MAX_TYPE_LENGTH {
        return Err(KeystoneError::Normalization(
            "resource type is empty or too long".to_string(),
        ));
    }
    if !schema.has_type(resource_type) {
        return Err(KeystoneError::Normalization(format!(
            "unknown resource type '{}'",
            resource_type
        )));
    }
    for value in [item.id(), item.lid()].into_iter().flatten() {
        if value.is_empty() || value.len() > MAX_ID_LENGTH {
            return Err(KeystoneError::Normalization(format!(
                "{} identifier is empty or too long",
                resource_type
            )));
        }
    }
    if item.id().is_none() && item.lid().is_none() {
        return Err(KeystoneError::Normalization(format!(
            "{} resource has neither id nor lid",
            resource_type
        )));
    }
    Ok(PlannedIdentity {
        resource_type: resource_type.to_string(),
        id: item.id().map(str::to_string),
        lid: item.lid().map(str::to_string),
    })
}

fn plan_resource(
    object: &ResourceObject,
    schema: &dyn SchemaSource,
) -> Result<PlannedResource, KeystoneError> {
    let identity = plan_identity(object, schema)?;
    let definition = schema
        .resource(&identity.resource_type)
        .ok_or_else(|| KeystoneError::UnknownType(identity.resource_type.clone()))?;

    let mut attributes = Attributes::new();
    for (name, value) in &object.attributes {
        if definition.attributes.contains(name) {
            attributes.insert(name.clone(), value.clone());
        } else {
            tracing::warn!(
                resource_type = %identity.resource_type,
                attribute = %name,
                "Dropping undeclared attribute"
            );
        }
    }

    let mut relationships = Vec::with_capacity(object.relationships.len());
    for (field, rel) in &object.relationships {
        let Some(decl) = definition.relationships.get(field) else {
            tracing::warn!(
                resource_type = %identity.resource_type,
                relationship = %field,
                "Dropping undeclared relationship"
            );
            continue;
        };

        let members = match &rel.data {
            None => None,
            Some(None) => Some(Vec::new()),
            Some(Some(RelationshipData::One(reference))) => {
                if decl.kind == Cardinality::Many {
                    return Err(KeystoneError::SchemaViolation(format!(
                        "{}.{} is to-many but the payload sent a single reference",
                        identity.resource_type, field
                    )));
                }
                Some(vec![plan_identity(reference, schema)?])
            }
            Some(Some(RelationshipData::Many(references))) => {
                if decl.kind == Cardinality::One {
                    return Err(KeystoneError::SchemaViolation(format!(
                        "{}.{} is to-one but the payload sent a list",
                        identity.resource_type, field
                    )));
                }
                references
                    .iter()
                    .map(|r| plan_identity(r, schema))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Some)?
            }
        };

        if let Some(members) = &members {
            if let Some(wrong) = members
                .iter()
                .find(|m| m.resource_type != decl.related_type)
            {
                return Err(KeystoneError::SchemaViolation(format!(
                    "{}.{} expects '{}' but the payload referenced '{}'",
                    identity.resource_type, field, decl.related_type, wrong.resource_type
                )));
            }
        }

        relationships.push(PlannedRelationship {
            field: field.clone(),
            members,
            links: rel.links.clone(),
        });
    }

    Ok(PlannedResource {
        identity,
        attributes,
        relationships,
    })
}

// =============================================================================
// TESTS
// =============================================================================
