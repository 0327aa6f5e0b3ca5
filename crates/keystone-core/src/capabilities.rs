//! # Capability Traits
//!
//! Narrow traits the store accepts instead of concrete payload types.
//!
//! - `Identifiable`: anything that names a resource by `(type, id, lid)`
//! - `Normalizable`: anything that can be read as a `ResourceDocument`

use crate::normalize::{ResourceDocument, ResourceObject, ResourceRef};
use crate::{KeyInfo, KeystoneError};
use serde::Deserialize;

/// Something that names one resource.
pub trait Identifiable {
    fn resource_type(&self) -> &str;

    fn id(&self) -> Option<&str>;

    fn lid(&self) -> Option<&str>;
}

impl Identifiable for ResourceRef {
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

impl Identifiable for ResourceObject {
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

impl Identifiable for KeyInfo {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn lid(&self) -> Option<&str> {
        Some(&self.lid)
    }
}

/// A payload the store can normalize.
pub trait Normalizable {
    /// Read the payload as a document.
    fn to_document(&self) -> Result<ResourceDocument, KeystoneError>;
}

impl Normalizable for ResourceDocument {
    fn to_document(&self) -> Result<ResourceDocument, KeystoneError> {
        Ok(self.clone())
    }
}

impl Normalizable for serde_json::Value {
    fn to_document(&self) -> Result<ResourceDocument, KeystoneError> {
        ResourceDocument::deserialize(self)
            .map_err(|e| KeystoneError::Normalization(e.to_string()))
    }
}

impl Normalizable for str {
    fn to_document(&self) -> Result<ResourceDocument, KeystoneError> {
        serde_json::from_str(self).map_err(|e| KeystoneError::Normalization(e.to_string()))
    }
}
