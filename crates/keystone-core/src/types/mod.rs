//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the Keystone model:
//! - Identity handles (`ResourceKey`, `KeyInfo`, `RequestId`)
//! - Record data (`Attributes`, `RecordState`)
//! - Relationship cardinality (`Cardinality`)
//! - Change notifications (`ChangeKind`, `Subject`)
//! - Error types (`KeystoneError`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers implement `Ord` so they can key `BTreeMap`/`BTreeSet`
//! and iterate in a stable order. Counters use saturating arithmetic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTITY HANDLES
// =============================================================================

/// Opaque handle for one logical resource inside a single `Store`.
///
/// Handles are arena indices issued by the `KeyRegistry`. Two handles compare
/// equal exactly when they denote the same identity, so holders never need a
/// back-reference into the registry to check identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey(pub u64);

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Descriptive data behind a `ResourceKey`.
///
/// `id` is `None` until the server assigns one. `lid` is always present and
/// never changes, even after a merge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: Option<String>,
    pub lid: String,
}

impl KeyInfo {
    /// Returns `true` if this key has no server id yet.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.resource_type, id),
            None => write!(f, "{}:{}", self.resource_type, self.lid),
        }
    }
}

/// Identifier of one request issued through the pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestId(pub u64);

impl RequestId {
    /// The id following this one (saturating).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

// =============================================================================
// RECORD DATA
// =============================================================================

/// Attribute values of a resource, keyed by field name.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Lifecycle state of a cached resource record.
///
/// ```text
/// empty ─► loading ─► loaded ◄─► stale ─► removed
///             │  ▲
///             ▼  │
///            error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Referenced but no data has arrived yet.
    Empty,
    /// A fetch for this record is in flight.
    Loading,
    /// Data is present and considered current.
    Loaded,
    /// Data is present but was invalidated.
    Stale,
    /// The last fetch failed.
    Error,
    /// Terminal: the record is being unloaded.
    Removed,
}

impl RecordState {
    /// Check whether a transition from `self` to `to` is legal.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use RecordState::{Empty, Error, Loaded, Loading, Removed, Stale};
        match (self, to) {
            (Removed, _) => false,
            (_, Removed) => true,
            (Empty | Error | Loaded | Stale, Loading) => true,
            (Empty | Loading | Loaded | Stale | Error, Loaded) => true,
            (Loading, Error) => true,
            (Loaded, Stale) => true,
            _ => false,
        }
    }

    /// Returns `true` if the record carries server data.
    #[must_use]
    pub fn has_data(self) -> bool {
        matches!(self, Self::Loaded | Self::Stale)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Stale => "stale",
            Self::Error => "error",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Cardinality of a relationship field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// At most one related resource.
    One,
    /// An ordered set of related resources.
    Many,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One => f.write_str("one"),
            Self::Many => f.write_str("many"),
        }
    }
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// What changed about a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Attributes,
    Relationships,
    State,
    Added,
    Removed,
}

/// The thing a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// A cached resource.
    Resource(ResourceKey),
    /// A cached request, addressed by its cache key digest.
    Request(String),
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Keystone model and pipeline.
///
/// - No silent failures
/// - Use `Result<T, KeystoneError>` for fallible operations
/// - `Clone` so one failure can be delivered to every coalesced waiter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeystoneError {
    /// A local resource was merged into a server id already owned by a
    /// different record with loaded data.
    #[error("Identity conflict: {resource_type}:{id} already belongs to another record")]
    IdentityConflict { resource_type: String, id: String },

    /// Relationship data contradicts the schema. Never retried.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Network or HTTP-level failure.
    #[error("Transport error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The payload could not be normalized.
    #[error("Normalization error: {0}")]
    Normalization(String),

    /// The request was cancelled before completion.
    #[error("Request cancelled")]
    Cancelled,

    /// The key is not known to this store.
    #[error("Key not found: {0}")]
    KeyNotFound(ResourceKey),

    /// The key still backs a live record.
    #[error("Key still in use: {0}")]
    KeyInUse(ResourceKey),

    /// The record has a request in flight.
    #[error("Record busy: {0} has a request in flight")]
    RecordBusy(ResourceKey),

    /// The record state machine rejected a transition.
    #[error("Invalid state transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: ResourceKey,
        from: RecordState,
        to: RecordState,
    },

    /// The resource type is not declared in the schema.
    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeystoneError {
    /// Whether a retry may succeed.
    ///
    /// Only transport failures without a status, timeouts, rate limits and
    /// server errors qualify.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status: None, .. } => true,
            Self::Transport {
                status: Some(code), ..
            } => *code == 408 || *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
