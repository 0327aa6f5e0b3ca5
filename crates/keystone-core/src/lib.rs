//! # keystone-core
//!
//! The normalized in-memory model for Keystone - THE MODEL.
//!
//! This crate keeps exactly one identity per logical remote resource, the
//! field-level record data received for it, and an inverse-consistent graph
//! of the relationships between resources.
//!
//! ## Components
//!
//! - `identity`: the `ResourceKey` registry
//! - `graph`: relationship edges (remote state + local overlay)
//! - `cache`: resource records and their lifecycle state machine
//! - `notify`: change notifications for the reactivity layer
//! - `normalize`: inbound payload model and validation
//! - `journal`: per-entry undo log backing store transactions
//! - `store`: the transactional facade that ties them together
//!
//! ## Architectural Constraints
//!
//! - Has NO async, NO network dependencies (pure Rust)
//! - Deterministic: `BTreeMap`/`BTreeSet` everywhere
//! - No globals: every `Store` owns its own registry
//! - Relationship schemas are read-only lookups through `SchemaSource`

// =============================================================================
// MODULES
// =============================================================================

pub mod cache;
pub mod capabilities;
pub mod graph;
pub mod identity;
pub mod journal;
pub mod normalize;
pub mod notify;
pub mod primitives;
pub mod schema;
pub mod store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Attributes, Cardinality, ChangeKind, KeyInfo, KeystoneError, RecordState, RequestId,
    ResourceKey, Subject,
};

// =============================================================================
// RE-EXPORTS: Model
// =============================================================================

pub use cache::{CachedRecord, ResourceCache, UpsertOutcome};
pub use capabilities::{Identifiable, Normalizable};
pub use graph::{Edge, EdgeLinks, GraphContext, RelationshipGraph};
pub use identity::{KeyRegistry, MergeOutcome};
pub use normalize::{
    DocumentLinks, Link, NormalizationPlan, PrimaryData, RelationshipData, RelationshipObject,
    ResourceDocument, ResourceObject, ResourceRef,
};
pub use notify::{Callback, Interest, NotificationManager, SubscriptionToken};
pub use schema::{RelationshipSchema, ResourceSchema, Schema, SchemaSource};
pub use store::{DocumentContent, PushOutcome, Store};
