//! # Resource Cache
//!
//! Normalized record storage keyed by `ResourceKey`.
//!
//! Records exist as soon as a resource is referenced, even before data has
//! arrived, so relationship edges always point at something. Updates merge
//! field by field; a partial payload never replaces a whole record.

use crate::journal::JournaledMap;
use crate::{Attributes, KeystoneError, RecordState, RequestId, ResourceKey};
use serde::Serialize;
use std::collections::BTreeSet;

/// A cached resource record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedRecord {
    attributes: Attributes,
    relationships: BTreeSet<String>,
    state: RecordState,
    last_request: Option<RequestId>,
    is_new: bool,
}

impl CachedRecord {
    fn placeholder() -> Self {
        Self {
            attributes: Attributes::new(),
            relationships: BTreeSet::new(),
            state: RecordState::Empty,
            last_request: None,
            is_new: false,
        }
    }

    /// Attribute values received so far.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Look up one attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// Relationship fields that have an edge in the graph.
    #[must_use]
    pub fn relationships(&self) -> &BTreeSet<String> {
        &self.relationships
    }

    #[must_use]
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// The request that last loaded or is loading this record.
    #[must_use]
    pub fn last_request(&self) -> Option<RequestId> {
        self.last_request
    }

    /// Created locally and not yet saved.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

/// What an upsert changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// The record did not exist before.
    pub created: bool,
    /// At least one attribute value changed.
    pub attributes_changed: bool,
    /// The record state changed.
    pub state_changed: bool,
}

/// Record storage for one store.
#[derive(Debug, Clone, Default)]
pub struct ResourceCache {
    /// Record storage: ResourceKey -> CachedRecord
    records: JournaledMap<ResourceKey, CachedRecord>,
}

impl ResourceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a placeholder record if none exists. Returns `true` if created.
    pub fn ensure(&mut self, key: ResourceKey) -> bool {
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key, CachedRecord::placeholder());
        true
    }

    /// Create a record for a locally created resource. It starts `loaded`:
    /// the caller supplied its data.
    pub fn insert_new(&mut self, key: ResourceKey, attributes: Attributes) {
        let mut record = CachedRecord::placeholder();
        record.attributes = attributes;
        record.state = RecordState::Loaded;
        record.is_new = true;
        self.records.insert(key, record);
    }

    /// Merge attributes and relationship field names into a record.
    ///
    /// Fields absent from `attributes` are left untouched. The record moves
    /// to `loaded`.
    pub fn upsert<'a>(
        &mut self,
        key: ResourceKey,
        attributes: &Attributes,
        relationships: impl IntoIterator<Item = &'a str>,
        request: Option<RequestId>,
    ) -> Result<UpsertOutcome, KeystoneError> {
        let mut outcome = UpsertOutcome {
            created: self.ensure(key),
            ..UpsertOutcome::default()
        };
        let record = self
            .records
            .get_mut(&key)
            .ok_or(KeystoneError::KeyNotFound(key))?;

        if !record.state.can_transition_to(RecordState::Loaded) {
            return Err(KeystoneError::InvalidTransition {
                key,
                from: record.state,
                to: RecordState::Loaded,
            });
        }

        for (name, value) in attributes {
            if record.attributes.get(name) != Some(value) {
                record.attributes.insert(name.clone(), value.clone());
                outcome.attributes_changed = true;
            }
        }
        for field in relationships {
            record.relationships.insert(field.to_string());
        }
        if record.state != RecordState::Loaded {
            record.state = RecordState::Loaded;
            outcome.state_changed = true;
        }
        if request.is_some() {
            record.last_request = request;
        }
        Ok(outcome)
    }

    /// Set one attribute on a live record.
    pub fn set_attribute(
        &mut self,
        key: ResourceKey,
        name: &str,
        value: serde_json::Value,
    ) -> Result<bool, KeystoneError> {
        let record = self
            .records
            .get_mut(&key)
            .filter(|r| r.state != RecordState::Removed)
            .ok_or(KeystoneError::KeyNotFound(key))?;
        let changed = record.attributes.get(name) != Some(&value);
        record.attributes.insert(name.to_string(), value);
        Ok(changed)
    }

    /// Note that a relationship field now has an edge.
    pub fn note_relationship(&mut self, key: ResourceKey, field: &str) {
        if let Some(record) = self.records.get_mut(&key) {
            record.relationships.insert(field.to_string());
        }
    }

    /// Current record, hiding records that are being removed.
    #[must_use]
    pub fn peek(&self, key: ResourceKey) -> Option<&CachedRecord> {
        self.records
            .get(&key)
            .filter(|r| r.state != RecordState::Removed)
    }

    /// Check whether a record exists and is not being removed.
    #[must_use]
    pub fn is_live(&self, key: ResourceKey) -> bool {
        self.peek(key).is_some()
    }

    /// Check whether a record carries server data.
    #[must_use]
    pub fn has_data(&self, key: ResourceKey) -> bool {
        self.records.get(&key).is_some_and(|r| r.state.has_data())
    }

    /// Move a record through its state machine.
    ///
    /// Returns the previous state. Transitioning to the current state is a
    /// no-op.
    pub fn transition(
        &mut self,
        key: ResourceKey,
        to: RecordState,
        request: Option<RequestId>,
    ) -> Result<RecordState, KeystoneError> {
        let record = self
            .records
            .get_mut(&key)
            .ok_or(KeystoneError::KeyNotFound(key))?;
        let from = record.state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(KeystoneError::InvalidTransition { key, from, to });
        }
        record.state = to;
        if request.is_some() {
            record.last_request = request;
        }
        Ok(from)
    }

    /// Signal pending removal: the record turns `removed` and disappears
    /// from `peek`. Snapshots already handed out are unaffected.
    pub fn will_destroy(&mut self, key: ResourceKey) -> Result<(), KeystoneError> {
        self.transition(key, RecordState::Removed, None).map(|_| ())
    }

    /// Drop a record entirely.
    pub fn remove(&mut self, key: ResourceKey) -> Option<CachedRecord> {
        self.records.remove(&key)
    }

    /// Fold a retired placeholder into its canonical record.
    pub fn rekey(&mut self, from: ResourceKey, to: ResourceKey) {
        let Some(retired) = self.records.remove(&from) else {
            return;
        };
        let target = self.records.get_or_insert_with(to, CachedRecord::placeholder);
        for (name, value) in retired.attributes {
            target.attributes.entry(name).or_insert(value);
        }
        target.relationships.extend(retired.relationships);
    }

    /// Clear the `is_new` flag once the server has acknowledged the record.
    pub fn mark_persisted(&mut self, key: ResourceKey) {
        if let Some(record) = self.records.get_mut(&key) {
            record.is_new = false;
        }
    }

    /// Number of stored records, including ones being removed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over live records in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKey, &CachedRecord)> {
        self.records
            .iter()
            .filter(|(_, r)| r.state != RecordState::Removed)
            .map(|(k, r)| (*k, r))
    }

    pub(crate) fn begin(&mut self) {
        self.records.begin();
    }

    pub(crate) fn commit(&mut self) {
        self.records.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.records.rollback();
    }
}

// =============================================================================
// TESTS
// =============================================================================
