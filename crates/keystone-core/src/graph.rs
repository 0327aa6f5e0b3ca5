//! # Relationship Graph
//!
//! Edge table keyed by `(ResourceKey, field)`.
//!
//! Each edge keeps two layers:
//! - **remote**: the last authoritative member list received from the server
//! - **local**: an overlay of additions/removals not yet persisted
//!
//! Inverse symmetry is maintained with index lookups instead of
//! back-references. Every logical operation runs one `Propagation`, in which
//! each `(resource, field, member, op)` step is applied at most once. That is
//! what keeps self-referential relationships from looping.
//!
//! Member order for `many` edges: remote members in server order, then local
//! additions in insertion order.

use crate::identity::KeyRegistry;
use crate::journal::JournaledMap;
use crate::primitives::MAX_RELATIONSHIP_MEMBERS;
use crate::schema::{RelationshipSchema, SchemaSource};
use crate::{Cardinality, KeystoneError, ResourceKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// CONTEXT
// =============================================================================

/// Read-only collaborators every graph mutation needs.
#[derive(Clone, Copy)]
pub struct GraphContext<'a> {
    /// Resolves a key to its resource type.
    pub registry: &'a KeyRegistry,
    /// Supplies relationship declarations.
    pub schema: &'a dyn SchemaSource,
}

// =============================================================================
// EDGE
// =============================================================================

/// Links advertised for a relationship, used to fetch it lazily.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeLinks {
    #[serde(default)]
    pub related: Option<String>,
    #[serde(default, rename = "self")]
    pub self_link: Option<String>,
}

/// One named relationship field of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    kind: Cardinality,
    inverse: Option<String>,
    remote: Vec<ResourceKey>,
    local_additions: Vec<ResourceKey>,
    local_removals: Vec<ResourceKey>,
    is_stale: bool,
    is_loaded: bool,
    links: Option<EdgeLinks>,
}

impl Edge {
    fn new(def: &RelationshipSchema) -> Self {
        Self {
            kind: def.kind,
            inverse: def.inverse.clone(),
            remote: Vec::new(),
            local_additions: Vec::new(),
            local_removals: Vec::new(),
            is_stale: false,
            is_loaded: false,
            links: None,
        }
    }

    /// Cardinality of this edge.
    #[must_use]
    pub fn kind(&self) -> Cardinality {
        self.kind
    }

    /// Reciprocal field name, if any.
    #[must_use]
    pub fn inverse(&self) -> Option<&str> {
        self.inverse.as_deref()
    }

    /// Last authoritative members.
    #[must_use]
    pub fn remote_members(&self) -> &[ResourceKey] {
        &self.remote
    }

    /// Members added locally, in insertion order.
    #[must_use]
    pub fn local_additions(&self) -> &[ResourceKey] {
        &self.local_additions
    }

    /// Remote members hidden by local removals.
    #[must_use]
    pub fn local_removals(&self) -> &[ResourceKey] {
        &self.local_removals
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    #[must_use]
    pub fn links(&self) -> Option<&EdgeLinks> {
        self.links.as_ref()
    }

    /// Check whether the overlay carries unsaved changes.
    #[must_use]
    pub fn has_local_changes(&self) -> bool {
        !self.local_additions.is_empty() || !self.local_removals.is_empty()
    }

    /// Compute the visible member list.
    ///
    /// Recomputed on every call: remote minus removals, then additions.
    #[must_use]
    pub fn materialize(&self) -> Vec<ResourceKey> {
        let mut members: Vec<ResourceKey> = self
            .remote
            .iter()
            .filter(|m| !self.local_removals.contains(m))
            .copied()
            .collect();
        for added in &self.local_additions {
            if !members.contains(added) {
                members.push(*added);
            }
        }
        members
    }

    fn references(&self, member: ResourceKey) -> bool {
        self.remote.contains(&member)
            || self.local_additions.contains(&member)
            || self.local_removals.contains(&member)
    }

    fn purge(&mut self, member: ResourceKey) {
        self.remote.retain(|m| *m != member);
        self.local_additions.retain(|m| *m != member);
        self.local_removals.retain(|m| *m != member);
    }

    fn replace_member(&mut self, from: ResourceKey, to: ResourceKey) {
        for list in [
            &mut self.remote,
            &mut self.local_additions,
            &mut self.local_removals,
        ] {
            let mut seen = BTreeSet::new();
            list.retain_mut(|m| {
                if *m == from {
                    *m = to;
                }
                seen.insert(*m)
            });
        }
    }

    fn current(&self, layer: Layer) -> Vec<ResourceKey> {
        match layer {
            Layer::Remote => self.remote.clone(),
            Layer::Local => self.materialize(),
        }
    }

    fn insert(&mut self, layer: Layer, member: ResourceKey) {
        match layer {
            Layer::Remote => {
                if !self.remote.contains(&member) {
                    self.remote.push(member);
                }
                // The server now agrees with the local addition.
                self.local_additions.retain(|m| *m != member);
            }
            Layer::Local => {
                if let Some(pos) = self.local_removals.iter().position(|m| *m == member) {
                    self.local_removals.remove(pos);
                } else if !self.materialize().contains(&member) {
                    self.local_additions.push(member);
                }
            }
        }
    }

    fn remove(&mut self, layer: Layer, member: ResourceKey) {
        match layer {
            Layer::Remote => {
                self.remote.retain(|m| *m != member);
                self.local_removals.retain(|m| *m != member);
            }
            Layer::Local => {
                if let Some(pos) = self.local_additions.iter().position(|m| *m == member) {
                    self.local_additions.remove(pos);
                } else if self.remote.contains(&member) && !self.local_removals.contains(&member)
                {
                    self.local_removals.push(member);
                }
            }
        }
    }

    fn absorb(&mut self, other: Edge) {
        for m in other.remote {
            if !self.remote.contains(&m) {
                self.remote.push(m);
            }
        }
        for m in other.local_additions {
            if !self.local_additions.contains(&m) {
                self.local_additions.push(m);
            }
        }
        for m in other.local_removals {
            if !self.local_removals.contains(&m) {
                self.local_removals.push(m);
            }
        }
        self.is_loaded |= other.is_loaded;
        self.is_stale |= other.is_stale;
        if self.links.is_none() {
            self.links = other.links;
        }
    }
}

// =============================================================================
// PROPAGATION (single update transaction)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Layer {
    Remote,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Link(Layer),
    Unlink(Layer),
    Rollback,
}

#[derive(Debug, Default)]
struct Propagation {
    visited: BTreeSet<(Step, ResourceKey, String, Option<ResourceKey>)>,
    touched: BTreeSet<ResourceKey>,
}

impl Propagation {
    /// Record a step. Returns `false` if it already ran in this transaction.
    fn visit(
        &mut self,
        step: Step,
        key: ResourceKey,
        field: &str,
        member: Option<ResourceKey>,
    ) -> bool {
        self.visited.insert((step, key, field.to_string(), member))
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// The relationship edge table for one store.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    /// Edge storage: owner -> field -> Edge
    edges: JournaledMap<ResourceKey, BTreeMap<String, Edge>>,
}

impl RelationshipGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an edge if it exists.
    #[must_use]
    pub fn edge(&self, key: ResourceKey, field: &str) -> Option<&Edge> {
        self.edges.get(&key)?.get(field)
    }

    /// Field names with an edge for this resource.
    pub fn fields(&self, key: ResourceKey) -> impl Iterator<Item = &str> {
        self.edges
            .get(&key)
            .into_iter()
            .flat_map(|fields| fields.keys().map(String::as_str))
    }

    /// Total number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }

    /// Check whether any edge other than the resource's own references it.
    #[must_use]
    pub fn is_referenced(&self, key: ResourceKey) -> bool {
        self.edges
            .iter()
            .filter(|(owner, _)| **owner != key)
            .any(|(_, fields)| fields.values().any(|edge| edge.references(key)))
    }

    /// Visible members of an edge; empty if the edge does not exist.
    #[must_use]
    pub fn materialize(&self, key: ResourceKey, field: &str) -> Vec<ResourceKey> {
        self.edge(key, field)
            .map(Edge::materialize)
            .unwrap_or_default()
    }

    /// Replace the remote members of an edge with server state.
    ///
    /// Members no longer present are unlinked on the inverse side; new
    /// members are linked. The edge becomes loaded and fresh.
    ///
    /// Returns every resource whose relationships changed.
    pub fn push_remote(
        &mut self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
        members: &[ResourceKey],
    ) -> Result<BTreeSet<ResourceKey>, KeystoneError> {
        let members = dedup(members);
        let def = self.validate(cx, key, field, &members)?;

        let mut tx = Propagation::default();
        self.replace_remote(cx, &mut tx, key, field, &def, &members)?;
        let edge = self.edge_mut(key, field, &def)?;
        edge.is_loaded = true;
        edge.is_stale = false;
        Ok(tx.touched)
    }

    /// Add a member to the local overlay (and the inverse overlay).
    pub fn add_local(
        &mut self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
    ) -> Result<BTreeSet<ResourceKey>, KeystoneError> {
        self.validate(cx, key, field, &[member])?;
        let mut tx = Propagation::default();
        self.link(cx, &mut tx, Layer::Local, key, field, member)?;
        Ok(tx.touched)
    }

    /// Remove a member via the local overlay (and the inverse overlay).
    pub fn remove_local(
        &mut self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
    ) -> Result<BTreeSet<ResourceKey>, KeystoneError> {
        self.validate(cx, key, field, &[member])?;
        let mut tx = Propagation::default();
        self.unlink(cx, &mut tx, Layer::Local, key, field, member)?;
        Ok(tx.touched)
    }

    /// Fold the overlay into remote state after a successful save.
    ///
    /// The inverse side is updated through remote propagation, which also
    /// clears the mirrored overlay entries there.
    pub fn commit_local(
        &mut self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
    ) -> Result<BTreeSet<ResourceKey>, KeystoneError> {
        let def = definition(cx, key, field)?;
        let Some(edge) = self.edges.get_mut(&key).and_then(|f| f.get_mut(field)) else {
            return Ok(BTreeSet::new());
        };
        if !edge.has_local_changes() {
            return Ok(BTreeSet::new());
        }
        let target = edge.materialize();
        edge.local_additions.clear();
        edge.local_removals.clear();

        let mut tx = Propagation::default();
        tx.touched.insert(key);
        self.replace_remote(cx, &mut tx, key, field, &def, &target)?;
        Ok(tx.touched)
    }

    /// Discard the overlay after a failed save.
    ///
    /// Mirrored entries on inverse edges are discarded too; a to-one inverse
    /// is rolled back as a whole so displaced members come back.
    pub fn rollback_local(
        &mut self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
    ) -> Result<BTreeSet<ResourceKey>, KeystoneError> {
        definition(cx, key, field)?;
        let mut tx = Propagation::default();
        self.rollback_edge(cx, &mut tx, key, field)?;
        Ok(tx.touched)
    }

    /// Mark an edge as stale (e.g. after an invalidation signal).
    pub fn mark_stale(&mut self, key: ResourceKey, field: &str) -> bool {
        match self.edges.get_mut(&key).and_then(|f| f.get_mut(field)) {
            Some(edge) => {
                edge.is_stale = true;
                true
            }
            None => false,
        }
    }

    /// Record relationship links without touching membership.
    pub fn set_links(
        &mut self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
        links: EdgeLinks,
    ) -> Result<(), KeystoneError> {
        let def = definition(cx, key, field)?;
        self.edge_mut(key, field, &def)?.links = Some(links);
        Ok(())
    }

    /// Drop a resource from the graph.
    ///
    /// Removes every membership that references it (inverse sides and
    /// unidirectional referrers alike), then its own edges.
    pub fn remove_resource(&mut self, key: ResourceKey) -> BTreeSet<ResourceKey> {
        let mut touched = BTreeSet::new();
        for owner in self.referrers(key) {
            if owner == key {
                continue;
            }
            if let Some(fields) = self.edges.get_mut(&owner) {
                for edge in fields.values_mut().filter(|edge| edge.references(key)) {
                    edge.purge(key);
                }
                touched.insert(owner);
            }
        }
        if self.edges.remove(&key).is_some() {
            touched.insert(key);
        }
        touched
    }

    /// Re-point every reference from a retired key to its canonical key.
    ///
    /// Used when an identity merge absorbs a placeholder. Edges owned by the
    /// retired key are folded into the canonical key's edges.
    pub fn rekey(&mut self, from: ResourceKey, to: ResourceKey) -> BTreeSet<ResourceKey> {
        let mut touched = BTreeSet::new();
        for owner in self.referrers(from) {
            if let Some(fields) = self.edges.get_mut(&owner) {
                for edge in fields.values_mut().filter(|edge| edge.references(from)) {
                    edge.replace_member(from, to);
                }
                touched.insert(owner);
            }
        }
        if let Some(moved) = self.edges.remove(&from) {
            let target = self.edges.get_or_insert_with(to, BTreeMap::new);
            for (field, edge) in moved {
                match target.get_mut(&field) {
                    Some(existing) => existing.absorb(edge),
                    None => {
                        target.insert(field, edge);
                    }
                }
            }
            touched.insert(to);
        }
        touched
    }

    pub(crate) fn begin(&mut self) {
        self.edges.begin();
    }

    pub(crate) fn commit(&mut self) {
        self.edges.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.edges.rollback();
    }

    /// Owners with at least one edge referencing `key`.
    fn referrers(&self, key: ResourceKey) -> Vec<ResourceKey> {
        self.edges
            .iter()
            .filter(|(_, fields)| fields.values().any(|edge| edge.references(key)))
            .map(|(owner, _)| *owner)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Internal propagation
    // -------------------------------------------------------------------------

    fn validate(
        &self,
        cx: &GraphContext<'_>,
        key: ResourceKey,
        field: &str,
        members: &[ResourceKey],
    ) -> Result<RelationshipSchema, KeystoneError> {
        let owner_type = cx.registry.type_of(key)?;
        let def = definition(cx, key, field)?;

        if let Some(edge) = self.edge(key, field) {
            if edge.kind != def.kind {
                return Err(KeystoneError::SchemaViolation(format!(
                    "{}.{} is loaded as {} but declared {}",
                    owner_type, field, edge.kind, def.kind
                )));
            }
        }
        if def.kind == Cardinality::One && members.len() > 1 {
            return Err(KeystoneError::SchemaViolation(format!(
                "{}.{} is to-one but received {} members",
                owner_type,
                field,
                members.len()
            )));
        }
        if members.len() > MAX_RELATIONSHIP_MEMBERS {
            return Err(KeystoneError::SchemaViolation(format!(
                "{}.{} received {} members (limit {})",
                owner_type,
                field,
                members.len(),
                MAX_RELATIONSHIP_MEMBERS
            )));
        }

        let inverse = inverse_definition(cx, owner_type, field, &def)?;
        for &member in members {
            let member_type = cx.registry.type_of(member)?;
            if member_type != def.related_type {
                return Err(KeystoneError::SchemaViolation(format!(
                    "{}.{} expects '{}' but received '{}'",
                    owner_type, field, def.related_type, member_type
                )));
            }
            if let (Some(inv_field), Some(inv_def)) = (def.inverse.as_deref(), inverse.as_ref()) {
                if let Some(inv_edge) = self.edge(member, inv_field) {
                    if inv_edge.kind != inv_def.kind {
                        return Err(KeystoneError::SchemaViolation(format!(
                            "inverse {}.{} is loaded as {} but declared {}",
                            member_type, inv_field, inv_edge.kind, inv_def.kind
                        )));
                    }
                }
            }
        }
        Ok(def)
    }

    fn edge_mut(
        &mut self,
        key: ResourceKey,
        field: &str,
        def: &RelationshipSchema,
    ) -> Result<&mut Edge, KeystoneError> {
        let edge = self
            .edges
            .get_or_insert_with(key, BTreeMap::new)
            .entry(field.to_string())
            .or_insert_with(|| Edge::new(def));
        if edge.kind != def.kind {
            return Err(KeystoneError::SchemaViolation(format!(
                "field '{}' is loaded as {} but declared {}",
                field, edge.kind, def.kind
            )));
        }
        Ok(edge)
    }

    fn replace_remote(
        &mut self,
        cx: &GraphContext<'_>,
        tx: &mut Propagation,
        key: ResourceKey,
        field: &str,
        def: &RelationshipSchema,
        members: &[ResourceKey],
    ) -> Result<(), KeystoneError> {
        let old = self
            .edge(key, field)
            .map(|e| e.remote.clone())
            .unwrap_or_default();
        for gone in old.iter().filter(|m| !members.contains(m)) {
            self.unlink(cx, tx, Layer::Remote, key, field, *gone)?;
        }
        for member in members {
            self.link(cx, tx, Layer::Remote, key, field, *member)?;
        }
        // Server order wins over the order propagation appended in.
        let edge = self.edge_mut(key, field, def)?;
        edge.remote = members.to_vec();
        tx.touched.insert(key);
        Ok(())
    }

    fn link(
        &mut self,
        cx: &GraphContext<'_>,
        tx: &mut Propagation,
        layer: Layer,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
    ) -> Result<(), KeystoneError> {
        if !tx.visit(Step::Link(layer), key, field, Some(member)) {
            return Ok(());
        }
        let def = definition(cx, key, field)?;

        if def.kind == Cardinality::One {
            // Server state replacing a to-one member discards the local
            // overlay of that edge, mirrored entries included.
            let conflicting = layer == Layer::Remote
                && self.edge(key, field).is_some_and(|e| {
                    e.has_local_changes()
                        && !e.remote.contains(&member)
                        && !e.local_additions.contains(&member)
                });
            if conflicting {
                self.rollback_edge(cx, tx, key, field)?;
            }
            let displaced: Vec<ResourceKey> = self
                .edge(key, field)
                .map(|e| e.current(layer))
                .unwrap_or_default()
                .into_iter()
                .filter(|m| *m != member)
                .collect();
            for other in displaced {
                self.unlink(cx, tx, layer, key, field, other)?;
            }
        }

        self.edge_mut(key, field, &def)?.insert(layer, member);
        tx.touched.insert(key);

        if let Some(inverse) = def.inverse.as_deref() {
            self.link(cx, tx, layer, member, inverse, key)?;
        }
        Ok(())
    }

    fn unlink(
        &mut self,
        cx: &GraphContext<'_>,
        tx: &mut Propagation,
        layer: Layer,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
    ) -> Result<(), KeystoneError> {
        if !tx.visit(Step::Unlink(layer), key, field, Some(member)) {
            return Ok(());
        }
        let def = definition(cx, key, field)?;

        if let Some(edge) = self.edges.get_mut(&key).and_then(|f| f.get_mut(field)) {
            edge.remove(layer, member);
            tx.touched.insert(key);
        }

        if let Some(inverse) = def.inverse.as_deref() {
            self.unlink(cx, tx, layer, member, inverse, key)?;
        }
        Ok(())
    }

    fn rollback_edge(
        &mut self,
        cx: &GraphContext<'_>,
        tx: &mut Propagation,
        key: ResourceKey,
        field: &str,
    ) -> Result<(), KeystoneError> {
        if !tx.visit(Step::Rollback, key, field, None) {
            return Ok(());
        }
        let Some(edge) = self.edges.get_mut(&key).and_then(|f| f.get_mut(field)) else {
            return Ok(());
        };
        if !edge.has_local_changes() {
            return Ok(());
        }
        let mut mirrored = std::mem::take(&mut edge.local_additions);
        mirrored.append(&mut edge.local_removals);
        let inverse = edge.inverse.clone();
        tx.touched.insert(key);

        let Some(inverse) = inverse else {
            return Ok(());
        };
        for member in mirrored {
            let inv_def = definition(cx, member, &inverse)?;
            if inv_def.kind == Cardinality::One {
                self.rollback_edge(cx, tx, member, &inverse)?;
            } else if let Some(inv_edge) = self
                .edges
                .get_mut(&member)
                .and_then(|f| f.get_mut(inverse.as_str()))
            {
                inv_edge.local_additions.retain(|m| *m != key);
                inv_edge.local_removals.retain(|m| *m != key);
                tx.touched.insert(member);
            }
        }
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn definition(
    cx: &GraphContext<'_>,
    key: ResourceKey,
    field: &str,
) -> Result<RelationshipSchema, KeystoneError> {
    let owner_type = cx.registry.type_of(key)?;
    cx.schema
        .relationship(owner_type, field)
        .cloned()
        .ok_or_else(|| {
            KeystoneError::SchemaViolation(format!(
                "{}.{} is not a declared relationship",
                owner_type, field
            ))
        })
}

fn inverse_definition(
    cx: &GraphContext<'_>,
    owner_type: &str,
    field: &str,
    def: &RelationshipSchema,
) -> Result<Option<RelationshipSchema>, KeystoneError> {
    let Some(inverse) = def.inverse.as_deref() else {
        return Ok(None);
    };
    let inv = cx
        .schema
        .relationship(&def.related_type, inverse)
        .ok_or_else(|| {
            KeystoneError::SchemaViolation(format!(
                "{}.{} declares missing inverse {}.{}",
                owner_type, field, def.related_type, inverse
            ))
        })?;
    if inv.related_type != owner_type || inv.inverse.as_deref() != Some(field) {
        return Err(KeystoneError::SchemaViolation(format!(
            "{}.{} and {}.{} disagree about their inverse",
            owner_type, field, def.related_type, inverse
        )));
    }
    Ok(Some(inv.clone()))
}

fn dedup(members: &[ResourceKey]) -> Vec<ResourceKey> {
    let mut seen = BTreeSet::new();
    members.iter().filter(|m| seen.insert(**m)).copied().collect()
}

// =============================================================================
// TESTS
// =============================================================================
