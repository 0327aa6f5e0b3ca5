//! # Store
//!
//! Facade that owns one `KeyRegistry`, `RelationshipGraph` and
//! `ResourceCache` together with the schema and the notification manager.
//!
//! ## Transactions
//!
//! Every mutating operation runs inside a transaction:
//! 1. The registry/graph/cache triple is snapshotted
//! 2. Notifications are buffered
//! 3. On error the snapshot is restored and the buffer discarded
//!
//! A failed normalization therefore leaves the store exactly as it was.
//!
//! Keys passed in by callers are resolved through the registry first, so a
//! handle retired by an identity merge keeps working.

use crate::cache::{CachedRecord, ResourceCache, UpsertOutcome};
use crate::capabilities::{Identifiable, Normalizable};
use crate::graph::{Edge, GraphContext, RelationshipGraph};
use crate::identity::{KeyRegistry, MergeOutcome};
use crate::normalize::{DocumentLinks, NormalizationPlan, PlannedPrimary};
use crate::notify::{Callback, Interest, NotificationManager, SubscriptionToken};
use crate::schema::{Schema, SchemaSource};
use crate::{
    Attributes, ChangeKind, KeyInfo, KeystoneError, RecordState, RequestId, ResourceKey, Subject,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Primary content of a normalized payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DocumentContent {
    /// The payload had no `data` member.
    #[default]
    Absent,
    /// `"data": null`.
    Null,
    One(ResourceKey),
    Many(Vec<ResourceKey>),
}

impl DocumentContent {
    /// All primary keys, in payload order.
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        match self {
            Self::Absent | Self::Null => Vec::new(),
            Self::One(key) => vec![*key],
            Self::Many(keys) => keys.clone(),
        }
    }
}

/// What a `push` wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    pub content: DocumentContent,
    /// Keys of included resources, in payload order.
    pub included: Vec<ResourceKey>,
    /// Resource types present anywhere in the payload.
    pub types: BTreeSet<String>,
    pub meta: Option<serde_json::Value>,
    pub links: Option<DocumentLinks>,
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Default)]
struct StoreState {
    registry: KeyRegistry,
    graph: RelationshipGraph,
    cache: ResourceCache,
}

impl StoreState {
    fn begin(&mut self) {
        self.registry.begin();
        self.graph.begin();
        self.cache.begin();
    }

    fn commit(&mut self) {
        self.registry.commit();
        self.graph.commit();
        self.cache.commit();
    }

    fn rollback(&mut self) {
        self.registry.rollback();
        self.graph.rollback();
        self.cache.rollback();
    }
}

/// One normalized, de-duplicated model of remote resources.
pub struct Store {
    schema: Arc<dyn SchemaSource>,
    state: StoreState,
    notifications: NotificationManager,
    last_request: RequestId,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("keys", &self.state.registry.len())
            .field("records", &self.state.cache.len())
            .field("edges", &self.state.graph.edge_count())
            .field("notifications", &self.notifications)
            .finish()
    }
}

impl Store {
    /// Create a store for a schema. The schema is validated first.
    pub fn new(schema: Schema) -> Result<Self, KeystoneError> {
        schema.validate()?;
        Ok(Self::with_source(Arc::new(schema)))
    }

    /// Create a store over any schema source. No validation is performed.
    #[must_use]
    pub fn with_source(schema: Arc<dyn SchemaSource>) -> Self {
        Self {
            schema,
            state: StoreState::default(),
            notifications: NotificationManager::new(),
            last_request: RequestId::default(),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &dyn SchemaSource {
        self.schema.as_ref()
    }

    #[must_use]
    pub fn registry(&self) -> &KeyRegistry {
        &self.state.registry
    }

    #[must_use]
    pub fn graph(&self) -> &RelationshipGraph {
        &self.state.graph
    }

    #[must_use]
    pub fn cache(&self) -> &ResourceCache {
        &self.state.cache
    }

    /// Issue a fresh request id.
    pub fn next_request_id(&mut self) -> RequestId {
        self.last_request = self.last_request.next();
        self.last_request
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Get or intern the key for `(type, id)`. `id = None` issues a fresh
    /// local key.
    pub fn key_for(
        &mut self,
        resource_type: &str,
        id: Option<&str>,
    ) -> Result<ResourceKey, KeystoneError> {
        self.require_type(resource_type)?;
        Ok(self.state.registry.key_for(resource_type, id))
    }

    /// Get or intern the key for a caller-supplied lid.
    pub fn key_for_lid(
        &mut self,
        resource_type: &str,
        lid: &str,
    ) -> Result<ResourceKey, KeystoneError> {
        self.require_type(resource_type)?;
        self.state.registry.key_for_lid(resource_type, lid)
    }

    /// Look up a server identity without creating it.
    #[must_use]
    pub fn lookup(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.state.registry.peek(resource_type, id)
    }

    /// Describe a key.
    #[must_use]
    pub fn describe(&self, key: ResourceKey) -> Option<&KeyInfo> {
        self.state.registry.describe(key)
    }

    /// Canonical form of a key.
    #[must_use]
    pub fn resolve(&self, key: ResourceKey) -> ResourceKey {
        self.state.registry.resolve(key)
    }

    /// Attach a server id to a locally created resource.
    pub fn merge_key(&mut self, key: ResourceKey, id: &str) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        self.transaction(|store| store.merge_in_place(key, id))
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Create a new local record. Undeclared attributes are dropped.
    pub fn create_record(
        &mut self,
        resource_type: &str,
        attributes: Attributes,
    ) -> Result<ResourceKey, KeystoneError> {
        let declared = self
            .schema
            .resource(resource_type)
            .ok_or_else(|| KeystoneError::UnknownType(resource_type.to_string()))?;
        let attributes: Attributes = attributes
            .into_iter()
            .filter(|(name, _)| {
                let keep = declared.attributes.contains(name);
                if !keep {
                    tracing::warn!(
                        resource_type = %resource_type,
                        attribute = %name,
                        "Dropping undeclared attribute"
                    );
                }
                keep
            })
            .collect();

        self.transaction(|store| {
            let key = store.state.registry.key_for(resource_type, None);
            store.state.cache.insert_new(key, attributes);
            store.notify(key, ChangeKind::Added);
            tracing::debug!(%key, resource_type = %resource_type, "Created local record");
            Ok(key)
        })
    }

    /// Snapshot of a record. Records pending removal are hidden.
    #[must_use]
    pub fn peek(&self, key: ResourceKey) -> Option<&CachedRecord> {
        self.state.cache.peek(self.resolve(key))
    }

    /// One attribute of a live record.
    #[must_use]
    pub fn attribute(&self, key: ResourceKey, name: &str) -> Option<&serde_json::Value> {
        self.peek(key)?.attribute(name)
    }

    /// Write one declared attribute locally.
    pub fn set_attribute(
        &mut self,
        key: ResourceKey,
        name: &str,
        value: serde_json::Value,
    ) -> Result<bool, KeystoneError> {
        let key = self.known(key)?;
        let resource_type = self.state.registry.type_of(key)?;
        let declared = self
            .schema
            .resource(resource_type)
            .is_some_and(|def| def.attributes.contains(name));
        if !declared {
            return Err(KeystoneError::SchemaViolation(format!(
                "{}.{} is not a declared attribute",
                resource_type, name
            )));
        }
        self.transaction(|store| {
            let changed = store.state.cache.set_attribute(key, name, value)?;
            if changed {
                store.notify(key, ChangeKind::Attributes);
            }
            Ok(changed)
        })
    }

    /// Mark a loaded record stale.
    pub fn mark_stale(&mut self, key: ResourceKey) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        self.transaction(|store| {
            let previous = store.state.cache.transition(key, RecordState::Stale, None)?;
            if previous != RecordState::Stale {
                store.notify(key, ChangeKind::State);
            }
            Ok(())
        })
    }

    /// Move a record to `loading` for a fetch. Creates the placeholder
    /// record if needed and returns the request id to report back with.
    pub fn begin_request(&mut self, key: ResourceKey) -> Result<RequestId, KeystoneError> {
        let key = self.known(key)?;
        self.transaction(|store| {
            if store.state.cache.ensure(key) {
                store.notify(key, ChangeKind::Added);
            }
            let request = store.next_request_id();
            store
                .state
                .cache
                .transition(key, RecordState::Loading, Some(request))?;
            store.notify(key, ChangeKind::State);
            Ok(request)
        })
    }

    /// Record a failed fetch. Ignored when a newer request owns the record.
    pub fn fail_request(
        &mut self,
        key: ResourceKey,
        request: RequestId,
    ) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        let owned = self.state.cache.peek(key).is_some_and(|record| {
            record.state() == RecordState::Loading && record.last_request() == Some(request)
        });
        if !owned {
            return Ok(());
        }
        self.transaction(|store| {
            store.state.cache.transition(key, RecordState::Error, None)?;
            store.notify(key, ChangeKind::State);
            Ok(())
        })
    }

    /// Remove a resource entirely: record, edges, every reference to it and
    /// finally its key.
    ///
    /// Refused with `RecordBusy` while a request for it is in flight.
    pub fn unload(&mut self, key: ResourceKey) -> Result<KeyInfo, KeystoneError> {
        let key = self.known(key)?;
        if self
            .state
            .cache
            .peek(key)
            .is_some_and(|record| record.state() == RecordState::Loading)
        {
            return Err(KeystoneError::RecordBusy(key));
        }
        self.transaction(|store| {
            if store.state.cache.is_live(key) {
                store.state.cache.will_destroy(key)?;
                store.notify(key, ChangeKind::Removed);
            }
            let touched = store.state.graph.remove_resource(key);
            for other in touched.into_iter().filter(|k| *k != key) {
                store.notify(other, ChangeKind::Relationships);
            }
            store.state.cache.remove(key);
            let info = store.state.registry.forget(key, false)?;
            tracing::debug!(%key, resource = %info, "Unloaded resource");
            Ok(info)
        })
    }

    // -------------------------------------------------------------------------
    // Relationships
    // -------------------------------------------------------------------------

    /// Current members of a relationship.
    #[must_use]
    pub fn materialize(&self, key: ResourceKey, field: &str) -> Vec<ResourceKey> {
        self.state.graph.materialize(self.resolve(key), field)
    }

    /// Snapshot of one edge.
    #[must_use]
    pub fn edge(&self, key: ResourceKey, field: &str) -> Option<&Edge> {
        self.state.graph.edge(self.resolve(key), field)
    }

    /// Add a member locally.
    pub fn add_local(
        &mut self,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
    ) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        let member = self.known(member)?;
        self.transaction(|store| {
            store.ensure_record(member);
            let cx = GraphContext {
                registry: &store.state.registry,
                schema: store.schema.as_ref(),
            };
            let touched = store.state.graph.add_local(&cx, key, field, member)?;
            store.relationships_changed(touched);
            Ok(())
        })
    }

    /// Remove a member locally.
    pub fn remove_local(
        &mut self,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
    ) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        let member = self.known(member)?;
        self.transaction(|store| {
            let cx = GraphContext {
                registry: &store.state.registry,
                schema: store.schema.as_ref(),
            };
            let touched = store.state.graph.remove_local(&cx, key, field, member)?;
            store.relationships_changed(touched);
            Ok(())
        })
    }

    /// Fold local changes into remote state after a successful save.
    pub fn commit_local(&mut self, key: ResourceKey, field: &str) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        self.transaction(|store| {
            let cx = GraphContext {
                registry: &store.state.registry,
                schema: store.schema.as_ref(),
            };
            let touched = store.state.graph.commit_local(&cx, key, field)?;
            store.relationships_changed(touched);
            Ok(())
        })
    }

    /// Discard local changes after a failed save.
    pub fn rollback_local(&mut self, key: ResourceKey, field: &str) -> Result<(), KeystoneError> {
        let key = self.known(key)?;
        self.transaction(|store| {
            let cx = GraphContext {
                registry: &store.state.registry,
                schema: store.schema.as_ref(),
            };
            let touched = store.state.graph.rollback_local(&cx, key, field)?;
            store.relationships_changed(touched);
            Ok(())
        })
    }

    /// Mark one relationship stale. Returns `false` if it has no edge yet.
    pub fn mark_relationship_stale(&mut self, key: ResourceKey, field: &str) -> bool {
        let key = self.resolve(key);
        let marked = self.state.graph.mark_stale(key, field);
        if marked {
            self.notify(key, ChangeKind::Relationships);
        }
        marked
    }

    // -------------------------------------------------------------------------
    // Normalization
    // -------------------------------------------------------------------------

    /// Normalize a payload into the store.
    ///
    /// All-or-nothing: any identity, schema or normalization error leaves
    /// the store untouched and delivers no notifications.
    pub fn push(
        &mut self,
        payload: &(impl Normalizable + ?Sized),
        request: Option<RequestId>,
    ) -> Result<PushOutcome, KeystoneError> {
        let document = payload.to_document()?;
        let plan = NormalizationPlan::build(&document, self.schema.as_ref())?;
        self.transaction(|store| store.apply(&plan, request))
    }

    fn apply(
        &mut self,
        plan: &NormalizationPlan,
        request: Option<RequestId>,
    ) -> Result<PushOutcome, KeystoneError> {
        let mut keys = Vec::with_capacity(plan.len());
        for resource in &plan.resources {
            keys.push(self.identify(&resource.identity)?);
        }

        for (resource, &key) in plan.resources.iter().zip(&keys) {
            let fields = resource.relationships.iter().map(|r| r.field.as_str());
            let outcome = self
                .state
                .cache
                .upsert(key, &resource.attributes, fields, request)?;
            if resource.identity.id.is_some() {
                self.state.cache.mark_persisted(key);
            }
            self.report_upsert(key, outcome);
        }

        for (resource, &key) in plan.resources.iter().zip(&keys) {
            for rel in &resource.relationships {
                if let Some(members) = &rel.members {
                    let mut member_keys = Vec::with_capacity(members.len());
                    for member in members {
                        let member_key = self.identify(member)?;
                        self.ensure_record(member_key);
                        member_keys.push(member_key);
                    }
                    let before = self.state.graph.edge(key, &rel.field).cloned();
                    let cx = GraphContext {
                        registry: &self.state.registry,
                        schema: self.schema.as_ref(),
                    };
                    let touched =
                        self.state
                            .graph
                            .push_remote(&cx, key, &rel.field, &member_keys)?;
                    if self.state.graph.edge(key, &rel.field) != before.as_ref() {
                        self.relationships_changed(touched);
                    }
                }
                if let Some(links) = &rel.links {
                    let cx = GraphContext {
                        registry: &self.state.registry,
                        schema: self.schema.as_ref(),
                    };
                    self.state
                        .graph
                        .set_links(&cx, key, &rel.field, links.clone())?;
                    self.state.cache.note_relationship(key, &rel.field);
                }
            }
        }

        let content = match &plan.primary {
            PlannedPrimary::Absent => DocumentContent::Absent,
            PlannedPrimary::Null => DocumentContent::Null,
            PlannedPrimary::One(index) => keys
                .get(*index)
                .map(|k| DocumentContent::One(*k))
                .unwrap_or(DocumentContent::Null),
            PlannedPrimary::Many(indices) => DocumentContent::Many(
                indices.iter().filter_map(|i| keys.get(*i).copied()).collect(),
            ),
        };
        let primary_count = content.keys().len();
        let included = keys.iter().skip(primary_count).copied().collect();
        let types = plan
            .resources
            .iter()
            .map(|r| r.identity.resource_type.clone())
            .collect();

        tracing::debug!(
            resources = plan.len(),
            request = ?request,
            "Normalized payload"
        );

        Ok(PushOutcome {
            content,
            included,
            types,
            meta: plan.meta.clone(),
            links: plan.links.clone(),
        })
    }

    /// Resolve a payload identity to a key, merging a lid with a server id
    /// when both are present.
    fn identify(&mut self, item: &impl Identifiable) -> Result<ResourceKey, KeystoneError> {
        let resource_type = item.resource_type();
        match (item.id(), item.lid()) {
            (Some(id), Some(lid)) => match self.state.registry.peek_lid(lid) {
                Some(_) => {
                    let key = self.state.registry.key_for_lid(resource_type, lid)?;
                    self.merge_in_place(key, id)?;
                    Ok(key)
                }
                None => Ok(self.state.registry.key_for(resource_type, Some(id))),
            },
            (Some(id), None) => Ok(self.state.registry.key_for(resource_type, Some(id))),
            (None, Some(lid)) => self.state.registry.key_for_lid(resource_type, lid),
            (None, None) => Err(KeystoneError::Normalization(format!(
                "{} resource has neither id nor lid",
                resource_type
            ))),
        }
    }

    fn merge_in_place(&mut self, key: ResourceKey, id: &str) -> Result<(), KeystoneError> {
        let cache = &self.state.cache;
        let outcome = self
            .state
            .registry
            .merge(key, id, |other| cache.has_data(other))?;
        match outcome {
            MergeOutcome::Unchanged => return Ok(()),
            MergeOutcome::Assigned => {}
            MergeOutcome::Absorbed { retired } => {
                let touched = self.state.graph.rekey(retired, key);
                self.state.cache.rekey(retired, key);
                self.relationships_changed(touched);
                tracing::debug!(%key, %retired, "Absorbed placeholder key");
            }
        }
        self.state.cache.mark_persisted(key);
        self.notify(key, ChangeKind::State);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    /// Register interest in changes.
    pub fn subscribe(&mut self, interest: Interest, callback: Callback) -> SubscriptionToken {
        self.notifications.subscribe(interest, callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.notifications.unsubscribe(token)
    }

    /// Report a change to a cached request.
    pub fn notify_request(&mut self, digest: &str, change: ChangeKind) {
        self.notifications
            .notify(Subject::Request(digest.to_string()), change);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Run `f` all-or-nothing. Writes are journaled per entry, so an error
    /// undoes exactly what `f` touched and drops its notifications.
    fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, KeystoneError>,
    ) -> Result<T, KeystoneError> {
        self.state.begin();
        self.notifications.begin();
        match f(self) {
            Ok(value) => {
                self.state.commit();
                self.notifications.commit();
                Ok(value)
            }
            Err(err) => {
                self.state.rollback();
                self.notifications.rollback();
                tracing::debug!(error = %err, "Store transaction rolled back");
                Err(err)
            }
        }
    }

    fn require_type(&self, resource_type: &str) -> Result<(), KeystoneError> {
        if self.schema.has_type(resource_type) {
            Ok(())
        } else {
            Err(KeystoneError::UnknownType(resource_type.to_string()))
        }
    }

    fn known(&self, key: ResourceKey) -> Result<ResourceKey, KeystoneError> {
        let key = self.resolve(key);
        if self.state.registry.contains(key) {
            Ok(key)
        } else {
            Err(KeystoneError::KeyNotFound(key))
        }
    }

    fn ensure_record(&mut self, key: ResourceKey) {
        if self.state.cache.ensure(key) {
            self.notify(key, ChangeKind::Added);
        }
    }

    fn report_upsert(&mut self, key: ResourceKey, outcome: UpsertOutcome) {
        if outcome.created {
            self.notify(key, ChangeKind::Added);
        }
        if outcome.attributes_changed {
            self.notify(key, ChangeKind::Attributes);
        }
        if outcome.state_changed {
            self.notify(key, ChangeKind::State);
        }
    }

    fn relationships_changed(&mut self, touched: BTreeSet<ResourceKey>) {
        for key in touched {
            let fields: Vec<String> = self.state.graph.fields(key).map(str::to_string).collect();
            for field in &fields {
                self.state.cache.note_relationship(key, field);
            }
            self.notify(key, ChangeKind::Relationships);
        }
    }

    fn notify(&mut self, key: ResourceKey, change: ChangeKind) {
        self.notifications.notify(Subject::Resource(key), change);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RelationshipSchema, ResourceSchema};
    use serde_json::json;
    use std::sync::Mutex;

    fn blog() -> Schema {
        Schema::new()
            .resource(
                "post",
                ResourceSchema::new()
                    .attribute("title")
                    .attribute("body")
                    .relationship("author", RelationshipSchema::one("user").inverse("posts"))
                    .relationship("comments", RelationshipSchema::many("comment")),
            )
            .resource(
                "user",
                ResourceSchema::new()
                    .attribute("name")
                    .relationship("posts", RelationshipSchema::many("post").inverse("author")),
            )
            .resource("comment", ResourceSchema::new().attribute("body"))
    }

    fn store() -> Store {
        Store::new(blog()).expect("store")
    }

    fn record_all(store: &mut Store) -> Arc<Mutex<Vec<(Subject, ChangeKind)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(
            Interest::Any,
            Arc::new(move |subject: &Subject, change: ChangeKind| {
                if let Ok(mut events) = sink.lock() {
                    events.push((subject.clone(), change));
                }
            }),
        );
        seen
    }

    fn count(seen: &Arc<Mutex<Vec<(Subject, ChangeKind)>>>) -> usize {
        seen.lock().map(|e| e.len()).unwrap_or_default()
    }

    #[test]
    fn invalid_schema_is_rejected() {
        let schema = Schema::new().resource(
            "post",
            ResourceSchema::new().relationship("author", RelationshipSchema::one("user")),
        );
        assert!(matches!(
            Store::new(schema),
            Err(KeystoneError::SchemaViolation(_))
        ));
    }

    #[test]
    fn push_links_both_sides() {
        let mut store = store();
        let outcome = store
            .push(
                &json!({
                    "data": {"type": "post", "id": "1", "attributes": {"title": "Hi"},
                             "relationships": {"author": {"data": {"type": "user", "id": "9"}}}}
                }),
                None,
            )
            .expect("push");

        let post = store.lookup("post", "1").expect("post");
        let user = store.lookup("user", "9").expect("user");
        assert_eq!(outcome.content, DocumentContent::One(post));
        assert_eq!(store.materialize(post, "author"), vec![user]);
        assert_eq!(store.materialize(user, "posts"), vec![post]);
        assert_eq!(
            store.peek(user).map(CachedRecord::state),
            Some(RecordState::Empty)
        );
        assert!(store
            .peek(user)
            .is_some_and(|r| r.relationships().contains("posts")));
    }

    #[test]
    fn failed_push_leaves_store_untouched() {
        let mut store = store();
        let seen = record_all(&mut store);
        let result = store.push(
            &json!({
                "data": {"type": "post", "id": "1",
                         "relationships": {"author": {"data": {"type": "comment", "id": "2"}}}}
            }),
            None,
        );
        assert!(matches!(result, Err(KeystoneError::SchemaViolation(_))));
        assert!(store.registry().is_empty());
        assert!(store.cache().is_empty());
        assert_eq!(count(&seen), 0);
    }

    /// User 9 and post 1 loaded, plus one local user. Returns the local
    /// user's lid.
    fn seeded() -> (Store, String) {
        let mut store = store();
        store
            .push(
                &json!({"data": {"type": "user", "id": "9", "attributes": {"name": "Ann"}},
                        "included": [{"type": "post", "id": "1", "attributes": {"title": "Hi"},
                                      "relationships": {"author": {"data": {"type": "user", "id": "9"}}}}]}),
                None,
            )
            .expect("push");
        let local = store.create_record("user", Attributes::new()).expect("create");
        let lid = store.describe(local).map(|i| i.lid.clone()).expect("lid");
        (store, lid)
    }

    #[test]
    fn failure_late_in_push_undoes_every_earlier_write() {
        let (mut store, lid) = seeded();
        let (mut twin, _) = seeded();
        let seen = record_all(&mut store);
        let post = store.lookup("post", "1").expect("post");
        let user = store.lookup("user", "9").expect("user");
        let keys = store.registry().len();
        let records = store.cache().len();

        // Post 5 is created and linked and post 1 is updated before the
        // second linkage's lid collides with the loaded user 9.
        let result = store.push(
            &json!({"data": [
                {"type": "post", "id": "5", "attributes": {"title": "Five"},
                 "relationships": {"author": {"data": {"type": "user", "id": "9"}}}},
                {"type": "post", "id": "1", "attributes": {"title": "Changed"},
                 "relationships": {"author": {"data": {"type": "user", "id": "9", "lid": lid}}}}
            ]}),
            Some(RequestId(7)),
        );

        assert!(matches!(result, Err(KeystoneError::IdentityConflict { .. })));
        assert_eq!(count(&seen), 0);
        assert_eq!(store.lookup("post", "5"), None);
        assert_eq!(store.registry().len(), keys);
        assert_eq!(store.cache().len(), records);
        assert_eq!(store.attribute(post, "title"), Some(&json!("Hi")));
        assert_eq!(store.peek(post).and_then(CachedRecord::last_request), None);
        assert_eq!(store.materialize(user, "posts"), vec![post]);
        assert_eq!(store.graph().edge_count(), twin.graph().edge_count());

        // Key and lid counters are restored too.
        assert_eq!(
            store.key_for("post", Some("5")).expect("key"),
            twin.key_for("post", Some("5")).expect("key")
        );
        let fresh = store.create_record("post", Attributes::new()).expect("create");
        let twin_fresh = twin.create_record("post", Attributes::new()).expect("create");
        assert_eq!(
            store.describe(fresh).map(|i| i.lid.clone()),
            twin.describe(twin_fresh).map(|i| i.lid.clone())
        );
    }

    #[test]
    fn successful_writes_after_a_rollback_are_kept() {
        let (mut store, lid) = seeded();
        let post = store.lookup("post", "1").expect("post");
        let conflicting = json!({"data": {"type": "post", "id": "1", "attributes": {"title": "X"},
            "relationships": {"author": {"data": {"type": "user", "id": "9", "lid": lid}}}}});
        assert!(store.push(&conflicting, None).is_err());

        assert!(store.set_attribute(post, "title", json!("Edited")).expect("set"));
        store.mark_stale(post).expect("stale");
        assert!(store.push(&conflicting, None).is_err());

        assert_eq!(store.attribute(post, "title"), Some(&json!("Edited")));
        assert_eq!(
            store.peek(post).map(CachedRecord::state),
            Some(RecordState::Stale)
        );
    }

    #[test]
    fn identical_push_is_silent() {
        let mut store = store();
        let payload = json!({
            "data": {"type": "post", "id": "1", "attributes": {"title": "Hi"},
                     "relationships": {"author": {"data": {"type": "user", "id": "9"}}}}
        });
        store.push(&payload, None).expect("first");
        let seen = record_all(&mut store);
        store.push(&payload, None).expect("second");
        assert_eq!(count(&seen), 0);
    }

    #[test]
    fn save_response_merges_lid() {
        let mut store = store();
        let local = store
            .create_record("post", Attributes::from([("title".into(), json!("Draft"))]))
            .expect("create");
        let lid = store.describe(local).map(|i| i.lid.clone()).expect("lid");

        store
            .push(
                &json!({"data": {"type": "post", "id": "42", "lid": lid,
                                 "attributes": {"title": "Draft"}}}),
                None,
            )
            .expect("push");

        assert_eq!(store.lookup("post", "42"), Some(local));
        assert!(store.peek(local).is_some_and(|r| !r.is_new()));
    }

    #[test]
    fn merge_absorbs_placeholder_edges() {
        let mut store = store();
        store
            .push(
                &json!({"data": {"type": "user", "id": "9",
                                 "relationships": {"posts": {"data": [{"type": "post", "id": "5"}]}}}}),
                None,
            )
            .expect("push");
        let placeholder = store.lookup("post", "5").expect("placeholder");
        let user = store.lookup("user", "9").expect("user");
        let local = store.create_record("post", Attributes::new()).expect("create");

        store.merge_key(local, "5").expect("merge");

        assert_eq!(store.resolve(placeholder), local);
        assert_eq!(store.materialize(user, "posts"), vec![local]);
        assert_eq!(store.materialize(placeholder, "author"), vec![user]);
    }

    #[test]
    fn merge_into_loaded_record_conflicts() {
        let mut store = store();
        store
            .push(&json!({"data": {"type": "post", "id": "5"}}), None)
            .expect("push");
        let local = store.create_record("post", Attributes::new()).expect("create");
        let result = store.merge_key(local, "5");
        assert!(matches!(
            result,
            Err(KeystoneError::IdentityConflict { .. })
        ));
        assert!(store.describe(local).is_some_and(KeyInfo::is_local));
    }

    #[test]
    fn unload_busy_record_is_refused() {
        let mut store = store();
        let key = store.key_for("post", Some("1")).expect("key");
        let request = store.begin_request(key).expect("begin");
        assert!(matches!(
            store.unload(key),
            Err(KeystoneError::RecordBusy(_))
        ));
        store.fail_request(key, request).expect("fail");
        assert_eq!(
            store.peek(key).map(CachedRecord::state),
            Some(RecordState::Error)
        );
        store.unload(key).expect("unload");
        assert!(store.lookup("post", "1").is_none());
    }

    #[test]
    fn unload_removes_inverse_references() {
        let mut store = store();
        store
            .push(
                &json!({"data": {"type": "post", "id": "1",
                                 "relationships": {"author": {"data": {"type": "user", "id": "9"}}}}}),
                None,
            )
            .expect("push");
        let post = store.lookup("post", "1").expect("post");
        let user = store.lookup("user", "9").expect("user");

        store.unload(post).expect("unload");
        assert!(store.materialize(user, "posts").is_empty());
        assert!(store.peek(post).is_none());
    }

    #[test]
    fn stale_fail_request_is_ignored() {
        let mut store = store();
        let key = store.key_for("post", Some("1")).expect("key");
        let first = store.begin_request(key).expect("first");
        store.fail_request(key, first).expect("fail");
        let second = store.begin_request(key).expect("second");
        store.fail_request(key, first).expect("ignored");
        assert_eq!(
            store.peek(key).and_then(CachedRecord::last_request),
            Some(second)
        );
        assert_eq!(
            store.peek(key).map(CachedRecord::state),
            Some(RecordState::Loading)
        );
    }

    #[test]
    fn set_attribute_requires_declaration() {
        let mut store = store();
        let key = store.create_record("post", Attributes::new()).expect("create");
        assert!(store.set_attribute(key, "title", json!("x")).expect("set"));
        assert!(!store.set_attribute(key, "title", json!("x")).expect("set"));
        assert!(matches!(
            store.set_attribute(key, "nope", json!(1)),
            Err(KeystoneError::SchemaViolation(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut store = store();
        assert!(matches!(
            store.key_for("widget", Some("1")),
            Err(KeystoneError::UnknownType(_))
        ));
        assert!(matches!(
            store.create_record("widget", Attributes::new()),
            Err(KeystoneError::UnknownType(_))
        ));
    }
}
