//! # Identity Registry
//!
//! Issues and interns one `ResourceKey` per logical resource.
//!
//! - `(type, id)` pairs are interned: asking twice yields the same key
//! - Locally created resources get a lid-only key
//! - `merge` attaches a server id to a local key without changing the key
//! - Retired placeholder keys become aliases of their canonical key
//!
//! All structures are journaled `BTreeMap`s: deterministic iteration, and a
//! failed store transaction undoes only what it touched.

use crate::journal::JournaledMap;
use crate::primitives::generated_lid;
use crate::{KeyInfo, KeystoneError, ResourceKey};

/// Result of a successful `merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The key already carried this id; nothing changed.
    Unchanged,
    /// The id was attached to the local key.
    Assigned,
    /// A placeholder key for the same `(type, id)` was retired and now
    /// resolves to the local key. The caller must move its edges/record.
    Absorbed { retired: ResourceKey },
}

/// The key registry for one store.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    /// Key storage: ResourceKey -> KeyInfo
    keys: JournaledMap<ResourceKey, KeyInfo>,

    /// Interned server identities: (type, id) -> ResourceKey
    by_identity: JournaledMap<(String, String), ResourceKey>,

    /// Local identities: lid -> ResourceKey
    by_lid: JournaledMap<String, ResourceKey>,

    /// Retired keys: retired -> canonical
    aliases: JournaledMap<ResourceKey, ResourceKey>,

    /// Next available key handle
    next_key: u64,

    /// Next generated lid ordinal
    next_lid: u64,

    /// `(next_key, next_lid)` at each open transaction frame
    marks: Vec<(u64, u64)>,
}

impl KeyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or intern the key for `(resource_type, id)`.
    ///
    /// With `id = None` a brand new local key is issued every time.
    pub fn key_for(&mut self, resource_type: &str, id: Option<&str>) -> ResourceKey {
        match id {
            Some(id) => {
                if let Some(&key) = self
                    .by_identity
                    .get(&(resource_type.to_string(), id.to_string()))
                {
                    return self.resolve(key);
                }
                let lid = self.issue_lid(resource_type);
                let key = self.allocate(resource_type, Some(id.to_string()), lid);
                self.by_identity
                    .insert((resource_type.to_string(), id.to_string()), key);
                key
            }
            None => {
                let lid = self.issue_lid(resource_type);
                self.allocate(resource_type, None, lid)
            }
        }
    }

    /// Get or intern the key for a caller-supplied lid.
    ///
    /// Fails if the lid is already bound to a resource of another type.
    pub fn key_for_lid(
        &mut self,
        resource_type: &str,
        lid: &str,
    ) -> Result<ResourceKey, KeystoneError> {
        if let Some(&key) = self.by_lid.get(lid) {
            let key = self.resolve(key);
            let info = self.keys.get(&key).ok_or(KeystoneError::KeyNotFound(key))?;
            if info.resource_type != resource_type {
                return Err(KeystoneError::Normalization(format!(
                    "lid '{}' belongs to type '{}', not '{}'",
                    lid, info.resource_type, resource_type
                )));
            }
            return Ok(key);
        }
        Ok(self.allocate(resource_type, None, lid.to_string()))
    }

    /// Look up an interned server identity without creating it.
    #[must_use]
    pub fn peek(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.by_identity
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|&key| self.resolve(key))
    }

    /// Look up a lid without creating it.
    #[must_use]
    pub fn peek_lid(&self, lid: &str) -> Option<ResourceKey> {
        self.by_lid.get(lid).map(|&key| self.resolve(key))
    }

    /// Follow aliases to the canonical key.
    #[must_use]
    pub fn resolve(&self, key: ResourceKey) -> ResourceKey {
        let mut current = key;
        // Alias chains are acyclic; the bound guards against corruption.
        for _ in 0..=self.aliases.len() {
            match self.aliases.get(&current) {
                Some(&next) => current = next,
                None => break,
            }
        }
        current
    }

    /// Describe a key (after alias resolution).
    #[must_use]
    pub fn describe(&self, key: ResourceKey) -> Option<&KeyInfo> {
        self.keys.get(&self.resolve(key))
    }

    /// Resource type of a key.
    pub fn type_of(&self, key: ResourceKey) -> Result<&str, KeystoneError> {
        self.describe(key)
            .map(|info| info.resource_type.as_str())
            .ok_or(KeystoneError::KeyNotFound(key))
    }

    /// Check if the key (or its canonical target) is known.
    #[must_use]
    pub fn contains(&self, key: ResourceKey) -> bool {
        self.keys.contains_key(&self.resolve(key))
    }

    /// Attach a server id to a local key.
    ///
    /// `has_data` reports whether an existing key carries loaded data. When
    /// `(type, id)` is already interned to such a key the pre-existing record
    /// wins and `IdentityConflict` is returned; the caller must reconcile.
    pub fn merge(
        &mut self,
        local: ResourceKey,
        id: &str,
        has_data: impl Fn(ResourceKey) -> bool,
    ) -> Result<MergeOutcome, KeystoneError> {
        let local = self.resolve(local);
        let info = self
            .keys
            .get(&local)
            .ok_or(KeystoneError::KeyNotFound(local))?
            .clone();

        match info.id.as_deref() {
            Some(current) if current == id => return Ok(MergeOutcome::Unchanged),
            Some(_) => {
                return Err(KeystoneError::IdentityConflict {
                    resource_type: info.resource_type,
                    id: id.to_string(),
                });
            }
            None => {}
        }

        let identity = (info.resource_type.clone(), id.to_string());
        let mut outcome = MergeOutcome::Assigned;

        if let Some(&existing) = self.by_identity.get(&identity) {
            let existing = self.resolve(existing);
            if existing != local {
                if has_data(existing) {
                    return Err(KeystoneError::IdentityConflict {
                        resource_type: info.resource_type,
                        id: id.to_string(),
                    });
                }
                self.retire(existing, local);
                outcome = MergeOutcome::Absorbed { retired: existing };
            }
        }

        if let Some(entry) = self.keys.get_mut(&local) {
            entry.id = Some(id.to_string());
        }
        self.by_identity.insert(identity, local);
        Ok(outcome)
    }

    /// Remove a key. Only legal when no live record is backed by it.
    pub fn forget(&mut self, key: ResourceKey, live: bool) -> Result<KeyInfo, KeystoneError> {
        let key = self.resolve(key);
        if live {
            return Err(KeystoneError::KeyInUse(key));
        }
        let info = self
            .keys
            .remove(&key)
            .ok_or(KeystoneError::KeyNotFound(key))?;

        if let Some(id) = &info.id {
            self.by_identity
                .remove(&(info.resource_type.clone(), id.clone()));
        }
        let lids: Vec<String> = self
            .by_lid
            .iter()
            .filter(|(_, target)| **target == key)
            .map(|(lid, _)| lid.clone())
            .collect();
        for lid in &lids {
            self.by_lid.remove(lid);
        }
        for retired in self.aliases_of(key) {
            self.aliases.remove(&retired);
        }
        Ok(info)
    }

    /// Number of live (non-retired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if the registry holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over live keys in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKey, &KeyInfo)> {
        self.keys.iter().map(|(k, v)| (*k, v))
    }

    fn allocate(&mut self, resource_type: &str, id: Option<String>, lid: String) -> ResourceKey {
        let key = ResourceKey(self.next_key);
        self.next_key = self.next_key.saturating_add(1);
        self.by_lid.insert(lid.clone(), key);
        self.keys.insert(
            key,
            KeyInfo {
                resource_type: resource_type.to_string(),
                id,
                lid,
            },
        );
        key
    }

    fn issue_lid(&mut self, resource_type: &str) -> String {
        loop {
            let lid = generated_lid(resource_type, self.next_lid);
            self.next_lid = self.next_lid.saturating_add(1);
            if !self.by_lid.contains_key(&lid) {
                return lid;
            }
        }
    }

    fn retire(&mut self, retired: ResourceKey, canonical: ResourceKey) {
        if let Some(info) = self.keys.remove(&retired) {
            self.by_lid.insert(info.lid, canonical);
        }
        for alias in self.aliases_of(retired) {
            self.aliases.insert(alias, canonical);
        }
        self.aliases.insert(retired, canonical);
    }

    fn aliases_of(&self, target: ResourceKey) -> Vec<ResourceKey> {
        self.aliases
            .iter()
            .filter(|(_, t)| **t == target)
            .map(|(alias, _)| *alias)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    pub(crate) fn begin(&mut self) {
        self.keys.begin();
        self.by_identity.begin();
        self.by_lid.begin();
        self.aliases.begin();
        self.marks.push((self.next_key, self.next_lid));
    }

    pub(crate) fn commit(&mut self) {
        self.keys.commit();
        self.by_identity.commit();
        self.by_lid.commit();
        self.aliases.commit();
        self.marks.pop();
    }

    pub(crate) fn rollback(&mut self) {
        self.keys.rollback();
        self.by_identity.rollback();
        self.by_lid.rollback();
        self.aliases.rollback();
        if let Some((next_key, next_lid)) = self.marks.pop() {
            self.next_key = next_key;
            self.next_lid = next_lid;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
