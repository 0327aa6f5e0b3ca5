//! # Journal
//!
//! Undo log behind the store's tables.
//!
//! A `JournaledMap` reads like a `BTreeMap`. While a frame is open, the first
//! write to an entry saves that entry's prior value, so rolling back restores
//! exactly the touched entries. A transaction costs what it changes, not what
//! the store holds.
//!
//! Frames nest. Committing an inner frame hands its saved values to the
//! enclosing frame, which keeps its own older copy when it has one.

use std::collections::BTreeMap;
use std::ops::Deref;

/// A `BTreeMap` whose writes can be undone frame by frame.
#[derive(Debug, Clone)]
pub struct JournaledMap<K, V> {
    map: BTreeMap<K, V>,
    frames: Vec<BTreeMap<K, Option<V>>>,
}

impl<K, V> Default for JournaledMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            frames: Vec::new(),
        }
    }
}

impl<K, V> Deref for JournaledMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl<K: Ord + Clone, V: Clone> JournaledMap<K, V> {
    /// Open a frame.
    pub fn begin(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    /// Close the innermost frame, keeping its writes.
    pub fn commit(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if let Some(parent) = self.frames.last_mut() {
            for (key, before) in frame {
                parent.entry(key).or_insert(before);
            }
        }
    }

    /// Close the innermost frame, restoring every entry it touched.
    pub fn rollback(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        for (key, before) in frame {
            match before {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Entries saved by the innermost frame.
    #[must_use]
    pub fn touched(&self) -> usize {
        self.frames.last().map_or(0, BTreeMap::len)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.save(key);
        self.map.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.save(&key);
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.save(key);
        self.map.remove(key)
    }

    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        self.save(&key);
        self.map.entry(key).or_insert_with(default)
    }

    fn save(&mut self, key: &K) {
        let map = &self.map;
        if let Some(frame) = self.frames.last_mut() {
            frame
                .entry(key.clone())
                .or_insert_with(|| map.get(key).cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> JournaledMap<u32, &'static str> {
        let mut map = JournaledMap::default();
        map.insert(1, "one");
        map.insert(2, "two");
        map
    }

    #[test]
    fn writes_outside_a_frame_are_not_saved() {
        let mut map = map();
        assert_eq!(map.touched(), 0);
        map.remove(&1);
        map.rollback();
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn rollback_restores_only_touched_entries() {
        let mut map = map();
        map.begin();
        if let Some(value) = map.get_mut(&1) {
            *value = "uno";
        }
        map.insert(3, "three");
        map.remove(&2);
        map.insert(1, "eins");
        assert_eq!(map.touched(), 3);

        map.rollback();
        assert_eq!(
            map.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(1, "one"), (2, "two")]
        );
    }

    #[test]
    fn commit_keeps_writes() {
        let mut map = map();
        map.begin();
        *map.get_or_insert_with(3, || "three") = "drei";
        map.commit();
        map.rollback();
        assert_eq!(map.get(&3), Some(&"drei"));
    }

    #[test]
    fn inner_rollback_leaves_outer_writes() {
        let mut map = map();
        map.begin();
        map.insert(1, "uno");
        map.begin();
        map.insert(1, "eins");
        map.insert(4, "four");
        map.rollback();
        assert_eq!(map.get(&1), Some(&"uno"));
        assert_eq!(map.get(&4), None);
        map.commit();
        assert_eq!(map.get(&1), Some(&"uno"));
    }

    #[test]
    fn outer_rollback_undoes_committed_inner_frame() {
        let mut map = map();
        map.begin();
        map.insert(1, "uno");
        map.begin();
        map.insert(1, "eins");
        map.remove(&2);
        map.commit();
        assert_eq!(map.touched(), 2);
        map.rollback();
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&2), Some(&"two"));
    }
}
