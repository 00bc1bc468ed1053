//! Last known set of devices for one domain.
//!
//! A [`DeviceRegistry`] holds an immutable [`Snapshot`] behind an
//! [`ArcSwap`]. Readers get an `Arc` to a complete snapshot and never observe
//! a half-populated one; writers build a new snapshot and swap it in whole.
//! The scan coordinator is the only writer of device data, the UI side only
//! changes the selection.
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

/// Records with a stable identity.
pub trait Keyed {
    /// Identity of the record across refreshes.
    type Key: Clone + Debug + Eq + Hash + Send + Sync;
    /// Compute the identity of `self`.
    fn key(&self) -> Self::Key;
}

/// Immutable view of the registry content.
#[derive(Debug)]
pub struct Snapshot<R: Keyed> {
    records: HashMap<R::Key, R>,
    selected: Option<R::Key>,
    revision: u64,
}

impl<R: Keyed> Snapshot<R> {
    fn empty() -> Self {
        Self {
            records: HashMap::new(),
            selected: None,
            revision: 0,
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when there is no record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record with identity `key`.
    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.records.get(key)
    }

    /// `true` when a record with identity `key` exists.
    pub fn contains(&self, key: &R::Key) -> bool {
        self.records.contains_key(key)
    }

    /// All records, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    /// Identity of the selected record.
    pub fn selected_key(&self) -> Option<&R::Key> {
        self.selected.as_ref()
    }

    /// The selected record.
    pub fn selected(&self) -> Option<&R> {
        self.selected.as_ref().and_then(|k| self.records.get(k))
    }

    /// Number of device data replacements since creation.
    ///
    /// 0 means the registry was never filled by a scan.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl<R: Keyed + Clone> Snapshot<R> {
    /// Records sorted with `compare`.
    pub fn sorted_by<F>(&self, compare: F) -> Vec<R>
    where
        F: FnMut(&R, &R) -> std::cmp::Ordering,
    {
        let mut res: Vec<R> = self.records.values().cloned().collect();
        res.sort_by(compare);
        res
    }
}

/// In-memory snapshot holder with atomic replace.
#[derive(Debug)]
pub struct DeviceRegistry<R: Keyed> {
    current: ArcSwap<Snapshot<R>>,
}

impl<R: Keyed> Default for DeviceRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Index records by key. With duplicated keys the first record wins.
fn index<R: Keyed>(records: Vec<R>) -> HashMap<R::Key, R> {
    let mut res = HashMap::with_capacity(records.len());
    for record in records {
        let key = record.key();
        if res.contains_key(&key) {
            debug!("Ignoring duplicated key {:?}", key);
            continue;
        }
        res.insert(key, record);
    }
    res
}

impl<R: Keyed> DeviceRegistry<R> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<Snapshot<R>> {
        self.current.load_full()
    }

    /// Replace all records and clear the selection.
    pub fn replace(&self, records: Vec<R>) {
        let revision = self.current.load().revision + 1;
        let records = index(records);
        info!("Registry replaced with {} records", records.len());
        self.current.store(Arc::new(Snapshot {
            records,
            selected: None,
            revision,
        }));
    }

    /// Replace all records, keeping `preserve_selection` selected if it
    /// still exists in `records`.
    ///
    /// Fields of the new records win over the previous ones.
    pub fn merge(&self, records: Vec<R>, preserve_selection: Option<&R::Key>) {
        let revision = self.current.load().revision + 1;
        let records = index(records);
        let selected = preserve_selection
            .filter(|k| records.contains_key(k))
            .cloned();
        if preserve_selection.is_some() && selected.is_none() {
            debug!("Selected record {:?} vanished", preserve_selection);
        }
        info!("Registry merged with {} records", records.len());
        self.current.store(Arc::new(Snapshot {
            records,
            selected,
            revision,
        }));
    }
}

impl<R: Keyed + Clone> DeviceRegistry<R> {
    /// Select the record with identity `key`, or clear the selection with `None`.
    ///
    /// Returns `false` (and leaves the selection untouched) when `key` is unknown.
    pub fn select(&self, key: Option<R::Key>) -> bool {
        if let Some(ref k) = key {
            if !self.current.load().contains(k) {
                return false;
            }
        }
        self.current.rcu(|old| Snapshot {
            records: old.records.clone(),
            selected: key.clone(),
            revision: old.revision,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Dev {
        id: &'static str,
        level: u8,
    }

    impl Keyed for Dev {
        type Key = &'static str;
        fn key(&self) -> &'static str {
            self.id
        }
    }

    fn devs(spec: &[(&'static str, u8)]) -> Vec<Dev> {
        spec.iter().map(|&(id, level)| Dev { id, level }).collect()
    }

    mod should {
        use super::*;
        use test_log::test;

        #[test]
        fn start_empty_and_unrevised() {
            let reg: DeviceRegistry<Dev> = DeviceRegistry::new();
            let snap = reg.get();
            assert!(snap.is_empty());
            assert_eq!(snap.revision(), 0);
            assert!(snap.selected().is_none());
        }

        #[test]
        fn keep_selection_when_key_survives_merge() {
            let reg = DeviceRegistry::new();
            reg.replace(devs(&[("a", 1), ("b", 2)]));
            assert!(reg.select(Some("b")));
            let selected = reg.get().selected_key().cloned();
            reg.merge(devs(&[("b", 7), ("c", 3)]), selected.as_ref());
            let snap = reg.get();
            assert_eq!(snap.selected(), Some(&Dev { id: "b", level: 7 }));
            assert!(!snap.contains(&"a"));
            assert_eq!(snap.revision(), 2);
        }

        #[test]
        fn clear_selection_when_key_vanishes() {
            let reg = DeviceRegistry::new();
            reg.replace(devs(&[("a", 1)]));
            reg.select(Some("a"));
            reg.merge(devs(&[("b", 1)]), Some(&"a"));
            assert!(reg.get().selected_key().is_none());
        }

        #[test]
        fn merge_is_idempotent_for_unchanged_set() {
            let reg = DeviceRegistry::new();
            reg.replace(devs(&[("a", 1), ("b", 2)]));
            reg.select(Some("a"));
            for _ in 0..3 {
                let selected = reg.get().selected_key().cloned();
                reg.merge(devs(&[("a", 1), ("b", 2)]), selected.as_ref());
            }
            let snap = reg.get();
            let mut keys: Vec<_> = snap.records().map(|d| d.id).collect();
            keys.sort();
            assert_eq!(keys, ["a", "b"]);
            assert_eq!(snap.selected_key(), Some(&"a"));
        }

        #[test]
        fn refuse_to_select_unknown_key() {
            let reg = DeviceRegistry::new();
            reg.replace(devs(&[("a", 1)]));
            assert!(!reg.select(Some("zz")));
            assert!(reg.select(None));
        }

        #[test]
        fn keep_first_record_of_duplicated_keys() {
            let reg = DeviceRegistry::new();
            reg.replace(devs(&[("a", 1), ("a", 9)]));
            assert_eq!(reg.get().get(&"a").map(|d| d.level), Some(1));
        }

        #[test]
        fn give_old_readers_a_consistent_snapshot() {
            let reg = DeviceRegistry::new();
            reg.replace(devs(&[("a", 1), ("b", 2)]));
            let old = reg.get();
            reg.replace(devs(&[("c", 3)]));
            assert_eq!(old.len(), 2);
            assert_eq!(reg.get().len(), 1);
        }
    }
}
