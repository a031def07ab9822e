//! In-memory index of a cache directory: slot allocation, key lookup, pins, and eviction order.

use super::{Policy, Record};
use shoal_utils::CacheKey;
use std::collections::{BTreeMap, HashMap};

struct Indexed {
    record: Record,
    tick: u64,
    pins: u32,
    /// Unlinked while pinned; freed on the last dereference.
    doomed: bool,
    /// Slots of replaced objects still pinned through this key.
    retired: Vec<u32>,
}

pub(super) struct Index {
    policy: Policy,
    used: Vec<bool>,
    in_use: u32,
    /// Candidate free slots (lowest on top). May hold slots that were claimed since they were
    /// pushed; those are skipped when popped.
    free: Vec<u32>,
    records: HashMap<CacheKey, Indexed>,
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
    bytes: u64,
}

impl Index {
    pub(super) fn new(slots: u32, policy: Policy) -> Self {
        Self {
            policy,
            used: vec![false; slots as usize],
            in_use: 0,
            free: (0..slots).rev().collect(),
            records: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            bytes: 0,
        }
    }

    pub(super) fn slots(&self) -> u32 {
        self.used.len() as u32
    }

    /// Slots reserved or holding an object.
    pub(super) fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Bytes of indexed objects.
    pub(super) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(super) fn len(&self) -> usize {
        self.records.len()
    }

    /// Reserve the lowest free slot.
    pub(super) fn reserve(&mut self) -> Option<u32> {
        while let Some(fileno) = self.free.pop() {
            if !self.used[fileno as usize] {
                self.mark(fileno);
                return Some(fileno);
            }
        }
        None
    }

    /// Reserve a specific slot, returning false if it is already in use.
    pub(super) fn claim(&mut self, fileno: u32) -> bool {
        match self.used.get(fileno as usize) {
            Some(false) => {
                self.mark(fileno);
                true
            }
            _ => false,
        }
    }

    fn mark(&mut self, fileno: u32) {
        self.used[fileno as usize] = true;
        self.in_use += 1;
    }

    /// Return a slot to the free list.
    pub(super) fn release(&mut self, fileno: u32) {
        let used = &mut self.used[fileno as usize];
        assert!(*used, "slot {fileno} released twice");
        *used = false;
        self.in_use -= 1;
        self.free.push(fileno);
    }

    pub(super) fn contains(&self, key: &CacheKey) -> bool {
        self.records.contains_key(key)
    }

    /// Visible record for `key` (unlinked objects awaiting their last dereference are hidden).
    pub(super) fn get(&self, key: &CacheKey) -> Option<&Record> {
        self.records
            .get(key)
            .filter(|indexed| !indexed.doomed)
            .map(|indexed| &indexed.record)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Index `record` (whose slot must already be reserved).
    ///
    /// Returns the slots freed by replacing a previous object with the same key.
    pub(super) fn insert(&mut self, record: Record) -> Vec<u32> {
        debug_assert!(self.used[record.fileno as usize]);
        let tick = self.next_tick();
        self.bytes += record.swap_file_size();
        self.order.insert(tick, record.key);
        let key = record.key;
        let fresh = Indexed {
            record,
            tick,
            pins: 0,
            doomed: false,
            retired: Vec::new(),
        };
        let Some(mut old) = self.records.insert(key, fresh) else {
            return Vec::new();
        };

        self.order.remove(&old.tick);
        self.bytes -= old.record.swap_file_size();
        let mut freed = Vec::new();
        if old.pins == 0 {
            freed.push(old.record.fileno);
            freed.append(&mut old.retired);
        } else if let Some(indexed) = self.records.get_mut(&key) {
            indexed.pins = old.pins;
            indexed.retired = old.retired;
            indexed.retired.push(old.record.fileno);
        }
        for fileno in &freed {
            self.release(*fileno);
        }
        freed
    }

    /// Pin `key`, refreshing its position under [Policy::Lru].
    pub(super) fn reference(&mut self, key: &CacheKey) -> bool {
        let refresh = self.policy == Policy::Lru;
        let tick = if refresh { self.next_tick() } else { 0 };
        let Some(indexed) = self.records.get_mut(key).filter(|i| !i.doomed) else {
            return false;
        };
        indexed.pins += 1;
        if refresh {
            self.order.remove(&indexed.tick);
            indexed.tick = tick;
            self.order.insert(tick, *key);
        }
        true
    }

    /// Unpin `key`.
    ///
    /// Returns whether the key is still indexed and the slots freed by this release.
    pub(super) fn dereference(&mut self, key: &CacheKey) -> (bool, Vec<u32>) {
        let Some(indexed) = self.records.get_mut(key) else {
            return (false, Vec::new());
        };
        indexed.pins = indexed.pins.saturating_sub(1);
        if indexed.pins > 0 {
            return (!indexed.doomed, Vec::new());
        }
        let mut freed = std::mem::take(&mut indexed.retired);
        let doomed = indexed.doomed;
        for fileno in &freed {
            self.release(*fileno);
        }
        if doomed {
            freed.extend(self.remove(key));
        }
        (!doomed, freed)
    }

    /// Unlink `key`, returning the freed slots (empty when deferred by a pin), or `None` if the
    /// key is not indexed.
    pub(super) fn unlink(&mut self, key: &CacheKey) -> Option<Vec<u32>> {
        let indexed = self.records.get_mut(key).filter(|i| !i.doomed)?;
        if indexed.pins > 0 {
            indexed.doomed = true;
            return Some(Vec::new());
        }
        Some(self.remove(key))
    }

    fn remove(&mut self, key: &CacheKey) -> Vec<u32> {
        let Some(indexed) = self.records.remove(key) else {
            return Vec::new();
        };
        self.order.remove(&indexed.tick);
        self.bytes -= indexed.record.swap_file_size();
        let mut freed = indexed.retired;
        freed.push(indexed.record.fileno);
        for fileno in &freed {
            self.release(*fileno);
        }
        freed
    }

    /// Remove the first unpinned object in eviction order.
    pub(super) fn evict(&mut self) -> Option<(CacheKey, Vec<u32>)> {
        let victim = self
            .order
            .values()
            .find(|key| {
                self.records
                    .get(*key)
                    .is_some_and(|indexed| indexed.pins == 0 && !indexed.doomed)
            })
            .copied()?;
        Some((victim, self.remove(&victim)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapdir::EntryFlags;

    fn record(index: &mut Index, name: &str) -> Record {
        let fileno = index.reserve().expect("slot available");
        Record {
            key: CacheKey::from_request(b"GET", name.as_bytes()),
            fileno,
            header_len: 100,
            object_size: 10,
            timestamp: -1,
            lastref: -1,
            expires: -1,
            lastmod: -1,
            refcount: 0,
            flags: EntryFlags::empty(),
        }
    }

    #[test]
    fn test_reserve_lowest_first() {
        let mut index = Index::new(3, Policy::Lru);
        assert_eq!(index.reserve(), Some(0));
        assert_eq!(index.reserve(), Some(1));
        index.release(0);
        assert_eq!(index.reserve(), Some(0));
        assert_eq!(index.reserve(), Some(2));
        assert_eq!(index.reserve(), None);
        assert_eq!(index.in_use(), 3);
    }

    #[test]
    fn test_claimed_slot_skipped() {
        let mut index = Index::new(2, Policy::Lru);
        assert!(index.claim(0));
        assert!(!index.claim(0));
        assert!(!index.claim(7));
        assert_eq!(index.reserve(), Some(1));
        assert_eq!(index.reserve(), None);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release() {
        let mut index = Index::new(2, Policy::Lru);
        let fileno = index.reserve().unwrap();
        index.release(fileno);
        index.release(fileno);
    }

    #[test]
    fn test_replace_frees_old_slot() {
        let mut index = Index::new(4, Policy::Lru);
        let first = record(&mut index, "a");
        let mut second = record(&mut index, "a");
        second.object_size = 20;
        assert!(index.insert(first.clone()).is_empty());
        assert_eq!(index.insert(second.clone()), vec![first.fileno]);
        assert_eq!(index.get(&first.key), Some(&second));
        assert_eq!(index.in_use(), 1);
        assert_eq!(index.bytes(), 120);
    }

    #[test]
    fn test_replace_while_pinned_defers_free() {
        let mut index = Index::new(4, Policy::Lru);
        let first = record(&mut index, "a");
        let second = record(&mut index, "a");
        index.insert(first.clone());
        assert!(index.reference(&first.key));
        assert!(index.insert(second.clone()).is_empty());
        assert_eq!(index.in_use(), 2);

        let (indexed, freed) = index.dereference(&first.key);
        assert!(indexed);
        assert_eq!(freed, vec![first.fileno]);
        assert_eq!(index.in_use(), 1);
    }

    #[test]
    fn test_unlink_while_pinned_is_deferred() {
        let mut index = Index::new(4, Policy::Lru);
        let a = record(&mut index, "a");
        index.insert(a.clone());
        assert!(index.reference(&a.key));
        assert!(index.reference(&a.key));

        assert_eq!(index.unlink(&a.key), Some(Vec::new()));
        assert!(index.get(&a.key).is_none());
        assert!(!index.reference(&a.key));
        assert_eq!(index.unlink(&a.key), None);

        assert_eq!(index.dereference(&a.key), (false, Vec::new()));
        assert_eq!(index.dereference(&a.key), (false, vec![a.fileno]));
        assert_eq!(index.len(), 0);
        assert_eq!(index.in_use(), 0);
        assert_eq!(index.bytes(), 0);
    }

    #[test]
    fn test_evict_lru_skips_pinned() {
        let mut index = Index::new(4, Policy::Lru);
        let a = record(&mut index, "a");
        let b = record(&mut index, "b");
        let c = record(&mut index, "c");
        index.insert(a.clone());
        index.insert(b.clone());
        index.insert(c.clone());

        // Touch "a" so "b" becomes the oldest, then pin "b"
        assert!(index.reference(&a.key));
        assert_eq!(index.dereference(&a.key), (true, Vec::new()));
        assert!(index.reference(&b.key));

        assert_eq!(index.evict(), Some((c.key, vec![c.fileno])));
        assert_eq!(index.evict(), Some((a.key, vec![a.fileno])));
        assert_eq!(index.evict(), None);
    }

    #[test]
    fn test_evict_fifo_ignores_references() {
        let mut index = Index::new(4, Policy::Fifo);
        let a = record(&mut index, "a");
        let b = record(&mut index, "b");
        index.insert(a.clone());
        index.insert(b.clone());
        assert!(index.reference(&a.key));
        index.dereference(&a.key);

        assert_eq!(index.evict().map(|(key, _)| key), Some(a.key));
        assert_eq!(index.evict().map(|(key, _)| key), Some(b.key));
    }
}
