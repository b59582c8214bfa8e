//! Weak index of registered buffers and listeners.
//!
//! Objects are bucketed by `id mod N`. The table never owns its entries:
//! it holds weak references, and the owning handles unregister themselves
//! when the last one drops, so a dead entry is only ever visible for the
//! moment between the last strong count hitting zero and the drop glue
//! taking the global lock.
//!
//! Names are not keys and need not be unique; name lookup scans the whole
//! table and ambiguity is detected lazily, at lookup time.

use std::sync::{Arc, Weak};

use crate::Id;

const MIN_BUCKETS: usize = 64;
const TARGET_LOAD: usize = 4;
const MAX_DEPTH: usize = 30;

struct Entry<T> {
    id: Id,
    name: Option<Box<[u8]>>,
    object: Weak<T>,
}

/// Outcome of a name scan.
pub(crate) enum NameLookup<T> {
    Missing,
    Unique(Arc<T>),
    Ambiguous,
}

pub(crate) struct IdTable<T> {
    buckets: Vec<Vec<Entry<T>>>,
    count: usize,
}

impl<T> IdTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: (0..MIN_BUCKETS).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    #[inline]
    fn bucket_of(&self, id: Id) -> usize {
        (id % self.buckets.len() as u64) as usize
    }

    pub(crate) fn insert(&mut self, id: Id, name: Option<&[u8]>, object: &Arc<T>) {
        if self.count + 1 > TARGET_LOAD * self.buckets.len() {
            self.rehash(self.buckets.len() * 2);
        }
        let at = self.bucket_of(id);
        self.buckets[at].push(Entry {
            id,
            name: name.map(Into::into),
            object: Arc::downgrade(object),
        });
        self.count += 1;
        if self.buckets[at].len() > MAX_DEPTH {
            self.rehash(self.buckets.len() * 2);
        }
        debug_assert!(self.count <= TARGET_LOAD * self.buckets.len());
    }

    pub(crate) fn remove(&mut self, id: Id) {
        let at = self.bucket_of(id);
        let before = self.buckets[at].len();
        self.buckets[at].retain(|e| e.id != id);
        self.count -= before - self.buckets[at].len();

        while self.count * 10 < self.buckets.len()
            && 2 * self.count > MIN_BUCKETS
            && self.buckets.len() / 2 >= MIN_BUCKETS
        {
            let target = self.buckets.len() / 2;
            self.rehash(target);
        }
    }

    pub(crate) fn get(&self, id: Id) -> Option<Arc<T>> {
        self.buckets[self.bucket_of(id)]
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.object.upgrade())
    }

    /// Scans every entry for the given name. More than one live match is
    /// ambiguous; dead entries do not count.
    pub(crate) fn find_by_name(&self, name: &[u8]) -> NameLookup<T> {
        let mut found: Option<Arc<T>> = None;
        for bucket in &self.buckets {
            for entry in bucket {
                if entry.name.as_deref() == Some(name) {
                    if let Some(object) = entry.object.upgrade() {
                        if found.is_some() {
                            return NameLookup::Ambiguous;
                        }
                        found = Some(object);
                    }
                }
            }
        }
        match found {
            Some(object) => NameLookup::Unique(object),
            None => NameLookup::Missing,
        }
    }

    /// Upgrades every live entry, in no particular order.
    pub(crate) fn collect(&self) -> Vec<Arc<T>> {
        self.buckets
            .iter()
            .flatten()
            .filter_map(|e| e.object.upgrade())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    pub(crate) fn max_depth(&self) -> usize {
        self.buckets.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Replaces the table wholesale, replaying every entry. Lookups hold
    /// the global lock, so nothing observes the intermediate state.
    fn rehash(&mut self, new_size: usize) {
        let new_size = new_size.max(MIN_BUCKETS);
        let mut fresh: Vec<Vec<Entry<T>>> = (0..new_size).map(|_| Vec::new()).collect();
        for bucket in self.buckets.drain(..) {
            for entry in bucket {
                fresh[(entry.id % new_size as u64) as usize].push(entry);
            }
        }
        self.buckets = fresh;
    }
}
