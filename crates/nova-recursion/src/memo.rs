//! Per-thread memoization of guarded results.
//!
//! A memoized value remembers the frames it depends on: every frame below it on which recursion
//! was prevented while it was computed. The value is only meaningful while all of those frames
//! are still active, so the owning stack registers each entry with its highest dependency and
//! drops it as soon as that frame exits. Entries without dependencies survive until the stack is
//! empty.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use crate::key::GuardKey;

/// A frame on which recursion was prevented, identified by its stack position and activation.
///
/// Positions are reused after a frame exits; the activation id is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Dependency {
    pub(crate) position: usize,
    pub(crate) activation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MemoId(u64);

pub(crate) struct MemoEntry {
    pub(crate) id: MemoId,
    pub(crate) key: GuardKey,
    pub(crate) value: Rc<dyn Any>,
    /// Sorted by position.
    pub(crate) dependencies: Vec<Dependency>,
}

/// A memo entry copied out of the table so its key can be compared without holding a borrow.
pub(crate) struct MemoCandidate {
    pub(crate) id: MemoId,
    pub(crate) key: GuardKey,
    pub(crate) value: Rc<dyn Any>,
}

#[derive(Default)]
pub(crate) struct MemoTable {
    buckets: HashMap<u64, Vec<MemoEntry>>,
    next_id: u64,
    len: usize,
}

impl MemoTable {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Entries whose key may equal `key`, newest first.
    pub(crate) fn candidates(&self, key: &GuardKey) -> Vec<MemoCandidate> {
        let Some(bucket) = self.buckets.get(&key.hash()) else {
            return Vec::new();
        };
        bucket
            .iter()
            .rev()
            .filter(|entry| entry.key.same_bucket(key))
            .map(|entry| MemoCandidate {
                id: entry.id,
                key: entry.key.clone(),
                value: Rc::clone(&entry.value),
            })
            .collect()
    }

    pub(crate) fn get(&self, hash: u64, id: MemoId) -> Option<&MemoEntry> {
        self.buckets.get(&hash)?.iter().find(|entry| entry.id == id)
    }

    /// Insert a new entry, evicting the oldest entries of its bucket beyond `max_per_key`.
    ///
    /// Returns the new id and the evicted entries, which the caller drops once the stack borrow
    /// is released.
    pub(crate) fn insert(
        &mut self,
        key: GuardKey,
        value: Rc<dyn Any>,
        dependencies: Vec<Dependency>,
        max_per_key: usize,
    ) -> (MemoId, Vec<MemoEntry>) {
        self.next_id += 1;
        let id = MemoId(self.next_id);
        let bucket = self.buckets.entry(key.hash()).or_default();

        let excess = (bucket.len() + 1).saturating_sub(max_per_key.max(1));
        let evicted: Vec<MemoEntry> = bucket.drain(..excess.min(bucket.len())).collect();
        bucket.push(MemoEntry {
            id,
            key,
            value,
            dependencies,
        });

        self.len = self.len + 1 - evicted.len();
        (id, evicted)
    }

    /// Remove the given entries. Ids that are no longer present are ignored.
    pub(crate) fn remove(&mut self, ids: &[(u64, MemoId)]) -> Vec<MemoEntry> {
        let mut removed = Vec::new();
        for &(hash, id) in ids {
            let Some(bucket) = self.buckets.get_mut(&hash) else {
                continue;
            };
            if let Some(index) = bucket.iter().position(|entry| entry.id == id) {
                removed.push(bucket.remove(index));
            }
            if bucket.is_empty() {
                self.buckets.remove(&hash);
            }
        }
        self.len -= removed.len();
        removed
    }

    pub(crate) fn clear(&mut self) -> Vec<MemoEntry> {
        self.len = 0;
        self.buckets.drain().flat_map(|(_, bucket)| bucket).collect()
    }
}
