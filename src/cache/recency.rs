//! In-memory recency index for the on-disk object cache.
//!
//! A doubly-linked LRU list (slab-allocated nodes, `HashMap` for lookup) in
//! which the head is the most recently touched entry and the tail the oldest.
//! Insert, promote and delete are O(1); ordered traversal is only needed on
//! the eviction path.

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;

const NIL: usize = usize::MAX;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One cached object as seen by the recency index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Registry-relative cache path, e.g. `docker.io/library/ubuntu/...`.
    pub path: String,
    /// Object size in bytes, as accounted against the cache quota.
    pub size: u64,
}

/// Verdict returned by a [`RecencyIndex::range`] callback for each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Leave the entry in place and continue with the next-newer one.
    Keep,
    /// Unlink the entry from the index and continue.
    Evict,
    /// Leave the entry in place and end the traversal.
    Stop,
}

// ---------------------------------------------------------------------------
// RecencyIndex
// ---------------------------------------------------------------------------

struct Node {
    entry: Entry,
    /// Newer neighbour (towards the head).
    prev: usize,
    /// Older neighbour (towards the tail).
    next: usize,
}

struct Inner {
    nodes: Vec<Node>,
    free: Vec<usize>,
    map: HashMap<String, usize>,
    head: usize,
    tail: usize,
}

/// Mutex-serialized LRU index over `(path, size)` entries.
///
/// The mutex is held for the full duration of every operation, including the
/// whole of [`range`](Self::range). Callbacks must not re-enter the index;
/// file-system work (unlinking evicted files) is fine.
pub struct RecencyIndex {
    inner: Mutex<Inner>,
}

impl RecencyIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                free: Vec::new(),
                map: HashMap::new(),
                head: NIL,
                tail: NIL,
            }),
        }
    }

    /// Insert `entry` at the head, or overwrite and promote an existing entry
    /// with the same path. Returns the previous entry when one was replaced.
    pub fn insert_or_replace(&self, entry: Entry) -> (Option<Entry>, bool) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.map.get(&entry.path).copied() {
            let old = std::mem::replace(&mut inner.nodes[idx].entry, entry);
            inner.unlink(idx);
            inner.push_front(idx);
            (Some(old), true)
        } else {
            let path = entry.path.clone();
            let idx = inner.alloc(entry);
            inner.map.insert(path, idx);
            inner.push_front(idx);
            (None, false)
        }
    }

    /// Promote an existing entry to the head without inserting anything.
    /// Returns whether the path was present.
    pub fn touch(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.get(path).copied() {
            Some(idx) => {
                inner.unlink(idx);
                inner.push_front(idx);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `path`. Returns whether it was found.
    pub fn delete(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.remove(path) {
            Some(idx) => {
                inner.unlink(idx);
                inner.free.push(idx);
                true
            }
            None => false,
        }
    }

    /// Visit entries from the oldest towards the newest. The callback decides
    /// per entry whether to keep it, evict it (unlink during traversal) or
    /// stop; a returned error aborts the traversal and propagates.
    pub fn range<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Entry) -> Result<Visit>,
    {
        let mut inner = self.inner.lock();
        let mut idx = inner.tail;
        while idx != NIL {
            let newer = inner.nodes[idx].prev;
            match f(&inner.nodes[idx].entry)? {
                Visit::Keep => {}
                Visit::Stop => return Ok(()),
                Visit::Evict => {
                    let path = std::mem::take(&mut inner.nodes[idx].entry.path);
                    inner.map.remove(&path);
                    inner.unlink(idx);
                    inner.free.push(idx);
                }
            }
            idx = newer;
        }
        Ok(())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecencyIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn alloc(&mut self, entry: Entry) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Node {
                    entry,
                    prev: NIL,
                    next: NIL,
                };
                idx
            }
            None => {
                self.nodes.push(Node {
                    entry,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
