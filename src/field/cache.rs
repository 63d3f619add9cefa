//! LRU cache of built [`Field`]s keyed by [`FieldId`], with at-most-one
//! concurrent build per id.
//!
//! A field is expensive enough to build that two movement tasks wanting
//! the same flow field in the same tick must not duplicate the work.
//! Grounded on a single-writer `FlowField` cache pattern, generalized here
//! to a shared, lock-guarded LRU so concurrent [`crate::scheduler`] workers
//! can share one build.

use super::{Field, FieldId};
use crate::layer::NavLayer;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

struct Inner {
    map: FxHashMap<FieldId, Field>,
    order: VecDeque<FieldId>,
    building: FxHashSet<FieldId>,
}

/// A bounded, thread-shared field cache.
pub struct FieldCache {
    capacity: usize,
    inner: Mutex<Inner>,
    ready: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cumulative hit/miss counts since the last [`FieldCache::take_stats`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl FieldCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                map: FxHashMap::default(),
                order: VecDeque::new(),
                building: FxHashSet::default(),
            }),
            ready: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a cached field without touching the build path.
    pub fn get(&self, id: FieldId) -> Option<Field> {
        let mut inner = self.inner.lock().unwrap();
        let found = inner.map.get(&id).cloned();
        if found.is_some() {
            touch(&mut inner.order, id);
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Returns the cached field for `id`, or builds it via `build` if it
    /// isn't cached. If another caller is already building the same `id`,
    /// blocks until that build publishes its result instead of racing it.
    pub fn get_or_build(&self, id: FieldId, build: impl FnOnce() -> Field) -> Field {
        loop {
            let mut inner = self.inner.lock().unwrap();
            if let Some(f) = inner.map.get(&id) {
                touch(&mut inner.order, id);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return f.clone();
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            if inner.building.insert(id) {
                drop(inner);
                let field = build();
                let mut inner = self.inner.lock().unwrap();
                inner.building.remove(&id);
                self.insert_locked(&mut inner, id, field.clone());
                drop(inner);
                self.ready.notify_all();
                return field;
            }
            let _unused = self.ready.wait(inner).unwrap();
        }
    }

    /// Returns cumulative hit/miss counts and resets them to zero.
    ///
    /// Called once per tick by [`crate::core::NavigationCore`]'s
    /// `TickMetrics` to report a per-tick hit rate rather than a
    /// since-process-start cumulative one.
    pub fn take_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.swap(0, Ordering::Relaxed),
            misses: self.misses.swap(0, Ordering::Relaxed),
        }
    }

    /// Evicts every cached field whose `chunk()`/`layer_index()` match, used
    /// when a chunk's cost layer changes and its fields go stale.
    pub fn invalidate_chunk(&self, layer: NavLayer, chunk: (u32, u32)) {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<FieldId> = inner
            .map
            .keys()
            .copied()
            .filter(|id| id.chunk() == chunk && id.layer_index() == layer.as_index() as u8)
            .collect();
        for id in stale {
            inner.map.remove(&id);
            inner.order.retain(|&o| o != id);
        }
    }

    /// Drops a single cached entry, used for fields whose source data (e.g.
    /// live entity positions) isn't captured by chunk/layer invalidation.
    pub fn remove(&self, id: FieldId) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(&id);
        inner.order.retain(|&o| o != id);
    }

    /// Evicts every cached field for `layer`.
    pub fn flush_layer(&self, layer: NavLayer) {
        let mut inner = self.inner.lock().unwrap();
        let layer_idx = layer.as_index() as u8;
        let stale: Vec<FieldId> = inner.map.keys().copied().filter(|id| id.layer_index() == layer_idx).collect();
        for id in stale {
            inner.map.remove(&id);
            inner.order.retain(|&o| o != id);
        }
    }

    /// Number of fields currently cached.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_locked(&self, inner: &mut Inner, id: FieldId, field: Field) {
        if !inner.map.contains_key(&id) {
            inner.order.push_back(id);
        } else {
            touch(&mut inner.order, id);
        }
        inner.map.insert(id, field);
        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

fn touch(order: &mut VecDeque<FieldId>, id: FieldId) {
    if let Some(pos) = order.iter().position(|&o| o == id) {
        order.remove(pos);
    }
    order.push_back(id);
}
