//! Argus store: change-detecting versioned cache and coalescing delta queue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use argus_core::{meta, Delta, ObjectKey, RawObject};
use rustc_hash::FxHashMap;

/// What the cache remembers per object: the last-seen version ordinal and
/// the content hash (version blanked), plus the object itself so workers
/// can re-read it without another round trip.
#[derive(Debug, Clone)]
struct CachedObject {
    version: u64,
    hash: [u8; 32],
    object: Arc<RawObject>,
}

/// Per-resource-type store keyed by namespace/name.
///
/// Safe for concurrent use by the informer task and worker tasks; all
/// operations take `&self`. `is_newer` is the idempotence gate: replayed
/// or out-of-order deliveries never produce a second dispatch.
#[derive(Default)]
pub struct VersionedCache {
    inner: Mutex<FxHashMap<ObjectKey, CachedObject>>,
}

impl VersionedCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(obj: &RawObject) -> Result<(ObjectKey, CachedObject)> {
        let key = ObjectKey::from_object(obj)?;
        let version = meta::resource_version_ordinal(obj)?;
        let hash = meta::content_hash(obj)?;
        Ok((key, CachedObject { version, hash, object: Arc::new(obj.clone()) }))
    }

    pub fn add(&self, obj: &RawObject) -> Result<()> {
        let (key, cached) = Self::entry_for(obj)?;
        self.inner.lock().unwrap().insert(key, cached);
        Ok(())
    }

    /// Same write path as `add`; split so call sites read as intended.
    pub fn update(&self, obj: &RawObject) -> Result<()> {
        self.add(obj)
    }

    pub fn delete(&self, obj: &RawObject) -> Result<()> {
        let key = ObjectKey::from_object(obj)?;
        self.inner.lock().unwrap().remove(&key);
        Ok(())
    }

    pub fn delete_by_key(&self, key: &ObjectKey) {
        self.inner.lock().unwrap().remove(key);
    }

    pub fn get(&self, obj: &RawObject) -> Result<Option<Arc<RawObject>>> {
        let key = ObjectKey::from_object(obj)?;
        Ok(self.get_by_key(&key))
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<RawObject>> {
        self.inner.lock().unwrap().get(key).map(|c| Arc::clone(&c.object))
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<RawObject>> {
        self.inner.lock().unwrap().values().map(|c| Arc::clone(&c.object)).collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap the whole content for a freshly listed object set.
    /// Returns the keys that were cached but are absent from the new list;
    /// callers dispatch deletes for those to reconcile external state.
    pub fn replace(&self, objs: &[RawObject]) -> Result<Vec<ObjectKey>> {
        let mut next: FxHashMap<ObjectKey, CachedObject> = FxHashMap::default();
        for obj in objs {
            let (key, cached) = Self::entry_for(obj)?;
            next.insert(key, cached);
        }
        let mut inner = self.inner.lock().unwrap();
        let evicted = inner.keys().filter(|k| !next.contains_key(*k)).cloned().collect();
        *inner = next;
        Ok(evicted)
    }

    /// Two-stage staleness check.
    ///
    /// Absent key: unconditionally newer. Otherwise the incoming version
    /// ordinal is compared first (lower-or-equal rejects without hashing);
    /// only a strictly greater version pays for a content hash. An equal
    /// hash is "not newer" (a version bump without a content change), but
    /// the cached ordinal still advances so the pre-filter keeps working.
    ///
    /// Version-parse and hashing failures propagate; they are never
    /// swallowed into a false.
    pub fn is_newer(&self, obj: &RawObject) -> Result<bool> {
        let key = ObjectKey::from_object(obj)?;
        let version = meta::resource_version_ordinal(obj)?;
        let mut inner = self.inner.lock().unwrap();
        let Some(cached) = inner.get_mut(&key) else {
            return Ok(true);
        };
        if version <= cached.version {
            return Ok(false);
        }
        let hash = meta::content_hash(obj)?;
        if hash == cached.hash {
            cached.version = version;
            return Ok(false);
        }
        Ok(true)
    }
}

/// Coalescing queue keyed by object identity with FIFO order across keys
/// and fixed capacity: a burst of deltas for one key collapses to the
/// newest one before anyone processes the batch.
pub struct DeltaFifo {
    map: FxHashMap<ObjectKey, Delta>,
    order: VecDeque<ObjectKey>,
    cap: usize,
    dropped: u64,
}

impl DeltaFifo {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap, dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, delta: Delta) -> Result<()> {
        let key = delta.key()?;
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    metrics::counter!("argus_delta_fifo_dropped_total", 1u64);
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, delta);
        Ok(())
    }

    /// Drain all currently coalesced deltas, oldest key first.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::DeltaKind;
    use serde_json::json;

    fn obj(name: &str, rv: &str, payload: u64) -> RawObject {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default", "resourceVersion": rv},
            "data": {"value": payload}
        })
    }

    #[test]
    fn absent_key_is_newer() {
        let cache = VersionedCache::new();
        assert!(cache.is_newer(&obj("x", "1", 1)).unwrap());
    }

    #[test]
    fn lower_or_equal_version_rejected_without_hashing() {
        let cache = VersionedCache::new();
        cache.add(&obj("x", "5", 1)).unwrap();
        // Equal version, different content: still rejected (version pre-filter).
        assert!(!cache.is_newer(&obj("x", "5", 2)).unwrap());
        assert!(!cache.is_newer(&obj("x", "4", 2)).unwrap());
    }

    #[test]
    fn version_bump_without_content_change_is_not_newer_but_advances() {
        let cache = VersionedCache::new();
        cache.add(&obj("x", "1", 7)).unwrap();
        assert!(!cache.is_newer(&obj("x", "2", 7)).unwrap());
        // The ordinal advanced to 2: a replay at 2 with changed content is stale now.
        assert!(!cache.is_newer(&obj("x", "2", 8)).unwrap());
        // Version 3 with changed content passes.
        assert!(cache.is_newer(&obj("x", "3", 8)).unwrap());
    }

    #[test]
    fn non_numeric_version_errors() {
        let cache = VersionedCache::new();
        cache.add(&obj("x", "1", 1)).unwrap();
        assert!(cache.is_newer(&obj("x", "not-a-number", 1)).is_err());
        assert!(cache.add(&obj("y", "also-bad", 1)).is_err());
    }

    #[test]
    fn replace_reports_evicted_keys() {
        let cache = VersionedCache::new();
        cache.add(&obj("a", "1", 1)).unwrap();
        cache.add(&obj("b", "1", 1)).unwrap();
        let evicted = cache.replace(&[obj("b", "2", 2), obj("c", "1", 1)]).unwrap();
        assert_eq!(evicted, vec![ObjectKey::parse("default/a")]);
        assert!(cache.get_by_key(&ObjectKey::parse("default/b")).is_some());
        assert!(cache.get_by_key(&ObjectKey::parse("default/c")).is_some());
        assert!(cache.get_by_key(&ObjectKey::parse("default/a")).is_none());
    }

    #[test]
    fn fifo_coalesces_per_key_newest_wins() {
        let mut fifo = DeltaFifo::with_capacity(16);
        fifo.push(Delta { kind: DeltaKind::Added, object: obj("x", "1", 1) }).unwrap();
        fifo.push(Delta { kind: DeltaKind::Updated, object: obj("y", "1", 1) }).unwrap();
        fifo.push(Delta { kind: DeltaKind::Updated, object: obj("x", "2", 2) }).unwrap();
        let batch = fifo.drain_ready();
        assert_eq!(batch.len(), 2);
        // FIFO across keys: x entered first and keeps its slot.
        assert_eq!(argus_core::meta::name(&batch[0].object), Some("x"));
        assert_eq!(argus_core::meta::resource_version(&batch[0].object), Some("2"));
        assert_eq!(batch[0].kind, DeltaKind::Updated);
        assert_eq!(argus_core::meta::name(&batch[1].object), Some("y"));
    }

    #[test]
    fn fifo_drops_oldest_when_full() {
        let mut fifo = DeltaFifo::with_capacity(2);
        fifo.push(Delta { kind: DeltaKind::Added, object: obj("a", "1", 1) }).unwrap();
        fifo.push(Delta { kind: DeltaKind::Added, object: obj("b", "1", 1) }).unwrap();
        fifo.push(Delta { kind: DeltaKind::Added, object: obj("c", "1", 1) }).unwrap();
        assert_eq!(fifo.dropped(), 1);
        let names: Vec<_> = fifo
            .drain_ready()
            .iter()
            .map(|d| argus_core::meta::name(&d.object).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
