#![forbid(unsafe_code)]

use argus_core::{Delta, DeltaKind, ObjectKey};
use argus_store::{DeltaFifo, VersionedCache};

fn obj(name: &str, rv: &str, value: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "default", "resourceVersion": rv},
        "data": {"k": value}
    })
}

/// Replay the cache scenario end to end: identical content under a higher
/// version is a no-op dispatch-wise, changed content dispatches once.
#[test]
fn replay_version_then_hash_sequence() {
    let cache = VersionedCache::new();
    let mut dispatched = 0usize;

    for delta in [
        Delta { kind: DeltaKind::Added, object: obj("x", "1", "v") },
        // Same content, bumped version: must not dispatch.
        Delta { kind: DeltaKind::Updated, object: obj("x", "2", "v") },
        // Changed content at version 3: dispatches exactly once.
        Delta { kind: DeltaKind::Updated, object: obj("x", "3", "w") },
        // Out-of-order replay of version 2: rejected on the version pre-filter.
        Delta { kind: DeltaKind::Updated, object: obj("x", "2", "stale") },
    ] {
        if cache.is_newer(&delta.object).unwrap() {
            cache.update(&delta.object).unwrap();
            dispatched += 1;
        }
    }

    assert_eq!(dispatched, 2);
    let cached = cache.get_by_key(&ObjectKey::parse("default/x")).unwrap();
    assert_eq!(argus_core::meta::resource_version(&cached), Some("3"));
}

/// A burst of updates for one key coalesces to the newest before the
/// cache ever sees it; distinct keys keep arrival order.
#[test]
fn replay_coalesced_burst() {
    let cache = VersionedCache::new();
    let mut fifo = DeltaFifo::with_capacity(64);

    for rv in 1..=5u64 {
        fifo.push(Delta { kind: DeltaKind::Updated, object: obj("a", &rv.to_string(), &format!("v{rv}")) })
            .unwrap();
    }
    fifo.push(Delta { kind: DeltaKind::Added, object: obj("b", "1", "v") }).unwrap();

    let batch = fifo.drain_ready();
    assert_eq!(batch.len(), 2);

    let mut dispatched = Vec::new();
    for delta in batch {
        if cache.is_newer(&delta.object).unwrap() {
            cache.update(&delta.object).unwrap();
            dispatched.push(delta.key().unwrap().to_string());
        }
    }
    assert_eq!(dispatched, vec!["default/a", "default/b"]);
    let a = cache.get_by_key(&ObjectKey::parse("default/a")).unwrap();
    assert_eq!(argus_core::meta::resource_version(&a), Some("5"));
}
