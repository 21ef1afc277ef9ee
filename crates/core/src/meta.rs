//! Typed accessors over the well-known fields of a raw object, plus the
//! content hash used for change detection.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::RawObject;

pub fn metadata(obj: &RawObject) -> Option<&serde_json::Map<String, serde_json::Value>> {
    obj.get("metadata")?.as_object()
}

pub fn name(obj: &RawObject) -> Option<&str> {
    metadata(obj)?.get("name")?.as_str()
}

pub fn namespace(obj: &RawObject) -> Option<&str> {
    metadata(obj)?.get("namespace")?.as_str()
}

pub fn api_version(obj: &RawObject) -> Option<&str> {
    obj.get("apiVersion")?.as_str()
}

pub fn kind(obj: &RawObject) -> Option<&str> {
    obj.get("kind")?.as_str()
}

pub fn resource_version(obj: &RawObject) -> Option<&str> {
    metadata(obj)?.get("resourceVersion")?.as_str()
}

pub fn labels(obj: &RawObject) -> Option<&serde_json::Map<String, serde_json::Value>> {
    metadata(obj)?.get("labels")?.as_object()
}

/// Parse a resource version string into its numeric ordinal.
/// Empty (or absent upstream) counts as 0; non-numeric strings are an error
/// that must reach the caller, never a silent 0.
pub fn parse_resource_version(rv: &str) -> Result<u64> {
    if rv.is_empty() {
        return Ok(0);
    }
    rv.parse::<u64>()
        .with_context(|| format!("resourceVersion {:?} is not a numeric ordinal", rv))
}

/// Numeric resource version ordinal of an object (absent field = 0).
pub fn resource_version_ordinal(obj: &RawObject) -> Result<u64> {
    match resource_version(obj) {
        Some(rv) => parse_resource_version(rv),
        None => Ok(0),
    }
}

/// Blank the version field in place so two ordinal-only bumps hash equal.
pub fn blank_resource_version(obj: &mut RawObject) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        if let Some(rv) = meta.get_mut("resourceVersion") {
            *rv = serde_json::Value::String(String::new());
        }
    }
}

pub fn strip_managed_fields(obj: &mut RawObject) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Content hash over the whole object with the resource version blanked.
///
/// serde_json maps serialize with sorted keys, so the digest is independent
/// of the field order the object was constructed in.
pub fn content_hash(obj: &RawObject) -> Result<[u8; 32]> {
    let mut normalized = obj.clone();
    blank_resource_version(&mut normalized);
    strip_managed_fields(&mut normalized);
    let bytes = serde_json::to_vec(&normalized).context("serializing object for hashing")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

/// Walk a dotted field path (`metadata.labels.app`) down through maps.
/// Used by client-side field selectors; general expressions live in the
/// fieldpath crate.
pub fn field_by_path<'a>(obj: &'a RawObject, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = obj;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Render a scalar leaf for string comparison; non-scalars compare as absent.
pub fn scalar_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_version_parsing() {
        assert_eq!(parse_resource_version("").unwrap(), 0);
        assert_eq!(parse_resource_version("0").unwrap(), 0);
        assert_eq!(parse_resource_version("42").unwrap(), 42);
        assert!(parse_resource_version("abc").is_err());
    }

    #[test]
    fn hash_ignores_version_and_field_order() {
        let a = json!({"kind": "Pod", "metadata": {"name": "x", "resourceVersion": "1"}, "spec": {"a": 1, "b": 2}});
        let b = json!({"spec": {"b": 2, "a": 1}, "metadata": {"resourceVersion": "7", "name": "x"}, "kind": "Pod"});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());

        let c = json!({"kind": "Pod", "metadata": {"name": "x", "resourceVersion": "1"}, "spec": {"a": 1, "b": 3}});
        assert_ne!(content_hash(&a).unwrap(), content_hash(&c).unwrap());
    }

    #[test]
    fn hash_ignores_managed_fields() {
        let a = json!({"metadata": {"name": "x", "managedFields": [{"manager": "kubectl"}]}});
        let b = json!({"metadata": {"name": "x"}});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn field_path_walks_maps() {
        let obj = json!({"metadata": {"labels": {"app": "nginx"}}, "status": {"phase": "Running"}});
        assert_eq!(field_by_path(&obj, "metadata.labels.app").and_then(|v| v.as_str()), Some("nginx"));
        assert_eq!(field_by_path(&obj, "status.phase").and_then(|v| v.as_str()), Some("Running"));
        assert!(field_by_path(&obj, "status.missing").is_none());
    }
}
