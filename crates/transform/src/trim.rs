//! Trim: retain only a whitelisted subset of an object's fields before it
//! is cached or persisted. Bounds memory for objects that are large but
//! mostly irrelevant downstream.

use argus_core::{rule::TrimSpec, RawObject};
use argus_fieldpath::{extract_all, FieldPath, FieldPathError};

/// Identity fields retained on every trimmed object regardless of the
/// rule's whitelist; change detection and key derivation need them.
const IDENTITY_PATHS: [&str; 5] =
    ["apiVersion", "kind", "metadata.name", "metadata.namespace", "metadata.resourceVersion"];

/// Compiled trim rule: one extractor per retained path plus the implicit
/// identity paths, fragments merged back into a single object.
pub struct Trimmer {
    paths: Vec<FieldPath>,
}

impl Trimmer {
    /// Parse errors here are configuration errors, fatal to the rule.
    pub fn compile(spec: &TrimSpec) -> Result<Self, FieldPathError> {
        let mut paths = Vec::with_capacity(spec.retain.len() + IDENTITY_PATHS.len());
        for expr in IDENTITY_PATHS {
            paths.push(FieldPath::parse(expr)?);
        }
        for expr in &spec.retain {
            paths.push(FieldPath::parse(expr)?);
        }
        Ok(Self { paths })
    }

    /// Extract every retained path independently and merge the fragments.
    /// Missing paths are omitted, not errors: rules routinely whitelist
    /// fields that only some objects carry.
    pub fn trim(&self, obj: &RawObject) -> Result<RawObject, FieldPathError> {
        extract_all(&self.paths, obj, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> RawObject {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "pause",
                "namespace": "default",
                "resourceVersion": "7",
                "labels": {"name": "pause", "app": "pause"},
                "annotations": {"huge": "blob"}
            },
            "spec": {"nodeName": "n1", "containers": [{"name": "pause", "image": "pause:3.9"}]},
            "status": {"phase": "Running"}
        })
    }

    #[test]
    fn retains_whitelist_plus_identity() {
        let t = Trimmer::compile(&TrimSpec { retain: vec!["metadata.labels.name".into()] }).unwrap();
        let out = t.trim(&pod()).unwrap();
        assert_eq!(
            out,
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "pause",
                    "namespace": "default",
                    "resourceVersion": "7",
                    "labels": {"name": "pause"}
                }
            })
        );
    }

    #[test]
    fn general_expressions_supported() {
        let t = Trimmer::compile(&TrimSpec { retain: vec![".spec.containers[*].name".into()] }).unwrap();
        let out = t.trim(&pod()).unwrap();
        assert_eq!(out["spec"], json!({"containers": [{"name": "pause"}]}));
        assert!(out.get("status").is_none());
    }

    #[test]
    fn missing_retained_paths_are_omitted() {
        let t = Trimmer::compile(&TrimSpec { retain: vec!["spec.doesNotExist".into()] }).unwrap();
        let out = t.trim(&pod()).unwrap();
        assert!(out.get("spec").is_none());
        assert_eq!(out["kind"], "Pod");
    }

    #[test]
    fn bad_path_is_config_error() {
        assert!(Trimmer::compile(&TrimSpec { retain: vec!["[1:2:3:4]".into()] }).is_err());
    }
}
