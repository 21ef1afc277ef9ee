//! Argus core types: resource keys, deltas, sync rules, and the transport seam.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod meta;
pub mod rule;
pub mod selector;

pub use rule::{validate_rules, ResourceSyncRule, TransformSpec, TrimSpec};
pub use selector::{CompiledSelectors, SelectorSpec};

/// Raw synced object. Objects stay self-describing JSON end to end;
/// well-known fields go through the typed accessors in [`meta`].
pub type RawObject = serde_json::Value;

/// Identity of a class of synced objects: the (apiVersion, kind) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceTypeKey {
    pub api_version: String,
    pub kind: String,
}

impl ResourceTypeKey {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// Parse a key like `v1/ConfigMap` or `apps/v1/Deployment`
    /// (last segment is the kind, everything before it the apiVersion).
    pub fn parse(key: &str) -> anyhow::Result<Self> {
        let (api_version, kind) = key
            .rsplit_once('/')
            .ok_or_else(|| anyhow::anyhow!("invalid resource type key: {} (expect v1/Kind or group/v1/Kind)", key))?;
        if api_version.is_empty() || kind.is_empty() {
            anyhow::bail!("invalid resource type key: {}", key);
        }
        Ok(Self { api_version: api_version.to_string(), kind: kind.to_string() })
    }

    /// Derive the key from an object's own `apiVersion`/`kind` fields.
    pub fn from_object(obj: &RawObject) -> anyhow::Result<Self> {
        let api_version = meta::api_version(obj)
            .ok_or_else(|| anyhow::anyhow!("object missing apiVersion"))?;
        let kind = meta::kind(obj).ok_or_else(|| anyhow::anyhow!("object missing kind"))?;
        Ok(Self::new(api_version, kind))
    }
}

impl std::fmt::Display for ResourceTypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Cache key for one object within a resource type: namespace/name,
/// name alone for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { namespace, name: name.into() }
    }

    /// Derive the key from object metadata. Errors when metadata or the
    /// name is missing; a syncable object always carries both.
    pub fn from_object(obj: &RawObject) -> anyhow::Result<Self> {
        let name = meta::name(obj).ok_or_else(|| anyhow::anyhow!("object missing metadata.name"))?;
        Ok(Self { namespace: meta::namespace(obj).map(|s| s.to_string()), name: name.to_string() })
    }

    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((ns, name)) => Self { namespace: Some(ns.to_string()), name: name.to_string() },
            None => Self { namespace: None, name: key.to_string() },
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Produced by the initial list of a list-then-watch cycle.
    Replaced,
    /// Produced by periodic relists after the first.
    Synced,
}

impl DeltaKind {
    pub fn is_deletion(self) -> bool {
        matches!(self, DeltaKind::Deleted)
    }
}

/// One observed change for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: RawObject,
}

impl Delta {
    pub fn key(&self) -> anyhow::Result<ObjectKey> {
        ObjectKey::from_object(&self.object)
    }
}

/// Raw event from a cluster transport. `Restarted` carries the full object
/// set of a (re)list; consumers reconcile their caches against it.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(RawObject),
    Deleted(RawObject),
    Restarted(Vec<RawObject>),
}

/// Options handed to the transport for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    /// Server-side selectors, set only when pushdown is possible
    /// (see [`selector::server_side`]).
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Capability to list-then-watch one resource type against one cluster.
///
/// Implementations run until the receiver closes or a fatal error occurs,
/// emitting `Restarted` for every (re)list and reconnecting transient
/// watch failures internally.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    async fn run(
        &self,
        opts: &ListOptions,
        tx: tokio::sync::mpsc::Sender<WatchEvent>,
    ) -> anyhow::Result<()>;
}

/// Hands out one [`ListWatch`] per resource type for one cluster's
/// credentials.
pub trait ListWatchFactory: Send + Sync {
    fn list_watch(&self, type_key: &ResourceTypeKey) -> std::sync::Arc<dyn ListWatch>;
}

/// Minimal object reconstructed from a key once the real object is gone
/// from the cache; deletion paths only need the derivable identity.
pub fn placeholder_object(type_key: &ResourceTypeKey, key: &ObjectKey) -> RawObject {
    let mut metadata = serde_json::Map::new();
    metadata.insert("name".to_string(), serde_json::Value::String(key.name.clone()));
    if let Some(ns) = &key.namespace {
        metadata.insert("namespace".to_string(), serde_json::Value::String(ns.clone()));
    }
    serde_json::json!({
        "apiVersion": type_key.api_version,
        "kind": type_key.kind,
        "metadata": metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_key_parses_both_forms() {
        let k = ResourceTypeKey::parse("v1/ConfigMap").unwrap();
        assert_eq!(k.api_version, "v1");
        assert_eq!(k.kind, "ConfigMap");
        let k = ResourceTypeKey::parse("apps/v1/Deployment").unwrap();
        assert_eq!(k.api_version, "apps/v1");
        assert_eq!(k.kind, "Deployment");
        assert!(ResourceTypeKey::parse("Deployment").is_err());
        assert_eq!(k.to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn object_key_roundtrip() {
        let obj = serde_json::json!({"metadata": {"name": "x", "namespace": "default"}});
        let key = ObjectKey::from_object(&obj).unwrap();
        assert_eq!(key.to_string(), "default/x");
        assert_eq!(ObjectKey::parse("default/x"), key);

        let cluster_scoped = serde_json::json!({"metadata": {"name": "node-1"}});
        let key = ObjectKey::from_object(&cluster_scoped).unwrap();
        assert_eq!(key.to_string(), "node-1");
        assert_eq!(ObjectKey::parse("node-1"), key);
    }

    #[test]
    fn object_key_requires_name() {
        let obj = serde_json::json!({"metadata": {"namespace": "default"}});
        assert!(ObjectKey::from_object(&obj).is_err());
        assert!(ObjectKey::from_object(&serde_json::json!({})).is_err());
    }
}
