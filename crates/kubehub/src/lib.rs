//! Argus kubehub: per-cluster credentials and the kube-backed transport.
//!
//! Each remote cluster gets its own [`kube::Client`] built from that
//! cluster's kubeconfig; nothing here touches the ambient default context
//! unless a cluster is configured without credentials (useful in dev).

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context as _, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use argus_core::{ListOptions, ListWatch, ListWatchFactory, RawObject, ResourceTypeKey, WatchEvent};

/// How to reach one remote cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterCredentials {
    pub name: String,
    /// Path to a kubeconfig; absent = ambient default context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Context within the kubeconfig; absent = its current context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Build a client for one cluster's credentials.
pub async fn connect(creds: &ClusterCredentials) -> Result<Client> {
    match &creds.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig at {}", path))?;
            let opts = KubeConfigOptions { context: creds.context.clone(), ..Default::default() };
            let config = Config::from_custom_kubeconfig(kubeconfig, &opts)
                .await
                .with_context(|| format!("resolving kubeconfig for cluster {}", creds.name))?;
            Client::try_from(config).context("building kube client")
        }
        None => Client::try_default().await.context("building default kube client"),
    }
}

fn to_gvk(key: &ResourceTypeKey) -> GroupVersionKind {
    match key.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: key.kind.clone(),
        },
        None => GroupVersionKind {
            group: String::new(),
            version: key.api_version.clone(),
            kind: key.kind.clone(),
        },
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("resource type not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut RawObject) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_raw(obj: &DynamicObject) -> Result<RawObject> {
    let mut raw = serde_json::to_value(obj).context("serializing object")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// [`ListWatch`] over one resource type in one cluster. The kube watcher
/// does the list-then-watch dance itself, emitting `Restarted` with the
/// full object set on every (re)list.
pub struct KubeListWatcher {
    cluster: String,
    client: Client,
    type_key: ResourceTypeKey,
    resolved: tokio::sync::OnceCell<(kube::core::ApiResource, bool)>,
}

impl KubeListWatcher {
    pub fn new(cluster: &str, client: Client, type_key: ResourceTypeKey) -> Self {
        Self {
            cluster: cluster.to_string(),
            client,
            type_key,
            resolved: tokio::sync::OnceCell::new(),
        }
    }
}

#[async_trait::async_trait]
impl ListWatch for KubeListWatcher {
    async fn run(&self, opts: &ListOptions, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
        let gvk = to_gvk(&self.type_key);
        let (ar, namespaced) = self
            .resolved
            .get_or_try_init(|| find_api_resource(self.client.clone(), &gvk))
            .await?
            .clone();

        let api: Api<DynamicObject> = if namespaced {
            match opts.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };

        let mut cfg = watcher::Config::default();
        if let Some(labels) = opts.label_selector.as_deref() {
            cfg = cfg.labels(labels);
        }
        if let Some(fields) = opts.field_selector.as_deref() {
            cfg = cfg.fields(fields);
        }

        let stream = watcher::watcher(api, cfg);
        futures::pin_mut!(stream);
        info!(cluster = %self.cluster, gvk = %self.type_key, ns = ?opts.namespace, "watch started");
        while let Some(ev) = stream.try_next().await? {
            let sent = match ev {
                Event::Applied(o) => tx.send(WatchEvent::Applied(to_raw(&o)?)).await,
                Event::Deleted(o) => tx.send(WatchEvent::Deleted(to_raw(&o)?)).await,
                Event::Restarted(list) => {
                    debug!(cluster = %self.cluster, gvk = %self.type_key, count = list.len(), "watch (re)list");
                    metrics::counter!("argus_watch_relists_total", 1u64);
                    let objs = list.iter().map(to_raw).collect::<Result<Vec<_>>>()?;
                    tx.send(WatchEvent::Restarted(objs)).await
                }
            };
            if sent.is_err() {
                // Receiver gone: the informer is shutting down.
                return Ok(());
            }
        }
        warn!(cluster = %self.cluster, gvk = %self.type_key, "watch stream ended");
        Ok(())
    }
}

/// One factory per connected cluster: hands the cluster synchro a
/// transport per resource type over the shared client.
pub struct KubeListWatchFactory {
    cluster: String,
    client: Client,
}

impl KubeListWatchFactory {
    pub fn new(cluster: &str, client: Client) -> Self {
        Self { cluster: cluster.to_string(), client }
    }
}

impl ListWatchFactory for KubeListWatchFactory {
    fn list_watch(&self, type_key: &ResourceTypeKey) -> std::sync::Arc<dyn ListWatch> {
        std::sync::Arc::new(KubeListWatcher::new(
            &self.cluster,
            self.client.clone(),
            type_key.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_mapping() {
        let g = to_gvk(&ResourceTypeKey::new("v1", "ConfigMap"));
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("", "v1", "ConfigMap"));
        let g = to_gvk(&ResourceTypeKey::new("apps/v1", "Deployment"));
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("apps", "v1", "Deployment"));
    }

    #[test]
    fn managed_fields_stripped() {
        let mut v = serde_json::json!({"metadata": {"name": "x", "managedFields": [{}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
