//! Resource syncer: one informer for one resource type in one cluster,
//! plus a bounded worker pool draining object keys into the storage
//! collaborator.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use argus_core::{
    placeholder_object, rule::ResourceSyncRule, selector, CompiledSelectors, ListOptions,
    ListWatchFactory, ObjectKey, RawObject, ResourceTypeKey,
};
use argus_storage::ResourceStorage;
use argus_store::VersionedCache;
use argus_transform::{ClusterObjectLookup, TransformRegistry, Transformer};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::informer::{EventHandler, ResourceInformer};
use crate::limiter::RetryLimiter;
use crate::queue::WorkQueue;

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX: u32 = 5;

/// Informer callbacks enqueue only the object's key; workers re-read the
/// cache, so a burst of callbacks for one key costs one storage call.
struct EnqueueHandler {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl EventHandler for EnqueueHandler {
    fn on_add(&self, obj: &RawObject) {
        if let Ok(key) = ObjectKey::from_object(obj) {
            self.queue.add(key);
        }
    }

    fn on_update(&self, obj: &RawObject) {
        self.on_add(obj);
    }

    fn on_delete(&self, obj: &RawObject) {
        // The object is gone from the cache; the key is all a worker needs.
        self.on_add(obj);
    }
}

/// Field selectors the API server evaluates itself; anything else has to
/// be filtered client-side.
fn fields_server_supported(selector: &str) -> bool {
    selector.split(',').all(|req| {
        let path = req.split(['=', '!']).next().unwrap_or("").trim();
        matches!(path, "metadata.name" | "metadata.namespace")
    })
}

/// Decide pushdown vs client-side filtering for a rule's selectors.
fn plan_selectors(
    rule: &ResourceSyncRule,
) -> Result<(Option<String>, Option<String>, CompiledSelectors)> {
    // Compile everything up front so bad selectors fail rule load.
    let compiled = CompiledSelectors::compile(&rule.selectors).context("selector spec")?;
    match selector::server_side(&rule.selectors) {
        Some((labels, fields))
            if fields.as_deref().map_or(true, fields_server_supported) =>
        {
            Ok((labels, fields, CompiledSelectors::default()))
        }
        _ => Ok((None, None, compiled)),
    }
}

pub struct ResourceSyncer {
    cluster: String,
    rule: ResourceSyncRule,
    type_key: ResourceTypeKey,
    informer: Arc<ResourceInformer>,
    queue: Arc<WorkQueue<ObjectKey>>,
    limiter: Arc<RetryLimiter>,
    storage: Arc<dyn ResourceStorage>,
    transformer: Option<Transformer>,
    cancel: CancellationToken,
    workers: TaskTracker,
    weak: Weak<Self>,
}

impl ResourceSyncer {
    /// Compile the rule's selectors, trim, and transform specs and wire up
    /// the informer. Errors here are configuration errors, fatal to this
    /// resource type only.
    pub fn new(
        cluster: &str,
        rule: ResourceSyncRule,
        factory: &dyn ListWatchFactory,
        storage: Arc<dyn ResourceStorage>,
        lookup: Option<ClusterObjectLookup>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let type_key = rule.key();
        let (label_selector, field_selector, client_filter) = plan_selectors(&rule)?;
        let trimmer = rule
            .trim
            .as_ref()
            .map(argus_transform::Trimmer::compile)
            .transpose()
            .map_err(|e| anyhow!("trim spec: {e}"))?;
        let registry = TransformRegistry::default();
        let transformer = rule
            .transform
            .as_ref()
            .map(|spec| Transformer::compile(cluster, spec, lookup, &registry))
            .transpose()
            .map_err(|e| anyhow!("transform spec: {e}"))?;

        let opts = ListOptions { namespace: rule.namespace.clone(), label_selector, field_selector };
        let cancel = parent.child_token();
        let queue = Arc::new(WorkQueue::new());
        let handler = Arc::new(EnqueueHandler { queue: Arc::clone(&queue) });
        let resync = Duration::from_secs(rule.resync_secs.unwrap_or_else(crate::relist_secs));
        let informer = ResourceInformer::new(
            cluster.to_string(),
            type_key.clone(),
            factory.list_watch(&type_key),
            opts,
            client_filter,
            trimmer,
            handler,
            resync,
            cancel.child_token(),
        );
        Ok(Arc::new_cyclic(|weak| Self {
            cluster: cluster.to_string(),
            rule,
            type_key,
            informer,
            queue,
            limiter: Arc::new(RetryLimiter::new(RETRY_BASE_DELAY, RETRY_MAX)),
            storage,
            transformer,
            cancel,
            workers: TaskTracker::new(),
            weak: weak.clone(),
        }))
    }

    pub fn applied_rule(&self) -> &ResourceSyncRule {
        &self.rule
    }

    pub fn type_key(&self) -> &ResourceTypeKey {
        &self.type_key
    }

    pub fn cache(&self) -> Arc<VersionedCache> {
        self.informer.cache()
    }

    /// Initial sync completed; part of the readiness signal.
    pub fn ready(&self) -> bool {
        self.informer.has_synced()
    }

    pub fn start(&self) {
        self.informer.start();
        for worker in 0..self.rule.max_concurrent_workers {
            let Some(this) = self.weak.upgrade() else { return };
            self.workers.spawn(async move { this.worker_loop(worker).await });
        }
        self.workers.close();
        info!(
            cluster = %self.cluster,
            gvk = %self.type_key,
            workers = self.rule.max_concurrent_workers,
            "resource syncer started"
        );
    }

    /// Synchronous: cancels, stops the informer, and waits for every
    /// worker to fully exit. No storage call for this resource type can
    /// happen after this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.informer.stop().await;
        self.queue.shutdown();
        self.workers.close();
        self.workers.wait().await;
        info!(cluster = %self.cluster, gvk = %self.type_key, "resource syncer stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        if !self.informer.wait_for_sync().await {
            return;
        }
        debug!(cluster = %self.cluster, gvk = %self.type_key, worker, "worker running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = self.queue.get() => match item {
                    None => break,
                    Some(key) => self.process_key(key).await,
                },
            }
        }
    }

    async fn process_key(&self, key: ObjectKey) {
        let result = match self.informer.cache().get_by_key(&key) {
            Some(obj) => {
                let out = match &self.transformer {
                    Some(t) => t.apply(&obj),
                    None => (*obj).clone(),
                };
                self.storage.save_resource(&self.cluster, &out).await
            }
            None => {
                let placeholder = placeholder_object(&self.type_key, &key);
                match self.storage.delete_resource(&self.cluster, &placeholder).await {
                    // Already absent is success, not a failure.
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
        };
        self.queue.done(&key);
        match result {
            Ok(()) => self.limiter.forget(&key),
            Err(e) => {
                let delay = self.limiter.when(&key);
                Arc::clone(&self.queue).add_after(key.clone(), delay);
                warn!(
                    cluster = %self.cluster,
                    gvk = %self.type_key,
                    key = %key,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "storage call failed; backing off"
                );
                metrics::counter!("argus_syncer_retries_total", 1u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::SelectorSpec;

    fn rule_with(selectors: Vec<SelectorSpec>) -> ResourceSyncRule {
        let mut rule = ResourceSyncRule::new("v1", "Pod");
        rule.selectors = selectors;
        rule
    }

    #[test]
    fn single_label_selector_pushes_down() {
        let (labels, fields, filter) =
            plan_selectors(&rule_with(vec![SelectorSpec { labels: Some("app=web".into()), fields: None }]))
                .unwrap();
        assert_eq!(labels.as_deref(), Some("app=web"));
        assert_eq!(fields, None);
        assert!(filter.is_empty());
    }

    #[test]
    fn supported_field_selector_pushes_down() {
        let (_, fields, filter) = plan_selectors(&rule_with(vec![SelectorSpec {
            labels: None,
            fields: Some("metadata.name=web-0".into()),
        }]))
        .unwrap();
        assert_eq!(fields.as_deref(), Some("metadata.name=web-0"));
        assert!(filter.is_empty());
    }

    #[test]
    fn arbitrary_field_selector_stays_client_side() {
        let (labels, fields, filter) = plan_selectors(&rule_with(vec![SelectorSpec {
            labels: None,
            fields: Some("status.phase=Running".into()),
        }]))
        .unwrap();
        assert_eq!(labels, None);
        assert_eq!(fields, None);
        assert!(!filter.is_empty());
    }

    #[test]
    fn multiple_entries_stay_client_side() {
        let (labels, fields, filter) = plan_selectors(&rule_with(vec![
            SelectorSpec { labels: Some("app=a".into()), fields: None },
            SelectorSpec { labels: Some("app=b".into()), fields: None },
        ]))
        .unwrap();
        assert_eq!(labels, None);
        assert_eq!(fields, None);
        assert!(!filter.is_empty());
    }

    #[test]
    fn bad_selector_fails_rule_load() {
        assert!(plan_selectors(&rule_with(vec![SelectorSpec {
            labels: Some(",".into()),
            fields: None
        }]))
        .is_err());
    }
}
