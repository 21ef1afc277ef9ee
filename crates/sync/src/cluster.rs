//! Single-cluster sync manager: reconciles the desired rule set against
//! the running syncers for one cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use argus_core::{
    rule::{validate_rules, ResourceSyncRule},
    ListWatchFactory, ObjectKey, ResourceTypeKey,
};
use argus_storage::ResourceStorage;
use argus_transform::ClusterObjectLookup;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::syncer::ResourceSyncer;

pub struct ClusterSynchro {
    name: String,
    storage: Arc<dyn ResourceStorage>,
    factory: Arc<dyn ListWatchFactory>,
    /// Read-many/write-rare desired set, swapped atomically on update.
    desired: ArcSwap<Vec<ResourceSyncRule>>,
    syncers: DashMap<ResourceTypeKey, Arc<ResourceSyncer>>,
    /// Depth-1 trigger: rapid rule updates collapse into one pass.
    trigger: mpsc::Sender<()>,
    trigger_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_guard: tokio::sync::Mutex<()>,
    weak: Weak<Self>,
}

impl ClusterSynchro {
    pub fn new(
        name: &str,
        storage: Arc<dyn ResourceStorage>,
        factory: Arc<dyn ListWatchFactory>,
    ) -> Arc<Self> {
        let (trigger, trigger_rx) = mpsc::channel(1);
        Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            storage,
            factory,
            desired: ArcSwap::from_pointee(Vec::new()),
            syncers: DashMap::new(),
            trigger,
            trigger_rx: std::sync::Mutex::new(Some(trigger_rx)),
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_guard: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idempotent; only the first call spawns the reconcile loop.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(rx) = self.trigger_rx.lock().unwrap().take() else { return };
        let Some(this) = self.weak.upgrade() else { return };
        let handle = tokio::spawn(async move { this.reconcile_loop(rx).await });
        *self.task.lock().unwrap() = Some(handle);
        info!(cluster = %self.name, "cluster synchro started");
    }

    /// Swap in a new desired rule set and nudge the reconcile loop.
    /// Duplicate resource type keys are a configuration error.
    pub fn set_sync_rules(&self, rules: Vec<ResourceSyncRule>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("cluster synchro {} is stopped", self.name);
        }
        validate_rules(&rules)?;
        self.desired.store(Arc::new(rules));
        // Full channel means a pass is already pending; it will see the
        // freshly swapped snapshot.
        let _ = self.trigger.try_send(());
        Ok(())
    }

    pub fn sync_rules(&self) -> Arc<Vec<ResourceSyncRule>> {
        self.desired.load_full()
    }

    /// Running syncer count, mostly for introspection and tests.
    pub fn syncer_count(&self) -> usize {
        self.syncers.len()
    }

    pub fn syncer(&self, key: &ResourceTypeKey) -> Option<Arc<ResourceSyncer>> {
        self.syncers.get(key).map(|e| e.clone())
    }

    /// All informers finished their initial sync.
    pub fn ready(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.syncers.iter().all(|e| e.value().ready())
    }

    /// Readiness including the storage collaborator; a degraded resource
    /// type does not make the whole cluster unhealthy.
    pub async fn healthy(&self) -> bool {
        self.ready() && self.storage.check_storage_health().await.is_ok()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Idempotent and synchronous: cancels the manager's context, waits
    /// for the reconcile loop and for every syncer's workers to fully
    /// exit, then marks the manager stopped. Concurrent callers block
    /// until the first finishes.
    pub async fn stop(&self) {
        let _guard = self.stop_guard.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let keys: Vec<ResourceTypeKey> = self.syncers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, syncer)) = self.syncers.remove(&key) {
                syncer.stop().await;
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        info!(cluster = %self.name, "cluster synchro stopped");
    }

    async fn reconcile_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = rx.recv() => {
                    if maybe.is_none() || self.cancel.is_cancelled() {
                        break;
                    }
                    // Errors are contained to the pass; one bad rule set
                    // never takes the loop down.
                    if let Err(e) = self.reconcile().await {
                        error!(cluster = %self.name, error = %e, "reconcile pass failed");
                    }
                }
            }
        }
    }

    /// One reconcile pass: stop syncers that are removed or whose applied
    /// rule drifted, then start whatever is missing. Stopping a changed
    /// syncer happens-before starting its replacement, so no two syncers
    /// ever run for the same resource type key.
    async fn reconcile(&self) -> Result<()> {
        let desired = self.desired.load_full();
        let desired_map: HashMap<ResourceTypeKey, &ResourceSyncRule> =
            desired.iter().map(|r| (r.key(), r)).collect();

        let running: Vec<ResourceTypeKey> = self.syncers.iter().map(|e| e.key().clone()).collect();
        for key in running {
            let keep = match (desired_map.get(&key), self.syncers.get(&key)) {
                (Some(rule), Some(syncer)) => syncer.applied_rule() == *rule,
                _ => false,
            };
            if keep {
                continue;
            }
            if let Some((_, syncer)) = self.syncers.remove(&key) {
                info!(cluster = %self.name, gvk = %key, "stopping resource syncer");
                syncer.stop().await;
            }
        }

        let mut failed = 0usize;
        for rule in desired.iter() {
            let key = rule.key();
            if self.syncers.contains_key(&key) {
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            match ResourceSyncer::new(
                &self.name,
                rule.clone(),
                self.factory.as_ref(),
                Arc::clone(&self.storage),
                Some(self.object_lookup()),
                &self.cancel,
            ) {
                Ok(syncer) => {
                    syncer.start();
                    self.syncers.insert(key, syncer);
                }
                Err(e) => {
                    // Fatal to this resource type only.
                    failed += 1;
                    error!(cluster = %self.name, gvk = %key, error = %e, "resource syncer failed to start");
                }
            }
        }
        metrics::counter!("argus_reconcile_passes_total", 1u64);
        if failed > 0 {
            bail!("{failed} resource type(s) failed to start");
        }
        Ok(())
    }

    /// Template-visible lookup resolving another object cached for this
    /// cluster by apiVersion/kind/namespace/name.
    fn object_lookup(&self) -> ClusterObjectLookup {
        let weak = self.weak.clone();
        Arc::new(move |api_version, kind, namespace, name| {
            let this = weak.upgrade()?;
            let type_key = ResourceTypeKey::new(api_version, kind);
            let syncer = this.syncers.get(&type_key)?;
            let key = ObjectKey::new(namespace.map(str::to_string), name);
            syncer.cache().get_by_key(&key).map(|obj| (*obj).clone())
        })
    }
}
