//! Watch-delta informer: one list-then-watch loop per resource type,
//! feeding the change-detecting cache and dispatching callbacks.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use argus_core::{
    placeholder_object, CompiledSelectors, Delta, DeltaKind, ListOptions, ListWatch, ObjectKey,
    RawObject, ResourceTypeKey, WatchEvent,
};
use argus_store::{DeltaFifo, VersionedCache};
use argus_transform::Trimmer;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    NotStarted,
    Running,
    Stopping,
    /// Terminal.
    Stopped,
}

/// Callbacks dispatched after the cache accepted a delta.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: &RawObject);
    fn on_update(&self, obj: &RawObject);
    /// Dispatched unconditionally, even for keys the cache never held:
    /// callers must be able to reconcile external storage state that may
    /// not match the in-memory cache after a crash/restart.
    fn on_delete(&self, obj: &RawObject);
}

enum Outcome {
    Cancelled,
    Resync,
    TransportEnded { listed: bool },
}

pub struct ResourceInformer {
    cluster: String,
    type_key: ResourceTypeKey,
    transport: Arc<dyn ListWatch>,
    opts: ListOptions,
    /// Empty when selectors were pushed down to the transport.
    client_filter: CompiledSelectors,
    trimmer: Option<Trimmer>,
    handler: Arc<dyn EventHandler>,
    cache: Arc<VersionedCache>,
    resync: Duration,
    state: Mutex<InformerState>,
    cancel: CancellationToken,
    synced_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl ResourceInformer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: String,
        type_key: ResourceTypeKey,
        transport: Arc<dyn ListWatch>,
        opts: ListOptions,
        client_filter: CompiledSelectors,
        trimmer: Option<Trimmer>,
        handler: Arc<dyn EventHandler>,
        resync: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (synced_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            cluster,
            type_key,
            transport,
            opts,
            client_filter,
            trimmer,
            handler,
            cache: Arc::new(VersionedCache::new()),
            resync,
            state: Mutex::new(InformerState::NotStarted),
            cancel,
            synced_tx,
            task: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub fn cache(&self) -> Arc<VersionedCache> {
        Arc::clone(&self.cache)
    }

    pub fn state(&self) -> InformerState {
        *self.state.lock().unwrap()
    }

    /// True once the first list batch has been fully processed.
    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Resolves true when the initial sync completes, false on cancellation.
    pub async fn wait_for_sync(&self) -> bool {
        let mut rx = self.synced_tx.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
        }
    }

    /// Idempotent; only the NotStarted → Running transition spawns work.
    pub fn start(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != InformerState::NotStarted {
                return;
            }
            *state = InformerState::Running;
        }
        let Some(this) = self.weak.upgrade() else { return };
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Synchronous: does not return until the watch loop has fully exited.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                InformerState::Stopped => return,
                _ => *state = InformerState::Stopping,
            }
        }
        self.cancel.cancel();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.state.lock().unwrap() = InformerState::Stopped;
    }

    async fn run_loop(self: Arc<Self>) {
        let max_backoff = crate::watch_backoff_max_secs().max(1);
        let mut backoff_secs = 1u64;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let (tx, rx) = mpsc::channel(crate::queue_cap());
            let child = self.cancel.child_token();
            let transport_task = tokio::spawn({
                let transport = Arc::clone(&self.transport);
                let opts = self.opts.clone();
                let child = child.clone();
                let cluster = self.cluster.clone();
                let type_key = self.type_key.clone();
                async move {
                    tokio::select! {
                        _ = child.cancelled() => {}
                        res = transport.run(&opts, tx) => {
                            if let Err(e) = res {
                                warn!(cluster = %cluster, gvk = %type_key, error = %e, "transport ended with error");
                            }
                        }
                    }
                }
            });
            let outcome = self.process_events(rx).await;
            child.cancel();
            let _ = transport_task.await;
            match outcome {
                Outcome::Cancelled => break,
                Outcome::Resync => {
                    backoff_secs = 1;
                }
                Outcome::TransportEnded { listed } => {
                    if listed {
                        backoff_secs = 1;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(max_backoff);
                }
            }
        }
        *self.state.lock().unwrap() = InformerState::Stopped;
        info!(cluster = %self.cluster, gvk = %self.type_key, "informer stopped");
    }

    async fn process_events(&self, mut rx: mpsc::Receiver<WatchEvent>) -> Outcome {
        let mut fifo = DeltaFifo::with_capacity(crate::queue_cap());
        let mut tick = tokio::time::interval(Duration::from_millis(8));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let resync = tokio::time::sleep(self.resync);
        tokio::pin!(resync);
        let mut listed = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = &mut resync => {
                    self.drain(&mut fifo);
                    debug!(cluster = %self.cluster, gvk = %self.type_key, "resync interval elapsed; forcing relist");
                    return Outcome::Resync;
                }
                maybe = rx.recv() => match maybe {
                    Some(ev) => {
                        if matches!(ev, WatchEvent::Restarted(_)) {
                            listed = true;
                        }
                        self.ingest(ev, &mut fifo);
                    }
                    None => {
                        self.drain(&mut fifo);
                        return Outcome::TransportEnded { listed };
                    }
                },
                _ = tick.tick() => self.drain(&mut fifo),
            }
        }
    }

    fn push(&self, fifo: &mut DeltaFifo, delta: Delta) {
        if let Err(e) = fifo.push(delta) {
            warn!(cluster = %self.cluster, gvk = %self.type_key, error = %e, "dropping delta without identity");
        }
    }

    fn ingest(&self, ev: WatchEvent, fifo: &mut DeltaFifo) {
        match ev {
            WatchEvent::Applied(obj) => {
                if !self.client_filter.matches(&obj) {
                    // The object left the selected set; retract it if tracked.
                    if let Ok(key) = ObjectKey::from_object(&obj) {
                        if self.cache.contains_key(&key) {
                            let placeholder = placeholder_object(&self.type_key, &key);
                            self.push(fifo, Delta { kind: DeltaKind::Deleted, object: placeholder });
                        }
                    }
                    return;
                }
                let kind = match ObjectKey::from_object(&obj) {
                    Ok(key) if self.cache.contains_key(&key) => DeltaKind::Updated,
                    _ => DeltaKind::Added,
                };
                self.push(fifo, Delta { kind, object: obj });
            }
            WatchEvent::Deleted(obj) => {
                self.push(fifo, Delta { kind: DeltaKind::Deleted, object: obj });
            }
            WatchEvent::Restarted(objs) => {
                let kind = if self.has_synced() { DeltaKind::Synced } else { DeltaKind::Replaced };
                let objs: Vec<RawObject> =
                    objs.into_iter().filter(|o| self.client_filter.matches(o)).collect();
                let mut listed_keys: FxHashSet<ObjectKey> = FxHashSet::default();
                for obj in &objs {
                    if let Ok(key) = ObjectKey::from_object(obj) {
                        listed_keys.insert(key);
                    }
                }
                // Keys that vanished while the watch was down get a
                // synthesized delete so storage reconverges after a crash.
                for key in self.cache.keys() {
                    if !listed_keys.contains(&key) {
                        let placeholder = placeholder_object(&self.type_key, &key);
                        self.push(fifo, Delta { kind: DeltaKind::Deleted, object: placeholder });
                    }
                }
                for obj in objs {
                    self.push(fifo, Delta { kind, object: obj });
                }
                // Process the list batch in one go, then report synced.
                self.drain(fifo);
                self.synced_tx.send_replace(true);
            }
        }
    }

    fn drain(&self, fifo: &mut DeltaFifo) {
        for delta in fifo.drain_ready() {
            self.process_delta(delta);
        }
    }

    fn process_delta(&self, delta: Delta) {
        if delta.kind.is_deletion() {
            let key = match ObjectKey::from_object(&delta.object) {
                Ok(key) => key,
                Err(e) => {
                    warn!(cluster = %self.cluster, gvk = %self.type_key, error = %e, "delete without identity");
                    return;
                }
            };
            self.cache.delete_by_key(&key);
            self.handler.on_delete(&delta.object);
            metrics::counter!("argus_informer_deletes_total", 1u64);
            return;
        }
        let obj = match &self.trimmer {
            Some(trimmer) => match trimmer.trim(&delta.object) {
                Ok(trimmed) => trimmed,
                Err(e) => {
                    warn!(cluster = %self.cluster, gvk = %self.type_key, error = %e, "trim failed; object passes through untrimmed");
                    delta.object
                }
            },
            None => delta.object,
        };
        match self.cache.is_newer(&obj) {
            // Duplicate or out-of-order delivery: idempotent no-op.
            Ok(false) => {}
            Ok(true) => {
                let Ok(key) = ObjectKey::from_object(&obj) else { return };
                let existed = self.cache.contains_key(&key);
                if let Err(e) = self.cache.update(&obj) {
                    warn!(cluster = %self.cluster, gvk = %self.type_key, error = %e, "cache write failed; skipping object");
                    return;
                }
                if existed {
                    self.handler.on_update(&obj);
                } else {
                    self.handler.on_add(&obj);
                }
                metrics::counter!("argus_informer_dispatches_total", 1u64);
            }
            Err(e) => {
                warn!(cluster = %self.cluster, gvk = %self.type_key, error = %e, "staleness check failed; skipping object");
            }
        }
    }
}
