//! Argus sync engine.
//!
//! One [`MultiClusterSynchroManager`] owns a [`ClusterSynchro`] per remote
//! cluster; each cluster synchro reconciles its desired sync rules into a
//! set of [`ResourceSyncer`]s, one per resource type; each syncer owns a
//! [`ResourceInformer`] (list-then-watch into the change-detecting cache)
//! plus a bounded worker pool draining object keys into the storage
//! collaborator. Cancellation propagates top-down and every `stop` waits
//! for full drain, so no storage write can trail a returned stop.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod informer;
pub mod limiter;
pub mod multicluster;
pub mod queue;
pub mod syncer;

pub use cluster::ClusterSynchro;
pub use informer::{EventHandler, InformerState, ResourceInformer};
pub use limiter::RetryLimiter;
pub use multicluster::MultiClusterSynchroManager;
pub use queue::WorkQueue;
pub use syncer::ResourceSyncer;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub(crate) fn queue_cap() -> usize {
    env_usize("ARGUS_QUEUE_CAP", 2048)
}

pub(crate) fn relist_secs() -> u64 {
    env_u64("ARGUS_RELIST_SECS", 300)
}

pub(crate) fn watch_backoff_max_secs() -> u64 {
    env_u64("ARGUS_WATCH_BACKOFF_MAX_SECS", 30)
}
