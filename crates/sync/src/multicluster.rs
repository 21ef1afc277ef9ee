//! Multi-cluster registry: one [`ClusterSynchro`] per remote cluster,
//! created and torn down as clusters appear and disappear.

use std::sync::Arc;

use argus_core::ListWatchFactory;
use argus_storage::{ResourceStorage, StorageResult};
use dashmap::DashMap;
use tracing::info;

use crate::cluster::ClusterSynchro;

pub struct MultiClusterSynchroManager {
    storage: Arc<dyn ResourceStorage>,
    clusters: DashMap<String, Arc<ClusterSynchro>>,
}

impl MultiClusterSynchroManager {
    pub fn new(storage: Arc<dyn ResourceStorage>) -> Self {
        Self { storage, clusters: DashMap::new() }
    }

    /// Create and start a synchro for the cluster, or return the existing
    /// one. Idempotent by cluster name.
    pub fn create(&self, name: &str, factory: Arc<dyn ListWatchFactory>) -> Arc<ClusterSynchro> {
        self.clusters
            .entry(name.to_string())
            .or_insert_with(|| {
                let synchro = ClusterSynchro::new(name, Arc::clone(&self.storage), factory);
                synchro.start();
                synchro
            })
            .clone()
    }

    pub fn get_for_cluster(&self, name: &str) -> Option<Arc<ClusterSynchro>> {
        self.clusters.get(name).map(|e| e.clone())
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop the named synchro and drop it from the registry; lookups
    /// report absent immediately. Returns false for unknown clusters.
    pub async fn stop_cluster(&self, name: &str) -> bool {
        let Some((_, synchro)) = self.clusters.remove(name) else {
            return false;
        };
        synchro.stop().await;
        true
    }

    /// Full removal: stop first so no writer races the purge, then delete
    /// everything previously synced for the cluster, then drop the entry.
    pub async fn remove_cluster(&self, name: &str) -> StorageResult<()> {
        let Some(synchro) = self.get_for_cluster(name) else {
            return Ok(());
        };
        synchro.stop().await;
        self.storage.delete_all_resources(name).await?;
        self.clusters.remove(name);
        info!(cluster = %name, "cluster removed and purged");
        Ok(())
    }

    pub async fn stop_all(&self) {
        for name in self.cluster_names() {
            self.stop_cluster(&name).await;
        }
    }
}
