//! Argus storage collaborator: the seam between the sync engine and the
//! backing search store. Any KV/document store satisfies [`ResourceStorage`];
//! the engine only ever talks to the trait. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use argus_core::{ObjectKey, RawObject, ResourceTypeKey};
use dashmap::DashMap;
use metrics::{counter, histogram};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Distinguishable so deletion callers can treat "already absent" as
    /// success.
    #[error("resource not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait::async_trait]
pub trait ResourceStorage: Send + Sync {
    async fn save_resource(&self, cluster: &str, obj: &RawObject) -> StorageResult<()>;
    /// Must return [`StorageError::NotFound`] when the resource is absent.
    async fn delete_resource(&self, cluster: &str, obj: &RawObject) -> StorageResult<()>;
    /// Purge everything previously written for one cluster.
    async fn delete_all_resources(&self, cluster: &str) -> StorageResult<()>;
    async fn check_storage_health(&self) -> StorageResult<()>;
}

/// Full identity of one stored document.
fn document_key(cluster: &str, obj: &RawObject) -> StorageResult<String> {
    let type_key = ResourceTypeKey::from_object(obj)
        .map_err(|e| StorageError::Internal(e.to_string()))?;
    let key = ObjectKey::from_object(obj).map_err(|e| StorageError::Internal(e.to_string()))?;
    Ok(format!("{cluster}|{type_key}|{key}"))
}

// ----------------- in-memory backend -----------------

/// Concurrency-safe in-memory backend for tests and demo runs.
#[derive(Default)]
pub struct MemoryStorage {
    docs: DashMap<String, RawObject>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// All documents currently stored for one cluster, unordered.
    pub fn cluster_resources(&self, cluster: &str) -> Vec<RawObject> {
        let prefix = format!("{cluster}|");
        self.docs
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ResourceStorage for MemoryStorage {
    async fn save_resource(&self, cluster: &str, obj: &RawObject) -> StorageResult<()> {
        let key = document_key(cluster, obj)?;
        self.docs.insert(key, obj.clone());
        counter!("argus_storage_saves_total", 1u64);
        Ok(())
    }

    async fn delete_resource(&self, cluster: &str, obj: &RawObject) -> StorageResult<()> {
        let key = document_key(cluster, obj)?;
        match self.docs.remove(&key) {
            Some(_) => {
                counter!("argus_storage_deletes_total", 1u64);
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn delete_all_resources(&self, cluster: &str) -> StorageResult<()> {
        let prefix = format!("{cluster}|");
        self.docs.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn check_storage_health(&self) -> StorageResult<()> {
        Ok(())
    }
}

// ----------------- SQLite backend -----------------

/// SQLite-backed store. Simple, synchronous under a mutex; save/delete are
/// single-row statements and the engine retries transient failures anyway.
pub struct SqliteStorage {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                cluster     TEXT NOT NULL,
                api_version TEXT NOT NULL,
                kind        TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                name        TEXT NOT NULL,
                object      TEXT NOT NULL,
                PRIMARY KEY (cluster, api_version, kind, namespace, name)
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_resources_cluster ON resources(cluster)",
            [],
        )
        .ok();
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("argus_storage_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn identity(cluster: &str, obj: &RawObject) -> StorageResult<(String, String, String, String, String)> {
        let type_key =
            ResourceTypeKey::from_object(obj).map_err(|e| StorageError::Internal(e.to_string()))?;
        let key = ObjectKey::from_object(obj).map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok((
            cluster.to_string(),
            type_key.api_version,
            type_key.kind,
            key.namespace.unwrap_or_default(),
            key.name,
        ))
    }
}

#[async_trait::async_trait]
impl ResourceStorage for SqliteStorage {
    async fn save_resource(&self, cluster: &str, obj: &RawObject) -> StorageResult<()> {
        let started = std::time::Instant::now();
        let (cluster, api_version, kind, namespace, name) = Self::identity(cluster, obj)?;
        let body = serde_json::to_string(obj).map_err(|e| StorageError::Internal(e.to_string()))?;
        let db = self.db.lock().map_err(|e| StorageError::Internal(e.to_string()))?;
        db.execute(
            "INSERT OR REPLACE INTO resources(cluster, api_version, kind, namespace, name, object)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&cluster, &api_version, &kind, &namespace, &name, &body),
        )
        .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        histogram!("argus_storage_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("argus_storage_saves_total", 1u64);
        Ok(())
    }

    async fn delete_resource(&self, cluster: &str, obj: &RawObject) -> StorageResult<()> {
        let (cluster, api_version, kind, namespace, name) = Self::identity(cluster, obj)?;
        let db = self.db.lock().map_err(|e| StorageError::Internal(e.to_string()))?;
        let rows = db
            .execute(
                "DELETE FROM resources
                 WHERE cluster = ?1 AND api_version = ?2 AND kind = ?3 AND namespace = ?4 AND name = ?5",
                (&cluster, &api_version, &kind, &namespace, &name),
            )
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if rows == 0 {
            return Err(StorageError::NotFound);
        }
        counter!("argus_storage_deletes_total", 1u64);
        Ok(())
    }

    async fn delete_all_resources(&self, cluster: &str) -> StorageResult<()> {
        let db = self.db.lock().map_err(|e| StorageError::Internal(e.to_string()))?;
        let rows = db
            .execute("DELETE FROM resources WHERE cluster = ?1", [cluster])
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        tracing::info!(cluster = %cluster, rows, "purged cluster resources");
        Ok(())
    }

    async fn check_storage_health(&self) -> StorageResult<()> {
        let db = self.db.lock().map_err(|e| StorageError::Internal(e.to_string()))?;
        db.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}
