//! Judgement cache service.
//!
//! One live [`CacheEntry`] per artifact key. A hit is only valid while the
//! stored content address matches the live snapshot and the entry has not
//! expired; expired entries read as absent.
//!
//! Two backends share the [`JudgementCache`] contract: the persisted table,
//! shared by every process on the same database, and an in-process `moka`
//! cache. The service is built once at startup by [`build_cache`] and injected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use judgement_shared::{
    ArtifactKey, CacheBackend, CacheConfig, ContentAddress, JudgementError, Result, Trajectory,
};
use judgement_storage::{Storage, StoredCacheEntry};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact_key: ArtifactKey,
    /// Address of the snapshot the payload was computed from.
    pub content_address: ContentAddress,
    pub payload: Trajectory,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        artifact_key: ArtifactKey,
        content_address: ContentAddress,
        payload: Trajectory,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            artifact_key,
            content_address,
            payload,
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Valid hit for `live`: same address, not yet expired.
    pub fn is_fresh_for(&self, live: &ContentAddress, now: DateTime<Utc>) -> bool {
        &self.content_address == live && !self.is_expired_at(now)
    }
}

#[async_trait]
pub trait JudgementCache: Send + Sync {
    fn backend(&self) -> CacheBackend;

    /// Live entry for `key`, or `None` if absent or expired.
    async fn get(&self, key: &ArtifactKey) -> Result<Option<CacheEntry>>;

    /// Replace the entry for `entry.artifact_key`.
    async fn set(&self, entry: CacheEntry) -> Result<()>;

    /// Remove the entry for `key`. Returns whether one existed.
    async fn delete(&self, key: &ArtifactKey) -> Result<bool>;
}

/// Build the configured cache backend.
pub fn build_cache(config: &CacheConfig, storage: Arc<Storage>) -> Arc<dyn JudgementCache> {
    match config.backend {
        CacheBackend::Storage => Arc::new(StorageJudgementCache::new(storage)),
        CacheBackend::Memory => Arc::new(MemoryJudgementCache::new(
            config.capacity,
            Duration::from_secs(config.ttl_secs),
        )),
    }
}

// ---------------------------------------------------------------------------
// Persisted backend
// ---------------------------------------------------------------------------

pub struct StorageJudgementCache {
    storage: Arc<Storage>,
}

impl StorageJudgementCache {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JudgementCache for StorageJudgementCache {
    fn backend(&self) -> CacheBackend {
        CacheBackend::Storage
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Option<CacheEntry>> {
        let Some(stored) = self.storage.get_cache_entry(&key.cache_key()).await? else {
            return Ok(None);
        };
        if Utc::now() >= stored.expires_at {
            debug!(key = %key, "cache entry expired");
            return Ok(None);
        }

        // An entry written by an incompatible build is treated as a miss.
        match serde_json::from_value::<Trajectory>(stored.payload) {
            Ok(payload) => Ok(Some(CacheEntry {
                artifact_key: key.clone(),
                content_address: stored.content_address,
                payload,
                created_at: stored.created_at,
                expires_at: stored.expires_at,
            })),
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable cache payload ignored");
                Ok(None)
            }
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        let payload = serde_json::to_value(&entry.payload)
            .map_err(|e| JudgementError::Storage(format!("cache payload: {e}")))?;
        self.storage
            .put_cache_entry(&StoredCacheEntry {
                artifact_key: entry.artifact_key.cache_key(),
                content_address: entry.content_address,
                payload,
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            })
            .await
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<bool> {
        self.storage.delete_cache_entry(&key.cache_key()).await
    }
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

/// In-process cache bounded by capacity and time-to-live. Contents are lost
/// when the process exits.
pub struct MemoryJudgementCache {
    inner: Cache<String, CacheEntry>,
}

impl MemoryJudgementCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }
}

#[async_trait]
impl JudgementCache for MemoryJudgementCache {
    fn backend(&self) -> CacheBackend {
        CacheBackend::Memory
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Option<CacheEntry>> {
        Ok(self
            .inner
            .get(&key.cache_key())
            .await
            .filter(|entry| !entry.is_expired_at(Utc::now())))
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        self.inner.insert(entry.artifact_key.cache_key(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.inner.remove(&key.cache_key()).await.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;
    use judgement_shared::JudgementSheet;

    fn trajectory(position: &str) -> Trajectory {
        Trajectory {
            position_statement: position.into(),
            key_evidence_refs: vec!["policy_clause::pc1".into()],
            judgement_sheet: JudgementSheet {
                headline: position.into(),
                issues: vec![],
                balance: "balanced".into(),
                conditions: vec![],
                uncertainties: vec![],
                generated_by_fallback: true,
            },
        }
    }

    async fn exercise(cache: &dyn JudgementCache) {
        let key = ArtifactKey::new("sc1", "fr1");
        assert!(cache.get(&key).await.unwrap().is_none());

        let a1 = ContentAddress::from_hex("a1");
        cache
            .set(CacheEntry::new(key.clone(), a1.clone(), trajectory("T"), Duration::from_secs(60)))
            .await
            .unwrap();
        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.content_address, a1);
        assert_eq!(hit.payload.position_statement, "T");
        assert!(hit.is_fresh_for(&a1, Utc::now()));
        assert!(!hit.is_fresh_for(&ContentAddress::from_hex("a2"), Utc::now()));

        // One live entry per key.
        let a2 = ContentAddress::from_hex("a2");
        cache
            .set(CacheEntry::new(key.clone(), a2.clone(), trajectory("T'"), Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.get(&key).await.unwrap().unwrap().content_address, a2);

        assert!(cache.delete(&key).await.unwrap());
        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(!cache.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn storage_backend_contract() {
        let cache = StorageJudgementCache::new(Arc::new(test_storage().await));
        exercise(&cache).await;
    }

    #[tokio::test]
    async fn memory_backend_contract() {
        let cache = MemoryJudgementCache::new(16, Duration::from_secs(60));
        exercise(&cache).await;
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let key = ArtifactKey::new("sc1", "fr1");
        let mut entry = CacheEntry::new(
            key.clone(),
            ContentAddress::from_hex("a1"),
            trajectory("T"),
            Duration::from_secs(60),
        );
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);

        let storage = StorageJudgementCache::new(Arc::new(test_storage().await));
        storage.set(entry.clone()).await.unwrap();
        assert!(storage.get(&key).await.unwrap().is_none());

        let memory = MemoryJudgementCache::new(16, Duration::from_secs(60));
        memory.set(entry).await.unwrap();
        assert!(memory.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn config_selects_backend() {
        let storage = Arc::new(test_storage().await);
        let mut config = CacheConfig::default();
        assert_eq!(build_cache(&config, storage.clone()).backend(), CacheBackend::Storage);
        config.backend = CacheBackend::Memory;
        assert_eq!(build_cache(&config, storage).backend(), CacheBackend::Memory);
    }
}
