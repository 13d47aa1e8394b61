//! Persisted judgement cache table.

use chrono::{DateTime, Utc};
use judgement_shared::{ContentAddress, Result};
use libsql::params;

use crate::{Storage, col_json, col_str, col_ts, to_json};

/// A raw row of the `judgement_cache` table.
#[derive(Debug, Clone)]
pub struct StoredCacheEntry {
    pub artifact_key: String,
    pub content_address: ContentAddress,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Storage {
    /// Read a cache row regardless of expiry; callers decide freshness.
    pub async fn get_cache_entry(&self, artifact_key: &str) -> Result<Option<StoredCacheEntry>> {
        let Some(row) = self
            .fetch_one(
                "SELECT artifact_key, content_address, payload_json, created_at, expires_at \
                 FROM judgement_cache WHERE artifact_key = ?1",
                params![artifact_key],
            )
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(StoredCacheEntry {
            artifact_key: col_str(&row, 0)?,
            content_address: ContentAddress::from_hex(col_str(&row, 1)?),
            payload: col_json(&row, 2)?,
            created_at: col_ts(&row, 3)?,
            expires_at: col_ts(&row, 4)?,
        }))
    }

    /// Insert or replace the single live entry for a key.
    pub async fn put_cache_entry(&self, entry: &StoredCacheEntry) -> Result<()> {
        self.execute(
            "INSERT INTO judgement_cache (artifact_key, content_address, payload_json, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(artifact_key) DO UPDATE SET \
             content_address = excluded.content_address, payload_json = excluded.payload_json, \
             created_at = excluded.created_at, expires_at = excluded.expires_at",
            params![
                entry.artifact_key.as_str(),
                entry.content_address.as_str(),
                to_json(&entry.payload)?,
                entry.created_at.to_rfc3339(),
                entry.expires_at.to_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_cache_entry(&self, artifact_key: &str) -> Result<bool> {
        let affected = self
            .execute(
                "DELETE FROM judgement_cache WHERE artifact_key = ?1",
                params![artifact_key],
            )
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use chrono::Duration;
    use serde_json::json;

    fn entry(addr: &str, payload: serde_json::Value) -> StoredCacheEntry {
        let now = Utc::now();
        StoredCacheEntry {
            artifact_key: "judgement:sc:fr".into(),
            content_address: ContentAddress::from_hex(addr),
            payload,
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn one_live_entry_per_key() {
        let storage = test_storage().await;
        storage.put_cache_entry(&entry("a1", json!({"v": 1}))).await.unwrap();
        storage.put_cache_entry(&entry("a2", json!({"v": 2}))).await.unwrap();

        let got = storage.get_cache_entry("judgement:sc:fr").await.unwrap().unwrap();
        assert_eq!(got.content_address.as_str(), "a2");
        assert_eq!(got.payload["v"], 2);

        assert!(storage.delete_cache_entry("judgement:sc:fr").await.unwrap());
        assert!(!storage.delete_cache_entry("judgement:sc:fr").await.unwrap());
        assert!(storage.get_cache_entry("judgement:sc:fr").await.unwrap().is_none());
    }
}
