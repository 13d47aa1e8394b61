//! Tab rows and the single-flight status transitions.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use judgement_shared::{ArtifactKey, ContentAddress, JudgementError, Result, Tab, TabStatus, new_id};
use libsql::{Row, params};

use crate::{Storage, col_opt_str, col_opt_ts, col_str};

const TAB_COLUMNS: &str = "id, scenario_id, framing_id, status, last_content_address, \
                           last_run_id, last_run_completed_at, cache_expiry, claimed_at";

/// Claim condition shared by the queue and inline claims: the tab is idle, or
/// its in-flight claim is older than the lease (`?3`).
const CLAIMABLE: &str = "(status NOT IN ('queued', 'running') OR claimed_at IS NULL OR claimed_at < ?3)";

/// Fixed-width UTC timestamps so claim times compare as text.
fn claim_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Oldest claim time still covered by `lease`.
fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_tab(row: &Row) -> Result<Tab> {
    Ok(Tab {
        id: col_str(row, 0)?,
        scenario_id: col_str(row, 1)?,
        framing_id: col_str(row, 2)?,
        status: col_str(row, 3)?.parse()?,
        last_content_address: col_opt_str(row, 4).map(ContentAddress::from_hex),
        last_run_id: col_opt_str(row, 5),
        last_run_completed_at: col_opt_ts(row, 6)?,
        cache_expiry: col_opt_ts(row, 7)?,
        claimed_at: col_opt_ts(row, 8)?,
    })
}

impl Storage {
    /// Look up the tab for an artifact key, creating it on first use.
    ///
    /// New tabs start out `error` with no run history so the first staleness
    /// check is free to claim them.
    pub async fn get_or_create_tab(&self, key: &ArtifactKey) -> Result<Tab> {
        if let Some(tab) = self.get_tab_by_key(key).await? {
            return Ok(tab);
        }

        self.execute(
            "INSERT OR IGNORE INTO tabs (id, scenario_id, framing_id, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new_id("tab"),
                key.scenario_id.as_str(),
                key.framing_id.as_str(),
                TabStatus::Error.as_str(),
                Utc::now().to_rfc3339()
            ],
        )
        .await?;

        self.get_tab_by_key(key)
            .await?
            .ok_or_else(|| JudgementError::Storage(format!("tab for {key} vanished after insert")))
    }

    pub async fn get_tab_by_key(&self, key: &ArtifactKey) -> Result<Option<Tab>> {
        let sql = format!("SELECT {TAB_COLUMNS} FROM tabs WHERE scenario_id = ?1 AND framing_id = ?2");
        self.fetch_one(&sql, params![key.scenario_id.as_str(), key.framing_id.as_str()])
            .await?
            .map(|row| row_to_tab(&row))
            .transpose()
    }

    pub async fn get_tab(&self, tab_id: &str) -> Result<Tab> {
        let sql = format!("SELECT {TAB_COLUMNS} FROM tabs WHERE id = ?1");
        let row = self
            .fetch_one(&sql, params![tab_id])
            .await?
            .ok_or_else(|| JudgementError::not_found("tab", tab_id))?;
        row_to_tab(&row)
    }

    /// Claim the tab for a background refresh. Returns `false` when another
    /// caller holds a queued or running claim younger than `lease`.
    pub async fn try_mark_queued(&self, tab_id: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let sql = format!("UPDATE tabs SET status = 'queued', claimed_at = ?2 WHERE id = ?1 AND {CLAIMABLE}");
        let affected = self
            .execute(
                &sql,
                params![tab_id, claim_ts(now), claim_ts(lease_cutoff(now, lease))],
            )
            .await?;
        Ok(affected == 1)
    }

    /// Move a tab to `running`.
    ///
    /// Succeeds from `queued` (a worker picking up its own claim) or from any
    /// idle status (an inline run). Fails while another claim is within its
    /// lease; an expired claim is taken over.
    pub async fn try_mark_running(&self, tab_id: &str, from_queued: bool, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let affected = if from_queued {
            self.execute(
                "UPDATE tabs SET status = 'running', claimed_at = ?2 WHERE id = ?1 AND status = 'queued'",
                params![tab_id, claim_ts(now)],
            )
            .await?
        } else {
            let sql = format!("UPDATE tabs SET status = 'running', claimed_at = ?2 WHERE id = ?1 AND {CLAIMABLE}");
            self.execute(
                &sql,
                params![tab_id, claim_ts(now), claim_ts(lease_cutoff(now, lease))],
            )
            .await?
        };
        Ok(affected == 1)
    }

    /// Record the outcome of a run on its tab. `content_address` is only
    /// recorded when the run replaced the cached artifact.
    pub async fn finish_tab(
        &self,
        tab_id: &str,
        status: TabStatus,
        content_address: Option<&ContentAddress>,
        run_id: &str,
        completed_at: DateTime<Utc>,
        cache_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.execute(
            "UPDATE tabs SET status = ?2, last_content_address = COALESCE(?3, last_content_address), \
             last_run_id = ?4, claimed_at = NULL, \
             last_run_completed_at = ?5, cache_expiry = COALESCE(?6, cache_expiry) \
             WHERE id = ?1",
            params![
                tab_id,
                status.as_str(),
                content_address.map(|a| a.as_str()),
                run_id,
                completed_at.to_rfc3339(),
                cache_expiry.map(|t| t.to_rfc3339())
            ],
        )
        .await?;
        Ok(())
    }

    /// Force a tab status without touching run bookkeeping. Used to release a
    /// claim that never turned into a run.
    pub async fn set_tab_status(&self, tab_id: &str, status: TabStatus) -> Result<()> {
        self.execute(
            "UPDATE tabs SET status = ?2, claimed_at = NULL WHERE id = ?1",
            params![tab_id, status.as_str()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::test_support::test_storage;
    use judgement_shared::{ArtifactKey, ContentAddress, TabStatus};
    use libsql::params;

    const LEASE: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn tab_created_once_per_key() {
        let storage = test_storage().await;
        let key = ArtifactKey::new("sc-1", "fr-1");
        let a = storage.get_or_create_tab(&key).await.unwrap();
        let b = storage.get_or_create_tab(&key).await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.last_content_address.is_none());
        assert!(!a.status.is_in_flight());

        let other = storage
            .get_or_create_tab(&ArtifactKey::new("sc-1", "fr-2"))
            .await
            .unwrap();
        assert_ne!(a.id, other.id);
    }

    #[tokio::test]
    async fn only_one_queue_claim_wins() {
        let storage = test_storage().await;
        let tab = storage
            .get_or_create_tab(&ArtifactKey::new("sc", "fr"))
            .await
            .unwrap();

        assert!(storage.try_mark_queued(&tab.id, LEASE).await.unwrap());
        assert!(!storage.try_mark_queued(&tab.id, LEASE).await.unwrap());
        assert!(!storage.try_mark_running(&tab.id, false, LEASE).await.unwrap());
        assert!(storage.try_mark_running(&tab.id, true, LEASE).await.unwrap());
        assert!(!storage.try_mark_running(&tab.id, true, LEASE).await.unwrap());
        assert_eq!(storage.get_tab(&tab.id).await.unwrap().status, TabStatus::Running);
    }

    #[tokio::test]
    async fn expired_claim_is_taken_over() {
        let storage = test_storage().await;
        let tab = storage
            .get_or_create_tab(&ArtifactKey::new("sc", "fr"))
            .await
            .unwrap();
        assert!(storage.try_mark_running(&tab.id, false, LEASE).await.unwrap());
        let claimed = storage.get_tab(&tab.id).await.unwrap();
        assert!(claimed.claimed_at.is_some());
        assert!(!storage.try_mark_queued(&tab.id, LEASE).await.unwrap());

        // The process holding the claim died long ago.
        storage
            .execute(
                "UPDATE tabs SET claimed_at = ?2 WHERE id = ?1",
                params![tab.id.as_str(), "2000-01-01T00:00:00.000Z"],
            )
            .await
            .unwrap();
        assert!(storage.try_mark_queued(&tab.id, LEASE).await.unwrap());
        assert!(!storage.try_mark_running(&tab.id, false, LEASE).await.unwrap());
        assert!(storage.try_mark_running(&tab.id, true, LEASE).await.unwrap());

        storage
            .finish_tab(&tab.id, TabStatus::Partial, None, "run_1", chrono::Utc::now(), None)
            .await
            .unwrap();
        assert!(storage.get_tab(&tab.id).await.unwrap().claimed_at.is_none());
    }

    #[tokio::test]
    async fn finish_tab_records_run() {
        let storage = test_storage().await;
        let tab = storage
            .get_or_create_tab(&ArtifactKey::new("sc", "fr"))
            .await
            .unwrap();
        let addr = ContentAddress::from_hex("abc123");
        let now = chrono::Utc::now();

        storage
            .finish_tab(&tab.id, TabStatus::Complete, Some(&addr), "run_1", now, Some(now))
            .await
            .unwrap();

        let tab = storage.get_tab(&tab.id).await.unwrap();
        assert_eq!(tab.status, TabStatus::Complete);
        assert_eq!(tab.last_content_address, Some(addr));
        assert_eq!(tab.last_run_id.as_deref(), Some("run_1"));
        assert!(tab.cache_expiry.is_some());

        // A failed follow-up run keeps the last good address.
        storage
            .finish_tab(&tab.id, TabStatus::Error, None, "run_2", now, None)
            .await
            .unwrap();
        let tab = storage.get_tab(&tab.id).await.unwrap();
        assert_eq!(tab.status, TabStatus::Error);
        assert_eq!(tab.last_content_address.as_ref().map(|a| a.as_str()), Some("abc123"));
        assert_eq!(tab.last_run_id.as_deref(), Some("run_2"));

        // A finished tab can be claimed again.
        assert!(storage.try_mark_queued(&tab.id, LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn missing_tab_is_not_found() {
        let storage = test_storage().await;
        let err = storage.get_tab("tab_missing").await.unwrap_err();
        assert!(err.is_fatal());
    }
}
