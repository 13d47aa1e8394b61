//! Staleness checks and recompute scheduling for judgement tabs.
//!
//! A read compares the cached entry against the live snapshot address. On a
//! miss the scheduler either returns what it has (a recomputation is already
//! in flight, or the caller opted out of refreshing), runs the pipeline inline,
//! or claims the tab as `queued` and hands the run to the [`WorkQueue`].
//!
//! At most one recomputation per tab is in flight. The tab status claim is the
//! first guard and the queue's dedup key the second.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use judgement_shared::{AppConfig, ArtifactKey, ContentAddress, Result, Tab, TabStatus};
use judgement_storage::Storage;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheEntry, JudgementCache};
use crate::pipeline::{MovePipeline, ProgressReporter, RunOutcome, SilentProgress};
use crate::queue::{SubmitOutcome, WorkQueue};
use crate::snapshot::SnapshotBuilder;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub cache_ttl: Duration,
    pub worker_concurrency: usize,
    /// Age after which an in-flight tab claim is treated as abandoned.
    pub claim_lease: Duration,
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            worker_concurrency: config.defaults.worker_concurrency.max(1) as usize,
            claim_lease: config.budgets.claim_lease(),
        }
    }
}

/// Caller preferences for a read.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Schedule a recomputation when the cached artifact is stale.
    pub auto_refresh: bool,
    /// Recompute in the background instead of inline.
    pub prefer_async: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            prefer_async: true,
        }
    }
}

/// What a read found, and what it did about it.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Tab row as of the end of the read.
    pub tab: Tab,
    pub live_address: ContentAddress,
    /// Best available entry: fresh on a hit, possibly stale otherwise.
    pub entry: Option<CacheEntry>,
    pub is_stale: bool,
    /// Present when this read ran the pipeline inline.
    pub run: Option<RunOutcome>,
    /// Recoverable problems met while serving the read.
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct RecomputeScheduler {
    storage: Arc<Storage>,
    snapshots: Arc<SnapshotBuilder>,
    cache: Arc<dyn JudgementCache>,
    pipeline: Arc<MovePipeline>,
    queue: WorkQueue,
    progress: Arc<dyn ProgressReporter>,
    config: SchedulerConfig,
}

impl RecomputeScheduler {
    pub fn new(
        storage: Arc<Storage>,
        cache: Arc<dyn JudgementCache>,
        pipeline: Arc<MovePipeline>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            snapshots: Arc::new(SnapshotBuilder::new(storage.clone())),
            storage,
            cache,
            pipeline,
            queue: WorkQueue::new(config.worker_concurrency),
            progress: Arc::new(SilentProgress),
            config,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn pipeline(&self) -> &MovePipeline {
        &self.pipeline
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Wait for every background recomputation to finish.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    async fn live_address(&self, key: &ArtifactKey) -> Result<ContentAddress> {
        self.snapshots.snapshot(key).await?.address()
    }

    /// Cache lookups are best-effort: a failing backend reads as a miss.
    async fn cached(&self, key: &ArtifactKey, errors: &mut Vec<String>) -> Option<CacheEntry> {
        match self.cache.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%key, error = %e, "cache read failed");
                errors.push(format!("cache read: {e}"));
                None
            }
        }
    }

    /// Serve a read for `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn read(&self, key: &ArtifactKey, options: ReadOptions) -> Result<ReadResult> {
        let live_address = self.live_address(key).await?;
        let tab = self.storage.get_or_create_tab(key).await?;
        let mut errors = Vec::new();
        let entry = self.cached(key, &mut errors).await;

        if entry
            .as_ref()
            .is_some_and(|e| e.is_fresh_for(&live_address, Utc::now()))
        {
            debug!("cache hit");
            return Ok(ReadResult {
                tab,
                live_address,
                entry,
                is_stale: false,
                run: None,
                errors,
            });
        }

        let stale = |tab: Tab, entry: Option<CacheEntry>, run: Option<RunOutcome>, errors: Vec<String>| ReadResult {
            tab,
            live_address: live_address.clone(),
            entry,
            is_stale: true,
            run,
            errors,
        };

        if tab.is_claim_live(Utc::now(), self.config.claim_lease) {
            debug!(status = tab.status.as_str(), "recomputation already in flight");
            return Ok(stale(tab, entry, None, errors));
        }
        if !options.auto_refresh {
            return Ok(stale(tab, entry, None, errors));
        }

        let refresh = if options.prefer_async {
            self.schedule(&tab).await.map(|_| None)
        } else {
            self.run_now(&tab, false, false).await
        };
        let run = match refresh {
            Ok(run) => run,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // The previous artifact stays servable; report the failure beside it.
                warn!(tab_id = %tab.id, error = %e, "refresh failed, serving stale entry");
                errors.push(format!("refresh: {e}"));
                let tab = self.storage.get_tab(&tab.id).await.unwrap_or(tab);
                return Ok(stale(tab, entry, None, errors));
            }
        };

        let tab = match self.storage.get_tab(&tab.id).await {
            Ok(current) => current,
            Err(e) => {
                errors.push(format!("tab reload: {e}"));
                tab
            }
        };
        if options.prefer_async {
            return Ok(stale(tab, entry, None, errors));
        }

        let refreshed = self.cached(key, &mut errors).await;
        let is_stale = !refreshed
            .as_ref()
            .is_some_and(|e| e.is_fresh_for(&live_address, Utc::now()));
        Ok(ReadResult {
            tab,
            live_address,
            entry: refreshed.or(entry),
            is_stale,
            run,
            errors,
        })
    }

    /// Run the pipeline for `key` now, even if the cached entry is fresh.
    ///
    /// Returns `None` when a recomputation for the tab is already in flight.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn trigger_run(&self, key: &ArtifactKey) -> Result<Option<RunOutcome>> {
        self.live_address(key).await?;
        let tab = self.storage.get_or_create_tab(key).await?;
        self.run_now(&tab, false, true).await
    }

    /// Claim `tab` as queued and hand its recomputation to the work queue.
    /// Returns whether a job was accepted.
    pub async fn schedule(&self, tab: &Tab) -> Result<bool> {
        if !self.storage.try_mark_queued(&tab.id, self.config.claim_lease).await? {
            debug!(tab_id = %tab.id, "tab already claimed");
            return Ok(false);
        }

        let scheduler = self.clone();
        let queued = tab.clone();
        let outcome = self.queue.submit(tab.key().cache_key(), async move {
            if let Err(e) = scheduler.run_now(&queued, true, false).await {
                warn!(tab_id = %queued.id, error = %e, "background recomputation failed");
            }
        });

        match outcome {
            SubmitOutcome::Accepted => {
                info!(tab_id = %tab.id, "recomputation queued");
                Ok(true)
            }
            SubmitOutcome::Deduplicated => {
                // Release the claim so the tab does not sit in `queued` forever.
                self.storage.set_tab_status(&tab.id, tab.status).await?;
                Ok(false)
            }
        }
    }

    /// Claim the tab as running and execute the pipeline. `from_queued` picks
    /// up a claim taken by [`Self::schedule`]; `force` runs even when a fresh
    /// entry appeared in the meantime.
    async fn run_now(&self, tab: &Tab, from_queued: bool, force: bool) -> Result<Option<RunOutcome>> {
        if !self
            .storage
            .try_mark_running(&tab.id, from_queued, self.config.claim_lease)
            .await?
        {
            debug!(tab_id = %tab.id, "tab already running");
            return Ok(None);
        }

        match self.claimed_run(tab, force).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release) = self.storage.set_tab_status(&tab.id, TabStatus::Error).await {
                    warn!(tab_id = %tab.id, error = %release, "tab claim not released");
                }
                Err(e)
            }
        }
    }

    /// Status of the tab's last finished run, for releasing a claim that
    /// turned out to be unnecessary.
    async fn settled_status(&self, tab_id: &str) -> Result<TabStatus> {
        let tab = self.storage.get_tab(tab_id).await?;
        match tab.last_run_id {
            Some(run_id) => Ok(self.storage.get_run(&run_id).await?.status.tab_status()),
            None => Ok(TabStatus::Complete),
        }
    }

    async fn claimed_run(&self, tab: &Tab, force: bool) -> Result<Option<RunOutcome>> {
        let key = tab.key();
        let address = self.live_address(&key).await?;

        if !force {
            let mut ignored = Vec::new();
            if self
                .cached(&key, &mut ignored)
                .await
                .is_some_and(|e| e.is_fresh_for(&address, Utc::now()))
            {
                debug!(tab_id = %tab.id, "fresh entry appeared while queued");
                let settled = self.settled_status(&tab.id).await?;
                self.storage.set_tab_status(&tab.id, settled).await?;
                return Ok(None);
            }
        }

        let run = self.pipeline.start_run(tab, &address).await?;
        let mut outcome = match self.pipeline.execute(&run, tab, self.progress.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.storage
                    .finish_tab(&tab.id, TabStatus::Error, None, &run.id, Utc::now(), None)
                    .await?;
                return Err(e);
            }
        };

        let mut cached_address = None;
        let mut expiry = None;
        if let Some(trajectory) = &outcome.trajectory {
            let entry = CacheEntry::new(key.clone(), address.clone(), trajectory.clone(), self.config.cache_ttl);
            let expires_at = entry.expires_at;
            match self.cache.set(entry).await {
                Ok(()) => {
                    cached_address = Some(&address);
                    expiry = Some(expires_at);
                }
                Err(e) => {
                    warn!(tab_id = %tab.id, error = %e, "cache write failed");
                    outcome.persistence_errors.push(format!("cache write: {e}"));
                }
            }
        }

        self.storage
            .finish_tab(
                &tab.id,
                outcome.status.tab_status(),
                cached_address,
                &outcome.run_id,
                Utc::now(),
                expiry,
            )
            .await?;
        info!(
            tab_id = %tab.id,
            run_id = %outcome.run_id,
            status = outcome.status.as_str(),
            address = %address.as_str(),
            "recomputation finished"
        );
        Ok(Some(outcome))
    }
}
