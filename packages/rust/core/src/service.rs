//! Read and write endpoints over the scheduler.
//!
//! Every call returns a [`JudgementResponse`]. Failures, including fatal
//! input errors, come back as `status = error` with `errors[]` filled in and
//! no artifact attached.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use judgement_llm::StructuredLlm;
use judgement_shared::{
    AppConfig, ArtifactKey, ContentAddress, JudgementError, JudgementSheet, MoveEvent, MoveType,
    Result, RunStatus, TabStatus, Trajectory,
};
use judgement_storage::Storage;
use serde::Serialize;
use tracing::warn;

use crate::cache::build_cache;
use crate::pipeline::{MovePipeline, ProgressReporter, RunOutcome, SilentProgress};
use crate::retrieval::{EvidenceRetriever, StorageRetriever};
use crate::scheduler::{ReadOptions, ReadResult, RecomputeScheduler, SchedulerConfig};

#[derive(Debug, Clone, Serialize)]
pub struct Freshness {
    /// Address the served artifact was computed from.
    pub content_address: Option<ContentAddress>,
    pub is_stale: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub elapsed_ms: u64,
}

impl From<&RunOutcome> for RunSummary {
    fn from(outcome: &RunOutcome) -> Self {
        Self {
            run_id: outcome.run_id.clone(),
            status: outcome.status,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgementResponse {
    pub tab_id: Option<String>,
    pub status: TabStatus,
    pub trajectory: Option<Trajectory>,
    pub sheet: Option<JudgementSheet>,
    pub freshness: Freshness,
    pub errors: Vec<String>,
    /// Present when this call ran the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSummary>,
}

impl JudgementResponse {
    fn from_read(result: ReadResult) -> Self {
        let mut errors = result.errors;
        if let Some(run) = &result.run {
            errors.extend(run.errors.iter().cloned());
            errors.extend(run.persistence_errors.iter().cloned());
        }
        let (content_address, expires_at, trajectory) = match result.entry {
            Some(entry) => (Some(entry.content_address), Some(entry.expires_at), Some(entry.payload)),
            None => (None, None, None),
        };
        Self {
            tab_id: Some(result.tab.id),
            status: result.tab.status,
            sheet: trajectory.as_ref().map(|t| t.judgement_sheet.clone()),
            trajectory,
            freshness: Freshness {
                content_address,
                is_stale: result.is_stale,
                expires_at,
                last_run_completed_at: result.tab.last_run_completed_at,
            },
            errors,
            run: result.run.as_ref().map(RunSummary::from),
        }
    }

    fn failed(tab_id: Option<String>, error: &JudgementError) -> Self {
        Self {
            tab_id,
            status: TabStatus::Error,
            trajectory: None,
            sheet: None,
            freshness: Freshness {
                content_address: None,
                is_stale: true,
                expires_at: None,
                last_run_completed_at: None,
            },
            errors: vec![error.to_string()],
            run: None,
        }
    }
}

pub struct JudgementService {
    storage: Arc<Storage>,
    scheduler: RecomputeScheduler,
    progress: Arc<dyn ProgressReporter>,
}

impl JudgementService {
    /// Wire the cache, pipeline and scheduler over `storage`.
    pub fn new(storage: Arc<Storage>, llm: Arc<dyn StructuredLlm>, config: &AppConfig) -> Self {
        let retriever: Arc<dyn EvidenceRetriever> = Arc::new(StorageRetriever::new(storage.clone()));
        Self::with_retriever(storage, llm, retriever, config)
    }

    pub fn with_retriever(
        storage: Arc<Storage>,
        llm: Arc<dyn StructuredLlm>,
        retriever: Arc<dyn EvidenceRetriever>,
        config: &AppConfig,
    ) -> Self {
        let cache = build_cache(&config.cache, storage.clone());
        let pipeline = Arc::new(MovePipeline::new(storage.clone(), llm, retriever, config));
        let scheduler = RecomputeScheduler::new(storage.clone(), cache, pipeline, SchedulerConfig::from(config));
        Self {
            storage,
            scheduler,
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.scheduler = self.scheduler.with_progress(progress.clone());
        self.progress = progress;
        self
    }

    pub fn scheduler(&self) -> &RecomputeScheduler {
        &self.scheduler
    }

    /// Read the judgement for `key`, refreshing it according to `options`.
    pub async fn read(&self, key: &ArtifactKey, options: ReadOptions) -> JudgementResponse {
        match self.scheduler.read(key, options).await {
            Ok(result) => JudgementResponse::from_read(result),
            Err(e) => self.failure(key, e).await,
        }
    }

    /// Run the pipeline for `key` synchronously and report the result.
    pub async fn trigger_run(&self, key: &ArtifactKey) -> JudgementResponse {
        let outcome = match self.scheduler.trigger_run(key).await {
            Ok(outcome) => outcome,
            Err(e) => return self.failure(key, e).await,
        };

        let observe = ReadOptions {
            auto_refresh: false,
            prefer_async: false,
        };
        let mut response = match self.scheduler.read(key, observe).await {
            Ok(result) => JudgementResponse::from_read(ReadResult {
                run: outcome,
                ..result
            }),
            Err(e) => return self.failure(key, e).await,
        };
        if response.run.is_none() {
            response
                .errors
                .push("a recomputation is already in flight for this tab".to_string());
        }
        response
    }

    /// Re-run one move of a finished run, appending a new event to its trail.
    pub async fn rerun_move(&self, run_id: &str, move_type: MoveType) -> Result<MoveEvent> {
        self.scheduler
            .pipeline()
            .rerun_stage(run_id, move_type, self.progress.as_ref())
            .await
    }

    /// Wait for background recomputations to finish.
    pub async fn drain(&self) {
        self.scheduler.drain().await;
    }

    async fn failure(&self, key: &ArtifactKey, error: JudgementError) -> JudgementResponse {
        warn!(%key, error = %error, fatal = error.is_fatal(), "judgement request failed");
        let tab_id = match self.storage.get_tab_by_key(key).await {
            Ok(tab) => tab.map(|t| t.id),
            Err(_) => None,
        };
        JudgementResponse::failed(tab_id, &error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{offline_llm, seeded_storage, test_config, test_key};
    use judgement_llm::ScriptedLlm;
    use judgement_storage::EvidenceBundle;

    const INLINE: ReadOptions = ReadOptions {
        auto_refresh: true,
        prefer_async: false,
    };

    const PEEK: ReadOptions = ReadOptions {
        auto_refresh: false,
        prefer_async: false,
    };

    async fn service(llm: Arc<dyn StructuredLlm>) -> (JudgementService, Arc<Storage>) {
        let storage = Arc::new(seeded_storage().await);
        (JudgementService::new(storage.clone(), llm, &test_config()), storage)
    }

    #[tokio::test]
    async fn cache_hit_calls_no_collaborators() {
        let llm = Arc::new(ScriptedLlm::new());
        let (service, _storage) = service(llm.clone()).await;

        let first = service.read(&test_key(), INLINE).await;
        assert_eq!(first.status, TabStatus::Partial);
        assert!(!first.freshness.is_stale);
        assert!(first.run.is_some());
        let calls = llm.total_calls();
        assert!(calls > 0);

        let second = service.read(&test_key(), INLINE).await;
        assert!(!second.freshness.is_stale);
        assert!(second.run.is_none());
        assert_eq!(llm.total_calls(), calls);
        assert_eq!(second.freshness.content_address, first.freshness.content_address);
        assert!(second.sheet.is_some());
    }

    #[tokio::test]
    async fn new_document_makes_the_judgement_stale() {
        let (service, storage) = service(offline_llm()).await;
        let first = service.read(&test_key(), INLINE).await;
        let a1 = first.freshness.content_address.clone().unwrap();

        let extra = EvidenceBundle::from_json(
            r#"{"documents": [{"id": "d3", "project_id": "p1", "title": "Ecology addendum",
                               "updated_at": "2025-02-01T00:00:00Z",
                               "chunks": [{"id": "c6", "page": 1, "text": "Otters use the meadow ditch."}]}]}"#,
        )
        .unwrap();
        storage.import_bundle(&extra).await.unwrap();

        let stale = service.read(&test_key(), PEEK).await;
        assert!(stale.freshness.is_stale);
        assert_eq!(stale.freshness.content_address.as_ref(), Some(&a1));
        assert!(stale.trajectory.is_some());

        let refreshed = service.read(&test_key(), INLINE).await;
        assert!(!refreshed.freshness.is_stale);
        let a2 = refreshed.freshness.content_address.unwrap();
        assert_ne!(a1, a2);
    }

    #[tokio::test]
    async fn parallel_async_reads_share_one_run() {
        let (service, storage) = service(offline_llm()).await;
        let service = Arc::new(service);
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.read(&test_key(), ReadOptions::default()).await })
            })
            .collect();
        for handle in handles {
            let response = handle.await.unwrap();
            assert!(response.errors.is_empty(), "{:?}", response.errors);
        }
        service.drain().await;

        let tab = storage.get_or_create_tab(&test_key()).await.unwrap();
        assert_eq!(storage.list_runs(&tab.id).await.unwrap().len(), 1);
        let hit = service.read(&test_key(), PEEK).await;
        assert!(!hit.freshness.is_stale);
    }

    #[tokio::test]
    async fn trigger_run_reports_the_run() {
        let (service, _storage) = service(offline_llm()).await;
        let response = service.trigger_run(&test_key()).await;
        let run = response.run.unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert!(!response.freshness.is_stale);
        assert!(response.trajectory.is_some());
        assert!(!response.errors.is_empty());
    }

    #[tokio::test]
    async fn rerun_move_appends_to_the_trail() {
        let (service, storage) = service(offline_llm()).await;
        let run_id = service.trigger_run(&test_key()).await.run.unwrap().run_id;
        let event = service
            .rerun_move(&run_id, MoveType::WeighingAndBalance)
            .await
            .unwrap();
        assert_eq!(event.sequence, 9);
        assert_eq!(storage.list_move_events(&run_id).await.unwrap().len(), 9);

        let err = service.rerun_move("run_missing", MoveType::Framing).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn fatal_errors_become_error_responses() {
        let (service, storage) = service(offline_llm()).await;
        let key = ArtifactKey::new("sc1", "not-a-framing");
        let response = service.read(&key, INLINE).await;
        assert_eq!(response.status, TabStatus::Error);
        assert!(response.trajectory.is_none());
        assert!(response.sheet.is_none());
        assert!(response.tab_id.is_none());
        assert!(response.errors[0].contains("not-a-framing"));
        assert!(storage.get_tab_by_key(&key).await.unwrap().is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("run").is_none());
        assert_eq!(json["status"], "error");
    }
}
