//! Modality-specific retrieval collaborators.
//!
//! The curation engine and the pipeline only see [`EvidenceRetriever`]. The
//! shipped implementation reads the evidence base through [`Storage`]: text
//! retrieval runs FTS5 over policy clauses and document chunks, and spatial
//! intersections come from the precomputed `spatial_features` table.

use std::sync::Arc;

use async_trait::async_trait;
use judgement_shared::{EvidenceCandidate, JudgementError, Result};
use judgement_storage::Storage;

#[derive(Debug, Clone)]
pub struct TextQuery {
    pub project_id: String,
    pub text: String,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct ImageryFilter {
    pub project_id: String,
    pub site_id: Option<String>,
    pub limit: u32,
}

/// Result of a geospatial intersection for one site.
#[derive(Debug, Clone, Default)]
pub struct SpatialIntersections {
    pub fingerprint: Option<EvidenceCandidate>,
    pub features: Vec<EvidenceCandidate>,
}

impl SpatialIntersections {
    /// Fingerprint first, then individual features.
    pub fn into_candidates(self) -> Vec<EvidenceCandidate> {
        self.fingerprint.into_iter().chain(self.features).collect()
    }
}

#[async_trait]
pub trait EvidenceRetriever: Send + Sync {
    /// Hybrid text retrieval over policy and project documents.
    async fn retrieve_text(&self, query: &TextQuery) -> Result<Vec<EvidenceCandidate>>;

    async fn retrieve_spatial_intersections(&self, site_id: &str) -> Result<SpatialIntersections>;

    async fn retrieve_imagery(&self, filter: &ImageryFilter) -> Result<Vec<EvidenceCandidate>>;

    /// Previously executed instrument outputs, newest first.
    async fn instrument_outputs(
        &self,
        project_id: &str,
        instrument_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EvidenceCandidate>>;
}

pub struct StorageRetriever {
    storage: Arc<Storage>,
}

impl StorageRetriever {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

fn retrieval_err(what: &str, e: JudgementError) -> JudgementError {
    JudgementError::Retrieval(format!("{what}: {e}"))
}

/// Alternate two ranked lists, keeping each list's own order.
fn interleave(a: Vec<EvidenceCandidate>, b: Vec<EvidenceCandidate>, limit: usize) -> Vec<EvidenceCandidate> {
    let mut out = Vec::with_capacity(limit.min(a.len() + b.len()));
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        let (x, y) = (a.next(), b.next());
        if x.is_none() && y.is_none() {
            break;
        }
        out.extend(x);
        out.extend(y);
    }
    out.truncate(limit);
    out
}

#[async_trait]
impl EvidenceRetriever for StorageRetriever {
    async fn retrieve_text(&self, query: &TextQuery) -> Result<Vec<EvidenceCandidate>> {
        let clauses = self
            .storage
            .search_policy_clauses(&query.text, query.limit)
            .await
            .map_err(|e| retrieval_err("policy search", e))?;
        let chunks = self
            .storage
            .search_doc_chunks(&query.project_id, &query.text, query.limit)
            .await
            .map_err(|e| retrieval_err("document search", e))?;
        Ok(interleave(clauses, chunks, query.limit as usize))
    }

    async fn retrieve_spatial_intersections(&self, site_id: &str) -> Result<SpatialIntersections> {
        let fingerprint = self
            .storage
            .site_fingerprint(site_id)
            .await
            .map_err(|e| retrieval_err("site fingerprint", e))?;
        let features = self
            .storage
            .spatial_features(site_id)
            .await
            .map_err(|e| retrieval_err("spatial features", e))?;
        Ok(SpatialIntersections { fingerprint, features })
    }

    async fn retrieve_imagery(&self, filter: &ImageryFilter) -> Result<Vec<EvidenceCandidate>> {
        self.storage
            .visual_assets(&filter.project_id, filter.site_id.as_deref(), filter.limit)
            .await
            .map_err(|e| retrieval_err("imagery catalogue", e))
    }

    async fn instrument_outputs(
        &self,
        project_id: &str,
        instrument_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EvidenceCandidate>> {
        self.storage
            .instrument_outputs(project_id, instrument_id, limit)
            .await
            .map_err(|e| retrieval_err("instrument outputs", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::seeded_storage;
    use judgement_shared::EvidenceKind;

    #[tokio::test]
    async fn text_retrieval_mixes_policy_and_documents() {
        let retriever = StorageRetriever::new(Arc::new(seeded_storage().await));
        let hits = retriever
            .retrieve_text(&TextQuery {
                project_id: "p1".into(),
                text: "flood zone".into(),
                limit: 4,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].kind(), EvidenceKind::PolicyClause);
        assert_eq!(hits[1].kind(), EvidenceKind::DocChunk);
    }

    #[tokio::test]
    async fn unsearchable_text_returns_nothing() {
        let retriever = StorageRetriever::new(Arc::new(seeded_storage().await));
        let hits = retriever
            .retrieve_text(&TextQuery {
                project_id: "p1".into(),
                text: "- ! ?".into(),
                limit: 4,
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn spatial_intersections_lead_with_fingerprint() {
        let retriever = StorageRetriever::new(Arc::new(seeded_storage().await));
        let candidates = retriever
            .retrieve_spatial_intersections("s1")
            .await
            .unwrap()
            .into_candidates();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].evidence_ref, "site_fingerprint::s1");

        let none = retriever.retrieve_spatial_intersections("missing").await.unwrap();
        assert!(none.fingerprint.is_none());
        assert!(none.features.is_empty());
    }

    #[tokio::test]
    async fn imagery_and_instruments() {
        let retriever = StorageRetriever::new(Arc::new(seeded_storage().await));
        let imagery = retriever
            .retrieve_imagery(&ImageryFilter {
                project_id: "p1".into(),
                site_id: Some("s1".into()),
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(imagery[0].evidence_ref, "visual_asset::v1");

        let outputs = retriever.instrument_outputs("p1", Some("flood_model"), 5).await.unwrap();
        assert_eq!(outputs[0].evidence_ref, "instrument_output::io1");
        assert!(retriever.instrument_outputs("p1", Some("noise_model"), 5).await.unwrap().is_empty());
    }
}
