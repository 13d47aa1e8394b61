//! Candidate pool generation across modalities.

use std::collections::HashMap;
use std::time::Duration;

use judgement_shared::{
    EvidenceCandidate, EvidenceRole, JudgementError, Modality, QueryRole, Result, RetrievalQuery,
};
use tracing::{debug, warn};

use crate::retrieval::{EvidenceRetriever, ImageryFilter, TextQuery};

/// Evidence role a candidate is expected to play, from the query that found it.
pub fn role_for_query(role: QueryRole) -> EvidenceRole {
    match role {
        QueryRole::Primary => EvidenceRole::Supporting,
        QueryRole::Countervailing => EvidenceRole::Countervailing,
        QueryRole::Contextual => EvidenceRole::Contextual,
    }
}

/// One deduplicated candidate and everything that surfaced it.
#[derive(Debug, Clone)]
pub struct PooledCandidate {
    pub candidate: EvidenceCandidate,
    /// `(issue_id, role)` pairs, in discovery order.
    pub attachments: Vec<(String, EvidenceRole)>,
    pub query_ids: Vec<String>,
}

impl PooledCandidate {
    pub fn attached_to(&self, issue_id: &str) -> bool {
        self.attachments.iter().any(|(i, _)| i == issue_id)
    }

    pub fn has_role(&self, issue_id: &str, role: EvidenceRole) -> bool {
        self.attachments.iter().any(|(i, r)| i == issue_id && *r == role)
    }

    pub fn evidence_ref(&self) -> &str {
        &self.candidate.evidence_ref
    }
}

/// Candidates generated for one curation run, unique by evidence ref.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    entries: Vec<PooledCandidate>,
    index: HashMap<String, usize>,
}

impl CandidatePool {
    pub fn add(&mut self, candidate: EvidenceCandidate, query: &RetrievalQuery) {
        let attachment = (query.issue_id.clone(), role_for_query(query.role));
        let i = match self.index.get(&candidate.evidence_ref) {
            Some(&i) => i,
            None => {
                let i = self.entries.len();
                self.index.insert(candidate.evidence_ref.clone(), i);
                self.entries.push(PooledCandidate {
                    candidate,
                    attachments: Vec::new(),
                    query_ids: Vec::new(),
                });
                i
            }
        };
        let entry = &mut self.entries[i];
        if !entry.attachments.contains(&attachment) {
            entry.attachments.push(attachment);
        }
        if !entry.query_ids.contains(&query.id) {
            entry.query_ids.push(query.id.clone());
        }
    }

    pub fn get(&self, evidence_ref: &str) -> Option<&PooledCandidate> {
        self.index.get(evidence_ref).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, evidence_ref: &str) -> bool {
        self.index.contains_key(evidence_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PooledCandidate> {
        self.entries.iter()
    }

    /// Candidates attached to `issue_id` in `role`, in discovery order.
    pub fn for_issue_role<'a>(
        &'a self,
        issue_id: &'a str,
        role: EvidenceRole,
    ) -> impl Iterator<Item = &'a PooledCandidate> + 'a {
        self.entries.iter().filter(move |c| c.has_role(issue_id, role))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Dispatch one query to the collaborator for its modality.
async fn dispatch(
    retriever: &dyn EvidenceRetriever,
    project_id: &str,
    query: &RetrievalQuery,
) -> Result<Vec<EvidenceCandidate>> {
    let limit = query.limit as usize;
    match query.modality {
        Modality::Text => {
            retriever
                .retrieve_text(&TextQuery {
                    project_id: project_id.to_string(),
                    text: query.text.clone(),
                    limit: query.limit,
                })
                .await
        }
        Modality::Spatial => {
            let site_id = query
                .site_id
                .as_deref()
                .ok_or_else(|| JudgementError::Retrieval("spatial query without a site".into()))?;
            let mut found = retriever
                .retrieve_spatial_intersections(site_id)
                .await?
                .into_candidates();
            found.truncate(limit);
            Ok(found)
        }
        Modality::Visual => {
            retriever
                .retrieve_imagery(&ImageryFilter {
                    project_id: project_id.to_string(),
                    site_id: query.site_id.clone(),
                    limit: query.limit,
                })
                .await
        }
        Modality::Instrument => {
            let instrument = query.text.trim();
            retriever
                .instrument_outputs(
                    project_id,
                    (!instrument.is_empty()).then_some(instrument),
                    query.limit,
                )
                .await
        }
    }
}

/// Run every query, one at a time, into a deduplicated pool.
///
/// A failing or slow query contributes nothing and adds an error; it never
/// aborts the others.
pub async fn gather(
    retriever: &dyn EvidenceRetriever,
    project_id: &str,
    queries: &[RetrievalQuery],
    time_budget: Duration,
) -> (CandidatePool, Vec<String>) {
    let mut pool = CandidatePool::default();
    let mut errors = Vec::new();

    for query in queries {
        let outcome = tokio::time::timeout(time_budget, dispatch(retriever, project_id, query)).await;
        match outcome {
            Ok(Ok(found)) => {
                debug!(query_id = %query.id, hits = found.len(), "query retrieved");
                for candidate in found {
                    pool.add(candidate, query);
                }
            }
            Ok(Err(e)) => {
                warn!(query_id = %query.id, error = %e, "retrieval failed");
                errors.push(format!("query {} ({:?}): {e}", query.id, query.modality));
            }
            Err(_) => {
                let e = JudgementError::timeout(format!("query {}", query.id), time_budget);
                warn!(query_id = %query.id, "retrieval timed out");
                errors.push(e.to_string());
            }
        }
    }
    (pool, errors)
}
