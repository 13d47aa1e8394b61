//! Context candidates for each move, drawn from the run state.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use judgement_shared::{
    ContextItem, EvidenceCandidate, JudgementError, MoveType, Result, SliceType,
};
use serde_json::{Value, json};

use super::stages::RunState;
use crate::context::{CandidatePool, DataFacts};
use crate::retrieval::{EvidenceRetriever, ImageryFilter, TextQuery};

/// Evidence loaded once per run, independent of curation.
#[derive(Debug, Clone, Default)]
pub struct Background {
    pub text: Vec<EvidenceCandidate>,
    pub fingerprints: Vec<EvidenceCandidate>,
    pub spatial: Vec<EvidenceCandidate>,
    pub visual: Vec<EvidenceCandidate>,
    pub instrument: Vec<EvidenceCandidate>,
}

impl Background {
    fn all(&self) -> impl Iterator<Item = &EvidenceCandidate> {
        self.text
            .iter()
            .chain(&self.fingerprints)
            .chain(&self.spatial)
            .chain(&self.visual)
            .chain(&self.instrument)
    }

    pub fn refs(&self) -> impl Iterator<Item = String> + '_ {
        self.all().map(|c| c.evidence_ref.clone())
    }
}

async fn bounded<T>(what: &str, budget: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| JudgementError::timeout(what, budget))?
}

/// Load background evidence, one bounded call at a time. Failures leave that
/// part empty and are returned as messages.
pub async fn load_background(
    retriever: &dyn EvidenceRetriever,
    project_id: &str,
    query_text: &str,
    site_ids: &[String],
    limit: u32,
    budget: Duration,
) -> (Background, Vec<String>) {
    let mut background = Background::default();
    let mut errors = Vec::new();

    let text = TextQuery {
        project_id: project_id.to_string(),
        text: query_text.to_string(),
        limit,
    };
    match bounded("background text retrieval", budget, retriever.retrieve_text(&text)).await {
        Ok(found) => background.text = found,
        Err(e) => errors.push(e.to_string()),
    }

    for site in site_ids {
        let what = format!("spatial intersections for site {site}");
        match bounded(&what, budget, retriever.retrieve_spatial_intersections(site)).await {
            Ok(found) => {
                background.fingerprints.extend(found.fingerprint);
                background.spatial.extend(found.features);
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    let imagery = ImageryFilter {
        project_id: project_id.to_string(),
        site_id: None,
        limit,
    };
    match bounded("imagery catalogue", budget, retriever.retrieve_imagery(&imagery)).await {
        Ok(found) => background.visual = found,
        Err(e) => errors.push(e.to_string()),
    }

    match bounded(
        "instrument outputs",
        budget,
        retriever.instrument_outputs(project_id, None, limit),
    )
    .await
    {
        Ok(found) => background.instrument = found,
        Err(e) => errors.push(e.to_string()),
    }

    (background, errors)
}

pub fn data_facts(state: &RunState) -> DataFacts {
    DataFacts {
        has_sites: !state.sites.is_empty(),
        has_visual_assets: !state.background.visual.is_empty(),
        has_instrument_outputs: !state.background.instrument.is_empty(),
        has_consultations: !state.consultations.is_empty(),
        has_curated_evidence: state
            .curated
            .as_ref()
            .is_some_and(|c| !c.evidence_atoms.is_empty()),
    }
}

/// Curation output trimmed to what later moves need.
fn prior_payload(move_type: MoveType, outputs: &Value) -> Value {
    if move_type != MoveType::EvidenceCuration {
        return outputs.clone();
    }
    json!({
        "evidence_by_issue": outputs.get("evidence_by_issue").cloned().unwrap_or(Value::Null),
        "deliberate_omissions": outputs.get("deliberate_omissions").cloned().unwrap_or(Value::Null),
        "tool_requests": outputs.get("tool_requests").cloned().unwrap_or(Value::Null),
    })
}

/// Every candidate item the selector may draw on, by slice.
///
/// Curated atoms take precedence over background candidates with the same ref.
pub fn context_pool(state: &RunState) -> CandidatePool {
    let mut pool = CandidatePool::new();

    let mut scenario = json!({
        "title": state.scenario.title,
        "state": state.scenario.state,
        "framing": {"title": state.framing.title, "description": state.framing.description},
    });
    if let Some(framed) = &state.framed {
        scenario["frame_statement"] = json!(framed.frame_statement);
    }
    if !state.issues.is_empty() {
        scenario["issues"] = json!(state.issues);
    }
    pool.entry(SliceType::ScenarioState)
        .or_default()
        .push(ContextItem::new(format!("scenario::{}", state.scenario.id), scenario));

    for (move_type, outputs) in &state.prior {
        pool.entry(SliceType::PriorMoves).or_default().push(ContextItem::new(
            format!("move::{}", move_type.as_str()),
            prior_payload(*move_type, outputs),
        ));
    }

    for c in &state.consultations {
        pool.entry(SliceType::ConsultationSummaries)
            .or_default()
            .push(ContextItem::new(
                format!("consultation::{}", c.id),
                json!({"title": c.title, "summary": c.summary}),
            ));
    }

    let mut seen = HashSet::new();
    if let Some(curated) = &state.curated {
        for atom in &curated.evidence_atoms {
            if !seen.insert(atom.evidence_ref.clone()) {
                continue;
            }
            let item = ContextItem {
                item_ref: atom.evidence_ref.clone(),
                approx_token_cost: atom.approx_token_cost.max(1),
                payload: json!({
                    "title": atom.title,
                    "summary": atom.summary,
                    "excerpt": atom.excerpt,
                    "limitations": atom.limitations,
                }),
            };
            pool.entry(SliceType::for_evidence(atom.evidence_type))
                .or_default()
                .push(item);
        }
    }
    for candidate in state.background.all() {
        if !seen.insert(candidate.evidence_ref.clone()) {
            continue;
        }
        let item = ContextItem {
            item_ref: candidate.evidence_ref.clone(),
            approx_token_cost: candidate.approx_token_cost.max(1),
            payload: json!({"title": candidate.title, "summary": candidate.summary}),
        };
        pool.entry(SliceType::for_evidence(candidate.kind()))
            .or_default()
            .push(item);
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::StorageRetriever;
    use crate::testing::seeded_storage;
    use judgement_shared::{CuratedEvidenceSet, EvidenceAtom, EvidenceKind, Provenance};
    use judgement_storage::{ConsultationRecord, FramingRecord, ScenarioRecord, SiteRecord};
    use std::sync::Arc;

    async fn background() -> Background {
        let storage = Arc::new(seeded_storage().await);
        let retriever = StorageRetriever::new(storage);
        let (background, errors) = load_background(
            &retriever,
            "p1",
            "Housing on the meadow flood",
            &["s1".to_string()],
            5,
            Duration::from_secs(5),
        )
        .await;
        assert!(errors.is_empty(), "{errors:?}");
        background
    }

    fn state(background: Background) -> RunState {
        RunState::new(
            "run1",
            ScenarioRecord {
                id: "sc1".into(),
                project_id: "p1".into(),
                title: "Housing on the meadow".into(),
                state: json!({"units": 120}),
                updated_at: String::new(),
            },
            FramingRecord {
                id: "fr1".into(),
                scenario_id: "sc1".into(),
                title: "Officer view".into(),
                description: String::new(),
                updated_at: String::new(),
            },
            vec![SiteRecord {
                id: "s1".into(),
                project_id: "p1".into(),
                name: "Meadow".into(),
            }],
            vec![ConsultationRecord {
                id: "cons1".into(),
                title: "Environment Agency".into(),
                summary: "Objects".into(),
            }],
            background,
        )
    }

    #[tokio::test]
    async fn background_covers_every_modality() {
        let background = background().await;
        assert!(!background.text.is_empty());
        assert_eq!(background.fingerprints.len(), 1);
        assert_eq!(background.spatial.len(), 2);
        assert_eq!(background.visual.len(), 1);
        assert_eq!(background.instrument.len(), 1);
    }

    #[tokio::test]
    async fn pool_prefers_curated_atoms() {
        let mut state = state(background().await);
        let facts = data_facts(&state);
        assert!(facts.has_sites && facts.has_consultations && facts.has_visual_assets);
        assert!(!facts.has_curated_evidence);

        state.curated = Some(CuratedEvidenceSet {
            evidence_atoms: vec![EvidenceAtom {
                evidence_ref: "spatial_feature::sf1".into(),
                evidence_type: EvidenceKind::SpatialFeature,
                title: "FZ3".into(),
                summary: "curated".into(),
                excerpt: "FZ3 overlaps".into(),
                provenance: Provenance {
                    source_table: "spatial_features".into(),
                    source_id: "sf1".into(),
                    run_id: "run1".into(),
                    query_ids: vec![],
                },
                limitations: String::new(),
                metadata: json!({}),
                approx_token_cost: 12,
                created_at: chrono::Utc::now(),
            }],
            ..Default::default()
        });
        state.record(MoveType::Framing, json!({"frame_statement": "x"}));
        assert!(data_facts(&state).has_curated_evidence);

        let pool = context_pool(&state);
        let spatial = &pool[&SliceType::SpatialFeatures];
        assert_eq!(spatial.len(), 2);
        assert_eq!(spatial[0].payload["summary"], "curated");
        assert_eq!(pool[&SliceType::PriorMoves][0].item_ref, "move::framing");
        assert_eq!(pool[&SliceType::ScenarioState][0].item_ref, "scenario::sc1");
        assert_eq!(pool[&SliceType::ConsultationSummaries][0].item_ref, "consultation::cons1");
    }
}
