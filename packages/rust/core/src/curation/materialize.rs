//! Turning selected candidates into persisted evidence atoms.

use std::collections::HashSet;

use chrono::Utc;
use judgement_shared::{EvidenceAtom, EvidencePayload, IssueEvidence, Provenance};
use judgement_storage::Storage;
use serde_json::Value;

use super::candidates::{CandidatePool, PooledCandidate};
use crate::gateway::MoveTrace;

const EXCERPT_CHARS: usize = 600;

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}…", cut.trim_end())
}

fn excerpt(payload: &EvidencePayload) -> String {
    match payload {
        EvidencePayload::PolicyClause { clause_ref, text, .. } => {
            truncate(&format!("{clause_ref}: {text}"), EXCERPT_CHARS)
        }
        EvidencePayload::DocChunk { text, .. } => truncate(text, EXCERPT_CHARS),
        EvidencePayload::SiteFingerprint { site_name, layers, constraint_count, .. } => format!(
            "{site_name}: {constraint_count} constraint(s) across {}",
            if layers.is_empty() { "no layers".to_string() } else { layers.join(", ") }
        ),
        EvidencePayload::SpatialFeature { layer, feature_name, overlap_pct, distance_m, .. } => {
            match (overlap_pct, distance_m) {
                (Some(pct), _) => format!("{feature_name} ({layer}) overlaps the site by {pct:.0}%"),
                (None, Some(d)) => format!("{feature_name} ({layer}) lies {d:.0} m from the site"),
                (None, None) => format!("{feature_name} ({layer}) intersects the site"),
            }
        }
        EvidencePayload::VisualAsset { asset_kind, caption, .. } => format!("{asset_kind}: {caption}"),
        EvidencePayload::InstrumentOutput { instrument_id, output, .. } => {
            truncate(&format!("{instrument_id}: {output}"), EXCERPT_CHARS)
        }
    }
}

fn source_table(payload: &EvidencePayload) -> &'static str {
    match payload {
        EvidencePayload::PolicyClause { .. } => "policy_clauses",
        EvidencePayload::DocChunk { .. } => "chunks",
        EvidencePayload::SiteFingerprint { .. } => "sites",
        EvidencePayload::SpatialFeature { .. } => "spatial_features",
        EvidencePayload::VisualAsset { .. } => "visual_assets",
        EvidencePayload::InstrumentOutput { .. } => "tool_outputs",
    }
}

fn limitations(payload: &EvidencePayload) -> String {
    let text = match payload {
        EvidencePayload::PolicyClause { .. } => {
            "Clause text only; supporting justification and cross-references are not included."
        }
        EvidencePayload::DocChunk { .. } => {
            "Excerpt from a longer document; surrounding context may qualify it."
        }
        EvidencePayload::SiteFingerprint { .. } => {
            "Summary of precomputed constraint layers; not a site survey."
        }
        EvidencePayload::SpatialFeature { .. } => {
            "Precomputed intersection; accuracy depends on the source layer."
        }
        EvidencePayload::VisualAsset { .. } => "Caption only; the image itself has not been interpreted.",
        EvidencePayload::InstrumentOutput { .. } => {
            "Model output; depends on the instrument's inputs and assumptions."
        }
    };
    text.to_string()
}

/// Payload fields other than long text, for atom metadata.
fn metadata(payload: &EvidencePayload) -> Value {
    let mut value = serde_json::to_value(payload).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("text");
    }
    value
}

pub fn build_atom(pooled: &PooledCandidate, run_id: &str) -> EvidenceAtom {
    let candidate = &pooled.candidate;
    EvidenceAtom {
        evidence_ref: candidate.evidence_ref.clone(),
        evidence_type: candidate.kind(),
        title: candidate.title.clone(),
        summary: candidate.summary.clone(),
        excerpt: excerpt(&candidate.payload),
        provenance: Provenance {
            source_table: source_table(&candidate.payload).to_string(),
            source_id: candidate.payload.record_id().to_string(),
            run_id: run_id.to_string(),
            query_ids: pooled.query_ids.clone(),
        },
        limitations: limitations(&candidate.payload),
        metadata: metadata(&candidate.payload),
        approx_token_cost: candidate.approx_token_cost,
        created_at: Utc::now(),
    }
}

/// One atom per distinct selected ref, in selection order.
///
/// Atoms are immutable: a ref materialized by an earlier run keeps its stored
/// row. Write failures are recorded on the trace and the in-memory atom is used.
pub async fn materialize(
    storage: &Storage,
    run_id: &str,
    selections: &[IssueEvidence],
    pool: &CandidatePool,
    trace: &mut MoveTrace,
) -> Vec<EvidenceAtom> {
    let mut seen = HashSet::new();
    let mut atoms = Vec::new();

    for r in selections.iter().flat_map(|s| s.all_refs()) {
        if !seen.insert(r.clone()) {
            continue;
        }
        let Some(pooled) = pool.get(r) else {
            continue;
        };
        let atom = build_atom(pooled, run_id);
        match storage.insert_atom(&atom).await {
            Ok(true) => atoms.push(atom),
            Ok(false) => match storage.get_atom(r).await {
                Ok(Some(stored)) => atoms.push(stored),
                Ok(None) => atoms.push(atom),
                Err(e) => {
                    trace.persistence_error(format!("evidence atom {r}: {e}"));
                    atoms.push(atom);
                }
            },
            Err(e) => {
                trace.persistence_error(format!("evidence atom {r}: {e}"));
                atoms.push(atom);
            }
        }
    }
    atoms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;
    use judgement_shared::{EvidenceCandidate, EvidenceKind, Modality, QueryRole, QuerySource, RetrievalQuery};

    fn pool() -> CandidatePool {
        let query = RetrievalQuery {
            id: "q001".into(),
            issue_id: "flood".into(),
            role: QueryRole::Primary,
            modality: Modality::Spatial,
            text: String::new(),
            site_id: Some("s1".into()),
            limit: 5,
            source: QuerySource::Template,
        };
        let mut pool = CandidatePool::default();
        pool.add(
            EvidenceCandidate::new(
                "Flood zone 3",
                "",
                EvidencePayload::SpatialFeature {
                    feature_id: "sf1".into(),
                    site_id: "s1".into(),
                    layer: "flood_zone_3".into(),
                    feature_name: "FZ3".into(),
                    overlap_pct: Some(40.0),
                    distance_m: None,
                },
            ),
            &query,
        );
        pool.add(
            EvidenceCandidate::new(
                "FRA p.4",
                "",
                EvidencePayload::DocChunk {
                    chunk_id: "c1".into(),
                    document_id: "d1".into(),
                    document_title: "Flood Risk Assessment".into(),
                    page: Some(4),
                    text: "x".repeat(2_000),
                    score: 1.0,
                },
            ),
            &query,
        );
        pool
    }

    #[test]
    fn atoms_carry_provenance_and_short_excerpts() {
        let pool = pool();
        let atom = build_atom(pool.get("spatial_feature::sf1").unwrap(), "run1");
        assert_eq!(atom.evidence_type, EvidenceKind::SpatialFeature);
        assert_eq!(atom.excerpt, "FZ3 (flood_zone_3) overlaps the site by 40%");
        assert_eq!(atom.provenance.source_table, "spatial_features");
        assert_eq!(atom.provenance.query_ids, ["q001"]);

        let chunk = build_atom(pool.get("doc_chunk::c1").unwrap(), "run1");
        assert!(chunk.excerpt.chars().count() <= EXCERPT_CHARS + 1);
        assert!(chunk.metadata.get("text").is_none());
        assert_eq!(chunk.metadata["document_title"], "Flood Risk Assessment");
    }

    #[tokio::test]
    async fn shared_refs_materialize_once_and_stay_immutable() {
        let storage = test_storage().await;
        let pool = pool();
        let mut a = IssueEvidence::new("flood");
        a.supporting = vec!["spatial_feature::sf1".into(), "doc_chunk::c1".into()];
        let mut b = IssueEvidence::new("access");
        b.contextual = vec!["spatial_feature::sf1".into()];

        let mut trace = MoveTrace::default();
        let first = materialize(&storage, "run1", &[a.clone(), b], &pool, &mut trace).await;
        assert_eq!(first.len(), 2);
        assert!(trace.persistence_errors.is_empty());

        let second = materialize(&storage, "run2", &[a], &pool, &mut trace).await;
        assert_eq!(second[0].provenance.run_id, "run1");
    }
}
