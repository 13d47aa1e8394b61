//! Fixtures shared by the core test modules.

use std::sync::Arc;

use judgement_llm::{OfflineLlm, StructuredLlm};
use judgement_shared::{AppConfig, ArtifactKey, CacheBackend};
use judgement_storage::{EvidenceBundle, Storage};
use uuid::Uuid;

/// Empty, migrated storage in a temp file.
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("judgement_core_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// Storage seeded with [`fixture_bundle`].
pub(crate) async fn seeded_storage() -> Storage {
    let storage = test_storage().await;
    storage
        .import_bundle(&fixture_bundle())
        .await
        .expect("import fixture bundle");
    storage
}

pub(crate) fn test_key() -> ArtifactKey {
    ArtifactKey::new("sc1", "fr1")
}

/// Small budgets so tests exercise allocation and selection.
pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.cache.backend = CacheBackend::Storage;
    config.budgets.llm_time_budget_secs = 5;
    config.budgets.retrieval_time_budget_secs = 5;
    config.budgets.context_token_budget = 2_000;
    config.budgets.max_atoms_per_issue = 4;
    config.budgets.candidates_per_query = 5;
    config
}

pub(crate) fn offline_llm() -> Arc<dyn StructuredLlm> {
    Arc::new(OfflineLlm)
}

/// Riverside meadow: one scenario with a flood issue and a highways issue,
/// evidence for and against each, one site with constraint layers.
pub(crate) fn fixture_bundle() -> EvidenceBundle {
    EvidenceBundle::from_json(
        r#"{
          "projects": [{"id": "p1", "name": "Riverside", "updated_at": "2025-01-01T00:00:00Z"}],
          "scenarios": [{"id": "sc1", "project_id": "p1", "title": "Housing on the meadow",
                         "state": {"units": 120,
                                   "issues": [{"id": "flood", "title": "Flood risk",
                                               "description": "Flooding of the meadow and downstream homes"},
                                              {"id": "access", "title": "Highway access",
                                               "description": "Traffic onto Mill Lane"}]},
                         "updated_at": "2025-01-02T00:00:00Z"}],
          "framings": [{"id": "fr1", "scenario_id": "sc1", "title": "Officer view",
                        "description": "Balanced planning judgement", "updated_at": "2025-01-02T00:00:00Z"}],
          "documents": [{"id": "d1", "project_id": "p1", "title": "Flood Risk Assessment",
                         "updated_at": "2025-01-03T00:00:00Z",
                         "chunks": [{"id": "c1", "page": 4, "text": "The site lies in flood zone 3 with high flood risk."},
                                    {"id": "c2", "page": 5, "text": "Flood mitigation raises finished floor levels."},
                                    {"id": "c3", "page": 9, "text": "Residual flood harm remains an adverse impact downstream."}]},
                        {"id": "d2", "project_id": "p1", "title": "Transport Statement",
                         "updated_at": "2025-01-03T00:00:00Z",
                         "chunks": [{"id": "c4", "page": 2, "text": "Highway access onto Mill Lane has adequate visibility."},
                                    {"id": "c5", "page": 3, "text": "Peak traffic will cause adverse impact at the junction."}]}],
          "policy_clauses": [{"id": "pc1", "plan_id": "lp", "policy_code": "EN4", "clause_ref": "EN4.1",
                              "title": "Flood risk", "text": "Development in flood zone 3 must pass the sequential test."},
                             {"id": "pc2", "plan_id": "lp", "policy_code": "EN4", "clause_ref": "EN4.3",
                              "title": "Flood exception", "text": "An exception test applies where flood harm is outweighed by mitigation."},
                             {"id": "pc3", "plan_id": "lp", "policy_code": "T2", "clause_ref": "T2.1",
                              "title": "Highway safety", "text": "Highway access must be safe for all users."}],
          "consultations": [{"id": "cons1", "project_id": "p1", "title": "Environment Agency",
                             "summary": "Objects unless flood mitigation is secured.",
                             "updated_at": "2025-01-04T00:00:00Z"}],
          "sites": [{"id": "s1", "project_id": "p1", "name": "Meadow", "updated_at": "2025-01-01T00:00:00Z",
                     "spatial_features": [{"id": "sf1", "layer": "flood_zone_3", "feature_name": "FZ3", "overlap_pct": 40.0},
                                          {"id": "sf2", "layer": "conservation_area", "feature_name": "Old Town", "distance_m": 120.0}],
                     "assessments": [{"id": "sa1", "summary": "Greenfield, gently sloping", "updated_at": "2025-01-01T00:00:00Z"}]}],
          "visual_assets": [{"id": "v1", "project_id": "p1", "site_id": "s1", "asset_kind": "photo",
                             "uri": "file:///v1.jpg", "caption": "View across the meadow",
                             "updated_at": "2025-01-01T00:00:00Z"}],
          "instrument_outputs": [{"id": "io1", "project_id": "p1", "instrument_id": "flood_model",
                                  "tool_run_id": "tr1", "output": {"depth_m": 0.6},
                                  "created_at": "2025-01-05T00:00:00Z"}],
          "ingest_runs": [{"id": "ir1", "project_id": "p1", "completed_at": "2025-01-05T00:00:00Z"}]
        }"#,
    )
    .expect("fixture bundle parses")
}
