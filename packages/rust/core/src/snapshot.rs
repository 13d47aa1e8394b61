//! Dependency snapshot builder.
//!
//! Reads the fixed set of evidence-base signals a judgement artifact depends
//! on. Any change to a tracked signal changes the snapshot's content address,
//! which is the only staleness test the scheduler applies.
//!
//! | Signal | Source |
//! |---|---|
//! | `scenario_state_hash` | content address of the scenario's mutable state |
//! | `scenario_updated_at`, `framing_updated_at`, `project_updated_at` | record timestamps |
//! | `*_max_updated_at` | latest update per dependent record family |
//! | `doc_chunk_count`, `policy_clause_count`, `spatial_feature_count`, `instrument_output_count` | growing corpora |
//! | `ingest_completed_at` | latest completed ingestion for the project |

use std::sync::Arc;

use judgement_shared::{
    ArtifactKey, DependencySnapshot, JudgementError, Result, content_address,
};
use judgement_storage::{FramingRecord, ProjectSignals, ScenarioRecord, Storage};
use serde_json::Value;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct SnapshotBuilder {
    storage: Arc<Storage>,
}

impl SnapshotBuilder {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Build the live snapshot for an artifact key.
    ///
    /// A missing scenario or framing, or a framing that belongs to another
    /// scenario, is a fatal input error.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn snapshot(&self, key: &ArtifactKey) -> Result<DependencySnapshot> {
        let scenario = self.storage.get_scenario(&key.scenario_id).await?;
        let framing = self.storage.get_framing(&key.framing_id).await?;
        let signals = self.storage.project_signals(&scenario.project_id).await?;

        let snapshot = snapshot_from(&scenario, &framing, &signals)?;
        debug!(signals = snapshot.len(), "dependency snapshot built");
        Ok(snapshot)
    }
}

/// Assemble a snapshot from already-loaded records.
pub fn snapshot_from(
    scenario: &ScenarioRecord,
    framing: &FramingRecord,
    signals: &ProjectSignals,
) -> Result<DependencySnapshot> {
    if framing.scenario_id != scenario.id {
        return Err(JudgementError::validation(format!(
            "framing {} belongs to scenario {}, not {}",
            framing.id, framing.scenario_id, scenario.id
        )));
    }

    let opt = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);

    let mut s = DependencySnapshot::new();
    s.insert("scenario_state_hash", content_address(&scenario.state)?.to_string());
    s.insert("scenario_updated_at", scenario.updated_at.clone());
    s.insert("framing_updated_at", framing.updated_at.clone());
    s.insert("project_updated_at", opt(&signals.project_updated_at));
    s.insert("documents_max_updated_at", opt(&signals.documents_max_updated_at));
    s.insert("consultations_max_updated_at", opt(&signals.consultations_max_updated_at));
    s.insert("sites_max_updated_at", opt(&signals.sites_max_updated_at));
    s.insert(
        "site_assessments_max_updated_at",
        opt(&signals.site_assessments_max_updated_at),
    );
    s.insert("timetables_max_updated_at", opt(&signals.timetables_max_updated_at));
    s.insert("visual_assets_max_updated_at", opt(&signals.visual_assets_max_updated_at));
    s.insert("doc_chunk_count", signals.doc_chunk_count);
    s.insert("policy_clause_count", signals.policy_clause_count);
    s.insert("spatial_feature_count", signals.spatial_feature_count);
    s.insert("instrument_output_count", signals.instrument_output_count);
    s.insert("ingest_completed_at", opt(&signals.ingest_completed_at));
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_storage, test_key};
    use judgement_storage::{BundleChunk, EvidenceBundle};
    use serde_json::json;

    #[tokio::test]
    async fn unchanged_evidence_keeps_address() {
        let storage = Arc::new(seeded_storage().await);
        let builder = SnapshotBuilder::new(storage);
        let a = builder.snapshot(&test_key()).await.unwrap().address().unwrap();
        let b = builder.snapshot(&test_key()).await.unwrap().address().unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn new_document_chunk_changes_address() {
        let storage = Arc::new(seeded_storage().await);
        let builder = SnapshotBuilder::new(storage.clone());
        let before = builder.snapshot(&test_key()).await.unwrap();

        let mut bundle = EvidenceBundle::default();
        let mut doc = crate::testing::fixture_bundle().documents[0].clone();
        doc.chunks = vec![BundleChunk {
            id: "chunk-new".into(),
            page: Some(9),
            text: "Late representation on drainage.".into(),
        }];
        bundle.documents.push(doc);
        storage.import_bundle(&bundle).await.unwrap();

        let after = builder.snapshot(&test_key()).await.unwrap();
        assert_eq!(
            after.get("doc_chunk_count").unwrap().as_i64().unwrap(),
            before.get("doc_chunk_count").unwrap().as_i64().unwrap() + 1
        );
        assert_ne!(before.address().unwrap(), after.address().unwrap());
    }

    #[tokio::test]
    async fn missing_scenario_is_fatal() {
        let storage = Arc::new(seeded_storage().await);
        let builder = SnapshotBuilder::new(storage);
        let err = builder
            .snapshot(&ArtifactKey::new("nope", "framing-officer"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn mismatched_framing_is_rejected() {
        let scenario = ScenarioRecord {
            id: "a".into(),
            project_id: "p".into(),
            title: "t".into(),
            state: json!({}),
            updated_at: "x".into(),
        };
        let framing = FramingRecord {
            id: "f".into(),
            scenario_id: "b".into(),
            title: "t".into(),
            description: String::new(),
            updated_at: "x".into(),
        };
        let err = snapshot_from(&scenario, &framing, &ProjectSignals::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn scenario_state_edit_changes_address() {
        let mut scenario = ScenarioRecord {
            id: "a".into(),
            project_id: "p".into(),
            title: "t".into(),
            state: json!({"units": 120}),
            updated_at: "x".into(),
        };
        let framing = FramingRecord {
            id: "f".into(),
            scenario_id: "a".into(),
            title: "t".into(),
            description: String::new(),
            updated_at: "x".into(),
        };
        let signals = ProjectSignals::default();
        let a = snapshot_from(&scenario, &framing, &signals).unwrap().address().unwrap();
        scenario.state = json!({"units": 140});
        let b = snapshot_from(&scenario, &framing, &signals).unwrap().address().unwrap();
        assert_ne!(a, b);
    }
}
