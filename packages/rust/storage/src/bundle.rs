//! Bulk import of an evidence bundle.
//!
//! The evidence base is owned by external ingestion. A bundle is the JSON
//! interchange format used to seed or refresh it: every record is upserted by
//! id so re-importing an edited bundle moves the affected `updated_at` signals.

use chrono::Utc;
use judgement_shared::{JudgementError, Result};
use libsql::params;
use serde::{Deserialize, Serialize};

use crate::{Storage, to_json};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    #[serde(default)]
    pub projects: Vec<BundleProject>,
    #[serde(default)]
    pub scenarios: Vec<BundleScenario>,
    #[serde(default)]
    pub framings: Vec<BundleFraming>,
    #[serde(default)]
    pub documents: Vec<BundleDocument>,
    #[serde(default)]
    pub policy_clauses: Vec<BundlePolicyClause>,
    #[serde(default)]
    pub consultations: Vec<BundleConsultation>,
    #[serde(default)]
    pub timetables: Vec<BundleTimetable>,
    #[serde(default)]
    pub sites: Vec<BundleSite>,
    #[serde(default)]
    pub visual_assets: Vec<BundleVisualAsset>,
    #[serde(default)]
    pub instrument_outputs: Vec<BundleInstrumentOutput>,
    #[serde(default)]
    pub ingest_runs: Vec<BundleIngestRun>,
}

impl EvidenceBundle {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| JudgementError::validation(format!("invalid evidence bundle: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleProject {
    pub id: String,
    pub name: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleScenario {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleFraming {
    pub id: String,
    pub scenario_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleChunk {
    pub id: String,
    #[serde(default)]
    pub page: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDocument {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
    #[serde(default)]
    pub chunks: Vec<BundleChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePolicyClause {
    pub id: String,
    pub plan_id: String,
    pub policy_code: String,
    pub clause_ref: String,
    pub title: String,
    pub text: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConsultation {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub summary: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleTimetable {
    pub id: String,
    pub project_id: String,
    pub label: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSpatialFeature {
    pub id: String,
    pub layer: String,
    pub feature_name: String,
    #[serde(default)]
    pub overlap_pct: Option<f64>,
    #[serde(default)]
    pub distance_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleAssessment {
    pub id: String,
    pub summary: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSite {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub scenario_id: Option<String>,
    pub name: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
    #[serde(default)]
    pub spatial_features: Vec<BundleSpatialFeature>,
    #[serde(default)]
    pub assessments: Vec<BundleAssessment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleVisualAsset {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
    pub asset_kind: String,
    pub uri: String,
    pub caption: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInstrumentOutput {
    pub id: String,
    pub project_id: String,
    pub instrument_id: String,
    pub tool_run_id: String,
    pub output: serde_json::Value,
    #[serde(default = "now_rfc3339")]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleIngestRun {
    pub id: String,
    pub project_id: String,
    #[serde(default = "now_rfc3339")]
    pub completed_at: String,
}

/// Rows written per record family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub projects: usize,
    pub scenarios: usize,
    pub framings: usize,
    pub documents: usize,
    pub doc_chunks: usize,
    pub policy_clauses: usize,
    pub consultations: usize,
    pub timetables: usize,
    pub sites: usize,
    pub spatial_features: usize,
    pub site_assessments: usize,
    pub visual_assets: usize,
    pub instrument_outputs: usize,
    pub ingest_runs: usize,
}

impl Storage {
    /// Upsert every record of a bundle, parents before children.
    pub async fn import_bundle(&self, bundle: &EvidenceBundle) -> Result<ImportSummary> {
        self.check_writable()?;
        let mut summary = ImportSummary::default();

        for p in &bundle.projects {
            self.execute(
                "INSERT INTO projects (id, name, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
                params![p.id.as_str(), p.name.as_str(), p.updated_at.as_str()],
            )
            .await?;
            summary.projects += 1;
        }

        for s in &bundle.scenarios {
            self.execute(
                "INSERT INTO scenarios (id, project_id, title, state_json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id, title = excluded.title,
                 state_json = excluded.state_json, updated_at = excluded.updated_at",
                params![
                    s.id.as_str(),
                    s.project_id.as_str(),
                    s.title.as_str(),
                    to_json(&s.state)?,
                    s.updated_at.as_str()
                ],
            )
            .await?;
            summary.scenarios += 1;
        }

        for f in &bundle.framings {
            self.execute(
                "INSERT INTO framings (id, scenario_id, title, description, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET scenario_id = excluded.scenario_id, title = excluded.title,
                 description = excluded.description, updated_at = excluded.updated_at",
                params![
                    f.id.as_str(),
                    f.scenario_id.as_str(),
                    f.title.as_str(),
                    f.description.as_str(),
                    f.updated_at.as_str()
                ],
            )
            .await?;
            summary.framings += 1;
        }

        for d in &bundle.documents {
            self.execute(
                "INSERT INTO documents (id, project_id, title, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id, title = excluded.title,
                 updated_at = excluded.updated_at",
                params![d.id.as_str(), d.project_id.as_str(), d.title.as_str(), d.updated_at.as_str()],
            )
            .await?;
            summary.documents += 1;

            for c in &d.chunks {
                self.execute(
                    "INSERT INTO doc_chunks (id, document_id, project_id, page, text) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET document_id = excluded.document_id,
                     project_id = excluded.project_id, page = excluded.page, text = excluded.text",
                    params![
                        c.id.as_str(),
                        d.id.as_str(),
                        d.project_id.as_str(),
                        c.page.map(|p| p as i64),
                        c.text.as_str()
                    ],
                )
                .await?;
                summary.doc_chunks += 1;
            }
        }

        for pc in &bundle.policy_clauses {
            self.execute(
                "INSERT INTO policy_clauses (id, plan_id, policy_code, clause_ref, title, text, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET plan_id = excluded.plan_id, policy_code = excluded.policy_code,
                 clause_ref = excluded.clause_ref, title = excluded.title, text = excluded.text,
                 updated_at = excluded.updated_at",
                params![
                    pc.id.as_str(),
                    pc.plan_id.as_str(),
                    pc.policy_code.as_str(),
                    pc.clause_ref.as_str(),
                    pc.title.as_str(),
                    pc.text.as_str(),
                    pc.updated_at.as_str()
                ],
            )
            .await?;
            summary.policy_clauses += 1;
        }

        for c in &bundle.consultations {
            self.execute(
                "INSERT INTO consultations (id, project_id, title, summary, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id, title = excluded.title,
                 summary = excluded.summary, updated_at = excluded.updated_at",
                params![
                    c.id.as_str(),
                    c.project_id.as_str(),
                    c.title.as_str(),
                    c.summary.as_str(),
                    c.updated_at.as_str()
                ],
            )
            .await?;
            summary.consultations += 1;
        }

        for t in &bundle.timetables {
            self.execute(
                "INSERT INTO timetables (id, project_id, label, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id, label = excluded.label,
                 updated_at = excluded.updated_at",
                params![t.id.as_str(), t.project_id.as_str(), t.label.as_str(), t.updated_at.as_str()],
            )
            .await?;
            summary.timetables += 1;
        }

        for site in &bundle.sites {
            self.execute(
                "INSERT INTO sites (id, project_id, scenario_id, name, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id,
                 scenario_id = excluded.scenario_id, name = excluded.name, updated_at = excluded.updated_at",
                params![
                    site.id.as_str(),
                    site.project_id.as_str(),
                    site.scenario_id.as_deref(),
                    site.name.as_str(),
                    site.updated_at.as_str()
                ],
            )
            .await?;
            summary.sites += 1;

            for sf in &site.spatial_features {
                self.execute(
                    "INSERT INTO spatial_features (id, site_id, project_id, layer, feature_name, overlap_pct, distance_m)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET site_id = excluded.site_id, project_id = excluded.project_id,
                     layer = excluded.layer, feature_name = excluded.feature_name,
                     overlap_pct = excluded.overlap_pct, distance_m = excluded.distance_m",
                    params![
                        sf.id.as_str(),
                        site.id.as_str(),
                        site.project_id.as_str(),
                        sf.layer.as_str(),
                        sf.feature_name.as_str(),
                        sf.overlap_pct,
                        sf.distance_m
                    ],
                )
                .await?;
                summary.spatial_features += 1;
            }

            for a in &site.assessments {
                self.execute(
                    "INSERT INTO site_assessments (id, site_id, project_id, summary, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET site_id = excluded.site_id,
                     project_id = excluded.project_id, summary = excluded.summary,
                     updated_at = excluded.updated_at",
                    params![
                        a.id.as_str(),
                        site.id.as_str(),
                        site.project_id.as_str(),
                        a.summary.as_str(),
                        a.updated_at.as_str()
                    ],
                )
                .await?;
                summary.site_assessments += 1;
            }
        }

        for v in &bundle.visual_assets {
            self.execute(
                "INSERT INTO visual_assets (id, project_id, site_id, asset_kind, uri, caption, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id, site_id = excluded.site_id,
                 asset_kind = excluded.asset_kind, uri = excluded.uri, caption = excluded.caption,
                 updated_at = excluded.updated_at",
                params![
                    v.id.as_str(),
                    v.project_id.as_str(),
                    v.site_id.as_deref(),
                    v.asset_kind.as_str(),
                    v.uri.as_str(),
                    v.caption.as_str(),
                    v.updated_at.as_str()
                ],
            )
            .await?;
            summary.visual_assets += 1;
        }

        for o in &bundle.instrument_outputs {
            self.execute(
                "INSERT INTO instrument_outputs (id, project_id, instrument_id, tool_run_id, output_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id,
                 instrument_id = excluded.instrument_id, tool_run_id = excluded.tool_run_id,
                 output_json = excluded.output_json, created_at = excluded.created_at",
                params![
                    o.id.as_str(),
                    o.project_id.as_str(),
                    o.instrument_id.as_str(),
                    o.tool_run_id.as_str(),
                    to_json(&o.output)?,
                    o.created_at.as_str()
                ],
            )
            .await?;
            summary.instrument_outputs += 1;
        }

        for r in &bundle.ingest_runs {
            self.execute(
                "INSERT INTO ingest_runs (id, project_id, completed_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id,
                 completed_at = excluded.completed_at",
                params![r.id.as_str(), r.project_id.as_str(), r.completed_at.as_str()],
            )
            .await?;
            summary.ingest_runs += 1;
        }

        tracing::info!(
            projects = summary.projects,
            scenarios = summary.scenarios,
            doc_chunks = summary.doc_chunks,
            policy_clauses = summary.policy_clauses,
            "evidence bundle imported"
        );
        Ok(summary)
    }
}
