//! Read-side access to the evidence base: scenario records, snapshot signals,
//! and modality-specific candidate retrieval.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use judgement_shared::{EvidenceCandidate, EvidencePayload, JudgementError, Result};
use libsql::{Row, params};
use regex::Regex;

use crate::{Storage, col_i64, col_json, col_opt_str, col_str};

/// Characters kept in a candidate summary.
const SUMMARY_CHARS: usize = 240;

/// A decision scenario.
#[derive(Debug, Clone)]
pub struct ScenarioRecord {
    pub id: String,
    pub project_id: String,
    pub title: String,
    /// Mutable scenario state (declared issues, parameters, options).
    pub state: serde_json::Value,
    pub updated_at: String,
}

/// A framing of a scenario (the lens a judgement is formed through).
#[derive(Debug, Clone)]
pub struct FramingRecord {
    pub id: String,
    pub scenario_id: String,
    pub title: String,
    pub description: String,
    pub updated_at: String,
}

/// Timestamps and counts over one project's evidence families.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectSignals {
    pub project_updated_at: Option<String>,
    pub documents_max_updated_at: Option<String>,
    pub consultations_max_updated_at: Option<String>,
    pub sites_max_updated_at: Option<String>,
    pub site_assessments_max_updated_at: Option<String>,
    pub timetables_max_updated_at: Option<String>,
    pub visual_assets_max_updated_at: Option<String>,
    pub doc_chunk_count: i64,
    pub policy_clause_count: i64,
    pub spatial_feature_count: i64,
    pub instrument_output_count: i64,
    pub ingest_completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SiteRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ConsultationRecord {
    pub id: String,
    pub title: String,
    pub summary: String,
}

/// Turn free text into an FTS5 disjunction of quoted terms.
///
/// Returns `None` when the text has no searchable terms, since an empty
/// `MATCH` expression is a syntax error.
pub fn fts_match_expression(text: &str) -> Option<String> {
    static TERM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid regex"));

    let mut seen = BTreeSet::new();
    let terms: Vec<String> = TERM_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.chars().count() > 1 && seen.insert(t.clone()))
        .map(|t| format!("\"{t}\""))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SUMMARY_CHARS).collect();
    format!("{}...", cut.trim_end())
}

impl Storage {
    // -----------------------------------------------------------------------
    // Scenario records
    // -----------------------------------------------------------------------

    pub async fn get_scenario(&self, scenario_id: &str) -> Result<ScenarioRecord> {
        let row = self
            .fetch_one(
                "SELECT id, project_id, title, state_json, updated_at FROM scenarios WHERE id = ?1",
                params![scenario_id],
            )
            .await?
            .ok_or_else(|| JudgementError::not_found("scenario", scenario_id))?;

        Ok(ScenarioRecord {
            id: col_str(&row, 0)?,
            project_id: col_str(&row, 1)?,
            title: col_str(&row, 2)?,
            state: col_json(&row, 3)?,
            updated_at: col_str(&row, 4)?,
        })
    }

    pub async fn get_framing(&self, framing_id: &str) -> Result<FramingRecord> {
        let row = self
            .fetch_one(
                "SELECT id, scenario_id, title, description, updated_at FROM framings WHERE id = ?1",
                params![framing_id],
            )
            .await?
            .ok_or_else(|| JudgementError::not_found("framing", framing_id))?;

        Ok(FramingRecord {
            id: col_str(&row, 0)?,
            scenario_id: col_str(&row, 1)?,
            title: col_str(&row, 2)?,
            description: col_str(&row, 3)?,
            updated_at: col_str(&row, 4)?,
        })
    }

    /// Read the project-level dependency signals in one round-trip.
    pub async fn project_signals(&self, project_id: &str) -> Result<ProjectSignals> {
        let row = self
            .fetch_one(
                "SELECT
                    (SELECT updated_at FROM projects WHERE id = ?1),
                    (SELECT MAX(updated_at) FROM documents WHERE project_id = ?1),
                    (SELECT MAX(updated_at) FROM consultations WHERE project_id = ?1),
                    (SELECT MAX(updated_at) FROM sites WHERE project_id = ?1),
                    (SELECT MAX(updated_at) FROM site_assessments WHERE project_id = ?1),
                    (SELECT MAX(updated_at) FROM timetables WHERE project_id = ?1),
                    (SELECT MAX(updated_at) FROM visual_assets WHERE project_id = ?1),
                    (SELECT COUNT(*) FROM doc_chunks WHERE project_id = ?1),
                    (SELECT COUNT(*) FROM policy_clauses),
                    (SELECT COUNT(*) FROM spatial_features WHERE project_id = ?1),
                    (SELECT COUNT(*) FROM instrument_outputs WHERE project_id = ?1),
                    (SELECT MAX(completed_at) FROM ingest_runs WHERE project_id = ?1)",
                params![project_id],
            )
            .await?
            .ok_or_else(|| JudgementError::Storage("signal query returned no row".into()))?;

        Ok(ProjectSignals {
            project_updated_at: col_opt_str(&row, 0),
            documents_max_updated_at: col_opt_str(&row, 1),
            consultations_max_updated_at: col_opt_str(&row, 2),
            sites_max_updated_at: col_opt_str(&row, 3),
            site_assessments_max_updated_at: col_opt_str(&row, 4),
            timetables_max_updated_at: col_opt_str(&row, 5),
            visual_assets_max_updated_at: col_opt_str(&row, 6),
            doc_chunk_count: col_i64(&row, 7)?,
            policy_clause_count: col_i64(&row, 8)?,
            spatial_feature_count: col_i64(&row, 9)?,
            instrument_output_count: col_i64(&row, 10)?,
            ingest_completed_at: col_opt_str(&row, 11),
        })
    }

    /// Sites attached to the project that are either shared or scoped to this scenario.
    pub async fn sites_for_scenario(&self, project_id: &str, scenario_id: &str) -> Result<Vec<SiteRecord>> {
        let rows = self
            .fetch_all(
                "SELECT id, project_id, name FROM sites \
                 WHERE project_id = ?1 AND (scenario_id IS NULL OR scenario_id = ?2) ORDER BY id",
                params![project_id, scenario_id],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SiteRecord {
                    id: col_str(row, 0)?,
                    project_id: col_str(row, 1)?,
                    name: col_str(row, 2)?,
                })
            })
            .collect()
    }

    pub async fn consultations(&self, project_id: &str) -> Result<Vec<ConsultationRecord>> {
        let rows = self
            .fetch_all(
                "SELECT id, title, summary FROM consultations WHERE project_id = ?1 ORDER BY updated_at DESC",
                params![project_id],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ConsultationRecord {
                    id: col_str(row, 0)?,
                    title: col_str(row, 1)?,
                    summary: col_str(row, 2)?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Text retrieval (FTS5)
    // -----------------------------------------------------------------------

    /// Full-text search over policy clauses, best match first.
    pub async fn search_policy_clauses(&self, query: &str, limit: u32) -> Result<Vec<EvidenceCandidate>> {
        let Some(expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        let rows = self
            .fetch_all(
                "SELECT pc.id, pc.plan_id, pc.policy_code, pc.clause_ref, pc.title, pc.text
                 FROM policy_clauses_fts fts
                 JOIN policy_clauses pc ON pc.rowid = fts.rowid
                 WHERE policy_clauses_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
                params![expr, limit as i64],
            )
            .await?;
        rows.iter().map(row_to_clause_candidate).collect()
    }

    /// Full-text search over a project's document chunks, best match first.
    pub async fn search_doc_chunks(
        &self,
        project_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<EvidenceCandidate>> {
        let Some(expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        let rows = self
            .fetch_all(
                "SELECT c.id, c.document_id, d.title, c.page, c.text, bm25(doc_chunks_fts)
                 FROM doc_chunks_fts fts
                 JOIN doc_chunks c ON c.rowid = fts.rowid
                 JOIN documents d ON d.id = c.document_id
                 WHERE doc_chunks_fts MATCH ?1 AND c.project_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
                params![expr, project_id, limit as i64],
            )
            .await?;
        rows.iter().map(row_to_chunk_candidate).collect()
    }

    // -----------------------------------------------------------------------
    // Spatial, imagery, instruments
    // -----------------------------------------------------------------------

    /// Precomputed intersections for a site, as individual feature candidates.
    pub async fn spatial_features(&self, site_id: &str) -> Result<Vec<EvidenceCandidate>> {
        let rows = self
            .fetch_all(
                "SELECT id, site_id, layer, feature_name, overlap_pct, distance_m
                 FROM spatial_features WHERE site_id = ?1 ORDER BY layer, id",
                params![site_id],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let layer = col_str(row, 2)?;
                let feature_name = col_str(row, 3)?;
                let overlap_pct = row.get::<f64>(4).ok();
                let distance_m = row.get::<f64>(5).ok();
                let relation = match (overlap_pct, distance_m) {
                    (Some(pct), _) => format!("overlaps {pct:.1}% of the site"),
                    (None, Some(d)) => format!("lies {d:.0} m from the site"),
                    (None, None) => "intersects the site".to_string(),
                };
                Ok(EvidenceCandidate::new(
                    format!("{layer}: {feature_name}"),
                    format!("{feature_name} ({layer}) {relation}."),
                    EvidencePayload::SpatialFeature {
                        feature_id: col_str(row, 0)?,
                        site_id: col_str(row, 1)?,
                        layer,
                        feature_name,
                        overlap_pct,
                        distance_m,
                    },
                ))
            })
            .collect()
    }

    /// Aggregate fingerprint of a site's constraint layers.
    pub async fn site_fingerprint(&self, site_id: &str) -> Result<Option<EvidenceCandidate>> {
        let Some(site) = self
            .fetch_one("SELECT id, name FROM sites WHERE id = ?1", params![site_id])
            .await?
        else {
            return Ok(None);
        };
        let site_name = col_str(&site, 1)?;

        let rows = self
            .fetch_all(
                "SELECT layer, COUNT(*) FROM spatial_features WHERE site_id = ?1 GROUP BY layer ORDER BY layer",
                params![site_id],
            )
            .await?;
        let mut layers = Vec::with_capacity(rows.len());
        let mut constraint_count = 0u32;
        for row in &rows {
            layers.push(col_str(row, 0)?);
            constraint_count += col_i64(row, 1)? as u32;
        }

        let summary = if layers.is_empty() {
            format!("{site_name} intersects no recorded constraint layers.")
        } else {
            format!(
                "{site_name} intersects {constraint_count} features across {}.",
                layers.join(", ")
            )
        };
        Ok(Some(EvidenceCandidate::new(
            format!("Site fingerprint: {site_name}"),
            summary,
            EvidencePayload::SiteFingerprint {
                site_id: site_id.to_string(),
                site_name,
                layers,
                constraint_count,
            },
        )))
    }

    /// Imagery catalogue entries for a project, optionally narrowed to one site.
    pub async fn visual_assets(
        &self,
        project_id: &str,
        site_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EvidenceCandidate>> {
        let rows = self
            .fetch_all(
                "SELECT id, asset_kind, uri, caption, site_id FROM visual_assets
                 WHERE project_id = ?1 AND (?2 IS NULL OR site_id = ?2)
                 ORDER BY updated_at DESC, id LIMIT ?3",
                params![project_id, site_id, limit as i64],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let asset_kind = col_str(row, 1)?;
                let caption = col_str(row, 3)?;
                Ok(EvidenceCandidate::new(
                    format!("{asset_kind}: {}", summarize(&caption)),
                    caption.clone(),
                    EvidencePayload::VisualAsset {
                        asset_id: col_str(row, 0)?,
                        asset_kind,
                        uri: col_str(row, 2)?,
                        caption,
                        site_id: col_opt_str(row, 4),
                    },
                ))
            })
            .collect()
    }

    /// Previously executed instrument outputs, newest first.
    pub async fn instrument_outputs(
        &self,
        project_id: &str,
        instrument_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EvidenceCandidate>> {
        let rows = self
            .fetch_all(
                "SELECT id, instrument_id, tool_run_id, output_json, created_at FROM instrument_outputs
                 WHERE project_id = ?1 AND (?2 IS NULL OR instrument_id = ?2)
                 ORDER BY created_at DESC, id LIMIT ?3",
                params![project_id, instrument_id, limit as i64],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let instrument_id = col_str(row, 1)?;
                let output: serde_json::Value = col_json(row, 3)?;
                let produced_at = col_str(row, 4)?;
                Ok(EvidenceCandidate::new(
                    format!("{instrument_id} output"),
                    format!(
                        "{instrument_id} run at {produced_at}: {}",
                        summarize(&output.to_string())
                    ),
                    EvidencePayload::InstrumentOutput {
                        output_id: col_str(row, 0)?,
                        instrument_id,
                        tool_run_id: col_str(row, 2)?,
                        output,
                        produced_at,
                    },
                ))
            })
            .collect()
    }
}

fn row_to_clause_candidate(row: &Row) -> Result<EvidenceCandidate> {
    let policy_code = col_str(row, 2)?;
    let title = col_str(row, 4)?;
    let text = col_str(row, 5)?;
    Ok(EvidenceCandidate::new(
        format!("{policy_code} {title}"),
        summarize(&text),
        EvidencePayload::PolicyClause {
            clause_id: col_str(row, 0)?,
            plan_id: col_str(row, 1)?,
            policy_code,
            clause_ref: col_str(row, 3)?,
            text,
        },
    ))
}

fn row_to_chunk_candidate(row: &Row) -> Result<EvidenceCandidate> {
    let document_title = col_str(row, 2)?;
    let page = row.get::<i64>(3).ok().map(|p| p as u32);
    let text = col_str(row, 4)?;
    // bm25() is lower-is-better and negative; flip it so higher means closer.
    let score = -row.get::<f64>(5).unwrap_or(0.0);
    let title = match page {
        Some(p) => format!("{document_title} (p. {p})"),
        None => document_title.clone(),
    };
    Ok(EvidenceCandidate::new(
        title,
        summarize(&text),
        EvidencePayload::DocChunk {
            chunk_id: col_str(row, 0)?,
            document_id: col_str(row, 1)?,
            document_title,
            page,
            text,
            score,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_expression_quotes_and_dedupes_terms() {
        assert_eq!(
            fts_match_expression("Flood risk: flood-zone \"3\" AND harm").unwrap(),
            r#""flood" OR "risk" OR "zone" OR "and" OR "harm""#
        );
        assert!(fts_match_expression("  - ! ").is_none());
        assert!(fts_match_expression("a b").is_none());
    }

    #[test]
    fn summaries_are_bounded() {
        let long = "word ".repeat(200);
        let s = summarize(&long);
        assert!(s.ends_with("..."));
        assert!(s.chars().count() <= SUMMARY_CHARS + 3);
        assert_eq!(summarize(" short "), "short");
    }
}
