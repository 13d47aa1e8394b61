//! Evidence model: candidates, atoms, curated sets, context packs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JudgementError;
use crate::types::MoveType;

/// Rough token estimate: one token per four characters, at least one.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4).max(1)
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// The six evidence variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    PolicyClause,
    DocChunk,
    SiteFingerprint,
    SpatialFeature,
    VisualAsset,
    InstrumentOutput,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyClause => "policy_clause",
            Self::DocChunk => "doc_chunk",
            Self::SiteFingerprint => "site_fingerprint",
            Self::SpatialFeature => "spatial_feature",
            Self::VisualAsset => "visual_asset",
            Self::InstrumentOutput => "instrument_output",
        }
    }

    /// Globally unique evidence ref for a record of this kind.
    pub fn evidence_ref(&self, record_id: &str) -> String {
        format!("{}::{record_id}", self.as_str())
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceKind {
    type Err = JudgementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policy_clause" => Ok(Self::PolicyClause),
            "doc_chunk" => Ok(Self::DocChunk),
            "site_fingerprint" => Ok(Self::SiteFingerprint),
            "spatial_feature" => Ok(Self::SpatialFeature),
            "visual_asset" => Ok(Self::VisualAsset),
            "instrument_output" => Ok(Self::InstrumentOutput),
            other => Err(JudgementError::validation(format!(
                "unknown evidence type '{other}'"
            ))),
        }
    }
}

/// Variant-specific payload of an evidence candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidencePayload {
    PolicyClause {
        clause_id: String,
        plan_id: String,
        policy_code: String,
        clause_ref: String,
        text: String,
    },
    DocChunk {
        chunk_id: String,
        document_id: String,
        document_title: String,
        page: Option<u32>,
        text: String,
        score: f64,
    },
    SiteFingerprint {
        site_id: String,
        site_name: String,
        layers: Vec<String>,
        constraint_count: u32,
    },
    SpatialFeature {
        feature_id: String,
        site_id: String,
        layer: String,
        feature_name: String,
        overlap_pct: Option<f64>,
        distance_m: Option<f64>,
    },
    VisualAsset {
        asset_id: String,
        asset_kind: String,
        uri: String,
        caption: String,
        site_id: Option<String>,
    },
    InstrumentOutput {
        output_id: String,
        instrument_id: String,
        tool_run_id: String,
        output: serde_json::Value,
        produced_at: String,
    },
}

impl EvidencePayload {
    pub fn kind(&self) -> EvidenceKind {
        match self {
            Self::PolicyClause { .. } => EvidenceKind::PolicyClause,
            Self::DocChunk { .. } => EvidenceKind::DocChunk,
            Self::SiteFingerprint { .. } => EvidenceKind::SiteFingerprint,
            Self::SpatialFeature { .. } => EvidenceKind::SpatialFeature,
            Self::VisualAsset { .. } => EvidenceKind::VisualAsset,
            Self::InstrumentOutput { .. } => EvidenceKind::InstrumentOutput,
        }
    }

    /// Id of the underlying record in its own table.
    pub fn record_id(&self) -> &str {
        match self {
            Self::PolicyClause { clause_id, .. } => clause_id,
            Self::DocChunk { chunk_id, .. } => chunk_id,
            Self::SiteFingerprint { site_id, .. } => site_id,
            Self::SpatialFeature { feature_id, .. } => feature_id,
            Self::VisualAsset { asset_id, .. } => asset_id,
            Self::InstrumentOutput { output_id, .. } => output_id,
        }
    }
}

/// A retrievable piece of evidence before selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceCandidate {
    pub evidence_ref: String,
    pub title: String,
    pub summary: String,
    pub approx_token_cost: u32,
    pub payload: EvidencePayload,
}

impl EvidenceCandidate {
    /// Build a candidate, deriving its ref from the payload and estimating cost.
    pub fn new(title: impl Into<String>, summary: impl Into<String>, payload: EvidencePayload) -> Self {
        let title = title.into();
        let summary = summary.into();
        let body_len = match &payload {
            EvidencePayload::PolicyClause { text, .. } | EvidencePayload::DocChunk { text, .. } => {
                text.len()
            }
            EvidencePayload::InstrumentOutput { output, .. } => output.to_string().len(),
            _ => 0,
        };
        let approx_token_cost =
            estimate_tokens(&title) + estimate_tokens(&summary) + (body_len as u32).div_ceil(4);
        Self {
            evidence_ref: payload.kind().evidence_ref(payload.record_id()),
            title,
            summary,
            approx_token_cost,
            payload,
        }
    }

    pub fn kind(&self) -> EvidenceKind {
        self.payload.kind()
    }
}

// ---------------------------------------------------------------------------
// Atoms and curated sets
// ---------------------------------------------------------------------------

/// Role a selected piece of evidence plays for an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceRole {
    Supporting,
    Countervailing,
    Contextual,
}

/// Where an atom came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_table: String,
    pub source_id: String,
    pub run_id: String,
    /// Queries that surfaced the candidate.
    #[serde(default)]
    pub query_ids: Vec<String>,
}

/// Materialized, deduplicated evidence with full provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAtom {
    pub evidence_ref: String,
    pub evidence_type: EvidenceKind,
    pub title: String,
    pub summary: String,
    pub excerpt: String,
    pub provenance: Provenance,
    pub limitations: String,
    pub metadata: serde_json::Value,
    pub approx_token_cost: u32,
    pub created_at: DateTime<Utc>,
}

/// Selected evidence for one issue, by role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEvidence {
    pub issue_id: String,
    #[serde(default)]
    pub supporting: Vec<String>,
    #[serde(default)]
    pub countervailing: Vec<String>,
    #[serde(default)]
    pub contextual: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// A coverage repair round patched this selection.
    #[serde(default)]
    pub repaired: bool,
}

impl IssueEvidence {
    pub fn new(issue_id: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.into(),
            ..Default::default()
        }
    }

    pub fn refs_for(&self, role: EvidenceRole) -> &[String] {
        match role {
            EvidenceRole::Supporting => &self.supporting,
            EvidenceRole::Countervailing => &self.countervailing,
            EvidenceRole::Contextual => &self.contextual,
        }
    }

    pub fn refs_for_mut(&mut self, role: EvidenceRole) -> &mut Vec<String> {
        match role {
            EvidenceRole::Supporting => &mut self.supporting,
            EvidenceRole::Countervailing => &mut self.countervailing,
            EvidenceRole::Contextual => &mut self.contextual,
        }
    }

    /// Every selected ref, in role order.
    pub fn all_refs(&self) -> impl Iterator<Item = &String> {
        self.supporting
            .iter()
            .chain(self.countervailing.iter())
            .chain(self.contextual.iter())
    }

    pub fn len(&self) -> usize {
        self.supporting.len() + self.countervailing.len() + self.contextual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evidence deliberately left out, with the stated reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliberateOmission {
    #[serde(default)]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub evidence_ref: Option<String>,
    pub reason: String,
}

/// Who asked for a follow-up instrument run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRequestSource {
    Llm,
    Template,
}

/// A proposed follow-up instrument run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub instrument_id: String,
    #[serde(default)]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    pub reason: String,
    pub source: ToolRequestSource,
}

/// Output of the evidence curation engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuratedEvidenceSet {
    pub frame_id: String,
    pub evidence_atoms: Vec<EvidenceAtom>,
    pub evidence_by_issue: Vec<IssueEvidence>,
    pub deliberate_omissions: Vec<DeliberateOmission>,
    pub tool_requests: Vec<ToolRequest>,
    pub selection_errors: Vec<String>,
}

impl CuratedEvidenceSet {
    pub fn atom(&self, evidence_ref: &str) -> Option<&EvidenceAtom> {
        self.evidence_atoms
            .iter()
            .find(|a| a.evidence_ref == evidence_ref)
    }

    pub fn issue(&self, issue_id: &str) -> Option<&IssueEvidence> {
        self.evidence_by_issue
            .iter()
            .find(|e| e.issue_id == issue_id)
    }
}

// ---------------------------------------------------------------------------
// Context packs
// ---------------------------------------------------------------------------

/// Heterogeneous slices a context pack is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceType {
    ScenarioState,
    PriorMoves,
    ConsultationSummaries,
    PolicyClauses,
    DocChunks,
    SiteFingerprints,
    SpatialFeatures,
    VisualAssets,
    InstrumentOutputs,
}

impl SliceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScenarioState => "scenario_state",
            Self::PriorMoves => "prior_moves",
            Self::ConsultationSummaries => "consultation_summaries",
            Self::PolicyClauses => "policy_clauses",
            Self::DocChunks => "doc_chunks",
            Self::SiteFingerprints => "site_fingerprints",
            Self::SpatialFeatures => "spatial_features",
            Self::VisualAssets => "visual_assets",
            Self::InstrumentOutputs => "instrument_outputs",
        }
    }

    /// Slice an evidence atom of `kind` belongs to.
    pub fn for_evidence(kind: EvidenceKind) -> Self {
        match kind {
            EvidenceKind::PolicyClause => Self::PolicyClauses,
            EvidenceKind::DocChunk => Self::DocChunks,
            EvidenceKind::SiteFingerprint => Self::SiteFingerprints,
            EvidenceKind::SpatialFeature => Self::SpatialFeatures,
            EvidenceKind::VisualAsset => Self::VisualAssets,
            EvidenceKind::InstrumentOutput => Self::InstrumentOutputs,
        }
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate for a context slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Evidence ref, or a synthetic ref for non-evidence items (`move::...`).
    pub item_ref: String,
    pub approx_token_cost: u32,
    pub payload: serde_json::Value,
}

impl ContextItem {
    /// Build an item, estimating its cost from the serialized payload.
    pub fn new(item_ref: impl Into<String>, payload: serde_json::Value) -> Self {
        let approx_token_cost = estimate_tokens(&payload.to_string());
        Self {
            item_ref: item_ref.into(),
            approx_token_cost,
            payload,
        }
    }
}

/// Bounded context handed to one move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub move_type: MoveType,
    pub selector_id: String,
    pub slices: BTreeMap<SliceType, Vec<ContextItem>>,
    /// Token budget each slice was allocated.
    pub allocations: BTreeMap<SliceType, u32>,
    #[serde(default)]
    pub assembly_errors: Vec<String>,
}

impl ContextPack {
    /// Every item ref in the pack.
    pub fn refs(&self) -> Vec<String> {
        self.slices
            .values()
            .flatten()
            .map(|item| item.item_ref.clone())
            .collect()
    }

    pub fn slice_tokens(&self, slice: SliceType) -> u32 {
        self.slices
            .get(&slice)
            .map(|items| items.iter().map(|i| i.approx_token_cost).sum())
            .unwrap_or(0)
    }

    pub fn total_tokens(&self) -> u32 {
        self.slices.keys().map(|s| self.slice_tokens(*s)).sum()
    }

    /// Payloads only, keyed by slice name, for prompt payloads.
    pub fn to_prompt_json(&self) -> serde_json::Value {
        let slices: serde_json::Map<String, serde_json::Value> = self
            .slices
            .iter()
            .map(|(slice, items)| {
                let payloads = items
                    .iter()
                    .map(|i| serde_json::json!({"ref": i.item_ref, "content": i.payload}))
                    .collect();
                (slice.as_str().to_string(), serde_json::Value::Array(payloads))
            })
            .collect();
        serde_json::Value::Object(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(id: &str, text: &str) -> EvidencePayload {
        EvidencePayload::PolicyClause {
            clause_id: id.into(),
            plan_id: "local-plan".into(),
            policy_code: "EN4".into(),
            clause_ref: "EN4.2".into(),
            text: text.into(),
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn candidate_ref_derives_from_payload() {
        let c = EvidenceCandidate::new("EN4 Flood risk", "Sequential test", clause("pc-1", "text"));
        assert_eq!(c.evidence_ref, "policy_clause::pc-1");
        assert_eq!(c.kind(), EvidenceKind::PolicyClause);
        assert!(c.approx_token_cost >= 3);
    }

    #[test]
    fn longer_text_costs_more() {
        let short = EvidenceCandidate::new("t", "s", clause("a", "x"));
        let long = EvidenceCandidate::new("t", "s", clause("b", &"x".repeat(400)));
        assert!(long.approx_token_cost > short.approx_token_cost + 90);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let json = serde_json::to_value(clause("pc-9", "t")).unwrap();
        assert_eq!(json["type"], "policy_clause");
        let back: EvidencePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), EvidenceKind::PolicyClause);
    }

    #[test]
    fn issue_evidence_role_access() {
        let mut e = IssueEvidence::new("flood");
        e.refs_for_mut(EvidenceRole::Countervailing)
            .push("doc_chunk::c1".into());
        e.supporting.push("policy_clause::p1".into());
        assert_eq!(e.refs_for(EvidenceRole::Countervailing), ["doc_chunk::c1"]);
        assert_eq!(e.len(), 2);
        assert_eq!(e.all_refs().next().unwrap(), "policy_clause::p1");
    }

    #[test]
    fn context_pack_totals() {
        let mut slices = BTreeMap::new();
        slices.insert(
            SliceType::PolicyClauses,
            vec![
                ContextItem {
                    item_ref: "policy_clause::a".into(),
                    approx_token_cost: 10,
                    payload: serde_json::json!({}),
                },
                ContextItem {
                    item_ref: "policy_clause::b".into(),
                    approx_token_cost: 5,
                    payload: serde_json::json!({}),
                },
            ],
        );
        let pack = ContextPack {
            move_type: MoveType::Framing,
            selector_id: "framing.default".into(),
            slices,
            allocations: BTreeMap::new(),
            assembly_errors: vec![],
        };
        assert_eq!(pack.slice_tokens(SliceType::PolicyClauses), 15);
        assert_eq!(pack.slice_tokens(SliceType::DocChunks), 0);
        assert_eq!(pack.total_tokens(), 15);
        assert_eq!(pack.refs().len(), 2);
        assert!(pack.to_prompt_json()["policy_clauses"].is_array());
    }
}
