//! Core domain types: tabs, runs, moves, retrieval frames, trajectories.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::ContentAddress;
use crate::error::JudgementError;

/// Generate a new time-sortable identifier with a readable prefix.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

// ---------------------------------------------------------------------------
// ArtifactKey
// ---------------------------------------------------------------------------

/// The (scenario, framing) pair a judgement artifact is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub scenario_id: String,
    pub framing_id: String,
}

impl ArtifactKey {
    pub fn new(scenario_id: impl Into<String>, framing_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            framing_id: framing_id.into(),
        }
    }

    /// Key used by the judgement cache and the work queue.
    pub fn cache_key(&self) -> String {
        format!("judgement:{}:{}", self.scenario_id, self.framing_id)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scenario_id, self.framing_id)
    }
}

// ---------------------------------------------------------------------------
// Tab
// ---------------------------------------------------------------------------

/// Lifecycle of a tab: `queued -> running -> {complete, partial, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabStatus {
    Queued,
    Running,
    Complete,
    Partial,
    Error,
}

impl TabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    /// A recomputation is already scheduled or executing.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl FromStr for TabStatus {
    type Err = JudgementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "partial" => Ok(Self::Partial),
            "error" => Ok(Self::Error),
            other => Err(JudgementError::validation(format!(
                "unknown tab status '{other}'"
            ))),
        }
    }
}

/// Unit of work: one per (scenario, framing) pair, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tab {
    pub id: String,
    pub scenario_id: String,
    pub framing_id: String,
    pub status: TabStatus,
    pub last_content_address: Option<ContentAddress>,
    pub last_run_id: Option<String>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
    pub cache_expiry: Option<DateTime<Utc>>,
    /// When the current `queued`/`running` claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Tab {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.scenario_id, &self.framing_id)
    }

    /// A recomputation holds the tab and its claim is younger than `lease`.
    /// A claim left behind by a process that died mid-run stops counting once
    /// the lease runs out.
    pub fn is_claim_live(&self, now: DateTime<Utc>, lease: std::time::Duration) -> bool {
        if !self.status.is_in_flight() {
            return false;
        }
        match (self.claimed_at, chrono::TimeDelta::from_std(lease)) {
            (Some(at), Ok(lease)) => now.signed_duration_since(at) < lease,
            (Some(_), Err(_)) => true,
            (None, _) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Moves
// ---------------------------------------------------------------------------

/// The eight ordered stages of the judgement pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    Framing,
    IssueSurfacing,
    EvidenceCuration,
    EvidenceInterpretation,
    ConsiderationsFormation,
    WeighingAndBalance,
    NegotiationAndAlteration,
    PositioningAndNarration,
}

impl MoveType {
    /// Pipeline order.
    pub const ALL: [MoveType; 8] = [
        Self::Framing,
        Self::IssueSurfacing,
        Self::EvidenceCuration,
        Self::EvidenceInterpretation,
        Self::ConsiderationsFormation,
        Self::WeighingAndBalance,
        Self::NegotiationAndAlteration,
        Self::PositioningAndNarration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Framing => "framing",
            Self::IssueSurfacing => "issue_surfacing",
            Self::EvidenceCuration => "evidence_curation",
            Self::EvidenceInterpretation => "evidence_interpretation",
            Self::ConsiderationsFormation => "considerations_formation",
            Self::WeighingAndBalance => "weighing_and_balance",
            Self::NegotiationAndAlteration => "negotiation_and_alteration",
            Self::PositioningAndNarration => "positioning_and_narration",
        }
    }

    /// Human-readable label for progress output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Framing => "Framing",
            Self::IssueSurfacing => "Issue surfacing",
            Self::EvidenceCuration => "Evidence curation",
            Self::EvidenceInterpretation => "Evidence interpretation",
            Self::ConsiderationsFormation => "Considerations formation",
            Self::WeighingAndBalance => "Weighing & balance",
            Self::NegotiationAndAlteration => "Negotiation & alteration",
            Self::PositioningAndNarration => "Positioning & narration",
        }
    }
}

impl fmt::Display for MoveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MoveType {
    type Err = JudgementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| JudgementError::validation(format!("unknown move type '{s}'")))
    }
}

/// Outcome of one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    /// Model-assisted output accepted as-is.
    Success,
    /// Output produced by a deterministic fallback or with dropped content.
    Partial,
    /// No usable output.
    Error,
}

impl MoveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }
}

impl FromStr for MoveStatus {
    type Err = JudgementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "error" => Ok(Self::Error),
            other => Err(JudgementError::validation(format!(
                "unknown move status '{other}'"
            ))),
        }
    }
}

/// Append-only audit record of one move within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveEvent {
    pub id: String,
    pub run_id: String,
    pub move_type: MoveType,
    pub sequence: u32,
    pub status: MoveStatus,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub evidence_refs_considered: Vec<String>,
    pub assumptions_introduced: Vec<String>,
    pub uncertainty_remaining: Vec<String>,
    pub tool_invocation_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// User-visible outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Final payload produced with no unresolved errors.
    Success,
    /// Usable payload despite recorded errors.
    Partial,
    /// No payload could be produced.
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    /// Tab status a finished run leaves behind.
    pub fn tab_status(&self) -> TabStatus {
        match self {
            Self::Running => TabStatus::Running,
            Self::Success => TabStatus::Complete,
            Self::Partial => TabStatus::Partial,
            Self::Error => TabStatus::Error,
        }
    }
}

impl FromStr for RunStatus {
    type Err = JudgementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "error" => Ok(Self::Error),
            other => Err(JudgementError::validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// One execution of the move pipeline for a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRun {
    pub id: String,
    pub tab_id: String,
    /// Address of the dependency snapshot taken when the run started.
    pub content_address: ContentAddress,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub persistence_errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Retrieval frames
// ---------------------------------------------------------------------------

/// Evidence modality a query is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Spatial,
    Visual,
    Instrument,
}

/// What a query is looking for relative to its issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryRole {
    Primary,
    Countervailing,
    Contextual,
}

/// Where a query in a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Llm,
    Template,
    Fallback,
}

/// One planned retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub id: String,
    pub issue_id: String,
    pub role: QueryRole,
    pub modality: Modality,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    pub limit: u32,
    pub source: QuerySource,
}

/// Budgets a frame was planned under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBudgets {
    pub candidates_per_query: u32,
    pub max_atoms_per_issue: u32,
    pub max_queries_per_issue: u32,
}

/// A versioned query plan. Superseding creates a new version; frames are never
/// edited in place apart from clearing `is_current`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalFrame {
    pub id: String,
    pub run_id: String,
    pub move_type: MoveType,
    pub version: u32,
    pub based_on_frame_id: Option<String>,
    pub budgets: FrameBudgets,
    pub modalities: Vec<Modality>,
    pub queries: Vec<RetrievalQuery>,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Issues and trajectories
// ---------------------------------------------------------------------------

/// A planning issue surfaced by the second move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// One issue's entry on the judgement sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetIssue {
    pub issue_id: String,
    pub title: String,
    pub assessment: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

/// Structured, human-facing summary of a judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgementSheet {
    pub headline: String,
    pub issues: Vec<SheetIssue>,
    pub balance: String,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub uncertainties: Vec<String>,
    /// Narrated without model assistance.
    #[serde(default)]
    pub generated_by_fallback: bool,
}

/// The cached judgement artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub position_statement: String,
    pub key_evidence_refs: Vec<String>,
    pub judgement_sheet: JudgementSheet,
}
