//! Evidence curation engine.
//!
//! Given the issues surfaced for a run, the engine:
//!
//! 1. plans a [`RetrievalFrame`] from model proposals merged with the
//!    [`CurationTemplate`], superseding any earlier frame for the run;
//! 2. gathers a deduplicated candidate pool across modalities;
//! 3. selects evidence per issue and role, validated against the pool;
//! 4. repairs missing countervailing coverage in one bounded round;
//! 5. materializes one immutable atom per selected ref;
//! 6. records omissions and follow-up tool requests.
//!
//! Collaborator failures degrade to deterministic fallbacks and are reported on
//! the [`MoveTrace`] or in `selection_errors`; curation itself never fails.

pub mod candidates;
pub mod coverage;
pub mod frame;
pub mod materialize;
pub mod selection;
pub mod template;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use judgement_shared::{
    AppConfig, CuratedEvidenceSet, DeliberateOmission, FrameBudgets, Issue, MoveType,
    RetrievalFrame, ToolRequest, ToolRequestSource, new_id,
};
use judgement_storage::Storage;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

pub use candidates::{CandidatePool, PooledCandidate};
pub use template::{CurationTemplate, HintInputs, InstrumentHint, ProposedQuery};

use crate::gateway::{LlmGateway, MoveTrace};
use crate::retrieval::EvidenceRetriever;
use coverage::RepairReply;
use selection::{ProposedToolRequest, SelectionReply};

pub const FRAME_PROMPT: &str = "curation.frame.v1";
pub const SELECT_PROMPT: &str = "curation.select.v1";
pub const REPAIR_PROMPT: &str = "curation.repair.v1";

const FRAME_SYSTEM: &str = "You plan evidence retrieval for planning judgements. For each issue, \
propose search queries: at least one primary query looking for the main evidence and one \
countervailing query looking for harm, constraints or objections. Spatial and visual queries \
must name one of the given site ids. Reply with JSON {\"queries\": [...]}.";

const SELECT_SYSTEM: &str = "You curate evidence for planning judgements. For each issue choose \
up to the allowed number of candidate refs as supporting, countervailing or contextual evidence. \
Use only refs from the candidate list. Keep evidence that cuts against the likely outcome. \
You may record deliberate omissions and propose follow-up instrument runs.";

const REPAIR_SYSTEM: &str = "The selection below misses evidence roles for some issues. For \
those issues only, add the missing roles using refs from the candidate list. Change nothing \
else. Reply with JSON {\"patches\": [...]}.";

#[derive(Debug, Clone)]
pub struct CurationConfig {
    pub candidates_per_query: u32,
    pub max_atoms_per_issue: u32,
    pub retrieval_time_budget: Duration,
    /// Also repair issues whose contextual role is empty.
    pub repair_contextual: bool,
}

impl From<&AppConfig> for CurationConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            candidates_per_query: config.budgets.candidates_per_query.max(1),
            max_atoms_per_issue: config.budgets.max_atoms_per_issue.max(1),
            retrieval_time_budget: config.budgets.retrieval_time_budget(),
            repair_contextual: false,
        }
    }
}

/// What the engine needs to know about the run.
#[derive(Debug, Clone)]
pub struct CurationInput {
    pub run_id: String,
    pub project_id: String,
    pub scenario_id: String,
    pub issues: Vec<Issue>,
    pub site_ids: Vec<String>,
    /// Framing and scenario context passed through to the model.
    pub context: Value,
}

#[derive(Debug, Clone)]
pub struct CurationOutcome {
    pub set: CuratedEvidenceSet,
    pub pool: CandidatePool,
    pub frame: RetrievalFrame,
}

#[derive(Debug, Default, Deserialize)]
struct FrameReply {
    #[serde(default)]
    queries: Vec<ProposedQuery>,
}

pub struct CurationEngine {
    gateway: Arc<LlmGateway>,
    retriever: Arc<dyn EvidenceRetriever>,
    storage: Arc<Storage>,
    template: CurationTemplate,
    config: CurationConfig,
}

impl CurationEngine {
    pub fn new(
        gateway: Arc<LlmGateway>,
        retriever: Arc<dyn EvidenceRetriever>,
        storage: Arc<Storage>,
        config: CurationConfig,
    ) -> Self {
        Self {
            gateway,
            retriever,
            storage,
            template: CurationTemplate::default(),
            config,
        }
    }

    pub fn with_template(mut self, template: CurationTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn template(&self) -> &CurationTemplate {
        &self.template
    }

    fn budgets(&self) -> FrameBudgets {
        FrameBudgets {
            candidates_per_query: self.config.candidates_per_query,
            max_atoms_per_issue: self.config.max_atoms_per_issue,
            max_queries_per_issue: self.template.max_queries_per_issue.max(2),
        }
    }

    #[instrument(skip_all, fields(run_id = %input.run_id, issues = input.issues.len()))]
    pub async fn curate(&self, input: &CurationInput, trace: &mut MoveTrace) -> CurationOutcome {
        let mut set = CuratedEvidenceSet::default();
        let frame = self.plan_frame(input, trace, &mut set.selection_errors).await;
        set.frame_id = frame.id.clone();

        let (pool, retrieval_errors) = candidates::gather(
            self.retriever.as_ref(),
            &input.project_id,
            &frame.queries,
            self.config.retrieval_time_budget,
        )
        .await;
        for e in retrieval_errors {
            trace.error(e);
        }
        debug!(candidates = pool.len(), queries = frame.queries.len(), "candidate pool built");

        let max = self.config.max_atoms_per_issue as usize;
        let reply = self.ask_selection(input, &pool, trace).await;
        let resolved = selection::resolve_selection(&input.issues, reply.as_ref(), &pool, max);
        let mut selections = resolved.evidence_by_issue;
        set.selection_errors.extend(resolved.errors);
        if reply.is_none() && !pool.is_empty() {
            set.selection_errors
                .push("selection call failed; used deterministic top-N per issue".to_string());
        }

        let gaps = coverage::find_gaps(&selections, &pool, self.config.repair_contextual);
        if !gaps.is_empty() {
            let repair = self.ask_repair(input, &gaps, &selections, &pool, trace).await;
            let notes = coverage::apply_repair(&mut selections, &gaps, repair.as_ref(), &pool, max);
            set.selection_errors.extend(notes);
        }

        set.evidence_atoms =
            materialize::materialize(&self.storage, &input.run_id, &selections, &pool, trace).await;
        set.evidence_by_issue = selections;

        if let Some(reply) = &reply {
            set.deliberate_omissions = valid_omissions(&reply.deliberate_omissions, &input.issues, &pool);
        }
        set.tool_requests = self.tool_requests(input, reply.as_ref().map(|r| r.tool_requests.as_slice()));

        info!(
            atoms = set.evidence_atoms.len(),
            tool_requests = set.tool_requests.len(),
            selection_errors = set.selection_errors.len(),
            "evidence curated"
        );
        CurationOutcome { set, pool, frame }
    }

    async fn plan_frame(
        &self,
        input: &CurationInput,
        trace: &mut MoveTrace,
        notes: &mut Vec<String>,
    ) -> RetrievalFrame {
        let budgets = self.budgets();
        let proposed: Option<FrameReply> = self
            .gateway
            .call_typed(
                &input.run_id,
                trace,
                FRAME_PROMPT,
                FRAME_SYSTEM,
                "RetrievalFramePlan",
                json!({
                    "issues": input.issues,
                    "site_ids": input.site_ids,
                    "context": input.context,
                    "template": self.template.describe(),
                    "budgets": budgets,
                }),
            )
            .await;

        let template_queries = input
            .issues
            .iter()
            .flat_map(|issue| self.template.default_queries(issue, &input.site_ids))
            .collect();
        let plan = frame::plan_queries(
            &input.issues,
            proposed.map(|p| p.queries).unwrap_or_default(),
            template_queries,
            &budgets,
            &input.site_ids,
        );
        notes.extend(plan.rejected.into_iter().map(|r| format!("frame: {r}")));

        match self
            .storage
            .supersede_frame(
                &input.run_id,
                MoveType::EvidenceCuration,
                budgets,
                plan.modalities.clone(),
                plan.queries.clone(),
            )
            .await
        {
            Ok(frame) => frame,
            Err(e) => {
                trace.persistence_error(format!("retrieval frame: {e}"));
                RetrievalFrame {
                    id: new_id("frame"),
                    run_id: input.run_id.clone(),
                    move_type: MoveType::EvidenceCuration,
                    version: 1,
                    based_on_frame_id: None,
                    budgets,
                    modalities: plan.modalities,
                    queries: plan.queries,
                    is_current: true,
                    created_at: Utc::now(),
                }
            }
        }
    }

    async fn ask_selection(
        &self,
        input: &CurationInput,
        pool: &CandidatePool,
        trace: &mut MoveTrace,
    ) -> Option<SelectionReply> {
        if pool.is_empty() {
            return None;
        }
        let candidates: Vec<Value> = pool.iter().map(candidate_json).collect();
        self.gateway
            .call_typed(
                &input.run_id,
                trace,
                SELECT_PROMPT,
                SELECT_SYSTEM,
                "CuratedEvidenceSelection",
                json!({
                    "issues": input.issues,
                    "candidates": candidates,
                    "max_atoms_per_issue": self.config.max_atoms_per_issue,
                    "instruments": self.template.instrument_hints
                        .iter()
                        .map(|h| h.instrument_id.as_str())
                        .collect::<Vec<_>>(),
                    "context": input.context,
                }),
            )
            .await
    }

    async fn ask_repair(
        &self,
        input: &CurationInput,
        gaps: &[coverage::CoverageGap],
        selections: &[judgement_shared::IssueEvidence],
        pool: &CandidatePool,
        trace: &mut MoveTrace,
    ) -> Option<RepairReply> {
        let affected: HashSet<&str> = gaps.iter().map(|g| g.issue_id.as_str()).collect();
        let candidates: Vec<Value> = pool
            .iter()
            .filter(|c| affected.iter().any(|issue| c.attached_to(issue)))
            .map(candidate_json)
            .collect();
        let current: Vec<_> = selections
            .iter()
            .filter(|s| affected.contains(s.issue_id.as_str()))
            .collect();
        let gaps_json: Vec<Value> = gaps
            .iter()
            .map(|g| json!({ "issue_id": g.issue_id, "missing": g.missing }))
            .collect();

        self.gateway
            .call_typed(
                &input.run_id,
                trace,
                REPAIR_PROMPT,
                REPAIR_SYSTEM,
                "CoverageRepairPatch",
                json!({
                    "gaps": gaps_json,
                    "current_selection": current,
                    "candidates": candidates,
                }),
            )
            .await
    }

    /// Valid model requests first, then template hints, unique per
    /// `(instrument, issue)`.
    fn tool_requests(&self, input: &CurationInput, proposed: Option<&[ProposedToolRequest]>) -> Vec<ToolRequest> {
        let known: HashSet<&str> = input.issues.iter().map(|i| i.id.as_str()).collect();
        let mut out: Vec<ToolRequest> = Vec::new();
        let mut seen = HashSet::new();

        let from_model = proposed.unwrap_or_default().iter().filter_map(|p| {
            let instrument_id = p.instrument_id.trim();
            if instrument_id.is_empty() {
                return None;
            }
            if p.issue_id.as_deref().is_some_and(|id| !known.contains(id)) {
                return None;
            }
            Some(ToolRequest {
                instrument_id: instrument_id.to_string(),
                issue_id: p.issue_id.clone(),
                inputs: p.inputs.clone(),
                reason: p.reason.clone(),
                source: ToolRequestSource::Llm,
            })
        });

        let mut inputs = HintInputs::default()
            .with("project_id", input.project_id.as_str())
            .with("scenario_id", input.scenario_id.as_str());
        if let Some(site) = input.site_ids.first() {
            inputs = inputs.with("site_id", site.as_str());
        }
        let from_template = self.template.hint_requests(&input.issues, &inputs);

        for request in from_model.chain(from_template) {
            if seen.insert((request.instrument_id.clone(), request.issue_id.clone())) {
                out.push(request);
            }
        }
        out
    }
}

fn candidate_json(c: &PooledCandidate) -> Value {
    json!({
        "evidence_ref": c.candidate.evidence_ref,
        "kind": c.candidate.kind(),
        "title": c.candidate.title,
        "summary": c.candidate.summary,
        "approx_token_cost": c.candidate.approx_token_cost,
        "attached_to": c.attachments
            .iter()
            .map(|(issue, role)| json!({ "issue_id": issue, "role": role }))
            .collect::<Vec<_>>(),
    })
}

fn valid_omissions(
    omissions: &[DeliberateOmission],
    issues: &[Issue],
    pool: &CandidatePool,
) -> Vec<DeliberateOmission> {
    omissions
        .iter()
        .filter(|o| !o.reason.trim().is_empty())
        .filter(|o| o.issue_id.as_deref().is_none_or(|id| issues.iter().any(|i| i.id == id)))
        .filter(|o| o.evidence_ref.as_deref().is_none_or(|r| pool.contains(r)))
        .cloned()
        .collect()
}
