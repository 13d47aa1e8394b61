//! The move pipeline: eight ordered moves that turn a scenario and framing
//! into a [`Trajectory`], each appending one [`MoveEvent`] to the run's trail.
//!
//! Every move assembles its own context pack, makes at most one structured
//! call of its own, validates the reply, and falls back to a deterministic
//! output when the reply is missing or unusable. Earlier events are never
//! edited; re-running a move appends a new event with a higher sequence.

pub mod pool;
pub mod prompts;
pub mod stages;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use judgement_llm::StructuredLlm;
use judgement_shared::{
    AppConfig, ContentAddress, ContextPack, EvidenceKind, JudgementError, MoveEvent, MoveRun,
    MoveStatus, MoveType, Result, RunStatus, Tab, Trajectory, new_id,
};
use judgement_storage::Storage;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::context::{AssemblerConfig, ContextAssembler, SelectorRegistry};
use crate::curation::{CurationConfig, CurationEngine, CurationInput, CurationTemplate};
use crate::gateway::{LlmGateway, MoveTrace};
use crate::retrieval::EvidenceRetriever;
use stages::{
    ConsiderationsOutput, InterpretationOutput, IssuesOutput, NarrationInputs, NegotiationOutput,
    RunState, Settled,
};

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a phase outside the moves themselves.
    fn phase(&self, name: &str);
    /// Called before a move runs. `index` is 1-based.
    fn move_started(&self, move_type: MoveType, index: usize, total: usize);
    fn move_finished(&self, move_type: MoveType, status: MoveStatus);
    /// Called when the run completes.
    fn done(&self, outcome: &RunOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn move_started(&self, _move_type: MoveType, _index: usize, _total: usize) {}
    fn move_finished(&self, _move_type: MoveType, _status: MoveStatus) {}
    fn done(&self, _outcome: &RunOutcome) {}
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Absent when the run could not reach the final move.
    pub trajectory: Option<Trajectory>,
    pub errors: Vec<String>,
    pub persistence_errors: Vec<String>,
    pub elapsed: Duration,
}

/// What a move hands back to the driver for its event.
struct StageReport {
    status: MoveStatus,
    inputs: Value,
    outputs: Value,
    refs: Vec<String>,
    assumptions: Vec<String>,
    uncertainty: Vec<String>,
}

impl StageReport {
    fn from_settled<T>(settled: &Settled<T>, outputs: Value) -> Self {
        let status = if settled.fallback || !settled.notes.is_empty() {
            MoveStatus::Partial
        } else {
            MoveStatus::Success
        };
        Self {
            status,
            inputs: json!({}),
            outputs,
            refs: Vec::new(),
            assumptions: Vec::new(),
            uncertainty: settled.notes.clone(),
        }
    }

    fn with_refs<'a>(mut self, refs: impl IntoIterator<Item = &'a String>) -> Self {
        for r in refs {
            if !self.refs.contains(r) {
                self.refs.push(r.clone());
            }
        }
        self
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| JudgementError::validation(format!("move output does not serialize: {e}")))
}

fn is_evidence_ref(item_ref: &str) -> bool {
    item_ref
        .split_once("::")
        .is_some_and(|(kind, _)| kind.parse::<EvidenceKind>().is_ok())
}

fn pack_summary(pack: &ContextPack) -> Value {
    json!({
        "selector_id": pack.selector_id,
        "allocations": pack.allocations,
        "item_refs": pack.refs(),
        "total_tokens": pack.total_tokens(),
        "assembly_errors": pack.assembly_errors,
    })
}

pub struct MovePipeline {
    storage: Arc<Storage>,
    retriever: Arc<dyn EvidenceRetriever>,
    gateway: Arc<LlmGateway>,
    assembler: ContextAssembler,
    assembler_config: AssemblerConfig,
    curation: CurationEngine,
    retrieval_budget: Duration,
    candidates_per_query: u32,
}

impl MovePipeline {
    pub fn new(
        storage: Arc<Storage>,
        llm: Arc<dyn StructuredLlm>,
        retriever: Arc<dyn EvidenceRetriever>,
        config: &AppConfig,
    ) -> Self {
        let gateway = Arc::new(LlmGateway::new(
            llm,
            storage.clone(),
            config.budgets.llm_time_budget(),
        ));
        let assembler_config = AssemblerConfig::from(config);
        let assembler = ContextAssembler::new(
            gateway.clone(),
            SelectorRegistry::with_defaults(),
            assembler_config,
        );
        let curation = CurationEngine::new(
            gateway.clone(),
            retriever.clone(),
            storage.clone(),
            CurationConfig::from(config),
        );
        Self {
            storage,
            retriever,
            gateway,
            assembler,
            assembler_config,
            curation,
            retrieval_budget: config.budgets.retrieval_time_budget(),
            candidates_per_query: config.budgets.candidates_per_query.max(1),
        }
    }

    pub fn with_selectors(mut self, registry: SelectorRegistry) -> Self {
        self.assembler = ContextAssembler::new(self.gateway.clone(), registry, self.assembler_config);
        self
    }

    pub fn with_template(mut self, template: CurationTemplate) -> Self {
        self.curation = self.curation.with_template(template);
        self
    }

    /// Open a run row for `tab` at the snapshot address taken before the run.
    pub async fn start_run(&self, tab: &Tab, address: &ContentAddress) -> Result<MoveRun> {
        self.storage.insert_run(&tab.id, address).await
    }

    /// Start and execute a run in one step.
    pub async fn run(
        &self,
        tab: &Tab,
        address: &ContentAddress,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let run = self.start_run(tab, address).await?;
        self.execute(&run, tab, progress).await
    }

    /// Execute all eight moves for an open run.
    ///
    /// Fatal input errors (missing scenario or framing, no selector for a
    /// move) close the run as `error` and are returned. Any other failure
    /// closes the run as `error` and is reported in the outcome.
    #[instrument(skip_all, fields(run_id = %run.id, tab_id = %tab.id))]
    pub async fn execute(
        &self,
        run: &MoveRun,
        tab: &Tab,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut errors = Vec::new();
        let mut persistence_errors = Vec::new();

        progress.phase("Loading scenario and background evidence");
        let mut state = match self.load_state(&run.id, tab, &mut errors).await {
            Ok(state) => state,
            Err(e) => {
                errors.push(e.to_string());
                return self
                    .abort(run, e, errors, persistence_errors, started, progress)
                    .await;
            }
        };

        let mut all_success = true;
        for (i, move_type) in MoveType::ALL.iter().copied().enumerate() {
            progress.move_started(move_type, i + 1, MoveType::ALL.len());
            let mut trace = MoveTrace::default();
            let result = self.run_stage(move_type, &mut state, &mut trace).await;
            let (event, failure) = self.build_event(&run.id, move_type, (i + 1) as u32, result, &trace);

            if let Err(e) = self.storage.append_move_event(&event).await {
                persistence_errors.push(format!("{move_type} event: {e}"));
                warn!(move_type = %move_type, error = %e, "move event not persisted");
            }
            errors.extend(trace.errors.iter().map(|e| format!("{move_type}: {e}")));
            persistence_errors.extend(trace.persistence_errors);
            progress.move_finished(move_type, event.status);

            if let Some(e) = failure {
                errors.push(format!("{move_type}: {e}"));
                return self
                    .abort(run, e, errors, persistence_errors, started, progress)
                    .await;
            }
            all_success &= event.status == MoveStatus::Success;
            state.record(move_type, event.outputs);
            for note in event.uncertainty_remaining.iter().filter(|n| !trace.errors.contains(n)) {
                if !state.uncertainties.contains(note) {
                    state.uncertainties.push(note.clone());
                }
            }
        }

        let status = match &state.trajectory {
            None => RunStatus::Error,
            Some(_) if all_success && errors.is_empty() && persistence_errors.is_empty() => RunStatus::Success,
            Some(_) => RunStatus::Partial,
        };
        self.close_run(&run.id, status, &errors, &mut persistence_errors).await;

        let outcome = RunOutcome {
            run_id: run.id.clone(),
            status,
            trajectory: state.trajectory,
            errors,
            persistence_errors,
            elapsed: started.elapsed(),
        };
        info!(
            status = status.as_str(),
            errors = outcome.errors.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "run finished"
        );
        progress.done(&outcome);
        Ok(outcome)
    }

    /// Re-run one move of an existing run against the latest recorded outputs
    /// of the moves before it, appending a new event.
    #[instrument(skip(self, progress))]
    pub async fn rerun_stage(
        &self,
        run_id: &str,
        move_type: MoveType,
        progress: &dyn ProgressReporter,
    ) -> Result<MoveEvent> {
        let run = self.storage.get_run(run_id).await?;
        let tab = self.storage.get_tab(&run.tab_id).await?;
        let mut state = self.load_state(run_id, &tab, &mut Vec::new()).await?;

        let index = MoveType::ALL
            .iter()
            .position(|m| *m == move_type)
            .unwrap_or_default();
        for prior in &MoveType::ALL[..index] {
            let event = self
                .storage
                .latest_move_event(run_id, *prior)
                .await?
                .filter(|e| e.status != MoveStatus::Error)
                .ok_or_else(|| {
                    JudgementError::validation(format!(
                        "cannot re-run {move_type}: {prior} has no usable event in run {run_id}"
                    ))
                })?;
            state.absorb(*prior, &event.outputs)?;
        }

        progress.move_started(move_type, index + 1, MoveType::ALL.len());
        let sequence = self.storage.next_sequence(run_id).await?;
        let mut trace = MoveTrace::default();
        let result = self.run_stage(move_type, &mut state, &mut trace).await;
        let (event, failure) = self.build_event(run_id, move_type, sequence, result, &trace);
        self.storage.append_move_event(&event).await?;
        progress.move_finished(move_type, event.status);

        match failure {
            Some(e) => Err(e),
            None => {
                info!(sequence, status = event.status.as_str(), "move re-run appended");
                Ok(event)
            }
        }
    }

    async fn load_state(&self, run_id: &str, tab: &Tab, errors: &mut Vec<String>) -> Result<RunState> {
        let scenario = self.storage.get_scenario(&tab.scenario_id).await?;
        let framing = self.storage.get_framing(&tab.framing_id).await?;
        if framing.scenario_id != scenario.id {
            return Err(JudgementError::validation(format!(
                "framing {} does not belong to scenario {}",
                framing.id, scenario.id
            )));
        }
        let sites = self
            .storage
            .sites_for_scenario(&scenario.project_id, &scenario.id)
            .await?;
        let consultations = match self.storage.consultations(&scenario.project_id).await {
            Ok(c) => c,
            Err(e) => {
                errors.push(format!("consultations: {e}"));
                Vec::new()
            }
        };

        let mut query = format!("{} {}", scenario.title, framing.title);
        for issue in stages::declared_issues(&scenario.state) {
            query.push(' ');
            query.push_str(&issue.title);
        }
        let site_ids: Vec<String> = sites.iter().map(|s| s.id.clone()).collect();
        let (background, background_errors) = pool::load_background(
            self.retriever.as_ref(),
            &scenario.project_id,
            &query,
            &site_ids,
            self.candidates_per_query,
            self.retrieval_budget,
        )
        .await;
        errors.extend(background_errors);

        Ok(RunState::new(run_id, scenario, framing, sites, consultations, background))
    }

    async fn abort(
        &self,
        run: &MoveRun,
        error: JudgementError,
        errors: Vec<String>,
        mut persistence_errors: Vec<String>,
        started: Instant,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        self.close_run(&run.id, RunStatus::Error, &errors, &mut persistence_errors)
            .await;
        warn!(error = %error, fatal = error.is_fatal(), "run aborted");
        if error.is_fatal() {
            return Err(error);
        }
        let outcome = RunOutcome {
            run_id: run.id.clone(),
            status: RunStatus::Error,
            trajectory: None,
            errors,
            persistence_errors,
            elapsed: started.elapsed(),
        };
        progress.done(&outcome);
        Ok(outcome)
    }

    async fn close_run(
        &self,
        run_id: &str,
        status: RunStatus,
        errors: &[String],
        persistence_errors: &mut Vec<String>,
    ) {
        if let Err(e) = self
            .storage
            .finish_run(run_id, status, errors, persistence_errors, Utc::now())
            .await
        {
            warn!(run_id, error = %e, "run row not closed");
            persistence_errors.push(format!("run close: {e}"));
        }
    }

    fn build_event(
        &self,
        run_id: &str,
        move_type: MoveType,
        sequence: u32,
        result: Result<StageReport>,
        trace: &MoveTrace,
    ) -> (MoveEvent, Option<JudgementError>) {
        let (report, failure) = match result {
            Ok(report) => (report, None),
            Err(e) => (
                StageReport {
                    status: MoveStatus::Error,
                    inputs: json!({}),
                    outputs: Value::Null,
                    refs: Vec::new(),
                    assumptions: Vec::new(),
                    uncertainty: vec![e.to_string()],
                },
                Some(e),
            ),
        };
        let mut uncertainty = report.uncertainty;
        uncertainty.extend(trace.errors.iter().cloned());

        let event = MoveEvent {
            id: new_id("evt"),
            run_id: run_id.to_string(),
            move_type,
            sequence,
            status: report.status,
            inputs: report.inputs,
            outputs: report.outputs,
            evidence_refs_considered: report.refs,
            assumptions_introduced: report.assumptions,
            uncertainty_remaining: uncertainty,
            tool_invocation_ids: trace.call_ids.clone(),
            created_at: Utc::now(),
        };
        (event, failure)
    }

    async fn ask<T: DeserializeOwned>(
        &self,
        move_type: MoveType,
        run_id: &str,
        trace: &mut MoveTrace,
        payload: Value,
    ) -> Option<T> {
        let prompt = prompts::for_move(move_type)?;
        self.gateway
            .call_typed(run_id, trace, prompt.prompt_id, prompt.system, prompt.schema_ref, payload)
            .await
    }

    async fn run_stage(
        &self,
        move_type: MoveType,
        state: &mut RunState,
        trace: &mut MoveTrace,
    ) -> Result<StageReport> {
        let facts = pool::data_facts(state);
        let candidates = pool::context_pool(state);
        let pack = self
            .assembler
            .assemble(&state.run_id, trace, move_type, &candidates, &facts)
            .await?;
        let context = pack.to_prompt_json();

        let mut report = match move_type {
            MoveType::Framing => self.framing(state, trace, context).await?,
            MoveType::IssueSurfacing => self.issue_surfacing(state, trace, context).await?,
            MoveType::EvidenceCuration => self.curation(state, trace, context).await?,
            MoveType::EvidenceInterpretation => self.interpretation(state, trace, context).await?,
            MoveType::ConsiderationsFormation => self.considerations(state, trace, context).await?,
            MoveType::WeighingAndBalance => self.weighing(state, trace, context).await?,
            MoveType::NegotiationAndAlteration => self.negotiation(state, trace, context).await?,
            MoveType::PositioningAndNarration => self.positioning(state, trace, context).await?,
        };

        let pack_refs: Vec<String> = pack.refs().into_iter().filter(|r| is_evidence_ref(r)).collect();
        let stage_refs = std::mem::take(&mut report.refs);
        report = report.with_refs(pack_refs.iter()).with_refs(stage_refs.iter());
        report
            .uncertainty
            .extend(pack.assembly_errors.iter().map(|e| format!("context: {e}")));
        if let Value::Object(inputs) = &mut report.inputs {
            inputs.insert("context_pack".to_string(), pack_summary(&pack));
        }
        Ok(report)
    }

    async fn framing(&self, state: &mut RunState, trace: &mut MoveTrace, context: Value) -> Result<StageReport> {
        let payload = json!({
            "context": context,
            "scenario": {"title": state.scenario.title, "state": state.scenario.state},
            "framing": {"title": state.framing.title, "description": state.framing.description},
        });
        let proposed = self.ask(MoveType::Framing, &state.run_id, trace, payload).await;
        let settled = stages::settle_framing(proposed, &state.scenario, &state.framing);
        let mut report = StageReport::from_settled(&settled, to_json(&settled.value)?);
        report.assumptions = settled.value.assumptions.clone();
        report.inputs = json!({"scenario_id": state.scenario.id, "framing_id": state.framing.id});
        state.framed = Some(settled.value);
        Ok(report)
    }

    async fn issue_surfacing(
        &self,
        state: &mut RunState,
        trace: &mut MoveTrace,
        context: Value,
    ) -> Result<StageReport> {
        let payload = json!({
            "context": context,
            "frame": state.framed,
            "declared_issues": stages::declared_issues(&state.scenario.state),
        });
        let proposed: Option<IssuesOutput> = self.ask(MoveType::IssueSurfacing, &state.run_id, trace, payload).await;
        let settled = stages::settle_issues(proposed, &state.scenario);
        let outputs = to_json(&IssuesOutput {
            issues: settled.value.clone(),
        })?;
        let mut report = StageReport::from_settled(&settled, outputs);
        report.inputs = json!({"scenario_id": state.scenario.id});
        state.issues = settled.value;
        Ok(report)
    }

    async fn curation(&self, state: &mut RunState, trace: &mut MoveTrace, context: Value) -> Result<StageReport> {
        let input = CurationInput {
            run_id: state.run_id.clone(),
            project_id: state.project_id().to_string(),
            scenario_id: state.scenario.id.clone(),
            issues: state.issues.clone(),
            site_ids: state.sites.iter().map(|s| s.id.clone()).collect(),
            context: json!({
                "frame_statement": state.framed.as_ref().map(|f| f.frame_statement.as_str()),
                "context": context,
            }),
        };
        let outcome = self.curation.curate(&input, trace).await;
        let set = outcome.set;

        let status = if set.selection_errors.is_empty() {
            MoveStatus::Success
        } else {
            MoveStatus::Partial
        };
        let report = StageReport {
            status,
            inputs: json!({
                "issue_ids": state.issues.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
                "frame_id": outcome.frame.id,
                "frame_version": outcome.frame.version,
                "query_count": outcome.frame.queries.len(),
                "candidate_count": outcome.pool.len(),
            }),
            outputs: to_json(&set)?,
            refs: outcome.pool.iter().map(|c| c.evidence_ref().to_string()).collect(),
            assumptions: Vec::new(),
            uncertainty: set.selection_errors.clone(),
        };
        state.curated = Some(set);
        Ok(report)
    }

    async fn interpretation(
        &self,
        state: &mut RunState,
        trace: &mut MoveTrace,
        context: Value,
    ) -> Result<StageReport> {
        let atoms = state
            .curated
            .as_ref()
            .map(|c| c.evidence_atoms.clone())
            .unwrap_or_default();

        let settled = if atoms.is_empty() {
            Settled {
                value: Vec::new(),
                notes: vec!["no curated evidence to interpret".to_string()],
                fallback: false,
            }
        } else {
            let payload = json!({
                "context": context,
                "atoms": atoms.iter().map(|a| json!({
                    "evidence_ref": a.evidence_ref,
                    "type": a.evidence_type,
                    "title": a.title,
                    "excerpt": a.excerpt,
                    "limitations": a.limitations,
                })).collect::<Vec<_>>(),
            });
            let proposed: Option<InterpretationOutput> =
                self.ask(MoveType::EvidenceInterpretation, &state.run_id, trace, payload).await;
            stages::settle_interpretations(proposed, &atoms)
        };

        let outputs = to_json(&InterpretationOutput {
            interpretations: settled.value.clone(),
        })?;
        let refs: Vec<String> = atoms.iter().map(|a| a.evidence_ref.clone()).collect();
        let mut report = StageReport::from_settled(&settled, outputs).with_refs(refs.iter());
        report.inputs = json!({"atom_count": atoms.len()});
        state.interpretations = settled.value;
        Ok(report)
    }

    async fn considerations(
        &self,
        state: &mut RunState,
        trace: &mut MoveTrace,
        context: Value,
    ) -> Result<StageReport> {
        let payload = json!({
            "context": context,
            "issues": state.issues,
            "interpretations": state.interpretations,
            "evidence_by_issue": state.curated.as_ref().map(|c| &c.evidence_by_issue),
        });
        let proposed: Option<ConsiderationsOutput> =
            self.ask(MoveType::ConsiderationsFormation, &state.run_id, trace, payload).await;
        let evidence = state.evidence_pool();
        let settled = stages::settle_considerations(proposed, &state.issues, state.curated.as_ref(), &evidence);

        let outputs = to_json(&ConsiderationsOutput {
            considerations: settled.value.clone(),
        })?;
        let refs: Vec<String> = settled.value.iter().flat_map(|c| c.evidence_refs.clone()).collect();
        let mut report = StageReport::from_settled(&settled, outputs).with_refs(refs.iter());
        report.inputs = json!({"interpretation_count": state.interpretations.len()});
        state.considerations = settled.value;
        Ok(report)
    }

    async fn weighing(&self, state: &mut RunState, trace: &mut MoveTrace, context: Value) -> Result<StageReport> {
        let payload = json!({
            "context": context,
            "considerations": state.considerations,
        });
        let proposed = self.ask(MoveType::WeighingAndBalance, &state.run_id, trace, payload).await;
        let settled = stages::settle_weighing(proposed, &state.considerations);

        let refs: Vec<String> = state
            .considerations
            .iter()
            .flat_map(|c| c.evidence_refs.clone())
            .collect();
        let mut report = StageReport::from_settled(&settled, to_json(&settled.value)?).with_refs(refs.iter());
        report.inputs = json!({"consideration_count": state.considerations.len()});
        state.weighing = Some(settled.value);
        Ok(report)
    }

    async fn negotiation(
        &self,
        state: &mut RunState,
        trace: &mut MoveTrace,
        context: Value,
    ) -> Result<StageReport> {
        let payload = json!({
            "context": context,
            "considerations": state.considerations,
            "weighing": state.weighing,
        });
        let proposed: Option<NegotiationOutput> =
            self.ask(MoveType::NegotiationAndAlteration, &state.run_id, trace, payload).await;
        let settled = stages::settle_alterations(proposed, &state.considerations);

        let outputs = to_json(&NegotiationOutput {
            alterations: settled.value.clone(),
        })?;
        let refs: Vec<String> = state
            .considerations
            .iter()
            .filter(|c| settled.value.iter().any(|a| a.addresses.contains(&c.id)))
            .flat_map(|c| c.evidence_refs.clone())
            .collect();
        let mut report = StageReport::from_settled(&settled, outputs).with_refs(refs.iter());
        report.inputs = json!({"tilt": state.weighing.as_ref().map(|w| w.tilt)});
        state.alterations = settled.value;
        Ok(report)
    }

    async fn positioning(
        &self,
        state: &mut RunState,
        trace: &mut MoveTrace,
        context: Value,
    ) -> Result<StageReport> {
        let payload = json!({
            "context": context,
            "frame": state.framed,
            "issues": state.issues,
            "considerations": state.considerations,
            "weighing": state.weighing,
            "alterations": state.alterations,
            "uncertainties": state.uncertainties,
        });
        let proposed: Option<Trajectory> =
            self.ask(MoveType::PositioningAndNarration, &state.run_id, trace, payload).await;
        let evidence = state.evidence_pool();
        let inputs = NarrationInputs {
            framing: &state.framing,
            issues: &state.issues,
            curated: state.curated.as_ref(),
            considerations: &state.considerations,
            weighing: state.weighing.as_ref(),
            alterations: &state.alterations,
            uncertainties: &state.uncertainties,
            pool: &evidence,
        };
        let settled = stages::settle_trajectory(proposed, &inputs);

        let trajectory = &settled.value;
        let refs: Vec<String> = trajectory
            .key_evidence_refs
            .iter()
            .chain(trajectory.judgement_sheet.issues.iter().flat_map(|s| &s.evidence_refs))
            .cloned()
            .collect();
        let mut report = StageReport::from_settled(&settled, to_json(trajectory)?).with_refs(refs.iter());
        report.inputs = json!({"uncertainty_count": state.uncertainties.len()});
        state.trajectory = Some(settled.value);
        Ok(report)
    }
}
