//! Typed move outputs, their validation, and the deterministic fallbacks used
//! when a structured call fails or returns something unusable.

use std::collections::{BTreeSet, HashSet};

use judgement_shared::{
    CuratedEvidenceSet, EvidenceAtom, Issue, JudgementError, JudgementSheet, MoveType, Result,
    SheetIssue, Trajectory,
};
use judgement_storage::{ConsultationRecord, FramingRecord, ScenarioRecord, SiteRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::pool::Background;

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FramingOutput {
    #[serde(default)]
    pub frame_statement: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuesOutput {
    #[serde(default)]
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    High,
    Medium,
    Low,
    #[default]
    Unassessed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub evidence_ref: String,
    #[serde(default)]
    pub interpretation: String,
    #[serde(default)]
    pub reliability: Reliability,
    #[serde(default)]
    pub limitations: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterpretationOutput {
    #[serde(default)]
    pub interpretations: Vec<Interpretation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    For,
    Against,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consideration {
    #[serde(default)]
    pub id: String,
    pub issue_id: String,
    pub statement: String,
    pub direction: Direction,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsiderationsOutput {
    #[serde(default)]
    pub considerations: Vec<Consideration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weight {
    pub consideration_id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tilt {
    For,
    Against,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeighingOutput {
    #[serde(default)]
    pub weights: Vec<Weight>,
    #[serde(default)]
    pub balance_summary: String,
    pub tilt: Tilt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alteration {
    pub description: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NegotiationOutput {
    #[serde(default)]
    pub alterations: Vec<Alteration>,
}

// ---------------------------------------------------------------------------
// Settling
// ---------------------------------------------------------------------------

/// A validated move output plus what validation had to say about it.
#[derive(Debug, Clone)]
pub struct Settled<T> {
    pub value: T,
    /// Dropped content and substitutions, recorded as remaining uncertainty.
    pub notes: Vec<String>,
    /// The value came from a deterministic fallback.
    pub fallback: bool,
}

impl<T> Settled<T> {
    fn accepted(value: T, notes: Vec<String>) -> Self {
        Self {
            value,
            notes,
            fallback: false,
        }
    }

    fn fallback(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            notes: vec![reason.into()],
            fallback: true,
        }
    }
}

/// Evidence refs a run may cite.
#[derive(Debug, Clone, Default)]
pub struct EvidencePool {
    refs: HashSet<String>,
}

impl EvidencePool {
    pub fn new(refs: impl IntoIterator<Item = String>) -> Self {
        Self {
            refs: refs.into_iter().collect(),
        }
    }

    pub fn contains(&self, evidence_ref: &str) -> bool {
        self.refs.contains(evidence_ref)
    }

    /// Known refs, deduplicated, in their original order. Unknown refs are
    /// appended to `dropped`.
    pub fn filter(&self, refs: &[String], dropped: &mut Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        for r in refs {
            if !self.contains(r) {
                dropped.push(r.clone());
            } else if seen.insert(r.as_str()) {
                kept.push(r.clone());
            }
        }
        kept
    }
}

fn dropped_note(dropped: &[String]) -> Option<String> {
    if dropped.is_empty() {
        return None;
    }
    let unique: BTreeSet<&str> = dropped.iter().map(String::as_str).collect();
    Some(format!(
        "dropped {} evidence ref(s) not in the run's evidence pool: {}",
        unique.len(),
        unique.into_iter().collect::<Vec<_>>().join(", ")
    ))
}

fn failed(prompt: &str) -> String {
    format!("{prompt} produced without model assistance")
}

pub fn settle_framing(
    proposed: Option<FramingOutput>,
    scenario: &ScenarioRecord,
    framing: &FramingRecord,
) -> Settled<FramingOutput> {
    if let Some(mut out) = proposed {
        out.frame_statement = out.frame_statement.trim().to_string();
        if !out.frame_statement.is_empty() {
            out.objectives.retain(|o| !o.trim().is_empty());
            out.assumptions.retain(|a| !a.trim().is_empty());
            return Settled::accepted(out, Vec::new());
        }
    }
    Settled::fallback(
        FramingOutput {
            frame_statement: format!(
                "Whether '{}' is acceptable, judged from the '{}' perspective.",
                scenario.title, framing.title
            ),
            objectives: vec![
                "Identify the material planning issues".to_string(),
                "Weigh the evidence for and against the proposal".to_string(),
            ],
            assumptions: Vec::new(),
        },
        failed("framing"),
    )
}

fn slug(text: &str) -> String {
    let mut out = String::new();
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        if !out.is_empty() {
            out.push('_');
        }
        out.push_str(&word.to_lowercase());
    }
    out
}

/// Issues declared in the scenario state under `issues`, if any.
pub fn declared_issues(state: &Value) -> Vec<Issue> {
    state
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value::<Issue>(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn clean_issues(issues: Vec<Issue>, notes: &mut Vec<String>) -> Vec<Issue> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for mut issue in issues {
        issue.title = issue.title.trim().to_string();
        if issue.title.is_empty() {
            notes.push("issue without a title dropped".to_string());
            continue;
        }
        issue.id = if issue.id.trim().is_empty() {
            slug(&issue.title)
        } else {
            issue.id.trim().to_string()
        };
        if !seen.insert(issue.id.clone()) {
            notes.push(format!("duplicate issue '{}' dropped", issue.id));
            continue;
        }
        out.push(issue);
    }
    out
}

pub fn settle_issues(proposed: Option<IssuesOutput>, scenario: &ScenarioRecord) -> Settled<Vec<Issue>> {
    let mut notes = Vec::new();
    if let Some(out) = proposed {
        let issues = clean_issues(out.issues, &mut notes);
        if !issues.is_empty() {
            return Settled::accepted(issues, notes);
        }
    }

    let declared = clean_issues(declared_issues(&scenario.state), &mut Vec::new());
    if !declared.is_empty() {
        return Settled::fallback(declared, "issues taken from the scenario state without model assistance");
    }
    Settled::fallback(
        vec![Issue {
            id: "overall".to_string(),
            title: "Overall acceptability".to_string(),
            description: format!("Whether '{}' is acceptable overall.", scenario.title),
        }],
        "no issues surfaced; judged as a single overall-acceptability issue",
    )
}

fn fallback_interpretation(atom: &EvidenceAtom) -> Interpretation {
    Interpretation {
        evidence_ref: atom.evidence_ref.clone(),
        interpretation: if atom.summary.trim().is_empty() {
            atom.excerpt.clone()
        } else {
            atom.summary.clone()
        },
        reliability: Reliability::Unassessed,
        limitations: atom.limitations.clone(),
    }
}

/// One interpretation per atom, in atom order.
pub fn settle_interpretations(
    proposed: Option<InterpretationOutput>,
    atoms: &[EvidenceAtom],
) -> Settled<Vec<Interpretation>> {
    let Some(out) = proposed else {
        return Settled::fallback(
            atoms.iter().map(fallback_interpretation).collect(),
            failed("evidence interpretation"),
        );
    };

    let mut dropped = Vec::new();
    let mut by_ref = std::collections::HashMap::new();
    for i in out.interpretations {
        if !atoms.iter().any(|a| a.evidence_ref == i.evidence_ref) {
            dropped.push(i.evidence_ref);
        } else if !i.interpretation.trim().is_empty() {
            by_ref.entry(i.evidence_ref.clone()).or_insert(i);
        }
    }

    let mut missing = 0;
    let value = atoms
        .iter()
        .map(|atom| {
            by_ref.remove(&atom.evidence_ref).unwrap_or_else(|| {
                missing += 1;
                fallback_interpretation(atom)
            })
        })
        .collect();

    let mut notes: Vec<String> = dropped_note(&dropped).into_iter().collect();
    if missing > 0 {
        notes.push(format!("{missing} atom(s) interpreted without model assistance"));
    }
    Settled::accepted(value, notes)
}

/// For/against/neutral considerations derived from the curated roles.
pub fn fallback_considerations(issues: &[Issue], curated: Option<&CuratedEvidenceSet>) -> Vec<Consideration> {
    let mut out = Vec::new();
    let mut push = |issue: &Issue, direction, statement: String, refs: &[String]| {
        out.push(Consideration {
            id: String::new(),
            issue_id: issue.id.clone(),
            statement,
            direction,
            evidence_refs: refs.to_vec(),
        });
    };
    for issue in issues {
        let selection = curated.and_then(|c| c.issue(&issue.id));
        let (supporting, countervailing, contextual) = match selection {
            Some(s) => (s.supporting.as_slice(), s.countervailing.as_slice(), s.contextual.as_slice()),
            None => (&[][..], &[][..], &[][..]),
        };
        if !supporting.is_empty() {
            push(issue, Direction::For, format!("Evidence supports the proposal on {}.", issue.title), supporting);
        }
        if !countervailing.is_empty() {
            push(issue, Direction::Against, format!("Evidence weighs against the proposal on {}.", issue.title), countervailing);
        }
        if supporting.is_empty() && countervailing.is_empty() {
            push(issue, Direction::Neutral, format!("No curated evidence decides {}.", issue.title), contextual);
        }
    }
    for (i, c) in out.iter_mut().enumerate() {
        c.id = format!("k{}", i + 1);
    }
    out
}

pub fn settle_considerations(
    proposed: Option<ConsiderationsOutput>,
    issues: &[Issue],
    curated: Option<&CuratedEvidenceSet>,
    pool: &EvidencePool,
) -> Settled<Vec<Consideration>> {
    let mut notes = Vec::new();
    let mut dropped = Vec::new();
    let mut kept: Vec<Consideration> = Vec::new();

    for mut c in proposed.map(|p| p.considerations).unwrap_or_default() {
        if !issues.iter().any(|i| i.id == c.issue_id) {
            notes.push(format!("consideration for unknown issue '{}' dropped", c.issue_id));
            continue;
        }
        if c.statement.trim().is_empty() {
            continue;
        }
        c.evidence_refs = pool.filter(&c.evidence_refs, &mut dropped);
        kept.push(c);
    }

    let mut seen = HashSet::new();
    for (n, c) in kept.iter_mut().enumerate() {
        if c.id.trim().is_empty() || !seen.insert(c.id.clone()) {
            c.id = format!("k{}", n + 1);
            seen.insert(c.id.clone());
        }
    }
    notes.extend(dropped_note(&dropped));

    if kept.is_empty() {
        return Settled::fallback(fallback_considerations(issues, curated), failed("considerations"));
    }
    Settled::accepted(kept, notes)
}

pub fn tilt_from(weights: &[Weight], considerations: &[Consideration]) -> Tilt {
    let score: f64 = weights
        .iter()
        .filter_map(|w| {
            let c = considerations.iter().find(|c| c.id == w.consideration_id)?;
            match c.direction {
                Direction::For => Some(w.weight),
                Direction::Against => Some(-w.weight),
                Direction::Neutral => None,
            }
        })
        .sum();
    if score > 0.05 {
        Tilt::For
    } else if score < -0.05 {
        Tilt::Against
    } else {
        Tilt::Balanced
    }
}

fn balance_summary(tilt: Tilt, considerations: &[Consideration]) -> String {
    let count = |d| considerations.iter().filter(|c| c.direction == d).count();
    let verdict = match tilt {
        Tilt::For => "tilts in favour",
        Tilt::Against => "tilts against",
        Tilt::Balanced => "is finely balanced",
    };
    format!(
        "{} consideration(s) favour the proposal and {} weigh against it; the balance {verdict}.",
        count(Direction::For),
        count(Direction::Against)
    )
}

pub fn settle_weighing(proposed: Option<WeighingOutput>, considerations: &[Consideration]) -> Settled<WeighingOutput> {
    let Some(mut out) = proposed else {
        let weights: Vec<Weight> = considerations
            .iter()
            .map(|c| Weight {
                consideration_id: c.id.clone(),
                weight: 0.5,
            })
            .collect();
        let tilt = tilt_from(&weights, considerations);
        return Settled::fallback(
            WeighingOutput {
                balance_summary: balance_summary(tilt, considerations),
                weights,
                tilt,
            },
            "equal weights assigned without model assistance",
        );
    };

    let mut notes = Vec::new();
    let mut seen = HashSet::new();
    out.weights.retain(|w| {
        considerations.iter().any(|c| c.id == w.consideration_id)
            && w.weight.is_finite()
            && seen.insert(w.consideration_id.clone())
    });
    for w in &mut out.weights {
        w.weight = w.weight.clamp(0.0, 1.0);
    }
    let unweighted: Vec<&Consideration> = considerations
        .iter()
        .filter(|c| !seen.contains(&c.id))
        .collect();
    if !unweighted.is_empty() {
        notes.push(format!("{} consideration(s) given a neutral weight", unweighted.len()));
        for c in unweighted {
            out.weights.push(Weight {
                consideration_id: c.id.clone(),
                weight: 0.5,
            });
        }
    }
    if out.balance_summary.trim().is_empty() {
        out.balance_summary = balance_summary(out.tilt, considerations);
    }
    Settled::accepted(out, notes)
}

pub fn settle_alterations(
    proposed: Option<NegotiationOutput>,
    considerations: &[Consideration],
) -> Settled<Vec<Alteration>> {
    let Some(out) = proposed else {
        let value = considerations
            .iter()
            .filter(|c| c.direction == Direction::Against)
            .map(|c| Alteration {
                description: format!("Address the objection: {}", c.statement),
                addresses: vec![c.id.clone()],
                conditions: Vec::new(),
            })
            .collect();
        return Settled::fallback(value, failed("negotiation"));
    };

    let mut notes = Vec::new();
    let mut value = Vec::new();
    for mut a in out.alterations {
        if a.description.trim().is_empty() {
            continue;
        }
        let before = a.addresses.len();
        a.addresses.retain(|id| considerations.iter().any(|c| &c.id == id));
        if a.addresses.len() < before {
            notes.push(format!(
                "alteration '{}' cited unknown considerations",
                a.description
            ));
        }
        a.conditions.retain(|c| !c.trim().is_empty());
        value.push(a);
    }
    Settled::accepted(value, notes)
}

/// Everything the final move narrates from.
pub struct NarrationInputs<'a> {
    pub framing: &'a FramingRecord,
    pub issues: &'a [Issue],
    pub curated: Option<&'a CuratedEvidenceSet>,
    pub considerations: &'a [Consideration],
    pub weighing: Option<&'a WeighingOutput>,
    pub alterations: &'a [Alteration],
    /// Uncertainty carried forward from earlier moves.
    pub uncertainties: &'a [String],
    pub pool: &'a EvidencePool,
}

fn fallback_trajectory(inputs: &NarrationInputs<'_>) -> Trajectory {
    let tilt = inputs.weighing.map(|w| w.tilt).unwrap_or(Tilt::Balanced);
    let verdict = match tilt {
        Tilt::For => "acceptable",
        Tilt::Against => "not acceptable",
        Tilt::Balanced => "finely balanced",
    };

    let mut key_refs: Vec<String> = Vec::new();
    for r in inputs.considerations.iter().flat_map(|c| &c.evidence_refs) {
        if key_refs.len() >= 6 {
            break;
        }
        if !key_refs.contains(r) {
            key_refs.push(r.clone());
        }
    }

    let issues = inputs
        .issues
        .iter()
        .map(|issue| {
            let related: Vec<&Consideration> = inputs
                .considerations
                .iter()
                .filter(|c| c.issue_id == issue.id)
                .collect();
            let count = |d| related.iter().filter(|c| c.direction == d).count();
            SheetIssue {
                issue_id: issue.id.clone(),
                title: issue.title.clone(),
                assessment: format!(
                    "{} consideration(s) for, {} against.",
                    count(Direction::For),
                    count(Direction::Against)
                ),
                evidence_refs: inputs
                    .curated
                    .and_then(|c| c.issue(&issue.id))
                    .map(|s| s.all_refs().cloned().collect())
                    .unwrap_or_default(),
            }
        })
        .collect();

    let conditions = inputs
        .alterations
        .iter()
        .flat_map(|a| {
            if a.conditions.is_empty() {
                vec![a.description.clone()]
            } else {
                a.conditions.clone()
            }
        })
        .collect();

    Trajectory {
        position_statement: format!(
            "Under the '{}' framing the proposal is {verdict} on the evidence curated.",
            inputs.framing.title
        ),
        key_evidence_refs: key_refs,
        judgement_sheet: JudgementSheet {
            headline: format!("Proposal {verdict}"),
            issues,
            balance: inputs
                .weighing
                .map(|w| w.balance_summary.clone())
                .unwrap_or_default(),
            conditions,
            uncertainties: inputs.uncertainties.to_vec(),
            generated_by_fallback: true,
        },
    }
}

pub fn settle_trajectory(proposed: Option<Trajectory>, inputs: &NarrationInputs<'_>) -> Settled<Trajectory> {
    let Some(mut t) = proposed.filter(|t| !t.position_statement.trim().is_empty()) else {
        return Settled::fallback(fallback_trajectory(inputs), failed("narration"));
    };

    let mut notes = Vec::new();
    let mut dropped = Vec::new();
    t.key_evidence_refs = inputs.pool.filter(&t.key_evidence_refs, &mut dropped);
    t.judgement_sheet.issues.retain(|s| {
        let known = inputs.issues.iter().any(|i| i.id == s.issue_id);
        if !known {
            notes.push(format!("sheet entry for unknown issue '{}' dropped", s.issue_id));
        }
        known
    });
    for s in &mut t.judgement_sheet.issues {
        s.evidence_refs = inputs.pool.filter(&s.evidence_refs, &mut dropped);
    }
    notes.extend(dropped_note(&dropped));
    t.judgement_sheet.generated_by_fallback = false;
    t.judgement_sheet.uncertainties.extend(notes.iter().cloned());
    Settled::accepted(t, notes)
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Inputs and accumulated move outputs for one run.
pub struct RunState {
    pub run_id: String,
    pub scenario: ScenarioRecord,
    pub framing: FramingRecord,
    pub sites: Vec<SiteRecord>,
    pub consultations: Vec<ConsultationRecord>,
    pub background: Background,
    pub framed: Option<FramingOutput>,
    pub issues: Vec<Issue>,
    pub curated: Option<CuratedEvidenceSet>,
    pub interpretations: Vec<Interpretation>,
    pub considerations: Vec<Consideration>,
    pub weighing: Option<WeighingOutput>,
    pub alterations: Vec<Alteration>,
    pub trajectory: Option<Trajectory>,
    /// Outputs of completed moves, in pipeline order.
    pub prior: Vec<(MoveType, Value)>,
    /// Uncertainty recorded by completed moves.
    pub uncertainties: Vec<String>,
}

impl RunState {
    pub fn new(
        run_id: &str,
        scenario: ScenarioRecord,
        framing: FramingRecord,
        sites: Vec<SiteRecord>,
        consultations: Vec<ConsultationRecord>,
        background: Background,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            scenario,
            framing,
            sites,
            consultations,
            background,
            framed: None,
            issues: Vec::new(),
            curated: None,
            interpretations: Vec::new(),
            considerations: Vec::new(),
            weighing: None,
            alterations: Vec::new(),
            trajectory: None,
            prior: Vec::new(),
            uncertainties: Vec::new(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.scenario.project_id
    }

    /// Refs the run may cite: curated atoms plus background evidence.
    pub fn evidence_pool(&self) -> EvidencePool {
        let curated = self
            .curated
            .iter()
            .flat_map(|c| c.evidence_atoms.iter().map(|a| a.evidence_ref.clone()));
        EvidencePool::new(curated.chain(self.background.refs()))
    }

    /// Record a move's output so later moves can see it.
    pub fn record(&mut self, move_type: MoveType, outputs: Value) {
        self.prior.retain(|(m, _)| *m != move_type);
        self.prior.push((move_type, outputs));
    }

    /// Rebuild typed state from a recorded move output.
    pub fn absorb(&mut self, move_type: MoveType, outputs: &Value) -> Result<()> {
        fn decode<T: serde::de::DeserializeOwned>(move_type: MoveType, v: &Value) -> Result<T> {
            serde_json::from_value(v.clone()).map_err(|e| {
                JudgementError::validation(format!("recorded {move_type} output is unreadable: {e}"))
            })
        }
        match move_type {
            MoveType::Framing => self.framed = Some(decode(move_type, outputs)?),
            MoveType::IssueSurfacing => {
                self.issues = decode::<IssuesOutput>(move_type, outputs)?.issues;
            }
            MoveType::EvidenceCuration => self.curated = Some(decode(move_type, outputs)?),
            MoveType::EvidenceInterpretation => {
                self.interpretations = decode::<InterpretationOutput>(move_type, outputs)?.interpretations;
            }
            MoveType::ConsiderationsFormation => {
                self.considerations = decode::<ConsiderationsOutput>(move_type, outputs)?.considerations;
            }
            MoveType::WeighingAndBalance => self.weighing = Some(decode(move_type, outputs)?),
            MoveType::NegotiationAndAlteration => {
                self.alterations = decode::<NegotiationOutput>(move_type, outputs)?.alterations;
            }
            MoveType::PositioningAndNarration => self.trajectory = Some(decode(move_type, outputs)?),
        }
        self.record(move_type, outputs.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use judgement_shared::IssueEvidence;
    use serde_json::json;

    fn scenario(state: Value) -> ScenarioRecord {
        ScenarioRecord {
            id: "sc1".into(),
            project_id: "p1".into(),
            title: "Housing on the meadow".into(),
            state,
            updated_at: String::new(),
        }
    }

    fn framing() -> FramingRecord {
        FramingRecord {
            id: "fr1".into(),
            scenario_id: "sc1".into(),
            title: "Officer view".into(),
            description: String::new(),
            updated_at: String::new(),
        }
    }

    fn issue(id: &str, title: &str) -> Issue {
        Issue {
            id: id.into(),
            title: title.into(),
            description: String::new(),
        }
    }

    fn curated() -> CuratedEvidenceSet {
        CuratedEvidenceSet {
            evidence_by_issue: vec![IssueEvidence {
                issue_id: "flood".into(),
                supporting: vec!["doc_chunk::c1".into()],
                countervailing: vec!["doc_chunk::c3".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn consideration(id: &str, direction: Direction, refs: &[&str]) -> Consideration {
        Consideration {
            id: id.into(),
            issue_id: "flood".into(),
            statement: format!("statement {id}"),
            direction,
            evidence_refs: refs.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn blank_framing_falls_back() {
        let settled = settle_framing(Some(FramingOutput::default()), &scenario(json!({})), &framing());
        assert!(settled.fallback);
        assert!(settled.value.frame_statement.contains("Officer view"));
    }

    #[test]
    fn issues_fall_back_to_state_then_overall() {
        let state = json!({"issues": [{"id": "flood", "title": "Flood risk"}, {"title": "Design"}]});
        let settled = settle_issues(None, &scenario(state));
        assert!(settled.fallback);
        let ids: Vec<_> = settled.value.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["flood", "design"]);

        let settled = settle_issues(Some(IssuesOutput::default()), &scenario(json!({})));
        assert_eq!(settled.value[0].id, "overall");
    }

    #[test]
    fn model_issues_are_cleaned() {
        let out = IssuesOutput {
            issues: vec![
                issue("", "Heritage Setting"),
                issue("flood", "Flood risk"),
                issue("flood", "Flooding again"),
                issue("x", "  "),
            ],
        };
        let settled = settle_issues(Some(out), &scenario(json!({})));
        assert!(!settled.fallback);
        assert_eq!(settled.value[0].id, "heritage_setting");
        assert_eq!(settled.value.len(), 2);
        assert_eq!(settled.notes.len(), 2);
    }

    #[test]
    fn considerations_filter_refs_and_fill_ids() {
        let pool = EvidencePool::new(["doc_chunk::c1".to_string()]);
        let out = ConsiderationsOutput {
            considerations: vec![
                consideration("", Direction::For, &["doc_chunk::c1", "doc_chunk::nope"]),
                consideration("a", Direction::Against, &[]),
                consideration("a", Direction::Neutral, &[]),
            ],
        };
        let settled = settle_considerations(Some(out), &[issue("flood", "Flood risk")], None, &pool);
        assert!(!settled.fallback);
        assert_eq!(settled.value[0].evidence_refs, ["doc_chunk::c1"]);
        let ids: Vec<_> = settled.value.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["k1", "a", "k3"]);
        assert!(settled.notes.iter().any(|n| n.contains("doc_chunk::nope")));
    }

    #[test]
    fn fallback_considerations_follow_roles() {
        let issues = [issue("flood", "Flood risk"), issue("access", "Access")];
        let out = fallback_considerations(&issues, Some(&curated()));
        let directions: Vec<_> = out.iter().map(|c| c.direction).collect();
        assert_eq!(directions, [Direction::For, Direction::Against, Direction::Neutral]);
        assert_eq!(out[1].evidence_refs, ["doc_chunk::c3"]);
        assert_eq!(out[2].issue_id, "access");
    }

    #[test]
    fn weighing_fills_and_clamps() {
        let considerations = [
            consideration("k1", Direction::For, &[]),
            consideration("k2", Direction::Against, &[]),
        ];
        let out = WeighingOutput {
            weights: vec![
                Weight { consideration_id: "k2".into(), weight: 3.0 },
                Weight { consideration_id: "ghost".into(), weight: 0.1 },
            ],
            balance_summary: String::new(),
            tilt: Tilt::Against,
        };
        let settled = settle_weighing(Some(out), &considerations);
        assert_eq!(settled.value.weights.len(), 2);
        assert_eq!(settled.value.weights[0].weight, 1.0);
        assert!(!settled.value.balance_summary.is_empty());
        assert_eq!(tilt_from(&settled.value.weights, &considerations), Tilt::Against);

        let fallback = settle_weighing(None, &considerations);
        assert_eq!(fallback.value.tilt, Tilt::Balanced);
    }

    #[test]
    fn alterations_fall_back_to_objections() {
        let considerations = [
            consideration("k1", Direction::For, &[]),
            consideration("k2", Direction::Against, &[]),
        ];
        let settled = settle_alterations(None, &considerations);
        assert_eq!(settled.value.len(), 1);
        assert_eq!(settled.value[0].addresses, ["k2"]);
    }

    #[test]
    fn trajectory_refs_are_checked() {
        let pool = EvidencePool::new(["doc_chunk::c1".to_string(), "doc_chunk::c3".to_string()]);
        let issues = [issue("flood", "Flood risk")];
        let curated = curated();
        let considerations = [consideration("k1", Direction::Against, &["doc_chunk::c3"])];
        let inputs = NarrationInputs {
            framing: &framing(),
            issues: &issues,
            curated: Some(&curated),
            considerations: &considerations,
            weighing: None,
            alterations: &[],
            uncertainties: &["retrieval timed out".to_string()],
            pool: &pool,
        };

        let fallback = settle_trajectory(None, &inputs);
        assert!(fallback.value.judgement_sheet.generated_by_fallback);
        assert_eq!(fallback.value.key_evidence_refs, ["doc_chunk::c3"]);
        assert_eq!(fallback.value.judgement_sheet.issues[0].evidence_refs.len(), 2);
        assert_eq!(fallback.value.judgement_sheet.uncertainties, ["retrieval timed out"]);

        let proposed: Trajectory = serde_json::from_value(json!({
            "position_statement": "Refuse.",
            "key_evidence_refs": ["doc_chunk::c3", "policy_clause::made_up"],
            "judgement_sheet": {"headline": "Refuse", "balance": "against",
                "issues": [{"issue_id": "flood", "title": "Flood", "assessment": "harmful",
                            "evidence_refs": ["doc_chunk::c1"]},
                           {"issue_id": "ghost", "title": "?", "assessment": "?"}]}
        }))
        .unwrap();
        let settled = settle_trajectory(Some(proposed), &inputs);
        assert!(!settled.fallback);
        assert_eq!(settled.value.key_evidence_refs, ["doc_chunk::c3"]);
        assert_eq!(settled.value.judgement_sheet.issues.len(), 1);
        assert_eq!(settled.notes.len(), 2);
    }
}
