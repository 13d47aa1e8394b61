//! Context pack assembly.
//!
//! For one move: resolve its selector, keep the slices whose gates pass,
//! split the token budget across them, then choose items within each slice's
//! share. Both steps ask the model first and fall back to deterministic rules
//! (even split, cheapest-first fill). The per-slice budget is always enforced
//! deterministically afterwards, whatever the model chose.

mod selectors;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use judgement_shared::{AppConfig, ContextItem, ContextPack, MoveType, Result, SliceType};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::gateway::{LlmGateway, MoveTrace};

pub use selectors::{ContextSelector, DataFacts, SelectorRegistry, SliceGate, SliceSpec};

/// Candidate items per slice, already costed.
pub type CandidatePool = BTreeMap<SliceType, Vec<ContextItem>>;

pub const ALLOCATE_PROMPT: &str = "context.allocate.v1";
pub const SELECT_PROMPT: &str = "context.select.v1";

const ALLOCATE_SYSTEM: &str = "You allocate a token budget across context slices for one stage of a \
planning judgement. Give more tokens to slices more relevant to the stage. Allocations are \
non-negative integers whose sum must not exceed the total budget.";

const SELECT_SYSTEM: &str = "You choose which candidate items to include in one context slice. \
Return the refs of the chosen items, most relevant first. The summed token cost of chosen \
items must not exceed the slice budget. Only return refs from the candidate list.";

/// Characters of an item payload shown to the model during selection.
const PREVIEW_CHARS: usize = 280;

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    /// Total token budget of a pack unless the selector overrides it.
    pub total_budget: u32,
}

impl From<&AppConfig> for AssemblerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            total_budget: config.budgets.context_token_budget,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AllocationOutput {
    allocations: BTreeMap<String, u32>,
}

#[derive(Debug, Deserialize)]
struct SelectionOutput {
    selected: Vec<String>,
}

pub struct ContextAssembler {
    gateway: Arc<LlmGateway>,
    registry: SelectorRegistry,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(gateway: Arc<LlmGateway>, registry: SelectorRegistry, config: AssemblerConfig) -> Self {
        Self {
            gateway,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &SelectorRegistry {
        &self.registry
    }

    /// Build the pack for `move_type` from `pool`.
    ///
    /// Fails only when no selector is registered for the move.
    #[instrument(skip_all, fields(run_id = %run_id, move_type = %move_type))]
    pub async fn assemble(
        &self,
        run_id: &str,
        trace: &mut MoveTrace,
        move_type: MoveType,
        pool: &CandidatePool,
        facts: &DataFacts,
    ) -> Result<ContextPack> {
        let selector = self.registry.resolve(move_type)?;
        let budget = selector.total_budget.unwrap_or(self.config.total_budget);
        let active = selector.active_slices(facts);
        let mut assembly_errors = Vec::new();

        let candidates: BTreeMap<SliceType, &[ContextItem]> = active
            .iter()
            .map(|s| (*s, pool.get(s).map(Vec::as_slice).unwrap_or(&[])))
            .collect();
        let non_empty: Vec<SliceType> = active
            .iter()
            .copied()
            .filter(|s| !candidates[s].is_empty())
            .collect();

        // --- Budget allocation ---
        let mut allocations = if non_empty.len() <= 1 {
            even_split(budget, &non_empty)
        } else {
            let payload = json!({
                "move_type": move_type,
                "total_budget": budget,
                "slices": non_empty.iter().map(|s| json!({
                    "slice": s,
                    "candidate_count": candidates[s].len(),
                    "candidate_tokens": candidates[s].iter().map(|i| i.approx_token_cost).sum::<u32>(),
                })).collect::<Vec<_>>(),
            });
            let proposed: Option<AllocationOutput> = self
                .gateway
                .call_typed(run_id, trace, ALLOCATE_PROMPT, ALLOCATE_SYSTEM, "context_allocation", payload)
                .await;
            match proposed.and_then(|p| normalize_allocations(&p.allocations, &non_empty, budget)) {
                Some(allocations) => allocations,
                None => {
                    assembly_errors.push("allocation fell back to an even split".to_string());
                    even_split(budget, &non_empty)
                }
            }
        };
        for slice in &active {
            allocations.entry(*slice).or_insert(0);
        }

        // --- Per-slice selection, one call at a time ---
        let mut slices = BTreeMap::new();
        for slice in &non_empty {
            let items = candidates[slice];
            let slice_budget = allocations[slice];
            let total: u32 = items.iter().map(|i| i.approx_token_cost).sum();

            let selected = if total <= slice_budget {
                items.to_vec()
            } else {
                let payload = json!({
                    "move_type": move_type,
                    "slice": slice,
                    "budget": slice_budget,
                    "candidates": items.iter().map(|i| json!({
                        "ref": i.item_ref,
                        "tokens": i.approx_token_cost,
                        "preview": preview(&i.payload),
                    })).collect::<Vec<_>>(),
                });
                let chosen: Option<SelectionOutput> = self
                    .gateway
                    .call_typed(run_id, trace, SELECT_PROMPT, SELECT_SYSTEM, "context_selection", payload)
                    .await;

                let enforced = chosen.map(|c| {
                    let (kept, rejected) = enforce_budget(items, &c.selected, slice_budget);
                    for r in rejected {
                        assembly_errors.push(format!("{slice}: dropped '{r}' ({})", r.reason()));
                    }
                    kept
                });
                match enforced {
                    Some(kept) if !kept.is_empty() => kept,
                    _ => {
                        assembly_errors.push(format!("{slice}: selection fell back to cheapest-first fill"));
                        fill_cheapest_first(items, slice_budget)
                    }
                }
            };

            if !selected.is_empty() {
                slices.insert(*slice, selected);
            }
        }

        let pack = ContextPack {
            move_type,
            selector_id: selector.id.clone(),
            slices,
            allocations,
            assembly_errors,
        };
        debug!(
            selector = %pack.selector_id,
            tokens = pack.total_tokens(),
            budget,
            items = pack.refs().len(),
            "context pack assembled"
        );
        Ok(pack)
    }
}

fn preview(payload: &serde_json::Value) -> String {
    let text = payload.to_string();
    if text.chars().count() <= PREVIEW_CHARS {
        text
    } else {
        let cut: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

/// Split `budget` evenly across `slices`; the remainder goes to the first.
pub fn even_split(budget: u32, slices: &[SliceType]) -> BTreeMap<SliceType, u32> {
    let mut out = BTreeMap::new();
    if slices.is_empty() {
        return out;
    }
    let n = slices.len() as u32;
    let share = budget / n;
    let mut remainder = budget % n;
    for slice in slices {
        let extra = u32::from(remainder > 0);
        remainder = remainder.saturating_sub(1);
        out.insert(*slice, share + extra);
    }
    out
}

/// Validate a model-proposed allocation.
///
/// Unknown slices are ignored; an allocation over budget is scaled down
/// proportionally. Returns `None` when nothing usable was proposed.
pub fn normalize_allocations(
    proposed: &BTreeMap<String, u32>,
    slices: &[SliceType],
    budget: u32,
) -> Option<BTreeMap<SliceType, u32>> {
    let known: BTreeMap<SliceType, u64> = slices
        .iter()
        .map(|s| (*s, u64::from(proposed.get(s.as_str()).copied().unwrap_or(0))))
        .collect();
    let sum: u64 = known.values().sum();
    if sum == 0 {
        return None;
    }
    let budget64 = u64::from(budget);
    Some(
        known
            .into_iter()
            .map(|(s, v)| {
                let v = if sum > budget64 { v * budget64 / sum } else { v };
                (s, v as u32)
            })
            .collect(),
    )
}

/// Why a model-chosen ref was not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    NotACandidate(String),
    OverBudget(String),
}

impl Rejected {
    fn reason(&self) -> &'static str {
        match self {
            Self::NotACandidate(_) => "not a candidate",
            Self::OverBudget(_) => "over budget",
        }
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotACandidate(r) | Self::OverBudget(r) => f.write_str(r),
        }
    }
}

/// Keep the chosen items, in chosen order, while they fit in `budget`.
/// Refs that are not candidates, repeats, and items that would overflow are
/// rejected.
pub fn enforce_budget(
    items: &[ContextItem],
    chosen: &[String],
    budget: u32,
) -> (Vec<ContextItem>, Vec<Rejected>) {
    let mut kept = Vec::new();
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();
    let mut used = 0u32;

    for r in chosen {
        if !seen.insert(r.as_str()) {
            continue;
        }
        let Some(item) = items.iter().find(|i| &i.item_ref == r) else {
            rejected.push(Rejected::NotACandidate(r.clone()));
            continue;
        };
        match used.checked_add(item.approx_token_cost) {
            Some(total) if total <= budget => {
                used = total;
                kept.push(item.clone());
            }
            _ => rejected.push(Rejected::OverBudget(r.clone())),
        }
    }
    (kept, rejected)
}

/// Largest number of items that fit: cheapest first, ties in candidate order.
/// The result keeps the candidates' original order.
pub fn fill_cheapest_first(items: &[ContextItem], budget: u32) -> Vec<ContextItem> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| (items[i].approx_token_cost, i));

    let mut used = 0u32;
    let mut keep = vec![false; items.len()];
    for i in order {
        match used.checked_add(items[i].approx_token_cost) {
            Some(total) if total <= budget => {
                used = total;
                keep[i] = true;
            }
            _ => break,
        }
    }
    items
        .iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then(|| item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;
    use judgement_llm::{ScriptedLlm, ScriptedReply};
    use proptest::prelude::*;
    use std::time::Duration;

    fn item(r: &str, cost: u32) -> ContextItem {
        ContextItem {
            item_ref: r.into(),
            approx_token_cost: cost,
            payload: json!({"ref": r}),
        }
    }

    async fn assembler(llm: Arc<ScriptedLlm>, budget: u32) -> ContextAssembler {
        let storage = Arc::new(test_storage().await);
        let gateway = Arc::new(LlmGateway::new(llm, storage, Duration::from_secs(2)));
        ContextAssembler::new(
            gateway,
            SelectorRegistry::with_defaults(),
            AssemblerConfig { total_budget: budget },
        )
    }

    fn framing_pool() -> CandidatePool {
        let mut pool = CandidatePool::new();
        pool.insert(SliceType::ScenarioState, vec![item("scenario::sc1", 40)]);
        pool.insert(
            SliceType::PolicyClauses,
            vec![
                item("policy_clause::pc1", 60),
                item("policy_clause::pc2", 50),
                item("policy_clause::pc3", 30),
            ],
        );
        // Gated off: no consultations in the facts.
        pool.insert(SliceType::ConsultationSummaries, vec![item("consultation::c1", 10)]);
        pool
    }

    #[test]
    fn even_split_distributes_remainder() {
        let split = even_split(10, &[SliceType::ScenarioState, SliceType::PolicyClauses, SliceType::DocChunks]);
        assert_eq!(split.values().sum::<u32>(), 10);
        assert_eq!(split[&SliceType::ScenarioState], 4);
        assert_eq!(split[&SliceType::DocChunks], 3);
        assert!(even_split(10, &[]).is_empty());
    }

    #[test]
    fn over_budget_allocation_is_rescaled() {
        let mut proposed = BTreeMap::new();
        proposed.insert("policy_clauses".to_string(), 300);
        proposed.insert("doc_chunks".to_string(), 100);
        proposed.insert("made_up".to_string(), 1_000);
        let slices = [SliceType::PolicyClauses, SliceType::DocChunks];
        let out = normalize_allocations(&proposed, &slices, 200).unwrap();
        assert_eq!(out[&SliceType::PolicyClauses], 150);
        assert_eq!(out[&SliceType::DocChunks], 50);
        assert!(normalize_allocations(&BTreeMap::new(), &slices, 200).is_none());
    }

    #[test]
    fn enforce_budget_drops_fabricated_and_overflowing_refs() {
        let items = vec![item("a", 5), item("b", 5), item("c", 8)];
        let chosen = vec!["c".into(), "zzz".into(), "a".into(), "b".into(), "a".into()];
        let (kept, rejected) = enforce_budget(&items, &chosen, 14);
        let refs: Vec<_> = kept.iter().map(|i| i.item_ref.as_str()).collect();
        assert_eq!(refs, ["c", "a"]);
        assert_eq!(
            rejected,
            vec![Rejected::NotACandidate("zzz".into()), Rejected::OverBudget("b".into())]
        );
    }

    #[test]
    fn cheapest_first_keeps_candidate_order() {
        let items = vec![item("big", 50), item("small", 5), item("mid", 20)];
        let kept = fill_cheapest_first(&items, 30);
        let refs: Vec<_> = kept.iter().map(|i| i.item_ref.as_str()).collect();
        assert_eq!(refs, ["small", "mid"]);
    }

    #[tokio::test]
    async fn model_allocation_and_selection_are_honoured() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .with_reply(
                    ALLOCATE_PROMPT,
                    ScriptedReply::Payload(json!({"allocations": {"scenario_state": 50, "policy_clauses": 100}})),
                )
                .with_reply(
                    SELECT_PROMPT,
                    ScriptedReply::Payload(json!({"selected": ["policy_clause::pc1", "policy_clause::pc9", "policy_clause::pc3"]})),
                ),
        );
        let assembler = assembler(llm.clone(), 150).await;
        let mut trace = MoveTrace::default();
        let pack = assembler
            .assemble("run_1", &mut trace, MoveType::Framing, &framing_pool(), &DataFacts::default())
            .await
            .unwrap();

        assert_eq!(pack.selector_id, "framing.default");
        assert_eq!(pack.allocations[&SliceType::PolicyClauses], 100);
        let refs = pack.refs();
        assert!(refs.contains(&"scenario::sc1".to_string()));
        assert!(refs.contains(&"policy_clause::pc1".to_string()));
        assert!(refs.contains(&"policy_clause::pc3".to_string()));
        assert!(!refs.contains(&"policy_clause::pc9".to_string()));
        assert!(!pack.slices.contains_key(&SliceType::ConsultationSummaries));
        assert!(pack.assembly_errors.iter().any(|e| e.contains("pc9")));
        // Scenario state fits its allocation, so only policy needed a selection call.
        assert_eq!(llm.calls(SELECT_PROMPT), 1);
        assert_eq!(trace.call_ids.len(), 2);
    }

    #[tokio::test]
    async fn failed_calls_fall_back_within_budget() {
        let llm = Arc::new(ScriptedLlm::new());
        let assembler = assembler(llm, 100).await;
        let mut trace = MoveTrace::default();
        let pack = assembler
            .assemble("run_1", &mut trace, MoveType::Framing, &framing_pool(), &DataFacts::default())
            .await
            .unwrap();

        assert_eq!(pack.allocations[&SliceType::ScenarioState], 50);
        assert_eq!(pack.allocations[&SliceType::PolicyClauses], 50);
        for (slice, budget) in &pack.allocations {
            assert!(pack.slice_tokens(*slice) <= *budget);
        }
        assert!(!trace.errors.is_empty());
        assert!(pack.assembly_errors.iter().any(|e| e.contains("even split")));
    }

    #[tokio::test]
    async fn unknown_selector_is_fatal() {
        let storage = Arc::new(test_storage().await);
        let gateway = Arc::new(LlmGateway::new(Arc::new(ScriptedLlm::new()), storage, Duration::from_secs(1)));
        let assembler = ContextAssembler::new(gateway, SelectorRegistry::empty(), AssemblerConfig { total_budget: 10 });
        let err = assembler
            .assemble("run_1", &mut MoveTrace::default(), MoveType::Framing, &CandidatePool::new(), &DataFacts::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    proptest! {
        #[test]
        fn enforced_selection_never_exceeds_budget(
            costs in prop::collection::vec(1u32..400, 0..24),
            picks in prop::collection::vec(0usize..30, 0..30),
            budget in 0u32..2_000,
        ) {
            let items: Vec<ContextItem> = costs
                .iter()
                .enumerate()
                .map(|(i, c)| item(&format!("r{i}"), *c))
                .collect();
            let chosen: Vec<String> = picks.iter().map(|p| format!("r{p}")).collect();

            let (kept, _) = enforce_budget(&items, &chosen, budget);
            prop_assert!(kept.iter().map(|i| i.approx_token_cost).sum::<u32>() <= budget);
            for k in &kept {
                prop_assert!(items.iter().any(|i| i.item_ref == k.item_ref));
            }

            let filled = fill_cheapest_first(&items, budget);
            prop_assert!(filled.iter().map(|i| i.approx_token_cost).sum::<u32>() <= budget);
        }

        #[test]
        fn normalized_allocations_fit_total(
            values in prop::collection::vec(0u32..100_000, 3),
            budget in 1u32..50_000,
        ) {
            let slices = [SliceType::PolicyClauses, SliceType::DocChunks, SliceType::PriorMoves];
            let proposed: BTreeMap<String, u32> = slices
                .iter()
                .zip(values.iter())
                .map(|(s, v)| (s.as_str().to_string(), *v))
                .collect();
            if let Some(out) = normalize_allocations(&proposed, &slices, budget) {
                prop_assert!(out.values().map(|v| u64::from(*v)).sum::<u64>() <= u64::from(budget));
            }
            prop_assert!(even_split(budget, &slices).values().sum::<u32>() == budget);
        }
    }
}
