//! Context selectors: which slices each move draws on.

use std::collections::HashMap;

use judgement_shared::{JudgementError, MoveType, Result, SliceType};

/// Data-availability predicate that must hold for a gated slice to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceGate {
    HasSites,
    HasVisualAssets,
    HasInstrumentOutputs,
    HasConsultations,
    HasCuratedEvidence,
}

/// What the evidence base holds for the run being assembled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFacts {
    pub has_sites: bool,
    pub has_visual_assets: bool,
    pub has_instrument_outputs: bool,
    pub has_consultations: bool,
    pub has_curated_evidence: bool,
}

impl SliceGate {
    pub fn passes(&self, facts: &DataFacts) -> bool {
        match self {
            Self::HasSites => facts.has_sites,
            Self::HasVisualAssets => facts.has_visual_assets,
            Self::HasInstrumentOutputs => facts.has_instrument_outputs,
            Self::HasConsultations => facts.has_consultations,
            Self::HasCuratedEvidence => facts.has_curated_evidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    pub slice: SliceType,
    pub gate: Option<SliceGate>,
}

impl SliceSpec {
    pub fn always(slice: SliceType) -> Self {
        Self { slice, gate: None }
    }

    pub fn gated(slice: SliceType, gate: SliceGate) -> Self {
        Self {
            slice,
            gate: Some(gate),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextSelector {
    pub id: String,
    pub slices: Vec<SliceSpec>,
    /// Overrides the assembler-wide token budget when set.
    pub total_budget: Option<u32>,
}

impl ContextSelector {
    pub fn new(id: impl Into<String>, slices: Vec<SliceSpec>) -> Self {
        Self {
            id: id.into(),
            slices,
            total_budget: None,
        }
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.total_budget = Some(budget);
        self
    }

    /// Slices whose gate passes, in declaration order.
    pub fn active_slices(&self, facts: &DataFacts) -> Vec<SliceType> {
        self.slices
            .iter()
            .filter(|s| s.gate.is_none_or(|g| g.passes(facts)))
            .map(|s| s.slice)
            .collect()
    }
}

/// Move type -> selector.
#[derive(Debug, Clone, Default)]
pub struct SelectorRegistry {
    selectors: HashMap<MoveType, ContextSelector>,
}

impl SelectorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, move_type: MoveType, selector: ContextSelector) {
        self.selectors.insert(move_type, selector);
    }

    pub fn resolve(&self, move_type: MoveType) -> Result<&ContextSelector> {
        self.selectors
            .get(&move_type)
            .ok_or_else(|| JudgementError::UnknownSelector(move_type.to_string()))
    }

    /// Selectors for all eight moves.
    pub fn with_defaults() -> Self {
        use SliceGate::*;
        use SliceType::*;

        let always = SliceSpec::always;
        let gated = SliceSpec::gated;
        let mut registry = Self::empty();
        let mut add = |move_type: MoveType, slices: Vec<SliceSpec>| {
            registry.register(
                move_type,
                ContextSelector::new(format!("{move_type}.default"), slices),
            );
        };

        add(
            MoveType::Framing,
            vec![
                always(ScenarioState),
                gated(ConsultationSummaries, HasConsultations),
                always(PolicyClauses),
                gated(SiteFingerprints, HasSites),
            ],
        );
        add(
            MoveType::IssueSurfacing,
            vec![
                always(ScenarioState),
                always(PriorMoves),
                gated(ConsultationSummaries, HasConsultations),
                always(PolicyClauses),
                always(DocChunks),
                gated(SiteFingerprints, HasSites),
                gated(SpatialFeatures, HasSites),
            ],
        );
        add(
            MoveType::EvidenceCuration,
            vec![always(ScenarioState), always(PriorMoves)],
        );
        add(
            MoveType::EvidenceInterpretation,
            vec![
                always(PriorMoves),
                gated(PolicyClauses, HasCuratedEvidence),
                gated(DocChunks, HasCuratedEvidence),
                gated(SiteFingerprints, HasSites),
                gated(SpatialFeatures, HasSites),
                gated(VisualAssets, HasVisualAssets),
                gated(InstrumentOutputs, HasInstrumentOutputs),
            ],
        );
        add(
            MoveType::ConsiderationsFormation,
            vec![
                always(ScenarioState),
                always(PriorMoves),
                gated(ConsultationSummaries, HasConsultations),
                gated(PolicyClauses, HasCuratedEvidence),
                gated(DocChunks, HasCuratedEvidence),
            ],
        );
        add(
            MoveType::WeighingAndBalance,
            vec![
                always(PriorMoves),
                always(ScenarioState),
                gated(ConsultationSummaries, HasConsultations),
            ],
        );
        add(
            MoveType::NegotiationAndAlteration,
            vec![
                always(PriorMoves),
                always(ScenarioState),
                gated(PolicyClauses, HasCuratedEvidence),
            ],
        );
        add(
            MoveType::PositioningAndNarration,
            vec![always(PriorMoves), always(ScenarioState)],
        );
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_move() {
        let registry = SelectorRegistry::with_defaults();
        for m in MoveType::ALL {
            let selector = registry.resolve(m).unwrap();
            assert_eq!(selector.id, format!("{m}.default"));
        }
    }

    #[test]
    fn missing_move_is_fatal() {
        let err = SelectorRegistry::empty()
            .resolve(MoveType::Framing)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("framing"));
    }

    #[test]
    fn gates_follow_data_facts() {
        let registry = SelectorRegistry::with_defaults();
        let selector = registry.resolve(MoveType::EvidenceInterpretation).unwrap();

        let bare = selector.active_slices(&DataFacts::default());
        assert_eq!(bare, vec![SliceType::PriorMoves]);

        let facts = DataFacts {
            has_sites: true,
            has_curated_evidence: true,
            ..Default::default()
        };
        let active = selector.active_slices(&facts);
        assert!(active.contains(&SliceType::PolicyClauses));
        assert!(active.contains(&SliceType::SpatialFeatures));
        assert!(!active.contains(&SliceType::VisualAssets));
    }
}
