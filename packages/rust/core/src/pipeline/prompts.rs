//! Prompt ids, system templates and output schema names for each move.

use judgement_shared::MoveType;

/// Structured-call identity of one move.
#[derive(Debug, Clone, Copy)]
pub struct MovePrompt {
    pub prompt_id: &'static str,
    pub system: &'static str,
    pub schema_ref: &'static str,
}

const FRAMING: MovePrompt = MovePrompt {
    prompt_id: "move.framing.v1",
    system: "You frame a planning judgement. State in one or two sentences what is being \
decided and from which perspective, list the objectives the judgement must serve, and list \
any assumptions you introduce. Reply with JSON {\"frame_statement\", \"objectives\", \"assumptions\"}.",
    schema_ref: "FramingOutput",
};

const ISSUES: MovePrompt = MovePrompt {
    prompt_id: "move.issue_surfacing.v1",
    system: "List the material planning issues raised by this scenario. Each issue needs a short \
stable id, a title and a one-sentence description. Reply with JSON {\"issues\": [...]}.",
    schema_ref: "IssuesOutput",
};

const INTERPRETATION: MovePrompt = MovePrompt {
    prompt_id: "move.evidence_interpretation.v1",
    system: "Interpret each evidence atom: what it shows for the decision, how reliable it is \
(high, medium or low) and what limits its weight. Cite atoms only by their evidence_ref. \
Reply with JSON {\"interpretations\": [...]}.",
    schema_ref: "InterpretationOutput",
};

const CONSIDERATIONS: MovePrompt = MovePrompt {
    prompt_id: "move.considerations_formation.v1",
    system: "Form planning considerations from the interpreted evidence. Each consideration \
belongs to one issue, points for, against or neutral, and cites the evidence refs it rests \
on. Include considerations that cut against the likely outcome. Reply with JSON \
{\"considerations\": [...]}.",
    schema_ref: "ConsiderationsOutput",
};

const WEIGHING: MovePrompt = MovePrompt {
    prompt_id: "move.weighing_and_balance.v1",
    system: "Give each consideration a weight between 0 and 1, summarise the balance and say \
whether it tilts for, against or is balanced. Reply with JSON {\"weights\", \
\"balance_summary\", \"tilt\"}.",
    schema_ref: "WeighingOutput",
};

const NEGOTIATION: MovePrompt = MovePrompt {
    prompt_id: "move.negotiation_and_alteration.v1",
    system: "Propose alterations to the scheme that would address the considerations weighing \
against it. Each alteration names the consideration ids it addresses and any planning \
conditions it would need. Reply with JSON {\"alterations\": [...]}.",
    schema_ref: "NegotiationOutput",
};

const POSITIONING: MovePrompt = MovePrompt {
    prompt_id: "move.positioning_and_narration.v1",
    system: "Write the final position. Give a position statement, the key evidence refs it \
relies on, and a judgement sheet with a headline, one assessment per issue, the overall \
balance, conditions and remaining uncertainties. Cite only refs you were given.",
    schema_ref: "Trajectory",
};

/// The structured call a move makes, if it makes one directly.
/// Evidence curation drives its own calls.
pub fn for_move(move_type: MoveType) -> Option<MovePrompt> {
    match move_type {
        MoveType::Framing => Some(FRAMING),
        MoveType::IssueSurfacing => Some(ISSUES),
        MoveType::EvidenceCuration => None,
        MoveType::EvidenceInterpretation => Some(INTERPRETATION),
        MoveType::ConsiderationsFormation => Some(CONSIDERATIONS),
        MoveType::WeighingAndBalance => Some(WEIGHING),
        MoveType::NegotiationAndAlteration => Some(NEGOTIATION),
        MoveType::PositioningAndNarration => Some(POSITIONING),
    }
}

pub fn prompt_id(move_type: MoveType) -> Option<&'static str> {
    for_move(move_type).map(|p| p.prompt_id)
}
