//! Role coverage checks and the single repair round.

use judgement_shared::{EvidenceRole, IssueEvidence};
use serde::Deserialize;

use super::candidates::CandidatePool;
use super::selection::cap_selection;

/// Roles an issue's selection is missing even though candidates exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageGap {
    pub issue_id: String,
    pub missing: Vec<EvidenceRole>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepairReply {
    #[serde(default)]
    pub patches: Vec<IssueEvidence>,
}

/// Issues whose selection lacks countervailing evidence the pool could have
/// filled. Supporting rides along only when it is missing too; contextual is
/// checked on its own when `include_contextual` is set.
pub fn find_gaps(
    selections: &[IssueEvidence],
    pool: &CandidatePool,
    include_contextual: bool,
) -> Vec<CoverageGap> {
    selections
        .iter()
        .filter_map(|selection| {
            let lacks = |role: EvidenceRole| {
                selection.refs_for(role).is_empty()
                    && pool.for_issue_role(&selection.issue_id, role).next().is_some()
            };

            let mut missing = Vec::new();
            if lacks(EvidenceRole::Countervailing) {
                missing.push(EvidenceRole::Countervailing);
                if lacks(EvidenceRole::Supporting) {
                    missing.push(EvidenceRole::Supporting);
                }
            }
            if include_contextual && lacks(EvidenceRole::Contextual) {
                missing.push(EvidenceRole::Contextual);
            }
            (!missing.is_empty()).then(|| CoverageGap {
                issue_id: selection.issue_id.clone(),
                missing,
            })
        })
        .collect()
}

fn is_selected(selection: &IssueEvidence, evidence_ref: &str) -> bool {
    selection.all_refs().any(|r| r == evidence_ref)
}

/// Fill one missing role from the pool: an unselected candidate if there is
/// one, otherwise move a candidate already selected under another role.
fn fill_from_pool(selection: &mut IssueEvidence, role: EvidenceRole, pool: &CandidatePool) -> bool {
    let issue_id = selection.issue_id.clone();
    let unselected = pool
        .for_issue_role(&issue_id, role)
        .map(|c| c.evidence_ref().to_string())
        .find(|r| !is_selected(selection, r));
    if let Some(r) = unselected {
        selection.refs_for_mut(role).push(r);
        return true;
    }

    let Some(r) = pool
        .for_issue_role(&issue_id, role)
        .map(|c| c.evidence_ref().to_string())
        .next()
    else {
        return false;
    };
    for other in [EvidenceRole::Supporting, EvidenceRole::Countervailing, EvidenceRole::Contextual] {
        if other != role {
            selection.refs_for_mut(other).retain(|x| *x != r);
        }
    }
    selection.refs_for_mut(role).push(r);
    true
}

/// Merge the repair reply into the gap issues, then fill whatever is still
/// missing from the pool. Returns notes for the selection errors.
pub fn apply_repair(
    selections: &mut [IssueEvidence],
    gaps: &[CoverageGap],
    reply: Option<&RepairReply>,
    pool: &CandidatePool,
    max: usize,
) -> Vec<String> {
    let mut notes = Vec::new();

    for gap in gaps {
        let Some(selection) = selections.iter_mut().find(|s| s.issue_id == gap.issue_id) else {
            continue;
        };
        let patch = reply.and_then(|r| r.patches.iter().find(|p| p.issue_id == gap.issue_id));

        for role in &gap.missing {
            if let Some(patch) = patch {
                for r in patch.refs_for(*role) {
                    if !pool.contains(r) {
                        notes.push(format!("issue '{}': repair ref '{r}' not in candidate pool", gap.issue_id));
                    } else if !is_selected(selection, r) {
                        selection.refs_for_mut(*role).push(r.clone());
                    }
                }
            }
            if selection.refs_for(*role).is_empty() && fill_from_pool(selection, *role, pool) {
                notes.push(format!(
                    "issue '{}': {} coverage filled from the candidate pool",
                    gap.issue_id,
                    role_name(*role)
                ));
            }
        }
        selection.repaired = true;
        cap_selection(selection, max);
    }
    notes
}

fn role_name(role: EvidenceRole) -> &'static str {
    match role {
        EvidenceRole::Supporting => "supporting",
        EvidenceRole::Countervailing => "countervailing",
        EvidenceRole::Contextual => "contextual",
    }
}
