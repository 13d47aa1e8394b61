//! Per-issue evidence selection: model choice, validation, deterministic fallback.

use std::collections::HashSet;

use judgement_shared::{DeliberateOmission, EvidenceRole, Issue, IssueEvidence};
use serde::Deserialize;

use super::candidates::CandidatePool;

pub(crate) const ROLES: [EvidenceRole; 3] = [
    EvidenceRole::Supporting,
    EvidenceRole::Countervailing,
    EvidenceRole::Contextual,
];

/// A follow-up instrument run proposed by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedToolRequest {
    pub instrument_id: String,
    #[serde(default)]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectionReply {
    #[serde(default)]
    pub evidence_by_issue: Vec<IssueEvidence>,
    #[serde(default)]
    pub deliberate_omissions: Vec<DeliberateOmission>,
    #[serde(default)]
    pub tool_requests: Vec<ProposedToolRequest>,
}

/// Trim a selection to `max` refs. Contextual refs go first, then the longer
/// of supporting and countervailing, so a lone countervailing ref survives.
pub fn cap_selection(selection: &mut IssueEvidence, max: usize) {
    while selection.len() > max {
        if selection.contextual.pop().is_some() {
            continue;
        }
        if selection.supporting.len() >= selection.countervailing.len() {
            selection.supporting.pop();
        } else {
            selection.countervailing.pop();
        }
    }
}

/// Keep only refs present in `pool`, each at most once across roles.
/// Returns the refs that were dropped.
pub fn retain_known_refs(selection: &mut IssueEvidence, pool: &CandidatePool) -> Vec<String> {
    let mut dropped = Vec::new();
    let mut seen = HashSet::new();
    for role in ROLES {
        selection.refs_for_mut(role).retain(|r| {
            if !pool.contains(r) {
                dropped.push(r.clone());
                return false;
            }
            seen.insert(r.clone())
        });
    }
    dropped
}

/// Top candidates for an issue, taken round-robin across roles in
/// retrieval order.
pub fn fallback_selection(issue_id: &str, pool: &CandidatePool, max: usize) -> IssueEvidence {
    let mut selection = IssueEvidence::new(issue_id);
    let mut queues: Vec<(EvidenceRole, Vec<String>)> = ROLES
        .iter()
        .map(|role| {
            let refs = pool
                .for_issue_role(issue_id, *role)
                .map(|c| c.evidence_ref().to_string())
                .collect();
            (*role, refs)
        })
        .collect();

    let mut taken = HashSet::new();
    let mut cursor = vec![0usize; queues.len()];
    loop {
        let mut progressed = false;
        for (q, (role, refs)) in queues.iter_mut().enumerate() {
            if selection.len() >= max {
                return selection;
            }
            while cursor[q] < refs.len() {
                let r = &refs[cursor[q]];
                cursor[q] += 1;
                if taken.insert(r.clone()) {
                    selection.refs_for_mut(*role).push(r.clone());
                    progressed = true;
                    break;
                }
            }
        }
        if !progressed {
            return selection;
        }
    }
}

/// Final per-issue selections plus the notes to record as selection errors.
#[derive(Debug, Default)]
pub struct SelectionResult {
    pub evidence_by_issue: Vec<IssueEvidence>,
    pub errors: Vec<String>,
}

/// Validate the model's selection against the pool, falling back per issue.
pub fn resolve_selection(
    issues: &[Issue],
    reply: Option<&SelectionReply>,
    pool: &CandidatePool,
    max: usize,
) -> SelectionResult {
    let mut result = SelectionResult::default();
    let known: HashSet<&str> = issues.iter().map(|i| i.id.as_str()).collect();

    if let Some(reply) = reply {
        for entry in &reply.evidence_by_issue {
            if !known.contains(entry.issue_id.as_str()) {
                result
                    .errors
                    .push(format!("selection for unknown issue '{}' ignored", entry.issue_id));
            }
        }
    }

    for issue in issues {
        let proposed = reply.and_then(|r| r.evidence_by_issue.iter().find(|e| e.issue_id == issue.id));
        let selection = match proposed {
            Some(entry) => {
                let mut selection = entry.clone();
                selection.repaired = false;
                for r in retain_known_refs(&mut selection, pool) {
                    result
                        .errors
                        .push(format!("issue '{}': dropped ref '{r}' not in candidate pool", issue.id));
                }
                cap_selection(&mut selection, max);
                selection
            }
            None => IssueEvidence::new(&issue.id),
        };

        if selection.is_empty() {
            if reply.is_some() {
                result
                    .errors
                    .push(format!("issue '{}': no usable selection, used top-{max} fallback", issue.id));
            }
            result
                .evidence_by_issue
                .push(fallback_selection(&issue.id, pool, max));
        } else {
            result.evidence_by_issue.push(selection);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use judgement_shared::{EvidenceCandidate, EvidencePayload, Modality, QueryRole, QuerySource, RetrievalQuery};

    fn clause(id: &str) -> EvidenceCandidate {
        EvidenceCandidate::new(
            id,
            "summary",
            EvidencePayload::PolicyClause {
                clause_id: id.into(),
                plan_id: "lp".into(),
                policy_code: "EN4".into(),
                clause_ref: "EN4.1".into(),
                text: "text".into(),
            },
        )
    }

    fn query(issue: &str, role: QueryRole) -> RetrievalQuery {
        RetrievalQuery {
            id: format!("{issue}-{role:?}"),
            issue_id: issue.into(),
            role,
            modality: Modality::Text,
            text: "t".into(),
            site_id: None,
            limit: 5,
            source: QuerySource::Template,
        }
    }

    fn pool() -> CandidatePool {
        let mut pool = CandidatePool::default();
        for id in ["s1", "s2", "s3"] {
            pool.add(clause(id), &query("flood", QueryRole::Primary));
        }
        pool.add(clause("c1"), &query("flood", QueryRole::Countervailing));
        pool.add(clause("x1"), &query("flood", QueryRole::Contextual));
        pool
    }

    fn issues() -> Vec<Issue> {
        vec![Issue {
            id: "flood".into(),
            title: "Flood risk".into(),
            description: String::new(),
        }]
    }

    #[test]
    fn fallback_round_robins_roles() {
        let s = fallback_selection("flood", &pool(), 4);
        assert_eq!(s.supporting, ["policy_clause::s1", "policy_clause::s2"]);
        assert_eq!(s.countervailing, ["policy_clause::c1"]);
        assert_eq!(s.contextual, ["policy_clause::x1"]);

        let s = fallback_selection("flood", &pool(), 2);
        assert_eq!(s.len(), 2);
        assert_eq!(s.countervailing.len(), 1);
        assert!(fallback_selection("other", &pool(), 4).is_empty());
    }

    #[test]
    fn cap_keeps_lone_countervailing() {
        let mut s = IssueEvidence::new("flood");
        s.supporting = vec!["a".into(), "b".into(), "c".into()];
        s.countervailing = vec!["d".into()];
        s.contextual = vec!["e".into()];
        cap_selection(&mut s, 2);
        assert_eq!(s.supporting, ["a"]);
        assert_eq!(s.countervailing, ["d"]);
        assert!(s.contextual.is_empty());
    }

    #[test]
    fn fabricated_refs_are_dropped() {
        let reply = SelectionReply {
            evidence_by_issue: vec![IssueEvidence {
                issue_id: "flood".into(),
                supporting: vec!["policy_clause::s1".into(), "policy_clause::made_up".into()],
                countervailing: vec!["policy_clause::s1".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let result = resolve_selection(&issues(), Some(&reply), &pool(), 4);
        let s = &result.evidence_by_issue[0];
        assert_eq!(s.supporting, ["policy_clause::s1"]);
        assert!(s.countervailing.is_empty());
        assert!(result.errors.iter().any(|e| e.contains("made_up")));
    }

    #[test]
    fn missing_reply_uses_fallback_quietly() {
        let result = resolve_selection(&issues(), None, &pool(), 3);
        assert_eq!(result.evidence_by_issue[0].len(), 3);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn empty_reply_uses_fallback_with_note() {
        let result = resolve_selection(&issues(), Some(&SelectionReply::default()), &pool(), 3);
        assert_eq!(result.evidence_by_issue[0].len(), 3);
        assert!(result.errors[0].contains("fallback"));
    }
}
