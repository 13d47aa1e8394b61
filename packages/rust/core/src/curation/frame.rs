//! Retrieval frame planning.

use std::collections::HashSet;

use judgement_shared::{FrameBudgets, Issue, Modality, QueryRole, QuerySource, RetrievalQuery};

use super::template::ProposedQuery;

/// Queries in frame order plus the modalities they span.
#[derive(Debug, Clone, Default)]
pub struct FramePlan {
    pub queries: Vec<RetrievalQuery>,
    pub modalities: Vec<Modality>,
    /// Proposals that were discarded, with the reason.
    pub rejected: Vec<String>,
}

/// Countervailing query synthesized when none was proposed for an issue.
pub fn fallback_countervailing_text(issue: &Issue) -> String {
    format!("{} harm constraint adverse impact mitigation exception", issue.title)
}

fn normalized(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Merge model proposals with template defaults into one frame.
///
/// Model proposals come first. Duplicates are dropped, proposals for unknown
/// issues are rejected, and each issue is capped at `max_queries_per_issue`.
/// Every issue then gets at least one primary and one countervailing text
/// query, synthesized when missing.
pub fn plan_queries(
    issues: &[Issue],
    llm: Vec<ProposedQuery>,
    template: Vec<ProposedQuery>,
    budgets: &FrameBudgets,
    site_ids: &[String],
) -> FramePlan {
    let mut plan = FramePlan::default();
    let mut seen = HashSet::new();
    let known: HashSet<&str> = issues.iter().map(|i| i.id.as_str()).collect();

    let proposals = llm
        .into_iter()
        .map(|q| (q, QuerySource::Llm))
        .chain(template.into_iter().map(|q| (q, QuerySource::Template)));

    let mut planned: Vec<(ProposedQuery, QuerySource)> = Vec::new();
    for (q, source) in proposals {
        if !known.contains(q.issue_id.as_str()) {
            plan.rejected.push(format!("query for unknown issue '{}'", q.issue_id));
            continue;
        }
        match q.modality {
            Modality::Text | Modality::Instrument if q.text.trim().is_empty() => {
                plan.rejected.push(format!("empty {:?} query for issue '{}'", q.modality, q.issue_id));
                continue;
            }
            Modality::Spatial => match q.site_id.as_deref() {
                Some(site) if site_ids.iter().any(|s| s == site) => {}
                _ => {
                    plan.rejected.push(format!("spatial query for issue '{}' names no known site", q.issue_id));
                    continue;
                }
            },
            _ => {}
        }

        let dedup_key = (
            q.issue_id.clone(),
            q.role,
            q.modality,
            normalized(&q.text),
            q.site_id.clone(),
        );
        if !seen.insert(dedup_key) {
            continue;
        }
        let per_issue = planned.iter().filter(|(p, _)| p.issue_id == q.issue_id).count();
        if per_issue >= budgets.max_queries_per_issue as usize {
            plan.rejected.push(format!("query cap reached for issue '{}'", q.issue_id));
            continue;
        }
        planned.push((q, source));
    }

    for issue in issues {
        let has = |role: QueryRole, planned: &[(ProposedQuery, QuerySource)]| {
            planned
                .iter()
                .any(|(p, _)| p.issue_id == issue.id && p.role == role && p.modality == Modality::Text)
        };
        if !has(QueryRole::Primary, &planned) {
            planned.push((
                ProposedQuery {
                    issue_id: issue.id.clone(),
                    role: QueryRole::Primary,
                    modality: Modality::Text,
                    text: issue.title.clone(),
                    site_id: None,
                },
                QuerySource::Fallback,
            ));
        }
        if !has(QueryRole::Countervailing, &planned) {
            planned.push((
                ProposedQuery {
                    issue_id: issue.id.clone(),
                    role: QueryRole::Countervailing,
                    modality: Modality::Text,
                    text: fallback_countervailing_text(issue),
                    site_id: None,
                },
                QuerySource::Fallback,
            ));
        }
    }

    for (i, (q, source)) in planned.into_iter().enumerate() {
        if !plan.modalities.contains(&q.modality) {
            plan.modalities.push(q.modality);
        }
        plan.queries.push(RetrievalQuery {
            id: format!("q{:03}", i + 1),
            issue_id: q.issue_id,
            role: q.role,
            modality: q.modality,
            text: q.text,
            site_id: q.site_id,
            limit: budgets.candidates_per_query,
            source,
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets(max_queries: u32) -> FrameBudgets {
        FrameBudgets {
            candidates_per_query: 5,
            max_atoms_per_issue: 4,
            max_queries_per_issue: max_queries,
        }
    }

    fn flood() -> Issue {
        Issue {
            id: "flood".into(),
            title: "Flood risk".into(),
            description: String::new(),
        }
    }

    fn text(issue: &str, role: QueryRole, t: &str) -> ProposedQuery {
        ProposedQuery {
            issue_id: issue.into(),
            role,
            modality: Modality::Text,
            text: t.into(),
            site_id: None,
        }
    }

    #[test]
    fn synthesizes_primary_and_countervailing() {
        let plan = plan_queries(&[flood()], vec![], vec![], &budgets(8), &[]);
        assert_eq!(plan.queries.len(), 2);
        assert_eq!(plan.queries[0].role, QueryRole::Primary);
        assert_eq!(plan.queries[1].role, QueryRole::Countervailing);
        assert_eq!(
            plan.queries[1].text,
            "Flood risk harm constraint adverse impact mitigation exception"
        );
        assert!(plan.queries.iter().all(|q| q.source == QuerySource::Fallback));
        assert_eq!(plan.modalities, vec![Modality::Text]);
    }

    #[test]
    fn model_queries_lead_and_duplicates_collapse() {
        let llm = vec![
            text("flood", QueryRole::Countervailing, "flood objections"),
            text("ghost", QueryRole::Primary, "anything"),
        ];
        let template = vec![
            text("flood", QueryRole::Primary, "Flood risk policy"),
            text("flood", QueryRole::Countervailing, "Flood  OBJECTIONS"),
        ];
        let plan = plan_queries(&[flood()], llm, template, &budgets(8), &[]);

        assert_eq!(plan.queries.len(), 2);
        assert_eq!(plan.queries[0].source, QuerySource::Llm);
        assert_eq!(plan.queries[1].source, QuerySource::Template);
        assert_eq!(plan.queries[0].id, "q001");
        assert!(plan.rejected.iter().any(|r| r.contains("ghost")));
    }

    #[test]
    fn cap_never_removes_the_guarantee() {
        let template = vec![
            text("flood", QueryRole::Primary, "a"),
            text("flood", QueryRole::Primary, "b"),
            text("flood", QueryRole::Contextual, "c"),
        ];
        let plan = plan_queries(&[flood()], vec![], template, &budgets(2), &[]);
        assert!(plan
            .queries
            .iter()
            .any(|q| q.role == QueryRole::Countervailing && q.source == QuerySource::Fallback));
        assert!(plan.rejected.iter().any(|r| r.contains("cap")));
    }

    #[test]
    fn spatial_queries_need_a_known_site() {
        let spatial = |site: &str| ProposedQuery {
            issue_id: "flood".into(),
            role: QueryRole::Primary,
            modality: Modality::Spatial,
            text: String::new(),
            site_id: Some(site.into()),
        };
        let plan = plan_queries(
            &[flood()],
            vec![spatial("s9")],
            vec![spatial("s1")],
            &budgets(8),
            &["s1".into()],
        );
        let spatial: Vec<_> = plan
            .queries
            .iter()
            .filter(|q| q.modality == Modality::Spatial)
            .collect();
        assert_eq!(spatial.len(), 1);
        assert_eq!(spatial[0].site_id.as_deref(), Some("s1"));
        assert!(plan.modalities.contains(&Modality::Spatial));
    }
}
