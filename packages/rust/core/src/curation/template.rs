//! Template-driven default queries and instrument hints.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use judgement_shared::{Issue, Modality, QueryRole, ToolRequest, ToolRequestSource};

/// A query a frame may include, before it is given an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedQuery {
    pub issue_id: String,
    pub role: QueryRole,
    pub modality: Modality,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub site_id: Option<String>,
}

/// A follow-up instrument the template suggests when an issue mentions one of
/// its trigger keywords.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentHint {
    pub instrument_id: String,
    pub keywords: Vec<String>,
    /// Inputs that must be available, e.g. `site_id`.
    #[serde(default)]
    pub required_inputs: Vec<String>,
}

impl InstrumentHint {
    pub fn new(instrument_id: &str, keywords: &[&str], required_inputs: &[&str]) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            required_inputs: required_inputs.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// First keyword found in `text` on a word boundary, ignoring case.
    pub fn matched_keyword(&self, text: &str) -> Option<&str> {
        self.keywords.iter().map(String::as_str).find(|kw| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw)))
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        })
    }
}

/// Inputs available to template tool requests for this run.
#[derive(Debug, Clone, Default)]
pub struct HintInputs {
    pub values: Map<String, Value>,
}

impl HintInputs {
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

/// Default queries and budgets the curation engine merges with model proposals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationTemplate {
    /// Patterns with an `{issue}` placeholder.
    pub primary_patterns: Vec<String>,
    pub countervailing_patterns: Vec<String>,
    pub contextual_patterns: Vec<String>,
    /// Add a spatial query per site for every issue.
    pub spatial_per_site: bool,
    /// Add an imagery query per site for every issue.
    pub imagery_per_site: bool,
    pub max_queries_per_issue: u32,
    pub instrument_hints: Vec<InstrumentHint>,
}

impl Default for CurationTemplate {
    fn default() -> Self {
        Self {
            primary_patterns: vec!["{issue} policy".into(), "{issue} evidence assessment".into()],
            countervailing_patterns: Vec::new(),
            contextual_patterns: vec!["{issue} background".into()],
            spatial_per_site: true,
            imagery_per_site: true,
            max_queries_per_issue: 8,
            instrument_hints: vec![
                InstrumentHint::new("flood_model", &["flood", "flooding", "drainage"], &["site_id"]),
                InstrumentHint::new("traffic_model", &["traffic", "highway", "transport"], &["site_id"]),
                InstrumentHint::new("noise_model", &["noise"], &["site_id"]),
            ],
        }
    }
}

impl CurationTemplate {
    /// Default queries for one issue.
    pub fn default_queries(&self, issue: &Issue, site_ids: &[String]) -> Vec<ProposedQuery> {
        let text = |pattern: &str| pattern.replace("{issue}", &issue.title);
        let mut out = Vec::new();
        let mut push_text = |patterns: &[String], role| {
            for p in patterns {
                out.push(ProposedQuery {
                    issue_id: issue.id.clone(),
                    role,
                    modality: Modality::Text,
                    text: text(p),
                    site_id: None,
                });
            }
        };
        push_text(&self.primary_patterns, QueryRole::Primary);
        push_text(&self.countervailing_patterns, QueryRole::Countervailing);
        push_text(&self.contextual_patterns, QueryRole::Contextual);

        for site in site_ids {
            if self.spatial_per_site {
                out.push(ProposedQuery {
                    issue_id: issue.id.clone(),
                    role: QueryRole::Primary,
                    modality: Modality::Spatial,
                    text: issue.title.clone(),
                    site_id: Some(site.clone()),
                });
            }
            if self.imagery_per_site {
                out.push(ProposedQuery {
                    issue_id: issue.id.clone(),
                    role: QueryRole::Contextual,
                    modality: Modality::Visual,
                    text: issue.title.clone(),
                    site_id: Some(site.clone()),
                });
            }
        }
        out
    }

    /// Tool requests for hints whose keywords match an issue and whose
    /// required inputs are all available.
    pub fn hint_requests(&self, issues: &[Issue], inputs: &HintInputs) -> Vec<ToolRequest> {
        let mut out = Vec::new();
        for issue in issues {
            let haystack = format!("{} {}", issue.title, issue.description);
            for hint in &self.instrument_hints {
                let Some(keyword) = hint.matched_keyword(&haystack) else {
                    continue;
                };
                let mut request_inputs = Map::new();
                let mut missing = false;
                for name in &hint.required_inputs {
                    match inputs.values.get(name) {
                        Some(v) => {
                            request_inputs.insert(name.clone(), v.clone());
                        }
                        None => missing = true,
                    }
                }
                if missing {
                    continue;
                }
                out.push(ToolRequest {
                    instrument_id: hint.instrument_id.clone(),
                    issue_id: Some(issue.id.clone()),
                    inputs: Value::Object(request_inputs),
                    reason: format!("issue mentions '{keyword}'"),
                    source: ToolRequestSource::Template,
                });
            }
        }
        out
    }

    /// Budget-related view of the template, recorded with frames.
    pub fn describe(&self) -> Value {
        json!({
            "primary_patterns": self.primary_patterns,
            "countervailing_patterns": self.countervailing_patterns,
            "contextual_patterns": self.contextual_patterns,
            "max_queries_per_issue": self.max_queries_per_issue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, title: &str, description: &str) -> Issue {
        Issue {
            id: id.into(),
            title: title.into(),
            description: description.into(),
        }
    }

    #[test]
    fn default_queries_fill_patterns_and_sites() {
        let template = CurationTemplate::default();
        let queries = template.default_queries(&issue("flood", "Flood risk", ""), &["s1".into()]);
        assert_eq!(queries[0].text, "Flood risk policy");
        assert_eq!(queries[1].text, "Flood risk evidence assessment");
        assert!(queries.iter().all(|q| q.role != QueryRole::Countervailing));
        assert!(queries
            .iter()
            .any(|q| q.modality == Modality::Spatial && q.site_id.as_deref() == Some("s1")));
        assert!(queries.iter().any(|q| q.modality == Modality::Visual));
    }

    #[test]
    fn keywords_match_on_word_boundaries() {
        let hint = InstrumentHint::new("noise_model", &["noise"], &[]);
        assert_eq!(hint.matched_keyword("Road NOISE at night"), Some("noise"));
        assert_eq!(hint.matched_keyword("noisemakers"), None);
    }

    #[test]
    fn hints_need_their_inputs() {
        let template = CurationTemplate::default();
        let issues = vec![
            issue("flood", "Flood risk", ""),
            issue("design", "Design quality", "Massing and materials"),
        ];

        assert!(template.hint_requests(&issues, &HintInputs::default()).is_empty());

        let inputs = HintInputs::default().with("site_id", "s1");
        let requests = template.hint_requests(&issues, &inputs);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].instrument_id, "flood_model");
        assert_eq!(requests[0].inputs["site_id"], "s1");
        assert_eq!(requests[0].source, ToolRequestSource::Template);
    }
}
