//! The structured-call capability.
//!
//! Every model interaction in the judgement engine is a single blocking
//! round-trip: a prompt id, a system template, a JSON user payload and the name
//! of the expected output schema go in; a JSON object (or nothing) comes out.
//! Backends implement [`StructuredLlm`]; callers go through
//! [`structured_call`], which applies the time budget and folds every failure
//! into [`StructuredResponse::errors`] so that a missing payload is an ordinary
//! value to handle rather than an error to propagate.

mod offline;
mod openrouter;
mod scripted;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use judgement_shared::{JudgementError, Result, new_id};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use offline::OfflineLlm;
pub use openrouter::OpenRouterClient;
pub use scripted::{ScriptedLlm, ScriptedReply};

/// One structured call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRequest {
    /// Stable prompt identifier, e.g. `"curation.select.v1"`.
    pub prompt_id: String,
    pub system_template: String,
    pub user_payload: serde_json::Value,
    /// Name of the schema the output must satisfy.
    pub output_schema_ref: String,
    #[serde(with = "duration_millis")]
    pub time_budget: Duration,
}

/// Outcome of a structured call. `payload` is `None` whenever the call failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredResponse {
    pub payload: Option<serde_json::Value>,
    pub call_id: Option<String>,
    pub errors: Vec<String>,
    pub latency_ms: u64,
}

impl StructuredResponse {
    pub fn succeeded(&self) -> bool {
        self.payload.is_some()
    }
}

/// A language model backend able to answer with a JSON object.
#[async_trait]
pub trait StructuredLlm: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Perform one round-trip. Implementations return the parsed JSON output or
    /// an error; budgets and normalization are applied by [`structured_call`].
    async fn complete(&self, request: &StructuredRequest) -> Result<serde_json::Value>;
}

/// Run a structured call under its time budget.
///
/// Never fails: timeouts, transport errors and non-object outputs all come
/// back as `payload: None` with a message in `errors`.
pub async fn structured_call(llm: &dyn StructuredLlm, request: &StructuredRequest) -> StructuredResponse {
    let call_id = new_id("call");
    let started = Instant::now();

    let outcome = match tokio::time::timeout(request.time_budget, llm.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(JudgementError::timeout(
            format!("structured call {}", request.prompt_id),
            request.time_budget,
        )),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    match outcome.and_then(|value| check_shape(value, &request.output_schema_ref)) {
        Ok(payload) => {
            debug!(
                backend = llm.name(),
                prompt_id = %request.prompt_id,
                call_id = %call_id,
                latency_ms,
                "structured call succeeded"
            );
            StructuredResponse {
                payload: Some(payload),
                call_id: Some(call_id),
                errors: Vec::new(),
                latency_ms,
            }
        }
        Err(e) => {
            warn!(
                backend = llm.name(),
                prompt_id = %request.prompt_id,
                call_id = %call_id,
                error = %e,
                "structured call failed"
            );
            StructuredResponse {
                payload: None,
                call_id: Some(call_id),
                errors: vec![e.to_string()],
                latency_ms,
            }
        }
    }
}

/// Outputs must be JSON objects; field-level checks happen where the output
/// is decoded into its typed form.
fn check_shape(value: serde_json::Value, schema_ref: &str) -> Result<serde_json::Value> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(JudgementError::Llm(format!(
            "output for schema '{schema_ref}' is not a JSON object"
        )))
    }
}

/// Parse model text into JSON, tolerating a surrounding Markdown code fence.
pub fn parse_json_output(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(body.trim())
        .map_err(|e| JudgementError::Llm(format!("model output is not valid JSON: {e}")))
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
