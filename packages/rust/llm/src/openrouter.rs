//! OpenRouter chat-completions backend.

use async_trait::async_trait;
use judgement_shared::{JudgementError, OpenRouterConfig, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use crate::{StructuredLlm, StructuredRequest, parse_json_output};

const USER_AGENT: &str = concat!("judgement/", env!("CARGO_PKG_VERSION"));

/// Maximum characters of an error body quoted back in messages.
const ERROR_BODY_CHARS: usize = 300;

/// Structured calls over the OpenRouter HTTP API in JSON mode.
pub struct OpenRouterClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenRouterClient {
    pub fn new(config: &OpenRouterConfig, api_key: impl Into<String>) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| JudgementError::config(format!("invalid base_url '{}': {e}", config.base_url)))?;

        // Per-call budgets are enforced by the caller; no client-wide timeout.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| JudgementError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            model: config.default_model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl StructuredLlm for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    #[instrument(skip_all, fields(prompt_id = %request.prompt_id, model = %self.model))]
    async fn complete(&self, request: &StructuredRequest) -> Result<serde_json::Value> {
        let system = format!(
            "{}\n\nRespond with a single JSON object matching the '{}' schema. No prose.",
            request.system_template, request.output_schema_ref
        );
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": request.user_payload.to_string()},
            ],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| JudgementError::Llm(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(ERROR_BODY_CHARS).collect();
            return Err(JudgementError::Llm(format!("HTTP {status}: {excerpt}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| JudgementError::Llm(format!("invalid completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| JudgementError::Llm("completion had no content".into()))?;

        debug!(chars = content.len(), "completion received");
        parse_json_output(&content)
    }
}
