use async_trait::async_trait;
use judgement_shared::{JudgementError, Result};

use crate::{StructuredLlm, StructuredRequest};

/// Backend used with `--offline`: every call fails immediately so each stage
/// takes its deterministic fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineLlm;

#[async_trait]
impl StructuredLlm for OfflineLlm {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(&self, request: &StructuredRequest) -> Result<serde_json::Value> {
        Err(JudgementError::Llm(format!(
            "offline mode: structured call {} not attempted",
            request.prompt_id
        )))
    }
}
