//! Structured-call gateway shared by the pipeline, the curation engine and the
//! context assembler.
//!
//! Wraps a [`StructuredLlm`] with the configured time budget, logs each call to
//! the `llm_calls` table, and accumulates call ids and errors on a
//! [`MoveTrace`] so the enclosing move can report them.

use std::sync::Arc;
use std::time::Duration;

use judgement_llm::{StructuredLlm, StructuredRequest, StructuredResponse, structured_call};
use judgement_storage::{LlmCallRecord, Storage};
use serde::de::DeserializeOwned;
use tracing::warn;

/// Side effects a move accumulates while it runs.
#[derive(Debug, Default, Clone)]
pub struct MoveTrace {
    /// Structured-call ids, in call order.
    pub call_ids: Vec<String>,
    /// Recoverable collaborator failures (surface as uncertainty).
    pub errors: Vec<String>,
    /// Failed side-table writes.
    pub persistence_errors: Vec<String>,
}

impl MoveTrace {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn persistence_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = %message, "side-table write failed");
        self.persistence_errors.push(message);
    }
}

pub struct LlmGateway {
    llm: Arc<dyn StructuredLlm>,
    storage: Arc<Storage>,
    time_budget: Duration,
}

impl LlmGateway {
    pub fn new(llm: Arc<dyn StructuredLlm>, storage: Arc<Storage>, time_budget: Duration) -> Self {
        Self {
            llm,
            storage,
            time_budget,
        }
    }

    pub fn time_budget(&self) -> Duration {
        self.time_budget
    }

    /// Issue one structured call on behalf of `run_id`.
    pub async fn call(
        &self,
        run_id: &str,
        trace: &mut MoveTrace,
        prompt_id: &str,
        system_template: &str,
        output_schema_ref: &str,
        user_payload: serde_json::Value,
    ) -> StructuredResponse {
        let request = StructuredRequest {
            prompt_id: prompt_id.to_string(),
            system_template: system_template.to_string(),
            user_payload,
            output_schema_ref: output_schema_ref.to_string(),
            time_budget: self.time_budget,
        };
        let response = structured_call(self.llm.as_ref(), &request).await;

        if let Some(call_id) = &response.call_id {
            trace.call_ids.push(call_id.clone());
            let record = LlmCallRecord {
                call_id,
                run_id: Some(run_id),
                prompt_id,
                succeeded: response.succeeded(),
                errors: &response.errors,
                latency_ms: response.latency_ms,
            };
            if let Err(e) = self.storage.log_llm_call(&record).await {
                trace.persistence_error(format!("llm call log: {e}"));
            }
        }
        for err in &response.errors {
            trace.error(format!("{prompt_id}: {err}"));
        }
        response
    }

    /// Issue a call and decode its payload into `T`. An undecodable payload is
    /// treated the same as a failed call.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        run_id: &str,
        trace: &mut MoveTrace,
        prompt_id: &str,
        system_template: &str,
        output_schema_ref: &str,
        user_payload: serde_json::Value,
    ) -> Option<T> {
        let response = self
            .call(run_id, trace, prompt_id, system_template, output_schema_ref, user_payload)
            .await;
        let payload = response.payload?;
        match serde_json::from_value(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                trace.error(format!("{prompt_id}: output does not match {output_schema_ref}: {e}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;
    use judgement_llm::{ScriptedLlm, ScriptedReply};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Out {
        answer: String,
    }

    #[tokio::test]
    async fn typed_calls_log_and_decode() {
        let storage = Arc::new(test_storage().await);
        let llm = Arc::new(
            ScriptedLlm::new()
                .then_reply("ok", ScriptedReply::Payload(json!({"answer": "yes"})))
                .then_reply("bad", ScriptedReply::Payload(json!({"wrong": 1}))),
        );
        let gateway = LlmGateway::new(llm, storage.clone(), Duration::from_secs(1));
        let mut trace = MoveTrace::default();

        let out: Option<Out> = gateway
            .call_typed("run_1", &mut trace, "ok", "sys", "out", json!({}))
            .await;
        assert_eq!(out.unwrap().answer, "yes");
        assert!(trace.errors.is_empty());

        let bad: Option<Out> = gateway
            .call_typed("run_1", &mut trace, "bad", "sys", "out", json!({}))
            .await;
        assert!(bad.is_none());
        assert_eq!(trace.errors.len(), 1);
        assert!(trace.errors[0].starts_with("bad:"));

        assert_eq!(trace.call_ids.len(), 2);
        assert_eq!(storage.count_llm_calls("run_1").await.unwrap(), 2);
    }
}
