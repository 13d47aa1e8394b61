//! Deterministic backend that replays canned replies by prompt id.
//!
//! Used to drive the pipeline headlessly (demos, tests) without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use judgement_shared::{JudgementError, Result};

use crate::{StructuredLlm, StructuredRequest};

/// A canned reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Payload(serde_json::Value),
    /// Reply after sleeping, to exercise time budgets.
    Delayed(Duration, serde_json::Value),
    Fail(String),
}

#[derive(Default)]
struct Script {
    /// One-shot replies consumed in order.
    queued: VecDeque<ScriptedReply>,
    /// Reply used once the queue is empty.
    standing: Option<ScriptedReply>,
    calls: usize,
    payloads: Vec<serde_json::Value>,
}

/// Replays replies keyed by prompt id. Prompt ids with no script fail.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standing reply for every call to `prompt_id`.
    pub fn with_reply(self, prompt_id: &str, reply: ScriptedReply) -> Self {
        self.with_script(prompt_id, |s| s.standing = Some(reply));
        self
    }

    /// One-shot reply, consumed before the standing reply.
    pub fn then_reply(self, prompt_id: &str, reply: ScriptedReply) -> Self {
        self.with_script(prompt_id, |s| s.queued.push_back(reply));
        self
    }

    /// Number of calls made for `prompt_id`.
    pub fn calls(&self, prompt_id: &str) -> usize {
        self.lock().get(prompt_id).map(|s| s.calls).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().values().map(|s| s.calls).sum()
    }

    /// User payloads received for `prompt_id`, in call order.
    pub fn payloads(&self, prompt_id: &str) -> Vec<serde_json::Value> {
        self.lock()
            .get(prompt_id)
            .map(|s| s.payloads.clone())
            .unwrap_or_default()
    }

    fn with_script(&self, prompt_id: &str, f: impl FnOnce(&mut Script)) {
        f(self.lock().entry(prompt_id.to_string()).or_default());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Script>> {
        self.scripts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StructuredLlm for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &StructuredRequest) -> Result<serde_json::Value> {
        let reply = {
            let mut scripts = self.lock();
            let script = scripts.entry(request.prompt_id.clone()).or_default();
            script.calls += 1;
            script.payloads.push(request.user_payload.clone());
            script.queued.pop_front().or_else(|| script.standing.clone())
        };

        match reply {
            Some(ScriptedReply::Payload(v)) => Ok(v),
            Some(ScriptedReply::Delayed(d, v)) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
            Some(ScriptedReply::Fail(msg)) => Err(JudgementError::Llm(msg)),
            None => Err(JudgementError::Llm(format!(
                "no scripted reply for prompt {}",
                request.prompt_id
            ))),
        }
    }
}
