//! Pipeline runs, the append-only move event trail, and the LLM call log.

use chrono::{DateTime, Utc};
use judgement_shared::{
    ContentAddress, JudgementError, MoveEvent, MoveRun, MoveType, Result, RunStatus, new_id,
};
use libsql::{Row, params};

use crate::{Storage, col_i64, col_json, col_opt_ts, col_str, col_ts, to_json};

const RUN_COLUMNS: &str = "id, tab_id, content_address, status, started_at, completed_at, \
                           errors_json, persistence_errors_json";

const EVENT_COLUMNS: &str = "id, run_id, move_type, sequence, status, inputs_json, outputs_json, \
                             evidence_refs_json, assumptions_json, uncertainty_json, \
                             tool_invocations_json, created_at";

fn row_to_run(row: &Row) -> Result<MoveRun> {
    Ok(MoveRun {
        id: col_str(row, 0)?,
        tab_id: col_str(row, 1)?,
        content_address: ContentAddress::from_hex(col_str(row, 2)?),
        status: col_str(row, 3)?.parse()?,
        started_at: col_ts(row, 4)?,
        completed_at: col_opt_ts(row, 5)?,
        errors: col_json(row, 6)?,
        persistence_errors: col_json(row, 7)?,
    })
}

fn row_to_event(row: &Row) -> Result<MoveEvent> {
    Ok(MoveEvent {
        id: col_str(row, 0)?,
        run_id: col_str(row, 1)?,
        move_type: col_str(row, 2)?.parse()?,
        sequence: col_i64(row, 3)? as u32,
        status: col_str(row, 4)?.parse()?,
        inputs: col_json(row, 5)?,
        outputs: col_json(row, 6)?,
        evidence_refs_considered: col_json(row, 7)?,
        assumptions_introduced: col_json(row, 8)?,
        uncertainty_remaining: col_json(row, 9)?,
        tool_invocation_ids: col_json(row, 10)?,
        created_at: col_ts(row, 11)?,
    })
}

/// One structured-call record for the LLM call log.
#[derive(Debug, Clone)]
pub struct LlmCallRecord<'a> {
    pub call_id: &'a str,
    pub run_id: Option<&'a str>,
    pub prompt_id: &'a str,
    pub succeeded: bool,
    pub errors: &'a [String],
    pub latency_ms: u64,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Open a run for a tab at the given snapshot address.
    pub async fn insert_run(&self, tab_id: &str, content_address: &ContentAddress) -> Result<MoveRun> {
        let run = MoveRun {
            id: new_id("run"),
            tab_id: tab_id.to_string(),
            content_address: content_address.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            persistence_errors: Vec::new(),
        };

        self.execute(
            "INSERT INTO move_runs (id, tab_id, content_address, status, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id.as_str(),
                tab_id,
                content_address.as_str(),
                run.status.as_str(),
                run.started_at.to_rfc3339()
            ],
        )
        .await?;

        Ok(run)
    }

    /// Close a run with its final status and error lists.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        errors: &[String],
        persistence_errors: &[String],
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.execute(
            "UPDATE move_runs SET status = ?2, completed_at = ?3, errors_json = ?4, \
             persistence_errors_json = ?5 WHERE id = ?1",
            params![
                run_id,
                status.as_str(),
                completed_at.to_rfc3339(),
                to_json(errors)?,
                to_json(persistence_errors)?
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<MoveRun> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM move_runs WHERE id = ?1");
        let row = self
            .fetch_one(&sql, params![run_id])
            .await?
            .ok_or_else(|| JudgementError::not_found("run", run_id))?;
        row_to_run(&row)
    }

    /// Runs for a tab, newest first.
    pub async fn list_runs(&self, tab_id: &str) -> Result<Vec<MoveRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM move_runs WHERE tab_id = ?1 ORDER BY started_at DESC, id DESC"
        );
        self.fetch_all(&sql, params![tab_id])
            .await?
            .iter()
            .map(row_to_run)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Move events (insert-only)
    // -----------------------------------------------------------------------

    /// Append a move event. Fails if the `(run_id, sequence)` slot is taken.
    pub async fn append_move_event(&self, event: &MoveEvent) -> Result<()> {
        self.execute(
            "INSERT INTO move_events (id, run_id, move_type, sequence, status, inputs_json, \
             outputs_json, evidence_refs_json, assumptions_json, uncertainty_json, \
             tool_invocations_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.id.as_str(),
                event.run_id.as_str(),
                event.move_type.as_str(),
                event.sequence as i64,
                event.status.as_str(),
                to_json(&event.inputs)?,
                to_json(&event.outputs)?,
                to_json(&event.evidence_refs_considered)?,
                to_json(&event.assumptions_introduced)?,
                to_json(&event.uncertainty_remaining)?,
                to_json(&event.tool_invocation_ids)?,
                event.created_at.to_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    /// All events for a run in sequence order.
    pub async fn list_move_events(&self, run_id: &str) -> Result<Vec<MoveEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM move_events WHERE run_id = ?1 ORDER BY sequence");
        self.fetch_all(&sql, params![run_id])
            .await?
            .iter()
            .map(row_to_event)
            .collect()
    }

    /// Latest event of one move type within a run.
    pub async fn latest_move_event(&self, run_id: &str, move_type: MoveType) -> Result<Option<MoveEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM move_events WHERE run_id = ?1 AND move_type = ?2 \
             ORDER BY sequence DESC LIMIT 1"
        );
        self.fetch_one(&sql, params![run_id, move_type.as_str()])
            .await?
            .map(|row| row_to_event(&row))
            .transpose()
    }

    /// Next free sequence number for a run (1-based).
    pub async fn next_sequence(&self, run_id: &str) -> Result<u32> {
        let row = self
            .fetch_one(
                "SELECT COALESCE(MAX(sequence), 0) FROM move_events WHERE run_id = ?1",
                params![run_id],
            )
            .await?;
        let max = match row {
            Some(row) => col_i64(&row, 0)?,
            None => 0,
        };
        Ok(max as u32 + 1)
    }

    // -----------------------------------------------------------------------
    // LLM call log
    // -----------------------------------------------------------------------

    pub async fn log_llm_call(&self, call: &LlmCallRecord<'_>) -> Result<()> {
        self.execute(
            "INSERT INTO llm_calls (id, run_id, prompt_id, succeeded, errors_json, latency_ms, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                call.call_id,
                call.run_id,
                call.prompt_id,
                call.succeeded as i64,
                to_json(call.errors)?,
                call.latency_ms as i64,
                Utc::now().to_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    /// Number of logged calls for a run.
    pub async fn count_llm_calls(&self, run_id: &str) -> Result<u64> {
        let row = self
            .fetch_one("SELECT COUNT(*) FROM llm_calls WHERE run_id = ?1", params![run_id])
            .await?;
        Ok(match row {
            Some(row) => col_i64(&row, 0)? as u64,
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use judgement_shared::{ArtifactKey, MoveStatus};
    use serde_json::json;

    fn event(run_id: &str, move_type: MoveType, sequence: u32) -> MoveEvent {
        MoveEvent {
            id: new_id("mev"),
            run_id: run_id.to_string(),
            move_type,
            sequence,
            status: MoveStatus::Success,
            inputs: json!({"k": 1}),
            outputs: json!({"issues": []}),
            evidence_refs_considered: vec!["policy_clause::pc-1".into()],
            assumptions_introduced: vec![],
            uncertainty_remaining: vec!["none".into()],
            tool_invocation_ids: vec!["call_1".into()],
            created_at: Utc::now(),
        }
    }

    async fn setup() -> (Storage, MoveRun) {
        let storage = test_storage().await;
        let tab = storage
            .get_or_create_tab(&ArtifactKey::new("sc", "fr"))
            .await
            .unwrap();
        let run = storage
            .insert_run(&tab.id, &ContentAddress::from_hex("a1"))
            .await
            .unwrap();
        (storage, run)
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let (storage, run) = setup().await;
        assert_eq!(run.status, RunStatus::Running);

        storage
            .finish_run(&run.id, RunStatus::Partial, &["stage failed".into()], &[], Utc::now())
            .await
            .unwrap();

        let loaded = storage.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Partial);
        assert_eq!(loaded.errors, vec!["stage failed".to_string()]);
        assert!(loaded.completed_at.is_some());
        assert_eq!(storage.list_runs(&run.tab_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_round_trip_in_sequence_order() {
        let (storage, run) = setup().await;
        assert_eq!(storage.next_sequence(&run.id).await.unwrap(), 1);

        storage
            .append_move_event(&event(&run.id, MoveType::IssueSurfacing, 2))
            .await
            .unwrap();
        storage
            .append_move_event(&event(&run.id, MoveType::Framing, 1))
            .await
            .unwrap();

        let events = storage.list_move_events(&run.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].move_type, MoveType::Framing);
        assert_eq!(events[1].evidence_refs_considered, vec!["policy_clause::pc-1"]);
        assert_eq!(storage.next_sequence(&run.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn sequence_slot_cannot_be_reused() {
        let (storage, run) = setup().await;
        storage
            .append_move_event(&event(&run.id, MoveType::Framing, 1))
            .await
            .unwrap();
        let dup = storage
            .append_move_event(&event(&run.id, MoveType::Framing, 1))
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn events_reject_updates() {
        let (storage, run) = setup().await;
        storage
            .append_move_event(&event(&run.id, MoveType::Framing, 1))
            .await
            .unwrap();
        let result = storage
            .execute(
                "UPDATE move_events SET status = 'error' WHERE run_id = ?1",
                params![run.id.as_str()],
            )
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("append-only"));
    }

    #[tokio::test]
    async fn latest_event_prefers_higher_sequence() {
        let (storage, run) = setup().await;
        let mut first = event(&run.id, MoveType::Framing, 1);
        first.status = MoveStatus::Partial;
        storage.append_move_event(&first).await.unwrap();
        storage
            .append_move_event(&event(&run.id, MoveType::Framing, 9))
            .await
            .unwrap();

        let latest = storage
            .latest_move_event(&run.id, MoveType::Framing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.sequence, 9);
        assert!(
            storage
                .latest_move_event(&run.id, MoveType::WeighingAndBalance)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn llm_calls_are_logged() {
        let (storage, run) = setup().await;
        let errors = vec!["timeout".to_string()];
        storage
            .log_llm_call(&LlmCallRecord {
                call_id: "call_1",
                run_id: Some(&run.id),
                prompt_id: "framing.v1",
                succeeded: false,
                errors: &errors,
                latency_ms: 12,
            })
            .await
            .unwrap();
        assert_eq!(storage.count_llm_calls(&run.id).await.unwrap(), 1);
    }
}
