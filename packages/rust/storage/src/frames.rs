//! Versioned retrieval frames.

use chrono::Utc;
use judgement_shared::{
    FrameBudgets, Modality, MoveType, Result, RetrievalFrame, RetrievalQuery, new_id,
};
use libsql::{Row, params};

use crate::{Storage, col_i64, col_json, col_opt_str, col_str, col_ts, to_json};

const FRAME_COLUMNS: &str = "id, run_id, move_type, version, based_on_frame_id, budgets_json, \
                             modalities_json, queries_json, is_current, created_at";

fn row_to_frame(row: &Row) -> Result<RetrievalFrame> {
    Ok(RetrievalFrame {
        id: col_str(row, 0)?,
        run_id: col_str(row, 1)?,
        move_type: col_str(row, 2)?.parse()?,
        version: col_i64(row, 3)? as u32,
        based_on_frame_id: col_opt_str(row, 4),
        budgets: col_json(row, 5)?,
        modalities: col_json(row, 6)?,
        queries: col_json(row, 7)?,
        is_current: col_i64(row, 8)? != 0,
        created_at: col_ts(row, 9)?,
    })
}

impl Storage {
    /// Persist a new frame version for `(run_id, move_type)`.
    ///
    /// The previous current frame, if any, is flipped to `is_current = 0` and
    /// becomes the new frame's `based_on_frame_id`.
    pub async fn supersede_frame(
        &self,
        run_id: &str,
        move_type: MoveType,
        budgets: FrameBudgets,
        modalities: Vec<Modality>,
        queries: Vec<RetrievalQuery>,
    ) -> Result<RetrievalFrame> {
        let previous = self.current_frame(run_id, move_type).await?;

        if let Some(prev) = &previous {
            self.execute(
                "UPDATE retrieval_frames SET is_current = 0 WHERE id = ?1",
                params![prev.id.as_str()],
            )
            .await?;
        }

        let frame = RetrievalFrame {
            id: new_id("frame"),
            run_id: run_id.to_string(),
            move_type,
            version: previous.as_ref().map(|p| p.version + 1).unwrap_or(1),
            based_on_frame_id: previous.map(|p| p.id),
            budgets,
            modalities,
            queries,
            is_current: true,
            created_at: Utc::now(),
        };

        self.execute(
            "INSERT INTO retrieval_frames (id, run_id, move_type, version, based_on_frame_id, \
             budgets_json, modalities_json, queries_json, is_current, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
            params![
                frame.id.as_str(),
                run_id,
                move_type.as_str(),
                frame.version as i64,
                frame.based_on_frame_id.as_deref(),
                to_json(&frame.budgets)?,
                to_json(&frame.modalities)?,
                to_json(&frame.queries)?,
                frame.created_at.to_rfc3339()
            ],
        )
        .await?;

        tracing::debug!(
            run_id,
            move_type = %move_type,
            version = frame.version,
            queries = frame.queries.len(),
            "retrieval frame persisted"
        );
        Ok(frame)
    }

    pub async fn current_frame(&self, run_id: &str, move_type: MoveType) -> Result<Option<RetrievalFrame>> {
        let sql = format!(
            "SELECT {FRAME_COLUMNS} FROM retrieval_frames \
             WHERE run_id = ?1 AND move_type = ?2 AND is_current = 1"
        );
        self.fetch_one(&sql, params![run_id, move_type.as_str()])
            .await?
            .map(|row| row_to_frame(&row))
            .transpose()
    }

    /// Every version for `(run_id, move_type)`, oldest first.
    pub async fn frame_history(&self, run_id: &str, move_type: MoveType) -> Result<Vec<RetrievalFrame>> {
        let sql = format!(
            "SELECT {FRAME_COLUMNS} FROM retrieval_frames \
             WHERE run_id = ?1 AND move_type = ?2 ORDER BY version"
        );
        self.fetch_all(&sql, params![run_id, move_type.as_str()])
            .await?
            .iter()
            .map(row_to_frame)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use judgement_shared::{QueryRole, QuerySource};

    fn budgets() -> FrameBudgets {
        FrameBudgets {
            candidates_per_query: 8,
            max_atoms_per_issue: 6,
            max_queries_per_issue: 6,
        }
    }

    fn query(text: &str) -> RetrievalQuery {
        RetrievalQuery {
            id: new_id("q"),
            issue_id: "flood".into(),
            role: QueryRole::Primary,
            modality: Modality::Text,
            text: text.into(),
            site_id: None,
            limit: 8,
            source: QuerySource::Template,
        }
    }

    #[tokio::test]
    async fn superseding_chains_versions() {
        let storage = test_storage().await;
        let first = storage
            .supersede_frame("run_1", MoveType::EvidenceCuration, budgets(), vec![Modality::Text], vec![query("a")])
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert!(first.based_on_frame_id.is_none());

        let second = storage
            .supersede_frame("run_1", MoveType::EvidenceCuration, budgets(), vec![Modality::Text], vec![query("b")])
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.based_on_frame_id.as_deref(), Some(first.id.as_str()));

        let current = storage
            .current_frame("run_1", MoveType::EvidenceCuration)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.queries[0].text, "b");

        let history = storage
            .frame_history("run_1", MoveType::EvidenceCuration)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|f| f.is_current).count(), 1);
        assert_eq!(history[0].queries[0].text, "a");
    }

    #[tokio::test]
    async fn frames_are_scoped_per_move_type() {
        let storage = test_storage().await;
        storage
            .supersede_frame("run_1", MoveType::EvidenceCuration, budgets(), vec![], vec![])
            .await
            .unwrap();
        let other = storage
            .supersede_frame("run_1", MoveType::EvidenceInterpretation, budgets(), vec![], vec![])
            .await
            .unwrap();
        assert_eq!(other.version, 1);
        assert!(
            storage
                .current_frame("run_2", MoveType::EvidenceCuration)
                .await
                .unwrap()
                .is_none()
        );
    }
}
