//! Evidence atoms: one immutable row per evidence ref.

use judgement_shared::{EvidenceAtom, Result};
use libsql::{Row, params};

use crate::{Storage, col_i64, col_json, col_str, col_ts, to_json};

const ATOM_COLUMNS: &str = "evidence_ref, evidence_type, title, summary, excerpt, provenance_json, \
                            limitations, metadata_json, approx_token_cost, created_at";

fn row_to_atom(row: &Row) -> Result<EvidenceAtom> {
    Ok(EvidenceAtom {
        evidence_ref: col_str(row, 0)?,
        evidence_type: col_str(row, 1)?.parse()?,
        title: col_str(row, 2)?,
        summary: col_str(row, 3)?,
        excerpt: col_str(row, 4)?,
        provenance: col_json(row, 5)?,
        limitations: col_str(row, 6)?,
        metadata: col_json(row, 7)?,
        approx_token_cost: col_i64(row, 8)? as u32,
        created_at: col_ts(row, 9)?,
    })
}

impl Storage {
    /// Insert an atom unless one with the same ref already exists.
    /// Returns `true` when a new row was written.
    pub async fn insert_atom(&self, atom: &EvidenceAtom) -> Result<bool> {
        let affected = self
            .execute(
                "INSERT OR IGNORE INTO evidence_atoms (evidence_ref, evidence_type, title, summary, \
                 excerpt, provenance_json, limitations, metadata_json, approx_token_cost, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    atom.evidence_ref.as_str(),
                    atom.evidence_type.as_str(),
                    atom.title.as_str(),
                    atom.summary.as_str(),
                    atom.excerpt.as_str(),
                    to_json(&atom.provenance)?,
                    atom.limitations.as_str(),
                    to_json(&atom.metadata)?,
                    atom.approx_token_cost as i64,
                    atom.created_at.to_rfc3339()
                ],
            )
            .await?;
        Ok(affected == 1)
    }

    pub async fn get_atom(&self, evidence_ref: &str) -> Result<Option<EvidenceAtom>> {
        let sql = format!("SELECT {ATOM_COLUMNS} FROM evidence_atoms WHERE evidence_ref = ?1");
        self.fetch_one(&sql, params![evidence_ref])
            .await?
            .map(|row| row_to_atom(&row))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use chrono::Utc;
    use judgement_shared::{EvidenceKind, Provenance};
    use serde_json::json;

    fn atom(evidence_ref: &str, title: &str) -> EvidenceAtom {
        EvidenceAtom {
            evidence_ref: evidence_ref.into(),
            evidence_type: EvidenceKind::PolicyClause,
            title: title.into(),
            summary: "summary".into(),
            excerpt: "excerpt".into(),
            provenance: Provenance {
                source_table: "policy_clauses".into(),
                source_id: "pc-1".into(),
                run_id: "run_1".into(),
                query_ids: vec!["q1".into()],
            },
            limitations: "Policy text only.".into(),
            metadata: json!({"policy_code": "EN4"}),
            approx_token_cost: 12,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn atoms_are_immutable_by_ref() {
        let storage = test_storage().await;
        assert!(storage.insert_atom(&atom("policy_clause::pc-1", "first")).await.unwrap());
        assert!(!storage.insert_atom(&atom("policy_clause::pc-1", "second")).await.unwrap());

        let stored = storage.get_atom("policy_clause::pc-1").await.unwrap().unwrap();
        assert_eq!(stored.title, "first");
        assert_eq!(stored.provenance.query_ids, vec!["q1"]);
        assert_eq!(stored.evidence_type, EvidenceKind::PolicyClause);
        assert!(storage.get_atom("policy_clause::nope").await.unwrap().is_none());
    }
}
