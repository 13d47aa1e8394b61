//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding two families of tables:
//!
//! - the **evidence base** (projects, scenarios, framings, documents, policy,
//!   sites, imagery, instrument outputs) written by external ingestion and read
//!   here for dependency snapshots and retrieval;
//! - the **judgement core** (tabs, runs, the append-only move event trail,
//!   retrieval frames, evidence atoms, the persisted judgement cache, and the
//!   LLM call log).
//!
//! **Access rules:**
//! - scheduler and pipeline: read-write via [`Storage::open`]
//! - reporting tools: read-only via [`Storage::open_readonly`]

mod atoms;
mod bundle;
mod cache;
mod evidence_base;
mod frames;
mod migrations;
mod runs;
mod tabs;

use std::path::Path;

use chrono::{DateTime, Utc};
use judgement_shared::{JudgementError, Result};
use libsql::params::IntoParams;
use libsql::{Connection, Database, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use bundle::{
    BundleAssessment, BundleChunk, BundleConsultation, BundleDocument, BundleFraming,
    BundleIngestRun, BundleInstrumentOutput, BundlePolicyClause, BundleProject, BundleScenario,
    BundleSite, BundleSpatialFeature, BundleTimetable, BundleVisualAsset, EvidenceBundle,
    ImportSummary,
};
pub use cache::StoredCacheEntry;
pub use runs::LlmCallRecord;
pub use evidence_base::{
    ConsultationRecord, FramingRecord, ProjectSignals, ScenarioRecord, SiteRecord,
    fts_match_expression,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| JudgementError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        JudgementError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(JudgementError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generic relational access
    // -----------------------------------------------------------------------

    /// Fetch the first row of a query, if any.
    pub async fn fetch_one(&self, sql: &str, params: impl IntoParams) -> Result<Option<Row>> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        rows.next().await.map_err(storage_err)
    }

    /// Fetch every row of a query.
    pub async fn fetch_all(&self, sql: &str, params: impl IntoParams) -> Result<Vec<Row>> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row);
        }
        Ok(results)
    }

    /// Execute a write statement. Returns the number of affected rows.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> Result<u64> {
        self.check_writable()?;
        self.conn.execute(sql, params).await.map_err(storage_err)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn storage_err(e: libsql::Error) -> JudgementError {
    JudgementError::Storage(e.to_string())
}

/// Required text column.
pub(crate) fn col_str(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

/// Nullable text column.
pub(crate) fn col_opt_str(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Required integer column.
pub(crate) fn col_i64(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(storage_err)
}

/// Required RFC 3339 timestamp column.
pub(crate) fn col_ts(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&col_str(row, idx)?)
}

/// Nullable RFC 3339 timestamp column.
pub(crate) fn col_opt_ts(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    col_opt_str(row, idx).map(|s| parse_ts(&s)).transpose()
}

/// JSON text column decoded into `T`.
pub(crate) fn col_json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<T> {
    let raw = col_str(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| JudgementError::Storage(format!("invalid JSON in column {idx}: {e}")))
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JudgementError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| JudgementError::Storage(format!("JSON serialization failed: {e}")))
}
