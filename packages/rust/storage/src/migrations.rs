//! SQL migration definitions for the judgement database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Evidence base: projects, scenarios, framings, documents, policy, sites, FTS5",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS projects (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scenarios (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    title      TEXT NOT NULL,
    state_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS framings (
    id          TEXT PRIMARY KEY,
    scenario_id TEXT NOT NULL REFERENCES scenarios(id) ON DELETE CASCADE,
    title       TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    title      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS doc_chunks (
    id          TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    project_id  TEXT NOT NULL,
    page        INTEGER,
    text        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_doc_chunks_project ON doc_chunks(project_id);

CREATE TABLE IF NOT EXISTS policy_clauses (
    id          TEXT PRIMARY KEY,
    plan_id     TEXT NOT NULL,
    policy_code TEXT NOT NULL,
    clause_ref  TEXT NOT NULL,
    title       TEXT NOT NULL,
    text        TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consultations (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    title      TEXT NOT NULL,
    summary    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timetables (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    label      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sites (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    scenario_id TEXT,
    name       TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS site_assessments (
    id         TEXT PRIMARY KEY,
    site_id    TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    summary    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Precomputed output of the external spatial intersection tool
CREATE TABLE IF NOT EXISTS spatial_features (
    id           TEXT PRIMARY KEY,
    site_id      TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    project_id   TEXT NOT NULL,
    layer        TEXT NOT NULL,
    feature_name TEXT NOT NULL,
    overlap_pct  REAL,
    distance_m   REAL
);

CREATE INDEX IF NOT EXISTS idx_spatial_features_site ON spatial_features(site_id);

CREATE TABLE IF NOT EXISTS visual_assets (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    site_id    TEXT,
    asset_kind TEXT NOT NULL,
    uri        TEXT NOT NULL,
    caption    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instrument_outputs (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    instrument_id TEXT NOT NULL,
    tool_run_id   TEXT NOT NULL,
    output_json   TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_runs (
    id           TEXT PRIMARY KEY,
    project_id   TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    completed_at TEXT NOT NULL
);

-- Full-text search on policy clauses and document chunks
CREATE VIRTUAL TABLE IF NOT EXISTS policy_clauses_fts USING fts5(
    title,
    text,
    content=policy_clauses,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS policy_clauses_fts_insert AFTER INSERT ON policy_clauses BEGIN
    INSERT INTO policy_clauses_fts(rowid, title, text)
    VALUES (new.rowid, new.title, new.text);
END;

CREATE TRIGGER IF NOT EXISTS policy_clauses_fts_delete AFTER DELETE ON policy_clauses BEGIN
    INSERT INTO policy_clauses_fts(policy_clauses_fts, rowid, title, text)
    VALUES ('delete', old.rowid, old.title, old.text);
END;

CREATE TRIGGER IF NOT EXISTS policy_clauses_fts_update AFTER UPDATE ON policy_clauses BEGIN
    INSERT INTO policy_clauses_fts(policy_clauses_fts, rowid, title, text)
    VALUES ('delete', old.rowid, old.title, old.text);
    INSERT INTO policy_clauses_fts(rowid, title, text)
    VALUES (new.rowid, new.title, new.text);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS doc_chunks_fts USING fts5(
    text,
    content=doc_chunks,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS doc_chunks_fts_insert AFTER INSERT ON doc_chunks BEGIN
    INSERT INTO doc_chunks_fts(rowid, text) VALUES (new.rowid, new.text);
END;

CREATE TRIGGER IF NOT EXISTS doc_chunks_fts_delete AFTER DELETE ON doc_chunks BEGIN
    INSERT INTO doc_chunks_fts(doc_chunks_fts, rowid, text)
    VALUES ('delete', old.rowid, old.text);
END;

CREATE TRIGGER IF NOT EXISTS doc_chunks_fts_update AFTER UPDATE ON doc_chunks BEGIN
    INSERT INTO doc_chunks_fts(doc_chunks_fts, rowid, text)
    VALUES ('delete', old.rowid, old.text);
    INSERT INTO doc_chunks_fts(rowid, text) VALUES (new.rowid, new.text);
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Judgement core: tabs, runs, move events, frames, atoms, cache, llm calls",
            sql: r#"
CREATE TABLE IF NOT EXISTS tabs (
    id                    TEXT PRIMARY KEY,
    scenario_id           TEXT NOT NULL,
    framing_id            TEXT NOT NULL,
    status                TEXT NOT NULL,
    last_content_address  TEXT,
    last_run_id           TEXT,
    last_run_completed_at TEXT,
    cache_expiry          TEXT,
    created_at            TEXT NOT NULL,
    UNIQUE(scenario_id, framing_id)
);

CREATE TABLE IF NOT EXISTS move_runs (
    id                      TEXT PRIMARY KEY,
    tab_id                  TEXT NOT NULL REFERENCES tabs(id),
    content_address         TEXT NOT NULL,
    status                  TEXT NOT NULL,
    started_at              TEXT NOT NULL,
    completed_at            TEXT,
    errors_json             TEXT NOT NULL DEFAULT '[]',
    persistence_errors_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_move_runs_tab ON move_runs(tab_id);

-- Append-only audit trail; rows are never updated.
CREATE TABLE IF NOT EXISTS move_events (
    id                    TEXT PRIMARY KEY,
    run_id                TEXT NOT NULL REFERENCES move_runs(id),
    move_type             TEXT NOT NULL,
    sequence              INTEGER NOT NULL,
    status                TEXT NOT NULL,
    inputs_json           TEXT NOT NULL,
    outputs_json          TEXT NOT NULL,
    evidence_refs_json    TEXT NOT NULL,
    assumptions_json      TEXT NOT NULL,
    uncertainty_json      TEXT NOT NULL,
    tool_invocations_json TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    UNIQUE(run_id, sequence)
);

CREATE TRIGGER IF NOT EXISTS move_events_immutable BEFORE UPDATE ON move_events BEGIN
    SELECT RAISE(ABORT, 'move_events are append-only');
END;

CREATE TABLE IF NOT EXISTS retrieval_frames (
    id                TEXT PRIMARY KEY,
    run_id            TEXT NOT NULL,
    move_type         TEXT NOT NULL,
    version           INTEGER NOT NULL,
    based_on_frame_id TEXT,
    budgets_json      TEXT NOT NULL,
    modalities_json   TEXT NOT NULL,
    queries_json      TEXT NOT NULL,
    is_current        INTEGER NOT NULL,
    created_at        TEXT NOT NULL,
    UNIQUE(run_id, move_type, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_frames_one_current
    ON retrieval_frames(run_id, move_type) WHERE is_current = 1;

CREATE TABLE IF NOT EXISTS evidence_atoms (
    evidence_ref      TEXT PRIMARY KEY,
    evidence_type     TEXT NOT NULL,
    title             TEXT NOT NULL,
    summary           TEXT NOT NULL,
    excerpt           TEXT NOT NULL,
    provenance_json   TEXT NOT NULL,
    limitations       TEXT NOT NULL,
    metadata_json     TEXT NOT NULL,
    approx_token_cost INTEGER NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS judgement_cache (
    artifact_key    TEXT PRIMARY KEY,
    content_address TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS llm_calls (
    id         TEXT PRIMARY KEY,
    run_id     TEXT,
    prompt_id  TEXT NOT NULL,
    succeeded  INTEGER NOT NULL,
    errors_json TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Tab claim timestamps for lease-based single-flight",
            sql: r#"
ALTER TABLE tabs ADD COLUMN claimed_at TEXT;

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
