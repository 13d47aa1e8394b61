//! Shared types, error model, and configuration for the judgement engine.
//!
//! This crate is the foundation depended on by all other judgement crates.
//! It provides:
//! - [`JudgementError`]: the unified error type
//! - Domain types ([`Tab`], [`MoveEvent`], [`RetrievalFrame`], [`Trajectory`])
//! - The evidence model ([`EvidenceCandidate`], [`EvidenceAtom`], [`ContextPack`])
//! - The canonicalizing hasher ([`content_address`], [`DependencySnapshot`])
//! - Configuration ([`AppConfig`], config loading)

pub mod address;
pub mod config;
pub mod error;
pub mod evidence;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use address::{ContentAddress, DependencySnapshot, canonical_json, content_address};
pub use config::{
    AppConfig, BudgetsConfig, CacheBackend, CacheConfig, DefaultsConfig, OpenRouterConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{JudgementError, Result};
pub use evidence::{
    ContextItem, ContextPack, CuratedEvidenceSet, DeliberateOmission, EvidenceAtom,
    EvidenceCandidate, EvidenceKind, EvidencePayload, EvidenceRole, IssueEvidence, Provenance,
    SliceType, ToolRequest, ToolRequestSource, estimate_tokens,
};
pub use types::{
    ArtifactKey, FrameBudgets, Issue, JudgementSheet, Modality, MoveEvent, MoveRun, MoveStatus,
    MoveType, QueryRole, QuerySource, RetrievalFrame, RetrievalQuery, RunStatus, SheetIssue, Tab,
    TabStatus, Trajectory, new_id,
};
