//! Judgement core: staleness detection, recompute scheduling, the move
//! pipeline, evidence curation, and context pack assembly.

pub mod cache;
pub mod context;
pub mod curation;
pub mod gateway;
pub mod pipeline;
pub mod queue;
pub mod retrieval;
pub mod scheduler;
pub mod service;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, JudgementCache, MemoryJudgementCache, StorageJudgementCache, build_cache};
pub use context::{AssemblerConfig, CandidatePool, ContextAssembler, DataFacts, SelectorRegistry};
pub use curation::{CurationConfig, CurationEngine, CurationTemplate, InstrumentHint};
pub use gateway::{LlmGateway, MoveTrace};
pub use pipeline::{MovePipeline, ProgressReporter, RunOutcome, SilentProgress};
pub use queue::{SubmitOutcome, WorkQueue};
pub use retrieval::{EvidenceRetriever, StorageRetriever};
pub use scheduler::{ReadOptions, RecomputeScheduler, SchedulerConfig};
pub use service::{Freshness, JudgementResponse, JudgementService, RunSummary};
pub use snapshot::SnapshotBuilder;
