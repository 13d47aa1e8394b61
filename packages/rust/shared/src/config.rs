//! Application configuration for the judgement engine.
//!
//! User config lives at `~/.judgement/judgement.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JudgementError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "judgement.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".judgement";

// ---------------------------------------------------------------------------
// Config structs (matching judgement.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Judgement cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Time and token budgets.
    #[serde(default)]
    pub budgets: BudgetsConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path of the libSQL database holding the evidence base and audit trail.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Maximum number of background recomputations running at once.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

fn default_database_path() -> String {
    "~/.judgement/judgement.db".into()
}
fn default_worker_concurrency() -> u32 {
    2
}

/// Which store backs the judgement cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Persisted in the database, shared by every process using it.
    Storage,
    /// In-process only, lost on restart.
    Memory,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backing store.
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,

    /// Seconds a cached judgement stays valid even if nothing changed.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Maximum entries held by the in-process backend.
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            ttl_secs: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Storage
}
fn default_cache_ttl() -> u64 {
    86_400
}
fn default_cache_capacity() -> u64 {
    1_024
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for every structured call.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[budgets]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetsConfig {
    /// Time budget for a single structured LLM call.
    #[serde(default = "default_llm_budget")]
    pub llm_time_budget_secs: u64,

    /// Time budget for a single retrieval collaborator call.
    #[serde(default = "default_retrieval_budget")]
    pub retrieval_time_budget_secs: u64,

    /// Token budget of the context pack handed to each move.
    #[serde(default = "default_context_tokens")]
    pub context_token_budget: u32,

    /// Upper bound on evidence atoms selected per issue.
    #[serde(default = "default_max_atoms")]
    pub max_atoms_per_issue: u32,

    /// Candidates requested from a collaborator per query.
    #[serde(default = "default_candidates_per_query")]
    pub candidates_per_query: u32,

    /// How long a `queued`/`running` claim on a tab holds before another
    /// caller may take it over. Must outlast a full pipeline run.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            llm_time_budget_secs: default_llm_budget(),
            retrieval_time_budget_secs: default_retrieval_budget(),
            context_token_budget: default_context_tokens(),
            max_atoms_per_issue: default_max_atoms(),
            candidates_per_query: default_candidates_per_query(),
            claim_lease_secs: default_claim_lease(),
        }
    }
}

fn default_llm_budget() -> u64 {
    60
}
fn default_retrieval_budget() -> u64 {
    15
}
fn default_context_tokens() -> u32 {
    6_000
}
fn default_max_atoms() -> u32 {
    6
}
fn default_candidates_per_query() -> u32 {
    8
}
fn default_claim_lease() -> u64 {
    3_600
}

impl BudgetsConfig {
    /// LLM call budget as a [`Duration`].
    pub fn llm_time_budget(&self) -> Duration {
        Duration::from_secs(self.llm_time_budget_secs)
    }

    /// Retrieval call budget as a [`Duration`].
    pub fn retrieval_time_budget(&self) -> Duration {
        Duration::from_secs(self.retrieval_time_budget_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.judgement/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| JudgementError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.judgement/judgement.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| JudgementError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| JudgementError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| JudgementError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| JudgementError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| JudgementError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| JudgementError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read the OpenRouter API key from the configured env var.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(JudgementError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable \
             or pass --offline to run with deterministic fallbacks only."
        ))),
    }
}
