//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use judgement_core::pipeline::{ProgressReporter, RunOutcome};
use judgement_core::{JudgementResponse, JudgementService, ReadOptions, SnapshotBuilder};
use judgement_llm::{OfflineLlm, OpenRouterClient, StructuredLlm};
use judgement_shared::{
    AppConfig, ArtifactKey, MoveStatus, MoveType, TabStatus, expand_home, init_config, load_config,
    resolve_api_key,
};
use judgement_storage::{EvidenceBundle, Storage};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Judgement: cached, auditable planning judgements.
#[derive(Parser)]
#[command(
    name = "judgement",
    version,
    about = "Compute, cache and audit planning judgements over a local evidence base.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `defaults.database_path`).
    #[arg(long, global = true, env = "JUDGEMENT_DB")]
    pub db: Option<String>,

    /// Never call the model; every move uses its deterministic fallback.
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Read the judgement for a scenario and framing, recomputing it if stale.
    Read {
        scenario: String,
        framing: String,

        /// Report staleness without scheduling a recomputation.
        #[arg(long)]
        no_refresh: bool,

        /// Return the current artifact immediately and refresh in the background.
        #[arg(long)]
        background: bool,
    },

    /// Run the move pipeline now, even if the cached judgement is fresh.
    Run { scenario: String, framing: String },

    /// Print the dependency snapshot and its content address.
    Snapshot { scenario: String, framing: String },

    /// List the move events of a run (defaults to the tab's latest run).
    Events {
        scenario: String,
        framing: String,

        /// Run id to show instead of the latest.
        #[arg(long)]
        run: Option<String>,
    },

    /// Re-run one move of an existing run, appending a new event.
    Rerun {
        run_id: String,

        /// Move type, e.g. `evidence_curation`.
        move_type: String,
    },

    /// Import a JSON evidence bundle into the database.
    Import { path: PathBuf },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so command output
/// on stdout stays machine-readable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("judgement={level},judgement_core={level},judgement_storage={level},judgement_llm={level}");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = Context {
        db: cli.db,
        offline: cli.offline,
    };
    match cli.command {
        Command::Read {
            scenario,
            framing,
            no_refresh,
            background,
        } => {
            let options = ReadOptions {
                auto_refresh: !no_refresh,
                prefer_async: background,
            };
            cmd_read(&ctx, &ArtifactKey::new(scenario, framing), options).await
        }
        Command::Run { scenario, framing } => cmd_run(&ctx, &ArtifactKey::new(scenario, framing)).await,
        Command::Snapshot { scenario, framing } => {
            cmd_snapshot(&ctx, &ArtifactKey::new(scenario, framing)).await
        }
        Command::Events { scenario, framing, run } => {
            cmd_events(&ctx, &ArtifactKey::new(scenario, framing), run.as_deref()).await
        }
        Command::Rerun { run_id, move_type } => cmd_rerun(&ctx, &run_id, &move_type).await,
        Command::Import { path } => cmd_import(&ctx, &path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Global flags every command resolves against the loaded config.
struct Context {
    db: Option<String>,
    offline: bool,
}

impl Context {
    fn database_path(&self, config: &AppConfig) -> Result<PathBuf> {
        let raw = self.db.as_deref().unwrap_or(&config.defaults.database_path);
        Ok(expand_home(raw)?)
    }

    async fn open_storage(&self, config: &AppConfig) -> Result<Arc<Storage>> {
        let path = self.database_path(config)?;
        info!(path = %path.display(), "opening database");
        Ok(Arc::new(Storage::open(&path).await?))
    }

    async fn open_readonly(&self, config: &AppConfig) -> Result<Storage> {
        let path = self.database_path(config)?;
        if !path.exists() {
            return Err(eyre!(
                "no database at '{}'; import an evidence bundle first",
                path.display()
            ));
        }
        Ok(Storage::open_readonly(&path).await?)
    }

    fn llm(&self, config: &AppConfig) -> Result<Arc<dyn StructuredLlm>> {
        if self.offline {
            info!("offline mode: moves will use deterministic fallbacks");
            return Ok(Arc::new(OfflineLlm));
        }
        let api_key = resolve_api_key(config)?;
        let client = OpenRouterClient::new(&config.openrouter, api_key)?;
        info!(model = client.model(), "using OpenRouter");
        Ok(Arc::new(client))
    }

    async fn service(&self, config: &AppConfig) -> Result<JudgementService> {
        let llm = self.llm(config)?;
        let storage = self.open_storage(config).await?;
        Ok(JudgementService::new(storage, llm, config).with_progress(Arc::new(CliProgress::new())))
    }
}

fn print_response(response: &JudgementResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if response.status == TabStatus::Error && response.trajectory.is_none() {
        return Err(eyre!("no judgement available: {}", response.errors.join("; ")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_read(ctx: &Context, key: &ArtifactKey, options: ReadOptions) -> Result<()> {
    let config = load_config()?;
    let service = ctx.service(&config).await?;

    info!(%key, auto_refresh = options.auto_refresh, background = options.prefer_async, "reading judgement");
    let response = service.read(key, options).await;
    let printed = print_response(&response);

    // The process owns its workers; let a background refresh finish before exit.
    service.drain().await;
    printed
}

async fn cmd_run(ctx: &Context, key: &ArtifactKey) -> Result<()> {
    let config = load_config()?;
    let service = ctx.service(&config).await?;

    info!(%key, "running move pipeline");
    let response = service.trigger_run(key).await;
    print_response(&response)
}

async fn cmd_snapshot(ctx: &Context, key: &ArtifactKey) -> Result<()> {
    let config = load_config()?;
    let storage = Arc::new(ctx.open_readonly(&config).await?);
    let snapshot = SnapshotBuilder::new(storage).snapshot(key).await?;

    println!("  Key:     {key}");
    println!("  Address: {}", snapshot.address()?.as_str());
    println!();
    for (signal, value) in snapshot.signals() {
        println!("  {signal:<34} {value}");
    }
    Ok(())
}

async fn cmd_events(ctx: &Context, key: &ArtifactKey, run_id: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = ctx.open_readonly(&config).await?;

    let run = match run_id {
        Some(id) => storage.get_run(id).await?,
        None => {
            let tab = storage
                .get_tab_by_key(key)
                .await?
                .ok_or_else(|| eyre!("no judgement has been computed for {key}"))?;
            storage
                .list_runs(&tab.id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| eyre!("no runs recorded for {key}"))?
        }
    };

    println!();
    println!("  Run:     {}", run.id);
    println!("  Status:  {}", run.status.as_str());
    println!("  Address: {}", run.content_address.as_str());
    println!("  Started: {}", run.started_at.to_rfc3339());
    for e in run.errors.iter().chain(&run.persistence_errors) {
        println!("  ! {e}");
    }
    println!();

    for event in storage.list_move_events(&run.id).await? {
        println!(
            "  {:>2}  {:<28} {:<8} refs={:<3} calls={}",
            event.sequence,
            event.move_type.label(),
            event.status.as_str(),
            event.evidence_refs_considered.len(),
            event.tool_invocation_ids.len(),
        );
        for note in &event.uncertainty_remaining {
            println!("        - {note}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_rerun(ctx: &Context, run_id: &str, move_type: &str) -> Result<()> {
    let move_type: MoveType = move_type.parse()?;
    let config = load_config()?;
    let service = ctx.service(&config).await?;

    info!(run_id, move_type = %move_type, "re-running move");
    let event = service.rerun_move(run_id, move_type).await?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

async fn cmd_import(ctx: &Context, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read bundle '{}': {e}", path.display()))?;
    let bundle = EvidenceBundle::from_json(&text)?;

    let config = load_config()?;
    let storage = ctx.open_storage(&config).await?;
    let summary = storage.import_bundle(&bundle).await?;

    println!();
    println!("  Bundle imported!");
    println!("  Projects:   {}", summary.projects);
    println!("  Scenarios:  {}", summary.scenarios);
    println!("  Framings:   {}", summary.framings);
    println!("  Documents:  {} ({} chunks)", summary.documents, summary.doc_chunks);
    println!("  Policy:     {}", summary.policy_clauses);
    println!("  Sites:      {} ({} features)", summary.sites, summary.spatial_features);
    println!("  Imagery:    {}", summary.visual_assets);
    println!("  Instrument: {}", summary.instrument_outputs);
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn move_started(&self, move_type: MoveType, index: usize, total: usize) {
        self.spinner
            .set_message(format!("[{index}/{total}] {}", move_type.label()));
    }

    fn move_finished(&self, move_type: MoveType, status: MoveStatus) {
        let mark = match status {
            MoveStatus::Success => "✓",
            MoveStatus::Partial => "~",
            MoveStatus::Error => "✗",
        };
        self.spinner
            .println(format!("  {mark} {} ({})", move_type.label(), status.as_str()));
    }

    fn done(&self, outcome: &RunOutcome) {
        self.spinner.finish_and_clear();
        eprintln!(
            "  Run {} finished: {} in {:.1}s",
            outcome.run_id,
            outcome.status.as_str(),
            outcome.elapsed.as_secs_f64()
        );
    }
}
