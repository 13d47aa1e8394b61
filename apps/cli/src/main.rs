//! Judgement CLI: read, recompute and inspect judgement artifacts.
//!
//! Works against a local libSQL evidence base; structured calls go to
//! OpenRouter unless `--offline` is given.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
