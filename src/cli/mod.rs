mod output;
mod repl;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::negotiation::NegotiationEngine;
use crate::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "negotiator", version, about = "Conversational price negotiation in the terminal")]
struct Cli {
    /// Identity of this window; contexts sharing an id share ownership
    #[arg(long, env = "NEGOTIATOR_CONTEXT_ID")]
    context_id: Option<String>,

    /// Working directory
    #[arg(short = 'c', long = "cwd")]
    working_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Start a new session, displacing any existing one
    #[arg(long)]
    fresh: bool,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let mut config = crate::core::config::load_config(cli.working_dir.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    config.debug |= cli.debug;

    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let db = Database::open(&config)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    db.run_migrations()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let service = crate::remote::create_service(&config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let store = db.session_store(&config.negotiation.storage_key);
    let context_id = cli
        .context_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::debug!(context = %context_id, "starting negotiator");

    let (mut engine, events) =
        NegotiationEngine::new(&config.negotiation, context_id, store, service);
    engine.start().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    if cli.fresh {
        engine.restart().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let result = repl::run(&mut engine, events).await;
    engine.shutdown();
    result
}
