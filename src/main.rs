use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zmem::config::{env_flag, ZmemConfig};
use zmem::core::MemoryCore;
use zmem::indexer::IngestOptions;

#[derive(Parser)]
#[command(name = "zmem", version, about = "Local-first hybrid memory engine")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace to operate in (overrides ZMEM_WORKSPACE).
    #[arg(long, global = true)]
    workspace: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the memory tools over stdio (default).
    Serve,
    /// Ingest the workspace's documents from disk.
    Ingest {
        /// Root directory to scan; defaults to the configured workspace root.
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Rebuild chunks and vectors for the workspace.
    Reindex,
    /// Show workspace counters.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP transport; all diagnostics go to stderr
    let default_filter = if env_flag("ZMEM_MCP_VERBOSE") {
        "zmem=debug"
    } else {
        "zmem=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = ZmemConfig::load(&config_path);
    let workspace = config.resolve_workspace(cli.workspace.as_deref());
    let core = Arc::new(MemoryCore::new(config)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            if let Err(e) = core.initialize().await {
                tracing::warn!(
                    "Embedding provider unavailable at startup: {} — lexical search still works",
                    e
                );
            }
            zmem::mcp_server::serve_stdio(core.clone(), workspace).await?;
        }
        Command::Ingest { root } => {
            core.initialize().await?;
            let options = ingest_options(&core, &workspace, root)?;
            let report = core.ingest(&options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reindex => {
            core.initialize().await?;
            let report = core.reindex(&workspace).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status => {
            let report = core.status(&workspace)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    core.shutdown();
    Ok(())
}

fn ingest_options(
    core: &MemoryCore,
    workspace: &str,
    root_override: Option<PathBuf>,
) -> anyhow::Result<IngestOptions> {
    let entry = core.config().workspace(workspace);
    let root = root_override
        .or_else(|| entry.map(|w| w.root.clone()))
        .with_context(|| format!("no root configured for workspace '{workspace}'; pass --root"))?;
    Ok(IngestOptions {
        workspace: workspace.to_string(),
        root_path: root,
        glob_patterns: entry.map(|w| w.patterns.clone()).unwrap_or_default(),
        exclude_patterns: Vec::new(),
    })
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zmem")
        .join("zmem.json")
}
