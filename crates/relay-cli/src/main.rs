use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_core::providers::mask_secret;
use relay_core::{
    ConsoleStreamingSink, HandoffOrchestration, InProcessRuntime, StdinHumanInput,
};

mod config;

use config::RelayConfig;

/// Quiet by default, except for the refund/return notices from the order plugins
const DEFAULT_LOG_FILTER: &str = "warn,relay_core::tools::orders=info";

#[derive(Parser)]
#[command(name = "relay")]
#[command(version)]
#[command(about = "Relay: customer support agents that hand conversations to each other")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive support session (default)
    Run {
        /// Task given to the entry agent instead of the configured one
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Write the default config to ~/.relay/config.toml
    Init,

    /// Show the effective configuration
    Config,

    /// List agents, their plugins and the handoff graph
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they stay out of the conversation on stdout
    let filter = if cli.debug { "debug" } else { DEFAULT_LOG_FILTER };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run { task: None }) {
        Commands::Run { task } => cmd_run(&cli.config, task).await,
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Agents => cmd_agents(&cli.config).await,
    }
}

async fn cmd_run(config_path: &Option<PathBuf>, task: Option<String>) -> Result<()> {
    let cfg = RelayConfig::load(config_path)?;
    let router = cfg
        .build_router()
        .context("Failed to set up the model provider")?;

    let agents = cfg.build_agents()?;
    let handoffs = cfg.build_handoffs(&agents)?;
    let orchestration =
        HandoffOrchestration::new(agents, handoffs, &cfg.orchestration.entry_agent)?
            .with_streaming_sink(|| Box::new(ConsoleStreamingSink::stdout()))
            .with_human_input(Arc::new(StdinHumanInput::new()))
            .with_config(cfg.orchestration_config());

    let runtime = InProcessRuntime::start(Arc::new(router));
    let task = task.unwrap_or_else(|| cfg.orchestration.task.clone());

    let outcome = match orchestration.invoke(task, &runtime) {
        Ok(handle) => {
            info!("Session {} started", handle.id());
            handle.get().await
        }
        Err(e) => {
            runtime.stop_when_idle().await;
            return Err(e).context("Failed to start the orchestration");
        }
    };

    // Stop the runtime on both paths before reporting
    runtime.stop_when_idle().await;

    match outcome {
        Ok(result) => {
            println!("Task is completed with summary: {}", result.summary);
            info!(
                "Completed by {} ({} messages, {} input / {} output tokens)",
                result.final_agent,
                result.conversation.len(),
                result.usage.input_tokens,
                result.usage.output_tokens
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.report());
            Err(e.into())
        }
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config::default_config_path();
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }

    tokio::fs::write(&config_path, config::DEFAULT_CONFIG).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    info!("Created default config at {}", config_path.display());

    println!("Relay initialized at {}", config_dir.display());
    println!(
        "Set AZURE_AI_AGENT_ENDPOINT, AZURE_AI_AGENT_MODEL_DEPLOYMENT_NAME and AZURE_OPENAI_API_KEY, or edit {}.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let mut cfg = RelayConfig::load(config_path)?;
    cfg.provider.api_key = mask_secret(&cfg.provider.api_key);
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path)?;
    let agents = cfg.build_agents()?;
    let handoffs = cfg.build_handoffs(&agents)?;

    println!("Agents (entry: {}):", cfg.orchestration.entry_agent);
    for agent in agents.iter() {
        println!("  {} - {}", agent.name(), agent.description());
        for tool in agent.tools().names() {
            println!("      {}", tool);
        }
    }

    println!();
    println!("Handoffs:");
    for (source, edge) in handoffs.edges() {
        println!("  {} -> {}: {}", source, edge.target, edge.description);
    }
    Ok(())
}
