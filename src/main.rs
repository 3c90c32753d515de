mod demo;

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stratum_agent::{GraphBuilder, Orchestrator};
use stratum_core::config::AppConfig;
use stratum_core::Stage;

#[derive(Parser)]
#[command(name = "stratum", version, about = "Layered agent coordination engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stratum.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on a task with the built-in heuristic stages
    Run {
        /// Task text (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        task: Vec<String>,
        /// Override orchestrator.max_iterations
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Override orchestrator.reward_threshold
        #[arg(long)]
        threshold: Option<f64>,
        /// Start the stage bus so dispatch and feedback messages flow
        #[arg(long)]
        bus: bool,
        /// Print run statistics after the outcome
        #[arg(long)]
        stats: bool,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print statistics, cycles and centrality of the roster topology
    Graph {
        /// Print a Mermaid flowchart instead of the JSON report
        #[arg(long)]
        mermaid: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the config, then print it
    Check,
}

fn load_config(path: &Path) -> anyhow::Result<(AppConfig, bool)> {
    if path.exists() {
        Ok((AppConfig::load(path)?, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (mut config, from_file) = load_config(&cli.config)?;

    // Logs go to stderr so stdout stays machine readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if !from_file {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
    }

    match cli.command {
        Commands::Config { action: ConfigAction::Check } => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            eprintln!("config ok");
        }
        Commands::Graph { mermaid } => {
            config.validate()?;
            let graph = GraphBuilder::new()
                .with_policy_config(&config.policy)
                .hierarchical(&config.roster);
            if mermaid {
                println!("{}", graph.to_mermaid());
                return Ok(());
            }
            let path = match (
                config.roster.agents(Stage::Decision).first(),
                config.roster.agents(Stage::Validation).first(),
            ) {
                (Some(start), Some(end)) => graph.critical_path(start, end),
                _ => Vec::new(),
            };
            let report = json!({
                "statistics": graph.statistics(),
                "cycles": graph.detect_cycles(),
                "critical_path": path,
                "centrality": graph.centrality(),
                "topology": graph.to_json(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run {
            task,
            max_iterations,
            threshold,
            bus,
            stats,
        } => {
            let mut text = task.join(" ");
            if text.trim().is_empty() {
                io::stdin().read_to_string(&mut text)?;
            }
            let text = text.trim().to_string();
            if text.is_empty() {
                anyhow::bail!("no task given");
            }

            if let Some(n) = max_iterations {
                config.orchestrator.max_iterations = n;
            }
            if let Some(t) = threshold {
                config.orchestrator.reward_threshold = t;
            }

            let (decision, implementation, validation) = demo::pipeline(&config.roster);
            let mut orchestrator = Orchestrator::new(config, decision, implementation, validation)?;
            let runtime = orchestrator.runtime().clone();
            if bus {
                runtime.bus.start()?;
            }

            let interrupt = runtime.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, cancelling run");
                    interrupt.cancel();
                }
            });

            let result = orchestrator.run(&text).await;
            if bus && runtime.bus.is_running() {
                runtime.bus.stop().await?;
            }
            let outcome = result?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if stats {
                println!("{}", serde_json::to_string_pretty(&orchestrator.stats())?);
            }
        }
    }

    Ok(())
}
