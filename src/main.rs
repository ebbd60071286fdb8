//! Wolfpack - Distributed Master Election
//!
//! Command-line companion to the wolfpack library: a local election
//! simulator plus configuration tooling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpack::config::WolfpackConfig;
use wolfpack::election::MasterElection;
use wolfpack::store::MemoryStore;

/// How long a simulated contender holds mastership before stepping down
const MASTERSHIP_HOLD: Duration = Duration::from_millis(25);

/// Wolfpack - Distributed Master Election
#[derive(Parser)]
#[command(name = "wolfpack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local election simulation over the in-memory store
    Simulate {
        /// Path to configuration file (defaults apply if absent)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of contenders competing for mastership
        #[arg(long, default_value_t = 5)]
        contenders: usize,

        /// Rounds of mastership each contender competes for
        #[arg(long, default_value_t = 3)]
        rounds: usize,

        /// Election directory
        #[arg(long, default_value = "/wolfpack/demo")]
        directory: String,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "wolfpack.toml")]
        config: PathBuf,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfpack.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Simulate {
            config,
            contenders,
            rounds,
            directory,
        } => run_simulate(config, contenders, rounds, directory).await,
        Commands::Validate { config } => run_validate(config),
        Commands::Init { output } => run_init(output),
    }
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run repeated elections among local contenders and report the tally
async fn run_simulate(
    config: Option<PathBuf>,
    contenders: usize,
    rounds: usize,
    directory: String,
) -> anyhow::Result<()> {
    let config = match &config {
        Some(path) => WolfpackConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {:?}", path))?,
        None => WolfpackConfig::default(),
    };
    anyhow::ensure!(contenders > 0, "at least one contender is required");

    tracing::info!(
        "Simulating {} contenders over {} rounds in {}",
        contenders,
        rounds,
        directory
    );

    let store = MemoryStore::new();
    let elections: Arc<Vec<MasterElection>> = Arc::new(
        (0..contenders)
            .map(|i| {
                MasterElection::new(
                    Arc::new(store.clone()),
                    directory.clone(),
                    format!("contender-{}", i),
                    config.election.clone(),
                )
            })
            .collect(),
    );

    let mut tasks = Vec::new();
    for i in 0..contenders {
        let elections = Arc::clone(&elections);
        tasks.push(tokio::spawn(async move {
            let election = &elections[i];
            let mut wins = 0u32;
            for round in 0..rounds {
                if let Err(e) = election.start_election().await {
                    tracing::error!("contender-{} could not start round {}: {}", i, round, e);
                    break;
                }
                if let Err(e) = election.wait_to_become_master().await {
                    tracing::error!("contender-{} lost round {}: {}", i, round, e);
                    break;
                }
                wins += 1;

                let masters = elections.iter().filter(|e| e.is_master()).count();
                if masters > 1 {
                    tracing::error!(
                        "SAFETY VIOLATION: contender-{} observed {} simultaneous masters",
                        i,
                        masters
                    );
                }

                tokio::time::sleep(MASTERSHIP_HOLD).await;
                if let Err(e) = election.stop_election().await {
                    tracing::error!("contender-{} could not step down: {}", i, e);
                    break;
                }
            }
            wins
        }));
    }

    for (i, task) in futures::future::join_all(tasks).await.into_iter().enumerate() {
        let wins = task.context("contender task panicked")?;
        tracing::info!("contender-{} became master {} times", i, wins);
    }

    Ok(())
}

fn run_validate(path: PathBuf) -> anyhow::Result<()> {
    WolfpackConfig::from_file(&path)
        .with_context(|| format!("configuration {:?} is invalid", path))?;
    println!("Configuration {} is valid", path.display());
    Ok(())
}

fn run_init(output: PathBuf) -> anyhow::Result<()> {
    anyhow::ensure!(
        !output.exists(),
        "refusing to overwrite existing file {:?}",
        output
    );

    let content = toml::to_string_pretty(&WolfpackConfig::default())
        .context("failed to render default configuration")?;
    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {:?}", output))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}
