use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use mixctl::{FailurePolicy, ForwardOptions, Supervisor, load_config};
use std::{path::PathBuf, process, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RULES_HELP: &str = "Rules are read from a TOML file with one [[rules]] table per rule \
(name, from, to). YAML rule files are not supported and must be converted to TOML.";

#[derive(Parser, Debug)]
#[command(name = "mixctl", version)]
#[command(about = "Forward TCP connections to a randomly chosen upstream", long_about = None)]
#[command(after_help = RULES_HELP)]
struct Cli {
    /// Rules file to load (TOML)
    #[arg(short = 'f', long = "file", value_name = "RULES")]
    file: Option<PathBuf>,

    /// Log opened and closed connections
    #[arg(short = 'v', long, default_value_t = true, action = ArgAction::Set)]
    verbose: bool,

    /// Upstream dial timeout, e.g. 1500ms or 2s
    #[arg(short = 't', long = "dial-timeout", default_value = "1500ms", value_parser = humantime::parse_duration)]
    dial_timeout: Duration,

    /// Stop every rule when any single rule fails
    #[arg(long)]
    fail_fast: bool,

    /// Seed upstream selection for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let Some(file) = cli.file else {
        eprintln!("usage: mixctl -f rules.toml\n\n{RULES_HELP}");
        process::exit(1);
    };

    let set = load_config(&file)?;
    info!(
        config_file = %file.display(),
        rules = set.rules.len(),
        verbose = cli.verbose,
        dial_timeout = ?cli.dial_timeout,
        "Configuration loaded"
    );

    let options = ForwardOptions {
        dial_timeout: cli.dial_timeout,
        verbose: cli.verbose,
        seed: cli.seed,
    };
    let policy = if cli.fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::Isolate
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    Supervisor::new(set, options)
        .with_policy(policy)
        .run(shutdown)
        .await
        .context("Forwarding stopped")
}
