use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use benchhost::config::{HarnessConfig, LogFormat, LoggingConfig};
use benchhost::notify::{ChannelListener, NotificationEvent};
use benchhost::{StartOutcome, Value};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "benchhost",
    about = "Host-side harness that drives a benchmark engine through its run lifecycle",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (default: $BENCHHOST_CONFIG, then ./benchhost.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tests the engine offers
    Tests,

    /// Show the parameters of a test with their current values
    Params {
        /// Test id (see `tests`)
        test_id: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run a test and stream its notifications
    Run {
        /// Test id (see `tests`)
        test_id: usize,

        /// Reset every parameter to its default before applying overrides
        #[arg(long)]
        reset: bool,

        /// Set a parameter value, e.g. `--set 2=1` or `--set 4=0.5`
        #[arg(long = "set", value_name = "IDX=VALUE", value_parser = parse_assignment::<Value>)]
        sets: Vec<(usize, Value)>,

        /// Select a list entry by position, e.g. `--list 0=4`
        #[arg(long = "list", value_name = "IDX=ENTRY", value_parser = parse_assignment::<usize>)]
        lists: Vec<(usize, usize)>,

        /// Print one JSON object per notification
        #[arg(long)]
        json: bool,
    },
}

fn parse_assignment<T>(raw: &str) -> Result<(usize, T)>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let (index, value) = raw
        .split_once('=')
        .with_context(|| format!("expected IDX=VALUE, got '{}'", raw))?;
    let index = index
        .trim()
        .parse()
        .with_context(|| format!("invalid parameter index '{}'", index))?;
    let value = value
        .trim()
        .parse()
        .with_context(|| format!("invalid value '{}'", value))?;
    Ok((index, value))
}

/// Stderr subscriber used while the config file itself is being resolved.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        HarnessConfig::resolve(cli.config.as_deref())
    })?;
    init_tracing(&config.logging);

    let orchestrator = benchhost::simulated_orchestrator(&config)?;

    match cli.command {
        Commands::Tests => {
            println!("{:<4} | Name", "Id");
            println!("{:-<4}-|-{:-<20}", "", "");
            for test in orchestrator.tests()? {
                println!("{:<4} | {}", test.id, test.name);
            }
        }
        Commands::Params { test_id, json } => {
            let snapshots = orchestrator
                .params_for_test(test_id)?
                .iter()
                .map(|view| view.snapshot())
                .collect::<Result<Vec<_>, _>>()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                println!("{:<4} | {:<36} | Value", "Idx", "Parameter");
                println!("{:-<4}-|-{:-<36}-|-{:-<16}", "", "", "");
                for p in snapshots {
                    println!("{:<4} | {:<36} | {}", p.index, p.description, p.formatted);
                }
                println!("(* = engine default)");
            }
        }
        Commands::Run {
            test_id,
            reset,
            sets,
            lists,
            json,
        } => {
            let params = orchestrator.parameters()?;
            if reset {
                let summary = orchestrator.reset_settings(test_id)?;
                for (index, e) in &summary.failed {
                    eprintln!("warning: parameter {} not reset: {}", index, e);
                }
            }
            for (index, value) in sets {
                params
                    .set(test_id, index, value)
                    .with_context(|| format!("failed to set parameter {}", index))?;
            }
            for (index, entry) in lists {
                params
                    .set_list_index(test_id, index, entry)
                    .with_context(|| format!("failed to select entry for parameter {}", index))?;
            }

            let (listener, mut events) = ChannelListener::new();
            let subscription = orchestrator.bus().subscribe(listener);

            tracing::info!(test_id, "Running test");
            if orchestrator.start_test(test_id)? == StartOutcome::Rejected {
                bail!("test {} was rejected: another test is running", test_id);
            }

            while let Some(event) = events.recv().await {
                if json {
                    let line = serde_json::json!({
                        "at": chrono::Utc::now().to_rfc3339(),
                        "event": &event,
                    });
                    println!("{}", line);
                } else {
                    println!("{}", event);
                }
                if matches!(event, NotificationEvent::Completed { test_id: id } if id == test_id) {
                    break;
                }
            }

            orchestrator.wait_idle().await;
            orchestrator.bus().unsubscribe(subscription);
        }
    }

    Ok(())
}
