#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rbmk_netem::Router;
use rbmk_qa::{registry, Simulation};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rbmk-qa", version, about)]
struct Args {
    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `RBMK_QA_LOG`.
    #[arg(long, env = "RBMK_QA_LOG", default_value = "info")]
    log: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "RBMK_QA_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every registered scenario with its command line.
    List,

    /// Check a captured structured log against a registered scenario.
    Verify {
        /// Environment variable: `RBMK_QA_SCENARIO`.
        #[arg(long, env = "RBMK_QA_SCENARIO")]
        scenario: String,

        /// JSONL file written by the command under test.
        #[arg(long)]
        logs: PathBuf,

        /// Terminal error reported by the command, if it failed.
        #[arg(long)]
        err: Option<String>,
    },

    /// Build a scenario's topology, resolve every registered domain through it, then tear down.
    Simulate {
        /// Environment variable: `RBMK_QA_SCENARIO`.
        #[arg(long, env = "RBMK_QA_SCENARIO")]
        scenario: String,

        /// Directory receiving the CA and server certificates.
        ///
        /// Environment variable: `RBMK_QA_CERT_DIR`.
        #[arg(long, env = "RBMK_QA_CERT_DIR")]
        cert_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Command::List => {
            for desc in registry::all() {
                println!("{:<40} {}", desc.name, desc.argv.join(" "));
            }
            Ok(())
        }
        Command::Verify { scenario, logs, err } => {
            let desc = find(&scenario)?;
            let jsonl = tokio::fs::read_to_string(&logs)
                .await
                .with_context(|| format!("reading {}", logs.display()))?;
            desc.check(err.as_deref(), &jsonl)
                .with_context(|| format!("scenario {} failed", desc.name))?;
            println!("{}: ok", desc.name);
            Ok(())
        }
        Command::Simulate { scenario, cert_dir } => simulate(find(&scenario)?, cert_dir).await,
    }
}

fn find(name: &str) -> anyhow::Result<&'static registry::ScenarioDescriptor> {
    match registry::lookup(name) {
        Some(desc) => Ok(desc),
        None => bail!("unknown scenario {name:?} (see `rbmk-qa list`)"),
    }
}

async fn simulate(desc: &registry::ScenarioDescriptor, cert_dir: PathBuf) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let sim = Simulation::new(
        cancel.clone(),
        cert_dir,
        desc.scenario(),
        Arc::new(Router::new()),
    )
    .await
    .with_context(|| format!("building scenario {}", desc.name))?;
    tracing::info!(scenario = desc.name, resolver = %sim.resolver(), "simulation running");

    for domain in sim.dns_database().domains() {
        match sim.lookup_host(&domain).await {
            Ok(addrs) => {
                let addrs: Vec<String> = addrs.iter().map(ToString::to_string).collect();
                println!("{domain}: {}", addrs.join(", "));
            }
            Err(err) => println!("{domain}: {err}"),
        }
    }

    cancel.cancel();
    let report = sim.wait().await.context("tearing down simulation")?;
    tracing::info!(closed = report.closed.len(), "simulation stopped");
    Ok(())
}
