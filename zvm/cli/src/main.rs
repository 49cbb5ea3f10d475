//! zvm: host-side runner for the virtualized function engine.
//!
//! Stands in for the device shell during development: boots the engine
//! from the embedded payload (or an external bundle file) and prints
//! the report, the smoke verdict, or the catalog listing.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zvm_core::{
    build_report, run_smoke_check, Bootstrap, Engine, EngineConfig, ExecLimits, PayloadSource,
};

#[derive(Parser, Debug)]
#[command(name = "zvm")]
#[command(about = "Run the virtualized function engine and print its reports")]
struct Cli {
    /// Load the payload bundle from a file instead of the embedded one.
    #[arg(long, global = true)]
    payload: Option<PathBuf>,

    /// Instruction budget per invocation.
    #[arg(long, global = true)]
    fuel: Option<u64>,

    /// Call depth limit per invocation.
    #[arg(long, global = true)]
    max_call_depth: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the full per-function report.
    Report {
        /// Emit outcomes as JSON instead of the text report.
        #[arg(long)]
        json: bool,
    },
    /// Print the smoke-check verdict and exit non-zero on FAIL.
    Smoke,
    /// List the catalog functions and reporting cases.
    List,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zvm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let defaults = ExecLimits::default();
    let config = EngineConfig {
        source: match &cli.payload {
            Some(path) => PayloadSource::File(path.clone()),
            None => PayloadSource::Embedded,
        },
        limits: ExecLimits {
            fuel: cli.fuel.unwrap_or(defaults.fuel),
            max_call_depth: cli.max_call_depth.unwrap_or(defaults.max_call_depth),
        },
    };
    debug!(?config, "engine configuration");

    let controller = Bootstrap::new(config);
    let engine = controller
        .ensure_ready()
        .context("bootstrap did not reach stage 2")?;

    match cli.command {
        Command::Report { json } => {
            if json {
                print_json_report(engine)?;
            } else {
                println!("{}", build_report(engine));
            }
        }
        Command::Smoke => {
            let verdict = run_smoke_check(engine);
            println!("{verdict}");
            if verdict.starts_with("FAIL") {
                std::process::exit(1);
            }
        }
        Command::List => {
            for entry in engine.catalog().iter() {
                println!(
                    "{}  arity={} regs={} insts={}",
                    entry.name,
                    entry.arity,
                    entry.reg_count,
                    entry.insts.len()
                );
            }
            for case in engine.cases() {
                println!(
                    "case {}({:?}) expected={}{}",
                    case.name,
                    case.args,
                    case.expected,
                    if case.smoke { " [smoke]" } else { "" }
                );
            }
        }
    }

    Ok(())
}

fn print_json_report(engine: &Engine) -> anyhow::Result<()> {
    let outcomes: Vec<_> = engine
        .cases()
        .iter()
        .map(|case| engine.invoke(&case.name, &case.args))
        .collect();
    let payload = serde_json::json!({
        "outcomes": outcomes,
        "stats": engine.stats(),
    });
    serde_json::to_writer_pretty(std::io::stdout(), &payload)?;
    println!();
    Ok(())
}
