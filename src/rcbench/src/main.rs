use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

pub(crate) mod config;
pub(crate) mod logging;
pub(crate) mod scenario;

use config::{Config, Scenario};

#[derive(Debug, Clone, Parser)]
#[command(name = "RC verbs bench")]
struct Opts {
    /// Bench config path
    #[arg(short, long, default_value = "rcbench.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
    /// Override the scenario named in the config
    #[arg(short, long, value_enum)]
    scenario: Option<Scenario>,
    /// Override the number of sessions
    #[arg(short, long)]
    iterations: Option<usize>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = Config::from_path(&opts.config)?;
    if let Some(scenario) = opts.scenario {
        config.bench.scenario = scenario;
    }
    if let Some(iterations) = opts.iterations {
        config.bench.iterations = iterations;
    }

    // RCVERBS_LOG overrides log_level; the guard flushes the optional log file on exit
    let _guard = logging::init_log(&config, !opts.no_ansi)?;

    tracing::info!("running {:?} x{}", config.bench.scenario, config.bench.iterations);
    let report = scenario::run(&config.bench, &config.transport)?;
    tracing::info!(
        "{} sessions moved {} bytes in {:?} ({:.3} Gb/s)",
        report.sessions,
        report.bytes,
        report.elapsed,
        report.gbps()
    );
    Ok(())
}
