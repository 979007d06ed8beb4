use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use glimmer_engine::config::Config;
use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable tracing (json, written to nowhere).
    #[arg(long)]
    tracing: bool,

    /// Enable metrics (statsd, sent to a local sink).
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = execute() {
        glimmer_engine::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config_path = cli.config;
    let config = Config::get(config_path.as_deref())?;

    let logging::Guard { udp_sink } = logging::init(
        &config,
        logging::Config {
            backtraces: true,
            tracing: cli.tracing,
            metrics: cli.metrics,
        },
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    if let Some(udp_sink) = udp_sink {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))?;

    Ok(())
}
