//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use batcher_service::config::Config;
use batcher_service::metrics;

use crate::{inspect, logging, stress};

/// Batcher commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Print the usage counters and cached entries found in the snapshot directory.
    Inspect,

    /// Drive a scheduler with synthetic workloads and report throughput and latencies.
    Stress {
        /// Path to the workload definition file.
        #[arg(long, short, value_name = "FILE")]
        workloads: PathBuf,

        /// Duration of the stress test, for example `30s`.
        #[arg(long, short, value_parser = humantime::parse_duration)]
        duration: Duration,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so there are no other threads.
    unsafe { logging::init_logging(&config.logging) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("batcher-worker")
        .enable_all()
        .build()
        .context("failed to create the tokio runtime")?;

    match cli.command {
        Command::Inspect => {
            runtime.block_on(inspect::inspect(&config)).context("failed to inspect snapshots")?
        }
        Command::Stress {
            workloads,
            duration,
        } => {
            let workloads = stress::WorkloadsConfig::from_path(&workloads)?;
            runtime
                .block_on(stress::perform_stresstest(config, workloads, duration))
                .context("stress test failed")?
        }
    }

    Ok(())
}
