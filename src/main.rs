// AQM Sweep: Controlled Throughput Experiments over Remotely Shaped Router Queues
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;

use aqm_sweep::{
    config::{FailurePolicy, SweepConfig},
    measurement::ProcessRunner,
    planner::plan,
    remote::SshExecutor,
    shaping::ShapingController,
    sweep::{
        display_trial, Cancellation, ExecutorSettings, StatusPoller, SweepExecutor, SweepOutcome,
    },
    util::{self, ResultsWriter},
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// JSON configuration of the sweep. Without it, the built-in defaults are used.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Index of the first trial to execute, e.g. to continue an interrupted sweep.
    #[arg(short, long, default_value_t = 0)]
    start_index: usize,
    /// Overwrite what happens after a failed trial.
    #[arg(short, long)]
    failure_policy: Option<FailurePolicy>,
    /// Overwrite the number of measurements per trial.
    #[arg(short = 'n', long)]
    iterations: Option<usize>,
    /// Overwrite the root directory for the measurement artifacts.
    #[arg(short, long)]
    output_root: Option<PathBuf>,
    /// Only print the planned trials, without contacting the router.
    #[arg(long)]
    dry_run: bool,
    /// Configure logging with a log4rs file instead of `RUST_LOG`.
    #[arg(long)]
    log_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let multi = match &args.log_config {
        Some(path) => util::init_logging_from_file(path)
            .map(|_| None)
            .map_err(|e| e.to_string()),
        None => util::init_logging().map(Some).map_err(|e| e.to_string()),
    };
    let multi = match multi {
        Ok(multi) => multi,
        Err(e) => {
            eprintln!("Cannot initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    match run(args, multi).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<SweepConfig> {
    let mut config = match &args.config {
        Some(path) => SweepConfig::from_file(path)?,
        None => SweepConfig::default(),
    };
    if let Some(policy) = args.failure_policy {
        config.failure_policy = policy;
    }
    if let Some(iterations) = args.iterations {
        config.iterations_per_trial = iterations;
    }
    if let Some(root) = &args.output_root {
        config.output_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args, multi: Option<indicatif::MultiProgress>) -> anyhow::Result<ExitCode> {
    let mut config = load_config(&args)?;
    let trials = plan(
        &config.dimensions(),
        config.iterations_per_trial,
        &config.output_root,
    );
    if args.start_index >= trials.len() {
        anyhow::bail!(
            "Start index {} is out of range, the sweep has {} trials",
            args.start_index,
            trials.len()
        );
    }

    if args.dry_run {
        for trial in &trials[args.start_index..] {
            println!(
                "{}  {}",
                display_trial(trial, &config.output_root),
                trial.config
            );
        }
        println!(
            "{} of {} trials with {} iteration(s) each",
            trials.len() - args.start_index,
            trials.len(),
            config.iterations_per_trial
        );
        return Ok(ExitCode::SUCCESS);
    }

    let key = config
        .resolve_key(|var| std::env::var(var).ok())?
        .to_path_buf();
    log::info!(
        "Sweep of {} trials on {}@{} (failure policy: {}, measurement timeout: {:?})",
        trials.len(),
        config.remote_user,
        config.remote_host,
        config.failure_policy,
        config.measurement_timeout(),
    );

    let snapshot = util::write_config_snapshot(&config).context("storing the configuration")?;
    log::info!("Configuration stored in {snapshot:?}");
    let results = ResultsWriter::open(&config.output_root).context("opening the results file")?;

    let executor = Arc::new(SshExecutor::new(
        &config.remote_host,
        &config.remote_user,
        key,
    ));
    let shaping = ShapingController::new(
        executor,
        &config.shaper_script,
        config.shaper_bandwidth_unit,
        config.command_timeout,
        config.baseline_qdiscs.clone(),
    );

    let cancel = Cancellation::default();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if cancel.is_cancelled() {
                    log::warn!("Still cleaning up the current trial, please wait.");
                } else {
                    log::warn!("Stopping after the current measurement. The router is cleaned up before exiting.");
                    cancel.cancel();
                }
            }
        });
    }

    let poller = config.status_poll_interval.map(|interval| {
        StatusPoller::spawn(shaping.clone(), config.interfaces.clone(), interval)
    });

    let mut sweep = SweepExecutor::new(
        shaping,
        ProcessRunner,
        ExecutorSettings::from(&config),
        cancel,
    )
    .with_results(results);
    if let Some(multi) = &multi {
        sweep = sweep.with_progress(util::progress_bar(multi, trials.len()));
    }

    let summary = sweep.run(&trials, args.start_index).await;

    if let Some(poller) = poller {
        poller.stop().await;
    }

    log::info!("{summary}");
    match &summary.outcome {
        SweepOutcome::Completed => {}
        SweepOutcome::Cancelled => {
            if let Some(resume) = summary.resume_index {
                log::warn!("Sweep cancelled. Continue with `--start-index {resume}`");
            }
        }
        SweepOutcome::Aborted { index, reason } => {
            log::error!("Sweep aborted at trial {index}: {reason}");
            if let Some(resume) = summary.resume_index {
                log::error!("Continue with `--start-index {resume}`");
            }
        }
    }
    Ok(ExitCode::from(summary.outcome.exit_code()))
}
