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
//! Module that executes all trials of a sweep on the router, one after the other.
//!
//! Each trial goes through the following states:
//!
//! ```text
//! Pending -> ShapingApplied -> ShapingVerified -> Measuring -> TeardownIssued -> TeardownVerified -> Done
//! ```
//!
//! Any failure moves the trial to `Error`. No matter where a trial fails, the shaping is torn down
//! before the next trial starts, such that the router is never left shaped across a trial
//! boundary. Only a lost connection to the router stops the sweep on its own; what happens after
//! other trial failures is decided by the [`FailurePolicy`].

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use indicatif::ProgressBar;
use itertools::Itertools;
use serde::Serialize;
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

use sweep_utils::{other::get_timestamp, serde::TrialRecord};

use crate::{
    config::{FailurePolicy, SweepConfig},
    measurement::{create_artifact, MeasurementError, MeasurementRunner, MeasurementTool},
    planner::{Trial, TrialConfig},
    remote::RemoteExecutor,
    shaping::{RemoteState, ShapingController, ShapingError, ShapingStep},
    util::ResultsWriter,
};

/// Flag to request stopping the sweep, e.g. set by the Ctrl-C handler. It is checked between
/// trials and between the measurement iterations of a trial.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrialState {
    Pending,
    ShapingApplied,
    ShapingVerified,
    Measuring,
    TeardownIssued,
    TeardownVerified,
    Done,
    Error,
}

/// Outcome of comparing the router state with the requested AQM variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    NotRun,
    Verified {
        observed: Option<String>,
    },
    /// The router reported a different discipline, even after re-checking. Measurements of this
    /// trial are unverified.
    Mismatch {
        expected: String,
        observed: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub artifact: Option<PathBuf>,
    pub error: Option<String>,
    #[serde(with = "sweep_utils::serde::duration_secs")]
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialFailure {
    pub step: ShapingStep,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownRecord {
    /// Number of times the stop command was issued for this trial.
    pub attempts: usize,
    /// Whether the interface was found clean afterwards, if it could be checked.
    pub cleared: Option<bool>,
    pub remaining_qdiscs: Vec<String>,
    pub error: Option<String>,
}

/// Everything that happened during a single trial. Written as `trial.json` into the trial
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialReport {
    pub index: usize,
    pub config: TrialConfig,
    pub output_dir: PathBuf,
    pub started: String,
    pub state: TrialState,
    /// All states the trial went through, in order.
    pub history: Vec<TrialState>,
    pub verification: Verification,
    pub iterations: Vec<IterationRecord>,
    pub teardown: TeardownRecord,
    pub failure: Option<TrialFailure>,
    /// The trial was interrupted before all iterations were run.
    pub cancelled: bool,
    #[serde(with = "sweep_utils::serde::duration_secs")]
    pub duration: Duration,
}

impl TrialReport {
    fn new(trial: &Trial) -> Self {
        Self {
            index: trial.index,
            config: trial.config.clone(),
            output_dir: trial.output_dir.clone(),
            started: get_timestamp(),
            state: TrialState::Pending,
            history: vec![TrialState::Pending],
            verification: Verification::NotRun,
            iterations: Vec::new(),
            teardown: TeardownRecord::default(),
            failure: None,
            cancelled: false,
            duration: Duration::ZERO,
        }
    }

    /// Record the transition to `next`. Once in `Error`, the trial stays there, but the remaining
    /// (teardown) states are still recorded in the history.
    fn advance(&mut self, next: TrialState) {
        log::trace!("[sweep] trial {}: {} -> {next}", self.index, self.state);
        self.history.push(next);
        if self.state != TrialState::Error {
            self.state = next;
        }
    }

    /// Move the trial to `Error`. Only the first failure is kept.
    fn fail(&mut self, error: &ShapingError) {
        log::error!(
            "[sweep] trial {} ({}) failed during {}: {error}",
            self.index,
            self.config,
            error.step()
        );
        if self.failure.is_none() {
            self.failure = Some(TrialFailure {
                step: error.step(),
                error: error.to_string(),
            });
        }
        if self.state != TrialState::Error {
            self.history.push(TrialState::Error);
            self.state = TrialState::Error;
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.verification, Verification::Verified { .. })
    }

    pub fn observed_qdisc(&self) -> Option<&str> {
        match &self.verification {
            Verification::Verified { observed } | Verification::Mismatch { observed, .. } => {
                observed.as_deref()
            }
            Verification::NotRun => None,
        }
    }

    pub fn iterations_ok(&self) -> usize {
        self.iterations.iter().filter(|i| i.error.is_none()).count()
    }

    pub fn iterations_failed(&self) -> usize {
        self.iterations.len() - self.iterations_ok()
    }

    /// Whether the trial went through all states and all its measurements were attempted.
    pub fn is_complete(&self) -> bool {
        self.state == TrialState::Done && !self.cancelled
    }

    /// Summary row for the sweep-wide results file.
    pub fn record(&self) -> TrialRecord {
        TrialRecord {
            index: self.index,
            started: self.started.clone(),
            interface: self.config.interface.clone(),
            bandwidth_kbps: self.config.bandwidth_kbps,
            latency_ms: self.config.latency_ms,
            loss_pct: self.config.loss_pct,
            aqm_variant: self.config.aqm_variant.to_string(),
            state: self.state.to_string(),
            verified: self.is_verified(),
            observed_qdisc: self.observed_qdisc().map(String::from),
            cleared: self.teardown.cleared == Some(true),
            iterations_ok: self.iterations_ok(),
            iterations_failed: self.iterations_failed(),
            duration: self.duration.as_secs_f64(),
            output_dir: self.config.slug(),
            error: self.failure.as_ref().map(|f| f.error.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// All trials were executed (some may have failed under the `skip` policy).
    Completed,
    /// The operator interrupted the sweep.
    Cancelled,
    /// The sweep stopped at trial `index`, either due to the `abort` policy or because the
    /// connection to the router was lost.
    Aborted { index: usize, reason: String },
}

impl SweepOutcome {
    /// Exit code of the controller process after a sweep with this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            SweepOutcome::Completed => 0,
            SweepOutcome::Aborted { .. } => 2,
            SweepOutcome::Cancelled => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub outcome: SweepOutcome,
    pub reports: Vec<TrialReport>,
    /// Index of the last trial that went through all states successfully.
    pub last_completed: Option<usize>,
    /// Index to pass as start index to continue an unfinished sweep.
    pub resume_index: Option<usize>,
}

impl SweepSummary {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, SweepOutcome::Aborted { .. })
    }
}

impl std::fmt::Display for SweepSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let failed = self
            .reports
            .iter()
            .filter(|r| r.state == TrialState::Error)
            .count();
        let unverified = self
            .reports
            .iter()
            .filter(|r| r.state == TrialState::Done && !r.is_verified())
            .count();
        write!(
            f,
            "{:?}: {} trial(s) executed, {} done, {failed} failed, {unverified} unverified, {} failed iteration(s)",
            self.outcome,
            self.reports.len(),
            self.reports.iter().filter(|r| r.is_complete()).count(),
            self.reports.iter().map(|r| r.iterations_failed()).sum::<usize>(),
        )?;
        if let Some(last) = self.last_completed {
            write!(f, ", last completed trial: {last}")?;
        }
        if let Some(resume) = self.resume_index {
            write!(f, ", resume with start index {resume}")?;
        }
        Ok(())
    }
}

/// Parameters of the executor that do not concern the router.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub target: String,
    pub tool: MeasurementTool,
    pub failure_policy: FailurePolicy,
    pub measurement_timeout: Duration,
    pub settle_delay: Duration,
    pub verify_retry_delay: Duration,
}

impl From<&SweepConfig> for ExecutorSettings {
    fn from(config: &SweepConfig) -> Self {
        Self {
            target: config.target_endpoint.clone(),
            tool: config.tool.clone(),
            failure_policy: config.failure_policy,
            measurement_timeout: config.measurement_timeout(),
            settle_delay: config.settle_delay,
            verify_retry_delay: config.verify_retry_delay,
        }
    }
}

/// Runs all trials sequentially. It is the only writer of the router's qdisc configuration while
/// the sweep is running.
pub struct SweepExecutor<E, M> {
    shaping: ShapingController<E>,
    runner: M,
    settings: ExecutorSettings,
    cancel: Cancellation,
    results: Option<ResultsWriter>,
    progress: Option<ProgressBar>,
}

impl<E: RemoteExecutor, M: MeasurementRunner> SweepExecutor<E, M> {
    pub fn new(
        shaping: ShapingController<E>,
        runner: M,
        settings: ExecutorSettings,
        cancel: Cancellation,
    ) -> Self {
        Self {
            shaping,
            runner,
            settings,
            cancel,
            results: None,
            progress: None,
        }
    }

    /// Persist every trial report (`trial.json` and a row in the results CSV).
    pub fn with_results(mut self, results: ResultsWriter) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run all trials with `index >= start_index`, in order.
    pub async fn run(&mut self, trials: &[Trial], start_index: usize) -> SweepSummary {
        let remaining = trials
            .iter()
            .filter(|t| t.index >= start_index)
            .collect_vec();
        if start_index > 0 {
            log::info!(
                "[sweep] resuming at trial {start_index}, skipping {} trial(s)",
                trials.len() - remaining.len()
            );
        }
        if let Some(pb) = &self.progress {
            pb.set_length(remaining.len() as u64);
        }

        let mut summary = SweepSummary {
            outcome: SweepOutcome::Completed,
            reports: Vec::with_capacity(remaining.len()),
            last_completed: None,
            resume_index: None,
        };

        for trial in remaining {
            if self.cancel.is_cancelled() {
                log::warn!("[sweep] cancelled before trial {}", trial.index);
                summary.outcome = SweepOutcome::Cancelled;
                summary.resume_index = Some(trial.index);
                break;
            }
            if let Some(pb) = &self.progress {
                pb.set_message(trial.config.slug());
            }

            let (report, fatal) = self.run_trial(trial).await;
            self.persist(&report);
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }

            if report.is_complete() {
                summary.last_completed = Some(trial.index);
            }
            let failed = report.state == TrialState::Error;
            let cancelled = report.cancelled;
            let failure = report.failure.clone();
            summary.reports.push(report);

            if let Some(error) = fatal {
                log::error!("[sweep] lost control over the router, stopping the sweep: {error}");
                summary.outcome = SweepOutcome::Aborted {
                    index: trial.index,
                    reason: error.to_string(),
                };
                summary.resume_index = Some(trial.index);
                break;
            }
            if failed && self.settings.failure_policy == FailurePolicy::Abort {
                summary.outcome = SweepOutcome::Aborted {
                    index: trial.index,
                    reason: failure.map(|f| f.error).unwrap_or_default(),
                };
                summary.resume_index = Some(trial.index);
                break;
            }
            if cancelled {
                summary.outcome = SweepOutcome::Cancelled;
                summary.resume_index = Some(trial.index);
                break;
            }
        }

        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        summary
    }

    /// Execute a single trial. Returns the report and the error that makes continuing impossible,
    /// if any.
    async fn run_trial(&self, trial: &Trial) -> (TrialReport, Option<ShapingError>) {
        let start = Instant::now();
        let mut report = TrialReport::new(trial);
        let iface = trial.config.interface.as_str();
        let mut fatal = None;
        log::info!("[sweep] trial {}: {}", trial.index, trial.config);

        let applied = match self.shaping.apply(iface, &trial.config).await {
            Ok(()) => {
                report.advance(TrialState::ShapingApplied);
                if let Err(e) = self.verify_and_measure(trial, &mut report).await {
                    report.fail(&e);
                    fatal = e.is_fatal().then_some(e);
                }
                true
            }
            Err(e) => {
                report.fail(&e);
                fatal = e.is_fatal().then_some(e);
                false
            }
        };

        // the shaping is removed on every path, even if it was (seemingly) never applied
        match self.teardown(trial, &mut report).await {
            Ok(()) => {}
            Err(e) if !applied => {
                log::warn!(
                    "[sweep] trial {}: forced teardown after failed apply did not succeed: {e}",
                    trial.index
                );
                report.teardown.error = Some(e.to_string());
                if fatal.is_none() && e.is_fatal() {
                    fatal = Some(e);
                }
            }
            Err(e) => {
                report.teardown.error = Some(e.to_string());
                report.fail(&e);
                if fatal.is_none() && e.is_fatal() {
                    fatal = Some(e);
                }
            }
        }

        report.advance(TrialState::Done);
        report.duration = start.elapsed();
        log::info!(
            "[sweep] trial {} finished as {} after {:.1?} ({} of {} iteration(s) ok{})",
            trial.index,
            report.state,
            report.duration,
            report.iterations_ok(),
            trial.iteration_count,
            if report.is_verified() { "" } else { ", unverified" },
        );
        (report, fatal)
    }

    async fn verify_and_measure(
        &self,
        trial: &Trial,
        report: &mut TrialReport,
    ) -> Result<(), ShapingError> {
        tokio::time::sleep(self.settings.settle_delay).await;
        report.verification = self.verify(trial).await?;
        report.advance(TrialState::ShapingVerified);
        self.measure(trial, report).await;
        Ok(())
    }

    /// Check that the requested discipline is active, re-checking once after a short delay as the
    /// router may report the new state with some lag.
    async fn verify(&self, trial: &Trial) -> Result<Verification, ShapingError> {
        let iface = trial.config.interface.as_str();
        let expected = &trial.config.aqm_variant;

        let state = self.shaping.verify(iface).await?;
        if state.matches(expected) {
            return Ok(Verification::Verified {
                observed: state.active_qdisc,
            });
        }
        log::debug!(
            "[sweep] trial {}: expected {expected}, router reports {:?}. Checking again in {:?}",
            trial.index,
            state.active_qdisc,
            self.settings.verify_retry_delay
        );

        tokio::time::sleep(self.settings.verify_retry_delay).await;
        let state = self.shaping.verify(iface).await?;
        if state.matches(expected) {
            return Ok(Verification::Verified {
                observed: state.active_qdisc,
            });
        }

        log::warn!(
            "[sweep] trial {}: verification mismatch on {iface}: requested {expected}, observed {}. Measurements are tagged as unverified.",
            trial.index,
            state.active_qdisc.as_deref().unwrap_or("none"),
        );
        Ok(Verification::Mismatch {
            expected: expected.to_string(),
            observed: state.active_qdisc,
        })
    }

    /// Run all iterations of a trial one after the other. Failed iterations are skipped.
    async fn measure(&self, trial: &Trial, report: &mut TrialReport) {
        report.advance(TrialState::Measuring);
        let tool = &self.settings.tool;

        for iteration in 0..trial.iteration_count {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "[sweep] trial {}: cancelled after {iteration} of {} iteration(s)",
                    trial.index,
                    trial.iteration_count
                );
                report.cancelled = true;
                break;
            }
            log::info!(
                "[sweep] trial {}: iteration {}/{}",
                trial.index,
                iteration + 1,
                trial.iteration_count
            );

            let start = Instant::now();
            let (path, file) =
                match create_artifact(&trial.output_dir, tool.name(), tool.extension()) {
                    Ok(created) => created,
                    Err(e) => {
                        log::warn!(
                            "[sweep] trial {} ({}): skipping iteration {iteration}: {e}",
                            trial.index,
                            trial.config
                        );
                        report.iterations.push(IterationRecord {
                            iteration,
                            artifact: None,
                            error: Some(e.to_string()),
                            duration: start.elapsed(),
                        });
                        continue;
                    }
                };

            let run = self.runner.run(&self.settings.target, tool, &path, file);
            let outcome = match timeout(self.settings.measurement_timeout, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(MeasurementError::TimedOut {
                    tool: tool.name().to_string(),
                    timeout: self.settings.measurement_timeout,
                }),
            };

            // failed runs keep their (partial) artifact
            let error = match outcome {
                Ok(_) => None,
                Err(e) => {
                    log::warn!(
                        "[sweep] trial {} ({}): skipping iteration {iteration}: {e} (output in {path:?})",
                        trial.index,
                        trial.config
                    );
                    Some(e.to_string())
                }
            };
            let record = IterationRecord {
                iteration,
                artifact: Some(path),
                error,
                duration: start.elapsed(),
            };
            report.iterations.push(record);
        }
    }

    /// Stop the shaping and check that the interface is clean again.
    async fn teardown(&self, trial: &Trial, report: &mut TrialReport) -> Result<(), ShapingError> {
        let iface = trial.config.interface.as_str();

        report.teardown.attempts += 1;
        self.shaping.teardown(iface, &trial.config).await?;
        report.advance(TrialState::TeardownIssued);

        tokio::time::sleep(self.settings.settle_delay).await;
        let mut state = self.shaping.verify_clear(iface).await?;
        if !state.is_clear() {
            tokio::time::sleep(self.settings.verify_retry_delay).await;
            state = self.shaping.verify_clear(iface).await?;
        }

        report.teardown.cleared = Some(state.is_clear());
        report.teardown.remaining_qdiscs = state.qdiscs.iter().map(|q| q.kind.clone()).collect();
        if !state.is_clear() {
            return Err(ShapingError::NotCleared {
                iface: iface.to_string(),
                qdiscs: report.teardown.remaining_qdiscs.clone(),
                link_up: state.link_up,
            });
        }
        report.advance(TrialState::TeardownVerified);
        Ok(())
    }

    fn persist(&mut self, report: &TrialReport) {
        if let Some(results) = self.results.as_mut() {
            if let Err(e) = results.write(report) {
                log::error!("[sweep] cannot store results of trial {}: {e}", report.index);
            }
        }
    }
}

/// Periodically logs the qdiscs of the given interfaces. Only ever reads from the router.
pub struct StatusPoller {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Vec<RemoteState>>,
}

impl StatusPoller {
    pub fn spawn<E: RemoteExecutor + 'static>(
        shaping: ShapingController<E>,
        interfaces: Vec<String>,
        interval: Duration,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last = Vec::new();
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        last.clear();
                        for iface in &interfaces {
                            match shaping.verify(iface).await {
                                Ok(state) => {
                                    log::debug!("[status] {iface}: {:?}", state.qdiscs.iter().map(|q| &q.kind).collect_vec());
                                    last.push(state);
                                }
                                Err(e) => log::debug!("[status] {iface}: {e}"),
                            }
                        }
                    }
                }
            }
            last
        });
        Self { stop, handle }
    }

    /// Stop polling and return the most recently observed states.
    pub async fn stop(self) -> Vec<RemoteState> {
        let _ = self.stop.send(());
        self.handle.await.unwrap_or_default()
    }
}

/// Directory of a trial relative to the output root, as shown to the user.
pub fn display_trial(trial: &Trial, output_root: &Path) -> String {
    let dir = trial
        .output_dir
        .strip_prefix(output_root)
        .unwrap_or(&trial.output_dir);
    format!("{:>5}  {}", trial.index, dir.display())
}
