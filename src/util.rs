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

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;

use sweep_utils::other::get_timestamp;

use crate::{config::SweepConfig, sweep::TrialReport};

pub const RESULTS_FILE: &str = "sweep_results.csv";
pub const TRIAL_FILE: &str = "trial.json";

/// Log through `pretty_env_logger` (configured with `RUST_LOG`), without breaking the progress
/// bars drawn on the returned `MultiProgress`.
pub fn init_logging() -> Result<MultiProgress, log::SetLoggerError> {
    let logger = pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .build();
    let level = logger.filter();
    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(level);
    Ok(multi)
}

/// Log according to a log4rs configuration file.
pub fn init_logging_from_file(path: impl AsRef<Path>) -> anyhow::Result<()> {
    log4rs::init_file(path, Default::default())
}

pub fn progress_bar(multi: &MultiProgress, len: usize) -> ProgressBar {
    let bar = multi.add(ProgressBar::new(len as u64));
    bar.set_style(
        ProgressStyle::with_template(
            "[{bar:60}] trial {pos:>4}/{len:4}, elapsed: {elapsed}, eta: {eta} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-"),
    );
    bar
}

#[derive(Debug, thiserror::Error)]
pub enum ResultsError {
    #[error("Cannot write {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot write results: {0}")]
    Csv(#[from] csv::Error),
    #[error("Cannot serialize {0}")]
    Json(#[from] serde_json::Error),
}

/// Stores the outcome of every trial: `trial.json` in the trial directory, and one row in the
/// sweep-wide results file in the output root. Rows are flushed after every trial, so they
/// survive a crash of the controller.
pub struct ResultsWriter {
    path: PathBuf,
    csv: csv::Writer<File>,
}

impl ResultsWriter {
    /// Open the results file of `output_root`, appending to an existing one.
    pub fn open(output_root: impl AsRef<Path>) -> Result<Self, ResultsError> {
        let output_root = output_root.as_ref();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ResultsError::Io { path, source }
        };
        fs::create_dir_all(output_root).map_err(io_err(output_root))?;

        let path = output_root.join(RESULTS_FILE);
        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let csv = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        Ok(Self { path, csv })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, report: &TrialReport) -> Result<(), ResultsError> {
        fs::create_dir_all(&report.output_dir).map_err(|source| ResultsError::Io {
            path: report.output_dir.clone(),
            source,
        })?;
        let trial_path = report.output_dir.join(TRIAL_FILE);
        fs::write(&trial_path, serde_json::to_string_pretty(report)?).map_err(|source| {
            ResultsError::Io {
                path: trial_path.clone(),
                source,
            }
        })?;

        self.csv.serialize(report.record())?;
        self.csv.flush().map_err(|source| ResultsError::Io {
            path: self.path.clone(),
            source,
        })?;
        log::debug!("[results] trial {} stored in {trial_path:?}", report.index);
        Ok(())
    }
}

/// Store the effective configuration as `sweep_config_<timestamp>.json` in the output root.
pub fn write_config_snapshot(config: &SweepConfig) -> Result<PathBuf, ResultsError> {
    let root = &config.output_root;
    fs::create_dir_all(root).map_err(|source| ResultsError::Io {
        path: root.clone(),
        source,
    })?;
    let path = root.join(format!("sweep_config_{}.json", get_timestamp()));
    fs::write(&path, serde_json::to_string_pretty(config)?).map_err(|source| {
        ResultsError::Io {
            path: path.clone(),
            source,
        }
    })?;
    Ok(path)
}
