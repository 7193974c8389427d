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
//! Configuration of a sweep, deserialized from a JSON file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    measurement::MeasurementTool,
    planner::{AqmVariant, PlanError, SweepDimensions},
    shaping::BandwidthUnit,
};

/// Environment variable used for the ssh identity if the configuration does not name one.
pub const KEY_PATH_VAR: &str = "KEY_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("No ssh key configured. Set `key_reference` or the KEY_PATH environment variable to the path of the private key file.")]
    MissingKey,
    #[error("The ssh key {0:?} does not exist")]
    KeyNotFound(PathBuf),
    #[error("Invalid sweep dimensions: {0}")]
    Plan(#[from] PlanError),
    #[error("`iterations_per_trial` must be at least 1")]
    NoIterations,
    #[error("Bandwidth {bandwidth_kbps} kbps cannot be passed to the shaping script in {unit:?}")]
    InexactBandwidth { bandwidth_kbps: u64, unit: BandwidthUnit },
}

/// What to do with the rest of the sweep once a trial failed (e.g. the shaping command was
/// rejected by the router).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    clap::ValueEnum,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the sweep after tearing down the failed trial.
    Abort,
    /// Tear down the failed trial and continue with the next one.
    #[default]
    Skip,
}

/// All options of a sweep. Every field has a default, such that a configuration file only needs
/// to list what differs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    /// Bandwidth limits in kbit/s.
    pub bandwidths: Vec<u64>,
    /// Added one-way latencies in milliseconds.
    pub latencies: Vec<u64>,
    /// Packet loss in percent.
    pub losses: Vec<f64>,
    pub aqm_variants: Vec<AqmVariant>,
    /// Interfaces on the router to shape, e.g. `lan3` for downloads and `eth2` for uploads.
    pub interfaces: Vec<String>,
    /// Number of measurements per configuration.
    pub iterations_per_trial: usize,
    /// Root directory for all measurement artifacts.
    pub output_root: PathBuf,
    pub remote_host: String,
    pub remote_user: String,
    /// Path to the ssh private key. Falls back to `$KEY_PATH`.
    pub key_reference: Option<PathBuf>,
    /// Upper bound for every command on the router.
    #[serde(with = "sweep_utils::serde::duration_secs")]
    pub command_timeout: Duration,
    /// Path of the shaping script on the router.
    pub shaper_script: String,
    /// Unit in which the shaping script expects the bandwidth.
    pub shaper_bandwidth_unit: BandwidthUnit,
    /// Disciplines present on an interface without any shaping.
    pub baseline_qdiscs: Vec<String>,
    /// Measurement server, as `host` or `host:port`.
    pub target_endpoint: String,
    pub tool: MeasurementTool,
    /// Upper bound for a single measurement. Derived from the sweep if not set.
    #[serde(with = "sweep_utils::serde::duration_secs::in_option")]
    pub measurement_timeout: Option<Duration>,
    /// Time to wait after applying or removing the shaping before checking the router.
    #[serde(with = "sweep_utils::serde::duration_secs")]
    pub settle_delay: Duration,
    /// Time to wait before checking the router a second time after a mismatch.
    #[serde(with = "sweep_utils::serde::duration_secs")]
    pub verify_retry_delay: Duration,
    pub failure_policy: FailurePolicy,
    /// Log the queueing disciplines of all interfaces periodically (read-only).
    #[serde(with = "sweep_utils::serde::duration_secs::in_option")]
    pub status_poll_interval: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            bandwidths: (1..=9).map(|x| x * 100_000).collect(),
            latencies: vec![10],
            losses: vec![0.0],
            aqm_variants: vec![
                AqmVariant::NoAqm,
                AqmVariant::FqCodel,
                AqmVariant::Codel,
                AqmVariant::Sfq,
            ],
            interfaces: vec!["lan3".to_string()],
            iterations_per_trial: 10,
            output_root: PathBuf::from("data"),
            remote_host: "192.168.1.1".to_string(),
            remote_user: "root".to_string(),
            key_reference: None,
            command_timeout: Duration::from_secs(30),
            shaper_script: "/root/aqm_shaper_nonetem.sh".to_string(),
            shaper_bandwidth_unit: BandwidthUnit::Kbps,
            baseline_qdiscs: ["noqueue", "pfifo_fast", "mq"]
                .map(String::from)
                .to_vec(),
            target_endpoint: "192.168.1.166:443".to_string(),
            tool: MeasurementTool::default(),
            measurement_timeout: None,
            settle_delay: Duration::from_secs(1),
            verify_retry_delay: Duration::from_secs(2),
            failure_policy: FailurePolicy::Skip,
            status_poll_interval: None,
        }
    }
}

impl SweepConfig {
    /// Read the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn dimensions(&self) -> SweepDimensions {
        SweepDimensions {
            bandwidths: self.bandwidths.clone(),
            latencies: self.latencies.clone(),
            losses: self.losses.clone(),
            aqm_variants: self.aqm_variants.clone(),
            interfaces: self.interfaces.clone(),
        }
    }

    /// Check everything that can be checked without contacting the router.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dimensions().validate()?;
        if self.iterations_per_trial == 0 {
            return Err(ConfigError::NoIterations);
        }
        let unit = self.shaper_bandwidth_unit;
        if let Some(&bandwidth_kbps) = self.bandwidths.iter().find(|b| !unit.is_exact(**b)) {
            return Err(ConfigError::InexactBandwidth {
                bandwidth_kbps,
                unit,
            });
        }
        Ok(())
    }

    /// Resolve the ssh key from the configuration or from `lookup(KEY_PATH)`. A missing key is
    /// fatal, as nothing can be done on the router without it.
    pub fn resolve_key(
        &mut self,
        lookup: impl FnOnce(&str) -> Option<String>,
    ) -> Result<&Path, ConfigError> {
        if self.key_reference.is_none() {
            self.key_reference = lookup(KEY_PATH_VAR)
                .filter(|k| !k.trim().is_empty())
                .map(PathBuf::from);
        }
        let key = self.key_reference.as_deref().ok_or(ConfigError::MissingKey)?;
        if !key.is_file() {
            return Err(ConfigError::KeyNotFound(key.to_path_buf()));
        }
        Ok(key)
    }

    /// Upper bound for a single measurement run. Unless configured explicitly, this is twice the
    /// nominal duration of the tool plus 30 seconds for connection setup, and the time the slowest
    /// configured link needs for 100 times the largest bandwidth-delay product of the sweep. With a
    /// single bandwidth, the latter is 100 round trips of the largest latency.
    pub fn measurement_timeout(&self) -> Duration {
        self.measurement_timeout.unwrap_or_else(|| {
            let max_latency = self.latencies.iter().copied().max().unwrap_or_default();
            let max_bandwidth = self.bandwidths.iter().copied().max().unwrap_or_default();
            let min_bandwidth = self.bandwidths.iter().copied().min().unwrap_or(1).max(1);
            let max_bdp = max_bandwidth.saturating_mul(max_latency);
            self.tool.expected_duration() * 2
                + Duration::from_secs(30)
                + Duration::from_millis(100u64.saturating_mul(max_bdp) / min_bandwidth)
        })
    }
}
