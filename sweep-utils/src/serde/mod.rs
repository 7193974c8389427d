//! Utility module for serde of types.

pub mod duration_secs;

use serde::{Deserialize, Serialize};

/// Struct used to (de-)serialize the summary of a single trial, as appended to the sweep-wide
/// `sweep_results.csv`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TrialRecord {
    /// Position of the trial in the sweep, usable as `--start-index` to resume.
    pub index: usize,
    /// Human-readable formatted timestamp when the trial was started
    pub started: String,
    pub interface: String,
    pub bandwidth_kbps: u64,
    pub latency_ms: u64,
    pub loss_pct: f64,
    pub aqm_variant: String,
    /// Final state of the trial (`done` or `error`)
    pub state: String,
    /// Whether the requested discipline was observed on the router
    pub verified: bool,
    /// Discipline reported by the router after applying the shaping, if any
    #[serde(deserialize_with = "csv::invalid_option")]
    pub observed_qdisc: Option<String>,
    /// Whether the router reported a clean interface after teardown
    pub cleared: bool,
    pub iterations_ok: usize,
    pub iterations_failed: usize,
    /// Overall duration of the trial including shaping and teardown, in seconds
    pub duration: f64,
    /// Name of the trial directory relative to the output root
    pub output_dir: String,
    /// Error message of a trial-level failure
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub error: Option<String>,
}
