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
//! Module that enumerates all trials of a sweep.
//!
//! The order of the trials is fully determined by the order of the values in each dimension, such
//! that a sweep interrupted at trial `k` can be resumed by planning again and skipping the first
//! `k` trials.

use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    hash::Hash,
    path::{Path, PathBuf},
    str::FromStr,
};

use itertools::{iproduct, Itertools};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Dimension `{0}` has no values")]
    EmptyDimension(&'static str),
    #[error("Dimension `{dimension}` contains {value} more than once")]
    DuplicateValue {
        dimension: &'static str,
        value: String,
    },
    #[error("Dimension `{dimension}` contains the invalid value {value}")]
    InvalidValue {
        dimension: &'static str,
        value: String,
    },
}

/// Active queue management algorithm installed by the shaping script.
///
/// The textual representation (used on the command line of the shaping script and in directory
/// names) is the name of the corresponding `tc` queueing discipline, or `no_aqm` for a plain
/// shaper without AQM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum AqmVariant {
    NoAqm,
    FqCodel,
    Codel,
    Cake,
    Sfq,
    Pie,
    FqPie,
    Red,
    /// Any other discipline supported by the shaping script.
    Custom(String),
}

impl AqmVariant {
    /// Name of the `tc` queueing discipline expected on the router, or `None` for `NoAqm`.
    pub fn qdisc_kind(&self) -> Option<&str> {
        match self {
            AqmVariant::NoAqm => None,
            AqmVariant::FqCodel => Some("fq_codel"),
            AqmVariant::Codel => Some("codel"),
            AqmVariant::Cake => Some("cake"),
            AqmVariant::Sfq => Some("sfq"),
            AqmVariant::Pie => Some("pie"),
            AqmVariant::FqPie => Some("fq_pie"),
            AqmVariant::Red => Some("red"),
            AqmVariant::Custom(name) => Some(name),
        }
    }

    /// `tc` kinds of all AQM variants known by name.
    pub fn known_kinds() -> [&'static str; 7] {
        ["fq_codel", "codel", "cake", "sfq", "pie", "fq_pie", "red"]
    }
}

impl Display for AqmVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.qdisc_kind().unwrap_or("no_aqm"))
    }
}

impl FromStr for AqmVariant {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "no_aqm" => AqmVariant::NoAqm,
            "fq_codel" => AqmVariant::FqCodel,
            "codel" => AqmVariant::Codel,
            "cake" => AqmVariant::Cake,
            "sfq" => AqmVariant::Sfq,
            "pie" => AqmVariant::Pie,
            "fq_pie" => AqmVariant::FqPie,
            "red" => AqmVariant::Red,
            // the name ends up as a shell argument and a directory name
            other if other.is_empty()
                || !other
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
            {
                return Err(PlanError::InvalidValue {
                    dimension: "aqm_variants",
                    value: format!("{other:?}"),
                })
            }
            other => AqmVariant::Custom(other.to_string()),
        })
    }
}

impl TryFrom<String> for AqmVariant {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AqmVariant> for String {
    fn from(value: AqmVariant) -> Self {
        value.to_string()
    }
}

/// One point in the configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub bandwidth_kbps: u64,
    pub latency_ms: u64,
    pub loss_pct: f64,
    pub aqm_variant: AqmVariant,
    pub interface: String,
}

impl TrialConfig {
    /// Directory name of this configuration: `<interface>_<bandwidth>_<latency>_<loss>_<aqm>`.
    pub fn slug(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.interface, self.bandwidth_kbps, self.latency_ms, self.loss_pct, self.aqm_variant
        )
    }
}

impl Display for TrialConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {} kbps, {} ms, {}% loss, {}",
            self.interface, self.bandwidth_kbps, self.latency_ms, self.loss_pct, self.aqm_variant
        )
    }
}

/// A planned trial. Never modified after planning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trial {
    pub index: usize,
    pub config: TrialConfig,
    pub iteration_count: usize,
    pub output_dir: PathBuf,
}

/// The dimensions spanning the sweep, each one in the order in which it should be traversed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepDimensions {
    pub bandwidths: Vec<u64>,
    pub latencies: Vec<u64>,
    pub losses: Vec<f64>,
    pub aqm_variants: Vec<AqmVariant>,
    pub interfaces: Vec<String>,
}

fn check_dimension<T, K>(
    name: &'static str,
    values: &[T],
    key: impl Fn(&T) -> K,
) -> Result<(), PlanError>
where
    T: std::fmt::Debug,
    K: Eq + Hash,
{
    if values.is_empty() {
        return Err(PlanError::EmptyDimension(name));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = values.iter().find(|v| !seen.insert(key(v))) {
        return Err(PlanError::DuplicateValue {
            dimension: name,
            value: format!("{dup:?}"),
        });
    }
    Ok(())
}

impl SweepDimensions {
    /// Check that every dimension is non-empty and free of duplicates.
    pub fn validate(&self) -> Result<(), PlanError> {
        check_dimension("bandwidths", &self.bandwidths, |x| *x)?;
        check_dimension("latencies", &self.latencies, |x| *x)?;
        check_dimension("losses", &self.losses, |x| OrderedFloat(*x))?;
        check_dimension("aqm_variants", &self.aqm_variants, Clone::clone)?;
        check_dimension("interfaces", &self.interfaces, Clone::clone)?;

        if let Some(bw) = self.bandwidths.iter().find(|bw| **bw == 0) {
            return Err(PlanError::InvalidValue {
                dimension: "bandwidths",
                value: bw.to_string(),
            });
        }
        if let Some(loss) = self
            .losses
            .iter()
            .find(|l| !l.is_finite() || **l < 0.0 || **l > 100.0)
        {
            return Err(PlanError::InvalidValue {
                dimension: "losses",
                value: loss.to_string(),
            });
        }
        if let Some(iface) = self.interfaces.iter().find(|i| {
            i.is_empty()
                || !i
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@'))
        }) {
            return Err(PlanError::InvalidValue {
                dimension: "interfaces",
                value: format!("{iface:?}"),
            });
        }
        Ok(())
    }

    /// Total number of trials in the sweep.
    pub fn num_trials(&self) -> usize {
        self.bandwidths.len()
            * self.latencies.len()
            * self.losses.len()
            * self.aqm_variants.len()
            * self.interfaces.len()
    }

    pub fn max_latency_ms(&self) -> u64 {
        self.latencies.iter().copied().max().unwrap_or_default()
    }
}

/// Enumerate all trials of the sweep, with bandwidth as the outermost and interface as the
/// innermost dimension. The dimensions must have passed [`SweepDimensions::validate`].
pub fn plan(
    dimensions: &SweepDimensions,
    iteration_count: usize,
    output_root: &Path,
) -> Vec<Trial> {
    iproduct!(
        &dimensions.bandwidths,
        &dimensions.latencies,
        &dimensions.losses,
        &dimensions.aqm_variants,
        &dimensions.interfaces
    )
    .enumerate()
    .map(|(index, (bw, lat, loss, aqm, iface))| {
        let config = TrialConfig {
            bandwidth_kbps: *bw,
            latency_ms: *lat,
            loss_pct: *loss,
            aqm_variant: aqm.clone(),
            interface: iface.clone(),
        };
        Trial {
            index,
            output_dir: output_root.join(config.slug()),
            config,
            iteration_count,
        }
    })
    .collect_vec()
}
