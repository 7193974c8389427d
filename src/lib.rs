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
//! Library for running throughput experiments over a sweep of queueing disciplines configured on a
//! remote router.
//!
//! A sweep is planned as the cartesian product of bandwidths, latencies, losses, AQM variants and
//! interfaces ([`planner`]). Each resulting trial is executed strictly sequentially by the
//! [`sweep::SweepExecutor`]: it applies the shaping on the router ([`shaping`]), verifies that the
//! discipline is actually active, runs the measurement tool a number of times ([`measurement`]),
//! and finally tears the shaping down again. All commands on the router are issued through a
//! [`remote::RemoteExecutor`].

pub mod config;
pub mod measurement;
pub mod planner;
pub mod remote;
pub mod shaping;
pub mod sweep;
pub mod util;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::{
        config::{FailurePolicy, SweepConfig},
        measurement::{Artifact, MeasurementRunner, MeasurementTool, ProcessRunner},
        planner::{plan, AqmVariant, SweepDimensions, Trial, TrialConfig},
        remote::{ExecutionResult, RemoteExecutor, SshExecutor},
        shaping::{RemoteState, ShapingController},
        sweep::{Cancellation, SweepExecutor, SweepOutcome, SweepSummary, TrialReport, TrialState},
    };
}
