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
//! Runs the throughput measurement tool and captures its output into an artifact file.

use std::{
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use sweep_utils::other::get_artifact_timestamp;

use crate::remote::ExecutionResult;

#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("Cannot create artifact in {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with code {exit_code} (output in {artifact:?}): {stderr}")]
    Failed {
        tool: String,
        exit_code: i32,
        stderr: String,
        artifact: PathBuf,
    },
    #[error("{tool} did not finish within {timeout:?}")]
    TimedOut { tool: String, timeout: Duration },
}

/// The measurement tool and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementTool {
    /// `iperf3 -c <host> -P <streams> -t <duration> --json`
    Iperf3 {
        #[serde(default = "default_streams")]
        streams: u32,
        #[serde(default = "default_duration_secs")]
        duration_secs: u64,
        /// Server port, if it differs from the iperf3 default.
        #[serde(default)]
        port: Option<u16>,
    },
    /// `ndt7-client -server <host:port> -format json`
    Ndt7 {
        /// Skip TLS certificate verification, for self-hosted servers.
        #[serde(default)]
        no_verify: bool,
    },
    /// Any other tool. Every `{target}` in `args` is replaced by the target endpoint.
    Custom {
        name: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_duration_secs")]
        duration_secs: u64,
    },
}

const fn default_streams() -> u32 {
    5
}

const fn default_duration_secs() -> u64 {
    10
}

impl Default for MeasurementTool {
    fn default() -> Self {
        MeasurementTool::Iperf3 {
            streams: default_streams(),
            duration_secs: default_duration_secs(),
            port: None,
        }
    }
}

/// Split `host:port` into its parts. A bracketed IPv6 address keeps its brackets stripped.
fn split_endpoint(endpoint: &str) -> (&str, Option<&str>) {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':'));
        }
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (endpoint, None),
    }
}

impl MeasurementTool {
    /// Name used as the prefix of the artifact files.
    pub fn name(&self) -> &str {
        match self {
            MeasurementTool::Iperf3 { .. } => "iperf3",
            MeasurementTool::Ndt7 { .. } => "ndt7",
            MeasurementTool::Custom { name, .. } => name,
        }
    }

    pub fn extension(&self) -> &'static str {
        "jsonl"
    }

    /// Nominal duration of a single run.
    pub fn expected_duration(&self) -> Duration {
        match self {
            MeasurementTool::Iperf3 { duration_secs, .. }
            | MeasurementTool::Custom { duration_secs, .. } => Duration::from_secs(*duration_secs),
            // download and upload phase of 10 seconds each
            MeasurementTool::Ndt7 { .. } => Duration::from_secs(20),
        }
    }

    /// Program and arguments to measure against `target`.
    pub fn command_line(&self, target: &str) -> (String, Vec<String>) {
        match self {
            MeasurementTool::Iperf3 {
                streams,
                duration_secs,
                port,
            } => {
                let (host, _) = split_endpoint(target);
                let mut args = vec![
                    "-c".to_string(),
                    host.to_string(),
                    "-P".to_string(),
                    streams.to_string(),
                    "-t".to_string(),
                    duration_secs.to_string(),
                    "--json".to_string(),
                ];
                if let Some(port) = port {
                    args.push("-p".to_string());
                    args.push(port.to_string());
                }
                ("iperf3".to_string(), args)
            }
            MeasurementTool::Ndt7 { no_verify } => {
                let mut args = vec!["-server".to_string(), target.to_string()];
                if *no_verify {
                    args.push("-no-verify".to_string());
                }
                args.push("-format".to_string());
                args.push("json".to_string());
                ("ndt7-client".to_string(), args)
            }
            MeasurementTool::Custom { program, args, .. } => (
                program.clone(),
                args.iter().map(|a| a.replace("{target}", target)).collect(),
            ),
        }
    }
}

/// Output file of a single measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub tool: String,
    /// Wall-clock time when the measurement was started (RFC 3339).
    pub started: String,
    /// The executed command. `stdout` is empty, as it was written to `path`.
    pub result: ExecutionResult,
}

/// Create a new, empty artifact file `<tool>_<timestamp>.<ext>` in `dir`. Existing files are never
/// overwritten; a second artifact within the same second receives a numeric suffix.
pub fn create_artifact(
    dir: &Path,
    tool: &str,
    extension: &str,
) -> Result<(PathBuf, File), MeasurementError> {
    let io_err = |source| MeasurementError::Io {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    let timestamp = get_artifact_timestamp();
    let mut suffix = 0;
    loop {
        let file_name = if suffix == 0 {
            format!("{tool}_{timestamp}.{extension}")
        } else {
            format!("{tool}_{timestamp}_{suffix}.{extension}")
        };
        let path = dir.join(file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(io_err(e)),
        }
    }
}

/// Executes a single measurement.
#[async_trait::async_trait]
pub trait MeasurementRunner: Send + Sync {
    /// Measure against `target` with `tool`, writing the output into `output`, the freshly created
    /// artifact file at `artifact`. The runner does not enforce a timeout itself; dropping the
    /// returned future must stop the measurement.
    async fn run(
        &self,
        target: &str,
        tool: &MeasurementTool,
        artifact: &Path,
        output: File,
    ) -> Result<Artifact, MeasurementError>;
}

#[async_trait::async_trait]
impl<M: MeasurementRunner + ?Sized> MeasurementRunner for Arc<M> {
    async fn run(
        &self,
        target: &str,
        tool: &MeasurementTool,
        artifact: &Path,
        output: File,
    ) -> Result<Artifact, MeasurementError> {
        (**self).run(target, tool, artifact, output).await
    }
}

/// Runs the measurement tool as a local child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl MeasurementRunner for ProcessRunner {
    async fn run(
        &self,
        target: &str,
        tool: &MeasurementTool,
        artifact: &Path,
        output: File,
    ) -> Result<Artifact, MeasurementError> {
        let (program, args) = tool.command_line(target);
        let command = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let path = artifact.to_path_buf();
        let started = chrono::Local::now().to_rfc3339();
        log::debug!("[measure] {command} > {path:?}");

        let start = Instant::now();
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MeasurementError::Spawn {
                program: program.clone(),
                source,
            })?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| MeasurementError::Spawn {
                program: program.clone(),
                source,
            })?;

        let result = ExecutionResult {
            command,
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        };

        if !result.success() {
            return Err(MeasurementError::Failed {
                tool: tool.name().to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
                artifact: path,
            });
        }

        log::debug!("[measure] output saved to {path:?} after {:?}", result.duration);
        Ok(Artifact {
            path,
            tool: tool.name().to_string(),
            started,
            result,
        })
    }
}
