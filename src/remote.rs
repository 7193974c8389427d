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
//! Module to execute commands on the router under test.

use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{process::Command, time::timeout};

/// Exit status the OpenSSH client reports if it could not establish the session itself (as
/// opposed to the remote command exiting with an error).
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Cannot connect to {host}: {reason}")]
    Connection { host: String, reason: String },
    #[error("Command {command:?} did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl RemoteError {
    /// Connection errors mean there is no control channel to the router anymore.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result of a single command, either executed on the router or locally by the measurement runner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "sweep_utils::serde::duration_secs")]
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes commands on a fixed remote host.
///
/// Implementations must not retry on their own; whether a timed out command is safe to be sent
/// again is up to the caller.
#[async_trait::async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on the remote host and wait for at most `timeout` for it to complete.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, RemoteError>;

    /// Description of the remote end, used in log messages.
    fn host(&self) -> String;
}

/// Executes commands through the system's OpenSSH client using a fixed identity.
#[derive(Clone, Debug)]
pub struct SshExecutor {
    host: String,
    user: String,
    key: PathBuf,
}

impl SshExecutor {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key: key.into(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Build the `ssh` invocation for `command`. `BatchMode` makes ssh fail instead of prompting
    /// for a password if the key is not accepted.
    fn command(&self, command: &str, timeout: Duration) -> Command {
        let mut ssh = Command::new("ssh");
        ssh.arg("-i")
            .arg(&self.key)
            .args(["-o", "BatchMode=yes"])
            .args([
                "-o".to_string(),
                format!("ConnectTimeout={}", timeout.as_secs().max(1)),
            ])
            .arg(self.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        ssh
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        command: &str,
        max_duration: Duration,
    ) -> Result<ExecutionResult, RemoteError> {
        log::trace!("[ssh {}] executing: {command}", self.destination());
        let start = Instant::now();

        // dropping the future on timeout kills the ssh client
        let output = timeout(max_duration, self.command(command, max_duration).output())
            .await
            .map_err(|_| RemoteError::Timeout {
                command: command.to_string(),
                timeout: max_duration,
            })?
            .map_err(|e| RemoteError::Connection {
                host: self.host.clone(),
                reason: format!("cannot spawn ssh: {e}"),
            })?;

        let result = ExecutionResult {
            command: command.to_string(),
            // killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        };
        log::trace!("[ssh {}] {result:?}", self.destination());

        if result.exit_code == SSH_CONNECTION_FAILURE {
            return Err(RemoteError::Connection {
                host: self.host.clone(),
                reason: result.stderr.trim().to_string(),
            });
        }

        Ok(result)
    }

    fn host(&self) -> String {
        self.destination()
    }
}
