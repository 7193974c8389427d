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
//! Scenario tests of the sweep executor against a simulated router and measurement tool.
//!
//! Use the following commands to see the log output:
//!
//! ```shell
//! RUST_LOG=debug cargo test -- --nocapture --test-threads 1
//! ```

use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::Write,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    config::FailurePolicy,
    measurement::{Artifact, MeasurementError, MeasurementRunner, MeasurementTool},
    planner::{AqmVariant, SweepDimensions},
    remote::{ExecutionResult, RemoteError, RemoteExecutor},
    shaping::{BandwidthUnit, ShapingController},
    sweep::{Cancellation, ExecutorSettings, SweepExecutor},
};


/// Ordered log of everything that happened on the router and on the measurement host.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Misbehavior of the router for a matching command.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Exit with the given code without doing anything.
    Reject(i32),
    Timeout,
    Connection,
    /// Succeed with the given output without doing anything.
    Output(String),
    /// Succeed without doing anything.
    Ignore,
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Injection {
    matches: Predicate,
    fault: Fault,
    remaining: usize,
}

#[derive(Default)]
struct RouterState {
    /// qdisc kind installed below the shaper, per interface
    shaped: HashMap<String, String>,
    commands: Vec<String>,
    injections: Vec<Injection>,
}

/// Simulates the shaping script and `tc` on the router.
#[derive(Default)]
pub struct FakeRouter {
    state: Mutex<RouterState>,
    events: Option<EventLog>,
}

impl FakeRouter {
    pub fn with_events(events: EventLog) -> Self {
        Self {
            state: Default::default(),
            events: Some(events),
        }
    }

    /// Make the next `count` commands matching `matches` fail with `fault`.
    pub fn inject(
        &self,
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        fault: Fault,
        count: usize,
    ) {
        self.state.lock().unwrap().injections.push(Injection {
            matches: Box::new(matches),
            fault,
            remaining: count,
        });
    }

    /// Number of commands (including the failed ones) matching `matches`.
    pub fn count(&self, matches: impl Fn(&str) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| matches(c.as_str()))
            .count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn is_shaped(&self, iface: &str) -> bool {
        self.state.lock().unwrap().shaped.contains_key(iface)
    }

    fn qdisc_output(&self, iface: &str) -> String {
        match self.state.lock().unwrap().shaped.get(iface) {
            Some(kind) => format!(
                "qdisc htb 1: root refcnt 2 r2q 10 default 0x10 direct_packets_stat 0 direct_qlen 1000\n\
                 qdisc {kind} 8001: parent 1:10 limit 1000p\n"
            ),
            None => "qdisc noqueue 0: root refcnt 2\n".to_string(),
        }
    }

    fn handle(&self, command: &str) -> (i32, String, String) {
        let words = command.split_whitespace().collect::<Vec<_>>();
        match words.as_slice() {
            ["tc", "qdisc", "show", "dev", iface] => (0, self.qdisc_output(iface), String::new()),
            ["ip", "link", "show", "dev", iface] => (
                0,
                format!("7: {iface}@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default qlen 1000\n"),
                String::new(),
            ),
            [_, "start", iface, _, _, _, aqm] => {
                let kind = match *aqm {
                    "no_aqm" => "pfifo",
                    kind => kind,
                };
                self.state
                    .lock()
                    .unwrap()
                    .shaped
                    .insert(iface.to_string(), kind.to_string());
                (0, String::new(), String::new())
            }
            [_, "stop", iface, ..] => {
                self.state.lock().unwrap().shaped.remove(*iface);
                (0, String::new(), String::new())
            }
            _ => (127, String::new(), format!("sh: {}: not found", words[0])),
        }
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for FakeRouter {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, RemoteError> {
        if let Some(events) = &self.events {
            events.lock().unwrap().push(format!("router: {command}"));
        }
        let fault = {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command.to_string());
            state
                .injections
                .iter_mut()
                .find(|i| i.remaining > 0 && (i.matches)(command))
                .map(|i| {
                    i.remaining -= 1;
                    i.fault.clone()
                })
        };

        let (exit_code, stdout, stderr) = match fault {
            None => self.handle(command),
            Some(Fault::Timeout) => {
                return Err(RemoteError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
            Some(Fault::Connection) => {
                return Err(RemoteError::Connection {
                    host: self.host(),
                    reason: "Connection refused".to_string(),
                })
            }
            Some(Fault::Reject(code)) => (code, String::new(), "simulated failure".to_string()),
            Some(Fault::Output(out)) => (0, out, String::new()),
            Some(Fault::Ignore) => (0, String::new(), String::new()),
        };
        Ok(ExecutionResult {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            duration: Duration::from_millis(1),
        })
    }

    fn host(&self) -> String {
        "root@fake-router".to_string()
    }
}

/// Clears the `running` flag even if the measurement future is dropped.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Simulates a measurement tool. Calls are numbered from 0 across all trials.
#[derive(Default)]
pub struct FakeRunner {
    calls: AtomicUsize,
    failing: HashSet<usize>,
    hanging: HashSet<usize>,
    running: AtomicBool,
    overlapped: AtomicBool,
    cancel_at: Option<(usize, Cancellation)>,
    events: Option<EventLog>,
}

impl FakeRunner {
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Let the given calls fail with a non-zero exit code.
    pub fn fail_on(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing.extend(calls);
        self
    }

    /// Let the given calls never finish.
    pub fn hang_on(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.hanging.extend(calls);
        self
    }

    /// Request cancellation while the given call is running.
    pub fn cancel_on(mut self, call: usize, cancel: Cancellation) -> Self {
        self.cancel_at = Some((call, cancel));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether two measurements were ever running at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MeasurementRunner for FakeRunner {
    async fn run(
        &self,
        target: &str,
        tool: &MeasurementTool,
        artifact: &Path,
        mut output: File,
    ) -> Result<Artifact, MeasurementError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.running.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let _running = Running(&self.running);
        if let Some(events) = &self.events {
            events.lock().unwrap().push(format!("measure: {call}"));
        }

        if let Some((_, cancel)) = self.cancel_at.as_ref().filter(|(c, _)| *c == call) {
            cancel.cancel();
        }

        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(2)).await;
        if self.hanging.contains(&call) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let path = artifact.to_path_buf();
        if self.failing.contains(&call) {
            return Err(MeasurementError::Failed {
                tool: tool.name().to_string(),
                exit_code: 1,
                stderr: "iperf3: error - unable to connect to server".to_string(),
                artifact: path,
            });
        }
        writeln!(output, "{{\"target\": \"{target}\", \"call\": {call}}}").map_err(|source| {
            MeasurementError::Io {
                path: path.clone(),
                source,
            }
        })?;

        Ok(Artifact {
            path,
            tool: tool.name().to_string(),
            started: chrono::Local::now().to_rfc3339(),
            result: ExecutionResult {
                command: format!("{} {target}", tool.name()),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: start.elapsed(),
            },
        })
    }
}

pub const SCRIPT: &str = "/root/aqm_shaper_nonetem.sh";

/// Executor settings without any delays.
pub fn settings(failure_policy: FailurePolicy) -> ExecutorSettings {
    ExecutorSettings {
        target: "10.0.0.2:5201".to_string(),
        tool: MeasurementTool::default(),
        failure_policy,
        measurement_timeout: Duration::from_secs(5),
        settle_delay: Duration::ZERO,
        verify_retry_delay: Duration::from_millis(1),
    }
}

pub fn shaping(router: &Arc<FakeRouter>) -> ShapingController<FakeRouter> {
    ShapingController::new(
        router.clone(),
        SCRIPT,
        BandwidthUnit::Kbps,
        Duration::from_secs(1),
        vec!["noqueue".to_string()],
    )
}

pub fn sweep(
    router: &Arc<FakeRouter>,
    runner: &Arc<FakeRunner>,
    settings: ExecutorSettings,
    cancel: Cancellation,
) -> SweepExecutor<FakeRouter, Arc<FakeRunner>> {
    SweepExecutor::new(shaping(router), runner.clone(), settings, cancel)
}

/// Single interface `lan3` without latency or loss.
pub fn dimensions(bandwidths: &[u64], aqm_variants: &[AqmVariant]) -> SweepDimensions {
    SweepDimensions {
        bandwidths: bandwidths.to_vec(),
        latencies: vec![10],
        losses: vec![0.0],
        aqm_variants: aqm_variants.to_vec(),
        interfaces: vec!["lan3".to_string()],
    }
}
