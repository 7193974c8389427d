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
//! Applies, verifies and removes the traffic shaping on an interface of the router.
//!
//! The shaping script accepting a command does not mean that the queueing discipline is actually
//! in place (e.g., the hardware may not support it, or an existing qdisc conflicts). Therefore,
//! applying and verifying are separate steps, and verification always queries the router again.

use std::{sync::Arc, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    planner::{AqmVariant, TrialConfig},
    remote::{ExecutionResult, RemoteError, RemoteExecutor},
};

/// Kinds of qdiscs that only shape or classify traffic, but do not implement the AQM itself.
const SHAPER_KINDS: [&str; 6] = ["htb", "tbf", "hfsc", "netem", "ingress", "clsact"];

/// Unit in which the shaping script expects the bandwidth argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthUnit {
    Bps,
    #[default]
    Kbps,
    Mbps,
}

impl BandwidthUnit {
    pub fn from_kbps(&self, kbps: u64) -> u64 {
        match self {
            BandwidthUnit::Bps => kbps * 1000,
            BandwidthUnit::Kbps => kbps,
            BandwidthUnit::Mbps => kbps / 1000,
        }
    }

    /// Whether `kbps` can be expressed in this unit without rounding.
    pub fn is_exact(&self, kbps: u64) -> bool {
        match self {
            BandwidthUnit::Mbps => kbps % 1000 == 0,
            BandwidthUnit::Bps | BandwidthUnit::Kbps => true,
        }
    }
}

/// Step of the shaping controller, used to tag errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShapingStep {
    Apply,
    Verify,
    Teardown,
    VerifyClear,
}

#[derive(Debug, thiserror::Error)]
pub enum ShapingError {
    #[error("{step} on {iface} failed with exit code {exit_code}: {stderr}")]
    Rejected {
        step: ShapingStep,
        iface: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("{step} on {iface}: {source}")]
    Remote {
        step: ShapingStep,
        iface: String,
        #[source]
        source: RemoteError,
    },
    /// The teardown was accepted, but the interface still carries a non-baseline configuration.
    #[error("{iface} is not back to baseline after teardown (qdiscs: {qdiscs:?}, link up: {link_up:?})")]
    NotCleared {
        iface: String,
        qdiscs: Vec<String>,
        link_up: Option<bool>,
    },
}

impl ShapingError {
    pub fn step(&self) -> ShapingStep {
        match self {
            ShapingError::Rejected { step, .. } | ShapingError::Remote { step, .. } => *step,
            ShapingError::NotCleared { .. } => ShapingStep::VerifyClear,
        }
    }

    /// Whether the control channel to the router is lost. No further trial can be executed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShapingError::Remote { source, .. } if source.is_connection())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ShapingError::Remote { source, .. } if source.is_timeout())
    }
}

/// A single line of `tc qdisc show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QdiscEntry {
    pub kind: String,
    pub handle: String,
    /// Parent class, or `None` for the root qdisc.
    pub parent: Option<String>,
}

impl QdiscEntry {
    /// Disciplines the kernel attaches on its own carry the handle `0:`.
    fn is_baseline(&self, baseline: &[String]) -> bool {
        self.handle == "0:" || baseline.iter().any(|b| *b == self.kind)
    }
}

/// State of an interface as observed on the router. Only valid at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteState {
    pub interface: String,
    /// The discipline that decides on drops and marking, if any shaping is active.
    pub active_qdisc: Option<String>,
    /// All disciplines not part of the baseline configuration.
    pub qdiscs: Vec<QdiscEntry>,
    /// Link state as reported by `ip link`, if it was queried.
    pub link_up: Option<bool>,
}

lazy_static! {
    static ref QDISC_LINE: Regex = Regex::new(
        r"(?m)^qdisc\s+(?P<kind>[\w-]+)\s+(?P<handle>[0-9a-fA-F]*:)\s*(?:(?P<root>root)|parent\s+(?P<parent>[0-9a-fA-F]*:[0-9a-fA-F]*))?"
    )
    .unwrap();
    static ref LINK_STATE: Regex = Regex::new(r"\bstate\s+(?P<state>[A-Z]+)\b").unwrap();
}

/// Parse the output of `tc qdisc show dev <iface>`.
pub fn parse_qdiscs(output: &str) -> Vec<QdiscEntry> {
    QDISC_LINE
        .captures_iter(output)
        .map(|c| QdiscEntry {
            kind: c["kind"].to_string(),
            handle: c["handle"].to_string(),
            parent: c.name("parent").map(|p| p.as_str().to_string()),
        })
        .collect()
}

/// Parse the output of `ip link show dev <iface>`. Returns `None` for states other than `UP` and
/// `DOWN` (e.g., `UNKNOWN` on virtual interfaces).
pub fn parse_link_state(output: &str) -> Option<bool> {
    match LINK_STATE.captures(output)?.name("state")?.as_str() {
        "UP" => Some(true),
        "DOWN" => Some(false),
        _ => None,
    }
}

impl RemoteState {
    /// Build the state from the `tc qdisc show` output, ignoring all disciplines in `baseline`.
    pub fn from_qdisc_output(interface: &str, output: &str, baseline: &[String]) -> Self {
        let qdiscs: Vec<QdiscEntry> = parse_qdiscs(output)
            .into_iter()
            .filter(|q| !q.is_baseline(baseline))
            .collect();

        let known_aqm = qdiscs
            .iter()
            .find(|q| AqmVariant::known_kinds().contains(&q.kind.as_str()));
        let non_shaper = || {
            qdiscs
                .iter()
                .find(|q| !SHAPER_KINDS.contains(&q.kind.as_str()))
        };
        let active_qdisc = known_aqm
            .or_else(non_shaper)
            .or(qdiscs.first())
            .map(|q| q.kind.clone());

        Self {
            interface: interface.to_string(),
            active_qdisc,
            qdiscs,
            link_up: None,
        }
    }

    /// Whether any non-baseline discipline is installed.
    pub fn is_shaped(&self) -> bool {
        !self.qdiscs.is_empty()
    }

    /// Whether the observed state corresponds to the requested AQM variant. `NoAqm` expects a
    /// shaped interface without any AQM discipline.
    pub fn matches(&self, aqm: &AqmVariant) -> bool {
        match aqm.qdisc_kind() {
            Some(kind) => self.qdiscs.iter().any(|q| q.kind == kind),
            None => {
                self.is_shaped()
                    && !self
                        .qdiscs
                        .iter()
                        .any(|q| AqmVariant::known_kinds().contains(&q.kind.as_str()))
            }
        }
    }

    /// Whether the interface is back to its baseline and, if known, the link is up.
    pub fn is_clear(&self) -> bool {
        !self.is_shaped() && self.link_up != Some(false)
    }
}

/// Controls the shaping script on the router.
pub struct ShapingController<E> {
    executor: Arc<E>,
    script: String,
    unit: BandwidthUnit,
    timeout: Duration,
    baseline: Vec<String>,
}

impl<E> Clone for ShapingController<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            script: self.script.clone(),
            unit: self.unit,
            timeout: self.timeout,
            baseline: self.baseline.clone(),
        }
    }
}

impl<E: RemoteExecutor> ShapingController<E> {
    pub fn new(
        executor: Arc<E>,
        script: impl Into<String>,
        unit: BandwidthUnit,
        timeout: Duration,
        baseline: Vec<String>,
    ) -> Self {
        Self {
            executor,
            script: script.into(),
            unit,
            timeout,
            baseline,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Command line of the shaping script for `action` (`start` or `stop`).
    pub fn script_command(&self, action: &str, iface: &str, config: &TrialConfig) -> String {
        format!(
            "{} {action} {iface} {} {} {} {}",
            self.script,
            self.unit.from_kbps(config.bandwidth_kbps),
            config.latency_ms,
            config.loss_pct,
            config.aqm_variant
        )
    }

    /// Execute a command, sending it a second time if the first attempt timed out. Connection
    /// errors are returned immediately.
    async fn execute(
        &self,
        step: ShapingStep,
        iface: &str,
        command: &str,
    ) -> Result<ExecutionResult, ShapingError> {
        let result = match self.executor.execute(command, self.timeout).await {
            Err(e) if e.is_timeout() => {
                log::warn!("[shaping] {step} on {iface} timed out, retrying once: {e}");
                self.executor.execute(command, self.timeout).await
            }
            result => result,
        };
        let result = result.map_err(|source| ShapingError::Remote {
            step,
            iface: iface.to_string(),
            source,
        })?;

        if !result.success() {
            return Err(ShapingError::Rejected {
                step,
                iface: iface.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }

    /// Start shaping `iface` according to `config`. Succeeds once the router accepted the command,
    /// which does not mean that the discipline is active.
    pub async fn apply(&self, iface: &str, config: &TrialConfig) -> Result<(), ShapingError> {
        let cmd = self.script_command("start", iface, config);
        log::debug!("[shaping] {cmd}");
        let result = self.execute(ShapingStep::Apply, iface, &cmd).await?;
        log::trace!("[shaping] start output:\n{}", result.stdout);
        Ok(())
    }

    /// Query the queueing disciplines on `iface`.
    pub async fn verify(&self, iface: &str) -> Result<RemoteState, ShapingError> {
        let cmd = format!("tc qdisc show dev {iface}");
        let result = self.execute(ShapingStep::Verify, iface, &cmd).await?;
        let state = RemoteState::from_qdisc_output(iface, &result.stdout, &self.baseline);
        log::debug!(
            "[shaping] {iface} has active qdisc {:?}",
            state.active_qdisc.as_deref().unwrap_or("none")
        );
        Ok(state)
    }

    /// Stop shaping `iface`. Must be called with the same configuration as `apply`.
    pub async fn teardown(&self, iface: &str, config: &TrialConfig) -> Result<(), ShapingError> {
        let cmd = self.script_command("stop", iface, config);
        log::debug!("[shaping] {cmd}");
        let result = self.execute(ShapingStep::Teardown, iface, &cmd).await?;
        log::trace!("[shaping] stop output:\n{}", result.stdout);
        Ok(())
    }

    /// Query qdiscs and link state of `iface` after a teardown.
    pub async fn verify_clear(&self, iface: &str) -> Result<RemoteState, ShapingError> {
        let cmd = format!("tc qdisc show dev {iface}");
        let qdiscs = self.execute(ShapingStep::VerifyClear, iface, &cmd).await?;
        let cmd = format!("ip link show dev {iface}");
        let link = self.execute(ShapingStep::VerifyClear, iface, &cmd).await?;

        let mut state = RemoteState::from_qdisc_output(iface, &qdiscs.stdout, &self.baseline);
        state.link_up = parse_link_state(&link.stdout);
        log::debug!(
            "[shaping] {iface} after teardown: {} qdisc(s) left, link up: {:?}",
            state.qdiscs.len(),
            state.link_up
        );
        Ok(state)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{Fault, FakeRouter};

    const HTB_CAKE: &str = "qdisc htb 1: root refcnt 2 r2q 10 default 0x10 direct_packets_stat 0 direct_qlen 1000
qdisc cake 8001: parent 1:10 bandwidth unlimited diffserv3 triple-isolate nonat nowash no-ack-filter split-gso rtt 100ms raw overhead 0
";
    const HTB_PFIFO: &str = "qdisc htb 1: root refcnt 2 r2q 10 default 0x10 direct_packets_stat 0 direct_qlen 1000
qdisc pfifo 8001: parent 1:10 limit 1000p
";
    const DEFAULT_MQ: &str = "qdisc mq 0: root
qdisc fq_codel 0: parent :1 limit 10240p flows 1024 quantum 1514 target 5ms interval 100ms memory_limit 4Mb ecn drop_batch 64
qdisc fq_codel 0: parent :2 limit 10240p flows 1024 quantum 1514 target 5ms interval 100ms memory_limit 4Mb ecn drop_batch 64
";
    const IP_LINK_UP: &str = "7: lan3@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue master br-lan state UP mode DEFAULT group default qlen 1000
    link/ether 94:83:c4:a1:b2:c3 brd ff:ff:ff:ff:ff:ff
";

    fn baseline() -> Vec<String> {
        ["noqueue", "pfifo_fast", "mq"].map(String::from).to_vec()
    }

    fn config(aqm: AqmVariant) -> TrialConfig {
        TrialConfig {
            bandwidth_kbps: 100_000,
            latency_ms: 10,
            loss_pct: 0.0,
            aqm_variant: aqm,
            interface: "lan3".to_string(),
        }
    }

    fn controller(router: FakeRouter) -> ShapingController<FakeRouter> {
        ShapingController::new(
            Arc::new(router),
            "/root/aqm_shaper_nonetem.sh",
            BandwidthUnit::Kbps,
            Duration::from_secs(5),
            baseline(),
        )
    }

    #[test]
    fn parse_tc_output() {
        let entries = parse_qdiscs(HTB_CAKE);
        assert_eq!(
            entries,
            vec![
                QdiscEntry {
                    kind: "htb".to_string(),
                    handle: "1:".to_string(),
                    parent: None
                },
                QdiscEntry {
                    kind: "cake".to_string(),
                    handle: "8001:".to_string(),
                    parent: Some("1:10".to_string())
                },
            ]
        );
        let state = RemoteState::from_qdisc_output("lan3", HTB_CAKE, &baseline());
        assert_eq!(state.active_qdisc.as_deref(), Some("cake"));
        assert!(state.matches(&AqmVariant::Cake));
        assert!(!state.matches(&AqmVariant::FqCodel));
        assert!(!state.matches(&AqmVariant::NoAqm));
    }

    #[test]
    fn no_aqm_matches_plain_shaper() {
        let state = RemoteState::from_qdisc_output("lan3", HTB_PFIFO, &baseline());
        assert_eq!(state.active_qdisc.as_deref(), Some("pfifo"));
        assert!(state.matches(&AqmVariant::NoAqm));
        assert!(!state.matches(&AqmVariant::Sfq));
    }

    #[test]
    fn kernel_defaults_are_baseline() {
        let state = RemoteState::from_qdisc_output("eth2", DEFAULT_MQ, &baseline());
        assert!(!state.is_shaped());
        assert_eq!(state.active_qdisc, None);
        // the default fq_codel must not be mistaken for an applied one
        assert!(!state.matches(&AqmVariant::FqCodel));
        assert!(!state.matches(&AqmVariant::NoAqm));
        assert!(state.is_clear());

        let state =
            RemoteState::from_qdisc_output("lan3", "qdisc noqueue 0: root refcnt 2\n", &baseline());
        assert!(state.is_clear());
        assert!(RemoteState::from_qdisc_output("lan3", "", &baseline()).is_clear());
    }

    #[test]
    fn link_state() {
        assert_eq!(parse_link_state(IP_LINK_UP), Some(true));
        assert_eq!(
            parse_link_state("2: eth2: <BROADCAST> mtu 1500 qdisc noop state DOWN mode DEFAULT"),
            Some(false)
        );
        assert_eq!(
            parse_link_state("5: wg0: <POINTOPOINT,NOARP,UP> mtu 1420 state UNKNOWN mode"),
            None
        );
        assert_eq!(parse_link_state("Device \"lan9\" does not exist."), None);
    }

    #[test]
    fn bandwidth_units() {
        assert_eq!(BandwidthUnit::Bps.from_kbps(100), 100_000);
        assert_eq!(BandwidthUnit::Kbps.from_kbps(100), 100);
        assert_eq!(BandwidthUnit::Mbps.from_kbps(100_000), 100);
        assert!(BandwidthUnit::Mbps.is_exact(100_000));
        assert!(!BandwidthUnit::Mbps.is_exact(500));
        assert!(!BandwidthUnit::Mbps.is_exact(1_500));
        assert!(BandwidthUnit::Kbps.is_exact(1_500));
    }

    #[test]
    fn script_commands() {
        let ctrl = controller(FakeRouter::default());
        let lossy = TrialConfig {
            loss_pct: 0.5,
            ..config(AqmVariant::FqCodel)
        };
        assert_eq!(
            ctrl.script_command("start", "lan3", &lossy),
            "/root/aqm_shaper_nonetem.sh start lan3 100000 10 0.5 fq_codel"
        );
        assert_eq!(
            ctrl.script_command("stop", "lan3", &config(AqmVariant::NoAqm)),
            "/root/aqm_shaper_nonetem.sh stop lan3 100000 10 0 no_aqm"
        );
    }

    #[tokio::test]
    async fn apply_verify_teardown() {
        let ctrl = controller(FakeRouter::default());
        let config = config(AqmVariant::Cake);

        assert!(ctrl.verify("lan3").await.unwrap().is_clear());
        ctrl.apply("lan3", &config).await.unwrap();
        let state = ctrl.verify("lan3").await.unwrap();
        assert!(state.matches(&AqmVariant::Cake));

        ctrl.teardown("lan3", &config).await.unwrap();
        let state = ctrl.verify_clear("lan3").await.unwrap();
        assert!(state.is_clear());
        assert_eq!(state.link_up, Some(true));
    }

    #[tokio::test]
    async fn accepted_but_not_applied() {
        let router = FakeRouter::default();
        router.inject(|c| c.contains(" start "), Fault::Ignore, 1);
        let ctrl = controller(router);
        ctrl.apply("lan3", &config(AqmVariant::Cake)).await.unwrap();
        let state = ctrl.verify("lan3").await.unwrap();
        assert!(!state.is_shaped());
        assert!(!state.matches(&AqmVariant::Cake));
    }

    #[tokio::test]
    async fn rejected_apply() {
        let router = FakeRouter::default();
        router.inject(|c| c.contains(" start "), Fault::Reject(2), 1);
        let ctrl = controller(router);
        let err = ctrl
            .apply("lan3", &config(AqmVariant::Cake))
            .await
            .unwrap_err();
        assert_eq!(err.step(), ShapingStep::Apply);
        assert!(matches!(err, ShapingError::Rejected { exit_code: 2, .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn timeout_retried_once() {
        let router = FakeRouter::default();
        router.inject(|c| c.contains(" stop "), Fault::Timeout, 1);
        let ctrl = controller(router);
        let config = config(AqmVariant::Sfq);
        ctrl.apply("lan3", &config).await.unwrap();
        ctrl.teardown("lan3", &config).await.unwrap();
        assert_eq!(ctrl.executor().count(|c| c.contains(" stop ")), 2);

        // two timeouts in a row are reported
        ctrl.executor().inject(|c| c.contains(" stop "), Fault::Timeout, 2);
        let err = ctrl.teardown("lan3", &config).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
        assert_eq!(err.step(), ShapingStep::Teardown);
        assert_eq!(ctrl.executor().count(|c| c.contains(" stop ")), 4);
    }

    #[tokio::test]
    async fn connection_error_not_retried() {
        let router = FakeRouter::default();
        router.inject(|c| c.starts_with("tc qdisc"), Fault::Connection, 1);
        let ctrl = controller(router);
        let err = ctrl.verify("lan3").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.step(), ShapingStep::Verify);
        assert_eq!(ctrl.executor().count(|c| c.starts_with("tc qdisc")), 1);
    }
}
