//! Daemon configuration.
//!
//! [`Config`] is assembled once at startup (defaults → optional TOML file →
//! environment → CLI) and frozen: the monitoring threads only ever read it
//! through an `Arc`. SIGHUP is deliberately not handled.
//!
//! # Environment Variable Overrides
//!
//! | Variable                     | Field                | Default        |
//! |------------------------------|----------------------|----------------|
//! | `STALLD_THRESHOLD_S`         | `starving_threshold` | `30`           |
//! | `STALLD_GRANULARITY_S`       | `granularity`        | `5`            |
//! | `STALLD_BOOST_RUNTIME_NS`    | `boost_runtime_ns`   | `20000`        |
//! | `STALLD_BOOST_PERIOD_NS`     | `boost_period_ns`    | `1000000000`   |
//! | `STALLD_BOOST_DURATION_S`    | `boost_duration`     | `3`            |
//! | `STALLD_LOG_ONLY`            | `log_only`           | `false`        |
//! | `STALLD_IDLE_GATE`           | `idle_gate`          | `true`         |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StalldError, StalldResult};

/// Nanoseconds per second, the unit bridge between boost params and durations.
pub const NS_PER_SEC: u64 = 1_000_000_000;

/// How the monitoring cycle is distributed over threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Single monitoring thread; boosts are vectorized. Lowest overhead,
    /// requires the deadline method.
    Power,
    /// A coordinator plus per-CPU workers spawned on demand once a CPU's
    /// longest wait crosses half the starving threshold.
    #[default]
    Adaptive,
    /// One permanent worker per monitored CPU. Highest precision.
    Aggressive,
}

impl Strategy {
    /// Short name used in logs and diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Adaptive => "adaptive",
            Self::Aggressive => "aggressive",
        }
    }
}

/// Which runqueue backend feeds the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Parse the kernel's plain-text sched debug dump.
    #[default]
    SchedDebug,
    /// Read the per-CPU map maintained by the scheduler tracepoint probes.
    QueueTrack,
}

impl SourceKind {
    /// Short name used in logs and diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SchedDebug => "sched_debug",
            Self::QueueTrack => "queue_track",
        }
    }
}

/// Frozen daemon configuration.
///
/// All fields have defaults matching the original tool. [`Config::validate`]
/// enforces the cross-field rules; per-flag range limits live in the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CPUs to monitor. `None` means every online CPU.
    pub monitored_cpus: Option<Vec<usize>>,

    /// Seconds a runnable task must fail to progress before being boosted.
    pub starving_threshold: u64,

    /// Seconds between monitoring cycles.
    pub granularity: u64,

    /// SCHED_DEADLINE runtime handed to a boosted task, in nanoseconds.
    pub boost_runtime_ns: u64,

    /// SCHED_DEADLINE period handed to a boosted task, in nanoseconds.
    pub boost_period_ns: u64,

    /// Seconds a boosted task keeps the elevated policy.
    pub boost_duration: u64,

    /// SCHED_FIFO priority used when the fixed-priority method is in force.
    pub fifo_priority: u32,

    /// Threading strategy.
    pub strategy: Strategy,

    /// Skip the deadline probe and boost with SCHED_FIFO unconditionally.
    pub force_fifo: bool,

    /// Detect and log but never touch scheduling attributes.
    pub log_only: bool,

    /// Skip snapshotting CPUs that accrued idle time since the last cycle.
    pub idle_gate: bool,

    /// Regex patterns for thread names that must never be boosted.
    pub ignore_threads: Vec<String>,

    /// Regex patterns for process-group names that must never be boosted.
    pub ignore_processes: Vec<String>,

    /// Runqueue backend selector.
    pub source: SourceKind,

    /// Emit per-detection and per-boost log lines.
    pub verbose: bool,

    /// Stay in the foreground (implied by `verbose`).
    pub foreground: bool,

    /// Running under a supervisor that manages the RT runtime budget; the
    /// throttling gate then leaves the knob alone.
    pub systemd: bool,

    /// Optional pidfile path, written once startup succeeds.
    pub pidfile: Option<String>,

    /// Optional CPU list to pin the daemon's own threads to.
    pub affinity: Option<String>,

    /// Percentage of CPU time the daemon reserves for itself with
    /// SCHED_DEADLINE. Power strategy only.
    pub reservation_pct: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitored_cpus: None,
            starving_threshold: 30,
            granularity: 5,
            boost_runtime_ns: 20_000,
            boost_period_ns: NS_PER_SEC,
            boost_duration: 3,
            fifo_priority: 1,
            strategy: Strategy::default(),
            force_fifo: false,
            log_only: false,
            idle_gate: true,
            ignore_threads: Vec::new(),
            ignore_processes: Vec::new(),
            source: SourceKind::default(),
            verbose: false,
            foreground: false,
            systemd: false,
            pidfile: None,
            affinity: None,
            reservation_pct: None,
        }
    }
}

impl Config {
    /// Load a TOML config file, merging over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StalldError::InvalidConfig`] when the file cannot be read
    /// or parsed. A missing file is an error here; callers that treat the
    /// file as optional should check existence first.
    pub fn from_file(path: &Path) -> StalldResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| StalldError::InvalidConfig {
            field: "config_file",
            value: path.display().to_string(),
            reason: format!("cannot read: {e}"),
        })?;
        toml::from_str(&contents).map_err(|e| StalldError::InvalidConfig {
            field: "config_file",
            value: path.display().to_string(),
            reason: format!("cannot parse: {e}"),
        })
    }

    /// Apply `STALLD_*` environment overrides.
    ///
    /// Invalid values are silently ignored, keeping the current setting.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("STALLD_THRESHOLD_S")
            && let Ok(secs) = val.parse::<u64>()
            && secs > 0
        {
            self.starving_threshold = secs;
        }
        if let Ok(val) = std::env::var("STALLD_GRANULARITY_S")
            && let Ok(secs) = val.parse::<u64>()
            && secs > 0
        {
            self.granularity = secs;
        }
        if let Ok(val) = std::env::var("STALLD_BOOST_RUNTIME_NS")
            && let Ok(ns) = val.parse::<u64>()
        {
            self.boost_runtime_ns = ns;
        }
        if let Ok(val) = std::env::var("STALLD_BOOST_PERIOD_NS")
            && let Ok(ns) = val.parse::<u64>()
        {
            self.boost_period_ns = ns;
        }
        if let Ok(val) = std::env::var("STALLD_BOOST_DURATION_S")
            && let Ok(secs) = val.parse::<u64>()
        {
            self.boost_duration = secs;
        }
        if let Ok(val) = std::env::var("STALLD_LOG_ONLY") {
            self.log_only = val == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("STALLD_IDLE_GATE") {
            self.idle_gate = val != "false" && val != "0";
        }
        self
    }

    /// Enforce the cross-field rules that make a boost session well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`StalldError::InvalidConfig`] on the first violated rule.
    pub fn validate(&self) -> StalldResult<()> {
        if self.boost_runtime_ns == 0 {
            return Err(invalid(
                "boost_runtime_ns",
                self.boost_runtime_ns.to_string(),
                "runtime must be positive",
            ));
        }
        if self.boost_runtime_ns > self.boost_period_ns {
            return Err(invalid(
                "boost_runtime_ns",
                self.boost_runtime_ns.to_string(),
                format!(
                    "runtime is longer than the period ({} ns)",
                    self.boost_period_ns
                ),
            ));
        }
        if self.boost_duration == 0 {
            return Err(invalid(
                "boost_duration",
                self.boost_duration.to_string(),
                "boost duration must be at least one second",
            ));
        }
        if self.boost_period_ns > self.boost_duration * NS_PER_SEC {
            return Err(invalid(
                "boost_period_ns",
                self.boost_period_ns.to_string(),
                "the period is longer than the boost duration: the boosted \
                 task might not be able to run",
            ));
        }
        if self.boost_duration > self.starving_threshold {
            return Err(invalid(
                "boost_duration",
                self.boost_duration.to_string(),
                format!(
                    "cannot be longer than the starving threshold ({} s)",
                    self.starving_threshold
                ),
            ));
        }
        if self.granularity == 0 {
            return Err(invalid(
                "granularity",
                self.granularity.to_string(),
                "granularity must be at least one second",
            ));
        }
        if self.force_fifo && self.strategy == Strategy::Power {
            return Err(invalid(
                "force_fifo",
                "true".into(),
                "the power strategy boosts with a single vectorized \
                 SCHED_DEADLINE pass and cannot emulate SCHED_FIFO quanta",
            ));
        }
        if let Some(pct) = self.reservation_pct {
            if self.strategy != Strategy::Power {
                return Err(invalid(
                    "reservation_pct",
                    pct.to_string(),
                    "reservation only works in the power strategy",
                ));
            }
            if !(10..=90).contains(&pct) {
                return Err(invalid(
                    "reservation_pct",
                    pct.to_string(),
                    "reservation needs to be at least 10% and at most 90%",
                ));
            }
        }
        if let Some(cpus) = &self.monitored_cpus
            && cpus.is_empty()
        {
            return Err(invalid(
                "monitored_cpus",
                "[]".into(),
                "an explicit CPU list must not be empty",
            ));
        }
        Ok(())
    }

    /// The configured threshold as a `Duration`.
    #[must_use]
    pub const fn threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.starving_threshold)
    }

    /// The configured cycle spacing as a `Duration`.
    #[must_use]
    pub const fn cycle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.granularity)
    }

    /// The configured boost duration as a `Duration`.
    #[must_use]
    pub const fn boost_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.boost_duration)
    }
}

fn invalid(field: &'static str, value: String, reason: impl Into<String>) -> StalldError {
    StalldError::InvalidConfig {
        field,
        value,
        reason: reason.into(),
    }
}

/// Parse a kernel-style CPU list (`"0-3,8,10-11"`) into sorted CPU ids.
///
/// # Errors
///
/// Returns [`StalldError::InvalidConfig`] on malformed input, reversed
/// ranges, or ids at or beyond `nr_cpus`.
pub fn parse_cpu_list(list: &str, nr_cpus: usize) -> StalldResult<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start, end) = match part.split_once('-') {
            Some((lo, hi)) => (parse_cpu_id(lo, list)?, parse_cpu_id(hi, list)?),
            None => {
                let cpu = parse_cpu_id(part, list)?;
                (cpu, cpu)
            }
        };
        if end < start {
            return Err(invalid(
                "cpu_list",
                list.to_owned(),
                format!("range {start}-{end} is reversed"),
            ));
        }
        for cpu in start..=end {
            if cpu >= nr_cpus {
                return Err(invalid(
                    "cpu_list",
                    list.to_owned(),
                    format!("cpu {cpu} is beyond the last cpu ({})", nr_cpus - 1),
                ));
            }
            cpus.push(cpu);
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    if cpus.is_empty() {
        return Err(invalid("cpu_list", list.to_owned(), "no CPUs selected"));
    }
    Ok(cpus)
}

fn parse_cpu_id(token: &str, list: &str) -> StalldResult<usize> {
    token.trim().parse::<usize>().map_err(|_| {
        invalid(
            "cpu_list",
            list.to_owned(),
            format!("\"{token}\" is not a CPU id"),
        )
    })
}
