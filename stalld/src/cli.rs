//! Command-line surface.
//!
//! Flags mirror the historical tool. Per-flag range limits are enforced
//! here; cross-field rules live in [`Config::validate`]. An optional TOML
//! config file seeds the values, environment variables override it, and
//! explicit flags win over both.

use std::path::PathBuf;

use clap::Parser;
use stalld_core::{Config, SourceKind, StalldError, StalldResult, Strategy};

/// Starvation detection and avoidance (with bounds).
#[derive(Parser, Debug)]
#[command(name = "stalld", version, about, max_term_width = 100)]
pub struct Cli {
    /// Monitor only this CPU list (e.g. "0-3,8")
    #[arg(short = 'c', long = "cpu", value_name = "LIST")]
    pub cpu_list: Option<String>,

    /// Only log information, do not boost
    #[arg(short = 'l', long)]
    pub log_only: bool,

    /// Print detection and boost info to the standard output
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Run in foreground (implied by --verbose)
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Dispatch one thread per runqueue even with no starving threads
    #[arg(short = 'A', long, conflicts_with_all = ["adaptive_mode", "power_mode"])]
    pub aggressive_mode: bool,

    /// Dispatch a specialized per-CPU thread once threads starve for more
    /// than half the starving threshold
    #[arg(short = 'M', long, conflicts_with_all = ["aggressive_mode", "power_mode"])]
    pub adaptive_mode: bool,

    /// Work single-threaded; saves CPU at the cost of precision
    #[arg(short = 'O', long, conflicts_with_all = ["aggressive_mode", "adaptive_mode"])]
    pub power_mode: bool,

    /// SCHED_DEADLINE period [ns] the starving task will receive
    #[arg(short = 'p', long, value_name = "NS")]
    pub boost_period: Option<u64>,

    /// SCHED_DEADLINE runtime [ns] the starving task will receive
    #[arg(short = 'r', long, value_name = "NS")]
    pub boost_runtime: Option<u64>,

    /// How long [s] the starving task will run with the boosted policy
    #[arg(short = 'd', long, value_name = "S")]
    pub boost_duration: Option<u64>,

    /// How long [s] a task may wait without progress before being boosted
    #[arg(short = 't', long, value_name = "S")]
    pub starving_threshold: Option<u64>,

    /// Seconds between starvation checks
    #[arg(short = 'g', long, value_name = "S")]
    pub granularity: Option<u64>,

    /// Boost with SCHED_FIFO instead of probing for SCHED_DEADLINE
    #[arg(short = 'F', long)]
    pub force_fifo: bool,

    /// Running as a systemd service; don't fiddle with RT throttling
    #[arg(short = 'S', long)]
    pub systemd: bool,

    /// Percentage of CPU time reserved for stalld itself (power mode only)
    #[arg(short = 'R', long, value_name = "PCT")]
    pub reservation: Option<u8>,

    /// Comma-separated regexes of thread names never to boost
    #[arg(short = 'i', long, value_name = "REGEX", value_delimiter = ',')]
    pub ignore_threads: Vec<String>,

    /// Comma-separated regexes of process names never to boost
    #[arg(short = 'I', long, value_name = "REGEX", value_delimiter = ',')]
    pub ignore_processes: Vec<String>,

    /// Backend used to find starving tasks: sched_debug (S) or
    /// queue_track (Q)
    #[arg(short = 'b', long, value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Limit stalld's own CPU affinity to this list
    #[arg(short = 'a', long, value_name = "LIST")]
    pub affinity: Option<String>,

    /// Write the daemon pid to this file
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Seed the configuration from this TOML file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Snapshot every CPU every cycle, even ones that accrued idle time
    #[arg(long)]
    pub no_idle_gate: bool,
}

impl Cli {
    /// Fold file, environment, and flags into a validated frozen config.
    pub fn into_config(self, nr_cpus: usize) -> StalldResult<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        }
        .with_env_overrides();

        if let Some(list) = &self.cpu_list {
            config.monitored_cpus = Some(stalld_core::parse_cpu_list(list, nr_cpus)?);
        }
        if let Some(ns) = self.boost_period {
            in_range("boost_period", ns, 200_000_000, 4_000_000_000, "ns")?;
            config.boost_period_ns = ns;
        }
        if let Some(ns) = self.boost_runtime {
            in_range("boost_runtime", ns, 8_000, 1_000_000, "ns")?;
            config.boost_runtime_ns = ns;
        }
        if let Some(secs) = self.boost_duration {
            in_range("boost_duration", secs, 1, 60, "s")?;
            config.boost_duration = secs;
        }
        if let Some(secs) = self.starving_threshold {
            in_range("starving_threshold", secs, 1, 3600, "s")?;
            config.starving_threshold = secs;
        }
        if let Some(secs) = self.granularity {
            in_range("granularity", secs, 1, 600, "s")?;
            config.granularity = secs;
        }
        if self.aggressive_mode {
            config.strategy = Strategy::Aggressive;
        } else if self.adaptive_mode {
            config.strategy = Strategy::Adaptive;
        } else if self.power_mode {
            config.strategy = Strategy::Power;
        }
        if let Some(backend) = &self.backend {
            config.source = parse_backend(backend)?;
        }
        if self.force_fifo {
            config.force_fifo = true;
        }
        if self.log_only {
            config.log_only = true;
        }
        if self.systemd {
            config.systemd = true;
        }
        if self.no_idle_gate {
            config.idle_gate = false;
        }
        if self.verbose {
            config.verbose = true;
            config.foreground = true;
        }
        if self.foreground {
            config.foreground = true;
        }
        if let Some(pct) = self.reservation {
            config.reservation_pct = Some(pct);
        }
        if !self.ignore_threads.is_empty() {
            config.ignore_threads = self.ignore_threads;
        }
        if !self.ignore_processes.is_empty() {
            config.ignore_processes = self.ignore_processes;
        }
        if let Some(list) = &self.affinity {
            // Parsed again at apply time; fail early on nonsense.
            stalld_core::parse_cpu_list(list, nr_cpus)?;
            config.affinity = Some(list.clone());
        }
        if let Some(path) = &self.pidfile {
            config.pidfile = Some(path.display().to_string());
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_backend(name: &str) -> StalldResult<SourceKind> {
    match name {
        "sched_debug" | "S" => Ok(SourceKind::SchedDebug),
        "queue_track" | "Q" => Ok(SourceKind::QueueTrack),
        other => Err(StalldError::InvalidConfig {
            field: "backend",
            value: other.to_owned(),
            reason: "known backends are sched_debug (S) and queue_track (Q)".into(),
        }),
    }
}

fn in_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
    unit: &str,
) -> StalldResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(StalldError::InvalidConfig {
            field,
            value: value.to_string(),
            reason: format!("must be between {min} {unit} and {max} {unit}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stalld").chain(args.iter().copied()))
            .expect("parse args")
    }

    #[test]
    fn defaults_build_a_valid_config() {
        let config = parse(&[]).into_config(8).expect("config");
        assert_eq!(config.strategy, Strategy::Adaptive);
        assert_eq!(config.source, SourceKind::SchedDebug);
        assert!(config.monitored_cpus.is_none());
    }

    #[test]
    fn strategy_flags_map_to_strategies() {
        assert_eq!(
            parse(&["-A"]).into_config(8).expect("config").strategy,
            Strategy::Aggressive
        );
        assert_eq!(
            parse(&["-O"]).into_config(8).expect("config").strategy,
            Strategy::Power
        );
        assert_eq!(
            parse(&["-M"]).into_config(8).expect("config").strategy,
            Strategy::Adaptive
        );
    }

    #[test]
    fn strategy_flags_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["stalld", "-A", "-O"]).is_err());
    }

    #[test]
    fn boost_period_bounds_match_the_original_tool() {
        assert!(parse(&["-p", "100"]).into_config(8).is_err());
        assert!(parse(&["-p", "5000000000"]).into_config(8).is_err());
        let config = parse(&["-p", "1000000000"]).into_config(8).expect("config");
        assert_eq!(config.boost_period_ns, 1_000_000_000);
    }

    #[test]
    fn boost_runtime_bounds() {
        assert!(parse(&["-r", "7999"]).into_config(8).is_err());
        assert!(parse(&["-r", "1000001"]).into_config(8).is_err());
        assert_eq!(
            parse(&["-r", "20000"]).into_config(8).expect("c").boost_runtime_ns,
            20_000
        );
    }

    #[test]
    fn threshold_and_duration_bounds() {
        assert!(parse(&["-t", "0"]).into_config(8).is_err());
        assert!(parse(&["-t", "3601"]).into_config(8).is_err());
        assert!(parse(&["-d", "61"]).into_config(8).is_err());
        assert!(parse(&["-g", "601"]).into_config(8).is_err());
    }

    #[test]
    fn force_fifo_with_power_mode_fails_validation() {
        let err = parse(&["-O", "-F"]).into_config(8).unwrap_err();
        assert!(matches!(err, StalldError::InvalidConfig { .. }));
    }

    #[test]
    fn backend_names_and_shorthands() {
        assert_eq!(
            parse(&["-b", "queue_track"]).into_config(8).expect("c").source,
            SourceKind::QueueTrack
        );
        assert_eq!(
            parse(&["-b", "Q"]).into_config(8).expect("c").source,
            SourceKind::QueueTrack
        );
        assert_eq!(
            parse(&["-b", "S"]).into_config(8).expect("c").source,
            SourceKind::SchedDebug
        );
        assert!(parse(&["-b", "ftrace"]).into_config(8).is_err());
    }

    #[test]
    fn ignore_lists_split_on_commas() {
        let config = parse(&["-i", "ksoftirqd.*,rcu.*", "-I", "dpdk-.*"])
            .into_config(8)
            .expect("config");
        assert_eq!(config.ignore_threads.len(), 2);
        assert_eq!(config.ignore_processes, vec!["dpdk-.*".to_owned()]);
    }

    #[test]
    fn cpu_list_is_parsed_and_bounded() {
        let config = parse(&["-c", "0-2"]).into_config(8).expect("config");
        assert_eq!(config.monitored_cpus, Some(vec![0, 1, 2]));
        assert!(parse(&["-c", "0-9"]).into_config(4).is_err());
    }

    #[test]
    fn verbose_implies_foreground() {
        let config = parse(&["-v"]).into_config(8).expect("config");
        assert!(config.verbose);
        assert!(config.foreground);
    }

    #[test]
    fn reservation_outside_power_mode_fails() {
        assert!(parse(&["-R", "20"]).into_config(8).is_err());
        let config = parse(&["-O", "-R", "20"]).into_config(8).expect("config");
        assert_eq!(config.reservation_pct, Some(20));
    }
}
