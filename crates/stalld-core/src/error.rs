/// Unified error type covering all failure modes of the stalld core.
///
/// Errors split into two families. Startup errors ([`ErrorKind::Config`],
/// [`ErrorKind::Environment`]) are fatal: the daemon prints the diagnostic
/// and exits nonzero. Runtime errors are contained: a [`ErrorKind::Source`]
/// error drops the affected CPU from the current cycle only, and boost
/// bookkeeping errors ([`ErrorKind::TargetVanished`], [`ErrorKind::Policy`])
/// close the session and let the daemon continue.
#[derive(Debug, thiserror::Error)]
pub enum StalldError {
    /// A configuration value or flag combination is invalid.
    #[error("invalid config: {field} = \"{value}\" — {reason}")]
    InvalidConfig {
        /// Which config field.
        field: &'static str,
        /// The offending value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// The host does not permit unbounded RT runtime and the knob could not
    /// be rewritten.
    #[error(
        "RT throttling is engaged and {knob} could not be set to -1: {source}. \
         Run under a supervisor that manages RT budget, or pass --systemd."
    )]
    RtThrottling {
        /// Path of the kernel knob.
        knob: &'static str,
        /// The underlying write failure.
        #[source]
        source: std::io::Error,
    },

    /// A runqueue source backend could not be initialized on this host.
    #[error("{backend} backend unavailable: {reason}")]
    SourceUnavailable {
        /// Backend name ("sched_debug" or "queue_track").
        backend: &'static str,
        /// Why init failed.
        reason: String,
    },

    /// No runqueue source could be initialized.
    #[error(
        "no runqueue source available: {detail}. The kernel must expose \
         /sys/kernel/debug/sched/debug, /proc/sched_debug, or the queue_track map."
    )]
    NoSource {
        /// Accumulated per-backend failure summary.
        detail: String,
    },

    /// Reading the whole-system dump failed; every CPU is skipped this
    /// cycle.
    #[error("cannot read {path}: {source}")]
    DumpRead {
        /// Path of the dump.
        path: String,
        /// The underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// Reading a snapshot for one CPU failed; the CPU is skipped this cycle.
    #[error("snapshot failed for cpu {cpu}: {source}")]
    Snapshot {
        /// CPU whose snapshot failed.
        cpu: usize,
        /// The underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// A snapshot was read but could not be parsed.
    #[error("cannot parse runqueue data for cpu {cpu}: {detail}")]
    Parse {
        /// CPU whose block was malformed.
        cpu: usize,
        /// What was wrong.
        detail: String,
    },

    /// The boost target exited between detection and a policy operation.
    #[error("task {tid} exited during boost handling")]
    TargetVanished {
        /// Thread id of the vanished target.
        tid: libc::pid_t,
    },

    /// Setting or reading scheduling attributes on a live target failed.
    #[error("sched_{op} failed for task {tid}: {source}")]
    Policy {
        /// Thread id of the target.
        tid: libc::pid_t,
        /// Which attribute operation ("setattr" or "getattr").
        op: &'static str,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// The daemon was started without root.
    #[error(
        "stalld needs root permission to read kernel debug files and to set \
         SCHED_DEADLINE parameters"
    )]
    MissingRoot,

    /// The process lacks the capability to change scheduling attributes.
    #[error(
        "permission denied for sched_{op}: stalld needs to run as root \
         (CAP_SYS_NICE and debugfs access)"
    )]
    Permission {
        /// Which operation hit EPERM.
        op: &'static str,
    },

    /// The selected strategy needs SCHED_DEADLINE but the probe chose the
    /// fixed-priority method.
    #[error(
        "the {strategy} strategy requires the deadline method, but \
         SCHED_DEADLINE is not usable on this host. Pick another strategy."
    )]
    DeadlineRequired {
        /// Strategy that demanded the deadline method.
        strategy: &'static str,
    },

    /// The HRTICK scheduler feature is required but could not be enabled.
    #[error(
        "cannot enable HRTICK in {path}: {reason}. Sub-millisecond deadline \
         boosting is unreliable without it; use --log-only or --force-fifo."
    )]
    HrtickUnavailable {
        /// The sched features file that was attempted.
        path: String,
        /// Why the write did not happen.
        reason: String,
    },

    /// Wraps `std::io::Error` for file operations with no better home.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to pick a propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at startup: bad flags or flag combinations.
    Config,
    /// Fatal at startup: the host cannot support the requested mode.
    Environment,
    /// Per-cycle, per-CPU: skip the CPU this cycle, never fatal.
    Source,
    /// The target exited mid-session; informational.
    TargetVanished,
    /// Unexpected policy-set failure on a live target; warn and continue.
    Policy,
    /// Missing capability; treated as Environment at first occurrence.
    Permission,
}

impl StalldError {
    /// Which propagation family this error belongs to.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } => ErrorKind::Config,
            Self::RtThrottling { .. }
            | Self::SourceUnavailable { .. }
            | Self::NoSource { .. }
            | Self::DeadlineRequired { .. }
            | Self::HrtickUnavailable { .. }
            | Self::Io(_) => ErrorKind::Environment,
            Self::DumpRead { .. } | Self::Snapshot { .. } | Self::Parse { .. } => {
                ErrorKind::Source
            }
            Self::TargetVanished { .. } => ErrorKind::TargetVanished,
            Self::Policy { .. } => ErrorKind::Policy,
            Self::MissingRoot | Self::Permission { .. } => ErrorKind::Permission,
        }
    }

    /// Whether this error must abort startup.
    #[must_use]
    pub const fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Environment | ErrorKind::Permission
        )
    }
}

/// Convenience alias used throughout the stalld crate hierarchy.
pub type StalldResult<T> = Result<T, StalldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StalldError>();
    }

    #[test]
    fn config_errors_are_fatal() {
        let err = StalldError::InvalidConfig {
            field: "boost_runtime",
            value: "0".into(),
            reason: "runtime must be positive".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn source_errors_are_contained() {
        let err = StalldError::Snapshot {
            cpu: 3,
            source: std::io::Error::other("read failed"),
        };
        assert_eq!(err.kind(), ErrorKind::Source);
        assert!(!err.is_fatal_at_startup());
    }

    #[test]
    fn vanished_target_is_not_fatal() {
        let err = StalldError::TargetVanished { tid: 1234 };
        assert_eq!(err.kind(), ErrorKind::TargetVanished);
        assert!(!err.is_fatal_at_startup());
        assert!(err.to_string().contains("1234"));
    }

    #[test]
    fn permission_is_fatal_at_first_occurrence() {
        let err = StalldError::Permission { op: "setattr" };
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(err.is_fatal_at_startup());
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn display_messages_are_actionable() {
        let err = StalldError::NoSource {
            detail: "debugfs not mounted".into(),
        };
        assert!(err.to_string().contains("/proc/sched_debug"));

        let err = StalldError::HrtickUnavailable {
            path: "/sys/kernel/debug/sched/features".into(),
            reason: "lockdown active".into(),
        };
        assert!(err.to_string().contains("--force-fifo"));
    }

    #[test]
    fn policy_error_preserves_source() {
        use std::error::Error as _;
        let err = StalldError::Policy {
            tid: 42,
            op: "setattr",
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("setattr"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StalldError = io_err.into();
        assert!(matches!(err, StalldError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Environment);
    }
}
