//! Starvation detector: threshold and denylist filtering over a merged
//! per-CPU waiting list.

use regex::RegexSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{StalldError, StalldResult};
use crate::procfs;
use crate::task::{CpuState, TaskSnapshot};

/// Compiled ignore patterns for thread names and process-group names.
#[derive(Debug, Default)]
pub struct Denylist {
    threads: Option<RegexSet>,
    processes: Option<RegexSet>,
}

impl Denylist {
    /// Compile the configured patterns.
    ///
    /// # Errors
    ///
    /// A pattern that does not compile is a [`StalldError::InvalidConfig`];
    /// a denylist that silently fails open would boost the very tasks the
    /// operator excluded.
    pub fn compile(threads: &[String], processes: &[String]) -> StalldResult<Self> {
        Ok(Self {
            threads: compile_set("ignore_threads", threads)?,
            processes: compile_set("ignore_processes", processes)?,
        })
    }

    /// Whether the thread name matches an ignore-thread pattern.
    #[must_use]
    pub fn matches_thread(&self, comm: &str) -> bool {
        self.threads.as_ref().is_some_and(|set| set.is_match(comm))
    }

    /// Whether the process-group name matches an ignore-process pattern.
    #[must_use]
    pub fn matches_process(&self, name: &str) -> bool {
        self.processes.as_ref().is_some_and(|set| set.is_match(name))
    }

    /// Whether any process patterns exist at all; lets the detector skip the
    /// tgid-name resolution entirely when none do.
    #[must_use]
    pub fn has_process_patterns(&self) -> bool {
        self.processes.is_some()
    }
}

fn compile_set(field: &'static str, patterns: &[String]) -> StalldResult<Option<RegexSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    match RegexSet::new(patterns) {
        Ok(set) => Ok(Some(set)),
        Err(e) => Err(StalldError::InvalidConfig {
            field,
            value: patterns.join(","),
            reason: format!("regex compilation failed: {e}"),
        }),
    }
}

/// Lookup used to resolve a tgid to its process-group name.
///
/// Production resolves through `/proc/<tgid>/status`; tests inject a table.
pub trait NameResolver: Send + Sync {
    /// Process-group name of `tgid`, or `None` when resolution fails.
    fn group_name(&self, tgid: libc::pid_t) -> Option<String>;

    /// Kernel-exported context-switch counter for `tid`, used as a progress
    /// fallback when a source could not provide one.
    fn context_switches(&self, tid: libc::pid_t) -> Option<u64>;
}

/// The live `/proc`-backed resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcResolver;

impl NameResolver for ProcResolver {
    fn group_name(&self, tgid: libc::pid_t) -> Option<String> {
        procfs::process_group_name(tgid)
    }

    fn context_switches(&self, tid: libc::pid_t) -> Option<u64> {
        procfs::context_switches(tid)
    }
}

/// Applies the starvation predicate and the denylists to a merged waiting
/// list, emitting the boost targets for one cycle.
pub struct Detector<R: NameResolver = ProcResolver> {
    threshold: u64,
    denylist: Denylist,
    resolver: R,
}

impl Detector<ProcResolver> {
    /// Build the production detector from the frozen config.
    ///
    /// # Errors
    ///
    /// Propagates denylist compilation failures.
    pub fn from_config(config: &Config) -> StalldResult<Self> {
        Ok(Self {
            threshold: config.starving_threshold,
            denylist: Denylist::compile(&config.ignore_threads, &config.ignore_processes)?,
            resolver: ProcResolver,
        })
    }
}

impl<R: NameResolver> Detector<R> {
    /// A detector with an injected resolver; used by tests.
    #[must_use]
    pub fn with_resolver(threshold: u64, denylist: Denylist, resolver: R) -> Self {
        Self {
            threshold,
            denylist,
            resolver,
        }
    }

    /// The configured threshold in seconds.
    #[must_use]
    pub const fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Emit the subset of `cpu.waiting` that is starving as of `now`.
    #[must_use]
    pub fn starving_targets(&self, cpu: &CpuState, now: u64) -> Vec<TaskSnapshot> {
        let mut targets = Vec::new();
        for task in &cpu.waiting {
            if task.waited(now) < self.threshold {
                continue;
            }
            if self.denylist.matches_thread(&task.comm) {
                debug!(
                    cpu = cpu.cpu_id,
                    tid = task.tid,
                    comm = %task.comm,
                    "starving task matches ignore_threads, skipping"
                );
                continue;
            }
            if self.denylist.has_process_patterns()
                && let Some(name) = self.resolver.group_name(task.tgid)
                && self.denylist.matches_process(&name)
            {
                debug!(
                    cpu = cpu.cpu_id,
                    tid = task.tid,
                    tgid = task.tgid,
                    process = %name,
                    "starving task matches ignore_processes, skipping"
                );
                continue;
            }
            if task.ctxsw == 0 {
                // The source could not provide a progress counter for this
                // entry. Consult the kernel-exported one; without any
                // counter we must not conclude starvation.
                if self.resolver.context_switches(task.tid).is_none() {
                    debug!(
                        cpu = cpu.cpu_id,
                        tid = task.tid,
                        "no progress counter available, not concluding starvation"
                    );
                    continue;
                }
            }
            info!(
                cpu = cpu.cpu_id,
                tid = task.tid,
                tgid = task.tgid,
                comm = %task.comm,
                prio = task.prio,
                waited_s = task.waited(now),
                "starving task detected"
            );
            targets.push(task.clone());
        }
        targets
    }
}

/// Warn once at startup when the kernel's automatic fair-server mechanism is
/// present; operators who leave it enabled may observe zero detections.
pub fn warn_if_fair_server_present() {
    if procfs::fair_server_present() {
        warn!(
            path = procfs::FAIR_SERVER_DIR,
            "kernel fair server detected: it may resolve starvation before \
             stalld observes it; disable it if stalld should be in charge"
        );
    }
}
