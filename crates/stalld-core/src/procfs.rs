//! Probes over `/proc` and `/sys` the detection pipeline depends on.
//!
//! Every probe splits into a pure parser over borrowed text and a thin
//! reader that feeds it the live kernel file, so the parsers are testable
//! without a kernel.

use std::io;
use std::path::{Path, PathBuf};

/// Locations of the kernel's scheduler debug dump, in preference order.
pub const SCHED_DEBUG_PATHS: [&str; 2] = ["/sys/kernel/debug/sched/debug", "/proc/sched_debug"];

/// Directory whose existence signals the kernel-side fair-server mechanism.
pub const FAIR_SERVER_DIR: &str = "/sys/kernel/debug/sched/fair_server";

/// First readable sched debug dump on this host, if any.
#[must_use]
pub fn find_sched_debug_path() -> Option<PathBuf> {
    SCHED_DEBUG_PATHS
        .iter()
        .map(Path::new)
        .find(|p| std::fs::File::open(p).is_ok())
        .map(Path::to_path_buf)
}

/// Whether the kernel exposes its automatic fair-server mechanism.
///
/// When present, operators who leave it enabled may observe zero detections;
/// callers log a warning once at startup and continue.
#[must_use]
pub fn fair_server_present() -> bool {
    Path::new(FAIR_SERVER_DIR).is_dir()
}

/// The single-character state token from a `/proc/<tid>/stat` line.
///
/// The state is the third whitespace-delimited field. The comm field is
/// parenthesized and may itself contain spaces, so fields are counted from
/// after the closing parenthesis.
#[must_use]
pub fn parse_stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// Whether the thread is currently runnable, per `/proc/<tid>/stat`.
///
/// Only the `R` state counts; any IO error excludes the thread (it probably
/// exited between the snapshot and the probe).
#[must_use]
pub fn thread_is_runnable(tid: libc::pid_t) -> bool {
    if tid == 0 {
        return false;
    }
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{tid}/stat")) else {
        return false;
    };
    parse_stat_state(&stat) == Some('R')
}

/// Extract the value of the `Name:` line from `/proc/<pid>/status` contents.
#[must_use]
pub fn parse_status_name(status: &str) -> Option<String> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Name:"))
        .map(|name| name.trim().to_owned())
}

/// The process-group name for a tgid, used for denylist matching.
///
/// A failed resolution returns `None`, which the detector treats as
/// "no match".
#[must_use]
pub fn process_group_name(tgid: libc::pid_t) -> Option<String> {
    if tgid <= 0 {
        return None;
    }
    let status = std::fs::read_to_string(format!("/proc/{tgid}/status")).ok()?;
    parse_status_name(&status)
}

/// The comm of a process, from `/proc/<tgid>/comm`.
///
/// Used by the queue-track source to label raw map records. A failure means
/// the process died; the record is dropped.
pub fn process_comm(tgid: libc::pid_t) -> io::Result<String> {
    if tgid == 0 {
        // tgid 0 records are the daemon's own policy operations.
        return Ok("stalld".to_owned());
    }
    let comm = std::fs::read_to_string(format!("/proc/{tgid}/comm"))?;
    Ok(comm.trim_end_matches('\n').to_owned())
}

/// Extract the value of the `Tgid:` line from `/proc/<tid>/status` contents.
#[must_use]
pub fn parse_status_tgid(status: &str) -> Option<libc::pid_t> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|value| value.trim().parse::<libc::pid_t>().ok())
}

/// The thread-group id of a thread, or 0 when it cannot be resolved.
///
/// The textual source has no tgid column, so it resolves through here; a
/// zero tgid is an accepted "unknown" in the data model.
#[must_use]
pub fn tgid_of(tid: libc::pid_t) -> libc::pid_t {
    if tid <= 0 {
        return 0;
    }
    std::fs::read_to_string(format!("/proc/{tid}/status"))
        .ok()
        .and_then(|status| parse_status_tgid(&status))
        .unwrap_or(0)
}

/// Sum of voluntary and nonvoluntary context switches from
/// `/proc/<tid>/status` contents.
#[must_use]
pub fn parse_ctxt_switches(status: &str) -> Option<u64> {
    let mut voluntary = None;
    let mut nonvoluntary = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
            voluntary = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
            nonvoluntary = rest.trim().parse::<u64>().ok();
        }
    }
    Some(voluntary? + nonvoluntary?)
}

/// Kernel-exported per-thread progress counter.
///
/// Fallback for sources that cannot provide a context-switch count; the
/// detector consults it before concluding starvation.
#[must_use]
pub fn context_switches(tid: libc::pid_t) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    parse_ctxt_switches(&status)
}

/// Cumulative idle ticks for one CPU from `/proc/stat` contents.
///
/// The per-CPU lines look like `cpu3 100 0 200 3000 ...`; the idle counter
/// is the 4th field after the token.
#[must_use]
pub fn parse_idle_ticks(stat: &str, cpu: usize) -> Option<u64> {
    let token = format!("cpu{cpu}");
    stat.lines()
        .find(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|first| first == token)
        })
        .and_then(|line| line.split_whitespace().nth(4))
        .and_then(|field| field.parse::<u64>().ok())
}

/// Read the live idle-ticks counter for one CPU.
#[must_use]
pub fn read_idle_ticks(cpu: usize) -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_idle_ticks(&stat, cpu)
}

/// Number of online CPUs.
#[must_use]
pub fn nr_cpus() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    usize::try_from(n).unwrap_or(1).max(1)
}

/// Parse a `<name> : <value>` line out of a text block, e.g.
/// `.nr_running                    : 3`.
#[must_use]
pub fn variable_long_value(block: &str, variable: &str) -> Option<i64> {
    let start = block.find(variable)?;
    let rest = &block[start + variable.len()..];
    let line_end = rest.find('\n').unwrap_or(rest.len());
    let colon = rest[..line_end].find(':')?;
    rest[colon + 1..line_end].trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_RUNNING: &str = "1234 (busy loop) R 1 1234 1234 0 -1 4194560 100 0 0 0 5 1 0 0 20";
    const STAT_SLEEPING: &str = "77 (kworker/3:1) S 2 0 0 0 -1 69238880 0 0 0 0 0 1 0 0 20";

    #[test]
    fn stat_state_is_third_field() {
        assert_eq!(parse_stat_state(STAT_RUNNING), Some('R'));
        assert_eq!(parse_stat_state(STAT_SLEEPING), Some('S'));
    }

    #[test]
    fn stat_state_survives_spaces_and_parens_in_comm() {
        let stat = "55 (weird ) (name) D 1 55 55 0 -1 0 0";
        assert_eq!(parse_stat_state(stat), Some('D'));
    }

    #[test]
    fn stat_state_of_malformed_line_is_none() {
        assert_eq!(parse_stat_state(""), None);
        assert_eq!(parse_stat_state("1234"), None);
        assert_eq!(parse_stat_state("1234 (no-state)"), None);
    }

    #[test]
    fn status_name_is_extracted() {
        let status = "Name:\tdpdk-worker\nUmask:\t0022\nState:\tR (running)\n";
        assert_eq!(parse_status_name(status), Some("dpdk-worker".to_owned()));
    }

    #[test]
    fn status_without_name_yields_none() {
        assert_eq!(parse_status_name("State:\tR (running)\n"), None);
    }

    #[test]
    fn status_tgid_is_extracted() {
        let status = "Name:\thelper\nTgid:\t4321\nPid:\t4330\n";
        assert_eq!(parse_status_tgid(status), Some(4321));
        assert_eq!(parse_status_tgid("Name:\thelper\n"), None);
    }

    #[test]
    fn ctxt_switches_sum_both_counters() {
        let status = "Name:\thelper\nvoluntary_ctxt_switches:\t150\nnonvoluntary_ctxt_switches:\t7\n";
        assert_eq!(parse_ctxt_switches(status), Some(157));
    }

    #[test]
    fn ctxt_switches_require_both_counters() {
        let status = "voluntary_ctxt_switches:\t150\n";
        assert_eq!(parse_ctxt_switches(status), None);
    }

    #[test]
    fn idle_ticks_pick_the_right_cpu_line() {
        let stat = "cpu  100 0 100 9000 5 0 0 0 0 0\n\
                    cpu0 50 0 50 4000 2 0 0 0 0 0\n\
                    cpu1 50 0 50 5000 3 0 0 0 0 0\n";
        assert_eq!(parse_idle_ticks(stat, 0), Some(4000));
        assert_eq!(parse_idle_ticks(stat, 1), Some(5000));
        assert_eq!(parse_idle_ticks(stat, 2), None);
    }

    #[test]
    fn idle_ticks_do_not_prefix_match() {
        // "cpu1" must not match the "cpu11" line.
        let stat = "cpu11 1 2 3 999 0 0 0\n";
        assert_eq!(parse_idle_ticks(stat, 1), None);
        assert_eq!(parse_idle_ticks(stat, 11), Some(999));
    }

    #[test]
    fn variable_long_value_parses_colon_lines() {
        let block = "cpu#3\n  .nr_running                    : 4\n  .rt_nr_running : 1\n";
        assert_eq!(variable_long_value(block, ".nr_running"), Some(4));
        assert_eq!(variable_long_value(block, ".rt_nr_running"), Some(1));
        assert_eq!(variable_long_value(block, ".nr_switches"), None);
    }

    #[test]
    fn variable_long_value_rejects_garbage() {
        let block = ".nr_running : many\n";
        assert_eq!(variable_long_value(block, ".nr_running"), None);
    }

    #[test]
    fn process_comm_of_tgid_zero_is_the_daemon() {
        assert_eq!(process_comm(0).expect("tgid 0 is special"), "stalld");
    }

    #[test]
    fn nr_cpus_is_positive() {
        assert!(nr_cpus() >= 1);
    }
}
