//! Per-CPU task bookkeeping: snapshots, retained state, and the merge that
//! preserves starvation start timestamps across cycles.
//!
//! The invariant that makes detection work: a retained entry keeps its
//! `since` timestamp only while both its identity (`tid`) and its progress
//! counter (`ctxsw`) are unchanged. Any observed progress, or a tid reuse,
//! resets the clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum bytes of a thread name, matching the kernel's TASK_COMM_LEN - 1.
pub const COMM_MAX: usize = 15;

/// Identity and progress fields captured from one snapshot of a CPU's
/// runqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    /// Thread id; unique per live thread.
    pub tid: libc::pid_t,
    /// Thread group id; zero when unknown.
    pub tgid: libc::pid_t,
    /// Short thread name, at most [`COMM_MAX`] bytes.
    pub comm: String,
    /// Priority as exposed by the source; opaque, used only for logging.
    pub prio: i32,
    /// Context switches taken by this thread at snapshot time.
    pub ctxsw: u64,
    /// Wall-clock seconds of the earliest snapshot in which this thread was
    /// observed as a non-progressing runnable on this CPU.
    pub since: u64,
}

impl TaskSnapshot {
    /// Seconds this task has been waiting without progress as of `now`.
    #[must_use]
    pub const fn waited(&self, now: u64) -> u64 {
        now.saturating_sub(self.since)
    }
}

/// Lifecycle of a dedicated per-CPU monitoring worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// No worker owns this CPU; the coordinator monitors it.
    #[default]
    Detached,
    /// A worker owns this CPU; the coordinator skips it.
    Running,
    /// The worker decided to exit and is unwinding.
    Draining,
}

impl WorkerState {
    /// Encoding for storage in an atomic.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Detached => 0,
            Self::Running => 1,
            Self::Draining => 2,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8); unknown values read as Detached.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Detached,
        }
    }
}

/// Retained per-CPU working set, updated once per cycle by whoever owns the
/// CPU (a dedicated worker, or the coordinator when none exists).
#[derive(Debug, Clone)]
pub struct CpuState {
    /// CPU this state describes.
    pub cpu_id: usize,
    /// Runnable count from the latest snapshot; interpretation depends on
    /// the source.
    pub nr_running: i64,
    /// Real-time runnable count from the latest snapshot.
    pub nr_rt_running: i64,
    /// Runnable tasks not currently on the CPU, in source order. Ordering is
    /// preserved only so logs stay deterministic.
    pub waiting: Vec<TaskSnapshot>,
    /// Contiguous cycles in which this CPU had waiting tasks; adaptive
    /// scheduling uses it for escalation decisions.
    pub overloaded_cycles: u32,
}

impl CpuState {
    /// Fresh state for one CPU with no retained history.
    #[must_use]
    pub const fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            nr_running: 0,
            nr_rt_running: 0,
            waiting: Vec::new(),
            overloaded_cycles: 0,
        }
    }

    /// Drop all retained tasks, e.g. when the CPU went offline.
    pub fn clear(&mut self) {
        self.nr_running = 0;
        self.nr_rt_running = 0;
        self.waiting.clear();
        self.overloaded_cycles = 0;
    }

    /// Fold a fresh sample into the retained state, preserving `since`
    /// for entries whose identity and progress counter are unchanged.
    pub fn apply_sample(&mut self, sample: CpuSample, now: u64) {
        let mut fresh = sample.tasks;
        merge_preserving_since(&self.waiting, &mut fresh, now);
        self.nr_running = sample.nr_running;
        self.nr_rt_running = sample.nr_rt_running;
        self.waiting = fresh;
        if self.waiting.is_empty() {
            self.overloaded_cycles = 0;
        } else {
            self.overloaded_cycles = self.overloaded_cycles.saturating_add(1);
        }
    }

    /// Longest time any waiting task has gone without progress, in seconds.
    #[must_use]
    pub fn longest_wait(&self, now: u64) -> u64 {
        self.waiting.iter().map(|t| t.waited(now)).max().unwrap_or(0)
    }
}

/// One freshly read snapshot of a CPU's runqueue, before merging.
#[derive(Debug, Clone, Default)]
pub struct CpuSample {
    /// Runnable count reported by the source.
    pub nr_running: i64,
    /// Real-time runnable count reported by the source.
    pub nr_rt_running: i64,
    /// Waiting tasks in source order, each with `since` set to the sample
    /// time.
    pub tasks: Vec<TaskSnapshot>,
}

/// Reconcile a fresh task list against the retained one for the same CPU.
///
/// For each fresh entry with a prior entry of equal `tid` and equal `ctxsw`,
/// the prior `since` is carried over. Everything else keeps `now` (a new
/// observation, or observed progress, resets the clock). Prior entries with
/// no fresh match are simply forgotten.
pub fn merge_preserving_since(prior: &[TaskSnapshot], fresh: &mut [TaskSnapshot], now: u64) {
    for task in fresh.iter_mut() {
        task.since = match prior
            .iter()
            .find(|p| p.tid == task.tid && p.ctxsw == task.ctxsw)
        {
            Some(p) => p.since,
            None => now,
        };
    }
}

/// Current wall-clock time in whole seconds since the epoch.
///
/// `since` bookkeeping uses the wall clock consistently; boost deadlines use
/// the monotonic clock instead.
#[must_use]
pub fn wall_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(tid: libc::pid_t, ctxsw: u64, since: u64) -> TaskSnapshot {
        TaskSnapshot {
            tid,
            tgid: tid,
            comm: format!("task-{tid}"),
            prio: 120,
            ctxsw,
            since,
        }
    }

    #[test]
    fn merge_preserves_since_when_ctxsw_unchanged() {
        let prior = vec![task(10, 100, 50)];
        let mut fresh = vec![task(10, 100, 60)];
        merge_preserving_since(&prior, &mut fresh, 60);
        assert_eq!(fresh[0].since, 50);
    }

    #[test]
    fn merge_resets_since_on_progress() {
        let prior = vec![task(10, 100, 50)];
        let mut fresh = vec![task(10, 101, 60)];
        merge_preserving_since(&prior, &mut fresh, 60);
        assert_eq!(fresh[0].since, 60, "ctxsw advanced by one resets since");
    }

    #[test]
    fn merge_resets_since_for_new_task() {
        let prior = vec![task(10, 100, 50)];
        let mut fresh = vec![task(11, 7, 60)];
        merge_preserving_since(&prior, &mut fresh, 60);
        assert_eq!(fresh[0].since, 60);
    }

    #[test]
    fn merge_discards_absent_prior_entries() {
        let mut state = CpuState::new(0);
        state.apply_sample(
            CpuSample {
                nr_running: 2,
                nr_rt_running: 1,
                tasks: vec![task(10, 100, 50)],
            },
            50,
        );
        // Next cycle the task is gone; nothing of it survives.
        state.apply_sample(CpuSample::default(), 51);
        assert!(state.waiting.is_empty());

        // Even if it reappears with the same ctxsw, since restarts.
        state.apply_sample(
            CpuSample {
                nr_running: 2,
                nr_rt_running: 1,
                tasks: vec![task(10, 100, 52)],
            },
            52,
        );
        assert_eq!(state.waiting[0].since, 52, "no ghost detection");
    }

    #[test]
    fn self_merge_is_idempotent() {
        let prior = vec![task(10, 100, 40), task(11, 5, 45)];
        let mut fresh = prior.clone();
        merge_preserving_since(&prior, &mut fresh, 99);
        assert_eq!(fresh, prior, "re-merging a list against itself is a no-op");
    }

    #[test]
    fn since_is_monotone_across_identity_merges() {
        let mut state = CpuState::new(3);
        for now in [10, 11, 12, 13] {
            state.apply_sample(
                CpuSample {
                    nr_running: 2,
                    nr_rt_running: 1,
                    tasks: vec![task(10, 100, now)],
                },
                now,
            );
            assert_eq!(state.waiting[0].since, 10);
        }
        assert_eq!(state.waiting[0].waited(13), 3);
    }

    #[test]
    fn overloaded_cycles_track_contiguous_pressure() {
        let mut state = CpuState::new(0);
        let busy = |now| CpuSample {
            nr_running: 2,
            nr_rt_running: 1,
            tasks: vec![task(10, 100, now)],
        };
        state.apply_sample(busy(1), 1);
        state.apply_sample(busy(2), 2);
        assert_eq!(state.overloaded_cycles, 2);
        state.apply_sample(CpuSample::default(), 3);
        assert_eq!(state.overloaded_cycles, 0);
    }

    #[test]
    fn longest_wait_over_empty_list_is_zero() {
        let state = CpuState::new(0);
        assert_eq!(state.longest_wait(1_000), 0);
    }

    #[test]
    fn longest_wait_picks_the_oldest_entry() {
        let mut state = CpuState::new(0);
        state.waiting = vec![task(1, 1, 90), task(2, 2, 70), task(3, 3, 80)];
        assert_eq!(state.longest_wait(100), 30);
    }

    #[test]
    fn clear_resets_everything() {
        let mut state = CpuState::new(0);
        state.apply_sample(
            CpuSample {
                nr_running: 3,
                nr_rt_running: 2,
                tasks: vec![task(10, 100, 50)],
            },
            50,
        );
        state.clear();
        assert_eq!(state.nr_running, 0);
        assert_eq!(state.nr_rt_running, 0);
        assert!(state.waiting.is_empty());
    }
}
