//! Per-CPU idle gate.
//!
//! Snapshotting a runqueue is the expensive part of a cycle, and a CPU that
//! accrued any idle time since the last look cannot have a starving task on
//! it. The gate compares consecutive values of the cumulative idle-ticks
//! counter from `/proc/stat` and lets the monitor skip CPUs that slept.

use crate::procfs;

/// What the gate concluded about a CPU for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// The CPU had no idle time since the last observation; snapshot it.
    Busy,
    /// The CPU accrued idle time; skip it this cycle. Retained state is left
    /// untouched, which is fine: nothing could have starved on an idle CPU.
    Idle,
}

/// Retains one idle-ticks reading per CPU between cycles.
#[derive(Debug)]
pub struct IdleGate {
    enabled: bool,
    last_ticks: Vec<Option<u64>>,
}

impl IdleGate {
    /// A gate for `nr_cpus` CPUs. A disabled gate reports every CPU busy.
    #[must_use]
    pub fn new(nr_cpus: usize, enabled: bool) -> Self {
        Self {
            enabled,
            last_ticks: vec![None; nr_cpus],
        }
    }

    /// Fold in a fresh counter reading and classify the CPU.
    ///
    /// The first observation for a CPU is always [`IdleVerdict::Busy`] so
    /// that at least one baseline snapshot happens. A missing reading
    /// (`None`) also counts as busy; the gate is an optimization, never a
    /// correctness gate.
    pub fn observe(&mut self, cpu: usize, ticks: Option<u64>) -> IdleVerdict {
        if !self.enabled {
            return IdleVerdict::Busy;
        }
        let Some(slot) = self.last_ticks.get_mut(cpu) else {
            return IdleVerdict::Busy;
        };
        let Some(ticks) = ticks else {
            return IdleVerdict::Busy;
        };
        let verdict = match *slot {
            Some(prev) if ticks > prev => IdleVerdict::Idle,
            Some(_) => IdleVerdict::Busy,
            None => IdleVerdict::Busy,
        };
        *slot = Some(ticks);
        verdict
    }

    /// Read the live counter for `cpu` and classify it.
    pub fn check(&mut self, cpu: usize) -> IdleVerdict {
        if !self.enabled {
            return IdleVerdict::Busy;
        }
        self.observe(cpu, procfs::read_idle_ticks(cpu))
    }
}
