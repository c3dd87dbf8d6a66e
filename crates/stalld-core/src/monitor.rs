//! Monitoring strategies.
//!
//! One strategy is selected at startup and drives the cycle across CPUs:
//!
//! - **power**: one thread, all CPUs, vectorized deadline boosting; the
//!   cheapest steady state and the least precise.
//! - **adaptive**: one coordinator; when a CPU's longest wait crosses half
//!   the starving threshold, a dedicated worker is spawned for it and owns
//!   it until the CPU has been quiet for [`ADAPTIVE_IDLE_CYCLES`] cycles.
//! - **aggressive**: one permanent worker per CPU, no coordinator.
//!
//! Ownership rules: a CPU's retained [`CpuState`] has exactly one writer at
//! a time, the coordinator while detached, the dedicated worker while
//! running. The coordinator skips CPUs whose worker is not detached and
//! re-includes them once it observes detached again. The boost engine's
//! booster set is the only cross-CPU shared mutable structure.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::boost::{BoostEngine, BoostMethod, BoostTarget};
use crate::config::{Config, Strategy};
use crate::detector::Detector;
use crate::error::{ErrorKind, StalldError, StalldResult};
use crate::idle::{IdleGate, IdleVerdict};
use crate::procfs;
use crate::shutdown::ShutdownFlag;
use crate::source::RunqueueSource;
use crate::task::{CpuState, WorkerState, wall_now};
use crate::tracing_config::span_names;

/// Contiguous cycles without waiting tasks after which an adaptive worker
/// drains.
pub const ADAPTIVE_IDLE_CYCLES: u32 = 10;

/// Log a per-cycle source failure at a level escalating with the streak of
/// consecutive failures. Source errors are never fatal; a persistently
/// broken source deserves louder lines.
fn log_source_failure(streak: u32, err: &StalldError) {
    match streak {
        0..=2 => debug!(streak, %err, "snapshot unavailable, skipping cycle"),
        3..=9 => warn!(streak, %err, "snapshot unavailable, skipping cycle"),
        _ => error!(streak, %err, "snapshot persistently unavailable"),
    }
}

/// Whether a CPU's longest wait justifies a dedicated worker.
///
/// Workers dispatch at half the starving threshold so they are in place
/// before the first boost is due.
#[must_use]
pub const fn worker_spawn_due(max_wait: u64, threshold: u64) -> bool {
    max_wait > 0 && max_wait * 2 >= threshold
}

/// One CPU's shared slot: retained state plus the worker lifecycle flag.
#[derive(Debug)]
struct CpuSlot {
    cpu: usize,
    state: Mutex<CpuState>,
    worker: AtomicU8,
}

impl CpuSlot {
    fn new(cpu: usize) -> Self {
        Self {
            cpu,
            state: Mutex::new(CpuState::new(cpu)),
            worker: AtomicU8::new(WorkerState::Detached.as_u8()),
        }
    }

    fn worker_state(&self) -> WorkerState {
        WorkerState::from_u8(self.worker.load(Ordering::Acquire))
    }

    fn set_worker_state(&self, state: WorkerState) {
        self.worker.store(state.as_u8(), Ordering::Release);
    }

    fn lock_state(&self) -> MutexGuard<'_, CpuState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The monitoring driver; owns the primary source handle and runs the
/// configured strategy until shutdown.
pub struct Monitor {
    config: Arc<Config>,
    engine: Arc<BoostEngine>,
    detector: Arc<Detector>,
    shutdown: Arc<ShutdownFlag>,
    source: RunqueueSource,
    cpus: Vec<usize>,
}

impl Monitor {
    /// Assemble the monitor over the monitored CPU set.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        engine: Arc<BoostEngine>,
        detector: Arc<Detector>,
        shutdown: Arc<ShutdownFlag>,
        source: RunqueueSource,
    ) -> Self {
        let cpus = config
            .monitored_cpus
            .clone()
            .unwrap_or_else(|| (0..procfs::nr_cpus()).collect());
        Self {
            config,
            engine,
            detector,
            shutdown,
            source,
            cpus,
        }
    }

    /// Run the configured strategy to completion.
    ///
    /// # Errors
    ///
    /// [`StalldError::DeadlineRequired`] when the power strategy meets a
    /// host without SCHED_DEADLINE; capability failures during boosting
    /// also surface here. Per-cycle source errors never do.
    pub fn run(mut self) -> StalldResult<()> {
        info!(
            strategy = self.config.strategy.name(),
            backend = self.source.name(),
            method = self.engine.method().name(),
            cpus = self.cpus.len(),
            "monitoring started"
        );
        if self.config.strategy == Strategy::Power
            && self.engine.method() != BoostMethod::Deadline
        {
            return Err(StalldError::DeadlineRequired { strategy: "power" });
        }
        let result = match self.config.strategy {
            Strategy::Power => self.run_power(),
            Strategy::Adaptive => self.run_adaptive(),
            Strategy::Aggressive => self.run_aggressive(),
        };
        self.source.destroy();
        info!("monitoring stopped");
        result
    }

    fn gate(&self) -> IdleGate {
        let slots = self.cpus.iter().max().map_or(1, |&m| m + 1);
        IdleGate::new(slots, self.config.idle_gate)
    }

    /// Single-threaded strategy: one pass over all CPUs, one shared boost
    /// sleep.
    fn run_power(&mut self) -> StalldResult<()> {
        let mut gate = self.gate();
        let mut states: Vec<CpuState> = self.cpus.iter().map(|&c| CpuState::new(c)).collect();
        let mut failure_streak = 0u32;

        while !self.shutdown.is_set() {
            // A cycle spans one pass plus its granularity spacing.
            let _cycle = tracing::debug_span!(span_names::CYCLE, strategy = "power").entered();
            let now = wall_now();
            let mut targets = Vec::new();

            match self.source.begin_cycle() {
                Ok(()) => {
                    failure_streak = 0;
                    for (i, &cpu) in self.cpus.iter().enumerate() {
                        if gate.check(cpu) == IdleVerdict::Idle {
                            continue;
                        }
                        let state = &mut states[i];
                        match self.source.sample_cpu(cpu, now) {
                            Ok(Some(sample)) => state.apply_sample(sample, now),
                            Ok(None) => {
                                state.clear();
                                continue;
                            }
                            Err(err) => {
                                warn!(cpu, %err, "dropping cpu from this cycle");
                                continue;
                            }
                        }
                        if !self.source.has_starving_candidate(state) {
                            continue;
                        }
                        for task in self.detector.starving_targets(state, now) {
                            targets.push(BoostTarget { cpu, task });
                        }
                    }
                }
                Err(err) => {
                    failure_streak += 1;
                    log_source_failure(failure_streak, &err);
                }
            }

            if !targets.is_empty() {
                if self.config.log_only {
                    info!(
                        targets = targets.len(),
                        "log-only mode: starving tasks left unboosted"
                    );
                } else {
                    self.engine.boost_vector(&targets, &self.shutdown)?;
                }
            }
            self.shutdown.sleep_for(self.config.cycle_interval());
        }
        Ok(())
    }

    /// Coordinator plus on-demand per-CPU workers.
    fn run_adaptive(&mut self) -> StalldResult<()> {
        let slots: Vec<Arc<CpuSlot>> = self
            .cpus
            .iter()
            .map(|&c| Arc::new(CpuSlot::new(c)))
            .collect();
        let mut gate = self.gate();
        let mut handles: Vec<thread::JoinHandle<()>> = Vec::new();
        let mut failure_streak = 0u32;

        while !self.shutdown.is_set() {
            let _cycle = tracing::debug_span!(span_names::CYCLE, strategy = "adaptive").entered();
            let now = wall_now();
            handles.retain(|h| !h.is_finished());

            match self.source.begin_cycle() {
                Ok(()) => {
                    failure_streak = 0;
                    for slot in &slots {
                        // A worker owns this CPU until the coordinator
                        // observes it detached again.
                        if slot.worker_state() != WorkerState::Detached {
                            continue;
                        }
                        if gate.check(slot.cpu) == IdleVerdict::Idle {
                            continue;
                        }
                        let max_wait = {
                            let mut state = slot.lock_state();
                            match self.source.sample_cpu(slot.cpu, now) {
                                Ok(Some(sample)) => state.apply_sample(sample, now),
                                Ok(None) => {
                                    state.clear();
                                    continue;
                                }
                                Err(err) => {
                                    warn!(cpu = slot.cpu, %err, "dropping cpu from this cycle");
                                    continue;
                                }
                            }
                            if !self.source.has_starving_candidate(&state) {
                                continue;
                            }
                            state.longest_wait(now)
                        };
                        // Spawn once waits cross half the threshold; the
                        // worker then handles detection and boosting.
                        if worker_spawn_due(max_wait, self.config.starving_threshold) {
                            info!(
                                cpu = slot.cpu,
                                max_wait_s = max_wait,
                                "dispatching dedicated worker"
                            );
                            handles.push(self.spawn_worker(
                                Arc::clone(slot),
                                Some(ADAPTIVE_IDLE_CYCLES),
                            )?);
                        }
                    }
                }
                Err(err) => {
                    failure_streak += 1;
                    log_source_failure(failure_streak, &err);
                }
            }
            self.shutdown.sleep_for(self.config.cycle_interval());
        }

        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// One permanent worker per CPU.
    fn run_aggressive(&mut self) -> StalldResult<()> {
        let mut handles = Vec::with_capacity(self.cpus.len());
        for &cpu in &self.cpus {
            let slot = Arc::new(CpuSlot::new(cpu));
            handles.push(self.spawn_worker(slot, None)?);
        }
        while !self.shutdown.is_set() {
            self.shutdown.sleep_for(self.config.cycle_interval());
        }
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        slot: Arc<CpuSlot>,
        drain_after: Option<u32>,
    ) -> StalldResult<thread::JoinHandle<()>> {
        // Marked running before the thread exists so the coordinator cannot
        // double-spawn within the same cycle.
        slot.set_worker_state(WorkerState::Running);
        let ctx = WorkerContext {
            slot,
            source: self.source.worker_view(),
            engine: Arc::clone(&self.engine),
            detector: Arc::clone(&self.detector),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            drain_after,
        };
        let cpu = ctx.slot.cpu;
        thread::Builder::new()
            .name(format!("stalld-cpu{cpu}"))
            .spawn(move || run_cpu_worker(ctx))
            .map_err(StalldError::Io)
    }
}

struct WorkerContext {
    slot: Arc<CpuSlot>,
    source: RunqueueSource,
    engine: Arc<BoostEngine>,
    detector: Arc<Detector>,
    config: Arc<Config>,
    shutdown: Arc<ShutdownFlag>,
    drain_after: Option<u32>,
}

/// Body of a dedicated per-CPU worker.
///
/// The worker owns its CPU's retained state for its whole life and boosts
/// targets one at a time (the fixed-priority path cannot be vectorized).
fn run_cpu_worker(mut ctx: WorkerContext) {
    let cpu = ctx.slot.cpu;
    let _worker = tracing::debug_span!(span_names::CPU_WORKER, cpu).entered();
    debug!("cpu worker started");
    let mut gate = IdleGate::new(cpu + 1, ctx.config.idle_gate);
    let mut quiet_cycles = 0u32;

    while !ctx.shutdown.is_set() {
        let _cycle = tracing::debug_span!(span_names::CYCLE, strategy = "worker").entered();
        let now = wall_now();
        let mut had_waiting = false;

        if gate.check(cpu) == IdleVerdict::Busy {
            let targets = {
                let mut state = ctx.slot.lock_state();
                match ctx
                    .source
                    .begin_cycle()
                    .and_then(|()| ctx.source.sample_cpu(cpu, now))
                {
                    Ok(Some(sample)) => state.apply_sample(sample, now),
                    Ok(None) => state.clear(),
                    Err(err) => {
                        warn!(cpu, %err, "snapshot failed, skipping cycle");
                        drop(state);
                        ctx.shutdown.sleep_for(ctx.config.cycle_interval());
                        continue;
                    }
                }
                had_waiting = !state.waiting.is_empty();
                if ctx.source.has_starving_candidate(&state) {
                    ctx.detector.starving_targets(&state, now)
                } else {
                    Vec::new()
                }
                // The state lock drops here; boosting sleeps and must not
                // hold it.
            };

            for task in targets {
                if ctx.shutdown.is_set() {
                    break;
                }
                if ctx.config.log_only {
                    info!(
                        cpu,
                        tid = task.tid,
                        comm = %task.comm,
                        "log-only mode: starving task left unboosted"
                    );
                    continue;
                }
                match ctx.engine.boost(cpu, &task, &ctx.shutdown) {
                    Ok(outcome) => debug!(cpu, tid = task.tid, ?outcome, "boost finished"),
                    Err(err) if err.kind() == ErrorKind::Permission => {
                        error!(cpu, %err, "cannot set scheduling attributes, shutting down");
                        ctx.shutdown.request();
                        break;
                    }
                    Err(err) => warn!(cpu, tid = task.tid, %err, "boost failed"),
                }
            }
        }

        if let Some(limit) = ctx.drain_after {
            if had_waiting {
                quiet_cycles = 0;
            } else {
                quiet_cycles += 1;
                if quiet_cycles >= limit {
                    ctx.slot.set_worker_state(WorkerState::Draining);
                    debug!(cpu, quiet_cycles, "cpu quiet, worker draining");
                    break;
                }
            }
        }
        ctx.shutdown.sleep_for(ctx.config.cycle_interval());
    }

    ctx.slot.set_worker_state(WorkerState::Detached);
    debug!(cpu, "cpu worker exited");
}
