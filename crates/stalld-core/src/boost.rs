//! Boost engine: bounded-duration scheduling elevation with guaranteed
//! restoration.
//!
//! Two elevation methods exist. **Deadline** hands the target a
//! SCHED_DEADLINE reservation of `runtime` out of `period` nanoseconds and
//! restores after the boost duration. **Fixed-priority** is the fallback for
//! hosts without usable SCHED_DEADLINE: it emulates the same bandwidth bound
//! by toggling SCHED_FIFO on for `runtime` and off for `period − runtime`,
//! repeated until the duration elapses. A FIFO task left elevated unbounded
//! would reintroduce the very starvation being fixed.
//!
//! Invariants enforced here:
//!
//! - every opened session is closed by a restoration attempt with the saved
//!   attributes, on every path including shutdown and errors ([`Session`]
//!   restores on drop);
//! - at most one session per tid process-wide (`active_boosters`);
//! - no lock is held across a sleep, so the signal path never waits on a
//!   sleeping worker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{StalldError, StalldResult};
use crate::shutdown::ShutdownFlag;
use crate::sys::{SchedAttr, SchedControl, deadline_available};
use crate::task::TaskSnapshot;
use crate::tracing_config::span_names;

/// Which elevation mechanism is in force, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostMethod {
    /// SCHED_DEADLINE with the configured runtime/period.
    Deadline,
    /// SCHED_FIFO quantum train emulating the deadline bandwidth.
    FixedPriority,
}

impl BoostMethod {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::FixedPriority => "fifo",
        }
    }
}

/// Run the method probe, honoring the force flag.
#[must_use]
pub fn select_method(ctl: &dyn SchedControl, force_fifo: bool) -> BoostMethod {
    if force_fifo {
        info!("fixed-priority boosting forced by configuration");
        return BoostMethod::FixedPriority;
    }
    if deadline_available(ctl) {
        info!("SCHED_DEADLINE is available, using the deadline method");
        BoostMethod::Deadline
    } else {
        info!("SCHED_DEADLINE unavailable, falling back to SCHED_FIFO boosting");
        BoostMethod::FixedPriority
    }
}

/// How one boost request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostOutcome {
    /// A session ran to completion (or to shutdown) and was restored.
    Boosted,
    /// Another worker already holds a session for this tid; skipped.
    AlreadyBoosted,
    /// The target exited before or during the session.
    TargetVanished,
}

/// A detection result bound to the CPU it was observed on.
#[derive(Debug, Clone)]
pub struct BoostTarget {
    /// CPU the task was starving on.
    pub cpu: usize,
    /// The starving task.
    pub task: TaskSnapshot,
}

/// The process-wide boost engine.
pub struct BoostEngine {
    ctl: Arc<dyn SchedControl>,
    method: BoostMethod,
    runtime_ns: u64,
    period_ns: u64,
    duration: Duration,
    fifo_priority: u32,
    active_boosters: Mutex<HashSet<libc::pid_t>>,
}

impl BoostEngine {
    /// An engine with explicit timing, used directly by tests.
    #[must_use]
    pub fn new(
        ctl: Arc<dyn SchedControl>,
        method: BoostMethod,
        runtime_ns: u64,
        period_ns: u64,
        duration: Duration,
        fifo_priority: u32,
    ) -> Self {
        Self {
            ctl,
            method,
            runtime_ns,
            period_ns,
            duration,
            fifo_priority,
            active_boosters: Mutex::new(HashSet::new()),
        }
    }

    /// The production engine, timed from the frozen config.
    #[must_use]
    pub fn from_config(ctl: Arc<dyn SchedControl>, method: BoostMethod, config: &Config) -> Self {
        Self::new(
            ctl,
            method,
            config.boost_runtime_ns,
            config.boost_period_ns,
            config.boost_duration(),
            config.fifo_priority,
        )
    }

    /// The method in force.
    #[must_use]
    pub const fn method(&self) -> BoostMethod {
        self.method
    }

    /// Whether a session is currently open for `tid`.
    #[must_use]
    pub fn is_active(&self, tid: libc::pid_t) -> bool {
        self.lock_active().contains(&tid)
    }

    /// Boost one task and block until its session closed.
    ///
    /// # Errors
    ///
    /// Policy and permission failures on a live target propagate; the caller
    /// logs and carries on with the next target. The booster flag is always
    /// cleared before returning.
    pub fn boost(
        &self,
        cpu: usize,
        task: &TaskSnapshot,
        shutdown: &ShutdownFlag,
    ) -> StalldResult<BoostOutcome> {
        let _span = tracing::debug_span!(
            span_names::BOOST,
            cpu,
            tid = task.tid,
            method = self.method.name()
        )
        .entered();
        if !self.try_acquire(task.tid) {
            debug!(cpu, tid = task.tid, "boost already in flight, skipping");
            return Ok(BoostOutcome::AlreadyBoosted);
        }
        let saved = match self.ctl.get_attr(task.tid) {
            Ok(saved) => saved,
            Err(err) => {
                self.release(task.tid);
                return vanished_or_err(cpu, task, err);
            }
        };
        info!(
            cpu,
            tid = task.tid,
            comm = %task.comm,
            method = self.method.name(),
            saved_policy = saved.policy_name(),
            "boosting starving task"
        );
        match self.method {
            BoostMethod::Deadline => self.deadline_session(cpu, task, saved, shutdown),
            BoostMethod::FixedPriority => self.fifo_session(cpu, task, saved, shutdown),
        }
    }

    /// Boost a batch of targets with one shared sleep.
    ///
    /// Opens deadline sessions for every target before sleeping, sleeps the
    /// common boost duration once, then restores all. Per-target failures
    /// are contained: a target that cannot be elevated is skipped, the rest
    /// of the vector proceeds.
    ///
    /// # Errors
    ///
    /// [`StalldError::InvalidConfig`] when called with the fixed-priority
    /// method in force; only the deadline method can share a sleep.
    pub fn boost_vector(
        &self,
        targets: &[BoostTarget],
        shutdown: &ShutdownFlag,
    ) -> StalldResult<usize> {
        if self.method != BoostMethod::Deadline {
            return Err(StalldError::InvalidConfig {
                field: "strategy",
                value: "power".into(),
                reason: "vectorized boosting requires the deadline method".into(),
            });
        }
        let _span = tracing::debug_span!(
            span_names::BOOST,
            targets = targets.len(),
            method = self.method.name()
        )
        .entered();
        let boosted_attr = SchedAttr::deadline(self.runtime_ns, self.period_ns);
        let mut sessions = Vec::with_capacity(targets.len());
        let mut permission_failure = None;
        for target in targets {
            let task = &target.task;
            if !self.try_acquire(task.tid) {
                debug!(cpu = target.cpu, tid = task.tid, "boost already in flight, skipping");
                continue;
            }
            let saved = match self.ctl.get_attr(task.tid) {
                Ok(saved) => saved,
                Err(err) => {
                    self.release(task.tid);
                    log_skipped(target, &err);
                    if matches!(err, StalldError::Permission { .. }) {
                        permission_failure = Some(err);
                    }
                    continue;
                }
            };
            if let Err(err) = self.ctl.set_attr(task.tid, &boosted_attr) {
                self.release(task.tid);
                log_skipped(target, &err);
                if matches!(err, StalldError::Permission { .. }) {
                    permission_failure = Some(err);
                }
                continue;
            }
            info!(
                cpu = target.cpu,
                tid = task.tid,
                comm = %task.comm,
                method = "deadline",
                "boosting starving task"
            );
            sessions.push(Session::open(self, target.cpu, task, saved));
        }
        let count = sessions.len();
        if count > 0 {
            shutdown.sleep_for(self.duration);
            for mut session in sessions {
                session.close();
            }
        }
        // A capability failure means every future boost will fail too;
        // surface it once every opened session has been closed.
        if let Some(err) = permission_failure {
            return Err(err);
        }
        Ok(count)
    }

    fn deadline_session(
        &self,
        cpu: usize,
        task: &TaskSnapshot,
        saved: SchedAttr,
        shutdown: &ShutdownFlag,
    ) -> StalldResult<BoostOutcome> {
        let boosted = SchedAttr::deadline(self.runtime_ns, self.period_ns);
        if let Err(err) = self.ctl.set_attr(task.tid, &boosted) {
            self.release(task.tid);
            return vanished_or_err(cpu, task, err);
        }
        let mut session = Session::open(self, cpu, task, saved);
        shutdown.sleep_for(self.duration);
        Ok(session.close())
    }

    /// Emulate deadline bandwidth with SCHED_FIFO quanta: `runtime` on,
    /// `period − runtime` off, until the boost duration has elapsed.
    fn fifo_session(
        &self,
        cpu: usize,
        task: &TaskSnapshot,
        saved: SchedAttr,
        shutdown: &ShutdownFlag,
    ) -> StalldResult<BoostOutcome> {
        let boosted = SchedAttr::fifo(self.fifo_priority);
        let on = Duration::from_nanos(self.runtime_ns);
        let off = Duration::from_nanos(self.period_ns - self.runtime_ns);
        let started = Instant::now();

        if let Err(err) = self.ctl.set_attr(task.tid, &boosted) {
            self.release(task.tid);
            return vanished_or_err(cpu, task, err);
        }
        let mut session = Session::open(self, cpu, task, saved);

        loop {
            std::thread::sleep(on);
            // End of the quantum: drop back to the saved attributes.
            if self.ctl.set_attr(task.tid, &session.saved).is_err() {
                break;
            }
            if started.elapsed() >= self.duration || shutdown.is_set() {
                break;
            }
            if shutdown.sleep_for(off) {
                break;
            }
            if self.ctl.set_attr(task.tid, &boosted).is_err() {
                break;
            }
        }
        Ok(session.close())
    }

    fn try_acquire(&self, tid: libc::pid_t) -> bool {
        self.lock_active().insert(tid)
    }

    fn release(&self, tid: libc::pid_t) {
        self.lock_active().remove(&tid);
    }

    fn lock_active(&self) -> MutexGuard<'_, HashSet<libc::pid_t>> {
        match self.active_boosters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for BoostEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoostEngine")
            .field("method", &self.method)
            .field("runtime_ns", &self.runtime_ns)
            .field("period_ns", &self.period_ns)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// An open boost session. Restores the saved attributes and clears the
/// booster flag exactly once, on [`close`](Self::close) or on drop.
struct Session<'a> {
    engine: &'a BoostEngine,
    cpu: usize,
    tid: libc::pid_t,
    comm: String,
    saved: SchedAttr,
    closed: bool,
}

impl<'a> Session<'a> {
    fn open(engine: &'a BoostEngine, cpu: usize, task: &TaskSnapshot, saved: SchedAttr) -> Self {
        Self {
            engine,
            cpu,
            tid: task.tid,
            comm: task.comm.clone(),
            saved,
            closed: false,
        }
    }

    fn close(&mut self) -> BoostOutcome {
        if self.closed {
            return BoostOutcome::Boosted;
        }
        self.closed = true;
        let outcome = match self.engine.ctl.set_attr(self.tid, &self.saved) {
            Ok(()) => {
                debug!(
                    cpu = self.cpu,
                    tid = self.tid,
                    comm = %self.comm,
                    restored_policy = self.saved.policy_name(),
                    "boost session closed, attributes restored"
                );
                BoostOutcome::Boosted
            }
            Err(StalldError::TargetVanished { .. }) => {
                info!(
                    cpu = self.cpu,
                    tid = self.tid,
                    comm = %self.comm,
                    "boosted task exited before restoration"
                );
                BoostOutcome::TargetVanished
            }
            Err(err) => {
                // Restoration errors never propagate; the session still
                // closes and the flag clears.
                warn!(
                    cpu = self.cpu,
                    tid = self.tid,
                    comm = %self.comm,
                    %err,
                    "failed to restore attributes after boost"
                );
                BoostOutcome::Boosted
            }
        };
        self.engine.release(self.tid);
        outcome
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

fn vanished_or_err(
    cpu: usize,
    task: &TaskSnapshot,
    err: StalldError,
) -> StalldResult<BoostOutcome> {
    match err {
        StalldError::TargetVanished { .. } => {
            info!(cpu, tid = task.tid, comm = %task.comm, "target exited before boost");
            Ok(BoostOutcome::TargetVanished)
        }
        other => Err(other),
    }
}

fn log_skipped(target: &BoostTarget, err: &StalldError) {
    match err {
        StalldError::TargetVanished { .. } => {
            info!(
                cpu = target.cpu,
                tid = target.task.tid,
                "target exited before boost"
            );
        }
        other => {
            warn!(
                cpu = target.cpu,
                tid = target.task.tid,
                err = %other,
                "could not open boost session"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::sys::{SCHED_DEADLINE, SCHED_FIFO, SCHED_OTHER};

    /// Records every attribute set and can simulate exits and EBUSY-style
    /// failures at chosen points.
    #[derive(Default)]
    struct MockSched {
        sets: Mutex<Vec<(libc::pid_t, SchedAttr)>>,
        vanished: AtomicBool,
        vanish_on_restore: AtomicBool,
        fail_get: AtomicBool,
    }

    impl MockSched {
        fn sets(&self) -> Vec<(libc::pid_t, SchedAttr)> {
            self.sets.lock().expect("mock lock").clone()
        }

        fn policies(&self) -> Vec<u32> {
            self.sets().iter().map(|(_, a)| a.sched_policy).collect()
        }
    }

    impl SchedControl for MockSched {
        fn get_attr(&self, tid: libc::pid_t) -> StalldResult<SchedAttr> {
            if self.fail_get.load(Ordering::Relaxed) {
                return Err(StalldError::TargetVanished { tid });
            }
            let mut attr = SchedAttr::new();
            attr.sched_policy = SCHED_OTHER;
            attr.sched_nice = 5;
            Ok(attr)
        }

        fn set_attr(&self, tid: libc::pid_t, attr: &SchedAttr) -> StalldResult<()> {
            if self.vanished.load(Ordering::Relaxed) {
                return Err(StalldError::TargetVanished { tid });
            }
            if self.vanish_on_restore.load(Ordering::Relaxed)
                && attr.sched_policy != SCHED_DEADLINE
                && attr.sched_policy != SCHED_FIFO
            {
                return Err(StalldError::TargetVanished { tid });
            }
            self.sets.lock().expect("mock lock").push((tid, *attr));
            Ok(())
        }
    }

    fn task(tid: libc::pid_t) -> TaskSnapshot {
        TaskSnapshot {
            tid,
            tgid: tid,
            comm: format!("victim-{tid}"),
            prio: 120,
            ctxsw: 10,
            since: 0,
        }
    }

    fn engine(ctl: Arc<MockSched>, method: BoostMethod) -> BoostEngine {
        // Millisecond-scale timing keeps the tests fast while exercising the
        // same paths.
        BoostEngine::new(
            ctl,
            method,
            2_000_000,  // 2 ms on
            10_000_000, // 10 ms period
            Duration::from_millis(25),
            1,
        )
    }

    #[test]
    fn deadline_session_applies_then_restores() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);
        let shutdown = ShutdownFlag::new();

        let outcome = engine.boost(3, &task(100), &shutdown).expect("boost");
        assert_eq!(outcome, BoostOutcome::Boosted);

        let policies = ctl.policies();
        assert_eq!(policies.first(), Some(&SCHED_DEADLINE));
        assert_eq!(policies.last(), Some(&SCHED_OTHER), "saved attrs restored");
        assert!(!engine.is_active(100), "booster flag cleared");
    }

    #[test]
    fn restore_applies_the_exact_saved_attributes() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);
        engine.boost(0, &task(7), &ShutdownFlag::new()).expect("boost");

        let sets = ctl.sets();
        let restored = &sets.last().expect("restore happened").1;
        assert_eq!(restored.sched_policy, SCHED_OTHER);
        assert_eq!(restored.sched_nice, 5, "idempotence: saved attrs round-trip");
    }

    #[test]
    fn concurrent_boost_of_same_tid_is_skipped() {
        let ctl = Arc::new(MockSched::default());
        let engine = Arc::new(BoostEngine::new(
            Arc::clone(&ctl) as Arc<dyn SchedControl>,
            BoostMethod::Deadline,
            2_000_000,
            10_000_000,
            Duration::from_millis(400),
            1,
        ));
        let shutdown = Arc::new(ShutdownFlag::new());

        let e2 = Arc::clone(&engine);
        let s2 = Arc::clone(&shutdown);
        let first = std::thread::spawn(move || e2.boost(0, &task(55), &s2).expect("boost"));
        // Wait until the first session is visibly open.
        while !engine.is_active(55) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let second = engine.boost(1, &task(55), &shutdown).expect("boost");
        assert_eq!(second, BoostOutcome::AlreadyBoosted);
        assert_eq!(first.join().expect("join"), BoostOutcome::Boosted);
        assert!(!engine.is_active(55));
    }

    #[test]
    fn vanish_before_save_closes_cleanly() {
        let ctl = Arc::new(MockSched::default());
        ctl.fail_get.store(true, Ordering::Relaxed);
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);

        let outcome = engine
            .boost(0, &task(60), &ShutdownFlag::new())
            .expect("vanish is not an error");
        assert_eq!(outcome, BoostOutcome::TargetVanished);
        assert!(ctl.sets().is_empty(), "no session was opened");
        assert!(!engine.is_active(60));
    }

    #[test]
    fn vanish_at_restore_is_contained_and_clears_the_flag() {
        let ctl = Arc::new(MockSched::default());
        ctl.vanish_on_restore.store(true, Ordering::Relaxed);
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);

        let outcome = engine
            .boost(0, &task(61), &ShutdownFlag::new())
            .expect("vanish is not an error");
        assert_eq!(outcome, BoostOutcome::TargetVanished);
        assert!(!engine.is_active(61), "flag cleared even when target died");
        // A new session for the same tid can open afterwards.
        ctl.vanish_on_restore.store(false, Ordering::Relaxed);
        assert_eq!(
            engine.boost(0, &task(61), &ShutdownFlag::new()).expect("boost"),
            BoostOutcome::Boosted
        );
    }

    #[test]
    fn apply_failure_leaves_no_session() {
        let ctl = Arc::new(MockSched::default());
        ctl.vanished.store(true, Ordering::Relaxed);
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);
        let outcome = engine
            .boost(0, &task(62), &ShutdownFlag::new())
            .expect("vanish maps to an outcome");
        assert_eq!(outcome, BoostOutcome::TargetVanished);
        assert!(!engine.is_active(62));
    }

    #[test]
    fn fifo_session_alternates_and_finishes_restored() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::FixedPriority);
        let outcome = engine
            .boost(2, &task(70), &ShutdownFlag::new())
            .expect("boost");
        assert_eq!(outcome, BoostOutcome::Boosted);

        let policies = ctl.policies();
        assert_eq!(policies.first(), Some(&SCHED_FIFO));
        assert_eq!(policies.last(), Some(&SCHED_OTHER));
        assert!(
            policies.iter().filter(|&&p| p == SCHED_FIFO).count() >= 2,
            "the quantum train must repeat within the boost duration"
        );
        assert!(!engine.is_active(70));
    }

    #[test]
    fn fifo_quanta_bound_elevated_time() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::FixedPriority);
        engine.boost(2, &task(71), &ShutdownFlag::new()).expect("boost");

        // Every FIFO set is followed by a restore; the task is never left
        // elevated between quanta.
        let policies = ctl.policies();
        for pair in policies.windows(2) {
            if pair[0] == SCHED_FIFO {
                assert_ne!(pair[1], SCHED_FIFO, "two elevations with no restore");
            }
        }
    }

    #[test]
    fn shutdown_interrupts_a_session_and_still_restores() {
        let ctl = Arc::new(MockSched::default());
        let engine = Arc::new(BoostEngine::new(
            Arc::clone(&ctl) as Arc<dyn SchedControl>,
            BoostMethod::Deadline,
            2_000_000,
            10_000_000,
            Duration::from_secs(60),
            1,
        ));
        let shutdown = Arc::new(ShutdownFlag::new());

        let e = Arc::clone(&engine);
        let s = Arc::clone(&shutdown);
        let worker = std::thread::spawn(move || e.boost(0, &task(80), &s).expect("boost"));
        std::thread::sleep(Duration::from_millis(20));
        shutdown.request();
        let started = Instant::now();
        let outcome = worker.join().expect("join");
        assert!(started.elapsed() < Duration::from_secs(5), "prompt exit");
        assert_eq!(outcome, BoostOutcome::Boosted);
        assert_eq!(ctl.policies().last(), Some(&SCHED_OTHER));
        assert!(!engine.is_active(80));
    }

    #[test]
    fn vector_boost_requires_deadline_method() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(ctl, BoostMethod::FixedPriority);
        let err = engine
            .boost_vector(
                &[BoostTarget {
                    cpu: 0,
                    task: task(1),
                }],
                &ShutdownFlag::new(),
            )
            .unwrap_err();
        assert!(matches!(err, StalldError::InvalidConfig { .. }));
    }

    #[test]
    fn vector_boost_opens_all_before_the_shared_sleep() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);
        let targets: Vec<BoostTarget> = (1..=3)
            .map(|tid| BoostTarget {
                cpu: 0,
                task: task(tid),
            })
            .collect();
        let boosted = engine
            .boost_vector(&targets, &ShutdownFlag::new())
            .expect("vector boost");
        assert_eq!(boosted, 3);

        // First three sets are the elevations, last three the restores.
        let policies = ctl.policies();
        assert_eq!(policies.len(), 6);
        assert!(policies[..3].iter().all(|&p| p == SCHED_DEADLINE));
        assert!(policies[3..].iter().all(|&p| p == SCHED_OTHER));
        for tid in 1..=3 {
            assert!(!engine.is_active(tid));
        }
    }

    #[test]
    fn vector_boost_contains_individual_failures() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);
        // Mark tid 2 as already being boosted elsewhere.
        assert!(engine.try_acquire(2));
        let targets: Vec<BoostTarget> = (1..=3)
            .map(|tid| BoostTarget {
                cpu: 0,
                task: task(tid),
            })
            .collect();
        let boosted = engine
            .boost_vector(&targets, &ShutdownFlag::new())
            .expect("vector boost");
        assert_eq!(boosted, 2, "the busy tid is skipped, the rest proceed");
        assert!(engine.is_active(2), "foreign session untouched");
        engine.release(2);
    }

    #[test]
    fn empty_vector_is_a_no_op() {
        let ctl = Arc::new(MockSched::default());
        let engine = engine(Arc::clone(&ctl), BoostMethod::Deadline);
        assert_eq!(
            engine.boost_vector(&[], &ShutdownFlag::new()).expect("ok"),
            0
        );
        assert!(ctl.sets().is_empty());
    }
}
