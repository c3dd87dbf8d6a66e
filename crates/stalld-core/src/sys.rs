//! Scheduling-attribute syscalls and related process plumbing.
//!
//! `sched_setattr(2)` / `sched_getattr(2)` have no libc wrappers, so both go
//! through `syscall(2)` with a local [`SchedAttr`] mirroring the uapi layout.
//! The [`SchedControl`] trait is the seam the boost engine works against;
//! tests substitute a recording mock for [`KernelSched`].

use std::io;

use crate::error::{StalldError, StalldResult};

/// `SCHED_OTHER` policy number.
pub const SCHED_OTHER: u32 = 0;
/// `SCHED_FIFO` policy number.
pub const SCHED_FIFO: u32 = 1;
/// `SCHED_DEADLINE` policy number.
pub const SCHED_DEADLINE: u32 = 6;

/// Runtime used by the method probe; small enough to be a no-op reservation.
const PROBE_RUNTIME_NS: u64 = 20 * 1000;
/// Period used by the method probe.
const PROBE_PERIOD_NS: u64 = 1_000_000_000;

/// Userspace mirror of the kernel's `struct sched_attr`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedAttr {
    pub size: u32,
    pub sched_policy: u32,
    pub sched_flags: u64,
    pub sched_nice: i32,
    pub sched_priority: u32,
    pub sched_runtime: u64,
    pub sched_deadline: u64,
    pub sched_period: u64,
}

impl SchedAttr {
    /// A zeroed attribute block with the size field filled in.
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: std::mem::size_of::<Self>() as u32,
            ..Default::default()
        }
    }

    /// Deadline attributes with `deadline == period`, the shape every boost
    /// session uses.
    #[must_use]
    pub fn deadline(runtime_ns: u64, period_ns: u64) -> Self {
        Self {
            sched_policy: SCHED_DEADLINE,
            sched_runtime: runtime_ns,
            sched_deadline: period_ns,
            sched_period: period_ns,
            ..Self::new()
        }
    }

    /// FIFO attributes at the given priority.
    #[must_use]
    pub fn fifo(priority: u32) -> Self {
        Self {
            sched_policy: SCHED_FIFO,
            sched_priority: priority,
            ..Self::new()
        }
    }

    /// Human-readable policy name for logging.
    #[must_use]
    pub const fn policy_name(&self) -> &'static str {
        match self.sched_policy {
            SCHED_OTHER => "SCHED_OTHER",
            SCHED_FIFO => "SCHED_FIFO",
            2 => "SCHED_RR",
            3 => "SCHED_BATCH",
            5 => "SCHED_IDLE",
            SCHED_DEADLINE => "SCHED_DEADLINE",
            _ => "SCHED_?",
        }
    }
}

/// The seam between the boost engine and the kernel scheduler.
///
/// A tid of `0` addresses the calling thread, matching the syscalls.
pub trait SchedControl: Send + Sync {
    /// Read the current scheduling attributes of `tid`.
    fn get_attr(&self, tid: libc::pid_t) -> StalldResult<SchedAttr>;

    /// Replace the scheduling attributes of `tid`.
    fn set_attr(&self, tid: libc::pid_t, attr: &SchedAttr) -> StalldResult<()>;
}

/// The real kernel scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSched;

impl SchedControl for KernelSched {
    fn get_attr(&self, tid: libc::pid_t) -> StalldResult<SchedAttr> {
        let mut attr = SchedAttr::new();
        // SAFETY: attr is a valid, properly sized sched_attr block.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_sched_getattr,
                tid,
                std::ptr::from_mut(&mut attr),
                attr.size,
                0,
            )
        };
        if ret == 0 {
            Ok(attr)
        } else {
            Err(policy_error(tid, "getattr"))
        }
    }

    fn set_attr(&self, tid: libc::pid_t, attr: &SchedAttr) -> StalldResult<()> {
        // SAFETY: attr is a valid, properly sized sched_attr block.
        let ret = unsafe {
            libc::syscall(libc::SYS_sched_setattr, tid, std::ptr::from_ref(attr), 0)
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(policy_error(tid, "setattr"))
        }
    }
}

/// Map the errno of a failed attribute syscall onto the error families the
/// boost engine distinguishes.
fn policy_error(tid: libc::pid_t, op: &'static str) -> StalldError {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => StalldError::TargetVanished { tid },
        Some(libc::EPERM | libc::EACCES) => StalldError::Permission { op },
        _ => StalldError::Policy {
            tid,
            op,
            source: err,
        },
    }
}

/// Probe whether SCHED_DEADLINE elevation works on this host.
///
/// Performs a no-op deadline attribute set on the calling thread with a
/// vanishingly small runtime, then restores. Any failure selects the
/// fixed-priority method.
#[must_use]
pub fn deadline_available(ctl: &dyn SchedControl) -> bool {
    let Ok(saved) = ctl.get_attr(0) else {
        return false;
    };
    let probe = SchedAttr::deadline(PROBE_RUNTIME_NS, PROBE_PERIOD_NS);
    match ctl.set_attr(0, &probe) {
        Ok(()) => {
            if let Err(err) = ctl.set_attr(0, &saved) {
                tracing::warn!(%err, "failed to restore attributes after deadline probe");
            }
            true
        }
        Err(_) => false,
    }
}

/// Pin the whole process to the given CPUs.
///
/// # Errors
///
/// Returns [`StalldError::InvalidConfig`] when the kernel rejects the mask.
pub fn set_self_affinity(cpus: &[usize]) -> StalldResult<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is its empty value.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus {
        // SAFETY: CPU_SET writes within the set for cpu < CPU_SETSIZE.
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    // SAFETY: set is a valid cpu_set_t.
    let ret = unsafe {
        libc::sched_setaffinity(
            libc::getpid(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &raw const set,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(StalldError::InvalidConfig {
            field: "affinity",
            value: format!("{cpus:?}"),
            reason: io::Error::last_os_error().to_string(),
        })
    }
}

/// Bound the daemon itself with a SCHED_DEADLINE reservation.
///
/// The reservation gets the boost period, clamped to one second when the
/// boost period exceeds four seconds (longer periods would not change the
/// delivered share, only the burstiness).
pub fn set_self_reservation(
    ctl: &dyn SchedControl,
    boost_period_ns: u64,
    pct: u8,
) -> StalldResult<()> {
    let period_ns = if boost_period_ns > 4 * 1_000_000_000 {
        1_000_000_000
    } else {
        boost_period_ns
    };
    let runtime_ns = period_ns / 100 * u64::from(pct);
    let attr = SchedAttr::deadline(runtime_ns, period_ns);
    ctl.set_attr(0, &attr)?;
    tracing::info!(
        reservation_pct = pct,
        runtime_ns,
        period_ns,
        "running under a SCHED_DEADLINE reservation"
    );
    Ok(())
}

/// Whether the process runs with an effective uid of root.
#[must_use]
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}
