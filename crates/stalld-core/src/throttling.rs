//! RT-throttle gate.
//!
//! The kernel caps the CPU time SCHED_FIFO/SCHED_RR tasks may consume per
//! period through `/proc/sys/kernel/sched_rt_runtime_us`; `-1` means no
//! cap. A boosted task throttled by that knob cannot be relieved, so the
//! daemon needs the cap off. When an external supervisor manages the RT
//! budget (systemd with a configured unit policy), the knob is left alone.
//!
//! The saved value is restored when the returned guard drops.

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{StalldError, StalldResult};

/// The kernel knob controlling maximum RT runtime per period.
pub const RT_RUNTIME_PATH: &str = "/proc/sys/kernel/sched_rt_runtime_us";

/// Sentinel meaning "no bound".
pub const RT_RUNTIME_UNBOUNDED: i64 = -1;

/// Restores the pre-existing throttling value on drop.
#[derive(Debug)]
pub struct ThrottleGuard {
    path: PathBuf,
    saved_us: Option<i64>,
}

impl ThrottleGuard {
    /// The value that will be restored, if any.
    #[must_use]
    pub const fn saved_us(&self) -> Option<i64> {
        self.saved_us
    }
}

impl Drop for ThrottleGuard {
    fn drop(&mut self) {
        let Some(saved) = self.saved_us.take() else {
            return;
        };
        match write_knob(&self.path, saved) {
            Ok(()) => info!(runtime_us = saved, "RT throttling runtime restored"),
            Err(e) => warn!(%e, "error restoring RT throttling"),
        }
    }
}

/// Ensure the host permits unbounded RT runtime.
///
/// Reads the knob; when already `-1` or when `supervisor_managed` is set,
/// nothing is written. Otherwise `-1` is written and the prior value is
/// carried in the guard for restoration at shutdown.
///
/// # Errors
///
/// [`StalldError::RtThrottling`] when the knob cannot be read or rewritten;
/// fatal at startup, naming the knob.
pub fn disarm_rt_throttling(supervisor_managed: bool) -> StalldResult<ThrottleGuard> {
    disarm_rt_throttling_at(Path::new(RT_RUNTIME_PATH), supervisor_managed)
}

/// Testable variant of [`disarm_rt_throttling`] over an arbitrary path.
pub fn disarm_rt_throttling_at(
    path: &Path,
    supervisor_managed: bool,
) -> StalldResult<ThrottleGuard> {
    let inert = ThrottleGuard {
        path: path.to_path_buf(),
        saved_us: None,
    };
    if supervisor_managed {
        info!("supervisor manages the RT budget, leaving sched_rt_runtime_us alone");
        return Ok(inert);
    }

    let current = read_knob(path).map_err(|source| StalldError::RtThrottling {
        knob: RT_RUNTIME_PATH,
        source,
    })?;
    if current == RT_RUNTIME_UNBOUNDED {
        info!("RT throttling already disabled, doing nothing");
        return Ok(inert);
    }

    write_knob(path, RT_RUNTIME_UNBOUNDED).map_err(|source| StalldError::RtThrottling {
        knob: RT_RUNTIME_PATH,
        source,
    })?;
    info!(previous_us = current, "RT throttling disabled");
    Ok(ThrottleGuard {
        path: path.to_path_buf(),
        saved_us: Some(current),
    })
}

/// Whether RT throttling is currently off.
#[must_use]
pub fn rt_throttling_is_off() -> bool {
    read_knob(Path::new(RT_RUNTIME_PATH)).is_ok_and(|v| v == RT_RUNTIME_UNBOUNDED)
}

fn read_knob(path: &Path) -> std::io::Result<i64> {
    let mut contents = String::new();
    std::fs::File::open(path)?.read_to_string(&mut contents)?;
    contents.trim().parse::<i64>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unparsable value {contents:?}: {e}"),
        )
    })
}

fn write_knob(path: &Path, value: i64) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)?;
    file.rewind()?;
    file.write_all(value.to_string().as_bytes())
}
