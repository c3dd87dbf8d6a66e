//! Scheduler feature setup for sub-millisecond deadline boosting.
//!
//! Deadline runtimes here are far below one tick, so enforcement needs the
//! scheduler's HRTICK. Kernels expose it in the debugfs features file as
//! `HRTICK_DL` (deadline-only flavor) or plain `HRTICK`; a disabled feature
//! is listed with a `NO_` prefix and is enabled by writing the bare name
//! back.
//!
//! Under kernel lockdown debugfs writes are refused, so the setup is
//! skipped with a warning and the operator is assumed to have enabled the
//! feature already.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{StalldError, StalldResult};

/// Candidate locations of the sched features file.
pub const SCHED_FEATURES_PATHS: [&str; 2] = [
    "/sys/kernel/debug/sched/features",
    "/sys/kernel/debug/sched_features",
];

/// The kernel lockdown state file.
pub const LOCKDOWN_PATH: &str = "/sys/kernel/security/lockdown";

/// What the features file says about HRTICK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrtickState {
    /// The right flavor is already enabled; nothing to write.
    AlreadyOn,
    /// Write this token to enable it.
    WriteNeeded(&'static str),
    /// The kernel has no HRTICK feature at all.
    Unsupported,
}

/// Decide what to do from the features file contents.
#[must_use]
pub fn hrtick_state(features: &str) -> HrtickState {
    let has = |token: &str| features.split_whitespace().any(|t| t == token);
    if has("HRTICK_DL") {
        return HrtickState::AlreadyOn;
    }
    if has("NO_HRTICK_DL") {
        return HrtickState::WriteNeeded("HRTICK_DL");
    }
    // Backward compatibility with kernels that only have plain HRTICK.
    if has("HRTICK") {
        return HrtickState::AlreadyOn;
    }
    if has("NO_HRTICK") {
        return HrtickState::WriteNeeded("HRTICK");
    }
    HrtickState::Unsupported
}

/// Whether kernel lockdown is active.
///
/// A missing or unreadable lockdown file means an older kernel; lockdown is
/// assumed off.
#[must_use]
pub fn lockdown_active() -> bool {
    lockdown_active_at(Path::new(LOCKDOWN_PATH))
}

fn lockdown_active_at(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => !contents.contains("[none]"),
        Err(_) => false,
    }
}

/// First existing sched features file.
#[must_use]
pub fn find_features_path() -> Option<PathBuf> {
    SCHED_FEATURES_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

/// Ensure HRTICK is usable for deadline boosting.
///
/// # Errors
///
/// [`StalldError::HrtickUnavailable`] when the feature exists but cannot be
/// enabled. Callers only invoke this when boosting with the deadline
/// method; without HRTICK that mode cannot do a reliable job and startup
/// must fail.
pub fn setup_hrtick() -> StalldResult<()> {
    if lockdown_active() {
        warn!(
            "hrtick cannot be set in lockdown mode: assuming the user \
             already set HRTICK_DL; workloads might face high latencies \
             otherwise"
        );
        return Ok(());
    }
    let Some(path) = find_features_path() else {
        return Err(StalldError::HrtickUnavailable {
            path: SCHED_FEATURES_PATHS[0].to_owned(),
            reason: "sched features file not found; is debugfs mounted?".into(),
        });
    };
    setup_hrtick_at(&path)
}

/// Testable variant of [`setup_hrtick`] over an arbitrary features file.
pub fn setup_hrtick_at(path: &Path) -> StalldResult<()> {
    let unavailable = |reason: String| StalldError::HrtickUnavailable {
        path: path.display().to_string(),
        reason,
    };

    let contents =
        std::fs::read_to_string(path).map_err(|e| unavailable(format!("cannot read: {e}")))?;
    match hrtick_state(&contents) {
        HrtickState::AlreadyOn => Ok(()),
        HrtickState::WriteNeeded(token) => {
            info!(token, "dl_runtime is shorter than 1ms, enabling hrtick");
            std::fs::write(path, token).map_err(|e| unavailable(format!("cannot write: {e}")))
        }
        HrtickState::Unsupported => Err(unavailable(
            "kernel has no HRTICK scheduler feature".into(),
        )),
    }
}
