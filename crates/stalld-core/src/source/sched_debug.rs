//! Textual runqueue source over the kernel's scheduler debug dump.
//!
//! The dump lives at `/sys/kernel/debug/sched/debug` (or `/proc/sched_debug`
//! on older kernels) and contains one `cpu#<N>` block per CPU. Inside a
//! block, the `runnable tasks:` marker opens a task table: a column header
//! line, a dashed separator, then one task per line.
//!
//! Two kernel generations are handled:
//!
//! - **Stateless** (3.x era): no per-task state column. Exactly one entry per
//!   block carries an `R` marker in the first column; that is the currently
//!   running task and is skipped. Every other entry must be confirmed
//!   runnable through `/proc/<tid>/stat` before it is included.
//! - **Stateful**: the first column is a single-character state, and the
//!   block carries `.nr_running` / `.rt_nr_running` aggregate counters that
//!   bound the expected waiting set size.
//!
//! Column positions are not hardcoded: a one-time header scan locates the
//! `task`, `PID`, `switches` and `prio` words and stores their zero-based
//! word offsets.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{StalldError, StalldResult};
use crate::procfs;
use crate::source::SnapshotBuffer;
use crate::task::{COMM_MAX, CpuSample, CpuState, TaskSnapshot};

/// Marker opening the task table inside a CPU block.
pub const TASK_MARKER: &str = "runnable tasks:";

/// Which task-line generation the dump uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFormat {
    /// No state column; running task carries an `R` marker.
    Stateless,
    /// State char in the first column plus per-CPU aggregate counters.
    Stateful,
}

/// Zero-based word offsets of the fields we extract from a task line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskColumns {
    pub task: usize,
    pub pid: usize,
    pub switches: usize,
    pub prio: usize,
}

/// Auto-detected shape of the dump, computed once at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLayout {
    pub format: TaskFormat,
    pub columns: TaskColumns,
}

/// Detect the dump layout from a full dump.
///
/// # Errors
///
/// [`StalldError::SourceUnavailable`] when the marker or any of the four
/// required header words is missing; the backend cannot run on such a dump.
pub fn detect_layout(dump: &str) -> StalldResult<DumpLayout> {
    let unavailable = |reason: String| StalldError::SourceUnavailable {
        backend: "sched_debug",
        reason,
    };

    let marker = dump
        .find(TASK_MARKER)
        .ok_or_else(|| unavailable(format!("no \"{TASK_MARKER}\" marker in the dump")))?;
    let header = dump[marker..]
        .lines()
        .nth(1)
        .ok_or_else(|| unavailable("dump ends right after the task marker".into()))?;

    let format = if header.split_whitespace().next() == Some("S") {
        TaskFormat::Stateful
    } else {
        TaskFormat::Stateless
    };

    let mut columns = TaskColumns::default();
    let mut found = 0;
    for (i, word) in header.split_whitespace().enumerate() {
        match word {
            "task" => {
                columns.task = i;
                found += 1;
            }
            "PID" => {
                columns.pid = i;
                found += 1;
            }
            "switches" => {
                columns.switches = i;
                found += 1;
            }
            "prio" => {
                columns.prio = i;
                found += 1;
            }
            _ => {}
        }
    }
    if found != 4 {
        return Err(unavailable(format!(
            "task header {header:?} is missing required fields \
             (need task, PID, switches, prio)"
        )));
    }

    info!(
        format = ?format,
        task = columns.task,
        pid = columns.pid,
        switches = columns.switches,
        prio = columns.prio,
        "detected sched debug task format"
    );
    Ok(DumpLayout { format, columns })
}

/// Slice out the block for one CPU, or `None` when the CPU is absent
/// (offline CPUs simply do not appear).
///
/// The block header is `cpu#<N>,` on x86 (a MHz field follows) and
/// `cpu#<N>` alone elsewhere; both are accepted.
#[must_use]
pub fn find_cpu_block<'a>(dump: &'a str, cpu: usize) -> Option<&'a str> {
    let with_comma = format!("cpu#{cpu},");
    let with_newline = format!("cpu#{cpu}\n");
    let start = dump
        .find(&with_comma)
        .or_else(|| dump.find(&with_newline))?;
    // Skip past the current "cpu#" so the scan finds the next block header.
    let tail = &dump[start + 4..];
    let end = tail.find("cpu#").map_or(dump.len(), |i| start + 4 + i);
    Some(&dump[start..end])
}

/// Parse one CPU block into a fresh sample.
///
/// `probe` confirms runnability for the stateless format (production:
/// `/proc/<tid>/stat`); `resolve_tgid` maps a tid to its thread group
/// (production: `/proc/<tid>/status`). Both are injected so the parser is
/// testable without a kernel.
pub fn parse_cpu_block(
    cpu: usize,
    block: &str,
    layout: &DumpLayout,
    now: u64,
    probe: &dyn Fn(libc::pid_t) -> bool,
    resolve_tgid: &dyn Fn(libc::pid_t) -> libc::pid_t,
) -> StalldResult<CpuSample> {
    let mut sample = CpuSample::default();
    let mut row_budget = usize::MAX;

    if layout.format == TaskFormat::Stateful {
        sample.nr_running = procfs::variable_long_value(block, ".nr_running")
            .ok_or_else(|| parse_err(cpu, "missing .nr_running"))?;
        sample.nr_rt_running = procfs::variable_long_value(block, ".rt_nr_running")
            .ok_or_else(|| parse_err(cpu, "missing .rt_nr_running"))?;
        // With fewer than two tasks on the CPU there is no possibility of a
        // stall.
        if sample.nr_running < 2 {
            return Ok(sample);
        }
        row_budget = usize::try_from(sample.nr_running).unwrap_or(usize::MAX);
    }

    let Some(marker) = block.find(TASK_MARKER) else {
        return Ok(sample);
    };
    let mut lines = block[marker..].lines();
    // Marker line, column header, dashed separator.
    lines.next();
    lines.next();
    lines.next();

    let columns = &layout.columns;
    let last_column = columns
        .task
        .max(columns.pid)
        .max(columns.switches)
        .max(columns.prio);

    let mut rows_seen = 0usize;
    for line in lines {
        if rows_seen >= row_budget || line.trim().is_empty() {
            break;
        }
        rows_seen += 1;
        let words: Vec<&str> = line.split_whitespace().collect();

        match layout.format {
            TaskFormat::Stateless => {
                // Only the single running task is labelled, with a leading
                // extra word; it cannot be starving by definition.
                if words.first() == Some(&"R") {
                    continue;
                }
            }
            TaskFormat::Stateful => {
                // The running task is marked ">R"; skip it, it is not
                // waiting.
                if words.first() == Some(&">R") {
                    continue;
                }
            }
        }

        if words.len() <= last_column {
            debug!(cpu, line, "short task line, stopping table scan");
            break;
        }

        let Ok(tid) = words[columns.pid].parse::<libc::pid_t>() else {
            debug!(cpu, line, "unparsable PID field, stopping table scan");
            break;
        };
        let Ok(ctxsw) = words[columns.switches].parse::<u64>() else {
            debug!(cpu, line, "unparsable switches field, stopping table scan");
            break;
        };
        let prio = words[columns.prio].parse::<i32>().unwrap_or(0);

        if layout.format == TaskFormat::Stateless && !probe(tid) {
            continue;
        }

        let mut comm = words[columns.task].to_owned();
        comm.truncate(COMM_MAX);

        sample.tasks.push(TaskSnapshot {
            tid,
            tgid: resolve_tgid(tid),
            comm,
            prio,
            ctxsw,
            since: now,
        });
    }

    // A table with a single row cannot stall anyone in the stateless format
    // either: that row is the one task the CPU is running.
    if layout.format == TaskFormat::Stateless && rows_seen < 2 {
        sample.tasks.clear();
    }

    Ok(sample)
}

fn parse_err(cpu: usize, detail: &str) -> StalldError {
    StalldError::Parse {
        cpu,
        detail: detail.to_owned(),
    }
}

/// The textual backend: dump path, detected layout, and a retained
/// growable snapshot buffer.
#[derive(Debug)]
pub struct SchedDebugSource {
    path: PathBuf,
    layout: Arc<DumpLayout>,
    buffer: SnapshotBuffer,
}

impl SchedDebugSource {
    /// Locate the dump, read it once, and detect the layout.
    ///
    /// # Errors
    ///
    /// [`StalldError::SourceUnavailable`] when no dump path is readable or
    /// the layout cannot be detected.
    pub fn init() -> StalldResult<Self> {
        let path = procfs::find_sched_debug_path().ok_or(StalldError::SourceUnavailable {
            backend: "sched_debug",
            reason: format!(
                "none of {:?} is readable; mount debugfs or run an older kernel",
                procfs::SCHED_DEBUG_PATHS
            ),
        })?;
        info!(path = %path.display(), "using sched debug dump");

        let mut buffer = SnapshotBuffer::new();
        buffer
            .read_file(&path)
            .map_err(|e| StalldError::SourceUnavailable {
                backend: "sched_debug",
                reason: format!("cannot read {}: {e}", path.display()),
            })?;
        let layout = Arc::new(detect_layout(&buffer.contents())?);

        Ok(Self {
            path,
            layout,
            buffer,
        })
    }

    /// Read a fresh whole-system dump into the retained buffer.
    ///
    /// # Errors
    ///
    /// [`StalldError::DumpRead`], contained to the current cycle.
    pub fn read_dump(&mut self) -> StalldResult<()> {
        self.buffer
            .read_file(&self.path)
            .map_err(|source| StalldError::DumpRead {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(())
    }

    /// Parse the block for one CPU out of the last read dump.
    pub fn sample_cpu(&mut self, cpu: usize, now: u64) -> StalldResult<Option<CpuSample>> {
        let dump = self.buffer.contents();
        let Some(block) = find_cpu_block(&dump, cpu) else {
            return Ok(None);
        };
        parse_cpu_block(
            cpu,
            block,
            &self.layout,
            now,
            &procfs::thread_is_runnable,
            &procfs::tgid_of,
        )
        .map(Some)
    }

    /// Cheap pre-filter: the stateful format exposes the rt-running count;
    /// the stateless one can only look at the waiting list itself.
    #[must_use]
    pub fn has_starving_candidate(&self, state: &CpuState) -> bool {
        match self.layout.format {
            TaskFormat::Stateful => state.nr_rt_running != 0,
            TaskFormat::Stateless => !state.waiting.is_empty(),
        }
    }

    /// An independent view for a dedicated worker: same path and layout,
    /// private buffer.
    #[must_use]
    pub fn worker_view(&self) -> Self {
        Self {
            path: self.path.clone(),
            layout: Arc::clone(&self.layout),
            buffer: SnapshotBuffer::new(),
        }
    }
}
