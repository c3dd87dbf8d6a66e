//! Tracepoint-fed runqueue source.
//!
//! Kernel-side probes attached to sched_wakeup, sched_switch,
//! sched_migrate_task and sched_process_exit maintain one record per CPU in
//! a BPF map. Userspace reads the map atomically per CPU; no text parsing,
//! no `/proc` scans per task. The record layout is fixed:
//!
//! ```text
//! cpu_data    = { monitoring: i32, current: i32, nr_rt_running: i32,
//!                 tasks: [queued_task; MAX_QUEUE_TASK] }
//! queued_task = { tid: i64, tgid: i64, is_rt: i32, prio: i32, ctxsw: i64 }
//! ```
//!
//! Entries with tid 0 are empty slots. This source may miss threads whose
//! kernel state byte is not TASK_RUNNING at sample time; the detector only
//! relies on the identity + ctxsw contract shared with the textual source.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{StalldError, StalldResult};
use crate::procfs;
use crate::task::{COMM_MAX, CpuSample, TaskSnapshot};

/// Maximum queued-task slots per CPU record, matching the kernel side.
pub const MAX_QUEUE_TASK: usize = 2048;

/// Bytes per `queued_task` record.
const TASK_RECORD_SIZE: usize = 32;
/// Byte offset of the task array inside a CPU record (three i32 header
/// fields padded to the i64 alignment of the first task).
const TASKS_OFFSET: usize = 16;
/// Total bytes of one per-CPU record.
pub const CPU_RECORD_SIZE: usize = TASKS_OFFSET + MAX_QUEUE_TASK * TASK_RECORD_SIZE;

/// Default pin path of the per-CPU map.
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/stalld/cpu_data";

// bpf(2) command numbers used here.
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_OBJ_GET: libc::c_long = 7;

/// One decoded queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub tid: i64,
    pub tgid: i64,
    pub is_rt: bool,
    pub prio: i32,
    pub ctxsw: i64,
}

/// One decoded per-CPU record.
#[derive(Debug, Clone, Default)]
pub struct CpuRecord {
    pub monitoring: bool,
    pub current: i32,
    pub nr_rt_running: i32,
    pub tasks: Vec<QueuedTask>,
}

/// Decode a raw per-CPU record; `None` when the buffer is short.
///
/// Empty slots (tid 0) are dropped here so callers only see live entries.
#[must_use]
pub fn parse_cpu_record(bytes: &[u8]) -> Option<CpuRecord> {
    if bytes.len() < CPU_RECORD_SIZE {
        return None;
    }
    let read_i32 =
        |off: usize| -> Option<i32> { Some(i32::from_ne_bytes(bytes[off..off + 4].try_into().ok()?)) };
    let read_i64 =
        |off: usize| -> Option<i64> { Some(i64::from_ne_bytes(bytes[off..off + 8].try_into().ok()?)) };

    let mut record = CpuRecord {
        monitoring: read_i32(0)? != 0,
        current: read_i32(4)?,
        nr_rt_running: read_i32(8)?,
        tasks: Vec::new(),
    };
    for slot in 0..MAX_QUEUE_TASK {
        let base = TASKS_OFFSET + slot * TASK_RECORD_SIZE;
        let tid = read_i64(base)?;
        if tid == 0 {
            continue;
        }
        record.tasks.push(QueuedTask {
            tid,
            tgid: read_i64(base + 8)?,
            is_rt: read_i32(base + 16)? != 0,
            prio: read_i32(base + 20)?,
            ctxsw: read_i64(base + 24)?,
        });
    }
    Some(record)
}

/// Build a fresh sample from a decoded record.
///
/// The current task is not starving by definition and is dropped. Entries
/// whose comm cannot be resolved belong to dead processes and are dropped
/// too. `resolve_comm` is injected (production: `/proc/<tgid>/comm`).
#[must_use]
pub fn record_to_sample(
    record: &CpuRecord,
    now: u64,
    resolve_comm: &dyn Fn(libc::pid_t) -> Option<String>,
) -> CpuSample {
    let mut sample = CpuSample::default();
    let mut rt_running = 0;
    for task in &record.tasks {
        if task.is_rt {
            rt_running += 1;
        }
        if task.tid == i64::from(record.current) {
            continue;
        }
        let Some(mut comm) = resolve_comm(task.tgid as libc::pid_t) else {
            continue;
        };
        comm.truncate(COMM_MAX);
        sample.tasks.push(TaskSnapshot {
            tid: task.tid as libc::pid_t,
            tgid: task.tgid as libc::pid_t,
            comm,
            prio: task.prio,
            ctxsw: u64::try_from(task.ctxsw).unwrap_or(0),
            since: now,
        });
    }
    // Waiting tasks plus the one the CPU is running.
    sample.nr_running = sample.tasks.len() as i64 + 1;
    sample.nr_rt_running = rt_running;
    sample
}

/// A pinned BPF map accessed through the raw `bpf(2)` syscall.
#[derive(Debug)]
pub struct BpfMapHandle {
    fd: OwnedFd,
}

#[repr(C)]
struct BpfObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
struct BpfMapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

impl BpfMapHandle {
    /// Open a map pinned at `path`.
    pub fn open_pinned(path: &Path) -> io::Result<Self> {
        let pathname = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in pin path"))?;
        let attr = BpfObjGetAttr {
            pathname: pathname.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: 0,
        };
        // SAFETY: attr points at a properly sized bpf_attr for BPF_OBJ_GET.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_OBJ_GET,
                &raw const attr,
                std::mem::size_of::<BpfObjGetAttr>(),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the syscall returned a fresh fd we now own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd as i32) },
        })
    }

    /// Read the value for `key` into `out`.
    pub fn lookup(&self, key: u32, out: &mut [u8]) -> io::Result<()> {
        let attr = BpfMapElemAttr {
            map_fd: self.fd.as_raw_fd() as u32,
            _pad: 0,
            key: std::ptr::from_ref(&key) as u64,
            value: out.as_mut_ptr() as u64,
            flags: 0,
        };
        // SAFETY: key and out stay alive across the call; out is value-sized.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_LOOKUP_ELEM,
                &raw const attr,
                std::mem::size_of::<BpfMapElemAttr>(),
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Write `value` for `key`.
    pub fn update(&self, key: u32, value: &[u8]) -> io::Result<()> {
        let attr = BpfMapElemAttr {
            map_fd: self.fd.as_raw_fd() as u32,
            _pad: 0,
            key: std::ptr::from_ref(&key) as u64,
            value: value.as_ptr() as u64,
            flags: 0,
        };
        // SAFETY: key and value stay alive across the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_UPDATE_ELEM,
                &raw const attr,
                std::mem::size_of::<BpfMapElemAttr>(),
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// The map-reader backend.
#[derive(Debug)]
pub struct QueueTrackSource {
    map: Arc<BpfMapHandle>,
    buf: Vec<u8>,
    monitored: Vec<usize>,
    /// Only the primary handle flips monitoring back off on destroy;
    /// worker views share the map but not that duty.
    owns_monitoring: bool,
}

impl QueueTrackSource {
    /// Open the pinned map and switch monitoring on for the configured CPUs.
    ///
    /// # Errors
    ///
    /// [`StalldError::SourceUnavailable`] when the pin path is absent (the
    /// kernel-side programs are not loaded) or the map cannot be read.
    pub fn init(config: &Config) -> StalldResult<Self> {
        let map =
            BpfMapHandle::open_pinned(Path::new(DEFAULT_PIN_PATH)).map_err(|e| {
                StalldError::SourceUnavailable {
                    backend: "queue_track",
                    reason: format!("cannot open pinned map {DEFAULT_PIN_PATH}: {e}"),
                }
            })?;

        let monitored = config
            .monitored_cpus
            .clone()
            .unwrap_or_else(|| (0..procfs::nr_cpus()).collect());

        let mut source = Self {
            map: Arc::new(map),
            buf: vec![0; CPU_RECORD_SIZE],
            monitored,
            owns_monitoring: true,
        };
        source.set_monitoring(true).map_err(|e| {
            StalldError::SourceUnavailable {
                backend: "queue_track",
                reason: format!("cannot initialize per-cpu records: {e}"),
            }
        })?;
        info!(pin = DEFAULT_PIN_PATH, "queue_track backend attached");
        Ok(source)
    }

    fn set_monitoring(&mut self, on: bool) -> io::Result<()> {
        for &cpu in &self.monitored.clone() {
            let key = cpu as u32;
            self.map.lookup(key, &mut self.buf)?;
            self.buf[0..4].copy_from_slice(&i32::from(on).to_ne_bytes());
            self.map.update(key, &self.buf)?;
        }
        Ok(())
    }

    /// Read and decode the record for one CPU.
    ///
    /// The map has a slot per possible CPU, so a lookup failure is a real
    /// error, not an offline CPU.
    pub fn sample_cpu(&mut self, cpu: usize, now: u64) -> StalldResult<Option<CpuSample>> {
        self.map
            .lookup(cpu as u32, &mut self.buf)
            .map_err(|source| StalldError::Snapshot { cpu, source })?;
        let record = parse_cpu_record(&self.buf).ok_or_else(|| StalldError::Parse {
            cpu,
            detail: format!(
                "map value shorter than {CPU_RECORD_SIZE} bytes; kernel/userspace layout skew"
            ),
        })?;
        debug!(
            cpu,
            queued = record.tasks.len(),
            current = record.current,
            "queue_track record"
        );
        Ok(Some(record_to_sample(&record, now, &|tgid| {
            procfs::process_comm(tgid).ok()
        })))
    }

    /// An independent view for a dedicated worker: shared map, private
    /// value buffer, no monitoring ownership.
    #[must_use]
    pub fn worker_view(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
            buf: vec![0; CPU_RECORD_SIZE],
            monitored: self.monitored.clone(),
            owns_monitoring: false,
        }
    }

    /// Switch monitoring off for every configured CPU.
    pub fn destroy(&mut self) {
        if !self.owns_monitoring {
            return;
        }
        if let Err(e) = self.set_monitoring(false) {
            warn!(%e, "failed to switch queue_track monitoring off");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_record(current: i32, nr_rt: i32, tasks: &[(i64, i64, bool, i32, i64)]) -> Vec<u8> {
        let mut bytes = vec![0u8; CPU_RECORD_SIZE];
        bytes[0..4].copy_from_slice(&1i32.to_ne_bytes());
        bytes[4..8].copy_from_slice(&current.to_ne_bytes());
        bytes[8..12].copy_from_slice(&nr_rt.to_ne_bytes());
        for (slot, &(tid, tgid, is_rt, prio, ctxsw)) in tasks.iter().enumerate() {
            let base = TASKS_OFFSET + slot * TASK_RECORD_SIZE;
            bytes[base..base + 8].copy_from_slice(&tid.to_ne_bytes());
            bytes[base + 8..base + 16].copy_from_slice(&tgid.to_ne_bytes());
            bytes[base + 16..base + 20].copy_from_slice(&i32::from(is_rt).to_ne_bytes());
            bytes[base + 20..base + 24].copy_from_slice(&prio.to_ne_bytes());
            bytes[base + 24..base + 32].copy_from_slice(&ctxsw.to_ne_bytes());
        }
        bytes
    }

    #[test]
    fn record_size_matches_kernel_layout() {
        assert_eq!(TASK_RECORD_SIZE, 32);
        assert_eq!(TASKS_OFFSET, 16);
        assert_eq!(CPU_RECORD_SIZE, 16 + 2048 * 32);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(parse_cpu_record(&[0u8; 64]).is_none());
    }

    #[test]
    fn empty_slots_are_dropped() {
        let bytes = raw_record(0, 0, &[(0, 0, false, 0, 0), (77, 77, false, 120, 5)]);
        let record = parse_cpu_record(&bytes).expect("record");
        assert_eq!(record.tasks.len(), 1);
        assert_eq!(record.tasks[0].tid, 77);
    }

    #[test]
    fn sparse_slots_are_all_collected() {
        // Records can be sparse after dequeues; later slots still count.
        let mut bytes = raw_record(0, 0, &[]);
        let base = TASKS_OFFSET + 100 * TASK_RECORD_SIZE;
        bytes[base..base + 8].copy_from_slice(&55i64.to_ne_bytes());
        bytes[base + 24..base + 32].copy_from_slice(&9i64.to_ne_bytes());
        let record = parse_cpu_record(&bytes).expect("record");
        assert_eq!(record.tasks.len(), 1);
        assert_eq!(record.tasks[0].ctxsw, 9);
    }

    #[test]
    fn current_task_is_not_waiting() {
        let bytes = raw_record(
            900,
            1,
            &[(900, 900, true, 98, 1000), (901, 901, false, 120, 10)],
        );
        let record = parse_cpu_record(&bytes).expect("record");
        let sample = record_to_sample(&record, 5, &|tgid| Some(format!("proc-{tgid}")));
        assert_eq!(sample.tasks.len(), 1);
        assert_eq!(sample.tasks[0].tid, 901);
        assert_eq!(sample.tasks[0].since, 5);
        assert_eq!(sample.nr_running, 2, "waiting plus the current task");
        assert_eq!(sample.nr_rt_running, 1);
    }

    #[test]
    fn dead_process_entries_are_dropped() {
        let bytes = raw_record(0, 0, &[(901, 901, false, 120, 10)]);
        let record = parse_cpu_record(&bytes).expect("record");
        let sample = record_to_sample(&record, 5, &|_| None);
        assert!(sample.tasks.is_empty(), "a loop of silence");
    }

    #[test]
    fn comm_is_truncated_to_kernel_length() {
        let bytes = raw_record(0, 0, &[(901, 901, false, 120, 10)]);
        let record = parse_cpu_record(&bytes).expect("record");
        let sample = record_to_sample(&record, 5, &|_| Some("x".repeat(40)));
        assert_eq!(sample.tasks[0].comm.len(), COMM_MAX);
    }

    #[test]
    fn rt_count_comes_from_the_entries() {
        let bytes = raw_record(
            0,
            7, // header value is ignored in favor of the per-entry flags
            &[(1, 1, true, 98, 1), (2, 2, true, 97, 1), (3, 3, false, 120, 1)],
        );
        let record = parse_cpu_record(&bytes).expect("record");
        let sample = record_to_sample(&record, 0, &|tgid| Some(format!("p{tgid}")));
        assert_eq!(sample.nr_rt_running, 2);
    }

    #[test]
    fn opening_a_missing_pin_path_fails() {
        assert!(BpfMapHandle::open_pinned(Path::new("/nonexistent/bpf/map")).is_err());
    }
}
