//! Runqueue source backends.
//!
//! Two concrete sources share one interface: the textual sched debug parser
//! and the tracepoint-fed queue-track map reader. Per the design notes they
//! are a sum type, not trait objects; the monitor matches on the variant
//! nowhere and always goes through the methods here.
//!
//! A source is chosen once at startup. The only permitted fallback is
//! init-time: a queue-track init failure falls back to sched debug. There is
//! never a mid-run switch, which would confuse retained per-CPU state.

pub mod queue_track;
pub mod sched_debug;

use tracing::{info, warn};

use crate::config::{Config, SourceKind};
use crate::error::{StalldError, StalldResult};
use crate::task::{CpuSample, CpuState};
use crate::tracing_config::span_names;

pub use queue_track::QueueTrackSource;
pub use sched_debug::SchedDebugSource;

/// Initial snapshot buffer size, in bytes.
const BUFFER_INITIAL: usize = 64 * 1024;
/// Remaining headroom below which the buffer doubles.
const BUFFER_HEADROOM: usize = 4096;

/// A snapshot buffer retained across cycles.
///
/// Grows monotonically (never shrinks) so that kernels whose dump size
/// increases as threads are created stay within one read budget.
#[derive(Debug)]
pub struct SnapshotBuffer {
    data: Vec<u8>,
    len: usize,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuffer {
    /// An empty buffer at the initial capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0; BUFFER_INITIAL],
            len: 0,
        }
    }

    /// Read the whole file at `path`, growing as needed.
    pub fn read_file(&mut self, path: &std::path::Path) -> std::io::Result<usize> {
        use std::io::Read;

        let mut file = std::fs::File::open(path)?;
        self.len = 0;
        loop {
            if self.data.len() - self.len < BUFFER_HEADROOM {
                let doubled = self.data.len() * 2;
                info!(
                    new_size = doubled,
                    "snapshot is getting larger, increasing the buffer"
                );
                self.data.resize(doubled, 0);
            }
            let n = file.read(&mut self.data[self.len..])?;
            if n == 0 {
                break;
            }
            self.len += n;
        }
        Ok(self.len)
    }

    /// The bytes read by the last [`read_file`](Self::read_file).
    #[must_use]
    pub fn contents(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data[..self.len])
    }

    /// Current capacity in bytes; never decreases.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// The backend chosen at startup.
#[derive(Debug)]
pub enum RunqueueSource {
    /// Kernel text dump parser.
    SchedDebug(SchedDebugSource),
    /// Tracepoint-fed per-CPU map reader.
    QueueTrack(QueueTrackSource),
}

impl RunqueueSource {
    /// Initialize the configured backend.
    ///
    /// # Errors
    ///
    /// [`StalldError::NoSource`] when neither the requested backend nor the
    /// sched debug fallback can be initialized.
    pub fn init(config: &Config) -> StalldResult<Self> {
        match config.source {
            SourceKind::SchedDebug => SchedDebugSource::init().map(Self::SchedDebug),
            SourceKind::QueueTrack => match QueueTrackSource::init(config) {
                Ok(source) => Ok(Self::QueueTrack(source)),
                Err(err) => {
                    warn!(%err, "queue_track backend unavailable, falling back to sched_debug");
                    SchedDebugSource::init().map(Self::SchedDebug).map_err(|e| {
                        StalldError::NoSource {
                            detail: format!("{err}; {e}"),
                        }
                    })
                }
            },
        }
    }

    /// Backend name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SchedDebug(_) => "sched_debug",
            Self::QueueTrack(_) => "queue_track",
        }
    }

    /// Acquire whatever whole-system data this cycle needs.
    ///
    /// The textual source reads the entire dump once per cycle; the map
    /// reader samples per CPU and does nothing here.
    pub fn begin_cycle(&mut self) -> StalldResult<()> {
        match self {
            Self::SchedDebug(s) => {
                let _span =
                    tracing::debug_span!(span_names::SNAPSHOT, backend = "sched_debug").entered();
                s.read_dump()
            }
            Self::QueueTrack(_) => Ok(()),
        }
    }

    /// Produce the fresh sample for one CPU.
    ///
    /// `Ok(None)` means the CPU is absent from the data (offline); the
    /// caller clears its retained state.
    pub fn sample_cpu(&mut self, cpu: usize, now: u64) -> StalldResult<Option<CpuSample>> {
        let _span =
            tracing::debug_span!(span_names::SNAPSHOT, cpu, backend = self.name()).entered();
        match self {
            Self::SchedDebug(s) => s.sample_cpu(cpu, now),
            Self::QueueTrack(s) => s.sample_cpu(cpu, now),
        }
    }

    /// Cheap pre-filter: can this CPU have a starving task at all?
    #[must_use]
    pub fn has_starving_candidate(&self, state: &CpuState) -> bool {
        match self {
            Self::SchedDebug(s) => s.has_starving_candidate(state),
            Self::QueueTrack(_) => state.nr_rt_running != 0,
        }
    }

    /// An independent handle over the same backend for a dedicated worker:
    /// shared layout/map, private snapshot buffer.
    #[must_use]
    pub fn worker_view(&self) -> Self {
        match self {
            Self::SchedDebug(s) => Self::SchedDebug(s.worker_view()),
            Self::QueueTrack(s) => Self::QueueTrack(s.worker_view()),
        }
    }

    /// Release backend resources; the map reader switches per-CPU
    /// monitoring off.
    pub fn destroy(&mut self) {
        if let Self::QueueTrack(s) = self {
            s.destroy();
        }
    }
}
