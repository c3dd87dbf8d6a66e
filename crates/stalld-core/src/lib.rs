//! Core engine of the stalld starvation-avoidance daemon.
//!
//! This crate holds everything except the CLI surface: per-CPU runqueue
//! sources, the identity-and-progress task merger, the starvation detector,
//! the bounded boost engine, the three monitoring strategies, and the
//! startup gates (RT throttling, HRTICK, method probe).
//!
//! The binary crate assembles a frozen [`Config`], picks a backend and a
//! boost method, and hands everything to [`Monitor::run`].

pub mod boost;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod idle;
pub mod monitor;
pub mod procfs;
pub mod shutdown;
pub mod source;
pub mod sys;
pub mod task;
pub mod throttling;
pub mod tracing_config;

pub use boost::{BoostEngine, BoostMethod, BoostOutcome, BoostTarget, select_method};
pub use config::{Config, SourceKind, Strategy, parse_cpu_list};
pub use detector::{Denylist, Detector, NameResolver, ProcResolver, warn_if_fair_server_present};
pub use error::{ErrorKind, StalldError, StalldResult};
pub use features::setup_hrtick;
pub use idle::{IdleGate, IdleVerdict};
pub use monitor::Monitor;
pub use shutdown::{ShutdownFlag, SignalListener};
pub use source::RunqueueSource;
pub use sys::{KernelSched, SchedAttr, SchedControl, running_as_root};
pub use task::{CpuSample, CpuState, TaskSnapshot, WorkerState};
pub use throttling::{ThrottleGuard, disarm_rt_throttling};
