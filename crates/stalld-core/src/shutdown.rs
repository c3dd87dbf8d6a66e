//! Shutdown plumbing.
//!
//! SIGTERM and SIGINT flip one process-wide flag; every monitoring loop and
//! every boost-session sleep polls it so workers leave their sleeps
//! promptly, restore any boosted task they own, and exit within one cycle.
//! SIGHUP is deliberately not handled: the config is frozen.
//!
//! The flag is a bare atomic. Nothing on the signal path takes a lock, so a
//! worker parked in a long boost sleep can never block delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{info, warn};

use crate::error::{StalldError, StalldResult};

/// Poll interval used inside interruptible sleeps.
const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process-wide stop flag shared by all workers.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    stop: AtomicBool,
}

impl ShutdownFlag {
    /// A flag in the running state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
        }
    }

    /// Request shutdown; idempotent.
    pub fn request(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `true` when the sleep was interrupted.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_set() {
                return true;
            }
            let chunk = remaining.min(SLEEP_POLL_INTERVAL);
            thread::sleep(chunk);
            remaining = remaining.saturating_sub(chunk);
        }
        self.is_set()
    }
}

/// Owns the signal listener thread feeding a [`ShutdownFlag`].
#[derive(Debug)]
pub struct SignalListener {
    handle: signal_hook::iterator::Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl SignalListener {
    /// Register SIGTERM and SIGINT to request shutdown on `flag`.
    ///
    /// # Errors
    ///
    /// Propagates signal registration failures as environment errors.
    pub fn register(flag: Arc<ShutdownFlag>) -> StalldResult<Self> {
        let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])
            .map_err(StalldError::Io)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("stalld-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "received termination signal, starting shutdown");
                    flag.request();
                }
            })
            .map_err(StalldError::Io)?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stop the listener thread.
    pub fn stop(mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("signal listener thread panicked while stopping");
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn flag_starts_clear() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
    }

    #[test]
    fn request_is_sticky() {
        let flag = ShutdownFlag::new();
        flag.request();
        flag.request();
        assert!(flag.is_set());
    }

    #[test]
    fn sleep_runs_to_completion_when_not_interrupted() {
        let flag = ShutdownFlag::new();
        let start = Instant::now();
        let interrupted = flag.sleep_for(Duration::from_millis(60));
        assert!(!interrupted);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn sleep_wakes_early_on_shutdown() {
        let flag = Arc::new(ShutdownFlag::new());
        let waker = Arc::clone(&flag);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            waker.request();
        });
        let start = Instant::now();
        let interrupted = flag.sleep_for(Duration::from_secs(10));
        t.join().expect("waker thread");
        assert!(interrupted);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn sleep_on_an_already_set_flag_returns_immediately() {
        let flag = ShutdownFlag::new();
        flag.request();
        let start = Instant::now();
        assert!(flag.sleep_for(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn listener_registers_and_stops() {
        let flag = Arc::new(ShutdownFlag::new());
        let listener = SignalListener::register(Arc::clone(&flag)).expect("register");
        listener.stop();
        assert!(!flag.is_set());
    }
}
