//! stalld daemon entry point: argument handling, logging, startup gates,
//! and the hand-off to the monitoring core.

mod cli;

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use stalld_core::{
    BoostEngine, BoostMethod, Detector, KernelSched, Monitor, RunqueueSource, SchedControl,
    ShutdownFlag, SignalListener, StalldError, StalldResult, disarm_rt_throttling, running_as_root,
    select_method, setup_hrtick, warn_if_fair_server_present,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        error!(%err, "fatal");
        eprintln!("stalld: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let level = stalld_core::tracing_config::level_from_env(default);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stalld={level},stalld_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> StalldResult<()> {
    let config = Arc::new(cli.into_config(stalld_core::procfs::nr_cpus())?);

    if !running_as_root() {
        return Err(StalldError::MissingRoot);
    }

    // Fork before anything spawns threads or takes restore-on-drop guards.
    if !config.foreground {
        daemonize()?;
    }

    let ctl: Arc<dyn SchedControl> = Arc::new(KernelSched);
    let _throttle_guard = disarm_rt_throttling(config.systemd)?;

    let method = select_method(&*ctl, config.force_fifo);
    if method == BoostMethod::Deadline && !config.log_only {
        // Sub-millisecond runtimes need HRTICK enforcement; without it the
        // daemon cannot bound boosted bandwidth and must not run this mode.
        setup_hrtick()?;
    }
    warn_if_fair_server_present();

    if let Some(list) = &config.affinity {
        let cpus = stalld_core::parse_cpu_list(list, stalld_core::procfs::nr_cpus())?;
        stalld_core::sys::set_self_affinity(&cpus)?;
    }
    if let Some(pct) = config.reservation_pct {
        stalld_core::sys::set_self_reservation(&*ctl, config.boost_period_ns, pct)?;
    }

    let source = RunqueueSource::init(&config)?;
    let detector = Arc::new(Detector::from_config(&config)?);
    let engine = Arc::new(BoostEngine::from_config(Arc::clone(&ctl), method, &config));

    let shutdown = Arc::new(ShutdownFlag::new());
    let listener = SignalListener::register(Arc::clone(&shutdown))?;

    if let Some(path) = &config.pidfile {
        write_pidfile(Path::new(path))?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "stalld started");
    let result = Monitor::new(config, engine, detector, shutdown, source).run();
    listener.stop();
    result
}

/// Classic double-fork daemonization: detach from the controlling terminal,
/// become a session leader's child, reset umask, move to `/`.
fn daemonize() -> StalldResult<()> {
    // SAFETY: called before any thread is spawned; fork/setsid/umask/chdir
    // are async-signal-safe process-global calls.
    unsafe {
        match libc::fork() {
            -1 => return Err(StalldError::Io(std::io::Error::last_os_error())),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() < 0 {
            return Err(StalldError::Io(std::io::Error::last_os_error()));
        }
        match libc::fork() {
            -1 => return Err(StalldError::Io(std::io::Error::last_os_error())),
            0 => {}
            _ => libc::_exit(0),
        }
        libc::umask(0);
        if libc::chdir(c"/".as_ptr()) != 0 {
            return Err(StalldError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Write the daemon pid, creating or truncating the file.
fn write_pidfile(path: &Path) -> StalldResult<()> {
    let mut file = File::create(path).map_err(|e| StalldError::InvalidConfig {
        field: "pidfile",
        value: path.display().to_string(),
        reason: format!("cannot create: {e}"),
    })?;
    write!(file, "{}", std::process::id()).map_err(StalldError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_contains_our_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stalld.pid");
        write_pidfile(&path).expect("write pidfile");
        let contents = std::fs::read_to_string(&path).expect("read pidfile");
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn pidfile_in_missing_directory_is_a_config_error() {
        let err = write_pidfile(Path::new("/nonexistent/dir/stalld.pid")).unwrap_err();
        assert!(matches!(err, StalldError::InvalidConfig { .. }));
    }
}
