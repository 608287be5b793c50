//! Crash diagnostics and stop-signal plumbing.
//!
//! Two facilities, neither part of the scheduling algorithm:
//!
//! - a panic hook that logs the payload and a captured backtrace, so a
//!   fatal error in any thread leaves a usable trace in the log stream;
//! - a watcher thread that turns SIGINT/SIGTERM/SIGQUIT into an orderly
//!   `DispatchControl::stop()` instead of an abrupt exit.

use std::backtrace::Backtrace;
use std::io;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{error, warn};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::dispatcher::DispatchControl;

static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the panic reporter. Idempotent; the previous hook still runs.
pub fn install_panic_reporting() {
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let backtrace = Backtrace::force_capture();
        error!("panic: {}\n{}", info, backtrace);
        previous(info);
    }));
}

/// Spawn a thread that requests orderly shutdown on the first interrupt or
/// termination signal. Returns the watcher's join handle; the thread exits
/// after stopping the dispatcher once.
pub fn watch_stop_signals(control: DispatchControl) -> io::Result<thread::JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
    thread::Builder::new()
        .name("svcmux-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!("received signal {}, stopping dispatch loop", signal);
                control.stop();
            }
        })
}
