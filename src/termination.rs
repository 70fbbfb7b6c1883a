//! Graceful process termination.
//!
//! The signal handler only records the signal number; a watcher thread
//! observes it, halts every registered system, and then re-raises the
//! signal with its default disposition restored so the process exit
//! status stays faithful. Normal exits halt through an `atexit` hook.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;
use tracing::error;

/// Signals that trigger a graceful halt before terminating.
const TERMINABLE_SIGNALS: &[libc::c_int] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGPIPE,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGBUS,
    libc::SIGTRAP,
    libc::SIGXCPU,
    libc::SIGXFSZ,
    libc::SIGSYS,
];

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

const WATCHER_POLL: Duration = Duration::from_millis(50);

extern "C" fn signal_handler(signum: libc::c_int) {
    // Only an atomic store here; everything else happens on the watcher.
    PENDING_SIGNAL.store(signum, Ordering::SeqCst);
}

extern "C" fn normal_exit_handler() {
    crate::registry::shutdown();
}

/// Installs the handlers and spawns the watcher thread. Idempotent.
pub(crate) fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    // SAFETY: sigaction with a zeroed struct and a plain function pointer
    // handler; the handler itself is async-signal-safe.
    unsafe {
        for &sig in TERMINABLE_SIGNALS {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = signal_handler as extern "C" fn(libc::c_int) as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
        libc::atexit(normal_exit_handler);
    }

    std::thread::Builder::new()
        .name("hostmeter-term".into())
        .spawn(watcher_loop)
        .expect("failed to spawn termination watcher");
}

fn watcher_loop() {
    loop {
        let signum = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
        if signum != 0 {
            error!(
                signal = signum,
                "caught terminable signal, halting all systems"
            );
            crate::registry::halt_all();
            crate::logger::teardown();

            // Restore the default disposition and re-raise so the exit
            // status reflects the original signal.
            // SAFETY: plain sigaction/raise with SIG_DFL.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(signum, &action, std::ptr::null_mut());
                libc::raise(signum);
            }
        }
        std::thread::sleep(WATCHER_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install();
        install();
        assert!(INSTALLED.load(Ordering::SeqCst));
    }
}
