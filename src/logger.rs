//! One-shot tracing initialization.
//!
//! With a log directory the subscriber writes plain-text lines to
//! `hostmeter.log` inside it; without one it logs to stderr. The level
//! defaults to `info` and can be overridden through `RUST_LOG`.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::EnvFilter;

/// File created inside the log directory.
pub const LOG_FILE_NAME: &str = "hostmeter.log";

/// Second handle to the log file, kept for teardown. The subscriber owns
/// the writing handle and cannot be uninstalled once set globally.
static LOG_FILE: OnceLock<File> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. `false` when a subscriber is already
/// installed or the log file cannot be opened.
pub(crate) fn init(log_dir: Option<&Path>) -> bool {
    match log_dir {
        Some(dir) => {
            let path = dir.join(LOG_FILE_NAME);
            let file = match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("cannot open log file {:?}: {}", path, e);
                    return false;
                }
            };
            if let Ok(teardown_handle) = file.try_clone() {
                let _ = LOG_FILE.set(teardown_handle);
            }
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    }
}

/// Tears the logger down at the end of a termination sequence.
///
/// The global subscriber cannot be uninstalled and its file writer is
/// unbuffered (every event is a direct write), so teardown reduces to
/// syncing the log file to disk. A no-op when logging goes to stderr.
pub(crate) fn teardown() {
    if let Some(file) = LOG_FILE.get() {
        if let Err(e) = file.sync_all() {
            eprintln!("failed to sync log file during teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_to_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        // Another test may have installed a subscriber already; either way
        // the call must not panic and the second call must report false.
        let first = init(Some(dir.path()));
        let second = init(Some(dir.path()));
        assert!(!second || !first);

        if first {
            tracing::info!("probe line");
            let content = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
            assert!(content.contains("probe line"));
        }
    }

    #[test]
    fn teardown_is_idempotent() {
        // Must not panic whether or not a log file was ever installed.
        teardown();
        teardown();
    }
}
