//! Host introspection and small formatting helpers.

use std::path::{Path, PathBuf};

/// Returns the number of online CPUs.
pub fn online_cpus() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

/// Nanoseconds on the monotonic clock.
///
/// Sample timestamps use this clock so that intervals between records stay
/// meaningful across wall-clock adjustments.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    } else {
        0
    }
}

/// Canonicalizes `dir` and returns it if it names an existing directory.
pub fn validate_dir(dir: &Path) -> Option<PathBuf> {
    let canonical = std::fs::canonicalize(dir).ok()?;
    if canonical.is_dir() {
        Some(canonical)
    } else {
        None
    }
}

/// Indents every line of `input` with `prefix`. Used by status reports.
pub fn indent(input: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for (i, line) in input.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(prefix);
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_cpus_positive() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    fn monotonic_ns_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn validate_dir_accepts_existing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_dir(dir.path()).is_some());
        assert!(validate_dir(Path::new("/nonexistent/path/12345")).is_none());
    }

    #[test]
    fn indent_prefixes_each_line() {
        assert_eq!(indent("a\nb", "  "), "  a\n  b");
        assert_eq!(indent("single", "- "), "- single");
    }
}
