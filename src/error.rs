//! Error types for the recording engine.
//!
//! Construction-time errors leave the owning meter invalid and are surfaced
//! through `System::is_valid`; per-tick errors downgrade the tick result
//! without stopping the worker. `FatalInvariant` marks conditions the
//! engine treats as programming errors at the binding boundary.

use std::io;
use std::path::PathBuf;

/// Error type for the recording engine.
#[derive(Debug)]
pub enum Error {
    /// Bad format string, mismatched descriptor/key lists, unknown probe,
    /// empty pid list and similar configuration mistakes.
    InvalidConfig(String),
    /// Non-canonicalizable directory or unopenable output file.
    InvalidPath(PathBuf, io::Error),
    /// Requested block devices absent from `/proc/diskstats`.
    DeviceMissing(Vec<String>),
    /// The device cannot provide what the meter was configured for
    /// (e.g. a GPU without GPM support).
    UnsupportedCapability(String),
    /// Short read of a `/proc` file; the partially filled record is kept.
    PartialSample(String),
    /// Numeric text that failed to parse.
    Parse(String),
    /// The previous asynchronous write has not completed yet.
    WriteBusy,
    /// Invariant violation at recording start (invalid meter, duplicate
    /// output paths, heterogeneous periods). Unrecoverable.
    FatalInvariant(String),
    /// Underlying I/O failure.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::InvalidPath(path, e) => write!(f, "invalid path {:?}: {}", path, e),
            Error::DeviceMissing(devices) => {
                write!(f, "devices missing from diskstats: {}", devices.join(", "))
            }
            Error::UnsupportedCapability(msg) => write!(f, "unsupported capability: {}", msg),
            Error::PartialSample(msg) => write!(f, "partial sample: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::WriteBusy => write!(f, "previous write still in flight"),
            Error::FatalInvariant(msg) => write!(f, "fatal invariant violation: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidPath(_, e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_contains_device_names() {
        let e = Error::DeviceMissing(vec!["sda".into(), "nvme0n1".into()]);
        let msg = e.to_string();
        assert!(msg.contains("sda"));
        assert!(msg.contains("nvme0n1"));
    }

    #[test]
    fn io_error_converts() {
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
