//! Meter base: the double-buffered record pipeline shared by every sampler.
//!
//! A meter owns two time-series buffers. The *active* buffer accumulates
//! one record per tick; on a write trigger the buffers are swapped through
//! an atomic slot and a detached writer thread drains the claimed buffer to
//! the meter's output file as one length-prefixed write-unit. Sampling
//! never waits on the file.
//!
//! ```text
//!  worker tick ──► update() ──► active ─┐ swap (atomic slot)
//!                                       ├──────────► writer thread ──► file
//!  coordinator ─► write_data_to_file() ─┘   shadow ◄── cleared buffer
//! ```
//!
//! Concrete samplers implement [`Sampler`]; [`MeterUnit`] provides the
//! shared state and implements the object-safe [`Meter`] trait the system
//! and worker pool operate on.

pub mod cpu;
pub mod disk;
pub mod gpu;
pub mod mem;
pub mod proc;

use crate::error::{Error, Result};
use crate::record::{Sample, TimeSeries};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default suffix of per-meter output files.
pub const FILE_DEFAULT_SUFFIX: &str = ".ts.bin";

/// Width of the write-unit size header: `usize` of the producing host.
pub const WRITE_HEADER_WIDTH: usize = std::mem::size_of::<usize>();

/// Single-slot owner of the shadow buffer.
///
/// `take` claims the buffer with an acquire exchange (returns `None` while
/// a write is in flight); `put` publishes it back with release ordering.
/// Callers never observe a partially constructed buffer.
pub(crate) struct AtomicSlot<T> {
    ptr: AtomicPtr<T>,
}

impl<T> AtomicSlot<T> {
    pub(crate) fn new(value: Box<T>) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(value)),
        }
    }

    /// Claims the slot contents, leaving it empty. `None` if already empty.
    pub(crate) fn take(&self) -> Option<Box<T>> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            // SAFETY: non-null pointers in the slot always come from
            // Box::into_raw and ownership was relinquished by the swap.
            Some(unsafe { Box::from_raw(raw) })
        }
    }

    /// Publishes a buffer into the slot. The slot must be empty.
    pub(crate) fn put(&self, value: Box<T>) {
        let raw = Box::into_raw(value);
        let prev = self.ptr.swap(raw, Ordering::AcqRel);
        debug_assert!(prev.is_null(), "shadow slot double publish");
        if !prev.is_null() {
            // SAFETY: same provenance as in take().
            drop(unsafe { Box::from_raw(prev) });
        }
    }
}

impl<T> Drop for AtomicSlot<T> {
    fn drop(&mut self) {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: sole owner at drop time.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

// SAFETY: the slot transfers whole Box ownership between threads; T itself
// is required to be Send.
unsafe impl<T: Send> Send for AtomicSlot<T> {}
unsafe impl<T: Send> Sync for AtomicSlot<T> {}

/// Outcome of a sampler fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The record carries a sample and is appended.
    Recorded,
    /// Warm-up tick: the record is discarded (e.g. GPM rate priming).
    Warmup,
}

/// The source-specific part of a meter: fills one record per tick.
pub trait Sampler: Send {
    type Record: Sample;

    /// Meter name; also the stem of the output file.
    fn name(&self) -> &str;

    /// Fills `record` with one sample. On error the partially filled
    /// record is still appended and the tick counts as failed.
    fn fill(&mut self, testrun: bool, record: &mut Self::Record) -> Result<Fill>;

    /// Optional per-meter detail for verbose status reports.
    fn detailed_report(&self) -> Option<String> {
        None
    }
}

/// Object-safe meter surface used by the system and the worker pool.
pub trait Meter: Send {
    fn name(&self) -> &str;
    fn tick_period(&self) -> Duration;
    fn is_valid(&self) -> bool;

    /// Takes one sample, appending exactly one record to the active buffer
    /// (warm-up ticks excepted).
    fn update(&mut self, testrun: bool) -> Result<()>;

    /// Clears both buffers. Only legal while no recording is running.
    fn reset_buffer(&mut self);

    /// Approximate in-memory footprint of the active buffer; 0 when empty.
    fn current_message_mem_size(&self) -> usize;
    /// Exact serialized size of the active buffer; 0 when empty.
    fn current_message_wire_size(&self) -> u64;

    /// Resolves and opens `<dir>/<name><suffix>` (create + truncate, 0644).
    fn assign_output_dir(&mut self, dir: &Path) -> Result<()>;
    fn output_path(&self) -> Option<&Path>;

    /// Swaps the buffer pair and drains the claimed buffer on a detached
    /// writer thread; `sync` joins it before returning. Returns the payload
    /// wire size, or [`Error::WriteBusy`] while a write is in flight.
    fn write_data_to_file(&mut self, sync: bool) -> Result<u64>;

    /// Best-effort fsync of the output file.
    fn fsync_data_to_file(&self);

    fn written_times(&self) -> usize;
    fn written_size(&self) -> usize;

    fn detailed_report(&self) -> Option<String>;
}

/// Shared meter state wrapping a [`Sampler`].
pub struct MeterUnit<S: Sampler> {
    sampler: S,
    tick_period: Duration,
    file_suffix: String,
    valid: bool,

    active: TimeSeries<S::Record>,
    shadow: Arc<AtomicSlot<TimeSeries<S::Record>>>,

    file: Option<File>,
    file_path: Option<PathBuf>,
    writer: Option<JoinHandle<()>>,
    written_times: Arc<AtomicUsize>,
    written_size: Arc<AtomicUsize>,
}

impl<S: Sampler> MeterUnit<S> {
    /// Wraps `sampler` with fresh buffers. `valid` reflects whether the
    /// sampler's construction checks passed.
    pub fn new(sampler: S, tick_period: Duration, valid: bool) -> Self {
        Self {
            sampler,
            tick_period,
            file_suffix: FILE_DEFAULT_SUFFIX.to_string(),
            valid,
            active: TimeSeries::new(),
            shadow: Arc::new(AtomicSlot::new(Box::new(TimeSeries::new()))),
            file: None,
            file_path: None,
            writer: None,
            written_times: Arc::new(AtomicUsize::new(0)),
            written_size: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Overrides the output-file suffix (default [`FILE_DEFAULT_SUFFIX`]).
    pub fn with_file_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.file_suffix = suffix.into();
        self
    }

    fn join_writer(&mut self) {
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }

    /// Direct access to the sampler, mainly for tests.
    pub fn sampler(&self) -> &S {
        &self.sampler
    }
}

impl<S: Sampler> Meter for MeterUnit<S> {
    fn name(&self) -> &str {
        self.sampler.name()
    }

    fn tick_period(&self) -> Duration {
        self.tick_period
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn update(&mut self, testrun: bool) -> Result<()> {
        let mut record = S::Record::default();
        match self.sampler.fill(testrun, &mut record) {
            Ok(Fill::Recorded) => {
                self.active.push(record);
                Ok(())
            }
            Ok(Fill::Warmup) => Ok(()),
            Err(e) => {
                // Short reads keep the partially filled record.
                self.active.push(record);
                Err(e)
            }
        }
    }

    fn reset_buffer(&mut self) {
        self.join_writer();
        self.active.clear();
        if let Some(mut shadow) = self.shadow.take() {
            shadow.clear();
            self.shadow.put(shadow);
        }
    }

    fn current_message_mem_size(&self) -> usize {
        self.active.mem_size()
    }

    fn current_message_wire_size(&self) -> u64 {
        self.active.wire_size()
    }

    fn assign_output_dir(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(format!("{}{}", self.sampler.name(), self.file_suffix));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)
            .map_err(|e| {
                error!(meter = self.sampler.name(), path = ?path, error = %e,
                       "failed to open output file");
                Error::InvalidPath(path.clone(), e)
            })?;
        self.file = Some(file);
        self.file_path = Some(std::fs::canonicalize(&path).unwrap_or(path));
        Ok(())
    }

    fn output_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    fn write_data_to_file(&mut self, sync: bool) -> Result<u64> {
        let wire = self.active.wire_size();
        if wire == 0 {
            // Synchronous callers (halt paths) still await pending writes.
            if sync {
                self.join_writer();
            }
            return Ok(0);
        }

        let file = match &self.file {
            Some(f) => f.try_clone()?,
            None => {
                return Err(Error::InvalidPath(
                    PathBuf::from(self.sampler.name()),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no output file assigned"),
                ));
            }
        };

        let claimed = self.shadow.take().or_else(|| {
            if sync {
                // Wait out the in-flight write instead of failing busy.
                self.join_writer();
                self.shadow.take()
            } else {
                None
            }
        });
        let mut claimed = match claimed {
            Some(b) => b,
            None => {
                warn!(
                    meter = self.sampler.name(),
                    "shadow buffer unavailable, last write has not returned"
                );
                return Err(Error::WriteBusy);
            }
        };
        // The slot was occupied, so any previous writer has published and
        // is exiting; joining here is cheap.
        self.join_writer();

        // Pointer-style swap: the claimed (empty) buffer becomes active,
        // the full one travels to the writer in the same allocation.
        std::mem::swap(&mut self.active, &mut *claimed);
        let full = claimed;

        let slot = Arc::clone(&self.shadow);
        let written_times = Arc::clone(&self.written_times);
        let written_size = Arc::clone(&self.written_size);
        let name = self.sampler.name().to_string();

        let handle = std::thread::spawn(move || {
            let mut file = file;
            let header = (wire as usize).to_ne_bytes();
            let result = file
                .write_all(&header)
                .and_then(|_| full.write_to(&mut file));

            written_times.fetch_add(1, Ordering::Relaxed);
            written_size.fetch_add(WRITE_HEADER_WIDTH + wire as usize, Ordering::Relaxed);

            if let Err(e) = result {
                error!(meter = name.as_str(), error = %e, "failed to write time series");
            }

            let mut drained = full;
            drained.clear();
            slot.put(drained);
        });
        self.writer = Some(handle);

        if sync {
            info!(meter = self.sampler.name(), "waiting for writer to finish");
            self.join_writer();
        }

        Ok(wire)
    }

    fn fsync_data_to_file(&self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.sync_all() {
                error!(meter = self.sampler.name(), error = %e, "fsync failed");
            }
        }
    }

    fn written_times(&self) -> usize {
        self.written_times.load(Ordering::Relaxed)
    }

    fn written_size(&self) -> usize {
        self.written_size.load(Ordering::Relaxed)
    }

    fn detailed_report(&self) -> Option<String> {
        self.sampler.detailed_report()
    }
}

impl<S: Sampler> Drop for MeterUnit<S> {
    fn drop(&mut self) {
        // Outstanding writes must complete before buffers are released.
        self.join_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Sample;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Num {
        value: u64,
    }
    impl Sample for Num {}

    /// Produces consecutive integers; fails on demand.
    struct Counter {
        next: u64,
        fail_next: bool,
    }

    impl Sampler for Counter {
        type Record = Num;

        fn name(&self) -> &str {
            "counter"
        }

        fn fill(&mut self, _testrun: bool, record: &mut Num) -> Result<Fill> {
            record.value = self.next;
            self.next += 1;
            if self.fail_next {
                self.fail_next = false;
                return Err(Error::PartialSample("induced".into()));
            }
            Ok(Fill::Recorded)
        }
    }

    fn counter_meter() -> MeterUnit<Counter> {
        MeterUnit::new(
            Counter {
                next: 0,
                fail_next: false,
            },
            Duration::from_millis(100),
            true,
        )
    }

    #[test]
    fn atomic_slot_take_and_put() {
        let slot = AtomicSlot::new(Box::new(41u64));
        let value = slot.take().unwrap();
        assert_eq!(*value, 41);
        assert!(slot.take().is_none());
        slot.put(value);
        assert_eq!(*slot.take().unwrap(), 41);
    }

    #[test]
    fn update_appends_exactly_one_record() {
        let mut meter = counter_meter();
        for _ in 0..3 {
            meter.update(false).unwrap();
        }
        assert_eq!(meter.active.len(), 3);
    }

    #[test]
    fn failed_update_keeps_partial_record() {
        let mut meter = counter_meter();
        meter.sampler.fail_next = true;
        assert!(meter.update(false).is_err());
        assert_eq!(meter.active.len(), 1);
    }

    #[test]
    fn write_frames_header_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut meter = counter_meter();
        meter.assign_output_dir(dir.path()).unwrap();

        meter.update(false).unwrap();
        meter.update(false).unwrap();
        let wire = meter.write_data_to_file(true).unwrap();
        assert!(wire > 0);
        assert_eq!(meter.written_times(), 1);
        assert_eq!(meter.written_size(), WRITE_HEADER_WIDTH + wire as usize);

        let bytes = std::fs::read(meter.output_path().unwrap()).unwrap();
        let header = usize::from_ne_bytes(bytes[..WRITE_HEADER_WIDTH].try_into().unwrap());
        assert_eq!(header, wire as usize);

        let series: TimeSeries<Num> = bincode::deserialize(&bytes[WRITE_HEADER_WIDTH..]).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.samples[0].value, 0);
        assert_eq!(series.samples[1].value, 1);

        // The active buffer was swapped out; sampling continues cleanly.
        assert_eq!(meter.current_message_wire_size(), 0);
        meter.update(false).unwrap();
        assert_eq!(meter.active.len(), 1);
    }

    #[test]
    fn empty_buffer_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut meter = counter_meter();
        meter.assign_output_dir(dir.path()).unwrap();
        assert_eq!(meter.write_data_to_file(true).unwrap(), 0);
        assert_eq!(meter.written_times(), 0);
        assert_eq!(
            std::fs::metadata(meter.output_path().unwrap()).unwrap().len(),
            0
        );
    }

    #[test]
    fn write_busy_when_shadow_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let mut meter = counter_meter();
        meter.assign_output_dir(dir.path()).unwrap();
        meter.update(false).unwrap();

        // Simulate an in-flight write by stealing the shadow buffer.
        let stolen = meter.shadow.take().unwrap();
        let result = meter.write_data_to_file(false);
        assert!(matches!(result, Err(Error::WriteBusy)));
        // The active buffer kept accumulating.
        assert_eq!(meter.active.len(), 1);

        meter.shadow.put(stolen);
        let wire = meter.write_data_to_file(true).unwrap();
        assert!(wire > 0);
        assert_eq!(meter.written_times(), 1);
    }

    #[test]
    fn reset_buffer_clears_both_sides() {
        let mut meter = counter_meter();
        meter.update(true).unwrap();
        assert!(meter.current_message_wire_size() > 0);
        meter.reset_buffer();
        assert_eq!(meter.current_message_wire_size(), 0);
        assert_eq!(meter.current_message_mem_size(), 0);
    }

    #[test]
    fn successive_writes_append_units() {
        let dir = tempfile::tempdir().unwrap();
        let mut meter = counter_meter();
        meter.assign_output_dir(dir.path()).unwrap();

        meter.update(false).unwrap();
        let first = meter.write_data_to_file(true).unwrap();
        meter.update(false).unwrap();
        let second = meter.write_data_to_file(true).unwrap();

        assert_eq!(meter.written_times(), 2);
        let bytes = std::fs::read(meter.output_path().unwrap()).unwrap();
        assert_eq!(
            bytes.len(),
            2 * WRITE_HEADER_WIDTH + first as usize + second as usize
        );

        // Second unit starts after the first.
        let offset = WRITE_HEADER_WIDTH + first as usize;
        let header =
            usize::from_ne_bytes(bytes[offset..offset + WRITE_HEADER_WIDTH].try_into().unwrap());
        assert_eq!(header, second as usize);
        let series: TimeSeries<Num> =
            bincode::deserialize(&bytes[offset + WRITE_HEADER_WIDTH..]).unwrap();
        assert_eq!(series.samples[0].value, 1);
    }
}
