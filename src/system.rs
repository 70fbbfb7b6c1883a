//! Meter-set lifecycle: validation, recording, test runs and reporting.
//!
//! A system is either idle or recording; every transition and status query
//! goes through the operation-status mutex. The mutex is never held while
//! a meter is sampling.

use crate::error::{Error, Result};
use crate::meter::Meter;
use crate::worker::{SharedMeter, WorkerPool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Process-unique identifier of a [`System`].
pub type SystemId = i32;

/// Sentinel for construction failures at the registry boundary.
pub const INVALID_SYSTEM_ID: SystemId = -1;

/// Default per-message write-size threshold: 1 MiB.
pub const DEFAULT_MSG_WRITE_SIZE_THRESHOLD: usize = 1024 * 1024;

const SYSTEM_DEFAULT_NAME: &str = "<anonymous>";

struct SystemState {
    in_operation: bool,
    meters: Vec<SharedMeter>,
    pool: Option<WorkerPool>,
}

/// A set of meters recorded together on one tick cadence.
pub struct System {
    id: SystemId,
    name: String,
    output_dir: PathBuf,
    default_sample_period: Duration,
    msg_write_size_threshold: usize,
    state: Mutex<SystemState>,
}

impl System {
    pub fn new(
        id: SystemId,
        name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        default_sample_period: Duration,
        msg_write_size_threshold: usize,
    ) -> Self {
        let system = Self {
            id,
            name: name.into(),
            output_dir: output_dir.into(),
            default_sample_period,
            msg_write_size_threshold,
            state: Mutex::new(SystemState {
                in_operation: false,
                meters: Vec::new(),
                pool: None,
            }),
        };
        info!(
            system = system.id,
            name = system.system_name(),
            period_ms = default_sample_period.as_millis() as u64,
            output_dir = ?system.output_dir,
            "system initialized"
        );
        system
    }

    pub fn system_id(&self) -> SystemId {
        self.id
    }

    pub fn system_name(&self) -> &str {
        if self.name.is_empty() {
            SYSTEM_DEFAULT_NAME
        } else {
            &self.name
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn default_sample_period(&self) -> Duration {
        self.default_sample_period
    }

    pub fn msg_write_size_threshold(&self) -> usize {
        self.msg_write_size_threshold
    }

    fn label(&self) -> String {
        format!("system #{} ({})", self.id, self.system_name())
    }

    /// Adds a meter. Refused while recording.
    pub fn add_meter<M: Meter + 'static>(&self, meter: M) -> bool {
        self.add_shared_meter(Arc::new(Mutex::new(meter)))
    }

    /// Adds an already-shared meter. Refused while recording.
    pub fn add_shared_meter(&self, meter: SharedMeter) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.in_operation {
            warn!(system = self.id, "cannot add a meter while recording");
            return false;
        }
        state.meters.push(meter);
        true
    }

    /// Number of meters currently owned.
    pub fn meter_count(&self) -> usize {
        self.state.lock().unwrap().meters.len()
    }

    /// True when every owned meter is valid.
    pub fn is_valid(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.meters.iter().all(|m| m.lock().unwrap().is_valid())
    }

    /// Starts recording: validates the meter set, assigns output files and
    /// spawns the worker pool. Returns `Ok(false)` when already recording;
    /// invariant violations are fatal errors.
    pub fn start_recording(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.in_operation {
            return Ok(false);
        }

        for meter in &state.meters {
            let meter = meter.lock().unwrap();
            if !meter.is_valid() {
                let msg = format!(
                    "{} has invalid meter {}, cannot start recording",
                    self.label(),
                    meter.name()
                );
                error!("{}", msg);
                return Err(Error::FatalInvariant(msg));
            }
            // Heterogeneous periods are foreseen but not yet scheduled;
            // every meter must match the system default for now.
            if meter.tick_period() != self.default_sample_period {
                let msg = format!(
                    "{} meter {} has tick period {} ms, system default is {} ms",
                    self.label(),
                    meter.name(),
                    meter.tick_period().as_millis(),
                    self.default_sample_period.as_millis()
                );
                error!("{}", msg);
                return Err(Error::FatalInvariant(msg));
            }
        }

        let mut output_paths = HashSet::new();
        for meter in &state.meters {
            let mut meter = meter.lock().unwrap();
            meter.assign_output_dir(&self.output_dir)?;
            let path = meter
                .output_path()
                .expect("output path is set by assign_output_dir")
                .to_path_buf();
            if !output_paths.insert(path.clone()) {
                let msg = format!(
                    "{} meter {} shares output path {:?} with another meter",
                    self.label(),
                    meter.name(),
                    path
                );
                error!("{}", msg);
                return Err(Error::FatalInvariant(msg));
            }
        }

        state.pool = Some(WorkerPool::new(
            self.label(),
            state.meters.clone(),
            self.default_sample_period,
            self.msg_write_size_threshold,
        ));
        state.in_operation = true;
        Ok(true)
    }

    /// Stops recording and persists everything. `false` when idle.
    pub fn stop_recording(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.in_operation {
            return false;
        }
        Self::halt_locked(&mut state, self.id);
        state.in_operation = false;
        true
    }

    /// True while the worker pool is running.
    pub fn is_recording(&self) -> bool {
        self.state.lock().unwrap().in_operation
    }

    /// Stops the worker pool and synchronously flushes every meter.
    /// Idempotent; used by both `stop_recording` and process termination.
    pub fn halt(&self) {
        let mut state = self.state.lock().unwrap();
        let was_recording = state.in_operation;
        Self::halt_locked(&mut state, self.id);
        state.in_operation = false;
        if was_recording {
            info!(system = self.id, "system halted");
        } else {
            info!(system = self.id, "system not in operation");
        }
    }

    fn halt_locked(state: &mut SystemState, id: SystemId) {
        // Dropping the pool wakes and joins every worker thread.
        state.pool = None;

        for meter in &state.meters {
            let mut meter = meter.lock().unwrap();
            if let Err(e) = meter.write_data_to_file(true) {
                match e {
                    Error::InvalidPath(..) => {} // never started recording
                    other => {
                        error!(system = id, meter = meter.name(), error = %other,
                               "final flush failed")
                    }
                }
            }
            meter.fsync_data_to_file();
        }
    }

    /// Clears every meter buffer. Refused while recording.
    pub fn reset_all_buffers(&self) {
        let mut state = self.state.lock().unwrap();
        if state.in_operation {
            error!(
                system = self.id,
                "buffer reset requested while recording, refusing"
            );
            return;
        }
        Self::reset_all_buffers_locked(&mut state);
    }

    fn reset_all_buffers_locked(state: &mut SystemState) {
        for meter in &state.meters {
            meter.lock().unwrap().reset_buffer();
        }
    }

    /// Updates every meter once, in place. `false` when any update failed.
    pub fn update_once(&self) -> bool {
        let state = self.state.lock().unwrap();
        let mut ok = true;
        for meter in &state.meters {
            let mut meter = meter.lock().unwrap();
            if let Err(e) = meter.update(false) {
                warn!(meter = meter.name(), error = %e, "meter update failed");
                ok = false;
            }
        }
        ok
    }

    /// Dry-runs every meter once and estimates its write cadence from the
    /// single-sample wire size against the write threshold. Buffers are
    /// cleared before and after. `false` on any failure, on an empty meter
    /// list, or when a meter produced zero wire bytes.
    pub fn test_run(&self) -> bool {
        let meters = {
            let mut state = self.state.lock().unwrap();
            if state.in_operation {
                error!(
                    system = self.id,
                    "cannot test run while the system is recording"
                );
                return false;
            }
            // Marked as operating for the duration of the test run so
            // concurrent state changes are refused.
            state.in_operation = true;
            state.meters.clone()
        };
        let finish = |ret: bool| -> bool {
            self.state.lock().unwrap().in_operation = false;
            ret
        };

        if meters.is_empty() {
            error!(system = self.id, "cannot test run with no meters");
            return finish(false);
        }

        let invalid: Vec<String> = meters
            .iter()
            .filter_map(|m| {
                let m = m.lock().unwrap();
                if m.is_valid() {
                    None
                } else {
                    Some(m.name().to_string())
                }
            })
            .collect();
        if !invalid.is_empty() {
            error!(
                system = self.id,
                invalid = invalid.join(", ").as_str(),
                "invalid meters, cannot test run"
            );
            return finish(false);
        }

        info!(
            system = self.id,
            meters = meters.len(),
            "test run started"
        );
        for meter in &meters {
            meter.lock().unwrap().reset_buffer();
        }

        let threshold = self.msg_write_size_threshold as f64;
        let period_ms = self.default_sample_period.as_millis() as f64;
        let mut ok = true;
        let mut total_wire = 0u64;

        for meter in &meters {
            let mut meter = meter.lock().unwrap();
            let start = Instant::now();
            let mut meter_ok = match meter.update(true) {
                Ok(()) => true,
                Err(e) => {
                    warn!(meter = meter.name(), error = %e, "test run update failed");
                    false
                }
            };
            let duration = start.elapsed();

            let wire = meter.current_message_wire_size();
            total_wire += wire;
            if wire == 0 {
                error!(
                    system = self.id,
                    meter = meter.name(),
                    "message wire size is zero after a test update"
                );
                meter_ok = false;
            } else {
                let expected_writes = (self.msg_write_size_threshold as u64).div_ceil(wire);
                let avg_write_interval_ms = period_ms * threshold / wire as f64;
                info!(
                    system = self.id,
                    meter = meter.name(),
                    single_write_bytes = wire,
                    expected_writes,
                    avg_write_interval_ms = format!("{:.2}", avg_write_interval_ms).as_str(),
                    update_ms = format!("{:.3}", duration.as_secs_f64() * 1e3).as_str(),
                    update_budget_pct = format!(
                        "{:.2}",
                        duration.as_secs_f64() * 1e3 / period_ms * 100.0
                    )
                    .as_str(),
                    "test run result"
                );
            }
            ok &= meter_ok;
        }

        let write_rate = total_wire as f64 / period_ms * 1e3;
        info!(
            system = self.id,
            total_wire_bytes = total_wire,
            write_bytes_per_sec = format!("{:.2}", write_rate).as_str(),
            "test run finished"
        );

        for meter in &meters {
            let mut meter = meter.lock().unwrap();
            meter.reset_buffer();
            if meter.current_message_wire_size() > 0 {
                error!(
                    meter = meter.name(),
                    "non-empty message after test run reset"
                );
                ok = false;
            }
        }

        finish(ok)
    }

    /// Builds the status report; printed to stdout with `verbose`, logged
    /// otherwise. `detail` appends each meter's own report.
    pub fn report_status(&self, verbose: bool, detail: bool) -> String {
        let state = self.state.lock().unwrap();
        let mut report = format!(
            "# === Status report for system #{} ({}) ===\n",
            self.id,
            if state.in_operation {
                "in operation"
            } else {
                "idle"
            }
        );
        report.push_str(&format!("  System name: {}\n", self.system_name()));
        report.push_str(&format!("  Output dir:  {:?}\n", self.output_dir));
        report.push_str(&format!("  Meters:      {}\n", state.meters.len()));

        for (idx, meter) in state.meters.iter().enumerate() {
            let meter = meter.lock().unwrap();
            report.push_str(&format!("  Meter #{:<3}: {}\n", idx, meter.name()));
            report.push_str(&format!(
                "    Tick period:   {} ms\n",
                meter.tick_period().as_millis()
            ));
            report.push_str(&format!(
                "    Written:       {} times, {} B\n",
                meter.written_times(),
                meter.written_size()
            ));
            report.push_str(&format!(
                "    Msg wire size: {} B\n",
                meter.current_message_wire_size()
            ));
            report.push_str(&format!(
                "    Msg mem size:  {} B\n",
                meter.current_message_mem_size()
            ));
            if let Some(pool) = &state.pool {
                if let Some(mean) = pool.mean_update_duration(idx) {
                    report.push_str(&format!(
                        "    Mean update:   {:.3} ms\n",
                        mean.as_secs_f64() * 1e3
                    ));
                }
            }
            if detail {
                match meter.detailed_report() {
                    Some(detail_report) => {
                        report.push_str("    Detailed report:\n");
                        report.push_str(&crate::util::indent(&detail_report, "      "));
                        report.push('\n');
                    }
                    None => report.push_str("    No detailed report available\n"),
                }
            }
        }
        report.push_str("# === Report END ===");

        if verbose {
            println!("{}", report);
        } else {
            info!("{}", report);
        }
        report
    }
}

impl Drop for System {
    fn drop(&mut self) {
        info!(system = self.id, "system destructed");
    }
}
