//! Tick coordination: one coordinator plus one worker thread per meter,
//! rendezvousing on a single cyclic barrier twice per tick.
//!
//! Phase 1 releases all workers into their `update`; phase 2 marks the
//! rendezvous after which the coordinator inspects buffer sizes and
//! triggers asynchronous writes. Stopping is cooperative: the stop flag is
//! observed at the barrier, so no tick is ever preempted mid-sample.

use crate::meter::Meter;
use crate::util::monotonic_ns;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A meter shared between its worker thread and the coordinator.
pub type SharedMeter = Arc<Mutex<dyn Meter>>;

/// Observed update durations kept per meter.
const DURATION_RING_CAPACITY: usize = 128;

/// Remaining tick budget below this fraction triggers a skew warning.
const SKEW_WARNING_FRACTION: f64 = 0.1;

struct PoolShared {
    label: String,
    meters: Vec<SharedMeter>,
    period: Duration,
    write_threshold: usize,
    barrier: Barrier,
    stop: AtomicBool,
    created_at: Instant,
    /// Per-meter rings of observed `update` durations, in nanoseconds.
    update_durations: Vec<Mutex<VecDeque<u64>>>,
    /// Per-meter monotonic timestamp of the last finished update.
    finish_times: Vec<AtomicU64>,
}

/// The running thread group of one recording system.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    coordinator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the coordinator and one worker per meter. The tick anchor is
    /// the pool creation instant.
    pub fn new(
        label: String,
        meters: Vec<SharedMeter>,
        period: Duration,
        write_threshold: usize,
    ) -> Self {
        let nmeters = meters.len();
        let shared = Arc::new(PoolShared {
            label,
            meters,
            period,
            write_threshold,
            barrier: Barrier::new(nmeters + 1),
            stop: AtomicBool::new(false),
            created_at: Instant::now(),
            update_durations: (0..nmeters)
                .map(|_| Mutex::new(VecDeque::with_capacity(DURATION_RING_CAPACITY)))
                .collect(),
            finish_times: (0..nmeters).map(|_| AtomicU64::new(0)).collect(),
        });

        let coordinator = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("hostmeter-coord".into())
                .spawn(move || coordinator_loop(&shared))
                .expect("failed to spawn coordinator thread")
        };

        let workers: Vec<JoinHandle<()>> = (0..nmeters)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("hostmeter-worker-{}", idx))
                    .spawn(move || worker_loop(&shared, idx))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(
            label = shared.label.as_str(),
            meters = nmeters,
            "worker pool constructed"
        );

        Self {
            shared,
            coordinator: Some(coordinator),
            workers,
        }
    }

    /// Mean observed update duration of meter `idx`, if any ticks ran.
    pub fn mean_update_duration(&self, idx: usize) -> Option<Duration> {
        let ring = self.shared.update_durations.get(idx)?.lock().unwrap();
        if ring.is_empty() {
            return None;
        }
        let sum: u64 = ring.iter().sum();
        Some(Duration::from_nanos(sum / ring.len() as u64))
    }

    /// Monotonic nanosecond timestamp of meter `idx`'s last finished
    /// update; 0 before the first tick.
    pub fn last_finish_ns(&self, idx: usize) -> u64 {
        self.shared
            .finish_times
            .get(idx)
            .map(|t| t.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        info!(
            label = self.shared.label.as_str(),
            "stopping worker pool, waiting for threads to join"
        );
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!(label = self.shared.label.as_str(), "worker pool destructed");
    }
}

/// Sleeps until `deadline` in short slices, returning early once `stop`
/// is raised so a halt never waits out a full period.
fn sleep_until(deadline: Instant, stop: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(100);
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}

fn coordinator_loop(shared: &PoolShared) {
    let mut deadline = shared.created_at + shared.period;
    loop {
        sleep_until(deadline, &shared.stop);

        if shared.stop.load(Ordering::Acquire) {
            // One last arrival drains the workers out of phase 1.
            shared.barrier.wait();
            break;
        }

        // Phase 1: release every worker into this tick.
        shared.barrier.wait();
        // Phase 2: every worker has finished its update.
        shared.barrier.wait();

        for meter in &shared.meters {
            let mut meter = meter.lock().unwrap();
            if meter.current_message_wire_size() >= shared.write_threshold as u64 {
                match meter.write_data_to_file(false) {
                    Ok(_) | Err(crate::error::Error::WriteBusy) => {}
                    Err(e) => {
                        error!(meter = meter.name(), error = %e, "write trigger failed");
                    }
                }
            }
        }

        deadline += shared.period;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if (remaining.as_secs_f64()) < SKEW_WARNING_FRACTION * shared.period.as_secs_f64() {
            warn!(
                label = shared.label.as_str(),
                remaining_ms = remaining.as_millis() as u64,
                period_ms = shared.period.as_millis() as u64,
                "tick overran its budget, consider increasing the sample period"
            );
        }
    }
}

fn worker_loop(shared: &PoolShared, idx: usize) {
    loop {
        // Phase 1: wait for the coordinator's release.
        shared.barrier.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let start = Instant::now();
        let result = shared.meters[idx].lock().unwrap().update(false);
        let elapsed = start.elapsed();

        if let Err(e) = result {
            warn!(worker = idx, error = %e, "meter update failed");
        }

        {
            let mut ring = shared.update_durations[idx].lock().unwrap();
            if ring.len() == DURATION_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(elapsed.as_nanos() as u64);
        }
        shared.finish_times[idx].store(monotonic_ns(), Ordering::Release);

        // Phase 2: rendezvous back with the coordinator.
        shared.barrier.wait();
    }
}
