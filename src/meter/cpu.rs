//! CPU meter: per-core counters, kernel activity and softirq breakdown
//! from `/proc/stat`.

use crate::error::{Error, Result};
use crate::fsx::FileSystem;
use crate::meter::{Fill, MeterUnit, Sampler};
use crate::record::Sample;
use crate::util::{monotonic_ns, online_cpus};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// One `cpu`/`cpuN` line: ten jiffy counters.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CoreStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

/// Kernel-wide activity counters (`btime` is deliberately skipped).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KernelStat {
    pub intr: u64,
    pub ctxt: u64,
    pub processes: u64,
    pub procs_running: u32,
    pub procs_blocked: u32,
}

/// The eleven counters of the `softirq` line.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SoftirqStat {
    pub total: u64,
    pub hi: u64,
    pub timer: u64,
    pub net_tx: u64,
    pub net_rx: u64,
    pub block: u64,
    pub irq_poll: u64,
    pub tasklet: u64,
    pub sched: u64,
    pub hrtimer: u64,
    pub rcu: u64,
}

/// One CPU sample: the aggregate line plus one [`CoreStat`] per online CPU.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CpuSample {
    pub timestamp_ns: u64,
    /// Aggregate first, then per-core in kernel order.
    pub core_stats: Vec<CoreStat>,
    pub kernel: KernelStat,
    pub softirq: SoftirqStat,
}

impl Sample for CpuSample {
    fn heap_size(&self) -> usize {
        self.core_stats.capacity() * std::mem::size_of::<CoreStat>()
    }
}

/// Sampler reading `<proc>/stat`.
pub struct CpuSampler<F: FileSystem> {
    fs: F,
    stat_path: PathBuf,
    ncores: usize,
}

impl<F: FileSystem> CpuSampler<F> {
    /// The core count is fixed at construction from the same file that is
    /// sampled later, falling back to the host CPU count on a failed read.
    pub fn new(fs: F, proc_path: impl Into<PathBuf>) -> Self {
        let stat_path = proc_path.into().join("stat");
        let ncores = match fs.read_to_string(&stat_path) {
            Ok(content) => content
                .lines()
                .filter(|l| l.starts_with("cpu") && !l.starts_with("cpu "))
                .count(),
            Err(_) => 0,
        };
        let ncores = if ncores == 0 { online_cpus() } else { ncores };
        Self {
            fs,
            stat_path,
            ncores,
        }
    }

    pub fn ncores(&self) -> usize {
        self.ncores
    }

    fn parse_core_line(line: &str, core: &mut CoreStat) -> bool {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let mut complete = fields.len() >= 11 && fields[0].starts_with("cpu");
        let mut value = |idx: usize| -> u64 {
            match fields.get(idx).and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => {
                    complete = false;
                    0
                }
            }
        };
        core.user = value(1);
        core.nice = value(2);
        core.system = value(3);
        core.idle = value(4);
        core.iowait = value(5);
        core.irq = value(6);
        core.softirq = value(7);
        core.steal = value(8);
        core.guest = value(9);
        core.guest_nice = value(10);
        complete
    }

    fn parse_softirq_line(line: &str, softirq: &mut SoftirqStat) -> bool {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let mut complete = fields.len() >= 12;
        let mut value = |idx: usize| -> u64 {
            match fields.get(idx).and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => {
                    complete = false;
                    0
                }
            }
        };
        softirq.total = value(1);
        softirq.hi = value(2);
        softirq.timer = value(3);
        softirq.net_tx = value(4);
        softirq.net_rx = value(5);
        softirq.block = value(6);
        softirq.irq_poll = value(7);
        softirq.tasklet = value(8);
        softirq.sched = value(9);
        softirq.hrtimer = value(10);
        softirq.rcu = value(11);
        complete
    }
}

impl<F: FileSystem> Sampler for CpuSampler<F> {
    type Record = CpuSample;

    fn name(&self) -> &str {
        "cpu"
    }

    fn fill(&mut self, _testrun: bool, record: &mut CpuSample) -> Result<Fill> {
        let content = self.fs.read_to_string(&self.stat_path)?;
        record.timestamp_ns = monotonic_ns();

        let mut complete = true;
        let mut lines = content.lines();

        // Aggregate line plus one line per online CPU.
        for core_idx in 0..self.ncores + 1 {
            let mut core = CoreStat::default();
            match lines.next() {
                Some(line) if line.starts_with("cpu") => {
                    if !Self::parse_core_line(line, &mut core) {
                        warn!(core = core_idx, "short cpu line in /proc/stat");
                        complete = false;
                    }
                }
                _ => {
                    warn!(core = core_idx, "missing cpu line in /proc/stat");
                    complete = false;
                }
            }
            record.core_stats.push(core);
        }

        // The remaining counters are keyed lines in kernel order; matching
        // on the first token tolerates lines this meter does not use.
        let mut seen_kernel = 0;
        let mut seen_softirq = false;
        for line in lines {
            let mut fields = line.split_whitespace();
            let key = match fields.next() {
                Some(k) => k,
                None => continue,
            };
            let first = fields.next().and_then(|v| v.parse::<u64>().ok());
            match key {
                "intr" => {
                    record.kernel.intr = first.unwrap_or(0);
                    seen_kernel += 1;
                }
                "ctxt" => {
                    record.kernel.ctxt = first.unwrap_or(0);
                    seen_kernel += 1;
                }
                "processes" => {
                    record.kernel.processes = first.unwrap_or(0);
                    seen_kernel += 1;
                }
                "procs_running" => {
                    record.kernel.procs_running = first.unwrap_or(0) as u32;
                    seen_kernel += 1;
                }
                "procs_blocked" => {
                    record.kernel.procs_blocked = first.unwrap_or(0) as u32;
                    seen_kernel += 1;
                }
                "softirq" => {
                    if !Self::parse_softirq_line(line, &mut record.softirq) {
                        warn!("short softirq line in /proc/stat");
                        complete = false;
                    }
                    seen_softirq = true;
                }
                _ => {}
            }
        }
        if seen_kernel < 5 || !seen_softirq {
            warn!(
                seen_kernel,
                seen_softirq, "kernel counters missing from /proc/stat"
            );
            complete = false;
        }

        if complete {
            Ok(Fill::Recorded)
        } else {
            Err(Error::PartialSample(format!(
                "short read of {:?}",
                self.stat_path
            )))
        }
    }

    fn detailed_report(&self) -> Option<String> {
        Some(format!("Number of CPU cores: {}", self.ncores))
    }
}

/// Builds a CPU meter. Always valid.
pub fn cpu_meter<F: FileSystem + 'static>(
    fs: F,
    proc_path: impl Into<PathBuf>,
    tick_period: Duration,
) -> MeterUnit<CpuSampler<F>> {
    MeterUnit::new(CpuSampler::new(fs, proc_path), tick_period, true)
}
