//! Per-process meter: `/proc/<pid>/{stat,statm,io}` for a fixed pid set.
//!
//! Field positions follow proc_pid_stat(5); the comm field may contain
//! spaces and parentheses, so parsing anchors on the last `)`.

use crate::error::{Error, Result};
use crate::fsx::FileSystem;
use crate::meter::{Fill, MeterUnit, Sampler};
use crate::record::Sample;
use crate::util::monotonic_ns;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, warn};

/// Scheduling and fault counters from `/proc/<pid>/stat`. Fields past
/// `vsize` are irrelevant for resource monitoring and are not read.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PidStat {
    pub state: char,
    pub minflt: u64,
    pub cminflt: u64,
    pub majflt: u64,
    pub cmajflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    pub vsize: u64,
}

/// The seven page counters of `/proc/<pid>/statm`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PidStatm {
    pub size: u64,
    pub resident: u64,
    pub share: u64,
    pub text: u64,
    pub lib: u64,
    pub data: u64,
    pub dt: u64,
}

/// I/O accounting from `/proc/<pid>/io`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PidIo {
    pub rchar: u64,
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cancelled_write_bytes: u64,
}

/// One process in a sample: only the selected probes are populated.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PerProcStat {
    pub pid: i32,
    pub stat: Option<PidStat>,
    pub statm: Option<PidStatm>,
    pub io: Option<PidIo>,
}

/// One process-meter sample across all monitored pids.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcSample {
    pub timestamp_ns: u64,
    pub procs: Vec<PerProcStat>,
}

impl Sample for ProcSample {
    fn heap_size(&self) -> usize {
        self.procs.capacity() * std::mem::size_of::<PerProcStat>()
    }
}

/// Pseudo-files the process meter can read per pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProcProbe {
    Stat,
    Statm,
    Io,
}

/// Parses the monitored subset of `/proc/<pid>/stat`.
pub fn parse_pid_stat(content: &str) -> Result<PidStat> {
    // comm is enclosed in parentheses and may itself contain both.
    let close = content
        .rfind(')')
        .ok_or_else(|| Error::Parse("missing ')' in pid stat".into()))?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if fields.len() < 21 {
        return Err(Error::Parse(format!(
            "pid stat has {} fields after comm, expected at least 21",
            fields.len()
        )));
    }

    let uint = |idx: usize| -> u64 { fields[idx].parse().unwrap_or(0) };
    let int = |idx: usize| -> i64 { fields[idx].parse().unwrap_or(0) };

    Ok(PidStat {
        state: fields[0].chars().next().unwrap_or('?'),
        minflt: uint(7),
        cminflt: uint(8),
        majflt: uint(9),
        cmajflt: uint(10),
        utime: uint(11),
        stime: uint(12),
        cutime: int(13),
        cstime: int(14),
        priority: int(15),
        nice: int(16),
        num_threads: int(17),
        vsize: uint(20),
    })
}

/// Parses `/proc/<pid>/statm`.
pub fn parse_pid_statm(content: &str) -> Result<PidStatm> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 7 {
        return Err(Error::Parse(format!(
            "pid statm has {} fields, expected 7",
            fields.len()
        )));
    }
    let value = |idx: usize| -> u64 { fields[idx].parse().unwrap_or(0) };
    Ok(PidStatm {
        size: value(0),
        resident: value(1),
        share: value(2),
        text: value(3),
        lib: value(4),
        data: value(5),
        dt: value(6),
    })
}

/// Parses `/proc/<pid>/io` (key: value lines).
pub fn parse_pid_io(content: &str) -> Result<PidIo> {
    let mut io = PidIo::default();
    let mut seen = 0;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value: u64 = value.trim().parse().unwrap_or(0);
            seen += 1;
            match key.trim() {
                "rchar" => io.rchar = value,
                "wchar" => io.wchar = value,
                "syscr" => io.syscr = value,
                "syscw" => io.syscw = value,
                "read_bytes" => io.read_bytes = value,
                "write_bytes" => io.write_bytes = value,
                "cancelled_write_bytes" => io.cancelled_write_bytes = value,
                _ => seen -= 1,
            }
        }
    }
    if seen < 7 {
        return Err(Error::Parse(format!(
            "pid io has {} known keys, expected 7",
            seen
        )));
    }
    Ok(io)
}

/// Sampler over a fixed pid list and probe selection.
pub struct ProcSampler<F: FileSystem> {
    fs: F,
    proc_root: PathBuf,
    pids: Vec<i32>,
    probes: Vec<ProcProbe>,
}

impl<F: FileSystem> ProcSampler<F> {
    fn pid_file(&self, pid: i32, file: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(file)
    }
}

impl<F: FileSystem> Sampler for ProcSampler<F> {
    type Record = ProcSample;

    fn name(&self) -> &str {
        "proc"
    }

    fn fill(&mut self, _testrun: bool, record: &mut ProcSample) -> Result<Fill> {
        record.timestamp_ns = monotonic_ns();

        let mut failures = 0usize;
        for &pid in &self.pids {
            let mut per_proc = PerProcStat {
                pid,
                ..PerProcStat::default()
            };

            for probe in &self.probes {
                let (file, outcome) = match probe {
                    ProcProbe::Stat => (
                        "stat",
                        self.fs
                            .read_to_string(&self.pid_file(pid, "stat"))
                            .map_err(Error::Io)
                            .and_then(|c| parse_pid_stat(&c))
                            .map(|s| per_proc.stat = Some(s)),
                    ),
                    ProcProbe::Statm => (
                        "statm",
                        self.fs
                            .read_to_string(&self.pid_file(pid, "statm"))
                            .map_err(Error::Io)
                            .and_then(|c| parse_pid_statm(&c))
                            .map(|s| per_proc.statm = Some(s)),
                    ),
                    ProcProbe::Io => (
                        "io",
                        self.fs
                            .read_to_string(&self.pid_file(pid, "io"))
                            .map_err(Error::Io)
                            .and_then(|c| parse_pid_io(&c))
                            .map(|s| per_proc.io = Some(s)),
                    ),
                };
                if let Err(e) = outcome {
                    warn!(pid, file, error = %e, "failed to sample pid file");
                    failures += 1;
                }
            }
            record.procs.push(per_proc);
        }

        if failures == 0 {
            Ok(Fill::Recorded)
        } else {
            Err(Error::PartialSample(format!(
                "{} pid probe(s) failed",
                failures
            )))
        }
    }

    fn detailed_report(&self) -> Option<String> {
        let mut report = String::from("Monitored PIDs:");
        for pid in &self.pids {
            report.push_str(&format!("\n  - {}", pid));
        }
        report.push_str("\nEnabled probe(s):");
        for probe in &self.probes {
            report.push_str(&format!("\n  - {:?}", probe));
        }
        Some(report)
    }
}

/// Builds a per-process meter. Empty pid or probe lists leave it invalid.
pub fn proc_meter<F: FileSystem + 'static>(
    fs: F,
    proc_path: impl Into<PathBuf>,
    tick_period: Duration,
    pids: Vec<i32>,
    probes: Vec<ProcProbe>,
) -> MeterUnit<ProcSampler<F>> {
    let mut valid = true;
    if pids.is_empty() {
        error!("no pids provided for the process meter");
        valid = false;
    }
    if probes.is_empty() {
        error!("no probes provided for the process meter");
        valid = false;
    }
    MeterUnit::new(
        ProcSampler {
            fs,
            proc_root: proc_path.into(),
            pids,
            probes,
        },
        tick_period,
        valid,
    )
}
