//! Block-device meter: the 17 per-device counters of `/proc/diskstats`.
//!
//! Only the devices requested at construction are recorded; all other
//! lines are skipped. A requested device that never appears makes the
//! meter invalid before recording can start.

use crate::error::{Error, Result};
use crate::fsx::FileSystem;
use crate::meter::{Fill, MeterUnit, Sampler};
use crate::record::Sample;
use crate::util::monotonic_ns;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, warn};

/// Counters of one `/proc/diskstats` line (kernel 5.5+ layout: reads,
/// writes, discards and flushes with their time-spent variants).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DiskStat {
    pub device: String,
    pub reads_completed: u64,
    pub reads_merged: u64,
    pub sectors_read: u64,
    pub time_reading_ms: u64,
    pub writes_completed: u64,
    pub writes_merged: u64,
    pub sectors_written: u64,
    pub time_writing_ms: u64,
    pub io_in_progress: u64,
    pub time_io_ms: u64,
    pub weighted_time_io_ms: u64,
    pub discards_completed: u64,
    pub discards_merged: u64,
    pub sectors_discarded: u64,
    pub time_discarding_ms: u64,
    pub flushes_completed: u64,
    pub time_flushing_ms: u64,
}

/// One disk sample: a sub-record per requested device, in file order.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DiskSample {
    pub timestamp_ns: u64,
    pub disks: Vec<DiskStat>,
}

impl Sample for DiskSample {
    fn heap_size(&self) -> usize {
        self.disks.capacity() * std::mem::size_of::<DiskStat>()
            + self.disks.iter().map(|d| d.device.capacity()).sum::<usize>()
    }
}

/// Sampler reading `<proc>/diskstats` for a fixed device set.
pub struct DiskSampler<F: FileSystem> {
    fs: F,
    diskstats_path: PathBuf,
    devices: Vec<String>,
    device_set: HashSet<String>,
}

impl<F: FileSystem> DiskSampler<F> {
    fn new(fs: F, proc_path: impl Into<PathBuf>, devices: Vec<String>) -> Self {
        let device_set = devices.iter().cloned().collect();
        Self {
            fs,
            diskstats_path: proc_path.into().join("diskstats"),
            devices,
            device_set,
        }
    }

    /// Returns the requested devices absent from the current file.
    fn missing_devices(&self) -> Vec<String> {
        let present: HashSet<String> = match self.fs.read_to_string(&self.diskstats_path) {
            Ok(content) => content
                .lines()
                .filter_map(|l| l.split_whitespace().nth(2).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(path = ?self.diskstats_path, error = %e, "failed to open diskstats");
                return self.devices.clone();
            }
        };
        self.devices
            .iter()
            .filter(|d| !present.contains(*d))
            .cloned()
            .collect()
    }

    fn parse_counters(fields: &[&str], stat: &mut DiskStat) -> bool {
        let mut complete = fields.len() >= 20;
        let mut value = |idx: usize| -> u64 {
            match fields.get(idx).and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => {
                    complete = false;
                    0
                }
            }
        };
        stat.reads_completed = value(3);
        stat.reads_merged = value(4);
        stat.sectors_read = value(5);
        stat.time_reading_ms = value(6);
        stat.writes_completed = value(7);
        stat.writes_merged = value(8);
        stat.sectors_written = value(9);
        stat.time_writing_ms = value(10);
        stat.io_in_progress = value(11);
        stat.time_io_ms = value(12);
        stat.weighted_time_io_ms = value(13);
        stat.discards_completed = value(14);
        stat.discards_merged = value(15);
        stat.sectors_discarded = value(16);
        stat.time_discarding_ms = value(17);
        stat.flushes_completed = value(18);
        stat.time_flushing_ms = value(19);
        complete
    }
}

impl<F: FileSystem> Sampler for DiskSampler<F> {
    type Record = DiskSample;

    fn name(&self) -> &str {
        "disk"
    }

    fn fill(&mut self, _testrun: bool, record: &mut DiskSample) -> Result<Fill> {
        let content = self.fs.read_to_string(&self.diskstats_path)?;
        record.timestamp_ns = monotonic_ns();

        let mut remaining = self.device_set.clone();
        let mut complete = true;
        for line in content.lines() {
            if remaining.is_empty() {
                break;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let device = match fields.get(2) {
                Some(d) => *d,
                None => continue,
            };
            if !remaining.remove(device) {
                continue;
            }

            let mut stat = DiskStat {
                device: device.to_string(),
                ..DiskStat::default()
            };
            if !Self::parse_counters(&fields, &mut stat) {
                warn!(device, "short diskstats line");
                complete = false;
            }
            record.disks.push(stat);
        }

        if !remaining.is_empty() {
            let mut missing: Vec<String> = remaining.into_iter().collect();
            missing.sort();
            warn!(
                missing = missing.join(", ").as_str(),
                "diskstats ended before all requested devices were seen"
            );
            return Err(Error::PartialSample(format!(
                "devices not seen: {}",
                missing.join(", ")
            )));
        }

        if complete {
            Ok(Fill::Recorded)
        } else {
            Err(Error::PartialSample(format!(
                "short read of {:?}",
                self.diskstats_path
            )))
        }
    }

    fn detailed_report(&self) -> Option<String> {
        let mut report = String::from("Monitored devices:");
        for device in &self.devices {
            report.push_str(&format!("\n  - {}", device));
        }
        Some(report)
    }
}

/// Builds a disk meter. The meter is invalid when any requested device is
/// absent from diskstats at construction time.
pub fn disk_meter<F: FileSystem + 'static>(
    fs: F,
    proc_path: impl Into<PathBuf>,
    tick_period: Duration,
    devices: Vec<String>,
) -> MeterUnit<DiskSampler<F>> {
    let sampler = DiskSampler::new(fs, proc_path, devices);
    let missing = sampler.missing_devices();
    let valid = missing.is_empty();
    if !valid {
        error!(
            missing = missing.join(", ").as_str(),
            "requested block devices do not exist"
        );
    }
    MeterUnit::new(sampler, tick_period, valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::Meter;
    use crate::mock::MockFs;

    #[test]
    fn parses_requested_devices_only() {
        let mut meter = disk_meter(
            MockFs::typical_system(),
            "/proc",
            Duration::from_millis(500),
            vec!["sda".to_string(), "nvme0n1".to_string()],
        );
        assert!(meter.is_valid());

        meter.update(false).unwrap();
        assert!(meter.current_message_wire_size() > 0);
    }

    #[test]
    fn counters_land_in_order() {
        let mut sampler = DiskSampler::new(
            MockFs::typical_system(),
            "/proc",
            vec!["nvme0n1".to_string()],
        );
        let mut record = DiskSample::default();
        sampler.fill(false, &mut record).unwrap();

        assert_eq!(record.disks.len(), 1);
        let d = &record.disks[0];
        assert_eq!(d.device, "nvme0n1");
        assert_eq!(d.reads_completed, 9999);
        assert_eq!(d.sectors_read, 123456);
        assert_eq!(d.writes_completed, 8888);
        assert_eq!(d.io_in_progress, 5);
        assert_eq!(d.weighted_time_io_ms, 2000);
        assert_eq!(d.discards_completed, 60);
        assert_eq!(d.flushes_completed, 44);
        assert_eq!(d.time_flushing_ms, 90);
    }

    #[test]
    fn partition_lines_are_skipped() {
        let mut sampler =
            DiskSampler::new(MockFs::typical_system(), "/proc", vec!["sda".to_string()]);
        let mut record = DiskSample::default();
        sampler.fill(false, &mut record).unwrap();
        assert_eq!(record.disks.len(), 1);
        assert_eq!(record.disks[0].device, "sda");
        // sda1 values must not have leaked into the sda record.
        assert_eq!(record.disks[0].reads_completed, 1234);
    }

    #[test]
    fn absent_device_invalidates_the_meter() {
        let meter = disk_meter(
            MockFs::typical_system(),
            "/proc",
            Duration::from_millis(500),
            vec!["sda".to_string(), "sdz".to_string()],
        );
        assert!(!meter.is_valid());
        assert!(meter.detailed_report().unwrap().contains("sdz"));
    }

    #[test]
    fn early_eof_reports_incomplete_sample() {
        let mut fs = MockFs::new();
        fs.add_file(
            "/proc/diskstats",
            "   8       0 sda 1 0 2 3 4 0 5 6 0 7 8 0 0 0 0 0 0\n",
        );
        let mut sampler = DiskSampler::new(
            fs,
            "/proc",
            vec!["sda".to_string(), "vanished".to_string()],
        );
        let mut record = DiskSample::default();
        let result = sampler.fill(false, &mut record);
        assert!(matches!(result, Err(Error::PartialSample(_))));
        // The device that was present is still in the partial record.
        assert_eq!(record.disks.len(), 1);
    }
}
