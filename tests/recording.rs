//! End-to-end recording scenarios against the mock `/proc` fixtures.

use hostmeter::meter::cpu::{cpu_meter, CpuSample};
use hostmeter::meter::disk::{disk_meter, DiskSample};
use hostmeter::meter::gpu::{gpu_meter, GpuSample, MockGpuBackend};
use hostmeter::meter::mem::{mem_meter, MemProbe, MemSample};
use hostmeter::meter::proc::{proc_meter, ProcProbe, ProcSample};
use hostmeter::mock::MockFs;
use hostmeter::{Error, Sample, TimeSeries};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

const HEADER: usize = std::mem::size_of::<usize>();

fn ensure_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        hostmeter::registry::initialize("");
    });
}

/// Splits a meter file into its write-units, checking the framing exactly.
fn read_units<T: Sample>(path: &Path) -> Vec<TimeSeries<T>> {
    let bytes = std::fs::read(path).unwrap();
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        assert!(
            offset + HEADER <= bytes.len(),
            "truncated write-unit header at {}",
            offset
        );
        let size = usize::from_ne_bytes(bytes[offset..offset + HEADER].try_into().unwrap());
        offset += HEADER;
        assert!(
            offset + size <= bytes.len(),
            "write-unit payload of {} bytes overruns the file",
            size
        );
        let unit: TimeSeries<T> = bincode::deserialize(&bytes[offset..offset + size])
            .expect("write-unit payload must deserialize cleanly");
        offset += size;
        units.push(unit);
    }
    assert_eq!(offset, bytes.len(), "trailing garbage after last unit");
    units
}

#[test]
fn test_run_produces_wire_bytes_but_no_file() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let id = hostmeter::registry::create_system(
        dir.path(),
        Duration::from_millis(500),
        "testrun-only",
        hostmeter::DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();
    system.add_meter(cpu_meter(
        MockFs::typical_system(),
        "/proc",
        Duration::from_millis(500),
    ));

    assert!(system.test_run());

    // Buffers were cleared and nothing touched the output directory.
    let report = system.report_status(false, false);
    assert!(report.contains("Msg wire size: 0 B"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn absent_disk_device_blocks_recording() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let id = hostmeter::registry::create_system_with_defaults(
        dir.path(),
        Duration::from_millis(500),
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();

    system.add_meter(cpu_meter(
        MockFs::typical_system(),
        "/proc",
        Duration::from_millis(500),
    ));
    system.add_meter(disk_meter(
        MockFs::typical_system(),
        "/proc",
        Duration::from_millis(500),
        vec!["sdq".to_string()], // not in the fixture
    ));

    assert!(!system.is_valid());
    assert!(!system.test_run());
    assert!(matches!(
        system.start_recording(),
        Err(Error::FatalInvariant(_))
    ));
    assert!(!system.is_recording());
}

#[test]
fn recording_accumulates_and_halt_flushes_one_unit() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let id = hostmeter::registry::create_system(
        dir.path(),
        Duration::from_millis(200),
        "cadence",
        hostmeter::DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();
    system.add_meter(cpu_meter(
        MockFs::typical_system(),
        "/proc",
        Duration::from_millis(200),
    ));

    assert!(system.start_recording().unwrap());
    std::thread::sleep(Duration::from_millis(1250));
    assert!(system.stop_recording());

    let path = dir.path().join("cpu.ts.bin");
    let units: Vec<TimeSeries<CpuSample>> = read_units(&path);
    // Tiny samples never cross a 1 MiB threshold, so the only unit comes
    // from the final halt flush.
    assert_eq!(units.len(), 1);
    let total: usize = units.iter().map(|u| u.len()).sum();
    assert!(total >= 5, "expected >= 5 records after 1.25 s, got {}", total);

    // Samples are in tick order.
    let samples = &units[0].samples;
    for pair in samples.windows(2) {
        assert!(pair[0].timestamp_ns <= pair[1].timestamp_ns);
    }
}

#[test]
fn small_threshold_triggers_multiple_units() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let id = hostmeter::registry::create_system(
        dir.path(),
        Duration::from_millis(50),
        "threshold",
        64, // bytes: roughly every tick crosses it
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();
    system.add_meter(cpu_meter(
        MockFs::typical_system(),
        "/proc",
        Duration::from_millis(50),
    ));

    assert!(system.start_recording().unwrap());
    std::thread::sleep(Duration::from_millis(450));
    assert!(system.stop_recording());

    let units: Vec<TimeSeries<CpuSample>> = read_units(&dir.path().join("cpu.ts.bin"));
    assert!(
        units.len() >= 2,
        "expected threshold-triggered units plus the final flush, got {}",
        units.len()
    );
    for unit in &units {
        assert!(!unit.is_empty());
    }
}

#[test]
fn mixed_meter_set_records_all_sources() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let period = Duration::from_millis(100);
    let id = hostmeter::registry::create_system(
        dir.path(),
        period,
        "mixed",
        hostmeter::DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();

    system.add_meter(cpu_meter(MockFs::typical_system(), "/proc", period));
    system.add_meter(mem_meter(
        MockFs::typical_system(),
        "/proc",
        period,
        vec![MemProbe::Basic, MemProbe::Swap, MemProbe::HugePage],
    ));
    system.add_meter(proc_meter(
        MockFs::typical_system(),
        "/proc",
        period,
        vec![1234],
        vec![ProcProbe::Stat, ProcProbe::Statm, ProcProbe::Io],
    ));
    system.add_meter(disk_meter(
        MockFs::typical_system(),
        "/proc",
        period,
        vec!["sda".to_string(), "nvme0n1".to_string()],
    ));
    system.add_meter(gpu_meter(
        Box::new(MockGpuBackend::default()),
        period,
        vec![0],
        vec![],
        vec![2, 10],
    ));

    assert!(system.is_valid());
    assert!(system.test_run());
    assert!(system.start_recording().unwrap());
    std::thread::sleep(Duration::from_millis(550));
    assert!(system.stop_recording());

    let cpu: Vec<TimeSeries<CpuSample>> = read_units(&dir.path().join("cpu.ts.bin"));
    let mem: Vec<TimeSeries<MemSample>> = read_units(&dir.path().join("mem.ts.bin"));
    let proc_units: Vec<TimeSeries<ProcSample>> = read_units(&dir.path().join("proc.ts.bin"));
    let disk: Vec<TimeSeries<DiskSample>> = read_units(&dir.path().join("disk.ts.bin"));
    let gpu: Vec<TimeSeries<GpuSample>> = read_units(&dir.path().join("gpu.ts.bin"));

    let count = |units: &[TimeSeries<CpuSample>]| -> usize { units.iter().map(|u| u.len()).sum() };
    let cpu_records = count(&cpu);
    assert!(cpu_records >= 3);

    let mem_records: usize = mem.iter().map(|u| u.len()).sum();
    assert_eq!(cpu_records, mem_records, "meters tick in lockstep");

    let proc_records: usize = proc_units.iter().map(|u| u.len()).sum();
    assert_eq!(cpu_records, proc_records);

    let disk_records: usize = disk.iter().map(|u| u.len()).sum();
    assert_eq!(cpu_records, disk_records);

    // The GPU meter spends its first tick priming the sample pair.
    let gpu_records: usize = gpu.iter().map(|u| u.len()).sum();
    assert_eq!(cpu_records - 1, gpu_records);

    // Spot-check record contents across sources.
    assert_eq!(disk[0].samples[0].disks.len(), 2);
    assert_eq!(proc_units[0].samples[0].procs[0].pid, 1234);
    assert_eq!(gpu[0].samples[0].gpus[0].metric_values.len(), 2);
}

#[test]
fn shutdown_flushes_every_registered_system() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let id = hostmeter::registry::create_system(
        dir.path(),
        Duration::from_millis(50),
        "shutdown",
        hostmeter::DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();
    system.add_meter(cpu_meter(
        MockFs::typical_system(),
        "/proc",
        Duration::from_millis(50),
    ));

    assert!(system.start_recording().unwrap());
    std::thread::sleep(Duration::from_millis(200));

    // Graceful teardown, as the exit hook or signal watcher would run it.
    hostmeter::registry::shutdown();
    assert!(!system.is_recording());

    let units: Vec<TimeSeries<CpuSample>> = read_units(&dir.path().join("cpu.ts.bin"));
    assert!(!units.is_empty());
    assert!(units.iter().all(|u| !u.is_empty()));
}

#[cfg(target_os = "linux")]
#[test]
fn real_procfs_smoke_test() {
    use hostmeter::fsx::RealFs;
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let id = hostmeter::registry::create_system(
        dir.path(),
        Duration::from_millis(200),
        "real-proc",
        hostmeter::DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
    )
    .unwrap();
    let system = hostmeter::registry::system(id).unwrap();
    system.add_meter(cpu_meter(RealFs::new(), "/proc", Duration::from_millis(200)));
    system.add_meter(mem_meter(
        RealFs::new(),
        "/proc",
        Duration::from_millis(200),
        vec![MemProbe::Basic, MemProbe::KernelCache],
    ));

    assert!(system.is_valid());
    assert!(system.test_run());
}
