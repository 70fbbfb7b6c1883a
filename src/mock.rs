//! In-memory mock filesystem and canned `/proc` fixtures for tests.

use crate::fsx::FileSystem;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// In-memory filesystem for testing.
///
/// Stores file contents keyed by path so tests can simulate arbitrary
/// `/proc` states without touching the host.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        self.files.insert(path.as_ref().to_path_buf(), content.into());
    }

    /// A plausible two-core system with one pid and two block devices.
    pub fn typical_system() -> Self {
        let mut fs = Self::new();
        fs.add_file("/proc/stat", PROC_STAT);
        fs.add_file("/proc/diskstats", PROC_DISKSTATS);
        fs.add_file("/proc/meminfo", PROC_MEMINFO);
        fs.add_file("/proc/1234/stat", PROC_PID_STAT);
        fs.add_file("/proc/1234/statm", PROC_PID_STATM);
        fs.add_file("/proc/1234/io", PROC_PID_IO);
        fs
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

/// `/proc/stat` with one aggregate line, two cores, the kernel counters and
/// the softirq breakdown.
pub const PROC_STAT: &str = "\
cpu  10000 500 3000 80000 1000 200 100 50 25 10
cpu0 5000 250 1500 40000 500 100 50 25 12 5
cpu1 5000 250 1500 40000 500 100 50 25 13 5
intr 4000000 120 9 0 0 0 0 0 0 1 0 0 0 156 0 0 0
ctxt 500000
btime 1700000000
processes 10000
procs_running 2
procs_blocked 1
softirq 900000 1 200000 300 40000 21000 0 5000 330000 2500 301199
";

/// `/proc/diskstats` with a disk, one partition and an NVMe device; each
/// line carries the full 17-counter set (kernel 5.5+ layout).
pub const PROC_DISKSTATS: &str = "\
   8       0 sda 1234 10 56789 100 5678 20 98765 200 0 150 300 40 2 320 8 12 30
   8       1 sda1 1000 8 50000 80 5000 15 90000 180 0 130 260 35 1 300 6 10 25
 259       0 nvme0n1 9999 90 123456 500 8888 80 654321 400 5 1000 2000 60 4 800 20 44 90
";

/// `/proc/meminfo` covering every probe the memory meter knows about.
pub const PROC_MEMINFO: &str = "\
MemTotal:       16384000 kB
MemFree:         8192000 kB
MemAvailable:   12000000 kB
Buffers:          512000 kB
Cached:          2048000 kB
SwapCached:         1000 kB
Active:          3000000 kB
Inactive:        1500000 kB
Active(anon):    2000000 kB
Inactive(anon):   500000 kB
Active(file):    1000000 kB
Inactive(file):  1000000 kB
Unevictable:        8000 kB
Mlocked:            8000 kB
SwapTotal:       4096000 kB
SwapFree:        4096000 kB
Zswap:                 0 kB
Zswapped:              0 kB
Dirty:              1024 kB
Writeback:             0 kB
AnonPages:       2500000 kB
Mapped:           600000 kB
Shmem:            120000 kB
KReclaimable:     280000 kB
Slab:             512000 kB
SReclaimable:     256000 kB
SUnreclaim:       256000 kB
KernelStack:       16000 kB
PageTables:        32000 kB
NFS_Unstable:          0 kB
Bounce:                0 kB
WritebackTmp:          0 kB
CommitLimit:    12288000 kB
Committed_AS:    6000000 kB
VmallocTotal:   34359738367 kB
VmallocUsed:       60000 kB
VmallocChunk:          0 kB
Percpu:            12000 kB
HardwareCorrupted:     0 kB
AnonHugePages:    204800 kB
ShmemHugePages:        0 kB
ShmemPmdMapped:        0 kB
FileHugePages:         0 kB
FilePmdMapped:         0 kB
HugePages_Total:       0
HugePages_Free:        0
HugePages_Rsvd:        0
HugePages_Surp:        0
Hugepagesize:       2048 kB
Hugetlb:               0 kB
DirectMap4k:      300000 kB
DirectMap2M:     8000000 kB
DirectMap4M:           0 kB
DirectMap1G:     8388608 kB
";

/// `/proc/<pid>/stat` for a sleeping bash-like process.
pub const PROC_PID_STAT: &str = "1234 (bash) S 1233 1234 1234 34816 1235 4194304 5000 50000 10 20 100 50 200 100 20 0 1 0 100000 25000000 2000 18446744073709551615 0 0 0 0 0 0 65536 3670020 1266777851 0 0 0 17 2 0 0 5 0 0 0 0 0 0 0 0 0 0\n";

/// `/proc/<pid>/statm` matching the stat fixture.
pub const PROC_PID_STATM: &str = "6250 2000 1200 300 0 1800 0\n";

/// `/proc/<pid>/io` matching the stat fixture.
pub const PROC_PID_IO: &str = "\
rchar: 1000000
wchar: 500000
syscr: 5000
syscw: 2500
read_bytes: 100000
write_bytes: 50000
cancelled_write_bytes: 1000
";
