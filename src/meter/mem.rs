//! Memory meter: named probes over `/proc/meminfo`, parsed with the
//! memoized key/value parser.
//!
//! Keys follow `Documentation/filesystems/proc.rst`. Each probe is one
//! sub-record; the caller picks a subset and the resulting key lists are
//! handed to [`KvRepr`] in caller order at construction.

use crate::error::Result;
use crate::fsx::FileSystem;
use crate::kvrepr::{kv_record, KvDescriptor, KvFields, KvRepr};
use crate::meter::{Fill, MeterUnit, Sampler};
use crate::record::Sample;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

const MEMINFO_LINE_FORMAT: &str = "%64[^:]: %32s";

kv_record! {
    /// Headline memory figures.
    pub struct MemBasic {
        mem_total: u64 => "MemTotal",
        mem_free: u64 => "MemFree",
        mem_available: u64 => "MemAvailable",
    }
}

kv_record! {
    pub struct MemKernelCache {
        buffers: u64 => "Buffers",
        cached: u64 => "Cached",
        swap_cached: u64 => "SwapCached",
    }
}

kv_record! {
    pub struct MemActiveInactive {
        active: u64 => "Active",
        inactive: u64 => "Inactive",
        active_anon: u64 => "Active(anon)",
        inactive_anon: u64 => "Inactive(anon)",
        active_file: u64 => "Active(file)",
        inactive_file: u64 => "Inactive(file)",
    }
}

kv_record! {
    pub struct MemNonEvictable {
        unevictable: u64 => "Unevictable",
        mlocked: u64 => "Mlocked",
    }
}

kv_record! {
    pub struct MemSwap {
        swap_total: u64 => "SwapTotal",
        swap_free: u64 => "SwapFree",
        zswap: u64 => "Zswap",
        zswapped: u64 => "Zswapped",
    }
}

kv_record! {
    pub struct MemDirtyWriteback {
        dirty: u64 => "Dirty",
        writeback: u64 => "Writeback",
    }
}

kv_record! {
    pub struct MemType {
        anon_pages: u64 => "AnonPages",
        mapped: u64 => "Mapped",
        shmem: u64 => "Shmem",
    }
}

kv_record! {
    pub struct MemKernel {
        k_reclaimable: u64 => "KReclaimable",
        slab: u64 => "Slab",
        s_reclaimable: u64 => "SReclaimable",
        s_unreclaim: u64 => "SUnreclaim",
        kernel_stack: u64 => "KernelStack",
        page_tables: u64 => "PageTables",
    }
}

kv_record! {
    pub struct MemTmpBuffer {
        nfs_unstable: u64 => "NFS_Unstable",
        bounce: u64 => "Bounce",
        writeback_tmp: u64 => "WritebackTmp",
    }
}

kv_record! {
    pub struct MemVirtual {
        commit_limit: u64 => "CommitLimit",
        committed_as: u64 => "Committed_AS",
        vmalloc_total: u64 => "VmallocTotal",
        vmalloc_used: u64 => "VmallocUsed",
        vmalloc_chunk: u64 => "VmallocChunk",
    }
}

kv_record! {
    pub struct MemHugePage {
        anon_huge_pages: u64 => "AnonHugePages",
        shmem_huge_pages: u64 => "ShmemHugePages",
        shmem_pmd_mapped: u64 => "ShmemPmdMapped",
        file_huge_pages: u64 => "FileHugePages",
        file_pmd_mapped: u64 => "FilePmdMapped",
        huge_pages_total: u64 => "HugePages_Total",
        huge_pages_free: u64 => "HugePages_Free",
        huge_pages_rsvd: u64 => "HugePages_Rsvd",
        huge_pages_surp: u64 => "HugePages_Surp",
        hugepagesize: u64 => "Hugepagesize",
        hugetlb: u64 => "Hugetlb",
    }
}

kv_record! {
    pub struct MemDirectMap {
        direct_map_4k: u64 => "DirectMap4k",
        direct_map_2m: u64 => "DirectMap2M",
        direct_map_4m: u64 => "DirectMap4M",
        direct_map_1g: u64 => "DirectMap1G",
    }
}

kv_record! {
    pub struct MemMisc {
        percpu: u64 => "Percpu",
        hardware_corrupted: u64 => "HardwareCorrupted",
    }
}

/// Named subsets of `/proc/meminfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MemProbe {
    Basic,
    KernelCache,
    ActiveInactive,
    NonEvictable,
    Swap,
    DirtyWriteback,
    Type,
    Kernel,
    TmpBuffer,
    Virtual,
    HugePage,
    DirectMap,
    Misc,
}

impl MemProbe {
    fn descriptor(self) -> KvDescriptor {
        match self {
            MemProbe::Basic => MemBasic::descriptor(),
            MemProbe::KernelCache => MemKernelCache::descriptor(),
            MemProbe::ActiveInactive => MemActiveInactive::descriptor(),
            MemProbe::NonEvictable => MemNonEvictable::descriptor(),
            MemProbe::Swap => MemSwap::descriptor(),
            MemProbe::DirtyWriteback => MemDirtyWriteback::descriptor(),
            MemProbe::Type => MemType::descriptor(),
            MemProbe::Kernel => MemKernel::descriptor(),
            MemProbe::TmpBuffer => MemTmpBuffer::descriptor(),
            MemProbe::Virtual => MemVirtual::descriptor(),
            MemProbe::HugePage => MemHugePage::descriptor(),
            MemProbe::DirectMap => MemDirectMap::descriptor(),
            MemProbe::Misc => MemMisc::descriptor(),
        }
    }

    fn keys(self) -> &'static [&'static str] {
        match self {
            MemProbe::Basic => MemBasic::KEYS,
            MemProbe::KernelCache => MemKernelCache::KEYS,
            MemProbe::ActiveInactive => MemActiveInactive::KEYS,
            MemProbe::NonEvictable => MemNonEvictable::KEYS,
            MemProbe::Swap => MemSwap::KEYS,
            MemProbe::DirtyWriteback => MemDirtyWriteback::KEYS,
            MemProbe::Type => MemType::KEYS,
            MemProbe::Kernel => MemKernel::KEYS,
            MemProbe::TmpBuffer => MemTmpBuffer::KEYS,
            MemProbe::Virtual => MemVirtual::KEYS,
            MemProbe::HugePage => MemHugePage::KEYS,
            MemProbe::DirectMap => MemDirectMap::KEYS,
            MemProbe::Misc => MemMisc::KEYS,
        }
    }

    fn empty_record(self) -> ProbeRecord {
        match self {
            MemProbe::Basic => ProbeRecord::Basic(MemBasic::default()),
            MemProbe::KernelCache => ProbeRecord::KernelCache(MemKernelCache::default()),
            MemProbe::ActiveInactive => {
                ProbeRecord::ActiveInactive(MemActiveInactive::default())
            }
            MemProbe::NonEvictable => ProbeRecord::NonEvictable(MemNonEvictable::default()),
            MemProbe::Swap => ProbeRecord::Swap(MemSwap::default()),
            MemProbe::DirtyWriteback => {
                ProbeRecord::DirtyWriteback(MemDirtyWriteback::default())
            }
            MemProbe::Type => ProbeRecord::Type(MemType::default()),
            MemProbe::Kernel => ProbeRecord::Kernel(MemKernel::default()),
            MemProbe::TmpBuffer => ProbeRecord::TmpBuffer(MemTmpBuffer::default()),
            MemProbe::Virtual => ProbeRecord::Virtual(MemVirtual::default()),
            MemProbe::HugePage => ProbeRecord::HugePage(MemHugePage::default()),
            MemProbe::DirectMap => ProbeRecord::DirectMap(MemDirectMap::default()),
            MemProbe::Misc => ProbeRecord::Misc(MemMisc::default()),
        }
    }
}

/// One filled probe; the sample keeps them in caller order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ProbeRecord {
    Basic(MemBasic),
    KernelCache(MemKernelCache),
    ActiveInactive(MemActiveInactive),
    NonEvictable(MemNonEvictable),
    Swap(MemSwap),
    DirtyWriteback(MemDirtyWriteback),
    Type(MemType),
    Kernel(MemKernel),
    TmpBuffer(MemTmpBuffer),
    Virtual(MemVirtual),
    HugePage(MemHugePage),
    DirectMap(MemDirectMap),
    Misc(MemMisc),
}

impl KvFields for ProbeRecord {
    fn set_field(&mut self, idx: usize, value: crate::kvrepr::FieldValue) {
        match self {
            ProbeRecord::Basic(r) => r.set_field(idx, value),
            ProbeRecord::KernelCache(r) => r.set_field(idx, value),
            ProbeRecord::ActiveInactive(r) => r.set_field(idx, value),
            ProbeRecord::NonEvictable(r) => r.set_field(idx, value),
            ProbeRecord::Swap(r) => r.set_field(idx, value),
            ProbeRecord::DirtyWriteback(r) => r.set_field(idx, value),
            ProbeRecord::Type(r) => r.set_field(idx, value),
            ProbeRecord::Kernel(r) => r.set_field(idx, value),
            ProbeRecord::TmpBuffer(r) => r.set_field(idx, value),
            ProbeRecord::Virtual(r) => r.set_field(idx, value),
            ProbeRecord::HugePage(r) => r.set_field(idx, value),
            ProbeRecord::DirectMap(r) => r.set_field(idx, value),
            ProbeRecord::Misc(r) => r.set_field(idx, value),
        }
    }
}

/// One memory sample: the selected probes, filled.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemSample {
    pub probes: Vec<ProbeRecord>,
}

impl Sample for MemSample {
    fn heap_size(&self) -> usize {
        self.probes.capacity() * std::mem::size_of::<ProbeRecord>()
    }
}

/// Sampler binding the selected probes to `<proc>/meminfo`.
pub struct MemSampler<F: FileSystem> {
    probes: Vec<MemProbe>,
    /// `None` when construction failed; the meter is invalid in that case.
    repr: Option<KvRepr<F>>,
}

impl<F: FileSystem> Sampler for MemSampler<F> {
    type Record = MemSample;

    fn name(&self) -> &str {
        "mem"
    }

    fn fill(&mut self, _testrun: bool, record: &mut MemSample) -> Result<Fill> {
        let repr = self.repr.as_ref().ok_or_else(|| {
            crate::error::Error::InvalidConfig("meminfo parser was never built".into())
        })?;
        record.probes = self.probes.iter().map(|p| p.empty_record()).collect();
        let mut targets: Vec<&mut dyn KvFields> = record
            .probes
            .iter_mut()
            .map(|r| r as &mut dyn KvFields)
            .collect();
        repr.parse_once(&mut targets)?;
        Ok(Fill::Recorded)
    }

    fn detailed_report(&self) -> Option<String> {
        let mut report = String::from("Enabled probe(s):");
        if self.probes.is_empty() {
            report.push_str("\n  N/A");
        }
        for probe in &self.probes {
            report.push_str(&format!("\n  - {:?}", probe));
        }
        report.push('\n');
        match &self.repr {
            Some(repr) => report.push_str(&repr.status_report()),
            None => report.push_str("meminfo parser not initialized"),
        }
        Some(report)
    }
}

/// Builds a memory meter for the selected probes. The meter is invalid
/// when the key/value parser cannot be constructed; keys missing from the
/// running kernel's meminfo are tolerated.
pub fn mem_meter<F: FileSystem + 'static>(
    fs: F,
    proc_path: impl Into<PathBuf>,
    tick_period: Duration,
    probes: Vec<MemProbe>,
) -> MeterUnit<MemSampler<F>> {
    let descriptors = probes.iter().map(|p| p.descriptor()).collect();
    let key_lists = probes
        .iter()
        .map(|p| p.keys().iter().map(|k| k.to_string()).collect())
        .collect();
    let meminfo = proc_path.into().join("meminfo");

    let repr = match KvRepr::new(fs, meminfo, descriptors, key_lists, MEMINFO_LINE_FORMAT) {
        Ok(repr) => Some(repr),
        Err(e) => {
            error!(error = %e, "failed to build meminfo parser");
            None
        }
    };
    let valid = repr.is_some();
    MeterUnit::new(MemSampler { probes, repr }, tick_period, valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::Meter;
    use crate::mock::MockFs;

    fn meter_for(probes: Vec<MemProbe>) -> MeterUnit<MemSampler<MockFs>> {
        mem_meter(
            MockFs::typical_system(),
            "/proc",
            Duration::from_millis(500),
            probes,
        )
    }

    #[test]
    fn basic_probe_fills_headline_figures() {
        let mut meter = meter_for(vec![MemProbe::Basic]);
        meter.update(false).unwrap();
        assert!(meter.current_message_wire_size() > 0);
    }

    #[test]
    fn probe_values_match_fixture() {
        let mut sampler_meter = meter_for(vec![MemProbe::Basic, MemProbe::Swap]);
        sampler_meter.update(false).unwrap();

        // Pull the sample back out through serialization.
        let dir = tempfile::tempdir().unwrap();
        sampler_meter.assign_output_dir(dir.path()).unwrap();
        sampler_meter.write_data_to_file(true).unwrap();

        let bytes = std::fs::read(sampler_meter.output_path().unwrap()).unwrap();
        let series: crate::record::TimeSeries<MemSample> =
            bincode::deserialize(&bytes[crate::meter::WRITE_HEADER_WIDTH..]).unwrap();
        assert_eq!(series.len(), 1);

        let sample = &series.samples[0];
        assert_eq!(sample.probes.len(), 2);
        match &sample.probes[0] {
            ProbeRecord::Basic(b) => {
                assert_eq!(b.mem_total, 16384000);
                assert_eq!(b.mem_free, 8192000);
                assert_eq!(b.mem_available, 12000000);
            }
            other => panic!("expected Basic probe first, got {:?}", other),
        }
        match &sample.probes[1] {
            ProbeRecord::Swap(s) => {
                assert_eq!(s.swap_total, 4096000);
                assert_eq!(s.swap_free, 4096000);
            }
            other => panic!("expected Swap probe second, got {:?}", other),
        }
    }

    #[test]
    fn all_probes_build_against_full_meminfo() {
        let probes = vec![
            MemProbe::Basic,
            MemProbe::KernelCache,
            MemProbe::ActiveInactive,
            MemProbe::NonEvictable,
            MemProbe::Swap,
            MemProbe::DirtyWriteback,
            MemProbe::Type,
            MemProbe::Kernel,
            MemProbe::TmpBuffer,
            MemProbe::Virtual,
            MemProbe::HugePage,
            MemProbe::DirectMap,
            MemProbe::Misc,
        ];
        let mut meter = meter_for(probes);
        assert!(meter.is_valid());
        meter.update(false).unwrap();
        let report = meter.detailed_report().unwrap();
        assert!(report.contains("Basic"));
        assert!(report.contains("0 missing"));
    }

    #[test]
    fn unreadable_meminfo_invalidates_meter() {
        let meter = mem_meter(
            MockFs::new(),
            "/proc",
            Duration::from_millis(500),
            vec![MemProbe::Basic],
        );
        assert!(!meter.is_valid());
    }

    #[test]
    fn missing_key_leaves_field_at_default() {
        let mut fs = MockFs::new();
        // MemFree deliberately absent.
        fs.add_file(
            "/proc/meminfo",
            "MemTotal:       16384000 kB\nMemAvailable:   12000000 kB\n",
        );
        let meter = mem_meter(fs, "/proc", Duration::from_millis(500), vec![MemProbe::Basic]);
        assert!(meter.is_valid());

        let mut sampler_meter = meter;
        let dir = tempfile::tempdir().unwrap();
        sampler_meter.assign_output_dir(dir.path()).unwrap();
        sampler_meter.update(false).unwrap();
        sampler_meter.write_data_to_file(true).unwrap();

        let bytes = std::fs::read(sampler_meter.output_path().unwrap()).unwrap();
        let series: crate::record::TimeSeries<MemSample> =
            bincode::deserialize(&bytes[crate::meter::WRITE_HEADER_WIDTH..]).unwrap();
        match &series.samples[0].probes[0] {
            ProbeRecord::Basic(b) => {
                assert_eq!(b.mem_total, 16384000);
                assert_eq!(b.mem_available, 12000000);
                assert_eq!(b.mem_free, 0); // untouched
            }
            other => panic!("unexpected probe {:?}", other),
        }
    }
}
