//! hostmeter - periodic Linux host telemetry recorder.
//!
//! A [`System`](system::System) owns a set of meters sampled together on a
//! shared wall-clock cadence. Every tick, a coordinator thread releases
//! one worker per meter through a barrier; each worker appends exactly one
//! record to its meter's active buffer. When a buffer crosses the write
//! threshold it is swapped against the shadow buffer and drained to the
//! meter's file by a detached writer, so sampling never blocks on disk.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ System (Idle ⇆ Recording)                                      │
//! │   ┌───────────────── WorkerPool ─────────────────┐             │
//! │   │ coordinator ──barrier──► worker 0..N         │             │
//! │   └───────┬──────────────────────┬───────────────┘             │
//! │           │ write trigger        │ update()                    │
//! │   ┌───────▼──────────────────────▼───────────────┐             │
//! │   │ Meter: active / shadow TimeSeries + fd       │──► file     │
//! │   └───────┬──────────────────────────────────────┘             │
//! │           │ KvRepr / line parsers                              │
//! │   ┌───────▼──────┐                                             │
//! │   │  FileSystem  │──► /proc/{stat,diskstats,meminfo,<pid>/*}   │
//! │   └──────────────┘                                             │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use hostmeter::fsx::RealFs;
//! use hostmeter::meter::cpu::cpu_meter;
//!
//! hostmeter::registry::initialize("");
//! let id = hostmeter::registry::create_system_with_defaults(
//!     "/tmp/telemetry",
//!     Duration::from_millis(500),
//! )
//! .unwrap();
//!
//! let system = hostmeter::registry::system(id).unwrap();
//! system.add_meter(cpu_meter(RealFs::new(), "/proc", Duration::from_millis(500)));
//!
//! assert!(system.test_run());
//! system.start_recording().unwrap();
//! std::thread::sleep(Duration::from_secs(5));
//! system.stop_recording();
//! ```
//!
//! Every meter file is a concatenation of write-units: a host-endian
//! `usize` payload size followed by the bincode-serialized time series.

pub mod error;
pub mod fsx;
pub mod kvrepr;
pub mod logger;
pub mod meter;
pub mod mock;
pub mod record;
pub mod registry;
pub mod system;
pub mod termination;
pub mod util;
pub mod worker;

pub use error::{Error, Result};
pub use record::{Sample, TimeSeries};
pub use system::{System, SystemId, DEFAULT_MSG_WRITE_SIZE_THRESHOLD, INVALID_SYSTEM_ID};
