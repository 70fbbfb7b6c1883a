//! Record and time-series model.
//!
//! Each meter produces one record type per tick; the engine only ever
//! manipulates the [`TimeSeries`] wrapper around it. Wire sizes are exact
//! bincode sizes; memory sizes are a best-effort estimate used for status
//! reporting.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;

/// A single sample appended to a meter's time series.
pub trait Sample: Default + Serialize + DeserializeOwned + Send + 'static {
    /// Approximate heap footprint beyond `size_of::<Self>()`, in bytes.
    /// Types carrying vectors or strings should account for them.
    fn heap_size(&self) -> usize {
        0
    }
}

/// The repeated-record wrapper persisted by a meter: its sole field is the
/// ordered list of samples accumulated since the last write.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TimeSeries<T> {
    pub samples: Vec<T>,
}

impl<T: Sample> TimeSeries<T> {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Appends one sample.
    pub fn push(&mut self, sample: T) {
        self.samples.push(sample);
    }

    /// Drops all samples, keeping the allocation.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Exact serialized size in bytes; 0 when empty.
    pub fn wire_size(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        bincode::serialized_size(self).unwrap_or(0)
    }

    /// Approximate in-memory footprint in bytes; 0 when empty.
    pub fn mem_size(&self) -> usize {
        if self.samples.is_empty() {
            return 0;
        }
        std::mem::size_of::<Self>()
            + self.samples.capacity() * std::mem::size_of::<T>()
            + self.samples.iter().map(Sample::heap_size).sum::<usize>()
    }

    /// Serializes the series to `writer` as one bincode payload.
    pub fn write_to<W: Write>(&self, writer: W) -> std::io::Result<()> {
        bincode::serialize_into(writer, self).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Tick {
        timestamp_ns: u64,
        values: Vec<u64>,
    }

    impl Sample for Tick {
        fn heap_size(&self) -> usize {
            self.values.capacity() * std::mem::size_of::<u64>()
        }
    }

    #[test]
    fn empty_series_reports_zero_sizes() {
        let series = TimeSeries::<Tick>::new();
        assert_eq!(series.wire_size(), 0);
        assert_eq!(series.mem_size(), 0);
        assert!(series.is_empty());
    }

    #[test]
    fn wire_size_matches_serialized_bytes() {
        let mut series = TimeSeries::new();
        series.push(Tick {
            timestamp_ns: 42,
            values: vec![1, 2, 3],
        });
        let bytes = bincode::serialize(&series).unwrap();
        assert_eq!(series.wire_size(), bytes.len() as u64);
    }

    #[test]
    fn write_to_round_trips() {
        let mut series = TimeSeries::new();
        series.push(Tick {
            timestamp_ns: 1,
            values: vec![10],
        });
        series.push(Tick {
            timestamp_ns: 2,
            values: vec![20],
        });

        let mut buf = Vec::new();
        series.write_to(&mut buf).unwrap();

        let loaded: TimeSeries<Tick> = bincode::deserialize(&buf).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.samples, series.samples);
    }

    #[test]
    fn clear_resets_length_not_allocation() {
        let mut series = TimeSeries::new();
        for i in 0..8 {
            series.push(Tick {
                timestamp_ns: i,
                values: Vec::new(),
            });
        }
        let cap = series.samples.capacity();
        series.clear();
        assert!(series.is_empty());
        assert_eq!(series.samples.capacity(), cap);
    }
}
