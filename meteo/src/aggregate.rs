//! Windowed averaging and cumulative-delta computation.
//!
//! For a snapshot `[s0, s1, ..., sN-1]`:
//!
//! - every channel except the cumulative one reports the arithmetic mean of
//!   `s1..=sN-2` (the two edge samples are excluded);
//! - the cumulative channel reports `sN-1 - s0`, unclamped, so a counter
//!   reset shows up as a negative delta.
//!
//! A snapshot of two or fewer samples has no interior and produces no
//! record. Callers skip persistence and dispatch for that tick.

use std::fmt::Write as _;

use crate::channel::ChannelRegistry;
use crate::window::Snapshot;

/// Decimal places kept in reported means.
pub const DEFAULT_PRECISION: u32 = 2;

/// The summary of one reporting tick.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    /// Time of aggregation, seconds since the Unix epoch.
    pub timestamp: i64,
    /// One value per channel in channel order. The cumulative channel's
    /// slot holds the delta; every other slot holds a mean.
    pub values: Vec<f64>,
    /// Index of the cumulative channel in `values`.
    pub delta_index: usize,
}

impl AggregateRecord {
    /// Net change of the cumulative channel across the window.
    pub fn delta(&self) -> f64 {
        self.values.get(self.delta_index).copied().unwrap_or(0.0)
    }

    /// Mean of channel `index`, or `None` for the cumulative channel.
    pub fn mean(&self, index: usize) -> Option<f64> {
        if index == self.delta_index {
            None
        } else {
            self.values.get(index).copied()
        }
    }

    /// Formats the record as a CSV row: timestamp, then every column.
    pub fn to_csv_row(&self) -> String {
        let mut row = self.timestamp.to_string();
        for value in &self.values {
            let _ = write!(row, ",{value}");
        }
        row
    }
}

/// Turns window snapshots into [`AggregateRecord`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregator {
    width: usize,
    delta_index: usize,
    precision: Option<u32>,
}

impl Aggregator {
    /// Creates an aggregator for `width` channels with the cumulative
    /// channel at `delta_index`.
    pub fn new(width: usize, delta_index: usize) -> Self {
        Self {
            width,
            delta_index,
            precision: Some(DEFAULT_PRECISION),
        }
    }

    /// Creates an aggregator matching a registry's layout.
    pub fn for_registry(registry: &ChannelRegistry) -> Self {
        Self::new(registry.len(), registry.cumulative().index())
    }

    /// Rounds means to `precision` decimal places, or not at all for `None`.
    #[must_use]
    pub fn with_precision(mut self, precision: Option<u32>) -> Self {
        self.precision = precision;
        self
    }

    /// Aggregates `snapshot`, stamping the record with `timestamp`.
    ///
    /// Returns `None` when the snapshot has two or fewer samples.
    #[allow(clippy::cast_precision_loss)] // window sizes are far below 2^52
    pub fn aggregate(&self, snapshot: &Snapshot, timestamp: i64) -> Option<AggregateRecord> {
        let len = snapshot.len();
        if len <= 2 {
            return None;
        }
        let (first, last) = (snapshot.first()?, snapshot.last()?);

        let mut sums = vec![0.0; self.width];
        for sample in snapshot.iter().skip(1).take(len - 2) {
            for (channel, sum) in sums.iter_mut().enumerate() {
                *sum += sample.value(channel);
            }
        }

        let interior = (len - 2) as f64;
        let mut values: Vec<f64> = sums
            .into_iter()
            .map(|sum| self.round(sum / interior))
            .collect();

        if let Some(slot) = values.get_mut(self.delta_index) {
            *slot = last.value(self.delta_index) - first.value(self.delta_index);
        }

        Some(AggregateRecord {
            timestamp,
            values,
            delta_index: self.delta_index,
        })
    }

    #[allow(clippy::cast_possible_wrap)] // precision is a handful of digits
    fn round(&self, value: f64) -> f64 {
        match self.precision {
            Some(digits) => {
                let factor = 10f64.powi(digits as i32);
                (value * factor).round() / factor
            }
            None => value,
        }
    }
}
