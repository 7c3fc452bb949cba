//! Rolling window of the most recent samples.
//!
//! The window is the only state shared between the sampling and reporting
//! threads. It holds exactly `capacity` samples at all times: it starts
//! zero-filled, and each append evicts the oldest entry.
//!
//! # Synchronization
//!
//! A single mutex guards a `VecDeque<Arc<Sample>>`. The critical sections
//! are constant-size: `append` does one `pop_front` and one `push_back`,
//! `snapshot` clones `capacity` reference counts. Samples are built before
//! the lock is taken and dropped after it is released, and no I/O happens
//! under the lock. Samples are immutable once inserted, so a snapshot can
//! share them with the window without copying values.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ConfigError, Result};

/// One sweep of every channel, taken at `timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// One value per channel, in channel order.
    pub values: Vec<f64>,
}

impl Sample {
    /// Creates a sample.
    pub fn new(timestamp: i64, values: Vec<f64>) -> Self {
        Self { timestamp, values }
    }

    /// A sample with timestamp 0 and `width` zero values.
    pub fn zeroed(width: usize) -> Self {
        Self {
            timestamp: 0,
            values: vec![0.0; width],
        }
    }

    /// Value of channel `index`, or `0.0` if the sample is narrower.
    #[inline]
    pub fn value(&self, index: usize) -> f64 {
        self.values.get(index).copied().unwrap_or(0.0)
    }
}

/// A consistent copy of the window contents, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    samples: Vec<Arc<Sample>>,
}

impl Snapshot {
    /// Builds a snapshot from owned samples, oldest first.
    pub fn from_samples(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            samples: samples.into_iter().map(Arc::new).collect(),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if the snapshot holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `index` (0 is the oldest).
    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index).map(|s| &**s)
    }

    /// The oldest sample.
    pub fn first(&self) -> Option<&Sample> {
        self.samples.first().map(|s| &**s)
    }

    /// The newest sample.
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last().map(|s| &**s)
    }

    /// Iterates samples oldest first.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Sample> + DoubleEndedIterator {
        self.samples.iter().map(|s| &**s)
    }
}

/// Fixed-capacity, time-ordered sample buffer, safe to share across threads.
#[derive(Debug)]
pub struct Window {
    capacity: usize,
    samples: Mutex<VecDeque<Arc<Sample>>>,
}

impl Window {
    /// Creates a window of `capacity` zero-filled samples, each `width`
    /// channels wide.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindow`] if `capacity` is zero.
    pub fn new(capacity: usize, width: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ConfigError::InvalidWindow { capacity }.into());
        }

        let zero = Arc::new(Sample::zeroed(width));
        let samples = std::iter::repeat_n(zero, capacity).collect();

        Ok(Self {
            capacity,
            samples: Mutex::new(samples),
        })
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `sample` as the newest entry, evicting the oldest.
    pub fn append(&self, sample: Sample) {
        let sample = Arc::new(sample);
        let evicted = {
            let mut samples = self.lock();
            let evicted = if samples.len() >= self.capacity {
                samples.pop_front()
            } else {
                None
            };
            samples.push_back(sample);
            evicted
        };
        drop(evicted);
    }

    /// Returns the current contents, oldest first.
    pub fn snapshot(&self) -> Snapshot {
        let samples = self.lock().iter().cloned().collect();
        Snapshot { samples }
    }

    /// Timestamp of the newest sample (0 while still zero-filled).
    pub fn newest_timestamp(&self) -> i64 {
        self.lock().back().map_or(0, |s| s.timestamp)
    }

    /// Locks the buffer. A panic elsewhere cannot leave the deque
    /// half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Sample>>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
