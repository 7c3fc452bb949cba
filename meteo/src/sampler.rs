//! Sampler: one sweep of the channel registry per sampling tick.
//!
//! A sweep issues every request in registry order, decodes the replies and
//! produces one [`Sample`]. A failed request never aborts the sweep: each
//! channel it serves gets the fill value and the sweep continues.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::ChannelRegistry;
use crate::transport::Transport;
use crate::window::Sample;

/// Substituted for a channel whose read failed.
pub const FILL_VALUE: f64 = 0.0;

/// Bus timing for a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepTiming {
    /// Maximum wait for each reply.
    pub request_timeout: Duration,
    /// Pause between consecutive requests (bus turnaround).
    pub turnaround: Duration,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(100),
            turnaround: Duration::from_millis(10),
        }
    }
}

/// Reads every channel through a transport.
#[derive(Debug)]
pub struct Sampler<T> {
    registry: Arc<ChannelRegistry>,
    transport: T,
    timing: SweepTiming,
    failures: u64,
}

impl<T: Transport> Sampler<T> {
    /// Creates a sampler over `transport`.
    pub fn new(registry: Arc<ChannelRegistry>, transport: T, timing: SweepTiming) -> Self {
        Self {
            registry,
            transport,
            timing,
            failures: 0,
        }
    }

    /// Sweeps all channels, stamping the sample with the current time.
    pub fn sample_once(&mut self) -> Sample {
        self.sample_at(chrono::Utc::now().timestamp())
    }

    /// Sweeps all channels, stamping the sample with `timestamp`.
    pub fn sample_at(&mut self, timestamp: i64) -> Sample {
        let started = Instant::now();
        let mut values = vec![FILL_VALUE; self.registry.len()];

        for (i, request) in self.registry.requests().iter().enumerate() {
            if i > 0 && !self.timing.turnaround.is_zero() {
                thread::sleep(self.timing.turnaround);
            }

            match self.transport.request(
                request.descriptor(),
                request.reply_len(),
                self.timing.request_timeout,
            ) {
                Ok(reply) => {
                    for &index in request.channels() {
                        let channel = &self.registry.channels()[index];
                        values[index] = channel.decode(&reply);
                        tracing::trace!(
                            channel = channel.name(),
                            value = values[index],
                            "channel read"
                        );
                    }
                }
                Err(e) => {
                    self.failures += 1;
                    for &index in request.channels() {
                        tracing::warn!(
                            channel = self.registry.channels()[index].name(),
                            timestamp,
                            error = %e,
                            "channel read failed, using fill value"
                        );
                    }
                }
            }
        }

        tracing::debug!(
            timestamp,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "sweep complete"
        );

        Sample::new(timestamp, values)
    }

    /// The registry being swept.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Total failed requests since creation.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}
