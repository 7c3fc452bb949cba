//! # meteo
//!
//! Fixed-interval environmental telemetry collector.
//!
//! meteo polls a multi-channel sensor over a register-addressed serial
//! protocol, keeps a rolling window of recent readings, and once per
//! reporting period writes a time-averaged summary to local CSV files and
//! pushes it to a remote collector with bounded retry.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One failed channel never aborts a sweep; it reads as `0.0`
//! - The window is the only shared state, guarded by a lock that is never
//!   held across I/O
//! - Sampling and reporting tick independently; overrun ticks are dropped,
//!   never queued
//! - Local storage and remote dispatch fail independently and never stop
//!   the pipeline
//!
//! ## Quick Start
//!
//! ```rust
//! use meteo::{Aggregator, ChannelRegistry, Sample, Window};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ChannelRegistry::sn3003();
//! let window = Window::new(30, registry.len())?;
//!
//! // The sampler appends one sweep per tick
//! for ts in 0..30 {
//!     window.append(Sample::new(ts, vec![21.5; registry.len()]));
//! }
//!
//! // The reporter aggregates a snapshot once per period
//! let record = Aggregator::for_registry(&registry)
//!     .aggregate(&window.snapshot(), 1_700_000_000)
//!     .expect("window holds more than two samples");
//! assert_eq!(record.mean(0), Some(21.5));
//! assert_eq!(record.delta(), 0.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`ChannelRegistry`]: channel name to request frame and decode rule
//! - [`Sampler`]: one sweep of the registry through a [`Transport`]
//! - [`Window`]: fixed-capacity sample buffer shared by both loops
//! - [`Aggregator`]: windowed means plus the cumulative-channel delta
//! - [`CsvStore`]: daily and latest CSV files
//! - [`Dispatcher`]: JSON payload delivery with a retry state machine
//! - [`Station`]: both loops wired together
//!
//! ## Features
//!
//! - `serial`: [`transport::SerialTransport`] over the `serialport` crate
//! - `http`: [`dispatch::HttpDelivery`] over a blocking `reqwest` client

pub mod aggregate;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod sampler;
pub mod sink;
pub mod station;
pub mod transport;
pub mod window;

// Re-export primary API types at crate root for convenience.
pub use aggregate::{AggregateRecord, Aggregator};
pub use channel::{ChannelRegistry, ChannelSpec, RegistryConfig};
pub use config::StationConfig;
pub use dispatch::{Delivery, DispatchOutcome, Dispatcher, RetryPolicy, StationIdentity};
pub use error::{MeteoError, Result};
pub use sampler::{Sampler, SweepTiming};
pub use sink::{CsvStore, RecordSink, RotationKey};
pub use station::{Reporter, ReportSummary, Station, StopHandle};
pub use transport::Transport;
pub use window::{Sample, Snapshot, Window};
