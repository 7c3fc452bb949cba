//! Delivery of aggregate records to the remote collector.
//!
//! A record is serialized once per reporting tick into a JSON payload
//! carrying the station identity, and then handed to a [`Delivery`] up to
//! [`RetryPolicy::max_attempts`] times. The retry decisions live in
//! [`RetryPolicy::next`], a small state machine that knows nothing about
//! the network:
//!
//! ```text
//! Attempting(n) --accepted-----> Done(Delivered)
//! Attempting(n) --rate limited--> Done(Deferred)
//! Attempting(n) --other--------> Attempting(n + 1)   while n < max
//!                              \-> Done(Failed)         once n == max
//! ```
//!
//! There is no outbox: a record whose dispatch fails is only kept in local
//! storage.
//!
//! The HTTP implementation is only available when the `http` feature is
//! enabled.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::aggregate::AggregateRecord;
use crate::channel::{ChannelRegistry, TIME_COLUMN};
use crate::error::{DispatchError, Result};

/// Always-zero payload slots kept for compatibility with the collector.
pub const RESERVED_SLOTS: [&str; 3] = ["hold1", "hold2", "hold3"];

/// Who is reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationIdentity {
    /// Station name, sent as the payload `id`.
    pub name: String,
    /// Shared secret, sent as the payload `key`.
    pub key: String,
}

impl StationIdentity {
    /// Creates an identity.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

/// Wire payload for one aggregate record.
#[derive(Debug, Serialize)]
struct Payload<'a> {
    id: &'a str,
    timestamp: i64,
    key: &'a str,
    data: BTreeMap<&'a str, f64>,
}

/// Serializes `record` for the collector, stamped with `timestamp`.
///
/// `names` gives the channel name of each record column. The `data` map
/// also carries the record's own timestamp under `time` and the reserved
/// slots as zero.
///
/// # Errors
///
/// Returns [`DispatchError::Serialize`] if JSON encoding fails.
pub fn encode_payload(
    identity: &StationIdentity,
    names: &[String],
    record: &AggregateRecord,
    timestamp: i64,
) -> std::result::Result<Vec<u8>, DispatchError> {
    let mut data: BTreeMap<&str, f64> = names
        .iter()
        .map(String::as_str)
        .zip(record.values.iter().copied())
        .collect();
    data.insert(TIME_COLUMN, record.timestamp as f64);
    for slot in RESERVED_SLOTS {
        data.insert(slot, 0.0);
    }

    let payload = Payload {
        id: &identity.name,
        timestamp,
        key: &identity.key,
        data,
    };

    serde_json::to_vec(&payload).map_err(|e| DispatchError::Serialize { source: e })
}

/// Sends an encoded payload somewhere and reports the status it got back.
pub trait Delivery {
    /// Delivers `body`, giving up after `timeout`. Returns the HTTP-style
    /// status code of the response.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if no status was received.
    fn deliver(&mut self, body: &[u8], timeout: Duration) -> std::result::Result<u16, DispatchError>;
}

impl<D: Delivery + ?Sized> Delivery for &mut D {
    fn deliver(&mut self, body: &[u8], timeout: Duration) -> std::result::Result<u16, DispatchError> {
        (**self).deliver(body, timeout)
    }
}

impl<D: Delivery + ?Sized> Delivery for Box<D> {
    fn deliver(&mut self, body: &[u8], timeout: Duration) -> std::result::Result<u16, DispatchError> {
        (**self).deliver(body, timeout)
    }
}

/// Final result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The collector accepted the record.
    Delivered {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// The collector accepted the record but asked the station to back off.
    Deferred {
        /// How long the dispatcher waited before returning.
        retry_after: Duration,
    },
    /// Every attempt failed (or the budget ran out).
    Failed {
        /// Attempts made.
        attempts: u32,
    },
}

impl DispatchOutcome {
    /// Returns `true` unless the outcome is [`DispatchOutcome::Failed`].
    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Classification of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// 200 or 201.
    Accepted,
    /// 202: accepted, rate limited.
    RateLimited,
    /// Any other status.
    Rejected(u16),
    /// No status received.
    Unreachable,
}

impl Response {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200 | 201 => Self::Accepted,
            202 => Self::RateLimited,
            other => Self::Rejected(other),
        }
    }
}

/// Where a dispatch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// About to make attempt `n` (1-based).
    Attempting(u32),
    /// No more attempts will be made.
    Done(DispatchOutcome),
}

/// Retry ceiling, rate-limit cooldown and overall time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum delivery attempts per record.
    pub max_attempts: u32,
    /// Sleep after a rate-limited response.
    pub cooldown: Duration,
    /// Total time allowed across all attempts.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(5),
            budget: Duration::from_secs(9),
        }
    }
}

impl RetryPolicy {
    /// The initial state.
    pub fn start(&self) -> DispatchState {
        if self.max_attempts == 0 {
            DispatchState::Done(DispatchOutcome::Failed { attempts: 0 })
        } else {
            DispatchState::Attempting(1)
        }
    }

    /// The state after attempt `attempt` got `response`.
    pub fn next(&self, attempt: u32, response: Response) -> DispatchState {
        match response {
            Response::Accepted => DispatchState::Done(DispatchOutcome::Delivered { attempts: attempt }),
            Response::RateLimited => DispatchState::Done(DispatchOutcome::Deferred {
                retry_after: self.cooldown,
            }),
            Response::Rejected(_) | Response::Unreachable => {
                if attempt >= self.max_attempts {
                    DispatchState::Done(DispatchOutcome::Failed { attempts: attempt })
                } else {
                    DispatchState::Attempting(attempt + 1)
                }
            }
        }
    }
}

/// Serializes records and drives a [`Delivery`] through the retry policy.
#[derive(Debug)]
pub struct Dispatcher<D> {
    identity: StationIdentity,
    names: Vec<String>,
    delivery: D,
    policy: RetryPolicy,
}

impl<D: Delivery> Dispatcher<D> {
    /// Creates a dispatcher. `names` gives the channel name of each record
    /// column.
    pub fn new(identity: StationIdentity, names: Vec<String>, delivery: D, policy: RetryPolicy) -> Self {
        Self {
            identity,
            names,
            delivery,
            policy,
        }
    }

    /// Creates a dispatcher whose column names come from `registry`.
    pub fn for_registry(
        identity: StationIdentity,
        registry: &ChannelRegistry,
        delivery: D,
        policy: RetryPolicy,
    ) -> Self {
        let names = registry.names().map(str::to_owned).collect();
        Self::new(identity, names, delivery, policy)
    }

    /// Dispatches `record`, stamping the payload with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Serialize`] if the payload cannot be built.
    /// Delivery failures are reported as [`DispatchOutcome::Failed`].
    pub fn dispatch(&mut self, record: &AggregateRecord) -> Result<DispatchOutcome> {
        self.dispatch_at(record, chrono::Utc::now().timestamp())
    }

    /// Dispatches `record`, stamping the payload with `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Serialize`] if the payload cannot be built.
    pub fn dispatch_at(&mut self, record: &AggregateRecord, timestamp: i64) -> Result<DispatchOutcome> {
        let body = encode_payload(&self.identity, &self.names, record, timestamp)?;
        let started = Instant::now();
        let mut state = self.policy.start();

        loop {
            match state {
                DispatchState::Attempting(attempt) => {
                    let remaining = self.policy.budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        tracing::warn!(timestamp, attempt, "dispatch budget exhausted");
                        state = DispatchState::Done(DispatchOutcome::Failed {
                            attempts: attempt - 1,
                        });
                        continue;
                    }

                    let response = match self.delivery.deliver(&body, remaining) {
                        Ok(status) => Response::from_status(status),
                        Err(e) => {
                            tracing::warn!(timestamp, attempt, error = %e, "dispatch attempt failed");
                            Response::Unreachable
                        }
                    };
                    if let Response::Rejected(status) = response {
                        tracing::warn!(timestamp, attempt, status, "dispatch attempt rejected");
                    }

                    state = self.policy.next(attempt, response);
                }
                DispatchState::Done(outcome) => {
                    match outcome {
                        DispatchOutcome::Delivered { attempts } => {
                            tracing::info!(timestamp, attempts, "report delivered");
                        }
                        DispatchOutcome::Deferred { retry_after } => {
                            tracing::info!(
                                timestamp,
                                cooldown_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                                "report accepted, collector asked to back off"
                            );
                            thread::sleep(retry_after);
                        }
                        DispatchOutcome::Failed { attempts } => {
                            tracing::warn!(timestamp, attempts, "report not delivered");
                        }
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    /// The underlying delivery.
    pub fn delivery(&self) -> &D {
        &self.delivery
    }
}

#[cfg(feature = "http")]
pub use http::HttpDelivery;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use super::Delivery;
    use crate::error::DispatchError;

    /// Delivery over HTTP POST with a blocking reqwest client.
    #[derive(Debug)]
    pub struct HttpDelivery {
        client: reqwest::blocking::Client,
        endpoint: String,
    }

    impl HttpDelivery {
        /// Creates a delivery posting to `endpoint`.
        ///
        /// # Errors
        ///
        /// Returns [`DispatchError::ClientCreate`] if the client cannot be
        /// built.
        pub fn new(endpoint: impl Into<String>) -> Result<Self, DispatchError> {
            let client = reqwest::blocking::Client::builder()
                .build()
                .map_err(|e| DispatchError::ClientCreate { source: e })?;

            Ok(Self {
                client,
                endpoint: endpoint.into(),
            })
        }
    }

    impl Delivery for HttpDelivery {
        fn deliver(&mut self, body: &[u8], timeout: Duration) -> Result<u16, DispatchError> {
            let response = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .timeout(timeout)
                .body(body.to_vec())
                .send()
                .map_err(|e| DispatchError::Request { source: e })?;

            Ok(response.status().as_u16())
        }
    }
}
