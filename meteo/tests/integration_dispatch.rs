//! Integration tests for report dispatch.
//!
//! A scripted delivery stands in for the collector. The tests check attempt
//! counts, the rate-limit cooldown and the shrinking per-attempt timeout.

use std::time::{Duration, Instant};

use meteo::dispatch::{Response, RetryPolicy, StationIdentity};
use meteo::error::DispatchError;
use meteo::{AggregateRecord, ChannelRegistry, Delivery, DispatchOutcome, Dispatcher};

/// Replies from a script (`None` is a network error) and records timeouts.
struct Collector {
    script: Vec<Option<u16>>,
    timeouts: Vec<Duration>,
}

impl Collector {
    fn new(script: Vec<Option<u16>>) -> Self {
        Self {
            script,
            timeouts: Vec::new(),
        }
    }
}

impl Delivery for Collector {
    fn deliver(&mut self, _body: &[u8], timeout: Duration) -> Result<u16, DispatchError> {
        let step = self.script.get(self.timeouts.len()).copied().flatten();
        self.timeouts.push(timeout);
        step.ok_or_else(|| DispatchError::Unreachable {
            reason: "connection refused".to_string(),
        })
    }
}

fn record() -> AggregateRecord {
    AggregateRecord {
        timestamp: 1_700_000_000,
        values: vec![23.1, 65.5, 2.5, 270.0, 45.5, 12.0, 20.0, 1013.0, 0.4],
        delta_index: 8,
    }
}

fn dispatcher(script: Vec<Option<u16>>, policy: RetryPolicy) -> Dispatcher<Collector> {
    Dispatcher::for_registry(
        StationIdentity::new("roof", "secret"),
        &ChannelRegistry::sn3003(),
        Collector::new(script),
        policy,
    )
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        cooldown: Duration::ZERO,
        budget: Duration::from_secs(9),
    }
}

#[test]
fn test_two_failures_then_delivered() {
    let mut d = dispatcher(vec![None, Some(503), Some(201)], fast_policy());

    let outcome = d.dispatch(&record()).unwrap();

    assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 3 });
    assert_eq!(d.delivery().timeouts.len(), 3);
}

#[test]
fn test_always_failing_makes_exactly_three_attempts() {
    let mut d = dispatcher(vec![Some(500); 10], fast_policy());

    assert_eq!(
        d.dispatch(&record()).unwrap(),
        DispatchOutcome::Failed { attempts: 3 }
    );
    assert_eq!(d.delivery().timeouts.len(), 3);

    // a second report starts a fresh set of attempts
    assert_eq!(
        d.dispatch(&record()).unwrap(),
        DispatchOutcome::Failed { attempts: 3 }
    );
    assert_eq!(d.delivery().timeouts.len(), 6);
}

#[test]
fn test_rate_limited_waits_cooldown_then_stops() {
    let policy = RetryPolicy {
        cooldown: Duration::from_millis(30),
        ..fast_policy()
    };
    let mut d = dispatcher(vec![Some(202)], policy);

    let started = Instant::now();
    let outcome = d.dispatch(&record()).unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Deferred {
            retry_after: Duration::from_millis(30)
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(d.delivery().timeouts.len(), 1);
}

#[test]
fn test_attempt_timeouts_stay_within_budget() {
    let mut d = dispatcher(vec![None, None, None], fast_policy());

    d.dispatch(&record()).unwrap();

    let timeouts = &d.delivery().timeouts;
    assert_eq!(timeouts.len(), 3);
    assert!(timeouts.iter().all(|t| *t <= Duration::from_secs(9)));
    assert!(timeouts.windows(2).all(|w| w[1] <= w[0]));
}

#[test]
fn test_policy_drives_same_decisions_without_network() {
    let policy = fast_policy();
    let script = [
        Response::Unreachable,
        Response::from_status(404),
        Response::from_status(200),
    ];

    let mut state = policy.start();
    for response in script {
        if let meteo::dispatch::DispatchState::Attempting(n) = state {
            state = policy.next(n, response);
        }
    }

    assert_eq!(
        state,
        meteo::dispatch::DispatchState::Done(DispatchOutcome::Delivered { attempts: 3 })
    );
}
