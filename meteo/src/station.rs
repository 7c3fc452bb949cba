//! Station runtime: the sampling and reporting loops.
//!
//! A [`Station`] runs two periodic activities that share nothing but the
//! [`Window`]:
//!
//! - the sampling thread sweeps the registry once per sample period and
//!   appends the result;
//! - the reporting loop (on the caller's thread) snapshots the window once
//!   per report period, aggregates it, persists the row and dispatches it.
//!
//! Both loops are driven by a [`Ticker`], which drops ticks that were
//! missed while the previous one overran instead of queuing them. Both
//! check a shared [`StopHandle`] between ticks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::aggregate::{AggregateRecord, Aggregator};
use crate::dispatch::{Delivery, DispatchOutcome, Dispatcher};
use crate::error::{MeteoError, Result};
use crate::sampler::Sampler;
use crate::sink::{RecordSink, RotationKey};
use crate::transport::Transport;
use crate::window::Window;

/// Longest uninterrupted sleep while waiting for a tick.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Stops a running [`Station`] between ticks. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Creates a handle that has not been stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`StopHandle::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Fixed-period tick source that skips missed ticks.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
    skipped: u64,
}

impl Ticker {
    /// First tick one `period` from now.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            skipped: 0,
        }
    }

    /// First tick immediately.
    pub fn immediate(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now(),
            skipped: 0,
        }
    }

    /// Blocks until the next tick. Returns `false` if `stop` was triggered
    /// first.
    pub fn wait(&mut self, stop: &StopHandle) -> bool {
        loop {
            if stop.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= self.next {
                break;
            }
            thread::sleep((self.next - now).min(STOP_POLL));
        }

        let now = Instant::now();
        if self.period.is_zero() {
            self.next = now;
            return true;
        }

        self.next += self.period;
        let mut missed = 0;
        while self.next <= now {
            self.next += self.period;
            missed += 1;
        }
        if missed > 0 {
            self.skipped += missed;
            tracing::debug!(missed, "tick overran, skipping missed ticks");
        }

        true
    }

    /// Total ticks skipped because a previous tick overran.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// What one reporting tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportSummary {
    /// The aggregate, or `None` if the window was too small.
    pub record: Option<AggregateRecord>,
    /// Whether the row reached every local destination.
    pub persisted: bool,
    /// Dispatch result, or `None` if dispatch is disabled or could not run.
    pub dispatch: Option<DispatchOutcome>,
}

/// Snapshot, aggregate, persist, dispatch.
#[derive(Debug)]
pub struct Reporter<S, D> {
    aggregator: Aggregator,
    sink: S,
    dispatcher: Option<Dispatcher<D>>,
}

impl<S: RecordSink, D: Delivery> Reporter<S, D> {
    /// Creates a reporter. With no dispatcher, reports are only persisted.
    pub fn new(aggregator: Aggregator, sink: S, dispatcher: Option<Dispatcher<D>>) -> Self {
        Self {
            aggregator,
            sink,
            dispatcher,
        }
    }

    /// Reports the current window contents, stamped with the local time.
    pub fn report_once(&mut self, window: &Window) -> ReportSummary {
        let now = Local::now();
        self.report_at(
            window,
            now.timestamp(),
            &RotationKey::from_date(now.date_naive()),
        )
    }

    /// Reports the current window contents, stamped with `timestamp` and
    /// written under `rotation`.
    ///
    /// Persistence and dispatch fail independently: a failed write does not
    /// stop the dispatch and vice versa. Failures are logged.
    pub fn report_at(
        &mut self,
        window: &Window,
        timestamp: i64,
        rotation: &RotationKey,
    ) -> ReportSummary {
        let snapshot = window.snapshot();
        let Some(record) = self.aggregator.aggregate(&snapshot, timestamp) else {
            tracing::debug!(
                timestamp,
                samples = snapshot.len(),
                "window too small, report skipped"
            );
            return ReportSummary::default();
        };
        drop(snapshot);

        let persisted = match self.sink.append(&record.to_csv_row(), rotation) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(timestamp, %rotation, error = %e, "failed to persist report");
                false
            }
        };

        let dispatch = self
            .dispatcher
            .as_mut()
            .and_then(|d| match d.dispatch(&record) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!(timestamp, error = %e, "failed to dispatch report");
                    None
                }
            });

        ReportSummary {
            record: Some(record),
            persisted,
            dispatch,
        }
    }

    /// The record sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The dispatcher, if dispatch is enabled.
    pub fn dispatcher(&self) -> Option<&Dispatcher<D>> {
        self.dispatcher.as_ref()
    }
}

/// Counters from a finished [`Station::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Sweeps completed.
    pub sweeps: u64,
    /// Sampling ticks skipped because a sweep overran.
    pub skipped_sweeps: u64,
    /// Failed sensor requests.
    pub read_failures: u64,
    /// Reporting ticks run.
    pub reports: u64,
}

/// The sampler, the window and the reporter, wired together.
#[derive(Debug)]
pub struct Station<T, S, D> {
    window: Arc<Window>,
    sampler: Sampler<T>,
    reporter: Reporter<S, D>,
    sample_period: Duration,
    report_period: Duration,
    stop: StopHandle,
}

impl<T, S, D> Station<T, S, D>
where
    T: Transport + Send + 'static,
    S: RecordSink,
    D: Delivery,
{
    /// Creates a station with a zero-filled window of `capacity` samples.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::InvalidWindow`] if `capacity` is
    /// zero.
    pub fn new(
        sampler: Sampler<T>,
        reporter: Reporter<S, D>,
        capacity: usize,
        sample_period: Duration,
        report_period: Duration,
    ) -> Result<Self> {
        let window = Arc::new(Window::new(capacity, sampler.registry().len())?);
        if capacity < 3 {
            tracing::warn!(capacity, "window holds fewer than 3 samples, every report will be skipped");
        }

        Ok(Self {
            window,
            sampler,
            reporter,
            sample_period,
            report_period,
            stop: StopHandle::new(),
        })
    }

    /// A handle that stops [`Station::run`].
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The shared window.
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Runs both loops until stopped. The sampling loop runs on its own
    /// thread; the reporting loop runs on the caller's.
    ///
    /// # Errors
    ///
    /// Returns [`MeteoError::Spawn`] if the sampling thread cannot start.
    pub fn run(self) -> Result<RunStats> {
        let Self {
            window,
            mut sampler,
            mut reporter,
            sample_period,
            report_period,
            stop,
        } = self;

        tracing::info!(
            channels = sampler.registry().len(),
            capacity = window.capacity(),
            sample_period_ms = u64::try_from(sample_period.as_millis()).unwrap_or(u64::MAX),
            report_period_ms = u64::try_from(report_period.as_millis()).unwrap_or(u64::MAX),
            "station started"
        );

        let sampling = {
            let window = Arc::clone(&window);
            let stop = stop.clone();
            thread::Builder::new()
                .name("meteo-sampler".to_string())
                .spawn(move || {
                    let mut ticker = Ticker::immediate(sample_period);
                    let mut sweeps = 0u64;
                    while ticker.wait(&stop) {
                        window.append(sampler.sample_once());
                        sweeps += 1;
                    }
                    (sweeps, ticker.skipped(), sampler.failures())
                })
                .map_err(|e| MeteoError::Spawn {
                    name: "sampler",
                    source: e,
                })?
        };

        let mut stats = RunStats::default();
        let mut ticker = Ticker::new(report_period);
        while ticker.wait(&stop) {
            if sampling.is_finished() {
                tracing::error!("sampling thread exited unexpectedly, stopping station");
                stop.stop();
                break;
            }
            reporter.report_once(&window);
            stats.reports += 1;
        }

        match sampling.join() {
            Ok((sweeps, skipped, failures)) => {
                stats.sweeps = sweeps;
                stats.skipped_sweeps = skipped;
                stats.read_failures = failures;
            }
            Err(_) => tracing::error!("sampling thread panicked"),
        }

        tracing::info!(
            sweeps = stats.sweeps,
            reports = stats.reports,
            read_failures = stats.read_failures,
            "station stopped"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::window::Sample;

    struct NullSink;

    impl RecordSink for NullSink {
        fn append(&mut self, _row: &str, _rotation: &RotationKey) -> Result<()> {
            Ok(())
        }
    }

    struct Rows(Vec<String>);

    impl RecordSink for Rows {
        fn append(&mut self, row: &str, _rotation: &RotationKey) -> Result<()> {
            self.0.push(row.to_string());
            Ok(())
        }
    }

    struct Broken;

    impl RecordSink for Broken {
        fn append(&mut self, _row: &str, _rotation: &RotationKey) -> Result<()> {
            Err(crate::error::PersistError::Write {
                path: "latest_mean.csv".into(),
                source: std::io::Error::other("disk full"),
            }
            .into())
        }
    }

    struct Accept(u32);

    impl Delivery for Accept {
        fn deliver(&mut self, _body: &[u8], _timeout: Duration) -> std::result::Result<u16, DispatchError> {
            self.0 += 1;
            Ok(200)
        }
    }

    fn key() -> RotationKey {
        RotationKey::from_date(chrono::NaiveDate::from_ymd_opt(2024, 3, 7).unwrap())
    }

    fn dispatcher() -> Dispatcher<Accept> {
        Dispatcher::new(
            crate::dispatch::StationIdentity::new("s", "k"),
            vec!["a".to_string(), "b".to_string()],
            Accept(0),
            crate::dispatch::RetryPolicy::default(),
        )
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let stop = StopHandle::new();
        let clone = stop.clone();
        assert!(!clone.is_stopped());

        stop.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_ticker_returns_false_when_stopped() {
        let stop = StopHandle::new();
        stop.stop();

        let mut ticker = Ticker::immediate(Duration::from_secs(60));
        assert!(!ticker.wait(&stop));
    }

    #[test]
    fn test_ticker_skips_missed_ticks() {
        let stop = StopHandle::new();
        let mut ticker = Ticker::immediate(Duration::from_millis(50));

        assert!(ticker.wait(&stop));
        thread::sleep(Duration::from_millis(300));
        let before = Instant::now();
        assert!(ticker.wait(&stop));

        // the backlog is dropped: the next tick is in the future
        assert!(ticker.skipped() >= 4);
        assert!(ticker.next > before);
    }

    #[test]
    fn test_report_persists_and_dispatches() {
        let window = Window::new(4, 2).unwrap();
        for (ts, rain) in [(1, 0.5), (2, 1.0), (3, 1.5), (4, 2.0)] {
            window.append(Sample::new(ts, vec![10.0, rain]));
        }
        let mut reporter = Reporter::new(Aggregator::new(2, 1), Rows(Vec::new()), Some(dispatcher()));

        let summary = reporter.report_at(&window, 99, &key());

        assert!(summary.persisted);
        assert_eq!(
            summary.dispatch,
            Some(DispatchOutcome::Delivered { attempts: 1 })
        );
        assert_eq!(reporter.sink().0, ["99,10,1.5"]);
        assert_eq!(reporter.dispatcher().unwrap().delivery().0, 1);
    }

    #[test]
    fn test_small_window_skips_everything() {
        let window = Window::new(2, 2).unwrap();
        let mut reporter = Reporter::new(Aggregator::new(2, 1), Rows(Vec::new()), Some(dispatcher()));

        let summary = reporter.report_at(&window, 99, &key());

        assert_eq!(summary, ReportSummary::default());
        assert!(reporter.sink().0.is_empty());
        assert_eq!(reporter.dispatcher().unwrap().delivery().0, 0);
    }

    #[test]
    fn test_persist_failure_does_not_block_dispatch() {
        let window = Window::new(3, 2).unwrap();
        let mut reporter = Reporter::new(Aggregator::new(2, 1), Broken, Some(dispatcher()));

        let summary = reporter.report_at(&window, 99, &key());

        assert!(!summary.persisted);
        assert_eq!(
            summary.dispatch,
            Some(DispatchOutcome::Delivered { attempts: 1 })
        );
    }

    #[test]
    fn test_dispatch_disabled() {
        let window = Window::new(3, 2).unwrap();
        let mut reporter: Reporter<_, Accept> = Reporter::new(Aggregator::new(2, 1), NullSink, None);

        let summary = reporter.report_at(&window, 99, &key());

        assert!(summary.persisted);
        assert!(summary.record.is_some());
        assert!(summary.dispatch.is_none());
    }
}
