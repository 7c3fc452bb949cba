//! Integration tests for the full acquisition pipeline.
//!
//! A simulated SN3003 sensor answers every register read with fixed values,
//! except the rain counter, which climbs by 0.5 mm per sweep. The tests run
//! the sampler, window, aggregator, CSV store and dispatcher together.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meteo::dispatch::{RetryPolicy, StationIdentity};
use meteo::error::{DispatchError, TransportError};
use meteo::frame::FrameSpec;
use meteo::sink::LATEST_FILE;
use meteo::{
    Aggregator, ChannelRegistry, CsvStore, Delivery, DispatchOutcome, Dispatcher, Reporter,
    RotationKey, Sampler, Station, SweepTiming, Transport, Window,
};
use tempfile::tempdir;

const HEADER: &str = "time,temperature,humidity,wind_speed,wind_angle,noise,pm2dot5,pm10,pressure,rain";

/// Answers register reads like a healthy SN3003 with a rising rain counter.
struct SimulatedSensor {
    rain_raw: u16,
    dead_registers: Vec<u16>,
}

impl SimulatedSensor {
    fn new() -> Self {
        Self {
            rain_raw: 0,
            dead_registers: Vec::new(),
        }
    }

    fn words(&mut self, register: u16) -> Option<Vec<u16>> {
        let words = match register {
            0x01F8 => vec![655, 231],
            0x01F4 => vec![250],
            0x01F7 => vec![270],
            0x01FA => vec![455],
            0x01FB => vec![12],
            0x01FC => vec![20],
            0x01FD => vec![1013],
            0x0101 => {
                let raw = self.rain_raw;
                self.rain_raw += 5;
                vec![raw]
            }
            _ => return None,
        };
        Some(words)
    }
}

impl Transport for SimulatedSensor {
    fn request(
        &mut self,
        descriptor: &[u8],
        reply_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let register = u16::from_be_bytes([descriptor[2], descriptor[3]]);
        let count = u16::from_be_bytes([descriptor[4], descriptor[5]]);

        let words = if self.dead_registers.contains(&register) {
            None
        } else {
            self.words(register)
        };
        let Some(words) = words else {
            return Err(TransportError::ShortReply {
                expected: reply_len,
                received: 0,
            });
        };

        Ok(FrameSpec::read(descriptor[0], register, count).reply(&words))
    }
}

/// Accepts everything and keeps the bodies.
#[derive(Default)]
struct Capture {
    bodies: Vec<Vec<u8>>,
}

impl Delivery for Capture {
    fn deliver(&mut self, body: &[u8], _timeout: Duration) -> Result<u16, DispatchError> {
        self.bodies.push(body.to_vec());
        Ok(200)
    }
}

fn timing() -> SweepTiming {
    SweepTiming {
        request_timeout: Duration::from_millis(100),
        turnaround: Duration::ZERO,
    }
}

fn rotation() -> RotationKey {
    RotationKey::from_date(chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
}

fn reporter(
    registry: &ChannelRegistry,
    root: &std::path::Path,
) -> Reporter<CsvStore, Capture> {
    let dispatcher = Dispatcher::for_registry(
        StationIdentity::new("roof", "secret"),
        registry,
        Capture::default(),
        RetryPolicy::default(),
    );
    Reporter::new(
        Aggregator::for_registry(registry),
        CsvStore::new(root, registry.names()).with_retention(Some(2880)),
        Some(dispatcher),
    )
}

#[test]
fn test_thirty_ticks_end_to_end() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(ChannelRegistry::sn3003());
    let window = Window::new(30, registry.len()).unwrap();
    let mut sampler = Sampler::new(Arc::clone(&registry), SimulatedSensor::new(), timing());
    let base = 1_700_000_000;

    for tick in 0..30 {
        window.append(sampler.sample_at(base + tick));
    }

    let snapshot = window.snapshot();
    assert_eq!(snapshot.len(), 30);
    assert_eq!(snapshot.first().unwrap().timestamp, base);
    assert_eq!(snapshot.last().unwrap().timestamp, base + 29);
    assert_eq!(sampler.failures(), 0);

    let mut reporter = reporter(&registry, temp_dir.path());
    let summary = reporter.report_at(&window, base + 30, &rotation());
    let record = summary.record.unwrap();

    // constant channels average to their constant
    assert_eq!(record.mean(0), Some(23.1));
    assert_eq!(record.mean(1), Some(65.5));
    assert_eq!(record.mean(2), Some(2.5));
    assert_eq!(record.mean(7), Some(1013.0));
    // 29 steps of 0.5 mm between the first and last sample
    assert_eq!(record.delta(), 14.5);

    assert!(summary.persisted);
    assert_eq!(
        summary.dispatch,
        Some(DispatchOutcome::Delivered { attempts: 1 })
    );

    let expected = format!(
        "{HEADER}\n{},23.1,65.5,2.5,270,45.5,12,20,1013,14.5\n",
        base + 30
    );
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("2024/06/01.csv")).unwrap(),
        expected
    );
    assert_eq!(
        fs::read_to_string(temp_dir.path().join(LATEST_FILE)).unwrap(),
        expected
    );

    let bodies = &reporter.dispatcher().unwrap().delivery().bodies;
    assert_eq!(bodies.len(), 1);
    let json: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(json["id"], "roof");
    assert_eq!(json["key"], "secret");
    // the payload is stamped at dispatch, the data row at aggregation
    assert!(json["timestamp"].as_i64().unwrap() >= base + 30);
    assert_eq!(json["data"]["time"].as_f64(), Some((base + 30) as f64));
    assert_eq!(json["data"]["temperature"], 23.1);
    assert_eq!(json["data"]["rain"], 14.5);
    assert_eq!(json["data"]["hold3"], 0.0);
}

#[test]
fn test_dead_channel_averages_fill_value() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(ChannelRegistry::sn3003());
    let window = Window::new(10, registry.len()).unwrap();
    let mut sensor = SimulatedSensor::new();
    sensor.dead_registers.push(0x01FA);
    let mut sampler = Sampler::new(Arc::clone(&registry), sensor, timing());

    for tick in 0..10 {
        window.append(sampler.sample_at(tick));
    }

    let mut reporter = reporter(&registry, temp_dir.path());
    let record = reporter.report_at(&window, 10, &rotation()).record.unwrap();

    let noise = registry.lookup("noise").unwrap().index();
    assert_eq!(record.mean(noise), Some(0.0));
    assert_eq!(record.mean(0), Some(23.1));
    assert_eq!(sampler.failures(), 10);
}

#[test]
fn test_warm_up_reports_zero_filled_window() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(ChannelRegistry::sn3003());
    let window = Window::new(30, registry.len()).unwrap();
    let mut sampler = Sampler::new(Arc::clone(&registry), SimulatedSensor::new(), timing());

    // only one real sample so far; the other 29 slots are still zero
    window.append(sampler.sample_at(1));

    let mut reporter = reporter(&registry, temp_dir.path());
    let record = reporter.report_at(&window, 2, &rotation()).record.unwrap();

    assert_eq!(window.snapshot().len(), 30);
    // the only real sample is the last one, which is excluded from means
    assert_eq!(record.mean(0), Some(0.0));
}

#[test]
fn test_station_runs_until_stopped() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(ChannelRegistry::sn3003());
    let sampler = Sampler::new(Arc::clone(&registry), SimulatedSensor::new(), timing());

    let station = Station::new(
        sampler,
        reporter(&registry, temp_dir.path()),
        5,
        Duration::from_millis(5),
        Duration::from_millis(50),
    )
    .unwrap();
    let stop = station.stop_handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stop.stop();
    });
    let stats = station.run().unwrap();
    stopper.join().unwrap();

    assert!(stats.reports >= 1);
    assert!(stats.sweeps >= 5);
    assert_eq!(stats.read_failures, 0);

    let latest = fs::read_to_string(temp_dir.path().join(LATEST_FILE)).unwrap();
    let mut lines = latest.lines();
    assert_eq!(lines.next(), Some(HEADER));
    assert!(lines.count() >= 1);
}
