//! CLI for the meteo weather-station collector.
//!
//! Runs the sampling/reporting daemon and provides commands for probing the
//! sensor, listing channels and writing a starter config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use meteo::dispatch::HttpDelivery;
use meteo::transport::SerialTransport;
use meteo::{
    Aggregator, ChannelRegistry, CsvStore, Dispatcher, Reporter, Sampler, Station, StationConfig,
    StopHandle,
};
use tracing_subscriber::{EnvFilter, fmt};

/// meteo: fixed-interval environmental telemetry collector.
#[derive(Parser)]
#[command(name = "meteo", version, about)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start sampling, storing and pushing reports until interrupted.
    Run {
        #[command(flatten)]
        station: StationArgs,
    },

    /// Sweep every channel once and print the reading.
    Sample {
        #[command(flatten)]
        station: StationArgs,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// List the channels of a registry.
    Channels {
        /// Registry file (JSON). Defaults to the built-in SN3003 registry.
        #[arg(long)]
        registry: Option<PathBuf>,
    },

    /// Write a config file from the given settings.
    Init {
        /// Where to write the config.
        path: PathBuf,

        #[command(flatten)]
        station: StationArgs,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Station settings. Flags and environment variables override the config
/// file, which overrides the built-in defaults.
#[derive(Args, Debug, Clone, Default)]
struct StationArgs {
    /// Config file (JSON).
    #[arg(short, long, env = "METEO_CONFIG")]
    config: Option<PathBuf>,

    /// Station name sent with every report.
    #[arg(long, env = "STATION_NAME")]
    station_name: Option<String>,

    /// Shared key sent with every report.
    #[arg(long, env = "STATION_KEY", hide_env_values = true)]
    station_key: Option<String>,

    /// Collector URL. Leave empty to store reports locally only.
    #[arg(long, env = "SERVER")]
    server: Option<String>,

    /// Samples per report (window capacity).
    #[arg(long, env = "RECORD_FREQUENCY")]
    record_frequency: Option<usize>,

    /// Rows kept in latest_mean.csv.
    #[arg(long, env = "STORAGE_SIZE")]
    storage_size: Option<usize>,

    /// Storage root for the CSV files.
    #[arg(long, env = "DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Serial device of the sensor bus.
    #[arg(long, env = "SERIAL_PORT")]
    serial_port: Option<String>,

    /// Serial line speed.
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Channel registry file (JSON).
    #[arg(long)]
    registry: Option<PathBuf>,
}

impl StationArgs {
    /// Loads the config file (or defaults) and applies the overrides.
    fn resolve(&self) -> meteo::Result<StationConfig> {
        let mut config = match &self.config {
            Some(path) => StationConfig::load(path)?,
            None => StationConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut StationConfig) {
        if let Some(name) = &self.station_name {
            config.station_name.clone_from(name);
        }
        if let Some(key) = &self.station_key {
            config.station_key.clone_from(key);
        }
        if let Some(server) = &self.server {
            config.server = Some(server.clone());
        }
        if let Some(frequency) = self.record_frequency {
            config.record_frequency = frequency;
        }
        if let Some(size) = self.storage_size {
            config.storage_size = Some(size);
        }
        if let Some(path) = &self.data_path {
            config.data_path.clone_from(path);
        }
        if let Some(port) = &self.serial_port {
            config.serial.port.clone_from(port);
        }
        if let Some(baud) = self.baud_rate {
            config.serial.baud_rate = baud;
        }
        if let Some(registry) = &self.registry {
            config.registry = Some(registry.clone());
        }
    }
}

/// Output format for a single sweep.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Header row plus one comma-separated row.
    Csv,
    /// JSON object with the timestamp and a value per channel.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run { station } => cmd_run(&station),
        Commands::Sample { station, format } => cmd_sample(&station, &format),
        Commands::Channels { registry } => cmd_channels(registry.as_deref()),
        Commands::Init {
            path,
            station,
            force,
        } => cmd_init(&path, &station, force),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "meteo failed");
        std::process::exit(1);
    }
}

/// Installs the fmt subscriber. `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("meteo=debug")
        } else {
            EnvFilter::new("meteo=info")
        }
    });

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Stops the station on Ctrl+C.
fn ctrlc_handler(stop: StopHandle) {
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received Ctrl+C, shutting down");
        stop.stop();
    }) {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
    }
}

/// Implements `meteo run`.
fn cmd_run(args: &StationArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.resolve()?;
    config.validate()?;

    let registry = Arc::new(config.load_registry()?);
    let transport = SerialTransport::open(&config.serial)?;
    let sampler = Sampler::new(Arc::clone(&registry), transport, config.sweep_timing());

    let sink = CsvStore::new(&config.data_path, registry.names()).with_retention(config.storage_size);

    let dispatcher = match config.endpoint() {
        Some(url) => Some(Dispatcher::for_registry(
            config.identity(),
            &registry,
            HttpDelivery::new(url)?,
            config.retry_policy(),
        )),
        None => {
            tracing::warn!("no server configured, reports are only stored locally");
            None
        }
    };

    let reporter = Reporter::new(Aggregator::for_registry(&registry), sink, dispatcher);
    let station = Station::new(
        sampler,
        reporter,
        config.record_frequency,
        config.sample_period,
        config.report_period(),
    )?;

    tracing::info!(
        station = %config.station_name,
        port = %config.serial.port,
        data_path = %config.data_path.display(),
        server = config.endpoint().unwrap_or("-"),
        "starting station"
    );

    ctrlc_handler(station.stop_handle());
    station.run()?;

    Ok(())
}

/// Implements `meteo sample`.
fn cmd_sample(args: &StationArgs, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.resolve()?;
    let registry = Arc::new(config.load_registry()?);
    let transport = SerialTransport::open(&config.serial)?;
    let mut sampler = Sampler::new(Arc::clone(&registry), transport, config.sweep_timing());

    let sample = sampler.sample_once();
    if sampler.failures() > 0 {
        tracing::warn!(
            failures = sampler.failures(),
            "some channels did not answer and read as 0"
        );
    }

    match format {
        OutputFormat::Csv => {
            let header: Vec<&str> = std::iter::once(meteo::channel::TIME_COLUMN).chain(registry.names()).collect();
            println!("{}", header.join(","));

            let mut row = sample.timestamp.to_string();
            for value in &sample.values {
                row.push(',');
                row.push_str(&value.to_string());
            }
            println!("{row}");
        }
        OutputFormat::Json => {
            let values: serde_json::Map<String, serde_json::Value> = registry
                .names()
                .zip(&sample.values)
                .map(|(name, value)| (name.to_string(), serde_json::Value::from(*value)))
                .collect();
            let output = serde_json::json!({
                "timestamp": sample.timestamp,
                "values": values,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `meteo channels`.
fn cmd_channels(registry: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let registry = match registry {
        Some(path) => ChannelRegistry::from_path(path)?,
        None => ChannelRegistry::sn3003(),
    };

    println!(
        "{:<14} {:>8} {:>5} {:>5} {:>8} {:>6}",
        "CHANNEL", "REGISTER", "WORDS", "WORD", "DIVISOR", "SIGNED"
    );
    for channel in registry.channels() {
        let frame = registry.request_for(channel).frame();
        let rule = channel.rule();
        let marker = if channel.index() == registry.cumulative().index() {
            "  (delta)"
        } else {
            ""
        };
        println!(
            "{:<14} {:>#8x} {:>5} {:>5} {:>8} {:>6}{marker}",
            channel.name(),
            frame.register,
            frame.count,
            channel.word(),
            rule.divisor,
            rule.signed,
        );
    }

    Ok(())
}

/// Implements `meteo init`.
fn cmd_init(path: &Path, args: &StationArgs, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(format!(
            "'{}' already exists; use --force to overwrite",
            path.display()
        )
        .into());
    }

    let config = args.resolve()?;
    if let Err(e) = config.validate() {
        tracing::warn!(error = %e, "config written but not yet valid");
    }
    config.save(path)?;

    println!("Wrote {}", path.display());
    Ok(())
}
