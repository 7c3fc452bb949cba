//! Error types for the meteo telemetry pipeline.
//!
//! Only [`ConfigError`] is fatal, and it can only happen at startup. The
//! other error types are recovered inside the pipeline: a failed channel
//! read becomes a fill value, a failed write is logged, and a failed push
//! uses up one retry attempt.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all meteo operations.
#[derive(Error, Debug)]
pub enum MeteoError {
    /// Error building or querying the channel registry.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Error exchanging a request/reply with the sensor.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error writing records to local storage.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Error delivering a record to the remote collector.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Invalid or missing station configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A pipeline thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Name of the thread that failed to start.
        name: &'static str,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while building or querying the channel registry.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No channel with this name is registered.
    #[error("unknown channel '{name}'")]
    UnknownChannel {
        /// The requested channel name.
        name: String,
    },

    /// Two fields share the same channel name.
    #[error("channel '{name}' is defined more than once")]
    DuplicateChannel {
        /// The duplicated channel name.
        name: String,
    },

    /// A channel name collides with a fixed column of the report.
    #[error("channel name '{name}' is reserved for the report payload")]
    ReservedName {
        /// The rejected name.
        name: String,
    },

    /// The registry defines no requests or no fields.
    #[error("registry must define at least one channel")]
    NoChannels,

    /// A field reads a word outside the reply payload.
    #[error("channel '{name}' reads word {word} but its request only returns {count} words")]
    FieldOutOfRange {
        /// The channel name.
        name: String,
        /// The requested word offset.
        word: u16,
        /// The number of words the request returns.
        count: u16,
    },

    /// A request or decode rule is malformed.
    #[error("invalid request for channel '{name}': {reason}")]
    InvalidRequest {
        /// The first channel served by the request.
        name: String,
        /// Why the request is invalid.
        reason: String,
    },

    /// The configured cumulative-delta channel is not registered.
    #[error("cumulative channel '{name}' is not defined in the registry")]
    UnknownCumulativeChannel {
        /// The configured name.
        name: String,
    },

    /// Failed to read a registry file.
    #[error("failed to read channel registry '{}': {source}", path.display())]
    RegistryLoad {
        /// The registry file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a registry file.
    #[error("failed to parse channel registry '{}': {source}", path.display())]
    RegistryParse {
        /// The registry file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors reported by a transport for a single request/reply exchange.
///
/// The sampler never propagates these. It logs them and substitutes the
/// fill value for every channel served by the failed request.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The serial device could not be opened or configured.
    #[cfg(feature = "serial")]
    #[error("failed to open serial port '{port}': {source}")]
    Open {
        /// The device path.
        port: String,
        /// The underlying serialport error.
        #[source]
        source: serialport::Error,
    },

    /// Writing the request or reading the reply failed.
    #[error("bus I/O failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fewer bytes than expected arrived before the timeout.
    #[error("short reply: expected {expected} bytes, received {received}")]
    ShortReply {
        /// Expected reply length.
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },

    /// The reply checksum does not match its contents.
    #[error("reply checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch {
        /// Checksum computed over the reply body.
        computed: u16,
        /// Checksum carried in the reply trailer.
        received: u16,
    },

    /// The reply is well-formed but does not answer the request.
    #[error("unexpected reply: {reason}")]
    UnexpectedReply {
        /// Description of the mismatch.
        reason: String,
    },
}

/// Errors that can occur while writing records to local storage.
#[derive(Error, Debug)]
pub enum PersistError {
    /// A storage directory could not be created.
    #[error("failed to create directory '{}': {source}", path.display())]
    CreateDir {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record file could not be opened.
    #[error("failed to open '{}': {source}", path.display())]
    Open {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Appending to a record file failed.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Dropping old rows from the latest file failed.
    #[error("failed to trim '{}': {source}", path.display())]
    Trim {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while delivering a record to the remote endpoint.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Failed to serialize the wire payload.
    #[error("failed to serialize payload: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to create the HTTP client.
    #[cfg(feature = "http")]
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP request failed before a status was received.
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {source}")]
    Request {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint could not be reached.
    #[error("endpoint unreachable: {reason}")]
    Unreachable {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors in the station configuration. These are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The station name is missing or blank.
    #[error("station name is empty; set station_name or STATION_NAME")]
    MissingStationName,

    /// The station key is missing or blank.
    #[error("station key is empty; set station_key or STATION_KEY")]
    MissingStationKey,

    /// The window capacity is zero.
    #[error("invalid window capacity {capacity} (must be > 0)")]
    InvalidWindow {
        /// The rejected capacity.
        capacity: usize,
    },

    /// A numeric setting is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The setting name.
        field: &'static str,
        /// Why the value is rejected.
        reason: String,
    },

    /// Failed to read a config file.
    #[error("failed to read config '{}': {source}", path.display())]
    Load {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a config file.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize a config.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write a config file.
    #[error("failed to write config '{}': {source}", path.display())]
    Save {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, MeteoError>`.
pub type Result<T> = std::result::Result<T, MeteoError>;
