//! Channel registry: which requests to send and how to decode their replies.
//!
//! The registry is data, not code. Each [`RequestSpec`] names a register
//! read and the [`FieldSpec`]s decoded from its reply; a request may serve
//! more than one channel (the combined humidity/temperature read does). The
//! flattened field order across all requests is the channel order used by
//! samples, aggregates, the CSV columns and the wire payload.
//!
//! Adding a channel means adding an entry to the registry file; no control
//! flow changes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatch::RESERVED_SLOTS;
use crate::error::{ChannelError, Result};
use crate::frame::{self, FrameSpec};

/// Column holding the timestamp in stored rows and report payloads.
pub const TIME_COLUMN: &str = "time";

/// Fixed-point decoding rule for one register word.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decode {
    /// The raw register value is divided by this.
    #[serde(default = "unit_divisor")]
    pub divisor: f64,
    /// Interpret the word as two's complement.
    #[serde(default)]
    pub signed: bool,
}

fn unit_divisor() -> f64 {
    1.0
}

impl Decode {
    /// Raw unsigned value, no scaling.
    pub const RAW: Self = Self {
        divisor: 1.0,
        signed: false,
    };

    /// Unsigned value divided by `divisor`.
    pub const fn scaled(divisor: f64) -> Self {
        Self {
            divisor,
            signed: false,
        }
    }

    /// Signed value divided by `divisor`.
    pub const fn signed(divisor: f64) -> Self {
        Self {
            divisor,
            signed: true,
        }
    }

    /// Applies the rule to a raw register word.
    #[allow(clippy::cast_possible_wrap)] // reinterpretation is the point
    pub fn apply(&self, raw: u16) -> f64 {
        let value = if self.signed {
            f64::from(raw as i16)
        } else {
            f64::from(raw)
        };
        value / self.divisor
    }
}

impl Default for Decode {
    fn default() -> Self {
        Self::RAW
    }
}

/// One channel decoded from a request's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Unique channel name (e.g. `"wind_speed"`).
    pub name: String,
    /// Word offset within the reply payload.
    #[serde(default)]
    pub word: u16,
    /// Decoding rule for the word.
    #[serde(default)]
    pub decode: Decode,
}

impl FieldSpec {
    /// Creates a field reading `word` with the given rule.
    pub fn new(name: impl Into<String>, word: u16, decode: Decode) -> Self {
        Self {
            name: name.into(),
            word,
            decode,
        }
    }
}

/// A register read and the channels decoded from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// The register read to issue.
    pub frame: FrameSpec,
    /// Channels decoded from the reply, in channel order.
    pub fields: Vec<FieldSpec>,
}

/// On-disk registry definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Requests in sweep order.
    pub requests: Vec<RequestSpec>,
    /// Name of the channel reported as a net change instead of a mean.
    pub cumulative: String,
}

impl RegistryConfig {
    /// The SN-3003 multi-element weather sensor at bus address 1.
    ///
    /// Humidity and temperature come from one combined read and lead the
    /// channel order; rainfall is the cumulative channel.
    pub fn sn3003() -> Self {
        let single = |register: u16, name: &str, decode: Decode| RequestSpec {
            frame: FrameSpec::read(1, register, 1),
            fields: vec![FieldSpec::new(name, 0, decode)],
        };

        Self {
            requests: vec![
                RequestSpec {
                    frame: FrameSpec::read(1, 0x01F8, 2),
                    fields: vec![
                        FieldSpec::new("temperature", 1, Decode::signed(10.0)),
                        FieldSpec::new("humidity", 0, Decode::scaled(10.0)),
                    ],
                },
                single(0x01F4, "wind_speed", Decode::scaled(100.0)),
                single(0x01F7, "wind_angle", Decode::RAW),
                single(0x01FA, "noise", Decode::scaled(10.0)),
                single(0x01FB, "pm2dot5", Decode::RAW),
                single(0x01FC, "pm10", Decode::RAW),
                single(0x01FD, "pressure", Decode::RAW),
                single(0x0101, "rain", Decode::scaled(10.0)),
            ],
            cumulative: "rain".to_string(),
        }
    }

    /// Checks the definition for duplicate or reserved names, empty requests
    /// and bad offsets.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut total = 0usize;

        for request in &self.requests {
            let first = request
                .fields
                .first()
                .map(|f| f.name.clone())
                .unwrap_or_default();

            if request.fields.is_empty() || request.frame.count == 0 {
                return Err(ChannelError::InvalidRequest {
                    name: first,
                    reason: "a request must read at least one register and decode at least one field"
                        .to_string(),
                }
                .into());
            }

            // The byte-count field of a reply is a single byte.
            if request.frame.count > 125 {
                return Err(ChannelError::InvalidRequest {
                    name: first,
                    reason: format!("register count {} exceeds 125", request.frame.count),
                }
                .into());
            }

            for field in &request.fields {
                if field.word >= request.frame.count {
                    return Err(ChannelError::FieldOutOfRange {
                        name: field.name.clone(),
                        word: field.word,
                        count: request.frame.count,
                    }
                    .into());
                }
                if !field.decode.divisor.is_finite() || field.decode.divisor == 0.0 {
                    return Err(ChannelError::InvalidRequest {
                        name: field.name.clone(),
                        reason: format!("divisor {} is not usable", field.decode.divisor),
                    }
                    .into());
                }
                if is_reserved(&field.name) {
                    return Err(ChannelError::ReservedName {
                        name: field.name.clone(),
                    }
                    .into());
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(ChannelError::DuplicateChannel {
                        name: field.name.clone(),
                    }
                    .into());
                }
                total += 1;
            }
        }

        if total == 0 {
            return Err(ChannelError::NoChannels.into());
        }

        if !seen.contains(self.cumulative.as_str()) {
            return Err(ChannelError::UnknownCumulativeChannel {
                name: self.cumulative.clone(),
            }
            .into());
        }

        Ok(())
    }
}

/// Names the report already uses for its own columns.
fn is_reserved(name: &str) -> bool {
    name == TIME_COLUMN || RESERVED_SLOTS.contains(&name)
}

/// A resolved channel: its request bytes, expected reply length and decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    name: String,
    index: usize,
    request: usize,
    descriptor: Vec<u8>,
    reply_len: usize,
    word: u16,
    decode: Decode,
}

impl ChannelSpec {
    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of this channel in samples and aggregates.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Request bytes that read this channel.
    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    /// Expected length of the reply to [`descriptor`](Self::descriptor).
    pub fn reply_len(&self) -> usize {
        self.reply_len
    }

    /// Offset of this channel's word in the reply payload.
    pub fn word(&self) -> u16 {
        self.word
    }

    /// The decoding rule.
    pub fn rule(&self) -> Decode {
        self.decode
    }

    /// Decodes this channel's value from a reply.
    ///
    /// Total over any input: a reply too short to hold the word decodes to
    /// `0.0`. Transports reject short replies before they get here.
    pub fn decode(&self, reply: &[u8]) -> f64 {
        frame::payload_word(reply, usize::from(self.word)).map_or(0.0, |raw| self.decode.apply(raw))
    }
}

/// One request of a sweep, with the indices of the channels it serves.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    frame: FrameSpec,
    descriptor: Vec<u8>,
    channels: Vec<usize>,
}

impl Request {
    /// The register read.
    pub fn frame(&self) -> &FrameSpec {
        &self.frame
    }

    /// Encoded request bytes.
    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    /// Expected reply length.
    pub fn reply_len(&self) -> usize {
        self.frame.reply_len()
    }

    /// Indices of the channels decoded from this request's reply.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }
}

/// Immutable channel table, built once at startup.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    requests: Vec<Request>,
    channels: Vec<ChannelSpec>,
    index: HashMap<String, usize>,
    cumulative: usize,
}

impl ChannelRegistry {
    /// Builds a registry from a definition after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the definition is invalid.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::compile(config))
    }

    /// The built-in SN-3003 registry. See [`RegistryConfig::sn3003`].
    pub fn sn3003() -> Self {
        Self::compile(&RegistryConfig::sn3003())
    }

    /// Loads and validates a JSON registry definition.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the file cannot be read, parsed or
    /// validated.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ChannelError::RegistryLoad {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: RegistryConfig =
            serde_json::from_str(&content).map_err(|e| ChannelError::RegistryParse {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::new(&config)
    }

    /// Resolves a validated definition. Callers must validate first.
    fn compile(config: &RegistryConfig) -> Self {
        let mut requests = Vec::with_capacity(config.requests.len());
        let mut channels = Vec::new();
        let mut index = HashMap::new();

        for (request_index, spec) in config.requests.iter().enumerate() {
            let descriptor = spec.frame.encode();
            let mut served = Vec::with_capacity(spec.fields.len());

            for field in &spec.fields {
                let channel_index = channels.len();
                index.insert(field.name.clone(), channel_index);
                served.push(channel_index);
                channels.push(ChannelSpec {
                    name: field.name.clone(),
                    index: channel_index,
                    request: request_index,
                    descriptor: descriptor.clone(),
                    reply_len: spec.frame.reply_len(),
                    word: field.word,
                    decode: field.decode,
                });
            }

            requests.push(Request {
                frame: spec.frame,
                descriptor,
                channels: served,
            });
        }

        let cumulative = index.get(&config.cumulative).copied().unwrap_or(0);

        Self {
            requests,
            channels,
            index,
            cumulative,
        }
    }

    /// Looks up a channel by name.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownChannel`] if no such channel exists.
    pub fn lookup(&self, name: &str) -> Result<&ChannelSpec> {
        self.index
            .get(name)
            .map(|&i| &self.channels[i])
            .ok_or_else(|| {
                ChannelError::UnknownChannel {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Requests in sweep order.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Channels in channel order.
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    /// Channel names in channel order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(ChannelSpec::name)
    }

    /// Number of channels (the width of every sample).
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns `true` if the registry has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// The cumulative-delta channel.
    pub fn cumulative(&self) -> &ChannelSpec {
        &self.channels[self.cumulative]
    }

    /// Returns the request that serves `channel`.
    pub fn request_for(&self, channel: &ChannelSpec) -> &Request {
        &self.requests[channel.request]
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::sn3003()
    }
}
