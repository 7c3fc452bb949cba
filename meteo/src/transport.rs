//! Transport adapters: send a request descriptor, get back a framed reply.
//!
//! The sampler only sees the [`Transport`] trait. A transport must return
//! either exactly `reply_len` validated bytes or a [`TransportError`];
//! partial replies never reach the decoders.

use std::io::{self, ErrorKind, Read};
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// A request/reply exchange with the sensor bus.
pub trait Transport {
    /// Sends `descriptor` and waits up to `timeout` for a reply of exactly
    /// `reply_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on I/O failure, timeout, short or invalid
    /// reply.
    fn request(
        &mut self,
        descriptor: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn request(
        &mut self,
        descriptor: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).request(descriptor, reply_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn request(
        &mut self,
        descriptor: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).request(descriptor, reply_len, timeout)
    }
}

/// A byte source whose blocking reads can be bounded.
#[cfg_attr(not(feature = "serial"), allow(dead_code))]
trait TimedRead: Read {
    /// Bounds the next blocking read to `timeout`.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Reads exactly `reply_len` bytes, giving up once `timeout` has elapsed.
/// Each read is bounded by the time left, so a trickling device cannot
/// stretch the exchange past the deadline.
#[cfg_attr(not(feature = "serial"), allow(dead_code))]
fn read_reply<R: TimedRead + ?Sized>(
    source: &mut R,
    reply_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut reply = vec![0u8; reply_len];
    let mut received = 0;

    while received < reply_len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        source
            .set_read_timeout(remaining)
            .map_err(|e| TransportError::Io { source: e })?;

        match source.read(&mut reply[received..]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Io { source: e }),
        }
    }

    if received < reply_len {
        return Err(TransportError::ShortReply {
            expected: reply_len,
            received,
        });
    }
    Ok(reply)
}

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use std::io::{self, Write};
    use std::time::Duration;

    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

    use super::{TimedRead, Transport};
    use crate::config::SerialSettings;
    use crate::error::TransportError;
    use crate::frame;

    /// RS-485 transport over a local serial device (8N1, no flow control).
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl std::fmt::Debug for SerialTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SerialTransport")
                .field("port", &self.port.name())
                .finish()
        }
    }

    impl SerialTransport {
        /// Opens and configures the serial device.
        ///
        /// # Errors
        ///
        /// Returns [`TransportError::Open`] if the device cannot be opened.
        pub fn open(settings: &SerialSettings) -> Result<Self, TransportError> {
            let port = serialport::new(&settings.port, settings.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| TransportError::Open {
                    port: settings.port.clone(),
                    source: e,
                })?;

            tracing::info!(
                port = %settings.port,
                baud = settings.baud_rate,
                "serial transport opened"
            );

            Ok(Self { port })
        }
    }

    impl TimedRead for Box<dyn SerialPort> {
        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.set_timeout(timeout).map_err(io::Error::from)
        }
    }

    impl Transport for SerialTransport {
        fn request(
            &mut self,
            descriptor: &[u8],
            reply_len: usize,
            timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            // A late reply to a previous request would shift every frame after it.
            if let Err(e) = self.port.clear(ClearBuffer::Input) {
                tracing::debug!(error = %e, "failed to clear serial input buffer");
            }

            self.port
                .set_timeout(timeout)
                .map_err(|e| TransportError::Io { source: e.into() })?;
            self.port
                .write_all(descriptor)
                .map_err(|e| TransportError::Io { source: e })?;
            self.port
                .flush()
                .map_err(|e| TransportError::Io { source: e })?;

            let reply = super::read_reply(&mut self.port, reply_len, timeout)?;
            frame::check_reply(descriptor, &reply)?;
            Ok(reply)
        }
    }
}
