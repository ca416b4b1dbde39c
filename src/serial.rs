//! Physical serial link to the RS485 bus.
//!
//! [`SerialLink`] owns the only handle to the port. It is opened once with
//! 8-N-1 framing and no flow control; a failure at any stage of opening drops
//! the handle again, so a failed open never leaves the port held.
//!
//! The [`Transport`] trait is the seam between the codec and the hardware.
//! Everything above it (channels, scheduler) works with a `dyn Transport`.

use crate::protocol::{self as proto, hex_dump, BaudRate};
use std::io::{Read, Write};
use std::time::Duration;

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Upper bound of bytes accepted for one response.
pub const READ_BUFFER_SIZE: usize = 256;
/// Fixed wait between writing a request and reading the answer.
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Creates a `tokio_serial::SerialPortBuilder` with 8-N-1 framing and no flow control.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0` or `COM3`).
/// * `baud_rate` - The baud rate for the serial communication.
pub fn serial_port_builder(device: &str, baud_rate: &BaudRate) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate.bits_per_second())
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Maps a numeric port to the platform's device name.
pub fn port_device_name(port: u32) -> String {
    if cfg!(target_os = "windows") {
        format!("COM{port}")
    } else {
        format!("/dev/ttyS{port}")
    }
}

/// Errors raised while opening the link. Non-fatal: acquisition falls back to simulated data.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Cannot open serial port {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("Cannot set timeouts on serial port {device}: {source}")]
    Timeouts {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
}

/// Errors of a single request/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial link is not connected")]
    NotConnected,
    #[error("Serial I/O failed: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("No response received")]
    Empty,
}

/// A request/response channel to the Modbus slaves.
///
/// Implementations are driven from a single thread; no internal locking is expected.
pub trait Transport: Send {
    fn is_connected(&self) -> bool;

    /// Writes `frame`, waits for the line to settle and returns whatever was received.
    fn execute(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Composite timeout: a fixed base plus a per-byte allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub per_byte: Duration,
}

impl TimeoutPolicy {
    pub const fn new(base: Duration, per_byte: Duration) -> Self {
        Self { base, per_byte }
    }

    pub fn total(&self, bytes: usize) -> Duration {
        self.base + self.per_byte * bytes as u32
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    pub read_timeout: TimeoutPolicy,
    pub write_timeout: TimeoutPolicy,
    /// Silence kept on the line before each request.
    pub pre_send_delay: Duration,
    pub settle_delay: Duration,
    /// Dump every frame at trace level.
    pub trace_frames: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            read_timeout: TimeoutPolicy::default(),
            write_timeout: TimeoutPolicy::default(),
            pre_send_delay: Duration::from_millis(10),
            settle_delay: SETTLE_DELAY,
            trace_frames: false,
        }
    }
}

/// An open RS485 port. `is_connected` is true until [`SerialLink::close`] is called.
pub struct SerialLink {
    port: Option<Box<dyn tokio_serial::SerialPort>>,
    device: String,
    baud_rate: BaudRate,
    options: LinkOptions,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("device", &self.device)
            .field("baud_rate", &self.baud_rate)
            .field("connected", &self.is_connected())
            .field("options", &self.options)
            .finish()
    }
}

impl SerialLink {
    /// Opens `device` at `baud_rate` with 8-N-1 framing and the given timeouts.
    pub fn open(device: &str, baud_rate: BaudRate, options: LinkOptions) -> Result<Self, OpenError> {
        let mut port = serial_port_builder(device, &baud_rate)
            .timeout(options.read_timeout.total(READ_BUFFER_SIZE))
            .open()
            .map_err(|source| OpenError::Open {
                device: device.to_string(),
                source,
            })?;
        // The handle is dropped, and the port closed, on this error path.
        port.set_timeout(options.read_timeout.total(READ_BUFFER_SIZE))
            .map_err(|source| OpenError::Timeouts {
                device: device.to_string(),
                source,
            })?;

        let options = LinkOptions {
            pre_send_delay: proto::check_rtu_delay(options.pre_send_delay, &baud_rate),
            ..options
        };
        log::info!("Opened serial port {device} at {baud_rate} baud (8-N-1)");
        Ok(Self {
            port: Some(port),
            device: device.to_string(),
            baud_rate,
            options,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.baud_rate
    }

    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    /// Releases the port. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed serial port {}", self.device);
        }
    }
}

/// Length of a well-formed answer to `request`, capped at [`READ_BUFFER_SIZE`].
fn expected_response_len(request: &[u8]) -> usize {
    let len = match request {
        [_, proto::FUNCTION_READ_HOLDING_REGISTERS, _, _, high, low, ..] => {
            proto::MIN_RESPONSE_LEN + 2 * u16::from_be_bytes([*high, *low]) as usize
        }
        _ => READ_BUFFER_SIZE,
    };
    len.min(READ_BUFFER_SIZE)
}

/// Reads until `expected` bytes arrived, an exception answer is complete, or a read times out.
///
/// A slow slave delivers its answer over several reads. A timeout ends the
/// frame with whatever was received so far.
fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    buffer: &mut [u8],
    expected: usize,
) -> std::io::Result<usize> {
    let expected = expected.min(buffer.len());
    let mut received = 0;
    while received < expected {
        match reader.read(&mut buffer[received..expected]) {
            Ok(0) => break,
            Ok(count) => received += count,
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => break,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
        if received >= proto::MIN_RESPONSE_LEN && buffer[1] & proto::EXCEPTION_FLAG != 0 {
            break;
        }
    }
    Ok(received)
}

impl Transport for SerialLink {
    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn execute(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let options = self.options;
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        if let Err(error) = port.clear(tokio_serial::ClearBuffer::Input) {
            log::debug!("Cannot discard stale input on {}: {error}", self.device);
        }
        std::thread::sleep(options.pre_send_delay);

        port.set_timeout(options.write_timeout.total(frame.len()))
            .map_err(std::io::Error::from)?;
        if options.trace_frames {
            log::trace!("{} TX: {}", self.device, hex_dump(frame));
        }
        port.write_all(frame)?;
        port.flush()?;

        std::thread::sleep(options.settle_delay);

        port.set_timeout(options.read_timeout.total(expected_response_len(frame)))
            .map_err(std::io::Error::from)?;
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let received = read_frame(port, &mut buffer, expected_response_len(frame))?;
        if received == 0 {
            return Err(TransportError::Empty);
        }
        if options.trace_frames {
            log::trace!("{} RX: {}", self.device, hex_dump(&buffer[..received]));
        }
        Ok(buffer[..received].to_vec())
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn timeout_policy_total() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.total(0), Duration::from_millis(1000));
        assert_eq!(policy.total(8), Duration::from_millis(1080));
        assert_eq!(policy.total(READ_BUFFER_SIZE), Duration::from_millis(3560));
    }

    #[test]
    fn read_timeout_follows_the_expected_answer() {
        let request = proto::build_read_holding_registers(10, 20, 2);
        assert_eq!(expected_response_len(&request), 9);
        let request = proto::build_read_holding_registers(10, 0, 125);
        assert_eq!(expected_response_len(&request), 255);
        assert_eq!(expected_response_len(&[]), READ_BUFFER_SIZE);
    }

    /// Hands out one queued chunk per read, then times out.
    struct Trickle(std::collections::VecDeque<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Some(mut chunk) = self.0.pop_front() else {
                return Err(std::io::ErrorKind::TimedOut.into());
            };
            let count = chunk.len().min(buf.len());
            buf[..count].copy_from_slice(&chunk[..count]);
            if count < chunk.len() {
                self.0.push_front(chunk.split_off(count));
            }
            Ok(count)
        }
    }

    #[test]
    fn slow_answer_is_read_to_the_end() {
        let answer =
            proto::encode_read_holding_registers_response(10, &[22000, 22100]).into_bytes();
        let request = proto::build_read_holding_registers(10, 20, 2);
        let mut port = Trickle(answer.iter().map(|byte| vec![*byte]).collect());
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        let received =
            read_frame(&mut port, &mut buffer, expected_response_len(&request)).unwrap();
        assert_eq!(&buffer[..received], answer.as_slice());
        assert_eq!(
            proto::decode_read_holding_registers(&buffer[..received], 2).unwrap(),
            vec![22000, 22100]
        );
    }

    #[test]
    fn short_answers_end_the_read() {
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        // Exception answers are shorter than the expected data answer.
        let exception = proto::Frame::new(10, 0x83, &[0x02]).into_bytes();
        let mut port = Trickle([exception[..2].to_vec(), exception[2..].to_vec()].into());
        assert_eq!(read_frame(&mut port, &mut buffer, 9).unwrap(), exception.len());
        assert!(port.0.is_empty());

        let mut port = Trickle([vec![10, 3, 4], vec![0x55]].into());
        assert_eq!(read_frame(&mut port, &mut buffer, 9).unwrap(), 4);

        let mut port = Trickle(Default::default());
        assert_eq!(read_frame(&mut port, &mut buffer, 9).unwrap(), 0);
    }

    #[test]
    fn port_names() {
        let name = port_device_name(3);
        if cfg!(target_os = "windows") {
            assert_eq!(name, "COM3");
        } else {
            assert_eq!(name, "/dev/ttyS3");
        }
    }

    #[test]
    fn open_missing_device_fails_cleanly() {
        let result = SerialLink::open(
            "/dev/grating-qc-missing-device",
            BaudRate::B9600,
            LinkOptions::default(),
        );
        assert_matches!(result, Err(OpenError::Open { .. }));
    }
}
