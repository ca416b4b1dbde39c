//! Modbus RTU framing for the grating modules.
//!
//! Only function code `0x03` (read holding registers) is spoken. Requests are
//! built as complete RTU frames including the trailing CRC16, responses are
//! validated (length, function echo, CRC) before any register is decoded.
//!
//! Register values are big-endian on the wire while the CRC is appended
//! low byte first. Both orders are fixed by the Modbus standard.

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Function code echoed with the high bit set when a slave answers with an exception.
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const CRC_POLYNOMIAL: u16 = 0xA001;
pub const CRC_INITIAL: u16 = 0xFFFF;

/// Length of a read-holding-registers request: slave, function, address, count, crc.
pub const READ_REQUEST_LEN: usize = 8;
/// Smallest frame that can carry a response: slave, function, byte count, crc.
pub const MIN_RESPONSE_LEN: usize = 5;
/// Offset of the first register byte in a read response.
pub const RESPONSE_DATA_OFFSET: usize = 3;

/// The Modbus specification caps a single read at 125 registers.
pub const MAX_READ_QUANTITY: u16 = 125;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("The address value {0} is outside the permissible range of {min} to {max}", min = Address::MIN, max = Address::MAX)]
    AddressOutOfRange(u8),
    #[error("The baud rate {0} is not supported")]
    UnsupportedBaudRate(u32),
}

/// Failure to turn a response frame into register values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed response: {0}")]
    Malformed(&'static str),
    #[error("Slave answered with exception code {0:#04x}")]
    Exception(u8),
}

/// Computes the Modbus CRC16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INITIAL;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checks the trailing two CRC bytes (low byte first) of `frame`.
pub fn crc_matches(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

/// A complete RTU frame ready to be written to the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Builds a frame from its slave address, function code and payload, appending the CRC.
    pub fn new(slave: u8, function: u8, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(payload.len() + 4);
        bytes.push(slave);
        bytes.push(function);
        bytes.extend_from_slice(payload);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Self(bytes)
    }

    pub fn slave(&self) -> u8 {
        self.0[0]
    }

    pub fn function(&self) -> u8 {
        self.0[1]
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[2..self.0.len() - 2]
    }

    pub fn crc(&self) -> u16 {
        let len = self.0.len();
        u16::from_le_bytes([self.0[len - 2], self.0[len - 1]])
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Frame {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Formats bytes as space separated upper case hex, e.g. `0A 03 00 14`.
pub fn hex_dump(bytes: &[u8]) -> String {
    struct Hex<'a>(&'a [u8]);
    impl fmt::Display for Hex<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write_hex(f, self.0)
        }
    }
    Hex(bytes).to_string()
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{byte:02X}")?;
    }
    Ok(())
}

/// Encodes a read-holding-registers request (function 0x03).
///
/// Address and quantity are written big-endian, the CRC low byte first.
pub fn build_read_holding_registers(slave: u8, start_address: u16, count: u16) -> Frame {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&start_address.to_be_bytes());
    payload[2..].copy_from_slice(&count.to_be_bytes());
    Frame::new(slave, FUNCTION_READ_HOLDING_REGISTERS, &payload)
}

/// Validates a read-holding-registers response and returns `expected_count`
/// big-endian register values starting at byte offset 3.
pub fn decode_read_holding_registers(
    response: &[u8],
    expected_count: u16,
) -> Result<Vec<u16>, DecodeError> {
    if response.len() < MIN_RESPONSE_LEN {
        return Err(DecodeError::Malformed("response shorter than 5 bytes"));
    }
    let function = response[1];
    if function == FUNCTION_READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        if !crc_matches(&response[..MIN_RESPONSE_LEN]) {
            return Err(DecodeError::Malformed("exception frame failed CRC check"));
        }
        return Err(DecodeError::Exception(response[2]));
    }
    if function != FUNCTION_READ_HOLDING_REGISTERS {
        return Err(DecodeError::Malformed("unexpected function code"));
    }
    let byte_count = response[2] as usize;
    let frame_len = RESPONSE_DATA_OFFSET + byte_count + 2;
    if frame_len > response.len() {
        return Err(DecodeError::Malformed("byte count exceeds received length"));
    }
    if !crc_matches(&response[..frame_len]) {
        return Err(DecodeError::Malformed("CRC check failed"));
    }
    if byte_count < expected_count as usize * 2 {
        return Err(DecodeError::Malformed("fewer registers than requested"));
    }

    Ok(response[RESPONSE_DATA_OFFSET..RESPONSE_DATA_OFFSET + expected_count as usize * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encodes a read-holding-registers response frame, as a slave would send it.
pub fn encode_read_holding_registers_response(slave: u8, registers: &[u16]) -> Frame {
    let mut payload = Vec::with_capacity(registers.len() * 2 + 1);
    payload.push((registers.len() * 2) as u8);
    for register in registers {
        payload.extend_from_slice(&register.to_be_bytes());
    }
    Frame::new(slave, FUNCTION_READ_HOLDING_REGISTERS, &payload)
}

/// Validated Modbus slave address of a grating module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u8);

impl Address {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 247;
}

impl Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::AddressOutOfRange(value))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaudRate {
    B1200,
    B2400,
    B4800,
    #[default]
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    pub const ALL: [BaudRate; 8] = [
        BaudRate::B1200,
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    pub fn bits_per_second(&self) -> u32 {
        match self {
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|rate| rate.bits_per_second() == value)
            .ok_or(Error::UnsupportedBaudRate(value))
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

/// Minimum inter-frame silence for Modbus RTU: 3.5 character times.
///
/// A character is counted as 11 bits (start, 8 data, parity or second stop, stop).
pub fn minimum_rtu_delay(baud_rate: &BaudRate) -> Duration {
    const BITS_PER_CHAR: f64 = 11.0;
    // Modbus fixes the silence at 1.75 ms above 19200 baud.
    const MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;

    let char_time_secs = BITS_PER_CHAR / baud_rate.bits_per_second() as f64;
    let delay_micros = (3.5 * char_time_secs * 1_000_000.0) as u64;
    Duration::from_micros(delay_micros.max(MIN_INTER_FRAME_DELAY_MICROS))
}

/// Raises a configured pre-send delay to the RTU minimum when it is too short.
pub fn check_rtu_delay(user_delay: Duration, baud_rate: &BaudRate) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if user_delay < min_rtu_delay {
        log::warn!(
            "Pre-send delay of {user_delay:?} is below the minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn reference_crc16(data: &[u8]) -> u16 {
        // Table driven variant, built independently of `crc16`.
        let table: Vec<u16> = (0u16..256)
            .map(|mut value| {
                for _ in 0..8 {
                    value = if value & 1 == 1 {
                        (value >> 1) ^ 0xA001
                    } else {
                        value >> 1
                    };
                }
                value
            })
            .collect();
        data.iter().fold(0xFFFF, |crc, &byte| {
            (crc >> 8) ^ table[((crc ^ byte as u16) & 0xFF) as usize]
        })
    }

    #[test]
    fn crc16_known_frames() {
        // 01 03 00 00 00 01 84 0A is the canonical read of one register.
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).to_le_bytes(), [0x84, 0x0A]);
        let payload = [0x0A, 0x03, 0x00, 0x14, 0x00, 0x02];
        assert_eq!(crc16(&payload), reference_crc16(&payload));
        assert_eq!(crc16(&payload), crc16(&payload));
    }

    #[test]
    fn read_request_layout() {
        let frame = build_read_holding_registers(10, 20, 2);
        let crc = crc16(&[0x0A, 0x03, 0x00, 0x14, 0x00, 0x02]);
        assert_eq!(frame.len(), READ_REQUEST_LEN);
        assert_eq!(
            &frame[..],
            &[0x0A, 0x03, 0x00, 0x14, 0x00, 0x02, (crc & 0xFF) as u8, (crc >> 8) as u8]
        );
        assert_eq!(frame.slave(), 10);
        assert_eq!(frame.function(), FUNCTION_READ_HOLDING_REGISTERS);
        assert_eq!(frame.payload(), &[0x00, 0x14, 0x00, 0x02]);
        assert_eq!(frame.crc(), crc);
        assert!(crc_matches(&frame));
        assert_eq!(frame.to_string(), hex_dump(&frame));
    }

    #[test]
    fn request_then_response_round_trip() {
        let request = build_read_holding_registers(10, 20, 2);
        let response = encode_read_holding_registers_response(request.slave(), &[22000, 22100]);
        // Register bytes are big-endian: 22000 = 0x55F0.
        assert_eq!(&response[..5], &[0x0A, 0x03, 0x04, 0x55, 0xF0]);
        assert_eq!(
            decode_read_holding_registers(&response, 2),
            Ok(vec![22000, 22100])
        );
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let valid = encode_read_holding_registers_response(10, &[1, 2]).into_bytes();

        assert_matches!(
            decode_read_holding_registers(&valid[..4], 2),
            Err(DecodeError::Malformed(..))
        );

        let mut wrong_function = valid.clone();
        wrong_function[1] = 0x04;
        assert_matches!(
            decode_read_holding_registers(&wrong_function, 2),
            Err(DecodeError::Malformed(..))
        );

        let mut corrupted = valid.clone();
        corrupted[4] ^= 0xFF;
        assert_matches!(
            decode_read_holding_registers(&corrupted, 2),
            Err(DecodeError::Malformed(..))
        );

        // Byte count claims more data than was received.
        let truncated = &valid[..valid.len() - 1];
        assert_matches!(
            decode_read_holding_registers(truncated, 2),
            Err(DecodeError::Malformed(..))
        );

        assert_matches!(
            decode_read_holding_registers(&valid, 3),
            Err(DecodeError::Malformed(..))
        );
    }

    #[test]
    fn decode_trailing_bytes_are_ignored() {
        let mut response = encode_read_holding_registers_response(1, &[7]).into_bytes();
        response.push(0x00);
        assert_eq!(decode_read_holding_registers(&response, 1), Ok(vec![7]));
    }

    #[test]
    fn decode_exception_response() {
        let exception = Frame::new(10, 0x83, &[0x02]);
        assert_matches!(
            decode_read_holding_registers(&exception, 2),
            Err(DecodeError::Exception(0x02))
        );
    }

    #[test]
    fn address_range() {
        assert_matches!(Address::try_from(0), Err(Error::AddressOutOfRange(0)));
        assert_eq!(*Address::try_from(1).unwrap(), 1);
        assert_eq!(*Address::try_from(247).unwrap(), 247);
        assert_matches!(Address::try_from(248), Err(Error::AddressOutOfRange(248)));
        assert_eq!(Address::try_from(10).unwrap().to_string(), "0x0a");
    }

    #[test]
    fn baud_rate_conversion() {
        assert_eq!(BaudRate::try_from(9600), Ok(BaudRate::B9600));
        assert_eq!(BaudRate::default(), BaudRate::B9600);
        assert_matches!(
            BaudRate::try_from(9601),
            Err(Error::UnsupportedBaudRate(9601))
        );
        assert_eq!(BaudRate::B115200.to_string(), "115200");
    }

    #[test]
    fn test_minimum_rtu_delay_calculation() {
        // 3.5 char times = 38.5 / baud seconds
        assert_eq!(minimum_rtu_delay(&BaudRate::B1200).as_micros(), 32083);
        assert_eq!(minimum_rtu_delay(&BaudRate::B9600).as_micros(), 4010);
        assert_eq!(minimum_rtu_delay(&BaudRate::B19200).as_micros(), 2005);
        // 38.5 / 38400 is about 1002 us, clamped to 1750 us
        assert_eq!(minimum_rtu_delay(&BaudRate::B38400).as_micros(), 1750);
    }

    #[test]
    fn test_check_rtu_delay() {
        let min_delay_9600 = minimum_rtu_delay(&BaudRate::B9600);
        assert_eq!(
            check_rtu_delay(Duration::from_millis(3), &BaudRate::B9600),
            min_delay_9600
        );
        assert_eq!(
            check_rtu_delay(Duration::from_millis(10), &BaudRate::B9600),
            Duration::from_millis(10)
        );
    }
}
