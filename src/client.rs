//! Stateless Modbus RTU read operations on top of a [`Transport`].
//!
//! This mirrors a thin "read and decode" layer: encode the request, run the
//! exchange, validate and decode the answer. The caller owns the transport.
//!
//! ```no_run
//! use grating_qc_lib::{client::RtuClient, protocol::{Address, BaudRate}, serial::{LinkOptions, SerialLink}};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut link = SerialLink::open("/dev/ttyUSB0", BaudRate::B9600, LinkOptions::default())?;
//!     let registers = RtuClient::read_holding_registers(&mut link, Address::try_from(11)?, 20, 2)?;
//!     println!("Registers: {registers:?}");
//!     Ok(())
//! }
//! ```

use crate::{
    error::{Error, Result},
    protocol::{self as proto, Address},
    serial::{Transport, TransportError},
};

#[derive(Debug)]
pub struct RtuClient;

impl RtuClient {
    /// Reads `count` holding registers starting at `start_address` from `slave`.
    ///
    /// # Errors
    ///
    /// * [`Error::Transport`] if the exchange itself fails or nothing was received.
    /// * [`Error::Decode`] if the answer fails length, function or CRC validation.
    /// * [`Error::UnexpectedSlave`] if a different slave answered.
    pub fn read_holding_registers(
        transport: &mut (impl Transport + ?Sized),
        slave: Address,
        start_address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = proto::build_read_holding_registers(*slave, start_address, count);
        let response = transport.execute(&request)?;
        match response.first() {
            None => return Err(TransportError::Empty.into()),
            Some(&received) if received != *slave => {
                return Err(Error::UnexpectedSlave {
                    expected: *slave,
                    received,
                })
            }
            Some(_) => {}
        }
        Ok(proto::decode_read_holding_registers(&response, count)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    /// In-memory bus answering read requests from a register map per slave.
    #[derive(Debug, Default)]
    pub(crate) struct FakeBus {
        pub registers: HashMap<(u8, u16), u16>,
        pub requests: Vec<Vec<u8>>,
        pub connected: bool,
        pub mute: Vec<u8>,
    }

    impl FakeBus {
        pub(crate) fn new() -> Self {
            Self {
                connected: true,
                ..Self::default()
            }
        }

        pub(crate) fn with_registers(mut self, slave: u8, start: u16, values: &[u16]) -> Self {
            for (offset, value) in values.iter().enumerate() {
                self.registers.insert((slave, start + offset as u16), *value);
            }
            self
        }
    }

    impl Transport for FakeBus {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn execute(&mut self, frame: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.requests.push(frame.to_vec());
            assert!(proto::crc_matches(frame));
            let slave = frame[0];
            if self.mute.contains(&slave) {
                return Err(TransportError::Empty);
            }
            let start = u16::from_be_bytes([frame[2], frame[3]]);
            let count = u16::from_be_bytes([frame[4], frame[5]]);
            let values: Option<Vec<u16>> = (start..start + count)
                .map(|address| self.registers.get(&(slave, address)).copied())
                .collect();
            match values {
                Some(values) => {
                    Ok(proto::encode_read_holding_registers_response(slave, &values).into_bytes())
                }
                // Illegal data address
                None => Ok(proto::Frame::new(slave, 0x83, &[0x02]).into_bytes()),
            }
        }
    }

    #[test]
    fn reads_registers_from_slave() {
        let mut bus = FakeBus::new().with_registers(11, 20, &[22000, 22100]);
        let registers =
            RtuClient::read_holding_registers(&mut bus, Address::try_from(11).unwrap(), 20, 2)
                .unwrap();
        assert_eq!(registers, vec![22000, 22100]);
        assert_eq!(
            bus.requests,
            vec![proto::build_read_holding_registers(11, 20, 2).into_bytes()]
        );
    }

    #[test]
    fn exception_and_silence_are_errors() {
        let mut bus = FakeBus::new();
        assert_matches!(
            RtuClient::read_holding_registers(&mut bus, Address::try_from(11).unwrap(), 20, 2),
            Err(Error::Decode(proto::DecodeError::Exception(0x02)))
        );

        bus.mute.push(11);
        assert_matches!(
            RtuClient::read_holding_registers(&mut bus, Address::try_from(11).unwrap(), 20, 2),
            Err(Error::Transport(TransportError::Empty))
        );

        bus.connected = false;
        assert_matches!(
            RtuClient::read_holding_registers(&mut bus, Address::try_from(11).unwrap(), 20, 2),
            Err(Error::Transport(TransportError::NotConnected))
        );
    }

    #[test]
    fn answer_from_other_slave_is_rejected() {
        struct Echo;
        impl Transport for Echo {
            fn is_connected(&self) -> bool {
                true
            }
            fn execute(&mut self, _frame: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
                Ok(proto::encode_read_holding_registers_response(12, &[1, 2]).into_bytes())
            }
        }
        assert_matches!(
            RtuClient::read_holding_registers(&mut Echo, Address::try_from(11).unwrap(), 20, 2),
            Err(Error::UnexpectedSlave {
                expected: 11,
                received: 12
            })
        );
    }
}
