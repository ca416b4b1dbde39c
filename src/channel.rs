//! Per-channel measurement storage.
//!
//! A channel is a pair of grating heads (left and right) read as one
//! measurement. Each [`ChannelStore`] keeps a bounded FIFO of samples behind a
//! mutex: the acquisition thread appends, any other thread reads through a
//! [`ChannelReader`] and only ever receives copies.

use crate::{
    client::RtuClient,
    decoder::{RegisterDecoder, ScaledDecoder},
    measurement::{now_ms, Measurement, Parameter},
    protocol::{Address, BaudRate},
    quality::LimitTable,
    serial::{LinkOptions, SerialLink, Transport},
    simulator::Simulator,
};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of samples kept per channel.
pub const BUFFER_CAPACITY: usize = 1000;

/// Logical channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 32;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("The channel number {0} is outside the permissible range of {min} to {max}", min = Channel::MIN, max = Channel::MAX)]
pub struct ChannelOutOfRange(pub u8);

impl TryFrom<u8> for Channel {
    type Error = ChannelOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ChannelOutOfRange(value))
        }
    }
}

impl Deref for Channel {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Left => "left",
            Side::Right => "right",
        })
    }
}

/// Where one grating head lives on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GratingEndpoint {
    pub slave: Address,
    pub register_address: u16,
    pub register_count: u16,
}

/// Immutable configuration of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub left: GratingEndpoint,
    pub right: GratingEndpoint,
    /// Alarm bounds and nominal values, taken from the quality limit table.
    pub limits: LimitTable,
}

impl ChannelConfig {
    pub fn endpoint(&self, side: Side) -> &GratingEndpoint {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

/// A poll produced no sample because one grating returned no registers.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("Channel {channel}: no registers from the {side} grating")]
pub struct NoData {
    pub channel: Channel,
    pub side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    OverUpperLimit,
    UnderLowerLimit,
}

/// A spec limit violation of the latest sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmEvent {
    pub channel: Channel,
    pub parameter: Parameter,
    pub kind: AlarmKind,
    pub value: f64,
    pub limit: f64,
}

impl fmt::Display for AlarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, relation) = match self.kind {
            AlarmKind::OverUpperLimit => ("over upper limit", '>'),
            AlarmKind::UnderLowerLimit => ("under lower limit", '<'),
        };
        write!(
            f,
            "Channel {} {} {text} ({:.3} {relation} {:.3})",
            self.channel, self.parameter, self.value, self.limit
        )
    }
}

/// Bounded, time ordered FIFO of samples.
#[derive(Debug, Clone)]
pub struct ChannelBuffer {
    samples: VecDeque<Measurement>,
    capacity: usize,
}

impl ChannelBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn push(&mut self, measurement: Measurement) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(measurement);
    }

    pub fn latest(&self) -> Option<Measurement> {
        self.samples.back().copied()
    }

    /// The most recent `min(n, len)` samples, oldest first.
    pub fn history(&self, n: usize) -> Vec<Measurement> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }

    /// Averages of `parameter` over the most recent `min(n, len)` samples, oldest first.
    pub fn values(&self, parameter: Parameter, n: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples
            .iter()
            .skip(skip)
            .map(|measurement| measurement.avg(parameter))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ChannelBuffer {
    fn default() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }
}

fn lock(buffer: &Mutex<ChannelBuffer>) -> MutexGuard<'_, ChannelBuffer> {
    // Pushes cannot leave the buffer half-updated, so a poisoned lock is still usable.
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only, cloneable view of a channel's buffer for other threads.
#[derive(Debug, Clone)]
pub struct ChannelReader {
    channel: Channel,
    buffer: Arc<Mutex<ChannelBuffer>>,
}

impl ChannelReader {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn latest(&self) -> Option<Measurement> {
        lock(&self.buffer).latest()
    }

    pub fn history(&self, n: usize) -> Vec<Measurement> {
        lock(&self.buffer).history(n)
    }

    pub fn values(&self, parameter: Parameter, n: usize) -> Vec<f64> {
        lock(&self.buffer).values(parameter, n)
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.buffer).is_empty()
    }
}

/// Where samples come from. Chosen once when the link is opened.
pub enum DataSource {
    Link(Box<dyn Transport>),
    Simulated(Simulator),
}

impl DataSource {
    /// Opens the serial link, falling back to simulated data when that fails.
    pub fn open(device: &str, baud_rate: BaudRate, options: LinkOptions, simulator: Simulator) -> Self {
        match SerialLink::open(device, baud_rate, options) {
            Ok(link) => DataSource::Link(Box::new(link)),
            Err(error) => {
                log::warn!("{error}; continuing with simulated data");
                DataSource::Simulated(simulator)
            }
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, DataSource::Simulated(_))
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Link(link) => f
                .debug_struct("Link")
                .field("connected", &link.is_connected())
                .finish(),
            DataSource::Simulated(simulator) => f.debug_tuple("Simulated").field(simulator).finish(),
        }
    }
}

/// Buffer and configuration of one channel.
pub struct ChannelStore {
    channel: Channel,
    config: ChannelConfig,
    buffer: Arc<Mutex<ChannelBuffer>>,
    decoder: Arc<dyn RegisterDecoder>,
}

impl fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStore")
            .field("channel", &self.channel)
            .field("config", &self.config)
            .field("samples", &self.len())
            .finish()
    }
}

impl ChannelStore {
    pub fn new(channel: Channel, config: ChannelConfig) -> Self {
        let decoder = Arc::new(ScaledDecoder::from_limits(&config.limits));
        Self {
            channel,
            config,
            buffer: Arc::new(Mutex::new(ChannelBuffer::default())),
            decoder,
        }
    }

    /// Replaces the register decoding strategy.
    pub fn with_decoder(mut self, decoder: Arc<dyn RegisterDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn reader(&self) -> ChannelReader {
        ChannelReader {
            channel: self.channel,
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// Takes one sample from `source` and appends it to the buffer.
    ///
    /// With a link, both gratings are read; the sample is only produced when
    /// both return registers.
    pub fn poll(&self, source: &mut DataSource) -> Result<Measurement, NoData> {
        let measurement = match source {
            DataSource::Simulated(simulator) => simulator.sample(now_ms()),
            DataSource::Link(link) => {
                let left = self.read_grating(link.as_mut(), Side::Left);
                let right = self.read_grating(link.as_mut(), Side::Right);
                if left.is_empty() {
                    return Err(self.no_data(Side::Left));
                }
                if right.is_empty() {
                    return Err(self.no_data(Side::Right));
                }
                self.decoder.decode(&left, &right, now_ms())
            }
        };
        lock(&self.buffer).push(measurement);
        Ok(measurement)
    }

    fn no_data(&self, side: Side) -> NoData {
        NoData {
            channel: self.channel,
            side,
        }
    }

    fn read_grating(&self, link: &mut dyn Transport, side: Side) -> Vec<u16> {
        let endpoint = self.config.endpoint(side);
        RtuClient::read_holding_registers(
            link,
            endpoint.slave,
            endpoint.register_address,
            endpoint.register_count,
        )
        .unwrap_or_else(|error| {
            log::debug!(
                "Channel {} {side} grating (slave {}): {error}",
                self.channel,
                endpoint.slave
            );
            Vec::new()
        })
    }

    pub fn latest(&self) -> Option<Measurement> {
        lock(&self.buffer).latest()
    }

    pub fn history(&self, n: usize) -> Vec<Measurement> {
        lock(&self.buffer).history(n)
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.buffer).is_empty()
    }

    /// Checks the latest sample against the P1, P5U and P5L spec limits, in that order.
    ///
    /// At most one event per parameter; parameters without configured limits are skipped.
    pub fn check_alarms(&self) -> Vec<AlarmEvent> {
        let Some(latest) = self.latest() else {
            return Vec::new();
        };
        Parameter::ALARMED
            .into_iter()
            .filter_map(|parameter| {
                let limits = self.config.limits.get(parameter);
                if !limits.is_configured() {
                    return None;
                }
                let value = latest.avg(parameter);
                let (kind, limit) = if value > limits.upper_spec_limit {
                    (AlarmKind::OverUpperLimit, limits.upper_spec_limit)
                } else if value < limits.lower_spec_limit {
                    (AlarmKind::UnderLowerLimit, limits.lower_spec_limit)
                } else {
                    return None;
                };
                Some(AlarmEvent {
                    channel: self.channel,
                    parameter,
                    kind,
                    value,
                    limit,
                })
            })
            .collect()
    }
}
