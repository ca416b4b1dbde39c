//! Crate-wide error type.
//!
//! Each layer has its own error enum; [`Error`] wraps them so callers that do
//! not care about the layer can use a single `Result`.
use crate::{channel, protocol as proto, serial, settings};

/// Represents every failure the acquisition pipeline can report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// Wraps `proto::DecodeError`.
    #[error(transparent)]
    Decode(#[from] proto::DecodeError),

    /// Wraps `serial::OpenError`.
    #[error(transparent)]
    Open(#[from] serial::OpenError),

    /// Wraps `serial::TransportError`.
    #[error(transparent)]
    Transport(#[from] serial::TransportError),

    /// Wraps `settings::ConfigError`.
    #[error(transparent)]
    Config(#[from] settings::ConfigError),

    /// Wraps `channel::NoData`.
    #[error(transparent)]
    NoData(#[from] channel::NoData),

    #[error("Slave {expected} was addressed but slave {received} answered")]
    UnexpectedSlave { expected: u8, received: u8 },

    #[error("No channel could be configured")]
    NoChannels,

    #[error("The acquisition is running")]
    Running,

    #[error("Cannot spawn the acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("The acquisition cycle state is unavailable after a worker panic")]
    CycleUnavailable,
}

/// The result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
