//! A library for polling grating sensors over Modbus RTU and monitoring their process capability.
//!
//! The crate is organised as a pipeline:
//!
//! 1.  **Transport and Codec**: [`protocol`] builds and validates Modbus RTU
//!     frames, [`serial`] owns the physical RS485 link, and [`client`]
//!     combines both into a "read holding registers" call.
//!
//! 2.  **Channel Store**: [`channel`] keeps a bounded history of
//!     [`measurement::Measurement`]s per channel, decoded from registers by a
//!     [`decoder::RegisterDecoder`] or produced by the [`simulator`] when no
//!     link is available.
//!
//! 3.  **Acquisition**: [`acquisition::Acquisition`] polls every channel on a
//!     background thread at a fixed interval and reports measurements and
//!     alarms to an [`acquisition::AcquisitionObserver`].
//!
//! 4.  **Quality Engine**: [`quality`] computes mean, standard deviation, Cp
//!     and Cpk against per-parameter specification limits and renders reports.
//!
//! Settings are read once through [`settings::SettingsProvider`] into an
//! immutable [`settings::SettingsSnapshot`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use grating_qc_lib::{
//!     acquisition::{Acquisition, LoggingObserver},
//!     channel::Channel,
//!     measurement::Parameter,
//!     quality::QualityEngine,
//!     settings::{KeyValueSettings, SettingsSnapshot},
//! };
//! use std::sync::{Arc, Mutex};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = KeyValueSettings::new().with("COM", "Device", "/dev/ttyUSB0");
//!     let snapshot = SettingsSnapshot::capture(&settings);
//!     let engine = Arc::new(Mutex::new(QualityEngine::new(snapshot.limits.clone())));
//!
//!     let mut acquisition = Acquisition::initialize(snapshot)?;
//!     acquisition.set_observer(LoggingObserver)?;
//!     acquisition.set_quality_engine(Arc::clone(&engine))?;
//!     acquisition.start()?;
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     acquisition.stop();
//!
//!     let channel = Channel::try_from(1)?;
//!     if let Some(reader) = acquisition.channel(channel) {
//!         println!("P1 history: {:?}", reader.values(Parameter::P1, 25));
//!     }
//!     println!("{}", engine.lock().unwrap().generate_report(channel));
//!     Ok(())
//! }
//! ```

pub mod acquisition;
pub mod channel;
pub mod client;
pub mod decoder;
pub mod error;
pub mod measurement;
pub mod protocol;
pub mod quality;
pub mod serial;
pub mod settings;
pub mod simulator;
